//! Terminal transfer to the next stage
//!
//! The entry point runs on the prepared stack with the record list address
//! as its only argument:
//!
//! - x86_64: MS x64 convention, argument in RCX, 32 bytes of shadow space
//! - AArch64: argument in X0
//! - RISC-V: argument in a0
//!
//! The next stage never returns. If it does, the return is logged and the
//! CPU is parked; there is nothing left to unwind to.

use super::stack::{BootStack, STACK_ALIGNMENT};
use crate::error::{LoaderError, Result};

/// Everything the terminal transfer needs, consumed exactly once
#[derive(Debug, PartialEq, Eq)]
pub struct ExecutionHandoff {
    entry_point: u64,
    stack: BootStack,
    record_list: u64,
}

impl ExecutionHandoff {
    pub fn new(entry_point: u64, stack: BootStack, record_list: u64) -> Result<Self> {
        if entry_point == 0 || !stack.is_valid() {
            return Err(LoaderError::InvalidParameter);
        }
        if record_list == 0 || record_list % 8 != 0 {
            return Err(LoaderError::InvalidParameter);
        }
        Ok(Self {
            entry_point,
            stack,
            record_list,
        })
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn stack(&self) -> &BootStack {
        &self.stack
    }

    /// Address passed to the entry point
    pub fn record_list(&self) -> u64 {
        self.record_list
    }

    /// Initial stack pointer after alignment
    pub fn stack_pointer(&self) -> u64 {
        self.stack.pointer() & !(STACK_ALIGNMENT - 1)
    }

    /// Switch to the prepared stack and call the entry point
    ///
    /// # Safety
    /// `entry_point` must be the entry of a loaded, relocated image for the
    /// running architecture, and the stack and record list must stay mapped
    /// for as long as that image runs.
    pub unsafe fn transfer(self) -> ! {
        log::info!(
            "handing off to {:#x}, stack {:#x}, records at {:#x}",
            self.entry_point,
            self.stack_pointer(),
            self.record_list
        );

        // SAFETY: the caller vouches for the entry point and both regions.
        unsafe { self.switch_and_call() };

        log::error!("stage at {:#x} returned to the loader", self.entry_point);
        halt()
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn switch_and_call(&self) {
        unsafe {
            core::arch::asm!(
                "mov r12, rsp",
                "mov rsp, {stack}",
                "and rsp, -16",
                "sub rsp, 32",
                "call {entry}",
                "mov rsp, r12",
                stack = in(reg) self.stack.pointer(),
                entry = in(reg) self.entry_point,
                in("rcx") self.record_list,
                out("r12") _,
                clobber_abi("efiapi"),
            );
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn switch_and_call(&self) {
        unsafe {
            core::arch::asm!(
                "mov x20, sp",
                "and {stack}, {stack}, #0xfffffffffffffff0",
                "mov sp, {stack}",
                "blr {entry}",
                "mov sp, x20",
                stack = inout(reg) self.stack.pointer() => _,
                entry = in(reg) self.entry_point,
                in("x0") self.record_list,
                out("x20") _,
                clobber_abi("C"),
            );
        }
    }

    #[cfg(target_arch = "riscv64")]
    unsafe fn switch_and_call(&self) {
        unsafe {
            core::arch::asm!(
                "mv s2, sp",
                "andi {stack}, {stack}, -16",
                "mv sp, {stack}",
                "jalr {entry}",
                "mv sp, s2",
                stack = inout(reg) self.stack.pointer() => _,
                entry = in(reg) self.entry_point,
                in("a0") self.record_list,
                out("s2") _,
                clobber_abi("C"),
            );
        }
    }

    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64"
    )))]
    unsafe fn switch_and_call(&self) {
        log::error!("no stage transfer for this architecture");
    }
}

/// Park the CPU for good
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::hlt();

        #[cfg(target_arch = "aarch64")]
        aarch64_cpu::asm::wfe();

        #[cfg(target_arch = "riscv64")]
        riscv::asm::wfi();

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64"
        )))]
        core::hint::spin_loop();
    }
}
