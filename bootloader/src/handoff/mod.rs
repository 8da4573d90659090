//! Stage hand-off
//!
//! The record list passed to the next stage ([`records`]), the stack it runs
//! on ([`stack`]) and the one-way transfer ([`transfer`]), tied together by
//! [`HandoffManager`].

pub mod manager;
pub mod records;
pub mod stack;
pub mod transfer;

pub use manager::HandoffManager;
pub use records::{
    BootMode, HandoffInfo, HandoffRecordList, RecordHandle, RecordKind, RecordView,
    ResourceAttributes, ResourceType,
};
pub use stack::BootStack;
pub use transfer::{ExecutionHandoff, halt};
