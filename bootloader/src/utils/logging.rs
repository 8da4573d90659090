//! `log` backend for pre-OS environments
//!
//! Platforms register a [`DebugSink`] (serial port, debug console, memory
//! ring) once; every `log::*!` call in the loader is then formatted into
//! that sink as `[LEVEL] target: message`.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::error::{LoaderError, Result};

/// Byte sink receiving formatted log lines
pub trait DebugSink: Sync {
    fn write_str(&self, text: &str);
}

/// Logger that forwards to the registered sink
pub struct BootLogger {
    sink: Once<&'static dyn DebugSink>,
}

static LOGGER: BootLogger = BootLogger { sink: Once::new() };

struct SinkWriter<'s>(&'s dyn DebugSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && self.sink.is_completed()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            let mut writer = SinkWriter(*sink);
            let _ = writeln!(
                writer,
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install `sink` as the destination of all loader log output
///
/// Only the first call takes effect; later calls return `InvalidParameter`.
pub fn init(sink: &'static dyn DebugSink, level: LevelFilter) -> Result<()> {
    if LOGGER.sink.is_completed() {
        return Err(LoaderError::InvalidParameter);
    }
    LOGGER.sink.call_once(|| sink);
    log::set_logger(&LOGGER).map_err(|_| LoaderError::InvalidParameter)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use spin::Mutex;

    struct CaptureSink {
        lines: Mutex<String>,
    }

    impl DebugSink for CaptureSink {
        fn write_str(&self, text: &str) {
            self.lines.lock().push_str(text);
        }
    }

    static CAPTURE: CaptureSink = CaptureSink {
        lines: Mutex::new(String::new()),
    };

    #[test]
    fn test_logger_formats_into_sink() {
        init(&CAPTURE, LevelFilter::Debug).unwrap();
        log::info!(target: "stage", "image loaded at {:#x}", 0x10000);
        log::trace!(target: "stage", "suppressed");

        let captured = CAPTURE.lines.lock();
        assert!(captured.contains("[INFO ] stage: image loaded at 0x10000"));
        assert!(!captured.contains("suppressed"));
        drop(captured);

        assert_eq!(
            init(&CAPTURE, LevelFilter::Trace),
            Err(LoaderError::InvalidParameter)
        );
    }
}
