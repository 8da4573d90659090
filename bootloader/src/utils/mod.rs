//! Utility library - byte cursors, alignment helpers and the log backend

pub mod cursor;
pub mod logging;
pub mod mem_util;
