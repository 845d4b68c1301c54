//! vmferry: streaming export/import operator tool for VictoriaMetrics.
//!
//! The library surface is the job engine plus the streaming pipelines it
//! drives. The HTTP wizard shell and the browser UI live outside this
//! crate; the bundled CLI binary is a thin stand-in that only assembles
//! configs and polls job snapshots.

pub mod ferry_core;
pub(crate) mod sync_ext;

pub use ferry_core::*;
