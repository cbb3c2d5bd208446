//! This crate defines the interfaces that the [crash-handler][crash_handler] crate uses to talk to
//! the subsystems around it, as well as the annotation types those subsystems exchange.
//!
//! The exception handler itself never introspects a process, serializes a minidump, or manages
//! the on-disk report database. Those jobs belong to collaborators that implement the traits
//! defined here:
//!
//! * [`Introspector`][capture::Introspector] - attaches to a crashed process and captures a
//!   [`ProcessSnapshot`][snapshot::ProcessSnapshot].
//! * [`CrashReportDatabase`][database::CrashReportDatabase] - allocates, finalizes and looks up
//!   report records.
//! * [`MinidumpSerializer`][writer::MinidumpSerializer] - turns a snapshot into minidump bytes.
//! * [`UploadScheduler`][upload::UploadScheduler] - transmits finalized reports in the background.
//! * [`Metrics`][metrics::Metrics] - records capture outcomes.
//! * [`ProcessLauncher`][process::ProcessLauncher] - runs a secondary tracer (Linux only).
//!
//! [crash_handler]: ../crash_handler/index.html

pub mod annotations;
pub mod capture;
pub mod database;
pub mod metrics;
#[cfg(target_os = "linux")]
pub mod process;
pub mod snapshot;
pub mod upload;
pub mod writer;

pub use annotations::*;
pub use capture::*;
pub use database::*;
pub use metrics::*;
#[cfg(target_os = "linux")]
pub use process::*;
pub use snapshot::*;
pub use upload::*;
pub use writer::*;
