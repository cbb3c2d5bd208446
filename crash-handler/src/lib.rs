//! This crate turns exception notifications for a monitored process into crash reports.
//!
//! The central type is [`CrashReportExceptionHandler`]. Given a crashed process id it
//!
//! 1. attaches to the process, directly or through a ptrace broker, and captures a snapshot of it;
//! 2. fires the embedder's [hooks][HookRegistry];
//! 3. stamps the snapshot with the installation's client id;
//! 4. writes a minidump into the report database (along with any attachments), or emits it
//!    through the log as compressed base94 text;
//! 5. queues the finished report for upload.
//!
//! On Linux, [`CrashReportExceptionHandler::handle_exception_with_additional_tracer`] can
//! further run a secondary tracer tool on the crashed process and upload its output.
//!
//! The subsystems the handler drives (introspection, the report database, the minidump
//! serializer and the upload scheduler) are described by the traits in
//! [crash-handler-common][crash_handler_common], which this crate re-exports.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use crash_handler::{CrashReportExceptionHandler, HandlerOptions};
//!
//! let handler = CrashReportExceptionHandler::new(database, introspector, serializer, HandlerOptions::database())
//!     .with_upload_thread(uploader);
//! match handler.handle_exception(pid, uid, &info, stack_address) {
//!     Ok(handled) => println!("wrote report {:?}", handled.report_id),
//!     Err(e) => eprintln!("exception handling failed: {} ({})", e, e.name()),
//! }
//! ```

pub use crash_handler_common;
pub use crash_handler_common::*;

pub use crate::file::*;
pub use crate::handler::*;
pub use crate::hooks::*;
pub use crate::options::*;
pub use crate::stream::{decode_minidump_log, write_minidump_log_from_reader, MinidumpLogWriter};
#[cfg(target_os = "linux")]
pub use crate::tracer::*;
pub use crate::upload_parameters::*;

mod file;
mod handler;
mod hooks;
mod options;
pub mod stream;
#[cfg(target_os = "linux")]
mod tracer;
mod upload_parameters;
