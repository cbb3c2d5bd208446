// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The process-introspection interface.

use std::collections::BTreeMap;
use std::io;

use crate::snapshot::{CapturedSnapshot, ProcessId, SnapshotSanitizer, UserId, VmAddress};

/// A connected socket to a ptrace broker.
pub type BrokerSocket = i32;

/// Information a crashing client sends along with its dump request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientInformation {
    /// Address of the client's exception information structure.
    pub exception_information_address: VmAddress,
    /// Address of the client's sanitization information structure, 0 for none.
    pub sanitization_information_address: VmAddress,
    /// Reports from crashes before this time (seconds since the epoch) are crash loops.
    pub crash_loop_before_time: u64,
}

/// Everything known about one fault before a snapshot exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultContext {
    pub client_process_id: ProcessId,
    pub client_uid: UserId,
    pub info: ClientInformation,
    /// An address on the stack of the thread that requested the dump, or 0.
    pub requesting_thread_stack_address: VmAddress,
}

/// An established privileged connection to a crashed process.
pub trait PtraceConnection: Send {
    fn process_id(&self) -> ProcessId;
}

/// Errors encountered while attaching to a crashed process.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("ptrace attach to process {0} failed")]
    AttachFailed(ProcessId, #[source] io::Error),
    #[error("broker refused to attach to process {0}")]
    BrokerRefused(ProcessId),
    #[error("broker communication failed")]
    BrokerIo(#[source] io::Error),
}

/// Errors encountered while building a snapshot from a connection.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("failed to initialize the process snapshot")]
    SnapshotFailed,
    #[error("failed to read the client's exception information")]
    ExceptionInitializationFailed,
    #[error("failed to initialize the sanitized snapshot")]
    SanitizationInitializationFailed,
    #[error("sanitization policy requested that no dump be written")]
    SkippedDueToSanitization,
}

/// The result of a successful capture.
pub struct CapturedProcess {
    pub snapshot: Box<dyn CapturedSnapshot>,
    /// Present when the client requested sanitization.
    pub sanitizer: Option<Box<dyn SnapshotSanitizer>>,
    /// The thread id that requested the dump, if it could be resolved from
    /// [`FaultContext::requesting_thread_stack_address`].
    pub requesting_thread_id: Option<ProcessId>,
}

/// The process-introspection subsystem.
pub trait Introspector: Send + Sync {
    /// Attach to `client_process_id` directly, with the handler's own privileges.
    fn connect(&self, client_process_id: ProcessId)
        -> Result<Box<dyn PtraceConnection>, ConnectionError>;

    /// Ask the broker listening on `broker` to attach to `client_process_id`.
    fn connect_with_broker(
        &self,
        broker: BrokerSocket,
        client_process_id: ProcessId,
    ) -> Result<Box<dyn PtraceConnection>, ConnectionError>;

    /// Capture a snapshot of the connected process.
    ///
    /// `process_annotations` is overlaid on the annotations read from the process.
    fn capture(
        &self,
        connection: &mut dyn PtraceConnection,
        fault: &FaultContext,
        process_annotations: &BTreeMap<String, String>,
    ) -> Result<CapturedProcess, CaptureError>;
}
