// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Read-only views of a captured process.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::annotations::AnnotationSnapshot;

/// A process or thread id.
pub type ProcessId = i32;
/// A user id.
pub type UserId = u32;
/// An address in the crashed process.
pub type VmAddress = u64;

/// A module loaded into a captured process.
pub trait ModuleSnapshot {
    /// The path or file name that the module was loaded from.
    fn name(&self) -> &str;
    /// The module's simple string annotations.
    fn annotations_simple_map(&self) -> &BTreeMap<String, String>;
    /// The module's unstructured list annotations, in the order the module exposes them.
    fn annotations_vector(&self) -> &[String];
    /// The module's typed annotation objects.
    fn annotation_objects(&self) -> &[AnnotationSnapshot];
}

/// A structural capture of a crashed process.
///
/// This is the interface the handler reads from. Both an unfiltered capture and a
/// sanitized view over one implement it.
pub trait ProcessSnapshot {
    fn process_id(&self) -> ProcessId;
    /// The process-level simple string annotations.
    fn annotations_simple_map(&self) -> &BTreeMap<String, String>;
    /// All loaded modules, in snapshot order.
    fn modules(&self) -> Vec<&dyn ModuleSnapshot>;
    /// The client identifier, all zeroes if none was set.
    fn client_id(&self) -> Uuid;
    /// The local report identifier, all zeroes if none was set.
    fn report_id(&self) -> Uuid;
}

/// An unfiltered capture owned by the handler for the duration of one run.
pub trait CapturedSnapshot: ProcessSnapshot + Send {
    fn set_client_id(&mut self, client_id: Uuid);
    fn set_report_id(&mut self, report_id: Uuid);
    fn as_process_snapshot(&self) -> &dyn ProcessSnapshot;
}

/// A redaction policy that produces a filtered view over an unfiltered capture.
///
/// The view is created after the handler has stamped the capture with its identifiers, so
/// the view always reflects them.
pub trait SnapshotSanitizer: Send {
    fn sanitize<'a>(&'a self, snapshot: &'a dyn ProcessSnapshot) -> Box<dyn ProcessSnapshot + 'a>;
}

/// The snapshot every downstream step operates on.
///
/// When a sanitizer is present its view is used, and the unfiltered capture only backs it.
pub enum ProcessedSnapshot<'a> {
    Unfiltered(&'a dyn ProcessSnapshot),
    Sanitized(Box<dyn ProcessSnapshot + 'a>),
}

impl<'a> ProcessedSnapshot<'a> {
    pub fn select(
        snapshot: &'a dyn ProcessSnapshot,
        sanitizer: Option<&'a dyn SnapshotSanitizer>,
    ) -> ProcessedSnapshot<'a> {
        match sanitizer {
            Some(sanitizer) => ProcessedSnapshot::Sanitized(sanitizer.sanitize(snapshot)),
            None => ProcessedSnapshot::Unfiltered(snapshot),
        }
    }

    pub fn get(&self) -> &dyn ProcessSnapshot {
        match self {
            ProcessedSnapshot::Unfiltered(snapshot) => *snapshot,
            ProcessedSnapshot::Sanitized(snapshot) => snapshot.as_ref(),
        }
    }

    pub fn is_sanitized(&self) -> bool {
        matches!(self, ProcessedSnapshot::Sanitized(_))
    }
}
