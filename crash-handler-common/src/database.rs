// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The report store interface.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::writer::ReportWriter;

/// Status codes for report store operations.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum OperationStatus {
    #[error("report not found")]
    ReportNotFound,
    #[error("file system error")]
    FileSystemError,
    #[error("database error")]
    DatabaseError,
    #[error("report is busy")]
    BusyError,
    #[error("upload was skipped")]
    SkippedUpload,
    #[error("upload cannot be requested")]
    CannotRequestUpload,
}

/// A finalized report as stored in the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub uuid: Uuid,
    /// The path to the serialized minidump.
    pub file_path: PathBuf,
    /// The identifier assigned by the collection server once uploaded, empty until then.
    pub id: String,
    pub creation_time: OffsetDateTime,
    pub uploaded: bool,
    pub upload_attempts: u32,
}

/// A one-line human-readable description of the report.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let created = self.creation_time.format(&Rfc3339).unwrap_or_default();
        write!(
            f,
            "{} {} created={} uploaded={} attempts={}",
            self.uuid,
            self.file_path.display(),
            created,
            self.uploaded,
            self.upload_attempts,
        )
    }
}

/// Persistent settings of a report store.
pub trait Settings {
    /// The stable identifier of this client installation.
    fn client_id(&self) -> Option<Uuid>;
}

/// A report record in the "new" state, being written by the handler.
pub trait NewReport: Send {
    fn report_id(&self) -> Uuid;
    /// The writer for the minidump payload.
    fn writer(&mut self) -> &mut dyn ReportWriter;
    /// A reader over the payload written so far, starting at its beginning.
    fn reader(&mut self) -> io::Result<Box<dyn Read + '_>>;
    /// Create a named attachment slot and return its writer.
    fn add_attachment(&mut self, name: &str) -> io::Result<&mut dyn Write>;
}

/// The persistent report store.
///
/// A store may be shared by many handler instances; implementations handle their own
/// synchronization.
pub trait CrashReportDatabase: Send + Sync {
    type NewReport: NewReport;

    fn settings(&self) -> Option<&dyn Settings>;

    /// Allocate a new report record.
    fn prepare_new_crash_report(&self) -> Result<Self::NewReport, OperationStatus>;

    /// Make a new report durable, taking ownership of it.
    fn finished_writing_crash_report(
        &self,
        report: Self::NewReport,
    ) -> Result<Uuid, OperationStatus>;

    fn look_up_crash_report(&self, uuid: &Uuid) -> Result<Report, OperationStatus>;
}
