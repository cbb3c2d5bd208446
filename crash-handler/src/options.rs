use std::time::Duration;

/// Where a handler persists the reports it generates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportDestination {
    /// Write reports into the report database.
    Database {
        /// Also emit each report through the log, after it has been written to the database.
        mirror_to_log: bool,
    },
    /// Only emit reports through the log. The database is never touched.
    Log,
}

/// Errors encountered while building [`HandlerOptions`].
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("at least one of writing to the database or writing to the log must be enabled")]
    NoDestination,
}

/// Configuration for a crash report exception handler.
///
/// Use one of the constructors to get a set of options and then modify the fields. Options
/// that are not destinations are given sensible defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HandlerOptions {
    pub destination: ReportDestination,

    /// The per-attachment size ceiling in kilobytes, used when the
    /// `UploadAttachmentKiloByteLimit` annotation is absent or not a number.
    ///
    /// default: 0 (attachments are written empty)
    pub attachment_kilobyte_limit: i64,

    /// The longest the tracer path waits for its report to be uploaded.
    ///
    /// default: 60 seconds
    pub upload_wait_timeout: Duration,
}

impl HandlerOptions {
    fn with_destination(destination: ReportDestination) -> HandlerOptions {
        HandlerOptions {
            destination,
            attachment_kilobyte_limit: 0,
            upload_wait_timeout: Duration::from_secs(60),
        }
    }

    /// Write reports to the database only.
    pub fn database() -> HandlerOptions {
        Self::with_destination(ReportDestination::Database {
            mirror_to_log: false,
        })
    }

    /// Write reports to the database and mirror them to the log.
    pub fn mirror_to_log() -> HandlerOptions {
        Self::with_destination(ReportDestination::Database {
            mirror_to_log: true,
        })
    }

    /// Write reports to the log only.
    pub fn log_only() -> HandlerOptions {
        Self::with_destination(ReportDestination::Log)
    }

    /// Build options from independent "write to database" and "write to log" switches.
    pub fn from_flags(
        write_to_database: bool,
        write_to_log: bool,
    ) -> Result<HandlerOptions, OptionsError> {
        match (write_to_database, write_to_log) {
            (true, mirror_to_log) => Ok(Self::with_destination(ReportDestination::Database {
                mirror_to_log,
            })),
            (false, true) => Ok(Self::log_only()),
            (false, false) => Err(OptionsError::NoDestination),
        }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::database()
    }
}
