//! Capture outcome reporting.

use tracing::info;

/// The outcome of one exception handling run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureResult {
    Success,
    DirectPtraceFailed,
    BrokeredPtraceFailed,
    SnapshotFailed,
    ExceptionInitializationFailed,
    SanitizationInitializationFailed,
    SkippedDueToSanitization,
    PrepareNewCrashReportFailed,
    MinidumpWriteFailed,
    FinishedWritingCrashReportFailed,
    LogEmissionFailed,
    AdditionalTracerFailed,
    UploadWaitTimedOut,
}

impl CaptureResult {
    /// Returns just the name of the result, for use as a metric label.
    pub fn name(&self) -> &'static str {
        match self {
            CaptureResult::Success => "Success",
            CaptureResult::DirectPtraceFailed => "DirectPtraceFailed",
            CaptureResult::BrokeredPtraceFailed => "BrokeredPtraceFailed",
            CaptureResult::SnapshotFailed => "SnapshotFailed",
            CaptureResult::ExceptionInitializationFailed => "ExceptionInitializationFailed",
            CaptureResult::SanitizationInitializationFailed => "SanitizationInitializationFailed",
            CaptureResult::SkippedDueToSanitization => "SkippedDueToSanitization",
            CaptureResult::PrepareNewCrashReportFailed => "PrepareNewCrashReportFailed",
            CaptureResult::MinidumpWriteFailed => "MinidumpWriteFailed",
            CaptureResult::FinishedWritingCrashReportFailed => "FinishedWritingCrashReportFailed",
            CaptureResult::LogEmissionFailed => "LogEmissionFailed",
            CaptureResult::AdditionalTracerFailed => "AdditionalTracerFailed",
            CaptureResult::UploadWaitTimedOut => "UploadWaitTimedOut",
        }
    }
}

/// A sink for exception handling metrics.
pub trait Metrics: Send + Sync {
    /// Called once on entry to every exception handling run.
    fn exception_encountered(&self);
    /// Called once with the terminal outcome of a run.
    fn exception_capture_result(&self, result: CaptureResult);
}

/// Emits metrics as `tracing` events on the `metrics` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl Metrics for LogMetrics {
    fn exception_encountered(&self) {
        info!(target: "metrics", event = "ExceptionEncountered");
    }

    fn exception_capture_result(&self, result: CaptureResult) {
        info!(target: "metrics", event = "ExceptionCaptureResult", result = result.name());
    }
}
