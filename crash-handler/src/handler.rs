// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::BTreeMap;
use std::io::{self, Write};
#[cfg(target_os = "linux")]
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crash_handler_common::*;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::file::read_last_part_of_file;
use crate::hooks::{DumpEvent, HookRegistry};
use crate::options::{HandlerOptions, ReportDestination};
use crate::stream::{
    write_minidump_log_from_reader, LogDelegate, MinidumpLogWriter, TracingLogDelegate,
};
#[cfg(target_os = "linux")]
use crate::tracer::{
    make_additional_tracer_parameters, tracer_output_path, ForkExecLauncher, TracerError,
};
use crate::upload_parameters::{upload_attachment_file_size_limit, upload_minidump};

/// An error encountered while handling an exception.
///
/// Every variant corresponds to one [`CaptureResult`] reported through [`Metrics`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to attach to the crashed process")]
    DirectPtraceFailed(#[source] ConnectionError),
    #[error("failed to attach to the crashed process through the broker")]
    BrokeredPtraceFailed(#[source] ConnectionError),
    #[error("failed to capture the crashed process")]
    CaptureFailed(#[source] CaptureError),
    #[error("failed to prepare a new crash report: {0}")]
    PrepareNewCrashReportFailed(#[source] OperationStatus),
    #[error("failed to write the minidump")]
    MinidumpWriteFailed(#[source] io::Error),
    #[error("failed to finish writing the crash report: {0}")]
    FinishedWritingCrashReportFailed(#[source] OperationStatus),
    #[error("report {report_id} was written but could not be mirrored to the log")]
    LogMirrorFailed {
        report_id: Uuid,
        #[source]
        source: io::Error,
    },
    #[error("failed to write the minidump to the log")]
    LogWriteFailed(#[source] io::Error),
    #[error("report {report_id} could not be found after it was written: {source}")]
    ReportNotFound {
        report_id: Uuid,
        #[source]
        source: OperationStatus,
    },
    #[cfg(target_os = "linux")]
    #[error("additional tracer failed for report {report_id}")]
    AdditionalTracerFailed {
        report_id: Uuid,
        #[source]
        source: TracerError,
    },
}

impl HandlerError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            HandlerError::DirectPtraceFailed(_) => "DirectPtraceFailed",
            HandlerError::BrokeredPtraceFailed(_) => "BrokeredPtraceFailed",
            HandlerError::CaptureFailed(_) => "CaptureFailed",
            HandlerError::PrepareNewCrashReportFailed(_) => "PrepareNewCrashReportFailed",
            HandlerError::MinidumpWriteFailed(_) => "MinidumpWriteFailed",
            HandlerError::FinishedWritingCrashReportFailed(_) => "FinishedWritingCrashReportFailed",
            HandlerError::LogMirrorFailed { .. } => "LogMirrorFailed",
            HandlerError::LogWriteFailed(_) => "LogWriteFailed",
            HandlerError::ReportNotFound { .. } => "ReportNotFound",
            #[cfg(target_os = "linux")]
            HandlerError::AdditionalTracerFailed { .. } => "AdditionalTracerFailed",
        }
    }

    /// The durable report, if the error happened after the report was finalized.
    pub fn report_id(&self) -> Option<Uuid> {
        match *self {
            HandlerError::LogMirrorFailed { report_id, .. }
            | HandlerError::ReportNotFound { report_id, .. } => Some(report_id),
            #[cfg(target_os = "linux")]
            HandlerError::AdditionalTracerFailed { report_id, .. } => Some(report_id),
            _ => None,
        }
    }
}

fn capture_result_for(error: &CaptureError) -> CaptureResult {
    match error {
        CaptureError::SnapshotFailed => CaptureResult::SnapshotFailed,
        CaptureError::ExceptionInitializationFailed => CaptureResult::ExceptionInitializationFailed,
        CaptureError::SanitizationInitializationFailed => {
            CaptureResult::SanitizationInitializationFailed
        }
        CaptureError::SkippedDueToSanitization => CaptureResult::SkippedDueToSanitization,
    }
}

/// A file attached to every report the handler writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    /// The name of the attachment slot in the report.
    pub name: String,
    pub path: PathBuf,
}

impl Attachment {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Attachment {
        Attachment {
            name: name.to_owned(),
            path: path.into(),
        }
    }

    /// An attachment named after the file name of `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Attachment {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Attachment { name, path }
    }
}

/// The outcome of a successfully handled exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandledException {
    /// The durable report, `None` when reports only go to the log.
    pub report_id: Option<Uuid>,
    /// The thread that requested the dump, if the introspector could resolve it.
    pub requesting_thread_id: Option<ProcessId>,
}

/// Turns exception notifications into crash reports.
///
/// Each `handle_*` call captures the crashed process, persists a report to the configured
/// [`ReportDestination`] and, for database reports, hands the report to the upload scheduler.
/// A handler holds no per-run state, so a single handler can serve several crashed processes
/// from different threads.
pub struct CrashReportExceptionHandler<D: CrashReportDatabase> {
    database: Arc<D>,
    introspector: Arc<dyn Introspector>,
    serializer: Arc<dyn MinidumpSerializer>,
    options: HandlerOptions,
    upload_thread: Option<Arc<dyn UploadScheduler>>,
    process_annotations: BTreeMap<String, String>,
    process_attachments: Vec<Attachment>,
    user_stream_data_sources: Vec<Arc<dyn UserStreamDataSource>>,
    hooks: Arc<HookRegistry>,
    metrics: Arc<dyn Metrics>,
    log_delegate: Arc<dyn LogDelegate>,
    handler_annotations: Arc<SimpleStringDictionary>,
    #[cfg(target_os = "linux")]
    launcher: Arc<dyn ProcessLauncher>,
}

fn select_snapshot<'a>(
    snapshot: &'a dyn ProcessSnapshot,
    sanitizer: Option<&'a dyn SnapshotSanitizer>,
) -> ProcessedSnapshot<'a> {
    let processed = ProcessedSnapshot::select(snapshot, sanitizer);
    if processed.is_sanitized() {
        debug!("writing the sanitized view of process {}", snapshot.process_id());
    }
    processed
}

impl<D: CrashReportDatabase> CrashReportExceptionHandler<D> {
    /// Create a handler writing reports into `database`.
    ///
    /// With [`ReportDestination::Log`] only the database settings are read, to find the
    /// client id.
    pub fn new(
        database: Arc<D>,
        introspector: Arc<dyn Introspector>,
        serializer: Arc<dyn MinidumpSerializer>,
        options: HandlerOptions,
    ) -> CrashReportExceptionHandler<D> {
        CrashReportExceptionHandler {
            database,
            introspector,
            serializer,
            options,
            upload_thread: None,
            process_annotations: BTreeMap::new(),
            process_attachments: Vec::new(),
            user_stream_data_sources: Vec::new(),
            hooks: Arc::new(HookRegistry::new()),
            metrics: Arc::new(LogMetrics),
            log_delegate: Arc::new(TracingLogDelegate),
            handler_annotations: Arc::new(SimpleStringDictionary::new()),
            #[cfg(target_os = "linux")]
            launcher: Arc::new(ForkExecLauncher),
        }
    }

    /// Queue finished database reports for upload.
    pub fn with_upload_thread(mut self, upload_thread: Arc<dyn UploadScheduler>) -> Self {
        self.upload_thread = Some(upload_thread);
        self
    }

    /// Annotations overlaid on those read from every crashed process.
    pub fn with_process_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.process_annotations = annotations;
        self
    }

    /// Files attached to every database report, read anew for each report.
    pub fn with_process_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.process_attachments = attachments;
        self
    }

    pub fn with_user_stream_data_sources(
        mut self,
        sources: Vec<Arc<dyn UserStreamDataSource>>,
    ) -> Self {
        self.user_stream_data_sources = sources;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Where reports written to the log go. Defaults to [`TracingLogDelegate`].
    pub fn with_log_delegate(mut self, log_delegate: Arc<dyn LogDelegate>) -> Self {
        self.log_delegate = log_delegate;
        self
    }

    /// The handler's own annotations, which configure uploads and the additional tracer.
    pub fn with_handler_annotations(mut self, annotations: Arc<SimpleStringDictionary>) -> Self {
        self.handler_annotations = annotations;
        self
    }

    /// How the additional tracer is run. Defaults to [`ForkExecLauncher`].
    #[cfg(target_os = "linux")]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Handle an exception in `client_process_id`, attaching to it directly.
    ///
    /// `requesting_thread_stack_address` is an address on the stack of the thread that
    /// requested the dump, or 0. It is used to find that thread's id.
    pub fn handle_exception(
        &self,
        client_process_id: ProcessId,
        client_uid: UserId,
        info: &ClientInformation,
        requesting_thread_stack_address: VmAddress,
    ) -> Result<HandledException, HandlerError> {
        self.metrics.exception_encountered();

        let mut connection = match self.introspector.connect(client_process_id) {
            Ok(connection) => connection,
            Err(e) => {
                error!("failed to attach to process {}: {}", client_process_id, e);
                self.metrics
                    .exception_capture_result(CaptureResult::DirectPtraceFailed);
                return Err(HandlerError::DirectPtraceFailed(e));
            }
        };

        self.handle_exception_with_connection(
            connection.as_mut(),
            &FaultContext {
                client_process_id,
                client_uid,
                info: *info,
                requesting_thread_stack_address,
            },
        )
    }

    /// Handle an exception in `client_process_id`, attaching to it through the ptrace broker
    /// listening on `broker`.
    pub fn handle_exception_with_broker(
        &self,
        client_process_id: ProcessId,
        client_uid: UserId,
        info: &ClientInformation,
        broker: BrokerSocket,
    ) -> Result<HandledException, HandlerError> {
        self.metrics.exception_encountered();

        let mut connection = match self.introspector.connect_with_broker(broker, client_process_id) {
            Ok(connection) => connection,
            Err(e) => {
                error!(
                    "broker failed to attach to process {}: {}",
                    client_process_id, e
                );
                self.metrics
                    .exception_capture_result(CaptureResult::BrokeredPtraceFailed);
                return Err(HandlerError::BrokeredPtraceFailed(e));
            }
        };

        self.handle_exception_with_connection(
            connection.as_mut(),
            &FaultContext {
                client_process_id,
                client_uid,
                info: *info,
                requesting_thread_stack_address: 0,
            },
        )
    }

    fn handle_exception_with_connection(
        &self,
        connection: &mut dyn PtraceConnection,
        fault: &FaultContext,
    ) -> Result<HandledException, HandlerError> {
        let CapturedProcess {
            mut snapshot,
            sanitizer,
            requesting_thread_id,
        } = match self
            .introspector
            .capture(connection, fault, &self.process_annotations)
        {
            Ok(captured) => captured,
            Err(e) => {
                error!(
                    "failed to capture process {}: {}",
                    fault.client_process_id, e
                );
                self.metrics.exception_capture_result(capture_result_for(&e));
                return Err(HandlerError::CaptureFailed(e));
            }
        };

        self.hooks.run_on_dump_event(&DumpEvent {
            client_process_id: fault.client_process_id,
            report_id: None,
            succeeded: None,
        });

        // A missing client id is not an error, the all-zero id is reported instead.
        let client_id = self
            .database
            .settings()
            .and_then(|settings| settings.client_id())
            .unwrap_or_else(Uuid::nil);
        snapshot.set_client_id(client_id);

        let result = match self.options.destination {
            ReportDestination::Database { mirror_to_log } => self
                .write_minidump_to_database(snapshot.as_mut(), sanitizer.as_deref(), mirror_to_log)
                .map(Some),
            ReportDestination::Log => self
                .write_minidump_to_log(snapshot.as_process_snapshot(), sanitizer.as_deref())
                .map(|()| None),
        };

        self.hooks.run_after_dump(&DumpEvent {
            client_process_id: fault.client_process_id,
            report_id: match &result {
                Ok(report_id) => *report_id,
                Err(e) => e.report_id(),
            },
            succeeded: Some(result.is_ok()),
        });

        result.map(|report_id| HandledException {
            report_id,
            requesting_thread_id,
        })
    }

    fn extension_streams(&self, snapshot: &dyn ProcessSnapshot) -> Vec<ExtensionStream> {
        self.user_stream_data_sources
            .iter()
            .filter_map(|source| source.produce_stream_data(snapshot))
            .inspect(|stream| {
                trace!(
                    "adding extension stream {:#x} ({} bytes)",
                    stream.stream_type,
                    stream.data.len()
                )
            })
            .collect()
    }

    fn write_minidump_to_database(
        &self,
        snapshot: &mut dyn CapturedSnapshot,
        sanitizer: Option<&dyn SnapshotSanitizer>,
        mirror_to_log: bool,
    ) -> Result<Uuid, HandlerError> {
        let mut new_report = match self.database.prepare_new_crash_report() {
            Ok(new_report) => new_report,
            Err(status) => {
                error!("PrepareNewCrashReport failed: {}", status);
                self.metrics
                    .exception_capture_result(CaptureResult::PrepareNewCrashReportFailed);
                return Err(HandlerError::PrepareNewCrashReportFailed(status));
            }
        };

        snapshot.set_report_id(new_report.report_id());

        let processed = select_snapshot(snapshot.as_process_snapshot(), sanitizer);
        let extension_streams = self.extension_streams(processed.get());
        if let Err(e) = self.serializer.write_everything(
            processed.get(),
            &extension_streams,
            new_report.writer(),
        ) {
            // The prepared report is left behind for the database to clean up.
            error!("WriteEverything failed: {}", e);
            self.metrics
                .exception_capture_result(CaptureResult::MinidumpWriteFailed);
            return Err(HandlerError::MinidumpWriteFailed(e));
        }

        self.write_attachments(&mut new_report);

        let log_mirror = if mirror_to_log {
            let result = self.write_minidump_log_from_report(&mut new_report);
            if let Err(e) = &result {
                error!("failed to mirror the minidump to the log: {}", e);
            }
            Some(result)
        } else {
            None
        };

        let report_id = match self.database.finished_writing_crash_report(new_report) {
            Ok(report_id) => report_id,
            Err(status) => {
                error!("FinishedWritingCrashReport failed: {}", status);
                self.metrics
                    .exception_capture_result(CaptureResult::FinishedWritingCrashReportFailed);
                return Err(HandlerError::FinishedWritingCrashReportFailed(status));
            }
        };

        if let Some(upload_thread) = &self.upload_thread {
            if upload_minidump(&self.handler_annotations) {
                upload_thread.report_pending(report_id);
            }
        }

        info!("wrote crash report {}", report_id);
        self.metrics.exception_capture_result(CaptureResult::Success);

        match log_mirror {
            Some(Err(source)) => Err(HandlerError::LogMirrorFailed { report_id, source }),
            _ => Ok(report_id),
        }
    }

    /// Copy the newest part of each attachment into the report.
    ///
    /// Attachments are read for every report so that changing files, such as logs, are
    /// captured as they are at the time of the crash. Files that can't be read are skipped.
    fn write_attachments(&self, report: &mut D::NewReport) {
        if self.process_attachments.is_empty() {
            return;
        }
        let max_bytes = upload_attachment_file_size_limit(
            &self.handler_annotations,
            self.options.attachment_kilobyte_limit,
        );

        for attachment in &self.process_attachments {
            let Ok(contents) = read_last_part_of_file(&attachment.path, max_bytes) else {
                continue;
            };
            let written = report
                .add_attachment(&attachment.name)
                .and_then(|writer| writer.write_all(&contents));
            if let Err(e) = written {
                warn!("failed to write attachment {}: {}", attachment.name, e);
            }
        }
    }

    fn write_minidump_log_from_report(&self, report: &mut D::NewReport) -> io::Result<()> {
        let mut reader = report.reader()?;
        write_minidump_log_from_reader(reader.as_mut(), self.log_delegate.clone())
    }

    fn write_minidump_to_log(
        &self,
        snapshot: &dyn ProcessSnapshot,
        sanitizer: Option<&dyn SnapshotSanitizer>,
    ) -> Result<(), HandlerError> {
        let processed = select_snapshot(snapshot, sanitizer);
        let extension_streams = self.extension_streams(processed.get());

        let mut writer = MinidumpLogWriter::new(self.log_delegate.clone());
        let result = self
            .serializer
            .write_minidump(processed.get(), &extension_streams, &mut writer)
            .and_then(|()| writer.finish());

        match result {
            Ok(()) => {
                self.metrics.exception_capture_result(CaptureResult::Success);
                Ok(())
            }
            Err(e) => {
                error!("WriteMinidump failed: {}", e);
                self.metrics
                    .exception_capture_result(CaptureResult::LogEmissionFailed);
                Err(HandlerError::LogWriteFailed(e))
            }
        }
    }

    /// Handle an exception like [`handle_exception`][Self::handle_exception], then run an
    /// additional tracer on the crashed process and upload its output.
    ///
    /// The tracer is skipped when reports are uploaded as minidumps, since the report
    /// written by the handler is uploaded instead. Otherwise it runs as
    /// `tracer [tracer_args..] [directives..] --output=<report>.btt <pid>`, where the
    /// directives come from the handler annotations. Once it exits normally, the report is
    /// queued for upload and the upload is waited for.
    #[cfg(target_os = "linux")]
    pub fn handle_exception_with_additional_tracer(
        &self,
        tracer: &Path,
        tracer_args: Vec<String>,
        client_process_id: ProcessId,
        client_uid: UserId,
        info: &ClientInformation,
    ) -> Result<HandledException, HandlerError> {
        let handled = self.handle_exception(client_process_id, client_uid, info, 0)?;
        let Some(report_id) = handled.report_id else {
            info!("no database report was written, skipping additional tracer");
            return Ok(handled);
        };
        info!("generated report {}", report_id);

        if upload_minidump(&self.handler_annotations) {
            info!("skipping additional tracer, reports are uploaded as minidumps");
            return Ok(handled);
        }

        let report = self
            .database
            .look_up_crash_report(&report_id)
            .map_err(|source| {
                error!("failed to find report {}: {}", report_id, source);
                self.metrics
                    .exception_capture_result(CaptureResult::AdditionalTracerFailed);
                HandlerError::ReportNotFound { report_id, source }
            })?;
        debug!("found report {}", report);

        self.run_additional_tracer(
            report_id,
            &report.file_path,
            tracer,
            tracer_args,
            client_process_id,
        )
        .map_err(|source| {
            error!("additional tracer failed for report {}: {}", report_id, source);
            let result = match source {
                TracerError::UploadTimedOut(_) => CaptureResult::UploadWaitTimedOut,
                _ => CaptureResult::AdditionalTracerFailed,
            };
            self.metrics.exception_capture_result(result);
            HandlerError::AdditionalTracerFailed { report_id, source }
        })?;

        Ok(handled)
    }

    #[cfg(target_os = "linux")]
    fn run_additional_tracer(
        &self,
        report_id: Uuid,
        report_path: &Path,
        tracer: &Path,
        tracer_args: Vec<String>,
        client_process_id: ProcessId,
    ) -> Result<(), TracerError> {
        let output = tracer_output_path(report_path);
        let invocation = make_additional_tracer_parameters(
            &self.handler_annotations,
            tracer,
            tracer_args,
            client_process_id,
            Some(&output),
        )?;
        info!(
            "starting additional tracer {} with arguments {:?}",
            invocation.tracer.display(),
            invocation.args
        );

        let exit = self
            .launcher
            .spawn_and_wait(&invocation.tracer, &invocation.argv())?;
        if !exit.exited_normally() {
            if let ChildExit::Stopped(signal) = exit {
                error!(
                    "{} stopped on signal {}",
                    invocation.tracer.display(),
                    signal
                );
            }
            return Err(TracerError::AbnormalExit(exit));
        }
        info!("additional tracer succeeded");

        if let Some(upload_thread) = &self.upload_thread {
            info!("uploading tracer report");
            upload_thread.report_pending(report_id);
            if !upload_thread.wait_for_pending_upload(self.options.upload_wait_timeout) {
                return Err(TracerError::UploadTimedOut(self.options.upload_wait_timeout));
            }
            info!("done uploading tracer report");
        }
        Ok(())
    }
}
