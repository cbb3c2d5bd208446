// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic Collaborators for Testing
//!
//! In-memory implementations of every interface the exception handler drives, so that the
//! handler can be exercised without a crashed process, a report database on disk or an upload
//! server. Each one records what the handler asked of it and can be told to fail.
//!
//! Snapshots are built up with [`SynthSnapshot`] and [`SynthModule`], then handed to a
//! [`SynthIntrospector`], which returns a copy of them from every capture.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crash_handler_common::*;
use minidump_common::format as md;
use test_assembler::{Endian, Section};
use time::OffsetDateTime;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The value of a typed annotation object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationValue {
    String(String),
    Invalid,
    /// A value of a user-defined type.
    Custom(u16, Vec<u8>),
}

/// A synthetic loaded module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynthModule {
    name: String,
    simple_annotations: BTreeMap<String, String>,
    list_annotations: Vec<String>,
    annotation_objects: Vec<AnnotationSnapshot>,
}

impl SynthModule {
    pub fn new(name: &str) -> SynthModule {
        SynthModule {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn add_simple_annotation(mut self, key: &str, value: &str) -> SynthModule {
        self.simple_annotations.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn add_list_annotation(mut self, value: &str) -> SynthModule {
        self.list_annotations.push(value.to_owned());
        self
    }

    pub fn add_annotation_object(mut self, name: &str, value: AnnotationValue) -> SynthModule {
        let annotation = match value {
            AnnotationValue::String(value) => AnnotationSnapshot::string(name, &value),
            AnnotationValue::Invalid => {
                AnnotationSnapshot::new(name, AnnotationType::Invalid, Vec::new())
            }
            AnnotationValue::Custom(ty, value) => {
                AnnotationSnapshot::new(name, AnnotationType::from_raw(ty), value)
            }
        };
        self.annotation_objects.push(annotation);
        self
    }
}

impl ModuleSnapshot for SynthModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn annotations_simple_map(&self) -> &BTreeMap<String, String> {
        &self.simple_annotations
    }

    fn annotations_vector(&self) -> &[String] {
        &self.list_annotations
    }

    fn annotation_objects(&self) -> &[AnnotationSnapshot] {
        &self.annotation_objects
    }
}

/// A synthetic process snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynthSnapshot {
    process_id: ProcessId,
    annotations: BTreeMap<String, String>,
    modules: Vec<SynthModule>,
    client_id: Uuid,
    report_id: Uuid,
}

impl SynthSnapshot {
    pub fn new(process_id: ProcessId) -> SynthSnapshot {
        SynthSnapshot {
            process_id,
            annotations: BTreeMap::new(),
            modules: Vec::new(),
            client_id: Uuid::nil(),
            report_id: Uuid::nil(),
        }
    }

    pub fn add_module(mut self, module: SynthModule) -> SynthSnapshot {
        self.modules.push(module);
        self
    }

    pub fn add_simple_annotation(mut self, key: &str, value: &str) -> SynthSnapshot {
        self.annotations.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_client_id(mut self, client_id: Uuid) -> SynthSnapshot {
        self.client_id = client_id;
        self
    }
}

impl ProcessSnapshot for SynthSnapshot {
    fn process_id(&self) -> ProcessId {
        self.process_id
    }

    fn annotations_simple_map(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    fn modules(&self) -> Vec<&dyn ModuleSnapshot> {
        self.modules
            .iter()
            .map(|module| module as &dyn ModuleSnapshot)
            .collect()
    }

    fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn report_id(&self) -> Uuid {
        self.report_id
    }
}

impl CapturedSnapshot for SynthSnapshot {
    fn set_client_id(&mut self, client_id: Uuid) {
        self.client_id = client_id;
    }

    fn set_report_id(&mut self, report_id: Uuid) {
        self.report_id = report_id;
    }

    fn as_process_snapshot(&self) -> &dyn ProcessSnapshot {
        self
    }
}

/// A sanitizer that removes every annotation with one of the given names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedactingSanitizer {
    keys: Vec<String>,
}

impl RedactingSanitizer {
    pub fn new<I, S>(keys: I) -> RedactingSanitizer
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RedactingSanitizer {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    fn keep(&self, key: &str) -> bool {
        !self.keys.iter().any(|redacted| redacted == key)
    }

    fn filter_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .filter(|(key, _)| self.keep(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl SnapshotSanitizer for RedactingSanitizer {
    fn sanitize<'a>(&'a self, snapshot: &'a dyn ProcessSnapshot) -> Box<dyn ProcessSnapshot + 'a> {
        let modules = snapshot
            .modules()
            .into_iter()
            .map(|module| SynthModule {
                name: module.name().to_owned(),
                simple_annotations: self.filter_map(module.annotations_simple_map()),
                list_annotations: module.annotations_vector().to_vec(),
                annotation_objects: module
                    .annotation_objects()
                    .iter()
                    .filter(|annotation| self.keep(&annotation.name))
                    .cloned()
                    .collect(),
            })
            .collect();

        Box::new(SanitizedSnapshot {
            inner: snapshot,
            annotations: self.filter_map(snapshot.annotations_simple_map()),
            modules,
        })
    }
}

/// The view a [`RedactingSanitizer`] produces.
pub struct SanitizedSnapshot<'a> {
    inner: &'a dyn ProcessSnapshot,
    annotations: BTreeMap<String, String>,
    modules: Vec<SynthModule>,
}

impl ProcessSnapshot for SanitizedSnapshot<'_> {
    fn process_id(&self) -> ProcessId {
        self.inner.process_id()
    }

    fn annotations_simple_map(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    fn modules(&self) -> Vec<&dyn ModuleSnapshot> {
        self.modules
            .iter()
            .map(|module| module as &dyn ModuleSnapshot)
            .collect()
    }

    fn client_id(&self) -> Uuid {
        self.inner.client_id()
    }

    fn report_id(&self) -> Uuid {
        self.inner.report_id()
    }
}

/// A connection to a synthetic process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynthConnection {
    process_id: ProcessId,
}

impl PtraceConnection for SynthConnection {
    fn process_id(&self) -> ProcessId {
        self.process_id
    }
}

/// An introspector whose every capture returns a copy of one snapshot.
///
/// The handler's process annotations are overlaid on the snapshot's own annotations.
pub struct SynthIntrospector {
    snapshot: SynthSnapshot,
    connect_fails: bool,
    broker_refuses: bool,
    capture_error: Option<CaptureError>,
    sanitizer: Option<RedactingSanitizer>,
    requesting_thread_id: Option<ProcessId>,
    faults: Mutex<Vec<FaultContext>>,
}

impl SynthIntrospector {
    pub fn new(snapshot: SynthSnapshot) -> SynthIntrospector {
        SynthIntrospector {
            snapshot,
            connect_fails: false,
            broker_refuses: false,
            capture_error: None,
            sanitizer: None,
            requesting_thread_id: None,
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Make direct attaches fail.
    pub fn fail_connect(mut self) -> SynthIntrospector {
        self.connect_fails = true;
        self
    }

    /// Make the broker refuse every request.
    pub fn refuse_broker(mut self) -> SynthIntrospector {
        self.broker_refuses = true;
        self
    }

    pub fn fail_capture(mut self, error: CaptureError) -> SynthIntrospector {
        self.capture_error = Some(error);
        self
    }

    /// Request sanitization of every capture with `sanitizer`.
    pub fn with_sanitizer(mut self, sanitizer: RedactingSanitizer) -> SynthIntrospector {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// The thread reported as having requested the dump, when a stack address is given.
    pub fn with_requesting_thread(mut self, thread_id: ProcessId) -> SynthIntrospector {
        self.requesting_thread_id = Some(thread_id);
        self
    }

    /// Every fault captured so far.
    pub fn faults(&self) -> Vec<FaultContext> {
        lock(&self.faults).clone()
    }
}

impl Introspector for SynthIntrospector {
    fn connect(
        &self,
        client_process_id: ProcessId,
    ) -> Result<Box<dyn PtraceConnection>, ConnectionError> {
        if self.connect_fails {
            return Err(ConnectionError::AttachFailed(
                client_process_id,
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }
        Ok(Box::new(SynthConnection {
            process_id: client_process_id,
        }))
    }

    fn connect_with_broker(
        &self,
        _broker: BrokerSocket,
        client_process_id: ProcessId,
    ) -> Result<Box<dyn PtraceConnection>, ConnectionError> {
        if self.broker_refuses {
            return Err(ConnectionError::BrokerRefused(client_process_id));
        }
        Ok(Box::new(SynthConnection {
            process_id: client_process_id,
        }))
    }

    fn capture(
        &self,
        connection: &mut dyn PtraceConnection,
        fault: &FaultContext,
        process_annotations: &BTreeMap<String, String>,
    ) -> Result<CapturedProcess, CaptureError> {
        lock(&self.faults).push(*fault);
        if let Some(error) = &self.capture_error {
            return Err(error.clone());
        }

        let mut snapshot = self.snapshot.clone();
        snapshot.process_id = connection.process_id();
        snapshot.annotations.extend(
            process_annotations
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Ok(CapturedProcess {
            snapshot: Box::new(snapshot),
            sanitizer: self
                .sanitizer
                .clone()
                .map(|sanitizer| Box::new(sanitizer) as Box<dyn SnapshotSanitizer>),
            requesting_thread_id: if fault.requesting_thread_stack_address != 0 {
                self.requesting_thread_id
            } else {
                None
            },
        })
    }
}

/// The settings of a [`SynthDatabase`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SynthSettings {
    pub client_id: Option<Uuid>,
}

impl Settings for SynthSettings {
    fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }
}

/// A report being written into a [`SynthDatabase`].
#[derive(Debug)]
pub struct SynthNewReport {
    uuid: Uuid,
    payload: Cursor<Vec<u8>>,
    attachments: BTreeMap<String, Vec<u8>>,
    unreadable: bool,
}

impl NewReport for SynthNewReport {
    fn report_id(&self) -> Uuid {
        self.uuid
    }

    fn writer(&mut self) -> &mut dyn ReportWriter {
        &mut self.payload
    }

    fn reader(&mut self) -> io::Result<Box<dyn Read + '_>> {
        if self.unreadable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "report is not readable",
            ));
        }
        Ok(Box::new(&self.payload.get_ref()[..]))
    }

    fn add_attachment(&mut self, name: &str) -> io::Result<&mut dyn Write> {
        Ok(self.attachments.entry(name.to_owned()).or_default())
    }
}

/// A report that was finished in a [`SynthDatabase`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedReport {
    pub uuid: Uuid,
    pub payload: Vec<u8>,
    pub attachments: BTreeMap<String, Vec<u8>>,
    pub creation_time: OffsetDateTime,
}

#[derive(Default)]
struct DatabaseState {
    prepared: u128,
    finished: Vec<FinishedReport>,
}

/// An in-memory report database.
///
/// Report ids are handed out sequentially starting from 1, and finished reports pretend to
/// live at `<root>/<uuid>.dmp`.
pub struct SynthDatabase {
    root: PathBuf,
    settings: Option<SynthSettings>,
    prepare_fails: bool,
    finish_fails: bool,
    lookup_fails: bool,
    unreadable_reports: bool,
    state: Mutex<DatabaseState>,
}

impl Default for SynthDatabase {
    fn default() -> Self {
        SynthDatabase::new()
    }
}

impl SynthDatabase {
    pub fn new() -> SynthDatabase {
        SynthDatabase {
            root: PathBuf::from("/synth/completed"),
            settings: None,
            prepare_fails: false,
            finish_fails: false,
            lookup_fails: false,
            unreadable_reports: false,
            state: Mutex::new(DatabaseState::default()),
        }
    }

    pub fn with_root(mut self, root: &Path) -> SynthDatabase {
        self.root = root.to_path_buf();
        self
    }

    /// Provide settings. `None` gives settings without a client id.
    pub fn with_client_id(mut self, client_id: Option<Uuid>) -> SynthDatabase {
        self.settings = Some(SynthSettings { client_id });
        self
    }

    pub fn fail_prepare(mut self) -> SynthDatabase {
        self.prepare_fails = true;
        self
    }

    pub fn fail_finish(mut self) -> SynthDatabase {
        self.finish_fails = true;
        self
    }

    pub fn fail_lookup(mut self) -> SynthDatabase {
        self.lookup_fails = true;
        self
    }

    /// Make new reports fail to read back their payload.
    pub fn unreadable_reports(mut self) -> SynthDatabase {
        self.unreadable_reports = true;
        self
    }

    /// How many reports were prepared, finished or not.
    pub fn prepared_count(&self) -> usize {
        lock(&self.state).prepared as usize
    }

    pub fn finished_reports(&self) -> Vec<FinishedReport> {
        lock(&self.state).finished.clone()
    }

    pub fn report_path(&self, uuid: &Uuid) -> PathBuf {
        self.root.join(format!("{}.dmp", uuid))
    }
}

impl CrashReportDatabase for SynthDatabase {
    type NewReport = SynthNewReport;

    fn settings(&self) -> Option<&dyn Settings> {
        self.settings
            .as_ref()
            .map(|settings| settings as &dyn Settings)
    }

    fn prepare_new_crash_report(&self) -> Result<SynthNewReport, OperationStatus> {
        if self.prepare_fails {
            return Err(OperationStatus::FileSystemError);
        }
        let mut state = lock(&self.state);
        state.prepared += 1;
        Ok(SynthNewReport {
            uuid: Uuid::from_u128(state.prepared),
            payload: Cursor::new(Vec::new()),
            attachments: BTreeMap::new(),
            unreadable: self.unreadable_reports,
        })
    }

    fn finished_writing_crash_report(
        &self,
        report: SynthNewReport,
    ) -> Result<Uuid, OperationStatus> {
        if self.finish_fails {
            return Err(OperationStatus::DatabaseError);
        }
        lock(&self.state).finished.push(FinishedReport {
            uuid: report.uuid,
            payload: report.payload.into_inner(),
            attachments: report.attachments,
            creation_time: OffsetDateTime::now_utc(),
        });
        Ok(report.uuid)
    }

    fn look_up_crash_report(&self, uuid: &Uuid) -> Result<Report, OperationStatus> {
        if self.lookup_fails {
            return Err(OperationStatus::DatabaseError);
        }
        let state = lock(&self.state);
        let finished = state
            .finished
            .iter()
            .find(|report| report.uuid == *uuid)
            .ok_or(OperationStatus::ReportNotFound)?;
        Ok(Report {
            uuid: finished.uuid,
            file_path: self.report_path(uuid),
            id: String::new(),
            creation_time: finished.creation_time,
            uploaded: false,
            upload_attempts: 0,
        })
    }
}

/// What a [`SynthSerializer`] was asked to serialize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedSnapshot {
    pub process_id: ProcessId,
    pub client_id: Uuid,
    pub report_id: Uuid,
    pub annotations: BTreeMap<String, String>,
    pub extension_stream_types: Vec<u32>,
    /// Whether the report was written through a seekable writer.
    pub seekable: bool,
}

/// A serializer writing a minidump header followed by the snapshot's identifiers and the
/// extension streams.
#[derive(Default)]
pub struct SynthSerializer {
    fails: bool,
    serialized: Mutex<Vec<SerializedSnapshot>>,
}

impl SynthSerializer {
    pub fn new() -> SynthSerializer {
        Default::default()
    }

    pub fn failing() -> SynthSerializer {
        SynthSerializer {
            fails: true,
            ..Default::default()
        }
    }

    pub fn serialized(&self) -> Vec<SerializedSnapshot> {
        lock(&self.serialized).clone()
    }

    /// The bytes written for `snapshot`.
    pub fn minidump_bytes(
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
    ) -> Vec<u8> {
        let mut section = Section::with_endian(Endian::Little)
            .D32(md::MINIDUMP_SIGNATURE)
            .D32(md::MINIDUMP_VERSION)
            .D32(extension_streams.len() as u32)
            .D32(0)
            .append_bytes(snapshot.client_id().as_bytes())
            .append_bytes(snapshot.report_id().as_bytes());
        for stream in extension_streams {
            section = section
                .D32(stream.stream_type)
                .D32(stream.data.len() as u32)
                .append_bytes(&stream.data);
        }
        section.get_contents().unwrap_or_default()
    }

    fn serialize(
        &self,
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
        seekable: bool,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        lock(&self.serialized).push(SerializedSnapshot {
            process_id: snapshot.process_id(),
            client_id: snapshot.client_id(),
            report_id: snapshot.report_id(),
            annotations: snapshot.annotations_simple_map().clone(),
            extension_stream_types: extension_streams
                .iter()
                .map(|stream| stream.stream_type)
                .collect(),
            seekable,
        });
        if self.fails {
            return Err(io::Error::other("synthetic serializer failure"));
        }
        writer.write_all(&Self::minidump_bytes(snapshot, extension_streams))
    }
}

impl MinidumpSerializer for SynthSerializer {
    fn write_everything(
        &self,
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
        writer: &mut dyn ReportWriter,
    ) -> io::Result<()> {
        self.serialize(snapshot, extension_streams, true, writer)
    }

    fn write_minidump(
        &self,
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        self.serialize(snapshot, extension_streams, false, writer)
    }
}

/// A stream source producing one fixed stream, or nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SynthStreamSource {
    stream: Option<ExtensionStream>,
}

impl SynthStreamSource {
    pub fn new(stream_type: u32, data: &[u8]) -> SynthStreamSource {
        SynthStreamSource {
            stream: Some(ExtensionStream {
                stream_type,
                data: data.to_vec(),
            }),
        }
    }

    pub fn empty() -> SynthStreamSource {
        Default::default()
    }
}

impl UserStreamDataSource for SynthStreamSource {
    fn produce_stream_data(&self, _snapshot: &dyn ProcessSnapshot) -> Option<ExtensionStream> {
        self.stream.clone()
    }
}

/// An upload scheduler that records queued reports.
pub struct SynthUploader {
    wait_succeeds: bool,
    pending: Mutex<Vec<Uuid>>,
    waits: Mutex<Vec<Duration>>,
}

impl Default for SynthUploader {
    fn default() -> Self {
        SynthUploader::new()
    }
}

impl SynthUploader {
    pub fn new() -> SynthUploader {
        SynthUploader {
            wait_succeeds: true,
            pending: Mutex::new(Vec::new()),
            waits: Mutex::new(Vec::new()),
        }
    }

    /// An uploader whose waits always time out.
    pub fn timing_out() -> SynthUploader {
        SynthUploader {
            wait_succeeds: false,
            ..SynthUploader::new()
        }
    }

    pub fn pending(&self) -> Vec<Uuid> {
        lock(&self.pending).clone()
    }

    /// The timeouts of every wait so far.
    pub fn waits(&self) -> Vec<Duration> {
        lock(&self.waits).clone()
    }
}

impl UploadScheduler for SynthUploader {
    fn report_pending(&self, report_id: Uuid) {
        lock(&self.pending).push(report_id);
    }

    fn wait_for_pending_upload(&self, timeout: Duration) -> bool {
        lock(&self.waits).push(timeout);
        self.wait_succeeds
    }
}

/// A launcher that pretends to run a child which terminates as configured.
#[cfg(target_os = "linux")]
pub struct SynthLauncher {
    result: Result<ChildExit, io::ErrorKind>,
    launches: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

#[cfg(target_os = "linux")]
impl SynthLauncher {
    pub fn new(exit: ChildExit) -> SynthLauncher {
        SynthLauncher {
            result: Ok(exit),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// A launcher failing to create the child.
    pub fn failing_spawn() -> SynthLauncher {
        SynthLauncher {
            result: Err(io::ErrorKind::NotFound),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Every program and argument vector launched so far.
    pub fn launches(&self) -> Vec<(PathBuf, Vec<String>)> {
        lock(&self.launches).clone()
    }
}

#[cfg(target_os = "linux")]
impl ProcessLauncher for SynthLauncher {
    fn spawn_and_wait(&self, program: &Path, argv: &[String]) -> Result<ChildExit, LaunchError> {
        lock(&self.launches).push((program.to_path_buf(), argv.to_vec()));
        self.result
            .map_err(|kind| LaunchError::Spawn(io::Error::from(kind)))
    }
}

/// Metrics that remember everything reported to them.
#[derive(Default)]
pub struct RecordingMetrics {
    encountered: Mutex<usize>,
    results: Mutex<Vec<CaptureResult>>,
}

impl RecordingMetrics {
    pub fn new() -> RecordingMetrics {
        Default::default()
    }

    pub fn encountered(&self) -> usize {
        *lock(&self.encountered)
    }

    pub fn results(&self) -> Vec<CaptureResult> {
        lock(&self.results).clone()
    }
}

impl Metrics for RecordingMetrics {
    fn exception_encountered(&self) {
        *lock(&self.encountered) += 1;
    }

    fn exception_capture_result(&self, result: CaptureResult) {
        lock(&self.results).push(result);
    }
}
