// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use crash_handler::*;
use crash_handler::stream::LogDelegate;
use crash_handler_synth::*;
use uuid::Uuid;

const PID: ProcessId = 4321;
const UID: UserId = 1000;
const CLIENT_ID: Uuid = Uuid::from_u128(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
const FIRST_REPORT: Uuid = Uuid::from_u128(1);

#[derive(Default)]
struct CollectingLog {
    lines: Mutex<Vec<String>>,
    closed: bool,
}

impl CollectingLog {
    fn closed() -> CollectingLog {
        CollectingLog {
            closed: true,
            ..Default::default()
        }
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogDelegate for CollectingLog {
    fn log(&self, line: &str) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other("log sink closed"));
        }
        self.lines.lock().unwrap().push(line.to_owned());
        Ok(())
    }
}

fn test_snapshot() -> SynthSnapshot {
    SynthSnapshot::new(PID)
        .add_simple_annotation("ver", "1.0")
        .add_module(SynthModule::new("libapp.so").add_simple_annotation("channel", "beta"))
}

struct Fixture {
    database: Arc<SynthDatabase>,
    introspector: Arc<SynthIntrospector>,
    serializer: Arc<SynthSerializer>,
    uploader: Arc<SynthUploader>,
    metrics: Arc<RecordingMetrics>,
}

impl Fixture {
    fn new(database: SynthDatabase, introspector: SynthIntrospector) -> Fixture {
        Fixture::with_serializer(database, introspector, SynthSerializer::new())
    }

    fn with_serializer(
        database: SynthDatabase,
        introspector: SynthIntrospector,
        serializer: SynthSerializer,
    ) -> Fixture {
        Fixture {
            database: Arc::new(database),
            introspector: Arc::new(introspector),
            serializer: Arc::new(serializer),
            uploader: Arc::new(SynthUploader::new()),
            metrics: Arc::new(RecordingMetrics::new()),
        }
    }

    fn handler(&self, options: HandlerOptions) -> CrashReportExceptionHandler<SynthDatabase> {
        CrashReportExceptionHandler::new(
            self.database.clone(),
            self.introspector.clone(),
            self.serializer.clone(),
            options,
        )
        .with_upload_thread(self.uploader.clone())
        .with_metrics(self.metrics.clone())
    }
}

fn minidump_format() -> Arc<SimpleStringDictionary> {
    Arc::new(SimpleStringDictionary::from_iter([(FORMAT_KEY, MINIDUMP_FORMAT)]))
}

fn handle(
    handler: &CrashReportExceptionHandler<SynthDatabase>,
) -> Result<HandledException, HandlerError> {
    handler.handle_exception(PID, UID, &ClientInformation::default(), 0)
}

#[test]
fn test_database_report() {
    let fixture = Fixture::new(
        SynthDatabase::new().with_client_id(Some(CLIENT_ID)),
        SynthIntrospector::new(test_snapshot()),
    );
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_handler_annotations(minidump_format());

    let handled = handle(&handler).unwrap();
    assert_eq!(handled.report_id, Some(FIRST_REPORT));
    assert_eq!(handled.requesting_thread_id, None);

    let reports = fixture.database.finished_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].uuid, FIRST_REPORT);
    assert_eq!(&reports[0].payload[..4], b"MDMP");

    let serialized = fixture.serializer.serialized();
    assert_eq!(serialized.len(), 1);
    assert_eq!(serialized[0].process_id, PID);
    assert_eq!(serialized[0].client_id, CLIENT_ID);
    assert_eq!(serialized[0].report_id, FIRST_REPORT);
    assert!(serialized[0].seekable);

    assert_eq!(fixture.uploader.pending(), vec![FIRST_REPORT]);
    assert!(fixture.uploader.waits().is_empty());
    assert_eq!(fixture.metrics.encountered(), 1);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::Success]);
}

#[test]
fn test_upload_requires_minidump_format() {
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture.handler(HandlerOptions::database()).with_handler_annotations(Arc::new(
        SimpleStringDictionary::from_iter([(FORMAT_KEY, "btt")]),
    ));

    handle(&handler).unwrap();
    assert_eq!(fixture.database.finished_reports().len(), 1);
    assert!(fixture.uploader.pending().is_empty());
}

#[test]
fn test_client_id_defaults_to_nil() {
    for database in [SynthDatabase::new(), SynthDatabase::new().with_client_id(None)] {
        let fixture = Fixture::new(database, SynthIntrospector::new(test_snapshot()));
        handle(&fixture.handler(HandlerOptions::database())).unwrap();
        assert_eq!(fixture.serializer.serialized()[0].client_id, Uuid::nil());
    }
}

#[test]
fn test_process_annotations_overlay() {
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_process_annotations(BTreeMap::from([
            ("ver".to_owned(), "2.0".to_owned()),
            ("prod".to_owned(), "handler".to_owned()),
        ]));

    handle(&handler).unwrap();
    let annotations = &fixture.serializer.serialized()[0].annotations;
    assert_eq!(annotations["ver"], "2.0");
    assert_eq!(annotations["prod"], "handler");
}

#[test]
fn test_sanitized_view_is_serialized() {
    let snapshot = test_snapshot().add_simple_annotation("secret", "hunter2");
    let fixture = Fixture::new(
        SynthDatabase::new().with_client_id(Some(CLIENT_ID)),
        SynthIntrospector::new(snapshot).with_sanitizer(RedactingSanitizer::new(["secret"])),
    );

    handle(&fixture.handler(HandlerOptions::database())).unwrap();
    let serialized = &fixture.serializer.serialized()[0];
    assert!(!serialized.annotations.contains_key("secret"));
    assert_eq!(serialized.annotations["ver"], "1.0");
    assert_eq!(serialized.client_id, CLIENT_ID);
    assert_eq!(serialized.report_id, FIRST_REPORT);
}

#[test]
fn test_extension_streams() {
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_user_stream_data_sources(vec![
            Arc::new(SynthStreamSource::new(0x4b6b0002, b"extra")) as Arc<dyn UserStreamDataSource>,
            Arc::new(SynthStreamSource::empty()),
            Arc::new(SynthStreamSource::new(0x4b6b0003, b"")),
        ]);

    handle(&handler).unwrap();
    assert_eq!(
        fixture.serializer.serialized()[0].extension_stream_types,
        vec![0x4b6b0002, 0x4b6b0003]
    );
}

#[test]
fn test_requesting_thread() {
    let fixture = Fixture::new(
        SynthDatabase::new(),
        SynthIntrospector::new(test_snapshot()).with_requesting_thread(77),
    );
    let handler = fixture.handler(HandlerOptions::database());
    let info = ClientInformation {
        exception_information_address: 0x7fff_0000,
        ..Default::default()
    };

    let handled = handler.handle_exception(PID, UID, &info, 0x7ffd_1234).unwrap();
    assert_eq!(handled.requesting_thread_id, Some(77));

    let handled = handler.handle_exception_with_broker(PID, UID, &info, 9).unwrap();
    assert_eq!(handled.requesting_thread_id, None);
    assert_eq!(handled.report_id, Some(Uuid::from_u128(2)));

    let faults = fixture.introspector.faults();
    assert_eq!(faults[0].requesting_thread_stack_address, 0x7ffd_1234);
    assert_eq!(faults[0].info, info);
    assert_eq!(faults[1].requesting_thread_stack_address, 0);
    assert_eq!(faults[1].client_uid, UID);
}

#[test]
fn test_unreadable_attachment_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    let mut contents = vec![b'a'; 500];
    contents.extend(vec![b'z'; 1000]);
    fs::write(&log_path, &contents).unwrap();

    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_process_attachments(vec![
            Attachment::from_path(&log_path),
            Attachment::new("missing", dir.path().join("missing.log")),
        ])
        .with_handler_annotations(Arc::new(SimpleStringDictionary::from_iter([(
            ATTACHMENT_KILOBYTE_LIMIT_KEY,
            "1",
        )])));

    assert_eq!(handle(&handler).unwrap().report_id, Some(FIRST_REPORT));

    let reports = fixture.database.finished_reports();
    assert_eq!(reports.len(), 1);
    let attachments = &reports[0].attachments;
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments["app.log"], vec![b'z'; 1000]);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::Success]);
}

#[test]
fn test_attachments_reread_for_each_report() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");

    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let mut options = HandlerOptions::database();
    options.attachment_kilobyte_limit = 4;
    let handler = fixture
        .handler(options)
        .with_process_attachments(vec![Attachment::from_path(&log_path)]);

    fs::write(&log_path, b"first crash\n").unwrap();
    handle(&handler).unwrap();
    fs::write(&log_path, b"first crash\nsecond crash\n").unwrap();
    handle(&handler).unwrap();

    let reports = fixture.database.finished_reports();
    assert_eq!(reports[0].attachments["app.log"], b"first crash\n");
    assert_eq!(reports[1].attachments["app.log"], b"first crash\nsecond crash\n");
}

#[test]
fn test_default_attachment_limit_writes_empty_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    fs::write(&log_path, b"contents").unwrap();

    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_process_attachments(vec![Attachment::new("log", &log_path)]);

    handle(&handler).unwrap();
    assert_eq!(
        fixture.database.finished_reports()[0].attachments["log"],
        Vec::<u8>::new()
    );
}

#[test]
fn test_connection_failures() {
    let fixture = Fixture::new(
        SynthDatabase::new(),
        SynthIntrospector::new(test_snapshot()).fail_connect(),
    );
    let err = handle(&fixture.handler(HandlerOptions::database())).unwrap_err();
    assert!(matches!(err, HandlerError::DirectPtraceFailed(_)));
    assert_eq!(err.name(), "DirectPtraceFailed");
    assert_eq!(err.report_id(), None);
    assert_eq!(fixture.database.prepared_count(), 0);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::DirectPtraceFailed]);

    let fixture = Fixture::new(
        SynthDatabase::new(),
        SynthIntrospector::new(test_snapshot()).refuse_broker(),
    );
    let err = fixture
        .handler(HandlerOptions::database())
        .handle_exception_with_broker(PID, UID, &ClientInformation::default(), 3)
        .unwrap_err();
    assert!(matches!(err, HandlerError::BrokeredPtraceFailed(_)));
    assert_eq!(fixture.metrics.encountered(), 1);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::BrokeredPtraceFailed]);
    assert!(fixture.introspector.faults().is_empty());
}

#[test]
fn test_capture_failures() {
    let cases = [
        (CaptureError::SnapshotFailed, CaptureResult::SnapshotFailed),
        (
            CaptureError::ExceptionInitializationFailed,
            CaptureResult::ExceptionInitializationFailed,
        ),
        (
            CaptureError::SanitizationInitializationFailed,
            CaptureResult::SanitizationInitializationFailed,
        ),
        (
            CaptureError::SkippedDueToSanitization,
            CaptureResult::SkippedDueToSanitization,
        ),
    ];

    for (error, result) in cases {
        let fixture = Fixture::new(
            SynthDatabase::new(),
            SynthIntrospector::new(test_snapshot()).fail_capture(error.clone()),
        );
        let err = handle(&fixture.handler(HandlerOptions::database())).unwrap_err();
        assert!(matches!(err, HandlerError::CaptureFailed(ref e) if *e == error));
        assert_eq!(fixture.metrics.results(), vec![result]);
        assert_eq!(fixture.database.prepared_count(), 0);
    }
}

#[test]
fn test_prepare_failure() {
    let fixture = Fixture::new(
        SynthDatabase::new().fail_prepare(),
        SynthIntrospector::new(test_snapshot()),
    );
    let err = handle(&fixture.handler(HandlerOptions::database())).unwrap_err();
    assert!(matches!(
        err,
        HandlerError::PrepareNewCrashReportFailed(OperationStatus::FileSystemError)
    ));
    assert!(fixture.serializer.serialized().is_empty());
    assert_eq!(
        fixture.metrics.results(),
        vec![CaptureResult::PrepareNewCrashReportFailed]
    );
}

#[test]
fn test_write_failure_leaves_report_unfinished() {
    let fixture = Fixture::with_serializer(
        SynthDatabase::new(),
        SynthIntrospector::new(test_snapshot()),
        SynthSerializer::failing(),
    );
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_handler_annotations(minidump_format());

    let err = handle(&handler).unwrap_err();
    assert!(matches!(err, HandlerError::MinidumpWriteFailed(_)));
    assert_eq!(fixture.database.prepared_count(), 1);
    assert!(fixture.database.finished_reports().is_empty());
    assert!(fixture.uploader.pending().is_empty());
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::MinidumpWriteFailed]);
}

#[test]
fn test_finish_failure() {
    let fixture = Fixture::new(
        SynthDatabase::new().fail_finish(),
        SynthIntrospector::new(test_snapshot()),
    );
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_handler_annotations(minidump_format());

    let err = handle(&handler).unwrap_err();
    assert!(matches!(err, HandlerError::FinishedWritingCrashReportFailed(_)));
    assert!(fixture.uploader.pending().is_empty());
    assert_eq!(
        fixture.metrics.results(),
        vec![CaptureResult::FinishedWritingCrashReportFailed]
    );
}

#[test]
fn test_log_only() {
    let log = Arc::new(CollectingLog::default());
    let fixture = Fixture::new(
        SynthDatabase::new().with_client_id(Some(CLIENT_ID)),
        SynthIntrospector::new(test_snapshot()),
    );
    let handler = fixture
        .handler(HandlerOptions::log_only())
        .with_log_delegate(log.clone())
        .with_handler_annotations(minidump_format());

    let handled = handle(&handler).unwrap();
    assert_eq!(handled.report_id, None);
    assert_eq!(fixture.database.prepared_count(), 0);
    assert!(fixture.uploader.pending().is_empty());

    let serialized = &fixture.serializer.serialized()[0];
    assert!(!serialized.seekable);
    assert_eq!(serialized.client_id, CLIENT_ID);
    assert_eq!(serialized.report_id, Uuid::nil());

    let lines = log.lines();
    assert_eq!(lines.first().unwrap(), "-----BEGIN CRASHPAD MINIDUMP-----");
    assert_eq!(lines.last().unwrap(), "-----END CRASHPAD MINIDUMP-----");
    let minidump = decode_minidump_log(&lines.join("\n")).unwrap();
    assert_eq!(&minidump[..4], b"MDMP");
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::Success]);
}

#[test]
fn test_log_only_sanitized_view_is_serialized() {
    let log = Arc::new(CollectingLog::default());
    let snapshot = test_snapshot().add_simple_annotation("secret", "hunter2");
    let fixture = Fixture::new(
        SynthDatabase::new(),
        SynthIntrospector::new(snapshot).with_sanitizer(RedactingSanitizer::new(["secret"])),
    );
    let handler = fixture
        .handler(HandlerOptions::log_only())
        .with_log_delegate(log.clone());

    handle(&handler).unwrap();
    let serialized = &fixture.serializer.serialized()[0];
    assert!(!serialized.seekable);
    assert!(!serialized.annotations.contains_key("secret"));
    assert_eq!(serialized.annotations["ver"], "1.0");
    assert_eq!(fixture.database.prepared_count(), 0);
    assert!(!log.lines().is_empty());
}

#[test]
fn test_log_only_failure() {
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::log_only())
        .with_log_delegate(Arc::new(CollectingLog::closed()));

    let err = handle(&handler).unwrap_err();
    assert!(matches!(err, HandlerError::LogWriteFailed(_)));
    assert_eq!(err.report_id(), None);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::LogEmissionFailed]);
}

#[test]
fn test_log_mirror() {
    let log = Arc::new(CollectingLog::default());
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::from_flags(true, true).unwrap())
        .with_log_delegate(log.clone());

    let handled = handle(&handler).unwrap();
    assert_eq!(handled.report_id, Some(FIRST_REPORT));

    let reports = fixture.database.finished_reports();
    let mirrored = decode_minidump_log(&log.lines().join("\n")).unwrap();
    assert_eq!(mirrored, reports[0].payload);
}

#[test]
fn test_log_mirror_failure_keeps_report() {
    let fixture = Fixture::new(
        SynthDatabase::new().unreadable_reports(),
        SynthIntrospector::new(test_snapshot()),
    );
    let handler = fixture
        .handler(HandlerOptions::mirror_to_log())
        .with_log_delegate(Arc::new(CollectingLog::default()))
        .with_handler_annotations(minidump_format());

    let err = handle(&handler).unwrap_err();
    assert!(matches!(
        err,
        HandlerError::LogMirrorFailed { report_id, .. } if report_id == FIRST_REPORT
    ));
    assert_eq!(err.report_id(), Some(FIRST_REPORT));
    assert_eq!(fixture.database.finished_reports().len(), 1);
    assert_eq!(fixture.uploader.pending(), vec![FIRST_REPORT]);
    assert_eq!(fixture.metrics.results(), vec![CaptureResult::Success]);
}

fn recording_hooks() -> (Arc<HookRegistry>, Arc<Mutex<Vec<(&'static str, DumpEvent)>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookRegistry::new();
    let on_dump = events.clone();
    hooks.set_on_dump_event(move |event| on_dump.lock().unwrap().push(("dump", *event)));
    let after_dump = events.clone();
    hooks.set_after_dump(move |event| after_dump.lock().unwrap().push(("after", *event)));
    (Arc::new(hooks), events)
}

#[test]
fn test_hooks_fire_around_persistence() {
    let (hooks, events) = recording_hooks();
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    handle(&fixture.handler(HandlerOptions::database()).with_hooks(hooks)).unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (
                "dump",
                DumpEvent {
                    client_process_id: PID,
                    report_id: None,
                    succeeded: None,
                }
            ),
            (
                "after",
                DumpEvent {
                    client_process_id: PID,
                    report_id: Some(FIRST_REPORT),
                    succeeded: Some(true),
                }
            ),
        ]
    );
}

#[test]
fn test_after_dump_hook_sees_failures() {
    let (hooks, events) = recording_hooks();
    let fixture = Fixture::new(
        SynthDatabase::new().fail_prepare(),
        SynthIntrospector::new(test_snapshot()),
    );
    handle(&fixture.handler(HandlerOptions::database()).with_hooks(hooks)).unwrap_err();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[1],
        (
            "after",
            DumpEvent {
                client_process_id: PID,
                report_id: None,
                succeeded: Some(false),
            }
        )
    );
}

#[test]
fn test_hooks_skipped_without_snapshot() {
    let (hooks, events) = recording_hooks();
    let fixture = Fixture::new(
        SynthDatabase::new(),
        SynthIntrospector::new(test_snapshot()).fail_capture(CaptureError::SnapshotFailed),
    );
    handle(&fixture.handler(HandlerOptions::database()).with_hooks(hooks)).unwrap_err();
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_panicking_hook_does_not_abort_handling() {
    let mut hooks = HookRegistry::new();
    hooks.set_on_dump_event(|_| panic!("observer bug"));
    let fixture = Fixture::new(SynthDatabase::new(), SynthIntrospector::new(test_snapshot()));
    let handler = fixture
        .handler(HandlerOptions::database())
        .with_hooks(Arc::new(hooks));

    assert_eq!(handle(&handler).unwrap().report_id, Some(FIRST_REPORT));
}
