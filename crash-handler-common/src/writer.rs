//! The minidump serializer interface.

use std::io::{self, Seek, Write};

use crate::snapshot::ProcessSnapshot;

/// A seekable destination for a serialized report.
pub trait ReportWriter: Write + Seek + Send {}

impl<T: Write + Seek + Send> ReportWriter for T {}

/// An extra stream supplied by the embedder and appended to every minidump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionStream {
    pub stream_type: u32,
    pub data: Vec<u8>,
}

/// A producer of [`ExtensionStream`]s.
pub trait UserStreamDataSource: Send + Sync {
    /// Produce a stream for `snapshot`, or `None` to contribute nothing to this report.
    fn produce_stream_data(&self, snapshot: &dyn ProcessSnapshot) -> Option<ExtensionStream>;
}

/// Turns a snapshot into minidump bytes.
pub trait MinidumpSerializer: Send + Sync {
    /// Write a complete minidump to a seekable writer.
    fn write_everything(
        &self,
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
        writer: &mut dyn ReportWriter,
    ) -> io::Result<()>;

    /// Write a complete minidump front to back without seeking.
    fn write_minidump(
        &self,
        snapshot: &dyn ProcessSnapshot,
        extension_streams: &[ExtensionStream],
        writer: &mut dyn Write,
    ) -> io::Result<()>;
}
