//! The compress → encode → log chain used to emit a minidump through the log.
//!
//! [`MinidumpLogWriter`] zlib-compresses everything written to it, base94-encodes the
//! compressed bytes and hands the text to a [`LogDelegate`] in fixed-size lines.
//! [`decode_minidump_log`] reverses the chain on captured log text.

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

pub mod base94;
pub mod log;

pub use self::base94::{Base94Decoder, Base94Encoder};
pub use self::log::{LogDelegate, LogOutputStream, TracingLogDelegate};

/// A writer that emits a compressed, text-encoded minidump to a log.
///
/// [`finish`][MinidumpLogWriter::finish] must be called once all data has been written, or the
/// log will hold a truncated stream without an end marker.
pub struct MinidumpLogWriter {
    stream: ZlibEncoder<Base94Encoder<LogOutputStream>>,
}

impl MinidumpLogWriter {
    pub fn new(delegate: Arc<dyn LogDelegate>) -> MinidumpLogWriter {
        MinidumpLogWriter {
            stream: ZlibEncoder::new(
                Base94Encoder::new(LogOutputStream::new(delegate)),
                Compression::default(),
            ),
        }
    }

    pub fn finish(self) -> io::Result<()> {
        let encoder = self.stream.finish()?;
        let log = encoder.finish()?;
        log.finish()
    }
}

impl Write for MinidumpLogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Copy everything from `reader` through a [`MinidumpLogWriter`].
pub fn write_minidump_log_from_reader<R: Read + ?Sized>(
    reader: &mut R,
    delegate: Arc<dyn LogDelegate>,
) -> io::Result<()> {
    let mut writer = MinidumpLogWriter::new(delegate);
    io::copy(reader, &mut writer)?;
    writer.finish()
}

/// Recover the minidump bytes from the text a [`MinidumpLogWriter`] logged.
///
/// Marker lines and line breaks are ignored, so `text` may be the log lines joined in any way.
pub fn decode_minidump_log(text: &str) -> io::Result<Vec<u8>> {
    let mut decoder = Base94Decoder::new(ZlibDecoder::new(Vec::new()));
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("-----") && line.ends_with("-----") {
            continue;
        }
        decoder.write_all(line.as_bytes())?;
    }
    decoder.finish()?.finish()
}
