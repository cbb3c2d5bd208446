use std::io::{self, Write};
use std::sync::Arc;

use tracing::{error, info};

/// The longest line handed to a [`LogDelegate`].
pub const LINE_BUFFER_SIZE: usize = 512;
/// The most payload bytes a single [`LogOutputStream`] will emit.
pub const OUTPUT_CAP: usize = 128 * 1024;

pub const BEGIN_MARKER: &str = "-----BEGIN CRASHPAD MINIDUMP-----";
pub const END_MARKER: &str = "-----END CRASHPAD MINIDUMP-----";
pub const ABORT_MARKER: &str = "-----ABORT CRASHPAD MINIDUMP-----";

/// Where a [`LogOutputStream`] sends its lines.
pub trait LogDelegate: Send + Sync {
    fn log(&self, line: &str) -> io::Result<()>;

    fn output_cap(&self) -> usize {
        OUTPUT_CAP
    }

    fn line_buffer_size(&self) -> usize {
        LINE_BUFFER_SIZE
    }
}

/// Emits each line as an `info` event on the `crashpad` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogDelegate;

impl LogDelegate for TracingLogDelegate {
    fn log(&self, line: &str) -> io::Result<()> {
        info!(target: "crashpad", "{}", line);
        Ok(())
    }
}

/// Splits written text into lines framed by begin/end markers.
///
/// Writing more than the delegate's output cap emits [`ABORT_MARKER`] and fails every
/// later write.
pub struct LogOutputStream {
    delegate: Arc<dyn LogDelegate>,
    buffer: Vec<u8>,
    output_count: usize,
    started: bool,
    aborted: bool,
}

impl LogOutputStream {
    pub fn new(delegate: Arc<dyn LogDelegate>) -> LogOutputStream {
        LogOutputStream {
            delegate,
            buffer: Vec::with_capacity(LINE_BUFFER_SIZE),
            output_count: 0,
            started: false,
            aborted: false,
        }
    }

    /// Emit the buffered partial line and the end marker.
    pub fn finish(mut self) -> io::Result<()> {
        self.start()?;
        self.write_buffer()?;
        self.delegate.log(END_MARKER)
    }

    fn start(&mut self) -> io::Result<()> {
        if self.aborted {
            return Err(io::Error::other("log output already aborted"));
        }
        if !self.started {
            self.started = true;
            self.delegate.log(BEGIN_MARKER)?;
        }
        Ok(())
    }

    fn write_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.output_count + self.buffer.len() > self.delegate.output_cap() {
            error!("LogOutputStream bytes exceed limit");
            self.aborted = true;
            self.delegate.log(ABORT_MARKER)?;
            return Err(io::Error::other("log output cap exceeded"));
        }
        self.delegate.log(&String::from_utf8_lossy(&self.buffer))?;
        self.output_count += self.buffer.len();
        self.buffer.clear();
        Ok(())
    }
}

impl Write for LogOutputStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.start()?;
        let line_size = self.delegate.line_buffer_size();
        for &byte in data {
            self.buffer.push(byte);
            if self.buffer.len() >= line_size {
                self.write_buffer()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
