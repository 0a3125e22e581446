//! Record-oriented reading of child process output.
//!
//! ffmpeg rewrites its stats line with bare `\r`, and `-progress pipe:1`
//! emits `\n` terminated `key=value` lines. Both are handled by treating either
//! byte as a record delimiter. Overlong records are flushed at a fixed cap so a
//! tool that never emits a delimiter cannot grow the buffer without bound.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const READ_CHUNK: usize = 4096;
const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024;

/// Yields trimmed, non-empty text records delimited by `\n` or `\r`.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; READ_CHUNK],
    max_record_len: usize,
    eof: bool,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; READ_CHUNK],
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            eof: false,
        }
    }

    pub fn with_max_record_len(mut self, len: usize) -> Self {
        self.max_record_len = len.max(1);
        self
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| is_delimiter(b)) {
                let record: Vec<u8> = self.pending.drain(..idx).collect();
                let skip = self.pending.iter().take_while(|&&b| is_delimiter(b)).count();
                self.pending.drain(..skip);
                if let Some(text) = to_record(&record) {
                    return Ok(Some(text));
                }
                continue;
            }

            if self.pending.len() >= self.max_record_len {
                let record: Vec<u8> = self.pending.drain(..self.max_record_len).collect();
                if let Some(text) = to_record(&record) {
                    return Ok(Some(text));
                }
                continue;
            }

            if self.eof {
                let record = std::mem::take(&mut self.pending);
                return Ok(to_record(&record));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&self.scratch[..n]);
            }
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}

fn to_record(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}
