//! Non-blocking output capture
//!
//! A remote command's exit status can become available before its buffered
//! output drains, or after it. Capture therefore polls both streams and the
//! status without blocking on any one of them, and only returns once both
//! streams reported end-of-stream and the status is known.

use std::io::{self, ErrorKind};
use std::thread;
use std::time::Duration;

use super::ExecutionResult;

/// A running command whose streams can be read without blocking
///
/// Reads return `Ok(0)` at end-of-stream and `ErrorKind::WouldBlock` when no
/// data is ready yet.
pub trait OutputSource {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// `Ok(None)` while the command has not exited
    fn exit_status(&mut self) -> io::Result<Option<i32>>;
}

struct Stream {
    data: Vec<u8>,
    eof: bool,
}

impl Stream {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            eof: false,
        }
    }

    /// Returns whether any progress was made
    fn pump<F>(&mut self, buf: &mut [u8], read: F) -> io::Result<bool>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.eof {
            return Ok(false);
        }
        match read(buf) {
            Ok(0) => {
                self.eof = true;
                Ok(true)
            }
            Ok(n) => {
                self.data.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Decode captured bytes, rejecting anything that is not UTF-8
pub(crate) fn decode(stream: &str, data: Vec<u8>) -> io::Result<String> {
    String::from_utf8(data).map_err(|e| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("{} is not valid UTF-8: {}", stream, e.utf8_error()),
        )
    })
}

/// Drain both streams of `source` and wait for its exit status
pub fn capture_output<S>(source: &mut S, poll_interval: Duration) -> io::Result<ExecutionResult>
where
    S: OutputSource + ?Sized,
{
    let mut out = Stream::new();
    let mut err = Stream::new();
    let mut status: Option<i32> = None;
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        let mut progressed = out.pump(&mut buf, |b| source.read_stdout(b))?;
        progressed |= err.pump(&mut buf, |b| source.read_stderr(b))?;

        if status.is_none() {
            status = source.exit_status()?;
        }

        if let (true, true, Some(code)) = (out.eof, err.eof, status) {
            return Ok(ExecutionResult::new(
                decode("stdout", out.data)?,
                decode("stderr", err.data)?,
                code,
            ));
        }

        if !progressed && !poll_interval.is_zero() {
            thread::sleep(poll_interval);
        }
    }
}
