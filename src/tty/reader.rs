//! AT response reader.
//!
//! Modems are conversational but not well behaved: the final status code may
//! arrive only after several informational lines, answers can be split
//! across arbitrarily small reads, and unsolicited notifications (signal
//! strength, battery, network state, prefixed with `^` on the devices in
//! scope) can appear at any point, including between a command and its
//! response. A single fixed-size read is therefore never enough; the reader
//! buffers line by line until it sees a known terminator or runs out of
//! budget.

use super::{poll_in, read, AtResponse};
use std::{
    borrow::Cow,
    io,
    ops::Range,
    os::fd::{AsRawFd, BorrowedFd},
    time::{Duration, Instant},
};
use tracing::{error, trace, warn};

/// Response byte budget. A response that grows past this without a
/// terminator is broken.
const RESPONSE_BYTES: usize = 512;

/// Response line budget. One slot is reserved as a sentinel: a response
/// needing the final slot is already out of range.
const RESPONSE_LINES: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("no complete response received in time")]
    TimedOut,
    #[error("no complete response received within budget")]
    Overflow,
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// A parsed modem answer: the raw bytes plus the spans of the committed
/// lines. Keeping offsets instead of pointers into the buffer makes the
/// structure freely movable.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    lines: Vec<Range<usize>>,
    result: Option<usize>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(RESPONSE_BYTES),
            lines: Vec::with_capacity(RESPONSE_LINES),
            result: None,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.lines.clear();
        self.result = None;
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, index: usize) -> Option<Cow<'_, str>> {
        let span = self.lines.get(index)?;
        Some(String::from_utf8_lossy(&self.buf[span.clone()]))
    }

    pub fn lines(&self) -> impl Iterator<Item = Cow<'_, str>> {
        self.lines
            .iter()
            .map(|span| String::from_utf8_lossy(&self.buf[span.clone()]))
    }

    /// The first committed line that started with the requested prefix.
    pub fn result_line(&self) -> Option<Cow<'_, str>> {
        self.line(self.result?)
    }

    /// Render all lines as `"l1", "l2"` for logging or the config store.
    pub fn flatten(&self) -> String {
        let mut flat = String::new();
        for (i, line) in self.lines().enumerate() {
            if i > 0 {
                flat.push_str(", ");
            }
            flat.push('"');
            flat.push_str(&line);
            flat.push('"');
        }
        flat
    }
}

/// Read one complete answer from the modem.
///
/// Fills `r` and returns the terminator code of the last committed line.
/// `result_prefix` marks the first matching line as the result line.
/// The timeout bounds the whole answer, not individual reads.
pub fn get(
    fd: BorrowedFd<'_>,
    r: &mut ReadBuffer,
    result_prefix: Option<&str>,
    timeout: Duration,
) -> Result<AtResponse, ReadError> {
    r.reset();
    let deadline = Instant::now() + timeout;
    // Whether the cursor sits between lines. Runs of CR and LF bytes are
    // collapsed by not leaving this state until a data byte arrives.
    let mut in_newline = true;
    let mut line_start = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("poll timed out");
            return Err(ReadError::TimedOut);
        }
        let remaining = deadline - now;
        let remaining_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        // Bytes are read one at a time so we never consume past the
        // terminator on a strictly line-oriented device.
        if !poll_in(fd.as_raw_fd(), remaining_ms.max(1)).map_err(|err| {
            error!("poll failed: {err}");
            err
        })? {
            warn!("poll timed out");
            return Err(ReadError::TimedOut);
        }

        loop {
            let mut byte = [0u8; 1];
            let rxed = unsafe { read(fd.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
            match rxed {
                Ok(0) => {
                    return Err(ReadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control line closed",
                    )))
                }
                Ok(_) => {}
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock =>
                {
                    // Drained the device; wait for more.
                    break;
                }
                Err(err) => {
                    error!("read failed: {err}");
                    return Err(ReadError::Io(err));
                }
            }

            let b = byte[0];
            if b == b'\r' || b == b'\n' {
                if in_newline {
                    // Still inside a CR/LF run; the byte carries nothing.
                    continue;
                }
                in_newline = true;

                if r.buf[line_start] == b'^' {
                    // Asynchronous notification; drop the line as if it was
                    // never received.
                    trace!(
                        "discarding async reply: {}",
                        String::from_utf8_lossy(&r.buf[line_start..])
                    );
                    r.buf.truncate(line_start);
                    continue;
                }

                let span = line_start..r.buf.len();
                trace!("read: {}", String::from_utf8_lossy(&r.buf[span.clone()]));
                r.lines.push(span.clone());

                if r.result.is_none() {
                    if let Some(prefix) = result_prefix {
                        if r.buf[span.clone()].starts_with(prefix.as_bytes()) {
                            r.result = Some(r.lines.len() - 1);
                        }
                    }
                }

                if let Some(response) = AtResponse::classify(&r.buf[span]) {
                    return Ok(response);
                }
            } else {
                if in_newline {
                    if r.lines.len() == RESPONSE_LINES - 1 {
                        error!(
                            "no complete response received within {RESPONSE_LINES} lines"
                        );
                        return Err(ReadError::Overflow);
                    }
                    line_start = r.buf.len();
                    in_newline = false;
                }
                if r.buf.len() == RESPONSE_BYTES {
                    error!(
                        "no complete response received within {RESPONSE_BYTES} bytes"
                    );
                    return Err(ReadError::Overflow);
                }
                r.buf.push(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::{AsFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    const TIMEOUT: Duration = Duration::from_millis(2500);

    /// Far end plus a non-blocking near end for the reader under test.
    fn tty_pair() -> (UnixStream, OwnedFd) {
        let (far, near) = UnixStream::pair().unwrap();
        near.set_nonblocking(true).unwrap();
        (far, near.into())
    }

    fn read_all(script: &[u8], prefix: Option<&str>) -> (Result<AtResponse, ReadError>, ReadBuffer) {
        let (mut far, near) = tty_pair();
        far.write_all(script).unwrap();
        let mut r = ReadBuffer::new();
        let result = get(near.as_fd(), &mut r, prefix, TIMEOUT);
        (result, r)
    }

    #[test]
    fn returns_terminator_of_last_line() {
        let (result, r) = read_all(b"Huawei\r\nE220\r\nOK\r\n", None);
        assert_eq!(result.unwrap(), AtResponse::Ok);
        assert_eq!(r.line_count(), 3);
        assert_eq!(r.line(0).unwrap(), "Huawei");
        assert_eq!(r.line(1).unwrap(), "E220");
        assert_eq!(r.line(2).unwrap(), "OK");
    }

    #[test]
    fn classifies_each_terminator() {
        let cases: [(&[u8], AtResponse); 7] = [
            (b"CONNECT\r\n", AtResponse::Connect),
            (b"ERROR\r\n", AtResponse::Error),
            (b"+CME ERROR: 11\r\n", AtResponse::CmeError),
            (b"NO DIALTONE\r\n", AtResponse::NoDialtone),
            (b"BUSY\r\n", AtResponse::Busy),
            (b"NO CARRIER\r\n", AtResponse::NoCarrier),
            (b"COMMAND NOT SUPPORT\r\n", AtResponse::NotSupported),
        ];
        for (script, expected) in cases {
            let (result, _) = read_all(script, None);
            assert_eq!(result.unwrap(), expected);
        }
    }

    #[test]
    fn drops_unsolicited_lines_wherever_they_appear() {
        let (result, r) = read_all(
            b"^RSSI:12\r\n+CPIN: READY\r\n^BOOT:1,0\r\nOK\r\n",
            Some("+CPIN: "),
        );
        assert_eq!(result.unwrap(), AtResponse::Ok);
        assert_eq!(r.line_count(), 2);
        assert_eq!(r.line(0).unwrap(), "+CPIN: READY");
        assert_eq!(r.line(1).unwrap(), "OK");
        assert_eq!(r.result_line().unwrap(), "+CPIN: READY");
    }

    #[test]
    fn lines_contain_no_line_terminators() {
        let (_, r) = read_all(b"\r\n\r\nfirst\r\r\n\nsecond\nOK\r\n", None);
        for line in r.lines() {
            assert!(!line.contains('\r'));
            assert!(!line.contains('\n'));
            assert!(!line.is_empty());
        }
        assert_eq!(r.line_count(), 3);
        assert_eq!(r.line(0).unwrap(), "first");
        assert_eq!(r.line(1).unwrap(), "second");
    }

    #[test]
    fn records_first_matching_result_line_only() {
        let (result, r) = read_all(
            b"+COPS: 0,0,\"FONIC\",2\r\n+COPS: 1,1,\"OTHER\",2\r\nOK\r\n",
            Some("+COPS: "),
        );
        assert_eq!(result.unwrap(), AtResponse::Ok);
        assert_eq!(r.result_line().unwrap(), "+COPS: 0,0,\"FONIC\",2");
    }

    #[test]
    fn times_out_on_silence() {
        let (_far, near) = tty_pair();
        let mut r = ReadBuffer::new();
        let started = Instant::now();
        let result = get(near.as_fd(), &mut r, None, Duration::from_millis(200));
        assert!(matches!(result, Err(ReadError::TimedOut)));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn times_out_when_response_never_terminates() {
        let (mut far, near) = tty_pair();
        far.write_all(b"partial line without terminator").unwrap();
        let mut r = ReadBuffer::new();
        let result = get(near.as_fd(), &mut r, None, Duration::from_millis(200));
        assert!(matches!(result, Err(ReadError::TimedOut)));
    }

    #[test]
    fn overflows_when_byte_budget_is_exhausted() {
        let (mut far, near) = tty_pair();
        far.write_all(&[b'x'; 600]).unwrap();
        let mut r = ReadBuffer::new();
        let result = get(near.as_fd(), &mut r, None, TIMEOUT);
        assert!(matches!(result, Err(ReadError::Overflow)));
    }

    #[test]
    fn overflows_when_line_budget_is_exhausted() {
        let (mut far, near) = tty_pair();
        for i in 0..20 {
            far.write_all(format!("line{i}\r\n").as_bytes()).unwrap();
        }
        let mut r = ReadBuffer::new();
        let result = get(near.as_fd(), &mut r, None, TIMEOUT);
        assert!(matches!(result, Err(ReadError::Overflow)));
    }

    #[test]
    fn flatten_quotes_and_joins_lines() {
        let (result, r) = read_all(b"+CPIN: READY\r\nOK\r\n", None);
        assert_eq!(result.unwrap(), AtResponse::Ok);
        assert_eq!(r.flatten(), "\"+CPIN: READY\", \"OK\"");
        // Flattening has no side effects on the buffer.
        assert_eq!(r.flatten(), "\"+CPIN: READY\", \"OK\"");
    }

    #[test]
    fn flatten_of_single_line_has_no_separator() {
        let (_, r) = read_all(b"OK\r\n", None);
        assert_eq!(r.flatten(), "\"OK\"");
    }
}
