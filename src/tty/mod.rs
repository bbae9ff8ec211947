//! Serial control channel.
//!
//! Opens and configures the modem's control TTY as a raw 8-N-1 line and
//! provides the command writer plus the AT response reader. The reader lives
//! in [`reader`]; everything here is the thin layer over the device itself.

mod reader;

pub use self::reader::{get, ReadBuffer, ReadError};

use libc::{c_int, c_void, size_t, ssize_t};
use std::{
    fs::OpenOptions,
    io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};
use tracing::trace;

/// Final response codes a modem may terminate an answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtResponse {
    Ok,
    Connect,
    Error,
    CmeError,
    NoDialtone,
    Busy,
    NoCarrier,
    /// Huawei-specific.
    NotSupported,
}

impl AtResponse {
    const TERMINATORS: [(&'static str, AtResponse); 8] = [
        ("OK", AtResponse::Ok),
        ("CONNECT", AtResponse::Connect),
        ("ERROR", AtResponse::Error),
        ("+CME ERROR", AtResponse::CmeError),
        ("NO DIALTONE", AtResponse::NoDialtone),
        ("BUSY", AtResponse::Busy),
        ("NO CARRIER", AtResponse::NoCarrier),
        ("COMMAND NOT SUPPORT", AtResponse::NotSupported),
    ];

    /// Classify a completed response line; returns the terminator the line
    /// begins with, if any.
    pub(crate) fn classify(line: &[u8]) -> Option<Self> {
        Self::TERMINATORS
            .iter()
            .find(|(code, _)| line.starts_with(code.as_bytes()))
            .map(|&(_, response)| response)
    }

    pub fn as_str(self) -> &'static str {
        Self::TERMINATORS
            .iter()
            .find(|&&(_, response)| response == self)
            .map(|&(code, _)| code)
            .unwrap_or("")
    }
}

impl std::fmt::Display for AtResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open a serial device and configure it as a raw 8-N-1 control line.
///
/// The descriptor is non-blocking (the reader enforces timeouts through
/// poll), carries no controlling-terminal semantics, and is close-on-exec so
/// pppd does not inherit it. There is no observable "opened but not yet
/// configured" state: the descriptor is handed out only after tcsetattr.
pub fn open(path: &Path) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;
    let fd = file.as_raw_fd();

    let mut tio = unsafe { std::mem::zeroed::<libc::termios>() };
    unsafe { tcgetattr(fd, &mut tio)? };
    tio.c_cflag |= libc::CREAD | libc::CS8;
    tio.c_iflag |= libc::IGNPAR;
    tio.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;
    unsafe { tcsetattr(fd, libc::TCSANOW, &tio)? };

    Ok(file.into())
}

/// Transmit a fully formed command. The caller supplies the trailing
/// carriage return; a short write is an error.
pub fn put(fd: BorrowedFd<'_>, cmd: &str) -> io::Result<()> {
    trace!("writing: {}", cmd.trim_end());
    let written =
        unsafe { write(fd.as_raw_fd(), cmd.as_ptr().cast(), cmd.len())? };
    if written as usize != cmd.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write on control line",
        ));
    }
    Ok(())
}

/// Discard pending input.
///
/// Errors are ignored: test sessions run over socketpairs, which reject
/// tcflush, and a failed flush only risks reading a stale line.
pub fn flush_input(fd: BorrowedFd<'_>) {
    let _ = unsafe { tcflush(fd.as_raw_fd(), libc::TCIFLUSH) };
}

/// Switch a descriptor to non-blocking mode.
///
/// The reader drains the device until EAGAIN between polls; a descriptor we
/// did not open ourselves (the data line pppd hands us on stdin) must be
/// switched over first or the drain would block.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

unsafe fn tcgetattr(fd: c_int, termios: *mut libc::termios) -> io::Result<()> {
    if unsafe { libc::tcgetattr(fd, termios) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

unsafe fn tcsetattr(
    fd: c_int,
    optional_actions: c_int,
    termios: *const libc::termios,
) -> io::Result<()> {
    if unsafe { libc::tcsetattr(fd, optional_actions, termios) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

unsafe fn tcflush(fd: c_int, action: c_int) -> io::Result<()> {
    if unsafe { libc::tcflush(fd, action) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> io::Result<ssize_t> {
    let result = unsafe { libc::read(fd, buf, count) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> io::Result<ssize_t> {
    let result = unsafe { libc::write(fd, buf, count) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn poll_in(fd: c_int, timeout_ms: c_int) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLERR | libc::POLLHUP,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result > 0)
    }
}
