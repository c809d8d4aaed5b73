//! Typed JSON-lines channel over pipe file descriptors.
//!
//! Both ends of the worker control link use these: the supervisor writes
//! `ControlRequest`s and reads `WorkerEvent`s, the worker does the reverse.

use crate::error::{IngestError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size for both directions (16KB).
const BUFFER_SIZE: usize = 16 * 1024;

/// Owned pipe end with EINTR-safe reads and writes.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw file descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving end: one JSON message per line.
pub struct MessageReader<T> {
    reader: BufReader<PipeFd>,
    line: String,
    _message: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> MessageReader<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
            line: String::new(),
            _message: PhantomData,
        }
    }

    /// Read the next message. Returns `None` once the peer closes the pipe.
    ///
    /// Blank lines are skipped; a line that fails to parse is an error but
    /// leaves the reader usable.
    pub fn recv(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| IngestError::Worker(format!("Invalid control message: {}", e)));
        }
    }
}

/// Sending end: serializes each message onto its own line and flushes.
pub struct MessageWriter<T> {
    writer: BufWriter<PipeFd>,
    _message: PhantomData<fn(T)>,
}

impl<T: Serialize> MessageWriter<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
            _message: PhantomData,
        }
    }

    pub fn send(&mut self, message: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
