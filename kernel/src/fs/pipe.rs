//! Kernel pipe objects for inter-process and shell pipeline communication.
//!
//! Provides a unidirectional byte stream between a writer and a reader.
//! Used by the shell's `|` operator and the `pipe` syscall.

#![allow(dead_code)]

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use spin::Mutex;

use super::{FileOps, Metadata, NodeKind};
use crate::error::{FsError, KernelError, KernelResult};

use crate::config::PIPE_CAPACITY;

/// Internal shared state of a pipe.
struct PipeInner {
    /// Data buffer.
    buffer: VecDeque<u8>,
    /// Maximum capacity in bytes.
    capacity: usize,
    /// True when the write end has been closed.
    write_closed: bool,
    /// True when the read end has been closed.
    read_closed: bool,
}

impl PipeInner {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            write_closed: false,
            read_closed: false,
        }
    }
}

/// A handle to the shared pipe state.
type PipeState = Arc<Mutex<PipeInner>>;

/// The read end of a kernel pipe.
pub struct PipeReader {
    inner: PipeState,
}

/// The write end of a kernel pipe.
pub struct PipeWriter {
    inner: PipeState,
}

/// Create a new pipe pair `(reader, writer)`.
pub fn create_pipe() -> Result<(PipeReader, PipeWriter), KernelError> {
    create_pipe_with_capacity(PIPE_CAPACITY)
}

/// Create a pipe pair with a custom capacity.
pub fn create_pipe_with_capacity(capacity: usize) -> Result<(PipeReader, PipeWriter), KernelError> {
    let inner = Arc::new(Mutex::new(PipeInner::new(capacity)));
    Ok((
        PipeReader {
            inner: inner.clone(),
        },
        PipeWriter { inner },
    ))
}

impl PipeReader {
    /// Read up to `buf.len()` bytes from the pipe.
    ///
    /// Returns the number of bytes read. Returns 0 when the write end is
    /// closed and the buffer is empty (EOF). Spins briefly if the buffer is
    /// empty but the write end is still open.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        loop {
            {
                let mut pipe = self.inner.lock();
                if !pipe.buffer.is_empty() {
                    let to_read = buf.len().min(pipe.buffer.len());
                    for byte in buf.iter_mut().take(to_read) {
                        *byte = pipe.buffer.pop_front().unwrap_or(0);
                    }
                    return Ok(to_read);
                }
                if pipe.write_closed {
                    return Ok(0); // EOF
                }
                if pipe.read_closed {
                    return Ok(0);
                }
            }
            // Buffer empty, write end still open: halt-and-wait, per the
            // blocking-I/O suspension point the concurrency model allows.
            crate::arch::x86::enable_interrupts();
            crate::arch::x86::halt();
        }
    }

    /// Non-blocking read: return immediately if no data available.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut pipe = self.inner.lock();
        if pipe.buffer.is_empty() {
            if pipe.write_closed {
                return Ok(0); // EOF
            }
            return Err(KernelError::WouldBlock);
        }
        let to_read = buf.len().min(pipe.buffer.len());
        for byte in buf.iter_mut().take(to_read) {
            *byte = pipe.buffer.pop_front().unwrap_or(0);
        }
        Ok(to_read)
    }

    /// Close the read end.
    pub fn close(&self) {
        self.inner.lock().read_closed = true;
    }

    /// Check if there is data available to read.
    pub fn has_data(&self) -> bool {
        !self.inner.lock().buffer.is_empty()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lets a pipe end sit in a task's fd table like any other open file.
/// The offset `FileOps::read`/`write` pass in is ignored - a pipe has no
/// seek position, only FIFO order.
impl FileOps for PipeReader {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.read(buf)
    }
    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(FsError::NotSupported.into())
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(Metadata { kind: NodeKind::Fifo, size: 0, mode: 0o600, links: 1, inode: 0 })
    }
    fn poll(&self) -> super::PollEvents {
        super::PollEvents { readable: self.has_data(), writable: false }
    }
}

impl PipeWriter {
    /// Write data to the pipe, atomically: either every byte of `data`
    /// lands in the buffer or none does.
    ///
    /// A write larger than the pipe's total capacity can never be
    /// serviced atomically and fails immediately with
    /// [`FsError::FileTooLarge`] (`EFBIG`), regardless of how much is
    /// currently free - this matches a non-reading peer never being able
    /// to drain enough room for it. A write within capacity blocks
    /// (halt-and-wait, same suspension point as `PipeReader::read`) until
    /// enough room opens up, then copies the whole buffer in at once.
    pub fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        loop {
            let mut pipe = self.inner.lock();
            if pipe.read_closed {
                return Err(KernelError::BrokenPipe);
            }
            if pipe.write_closed {
                return Err(KernelError::BrokenPipe);
            }
            if data.len() > pipe.capacity {
                return Err(FsError::FileTooLarge.into());
            }
            let available = pipe.capacity.saturating_sub(pipe.buffer.len());
            if available < data.len() {
                drop(pipe);
                crate::arch::x86::enable_interrupts();
                crate::arch::x86::halt();
                continue;
            }
            for &byte in data {
                pipe.buffer.push_back(byte);
            }
            return Ok(data.len());
        }
    }

    /// Close the write end.
    pub fn close(&self) {
        self.inner.lock().write_closed = true;
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl FileOps for PipeWriter {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(FsError::NotSupported.into())
    }
    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        self.write(buf)
    }
    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(Metadata { kind: NodeKind::Fifo, size: 0, mode: 0o600, links: 1, inode: 0 })
    }
    fn poll(&self) -> super::PollEvents {
        super::PollEvents { readable: false, writable: true }
    }
}

/// Capture all output written to a pipe writer and return it as bytes.
///
/// This is a helper for the shell to capture command output for piping
/// and command substitution. The writer should already be closed.
pub fn drain_pipe(reader: &PipeReader) -> Vec<u8> {
    let mut result = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => result.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_pipe_basic_read_write() -> Result<(), KernelError> {
        let (reader, writer) = create_pipe()?;
        writer.write(b"hello")?;
        writer.close();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        Ok(())
    }

    #[test_case]
    fn test_pipe_eof_after_close() -> Result<(), KernelError> {
        let (reader, writer) = create_pipe()?;
        writer.close();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf)?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[test_case]
    fn test_pipe_broken_pipe() -> Result<(), KernelError> {
        let (reader, writer) = create_pipe()?;
        reader.close();
        let result = writer.write(b"data");
        assert!(result.is_err());
        Ok(())
    }

    #[test_case]
    fn test_pipe_write_past_capacity_fails_with_efbig() -> Result<(), KernelError> {
        let (_reader, writer) = create_pipe_with_capacity(16)?;
        let result = writer.write(&[b'x'; 17]);
        assert!(matches!(result, Err(KernelError::FsError(FsError::FileTooLarge))));
        Ok(())
    }

    #[test_case]
    fn test_pipe_write_exactly_at_capacity_succeeds() -> Result<(), KernelError> {
        let (reader, writer) = create_pipe_with_capacity(16)?;
        let data = [b'y'; 16];
        let n = writer.write(&data)?;
        assert_eq!(n, 16);
        writer.close();
        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf)?;
        assert_eq!(n, 16);
        assert_eq!(&buf[..16], &data[..]);
        Ok(())
    }

    #[test_case]
    fn test_drain_pipe() -> Result<(), KernelError> {
        let (reader, writer) = create_pipe()?;
        writer.write(b"hello ")?;
        writer.write(b"world")?;
        writer.close();
        let data = drain_pipe(&reader);
        assert_eq!(&data, b"hello world");
        Ok(())
    }
}
