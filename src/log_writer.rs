//! Signal-time log writer.
//!
//! A flat tag-length-value stream written into a fixed-capacity buffer the
//! reporter preallocates well before any crash, and flushed to an
//! already-open file descriptor with a single `write(2)` per record --
//! no heap allocation, no buffered-writer state, nothing that could
//! itself fault. This is a deliberately simpler shape than a directory-
//! indexed format that streams into a growable in-memory buffer and writes
//! its index at the end: that shape needs an allocator, which this crate
//! can't use once a signal has landed, so the format here is one flat
//! record per `write` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("record of {0} bytes does not fit in the remaining buffer capacity")]
    Enomem(usize),
    #[error("the write(2) syscall failed with errno {0}")]
    WriteFailed(i32),
    #[error("string payload exceeds the {0}-byte fixed limit")]
    StringTooLong(usize),
}

/// Record tags, analogous to a minidump stream type but far smaller in
/// number since this format only ever needs to represent what the cursor
/// and symbolicator produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordTag {
    Header = 1,
    Image = 2,
    Frame = 3,
    Symbol = 4,
    Exception = 5,
    SoftError = 6,
    Footer = 7,
}

const TAG_SIZE: usize = 2;
const LEN_SIZE: usize = 4;
const STRING_LIMIT: usize = 256;

/// Appends TLV records into a borrowed, fixed-size buffer. Every write is
/// checked against remaining capacity up front; a record that wouldn't
/// fit is rejected before any bytes are written, so a partially written
/// record never ends up in the buffer.
pub struct LogWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> LogWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Writes one TLV record. Fails with [`WriterError::Enomem`] (leaving
    /// the buffer unmodified) rather than writing a truncated record.
    pub fn write_record(&mut self, tag: RecordTag, payload: &[u8]) -> Result<(), WriterError> {
        let needed = TAG_SIZE + LEN_SIZE + payload.len();
        if needed > self.remaining() {
            return Err(WriterError::Enomem(needed));
        }

        let tag_bytes = (tag as u16).to_le_bytes();
        let len_bytes = (payload.len() as u32).to_le_bytes();

        self.buf[self.pos..self.pos + TAG_SIZE].copy_from_slice(&tag_bytes);
        self.pos += TAG_SIZE;
        self.buf[self.pos..self.pos + LEN_SIZE].copy_from_slice(&len_bytes);
        self.pos += LEN_SIZE;
        self.buf[self.pos..self.pos + payload.len()].copy_from_slice(payload);
        self.pos += payload.len();
        Ok(())
    }

    /// Writes a record whose payload is a bounded-length string, rejecting
    /// (not truncating) anything over [`STRING_LIMIT`] bytes -- silent
    /// truncation in a crash report is worse than a recorded soft error.
    pub fn write_string_record(&mut self, tag: RecordTag, s: &str) -> Result<(), WriterError> {
        if s.len() > STRING_LIMIT {
            return Err(WriterError::StringTooLong(STRING_LIMIT));
        }
        self.write_record(tag, s.as_bytes())
    }

    pub fn write_u64_record(&mut self, tag: RecordTag, value: u64) -> Result<(), WriterError> {
        self.write_record(tag, &value.to_le_bytes())
    }

    /// Flushes the written bytes to `fd` with a single `write(2)`. The fd
    /// must already be open (established well before the crash by
    /// [`crate::config::ReporterConfig`]); opening a file is not
    /// async-signal-safe and this function never attempts it.
    pub fn flush_to_fd(&self, fd: std::os::unix::io::RawFd) -> Result<(), WriterError> {
        let data = self.as_slice();
        let mut written = 0usize;
        while written < data.len() {
            // SAFETY: `fd` is caller-provided and assumed open; `data` is a
            // valid slice for its own length. `write` is listed async-signal-safe
            // in signal-safety(7).
            let n = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr().cast(),
                    data.len() - written,
                )
            };
            if n < 0 {
                // SAFETY: reading the thread-local errno right after a
                // failing syscall, before anything else can clobber it.
                let errno = unsafe { *libc::__error() };
                return Err(WriterError::WriteFailed(errno));
            }
            written += n as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_round_trip_into_the_buffer() {
        let mut storage = [0u8; 64];
        let mut writer = LogWriter::new(&mut storage);
        writer.write_u64_record(RecordTag::Frame, 0xdead_beef).unwrap();
        writer.write_string_record(RecordTag::Symbol, "-[Foo bar:]").unwrap();

        assert_eq!(writer.as_slice()[0..2], (RecordTag::Frame as u16).to_le_bytes());
        assert!(writer.len() > 0);
    }

    #[test]
    fn overflow_rejects_without_partial_write() {
        let mut storage = [0u8; 8];
        let mut writer = LogWriter::new(&mut storage);
        let before = writer.len();
        let result = writer.write_string_record(RecordTag::Symbol, "too long for this buffer");
        assert!(matches!(result, Err(WriterError::Enomem(_))));
        assert_eq!(writer.len(), before);
    }

    #[test]
    fn oversized_string_is_rejected_before_truncation() {
        let mut storage = [0u8; 4096];
        let mut writer = LogWriter::new(&mut storage);
        let long = "x".repeat(STRING_LIMIT + 1);
        let result = writer.write_string_record(RecordTag::Symbol, &long);
        assert!(matches!(result, Err(WriterError::StringTooLong(_))));
    }

    #[test]
    fn flush_writes_every_byte() {
        let mut storage = [0u8; 64];
        let mut writer = LogWriter::new(&mut storage);
        writer.write_u64_record(RecordTag::Header, 1).unwrap();

        let mut pipe_fds = [0i32; 2];
        // SAFETY: syscall, valid out-pointer for two fds.
        unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        writer.flush_to_fd(pipe_fds[1]).unwrap();

        let mut read_buf = [0u8; 64];
        // SAFETY: syscall, valid buffer and length.
        let n = unsafe {
            libc::read(pipe_fds[0], read_buf.as_mut_ptr().cast(), read_buf.len())
        };
        assert_eq!(n as usize, writer.len());
        // SAFETY: closing fds we own.
        unsafe {
            libc::close(pipe_fds[0]);
            libc::close(pipe_fds[1]);
        }
    }
}
