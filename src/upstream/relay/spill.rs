//! Temporary storage for response bytes the client has not taken yet.
//!
//! A single anonymous temp file used as a FIFO: appended at the write
//! offset, read back from the read offset. Once everything written has been
//! read back the file is truncated and both offsets restart at zero, so
//! the file only shrinks when the client has caught up completely.
//!
//! File I/O is synchronous and runs on the polling worker: writes land in
//! the page cache and reads are of data written moments before.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;

#[derive(Debug)]
pub struct SpillFile {
    file: File,
    write_pos: u64,
    read_pos: u64,
}

impl SpillFile {
    /// Create an unlinked temp file in `dir`, or the system temp dir.
    pub fn create(dir: Option<&Path>) -> io::Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            file,
            write_pos: 0,
            read_pos: 0,
        })
    }

    /// Bytes written and not yet read back.
    pub fn unread(&self) -> u64 {
        self.write_pos - self.read_pos
    }

    /// Bytes the file occupies on disk, read or not.
    pub fn disk_len(&self) -> u64 {
        self.write_pos
    }

    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(data)?;
        self.write_pos += data.len() as u64;
        Ok(())
    }

    /// Read back up to `max` bytes in write order.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        let n = self.unread().min(max as u64) as usize;
        let mut buf = vec![0u8; n];
        self.file.seek(SeekFrom::Start(self.read_pos))?;
        self.file.read_exact(&mut buf)?;
        self.read_pos += n as u64;

        if self.read_pos == self.write_pos {
            self.file.set_len(0)?;
            self.read_pos = 0;
            self.write_pos = 0;
        }
        Ok(Bytes::from(buf))
    }
}
