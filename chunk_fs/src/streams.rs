use crate::chunked_file::ChunkedFile;
use crate::error::{FsError, FsResult};
use crate::now_millis;
use log::warn;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Seeking past the end grows the file by zero chunks of at most this size.
pub const SEEK_GROW_PIECE: usize = 5 * 1024;

fn require_regular_file(file: &ChunkedFile) -> FsResult<()> {
    if !file.exists()? {
        return Err(FsError::NotFound(file.absolute_path()));
    }
    if file.is_directory()? {
        return Err(FsError::InvalidState(format!(
            "{} is a directory",
            file.absolute_path()
        )));
    }
    Ok(())
}

/// Reads whole chunks in order, starting from the chunk holding `start`.
/// The first missing chunk number ends the stream.
pub struct ChunkInputStream {
    file: Arc<ChunkedFile>,
    next_chunk: u64,
    buffer: Vec<u8>,
    offset: usize,
    // bytes to drop from the first loaded chunk
    skip: usize,
    eof: bool,
}

impl ChunkInputStream {
    pub(crate) fn open(file: Arc<ChunkedFile>, start: u64) -> FsResult<Self> {
        require_regular_file(&file)?;
        file.set_last_access_time(now_millis())?;

        let mut stream = Self {
            file,
            next_chunk: 1,
            buffer: Vec::new(),
            offset: 0,
            skip: 0,
            eof: false,
        };
        if start > 0 {
            match stream.file.locate_chunk(start)? {
                Some(location) if location.contains(start) => {
                    stream.next_chunk = location.chunk_number;
                    stream.skip = (start - location.start) as usize;
                }
                _ => stream.eof = true,
            }
        }
        Ok(stream)
    }

    pub fn file(&self) -> &Arc<ChunkedFile> {
        &self.file
    }
}

impl Read for ChunkInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.buffer.len() {
            if self.eof {
                return Ok(0);
            }
            match self.file.get_chunk(self.next_chunk)? {
                Some(data) => {
                    self.offset = self.skip.min(data.len());
                    self.skip = 0;
                    self.buffer = data;
                    self.next_chunk += 1;
                }
                None => {
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.buffer.len() - self.offset);
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// Buffers up to one chunk and appends it as a single chunk on flush.
pub struct ChunkOutputStream {
    file: Arc<ChunkedFile>,
    buffer: Vec<u8>,
    capacity: usize,
    closed: bool,
}

impl ChunkOutputStream {
    /// Creates the file when missing; without `append` existing content is
    /// dropped first.
    pub(crate) fn open(file: Arc<ChunkedFile>, append: bool) -> FsResult<Self> {
        if file.exists()? {
            if file.is_directory()? {
                return Err(FsError::InvalidState(format!(
                    "cannot write to directory {}",
                    file.absolute_path()
                )));
            }
            if !append {
                file.truncate()?;
            }
        } else {
            file.create_new_file()?;
        }
        let capacity = file.factory().chunk_size();
        Ok(Self {
            file,
            buffer: Vec::with_capacity(capacity),
            capacity,
            closed: false,
        })
    }

    fn flush_buffer(&mut self) -> FsResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.append_data(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn close(mut self) -> FsResult<()> {
        self.closed = true;
        self.flush_buffer()
    }
}

impl Write for ChunkOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.capacity - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        if self.buffer.len() == self.capacity {
            self.flush_buffer()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_buffer()?)
    }
}

impl Drop for ChunkOutputStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush_buffer() {
            warn!(
                "ChunkOutputStream: flush {} on drop failed! {}",
                self.file.absolute_path(),
                e
            );
        }
    }
}

/// Sequential reader with a movable file pointer.
pub struct ChunkSeekableReader {
    file: Arc<ChunkedFile>,
    position: u64,
    inner: Option<ChunkInputStream>,
}

impl ChunkSeekableReader {
    pub(crate) fn open(file: Arc<ChunkedFile>) -> FsResult<Self> {
        require_regular_file(&file)?;
        Ok(Self {
            file,
            position: 0,
            inner: None,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn grow(&self, mut length: u64, target: u64) -> FsResult<()> {
        while length < target {
            let piece = (target - length).min(SEEK_GROW_PIECE as u64) as usize;
            self.file.append_data(&vec![0u8; piece])?;
            length += piece as u64;
        }
        Ok(())
    }
}

impl Read for ChunkSeekableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inner.is_none() {
            self.inner = Some(ChunkInputStream::open(self.file.clone(), self.position)?);
        }
        let n = match self.inner.as_mut() {
            Some(inner) => inner.read(buf)?,
            None => 0,
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ChunkSeekableReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let length = self.file.length()?;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => length.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "negative seek position"))?;

        if target > length {
            self.grow(length, target)?;
        }
        if target != self.position {
            self.inner = None;
        }
        self.position = target;
        Ok(target)
    }
}
