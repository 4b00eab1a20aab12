use crate::chunked_file::ChunkedFile;
use crate::error::{FsError, FsResult};
use log::{debug, warn};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// The resident chunk of a controller.
struct Chunk {
    start: u64,
    // 0 until a new chunk is saved
    chunk_number: u64,
    data: Vec<u8>,
    declared_size: usize,
    is_new: bool,
    is_dirty: bool,
    max_write_offset: Option<usize>,
}

impl Chunk {
    fn existing(start: u64, chunk_number: u64, data: Vec<u8>) -> Self {
        Self {
            start,
            chunk_number,
            declared_size: data.len(),
            data,
            is_new: false,
            is_dirty: false,
            max_write_offset: None,
        }
    }

    fn fresh(start: u64, capacity: usize) -> Self {
        Self {
            start,
            chunk_number: 0,
            data: vec![0u8; capacity],
            declared_size: capacity,
            is_new: true,
            is_dirty: false,
            max_write_offset: None,
        }
    }

    fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.start + self.data.len() as u64
    }

    fn written_len(&self) -> usize {
        self.max_write_offset.map_or(0, |m| m + 1)
    }

    // None past the written prefix of a new chunk
    fn read(&self, pos: u64) -> Option<u8> {
        if !self.contains(pos) {
            return None;
        }
        let offset = (pos - self.start) as usize;
        if self.is_new && offset >= self.written_len() {
            return None;
        }
        Some(self.data[offset])
    }

    fn write(&mut self, pos: u64, byte: u8) {
        let offset = (pos - self.start) as usize;
        self.data[offset] = byte;
        self.is_dirty = true;
        self.max_write_offset = Some(self.max_write_offset.map_or(offset, |m| m.max(offset)));
    }
}

/// Byte-addressable access to a chunked file through one resident chunk.
///
/// Not for concurrent use; separate controllers on the same file are fine
/// since all durable state lives in the chunk table.
pub struct RandomAccessController {
    file: Arc<ChunkedFile>,
    chunk_size: usize,
    current: Option<Chunk>,
}

impl RandomAccessController {
    pub(crate) fn open(file: Arc<ChunkedFile>) -> FsResult<Self> {
        if !file.exists()? {
            return Err(FsError::NotFound(file.absolute_path()));
        }
        if file.is_directory()? {
            return Err(FsError::InvalidState(format!(
                "{} is a directory",
                file.absolute_path()
            )));
        }
        let chunk_size = file.factory().chunk_size();
        Ok(Self {
            file,
            chunk_size,
            current: None,
        })
    }

    pub fn file(&self) -> &Arc<ChunkedFile> {
        &self.file
    }

    /// Stored length plus the unsaved prefix of a new resident chunk.
    pub fn length(&self) -> FsResult<u64> {
        let mut length = self.file.length_refreshed()?;
        if let Some(chunk) = &self.current {
            if chunk.is_new && chunk.is_dirty {
                length += chunk.written_len() as u64;
            }
        }
        Ok(length)
    }

    fn holds(&self, pos: u64) -> bool {
        self.current.as_ref().map_or(false, |c| c.contains(pos))
    }

    /// Makes the stored chunk covering `pos` resident. When that chunk has
    /// vanished meanwhile, the chunk before it is loaded instead.
    fn load_covering(&mut self, pos: u64) -> FsResult<bool> {
        let Some(mut location) = self.file.locate_chunk(pos)? else {
            return Ok(false);
        };
        let mut data = self.file.get_chunk(location.chunk_number)?;
        if data.is_none() && location.start > 0 {
            debug!(
                "RandomAccessController: chunk {} of {} vanished, using the previous one",
                location.chunk_number,
                self.file.absolute_path()
            );
            if let Some(previous) = self.file.locate_chunk(location.start - 1)? {
                location = previous;
                data = self.file.get_chunk(location.chunk_number)?;
            }
        }
        let Some(data) = data else {
            return Ok(false);
        };
        self.current = Some(Chunk::existing(location.start, location.chunk_number, data));
        Ok(self.holds(pos))
    }

    /// `None` at or past the end, and inside a new chunk past its last
    /// written byte.
    pub fn read(&mut self, pos: u64) -> FsResult<Option<u8>> {
        if !self.holds(pos) {
            self.save()?;
            if pos >= self.file.length_refreshed()? {
                return Ok(None);
            }
            if !self.load_covering(pos)? {
                return Ok(None);
            }
        }
        Ok(self.current.as_ref().and_then(|c| c.read(pos)))
    }

    /// Writes past the end grow the file; any gap reads back as zeros.
    pub fn write(&mut self, pos: u64, byte: u8) -> FsResult<()> {
        if !self.holds(pos) {
            self.save()?;
            let length = self.file.length_refreshed()?;
            if pos < length {
                if !self.load_covering(pos)? {
                    return Err(FsError::InvalidState(format!(
                        "no chunk of {} covers offset {}",
                        self.file.absolute_path(),
                        pos
                    )));
                }
            } else {
                let start = self.fill_until_reachable(length, pos)?;
                self.current = Some(Chunk::fresh(start, self.chunk_size));
            }
        }
        match self.current.as_mut() {
            Some(chunk) => {
                chunk.write(pos, byte);
                Ok(())
            }
            None => Err(FsError::InvalidState(format!(
                "no resident chunk for offset {}",
                pos
            ))),
        }
    }

    // appends zero chunks until `pos` falls inside the chunk starting at the end
    fn fill_until_reachable(&mut self, mut length: u64, pos: u64) -> FsResult<u64> {
        let chunk_size = self.chunk_size as u64;
        while pos >= length + chunk_size {
            self.file.append_data(&vec![0u8; self.chunk_size])?;
            length += chunk_size;
        }
        Ok(length)
    }

    /// Writes the resident chunk back if dirty.
    pub fn save(&mut self) -> FsResult<()> {
        let Some(chunk) = self.current.as_mut() else {
            return Ok(());
        };
        if !chunk.is_dirty {
            return Ok(());
        }
        if chunk.is_new {
            // another writer may have appended since this chunk was placed
            let stored = self.file.length_refreshed()?;
            if stored != chunk.start {
                return Err(FsError::InvalidState(format!(
                    "{} is {} bytes long, new chunk expected it at {}",
                    self.file.absolute_path(),
                    stored,
                    chunk.start
                )));
            }
            let used = chunk.written_len();
            chunk.data.truncate(used);
            chunk.chunk_number = self.file.append_data(&chunk.data)?;
            chunk.declared_size = used;
            chunk.is_new = false;
        } else {
            if chunk.data.len() != chunk.declared_size {
                return Err(FsError::InvalidState(format!(
                    "chunk {} resized from {} to {}",
                    chunk.chunk_number,
                    chunk.declared_size,
                    chunk.data.len()
                )));
            }
            self.file.update_chunk(chunk.chunk_number, &chunk.data)?;
        }
        chunk.is_dirty = false;
        chunk.max_write_offset = None;
        self.file.invalidate_length();
        Ok(())
    }

    pub fn flush(&mut self) -> FsResult<()> {
        self.save()
    }

    pub fn set_length(&mut self, new_length: u64) -> FsResult<()> {
        self.save()?;
        self.current = None;
        let length = self.file.length_refreshed()?;
        if new_length > length {
            self.expand_to(length, new_length)
        } else if new_length < length {
            self.shrink_to(new_length)
        } else {
            Ok(())
        }
    }

    fn expand_to(&mut self, mut length: u64, target: u64) -> FsResult<()> {
        while length < target {
            let piece = (target - length).min(self.chunk_size as u64) as usize;
            self.file.append_data(&vec![0u8; piece])?;
            length += piece as u64;
        }
        Ok(())
    }

    fn shrink_to(&mut self, target: u64) -> FsResult<()> {
        if target == 0 {
            return self.file.truncate();
        }
        // the chunk holding the first byte to drop
        let location = self.file.locate_chunk(target)?.ok_or_else(|| {
            FsError::InvalidState(format!("no chunk of {} covers {}", self.file.absolute_path(), target))
        })?;
        if location.start == target {
            self.file.delete_chunks_from(location.chunk_number)?;
            return Ok(());
        }

        let data = self
            .file
            .get_chunk(location.chunk_number)?
            .ok_or_else(|| FsError::InvalidState(format!("chunk {} vanished", location.chunk_number)))?;
        let keep = ((target - location.start) as usize).min(data.len());
        self.file.delete_chunks_from(location.chunk_number)?;
        self.file.append_data(&data[..keep])?;
        Ok(())
    }

    pub fn close(mut self) -> FsResult<()> {
        self.save()
    }
}

impl Drop for RandomAccessController {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!(
                "RandomAccessController: save {} on drop failed! {}",
                self.file.absolute_path(),
                e
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl AccessMode {
    pub fn parse(mode: &str) -> FsResult<Self> {
        match mode {
            "r" => Ok(AccessMode::Read),
            "rw" => Ok(AccessMode::ReadWrite),
            other => Err(FsError::InvalidParam(format!("bad access mode {}", other))),
        }
    }
}

/// File-pointer based `Read + Write + Seek` over a controller.
pub struct RandomAccessStream {
    controller: RandomAccessController,
    pointer: u64,
    mode: AccessMode,
}

impl RandomAccessStream {
    /// `"rw"` creates a missing file.
    pub(crate) fn open(file: Arc<ChunkedFile>, mode: &str) -> FsResult<Self> {
        let mode = AccessMode::parse(mode)?;
        if mode == AccessMode::ReadWrite && !file.exists()? {
            file.create_new_file()?;
        }
        Ok(Self {
            controller: RandomAccessController::open(file)?,
            pointer: 0,
            mode,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn file_pointer(&self) -> u64 {
        self.pointer
    }

    pub fn length(&self) -> FsResult<u64> {
        self.controller.length()
    }

    fn require_writable(&self) -> FsResult<()> {
        if self.mode != AccessMode::ReadWrite {
            return Err(FsError::InvalidState(format!(
                "{} opened read-only",
                self.controller.file().absolute_path()
            )));
        }
        Ok(())
    }

    /// The file pointer is pulled back when it lies past the new end.
    pub fn set_length(&mut self, length: u64) -> FsResult<()> {
        self.require_writable()?;
        self.controller.set_length(length)?;
        self.pointer = self.pointer.min(length);
        Ok(())
    }

    pub fn read_byte(&mut self) -> FsResult<Option<u8>> {
        let byte = self.controller.read(self.pointer)?;
        if byte.is_some() {
            self.pointer += 1;
        }
        Ok(byte)
    }

    pub fn write_byte(&mut self, byte: u8) -> FsResult<()> {
        self.require_writable()?;
        self.controller.write(self.pointer, byte)?;
        self.pointer += 1;
        Ok(())
    }

    pub fn close(self) -> FsResult<()> {
        self.controller.close()
    }
}

impl Read for RandomAccessStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.read_byte()? {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for RandomAccessStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            self.write_byte(*byte)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.controller.save()?)
    }
}

impl Seek for RandomAccessStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pointer.checked_add_signed(delta),
            SeekFrom::End(delta) => self.controller.length()?.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "negative seek position"))?;
        self.pointer = target;
        Ok(target)
    }
}
