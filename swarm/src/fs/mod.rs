use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
};
use crate::store::{FileSpan, StoreInfo};

pub mod disk;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

}

pub type Result<T> = std::result::Result<T, DiskError>;

// One open torrent file plus its span in the global byte space.
#[derive(Debug)]
struct MappedFile {
    span: FileSpan,
    handle: File,
}

// Translates global byte offsets into per-file reads and writes. Writes are
// buffered in a write-back cache and hit the disk sorted by offset; reads are
// satisfied from the cache when fully contained in a buffered entry.
#[derive(Debug)]
pub struct FileMapper {

    files: Vec<MappedFile>,

    // Buffered writes keyed by global offset. A BTreeMap flushes in
    // ascending offset order, which the OS sees as sequential I/O.
    cache: BTreeMap<u64, Vec<u8>>,

    cached_bytes: usize,

    cache_limit: usize,

}

impl FileMapper {

    // Opens every file once for read/write. Missing files are created sparse
    // at their declared length so allocation is instant.
    pub fn new(info: &StoreInfo, cache_limit: usize) -> Result<Self> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let mut files = Vec::with_capacity(info.files.len());
        for span in info.files.iter() {
            let path = info.output_dir.join(&span.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    std::fs::create_dir_all(subdir)?;
                }
            }

            let existed = path.exists();
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            if !existed {
                tracing::info!("created sparse file: {:?} ({} bytes)", path, span.length);
                handle.set_len(span.length)?;
            }

            files.push(MappedFile { span: span.clone(), handle });
        }

        Ok(Self {
            files,
            cache: BTreeMap::new(),
            cached_bytes: 0,
            cache_limit,
        })
    }

    // Buffers a write; flushes everything once the cache grows past the
    // limit. The data is considered accepted once it sits in the cache.
    pub fn write(&mut self, offset: u64, data: Vec<u8>) -> Result<()> {
        self.cached_bytes += data.len();
        if let Some(old) = self.cache.insert(offset, data) {
            self.cached_bytes -= old.len();
        }

        if self.cached_bytes >= self.cache_limit {
            tracing::debug!("write cache full ({} bytes), flushing", self.cached_bytes);
            self.flush()?;
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        // The cache wins when the requested range is fully contained in one
        // buffered entry; partial overlaps fall through to disk.
        if let Some((entry_offset, data)) = self.cache.range(..=offset).next_back() {
            let start = (offset - entry_offset) as usize;
            if start + len <= data.len() {
                return Ok(data[start..start + len].to_vec());
            }
        }
        self.read_from_disk(offset, len)
    }

    // Writes the buffered entries in ascending offset order.
    pub fn flush(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let cache = std::mem::take(&mut self.cache);
        self.cached_bytes = 0;
        for (offset, data) in cache {
            self.write_to_disk(offset, &data)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        for file in self.files.iter() {
            file.handle.sync_all()?;
        }
        Ok(())
    }

    fn write_to_disk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;

        for file in self.files.iter_mut() {
            let span = file.span.byte_range();
            if span.end <= offset {
                continue;
            }
            if span.start >= end {
                break;
            }

            let overlap_start = offset.max(span.start);
            let overlap_end = end.min(span.end);
            let in_file = overlap_start - span.start;
            let in_buf = (overlap_start - offset) as usize;
            let n = (overlap_end - overlap_start) as usize;

            file.handle.seek(SeekFrom::Start(in_file))?;
            file.handle.write_all(&data[in_buf..in_buf + n])?;
        }
        Ok(())
    }

    fn read_from_disk(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let end = offset + len as u64;

        for file in self.files.iter_mut() {
            let span = file.span.byte_range();
            if span.end <= offset {
                continue;
            }
            if span.start >= end {
                break;
            }

            let overlap_start = offset.max(span.start);
            let overlap_end = end.min(span.end);
            let in_file = overlap_start - span.start;
            let in_buf = (overlap_start - offset) as usize;
            let n = (overlap_end - overlap_start) as usize;

            file.handle.seek(SeekFrom::Start(in_file))?;
            // A file on disk may be shorter than its span (no resume data and
            // an interrupted earlier run); the shortfall reads as zeroes and
            // fails hash verification downstream.
            let mut filled = 0;
            while filled < n {
                let read = file.handle.read(&mut out[in_buf + filled..in_buf + n])?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
        }
        Ok(out)
    }
}
