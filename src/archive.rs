//! Streams a linker reads package data through.
//!
//! Every loader exposes the package as one contiguous byte range. Loaders
//! that understand the compressed chunk map translate virtual offsets to
//! block-compressed regions of the underlying file.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Result, bail};
use fs_err as fs;
use sha1::{Digest, Sha1};
use tracing::{instrument, trace};

use crate::compression::{CompressionMethod, ECompressionFlags, FCompressedChunk, read_compressed};
use crate::error::LinkerError;
use crate::file_pool::FilePool;
use crate::ser::Archive;

/// Byte source behind a package linker.
pub trait Loader: Read + Seek + Send {
    fn name(&self) -> &str;
    fn total_size(&mut self) -> Result<u64>;
    /// Hint that `[offset, offset + size)` will be read soon. Returns whether
    /// the whole range is resident; `false` means "try again later".
    fn precache(&mut self, _offset: u64, _size: u64) -> Result<bool> {
        Ok(true)
    }
    /// Start translating reads through `chunks`. Returns `false` when the
    /// loader can't do that and the caller has to switch loaders.
    fn set_compression_map(&mut self, _chunks: &[FCompressedChunk], _flags: ECompressionFlags) -> Result<bool> {
        Ok(false)
    }
    /// Release the loader, performing any deferred integrity check.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type BoxedLoader = Archive<Box<dyn Loader>>;

fn io_err(err: anyhow::Error) -> std::io::Error {
    std::io::Error::other(err)
}

/// Plain buffered file reader.
pub struct FileLoader {
    name: String,
    reader: BufReader<fs::File>,
    len: u64,
}
impl FileLoader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|_| LinkerError::OpenFailed(path.display().to_string()))?;
        let len = file.metadata()?.len();
        Ok(Self {
            name: path.display().to_string(),
            reader: BufReader::new(file),
            len,
        })
    }
}
impl Read for FileLoader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}
impl Seek for FileLoader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}
impl Loader for FileLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn total_size(&mut self) -> Result<u64> {
        Ok(self.len)
    }
}

/// Whole package held in memory, optionally checked against a SHA1 when
/// closed.
pub struct MemoryLoader {
    name: String,
    cursor: Cursor<Vec<u8>>,
    expected_sha: Option<[u8; 20]>,
}
impl MemoryLoader {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            cursor: Cursor::new(data),
            expected_sha: None,
        }
    }
    pub fn with_sha(name: impl Into<String>, data: Vec<u8>, expected: [u8; 20]) -> Self {
        Self {
            expected_sha: Some(expected),
            ..Self::new(name, data)
        }
    }
    pub fn data(&self) -> &[u8] {
        self.cursor.get_ref()
    }
}
impl Read for MemoryLoader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}
impl Seek for MemoryLoader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}
impl Loader for MemoryLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn total_size(&mut self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
    fn close(&mut self) -> Result<()> {
        if let Some(expected) = self.expected_sha.take() {
            let actual: [u8; 20] = Sha1::digest(self.cursor.get_ref()).into();
            if actual != expected {
                return Err(LinkerError::HashMismatch {
                    filename: self.name.clone(),
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Where the async loader fetches raw bytes from.
#[derive(Clone)]
pub enum AsyncSource {
    File(FilePool),
    Memory(Arc<Vec<u8>>),
}
impl AsyncSource {
    fn len(&self) -> u64 {
        match self {
            AsyncSource::File(pool) => pool.len(),
            AsyncSource::Memory(data) => data.len() as u64,
        }
    }
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            AsyncSource::File(pool) => Ok(pool.acquire()?.read_at(offset, len)?),
            AsyncSource::Memory(data) => {
                let start = offset as usize;
                match data.get(start..start + len) {
                    Some(slice) => Ok(slice.to_vec()),
                    None => bail!("read past end of buffer ({start} + {len} > {})", data.len()),
                }
            }
        }
    }
}

const ASYNC_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum SegmentKind {
    Raw { offset: u64 },
    Compressed { offset: u64, size: usize },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: u64,
    len: u64,
    kind: SegmentKind,
}

#[derive(Default)]
struct SegmentCache {
    resident: HashMap<usize, Arc<Vec<u8>>>,
    pending: HashSet<usize>,
}

/// Streaming reader that services precache requests on the rayon pool and
/// understands the compressed chunk map.
pub struct AsyncLoader {
    name: String,
    source: AsyncSource,
    segments: Arc<Vec<Segment>>,
    method: Option<CompressionMethod>,
    cache: Arc<(Mutex<SegmentCache>, Condvar)>,
    pos: u64,
}
impl AsyncLoader {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let name = path.display().to_string();
        let pool = FilePool::new(path, rayon::current_num_threads()).map_err(|_| LinkerError::OpenFailed(name.clone()))?;
        Ok(Self::new(name, AsyncSource::File(pool)))
    }
    pub fn new(name: impl Into<String>, source: AsyncSource) -> Self {
        let segments = raw_segments(0, source.len());
        Self {
            name: name.into(),
            source,
            segments: Arc::new(segments),
            method: None,
            cache: Default::default(),
            pos: 0,
        }
    }

    fn segment_at(&self, pos: u64) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.start + s.len <= pos);
        (idx < self.segments.len() && self.segments[idx].start <= pos).then_some(idx)
    }

    fn fetch(source: &AsyncSource, segment: Segment, method: Option<CompressionMethod>) -> Result<Vec<u8>> {
        match segment.kind {
            SegmentKind::Raw { offset } => source.read_at(offset, segment.len as usize),
            SegmentKind::Compressed { offset, size } => {
                let raw = source.read_at(offset, size)?;
                let flags = method.map(|m| m.flags()).unwrap_or(ECompressionFlags::ZLIB);
                let data = read_compressed(&mut Archive::new(Cursor::new(raw)), flags)?;
                if data.len() as u64 != segment.len {
                    bail!("compressed chunk decompressed to {} bytes, expected {}", data.len(), segment.len);
                }
                Ok(data)
            }
        }
    }

    /// Return the resident data of segment `idx`, waiting for a pending
    /// background fetch or fetching synchronously.
    fn resident(&self, idx: usize) -> Result<Arc<Vec<u8>>> {
        let (lock, condvar) = &*self.cache;
        let mut cache = lock.lock().unwrap();
        loop {
            if let Some(data) = cache.resident.get(&idx) {
                return Ok(data.clone());
            }
            if !cache.pending.contains(&idx) {
                break;
            }
            cache = condvar.wait(cache).unwrap();
        }
        drop(cache);
        let data = Arc::new(Self::fetch(&self.source, self.segments[idx], self.method)?);
        lock.lock().unwrap().resident.insert(idx, data.clone());
        Ok(data)
    }
}
impl Read for AsyncLoader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(idx) = self.segment_at(self.pos) else {
            return Ok(0);
        };
        let segment = self.segments[idx];
        let data = self.resident(idx).map_err(io_err)?;
        let offset = (self.pos - segment.start) as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}
impl Seek for AsyncLoader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let end = self.segments.last().map(|s| s.start + s.len).unwrap_or(0);
        let new = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => end as i64 + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if new < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}
impl Loader for AsyncLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn total_size(&mut self) -> Result<u64> {
        Ok(self.segments.last().map(|s| s.start + s.len).unwrap_or(0))
    }
    #[instrument(skip(self), name = "AsyncLoader::precache")]
    fn precache(&mut self, offset: u64, size: u64) -> Result<bool> {
        let end = offset + size.max(1);
        let first = self.segment_at(offset);
        let Some(first) = first else {
            return Ok(true);
        };
        let mut ready = true;
        let (lock, _) = &*self.cache;
        let mut cache = lock.lock().unwrap();
        for idx in first..self.segments.len() {
            if self.segments[idx].start >= end {
                break;
            }
            if cache.resident.contains_key(&idx) {
                continue;
            }
            ready = false;
            if !cache.pending.insert(idx) {
                continue;
            }
            let source = self.source.clone();
            let segment = self.segments[idx];
            let method = self.method;
            let shared = self.cache.clone();
            rayon::spawn(move || {
                let result = Self::fetch(&source, segment, method);
                let (lock, condvar) = &*shared;
                let mut cache = lock.lock().unwrap();
                cache.pending.remove(&idx);
                match result {
                    Ok(data) => {
                        cache.resident.insert(idx, Arc::new(data));
                    }
                    // left unresident; the blocking read path refetches and reports the error
                    Err(err) => trace!("background fetch of segment {idx} failed: {err:#}"),
                }
                condvar.notify_all();
            });
        }
        Ok(ready)
    }
    fn set_compression_map(&mut self, chunks: &[FCompressedChunk], flags: ECompressionFlags) -> Result<bool> {
        let method = CompressionMethod::from_flags(flags)?;
        let mut segments = vec![];
        let first = chunks.first().map(|c| c.uncompressed_offset.max(0) as u64).unwrap_or(0);
        // anything in front of the first chunk (the summary) is stored raw
        segments.extend(raw_segments(0, first));
        for chunk in chunks {
            if chunk.uncompressed_offset < 0 || chunk.compressed_offset < 0 || chunk.compressed_size < 0 {
                bail!("bad compressed chunk {chunk:?}");
            }
            segments.push(Segment {
                start: chunk.uncompressed_offset as u64,
                len: chunk.uncompressed_size.max(0) as u64,
                kind: SegmentKind::Compressed {
                    offset: chunk.compressed_offset as u64,
                    size: chunk.compressed_size as usize,
                },
            });
        }
        self.segments = Arc::new(segments);
        self.method = Some(method);
        let (lock, condvar) = &*self.cache;
        // wait out fetches keyed by the old segment layout
        let mut cache = lock.lock().unwrap();
        while !cache.pending.is_empty() {
            cache = condvar.wait(cache).unwrap();
        }
        *cache = SegmentCache::default();
        Ok(true)
    }
}

fn raw_segments(start: u64, end: u64) -> Vec<Segment> {
    let mut segments = vec![];
    let mut offset = start;
    while offset < end {
        let len = ASYNC_WINDOW.min(end - offset);
        segments.push(Segment {
            start: offset,
            len,
            kind: SegmentKind::Raw { offset },
        });
        offset += len;
    }
    segments
}

/// Side archive holding script patcher export bodies at virtual offsets.
#[derive(Debug, Default)]
pub struct PatchReader {
    data: Cursor<Vec<u8>>,
}
impl PatchReader {
    pub fn new() -> Self {
        Self::default()
    }
    /// Append `bytes`, returning the virtual offset they start at.
    pub fn add_patch(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.data.get_ref().len() as u64;
        self.data.get_mut().extend_from_slice(bytes);
        offset
    }
    pub fn len(&self) -> u64 {
        self.data.get_ref().len() as u64
    }
    pub fn is_empty(&self) -> bool {
        self.data.get_ref().is_empty()
    }
}
impl Read for PatchReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }
}
impl Seek for PatchReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.data.seek(pos)
    }
}
impl Loader for PatchReader {
    fn name(&self) -> &str {
        "<script patches>"
    }
    fn total_size(&mut self) -> Result<u64> {
        Ok(self.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compression::compress_whole;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_loader_sha() -> Result<()> {
        let data = b"package bytes".to_vec();
        let sha: [u8; 20] = Sha1::digest(&data).into();
        MemoryLoader::with_sha("ok.upk", data.clone(), sha).close()?;

        let mut bad = MemoryLoader::with_sha("bad.upk", data, [0; 20]);
        let err = bad.close().unwrap_err();
        assert_eq!(crate::error::error_kind(&err), crate::error::ErrorKind::Integrity);
        Ok(())
    }

    #[test]
    fn test_async_precache_then_read() -> Result<()> {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let mut loader = AsyncLoader::new("mem", AsyncSource::Memory(Arc::new(data.clone())));
        while !loader.precache(70_000, 100_000)? {
            std::thread::yield_now();
        }
        loader.seek(SeekFrom::Start(70_000))?;
        let mut buf = vec![0; 100_000];
        loader.read_exact(&mut buf)?;
        assert_eq!(buf, data[70_000..170_000]);
        assert_eq!(loader.total_size()?, 200_000);
        Ok(())
    }

    #[test]
    fn test_async_compression_map() -> Result<()> {
        // 16 raw header bytes, then one compressed chunk
        let header = vec![7u8; 16];
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 17) as u8).collect();
        let packed = compress_whole(&body)?;
        let mut file = header.clone();
        file.extend_from_slice(&packed);

        let chunk = FCompressedChunk {
            uncompressed_offset: 16,
            uncompressed_size: body.len() as i32,
            compressed_offset: 16,
            compressed_size: packed.len() as i32,
        };
        let mut loader = AsyncLoader::new("mem", AsyncSource::Memory(Arc::new(file)));
        assert!(loader.set_compression_map(&[chunk], ECompressionFlags::ZLIB)?);
        assert_eq!(loader.total_size()?, 16 + body.len() as u64);

        let mut all = vec![];
        loader.read_to_end(&mut all)?;
        assert_eq!(&all[..16], &header[..]);
        assert_eq!(&all[16..], &body[..]);
        Ok(())
    }

    #[test]
    fn test_patch_reader_offsets() -> Result<()> {
        let mut reader = PatchReader::new();
        assert_eq!(reader.add_patch(&[1, 2, 3]), 0);
        assert_eq!(reader.add_patch(&[4, 5]), 3);
        reader.seek(SeekFrom::Start(3))?;
        let mut buf = [0; 2];
        reader.read_exact(&mut buf)?;
        assert_eq!(buf, [4, 5]);
        Ok(())
    }
}
