use fs_err as fs;
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

/// A file handle borrowed from a [`FilePool`]; returned on drop.
pub struct PooledFileHandle {
    file: Option<fs::File>,
    pool: Arc<FilePoolInner>,
}

impl Drop for PooledFileHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let mut state = self.pool.state.lock().unwrap();
            state.available_files.push_back(file);
            self.pool.condvar.notify_one();
        }
    }
}

impl PooledFileHandle {
    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("pooled handle already released"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

struct PoolState {
    available_files: VecDeque<fs::File>,
    active_count: usize,
}

struct FilePoolInner {
    path: PathBuf,
    state: Mutex<PoolState>,
    max_handles: usize,
    condvar: Condvar,
}

/// Bounded set of read handles on one package file, shared by the async
/// loader's background reads.
#[derive(Clone)]
pub struct FilePool {
    inner: Arc<FilePoolInner>,
    len: u64,
}

impl FilePool {
    pub fn new<P: Into<PathBuf>>(path: P, max_handles: usize) -> std::io::Result<Self> {
        let path = path.into();
        // open once up front so a missing file fails here, not on a worker
        let len = fs::File::open(&path)?.metadata()?.len();

        Ok(FilePool {
            inner: Arc::new(FilePoolInner {
                path,
                state: Mutex::new(PoolState {
                    available_files: VecDeque::new(),
                    active_count: 0,
                }),
                max_handles: max_handles.max(1),
                condvar: Condvar::new(),
            }),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn acquire(&self) -> std::io::Result<PooledFileHandle> {
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if let Some(file) = state.available_files.pop_front() {
                return Ok(PooledFileHandle {
                    file: Some(file),
                    pool: self.inner.clone(),
                });
            }

            if state.active_count < self.inner.max_handles {
                let file = fs::File::open(&self.inner.path)?;
                state.active_count += 1;
                return Ok(PooledFileHandle {
                    file: Some(file),
                    pool: self.inner.clone(),
                });
            }

            state = self.inner.condvar.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pooled_reads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");
        fs::write(&path, (0u8..=255).collect::<Vec<_>>())?;

        let pool = FilePool::new(&path, 1)?;
        assert_eq!(pool.len(), 256);
        let mut a = pool.acquire()?;
        assert_eq!(a.read_at(10, 3)?, vec![10, 11, 12]);
        drop(a);
        // the single handle is reused after being returned
        let mut b = pool.acquire()?;
        assert_eq!(b.read_at(250, 6)?, vec![250, 251, 252, 253, 254, 255]);
        Ok(())
    }
}
