use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::error::{HiveError, HiveResult};

/// Byte-addressed storage holding one hive file (the primary or its log).
pub trait StorageBackend: Send {
    /// Fill `buf` from `offset`. Reading past the end is an `UnexpectedEof` error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    /// Write all of `data` at `offset`, extending the storage if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn len(&mut self) -> io::Result<u64>;
    /// Make all previous writes durable.
    fn flush(&mut self) -> io::Result<()>;

    /// The underlying file, if there is one. Mapped views need it.
    fn as_file(&self) -> Option<&File> {
        None
    }
}

/// A locked file on disk.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Open (or create) a file and take an exclusive advisory lock on it.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> HiveResult<Self> {
        use fs4::fs_std::FileExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(HiveError::Io)?;
        file.try_lock_exclusive().map_err(HiveError::Lock)?;
        Ok(Self { file })
    }

    /// Wrap an already-opened file without locking it.
    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn as_file(&self) -> Option<&File> {
        Some(&self.file)
    }
}

/// A flat in-memory image. Clones share the same image, so a caller can keep a handle to inspect
/// or damage what the hive wrote.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(image)),
        }
    }

    /// Copy out the current image.
    pub fn image(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Replace the current image.
    pub fn set_image(&self, image: Vec<u8>) {
        *self.data.lock() = image;
    }
}

impl StorageBackend for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let src = data
            .get(start..start + buf.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Source of the memory that pool-resident bins live in.
pub trait AllocBackend: Send + Sync {
    /// Get `size` bytes of zeroed memory.
    fn alloc(&self, size: usize) -> HiveResult<Box<[u8]>>;
    /// Give back memory previously returned by [`AllocBackend::alloc`].
    fn free(&self, mem: Box<[u8]>);
}

/// Heap-backed allocation with an optional quota on the total outstanding bytes.
#[derive(Debug, Default)]
pub struct HeapPool {
    quota: Option<usize>,
    used: AtomicUsize,
}

impl HeapPool {
    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl AllocBackend for HeapPool {
    fn alloc(&self, size: usize) -> HiveResult<Box<[u8]>> {
        let prev = self.used.fetch_add(size, Ordering::Relaxed);
        let exhausted = || {
            self.used.fetch_sub(size, Ordering::Relaxed);
            HiveError::ResourceExhausted { requested: size }
        };
        if let Some(quota) = self.quota {
            if prev.checked_add(size).map_or(true, |total| total > quota) {
                return Err(exhausted());
            }
        }
        // Allocation failure comes back as an error rather than aborting
        let mut mem = Vec::new();
        mem.try_reserve_exact(size).map_err(|_| exhausted())?;
        mem.resize(size, 0u8);
        Ok(mem.into_boxed_slice())
    }

    fn free(&self, mem: Box<[u8]>) {
        self.used.fetch_sub(mem.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pool_failure_is_an_error() {
        let pool = HeapPool::default();
        let mem = pool.alloc(4096).unwrap();
        assert!(mem.iter().all(|b| *b == 0));
        assert_eq!(pool.used(), 4096);

        let err = pool.alloc(usize::MAX).unwrap_err();
        println!("{}", err);
        assert!(matches!(err, HiveError::ResourceExhausted { requested } if requested == usize::MAX));
        assert_eq!(pool.used(), 4096);

        let quota = HeapPool::with_quota(8192);
        let kept = quota.alloc(8192).unwrap();
        assert!(matches!(quota.alloc(1), Err(HiveError::ResourceExhausted { requested: 1 })));
        assert!(matches!(quota.alloc(usize::MAX), Err(HiveError::ResourceExhausted { .. })));
        assert_eq!(quota.used(), 8192);
        quota.free(kept);
        pool.free(mem);
        assert_eq!(quota.used(), 0);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn memory_backend() {
        let mut mem = MemoryBackend::new();
        let view = mem.clone();
        mem.write_at(8, b"abcd").unwrap();
        assert_eq!(mem.len().unwrap(), 12);
        let mut buf = [0u8; 4];
        mem.read_at(8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(&view.image()[8..], b"abcd");
        let err = mem.read_at(10, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        mem.set_len(4).unwrap();
        assert_eq!(view.image().len(), 4);
    }

    #[test]
    fn file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive");
        let mut file = FileBackend::open(&path, true).unwrap();
        file.write_at(4096, &[7u8; 16]).unwrap();
        file.flush().unwrap();
        assert_eq!(file.len().unwrap(), 4112);
        let mut buf = [0u8; 16];
        file.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
        assert!(file.as_file().is_some());
        // A second open must fail while the first one holds the lock
        assert!(matches!(FileBackend::open(&path, false), Err(HiveError::Lock(_))));
    }

    #[test]
    fn quota() {
        let pool = HeapPool::with_quota(8192);
        let a = pool.alloc(4096).unwrap();
        let b = pool.alloc(4096).unwrap();
        assert!(matches!(
            pool.alloc(1),
            Err(HiveError::ResourceExhausted { requested: 1 })
        ));
        pool.free(a);
        assert_eq!(pool.used(), 4096);
        pool.free(b);
        assert_eq!(pool.used(), 0);
    }
}
