//! Hashing of local file contents on a dedicated rayon pool.
//!
//! Hashing large files is CPU and disk bound, so it stays off the async
//! runtime. Results come back over oneshot channels.

use crate::error::{ClientError, ClientResult};
use ferry_core::Range;
use ferry_core::hash::{FileHasher, PartHasher};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tokio::sync::oneshot;

const READ_CHUNK: usize = 1024 * 1024;

/// Fixed pool of hashing threads.
pub struct ChecksumPool {
    pool: ThreadPool,
}

impl ChecksumPool {
    pub fn new(threads: usize) -> ClientResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("ferry-checksum-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// MD5 of the bytes of `path` covered by `range`.
    pub async fn md5_range(&self, path: &Path, range: Range) -> ClientResult<String> {
        let path = path.to_path_buf();
        self.run(move || md5_range_sync(&path, range)).await
    }

    /// SHA-256 of the whole file at `path`.
    pub async fn sha256_file(&self, path: &Path) -> ClientResult<String> {
        let path = path.to_path_buf();
        self.run(move || sha256_file_sync(&path)).await
    }

    async fn run<F>(&self, task: F) -> ClientResult<String>
    where
        F: FnOnce() -> ClientResult<String> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = reply.send(task());
        });
        rx.await
            .map_err(|_| ClientError::Session("checksum task dropped".to_string()))?
    }
}

pub fn md5_range_sync(path: &Path, range: Range) -> ClientResult<String> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start()))?;
    let mut remaining = range.size();
    let mut hasher = PartHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    while remaining > 0 {
        let want = remaining.min(READ_CHUNK as u64) as usize;
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            return Err(ClientError::SizeMismatch {
                expected: range.size(),
                actual: range.size() - remaining,
            });
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(hasher.finalize_hex())
}

pub fn sha256_file_sync(path: &Path) -> ClientResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = FileHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::hash::{md5_hex, sha256_hex};

    #[tokio::test]
    async fn test_pool_hashes_ranges_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let pool = ChecksumPool::new(2).unwrap();
        let md5 = pool
            .md5_range(&path, Range::new(6, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(md5, md5_hex(b"world"));
        let sha = pool.sha256_file(&path).await.unwrap();
        assert_eq!(sha, sha256_hex(b"hello world"));
    }

    #[tokio::test]
    async fn test_range_past_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let pool = ChecksumPool::new(1).unwrap();
        let err = pool
            .md5_range(&path, Range::new(0, 9).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::SizeMismatch {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_pool_size_and_parallel_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ChecksumPool::new(3).unwrap();
        assert_eq!(pool.threads(), 3);
        assert_eq!(ChecksumPool::new(0).unwrap().threads(), 1);

        let mut paths = Vec::new();
        for i in 0..8u8 {
            let path = dir.path().join(format!("f{i}"));
            std::fs::write(&path, vec![i; 1000]).unwrap();
            paths.push(path);
        }
        let sums = futures::future::try_join_all(paths.iter().map(|p| pool.sha256_file(p)))
            .await
            .unwrap();
        for (i, sum) in sums.iter().enumerate() {
            assert_eq!(sum, &sha256_hex(&vec![i as u8; 1000]));
        }
    }

    #[tokio::test]
    async fn test_missing_file() {
        let pool = ChecksumPool::new(1).unwrap();
        let err = pool
            .sha256_file(Path::new("/nonexistent/ferry/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }
}
