use crate::core::config::Config;
use crate::core::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Digest of zero bytes
pub const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const READ_BUFFER_SIZE: usize = 8192;

/// Limits for a batch digest run
#[derive(Debug, Clone)]
pub struct DigestOptions {
    /// Budget for a single file, measured from when its reader starts
    pub per_file_timeout: Duration,
    /// Ceiling for the whole batch
    pub batch_timeout: Duration,
    /// Number of files hashed at once
    pub concurrency: usize,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            per_file_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(60),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl DigestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            per_file_timeout: config.digest_timeout(),
            batch_timeout: config.digest_batch_timeout(),
            concurrency: config.workers(),
        }
    }
}

/// SHA-256 hex of a byte slice
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 hex of a file's contents, streamed in fixed-size chunks
pub fn compute_digest(path: &Path) -> Result<String> {
    digest_until(path, None)
}

fn digest_until(path: &Path, deadline: Option<Instant>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Digest(format!(
                "timed out hashing {}",
                path.display()
            )));
        }
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash many files with bounded concurrency.
///
/// Every file is read on its own detached thread and holds one of
/// `concurrency` slots until it finishes or its deadline passes. A read that
/// blocks past its deadline gives its slot back and its late result is
/// dropped. Files that fail to read are left out of the result. When the
/// batch ceiling expires, queued work is abandoned and the digests finished
/// so far are returned.
pub fn compute_digests_parallel(
    paths: &[PathBuf],
    options: &DigestOptions,
) -> Result<HashMap<PathBuf, String>> {
    let mut digests = HashMap::with_capacity(paths.len());
    if paths.is_empty() {
        return Ok(digests);
    }

    let concurrency = options.concurrency.max(1);
    let batch_deadline = Instant::now() + options.batch_timeout;
    let (tx, rx) = mpsc::channel::<(usize, Result<String>)>();
    // index -> per-file deadline
    let mut active: HashMap<usize, Instant> = HashMap::with_capacity(concurrency);
    let mut next = 0;

    loop {
        while active.len() < concurrency && next < paths.len() {
            let index = next;
            next += 1;
            let deadline = Instant::now() + options.per_file_timeout;
            let path = paths[index].clone();
            let tx = tx.clone();
            let spawned = std::thread::Builder::new()
                .name("mapperlink-digest".to_string())
                .spawn(move || {
                    let result = digest_until(&path, Some(deadline));
                    let _ = tx.send((index, result));
                });
            match spawned {
                Ok(_) => {
                    active.insert(index, deadline);
                }
                Err(e) => {
                    tracing::warn!(path = %paths[index].display(), error = %e, "digest reader failed to start");
                }
            }
        }
        if active.is_empty() {
            break;
        }

        let now = Instant::now();
        if now >= batch_deadline {
            tracing::warn!(
                pending = active.len() + (paths.len() - next),
                completed = digests.len(),
                "digest batch timed out, returning partial results"
            );
            break;
        }
        let wake = active
            .values()
            .min()
            .copied()
            .unwrap_or(batch_deadline)
            .min(batch_deadline);

        match rx.recv_timeout(wake.saturating_duration_since(now)) {
            Ok((index, result)) => {
                if active.remove(&index).is_none() {
                    continue;
                }
                match result {
                    Ok(digest) => {
                        digests.insert(paths[index].clone(), digest);
                    }
                    Err(e) => {
                        tracing::warn!(path = %paths[index].display(), error = %e, "digest failed");
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                active.retain(|index, deadline| {
                    if *deadline > now {
                        return true;
                    }
                    tracing::warn!(path = %paths[*index].display(), "digest timed out, releasing reader");
                    false
                });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(digests)
}
