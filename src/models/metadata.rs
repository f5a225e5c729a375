use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::ChatError;

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = reader.read(&mut buffer).context("hash read")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

/// Hashes `path` on the blocking pool so progress reporting on the runtime
/// is never stalled by a multi-gigabyte read.
pub async fn sha256_file(path: &Path) -> crate::Result<String> {
    let owned: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_sha256(&owned))
        .await
        .map_err(|err| ChatError::Integrity(format!("hashing task failed: {err}")))?
        .map_err(|err| ChatError::Integrity(format!("{err:#}")))
}

/// Returns `Ok(true)` when the file's digest equals `expected` (case-insensitive hex).
pub async fn checksum_matches(path: &Path, expected: &str) -> crate::Result<bool> {
    let actual = sha256_file(path).await?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
