//! Content digests used to detect corruption between write and read.
//!
//! Digests are lowercase hex SHA-256 over the exact stored bytes. Callers
//! must hash the bytes as written; no re-encoding happens here.

use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Length of a digest in hex characters
pub const DIGEST_LEN: usize = 64;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("digest mismatch: expected {expected}, actual {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Digest a byte slice
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest a file without loading it whole
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check bytes against a previously recorded digest. The recorded digest
/// must match exactly, so a re-cased or padded value counts as a mismatch.
pub fn verify(bytes: &[u8], expected: &str) -> Result<(), IntegrityError> {
    let actual = digest(bytes);
    if actual == expected {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
