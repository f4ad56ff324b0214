//! Remote-compatible content hashing.
//!
//! The remote store identifies file content by a block hash: the file is
//! read in fixed 4 MiB blocks, each block is SHA-256 hashed, the raw digests
//! are concatenated, and the concatenation is SHA-256 hashed again. The
//! final digest is lower-hex encoded. Folders hash to the sentinel
//! [`FOLDER_SENTINEL`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hash value used for folders, both as `rev` and as `content_hash`.
pub const FOLDER_SENTINEL: &str = "folder";

/// Block size of the remote content-hash scheme.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of hashing a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    /// A regular file; the hex-encoded block hash.
    Hashed(String),
    /// The path is a directory.
    Folder,
    /// The file disappeared before or while hashing. Upstream drops the
    /// event; reconciliation catches any residue.
    Vanished,
}

/// Hashing failed on a file that exists.
#[derive(Debug)]
pub enum HashError {
    Unreadable(std::io::Error),
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashError::Unreadable(e) => write!(f, "file unreadable while hashing: {e}"),
        }
    }
}

impl std::error::Error for HashError {}

/// Compute the content hash of a local path.
pub fn hash_file(path: &Path) -> Result<HashOutcome, HashError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashOutcome::Vanished),
        Err(e) => return Err(HashError::Unreadable(e)),
    };
    if metadata.is_dir() {
        return Ok(HashOutcome::Folder);
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashOutcome::Vanished),
        Err(e) => return Err(HashError::Unreadable(e)),
    };

    match hash_reader(file) {
        Ok(hex) => Ok(HashOutcome::Hashed(hex)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashOutcome::Vanished),
        Err(e) => Err(HashError::Unreadable(e)),
    }
}

/// Block-hash an arbitrary reader. Used by [`hash_file`] and by upload code
/// that hashes an in-memory buffer before sending it.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut concatenated = Sha256::new();

    loop {
        let read = fill_block(&mut reader, &mut block)?;
        if read == 0 {
            break;
        }
        concatenated.update(Sha256::digest(&block[..read]));
        if read < BLOCK_SIZE {
            break;
        }
    }

    Ok(to_hex(&concatenated.finalize()))
}

/// Convenience wrapper for hashing a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut concatenated = Sha256::new();
    for block in data.chunks(BLOCK_SIZE) {
        concatenated.update(Sha256::digest(block));
    }
    to_hex(&concatenated.finalize())
}

/// Read until `block` is full or the reader is exhausted. A plain `read`
/// may return short counts; block boundaries must be exact for the hash to
/// match the remote's.
fn fill_block<R: Read>(reader: &mut R, block: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_hashes_to_sha256_of_nothing() {
        // Zero blocks: the outer hash runs over an empty concatenation.
        let expected = to_hex(&Sha256::digest([]));
        assert_eq!(hash_bytes(b""), expected);
    }

    #[test]
    fn single_block_matches_manual_computation() {
        let data = b"hello driftsync";
        let inner = Sha256::digest(data);
        let expected = to_hex(&Sha256::digest(inner));
        assert_eq!(hash_bytes(data), expected);
    }

    #[test]
    fn multi_block_concatenates_digests() {
        // One full block plus a tail byte.
        let mut data = vec![0xabu8; BLOCK_SIZE];
        data.push(0xcd);

        let first = Sha256::digest(&data[..BLOCK_SIZE]);
        let second = Sha256::digest(&data[BLOCK_SIZE..]);
        let mut outer = Sha256::new();
        outer.update(first);
        outer.update(second);
        let expected = to_hex(&outer.finalize());

        assert_eq!(hash_bytes(&data), expected);
    }

    #[test]
    fn hash_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"some file content").unwrap();
        drop(f);

        let outcome = hash_file(&path).unwrap();
        assert_eq!(outcome, HashOutcome::Hashed(hash_bytes(b"some file content")));
    }

    #[test]
    fn directory_hashes_to_folder() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(hash_file(dir.path()).unwrap(), HashOutcome::Folder);
    }

    #[test]
    fn missing_file_is_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = hash_file(&dir.path().join("nope.txt")).unwrap();
        assert_eq!(outcome, HashOutcome::Vanished);
    }
}
