//! Content digests used for collection identity and archive integrity.
//!
//! Directory digests are SHA-256 (lowercase hex). Archive checksums published
//! by a catalog are MD5 or SHA-256, told apart by length. Sequence and
//! collection digests are SHA-512 truncated to 24 bytes, which keeps them short
//! enough to serve as directory names.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256, Sha512};

use crate::error::RegistryError;

const TRUNCATED_LEN: usize = 24;
const READ_CHUNK: usize = 64 * 1024;

/// Truncated SHA-512 of `data`, hex encoded.
pub fn trunc512_digest(data: &[u8]) -> String {
    let digest = Sha512::digest(data);
    hex_encode(&digest[..TRUNCATED_LEN])
}

/// Stream `reader` through SHA-256.
pub fn archive_digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// SHA-256 of the file at `path`, streamed.
pub fn archive_digest(path: &Utf8Path) -> Result<String, RegistryError> {
    let file = File::open(path.as_std_path()).map_err(|err| digest_error(path, err))?;
    archive_digest_reader(file).map_err(|err| digest_error(path, err))
}

/// Hash used for an archive checksum published by a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveAlgorithm {
    Md5,
    Sha256,
}

impl ArchiveAlgorithm {
    /// 32 hex characters is MD5; anything else is checked as SHA-256.
    pub fn for_checksum(expected: &str) -> Self {
        if expected.len() == 32 {
            ArchiveAlgorithm::Md5
        } else {
            ArchiveAlgorithm::Sha256
        }
    }
}

/// Stream `reader` through `algorithm`.
pub fn archive_checksum_reader<R: Read>(
    mut reader: R,
    algorithm: ArchiveAlgorithm,
) -> io::Result<String> {
    match algorithm {
        ArchiveAlgorithm::Sha256 => archive_digest_reader(reader),
        ArchiveAlgorithm::Md5 => {
            let mut context = md5::Context::new();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = reader.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                context.consume(&buf[..read]);
            }
            Ok(hex_encode(&context.compute().0))
        }
    }
}

/// Checksum of the archive at `path` using the algorithm `expected` was
/// computed with.
pub fn archive_checksum(path: &Utf8Path, expected: &str) -> Result<String, RegistryError> {
    let algorithm = ArchiveAlgorithm::for_checksum(expected);
    let file = File::open(path.as_std_path()).map_err(|err| digest_error(path, err))?;
    archive_checksum_reader(file, algorithm).map_err(|err| digest_error(path, err))
}

/// Digest of a directory tree that depends only on relative file paths and
/// file contents. A plain file digests as its own SHA-256.
pub fn directory_digest(path: &Utf8Path) -> Result<String, RegistryError> {
    let meta = fs::metadata(path.as_std_path()).map_err(|err| digest_error(path, err))?;
    if meta.is_file() {
        return archive_digest(path);
    }
    let mut files = Vec::new();
    collect_files(path.as_std_path(), &mut files).map_err(|err| digest_error(path, err))?;
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let relative = file
            .strip_prefix(path.as_std_path())
            .map_err(|err| RegistryError::DigestComputation {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let utf8 = Utf8PathBuf::from_path_buf(file).map_err(|bad| {
            RegistryError::DigestComputation {
                path: path.to_path_buf(),
                message: format!("non-utf8 path {}", bad.display()),
            }
        })?;
        entries.push((relative, archive_digest(&utf8)?));
    }
    entries.sort();
    let mut hasher = Sha256::new();
    for (relative, digest) in &entries {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn collect_files(root: &Path, out: &mut Vec<std::path::PathBuf>) -> io::Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(())
}

fn digest_error(path: &Utf8Path, err: io::Error) -> RegistryError {
    RegistryError::DigestComputation {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
