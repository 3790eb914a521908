use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    Zip,
}

/// Identify an archive by its leading bytes.
pub fn sniff_archive(path: &Utf8Path) -> Result<ArchiveKind, RegistryError> {
    let mut file = File::open(path.as_std_path()).map_err(|err| extraction(path, err))?;
    let mut header = [0u8; 262];
    let mut filled = 0;
    while filled < header.len() {
        let read = file
            .read(&mut header[filled..])
            .map_err(|err| extraction(path, err))?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    let header = &header[..filled];
    if header.starts_with(&[0x1f, 0x8b]) {
        Ok(ArchiveKind::TarGz)
    } else if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        Ok(ArchiveKind::Zip)
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        Ok(ArchiveKind::Tar)
    } else {
        Err(RegistryError::Extraction {
            archive: path.to_path_buf(),
            message: "unrecognised archive format".to_string(),
        })
    }
}

pub fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, RegistryError> {
    let file = File::open(zip_path.as_std_path()).map_err(|err| extraction(zip_path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| extraction(zip_path, err))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| extraction(zip_path, err))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(RegistryError::Extraction {
                archive: zip_path.to_path_buf(),
                message: "zip entry path traversal detected".to_string(),
            });
        };
        let relative = utf8_relative(zip_path, &relative)?;
        let entry_path = target_dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(entry_path.as_std_path()).map_err(|err| extraction(zip_path, err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| extraction(zip_path, err))?;
        }
        let mut outfile =
            File::create(entry_path.as_std_path()).map_err(|err| extraction(zip_path, err))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| extraction(zip_path, err))?;
        written.push(relative);
    }
    Ok(written)
}

/// Unpack a tar stream, optionally gzip-compressed, refusing entries that
/// would land outside `target_dir`.
pub fn extract_tar(
    archive_path: &Utf8Path,
    target_dir: &Utf8Path,
    gzipped: bool,
) -> Result<Vec<Utf8PathBuf>, RegistryError> {
    let file = File::open(archive_path.as_std_path()).map_err(|err| extraction(archive_path, err))?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    fs::create_dir_all(target_dir.as_std_path()).map_err(|err| extraction(archive_path, err))?;

    let mut written = Vec::new();
    let entries = archive.entries().map_err(|err| extraction(archive_path, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| extraction(archive_path, err))?;
        let path = entry
            .path()
            .map_err(|err| extraction(archive_path, err))?
            .into_owned();
        if !is_enclosed(&path) {
            return Err(RegistryError::Extraction {
                archive: archive_path.to_path_buf(),
                message: format!("tar entry path traversal detected: {}", path.display()),
            });
        }
        let is_file = entry.header().entry_type().is_file();
        // unpack_in re-checks containment and skips anything it cannot place safely
        let unpacked = entry
            .unpack_in(target_dir.as_std_path())
            .map_err(|err| extraction(archive_path, err))?;
        if unpacked && is_file {
            written.push(utf8_relative(archive_path, &path)?);
        }
    }
    Ok(written)
}

fn is_enclosed(path: &Path) -> bool {
    path.components().all(|component| {
        matches!(component, Component::Normal(_) | Component::CurDir)
    })
}

fn utf8_relative(archive: &Utf8Path, path: &Path) -> Result<Utf8PathBuf, RegistryError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|bad| RegistryError::Extraction {
        archive: archive.to_path_buf(),
        message: format!("non-utf8 entry {}", bad.display()),
    })
}

fn extraction(archive: &Utf8Path, err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Extraction {
        archive: archive.to_path_buf(),
        message: err.to_string(),
    }
}

/// Remove a file or directory tree; a missing path is not an error.
pub fn remove_path(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path.as_std_path()) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path.as_std_path()),
        Ok(_) => fs::remove_file(path.as_std_path()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove empty directories from `path` upwards, stopping at `stop`.
pub fn prune_empty_dirs(path: &Utf8Path, stop: &Utf8Path) {
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir.as_std_path()).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// When an extracted tree has exactly one top-level directory, return it.
pub fn single_top_level_dir(dir: &Utf8Path) -> io::Result<Option<Utf8PathBuf>> {
    let mut entries = fs::read_dir(dir.as_std_path())?;
    let Some(first) = entries.next() else {
        return Ok(None);
    };
    let first = first?;
    if entries.next().is_some() || !first.file_type()?.is_dir() {
        return Ok(None);
    }
    Ok(Utf8PathBuf::from_path_buf(first.path()).ok())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn tgz_round_trip_and_sniff() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        let archive = root.join("asset.tgz");
        {
            let file = File::create(archive.as_std_path()).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            let data = b">chr1\nACGT\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "fasta/genome.fa", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        assert_eq!(sniff_archive(&archive).unwrap(), ArchiveKind::TarGz);

        let out = root.join("out");
        let files = extract_tar(&archive, &out, true).unwrap();
        assert_eq!(files, vec![Utf8PathBuf::from("fasta/genome.fa")]);
        assert_eq!(
            single_top_level_dir(&out).unwrap(),
            Some(out.join("fasta"))
        );
    }

    #[test]
    fn zip_extracts_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        let archive = root.join("asset.zip");
        {
            let file = File::create(archive.as_std_path()).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("index/ref.idx", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"idx").unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(sniff_archive(&archive).unwrap(), ArchiveKind::Zip);
        let files = extract_zip(&archive, &root.join("out")).unwrap();
        assert_eq!(files, vec![Utf8PathBuf::from("index/ref.idx")]);
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(&dir).join("junk.bin");
        fs::write(path.as_std_path(), b"not an archive").unwrap();
        assert!(matches!(
            sniff_archive(&path),
            Err(RegistryError::Extraction { .. })
        ));
    }

    #[test]
    fn remove_path_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(&dir).join("missing");
        remove_path(&path).unwrap();
    }
}
