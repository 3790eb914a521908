//! Fetch and extract capabilities used by the pull orchestrator.

use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::RegistryError;
use crate::fs_util::{self, ArchiveKind};

const CHUNK_SIZE: usize = 256 * 1024;

pub trait Fetcher: Send + Sync {
    /// Download `url` into `destination`, returning the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<u64, RegistryError>;
}

/// Files produced by an extraction, relative to the target directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractManifest {
    pub files: Vec<Utf8PathBuf>,
}

pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        archive: &Utf8Path,
        target_dir: &Utf8Path,
    ) -> Result<ExtractManifest, RegistryError>;
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, RegistryError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("kira-gr/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| RegistryError::Filesystem(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| RegistryError::Transport {
            url: "<client>".to_string(),
            message: err.to_string(),
        })
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, RegistryError> {
        // archives can be large; the timeout bounds the whole transfer
        Ok(Self {
            client: http_client(Duration::from_secs(6 * 60 * 60))?,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<u64, RegistryError> {
        cancel.check("download")?;
        let transport = |err: &dyn std::fmt::Display| RegistryError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        };
        let mut response = self.client.get(url).send().map_err(|err| transport(&err))?;
        if !response.status().is_success() {
            return Err(RegistryError::TransportStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = File::create(destination.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("create {destination}: {err}")))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            cancel.check("download")?;
            let read = response.read(&mut buf).map_err(|err| transport(&err))?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .map_err(|err| RegistryError::Filesystem(format!("write {destination}: {err}")))?;
            total += read as u64;
        }
        file.sync_all()
            .map_err(|err| RegistryError::Filesystem(format!("sync {destination}: {err}")))?;
        debug!(%url, bytes = total, "download complete");
        Ok(total)
    }
}

/// Extracts `.tgz`, `.tar` and `.zip` archives, detected by content.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    fn extract(
        &self,
        archive: &Utf8Path,
        target_dir: &Utf8Path,
    ) -> Result<ExtractManifest, RegistryError> {
        let files = match fs_util::sniff_archive(archive)? {
            ArchiveKind::TarGz => fs_util::extract_tar(archive, target_dir, true)?,
            ArchiveKind::Tar => fs_util::extract_tar(archive, target_dir, false)?,
            ArchiveKind::Zip => fs_util::extract_zip(archive, target_dir)?,
        };
        Ok(ExtractManifest { files })
    }
}
