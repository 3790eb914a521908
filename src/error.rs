use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// One failed attempt against a configured catalog server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    pub server: String,
    pub message: String,
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.server, self.message)
    }
}

fn join_failures(failures: &[ServerFailure]) -> String {
    if failures.is_empty() {
        return "no servers configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("collection not found: {0}")]
    #[diagnostic(help("set an alias, add a fasta asset or pull an asset to initialize it"))]
    MissingCollection(String),

    #[error("collection '{collection}' exists, but asset '{asset}' is missing")]
    MissingAsset { collection: String, asset: String },

    #[error("asset '{collection}/{asset}' exists, but tag '{tag}' is missing")]
    MissingTag {
        collection: String,
        asset: String,
        tag: String,
    },

    #[error("seek key '{seek_key}' not defined for '{collection}/{asset}:{tag}'")]
    MissingSeekKey {
        collection: String,
        asset: String,
        tag: String,
        seek_key: String,
    },

    #[error("path for '{collection}/{asset}:{tag}' does not exist: {path}")]
    MissingFile {
        collection: String,
        asset: String,
        tag: String,
        path: Utf8PathBuf,
    },

    #[error("registry file not found: {0}")]
    RegistryNotFound(Utf8PathBuf),

    #[error("registry file already exists: {0}")]
    RegistryExists(Utf8PathBuf),

    #[error("invalid registry document {path}: {message}")]
    Schema { path: Utf8PathBuf, message: String },

    #[error("unsupported registry version {found} (this build understands up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("timed out after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: Utf8PathBuf, waited: Duration },

    #[error("cannot take an exclusive lock on {0} while holding it shared")]
    LockUpgrade(Utf8PathBuf),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("failed to compute digest of {path}: {message}")]
    DigestComputation { path: Utf8PathBuf, message: String },

    #[error("archive digest mismatch for '{target}' from {server}: expected {expected}, got {actual}")]
    DigestMismatch {
        target: String,
        server: String,
        expected: String,
        actual: String,
    },

    #[error("server {server} does not advertise an archive digest for '{target}'")]
    MissingArchiveDigest { target: String, server: String },

    #[error("provenance check failed for '{target}': {message}")]
    Provenance { target: String, message: String },

    #[error("transfer from {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("transfer from {url} returned status {status}")]
    TransportStatus { url: String, status: u16 },

    #[error("failed to extract {archive}: {message}")]
    Extraction {
        archive: Utf8PathBuf,
        message: String,
    },

    #[error("alias '{alias}' already points to collection {existing}")]
    AliasCollision { alias: String, existing: String },

    #[error("relationship between '{from}' and '{to}' is not symmetric")]
    AsymmetricRelationship { from: String, to: String },

    #[error("invalid tag name '{0}': tags must not contain ':' or '/'")]
    InvalidTagName(String),

    #[error("invalid registry path: {0}")]
    InvalidRegistryPath(String),

    #[error("invalid locus '{locus}': {message}")]
    InvalidLocus { locus: String, message: String },

    #[error("'{collection}/{asset}:{tag}' already exists")]
    TagExists {
        collection: String,
        asset: String,
        tag: String,
    },

    #[error("server {server} is not a compatible catalog: {message}")]
    IncompatibleServer { server: String, message: String },

    #[error("'{target}' not available from any server: {}", join_failures(.failures))]
    AllServersFailed {
        target: String,
        failures: Vec<ServerFailure>,
    },

    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl RegistryError {
    pub(crate) fn schema(path: &camino::Utf8Path, message: impl Into<String>) -> Self {
        RegistryError::Schema {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Errors that should make the orchestrator try the next server.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RegistryError::Transport { .. }
                | RegistryError::TransportStatus { .. }
                | RegistryError::IncompatibleServer { .. }
        )
    }
}
