use std::env;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::domain::DEFAULT_TAG;
use crate::error::RegistryError;

pub const REGISTRY_ENV: &str = "KIRA_GR_REGISTRY";
pub const DEFAULT_SERVER: &str = "http://refgenomes.databio.org";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SIZE_CUTOFF_GB: f64 = 10.0;

/// Where the registry lives and how it behaves.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub path: Utf8PathBuf,
    /// Overrides the document's `data_dir`; `None` defers to the document and
    /// then to `<registry dir>/data`.
    pub data_dir: Option<Utf8PathBuf>,
    pub lock_timeout: Duration,
    pub create_if_missing: bool,
    pub default_tag: String,
    pub size_cutoff_gb: f64,
}

impl RegistryConfig {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            data_dir: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            create_if_missing: false,
            default_tag: DEFAULT_TAG.to_string(),
            size_cutoff_gb: DEFAULT_SIZE_CUTOFF_GB,
        }
    }

    /// Explicit path, then `KIRA_GR_REGISTRY`, then `~/.kira-gr/registry.json`.
    pub fn resolve(path: Option<&str>) -> Result<Self, RegistryError> {
        let env_value = env::var(REGISTRY_ENV).ok();
        let home = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok());
        Self::resolve_from(path, env_value.as_deref(), home.as_deref())
    }

    pub fn resolve_from(
        path: Option<&str>,
        env_value: Option<&str>,
        home: Option<&Utf8Path>,
    ) -> Result<Self, RegistryError> {
        let explicit = path
            .or(env_value)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(value) = explicit {
            return Ok(Self::new(value));
        }
        let home = home.ok_or_else(|| {
            RegistryError::Filesystem(format!(
                "cannot determine home directory; pass --registry or set {REGISTRY_ENV}"
            ))
        })?;
        Ok(Self::new(home.join(".kira-gr").join("registry.json")))
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<Utf8PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn registry_dir(&self) -> Utf8PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        }
    }

    /// The data directory given the document's own setting.
    pub fn resolve_data_dir(&self, document_data_dir: Option<&Utf8Path>) -> Utf8PathBuf {
        let registry_dir = self.registry_dir();
        let chosen = self
            .data_dir
            .as_deref()
            .or(document_data_dir)
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| registry_dir.join("data"));
        if chosen.is_absolute() {
            chosen
        } else {
            registry_dir.join(chosen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_env() {
        let config =
            RegistryConfig::resolve_from(Some("/a/reg.json"), Some("/b/reg.json"), None).unwrap();
        assert_eq!(config.path, Utf8PathBuf::from("/a/reg.json"));
        let config = RegistryConfig::resolve_from(None, Some("/b/reg.json"), None).unwrap();
        assert_eq!(config.path, Utf8PathBuf::from("/b/reg.json"));
    }

    #[test]
    fn falls_back_to_home() {
        let config =
            RegistryConfig::resolve_from(None, None, Some(Utf8Path::new("/home/u"))).unwrap();
        assert_eq!(config.path, Utf8PathBuf::from("/home/u/.kira-gr/registry.json"));
        assert!(RegistryConfig::resolve_from(None, Some("  "), None).is_err());
    }

    #[test]
    fn data_dir_resolution_order() {
        let config = RegistryConfig::new("/r/registry.json");
        assert_eq!(config.resolve_data_dir(None), Utf8PathBuf::from("/r/data"));
        assert_eq!(
            config.resolve_data_dir(Some(Utf8Path::new("assets"))),
            Utf8PathBuf::from("/r/assets")
        );
        let config = config.with_data_dir("/elsewhere");
        assert_eq!(
            config.resolve_data_dir(Some(Utf8Path::new("assets"))),
            Utf8PathBuf::from("/elsewhere")
        );
    }
}
