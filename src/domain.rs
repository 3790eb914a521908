use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub const DEFAULT_TAG: &str = "default";
pub const TAG_NAME_BANNED_CHARS: &[char] = &[':', '/'];

/// A tag name that is safe to use as a path component and inside registry paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagName(String);

impl TagName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TagName {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed.contains(TAG_NAME_BANNED_CHARS);
        if !is_valid {
            return Err(RegistryError::InvalidTagName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for TagName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TagName> for String {
    fn from(value: TagName) -> Self {
        value.0
    }
}

/// A user-facing registry path: `collection/asset.seek_key:tag`, where only the
/// asset is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub collection: Option<String>,
    pub asset: String,
    pub seek_key: Option<String>,
    pub tag: Option<String>,
}

fn registry_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?P<collection>[^/:.\s]+)/)?(?P<asset>[^/:.\s]+)(?:\.(?P<seek_key>[^/:\s]+))?(?::(?P<tag>[^/:\s]+))?$")
            .expect("registry path regex is valid")
    })
}

impl FromStr for AssetRef {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let caps = registry_path_regex()
            .captures(trimmed)
            .ok_or_else(|| RegistryError::InvalidRegistryPath(value.to_string()))?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        Ok(Self {
            collection: group("collection"),
            asset: group("asset").unwrap_or_default(),
            seek_key: group("seek_key"),
            tag: group("tag"),
        })
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(collection) = &self.collection {
            write!(f, "{collection}/")?;
        }
        write!(f, "{}", self.asset)?;
        if let Some(seek_key) = &self.seek_key {
            write!(f, ".{seek_key}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// A stable node identifier in the provenance graph: `digest/asset:tag`.
///
/// Edges are stored as these strings on both endpoints instead of object
/// references, so the graph never forms an ownership cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativeRef {
    pub collection: String,
    pub asset: String,
    pub tag: String,
}

impl RelativeRef {
    pub fn new(collection: &str, asset: &str, tag: &str) -> Self {
        Self {
            collection: collection.to_string(),
            asset: asset.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse a stored reference, filling in `default_collection` for the
    /// short `asset:tag` form servers advertise.
    pub fn parse_in(value: &str, default_collection: &str) -> Result<Self, RegistryError> {
        let parsed: AssetRef = value.parse()?;
        let tag = parsed
            .tag
            .ok_or_else(|| RegistryError::InvalidRegistryPath(value.to_string()))?;
        Ok(Self {
            collection: parsed
                .collection
                .unwrap_or_else(|| default_collection.to_string()),
            asset: parsed.asset,
            tag,
        })
    }
}

impl fmt::Display for RelativeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.collection, self.asset, self.tag)
    }
}

impl FromStr for RelativeRef {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed: AssetRef = value.parse()?;
        match (parsed.collection, parsed.tag) {
            (Some(collection), Some(tag)) => Ok(Self {
                collection,
                asset: parsed.asset,
                tag,
            }),
            _ => Err(RegistryError::InvalidRegistryPath(value.to_string())),
        }
    }
}
