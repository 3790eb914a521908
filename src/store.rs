use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{RelativeRef, TagName};
use crate::error::RegistryError;

pub const CURRENT_VERSION: u32 = 2;

/// The persistent registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub config_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub collections: BTreeMap<String, Collection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tag: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Artifact directory; relative paths are resolved against the data dir.
    pub path: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_size: Option<String>,
    #[serde(default)]
    pub seek_keys: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulled_at: Option<String>,
}

impl Document {
    pub fn empty(servers: Vec<String>) -> Self {
        Self {
            config_version: CURRENT_VERSION,
            data_dir: None,
            servers,
            aliases: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    pub fn tag(&self, digest: &str, asset: &str, tag: &str) -> Option<&Tag> {
        self.collections
            .get(digest)?
            .assets
            .get(asset)?
            .tags
            .get(tag)
    }

    pub fn tag_mut(&mut self, digest: &str, asset: &str, tag: &str) -> Option<&mut Tag> {
        self.collections
            .get_mut(digest)?
            .assets
            .get_mut(asset)?
            .tags
            .get_mut(tag)
    }
}

/// Read, upgrade and validate the document at `path`.
pub fn load(path: &Utf8Path) -> Result<Document, RegistryError> {
    let content = match fs::read_to_string(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(RegistryError::RegistryNotFound(path.to_path_buf()));
        }
        Err(err) => {
            return Err(RegistryError::Filesystem(format!("read {path}: {err}")));
        }
    };
    let raw: Value = serde_json::from_str(&content)
        .map_err(|err| RegistryError::schema(path, err.to_string()))?;
    let raw = upgrade(raw, path)?;
    let document: Document = serde_json::from_value(raw)
        .map_err(|err| RegistryError::schema(path, err.to_string()))?;
    validate(&document, path)?;
    debug!(%path, collections = document.collections.len(), "loaded registry");
    Ok(document)
}

fn raw_version(raw: &Value) -> Option<u32> {
    match raw.get("config_version")? {
        Value::Number(n) => n.as_f64().map(|v| v as u32),
        Value::String(s) => s.parse::<f64>().ok().map(|v| v as u32),
        _ => None,
    }
}

/// Apply the ordered migrations from the document's version up to
/// [`CURRENT_VERSION`]. Unknown or future versions fail closed.
pub fn upgrade(mut raw: Value, path: &Utf8Path) -> Result<Value, RegistryError> {
    if !raw.is_object() {
        return Err(RegistryError::schema(path, "document root must be an object"));
    }
    let mut version = raw_version(&raw).ok_or_else(|| {
        RegistryError::schema(path, "missing or non-numeric 'config_version'")
    })?;
    if version == 0 || version > CURRENT_VERSION {
        return Err(RegistryError::UnsupportedVersion {
            found: version,
            supported: CURRENT_VERSION,
        });
    }
    while version < CURRENT_VERSION {
        raw = match version {
            1 => upgrade_v1_to_v2(raw),
            other => {
                return Err(RegistryError::UnsupportedVersion {
                    found: other,
                    supported: CURRENT_VERSION,
                });
            }
        };
        version += 1;
        info!(%path, version, "upgraded registry document");
    }
    Ok(raw)
}

fn upgrade_v1_to_v2(mut raw: Value) -> Value {
    let Some(root) = raw.as_object_mut() else {
        return raw;
    };
    let servers = match root.remove("server") {
        Some(Value::String(url)) => vec![Value::String(url)],
        Some(Value::Array(urls)) => urls,
        _ => Vec::new(),
    };
    root.entry("servers").or_insert(Value::Array(servers));

    let mut aliases = serde_json::Map::new();
    if let Some(Value::Object(collections)) = root.get_mut("collections") {
        for (digest, collection) in collections.iter_mut() {
            if let Some(Value::Array(names)) = collection.get("aliases") {
                for name in names.iter().filter_map(Value::as_str) {
                    aliases.insert(name.to_string(), Value::String(digest.clone()));
                }
            }
            let Some(Value::Object(assets)) = collection.get_mut("assets") else {
                continue;
            };
            for asset in assets.values_mut() {
                let Some(Value::Object(tags)) = asset.get_mut("tags") else {
                    continue;
                };
                for tag in tags.values_mut() {
                    let Some(tag) = tag.as_object_mut() else {
                        continue;
                    };
                    for (old, new) in [("asset_parents", "parents"), ("asset_children", "children")] {
                        if let Some(value) = tag.remove(old) {
                            tag.insert(new.to_string(), value);
                        }
                    }
                }
            }
        }
    }
    root.insert("aliases".to_string(), Value::Object(aliases));
    root.insert(
        "config_version".to_string(),
        Value::Number(CURRENT_VERSION.into()),
    );
    raw
}

/// Structural checks run on every load and before every write.
pub fn validate(document: &Document, path: &Utf8Path) -> Result<(), RegistryError> {
    if document.config_version != CURRENT_VERSION {
        return Err(RegistryError::UnsupportedVersion {
            found: document.config_version,
            supported: CURRENT_VERSION,
        });
    }

    for (alias, digest) in &document.aliases {
        let collection = document.collections.get(digest).ok_or_else(|| {
            RegistryError::schema(
                path,
                format!("alias '{alias}' points to unknown collection {digest}"),
            )
        })?;
        if !collection.aliases.contains(alias) {
            return Err(RegistryError::schema(
                path,
                format!("alias '{alias}' is not listed by collection {digest}"),
            ));
        }
    }

    for (digest, collection) in &document.collections {
        let mut seen = BTreeSet::new();
        for alias in &collection.aliases {
            if !seen.insert(alias) {
                return Err(RegistryError::schema(
                    path,
                    format!("alias '{alias}' listed twice by collection {digest}"),
                ));
            }
            match document.aliases.get(alias) {
                Some(target) if target == digest => {}
                Some(target) => {
                    return Err(RegistryError::schema(
                        path,
                        format!("alias '{alias}' claimed by both {digest} and {target}"),
                    ));
                }
                None => {
                    return Err(RegistryError::schema(
                        path,
                        format!("alias '{alias}' of {digest} missing from the alias map"),
                    ));
                }
            }
        }

        for (asset_name, asset) in &collection.assets {
            if let Some(default_tag) = &asset.default_tag
                && !asset.tags.contains_key(default_tag)
            {
                return Err(RegistryError::schema(
                    path,
                    format!("default tag '{default_tag}' of {digest}/{asset_name} does not exist"),
                ));
            }
            for (tag_name, tag) in &asset.tags {
                tag_name.parse::<TagName>().map_err(|_| {
                    RegistryError::schema(
                        path,
                        format!("illegal tag name '{tag_name}' in {digest}/{asset_name}"),
                    )
                })?;
                for reference in tag.parents.iter().chain(tag.children.iter()) {
                    reference.parse::<RelativeRef>().map_err(|_| {
                        RegistryError::schema(
                            path,
                            format!(
                                "malformed relationship '{reference}' in {digest}/{asset_name}:{tag_name}"
                            ),
                        )
                    })?;
                }
            }
        }
    }

    let asymmetric = crate::relations::asymmetric_edges(document);
    for (from, to) in &asymmetric {
        warn!(%from, %to, "asymmetric relationship edge");
    }
    Ok(())
}

/// Validate and atomically replace the document at `path`.
///
/// The new content is written to a temporary file in the same directory and
/// renamed over the target, so readers see either the old or the new document.
pub fn write(document: &Document, path: &Utf8Path) -> Result<(), RegistryError> {
    validate(document, path)?;
    let mut content = serde_json::to_vec_pretty(document)
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    content.push(b'\n');
    write_bytes_atomic(path, &content)
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), RegistryError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-gr-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    Ok(())
}
