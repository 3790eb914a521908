//! The registry engine: queries against the loaded document and locked,
//! atomically persisted mutations.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::catalog::{self, CatalogClient, RemoteListing, try_servers};
use crate::config::{DEFAULT_SERVER, RegistryConfig};
use crate::digest;
use crate::domain::{AssetRef, RelativeRef, TagName};
use crate::error::{RegistryError, ServerFailure};
use crate::fs_util;
use crate::lock::{FileLock, LockGuard, LockMode};
use crate::populate;
use crate::relations;
use crate::seqcol::{self, Comparison};
use crate::store::{self, Asset, Document, Tag};

pub const SEQUENCES_FILE: &str = "_sequences.json";
pub(crate) const STAGING_PREFIX: &str = ".kira-gr-";

/// Collection key (primary alias, else digest) to asset to sorted tags.
pub type Listing = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEdit {
    Rename(String),
    Metadata(TagMetadata),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMetadata {
    pub description: Option<String>,
    pub seek_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AliasUpdate {
    pub set: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<Utf8PathBuf>,
    pub unregistered: Vec<Utf8PathBuf>,
}

#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    lock: FileLock,
    document: Document,
    data_dir: Utf8PathBuf,
}

impl Registry {
    /// Load the registry at `config.path`, creating it with the default
    /// server when missing and `create_if_missing` is set.
    pub fn open(config: RegistryConfig) -> Result<Self, RegistryError> {
        if !config.path.as_std_path().exists() {
            if !config.create_if_missing {
                return Err(RegistryError::RegistryNotFound(config.path.clone()));
            }
            match Self::initialize(config.clone(), vec![DEFAULT_SERVER.to_string()]) {
                Err(RegistryError::RegistryExists(_)) => {}
                other => return other,
            }
        }
        let lock = FileLock::for_registry(&config.path);
        let document = {
            let _guard = lock.acquire(LockMode::Shared, config.lock_timeout, None)?;
            store::load(&config.path)?
        };
        let data_dir = config.resolve_data_dir(document.data_dir.as_deref());
        Ok(Self {
            config,
            lock,
            document,
            data_dir,
        })
    }

    /// Create a new, empty registry document. Fails if one already exists.
    pub fn initialize(config: RegistryConfig, servers: Vec<String>) -> Result<Self, RegistryError> {
        let lock = FileLock::for_registry(&config.path);
        let guard = lock.acquire(LockMode::Exclusive, config.lock_timeout, None)?;
        if config.path.as_std_path().exists() {
            return Err(RegistryError::RegistryExists(config.path.clone()));
        }
        let mut document = Document::empty(normalize_servers(&servers));
        document.data_dir = config.data_dir.clone();
        store::write(&document, &config.path)?;
        let data_dir = config.resolve_data_dir(document.data_dir.as_deref());
        fs::create_dir_all(data_dir.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("create {data_dir}: {err}")))?;
        drop(guard);
        info!(path = %config.path, %data_dir, "initialized registry");
        Ok(Self {
            config,
            lock,
            document,
            data_dir,
        })
    }

    /// Re-read the document from disk under a shared lock.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let _guard = self
            .lock
            .acquire(LockMode::Shared, self.config.lock_timeout, None)?;
        self.document = store::load(&self.config.path)?;
        Ok(())
    }

    pub fn close(self) {
        debug!(path = %self.config.path, "closed registry");
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn path(&self) -> &Utf8Path {
        &self.config.path
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn servers(&self) -> &[String] {
        &self.document.servers
    }

    /// Hold the exclusive lock across several steps. Mutations made while
    /// the guard lives nest inside it.
    pub fn lock_exclusive(&self, cancel: Option<&CancelToken>) -> Result<LockGuard, RegistryError> {
        self.lock
            .acquire(LockMode::Exclusive, self.config.lock_timeout, cancel)
    }

    /// Lock, reload, apply `change`, validate and persist. On any error the
    /// file on disk and the in-memory document keep their previous state.
    pub fn mutate<T, F>(&mut self, change: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Document) -> Result<T, RegistryError>,
    {
        let _guard = self.lock_exclusive(None)?;
        let mut document = store::load(&self.config.path)?;
        let value = change(&mut document)?;
        store::write(&document, &self.config.path)?;
        self.document = document;
        Ok(value)
    }

    /// Alias or digest to digest.
    pub fn resolve_alias(&self, name: &str) -> Result<String, RegistryError> {
        resolve_in(&self.document, name)
    }

    pub fn collection_aliases(&self, collection: &str) -> Result<Vec<String>, RegistryError> {
        let digest = self.resolve_alias(collection)?;
        Ok(self
            .document
            .collections
            .get(&digest)
            .map(|c| c.aliases.clone())
            .unwrap_or_default())
    }

    /// Digest to aliases for every known collection.
    pub fn list_collections(&self) -> BTreeMap<String, Vec<String>> {
        self.document
            .collections
            .iter()
            .map(|(digest, c)| (digest.clone(), c.aliases.clone()))
            .collect()
    }

    fn default_tag_of(&self, asset: &Asset) -> String {
        asset
            .default_tag
            .clone()
            .or_else(|| asset.tags.keys().next().cloned())
            .unwrap_or_else(|| self.config.default_tag.clone())
    }

    /// The asset's default pointer, else its first tag, else the configured
    /// default tag name.
    pub fn get_default_tag(&self, collection: &str, asset: &str) -> Result<String, RegistryError> {
        let digest = self.resolve_alias(collection)?;
        Ok(self
            .document
            .collections
            .get(&digest)
            .and_then(|c| c.assets.get(asset))
            .map(|a| self.default_tag_of(a))
            .unwrap_or_else(|| self.config.default_tag.clone()))
    }

    pub fn set_default_tag(
        &mut self,
        collection: &str,
        asset: &str,
        tag: &str,
    ) -> Result<(), RegistryError> {
        self.mutate(|doc| {
            let digest = resolve_in(doc, collection)?;
            let entry = asset_mut(doc, &digest, collection, asset)?;
            if !entry.tags.contains_key(tag) {
                return Err(missing_tag(collection, asset, tag));
            }
            entry.default_tag = Some(tag.to_string());
            Ok(())
        })?;
        info!(%collection, %asset, %tag, "set default tag");
        Ok(())
    }

    fn locate(
        &self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
    ) -> Result<(String, String, &Tag), RegistryError> {
        let digest = self.resolve_alias(collection)?;
        let entry = self
            .document
            .collections
            .get(&digest)
            .ok_or_else(|| RegistryError::MissingCollection(collection.to_string()))?
            .assets
            .get(asset)
            .ok_or_else(|| RegistryError::MissingAsset {
                collection: collection.to_string(),
                asset: asset.to_string(),
            })?;
        let tag_name = tag
            .map(str::to_string)
            .unwrap_or_else(|| self.default_tag_of(entry));
        let found = entry
            .tags
            .get(&tag_name)
            .ok_or_else(|| missing_tag(collection, asset, &tag_name))?;
        Ok((digest, tag_name, found))
    }

    /// Absolute artifact directory of a tag.
    pub fn tag_dir(&self, tag: &Tag) -> Utf8PathBuf {
        if tag.path.is_absolute() {
            tag.path.clone()
        } else {
            self.data_dir.join(&tag.path)
        }
    }

    /// Absolute path of `seek_key` (default: the asset name) within a tag.
    pub fn seek(
        &self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
        seek_key: Option<&str>,
        strict: bool,
    ) -> Result<Utf8PathBuf, RegistryError> {
        let (_, tag_name, entry) = self.locate(collection, asset, tag)?;
        let key = seek_key.unwrap_or(asset);
        let relative = match entry.seek_keys.get(key) {
            Some(relative) => relative.as_str(),
            None if key == asset => ".",
            None => {
                return Err(RegistryError::MissingSeekKey {
                    collection: collection.to_string(),
                    asset: asset.to_string(),
                    tag: tag_name,
                    seek_key: key.to_string(),
                });
            }
        };
        let dir = self.tag_dir(entry);
        let path = if relative.is_empty() || relative == "." {
            dir
        } else {
            dir.join(relative)
        };
        if strict && !path.as_std_path().exists() {
            return Err(RegistryError::MissingFile {
                collection: collection.to_string(),
                asset: asset.to_string(),
                tag: tag_name,
                path,
            });
        }
        debug!(%collection, %asset, tag = %tag_name, %key, %path, "seek");
        Ok(path)
    }

    /// Residues of a sequence, or a region of one, from the collection's
    /// `fasta` asset.
    pub fn get_sequence(&self, collection: &str, locus: &str) -> Result<String, RegistryError> {
        let locus: seqcol::Locus = locus.parse()?;
        let fasta = self.seek(collection, "fasta", None, None, true)?;
        seqcol::read_locus(&fasta, &locus)
    }

    /// The directory enclosing the tag's artifact.
    pub fn seek_dir(
        &self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
    ) -> Result<Utf8PathBuf, RegistryError> {
        let (_, _, entry) = self.locate(collection, asset, tag)?;
        Ok(self.tag_dir(entry))
    }

    pub fn asset_digest(
        &self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
    ) -> Result<Option<String>, RegistryError> {
        let (_, _, entry) = self.locate(collection, asset, tag)?;
        Ok(entry.asset_digest.clone())
    }

    pub fn list(&self, collection: Option<&str>) -> Result<Listing, RegistryError> {
        let digests = match collection {
            Some(name) => vec![self.resolve_alias(name)?],
            None => self.document.collections.keys().cloned().collect(),
        };
        let mut listing = Listing::new();
        for digest in digests {
            let Some(entry) = self.document.collections.get(&digest) else {
                continue;
            };
            let assets = entry
                .assets
                .iter()
                .map(|(name, asset)| (name.clone(), asset.tags.keys().cloned().collect()))
                .collect();
            let key = entry.aliases.first().cloned().unwrap_or(digest);
            listing.insert(key, assets);
        }
        Ok(listing)
    }

    /// Listings from `server`, or from every configured server that answers.
    pub fn list_remote(
        &self,
        catalog: &dyn CatalogClient,
        server: Option<&str>,
        as_digests: bool,
    ) -> Result<Vec<RemoteListing>, RegistryError> {
        let servers = match server {
            Some(server) => normalize_servers(&[server.to_string()]),
            None => self.document.servers.clone(),
        };
        let mut listings = Vec::new();
        let mut failures = Vec::new();
        for server in &servers {
            match catalog::listing_for(catalog, server, as_digests) {
                Ok(listing) => listings.push(listing),
                Err(err) if err.is_network() => {
                    warn!(%server, error = %err, "skipping server");
                    failures.push(ServerFailure {
                        server: server.clone(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        if listings.is_empty() {
            return Err(RegistryError::AllServersFailed {
                target: "remote listing".to_string(),
                failures,
            });
        }
        Ok(listings)
    }

    /// Ask the servers, in order, where they host a seek key of an asset.
    /// A name with no local alias is looked up on each server, and treated
    /// as a digest when the server does not know it either.
    pub fn seekr(
        &self,
        catalog: &dyn CatalogClient,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
        seek_key: Option<&str>,
        remote_class: &str,
    ) -> Result<String, RegistryError> {
        let target = AssetRef {
            collection: Some(collection.to_string()),
            asset: asset.to_string(),
            seek_key: seek_key.map(str::to_string),
            tag: tag.map(str::to_string),
        }
        .to_string();
        let (server, path) = try_servers(&self.document.servers, &target, |server| {
            let digest = match self.resolve_alias(collection) {
                Ok(digest) => digest,
                Err(RegistryError::MissingCollection(_)) => {
                    match catalog.alias_digest(server, collection) {
                        Ok(digest) => digest,
                        Err(RegistryError::TransportStatus { status: 404, .. }) => {
                            collection.to_string()
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };
            catalog.seek_path(
                server,
                &digest,
                asset,
                seek_key.unwrap_or(asset),
                tag,
                remote_class,
            )
        })?;
        debug!(%target, %server, %path, "remote seek");
        Ok(path)
    }

    /// Replace `refgenie://` references in `text` with local paths.
    pub fn populate(&self, text: &str) -> Result<String, RegistryError> {
        populate::populate_str(text, &mut |reference: &AssetRef| self.seek_reference(reference))
    }

    /// [`Registry::populate`] over every string in a JSON document.
    pub fn populate_json(&self, value: Value) -> Result<Value, RegistryError> {
        populate::populate_value(value, &mut |reference: &AssetRef| {
            self.seek_reference(reference)
        })
    }

    /// Replace `refgenie://` references in `text` with remote locations.
    /// References no server can answer are left in place.
    pub fn populate_remote(
        &self,
        catalog: &dyn CatalogClient,
        text: &str,
        remote_class: &str,
    ) -> Result<String, RegistryError> {
        populate::populate_str(text, &mut |reference: &AssetRef| {
            let collection = reference.collection.as_deref().unwrap_or_default();
            match self.seekr(
                catalog,
                collection,
                &reference.asset,
                reference.tag.as_deref(),
                reference.seek_key.as_deref(),
                remote_class,
            ) {
                Ok(path) => Ok(Some(path)),
                Err(RegistryError::AllServersFailed { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn seek_reference(&self, reference: &AssetRef) -> Result<Option<String>, RegistryError> {
        let collection = reference.collection.as_deref().unwrap_or_default();
        let path = self.seek(
            collection,
            &reference.asset,
            reference.tag.as_deref(),
            reference.seek_key.as_deref(),
            false,
        )?;
        Ok(Some(path.into_string()))
    }

    /// Register an artifact that is already on disk. A file registers its
    /// parent directory with the file as the asset's own seek key.
    pub fn add(
        &mut self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
        path: &Utf8Path,
        seek_keys: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<Utf8PathBuf, RegistryError> {
        validate_name(asset)?;
        let tag_name: TagName = tag.unwrap_or(self.config.default_tag.as_str()).parse()?;
        let tag_name = tag_name.to_string();
        let path = absolutize(path)?;
        let meta = fs::metadata(path.as_std_path()).map_err(|_| RegistryError::MissingFile {
            collection: collection.to_string(),
            asset: asset.to_string(),
            tag: tag_name.clone(),
            path: path.clone(),
        })?;

        let (tag_dir, default_key) = if meta.is_file() {
            let parent = path.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
            let file_name = path.file_name().unwrap_or_default().to_string();
            (parent, file_name)
        } else {
            (path.clone(), ".".to_string())
        };
        let mut keys = seek_keys.clone();
        keys.entry(asset.to_string()).or_insert(default_key);
        for (key, relative) in &keys {
            if !tag_dir.join(relative).as_std_path().exists() {
                warn!(%collection, %asset, %key, %relative, "seek key target does not exist");
            }
        }
        let asset_digest = digest::directory_digest(&path)?;

        let _guard = self.lock_exclusive(None)?;
        self.reload()?;
        let digest = match self.resolve_alias(collection) {
            Ok(digest) => digest,
            Err(RegistryError::MissingCollection(_)) if asset == "fasta" && meta.is_file() => {
                self.initialize_collection(&path, Some(collection))?
            }
            Err(err) => return Err(err),
        };

        let stored_path = match tag_dir.strip_prefix(&self.data_dir) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => tag_dir.clone(),
        };
        self.mutate(|doc| {
            let collection_entry = doc
                .collections
                .get_mut(&digest)
                .ok_or_else(|| RegistryError::MissingCollection(collection.to_string()))?;
            let asset_entry = collection_entry.assets.entry(asset.to_string()).or_default();
            let (parents, children) = match asset_entry.tags.get(&tag_name) {
                Some(_) if !force => {
                    return Err(RegistryError::TagExists {
                        collection: collection.to_string(),
                        asset: asset.to_string(),
                        tag: tag_name.clone(),
                    });
                }
                Some(existing) => (existing.parents.clone(), existing.children.clone()),
                None => (Vec::new(), Vec::new()),
            };
            asset_entry.tags.insert(
                tag_name.clone(),
                Tag {
                    path: stored_path,
                    asset_digest: Some(asset_digest),
                    seek_keys: keys,
                    parents,
                    children,
                    ..Tag::default()
                },
            );
            if asset_entry.default_tag.is_none() {
                asset_entry.default_tag = Some(tag_name.clone());
            }
            Ok(())
        })?;
        info!(%collection, %asset, tag = %tag_name, path = %tag_dir, "added asset");
        Ok(tag_dir)
    }

    /// Rename a tag or edit its metadata.
    pub fn tag(
        &mut self,
        collection: &str,
        asset: &str,
        tag: &str,
        edit: TagEdit,
    ) -> Result<(), RegistryError> {
        match edit {
            TagEdit::Rename(new_name) => self.rename_tag(collection, asset, tag, &new_name),
            TagEdit::Metadata(metadata) => {
                self.mutate(|doc| {
                    let digest = resolve_in(doc, collection)?;
                    let entry = asset_mut(doc, &digest, collection, asset)?
                        .tags
                        .get_mut(tag)
                        .ok_or_else(|| missing_tag(collection, asset, tag))?;
                    if let Some(description) = metadata.description {
                        entry.description = Some(description);
                    }
                    entry.seek_keys.extend(metadata.seek_keys);
                    Ok(())
                })
            }
        }
    }

    fn rename_tag(
        &mut self,
        collection: &str,
        asset: &str,
        tag: &str,
        new_name: &str,
    ) -> Result<(), RegistryError> {
        let new_name = new_name.parse::<TagName>()?.to_string();
        let _guard = self.lock_exclusive(None)?;
        self.reload()?;
        let (digest, old_name, entry) = self.locate(collection, asset, Some(tag))?;
        let old_path = entry.path.clone();
        let exists = self
            .document
            .tag(&digest, asset, &new_name)
            .is_some();
        if exists {
            return Err(RegistryError::TagExists {
                collection: collection.to_string(),
                asset: asset.to_string(),
                tag: new_name,
            });
        }

        let new_relative = Utf8PathBuf::from(format!("{digest}/{asset}/{new_name}"));
        let mut moved = None;
        if !old_path.is_absolute() {
            let from = self.data_dir.join(&old_path);
            let to = self.data_dir.join(&new_relative);
            if from.as_std_path().exists() {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent.as_std_path()).map_err(|err| {
                        RegistryError::Filesystem(format!("create {parent}: {err}"))
                    })?;
                }
                fs::rename(from.as_std_path(), to.as_std_path()).map_err(|err| {
                    RegistryError::Filesystem(format!("rename {from} -> {to}: {err}"))
                })?;
                moved = Some((from, to));
            }
        }

        let old_node = RelativeRef::new(&digest, asset, &old_name);
        let new_node = RelativeRef::new(&digest, asset, &new_name);
        let relative_path = (!old_path.is_absolute()).then_some(new_relative);
        let result = self.mutate(|doc| {
            let asset_entry = asset_mut(doc, &digest, collection, asset)?;
            let mut entry = asset_entry
                .tags
                .remove(&old_name)
                .ok_or_else(|| missing_tag(collection, asset, &old_name))?;
            if let Some(path) = relative_path {
                entry.path = path;
            }
            asset_entry.tags.insert(new_name.clone(), entry);
            if asset_entry.default_tag.as_deref() == Some(old_name.as_str()) {
                asset_entry.default_tag = Some(new_name.clone());
            }
            relations::rename_node(doc, &old_node, &new_node);
            Ok(())
        });
        if result.is_err()
            && let Some((from, to)) = moved
            && let Err(err) = fs::rename(to.as_std_path(), from.as_std_path())
        {
            warn!(%from, %to, error = %err, "failed to restore renamed tag directory");
        }
        result?;
        info!(%collection, %asset, from = %old_name, to = %new_name, "renamed tag");
        Ok(())
    }

    /// Remove one tag, or every tag of the asset. Neighbours' back-references
    /// are removed in the same transaction and artifact directories under the
    /// data directory are deleted while the lock is still held.
    pub fn remove(
        &mut self,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
    ) -> Result<Vec<String>, RegistryError> {
        let _guard = self.lock_exclusive(None)?;
        self.reload()?;
        let digest = self.resolve_alias(collection)?;
        let asset_entry = self
            .document
            .collections
            .get(&digest)
            .and_then(|c| c.assets.get(asset))
            .ok_or_else(|| RegistryError::MissingAsset {
                collection: collection.to_string(),
                asset: asset.to_string(),
            })?;
        let tags: Vec<String> = match tag {
            Some(tag) if asset_entry.tags.contains_key(tag) => vec![tag.to_string()],
            Some(tag) => return Err(missing_tag(collection, asset, tag)),
            None => asset_entry.tags.keys().cloned().collect(),
        };
        let dirs: Vec<Utf8PathBuf> = tags
            .iter()
            .filter_map(|t| asset_entry.tags.get(t))
            .filter_map(|t| self.owned_dir(t))
            .collect();

        self.mutate(|doc| {
            for tag in &tags {
                let node = RelativeRef::new(&digest, asset, tag);
                let repaired = relations::detach(doc, &node);
                debug!(%node, repaired, "detached relationships");
            }
            let asset_entry = asset_mut(doc, &digest, collection, asset)?;
            for tag in &tags {
                asset_entry.tags.remove(tag);
            }
            let default_gone = asset_entry
                .default_tag
                .as_ref()
                .is_some_and(|d| !asset_entry.tags.contains_key(d));
            if default_gone {
                asset_entry.default_tag = asset_entry.tags.keys().next().cloned();
            }
            if asset_entry.tags.is_empty()
                && let Some(entry) = doc.collections.get_mut(&digest)
            {
                entry.assets.remove(asset);
            }
            Ok(())
        })?;

        // directories still shared with a remaining tag stay
        for dir in dirs.into_iter().filter(|d| !self.is_registered_dir(d)) {
            fs_util::remove_path(&dir)
                .map_err(|err| RegistryError::Filesystem(format!("remove {dir}: {err}")))?;
            if let Some(parent) = dir.parent() {
                fs_util::prune_empty_dirs(parent, &self.data_dir);
            }
        }
        info!(%collection, %asset, tags = ?tags, "removed");
        Ok(tags)
    }

    /// Artifact directory the registry owns, i.e. one under the data dir.
    fn owned_dir(&self, tag: &Tag) -> Option<Utf8PathBuf> {
        let dir = self.tag_dir(tag);
        (dir != self.data_dir && dir.starts_with(&self.data_dir)).then_some(dir)
    }

    pub fn sequences_path(&self, digest: &str) -> Utf8PathBuf {
        self.data_dir.join(digest).join(SEQUENCES_FILE)
    }

    fn sequence_records(
        &self,
        name: &str,
        digest: &str,
    ) -> Result<Vec<seqcol::SequenceRecord>, RegistryError> {
        let path = self.sequences_path(digest);
        if !path.as_std_path().exists() {
            return Err(RegistryError::MissingAsset {
                collection: name.to_string(),
                asset: "fasta".to_string(),
            });
        }
        seqcol::load_records(&path)
    }

    /// Compare the sequence collections of two collections.
    pub fn compare(&self, a: &str, b: &str) -> Result<Comparison, RegistryError> {
        let digest_a = self.resolve_alias(a)?;
        let digest_b = self.resolve_alias(b)?;
        let records_a = self.sequence_records(a, &digest_a)?;
        let records_b = self.sequence_records(b, &digest_b)?;
        Ok(seqcol::compare_records(&records_a, &records_b))
    }

    /// Derive a collection digest from a FASTA file, record its sequences and
    /// create the collection, optionally aliased.
    pub fn initialize_collection(
        &mut self,
        fasta: &Utf8Path,
        alias: Option<&str>,
    ) -> Result<String, RegistryError> {
        let records = seqcol::fasta_records(fasta)?;
        let digest = seqcol::collection_digest(&records);
        seqcol::save_records(&self.sequences_path(&digest), &records)?;
        self.mutate(|doc| {
            doc.collections.entry(digest.clone()).or_default();
            if let Some(alias) = alias {
                assign_aliases(doc, &digest, &[alias.to_string()], false)?;
            }
            Ok(())
        })?;
        info!(%digest, alias = alias.unwrap_or(""), sequences = records.len(), "initialized collection");
        Ok(digest)
    }

    /// Point `aliases` at `digest`, creating the collection entry if needed.
    /// With `reset`, the collection's other aliases are dropped.
    pub fn set_alias(
        &mut self,
        digest: &str,
        aliases: &[String],
        reset: bool,
    ) -> Result<AliasUpdate, RegistryError> {
        let update = self.mutate(|doc| assign_aliases(doc, digest, aliases, reset))?;
        info!(%digest, set = ?update.set, removed = ?update.removed, "updated aliases");
        Ok(update)
    }

    /// Remove the given aliases of a collection, or all of them.
    pub fn remove_aliases(
        &mut self,
        collection: &str,
        aliases: Option<&[String]>,
    ) -> Result<Vec<String>, RegistryError> {
        let (digest, removed) = self.mutate(|doc| {
            let digest = resolve_in(doc, collection)?;
            let removed = unassign_aliases(doc, &digest, aliases);
            Ok((digest, removed))
        })?;
        info!(%digest, removed = ?removed, "removed aliases");
        Ok(removed)
    }

    pub fn update_servers(
        &mut self,
        servers: &[String],
        action: ServerAction,
    ) -> Result<Vec<String>, RegistryError> {
        let servers = normalize_servers(servers);
        let updated = self.mutate(|doc| {
            match action {
                ServerAction::Add => {
                    for server in servers {
                        if !doc.servers.contains(&server) {
                            doc.servers.push(server);
                        }
                    }
                }
                ServerAction::Remove => doc.servers.retain(|s| !servers.contains(s)),
                ServerAction::Replace => doc.servers = servers,
            }
            Ok(doc.servers.clone())
        })?;
        info!(servers = ?updated, "updated servers");
        Ok(updated)
    }

    /// Make every relationship edge symmetric, returning what was repaired.
    pub fn repair_relationships(&mut self) -> Result<Vec<(String, String)>, RegistryError> {
        self.mutate(|doc| Ok(relations::repair(doc)))
    }

    /// Delete staging leftovers from interrupted pulls and report artifact
    /// directories no tag points to.
    pub fn prune_staging(&mut self) -> Result<PruneReport, RegistryError> {
        let _guard = self.lock_exclusive(None)?;
        self.reload()?;
        let mut report = PruneReport::default();
        let Ok(collections) = fs::read_dir(self.data_dir.as_std_path()) else {
            return Ok(report);
        };
        for collection in collections.flatten() {
            let Some(digest) = utf8_dir(&collection) else {
                continue;
            };
            let Ok(assets) = fs::read_dir(digest.as_std_path()) else {
                continue;
            };
            for asset in assets.flatten() {
                let Some(asset_dir) = utf8_dir(&asset) else {
                    continue;
                };
                let Ok(tags) = fs::read_dir(asset_dir.as_std_path()) else {
                    continue;
                };
                for entry in tags.flatten() {
                    let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                        continue;
                    };
                    let name = path.file_name().unwrap_or_default();
                    if name.starts_with(STAGING_PREFIX) {
                        fs_util::remove_path(&path).map_err(|err| {
                            RegistryError::Filesystem(format!("remove {path}: {err}"))
                        })?;
                        info!(%path, "removed staging leftover");
                        report.removed.push(path);
                    } else if path.is_dir() && !self.is_registered_dir(&path) {
                        report.unregistered.push(path);
                    }
                }
            }
        }
        Ok(report)
    }

    fn is_registered_dir(&self, dir: &Utf8Path) -> bool {
        self.document.collections.values().any(|c| {
            c.assets
                .values()
                .any(|a| a.tags.values().any(|t| self.tag_dir(t) == dir))
        })
    }
}

fn utf8_dir(entry: &fs::DirEntry) -> Option<Utf8PathBuf> {
    if !entry.file_type().ok()?.is_dir() {
        return None;
    }
    Utf8PathBuf::from_path_buf(entry.path()).ok()
}

fn resolve_in(doc: &Document, name: &str) -> Result<String, RegistryError> {
    if let Some(digest) = doc.aliases.get(name) {
        return Ok(digest.clone());
    }
    if doc.collections.contains_key(name) {
        return Ok(name.to_string());
    }
    Err(RegistryError::MissingCollection(name.to_string()))
}

fn missing_tag(collection: &str, asset: &str, tag: &str) -> RegistryError {
    RegistryError::MissingTag {
        collection: collection.to_string(),
        asset: asset.to_string(),
        tag: tag.to_string(),
    }
}

fn asset_mut<'a>(
    doc: &'a mut Document,
    digest: &str,
    collection: &str,
    asset: &str,
) -> Result<&'a mut Asset, RegistryError> {
    doc.collections
        .get_mut(digest)
        .ok_or_else(|| RegistryError::MissingCollection(collection.to_string()))?
        .assets
        .get_mut(asset)
        .ok_or_else(|| RegistryError::MissingAsset {
            collection: collection.to_string(),
            asset: asset.to_string(),
        })
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c == '/' || c == ':' || c == '.' || c.is_whitespace());
    if bad {
        return Err(RegistryError::InvalidRegistryPath(name.to_string()));
    }
    Ok(())
}

fn absolutize(path: &Utf8Path) -> Result<Utf8PathBuf, RegistryError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|err| RegistryError::Filesystem(format!("current directory: {err}")))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|bad| {
        RegistryError::Filesystem(format!("non-utf8 current directory {}", bad.display()))
    })?;
    Ok(cwd.join(path))
}

pub(crate) fn normalize_servers(servers: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for server in servers {
        let server = server.trim().trim_end_matches('/');
        if !server.is_empty() && !out.iter().any(|s| s == server) {
            out.push(server.to_string());
        }
    }
    out
}

/// Point `aliases` at `digest`. Every alias is checked for collisions before
/// anything changes.
pub(crate) fn assign_aliases(
    doc: &mut Document,
    digest: &str,
    aliases: &[String],
    reset: bool,
) -> Result<AliasUpdate, RegistryError> {
    for alias in aliases {
        validate_name(alias)?;
        if let Some(existing) = doc.aliases.get(alias)
            && existing != digest
        {
            return Err(RegistryError::AliasCollision {
                alias: alias.clone(),
                existing: existing.clone(),
            });
        }
    }
    let mut update = AliasUpdate::default();
    if reset {
        let stale: Vec<String> = doc
            .collections
            .get(digest)
            .map(|c| {
                c.aliases
                    .iter()
                    .filter(|a| !aliases.contains(a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        update.removed = unassign_aliases(doc, digest, Some(&stale));
    }
    let collection = doc.collections.entry(digest.to_string()).or_default();
    for alias in aliases {
        if collection.aliases.contains(alias) {
            continue;
        }
        collection.aliases.push(alias.clone());
        doc.aliases.insert(alias.clone(), digest.to_string());
        update.set.push(alias.clone());
    }
    Ok(update)
}

pub(crate) fn unassign_aliases(
    doc: &mut Document,
    digest: &str,
    aliases: Option<&[String]>,
) -> Vec<String> {
    let Some(collection) = doc.collections.get_mut(digest) else {
        return Vec::new();
    };
    let removed: Vec<String> = collection
        .aliases
        .iter()
        .filter(|a| aliases.is_none_or(|wanted| wanted.contains(a)))
        .cloned()
        .collect();
    collection.aliases.retain(|a| !removed.contains(a));
    for alias in &removed {
        doc.aliases.remove(alias);
    }
    removed
}
