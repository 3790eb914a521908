//! The pull orchestrator: reconcile a local tag with a remote catalog.
//!
//! Per request: resolve identity, check what is already installed, assert
//! provenance, download into a staging directory, verify the archive digest,
//! extract, and register the tag under the exclusive lock. Nothing reaches
//! the registry document until the final commit, so a failed or cancelled
//! pull leaves it untouched.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::catalog::{AssetAttributes, CatalogClient, try_servers};
use crate::config::DEFAULT_SIZE_CUTOFF_GB;
use crate::digest;
use crate::domain::{RelativeRef, TagName};
use crate::error::RegistryError;
use crate::fetch::{ExtractManifest, Extractor, Fetcher};
use crate::fs_util;
use crate::hooks::{HookContext, HookPoint, Hooks};
use crate::registry::{Registry, STAGING_PREFIX, assign_aliases};
use crate::relations;
use crate::seqcol::{self, Compatibility};
use crate::store::{Document, Tag};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// What to do when the requested tag is installed but differs from the
/// server's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    Abort,
    Overwrite,
    #[default]
    Skip,
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub overwrite: OverwritePolicy,
    pub force_large: bool,
    pub size_cutoff_gb: f64,
    pub pull_parents: bool,
    pub cancel: CancelToken,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            overwrite: OverwritePolicy::default(),
            force_large: false,
            size_cutoff_gb: DEFAULT_SIZE_CUTOFF_GB,
            pull_parents: true,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullOutcome {
    Downloaded,
    AlreadyCurrent,
    Skipped,
    SkippedLarge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullReport {
    /// Collection digest.
    pub collection: String,
    pub alias: Option<String>,
    pub asset: String,
    pub tag: String,
    pub outcome: PullOutcome,
    pub downloaded: bool,
    pub path: Option<Utf8PathBuf>,
    pub server: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Request<'r> {
    collection: &'r str,
    asset: &'r str,
    tag: Option<&'r str>,
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.asset)?;
        if let Some(tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// Everything the commit step writes for one pulled tag.
struct Registration<'a> {
    digest: &'a str,
    alias: Option<&'a str>,
    asset: &'a str,
    tag: &'a str,
    remote_digest: &'a str,
    attrs: &'a AssetAttributes,
    seek_keys: BTreeMap<String, String>,
    parents: &'a [RelativeRef],
    description: Option<String>,
}

/// Archive size strings look like `15.4GB`; megabytes and kilobytes are
/// converted, terabytes always count as large.
pub fn is_large_archive(size: &str, cutoff_gb: f64) -> bool {
    let size = size.trim();
    if size.ends_with("TB") {
        return true;
    }
    let number = size
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>()
        .parse::<f64>()
        .ok();
    let gigabytes = if size.ends_with("GB") {
        number
    } else if size.ends_with("MB") {
        number.map(|v| v / 1000.0)
    } else if size.ends_with("KB") {
        number.map(|v| v / 1_000_000.0)
    } else {
        None
    };
    gigabytes.is_some_and(|gb| gb > cutoff_gb)
}

pub struct Puller<C, F, E> {
    catalog: C,
    fetcher: F,
    extractor: E,
    hooks: Hooks,
}

impl<C: CatalogClient, F: Fetcher, E: Extractor> Puller<C, F, E> {
    pub fn new(catalog: C, fetcher: F, extractor: E) -> Self {
        Self {
            catalog,
            fetcher,
            extractor,
            hooks: Hooks::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Pull `collection/asset:tag`, trying the registry's servers in order.
    pub fn pull(
        &self,
        registry: &mut Registry,
        collection: &str,
        asset: &str,
        tag: Option<&str>,
        options: &PullOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PullReport, RegistryError> {
        let request = Request {
            collection,
            asset,
            tag,
        };
        let mut visited = HashSet::new();
        let report = self.pull_request(registry, request, options, sink, &mut visited)?;
        info!(
            collection = %report.collection,
            asset = %report.asset,
            tag = %report.tag,
            outcome = ?report.outcome,
            "pull finished"
        );
        Ok(report)
    }

    fn pull_request(
        &self,
        registry: &mut Registry,
        request: Request<'_>,
        options: &PullOptions,
        sink: &dyn ProgressSink,
        visited: &mut HashSet<String>,
    ) -> Result<PullReport, RegistryError> {
        options.cancel.check("pull")?;
        registry.reload()?;
        let servers = registry.servers().to_vec();
        let target = request.to_string();
        let (_, report) = try_servers(&servers, &target, |server| {
            self.pull_from(registry, server, request, options, sink, visited)
        })?;
        Ok(report)
    }

    fn pull_from(
        &self,
        registry: &mut Registry,
        server: &str,
        request: Request<'_>,
        options: &PullOptions,
        sink: &dyn ProgressSink,
        visited: &mut HashSet<String>,
    ) -> Result<PullReport, RegistryError> {
        let started = Instant::now();
        let progress = |message: String| {
            sink.event(ProgressEvent {
                message,
                elapsed: Some(started.elapsed()),
            })
        };
        let asset = request.asset;

        let digest = match registry.resolve_alias(request.collection) {
            Ok(digest) => digest,
            // servers answer 404 for names that are already digests
            Err(RegistryError::MissingCollection(_)) => {
                match self.catalog.alias_digest(server, request.collection) {
                    Ok(digest) => digest,
                    Err(RegistryError::TransportStatus { status: 404, .. }) => {
                        request.collection.to_string()
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        let alias = (digest != request.collection).then(|| request.collection.to_string());
        let tag = match request.tag {
            Some(tag) => tag.to_string(),
            None => match self.catalog.default_tag(server, &digest, asset) {
                Ok(tag) => tag,
                Err(RegistryError::TransportStatus { .. }) => registry.config().default_tag.clone(),
                Err(err) => return Err(err),
            },
        };
        let tag = tag.parse::<TagName>()?.to_string();
        let gat = format!("{}/{asset}:{tag}", request.collection);
        progress(format!("phase=Resolve; {gat} is {digest} on {server}"));

        let remote_digest = self.catalog.fetch_digest(server, &digest, asset, &tag)?;
        let mut report = PullReport {
            collection: digest.clone(),
            alias: alias.clone(),
            asset: asset.to_string(),
            tag: tag.clone(),
            outcome: PullOutcome::Skipped,
            downloaded: false,
            path: None,
            server: Some(server.to_string()),
            warnings: Vec::new(),
        };

        if let Some(existing) = registry.document().tag(&digest, asset, &tag) {
            let dir = registry.tag_dir(existing);
            if existing.asset_digest.as_deref() == Some(remote_digest.as_str()) {
                progress(format!("phase=Check; {gat} is current"));
                report.outcome = PullOutcome::AlreadyCurrent;
                report.path = Some(dir);
                return Ok(report);
            }
            match options.overwrite {
                OverwritePolicy::Abort => {
                    return Err(RegistryError::TagExists {
                        collection: request.collection.to_string(),
                        asset: asset.to_string(),
                        tag,
                    });
                }
                OverwritePolicy::Skip => {
                    info!(%gat, "preserving existing tag");
                    progress(format!("phase=Check; preserving {gat}"));
                    report.path = Some(dir);
                    return Ok(report);
                }
                OverwritePolicy::Overwrite => {
                    debug!(%gat, "overwriting existing tag");
                }
            }
        }

        let attrs = self.catalog.asset_attributes(server, &digest, asset, &tag)?;
        if let Some(size) = attrs.archive_size.as_deref()
            && !options.force_large
            && is_large_archive(size, options.size_cutoff_gb)
        {
            info!(%gat, %size, "skipping large archive");
            progress(format!("phase=Check; skipping {gat} ({size})"));
            report.outcome = PullOutcome::SkippedLarge;
            return Ok(report);
        }

        let parents = self.assert_provenance(
            registry, server, &digest, &gat, &attrs, options, sink, visited,
        )?;

        let context = HookContext {
            collection: &digest,
            asset,
            tag: &tag,
            path: None,
        };
        report
            .warnings
            .extend(self.hooks.run(HookPoint::PrePull, &context)?);

        let expected = attrs
            .archive_digest
            .clone()
            .ok_or_else(|| RegistryError::MissingArchiveDigest {
                target: gat.clone(),
                server: server.to_string(),
            })?;
        let url = self.catalog.archive_url(server, &digest, asset, &tag)?;

        let has_description = registry
            .document()
            .collections
            .get(&digest)
            .is_some_and(|c| c.description.is_some());
        let description = if has_description {
            None
        } else {
            match self.catalog.fetch_description(server, &digest) {
                Ok(description) => description,
                Err(err) => {
                    warn!(%server, %digest, error = %err, "description unavailable");
                    report
                        .warnings
                        .push(format!("description unavailable from {server}: {err}"));
                    None
                }
            }
        };

        let asset_dir = registry.data_dir().join(&digest).join(asset);
        let staged = self.download(&asset_dir, &url, &expected, &gat, server, options, &progress);
        let committed = staged.and_then(|(staging, root, manifest)| {
            let seek_keys = if attrs.seek_keys.is_empty() {
                manifest_seek_keys(asset, &manifest, &root, &staging)
            } else {
                attrs.seek_keys.clone()
            };
            options.cancel.check("pull")?;
            progress(format!("phase=Register; {gat}"));
            let registration = Registration {
                digest: &digest,
                alias: alias.as_deref(),
                asset,
                tag: &tag,
                remote_digest: &remote_digest,
                attrs: &attrs,
                seek_keys,
                parents: &parents,
                description,
            };
            commit(registry, &asset_dir, &root, &registration, &options.cancel)
        });
        let tag_dir = match committed {
            Ok(tag_dir) => tag_dir,
            Err(err) => {
                fs_util::prune_empty_dirs(&asset_dir, registry.data_dir());
                return Err(err);
            }
        };
        report.outcome = PullOutcome::Downloaded;
        report.downloaded = true;
        report.path = Some(tag_dir.clone());

        if asset == "fasta" {
            match record_sequences(registry, &digest, &tag) {
                Ok(Some(warning)) => report.warnings.push(warning),
                Ok(None) => {}
                Err(err) => report
                    .warnings
                    .push(format!("could not record sequences for {gat}: {err}")),
            }
        }

        let context = HookContext {
            collection: &digest,
            asset,
            tag: &tag,
            path: Some(&tag_dir),
        };
        report
            .warnings
            .extend(self.hooks.run(HookPoint::PostPull, &context)?);
        progress(format!("phase=Done; {gat} -> {tag_dir}"));
        Ok(report)
    }

    /// Every declared parent must be installed with the digest the server
    /// expects. Missing parents are pulled first when allowed.
    #[allow(clippy::too_many_arguments)]
    fn assert_provenance(
        &self,
        registry: &mut Registry,
        server: &str,
        digest: &str,
        gat: &str,
        attrs: &AssetAttributes,
        options: &PullOptions,
        sink: &dyn ProgressSink,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<RelativeRef>, RegistryError> {
        let provenance = |message: String| RegistryError::Provenance {
            target: gat.to_string(),
            message,
        };
        let mut parents = Vec::new();
        for raw in &attrs.parents {
            let parent = RelativeRef::parse_in(raw, digest)
                .map_err(|_| provenance(format!("malformed parent reference '{raw}'")))?;
            let key = parent.to_string();
            let installed = registry
                .document()
                .tag(&parent.collection, &parent.asset, &parent.tag)
                .map(|t| t.asset_digest.clone());

            match installed {
                Some(local) => {
                    let remote = self.catalog.fetch_digest(
                        server,
                        &parent.collection,
                        &parent.asset,
                        &parent.tag,
                    )?;
                    if let Some(local) = local
                        && local != remote
                    {
                        return Err(provenance(format!(
                            "installed parent {key} has digest {local}, {server} expects {remote}"
                        )));
                    }
                }
                None => {
                    if !options.pull_parents {
                        return Err(provenance(format!("parent {key} is not installed")));
                    }
                    if !visited.insert(key.clone()) {
                        return Err(provenance(format!("parent {key} is part of a cycle")));
                    }
                    sink.event(ProgressEvent {
                        message: format!("phase=Parents; pulling {key}"),
                        elapsed: None,
                    });
                    let request = Request {
                        collection: &parent.collection,
                        asset: &parent.asset,
                        tag: Some(&parent.tag),
                    };
                    self.pull_request(registry, request, options, sink, visited)
                        .map_err(|err| match err {
                            RegistryError::Cancelled(_) => err,
                            other => provenance(format!("parent {key}: {other}")),
                        })?;
                    if registry
                        .document()
                        .tag(&parent.collection, &parent.asset, &parent.tag)
                        .is_none()
                    {
                        return Err(provenance(format!("parent {key} could not be installed")));
                    }
                }
            }
            parents.push(parent);
        }
        Ok(parents)
    }

    /// Fetch and verify the archive, then extract it inside a staging
    /// directory that is removed on drop.
    #[allow(clippy::too_many_arguments)]
    fn download(
        &self,
        asset_dir: &Utf8Path,
        url: &str,
        expected: &str,
        gat: &str,
        server: &str,
        options: &PullOptions,
        progress: &dyn Fn(String),
    ) -> Result<(tempfile::TempDir, Utf8PathBuf, ExtractManifest), RegistryError> {
        fs::create_dir_all(asset_dir.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("create {asset_dir}: {err}")))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{STAGING_PREFIX}stage"))
            .tempdir_in(asset_dir.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("staging in {asset_dir}: {err}")))?;
        let staging_path = utf8(staging.path())?;

        progress(format!("phase=Download; {url}"));
        let archive = staging_path.join("archive");
        let bytes = self.fetcher.fetch(url, &archive, &options.cancel)?;

        progress(format!("phase=Verify; {bytes} bytes"));
        let expected = expected.to_ascii_lowercase();
        let actual = digest::archive_checksum(&archive, &expected)?;
        if actual != expected {
            warn!(%gat, %server, %expected, %actual, "archive digest mismatch");
            return Err(RegistryError::DigestMismatch {
                target: gat.to_string(),
                server: server.to_string(),
                expected,
                actual,
            });
        }

        options.cancel.check("pull")?;
        progress(format!("phase=Extract; {gat}"));
        let content = staging_path.join("content");
        let manifest = self.extractor.extract(&archive, &content)?;
        fs::remove_file(archive.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("remove {archive}: {err}")))?;
        let root = fs_util::single_top_level_dir(&content)
            .map_err(|err| RegistryError::Filesystem(format!("read {content}: {err}")))?
            .unwrap_or(content);
        Ok((staging, root, manifest))
    }
}

/// Seek keys when the server publishes none: a lone file is the asset's own
/// key, otherwise the asset resolves to its directory.
fn manifest_seek_keys(
    asset: &str,
    manifest: &ExtractManifest,
    root: &Utf8Path,
    staging: &tempfile::TempDir,
) -> BTreeMap<String, String> {
    let mut keys = BTreeMap::new();
    let content = staging.path().join("content");
    let files: Vec<Utf8PathBuf> = manifest
        .files
        .iter()
        .filter_map(|file| {
            let absolute = content.join(file.as_std_path());
            let relative = absolute.strip_prefix(root.as_std_path()).ok()?;
            Utf8PathBuf::from_path_buf(relative.to_path_buf()).ok()
        })
        .collect();
    let value = match files.as_slice() {
        [only] => only.to_string(),
        _ => ".".to_string(),
    };
    keys.insert(asset.to_string(), value);
    keys
}

/// Move the extracted tree into place and register the tag, all under the
/// exclusive lock. A replaced directory is restored if the commit fails.
fn commit(
    registry: &mut Registry,
    asset_dir: &Utf8Path,
    root: &Utf8Path,
    registration: &Registration<'_>,
    cancel: &CancelToken,
) -> Result<Utf8PathBuf, RegistryError> {
    let _guard = registry.lock_exclusive(Some(cancel))?;
    let tag_dir = asset_dir.join(registration.tag);
    let fs_err = |what: &str, err: std::io::Error| RegistryError::Filesystem(format!("{what}: {err}"));

    let previous = if tag_dir.as_std_path().exists() {
        let trash = tempfile::Builder::new()
            .prefix(&format!("{STAGING_PREFIX}trash"))
            .tempdir_in(asset_dir.as_std_path())
            .map_err(|err| fs_err("create trash", err))?;
        let old = utf8(trash.path())?.join("previous");
        fs::rename(tag_dir.as_std_path(), old.as_std_path())
            .map_err(|err| fs_err("move previous tag aside", err))?;
        Some((trash, old))
    } else {
        None
    };
    let restore = |previous: &Option<(tempfile::TempDir, Utf8PathBuf)>| {
        if let Some((_, old)) = previous
            && let Err(err) = fs::rename(old.as_std_path(), tag_dir.as_std_path())
        {
            warn!(path = %tag_dir, error = %err, "failed to restore previous tag directory");
        }
    };

    if let Err(err) = fs::rename(root.as_std_path(), tag_dir.as_std_path()) {
        restore(&previous);
        return Err(fs_err("move extracted asset into place", err));
    }

    let pulled_at = chrono::Utc::now().to_rfc3339();
    let committed = registry.mutate(|doc| register(doc, registration, pulled_at));
    if let Err(err) = committed {
        if let Err(remove_err) = fs_util::remove_path(&tag_dir) {
            warn!(path = %tag_dir, error = %remove_err, "failed to remove uncommitted tag");
        }
        restore(&previous);
        return Err(err);
    }
    Ok(tag_dir)
}

fn register(
    doc: &mut Document,
    registration: &Registration<'_>,
    pulled_at: String,
) -> Result<(), RegistryError> {
    let digest = registration.digest;
    let attrs = registration.attrs;
    doc.collections.entry(digest.to_string()).or_default();
    if let Some(alias) = registration.alias
        && !doc.aliases.contains_key(alias)
    {
        assign_aliases(doc, digest, &[alias.to_string()], false)?;
    }

    let collection = doc
        .collections
        .get_mut(digest)
        .ok_or_else(|| RegistryError::MissingCollection(digest.to_string()))?;
    if collection.description.is_none() {
        collection.description = registration.description.clone();
    }
    let node = RelativeRef::new(digest, registration.asset, registration.tag);
    relations::detach_from_parents(doc, &node);

    let collection = doc
        .collections
        .get_mut(digest)
        .ok_or_else(|| RegistryError::MissingCollection(digest.to_string()))?;
    let asset = collection
        .assets
        .entry(registration.asset.to_string())
        .or_default();
    let children = asset
        .tags
        .get(registration.tag)
        .map(|t| t.children.clone())
        .unwrap_or_default();
    asset.tags.insert(
        registration.tag.to_string(),
        Tag {
            path: Utf8PathBuf::from(format!(
                "{digest}/{}/{}",
                registration.asset, registration.tag
            )),
            asset_digest: Some(registration.remote_digest.to_string()),
            archive_digest: attrs.archive_digest.clone(),
            archive_size: attrs.archive_size.clone(),
            asset_size: attrs.asset_size.clone(),
            seek_keys: registration.seek_keys.clone(),
            parents: Vec::new(),
            children,
            description: attrs.description.clone(),
            pulled_at: Some(pulled_at),
        },
    );
    if asset.default_tag.is_none() {
        asset.default_tag = Some(registration.tag.to_string());
    }

    for parent in registration.parents {
        relations::link(doc, &node, parent);
    }
    Ok(())
}

/// Record the sequence collection of a pulled FASTA so collections can be
/// compared later. Returns a warning for a digest or content disagreement.
fn record_sequences(
    registry: &Registry,
    digest: &str,
    tag: &str,
) -> Result<Option<String>, RegistryError> {
    let path = registry.seek(digest, "fasta", Some(tag), Some("fasta"), true)?;
    let fasta = if path.is_dir() {
        find_fasta(&path).ok_or_else(|| RegistryError::MissingSeekKey {
            collection: digest.to_string(),
            asset: "fasta".to_string(),
            tag: tag.to_string(),
            seek_key: "fasta".to_string(),
        })?
    } else {
        path
    };
    let records = seqcol::fasta_records(&fasta)?;
    let computed = seqcol::collection_digest(&records);
    let records_path = registry.sequences_path(digest);
    let mut warning = None;
    if records_path.as_std_path().exists() {
        let previous = seqcol::load_records(&records_path)?;
        if seqcol::compare_records(&previous, &records).compatibility != Compatibility::Identical {
            warning = Some(format!(
                "pulled fasta for {digest} changes its previously recorded sequences"
            ));
        }
    }
    if computed != digest {
        warning = Some(format!(
            "sequence collection digest {computed} differs from collection {digest}"
        ));
    }
    seqcol::save_records(&records_path, &records)?;
    Ok(warning)
}

fn find_fasta(dir: &Utf8Path) -> Option<Utf8PathBuf> {
    const EXTENSIONS: &[&str] = &[".fa", ".fasta", ".fna", ".fa.gz", ".fasta.gz", ".fna.gz"];
    let mut entries: Vec<Utf8PathBuf> = fs::read_dir(dir.as_std_path())
        .ok()?
        .flatten()
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();
    entries.into_iter().find(|path| {
        let name = path.file_name().unwrap_or_default();
        EXTENSIONS.iter().any(|ext| name.ends_with(ext))
    })
}

fn utf8(path: &std::path::Path) -> Result<Utf8PathBuf, RegistryError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|bad| RegistryError::Filesystem(format!("non-utf8 path {}", bad.display())))
}
