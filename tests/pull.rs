use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

use kira_genome_registry::cancel::CancelToken;
use kira_genome_registry::catalog::{AssetAttributes, CatalogClient};
use kira_genome_registry::config::RegistryConfig;
use kira_genome_registry::digest::{ArchiveAlgorithm, archive_checksum_reader, archive_digest_reader};
use kira_genome_registry::error::RegistryError;
use kira_genome_registry::fetch::{ArchiveExtractor, Fetcher};
use kira_genome_registry::hooks::{FnHook, HookPoint, HookRecord, Hooks};
use kira_genome_registry::pull::{
    OverwritePolicy, ProgressEvent, ProgressSink, PullOptions, PullOutcome, Puller,
};
use kira_genome_registry::registry::Registry;
use kira_genome_registry::relations;

const SERVER_A: &str = "http://a.example";
const SERVER_B: &str = "http://b.example";

struct Remote {
    asset_digest: String,
    attrs: AssetAttributes,
    archive: Vec<u8>,
}

type Archives = Arc<Mutex<HashMap<String, Vec<u8>>>>;

#[derive(Default)]
struct MockCatalog {
    down: Vec<String>,
    aliases: HashMap<String, String>,
    assets: Mutex<HashMap<(String, String, String), Remote>>,
    archives: Archives,
}

impl MockCatalog {
    fn unreachable(&self, server: &str) -> Result<(), RegistryError> {
        if self.down.iter().any(|s| s == server) {
            return Err(RegistryError::Transport {
                url: server.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, digest: &str, asset: &str, tag: &str, remote: Remote) {
        self.archives
            .lock()
            .unwrap()
            .insert(archive_url(digest, asset, tag), remote.archive.clone());
        self.assets.lock().unwrap().insert(
            (digest.to_string(), asset.to_string(), tag.to_string()),
            remote,
        );
    }

    fn with_remote<T>(
        &self,
        digest: &str,
        asset: &str,
        tag: &str,
        read: impl FnOnce(&Remote) -> T,
    ) -> Result<T, RegistryError> {
        let assets = self.assets.lock().unwrap();
        let key = (digest.to_string(), asset.to_string(), tag.to_string());
        assets
            .get(&key)
            .map(read)
            .ok_or_else(|| RegistryError::TransportStatus {
                url: archive_url(digest, asset, tag),
                status: 404,
            })
    }
}

fn archive_url(digest: &str, asset: &str, tag: &str) -> String {
    format!("mock://{digest}/{asset}/{tag}")
}

impl CatalogClient for MockCatalog {
    fn alias_digest(&self, server: &str, alias: &str) -> Result<String, RegistryError> {
        self.unreachable(server)?;
        self.aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| RegistryError::TransportStatus {
                url: format!("{server}/alias/{alias}"),
                status: 404,
            })
    }

    fn default_tag(&self, server: &str, _digest: &str, _asset: &str) -> Result<String, RegistryError> {
        self.unreachable(server)?;
        Ok("default".to_string())
    }

    fn asset_attributes(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<AssetAttributes, RegistryError> {
        self.unreachable(server)?;
        self.with_remote(digest, asset, tag, |r| r.attrs.clone())
    }

    fn fetch_digest(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError> {
        self.unreachable(server)?;
        self.with_remote(digest, asset, tag, |r| r.asset_digest.clone())
    }

    fn archive_url(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError> {
        self.unreachable(server)?;
        Ok(archive_url(digest, asset, tag))
    }

    fn fetch_description(&self, server: &str, _digest: &str) -> Result<Option<String>, RegistryError> {
        self.unreachable(server)?;
        Ok(Some("Human reference".to_string()))
    }

    fn list_assets(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError> {
        self.unreachable(server)?;
        Ok(BTreeMap::new())
    }

    fn aliases(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError> {
        self.unreachable(server)?;
        Ok(BTreeMap::new())
    }

    fn seek_path(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        seek_key: &str,
        tag: Option<&str>,
        remote_class: &str,
    ) -> Result<String, RegistryError> {
        self.unreachable(server)?;
        let tag = tag.unwrap_or("default");
        self.with_remote(digest, asset, tag, |_| {
            format!("{remote_class}://{server}/{digest}/{asset}/{seek_key}")
        })
    }
}

/// Serves the archives published on the catalog it was built from.
struct MockFetcher {
    archives: Archives,
    cancel_during_fetch: bool,
}

impl Fetcher for MockFetcher {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<u64, RegistryError> {
        if self.cancel_during_fetch {
            cancel.cancel();
        }
        cancel.check("download")?;
        let bytes = self
            .archives
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RegistryError::TransportStatus {
                url: url.to_string(),
                status: 404,
            })?;
        fs::write(destination.as_std_path(), &bytes).unwrap();
        Ok(bytes.len() as u64)
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn tgz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn remote(asset_digest: &str, archive: Vec<u8>, seek_keys: &[(&str, &str)]) -> Remote {
    let archive_digest = archive_digest_reader(archive.as_slice()).unwrap();
    Remote {
        asset_digest: asset_digest.to_string(),
        attrs: AssetAttributes {
            asset_digest: Some(asset_digest.to_string()),
            archive_digest: Some(archive_digest),
            archive_size: Some(format!("{}KB", archive.len() / 1000 + 1)),
            seek_keys: seek_keys
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..AssetAttributes::default()
        },
        archive,
    }
}

fn bowtie_remote(asset_digest: &str, payload: &[u8]) -> Remote {
    remote(
        asset_digest,
        tgz(&[("bowtie2_index/hg38.1.bt2", payload)]),
        &[("bowtie2_index", "."), ("index", "hg38.1.bt2")],
    )
}

type MockPuller = Puller<MockCatalog, MockFetcher, ArchiveExtractor>;

fn puller(down: &[&str]) -> MockPuller {
    let catalog = MockCatalog {
        down: down.iter().map(|s| s.to_string()).collect(),
        aliases: HashMap::from([("hg38".to_string(), "d1".to_string())]),
        ..MockCatalog::default()
    };
    let fetcher = MockFetcher {
        archives: Arc::clone(&catalog.archives),
        cancel_during_fetch: false,
    };
    Puller::new(catalog, fetcher, ArchiveExtractor)
}

fn cancelling_puller() -> MockPuller {
    let catalog = MockCatalog {
        aliases: HashMap::from([("hg38".to_string(), "d1".to_string())]),
        ..MockCatalog::default()
    };
    let fetcher = MockFetcher {
        archives: Arc::clone(&catalog.archives),
        cancel_during_fetch: true,
    };
    Puller::new(catalog, fetcher, ArchiveExtractor)
}

fn registry(dir: &TempDir, servers: &[&str]) -> Registry {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("registry.json")).unwrap();
    Registry::initialize(
        RegistryConfig::new(path),
        servers.iter().map(|s| s.to_string()).collect(),
    )
    .unwrap()
}

fn registry_bytes(registry: &Registry) -> Vec<u8> {
    fs::read(registry.path().as_std_path()).unwrap()
}

#[test]
fn falls_through_to_next_server() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A, SERVER_B]);
    let puller = puller(&[SERVER_A]);
    let catalog = puller.catalog();
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad1", b"index"));
    let sink = RecordingSink::default();

    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();

    assert_eq!(report.outcome, PullOutcome::Downloaded);
    assert!(report.downloaded);
    assert_eq!(report.server.as_deref(), Some(SERVER_B));
    assert_eq!(report.collection, "d1");
    assert_eq!(report.alias.as_deref(), Some("hg38"));

    let doc = registry.document();
    assert_eq!(doc.aliases.get("hg38").map(String::as_str), Some("d1"));
    let tag = doc.tag("d1", "bowtie2_index", "default").unwrap();
    assert_eq!(tag.asset_digest.as_deref(), Some("ad1"));
    assert_eq!(tag.path, Utf8PathBuf::from("d1/bowtie2_index/default"));
    assert!(tag.pulled_at.is_some());
    assert_eq!(
        doc.collections["d1"].description.as_deref(),
        Some("Human reference")
    );

    let index = registry
        .seek("hg38", "bowtie2_index", None, Some("index"), true)
        .unwrap();
    assert_eq!(fs::read(index.as_std_path()).unwrap(), b"index");

    let messages = sink.messages.lock().unwrap();
    assert!(messages.iter().any(|m| m.starts_with("phase=Verify")));
    assert!(messages.iter().any(|m| m.starts_with("phase=Register")));
}

#[test]
fn second_pull_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad1", b"index"));
    let sink = RecordingSink::default();
    let options = PullOptions::default();

    puller
        .pull(&mut registry, "hg38", "bowtie2_index", Some("default"), &options, &sink)
        .unwrap();
    let before = registry_bytes(&registry);

    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", Some("default"), &options, &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::AlreadyCurrent);
    assert!(!report.downloaded);
    assert_eq!(registry_bytes(&registry), before);
}

#[test]
fn changed_remote_is_kept_or_replaced_by_policy() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad1", b"old"));
    let sink = RecordingSink::default();

    puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad2", b"new"));

    let before = registry_bytes(&registry);
    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Skipped);
    assert_eq!(registry_bytes(&registry), before);

    let abort = PullOptions {
        overwrite: OverwritePolicy::Abort,
        ..PullOptions::default()
    };
    assert_matches!(
        puller.pull(&mut registry, "hg38", "bowtie2_index", None, &abort, &sink),
        Err(RegistryError::TagExists { .. })
    );

    let overwrite = PullOptions {
        overwrite: OverwritePolicy::Overwrite,
        ..PullOptions::default()
    };
    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &overwrite, &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);
    let tag = registry.document().tag("d1", "bowtie2_index", "default").unwrap();
    assert_eq!(tag.asset_digest.as_deref(), Some("ad2"));
    let index = registry
        .seek("d1", "bowtie2_index", None, Some("index"), true)
        .unwrap();
    assert_eq!(fs::read(index.as_std_path()).unwrap(), b"new");
}

#[test]
fn digest_mismatch_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    let mut tampered = bowtie_remote("ad1", b"index");
    tampered.attrs.archive_digest = Some("0".repeat(64));
    catalog.publish("d1", "bowtie2_index", "default", tampered);
    let before = registry_bytes(&registry);

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &RecordingSink::default(),
    );

    assert_matches!(result, Err(RegistryError::DigestMismatch { server, .. }) if server == SERVER_A);
    assert_eq!(registry_bytes(&registry), before);
    assert!(registry.document().collections.is_empty());
    assert!(!registry.data_dir().join("d1").as_std_path().exists());
}

#[test]
fn md5_archive_checksums_are_verified() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    let mut published = bowtie_remote("ad1", b"index");
    let md5 = archive_checksum_reader(published.archive.as_slice(), ArchiveAlgorithm::Md5).unwrap();
    published.attrs.archive_digest = Some(md5.to_uppercase());
    catalog.publish("d1", "bowtie2_index", "default", published);
    let sink = RecordingSink::default();

    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);

    let mut tampered = bowtie_remote("ad2", b"rebuilt");
    tampered.attrs.archive_digest = Some("0".repeat(32));
    catalog.publish("d1", "bowtie2_index", "v2", tampered);
    assert_matches!(
        puller.pull(&mut registry, "hg38", "bowtie2_index", Some("v2"), &PullOptions::default(), &sink),
        Err(RegistryError::DigestMismatch { expected, actual, .. }) => {
            assert_eq!(expected.len(), 32);
            assert_eq!(actual.len(), 32);
        }
    );
}

#[test]
fn failed_extraction_is_cleaned_up() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish(
        "d1",
        "bowtie2_index",
        "default",
        remote("ad1", b"definitely not an archive".to_vec(), &[]),
    );

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &RecordingSink::default(),
    );

    assert_matches!(result, Err(RegistryError::Extraction { .. }));
    assert!(registry.document().collections.is_empty());
    assert!(!registry.data_dir().join("d1").as_std_path().exists());
}

#[test]
fn missing_archive_digest_is_fatal() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A, SERVER_B]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    let mut unsigned = bowtie_remote("ad1", b"index");
    unsigned.attrs.archive_digest = None;
    catalog.publish("d1", "bowtie2_index", "default", unsigned);

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &RecordingSink::default(),
    );
    assert_matches!(result, Err(RegistryError::MissingArchiveDigest { .. }));
}

#[test]
fn every_server_failing_is_reported() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A, SERVER_B]);
    let puller = puller(&[SERVER_A, SERVER_B]);

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &RecordingSink::default(),
    );
    assert_matches!(result, Err(RegistryError::AllServersFailed { failures, .. }) => {
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].server, SERVER_A);
        assert_eq!(failures[1].server, SERVER_B);
    });
}

#[test]
fn large_archives_are_skipped_unless_forced() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    let mut large = bowtie_remote("ad1", b"index");
    large.attrs.archive_size = Some("42GB".to_string());
    catalog.publish("d1", "bowtie2_index", "default", large);
    let sink = RecordingSink::default();

    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::SkippedLarge);
    assert!(registry.document().collections.is_empty());

    let forced = PullOptions {
        force_large: true,
        ..PullOptions::default()
    };
    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &forced, &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);
}

fn fasta_remote(asset_digest: &str) -> Remote {
    remote(
        asset_digest,
        tgz(&[("fasta/hg38.fa", b">chr1\nACGT\n>chr2\nGG\n")]),
        &[("fasta", "hg38.fa")],
    )
}

fn derived_remote(asset_digest: &str) -> Remote {
    let mut derived = bowtie_remote(asset_digest, b"index");
    derived.attrs.parents = vec!["fasta:default".to_string()];
    derived
}

#[test]
fn pulled_fasta_matching_its_collection_digest_is_quiet() {
    const DIGEST: &str = "2ad08b2db5791c7ea35c7b0501097879799541b1f70e1ef5";
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    puller
        .catalog()
        .publish(DIGEST, "fasta", "default", fasta_remote("fd1"));

    let report = puller
        .pull(
            &mut registry,
            DIGEST,
            "fasta",
            None,
            &PullOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(report.alias.is_none());
    assert!(registry.sequences_path(DIGEST).as_std_path().exists());
}

#[test]
fn missing_parent_without_pulling_parents_fails() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "fasta", "default", fasta_remote("fd1"));
    catalog.publish("d1", "bowtie2_index", "default", derived_remote("ad1"));
    let options = PullOptions {
        pull_parents: false,
        ..PullOptions::default()
    };

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &options,
        &RecordingSink::default(),
    );
    assert_matches!(result, Err(RegistryError::Provenance { .. }));
    assert!(registry.document().collections.is_empty());
}

#[test]
fn parents_are_pulled_and_linked_both_ways() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "fasta", "default", fasta_remote("fd1"));
    catalog.publish("d1", "bowtie2_index", "default", derived_remote("ad1"));

    let report = puller
        .pull(
            &mut registry,
            "hg38",
            "bowtie2_index",
            None,
            &PullOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);

    let doc = registry.document();
    let fasta = doc.tag("d1", "fasta", "default").unwrap();
    let index = doc.tag("d1", "bowtie2_index", "default").unwrap();
    assert_eq!(index.parents, vec!["d1/fasta:default".to_string()]);
    assert_eq!(fasta.children, vec!["d1/bowtie2_index:default".to_string()]);
    assert!(registry.sequences_path("d1").as_std_path().exists());
}

#[test]
fn overwriting_a_derived_tag_drops_stale_parent_edges() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "fasta", "default", fasta_remote("fd1"));
    catalog.publish("d1", "bowtie2_index", "default", derived_remote("ad1"));
    let sink = RecordingSink::default();
    puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &PullOptions::default(), &sink)
        .unwrap();

    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad2", b"rebuilt"));
    let overwrite = PullOptions {
        overwrite: OverwritePolicy::Overwrite,
        ..PullOptions::default()
    };
    let report = puller
        .pull(&mut registry, "hg38", "bowtie2_index", None, &overwrite, &sink)
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);

    let doc = registry.document();
    assert!(doc.tag("d1", "bowtie2_index", "default").unwrap().parents.is_empty());
    assert!(doc.tag("d1", "fasta", "default").unwrap().children.is_empty());
    assert!(relations::asymmetric_edges(doc).is_empty());
}

#[test]
fn installed_parent_with_other_digest_fails_provenance() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "fasta", "default", fasta_remote("fd1"));
    let sink = RecordingSink::default();
    puller
        .pull(&mut registry, "hg38", "fasta", None, &PullOptions::default(), &sink)
        .unwrap();

    catalog.publish("d1", "fasta", "default", fasta_remote("fd2"));
    catalog.publish("d1", "bowtie2_index", "default", derived_remote("ad1"));
    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &sink,
    );
    assert_matches!(result, Err(RegistryError::Provenance { message, .. }) if message.contains("fd2"));
    assert!(registry.document().tag("d1", "bowtie2_index", "default").is_none());
}

#[test]
fn hook_failures_become_warnings() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = puller(&[]);
    let catalog = puller.catalog();
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("ad1", b"index"));
    let seen: Arc<Mutex<Vec<HookRecord>>> = Arc::default();
    let mut hooks = Hooks::new();
    for point in [HookPoint::PrePull, HookPoint::PostPull] {
        let seen = Arc::clone(&seen);
        hooks.register(
            point,
            Box::new(FnHook::new("record", move |point, ctx| {
                seen.lock().unwrap().push(HookRecord::capture(point, ctx));
                Ok(())
            })),
        );
    }
    hooks.register(
        HookPoint::PostPull,
        Box::new(FnHook::new("notify", |_, _| Err("mail server down".to_string()))),
    );
    let puller = puller.with_hooks(hooks);

    let report = puller
        .pull(
            &mut registry,
            "hg38",
            "bowtie2_index",
            None,
            &PullOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();
    assert_eq!(report.outcome, PullOutcome::Downloaded);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("mail server down"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].point, HookPoint::PrePull);
    assert_eq!(seen[0].collection, "d1");
    assert!(seen[0].path.is_none());
    assert_eq!(seen[1].point, HookPoint::PostPull);
    assert_eq!(seen[1].path, report.path);
}

#[test]
fn cancelled_pull_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let mut registry = registry(&temp, &[SERVER_A]);
    let puller = cancelling_puller();
    puller
        .catalog()
        .publish("d1", "bowtie2_index", "default", bowtie_remote("ad1", b"index"));
    let before = registry_bytes(&registry);

    let result = puller.pull(
        &mut registry,
        "hg38",
        "bowtie2_index",
        None,
        &PullOptions::default(),
        &RecordingSink::default(),
    );
    assert_matches!(result, Err(RegistryError::Cancelled(_)));
    assert_eq!(registry_bytes(&registry), before);
    assert!(!registry.data_dir().join("d1").as_std_path().exists());
}

#[test]
fn seekr_resolves_remote_paths_across_servers() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, &["down", "up"]);
    let catalog = MockCatalog {
        down: vec!["down".to_string()],
        aliases: HashMap::from([("hg38".to_string(), "d1".to_string())]),
        ..MockCatalog::default()
    };
    catalog.publish("d1", "bowtie2_index", "default", bowtie_remote("a1", b"index"));

    let path = registry
        .seekr(&catalog, "hg38", "bowtie2_index", None, Some("index"), "http")
        .unwrap();
    assert_eq!(path, "http://up/d1/bowtie2_index/index");

    let err = registry
        .seekr(&catalog, "hg38", "bowtie2_index", Some("v9"), None, "http")
        .unwrap_err();
    assert_matches!(err, RegistryError::AllServersFailed { failures, .. } if failures.len() == 2);
}

#[test]
fn remote_populate_keeps_references_no_server_answers() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, &["up"]);
    let catalog = MockCatalog {
        aliases: HashMap::from([("hg38".to_string(), "d1".to_string())]),
        ..MockCatalog::default()
    };
    catalog.publish("d1", "fasta", "default", fasta_remote("f1"));

    let text = "bwa mem refgenie://hg38/fasta refgenie://hg38/bwa_index reads.fq";
    assert_eq!(
        registry.populate_remote(&catalog, text, "s3").unwrap(),
        "bwa mem s3://up/d1/fasta/fasta refgenie://hg38/bwa_index reads.fq"
    );
}
