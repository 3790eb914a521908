//! Remote catalog servers.
//!
//! Servers describe their routes in an OpenAPI document; each operation is
//! looked up by `operationId` so servers exposing a different route layout
//! keep working. The mapping is fetched once per server and cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RegistryError, ServerFailure};
use crate::fetch::http_client;

pub const API_PREFIX: &str = "v3_";

pub const OP_ALIAS_DIGEST: &str = "alias_digest";
pub const OP_DEFAULT_TAG: &str = "default_tag";
pub const OP_ASSET_ATTRS: &str = "asset_attrs";
pub const OP_GENOME_ATTRS: &str = "genome_attrs";
pub const OP_ASSET_DIGEST: &str = "asset_digest";
pub const OP_ARCHIVE: &str = "archive";
pub const OP_LIST_ASSETS: &str = "list_assets";
pub const OP_ALIASES_DICT: &str = "aliases_dict";
pub const OP_ASSET_PATH: &str = "asset_file_path";
pub const DEFAULT_REMOTE_CLASS: &str = "http";

/// Attributes a server publishes for one `digest/asset:tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetAttributes {
    #[serde(default)]
    pub asset_digest: Option<String>,
    #[serde(default, alias = "archive_checksum")]
    pub archive_digest: Option<String>,
    #[serde(default)]
    pub archive_size: Option<String>,
    #[serde(default)]
    pub asset_size: Option<String>,
    #[serde(default)]
    pub seek_keys: BTreeMap<String, String>,
    #[serde(default, alias = "asset_parents")]
    pub parents: Vec<String>,
    #[serde(default, alias = "asset_children")]
    pub children: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Per-server catalog operations. Collection identifiers are digests except
/// for [`CatalogClient::alias_digest`].
pub trait CatalogClient: Send + Sync {
    fn alias_digest(&self, server: &str, alias: &str) -> Result<String, RegistryError>;
    fn default_tag(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
    ) -> Result<String, RegistryError>;
    fn asset_attributes(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<AssetAttributes, RegistryError>;
    fn fetch_digest(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError>;
    fn archive_url(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError>;
    fn fetch_description(
        &self,
        server: &str,
        digest: &str,
    ) -> Result<Option<String>, RegistryError>;
    /// Digest to `asset:tag` entries.
    fn list_assets(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError>;
    /// Digest to aliases.
    fn aliases(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError>;
    /// Where the server hosts one seek key of an asset, for a remote data
    /// provider class such as `http` or `s3`.
    fn seek_path(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        seek_key: &str,
        tag: Option<&str>,
        remote_class: &str,
    ) -> Result<String, RegistryError>;
}

/// Run `op` against each server in priority order and return the first
/// success with the server that produced it. Network-class failures move on
/// to the next server; any other error is returned immediately.
pub fn try_servers<T, F>(
    servers: &[String],
    target: &str,
    mut op: F,
) -> Result<(String, T), RegistryError>
where
    F: FnMut(&str) -> Result<T, RegistryError>,
{
    let mut failures = Vec::new();
    for server in servers {
        match op(server) {
            Ok(value) => return Ok((server.clone(), value)),
            Err(err) if err.is_network() => {
                warn!(%server, %target, error = %err, "server failed, trying next");
                failures.push(ServerFailure {
                    server: server.clone(),
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    Err(RegistryError::AllServersFailed {
        target: target.to_string(),
        failures,
    })
}

#[derive(Deserialize)]
struct OpenApiDoc {
    openapi: String,
    paths: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Map `operationId` to path template from an OpenAPI document.
pub fn map_paths_by_id(server: &str, doc: Value) -> Result<HashMap<String, String>, RegistryError> {
    let doc: OpenApiDoc =
        serde_json::from_value(doc).map_err(|err| RegistryError::IncompatibleServer {
            server: server.to_string(),
            message: format!("invalid OpenAPI description: {err}"),
        })?;
    debug!(%server, openapi = %doc.openapi, routes = doc.paths.len(), "discovered endpoints");
    let mut mapping = HashMap::new();
    for (path, methods) in doc.paths {
        let Some(op_id) = methods
            .get("get")
            .and_then(|get| get.get("operationId"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        mapping.insert(op_id.to_string(), path);
    }
    Ok(mapping)
}

fn fill_template(template: &str, pairs: &[(&str, &str)]) -> String {
    pairs.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[derive(Clone)]
pub struct HttpCatalog {
    client: Client,
    endpoints: Arc<Mutex<HashMap<String, Arc<HashMap<String, String>>>>>,
}

impl HttpCatalog {
    pub fn new() -> Result<Self, RegistryError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn endpoints(&self, server: &str) -> Result<Arc<HashMap<String, String>>, RegistryError> {
        if let Some(found) = self.cache().get(server) {
            return Ok(Arc::clone(found));
        }
        let url = format!("{server}/openapi.json");
        let doc: Value = self.get_json(&url, &[])?;
        let mapping = Arc::new(map_paths_by_id(server, doc)?);
        self.cache()
            .insert(server.to_string(), Arc::clone(&mapping));
        Ok(mapping)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<HashMap<String, String>>>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn url(
        &self,
        server: &str,
        operation: &str,
        pairs: &[(&str, &str)],
    ) -> Result<String, RegistryError> {
        let endpoints = self.endpoints(server)?;
        let op_id = format!("{API_PREFIX}{operation}");
        let template = endpoints
            .get(&op_id)
            .ok_or_else(|| RegistryError::IncompatibleServer {
                server: server.to_string(),
                message: format!("no endpoint for operation '{op_id}'"),
            })?;
        Ok(format!("{server}{}", fill_template(template, pairs)))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RegistryError> {
        let response = self.send_with_retries(url, || self.client.get(url).query(query))?;
        let response = Self::handle_status(url, response)?;
        response.json::<T>().map_err(|err| RegistryError::Transport {
            url: url.to_string(),
            message: format!("invalid JSON: {err}"),
        })
    }

    /// Endpoints that answer with a bare JSON string or with plain text.
    fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, RegistryError> {
        let response = self.send_with_retries(url, || self.client.get(url).query(query))?;
        let response = Self::handle_status(url, response)?;
        let body = response.text().map_err(|err| RegistryError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(match serde_json::from_str::<Value>(&body) {
            Ok(Value::String(value)) => value,
            _ => body.trim().to_string(),
        })
    }

    fn handle_status(url: &str, response: Response) -> Result<Response, RegistryError> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(RegistryError::TransportStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }

    fn send_with_retries<F>(&self, url: &str, mut make_req: F) -> Result<Response, RegistryError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(RegistryError::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl CatalogClient for HttpCatalog {
    fn alias_digest(&self, server: &str, alias: &str) -> Result<String, RegistryError> {
        let url = self.url(server, OP_ALIAS_DIGEST, &[("alias", alias)])?;
        self.get_text(&url, &[])
    }

    fn default_tag(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
    ) -> Result<String, RegistryError> {
        let url = self.url(server, OP_DEFAULT_TAG, &[("genome", digest), ("asset", asset)])?;
        self.get_text(&url, &[])
    }

    fn asset_attributes(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<AssetAttributes, RegistryError> {
        let url = self.url(server, OP_ASSET_ATTRS, &[("genome", digest), ("asset", asset)])?;
        self.get_json(&url, &[("tag", tag)])
    }

    fn fetch_digest(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError> {
        let url = self.url(server, OP_ASSET_DIGEST, &[("genome", digest), ("asset", asset)])?;
        self.get_text(&url, &[("tag", tag)])
    }

    fn archive_url(
        &self,
        server: &str,
        digest: &str,
        asset: &str,
        tag: &str,
    ) -> Result<String, RegistryError> {
        let url = self.url(server, OP_ARCHIVE, &[("genome", digest), ("asset", asset)])?;
        let parsed = reqwest::Url::parse_with_params(&url, &[("tag", tag)]).map_err(|err| {
            RegistryError::IncompatibleServer {
                server: server.to_string(),
                message: format!("invalid archive URL {url}: {err}"),
            }
        })?;
        Ok(parsed.to_string())
    }

    fn fetch_description(
        &self,
        server: &str,
        digest: &str,
    ) -> Result<Option<String>, RegistryError> {
        let url = self.url(server, OP_GENOME_ATTRS, &[("genome", digest)])?;
        let attrs: Value = self.get_json(&url, &[])?;
        Ok(attrs
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn list_assets(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError> {
        let url = self.url(server, OP_LIST_ASSETS, &[])?;
        self.get_json(&url, &[])
    }

    fn aliases(&self, server: &str) -> Result<BTreeMap<String, Vec<String>>, RegistryError> {
        let url = self.url(server, OP_ALIASES_DICT, &[])?;
        self.get_json(&url, &[])
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
        let url = self.url(
            server,
            OP_ASSET_PATH,
            &[("genome", digest), ("asset", asset), ("seek_key", seek_key)],
        )?;
        let mut query = vec![("remoteClass", remote_class)];
        if let Some(tag) = tag {
            query.push(("tag", tag));
        }
        self.get_text(&url, &query)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// What one server offers, keyed by alias (or digest) with sorted
/// `asset:tag` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteListing {
    pub server: String,
    pub collections: BTreeMap<String, Vec<String>>,
}

pub(crate) fn listing_for(
    catalog: &dyn CatalogClient,
    server: &str,
    as_digests: bool,
) -> Result<RemoteListing, RegistryError> {
    let assets = catalog.list_assets(server)?;
    let aliases = if as_digests {
        BTreeMap::new()
    } else {
        catalog.aliases(server)?
    };
    let mut collections = BTreeMap::new();
    for (digest, mut entries) in assets {
        entries.sort();
        let key = aliases
            .get(&digest)
            .and_then(|names| names.first())
            .cloned()
            .unwrap_or(digest);
        collections.insert(key, entries);
    }
    Ok(RemoteListing {
        server: server.to_string(),
        collections,
    })
}
