//! Expansion of `refgenie://collection/asset.seek_key:tag` references found
//! in free text or in JSON documents.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::AssetRef;
use crate::error::RegistryError;

pub const REGISTRY_SCHEME: &str = "refgenie://";

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"refgenie://[A-Za-z0-9_/.:]+").expect("registry reference regex is valid")
    })
}

/// Replace every registry reference in `text` with what `resolve` returns.
/// References that do not name a collection, or that `resolve` maps to
/// `None`, are left as written.
pub fn populate_str<F>(text: &str, resolve: &mut F) -> Result<String, RegistryError>
where
    F: FnMut(&AssetRef) -> Result<Option<String>, RegistryError>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for found in reference_regex().find_iter(text) {
        out.push_str(&text[last..found.start()]);
        last = found.end();
        let raw = found.as_str();
        let replacement = match raw[REGISTRY_SCHEME.len()..].parse::<AssetRef>() {
            Ok(reference) if reference.collection.is_some() => resolve(&reference)?,
            _ => {
                debug!(reference = raw, "not a registry path");
                None
            }
        };
        match replacement {
            Some(path) => out.push_str(&path),
            None => {
                warn!(reference = raw, "registry reference not populated");
                out.push_str(raw);
            }
        }
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Walk a JSON value and populate every string in it. Object keys starting
/// with `_` or `sources` are skipped.
pub fn populate_value<F>(value: Value, resolve: &mut F) -> Result<Value, RegistryError>
where
    F: FnMut(&AssetRef) -> Result<Option<String>, RegistryError>,
{
    Ok(match value {
        Value::String(text) => Value::String(populate_str(&text, resolve)?),
        Value::Array(items) => {
            let mut populated = Vec::with_capacity(items.len());
            for item in items {
                populated.push(populate_value(item, resolve)?);
            }
            Value::Array(populated)
        }
        Value::Object(map) => {
            let mut populated = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                let item = if key.starts_with('_') || key.starts_with("sources") {
                    item
                } else {
                    populate_value(item, resolve)?
                };
                populated.insert(key, item);
            }
            Value::Object(populated)
        }
        other => other,
    })
}
