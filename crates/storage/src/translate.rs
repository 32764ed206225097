//! Static SURL to TURL translation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{StorageError, UrlTranslator};

/// One `scheme://host[:port]` prefix and the TURL prefix replacing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMapping {
    pub source: String,
    pub target: String,
}

/// Translator backed by a fixed lookup table.
#[derive(Debug, Clone, Default)]
pub struct StaticUrlTable {
    prefixes: HashMap<String, String>,
    passthrough: Vec<String>,
}

impl StaticUrlTable {
    /// Builds the table. `passthrough` lists schemes returned unchanged
    /// (for example `file`).
    pub fn new(mappings: &[UrlMapping], passthrough: &[String]) -> Result<Self, StorageError> {
        let mut prefixes = HashMap::with_capacity(mappings.len());
        for mapping in mappings {
            let key = prefix_of(&parse(&mapping.source)?, &mapping.source)?;
            prefixes.insert(key, mapping.target.trim_end_matches('/').to_string());
        }
        Ok(Self {
            prefixes,
            passthrough: passthrough.iter().map(|s| s.to_ascii_lowercase()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl UrlTranslator for StaticUrlTable {
    fn translate(&self, surl: &str) -> Result<String, StorageError> {
        let url = parse(surl)?;
        if self.passthrough.iter().any(|s| s == url.scheme()) {
            return Ok(surl.to_string());
        }

        let key = prefix_of(&url, surl)?;
        let target = self
            .prefixes
            .get(&key)
            .ok_or_else(|| StorageError::Untranslatable(surl.to_string()))?;

        let mut turl = format!("{target}{}", url.path());
        if let Some(query) = url.query() {
            turl.push('?');
            turl.push_str(query);
        }
        debug!(%surl, %turl, "translated storage URL");
        Ok(turl)
    }
}

/// URL of the directory containing `url`, or `None` at the root.
pub fn parent_url(url: &str) -> Result<Option<String>, StorageError> {
    let mut parsed = parse(url)?;
    let path = parsed.path().trim_end_matches('/').to_string();
    let Some(idx) = path.rfind('/') else {
        return Ok(None);
    };
    if path.is_empty() {
        return Ok(None);
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    parsed.set_path(parent);
    parsed.set_query(None);
    Ok(Some(parsed.to_string()))
}

fn parse(raw: &str) -> Result<Url, StorageError> {
    Url::parse(raw).map_err(|e| StorageError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

fn prefix_of(url: &Url, raw: &str) -> Result<String, StorageError> {
    let host = url.host_str().ok_or_else(|| StorageError::InvalidUrl {
        url: raw.to_string(),
        reason: "missing host".into(),
    })?;
    let mut key = format!("{}://{}", url.scheme(), host.to_ascii_lowercase());
    if let Some(port) = url.port() {
        key.push_str(&format!(":{port}"));
    }
    Ok(key)
}
