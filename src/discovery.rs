use crate::error::{MirrorError, Result};
use crate::traits::MirrorDiscovery;
use crate::types::MirrorInfo;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

// Include the JSON file at compile time
const MIRRORS_JSON: &str = include_str!("../assets/mirrors.json");

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ListSource {
    Url(String),
    File(PathBuf),
    Builtin,
}

impl ListSource {
    /// `http(s)://` values are fetched, anything else is a local path.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => ListSource::Builtin,
            Some(v) if v.starts_with("http://") || v.starts_with("https://") => {
                ListSource::Url(v.to_string())
            }
            Some(v) => ListSource::File(PathBuf::from(v)),
        }
    }
}

/// Mirror list published as a JSON array of [`MirrorInfo`] records.
pub struct JsonDiscovery {
    source: ListSource,
}

impl JsonDiscovery {
    pub fn new(source: ListSource) -> Self {
        Self { source }
    }

    async fn fetch(&self) -> Result<String> {
        match &self.source {
            ListSource::Builtin => Ok(MIRRORS_JSON.to_string()),
            ListSource::File(path) => fs::read_to_string(path)
                .await
                .map_err(|e| MirrorError::Discovery(format!("{:?}: {}", path, e))),
            ListSource::Url(url) => {
                let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
                let resp = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| MirrorError::Discovery(format!("{}: {}", url, e)))?;
                if !resp.status().is_success() {
                    return Err(MirrorError::Discovery(format!(
                        "{} returned {}",
                        url,
                        resp.status()
                    )));
                }
                resp.text()
                    .await
                    .map_err(|e| MirrorError::Discovery(format!("{}: {}", url, e)))
            }
        }
    }
}

#[async_trait]
impl MirrorDiscovery for JsonDiscovery {
    async fn discover(&self) -> Result<Vec<MirrorInfo>> {
        let body = self.fetch().await?;
        let list = parse_mirror_list(&body)?;
        tracing::info!("Discovered {} mirrors from {:?}", list.len(), self.source);
        Ok(list)
    }
}

/// Parse a mirror list, dropping unnamed and duplicate entries.
pub fn parse_mirror_list(body: &str) -> Result<Vec<MirrorInfo>> {
    let raw: Vec<MirrorInfo> = serde_json::from_str(body)
        .map_err(|e| MirrorError::Discovery(format!("invalid mirror list: {}", e)))?;

    let mut seen = HashSet::new();
    let mut list = Vec::with_capacity(raw.len());

    for info in raw {
        if info.name.trim().is_empty() {
            tracing::warn!("Skipping mirror entry without a name");
            continue;
        }
        if !seen.insert((info.name.clone(), info.country.clone())) {
            tracing::warn!("Skipping duplicate mirror {} ({})", info.name, info.country);
            continue;
        }
        list.push(info);
    }

    Ok(list)
}
