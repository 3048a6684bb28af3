//! Registry index client.
//!
//! Enumerate released versions and fetch per-release manifests for
//! registry-scoped identities (`scope.name`).

use semver::Version;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::workspace::errors::FetchError;
use crate::workspace::http::HttpClient;
use crate::workspace::manifest::Manifest;

pub struct RegistryClient {
    http: Arc<dyn HttpClient>,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ReleasesResponse {
    releases: BTreeMap<String, serde_json::Value>,
}

impl RegistryClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: &str) -> Result<Self, FetchError> {
        // A trailing slash keeps joins relative to the base path.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| FetchError::Network {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        Ok(RegistryClient { http, base_url })
    }

    fn release_url(&self, id: &str) -> Result<Url, FetchError> {
        // `scope.name` maps to `<base>/<scope>/<name>`.
        let path = id.replacen('.', "/", 1);
        self.base_url.join(&path).map_err(|e| FetchError::Network {
            url: id.to_string(),
            message: e.to_string(),
        })
    }

    /// Released versions, newest first. Unparseable version strings are
    /// skipped.
    pub async fn versions(&self, id: &str) -> Result<Vec<Version>, FetchError> {
        let url = self.release_url(id)?;
        let response = self.http.get(url.as_str()).await?;
        if !response.is_success() {
            return Err(FetchError::Failed {
                url: url.into(),
                status: response.status,
            });
        }
        let releases: ReleasesResponse =
            serde_json::from_slice(&response.body).map_err(|e| FetchError::Network {
                url: url.into(),
                message: e.to_string(),
            })?;
        let mut versions: Vec<Version> = releases
            .releases
            .keys()
            .filter_map(|v| Version::parse(v).ok())
            .collect();
        versions.sort();
        versions.reverse();
        Ok(versions)
    }

    /// The manifest published for one release.
    pub async fn manifest(&self, id: &str, version: &Version) -> Result<Manifest, FetchError> {
        let url = self
            .base_url
            .join(&format!("{}/{}/manifest", id.replacen('.', "/", 1), version))
            .map_err(|e| FetchError::Network {
                url: id.to_string(),
                message: e.to_string(),
            })?;
        let response = self.http.get(url.as_str()).await?;
        if !response.is_success() {
            return Err(FetchError::Failed {
                url: url.into(),
                status: response.status,
            });
        }
        serde_json::from_slice(&response.body).map_err(|e| FetchError::Network {
            url: url.into(),
            message: e.to_string(),
        })
    }
}
