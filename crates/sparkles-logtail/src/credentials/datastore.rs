//! Google Cloud Datastore as the credential store.
//!
//! Uses the v1 REST `lookup` method so no generated client is needed.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CredentialStore, RecordKey, StoreRecord, StoreValue, TokenProvider};
use crate::error::StoreError;

/// Production Datastore endpoint.
pub const DATASTORE_API_URL: &str = "https://datastore.googleapis.com";

/// Read-only Datastore client for a single project.
#[derive(Debug, Clone)]
pub struct DatastoreStore {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    namespace: Option<String>,
    tokens: TokenProvider,
}

impl DatastoreStore {
    pub fn new(project_id: impl Into<String>, tokens: TokenProvider) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DATASTORE_API_URL.to_string(),
            project_id: project_id.into(),
            namespace: None,
            tokens,
        }
    }

    /// Talk to a local Datastore emulator at `host` (`host:port`) without auth.
    pub fn emulator(host: &str, project_id: impl Into<String>) -> Self {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        Self::new(project_id, TokenProvider::Anonymous).with_base_url(base_url)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn lookup_url(&self) -> String {
        format!(
            "{}/v1/projects/{}:lookup",
            self.base_url.trim_end_matches('/'),
            self.project_id
        )
    }

    fn lookup_body<'a>(&'a self, key: &'a RecordKey) -> LookupRequest<'a> {
        LookupRequest {
            keys: vec![Key {
                partition_id: PartitionId {
                    project_id: &self.project_id,
                    namespace_id: self.namespace.as_deref(),
                },
                path: vec![PathElement {
                    kind: &key.kind,
                    name: &key.name,
                }],
            }],
        }
    }
}

#[async_trait]
impl CredentialStore for DatastoreStore {
    async fn lookup(&self, key: &RecordKey) -> Result<Option<StoreRecord>, StoreError> {
        debug!(project = %self.project_id, record = %key, "datastore lookup");

        let mut request = self.http.post(self.lookup_url()).json(&self.lookup_body(key));
        if let Some(token) = self.tokens.access_token(&self.http).await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(StoreError::PermissionDenied(format!(
                    "reading {key} in project {}: {}",
                    self.project_id,
                    body.trim()
                )));
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(StoreError::Status {
                    status: s.as_u16(),
                    body: body.trim().to_string(),
                });
            }
            _ => {}
        }

        let parsed: LookupResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        let Some(found) = parsed.found.into_iter().next() else {
            return Ok(None);
        };

        found
            .entity
            .properties
            .into_iter()
            .map(|(name, value)| convert_value(&name, value).map(|v| (name, v)))
            .collect::<Result<StoreRecord, _>>()
            .map(Some)
    }
}

fn convert_value(name: &str, value: serde_json::Value) -> Result<StoreValue, StoreError> {
    if let Some(encoded) = value.get("blobValue").and_then(|v| v.as_str()) {
        let bytes = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .map_err(|e| {
                StoreError::InvalidResponse(format!("property `{name}` is not valid base64: {e}"))
            })?;
        return Ok(StoreValue::Blob(bytes));
    }
    if let Some(text) = value.get("stringValue").and_then(|v| v.as_str()) {
        return Ok(StoreValue::Text(text.to_string()));
    }
    Ok(StoreValue::Other(value))
}

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    keys: Vec<Key<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Key<'a> {
    partition_id: PartitionId<'a>,
    path: Vec<PathElement<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionId<'a> {
    project_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PathElement<'a> {
    kind: &'a str,
    name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
}

#[derive(Debug, Deserialize)]
struct EntityResult {
    entity: Entity,
}

#[derive(Debug, Deserialize)]
struct Entity {
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}
