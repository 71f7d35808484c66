//! Cluster credential lookup.
//!
//! Every worker in a sparkles cluster serves its `Monitor` endpoint with the
//! same TLS certificate and checks the same shared secret. Both are stored in
//! one well-known record of the cluster's key-value store when the cluster is
//! set up; this module fetches and validates that record.

mod datastore;
mod token;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{LogTailError, Result, StoreError};

pub use datastore::{DATASTORE_API_URL, DatastoreStore};
pub use token::{DATASTORE_SCOPE, ServiceAccountKey, TokenProvider};

/// Kind of the record holding the cluster credentials.
pub const CLUSTER_KEYS_KIND: &str = "ClusterKeys";

/// Name of the record holding the cluster credentials.
pub const CLUSTER_KEYS_NAME: &str = "sparklespray";

/// Property holding the PEM transport certificate.
pub const CERT_FIELD: &str = "cert";

/// Property holding the shared secret.
pub const SHARED_SECRET_FIELD: &str = "shared_secret";

/// Address of a record in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub kind: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// The well-known cluster credential record.
    pub fn cluster_keys() -> Self {
        Self::new(CLUSTER_KEYS_KIND, CLUSTER_KEYS_NAME)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A single property value as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Blob(Vec<u8>),
    Text(String),
    Other(serde_json::Value),
}

impl StoreValue {
    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StoreValue::Blob(bytes) => Some(bytes),
            StoreValue::Text(text) => Some(text.as_bytes()),
            StoreValue::Other(_) => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            StoreValue::Blob(bytes) => std::str::from_utf8(bytes).ok(),
            StoreValue::Text(text) => Some(text),
            StoreValue::Other(_) => None,
        }
    }
}

/// Properties of one record, keyed by property name.
pub type StoreRecord = HashMap<String, StoreValue>;

/// Read-only access to the key-value store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch one record. `Ok(None)` means the record does not exist.
    async fn lookup(&self, key: &RecordKey) -> Result<Option<StoreRecord>, StoreError>;
}

/// Resolved cluster credentials.
#[derive(Clone)]
pub struct CredentialRecord {
    /// PEM certificate the workers present; used as the only trust root.
    pub transport_certificate: Vec<u8>,
    /// Token presented in the metadata of every call.
    pub shared_secret: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field(
                "transport_certificate",
                &format_args!("<{} bytes>", self.transport_certificate.len()),
            )
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

/// Fetch the credential record and check that both fields are usable.
///
/// Nothing here is retried: a missing or malformed record means the cluster
/// was never set up correctly.
pub async fn resolve_credentials<S>(store: &S, key: &RecordKey) -> Result<CredentialRecord>
where
    S: CredentialStore + ?Sized,
{
    debug!(record = %key, "looking up cluster credentials");

    let record = store
        .lookup(key)
        .await?
        .ok_or_else(|| LogTailError::CredentialNotFound {
            kind: key.kind.clone(),
            name: key.name.clone(),
        })?;

    let transport_certificate = record
        .get(CERT_FIELD)
        .ok_or_else(|| malformed(CERT_FIELD, "missing"))?
        .as_bytes()
        .ok_or_else(|| malformed(CERT_FIELD, "not a blob or string"))?
        .to_vec();
    if transport_certificate.iter().all(u8::is_ascii_whitespace) {
        return Err(malformed(CERT_FIELD, "empty"));
    }

    let shared_secret = record
        .get(SHARED_SECRET_FIELD)
        .ok_or_else(|| malformed(SHARED_SECRET_FIELD, "missing"))?
        .as_text()
        .ok_or_else(|| malformed(SHARED_SECRET_FIELD, "not text"))?
        .to_string();
    if shared_secret.is_empty() {
        return Err(malformed(SHARED_SECRET_FIELD, "empty"));
    }
    // Sent as an ASCII metadata value.
    if !shared_secret.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(malformed(
            SHARED_SECRET_FIELD,
            "contains characters not allowed in call metadata",
        ));
    }

    Ok(CredentialRecord {
        transport_certificate,
        shared_secret,
    })
}

fn malformed(field: &'static str, reason: &str) -> LogTailError {
    LogTailError::CredentialMalformed {
        field,
        reason: reason.to_string(),
    }
}
