//! OAuth access tokens for the Datastore API.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// OAuth scope granting read access to Datastore.
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The subset of a service account key file we need.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Where the bearer token for store requests comes from.
#[derive(Debug, Clone)]
pub enum TokenProvider {
    /// No authentication (local Datastore emulator).
    Anonymous,
    /// Self-signed JWT assertion exchanged at the key's token endpoint.
    ServiceAccount(Arc<ServiceAccountKey>),
    /// The compute metadata server of the VM we run on.
    Metadata { base_url: String },
}

impl TokenProvider {
    /// Load a service account key file.
    pub fn from_key_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Auth(format!("reading key file {}: {e}", path.display()))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Auth(format!("parsing key file {}: {e}", path.display()))
        })?;
        Ok(TokenProvider::ServiceAccount(Arc::new(key)))
    }

    /// Use the metadata server, honouring `GCE_METADATA_HOST` when set.
    pub fn metadata() -> Self {
        let host = std::env::var("GCE_METADATA_HOST")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        TokenProvider::Metadata {
            base_url: format!("http://{host}"),
        }
    }

    /// Obtain a fresh access token, or `None` when no authentication is used.
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<Option<String>, StoreError> {
        match self {
            TokenProvider::Anonymous => Ok(None),
            TokenProvider::ServiceAccount(key) => exchange_assertion(http, key).await.map(Some),
            TokenProvider::Metadata { base_url } => {
                debug!("requesting access token from metadata server");
                let response = http
                    .get(format!("{base_url}{METADATA_TOKEN_PATH}"))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                read_token(response).await.map(Some)
            }
        }
    }
}

/// Build the RS256 JWT assertion for `key`.
pub(crate) fn sign_assertion(key: &ServiceAccountKey, now: i64) -> Result<String, StoreError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: DATASTORE_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| StoreError::Auth(format!("invalid service account private key: {e}")))?;

    encode(&header, &claims, &signing_key)
        .map_err(|e| StoreError::Auth(format!("signing token assertion: {e}")))
}

async fn exchange_assertion(
    http: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<String, StoreError> {
    debug!(account = %key.client_email, "exchanging service account assertion");
    let assertion = sign_assertion(key, Utc::now().timestamp())?;
    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await?;
    read_token(response).await
}

async fn read_token(response: reqwest::Response) -> Result<String, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Auth(format!(
            "token endpoint returned HTTP {}: {}",
            status.as_u16(),
            body.trim()
        )));
    }
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| StoreError::Auth(format!("unreadable token response: {e}")))?;
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/service_account_key.pem");

    fn test_key() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "sparkles-abc@proj.iam.gserviceaccount.com".to_string(),
            private_key: TEST_KEY.to_string(),
            private_key_id: Some("key-1".to_string()),
            token_uri: "https://oauth2.example/token".to_string(),
        }
    }

    #[test]
    fn test_assertion_claims() {
        let jwt = sign_assertion(&test_key(), 1_700_000_000).unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "key-1");

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["iss"], "sparkles-abc@proj.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], DATASTORE_SCOPE);
        assert_eq!(claims["aud"], "https://oauth2.example/token");
        assert_eq!(claims["exp"], 1_700_003_600_i64);
    }

    #[test]
    fn test_bad_private_key() {
        let mut key = test_key();
        key.private_key = "not a key".to_string();
        assert!(matches!(sign_assertion(&key, 0), Err(StoreError::Auth(_))));
    }

    #[test]
    fn test_key_file_defaults_token_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "type": "service_account",
                "client_email": "a@b.iam.gserviceaccount.com",
                "private_key": "pem",
            })
            .to_string(),
        )
        .unwrap();

        match TokenProvider::from_key_file(&path).unwrap() {
            TokenProvider::ServiceAccount(key) => {
                assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
                assert!(key.private_key_id.is_none());
            }
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[test]
    fn test_missing_key_file() {
        let err = TokenProvider::from_key_file(Path::new("/nonexistent/key.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/key.json"));
    }
}
