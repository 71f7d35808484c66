//! TLS channel to a worker's `Monitor` endpoint.
//!
//! Workers are addressed by IP (or an ephemeral DNS name) but all present the
//! cluster certificate issued for one logical server name, so the TLS server
//! name is overridden instead of derived from the address.

use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::info;
use x509_parser::error::PEMError;
use x509_parser::pem::Pem;

use crate::error::{LogTailError, Result};

/// Server name the cluster certificate is issued for.
pub const DEFAULT_SERVER_NAME: &str = "sparkles.server";

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// How to reach one worker.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// `host:port` of the worker.
    pub address: String,
    /// Identity expected in the worker's certificate.
    pub server_name: String,
    pub connect_timeout: Duration,
    /// Deadline applied to every call on the channel.
    pub request_timeout: Duration,
}

impl ChannelSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Build a lazily connecting TLS channel.
///
/// Fails only for a bad address or certificate; an unreachable worker shows up
/// as a transport error on the first call.
pub fn connect_channel(settings: &ChannelSettings, certificate: &[u8]) -> Result<Channel> {
    let setup_error = |reason: String| LogTailError::ChannelSetup {
        address: settings.address.clone(),
        reason,
    };

    let uri = endpoint_uri(&settings.address).map_err(setup_error)?;
    validate_certificate(certificate).map_err(setup_error)?;
    if settings.server_name.trim().is_empty() {
        return Err(setup_error("server name override is empty".to_string()));
    }

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(certificate))
        .domain_name(settings.server_name.clone());

    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| setup_error(format!("invalid endpoint: {e}")))?
        .tls_config(tls)
        .map_err(|e| setup_error(format!("invalid TLS configuration: {e}")))?
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout);

    info!(
        address = %settings.address,
        server_name = %settings.server_name,
        "connecting to worker"
    );
    Ok(endpoint.connect_lazy())
}

/// Turn `host:port` (optionally prefixed with a scheme) into an `https://` URI.
pub fn endpoint_uri(address: &str) -> std::result::Result<String, String> {
    let trimmed = address.trim();
    let authority = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| format!("address `{address}` has no port"))?;
    if host.is_empty() || host == "[]" {
        return Err(format!("address `{address}` has no host"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("address `{address}` has an invalid port"))?;

    Ok(format!("https://{authority}"))
}

/// Check that `pem` holds one or more PEM `CERTIFICATE` blocks, each a
/// parseable X.509 certificate.
pub fn validate_certificate(pem: &[u8]) -> std::result::Result<(), String> {
    let mut blocks = 0;
    for block in Pem::iter_from_buffer(pem) {
        let block = match block {
            Ok(block) => block,
            // Trailing text after the last block.
            Err(PEMError::MissingHeader) if blocks > 0 => break,
            Err(e) => return Err(format!("certificate is not valid PEM: {e}")),
        };
        if block.label != CERTIFICATE_LABEL {
            return Err(format!(
                "expected a {CERTIFICATE_LABEL} block, found {}",
                block.label
            ));
        }
        block.parse_x509().map_err(|e| {
            format!(
                "certificate block {} is not a valid X.509 certificate: {e}",
                blocks + 1
            )
        })?;
        blocks += 1;
    }

    if blocks == 0 {
        return Err("no PEM certificate found".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_PEM: &[u8] = include_bytes!("../tests/fixtures/server.pem");

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(
            endpoint_uri("10.128.0.7:6032").unwrap(),
            "https://10.128.0.7:6032"
        );
        assert_eq!(
            endpoint_uri("https://node-1.internal:6032/").unwrap(),
            "https://node-1.internal:6032"
        );
        assert_eq!(endpoint_uri("[::1]:6032").unwrap(), "https://[::1]:6032");
        assert!(endpoint_uri("10.128.0.7").is_err());
        assert!(endpoint_uri(":6032").is_err());
        assert!(endpoint_uri("host:http").is_err());
    }

    #[test]
    fn test_validate_certificate() {
        assert!(validate_certificate(SERVER_PEM).is_ok());
        assert!(validate_certificate(b"").is_err());
        assert!(validate_certificate(b"not a cert").is_err());
        assert!(
            validate_certificate(b"-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----")
                .is_err()
        );
        assert!(validate_certificate(b"-----BEGIN CERTIFICATE-----\nAAAA\n").is_err());
        assert!(validate_certificate(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_validate_certificate_parses_contents() {
        // Well-formed PEM framing around bytes that are not a certificate.
        let err = validate_certificate(
            b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap_err();
        assert!(err.contains("X.509"), "{err}");

        let mut bundle = SERVER_PEM.to_vec();
        bundle.extend_from_slice(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        assert!(validate_certificate(&bundle).is_err());

        let key = include_bytes!("../tests/fixtures/service_account_key.pem");
        assert!(validate_certificate(key).is_err());
    }

    #[test]
    fn test_validate_certificate_accepts_bundle_with_trailing_text() {
        let mut bundle = SERVER_PEM.to_vec();
        bundle.extend_from_slice(SERVER_PEM);
        bundle.extend_from_slice(b"\n");
        assert!(validate_certificate(&bundle).is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        // Nothing listens here; construction must still succeed.
        let settings = ChannelSettings::new("127.0.0.1:1");
        assert!(connect_channel(&settings, SERVER_PEM).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_certificate_contents_fail_setup() {
        let settings = ChannelSettings::new("127.0.0.1:1");
        let err = connect_channel(
            &settings,
            b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap_err();
        assert!(matches!(err, LogTailError::ChannelSetup { .. }));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_setup_errors_carry_address() {
        let settings = ChannelSettings::new("127.0.0.1:1");
        let err = connect_channel(&settings, b"garbage").unwrap_err();
        match err {
            LogTailError::ChannelSetup { address, .. } => assert_eq!(address, "127.0.0.1:1"),
            other => panic!("unexpected error {other:?}"),
        }

        let settings = ChannelSettings::new("no-port");
        assert!(matches!(
            connect_channel(&settings, SERVER_PEM),
            Err(LogTailError::ChannelSetup { .. })
        ));

        let mut settings = ChannelSettings::new("127.0.0.1:1");
        settings.server_name = " ".to_string();
        assert!(matches!(
            connect_channel(&settings, SERVER_PEM),
            Err(LogTailError::ChannelSetup { .. })
        ));
    }
}
