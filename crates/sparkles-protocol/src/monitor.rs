//! Client for the `pb.Monitor` gRPC service.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

use crate::messages::{ReadOutputReply, ReadOutputRequest};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "pb.Monitor";

/// HTTP/2 path of the `ReadOutput` method.
pub const READ_OUTPUT_PATH: &str = "/pb.Monitor/ReadOutput";

/// Metadata key carrying the cluster shared secret on every call.
pub const SHARED_SECRET_METADATA_KEY: &str = "shared-secret";

/// Thin unary client over a tonic [`Channel`].
///
/// Cloning is cheap; clones share the underlying HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct MonitorClient {
    inner: tonic::client::Grpc<Channel>,
}

impl MonitorClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Read a bounded slice of a task's output.
    pub async fn read_output(
        &mut self,
        request: impl tonic::IntoRequest<ReadOutputRequest>,
    ) -> Result<tonic::Response<ReadOutputReply>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unavailable(format!("monitor service not ready: {e}"))
        })?;

        let codec = tonic_prost::ProstCodec::default();
        let path = PathAndQuery::from_static(READ_OUTPUT_PATH);
        let mut request = request.into_request();
        request
            .extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE_NAME, "ReadOutput"));
        self.inner.unary(request, path, codec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_matches_service() {
        assert!(READ_OUTPUT_PATH.starts_with(&format!("/{SERVICE_NAME}/")));
        assert!(READ_OUTPUT_PATH.ends_with("/ReadOutput"));
    }

    #[test]
    fn test_metadata_key_is_valid_ascii_key() {
        let key: tonic::metadata::MetadataKey<tonic::metadata::Ascii> =
            SHARED_SECRET_METADATA_KEY.parse().unwrap();
        assert_eq!(key.as_str(), SHARED_SECRET_METADATA_KEY);
    }
}
