//! Reading task output from a worker.

use async_trait::async_trait;
use sparkles_protocol::{MonitorClient, ReadOutputRequest, SHARED_SECRET_METADATA_KEY};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;

use crate::credentials::{CredentialRecord, SHARED_SECRET_FIELD};
use crate::error::{LogTailError, Result, TransportError};

/// One bounded slice of task output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    pub payload: Vec<u8>,
    pub end_of_file: bool,
}

/// Something that answers "bytes of `task_id` starting at `offset`".
///
/// Implementations must be pure reads keyed by position so the poller can
/// repeat a failed request verbatim.
#[async_trait]
pub trait OutputSource: Send {
    /// Address used in log lines and error context.
    fn address(&self) -> &str;

    async fn read_output(
        &mut self,
        task_id: &str,
        offset: u64,
        max_size: u32,
    ) -> Result<LogChunk, TransportError>;
}

/// [`OutputSource`] backed by the worker's `Monitor` gRPC service.
#[derive(Debug, Clone)]
pub struct GrpcOutputSource {
    address: String,
    client: MonitorClient,
    shared_secret: MetadataValue<Ascii>,
}

impl GrpcOutputSource {
    pub fn new(
        address: impl Into<String>,
        channel: Channel,
        credentials: &CredentialRecord,
    ) -> Result<Self> {
        let shared_secret: MetadataValue<Ascii> =
            MetadataValue::try_from(credentials.shared_secret.as_str()).map_err(|_| {
                LogTailError::CredentialMalformed {
                    field: SHARED_SECRET_FIELD,
                    reason: "not a valid metadata value".to_string(),
                }
            })?;

        Ok(Self {
            address: address.into(),
            client: MonitorClient::new(channel),
            shared_secret,
        })
    }
}

#[async_trait]
impl OutputSource for GrpcOutputSource {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read_output(
        &mut self,
        task_id: &str,
        offset: u64,
        max_size: u32,
    ) -> Result<LogChunk, TransportError> {
        let mut request = tonic::Request::new(build_request(task_id, offset, max_size));
        request
            .metadata_mut()
            .insert(SHARED_SECRET_METADATA_KEY, self.shared_secret.clone());

        let reply = self.client.read_output(request).await?.into_inner();
        Ok(LogChunk {
            payload: reply.data,
            end_of_file: reply.end_of_file,
        })
    }
}

fn build_request(task_id: &str, offset: u64, max_size: u32) -> ReadOutputRequest {
    ReadOutputRequest {
        task_id: task_id.to_string(),
        offset: i64::try_from(offset).unwrap_or(i64::MAX),
        size: i32::try_from(max_size).unwrap_or(i32::MAX),
    }
}
