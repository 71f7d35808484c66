//! Wiring: credentials -> channel -> poller.

use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelSettings, connect_channel};
use crate::credentials::{CredentialStore, RecordKey, resolve_credentials};
use crate::error::Result;
use crate::monitor::GrpcOutputSource;
use crate::poller::{LogPoller, PollOptions, PollSummary};
use crate::retry::RetryPolicy;
use crate::sink::OutputSink;

/// Everything needed to tail one task on one worker.
#[derive(Debug, Clone)]
pub struct TailRequest {
    pub record_key: RecordKey,
    pub channel: ChannelSettings,
    pub task_id: String,
    pub options: PollOptions,
    pub retry: RetryPolicy,
}

/// Resolve the cluster credentials and open an output source on the worker.
///
/// Credentials are fetched fresh on every call.
pub async fn open_source<St>(
    store: &St,
    record_key: &RecordKey,
    settings: &ChannelSettings,
) -> Result<GrpcOutputSource>
where
    St: CredentialStore + ?Sized,
{
    let credentials = resolve_credentials(store, record_key).await?;
    let channel = connect_channel(settings, &credentials.transport_certificate)?;
    GrpcOutputSource::new(settings.address.clone(), channel, &credentials)
}

/// Tail `request.task_id` into `sink` until the output ends or `cancel` fires.
pub async fn tail_task<St, K>(
    store: &St,
    request: TailRequest,
    sink: K,
    cancel: &CancellationToken,
) -> Result<PollSummary>
where
    St: CredentialStore + ?Sized,
    K: OutputSink,
{
    let source = open_source(store, &request.record_key, &request.channel).await?;
    let mut poller = LogPoller::new(
        source,
        sink,
        request.task_id,
        request.options,
        request.retry,
    );
    poller.run(cancel).await
}
