//! Cursor-driven polling of a task's output.
//!
//! The poller asks the worker for bytes starting at the number of bytes it
//! has already consumed, hands whatever comes back to the sink and advances
//! its offset by exactly the payload length. Requests are strictly
//! sequential, so output reaches the sink in offset order, and a failed
//! request can be repeated verbatim without duplicating or skipping bytes.

use std::time::{Duration, Instant};

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LogTailError, Result, TransportError};
use crate::monitor::{LogChunk, OutputSource};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{ChunkDecoder, OutputSink};

/// Upper bound on bytes requested per call.
pub const DEFAULT_CHUNK_SIZE: u32 = 100_000;

/// Tuning knobs for one poll session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Maximum bytes requested per call.
    pub chunk_size: u32,
    /// Pause after a response with no new bytes. Zero re-polls immediately.
    pub idle_delay: Duration,
    /// Deadline for a single call; expiry counts as a transient failure.
    pub request_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How far into a task's output we are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    task_id: String,
    offset: u64,
    end_of_stream: bool,
}

impl StreamCursor {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            offset: 0,
            end_of_stream: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    fn advance(&mut self, consumed: usize) {
        self.offset += consumed as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    /// The worker signalled end of output.
    Finished,
    /// Stopped through the cancellation token before the end of output.
    Cancelled,
}

/// Where a poll session ended and what it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub state: PollState,
    pub offset: u64,
    /// Calls issued, including retried ones.
    pub requests: u64,
    /// Chunks handed to the sink.
    pub chunks: u64,
    /// Failed calls that were retried.
    pub retries: u64,
}

/// Polls one task on one worker until its output ends.
pub struct LogPoller<S, K> {
    source: S,
    sink: K,
    options: PollOptions,
    retry: RetryPolicy,
    cursor: StreamCursor,
    decoder: ChunkDecoder,
    state: PollState,
    requests: u64,
    chunks: u64,
    retries: u64,
}

impl<S: OutputSource, K: OutputSink> LogPoller<S, K> {
    pub fn new(
        source: S,
        sink: K,
        task_id: impl Into<String>,
        options: PollOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            options,
            retry,
            cursor: StreamCursor::new(task_id),
            decoder: ChunkDecoder::new(),
            state: PollState::Polling,
            requests: 0,
            chunks: 0,
            retries: 0,
        }
    }

    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }

    fn summary(&self) -> PollSummary {
        PollSummary {
            state: self.state,
            offset: self.cursor.offset,
            requests: self.requests,
            chunks: self.chunks,
            retries: self.retries,
        }
    }

    /// Poll until the worker reports end of output or `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<PollSummary> {
        if self.state != PollState::Polling {
            return Ok(self.summary());
        }

        info!(
            task_id = %self.cursor.task_id,
            address = %self.source.address(),
            offset = self.cursor.offset,
            "tailing task output"
        );

        while self.state == PollState::Polling {
            let Some(chunk) = self.fetch(cancel).await? else {
                self.state = PollState::Cancelled;
                break;
            };

            if !chunk.payload.is_empty() {
                self.deliver(&chunk)?;
            }

            if chunk.end_of_file {
                self.decoder
                    .finish()
                    .map_err(|source| LogTailError::Decode {
                        task_id: self.cursor.task_id.clone(),
                        offset: self.cursor.offset,
                        source,
                    })?;
                self.cursor.end_of_stream = true;
                self.state = PollState::Finished;
                break;
            }

            if chunk.payload.is_empty() && !pause(cancel, self.options.idle_delay).await {
                self.state = PollState::Cancelled;
            }
        }

        let summary = self.summary();
        info!(
            task_id = %self.cursor.task_id,
            state = ?summary.state,
            offset = summary.offset,
            requests = summary.requests,
            retries = summary.retries,
            "stopped tailing task output"
        );
        Ok(summary)
    }

    /// Decode and emit one non-empty payload, then advance the cursor.
    fn deliver(&mut self, chunk: &LogChunk) -> Result<()> {
        let received_at = Local::now();
        let text = self
            .decoder
            .decode(&chunk.payload)
            .map_err(|source| LogTailError::Decode {
                task_id: self.cursor.task_id.clone(),
                offset: self.cursor.offset,
                source,
            })?;

        if !text.is_empty() {
            self.sink
                .emit(received_at, &text)
                .map_err(|source| LogTailError::Sink {
                    task_id: self.cursor.task_id.clone(),
                    source,
                })?;
            self.chunks += 1;
        }

        self.cursor.advance(chunk.payload.len());
        Ok(())
    }

    /// Issue the read at the current offset, retrying transient failures.
    ///
    /// Returns `Ok(None)` when cancelled.
    async fn fetch(&mut self, cancel: &CancellationToken) -> Result<Option<LogChunk>> {
        let task_id = self.cursor.task_id.clone();
        let offset = self.cursor.offset;
        let timeout = self.options.request_timeout;
        let mut attempt: u32 = 0;
        let mut first_failure: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            self.requests += 1;
            let call = self
                .source
                .read_output(&task_id, offset, self.options.chunk_size);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = tokio::time::timeout(timeout, call) => result,
            };

            let error = match outcome {
                Ok(Ok(chunk)) => return Ok(Some(chunk)),
                Ok(Err(error)) => error,
                Err(_) => TransportError::Timeout(timeout),
            };

            attempt += 1;
            let failing_for = first_failure.get_or_insert_with(Instant::now).elapsed();
            match self.retry.decide(attempt, failing_for) {
                RetryDecision::Retry(delay) => {
                    let delay = self.retry.jittered(delay);
                    debug!(
                        task_id = %task_id,
                        address = %self.source.address(),
                        offset,
                        attempt,
                        ?delay,
                        error = %error,
                        "read failed, retrying"
                    );
                    self.retries += 1;
                    if !pause(cancel, delay).await {
                        return Ok(None);
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(
                        task_id = %task_id,
                        address = %self.source.address(),
                        offset,
                        attempt,
                        error = %error,
                        "read failed, giving up"
                    );
                    return Err(LogTailError::RetriesExhausted {
                        address: self.source.address().to_string(),
                        task_id,
                        offset,
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_starts_at_zero() {
        let cursor = StreamCursor::new("job-1.0");
        assert_eq!(cursor.task_id(), "job-1.0");
        assert_eq!(cursor.offset(), 0);
        assert!(!cursor.is_end_of_stream());
    }

    #[test]
    fn test_cursor_advances_by_payload_length() {
        let mut cursor = StreamCursor::new("t");
        cursor.advance(100_000);
        cursor.advance(0);
        cursor.advance(50_000);
        assert_eq!(cursor.offset(), 150_000);
    }

    #[test]
    fn test_default_options() {
        let options = PollOptions::default();
        assert_eq!(options.chunk_size, 100_000);
        assert!(options.request_timeout > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_pause_honours_cancellation() {
        let cancel = CancellationToken::new();
        assert!(pause(&cancel, Duration::ZERO).await);
        assert!(pause(&cancel, Duration::from_millis(1)).await);
        cancel.cancel();
        assert!(!pause(&cancel, Duration::ZERO).await);
        assert!(!pause(&cancel, Duration::from_secs(3600)).await);
    }
}
