//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sparkles_logtail::TransportError;
use sparkles_logtail::monitor::{LogChunk, OutputSource};
use sparkles_logtail::poller::PollOptions;
use sparkles_logtail::sink::OutputSink;

pub const WORKER_ADDRESS: &str = "10.0.0.7:6032";

/// A read the poller issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCall {
    pub task_id: String,
    pub offset: u64,
    pub max_size: u32,
}

/// One scripted answer.
#[derive(Debug)]
pub enum Step {
    Chunk(LogChunk),
    Fail(TransportError),
    /// Never answers; the poller's call deadline has to fire.
    Hang,
}

impl Step {
    pub fn data(payload: &[u8]) -> Self {
        Step::Chunk(LogChunk {
            payload: payload.to_vec(),
            end_of_file: false,
        })
    }

    pub fn last(payload: &[u8]) -> Self {
        Step::Chunk(LogChunk {
            payload: payload.to_vec(),
            end_of_file: true,
        })
    }

    pub fn empty() -> Self {
        Step::Chunk(LogChunk::default())
    }

    pub fn unavailable() -> Self {
        Step::Fail(TransportError::Status(tonic::Status::unavailable(
            "connection refused",
        )))
    }
}

/// Replays `steps` in order, recording every call. Once the script runs out
/// it keeps answering with empty, unfinished chunks.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    steps: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<ReadCall>>>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<ReadCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.calls().into_iter().map(|c| c.offset).collect()
    }
}

#[async_trait]
impl OutputSource for ScriptedSource {
    fn address(&self) -> &str {
        WORKER_ADDRESS
    }

    async fn read_output(
        &mut self,
        task_id: &str,
        offset: u64,
        max_size: u32,
    ) -> Result<LogChunk, TransportError> {
        self.calls.lock().unwrap().push(ReadCall {
            task_id: task_id.to_string(),
            offset,
            max_size,
        });
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Chunk(chunk)) => Ok(chunk),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(LogChunk::default()),
        }
    }
}

/// Serves a finished output buffer by position, like a worker whose task
/// has already exited.
#[derive(Debug, Clone)]
pub struct BufferSource {
    data: Arc<Vec<u8>>,
    calls: Arc<Mutex<Vec<ReadCall>>>,
}

impl BufferSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<ReadCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutputSource for BufferSource {
    fn address(&self) -> &str {
        WORKER_ADDRESS
    }

    async fn read_output(
        &mut self,
        task_id: &str,
        offset: u64,
        max_size: u32,
    ) -> Result<LogChunk, TransportError> {
        self.calls.lock().unwrap().push(ReadCall {
            task_id: task_id.to_string(),
            offset,
            max_size,
        });
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(max_size as usize).min(self.data.len());
        Ok(LogChunk {
            payload: self.data[start..end].to_vec(),
            end_of_file: end == self.data.len(),
        })
    }
}

/// Keeps every emitted chunk in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        self.chunks().concat()
    }
}

impl OutputSink for RecordingSink {
    fn emit(&mut self, _received_at: DateTime<Local>, text: &str) -> io::Result<()> {
        self.chunks.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// A sink whose output has gone away.
#[derive(Debug, Default)]
pub struct BrokenSink;

impl OutputSink for BrokenSink {
    fn emit(&mut self, _received_at: DateTime<Local>, _text: &str) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
    }
}

/// Poll options that never sleep between empty reads.
pub fn fast_options(chunk_size: u32) -> PollOptions {
    PollOptions {
        chunk_size,
        idle_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
    }
}
