//! Tail the output of a task running on a sparkles worker.
//!
//! The worker keeps the task's output; this crate reads it incrementally over
//! the worker's `Monitor` gRPC service. The flow is one-directional: cluster
//! credentials are looked up ([`credentials`]), a TLS channel is built with
//! them ([`channel`]), and a [`poller::LogPoller`] reads from that channel and
//! renders each chunk through a [`sink::OutputSink`].

pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod monitor;
pub mod poller;
pub mod retry;
pub mod sink;
pub mod tail;

pub use error::{LogTailError, Result, StoreError, TransportError};
