//! Wire protocol for the sparkles worker `Monitor` service.
//!
//! Workers expose a small gRPC service (`pb.Monitor`) that lets a client
//! read the stdout/stderr a task has produced so far. The message types are
//! declared by hand with `prost` derives so the crate builds without `protoc`.

pub mod messages;
pub mod monitor;

pub use messages::{ReadOutputReply, ReadOutputRequest};
pub use monitor::{MonitorClient, READ_OUTPUT_PATH, SERVICE_NAME, SHARED_SECRET_METADATA_KEY};
