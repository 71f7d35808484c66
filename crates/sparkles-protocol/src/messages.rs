//! Protobuf messages of the `pb` package.
//!
//! ```proto
//! message ReadOutputRequest { string taskId = 1; int64 offset = 2; int32 size = 3; }
//! message ReadOutputReply   { bytes data = 1; bool endOfFile = 2; }
//! ```

/// Request for up to `size` bytes of a task's output starting at `offset`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ReadOutputRequest {
    /// Task whose output is read.
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    /// Byte offset into the output already consumed by the caller.
    #[prost(int64, tag = "2")]
    pub offset: i64,
    /// Maximum number of bytes the worker may return.
    #[prost(int32, tag = "3")]
    pub size: i32,
}

/// A slice of task output.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ReadOutputReply {
    /// Raw output bytes, possibly empty.
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Set once nothing will ever be appended at or after the returned range.
    #[prost(bool, tag = "2")]
    pub end_of_file: bool,
}
