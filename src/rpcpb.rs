//! The pieces of `google.rpc` the agent reads off failed calls.

/// Trailing metadata key under which servers attach a serialized [`RetryInfo`].
pub const RETRY_INFO_KEY: &str = "google.rpc.retryinfo-bin";

/// Type URL of a [`RetryInfo`] packed into [`Status::details`].
pub const RETRY_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// The rich error model carried in `grpc-status-details-bin`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<::prost_types::Any>,
}

/// Describes when the client may retry a failed request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryInfo {
    #[prost(message, optional, tag = "1")]
    pub retry_delay: Option<::prost_types::Duration>,
}
