//! Messages of `google.devtools.cloudprofiler.v2`, declared by hand so the
//! agent builds without a protobuf toolchain.
//!
//! The protocol between agent and profiler API is documented in
//! `google/devtools/cloudprofiler/v2/profiler.proto` in the googleapis
//! repository.

mod client;

pub use client::ProfilerServiceClient;
use std::collections::HashMap;

/// CreateProfileRequest describes a profile resource online creation request.
/// The deployment field must be populated. The profile_type specifies the list
/// of profile types supported by the agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateProfileRequest {
    /// Parent project to create the profile in, "projects/{project}".
    #[prost(string, tag = "4")]
    pub parent: String,
    #[prost(message, optional, tag = "1")]
    pub deployment: Option<Deployment>,
    /// One or more profile types that the agent is capable of providing.
    #[prost(enumeration = "ProfileType", repeated, tag = "2")]
    pub profile_type: Vec<i32>,
}

/// UpdateProfileRequest contains the profile to update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateProfileRequest {
    #[prost(message, optional, tag = "1")]
    pub profile: Option<Profile>,
    #[prost(message, optional, tag = "2")]
    pub update_mask: Option<::prost_types::FieldMask>,
}

/// Profile resource. Doubles as the collection request handed out by the
/// service and as the carrier of the finished profile bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Profile {
    /// Opaque, server-assigned, unique ID for this profile.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "ProfileType", tag = "2")]
    pub profile_type: i32,
    #[prost(message, optional, tag = "3")]
    pub deployment: Option<Deployment>,
    /// Duration of the profiling session.
    #[prost(message, optional, tag = "4")]
    pub duration: Option<::prost_types::Duration>,
    /// Gzip compressed serialized profile data in protobuf format.
    #[prost(bytes = "vec", tag = "5")]
    pub profile_bytes: Vec<u8>,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<String, String>,
}

/// Deployment contains the deployment identification information.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Deployment {
    #[prost(string, tag = "1")]
    pub project_id: String,
    /// Name of the deployment target, e.g. a service name.
    #[prost(string, tag = "2")]
    pub target: String,
    #[prost(map = "string, string", tag = "3")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProfileType {
    Unspecified = 0,
    /// Thread CPU time sampling.
    Cpu = 1,
    /// Wallclock time sampling.
    Wall = 2,
    /// In-use heap profile.
    Heap = 3,
    /// Single-shot collection of all thread stacks.
    Threads = 4,
    /// Synchronization contention profile.
    Contention = 5,
    PeakHeap = 6,
    HeapAlloc = 7,
}

impl ProfileType {
    /// Name of the variant as it appears in the proto definition.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::Unspecified => "PROFILE_TYPE_UNSPECIFIED",
            Self::Cpu => "CPU",
            Self::Wall => "WALL",
            Self::Heap => "HEAP",
            Self::Threads => "THREADS",
            Self::Contention => "CONTENTION",
            Self::PeakHeap => "PEAK_HEAP",
            Self::HeapAlloc => "HEAP_ALLOC",
        }
    }
}
