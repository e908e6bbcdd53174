//! Connection to the profiler API and the seam the collection loop talks
//! through.

use crate::cloudprofilerpb::{
    CreateProfileRequest, Profile, ProfilerServiceClient, UpdateProfileRequest,
};
use crate::credentials::AuthInterceptor;
use anyhow::Context;
use tonic::codec::CompressionEncoding;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;

/// The two calls the agent makes against the profiler service.
#[tonic::async_trait]
pub trait ProfilerApi: Send {
    async fn create_profile(&mut self, request: CreateProfileRequest) -> Result<Profile, Status>;

    async fn update_profile(&mut self, request: UpdateProfileRequest) -> Result<Profile, Status>;
}

pub type Client = ProfilerServiceClient<InterceptedService<Channel, AuthInterceptor>>;

#[tonic::async_trait]
impl ProfilerApi for Client {
    async fn create_profile(&mut self, request: CreateProfileRequest) -> Result<Profile, Status> {
        ProfilerServiceClient::create_profile(self, request)
            .await
            .map(tonic::Response::into_inner)
    }

    async fn update_profile(&mut self, request: UpdateProfileRequest) -> Result<Profile, Status> {
        ProfilerServiceClient::update_profile(self, request)
            .await
            .map(tonic::Response::into_inner)
    }
}

/// Dials `api` (host:port) over TLS, or plaintext when `insecure` is set.
pub async fn connect(api: &str, insecure: bool, auth: AuthInterceptor) -> anyhow::Result<Client> {
    let scheme = if insecure { "http" } else { "https" };
    let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, api))
        .with_context(|| format!("invalid API address {}", api))?
        .user_agent(concat!("perfagent/", env!("CARGO_PKG_VERSION")))?;
    if !insecure {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
    }

    log::info!("connecting to {} ...", api);
    let channel = endpoint
        .connect()
        .await
        .with_context(|| format!("error dialing {}", api))?;
    log::info!("connected to {}", api);

    Ok(ProfilerServiceClient::new(InterceptedService::new(channel, auth))
        .accept_compressed(CompressionEncoding::Gzip))
}
