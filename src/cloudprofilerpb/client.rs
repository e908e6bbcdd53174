use super::{CreateProfileRequest, Profile, UpdateProfileRequest};
use tonic::codec::CompressionEncoding;
use tonic::codegen::{http, Body, Bytes, StdError};

const SERVICE: &str = "google.devtools.cloudprofiler.v2.ProfilerService";

/// Manage the collection of continuous profiling data provided by profiling
/// agents running in the cloud or by an offline provider of profiling data.
#[derive(Debug, Clone)]
pub struct ProfilerServiceClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> ProfilerServiceClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
{
    pub fn new(inner: T) -> Self {
        let inner = tonic::client::Grpc::new(inner);
        Self { inner }
    }

    /// Enable decompressing responses.
    #[must_use]
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.inner = self.inner.accept_compressed(encoding);
        self
    }

    /// CreateProfile creates a new profile resource in the online mode.
    ///
    /// The server ensures that the new profiles are created at a constant rate
    /// per deployment, so the creation request may hang for some time until
    /// the next profile session is available. It may also answer with
    /// ABORTED plus a `google.rpc.RetryInfo` asking the agent to come back
    /// later.
    pub async fn create_profile(
        &mut self,
        request: impl tonic::IntoRequest<CreateProfileRequest>,
    ) -> std::result::Result<tonic::Response<Profile>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(
            "/google.devtools.cloudprofiler.v2.ProfilerService/CreateProfile",
        );
        let mut req = request.into_request();
        req.extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE, "CreateProfile"));
        self.inner.unary(req, path, codec).await
    }

    /// UpdateProfile updates the profile bytes and labels on the profile
    /// resource created in the online mode.
    pub async fn update_profile(
        &mut self,
        request: impl tonic::IntoRequest<UpdateProfileRequest>,
    ) -> std::result::Result<tonic::Response<Profile>, tonic::Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(
            "/google.devtools.cloudprofiler.v2.ProfilerService/UpdateProfile",
        );
        let mut req = request.into_request();
        req.extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE, "UpdateProfile"));
        self.inner.unary(req, path, codec).await
    }

    async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
        })
    }
}
