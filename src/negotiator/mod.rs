//! Obtains the next collection request from the profiler service.
//!
//! The service staggers agents on purpose: CreateProfile may be answered with
//! ABORTED plus a retry delay, which is honored as is. Transient failures
//! without such guidance back off exponentially, capped at five minutes.

mod retry_info;

use crate::cloudprofilerpb::{CreateProfileRequest, Deployment, Profile, ProfileType};
use crate::errors::NegotiationError;
use crate::remote::ProfilerApi;
pub use retry_info::server_advised_delay;
use std::time::Duration;
use tonic::{Code, Status};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

#[tonic::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[tonic::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// `min(2^exponent seconds, max_backoff)`
    pub fn backoff(&self, exponent: u32) -> Duration {
        2u64.checked_pow(exponent)
            .map(Duration::from_secs)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Progress of one negotiation; starts fresh for every loop iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    /// Only advanced by locally computed backoffs.
    pub exponent: u32,
    pub backoff: Duration,
}

/// Codes worth another try.
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted | Code::Unavailable
    )
}

pub struct RequestNegotiator<S> {
    policy: RetryPolicy,
    sleeper: S,
    supported: Vec<ProfileType>,
}

impl<S: Sleeper> RequestNegotiator<S> {
    pub fn new(policy: RetryPolicy, sleeper: S, supported: Vec<ProfileType>) -> Self {
        Self {
            policy,
            sleeper,
            supported,
        }
    }

    fn request(&self, deployment: &Deployment) -> CreateProfileRequest {
        CreateProfileRequest {
            parent: format!("projects/{}", deployment.project_id),
            deployment: Some(deployment.clone()),
            profile_type: self.supported.iter().map(|t| *t as i32).collect(),
        }
    }

    pub async fn negotiate<C: ProfilerApi>(
        &self,
        client: &mut C,
        deployment: &Deployment,
    ) -> Result<Profile, NegotiationError> {
        let request = self.request(deployment);
        let mut state = RetryState::default();

        loop {
            let status = match client.create_profile(request.clone()).await {
                Ok(profile) => {
                    log::info!(
                        "received {} profile request {} after {} attempt(s)",
                        profile.profile_type().as_str_name(),
                        profile.name,
                        state.attempts + 1
                    );
                    return Ok(profile);
                }
                Err(status) => status,
            };
            state.attempts += 1;

            if !is_retryable(&status) {
                return Err(NegotiationError::Rejected(status));
            }
            if state.attempts >= self.policy.max_attempts {
                return Err(NegotiationError::Exhausted {
                    attempts: state.attempts,
                    last: status,
                });
            }

            state.backoff = match server_advised_delay(&status) {
                Some(delay) => {
                    log::warn!(
                        "CreateProfile failed: {}, retrying using server-advised delay of {:?}",
                        status,
                        delay
                    );
                    delay
                }
                None => {
                    state.exponent += 1;
                    let backoff = self.policy.backoff(state.exponent);
                    log::warn!("CreateProfile failed: {}, retrying in {:?}", status, backoff);
                    backoff
                }
            };
            self.sleeper.sleep(state.backoff).await;
        }
    }
}
