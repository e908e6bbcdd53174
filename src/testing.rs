//! Test doubles shared by the unit tests.

use crate::cloudprofilerpb::{
    CreateProfileRequest, Deployment, Profile, ProfileType, UpdateProfileRequest,
};
use crate::negotiator::Sleeper;
use crate::remote::ProfilerApi;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::Status;

pub fn deployment() -> Deployment {
    Deployment {
        project_id: "test-project".into(),
        target: "test-service".into(),
        labels: HashMap::from([("zone".to_string(), "us-central1-a".to_string())]),
    }
}

pub fn profile(name: &str, profile_type: ProfileType, seconds: i64) -> Profile {
    Profile {
        name: name.into(),
        profile_type: profile_type.into(),
        deployment: Some(deployment()),
        duration: Some(prost_types::Duration { seconds, nanos: 0 }),
        ..Default::default()
    }
}

pub fn cpu_profile(name: &str, seconds: i64) -> Profile {
    profile(name, ProfileType::Cpu, seconds)
}

/// Answers CreateProfile from a script and records every request. Once the
/// script runs out, CreateProfile fails with PERMISSION_DENIED, which ends
/// any collection loop.
#[derive(Default)]
pub struct ScriptedApi {
    script: VecDeque<Result<Profile, Status>>,
    update_results: VecDeque<Status>,
    pub creates: Vec<CreateProfileRequest>,
    pub updates: Vec<UpdateProfileRequest>,
}

impl ScriptedApi {
    pub fn new(script: Vec<Result<Profile, Status>>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    /// Makes the next UpdateProfile calls fail with `status`, in order.
    pub fn fail_updates(mut self, statuses: Vec<Status>) -> Self {
        self.update_results = statuses.into();
        self
    }
}

#[tonic::async_trait]
impl ProfilerApi for ScriptedApi {
    async fn create_profile(&mut self, request: CreateProfileRequest) -> Result<Profile, Status> {
        self.creates.push(request);
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(Status::permission_denied("script exhausted")))
    }

    async fn update_profile(&mut self, request: UpdateProfileRequest) -> Result<Profile, Status> {
        let profile = request.profile.clone().unwrap_or_default();
        self.updates.push(request);
        match self.update_results.pop_front() {
            Some(status) => Err(status),
            None => Ok(profile),
        }
    }
}

/// Records requested sleeps instead of sleeping.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}
