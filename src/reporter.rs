//! Hands the finished profile back to the service.
//!
//! A single UpdateProfile attempt is made. A lost report must not stall the
//! collection that follows it, so failures are only logged.

use crate::cloudprofilerpb::{Profile, UpdateProfileRequest};
use crate::remote::ProfilerApi;
use tonic::Status;

#[derive(Debug, Default, Clone, Copy)]
pub struct UploadReporter;

impl UploadReporter {
    pub async fn try_report<C: ProfilerApi>(
        &self,
        client: &mut C,
        profile: Profile,
    ) -> Result<(), Status> {
        let name = profile.name.clone();
        let size = profile.profile_bytes.len();
        client
            .update_profile(UpdateProfileRequest {
                profile: Some(profile),
                update_mask: None,
            })
            .await?;
        log::info!("uploaded profile {} ({} bytes)", name, size);
        Ok(())
    }

    pub async fn report<C: ProfilerApi>(&self, client: &mut C, profile: Profile) {
        let name = profile.name.clone();
        if let Err(status) = self.try_report(client, profile).await {
            log::error!("failed to update profile {}: {}", name, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cpu_profile, ScriptedApi};

    #[tokio::test]
    async fn test_report_sends_profile_bytes() {
        let mut api = ScriptedApi::default();
        let mut profile = cpu_profile("projects/p/profiles/1", 10);
        profile.profile_bytes = vec![0x1f, 0x8b, 0x08];

        UploadReporter.try_report(&mut api, profile.clone()).await.unwrap();

        assert_eq!(api.updates.len(), 1);
        assert_eq!(api.updates[0].profile.as_ref(), Some(&profile));
    }

    #[tokio::test]
    async fn test_report_failure_is_not_retried() {
        let mut api = ScriptedApi::default().fail_updates(vec![Status::unavailable("flaky")]);

        UploadReporter.report(&mut api, cpu_profile("p", 10)).await;

        assert_eq!(api.updates.len(), 1);
    }
}
