use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{DeviceIdentity, DeviceToken, RegistrationStatus, Session};
use thiserror::Error;

pub mod http;
pub mod merger;
pub mod orchestrator;
pub mod state;

pub use http::{HttpRegistrationBackend, HttpSessionSource};
pub use merger::{merge_statuses, EffectiveState, REGISTERED_ELSEWHERE_MESSAGE};
pub use orchestrator::{
    OrchestratorConfig, PipelineOutcome, RegistrationDependencies, RegistrationOrchestrator,
    SkipReason,
};
pub use state::{RegistrationChange, RegistrationState};

/// Issues the opaque session the registration backends expect.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_session(&self) -> Result<Session>;
}

/// Asks the platform for notification permission and returns the device
/// token. A denial is reported as an error, never as an empty token.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn request_permission_and_token(&self) -> Result<DeviceToken>;
}

/// One push-registration service. `Ok(false)` from `register`/`deregister`
/// means the call went through but the service did not apply it.
#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Both backends receive the current session. A backend that keys its
    /// status by identity alone, as the secondary usually does, may ignore it.
    async fn query_status(
        &self,
        identity: &DeviceIdentity,
        session: &Session,
    ) -> Result<RegistrationStatus>;
    async fn register(
        &self,
        identity: &DeviceIdentity,
        session: &Session,
        device_token: &DeviceToken,
    ) -> Result<bool>;
    async fn deregister(&self, identity: &DeviceIdentity) -> Result<bool>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("notification permission denied")]
    PermissionDenied,
}

/// Credential source backed by a token supplied up front, e.g. from the
/// command line. No token behaves like a user refusing the permission prompt.
pub struct StaticCredentialSource {
    token: Option<DeviceToken>,
}

impl StaticCredentialSource {
    pub fn new(token: Option<DeviceToken>) -> Self {
        Self { token }
    }

    pub fn denied() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn request_permission_and_token(&self) -> Result<DeviceToken> {
        self.token
            .clone()
            .ok_or_else(|| CredentialError::PermissionDenied.into())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
