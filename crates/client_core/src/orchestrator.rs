//! Refresh / enable / disable pipelines over the two registration backends.
//!
//! All state writes go through the orchestrator's state lock, and the
//! `is_loading` flag doubles as the guard that keeps pipelines from
//! overlapping. The lock is never held across a backend call.

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use anyhow::Result;
use shared::domain::{DeviceIdentity, RegistrationStatus, Session};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    merger::merge_statuses,
    state::{OrchestratorState, RegistrationChange, RegistrationState, StateWriter},
    CredentialSource, RegistrationBackend, SessionSource,
};

pub const DEFAULT_SESSION_SETTLE_DELAY: Duration = Duration::from_secs(3);

const REGISTRATION_REJECTED_MESSAGE: &str = "Registration did not complete successfully.";
const DEREGISTRATION_REJECTED_MESSAGE: &str = "De-registration did not complete successfully.";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait applied after every session fetch before the session is used.
    /// The session-issuing service needs this long to settle.
    pub session_settle_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_settle_delay: DEFAULT_SESSION_SETTLE_DELAY,
        }
    }
}

pub struct RegistrationDependencies {
    pub sessions: Arc<dyn SessionSource>,
    pub credentials: Arc<dyn CredentialSource>,
    /// Backend whose "registered elsewhere" report is authoritative.
    pub primary: Arc<dyn RegistrationBackend>,
    pub secondary: Arc<dyn RegistrationBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Busy,
    AlreadyRegistered,
    AlreadyUnregistered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A guard refused to start the pipeline; nothing was called or changed.
    Skipped(SkipReason),
    Completed,
    /// Every call succeeded but at least one backend reported `false`.
    Rejected,
    Failed { cause: String },
    /// The pipeline task was aborted by `shutdown` before it finished.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Refresh,
    Enable,
    Disable,
}

impl Pipeline {
    fn toggle(enabled: bool) -> Self {
        if enabled {
            Pipeline::Enable
        } else {
            Pipeline::Disable
        }
    }

    fn label(self) -> &'static str {
        match self {
            Pipeline::Refresh => "refresh",
            Pipeline::Enable => "enable",
            Pipeline::Disable => "disable",
        }
    }
}

pub struct RegistrationOrchestrator {
    identity: DeviceIdentity,
    config: OrchestratorConfig,
    sessions: Arc<dyn SessionSource>,
    credentials: Arc<dyn CredentialSource>,
    primary: Arc<dyn RegistrationBackend>,
    secondary: Arc<dyn RegistrationBackend>,
    inner: Mutex<OrchestratorState>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<RegistrationChange>,
}

impl RegistrationOrchestrator {
    pub fn new(identity: DeviceIdentity, dependencies: RegistrationDependencies) -> Arc<Self> {
        Self::new_with_config(identity, dependencies, OrchestratorConfig::default())
    }

    pub fn new_with_config(
        identity: DeviceIdentity,
        dependencies: RegistrationDependencies,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let RegistrationDependencies {
            sessions,
            credentials,
            primary,
            secondary,
        } = dependencies;
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            identity,
            config,
            sessions,
            credentials,
            primary,
            secondary,
            inner: Mutex::new(OrchestratorState::default()),
            tasks: StdMutex::new(Vec::new()),
            events,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub async fn snapshot(&self) -> RegistrationState {
        self.inner.lock().await.published.clone()
    }

    pub async fn cached_session(&self) -> Option<Session> {
        self.inner.lock().await.cached_session.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationChange> {
        self.events.subscribe()
    }

    /// Re-reads both backends and republishes the merged state. A refresh
    /// requested while another pipeline runs is dropped, since the running
    /// pipeline already ends in a fresh publish.
    pub async fn refresh(self: &Arc<Self>) -> PipelineOutcome {
        self.run_detached(Pipeline::Refresh).await
    }

    pub async fn set_desired_state(self: &Arc<Self>, enabled: bool) -> PipelineOutcome {
        self.run_detached(Pipeline::toggle(enabled)).await
    }

    pub fn spawn_refresh(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        self.track(tokio::spawn(async move {
            orchestrator.run(Pipeline::Refresh).await;
        }));
    }

    pub fn spawn_set_desired_state(self: &Arc<Self>, enabled: bool) {
        let orchestrator = Arc::clone(self);
        self.track(tokio::spawn(async move {
            orchestrator.run(Pipeline::toggle(enabled)).await;
        }));
    }

    /// Aborts every pipeline task still running and waits for them to
    /// unwind. An aborted pipeline leaves `is_loading` set, so the
    /// orchestrator is not meant to be driven after this.
    pub async fn shutdown(&self) {
        let handles = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        if !handles.is_empty() {
            debug!(identity = %self.identity, count = handles.len(), "aborting pipeline tasks");
        }
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Runs the pipeline on its own tracked task and waits for the outcome.
    /// Dropping the returned future detaches the caller; the pipeline still
    /// runs to its final publish.
    async fn run_detached(self: &Arc<Self>, pipeline: Pipeline) -> PipelineOutcome {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let orchestrator = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let _ = outcome_tx.send(orchestrator.run(pipeline).await);
        }));
        outcome_rx.await.unwrap_or(PipelineOutcome::Aborted)
    }

    async fn run(&self, pipeline: Pipeline) -> PipelineOutcome {
        match pipeline {
            Pipeline::Refresh => self.reload().await,
            Pipeline::Enable => self.enable().await,
            Pipeline::Disable => self.disable().await,
        }
    }

    async fn reload(&self) -> PipelineOutcome {
        if let Err(reason) = self.begin(Pipeline::Refresh).await {
            return PipelineOutcome::Skipped(reason);
        }

        match self.load_statuses().await {
            Ok((session, primary, secondary)) => {
                let effective = merge_statuses(primary, secondary);
                info!(
                    identity = %self.identity,
                    ?primary,
                    ?secondary,
                    is_registered = effective.is_registered,
                    "refresh: statuses reconciled"
                );
                self.write(|state| {
                    state.cache_session(session);
                    state.set_registered(effective.is_registered);
                    state.set_info_message(effective.info_message);
                    state.set_loading(false);
                })
                .await;
                PipelineOutcome::Completed
            }
            Err(err) => self.fail(Pipeline::Refresh, "Failed to load status", err).await,
        }
    }

    async fn enable(&self) -> PipelineOutcome {
        if let Err(reason) = self.begin(Pipeline::Enable).await {
            return PipelineOutcome::Skipped(reason);
        }

        match self.register_with_backends().await {
            Ok((session, true)) => {
                info!(identity = %self.identity, "enable: registered with both backends");
                self.write(|state| {
                    state.cache_session(session);
                    state.set_registered(true);
                    state.set_loading(false);
                })
                .await;
                PipelineOutcome::Completed
            }
            Ok((_, false)) => self.reject(Pipeline::Enable, REGISTRATION_REJECTED_MESSAGE).await,
            Err(err) => self.fail(Pipeline::Enable, "Registration failed", err).await,
        }
    }

    async fn disable(&self) -> PipelineOutcome {
        if let Err(reason) = self.begin(Pipeline::Disable).await {
            return PipelineOutcome::Skipped(reason);
        }

        let (primary, secondary) = tokio::join!(
            self.primary.deregister(&self.identity),
            self.secondary.deregister(&self.identity),
        );
        match both(primary, secondary) {
            Ok((true, true)) => {
                info!(identity = %self.identity, "disable: deregistered from both backends");
                self.write(|state| {
                    state.set_registered(false);
                    state.set_loading(false);
                })
                .await;
                PipelineOutcome::Completed
            }
            Ok(_) => {
                self.reject(Pipeline::Disable, DEREGISTRATION_REJECTED_MESSAGE)
                    .await
            }
            Err(err) => {
                self.fail(Pipeline::Disable, "De-registration failed", err)
                    .await
            }
        }
    }

    /// Checks the guards and, if they pass, enters the loading state in the
    /// same critical section so no second pipeline can slip in between.
    async fn begin(&self, pipeline: Pipeline) -> std::result::Result<(), SkipReason> {
        let outcome = self
            .write(|state| {
                let current = state.published();
                if current.is_loading {
                    return Err(SkipReason::Busy);
                }
                match pipeline {
                    Pipeline::Enable if current.is_registered => {
                        return Err(SkipReason::AlreadyRegistered)
                    }
                    Pipeline::Disable if !current.is_registered => {
                        return Err(SkipReason::AlreadyUnregistered)
                    }
                    _ => {}
                }
                state.set_loading(true);
                state.set_info_message(None);
                state.set_error_message(None);
                Ok(())
            })
            .await;

        match outcome {
            Ok(()) => debug!(identity = %self.identity, pipeline = pipeline.label(), "pipeline started"),
            Err(reason) => debug!(
                identity = %self.identity,
                pipeline = pipeline.label(),
                ?reason,
                "pipeline skipped"
            ),
        }
        outcome
    }

    async fn load_statuses(&self) -> Result<(Session, RegistrationStatus, RegistrationStatus)> {
        let session = self.acquire_session().await?;
        let (primary, secondary) = tokio::join!(
            self.primary.query_status(&self.identity, &session),
            self.secondary.query_status(&self.identity, &session),
        );
        let (primary, secondary) = both(primary, secondary)?;
        Ok((session, primary, secondary))
    }

    async fn register_with_backends(&self) -> Result<(Session, bool)> {
        let device_token = self.credentials.request_permission_and_token().await?;
        let session = self.acquire_session().await?;
        let (primary, secondary) = tokio::join!(
            self.primary
                .register(&self.identity, &session, &device_token),
            self.secondary
                .register(&self.identity, &session, &device_token),
        );
        let (primary, secondary) = both(primary, secondary)?;
        if !(primary && secondary) {
            warn!(
                identity = %self.identity,
                primary_backend = self.primary.name(),
                secondary_backend = self.secondary.name(),
                primary_accepted = primary,
                secondary_accepted = secondary,
                "enable: backend declined registration"
            );
        }
        Ok((session, primary && secondary))
    }

    async fn acquire_session(&self) -> Result<Session> {
        let session = self.sessions.fetch_session().await?;
        tokio::time::sleep(self.config.session_settle_delay).await;
        Ok(session)
    }

    async fn reject(&self, pipeline: Pipeline, message: &str) -> PipelineOutcome {
        warn!(identity = %self.identity, pipeline = pipeline.label(), "{message}");
        self.write(|state| {
            state.set_error_message(Some(message.to_string()));
            state.set_loading(false);
        })
        .await;
        PipelineOutcome::Rejected
    }

    async fn fail(&self, pipeline: Pipeline, prefix: &str, err: anyhow::Error) -> PipelineOutcome {
        let cause = format!("{err:#}");
        warn!(identity = %self.identity, pipeline = pipeline.label(), %cause, "pipeline failed");
        self.write(|state| {
            state.set_error_message(Some(format!("{prefix}: {cause}")));
            state.set_loading(false);
        })
        .await;
        PipelineOutcome::Failed { cause }
    }

    async fn write<R>(&self, apply: impl FnOnce(&mut StateWriter<'_>) -> R) -> R {
        let mut guard = self.inner.lock().await;
        let mut writer = StateWriter::new(&mut guard, &self.events);
        apply(&mut writer)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

/// Joins the results of a backend pair. Both calls have already run to
/// completion; the primary's error is reported when both failed.
fn both<A, B>(primary: Result<A>, secondary: Result<B>) -> Result<(A, B)> {
    Ok((primary?, secondary?))
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
