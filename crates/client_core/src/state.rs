//! Observable registration state and the change events published for it.

use shared::domain::Session;
use tokio::sync::broadcast;

/// The fields a UI layer renders. Read it through
/// [`RegistrationOrchestrator::snapshot`](crate::RegistrationOrchestrator::snapshot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationState {
    pub is_registered: bool,
    pub is_loading: bool,
    pub info_message: Option<String>,
    pub error_message: Option<String>,
}

/// One field of [`RegistrationState`] changed. Only sent when the new value
/// differs from the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationChange {
    LoadingChanged(bool),
    RegisteredChanged(bool),
    InfoMessageChanged(Option<String>),
    ErrorMessageChanged(Option<String>),
}

#[derive(Debug, Default)]
pub(crate) struct OrchestratorState {
    pub(crate) published: RegistrationState,
    pub(crate) cached_session: Option<Session>,
}

/// Mutation handle over the locked state. Every setter publishes the
/// matching change event, so events leave in the same order as the writes.
pub(crate) struct StateWriter<'a> {
    state: &'a mut OrchestratorState,
    events: &'a broadcast::Sender<RegistrationChange>,
}

impl<'a> StateWriter<'a> {
    pub(crate) fn new(
        state: &'a mut OrchestratorState,
        events: &'a broadcast::Sender<RegistrationChange>,
    ) -> Self {
        Self { state, events }
    }

    pub(crate) fn published(&self) -> &RegistrationState {
        &self.state.published
    }

    pub(crate) fn set_loading(&mut self, loading: bool) {
        if self.state.published.is_loading != loading {
            self.state.published.is_loading = loading;
            self.emit(RegistrationChange::LoadingChanged(loading));
        }
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        if self.state.published.is_registered != registered {
            self.state.published.is_registered = registered;
            self.emit(RegistrationChange::RegisteredChanged(registered));
        }
    }

    pub(crate) fn set_info_message(&mut self, message: Option<String>) {
        if self.state.published.info_message != message {
            self.state.published.info_message = message.clone();
            self.emit(RegistrationChange::InfoMessageChanged(message));
        }
    }

    pub(crate) fn set_error_message(&mut self, message: Option<String>) {
        if self.state.published.error_message != message {
            self.state.published.error_message = message.clone();
            self.emit(RegistrationChange::ErrorMessageChanged(message));
        }
    }

    pub(crate) fn cache_session(&mut self, session: Session) {
        self.state.cached_session = Some(session);
    }

    fn emit(&self, change: RegistrationChange) {
        // No subscribers is fine; the snapshot still holds the value.
        let _ = self.events.send(change);
    }
}
