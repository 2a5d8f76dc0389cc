//! In-memory session issuance and per-registry device registrations.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::domain::{DeviceIdentity, DeviceToken, RegistrationStatus, Session};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Sessions kept before the oldest ones are forgotten.
pub const DEFAULT_SESSION_LIMIT: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown registry '{0}'")]
    UnknownRegistry(String),
    #[error("unknown session")]
    UnknownSession,
    #[error("device_name must not be empty")]
    EmptyDeviceName,
}

#[derive(Debug, Clone)]
struct IssuedSession {
    device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub device_name: String,
    pub device_token: DeviceToken,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<Session, IssuedSession>,
    session_order: VecDeque<Session>,
    registries: HashMap<String, HashMap<DeviceIdentity, RegistrationRecord>>,
}

impl RegistryState {
    fn registry(
        &self,
        registry: &str,
    ) -> Result<&HashMap<DeviceIdentity, RegistrationRecord>, RegistryError> {
        self.registries
            .get(registry)
            .ok_or_else(|| RegistryError::UnknownRegistry(registry.to_string()))
    }

    fn registry_mut(
        &mut self,
        registry: &str,
    ) -> Result<&mut HashMap<DeviceIdentity, RegistrationRecord>, RegistryError> {
        self.registries
            .get_mut(registry)
            .ok_or_else(|| RegistryError::UnknownRegistry(registry.to_string()))
    }

    fn device_for(&self, session: &Session) -> Result<&str, RegistryError> {
        self.sessions
            .get(session)
            .map(|issued| issued.device_name.as_str())
            .ok_or(RegistryError::UnknownSession)
    }
}

/// Sessions are held in memory up to `session_limit`; issuing one more
/// forgets the oldest, which then reads as an unknown session.
#[derive(Clone)]
pub struct RegistryStore {
    inner: Arc<RwLock<RegistryState>>,
    session_limit: usize,
}

impl RegistryStore {
    pub fn new(registries: &[String]) -> Self {
        Self::with_session_limit(registries, DEFAULT_SESSION_LIMIT)
    }

    pub fn with_session_limit(registries: &[String], session_limit: usize) -> Self {
        let mut state = RegistryState::default();
        for name in registries {
            state.registries.entry(name.clone()).or_default();
        }
        Self {
            inner: Arc::new(RwLock::new(state)),
            session_limit: session_limit.max(1),
        }
    }

    pub async fn issue_session(&self, device_name: &str) -> Result<Session, RegistryError> {
        let device_name = device_name.trim();
        if device_name.is_empty() {
            return Err(RegistryError::EmptyDeviceName);
        }
        let session = Session::new(Uuid::new_v4().to_string());
        let mut guard = self.inner.write().await;
        while guard.session_order.len() >= self.session_limit {
            let Some(oldest) = guard.session_order.pop_front() else {
                break;
            };
            guard.sessions.remove(&oldest);
        }
        guard.session_order.push_back(session.clone());
        guard.sessions.insert(
            session.clone(),
            IssuedSession {
                device_name: device_name.to_string(),
            },
        );
        Ok(session)
    }

    /// Status is relative to the device that owns `session`: a registration
    /// made by any other device reads as `RegisteredElsewhere`.
    pub async fn status(
        &self,
        registry: &str,
        identity: &DeviceIdentity,
        session: &Session,
    ) -> Result<(RegistrationStatus, Option<DateTime<Utc>>), RegistryError> {
        let guard = self.inner.read().await;
        let records = guard.registry(registry)?;
        let device = guard.device_for(session)?;
        Ok(match records.get(identity) {
            None => (RegistrationStatus::Unregistered, None),
            Some(record) if record.device_name == device => {
                (RegistrationStatus::Registered, Some(record.registered_at))
            }
            Some(record) => (RegistrationStatus::RegisteredElsewhere, Some(record.registered_at)),
        })
    }

    /// Records (or takes over) the registration for `identity`. A blank
    /// device token is declined rather than rejected.
    pub async fn register(
        &self,
        registry: &str,
        identity: &DeviceIdentity,
        session: &Session,
        device_token: &DeviceToken,
    ) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write().await;
        guard.registry(registry)?;
        let device_name = guard.device_for(session)?.to_string();
        if device_token.as_str().trim().is_empty() {
            return Ok(false);
        }
        guard.registry_mut(registry)?.insert(
            identity.clone(),
            RegistrationRecord {
                device_name,
                device_token: device_token.clone(),
                registered_at: Utc::now(),
            },
        );
        Ok(true)
    }

    pub async fn deregister(
        &self,
        registry: &str,
        identity: &DeviceIdentity,
    ) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write().await;
        Ok(guard.registry_mut(registry)?.remove(identity).is_some())
    }

    #[cfg(test)]
    pub async fn registration(
        &self,
        registry: &str,
        identity: &DeviceIdentity,
    ) -> Option<RegistrationRecord> {
        let guard = self.inner.read().await;
        guard.registries.get(registry)?.get(identity).cloned()
    }
}
