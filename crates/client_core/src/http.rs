//! HTTP adapters for the registry server's session and registration routes.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{DeviceIdentity, DeviceToken, RegistrationStatus, Session},
    error::{ApiError, ApiException},
    protocol::{
        CreateSessionRequest, CreateSessionResponse, RegisterRequest, RegistrationAck,
        StatusResponse,
    },
};
use tracing::debug;
use url::Url;

use crate::{RegistrationBackend, SessionSource};

pub struct HttpSessionSource {
    http: Client,
    server_url: Url,
    device_name: String,
}

impl HttpSessionSource {
    pub fn new(server_url: &str, device_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            server_url: parse_server_url(server_url)?,
            device_name: device_name.into(),
        })
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_session(&self) -> Result<Session> {
        let url = endpoint(&self.server_url, &["sessions"])?;
        let response = self
            .http
            .post(url)
            .json(&CreateSessionRequest {
                device_name: self.device_name.clone(),
            })
            .send()
            .await
            .context("failed to request session")?;
        let body: CreateSessionResponse = decode(response).await?;
        debug!(device_name = %self.device_name, issued_at = %body.issued_at, "session issued");
        Ok(body.session)
    }
}

/// Registration backend for one named registry on the registry server.
pub struct HttpRegistrationBackend {
    http: Client,
    server_url: Url,
    registry: String,
}

impl HttpRegistrationBackend {
    pub fn new(server_url: &str, registry: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            server_url: parse_server_url(server_url)?,
            registry: registry.into(),
        })
    }

    fn device_url(&self, identity: &DeviceIdentity) -> Result<Url> {
        endpoint(
            &self.server_url,
            &["registries", &self.registry, "devices", identity.as_str()],
        )
    }
}

#[async_trait]
impl RegistrationBackend for HttpRegistrationBackend {
    fn name(&self) -> &str {
        &self.registry
    }

    async fn query_status(
        &self,
        identity: &DeviceIdentity,
        session: &Session,
    ) -> Result<RegistrationStatus> {
        let response = self
            .http
            .get(self.device_url(identity)?)
            .query(&[("session", session.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to query {} status", self.registry))?;
        let body: StatusResponse = decode(response).await?;
        Ok(body.status)
    }

    async fn register(
        &self,
        identity: &DeviceIdentity,
        session: &Session,
        device_token: &DeviceToken,
    ) -> Result<bool> {
        let response = self
            .http
            .put(self.device_url(identity)?)
            .json(&RegisterRequest {
                session: session.clone(),
                device_token: device_token.clone(),
            })
            .send()
            .await
            .with_context(|| format!("failed to register with {}", self.registry))?;
        let ack: RegistrationAck = decode(response).await?;
        Ok(ack.accepted)
    }

    async fn deregister(&self, identity: &DeviceIdentity) -> Result<bool> {
        let response = self
            .http
            .delete(self.device_url(identity)?)
            .send()
            .await
            .with_context(|| format!("failed to deregister from {}", self.registry))?;
        let ack: RegistrationAck = decode(response).await?;
        Ok(ack.accepted)
    }
}

fn parse_server_url(server_url: &str) -> Result<Url> {
    if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        return Err(anyhow!("server_url must start with http:// or https://"));
    }
    Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("server_url cannot carry a path: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Decodes a success body, or turns the server's `ApiError` payload into the
/// returned error so its message ends up in the user-facing cause.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .context("malformed registry response");
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("registry responded with {status}")),
    }
}
