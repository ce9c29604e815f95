//! HTTP client for the signal service

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use huddle_core::{HuddleError, NetworkConfig, ParticipantId, RoomName};
use huddle_signal::messages::{
    HealthResponse, ListResponse, PollResponse, PresenceRequest, RelayedSignal, SendRequest,
    SendResponse, SuccessResponse,
};

/// Request/response access to the signal service
#[derive(Clone, Debug)]
pub struct SignalClient {
    http: reqwest::Client,
    base: Url,
}

impl SignalClient {
    pub fn new(server_url: &str, network: &NetworkConfig) -> Result<Self, HuddleError> {
        let mut base = Url::parse(server_url)
            .map_err(|e| HuddleError::Transport(format!("invalid server url {}: {}", server_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .user_agent(format!("huddle/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(network.connect_timeout())
            .timeout(network.request_timeout())
            .build()
            .map_err(transport)?;

        Ok(Self { http, base })
    }

    /// Service base URL, always ending in `/`
    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn announce(&self, id: &ParticipantId, room: &RoomName) -> Result<(), HuddleError> {
        let body = presence(id, room);
        let response = self.http.post(self.endpoint("presence/announce")?).json(&body).send().await;
        let _: SuccessResponse = decode(response.map_err(transport)?).await?;
        Ok(())
    }

    pub async fn leave(&self, id: &ParticipantId, room: &RoomName) -> Result<(), HuddleError> {
        let body = presence(id, room);
        let response = self.http.post(self.endpoint("presence/leave")?).json(&body).send().await;
        let _: SuccessResponse = decode(response.map_err(transport)?).await?;
        Ok(())
    }

    /// Insert-only claim; a held identity is [`HuddleError::IdentityConflict`]
    pub async fn claim(&self, id: &ParticipantId, room: &RoomName) -> Result<(), HuddleError> {
        let body = presence(id, room);
        let response = self
            .http
            .post(self.endpoint("identity/claim")?)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::CONFLICT {
            return Err(HuddleError::IdentityConflict(id.clone()));
        }
        let _: SuccessResponse = decode(response).await?;
        Ok(())
    }

    pub async fn list(&self, room: &RoomName) -> Result<Vec<ParticipantId>, HuddleError> {
        let response = self
            .http
            .get(self.endpoint("presence/list")?)
            .query(&[("room", room.as_str())])
            .send()
            .await
            .map_err(transport)?;
        let list: ListResponse = decode(response).await?;
        Ok(list.participants)
    }

    /// Returns whether the service found a live link for `to`
    pub async fn send(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        signal: serde_json::Value,
    ) -> Result<bool, HuddleError> {
        let body = SendRequest {
            from: from.clone(),
            to: to.clone(),
            signal,
        };
        let response = self.http.post(self.endpoint("signal/send")?).json(&body).send().await;
        let sent: SendResponse = decode(response.map_err(transport)?).await?;
        Ok(sent.delivered)
    }

    pub async fn poll(&self, id: &ParticipantId) -> Result<Vec<RelayedSignal>, HuddleError> {
        let response = self
            .http
            .get(self.endpoint("signal/poll")?)
            .query(&[("participantId", id.as_str())])
            .send()
            .await
            .map_err(transport)?;
        let polled: PollResponse = decode(response).await?;
        Ok(polled.messages)
    }

    pub async fn health(&self) -> Result<HealthResponse, HuddleError> {
        let response = self.http.get(self.endpoint("health")?).send().await;
        decode(response.map_err(transport)?).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, HuddleError> {
        self.base
            .join(path)
            .map_err(|e| HuddleError::Transport(format!("bad endpoint {}: {}", path, e)))
    }
}

fn presence(id: &ParticipantId, room: &RoomName) -> PresenceRequest {
    PresenceRequest {
        participant_id: id.clone(),
        room: Some(room.to_string()),
    }
}

fn transport(e: reqwest::Error) -> HuddleError {
    HuddleError::Transport(e.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HuddleError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        debug!("Signal service returned {}: {}", status, body);
        return Err(HuddleError::Transport(format!("service returned {}: {}", status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| HuddleError::Protocol(e.to_string()))
}
