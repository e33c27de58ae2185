use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::ChatApi;
use crate::{
    chat::{ChatMessage, MarkReadRequest, NewMessage, PatientSummary, SendMessageRequest},
    error::{ChatError, Result},
};

/// [`ChatApi`] over the backend's REST endpoints.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attach the portal token as a bearer credential on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        debug!(%status, url = %response.url(), "<- API response");

        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };

        Err(match status {
            StatusCode::BAD_REQUEST => ChatError::Validation(message),
            StatusCode::NOT_FOUND => ChatError::NotFound(message),
            StatusCode::UNAUTHORIZED => ChatError::Unauthorized(message),
            StatusCode::FORBIDDEN => ChatError::Forbidden(message),
            _ => ChatError::Transport(message),
        })
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn send(&self, message: &NewMessage) -> Result<ChatMessage> {
        let request = self
            .client
            .post(self.url("/messages/send"))
            .json(&SendMessageRequest::from_new(message));

        Ok(self.execute(request).await?.json().await?)
    }

    async fn history(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>> {
        let request = self.client.get(self.url(&format!("/messages/{a}/{b}")));
        Ok(self.execute(request).await?.json().await?)
    }

    async fn mark_read(&self, owner_id: &str, counterpart_id: &str) -> Result<()> {
        // The endpoint names its fields after the usual direction (patient
        // to doctor); it marks what `userId` sent to `doctorId`.
        let body = MarkReadRequest {
            user_id: counterpart_id.to_string(),
            doctor_id: owner_id.to_string(),
        };
        let request = self.client.post(self.url("/messages/mark-read")).json(&body);

        self.execute(request).await?;
        Ok(())
    }

    async fn patients_for_doctor(&self, doctor_id: &str) -> Result<Vec<PatientSummary>> {
        let request = self
            .client
            .get(self.url(&format!("/messages/doctor/{doctor_id}/patients")));

        Ok(self.execute(request).await?.json().await?)
    }
}
