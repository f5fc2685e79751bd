//! Remote provider reached over HTTP.
//!
//! The remote side exposes three endpoints:
//! - `POST {endpoint}/resources` with `{kind, inputs}`, answering `{id, outputs}`
//! - `PUT {endpoint}/resources/{id}` with `{kind, old_inputs, new_inputs}`,
//!   answering `{outputs}`, or 409 with `{requires_replacement: true}`
//! - `DELETE {endpoint}/resources/{id}?kind=...`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, ProviderErrorKind};
use crate::graph::Properties;

use super::plugin::{Created, Provider, UpdateOutcome};

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Provider forwarding calls to a remote endpoint.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL of the remote provider.
    endpoint: Url,
    /// Optional bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    kind: &'a str,
    inputs: &'a Properties,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    kind: &'a str,
    old_inputs: &'a Properties,
    new_inputs: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Properties,
}

#[derive(Debug, Default, Deserialize)]
struct ConflictResponse {
    #[serde(default)]
    requires_replacement: bool,
    #[serde(default)]
    message: Option<String>,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(endpoint: &str) -> Result<Self, ProviderError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ProviderError::rejected(format!("Invalid provider endpoint '{endpoint}': {e}")))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unknown, format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token: None,
        })
    }

    /// Sets the bearer token sent with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Builds `{endpoint}/resources[/{id}]`, percent-encoding the id.
    fn resource_url(&self, id: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ProviderError::rejected(format!("Provider endpoint '{}' cannot be a base URL", self.endpoint))
            })?;
            segments.pop_if_empty().push("resources");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, ProviderError> {
        self.authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_transport_error)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, kind: &str, inputs: &Properties) -> Result<Created, ProviderError> {
        let url = self.resource_url(None)?;
        trace!("POST {url} ({kind})");

        let response = self
            .send(self.client.post(url).json(&CreateRequest { kind, inputs }))
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .json::<Created>()
            .await
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unknown, format!("Invalid create response: {e}")))
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> Result<UpdateOutcome, ProviderError> {
        let url = self.resource_url(Some(id))?;
        trace!("PUT {url} ({kind})");

        let response = self
            .send(self.client.put(url).json(&UpdateRequest {
                kind,
                old_inputs,
                new_inputs,
            }))
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            let conflict: ConflictResponse = serde_json::from_str(&body).unwrap_or_default();
            if conflict.requires_replacement {
                debug!("Provider requested replacement of {id}");
                return Ok(UpdateOutcome::RequiresReplacement);
            }
            return Err(ProviderError::rejected(conflict.message.unwrap_or(body)));
        }
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        let updated: UpdateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unknown, format!("Invalid update response: {e}")))?;
        Ok(UpdateOutcome::Updated(updated.outputs))
    }

    async fn delete(&self, kind: &str, id: &str, _outputs: &Properties) -> Result<(), ProviderError> {
        let mut url = self.resource_url(Some(id))?;
        url.query_pairs_mut().append_pair("kind", kind);
        trace!("DELETE {url}");

        let response = self.send(self.client.delete(url)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::transient(format!("Connection failed: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::Unknown, format!("Request failed: {e}"))
    }
}

/// Maps a non-success status to an error kind.
fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        404 => ProviderErrorKind::NotFound,
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::Transient,
        s if (500..600).contains(&s) => ProviderErrorKind::Transient,
        s if (400..500).contains(&s) => ProviderErrorKind::Rejected,
        _ => ProviderErrorKind::Unknown,
    }
}

async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    ProviderError::new(classify_status(status), message)
}
