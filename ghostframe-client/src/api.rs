//! Typed calls against the backend's REST surface.

use std::time::Duration;

use bytes::Bytes;
use ghostframe_core::{
    BackendEndpoint, DirectoryRecord, LoginRequest, MessageRecord, OutgoingMessage,
    SharedFileRecord,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode, multipart};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned HTTP {status}")]
    Status { path: String, status: StatusCode },
    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
}

impl ApiClient {
    pub fn new(endpoint: BackendEndpoint) -> Result<Self, ApiError> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: BackendEndpoint, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;
        let base = Url::parse(&endpoint.http_base())?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn users(&self) -> Result<DirectoryRecord, ApiError> {
        let url = self.url(&["users"])?;
        let path = url.path().to_owned();
        let response = execute(&path, self.http.get(url)).await?;
        decode(&path, &read_body(&path, response).await?)
    }

    pub async fn messages(&self, peer_id: &str) -> Result<Vec<MessageRecord>, ApiError> {
        let url = self.url(&["messages", peer_id])?;
        let path = url.path().to_owned();
        let response = execute(&path, self.http.get(url)).await?;
        decode(&path, &read_body(&path, response).await?)
    }

    /// `None` when the backend accepted the message without echoing it back.
    pub async fn post_message(
        &self,
        peer_id: &str,
        message: &OutgoingMessage,
    ) -> Result<Option<MessageRecord>, ApiError> {
        let url = self.url(&["messages", peer_id])?;
        let path = url.path().to_owned();
        let response = execute(&path, self.http.post(url).json(message)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = read_body(&path, response).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        decode(&path, &body).map(Some)
    }

    pub async fn login(&self, user_name: &str) -> Result<(), ApiError> {
        let url = self.url(&["users", "login", user_name])?;
        let path = url.path().to_owned();
        let body = LoginRequest {
            user_name: user_name.to_owned(),
        };
        execute(&path, self.http.post(url).json(&body)).await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        let url = self.url(&["users", "logout"])?;
        let path = url.path().to_owned();
        execute(&path, self.http.post(url)).await?;
        Ok(())
    }

    pub async fn share_file(
        &self,
        recipient_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<SharedFileRecord, ApiError> {
        let url = self.url(&["shareFile"])?;
        let path = url.path().to_owned();
        let part = multipart::Part::bytes(bytes).file_name(file_name.to_owned());
        let form = multipart::Form::new()
            .part("file", part)
            .text("recipientId", recipient_id.to_owned());
        let response = execute(&path, self.http.post(url).multipart(form)).await?;
        decode(&path, &read_body(&path, response).await?)
    }

    /// `None` when the backend no longer has the file.
    pub async fn request_file(&self, file_id: &str) -> Result<Option<Bytes>, ApiError> {
        let url = self.url(&["requestFile", file_id])?;
        let path = url.path().to_owned();
        let response = match execute(&path, self.http.get(url)).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        read_body(&path, response).await.map(Some)
    }
}

async fn execute(path: &str, request: RequestBuilder) -> Result<Response, ApiError> {
    let response = request.send().await.map_err(|source| ApiError::Transport {
        path: path.to_owned(),
        source,
    })?;
    let status = response.status();
    debug!(path, status = status.as_u16(), "backend responded");
    if !status.is_success() {
        return Err(ApiError::Status {
            path: path.to_owned(),
            status,
        });
    }
    Ok(response)
}

async fn read_body(path: &str, response: Response) -> Result<Bytes, ApiError> {
    response.bytes().await.map_err(|source| ApiError::Transport {
        path: path.to_owned(),
        source,
    })
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|source| ApiError::Decode {
        path: path.to_owned(),
        source,
    })
}
