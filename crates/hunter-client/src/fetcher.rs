use std::time::Duration;

use async_trait::async_trait;
use hunter_core::{decode_records, DecodeError, Record};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    /// No HTTP exchange happened: connect failure, TLS failure or timeout.
    #[error("could not connect to coordinator ({0})")]
    Transport(String),
    #[error("coordinator replied with HTTP status {0}")]
    Status(u16),
    #[error("received empty reply from coordinator")]
    EmptyReply,
    #[error("could not decode coordinator reply: {0}")]
    Decode(DecodeError),
}

impl FetchError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

impl From<DecodeError> for FetchError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Empty => FetchError::EmptyReply,
            other => FetchError::Decode(other),
        }
    }
}

/// Source of hunting-task lists.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Record>, FetchError>;
}

/// Fetches and decodes a reply body from `url`.
pub(crate) async fn fetch_records(client: &Client, url: &str) -> Result<Vec<Record>, FetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    debug!("{url}: {} byte reply", body.len());
    Ok(decode_records(&body)?)
}

/// Pulls the current task list from the coordinator over HTTPS.
#[derive(Clone, Debug)]
pub struct HttpTaskSource {
    client: Client,
    url: String,
}

impl HttpTaskSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        fetch_records(&self.client, &self.url).await
    }
}
