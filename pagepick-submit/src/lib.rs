use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use pagepick_core::DocumentInfo;

/// Local processing endpoint the confirmed range is posted to.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8503/predict/";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned status {status}")]
    Status { status: StatusCode },
}

/// Everything the endpoint needs, captured once at confirmation time:
/// the document bytes, the file's base name and the 1-based inclusive
/// page range.
#[derive(Debug, Clone)]
pub struct Submission {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub start: usize,
    pub stop: usize,
}

impl Submission {
    pub fn from_document(info: &DocumentInfo, start: usize, stop: usize) -> Result<Self> {
        let bytes = std::fs::read(&info.path)
            .with_context(|| format!("failed to read {:?} for submission", info.path))?;
        let file_name = info
            .path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("document")
            .to_string();
        Ok(Self {
            file_name,
            bytes,
            start,
            stop,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Submitter {
    client: Client,
    endpoint: Url,
}

impl Submitter {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    /// Fire-and-forget dispatch: spawns the request and returns
    /// immediately. Transport failures and non-2xx responses are logged,
    /// never surfaced to the caller; there is no retry and no timeout.
    pub fn dispatch(&self, submission: Submission) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let (start, stop) = (submission.start, submission.stop);
        tokio::spawn(async move {
            match send(&client, endpoint.clone(), submission).await {
                Ok(body) => {
                    info!(%endpoint, start, stop, response = %body.trim(), "range submitted");
                }
                Err(err) => {
                    warn!(%endpoint, start, stop, error = %err, "submission failed");
                }
            }
        });
    }
}

/// The awaitable inner request; `Submitter::dispatch` wraps it. Posts a
/// multipart form with the document under `file` and the bounds as
/// string-encoded `start`/`stop` fields, and returns the response body.
pub async fn send(
    client: &Client,
    endpoint: Url,
    submission: Submission,
) -> Result<String, SubmitError> {
    let part = Part::bytes(submission.bytes)
        .file_name(submission.file_name)
        .mime_str("application/pdf")?;
    let form = Form::new()
        .part("file", part)
        .text("start", submission.start.to_string())
        .text("stop", submission.stop.to_string());

    let response = client.post(endpoint).multipart(form).send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(SubmitError::Status { status });
    }
    Ok(body)
}
