//! HTTP(S) backend.
//!
//! Uses a plain GET/PUT/HEAD surface: any web server (or object store
//! frontend) that accepts PUT can host the artifact.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use url::Url;

use super::{Transport, TransportError};

pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(uri: &Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("git-remote-bundle/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpTransport {
            client,
            url: uri.clone(),
        })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Other(err.into())
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn exists(&self) -> Result<bool, TransportError> {
        let response = self.client.head(self.url.clone()).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }

    #[instrument(skip(self, dest), fields(url = %self.url))]
    async fn download(&self, dest: &mut tokio::fs::File) -> Result<(), TransportError> {
        let mut response = self.client.get(self.url.clone()).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound);
        }
        response = response.error_for_status()?;

        super::truncate(dest).await?;
        let mut bytes: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        dest.flush().await?;

        debug!(bytes, "artifact downloaded");
        Ok(())
    }

    #[instrument(skip(self, src), fields(url = %self.url))]
    async fn upload(&self, src: &Path) -> Result<(), TransportError> {
        let file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("failed to open {}", src.display()))
            .map_err(TransportError::Other)?;
        let len = file.metadata().await?.len();

        let stream = tokio_util::io::ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);

        let response = self
            .client
            .put(self.url.clone())
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        response.error_for_status()?;

        debug!(bytes = len, "artifact uploaded");
        Ok(())
    }
}
