use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{header, Client};

use crate::error::ChatError;

/// Response headers of a metadata-only request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
}

impl ProbeResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, crate::Result<Bytes>>,
}

impl FetchResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The remote artifact host: HEAD for validation, streaming GET for download.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn probe(&self, url: &str) -> crate::Result<ProbeResponse>;
    async fn fetch(&self, url: &str) -> crate::Result<FetchResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> crate::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ondevice-chat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ChatError::transfer(format!("create http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn probe(&self, url: &str) -> crate::Result<ProbeResponse> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|err| ChatError::Validation(format!("could not reach {url}: {err}")))?;

        let headers = response.headers();
        // Hub-hosted LFS files report the real size in x-linked-size.
        let content_length = header_u64(headers, "x-linked-size")
            .or_else(|| header_u64(headers, header::CONTENT_LENGTH.as_str()));
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);

        Ok(ProbeResponse {
            status: response.status().as_u16(),
            content_length,
            last_modified,
        })
    }

    async fn fetch(&self, url: &str) -> crate::Result<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ChatError::transfer(format!("request {url}: {err}")))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|err| ChatError::transfer(format!("read download chunk: {err}")))
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            body,
        })
    }
}

fn header_u64(headers: &header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .filter(|value| *value > 0)
}
