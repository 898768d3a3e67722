use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::model::{ProbeInfo, ResourceDescriptor};
use crate::plugins::registry::{ByteStream, DriverContext, TransferDriver};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new() -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    fn build_headers(res: &ResourceDescriptor, ctx: &DriverContext) -> DownloadResult<HeaderMap> {
        let invalid = |e: &dyn std::fmt::Display| DownloadError::InvalidHeader(e.to_string());

        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent).map_err(|e| invalid(&e))?);
        for (k, v) in &res.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| invalid(&e))?;
            let value = HeaderValue::from_str(v).map_err(|e| invalid(&e))?;
            h.insert(name, value);
        }
        Ok(h)
    }

    fn accept_ranges_hint(headers: &HeaderMap) -> bool {
        headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false)
    }

    fn content_length(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Total size from `Content-Range: bytes 0-0/1234`.
    fn content_range_total(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.rsplit_once('/'))
            .and_then(|(_, total)| total.trim().parse::<u64>().ok())
    }

    /// First byte position from `Content-Range: bytes 100-199/1234`.
    fn content_range_start(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().strip_prefix("bytes"))
            .and_then(|s| s.trim_start().split_once('-'))
            .and_then(|(first, _)| first.trim().parse::<u64>().ok())
    }

    fn into_stream(resp: reqwest::Response) -> ByteStream {
        resp.bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed()
    }

    /// Some servers refuse HEAD. Asking for the first byte tells us both the
    /// size and whether ranges are honoured.
    async fn probe_with_first_byte(&self, res: &ResourceDescriptor, headers: HeaderMap, timeout: Duration) -> DownloadResult<ProbeInfo> {
        let resp = self.client
            .get(&res.uri)
            .headers(headers)
            .header(RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(ProbeInfo {
                total_size: Self::content_range_total(resp.headers()),
                supports_ranges: true,
            }),
            s if s.is_success() => Ok(ProbeInfo {
                total_size: Self::content_length(resp.headers()),
                supports_ranges: false,
            }),
            s => Err(DownloadError::Status(s)),
        }
    }
}

#[async_trait]
impl TransferDriver for HttpDriver {
    fn name(&self) -> &'static str { "http-driver" }

    fn supports(&self, res: &ResourceDescriptor) -> bool {
        url::Url::parse(&res.uri)
            .map(|u| u.scheme() == "http" || u.scheme() == "https")
            .unwrap_or(false)
    }

    async fn probe(&self, res: &ResourceDescriptor, ctx: &DriverContext) -> DownloadResult<ProbeInfo> {
        let headers = Self::build_headers(res, ctx)?;
        let timeout = Duration::from_secs(ctx.timeout_secs.max(1));

        let head = self.client
            .head(&res.uri)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await?;

        let status = head.status();
        if status.is_success() {
            return Ok(ProbeInfo {
                total_size: Self::content_length(head.headers()),
                supports_ranges: Self::accept_ranges_hint(head.headers()),
            });
        }
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            debug!(uri = %res.uri, %status, "HEAD refused, probing with a one-byte range");
            return self.probe_with_first_byte(res, headers, timeout).await;
        }
        Err(DownloadError::Status(status))
    }

    async fn open_range(&self, res: &ResourceDescriptor, ctx: &DriverContext, start: u64) -> DownloadResult<ByteStream> {
        let headers = Self::build_headers(res, ctx)?;
        let resp = self.client
            .get(&res.uri)
            .headers(headers)
            .header(RANGE, format!("bytes={}-", start))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => match Self::content_range_start(resp.headers()) {
                Some(got) if got != start => {
                    debug!(uri = %res.uri, start, got, "server answered a different range");
                    Err(DownloadError::RangeIgnored { start })
                }
                _ => Ok(Self::into_stream(resp)),
            },
            // the full body still lines up when we asked for offset 0
            StatusCode::OK if start == 0 => Ok(Self::into_stream(resp)),
            StatusCode::OK => Err(DownloadError::RangeIgnored { start }),
            s => Err(DownloadError::Status(s)),
        }
    }

    async fn open_full(&self, res: &ResourceDescriptor, ctx: &DriverContext) -> DownloadResult<ByteStream> {
        let headers = Self::build_headers(res, ctx)?;
        let resp = self.client
            .get(&res.uri)
            .headers(headers)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(Self::into_stream(resp))
        } else {
            Err(DownloadError::Status(resp.status()))
        }
    }
}
