mod common;

use bytes::Bytes;
use common::{fast_config, random_payload, RecordingSink};
use orange_rangefetch::core::config::DownloadConfig;
use orange_rangefetch::core::downloader::Downloader;
use orange_rangefetch::core::engine::Engine;
use orange_rangefetch::core::error::DownloadError;
use orange_rangefetch::core::model::{JobStatus, LinkInput, ResourceDescriptor, TransferMode};
use orange_rangefetch::plugins::http::driver::HttpDriver;
use orange_rangefetch::plugins::registry::{DriverContext, PluginRegistry, TransferDriver};
use reqwest::StatusCode;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `data`, honouring `Range: bytes=a-` and `bytes=a-b`.
struct RangeResponder {
    data: Bytes,
}

impl RangeResponder {
    fn parse_range(req: &Request, len: usize) -> Option<(usize, usize)> {
        let raw = req.headers.get("range")?.to_str().ok()?;
        let ranges = raw.strip_prefix("bytes=")?;
        let (a, b) = ranges.split_once('-')?;
        let start: usize = a.parse().ok()?;
        let end = if b.is_empty() { len.saturating_sub(1) } else { b.parse::<usize>().ok()?.min(len - 1) };
        Some((start, end))
    }
}

impl Respond for RangeResponder {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let len = self.data.len();
        match Self::parse_range(req, len) {
            Some((start, end)) if start < len && start <= end => ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, len).as_str())
                .set_body_bytes(self.data.slice(start..=end).to_vec()),
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.data.to_vec()),
        }
    }
}

async fn serve_ranged(server: &MockServer, route: &str, data: Bytes) {
    // HEAD refused, so probing goes through the one-byte GET
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(RangeResponder { data })
        .mount(server)
        .await;
}

fn http_downloader(config: DownloadConfig) -> Downloader {
    Downloader::new(Arc::new(HttpDriver::new().unwrap()), DriverContext::default(), config)
}

#[tokio::test]
async fn ranged_download_over_http() {
    let server = MockServer::start().await;
    let data = random_payload(300_000);
    serve_ranged(&server, "/blob.bin", data.clone()).await;

    let sink = Arc::new(RecordingSink::default());
    let res = ResourceDescriptor::new(format!("{}/blob.bin", server.uri()));
    let outcome = http_downloader(fast_config(4))
        .download(&res, sink.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Ranged);
    assert_eq!(outcome.probe.total_size, Some(300_000));
    assert_eq!(sink.contents(), data.to_vec());
    sink.assert_no_overlap();
}

#[tokio::test]
async fn server_without_ranges_is_copied_sequentially() {
    let server = MockServer::start().await;
    let data = random_payload(20_000);
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.to_vec()))
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingSink::default());
    let res = ResourceDescriptor::new(format!("{}/plain.bin", server.uri()));
    let outcome = http_downloader(fast_config(4))
        .download(&res, sink.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.mode, TransferMode::Sequential);
    assert!(!outcome.probe.supports_ranges);
    assert_eq!(sink.contents(), data.to_vec());
}

#[tokio::test]
async fn partial_content_from_the_wrong_offset_is_rejected() {
    let server = MockServer::start().await;
    // always answers with the head of the file, whatever was asked
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-9/10")
                .set_body_bytes(b"0123456789".to_vec()),
        )
        .mount(&server)
        .await;

    let driver = HttpDriver::new().unwrap();
    let res = ResourceDescriptor::new(format!("{}/shifted.bin", server.uri()));

    match driver.open_range(&res, &DriverContext::default(), 5).await {
        Err(DownloadError::RangeIgnored { start: 5 }) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("mismatched range was accepted"),
    }
    assert!(driver.open_range(&res, &DriverContext::default(), 0).await.is_ok());
}

#[tokio::test]
async fn missing_resource_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let res = ResourceDescriptor::new(format!("{}/missing.bin", server.uri()));
    let err = http_downloader(fast_config(2))
        .download(&res, Arc::new(RecordingSink::default()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Status(StatusCode::NOT_FOUND)), "unexpected error: {err}");
    let received = server.received_requests().await.unwrap_or_default();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn engine_writes_target_and_removes_partial() {
    let server = MockServer::start().await;
    let data = random_payload(150_000);
    serve_ranged(&server, "/files/archive.tar", data.clone()).await;

    let out = TempDir::new().unwrap();
    let registry = PluginRegistry::with_defaults().unwrap();
    let engine = Engine::new(registry, out.path().to_path_buf(), fast_config(3), DriverContext::default())
        .await
        .unwrap();

    let job_id = engine
        .add_and_start(vec![LinkInput {
            raw: format!("{}/files/archive.tar", server.uri()),
            headers: Default::default(),
        }])
        .await
        .unwrap();

    assert_eq!(engine.wait_job(job_id).await, Some(JobStatus::Completed));

    let target = out.path().join("archive.tar");
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data.to_vec());
    assert!(!out.path().join("archive.tar.partial").exists());
}

#[tokio::test]
async fn engine_reports_failed_job() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let registry = PluginRegistry::with_defaults().unwrap();
    let engine = Engine::new(registry, out.path().to_path_buf(), fast_config(2), DriverContext::default())
        .await
        .unwrap();

    let job_id = engine
        .add_and_start(vec![
            LinkInput { raw: format!("{}/secret.bin", server.uri()), headers: Default::default() },
            LinkInput { raw: "gopher://nowhere".to_string(), headers: Default::default() },
        ])
        .await
        .unwrap();

    assert_eq!(engine.wait_job(job_id).await, Some(JobStatus::Failed));
    assert!(!out.path().join("secret.bin").exists());
    assert!(!out.path().join("secret.bin.partial").exists());
}
