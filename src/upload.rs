//! Attachment upload sub-protocol.
//!
//! validate -> materialize bytes -> transfer to provider storage -> poll status
//! until the provider reports the file usable.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::UploadConfig;
use crate::error::RelayError;
use crate::lease::Lease;
use crate::models::provider::Attachment;
use crate::provider::ProviderApi;

/// Metadata returned by a probe of a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProbe {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Fetches caller-referenced files from wherever they live.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn probe(&self, url: &str) -> Result<SourceProbe, RelayError>;

    /// Download the whole body, failing once more than `limit` bytes arrive.
    async fn download(&self, url: &str, limit: u64) -> Result<Bytes, RelayError>;
}

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for HttpSource {
    async fn probe(&self, url: &str) -> Result<SourceProbe, RelayError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| RelayError::FileUrlInvalid(format!("{url}: {e}")))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(SourceProbe {
            status: response.status().as_u16(),
            content_length,
            content_type,
        })
    }

    async fn download(&self, url: &str, limit: u64) -> Result<Bytes, RelayError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::FileUrlInvalid(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        let mut body = BytesMut::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            if body.len() as u64 > limit {
                return Err(RelayError::FileExceedsSize {
                    size: body.len() as u64,
                    limit,
                });
            }
        }
        Ok(body.freeze())
    }
}

/// Decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePayload {
    pub mime_type: String,
    pub data: Bytes,
}

pub fn is_inline(url: &str) -> bool {
    url.trim_start().starts_with("data:")
}

pub fn parse_inline(url: &str) -> Result<InlinePayload, RelayError> {
    let rest = url
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| RelayError::FileUrlInvalid("not an inline payload".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| RelayError::FileUrlInvalid("inline payload has no data".to_string()))?;

    let mut params = header.split(';');
    let mime_type = params
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(RelayError::FileUrlInvalid(
            "only base64 inline payloads are supported".to_string(),
        ));
    }

    let data = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| RelayError::FileUrlInvalid(format!("invalid base64 payload: {e}")))?;
    Ok(InlinePayload {
        mime_type,
        data: Bytes::from(data),
    })
}

/// Last non-empty path segment of a URL, if it has one.
fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub struct AttachmentUploader {
    provider: Arc<dyn ProviderApi>,
    source: Arc<dyn SourceFetcher>,
    config: UploadConfig,
}

impl AttachmentUploader {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        source: Arc<dyn SourceFetcher>,
        config: UploadConfig,
    ) -> Self {
        Self {
            provider,
            source,
            config,
        }
    }

    /// Upload the file referenced by `source_url` and wait until it is usable.
    pub async fn upload(&self, source_url: &str, lease: &Lease) -> Result<Attachment, RelayError> {
        let (name, mime_type, data) = if is_inline(source_url) {
            self.materialize_inline(source_url)?
        } else {
            self.materialize_remote(source_url).await?
        };

        let size = data.len() as u64;
        info!(
            "Uploading attachment {} ({}, {} bytes)",
            name, mime_type, size
        );
        let receipt = self
            .provider
            .transfer_file(lease, &name, &mime_type, data)
            .await?;
        self.wait_until_ready(lease, &receipt.id).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        Ok(Attachment {
            id: receipt.id,
            mime_type,
            name,
            width: receipt.width,
            height: receipt.height,
            size: receipt.size.unwrap_or(size),
        })
    }

    fn materialize_inline(&self, url: &str) -> Result<(String, String, Bytes), RelayError> {
        let inline = parse_inline(url)?;
        let size = inline.data.len() as u64;
        if size > self.config.max_size {
            return Err(RelayError::FileExceedsSize {
                size,
                limit: self.config.max_size,
            });
        }
        let ext = mime_guess::get_mime_extensions_str(&inline.mime_type)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");
        let name = format!("{}.{}", uuid::Uuid::new_v4().simple(), ext);
        Ok((name, inline.mime_type, inline.data))
    }

    async fn materialize_remote(&self, url: &str) -> Result<(String, String, Bytes), RelayError> {
        let probe = self.source.probe(url).await?;
        if !(200..300).contains(&probe.status) {
            return Err(RelayError::FileUrlInvalid(format!(
                "{url} returned status {}",
                probe.status
            )));
        }
        if let Some(declared) = probe.content_length {
            if declared > self.config.max_size {
                return Err(RelayError::FileExceedsSize {
                    size: declared,
                    limit: self.config.max_size,
                });
            }
        }

        let data = self.source.download(url, self.config.max_size).await?;
        let name = file_name_from_url(url)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let mime_type = probe
            .content_type
            .as_deref()
            .map(essence)
            .filter(|m| !m.is_empty() && m != "application/octet-stream")
            .unwrap_or_else(|| {
                mime_guess::from_path(&name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        Ok((name, mime_type, data))
    }

    /// Poll until the provider reports the file usable. The whole wait,
    /// including a stalled status call, is bounded by `poll_timeout`.
    async fn wait_until_ready(&self, lease: &Lease, file_id: &str) -> Result<(), RelayError> {
        let started = Instant::now();
        let deadline = started + self.config.poll_timeout;
        let timed_out = |_: tokio::time::error::Elapsed| RelayError::FileUploadTimeout(self.config.poll_timeout);
        loop {
            let status =
                tokio::time::timeout_at(deadline, self.provider.file_status(lease, file_id))
                    .await
                    .map_err(timed_out)??;
            if self.config.failure_statuses.contains(&status.status) {
                return Err(RelayError::FileUploadFailed(format!(
                    "provider reported status {} for file {}",
                    status.status, file_id
                )));
            }
            if status.done {
                debug!("Attachment {} ready after {:?}", file_id, started.elapsed());
                return Ok(());
            }
            tokio::time::timeout_at(deadline, tokio::time::sleep(self.config.poll_interval))
                .await
                .map_err(timed_out)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseGrant, DEFAULT_LEASE_TTL};
    use crate::provider::testing::StubProvider;
    use crate::provider::FileStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubSource {
        probe: SourceProbe,
        body: Bytes,
        probes: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl StubSource {
        fn new(probe: SourceProbe, body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                probe,
                body: Bytes::from_static(body),
                probes: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceFetcher for StubSource {
        async fn probe(&self, _url: &str) -> Result<SourceProbe, RelayError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.probe.clone())
        }

        async fn download(&self, _url: &str, _limit: u64) -> Result<Bytes, RelayError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn ok_probe(len: u64, content_type: Option<&str>) -> SourceProbe {
        SourceProbe {
            status: 200,
            content_length: Some(len),
            content_type: content_type.map(str::to_string),
        }
    }

    fn lease() -> Lease {
        Lease::new(
            LeaseGrant {
                access_token: "a".into(),
                refresh_token: "r".into(),
                device_id: Some("d".into()),
            },
            DEFAULT_LEASE_TTL,
        )
    }

    fn uploader(provider: &Arc<StubProvider>, source: &Arc<StubSource>) -> AttachmentUploader {
        AttachmentUploader::new(provider.clone(), source.clone(), UploadConfig::default())
    }

    #[test]
    fn parses_base64_data_urls() {
        let inline = parse_inline("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(&inline.data[..], b"hello");

        assert!(matches!(
            parse_inline("data:text/plain,hello"),
            Err(RelayError::FileUrlInvalid(_))
        ));
        assert!(matches!(
            parse_inline("data:image/png;base64,@@@"),
            Err(RelayError::FileUrlInvalid(_))
        ));
    }

    #[test]
    fn file_name_comes_from_last_path_segment() {
        assert_eq!(
            file_name_from_url("https://cdn.example/a/b/report.pdf?sig=1"),
            Some("report.pdf".to_string())
        );
        assert_eq!(file_name_from_url("https://cdn.example/"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_file_is_probed_downloaded_and_transferred() {
        let provider = Arc::new(StubProvider::new());
        provider.push_status(FileStatus {
            status: 1,
            done: false,
        });
        provider.push_status(FileStatus {
            status: 2,
            done: true,
        });
        let source = StubSource::new(ok_probe(5, Some("application/pdf; charset=binary")), b"%PDF-");

        let attachment = uploader(&provider, &source)
            .upload("https://cdn.example/docs/report.pdf", &lease())
            .await
            .unwrap();

        assert_eq!(attachment.id, "file-1");
        assert_eq!(attachment.name, "report.pdf");
        assert_eq!(attachment.mime_type, "application/pdf");
        assert_eq!(attachment.size, 5);
        assert_eq!((attachment.width, attachment.height), (64, 32));
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 2);

        let transfers = provider.transfers.lock().unwrap();
        assert_eq!(transfers[0].1, "application/pdf");
        assert_eq!(&transfers[0].2[..], b"%PDF-");
    }

    #[tokio::test(start_paused = true)]
    async fn mime_type_falls_back_to_file_extension() {
        let provider = Arc::new(StubProvider::new());
        let source = StubSource::new(ok_probe(3, Some("application/octet-stream")), b"png");

        let attachment = uploader(&provider, &source)
            .upload("https://cdn.example/cat.png", &lease())
            .await
            .unwrap();
        assert_eq!(attachment.mime_type, "image/png");
    }

    #[tokio::test(start_paused = true)]
    async fn inline_payload_skips_remote_validation() {
        let provider = Arc::new(StubProvider::new());
        let source = StubSource::new(ok_probe(0, None), b"");

        let attachment = uploader(&provider, &source)
            .upload("data:image/png;base64,aGVsbG8=", &lease())
            .await
            .unwrap();

        assert_eq!(source.probes.load(Ordering::SeqCst), 0);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(attachment.mime_type, "image/png");
        assert!(attachment.name.ends_with(".png"), "{}", attachment.name);
        assert_eq!(&provider.transfers.lock().unwrap()[0].2[..], b"hello");
    }

    #[tokio::test]
    async fn oversized_remote_file_fails_before_transfer() {
        let provider = Arc::new(StubProvider::new());
        let source = StubSource::new(ok_probe(100 * 1024 * 1024 + 1, Some("video/mp4")), b"");

        let err = uploader(&provider, &source)
            .upload("https://cdn.example/huge.mp4", &lease())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RelayError::FileExceedsSize {
                size: 100 * 1024 * 1024 + 1,
                limit: 100 * 1024 * 1024
            }
        );
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
        assert!(provider.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_remote_file_is_invalid() {
        let provider = Arc::new(StubProvider::new());
        let source = StubSource::new(
            SourceProbe {
                status: 404,
                content_length: None,
                content_type: None,
            },
            b"",
        );

        let err = uploader(&provider, &source)
            .upload("https://cdn.example/missing.png", &lease())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FileUrlInvalid(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_fails_the_upload() {
        let provider = Arc::new(StubProvider::new());
        provider.push_status(FileStatus {
            status: 1,
            done: false,
        });
        provider.push_status(FileStatus {
            status: 22,
            done: false,
        });
        let source = StubSource::new(ok_probe(1, Some("text/plain")), b"x");

        let err = uploader(&provider, &source)
            .upload("https://cdn.example/a.txt", &lease())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FileUploadFailed(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn polling_that_never_finishes_times_out() {
        let provider = Arc::new(StubProvider::new());
        provider.push_status(FileStatus {
            status: 1,
            done: false,
        });
        let source = StubSource::new(ok_probe(1, Some("text/plain")), b"x");

        let started = Instant::now();
        let err = uploader(&provider, &source)
            .upload("https://cdn.example/a.txt", &lease())
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::FileUploadTimeout(Duration::from_secs(60)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(provider.status_calls.load(Ordering::SeqCst) > 60);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_status_call_still_times_out() {
        let provider = Arc::new(StubProvider::new());
        provider.stall_status_calls();
        let source = StubSource::new(ok_probe(0, None), b"");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            uploader(&provider, &source).upload("data:image/png;base64,aGVsbG8=", &lease()),
        )
        .await
        .expect("upload gives up on its own");

        assert_eq!(
            outcome.unwrap_err(),
            RelayError::FileUploadTimeout(Duration::from_secs(60))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 1);
    }
}
