use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use chatrelay::upload::{HttpSource, SourceFetcher, SourceProbe};
use chatrelay::RelayError;

const PDF_BODY: &[u8] = b"%PDF-1.";

async fn pdf() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (header::CONTENT_LENGTH, "7"),
        ],
        PDF_BODY,
    )
}

async fn unsized_blob() -> impl IntoResponse {
    let chunks = (0..4).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; 1024])));
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(futures_util::stream::iter(chunks)),
    )
}

async fn missing() -> StatusCode {
    StatusCode::NOT_FOUND
}

struct MockFiles {
    base_url: String,
    join: JoinHandle<()>,
}

impl MockFiles {
    async fn start() -> Self {
        let app = Router::new()
            .route("/files/report.pdf", get(pdf))
            .route("/files/blob", get(unsized_blob))
            .route("/files/missing.png", get(missing));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind file host");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("file host error");
        });

        Self { base_url, join }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for MockFiles {
    fn drop(&mut self) {
        self.join.abort();
    }
}

#[tokio::test]
async fn probe_reports_status_and_headers() {
    let files = MockFiles::start().await;
    let source = HttpSource::new(reqwest::Client::new());

    let probe = source.probe(&files.url("/files/report.pdf")).await.unwrap();
    assert_eq!(
        probe,
        SourceProbe {
            status: 200,
            content_length: Some(7),
            content_type: Some("application/pdf".to_string()),
        }
    );

    let probe = source.probe(&files.url("/files/missing.png")).await.unwrap();
    assert_eq!(probe.status, 404);
}

#[tokio::test]
async fn download_returns_whole_body_within_limit() {
    let files = MockFiles::start().await;
    let source = HttpSource::new(reqwest::Client::new());

    let body = source
        .download(&files.url("/files/report.pdf"), 1024)
        .await
        .unwrap();
    assert_eq!(&body[..], PDF_BODY);
}

#[tokio::test]
async fn download_without_length_is_cut_off_at_limit() {
    let files = MockFiles::start().await;
    let source = HttpSource::new(reqwest::Client::new());

    let err = source
        .download(&files.url("/files/blob"), 2048)
        .await
        .unwrap_err();
    match err {
        RelayError::FileExceedsSize { size, limit } => {
            assert_eq!(limit, 2048);
            assert!(size > 2048, "size {size}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn failed_download_is_an_invalid_url() {
    let files = MockFiles::start().await;
    let source = HttpSource::new(reqwest::Client::new());

    let err = source
        .download(&files.url("/files/missing.png"), 1024)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::FileUrlInvalid(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_host_fails_the_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let source = HttpSource::new(reqwest::Client::new());
    let err = source
        .probe(&format!("http://{addr}/gone.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::FileUrlInvalid(_)), "{err:?}");
}
