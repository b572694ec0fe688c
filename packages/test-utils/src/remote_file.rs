//! Mock remote file host for testing remote file pull tasks
//!
//! Provides a [`MockRemoteFileServer`] that serves fixed file bodies, optional
//! `ETag`s, conditional `304` responses and failures.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock HTTP server standing in for TitleDB / MAME XML hosts
///
/// # Example
///
/// ```rust,ignore
/// use romvault_test_utils::MockRemoteFileServer;
///
/// #[tokio::test]
/// async fn test_pull() {
///     let server = MockRemoteFileServer::start().await;
///     server.mock_file("/US.en.json", "{}", Some("\"abc\"")).await;
///     server.mock_not_modified("/US.en.json", "\"abc\"", 1).await;
///
///     // Pull twice from server.file_url("/US.en.json")
/// }
/// ```
pub struct MockRemoteFileServer {
    server: MockServer,
}

impl MockRemoteFileServer {
    /// Start a new mock file server
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Get the server URL
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL of a file on this server
    pub fn file_url(&self, file_path: &str) -> String {
        format!("{}{}", self.server.uri(), file_path)
    }

    /// Serve `body` for every GET of `file_path`, with an `ETag` if given
    pub async fn mock_file(&self, file_path: &str, body: &str, etag: Option<&str>) {
        let mut response = ResponseTemplate::new(200).set_body_string(body);
        if let Some(etag) = etag {
            response = response.insert_header("ETag", etag);
        }

        Mock::given(method("GET"))
            .and(path(file_path))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }

    /// Serve `body` for the next GET of `file_path` only
    ///
    /// Later requests fall through to other mounted mocks, which makes it
    /// possible to change the content between two pulls.
    pub async fn mock_file_once(&self, file_path: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(file_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Answer `304 Not Modified` to requests carrying `If-None-Match: etag`
    ///
    /// The server panics on drop unless exactly `expected_hits` conditional
    /// requests arrived.
    pub async fn mock_not_modified(&self, file_path: &str, etag: &str, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path(file_path))
            .and(header("If-None-Match", etag))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    /// Fail every GET of `file_path` with `status_code`
    pub async fn mock_failure(&self, file_path: &str, status_code: u16) {
        Mock::given(method("GET"))
            .and(path(file_path))
            .respond_with(ResponseTemplate::new(status_code).set_body_string("upstream error"))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received so far
    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    /// Get a reference to the underlying MockServer for custom mocks
    pub fn inner(&self) -> &MockServer {
        &self.server
    }
}
