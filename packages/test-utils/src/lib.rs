//! Shared test utilities for the romvault workspace
//!
//! This crate provides mock implementations of external services for testing
//! without network dependencies.
//!
//! # Mock Services
//!
//! - [`MockRemoteFileServer`] - Mock HTTP file host for remote file pull tests
//!
//! # Example
//!
//! ```rust,ignore
//! use romvault_test_utils::MockRemoteFileServer;
//!
//! #[tokio::test]
//! async fn test_with_mocks() {
//!     let server = MockRemoteFileServer::start().await;
//!     server.mock_file("/mame.xml", "<mame/>", Some("\"v1\"")).await;
//!
//!     // Point the task at server.file_url("/mame.xml")
//! }
//! ```

mod remote_file;

pub use remote_file::MockRemoteFileServer;
