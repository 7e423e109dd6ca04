pub mod base;
pub mod openai;
pub mod sse;

use reqwest::Client;
use std::time::Duration;

/// Build a `reqwest::Client` with standard provider timeouts (30 s connect,
/// 300 s overall — streaming responses can run long).
pub fn build_http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|_| Client::new())
}
