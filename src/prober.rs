use reqwest::{Client, Method, StatusCode};
use std::time::Duration;

/// Outcome of a single probe request, mirroring the `(response, elapsed,
/// error)` tuple the original checker threads through its retry loop.
pub struct ProbeOutcome {
    pub status: Option<StatusCode>,
    pub content_length: Option<u64>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Builds a reqwest client routed through the relay's loopback SOCKS port.
/// `socks5h://` resolves DNS on the remote side, matching the original's
/// `requests` proxies dict.
pub fn build_probe_client(
    socks_port: u16,
    connect_timeout: Duration,
    verify_ssl: bool,
) -> anyhow::Result<Client> {
    let proxy_url = format!("socks5h://127.0.0.1:{socks_port}");
    let proxy = reqwest::Proxy::all(&proxy_url)?;
    Ok(Client::builder()
        .proxy(proxy)
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(!verify_ssl)
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Issues one GET or POST through `client` and returns timing/outcome
/// information without raising on network failure, so callers can retry on
/// connection errors and give up immediately on everything else.
pub async fn make_request(
    client: &Client,
    url: &str,
    method: Method,
    read_timeout: Duration,
) -> ProbeOutcome {
    let start = tokio::time::Instant::now();
    let request = client.request(method, url).timeout(read_timeout);

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let content_length = response.content_length();
            let elapsed = start.elapsed();
            // Some servers omit Content-Length; fall back to reading the
            // body so `check_response_valid`'s size check still has data.
            let content_length = match content_length {
                Some(len) => Some(len),
                None => response.bytes().await.ok().map(|b| b.len() as u64),
            };
            ProbeOutcome {
                status: Some(status),
                content_length,
                elapsed,
                error: None,
            }
        }
        Err(e) => ProbeOutcome {
            status: None,
            content_length: None,
            elapsed: start.elapsed(),
            error: Some(e.to_string()),
        },
    }
}

/// Whether `error` text looks like a connection reset/abort/refusal, the
/// only failure class the retry loop backs off and retries on.
pub fn is_connection_error(error: &str) -> bool {
    let lowered = error.to_lowercase();
    lowered.contains("connection aborted")
        || lowered.contains("connection reset")
        || lowered.contains("connection refused")
        || lowered.contains("connect error")
}

/// Validates a probe response against the original's two-branch rule: the
/// special-cased `generate_204`-style empty response, or a generic
/// success-range-plus-minimum-size check.
pub fn check_response_valid(
    status: Option<StatusCode>,
    content_length: Option<u64>,
    min_size: u64,
    url: &str,
) -> bool {
    let Some(status) = status else {
        return false;
    };
    let len = content_length.unwrap_or(0);

    if url.contains("generate_204") {
        return (status == StatusCode::OK || status == StatusCode::NO_CONTENT) && len <= 64;
    }

    let status_ok = status.as_u16() >= 200 && status.as_u16() < 400;
    status_ok && (min_size == 0 || len >= min_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_204_accepts_small_ok_and_no_content() {
        assert!(check_response_valid(
            Some(StatusCode::NO_CONTENT),
            Some(0),
            0,
            "http://www.google.com/generate_204"
        ));
        assert!(check_response_valid(
            Some(StatusCode::OK),
            Some(40),
            0,
            "http://www.google.com/generate_204"
        ));
    }

    #[test]
    fn generate_204_rejects_oversized_body() {
        assert!(!check_response_valid(
            Some(StatusCode::OK),
            Some(65),
            0,
            "http://www.google.com/generate_204"
        ));
    }

    #[test]
    fn generic_url_enforces_min_size() {
        assert!(!check_response_valid(
            Some(StatusCode::OK),
            Some(10),
            100,
            "http://example.com/"
        ));
        assert!(check_response_valid(
            Some(StatusCode::OK),
            Some(150),
            100,
            "http://example.com/"
        ));
    }

    #[test]
    fn redirect_status_without_min_size_passes() {
        assert!(check_response_valid(
            Some(StatusCode::FOUND),
            Some(0),
            0,
            "http://example.com/"
        ));
    }

    #[test]
    fn missing_status_is_invalid() {
        assert!(!check_response_valid(None, None, 0, "http://example.com/"));
    }

    #[test]
    fn detects_connection_errors() {
        assert!(is_connection_error("Connection reset by peer"));
        assert!(is_connection_error("connection aborted."));
        assert!(!is_connection_error("timed out"));
    }
}
