//! # Channel Endpoints
//!
//! Channel URLs mirror the hosting page: `http` pages talk `ws://`, `https`
//! pages talk `wss://`, on the same host and port, under the fixed `/ws`
//! base path plus an optional per-feature segment.

use url::Url;

use crate::error::ChannelError;

/// Fixed path every channel URL starts with.
pub const CHANNEL_BASE_PATH: &str = "/ws";

/// Parses a caller-supplied URL and checks it is a usable WebSocket URL.
pub fn parse_channel_url(raw: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(raw).map_err(|e| ChannelError::invalid_url(raw, e.to_string()))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ChannelError::invalid_url(raw, format!("unsupported scheme '{}'", other)));
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ChannelError::invalid_url(raw, "missing host"));
    }

    Ok(url)
}

/// Derives the channel URL for a page served from `page_url`.
///
/// `channel_url("https://app.example.com/billing", Some("billing_client"))`
/// yields `wss://app.example.com/ws/billing_client`.
pub fn channel_url(page_url: &str, segment: Option<&str>) -> Result<Url, ChannelError> {
    let page = Url::parse(page_url).map_err(|e| ChannelError::invalid_url(page_url, e.to_string()))?;

    let scheme = match page.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::invalid_url(page_url, format!("cannot derive a socket scheme from '{}'", other)));
        }
    };
    let host = page
        .host_str()
        .ok_or_else(|| ChannelError::invalid_url(page_url, "missing host"))?;

    let mut raw = format!("{}://{}", scheme, host);
    if let Some(port) = page.port() {
        raw.push_str(&format!(":{}", port));
    }
    raw.push_str(CHANNEL_BASE_PATH);
    if let Some(segment) = segment.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        raw.push('/');
        raw.push_str(segment);
    }

    parse_channel_url(&raw)
}
