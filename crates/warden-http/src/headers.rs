use chrono::Utc;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::HeaderMap;

use crate::message::Version;

pub const WARNING_AGENT: &str = "warden";

const WARNING: HeaderName = HeaderName::from_static("warning");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    connection_tokens(headers)
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(token))
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for token in connection_tokens(headers) {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    headers.remove(CONNECTION);
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
}

pub fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    if !has_connection_token(headers, "upgrade") {
        return None;
    }
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

pub fn restore_upgrade(headers: &mut HeaderMap, kind: &str) {
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(value) = HeaderValue::from_str(kind) {
        headers.insert(UPGRADE, value);
    }
}

pub fn connection_close(version: Version, headers: &HeaderMap) -> bool {
    if has_connection_token(headers, "close") {
        return true;
    }
    version == Version::Http10 && !has_connection_token(headers, "keep-alive")
}

pub fn warning(headers: &mut HeaderMap, error: &dyn std::fmt::Display) {
    let message = error.to_string().replace('"', "'");
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    let entry = format!("214 {WARNING_AGENT} \"{message}\" \"{date}\"");
    if let Ok(value) = HeaderValue::from_str(&entry) {
        headers.append(WARNING, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fixed_set_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, X-Hop"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-end-to-end", HeaderValue::from_static("kept"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get(KEEP_ALIVE).is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get("x-end-to-end").unwrap(), "kept");
    }

    #[test]
    fn upgrade_type_requires_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert_eq!(upgrade_type(&headers), None);

        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert_eq!(upgrade_type(&headers).as_deref(), Some("websocket"));
    }

    #[test]
    fn http10_defaults_to_close_without_keep_alive() {
        let headers = HeaderMap::new();
        assert!(connection_close(Version::Http10, &headers));
        assert!(!connection_close(Version::Http11, &headers));

        let mut keep_alive = HeaderMap::new();
        keep_alive.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!connection_close(Version::Http10, &keep_alive));
    }

    #[test]
    fn warning_appends_entries_in_order() {
        let mut headers = HeaderMap::new();
        warning(&mut headers, &"first failure");
        warning(&mut headers, &"second failure");

        let entries: Vec<_> = headers
            .get_all(WARNING)
            .iter()
            .map(|value| value.to_str().unwrap().to_string())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("214 warden \"first failure\""));
        assert!(entries[1].starts_with("214 warden \"second failure\""));
    }

    #[test]
    fn warning_sanitizes_embedded_quotes() {
        let mut headers = HeaderMap::new();
        warning(&mut headers, &"bad \"quoted\" reason");
        let entry = headers.get(WARNING).unwrap().to_str().unwrap();
        assert!(entry.contains("bad 'quoted' reason"));
    }
}
