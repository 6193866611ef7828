use std::io;

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Extensions, HeaderMap};
use tokio::io::AsyncRead;
use url::Url;

use crate::buffered::BufferedStream;
use crate::headers::connection_close;
use crate::message::{Body, BodyFraming, Request, Response, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    Origin(String),
    Absolute(Url),
    Authority(String),
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

pub async fn read_request_head<S: AsyncRead + Unpin>(
    io: &mut BufferedStream<S>,
    max_head_bytes: usize,
    secure: bool,
) -> io::Result<Option<(Request, BodyFraming)>> {
    let Some(raw) = io.read_until(b"\r\n\r\n", max_head_bytes).await? else {
        return Ok(None);
    };

    let text = std::str::from_utf8(&raw).map_err(|_| invalid("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| invalid("request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid("request method is missing"))?
        .to_string();
    let target_text = parts
        .next()
        .ok_or_else(|| invalid("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| invalid("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(invalid("request line had too many fields"));
    }
    let version = Version::parse(version_text)?;
    let headers = parse_headers(lines)?;

    let target = classify_target(&method, target_text)?;
    let url = resolve_url(&target, &headers, secure)?;

    let framing = request_body_framing(&headers)?;
    let request = Request {
        method,
        url,
        version,
        headers,
        body: Body::Empty,
        extensions: Extensions::new(),
    };
    Ok(Some((request, framing)))
}

pub async fn read_response_head<S: AsyncRead + Unpin>(
    io: &mut BufferedStream<S>,
    max_head_bytes: usize,
    request_method: &str,
) -> io::Result<Option<(Response, BodyFraming)>> {
    let Some(raw) = io.read_until(b"\r\n\r\n", max_head_bytes).await? else {
        return Ok(None);
    };

    let text =
        std::str::from_utf8(&raw).map_err(|_| invalid("response head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| invalid("response status line is missing"))?;

    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| invalid("response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| invalid("response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = Version::parse(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| invalid("invalid response status code"))?;

    let headers = parse_headers(lines)?;
    let framing = response_body_framing(&headers, request_method, status)?;
    let mut close = connection_close(version, &headers);
    if framing == BodyFraming::CloseDelimited {
        close = true;
    }

    let response = Response {
        version,
        status,
        reason,
        headers,
        body: Body::Empty,
        close,
    };
    Ok(Some((response, framing)))
}

fn classify_target(method: &str, target: &str) -> io::Result<RequestTarget> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(RequestTarget::Authority(target.to_string()));
    }
    if target.starts_with('/') || target == "*" {
        return Ok(RequestTarget::Origin(target.to_string()));
    }
    let url = Url::parse(target).map_err(|_| invalid("invalid absolute request target"))?;
    Ok(RequestTarget::Absolute(url))
}

fn resolve_url(target: &RequestTarget, headers: &HeaderMap, secure: bool) -> io::Result<Url> {
    let scheme = if secure { "https" } else { "http" };
    match target {
        RequestTarget::Absolute(url) => Ok(url.clone()),
        RequestTarget::Origin(path) => {
            let host = headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| invalid("origin-form request without a Host header"))?;
            let path = if path == "*" { "/" } else { path.as_str() };
            Url::parse(&format!("{scheme}://{host}{path}"))
                .map_err(|_| invalid("invalid Host header"))
        }
        RequestTarget::Authority(authority) => {
            Url::parse(&format!("http://{authority}")).map_err(|_| invalid("invalid CONNECT authority"))
        }
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid("malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| invalid("invalid Content-Length value"))?;
        let parsed = text
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("invalid Content-Length value"))?;
        length = Some(parsed);
    }
    Ok(length)
}

pub(crate) fn request_body_framing(headers: &HeaderMap) -> io::Result<BodyFraming> {
    if has_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::None),
        Some(length) => Ok(BodyFraming::ContentLength(length)),
    }
}

pub(crate) fn response_body_framing(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::None);
    }
    if has_token(headers, &TRANSFER_ENCODING, "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyFraming::None),
        Some(length) => Ok(BodyFraming::ContentLength(length)),
        None => Ok(BodyFraming::CloseDelimited),
    }
}
