use std::io;

use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::HeaderMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::message::{Body, BodyFraming, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    OnEnd,
    EveryChunk,
}

pub fn should_flush(res: &Response) -> bool {
    let chunked = matches!(&res.body, Body::Stream(stream) if stream.framing() == BodyFraming::Chunked);
    let sse = res
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    chunked && sse
}

fn serialize_headers(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

pub fn write_response_head(res: &Response, out: &mut Vec<u8>) {
    out.extend_from_slice(res.version.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(res.status.to_string().as_bytes());
    if !res.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(res.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    serialize_headers(&res.headers, out);
}

fn bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    res: &mut Response,
    writer: &mut W,
    flush: FlushMode,
) -> io::Result<()> {
    reconcile_framing_headers(res);
    if res.close {
        res.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let mut head = Vec::with_capacity(256);
    write_response_head(res, &mut head);
    writer.write_all(&head).await?;

    match res.body.take() {
        Body::Empty => {}
        Body::Full(bytes) => writer.write_all(&bytes).await?,
        Body::Stream(mut stream) => match stream.framing() {
            BodyFraming::Chunked => {
                while let Some(chunk) = stream.next_chunk().await? {
                    writer
                        .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                        .await?;
                    writer.write_all(&chunk).await?;
                    writer.write_all(b"\r\n").await?;
                    if flush == FlushMode::EveryChunk {
                        writer.flush().await?;
                    }
                }
                writer.write_all(b"0\r\n\r\n").await?;
            }
            _ => {
                while let Some(chunk) = stream.next_chunk().await? {
                    writer.write_all(&chunk).await?;
                }
            }
        },
        Body::Upgrade(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "upgrade bodies are tunneled, not written",
            ));
        }
    }

    writer.flush().await
}

fn reconcile_framing_headers(res: &mut Response) {
    res.headers.remove(TRANSFER_ENCODING);
    match &res.body {
        Body::Empty => {
            if !bodyless_status(res.status) && !res.headers.contains_key(CONTENT_LENGTH) {
                res.headers
                    .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
        }
        Body::Full(bytes) => {
            res.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
        }
        Body::Stream(stream) => match stream.framing() {
            BodyFraming::ContentLength(length) => {
                res.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            BodyFraming::Chunked => {
                res.headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                res.headers.remove(CONTENT_LENGTH);
            }
            BodyFraming::CloseDelimited | BodyFraming::None => {
                res.headers.remove(CONTENT_LENGTH);
            }
        },
        Body::Upgrade(_) => {}
    }
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    req: &mut Request,
    writer: &mut W,
    absolute_form: bool,
) -> io::Result<()> {
    if !req.headers.contains_key(HOST) {
        let mut host = req
            .url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URL has no host"))?
            .to_string();
        if let Some(port) = req.url.port() {
            host = format!("{host}:{port}");
        }
        let value = HeaderValue::from_str(&host)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid request host"))?;
        req.headers.insert(HOST, value);
    }

    let body = req.body.take();
    req.headers.remove(TRANSFER_ENCODING);
    match &body {
        Body::Empty => {
            req.headers.remove(CONTENT_LENGTH);
        }
        Body::Full(bytes) => {
            req.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
        }
        Body::Stream(_) => {
            req.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            req.headers.remove(CONTENT_LENGTH);
        }
        Body::Upgrade(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot serialize an upgraded request body",
            ));
        }
    }

    let target = if absolute_form {
        req.url.as_str().to_string()
    } else {
        let mut target = req.url.path().to_string();
        if let Some(query) = req.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.push(b' ');
    head.extend_from_slice(req.version.as_str().as_bytes());
    head.extend_from_slice(b"\r\n");
    serialize_headers(&req.headers, &mut head);
    writer.write_all(&head).await?;

    match body {
        Body::Empty => {}
        Body::Full(bytes) => writer.write_all(&bytes).await?,
        Body::Stream(mut stream) => {
            while let Some(chunk) = stream.next_chunk().await? {
                writer
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                writer.write_all(&chunk).await?;
                writer.write_all(b"\r\n").await?;
            }
            writer.write_all(b"0\r\n\r\n").await?;
        }
        Body::Upgrade(_) => unreachable!("rejected above"),
    }

    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Extensions;
    use url::Url;

    use crate::message::Version;

    #[tokio::test]
    async fn response_with_full_body_gets_content_length() {
        let mut res = Response::synthetic(200);
        res.body = Body::Full(Bytes::from_static(b"hello"));
        let mut out = Vec::new();
        write_response(&mut res, &mut out, FlushMode::OnEnd)
            .await
            .expect("write response");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\nhello"), "{text}");
    }

    #[tokio::test]
    async fn close_flag_writes_connection_close() {
        let mut res = Response::synthetic(200);
        res.close = true;
        let mut out = Vec::new();
        write_response(&mut res, &mut out, FlushMode::OnEnd)
            .await
            .expect("write response");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("connection: close\r\n"), "{text}");
    }

    fn chunked_stream(wire: &[u8]) -> crate::message::BodyStream {
        use crate::buffered::BufferedStream;
        use crate::message::{BodyStream, BoxedDuplex};

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let data = wire.to_vec();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt as _;
            client.write_all(&data).await.expect("write wire");
        });
        BodyStream::new(
            BufferedStream::new(Box::new(server) as BoxedDuplex),
            BodyFraming::Chunked,
        )
    }

    #[tokio::test]
    async fn chunked_stream_bodies_are_reencoded_chunk_for_chunk() {
        let mut res = Response::synthetic(200);
        res.body = Body::Stream(chunked_stream(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));

        let mut out = Vec::new();
        write_response(&mut res, &mut out, FlushMode::EveryChunk)
            .await
            .expect("write response");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("transfer-encoding: chunked\r\n"), "{text}");
        assert!(text.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"), "{text}");
    }

    #[tokio::test]
    async fn flush_eligibility_requires_chunked_event_stream() {
        let mut res = Response::synthetic(200);
        res.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        res.body = Body::Stream(chunked_stream(b"0\r\n\r\n"));
        assert!(should_flush(&res));

        let mut plain = Response::synthetic(200);
        plain.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        plain.body = Body::Full(Bytes::from_static(b"data: x\n\n"));
        assert!(!should_flush(&plain), "buffered bodies are not flush-eligible");
    }

    #[tokio::test]
    async fn request_origin_form_writes_path_and_host() {
        let mut req = Request {
            method: "GET".to_string(),
            url: Url::parse("http://example.com/a/b?c=d").expect("url"),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            extensions: Extensions::new(),
        };
        let mut out = Vec::new();
        write_request(&mut req, &mut out, false)
            .await
            .expect("write request");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("GET /a/b?c=d HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("host: example.com\r\n"), "{text}");
    }

    #[tokio::test]
    async fn request_absolute_form_writes_full_url() {
        let mut req = Request {
            method: "GET".to_string(),
            url: Url::parse("http://example.com/x").expect("url"),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            extensions: Extensions::new(),
        };
        let mut out = Vec::new();
        write_request(&mut req, &mut out, true)
            .await
            .expect("write request");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("GET http://example.com/x HTTP/1.1\r\n"), "{text}");
    }
}
