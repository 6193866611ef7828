use std::io;

use bytes::Bytes;
use http::{Extensions, HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::buffered::BufferedStream;

pub trait Duplex: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Duplex for T {}

impl std::fmt::Debug for dyn Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Duplex")
    }
}

pub type BoxedDuplex = Box<dyn Duplex>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(text: &str) -> io::Result<Self> {
        match text {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "only HTTP/1.0 and HTTP/1.1 are supported",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
    Upgrade(BoxedDuplex),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            _ => false,
        }
    }

    pub fn take(&mut self) -> Body {
        std::mem::replace(self, Body::Empty)
    }

    pub fn into_upgrade(self) -> Option<BoxedDuplex> {
        match self {
            Self::Upgrade(io) => Some(io),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Self::Stream(stream) => write!(f, "Body::Stream({:?})", stream.framing()),
            Self::Upgrade(_) => f.write_str("Body::Upgrade"),
        }
    }
}

#[derive(Clone, Copy)]
enum ChunkProgress {
    AwaitingSize,
    InChunk(u64),
    Finished,
}

pub struct BodyStream {
    io: BufferedStream<BoxedDuplex>,
    framing: BodyFraming,
    remaining: u64,
    chunk: ChunkProgress,
}

const CHUNK_SIZE_LINE_LIMIT: usize = 8 * 1024;
const TRAILER_LINE_LIMIT: usize = 8 * 1024;
const BODY_READ_CHUNK: usize = 8 * 1024;

impl BodyStream {
    pub fn new(io: BufferedStream<BoxedDuplex>, framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::ContentLength(length) => length,
            _ => 0,
        };
        Self {
            io,
            framing,
            remaining,
            chunk: ChunkProgress::AwaitingSize,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.framing {
            BodyFraming::None => Ok(None),
            BodyFraming::ContentLength(_) => self.next_sized().await,
            BodyFraming::Chunked => self.next_chunked().await,
            BodyFraming::CloseDelimited => self.next_until_eof().await,
        }
    }

    pub async fn collect(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }

    async fn next_sized(&mut self) -> io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = (self.remaining as usize).min(BODY_READ_CHUNK);
        let mut buf = vec![0_u8; want];
        let read = self.io.read_some(&mut buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        buf.truncate(read);
        self.remaining -= read as u64;
        Ok(Some(Bytes::from(buf)))
    }

    async fn next_chunked(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.chunk {
                ChunkProgress::Finished => return Ok(None),
                ChunkProgress::AwaitingSize => {
                    let line = self
                        .io
                        .read_until(b"\r\n", CHUNK_SIZE_LINE_LIMIT)
                        .await?
                        .ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed before chunk size line",
                            )
                        })?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.read_trailers().await?;
                        self.chunk = ChunkProgress::Finished;
                        return Ok(None);
                    }
                    self.chunk = ChunkProgress::InChunk(size);
                }
                ChunkProgress::InChunk(left) => {
                    let want = (left as usize).min(BODY_READ_CHUNK);
                    let mut buf = vec![0_u8; want];
                    let read = self.io.read_some(&mut buf).await?;
                    if read == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunk data",
                        ));
                    }
                    buf.truncate(read);
                    let left = left - read as u64;
                    if left == 0 {
                        let terminator = self.io.read_exact_bytes(2).await?;
                        if terminator != b"\r\n" {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "invalid chunk terminator",
                            ));
                        }
                        self.chunk = ChunkProgress::AwaitingSize;
                    } else {
                        self.chunk = ChunkProgress::InChunk(left);
                    }
                    return Ok(Some(Bytes::from(buf)));
                }
            }
        }
    }

    async fn read_trailers(&mut self) -> io::Result<()> {
        loop {
            let line = self
                .io
                .read_until(b"\r\n", TRAILER_LINE_LIMIT)
                .await?
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before chunked trailers completed",
                    )
                })?;
            if line == b"\r\n" {
                return Ok(());
            }
        }
    }

    async fn next_until_eof(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0_u8; BODY_READ_CHUNK];
        let read = self.io.read_some(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(Bytes::from(buf)))
    }
}

pub async fn read_body_bytes<S: tokio::io::AsyncRead + Unpin>(
    io: &mut BufferedStream<S>,
    framing: BodyFraming,
) -> io::Result<Bytes> {
    match framing {
        BodyFraming::None => Ok(Bytes::new()),
        BodyFraming::ContentLength(length) => {
            let bytes = io.read_exact_bytes(length as usize).await.map_err(|error| {
                if error.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before body completed",
                    )
                } else {
                    error
                }
            })?;
            Ok(Bytes::from(bytes))
        }
        BodyFraming::Chunked => {
            let mut out = Vec::new();
            loop {
                let line = io
                    .read_until(b"\r\n", CHUNK_SIZE_LINE_LIMIT)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before chunk size line",
                        )
                    })?;
                let size = parse_chunk_size(&line)?;
                if size == 0 {
                    loop {
                        let trailer = io
                            .read_until(b"\r\n", TRAILER_LINE_LIMIT)
                            .await?
                            .ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed before chunked trailers completed",
                                )
                            })?;
                        if trailer == b"\r\n" {
                            return Ok(Bytes::from(out));
                        }
                    }
                }
                let data = io.read_exact_bytes(size as usize).await?;
                out.extend_from_slice(&data);
                let terminator = io.read_exact_bytes(2).await?;
                if terminator != b"\r\n" {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid chunk terminator",
                    ));
                }
            }
        }
        BodyFraming::CloseDelimited => {
            let mut out = Vec::new();
            let mut buf = [0_u8; BODY_READ_CHUNK];
            loop {
                let read = io.read_some(&mut buf).await?;
                if read == 0 {
                    return Ok(Bytes::from(out));
                }
                out.extend_from_slice(&buf[..read]);
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size line not UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub extensions: Extensions,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn host_port(&self) -> io::Result<String> {
        let host = self.url.host_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "request URL has no host")
        })?;
        let port = self.url.port_or_known_default().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "request URL has no port")
        })?;
        Ok(format!("{host}:{port}"))
    }
}

#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub close: bool,
}

impl Response {
    pub fn synthetic(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: canonical_reason(status).to_string(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            close: false,
        }
    }

    pub fn connection_established() -> Self {
        let mut res = Self::synthetic(200);
        res.reason = "Connection Established".to_string();
        res
    }

    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }
}

fn canonical_reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}
