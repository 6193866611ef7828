use std::io;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use warden_http::{
    read_response_head, Body, BodyFraming, BodyStream, BoxedDuplex, BufferedStream, PrefixedIo,
    Request, Response,
};

use crate::dial::Dialer;
use crate::error::ProxyError;
use crate::proxy::MAX_HEAD_BYTES;

#[derive(Debug)]
pub(crate) struct UpstreamConnect {
    pub response: Response,
    pub stream: Option<BoxedDuplex>,
}

fn proxy_host_port(proxy_url: &Url) -> io::Result<String> {
    let host = proxy_url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "upstream proxy URL has no host"))?;
    let port = proxy_url.port_or_known_default().unwrap_or(1080);
    Ok(format!("{host}:{port}"))
}

pub(crate) async fn connect(
    req: &Request,
    proxy_url: Option<&Url>,
    dialer: &Arc<dyn Dialer>,
    tls_config: &Arc<ClientConfig>,
) -> Result<UpstreamConnect, ProxyError> {
    let Some(proxy_url) = proxy_url else {
        tracing::debug!(url = %req.url, "CONNECT to host directly");
        let stream = dialer.dial(&req.host_port()?).await?;
        return Ok(UpstreamConnect {
            response: Response::connection_established(),
            stream: Some(stream),
        });
    };

    match proxy_url.scheme() {
        "http" => connect_http(req, proxy_url, dialer, tls_config, false).await,
        "https" => connect_http(req, proxy_url, dialer, tls_config, true).await,
        "socks5" => connect_socks5(req, proxy_url, dialer).await,
        scheme => Err(ProxyError::UnsupportedProxyScheme(scheme.to_string())),
    }
}

async fn connect_http(
    req: &Request,
    proxy_url: &Url,
    dialer: &Arc<dyn Dialer>,
    tls_config: &Arc<ClientConfig>,
    over_tls: bool,
) -> Result<UpstreamConnect, ProxyError> {
    tracing::debug!(proxy = %proxy_url, "CONNECT via upstream HTTP proxy");
    let stream = dialer.dial(&proxy_host_port(proxy_url)?).await?;

    let mut stream: BoxedDuplex = if over_tls {
        let host = proxy_url
            .host_str()
            .unwrap_or_default()
            .to_string();
        let server_name = ServerName::try_from(host).map_err(|_| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid upstream proxy host for TLS",
            ))
        })?;
        let connector = TlsConnector::from(Arc::clone(tls_config));
        Box::new(connector.connect(server_name, stream).await?)
    } else {
        stream
    };

    let target = req.host_port()?;
    let head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut io = BufferedStream::new(stream);
    let Some((response, framing)) = read_response_head(&mut io, MAX_HEAD_BYTES, "CONNECT").await?
    else {
        return Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream proxy closed before answering CONNECT",
        )));
    };

    if response.is_success() {
        let (stream, leftover) = io.into_parts();
        let stream: BoxedDuplex = if leftover.is_empty() {
            stream
        } else {
            Box::new(PrefixedIo::new(leftover, stream))
        };
        return Ok(UpstreamConnect {
            response: Response::connection_established(),
            stream: Some(stream),
        });
    }

    let mut response = response;
    response.body = match framing {
        BodyFraming::None => Body::Empty,
        framing => Body::Stream(BodyStream::new(io, framing)),
    };
    Ok(UpstreamConnect {
        response,
        stream: None,
    })
}

async fn connect_socks5(
    req: &Request,
    proxy_url: &Url,
    dialer: &Arc<dyn Dialer>,
) -> Result<UpstreamConnect, ProxyError> {
    tracing::debug!(proxy = %proxy_url, "CONNECT via upstream SOCKS5 proxy");
    let stream = dialer.dial(&proxy_host_port(proxy_url)?).await?;

    let host = req
        .url
        .host_str()
        .ok_or_else(|| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request URL has no host",
            ))
        })?
        .to_string();
    let port = req.url.port_or_known_default().ok_or_else(|| {
        ProxyError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "request URL has no port",
        ))
    })?;

    let username = proxy_url.username();
    let connected = if username.is_empty() {
        Socks5Stream::connect_with_socket(stream, (host.as_str(), port)).await
    } else {
        Socks5Stream::connect_with_password_and_socket(
            stream,
            (host.as_str(), port),
            username,
            proxy_url.password().unwrap_or_default(),
        )
        .await
    };
    let socks = connected
        .map_err(|error| ProxyError::Io(io::Error::other(format!("socks5 connect failed: {error}"))))?;

    Ok(UpstreamConnect {
        response: Response::connection_established(),
        stream: Some(Box::new(socks)),
    })
}
