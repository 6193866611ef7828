use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use warden_http::{
    read_response_head, write_request, Body, BodyFraming, BodyStream, BoxedDuplex, BufferedStream,
    PrefixedIo, Request, Response,
};

use crate::dial::Dialer;
use crate::error::timeout_error;
use crate::proxy::{UpstreamProxyFunc, MAX_HEAD_BYTES};
use crate::session::Context;
use crate::upstream;

#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, ctx: &Arc<Context>, req: &mut Request) -> io::Result<Response>;
}

pub fn default_tls_config() -> Arc<ClientConfig> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

pub struct HttpTransport {
    dialer: Arc<dyn Dialer>,
    proxy: Option<UpstreamProxyFunc>,
    tls_config: Arc<ClientConfig>,
    tls_handshake_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        proxy: Option<UpstreamProxyFunc>,
        tls_config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            dialer,
            proxy,
            tls_config,
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }

    async fn tunnel_to_target(&self, req: &Request, proxy_url: &url::Url) -> io::Result<BoxedDuplex> {
        let outcome = upstream::connect(req, Some(proxy_url), &self.dialer, &self.tls_config)
            .await
            .map_err(io::Error::other)?;
        outcome.stream.ok_or_else(|| {
            io::Error::other(format!(
                "upstream proxy refused CONNECT with status {}",
                outcome.response.status
            ))
        })
    }

    async fn tls_to_origin(&self, host: &str, stream: BoxedDuplex) -> io::Result<BoxedDuplex> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid origin host for TLS"))?;
        let connector = TlsConnector::from(Arc::clone(&self.tls_config));
        let tls = tokio::time::timeout(
            self.tls_handshake_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| timeout_error("origin TLS handshake"))??;
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl RoundTripper for HttpTransport {
    async fn round_trip(&self, _ctx: &Arc<Context>, req: &mut Request) -> io::Result<Response> {
        if req.is_connect() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the default transport does not round-trip CONNECT requests",
            ));
        }

        let proxy_url = match &self.proxy {
            Some(resolve) => resolve(req)?,
            None => None,
        };

        let host = req
            .url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URL has no host"))?
            .to_string();

        let (mut stream, absolute_form) = match req.url.scheme() {
            "https" => {
                let transport = match &proxy_url {
                    Some(proxy) => self.tunnel_to_target(req, proxy).await?,
                    None => self.dialer.dial(&req.host_port()?).await?,
                };
                (self.tls_to_origin(&host, transport).await?, false)
            }
            "http" => match &proxy_url {
                Some(proxy) if proxy.scheme() == "http" => {
                    let addr = format!(
                        "{}:{}",
                        proxy.host_str().unwrap_or_default(),
                        proxy.port_or_known_default().unwrap_or(80),
                    );
                    (self.dialer.dial(&addr).await?, true)
                }
                Some(proxy) if proxy.scheme() == "socks5" => {
                    (self.tunnel_to_target(req, proxy).await?, false)
                }
                Some(proxy) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!(
                            "http requests cannot be forwarded via a {} upstream proxy",
                            proxy.scheme()
                        ),
                    ));
                }
                None => (self.dialer.dial(&req.host_port()?).await?, false),
            },
            scheme => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported request scheme: {scheme}"),
                ));
            }
        };

        write_request(req, &mut stream, absolute_form).await?;

        let mut io = BufferedStream::new(stream);
        let Some((mut response, framing)) =
            read_response_head(&mut io, MAX_HEAD_BYTES, &req.method).await?
        else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin closed before sending a response",
            ));
        };

        if response.status == 101 {
            let (stream, leftover) = io.into_parts();
            response.body = Body::Upgrade(Box::new(PrefixedIo::new(leftover, stream)));
            return Ok(response);
        }

        response.body = match framing {
            BodyFraming::None => Body::Empty,
            framing => Body::Stream(BodyStream::new(io, framing)),
        };
        Ok(response)
    }
}
