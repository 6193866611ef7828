use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use warden_conn::{is_force_close, BufferPool};
use warden_http::{
    connection_close, read_body_bytes, read_request_head, restore_upgrade, should_flush,
    strip_hop_by_hop, upgrade_type, write_response, write_response_head, Body, BodyFraming,
    BodyStream, BoxedDuplex, BufferedStream, FlushMode, PrefixedIo, Request, Response, Version,
};

use crate::error::{timeout_error, ProxyError};
use crate::proxy::{Proxy, MAX_HEAD_BYTES};
use crate::session::{ClientIo, Context, Session};
use crate::upstream::{self, UpstreamConnect};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const PASSTHROUGH_PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) async fn handle_loop(
    proxy: Arc<Proxy>,
    stream: BoxedDuplex,
    peer: SocketAddr,
    secure: bool,
) {
    if proxy.closing() {
        return;
    }

    let session = proxy.new_session(stream, peer, secure);
    let mut consecutive_errors = 0_u32;
    loop {
        match handle_one(&proxy, &session).await {
            Ok(()) => consecutive_errors = 0,
            Err(error) if error.is_closeable() => {
                tracing::debug!(%peer, %error, "closing connection");
                break;
            }
            Err(error) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!(
                        %peer,
                        %error,
                        errors = consecutive_errors,
                        "closing connection after consecutive errors"
                    );
                    break;
                }
            }
        }
        if session.hijacked() {
            tracing::debug!(%peer, "connection hijacked, handler detaching");
            return;
        }
    }
}

async fn with_deadline<T>(
    limit: Option<Duration>,
    stage: &'static str,
    future: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        None => future.await,
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| timeout_error(stage))?,
    }
}

async fn handle_one(proxy: &Arc<Proxy>, session: &Arc<Session>) -> Result<(), ProxyError> {
    if proxy.closing() {
        return Err(ProxyError::Close);
    }
    let mut io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    let started = Instant::now();
    let mut closing_signal = proxy.closing_signal();
    let parsed = tokio::select! {
        parsed = with_deadline(
            proxy.read_header_deadline(),
            "request header read",
            read_request_head(&mut io, MAX_HEAD_BYTES, session.is_secure()),
        ) => parsed,
        _ = closing_signal.changed() => return Err(ProxyError::Close),
    };

    let (mut req, framing) = match parsed {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Err(ProxyError::Close),
        Err(error) => {
            let _ = io.get_mut().shutdown().await;
            session.restore_transport(io);
            return Err(ProxyError::Io(error));
        }
    };

    if proxy.closing() {
        return Err(ProxyError::Close);
    }

    if !req.is_connect() && framing != BodyFraming::None {
        let residual = proxy
            .read_timeout
            .map(|limit| limit.saturating_sub(started.elapsed()));
        let body = match with_deadline(
            residual,
            "request body read",
            read_body_bytes(&mut io, framing),
        )
        .await
        {
            Ok(body) => body,
            Err(error) => {
                let _ = io.get_mut().shutdown().await;
                session.restore_transport(io);
                return Err(ProxyError::Io(error));
            }
        };
        req.body = Body::Full(body);
    }

    let ctx = Context::new(Arc::clone(session));
    ctx.attach(&mut req);

    if req.is_connect() {
        return handle_connect(proxy, session, &ctx, req, io).await;
    }

    if req.url.scheme() == "http" && session.is_secure() && !proxy.allow_http {
        tracing::debug!("forcing https inside secure session");
        let _ = req.url.set_scheme("https");
    }

    let req_close = connection_close(req.version, &req.headers);
    let req_upgrade = upgrade_type(&req.headers);
    if let Some(kind) = &req_upgrade {
        tracing::debug!(kind = %kind, "upgrade request");
    }
    strip_hop_by_hop(&mut req.headers);

    session.restore_transport(io);
    if let Err(error) = proxy.reqmod.modify_request(&mut req) {
        tracing::error!(%error, "error modifying request");
        proxy.warn(&mut req.headers, &error);
    }
    if session.hijacked() {
        tracing::debug!("connection hijacked by request modifier");
        return Ok(());
    }
    let io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    if let Some(kind) = &req_upgrade {
        restore_upgrade(&mut req.headers, kind);
    }

    let round_trip_started = Instant::now();
    let mut res = if ctx.skipping_round_trip() {
        tracing::debug!("skipping round trip");
        Response::synthetic(200)
    } else {
        match proxy.round_tripper.round_trip(&ctx, &mut req).await {
            Ok(res) => res,
            Err(error) => {
                tracing::error!(%error, "failed to round trip");
                let error = ProxyError::Io(error);
                let mut res = proxy.error_response(&req, &error);
                proxy.warn(&mut res.headers, &error);
                res
            }
        }
    };
    ctx.record_round_trip_duration(round_trip_started.elapsed());

    let res_upgrade = upgrade_type(&res.headers);
    if let Some(kind) = &res_upgrade {
        tracing::debug!(kind = %kind, "upgrade response");
    }
    strip_hop_by_hop(&mut res.headers);

    session.restore_transport(io);
    if let Err(error) = proxy.resmod.modify_response(&mut res) {
        tracing::error!(%error, "error modifying response");
        proxy.warn(&mut res.headers, &error);
    }
    if session.hijacked() {
        tracing::debug!("connection hijacked by response modifier");
        return Ok(());
    }
    let mut io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    if let Some(kind) = &res_upgrade {
        restore_upgrade(&mut res.headers, kind);
    }

    if res.status == 101 {
        return handle_upgrade(proxy, res, io).await;
    }

    let mut closing = false;
    if req.version != Version::Http11
        || req_close
        || res.close
        || proxy.closing()
        || proxy.close_after_reply
    {
        res.close = true;
        closing = true;
    }

    let flush = if should_flush(&res) {
        FlushMode::EveryChunk
    } else {
        FlushMode::OnEnd
    };
    let write_result = with_deadline(
        proxy.write_timeout,
        "response write",
        write_response(&mut res, io.get_mut(), flush),
    )
    .await;
    if let Err(error) = write_result {
        tracing::error!(%error, "error writing response back to client");
        if error.kind() == io::ErrorKind::TimedOut {
            return Err(ProxyError::Io(error));
        }
        if error.kind() == io::ErrorKind::UnexpectedEof || is_force_close(&error) {
            closing = true;
        }
    }

    session.restore_transport(io);
    if closing {
        Err(ProxyError::Close)
    } else {
        Ok(())
    }
}

async fn handle_connect(
    proxy: &Arc<Proxy>,
    session: &Arc<Session>,
    ctx: &Arc<Context>,
    mut req: Request,
    io: ClientIo,
) -> Result<(), ProxyError> {
    session.restore_transport(io);
    if let Err(error) = proxy.reqmod.modify_request(&mut req) {
        tracing::error!(%error, "error modifying CONNECT request");
        proxy.warn(&mut req.headers, &error);
    }
    if session.hijacked() {
        tracing::debug!("connection hijacked by request modifier");
        return Ok(());
    }
    let io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    if proxy.mitm.is_some() {
        return handle_mitm(proxy, session, &req, io).await;
    }

    tracing::debug!(url = %req.url, "establishing CONNECT tunnel");
    let (mut res, endpoints) = if proxy.connect_passthrough {
        connect_via_round_trip(proxy, ctx, &mut req).await
    } else {
        connect_via_dialer(proxy, &req).await
    };

    session.restore_transport(io);
    if let Err(error) = proxy.resmod.modify_response(&mut res) {
        tracing::error!(%error, "error modifying CONNECT response");
        proxy.warn(&mut res.headers, &error);
    }
    if session.hijacked() {
        tracing::debug!("connection hijacked by response modifier");
        return Ok(());
    }
    let mut io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    let endpoints = match endpoints {
        Some(endpoints) if res.status == 200 => endpoints,
        _ => {
            tracing::debug!(status = res.status, "CONNECT rejected");
            if let Err(error) = write_response(&mut res, io.get_mut(), FlushMode::OnEnd).await {
                tracing::error!(%error, "error writing CONNECT rejection");
            }
            return Err(ProxyError::Close);
        }
    };

    let (reader, writer) = endpoints;
    tunnel(proxy, "CONNECT", &res, io, writer, reader).await?;
    Err(ProxyError::Close)
}

type TunnelEndpoints = (TunnelReader, Box<dyn AsyncWrite + Send + Unpin>);

async fn connect_via_dialer(
    proxy: &Arc<Proxy>,
    req: &Request,
) -> (Response, Option<TunnelEndpoints>) {
    let proxy_url = match &proxy.upstream_proxy {
        Some(resolve) => match resolve(req) {
            Ok(url) => url,
            Err(error) => {
                return connect_failure(proxy, req, ProxyError::Io(error));
            }
        },
        None => None,
    };

    match upstream::connect(req, proxy_url.as_ref(), &proxy.dialer, &proxy.tls_client).await {
        Ok(UpstreamConnect {
            response,
            stream: Some(stream),
        }) => {
            let (read_half, write_half) = tokio::io::split(stream);
            (
                response,
                Some((
                    TunnelReader::Io(Box::new(read_half)),
                    Box::new(write_half),
                )),
            )
        }
        Ok(UpstreamConnect {
            response,
            stream: None,
        }) => (response, None),
        Err(error) => connect_failure(proxy, req, error),
    }
}

async fn connect_via_round_trip(
    proxy: &Arc<Proxy>,
    ctx: &Arc<Context>,
    req: &mut Request,
) -> (Response, Option<TunnelEndpoints>) {
    let (round_trip_side, tunnel_side) = tokio::io::duplex(PASSTHROUGH_PIPE_CAPACITY);
    req.body = Body::Stream(BodyStream::new(
        BufferedStream::new(Box::new(round_trip_side)),
        BodyFraming::CloseDelimited,
    ));

    match proxy.round_tripper.round_trip(ctx, req).await {
        Ok(mut upstream_res) => {
            if upstream_res.is_success() {
                let reader = TunnelReader::from_body(upstream_res.body.take());
                (
                    Response::connection_established(),
                    Some((reader, Box::new(tunnel_side))),
                )
            } else {
                (upstream_res, None)
            }
        }
        Err(error) => connect_failure(proxy, req, ProxyError::Io(error)),
    }
}

fn connect_failure(
    proxy: &Arc<Proxy>,
    req: &Request,
    error: ProxyError,
) -> (Response, Option<TunnelEndpoints>) {
    tracing::error!(%error, "failed to CONNECT");
    let mut res = proxy.error_response(req, &error);
    proxy.warn(&mut res.headers, &error);
    (res, None)
}

async fn handle_mitm(
    proxy: &Arc<Proxy>,
    session: &Arc<Session>,
    req: &Request,
    io: ClientIo,
) -> Result<(), ProxyError> {
    let mitm = proxy.mitm.clone().expect("mitm checked by caller");
    let host = req.url.host_str().unwrap_or_default().to_string();
    tracing::debug!(%host, "attempting MITM");

    let mut res = Response::connection_established();
    session.restore_transport(io);
    if let Err(error) = proxy.resmod.modify_response(&mut res) {
        tracing::error!(%error, "error modifying CONNECT response");
        proxy.warn(&mut res.headers, &error);
    }
    if session.hijacked() {
        tracing::debug!("connection hijacked by response modifier");
        return Ok(());
    }
    let mut io = session
        .take_transport()
        .ok_or(ProxyError::TransportUnavailable)?;

    let mut head = Vec::with_capacity(64);
    write_response_head(&res, &mut head);
    io.get_mut().write_all(&head).await?;
    io.get_mut().flush().await?;

    let Some(first_byte) = io.peek_byte().await? else {
        return Err(ProxyError::Close);
    };

    if first_byte != TLS_HANDSHAKE_RECORD {
        tracing::debug!(%host, "tunnel is plaintext, continuing without TLS");
        session.restore_transport(io);
        return Ok(());
    }

    let server_config = match mitm.server_config(&host) {
        Ok(config) => config,
        Err(error) => {
            mitm.handshake_failure(&host, &error);
            return Err(ProxyError::TlsHandshake(error.to_string()));
        }
    };

    let (stream, buffered) = io.into_parts();
    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = match acceptor.accept(PrefixedIo::new(buffered, stream)).await {
        Ok(tls_stream) => tls_stream,
        Err(error) => {
            mitm.handshake_failure(&host, &error);
            return Err(ProxyError::TlsHandshake(error.to_string()));
        }
    };

    let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
    if negotiated_h2 {
        let Some(h2) = mitm.h2_passthrough() else {
            return Err(ProxyError::TlsHandshake(
                "h2 negotiated without a passthrough handler".to_string(),
            ));
        };
        h2.proxy(Box::new(tls_stream), &host).await?;
        return Err(ProxyError::Close);
    }

    tracing::debug!(%host, "MITM established");
    session.mark_secure();
    session.restore_transport(BufferedStream::new(Box::new(tls_stream)));
    Ok(())
}

async fn handle_upgrade(
    proxy: &Arc<Proxy>,
    mut res: Response,
    io: ClientIo,
) -> Result<(), ProxyError> {
    let name = upgrade_type(&res.headers).unwrap_or_else(|| "upgrade".to_string());
    let Some(duplex) = res.body.take().into_upgrade() else {
        tracing::error!("switching-protocols response without a tunnelable body");
        return Err(ProxyError::Close);
    };

    let (read_half, write_half) = tokio::io::split(duplex);
    tunnel(
        proxy,
        &name,
        &res,
        io,
        Box::new(write_half),
        TunnelReader::Io(Box::new(read_half)),
    )
    .await?;
    Err(ProxyError::Close)
}

async fn tunnel(
    proxy: &Arc<Proxy>,
    name: &str,
    res: &Response,
    client: ClientIo,
    mut server_writer: Box<dyn AsyncWrite + Send + Unpin>,
    server_reader: TunnelReader,
) -> Result<(), ProxyError> {
    let (mut stream, buffered) = client.into_parts();

    let mut head = Vec::with_capacity(128);
    write_response_head(res, &mut head);
    stream.write_all(&head).await?;
    stream.flush().await?;

    if !buffered.is_empty() {
        server_writer.write_all(&buffered).await?;
    }

    let (client_read, mut client_write) = tokio::io::split(stream);

    let outbound = async {
        copy_stream(client_read, &mut server_writer, &proxy.pool).await;
        half_close(&mut server_writer, "outbound", name).await;
        tracing::debug!(name, "outbound tunnel finished copying");
    };
    let inbound = async {
        server_reader.copy_to(&mut client_write, &proxy.pool).await;
        half_close(&mut client_write, "inbound", name).await;
        tracing::debug!(name, "inbound tunnel finished copying");
    };

    tracing::debug!(name, "switched protocols, proxying traffic");
    tokio::join!(outbound, inbound);
    tracing::debug!(name, "closed tunnel");
    Ok(())
}

async fn half_close<W: AsyncWrite + Unpin>(writer: &mut W, direction: &str, name: &str) {
    if let Err(error) = writer.shutdown().await {
        tracing::debug!(%error, direction, name, "cannot close write side of tunnel");
    }
}

async fn copy_stream(
    mut reader: impl AsyncRead + Unpin,
    writer: &mut (impl AsyncWrite + Unpin),
    pool: &BufferPool,
) {
    let mut buf = pool.acquire();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(read) => {
                if let Err(error) = writer.write_all(&buf[..read]).await {
                    tracing::error!(%error, "failed to copy tunnel");
                    return;
                }
            }
            Err(error) => {
                if error.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::error!(%error, "failed to copy tunnel");
                }
                return;
            }
        }
    }
}

enum TunnelReader {
    Io(Box<dyn AsyncRead + Send + Unpin>),
    Body(BodyStream),
}

impl TunnelReader {
    fn from_body(body: Body) -> Self {
        match body {
            Body::Empty => Self::Io(Box::new(tokio::io::empty())),
            Body::Full(bytes) => Self::Io(Box::new(std::io::Cursor::new(bytes))),
            Body::Stream(stream) => Self::Body(stream),
            Body::Upgrade(duplex) => Self::Io(Box::new(duplex)),
        }
    }

    async fn copy_to(self, writer: &mut (impl AsyncWrite + Unpin), pool: &BufferPool) {
        match self {
            Self::Io(reader) => copy_stream(reader, writer, pool).await,
            Self::Body(mut body) => loop {
                match body.next_chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(error) = writer.write_all(&chunk).await {
                            tracing::error!(%error, "failed to copy tunnel");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(error) => {
                        if error.kind() != io::ErrorKind::UnexpectedEof {
                            tracing::error!(%error, "failed to copy tunnel");
                        }
                        return;
                    }
                }
            },
        }
    }
}
