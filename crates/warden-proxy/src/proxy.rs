use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use url::Url;

use warden_conn::{BufferPool, InstrumentedStream, Tracker};
use warden_http::{warning, BoxedDuplex, BufferedStream, Request, Response};
use warden_pipeline::{Noop, RequestModifier, ResponseModifier};

use crate::client::{default_tls_config, HttpTransport, RoundTripper};
use crate::dial::{Dialer, TcpDialer};
use crate::error::ProxyError;
use crate::handler;
use crate::mitm::MitmConfig;

pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

pub type UpstreamProxyFunc = Arc<dyn Fn(&Request) -> io::Result<Option<Url>> + Send + Sync>;

pub type ErrorResponseFunc = Arc<dyn Fn(&Request, &ProxyError) -> Response + Send + Sync>;

pub struct Proxy {
    pub(crate) allow_http: bool,
    pub(crate) connect_passthrough: bool,
    pub(crate) without_warning: bool,
    pub(crate) close_after_reply: bool,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) read_header_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) round_tripper: Arc<dyn RoundTripper>,
    custom_round_tripper: bool,
    pub(crate) upstream_proxy: Option<UpstreamProxyFunc>,
    pub(crate) error_response: Option<ErrorResponseFunc>,
    pub(crate) mitm: Option<Arc<dyn MitmConfig>>,
    tracker: Option<Arc<dyn Tracker>>,
    pub(crate) reqmod: Arc<dyn RequestModifier>,
    pub(crate) resmod: Arc<dyn ResponseModifier>,
    pub(crate) tls_client: Arc<tokio_rustls::rustls::ClientConfig>,
    pub(crate) pool: BufferPool,
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,
    conns: WaitGroup,
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxy {
    pub fn new() -> Self {
        let (closing_tx, closing_rx) = watch::channel(false);
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
        let tls_client = default_tls_config();
        let round_tripper: Arc<dyn RoundTripper> = Arc::new(HttpTransport::new(
            Arc::clone(&dialer),
            None,
            Arc::clone(&tls_client),
        ));
        Self {
            allow_http: false,
            connect_passthrough: false,
            without_warning: false,
            close_after_reply: false,
            read_timeout: None,
            read_header_timeout: None,
            write_timeout: None,
            dialer,
            round_tripper,
            custom_round_tripper: false,
            upstream_proxy: None,
            error_response: None,
            mitm: None,
            tracker: None,
            reqmod: Arc::new(Noop),
            resmod: Arc::new(Noop),
            tls_client,
            pool: BufferPool::new(),
            closing_tx,
            closing_rx,
            conns: WaitGroup::new(),
        }
    }

    pub fn set_allow_http(&mut self, allow: bool) {
        self.allow_http = allow;
    }

    pub fn set_connect_passthrough(&mut self, passthrough: bool) {
        self.connect_passthrough = passthrough;
    }

    pub fn set_without_warning(&mut self, without: bool) {
        self.without_warning = without;
    }

    pub fn set_close_after_reply(&mut self, close: bool) {
        self.close_after_reply = close;
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = some_nonzero(timeout);
    }

    pub fn set_read_header_timeout(&mut self, timeout: Duration) {
        self.read_header_timeout = some_nonzero(timeout);
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = some_nonzero(timeout);
    }

    pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
        self.dialer = dialer;
        self.rebuild_default_round_tripper();
    }

    pub fn set_round_tripper(&mut self, round_tripper: Arc<dyn RoundTripper>) {
        self.round_tripper = round_tripper;
        self.custom_round_tripper = true;
    }

    pub fn set_upstream_proxy(&mut self, proxy_url: Url) {
        self.set_upstream_proxy_func(Arc::new(move |_req| Ok(Some(proxy_url.clone()))));
    }

    pub fn set_upstream_proxy_func(&mut self, resolve: UpstreamProxyFunc) {
        self.upstream_proxy = Some(resolve);
        self.rebuild_default_round_tripper();
    }

    pub fn set_error_response(&mut self, build: ErrorResponseFunc) {
        self.error_response = Some(build);
    }

    pub fn set_mitm(&mut self, mitm: Arc<dyn MitmConfig>) {
        self.mitm = Some(mitm);
    }

    pub fn set_tracker(&mut self, tracker: Arc<dyn Tracker>) {
        self.tracker = Some(tracker);
    }

    pub fn set_request_modifier(&mut self, modifier: Arc<dyn RequestModifier>) {
        self.reqmod = modifier;
    }

    pub fn set_response_modifier(&mut self, modifier: Arc<dyn ResponseModifier>) {
        self.resmod = modifier;
    }

    fn rebuild_default_round_tripper(&mut self) {
        if self.custom_round_tripper {
            return;
        }
        self.round_tripper = Arc::new(HttpTransport::new(
            Arc::clone(&self.dialer),
            self.upstream_proxy.clone(),
            Arc::clone(&self.tls_client),
        ));
    }

    pub fn closing(&self) -> bool {
        *self.closing_rx.borrow()
    }

    pub(crate) fn closing_signal(&self) -> watch::Receiver<bool> {
        self.closing_tx.subscribe()
    }

    pub async fn close(&self) {
        tracing::debug!("closing down proxy");
        self.closing_tx.send_replace(true);
        self.conns.wait().await;
        tracing::debug!("all connections closed");
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let _accept_guard = self.conns.enter();
        let mut closing = self.closing_rx.clone();
        let mut delay = Duration::ZERO;
        loop {
            if self.closing() {
                return Ok(());
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        delay = Duration::ZERO;
                        tracing::debug!(%peer, "accepted connection");
                        configure_keep_alive(&stream);
                        self.spawn_handler(stream, peer);
                    }
                    Err(error) if is_temporary_accept_error(&error) => {
                        delay = if delay.is_zero() {
                            INITIAL_ACCEPT_BACKOFF
                        } else {
                            (delay * 2).min(MAX_ACCEPT_BACKOFF)
                        };
                        tracing::debug!(%error, ?delay, "temporary error on accept");
                        tokio::time::sleep(delay).await;
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to accept");
                        return Err(error);
                    }
                },
                _ = closing.changed() => return Ok(()),
            }
        }
    }

    fn spawn_handler(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let stream: BoxedDuplex = match &self.tracker {
            Some(tracker) => Box::new(InstrumentedStream::new(
                stream,
                peer.to_string(),
                Arc::clone(tracker),
            )),
            None => Box::new(stream),
        };
        let proxy = Arc::clone(self);
        let guard = self.conns.enter();
        tokio::spawn(async move {
            let _guard = guard;
            handler::handle_loop(proxy, stream, peer, false).await;
        });
    }

    pub async fn serve_stream(
        self: &Arc<Self>,
        stream: BoxedDuplex,
        peer: SocketAddr,
        secure: bool,
    ) {
        let _guard = self.conns.enter();
        handler::handle_loop(Arc::clone(self), stream, peer, secure).await;
    }

    pub(crate) fn error_response(&self, req: &Request, error: &ProxyError) -> Response {
        match &self.error_response {
            Some(build) => build(req, error),
            None => Response::synthetic(502),
        }
    }

    pub(crate) fn warn(&self, headers: &mut http::HeaderMap, error: &dyn std::fmt::Display) {
        if self.without_warning {
            return;
        }
        warning(headers, error);
    }

    pub(crate) fn read_header_deadline(&self) -> Option<Duration> {
        self.read_header_timeout.or(self.read_timeout)
    }

    pub(crate) fn new_session(
        &self,
        stream: BoxedDuplex,
        peer: SocketAddr,
        secure: bool,
    ) -> Arc<crate::session::Session> {
        crate::session::Session::new(BufferedStream::new(stream), peer, secure)
    }
}

fn some_nonzero(duration: Duration) -> Option<Duration> {
    if duration.is_zero() {
        None
    } else {
        Some(duration)
    }
}

fn configure_keep_alive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(KEEP_ALIVE_PERIOD);
    if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(%error, "could not enable TCP keep-alive");
    }
}

fn is_temporary_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

struct WaitGroupInner {
    count: Mutex<usize>,
    zero: Notify,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: Mutex::new(0),
                zero: Notify::new(),
            }),
        }
    }

    fn enter(&self) -> WaitGroupGuard {
        let mut count = self.inner.count.lock().expect("wait group lock poisoned");
        *count += 1;
        WaitGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    async fn wait(&self) {
        loop {
            let pending = self.inner.zero.notified();
            if *self.inner.count.lock().expect("wait group lock poisoned") == 0 {
                return;
            }
            pending.await;
        }
    }
}

struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock().expect("wait group lock poisoned");
        *count -= 1;
        if *count == 0 {
            self.inner.zero.notify_waiters();
        }
    }
}
