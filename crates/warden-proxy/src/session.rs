use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_http::{BoxedDuplex, BufferedStream, Request};

use crate::error::ProxyError;

pub type ClientIo = BufferedStream<BoxedDuplex>;

pub struct Session {
    remote_addr: SocketAddr,
    secure: AtomicBool,
    hijacked: AtomicBool,
    transport: Mutex<Option<ClientIo>>,
}

impl Session {
    pub(crate) fn new(io: ClientIo, remote_addr: SocketAddr, secure: bool) -> Arc<Self> {
        Arc::new(Self {
            remote_addr,
            secure: AtomicBool::new(secure),
            hijacked: AtomicBool::new(false),
            transport: Mutex::new(Some(io)),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Relaxed)
    }

    pub fn mark_secure(&self) {
        self.secure.store(true, Ordering::Relaxed);
    }

    pub fn hijacked(&self) -> bool {
        self.hijacked.load(Ordering::Relaxed)
    }

    pub fn hijack(&self) -> Result<ClientIo, ProxyError> {
        let mut slot = self
            .transport
            .lock()
            .expect("session transport lock poisoned");
        if self.hijacked.load(Ordering::Acquire) {
            return Err(ProxyError::AlreadyHijacked);
        }
        let io = slot.take().ok_or(ProxyError::TransportUnavailable)?;
        self.hijacked.store(true, Ordering::Release);
        Ok(io)
    }

    pub(crate) fn take_transport(&self) -> Option<ClientIo> {
        self.transport
            .lock()
            .expect("session transport lock poisoned")
            .take()
    }

    pub(crate) fn restore_transport(&self, io: ClientIo) {
        let mut slot = self
            .transport
            .lock()
            .expect("session transport lock poisoned");
        *slot = Some(io);
    }
}

type ValueMap = HashMap<String, Box<dyn Any + Send + Sync>>;

pub struct Context {
    session: Arc<Session>,
    values: Mutex<ValueMap>,
    skip_round_trip: AtomicBool,
    skip_logging: AtomicBool,
    api_request: AtomicBool,
    auth_id: Mutex<Option<String>>,
    round_trip_duration: Mutex<Option<Duration>>,
}

impl Context {
    pub(crate) fn new(session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            session,
            values: Mutex::new(HashMap::new()),
            skip_round_trip: AtomicBool::new(false),
            skip_logging: AtomicBool::new(false),
            api_request: AtomicBool::new(false),
            auth_id: Mutex::new(None),
            round_trip_duration: Mutex::new(None),
        })
    }

    pub fn of(req: &Request) -> Option<Arc<Context>> {
        req.extensions.get::<Arc<Context>>().cloned()
    }

    pub(crate) fn attach(self: &Arc<Self>, req: &mut Request) {
        req.extensions.insert(Arc::clone(self));
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn set(&self, key: impl Into<String>, value: Box<dyn Any + Send + Sync>) {
        self.values
            .lock()
            .expect("context values lock poisoned")
            .insert(key.into(), value);
    }

    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.values
            .lock()
            .expect("context values lock poisoned")
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn skip_round_trip(&self) {
        self.skip_round_trip.store(true, Ordering::Relaxed);
    }

    pub fn skipping_round_trip(&self) -> bool {
        self.skip_round_trip.load(Ordering::Relaxed)
    }

    pub fn skip_logging(&self) {
        self.skip_logging.store(true, Ordering::Relaxed);
    }

    pub fn skipping_logging(&self) -> bool {
        self.skip_logging.load(Ordering::Relaxed)
    }

    pub fn set_api_request(&self) {
        self.api_request.store(true, Ordering::Relaxed);
    }

    pub fn is_api_request(&self) -> bool {
        self.api_request.load(Ordering::Relaxed)
    }

    pub fn set_auth_id(&self, id: impl Into<String>) {
        let mut slot = self.auth_id.lock().expect("context auth lock poisoned");
        *slot = Some(id.into());
    }

    pub fn auth_id(&self) -> Option<String> {
        self.auth_id
            .lock()
            .expect("context auth lock poisoned")
            .clone()
    }

    pub(crate) fn record_round_trip_duration(&self, duration: Duration) {
        let mut slot = self
            .round_trip_duration
            .lock()
            .expect("context duration lock poisoned");
        *slot = Some(duration);
    }

    pub fn round_trip_duration(&self) -> Option<Duration> {
        *self
            .round_trip_duration
            .lock()
            .expect("context duration lock poisoned")
    }
}
