use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use warden_conn::{NoopTracker, Tracker};
use warden_http::BoxedDuplex;

use crate::error::timeout_error;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedDuplex>;
}

pub struct TcpDialer {
    connect_timeout: Duration,
    tracker: Arc<dyn Tracker>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, tracker: Arc<dyn Tracker>) -> Self {
        Self {
            connect_timeout,
            tracker,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Arc::new(NoopTracker))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedDuplex> {
        let connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timeout_error("upstream connect"))
            .and_then(|result| result);
        self.tracker.record_dial(addr, connected.is_ok());
        let stream = connected?;
        Ok(Box::new(stream))
    }
}
