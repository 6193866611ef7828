use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::ServerConfig;
use warden_http::BoxedDuplex;

pub trait MitmConfig: Send + Sync {
    fn server_config(&self, host: &str) -> io::Result<Arc<ServerConfig>>;

    fn handshake_failure(&self, _host: &str, _error: &io::Error) {}

    fn h2_passthrough(&self) -> Option<Arc<dyn H2Passthrough>> {
        None
    }
}

#[async_trait]
pub trait H2Passthrough: Send + Sync {
    async fn proxy(&self, conn: BoxedDuplex, host: &str) -> io::Result<()>;
}
