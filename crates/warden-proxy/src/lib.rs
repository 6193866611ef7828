mod client;
mod dial;
mod error;
mod handler;
mod mitm;
mod proxy;
mod session;
mod upstream;

pub use client::{default_tls_config, HttpTransport, RoundTripper};
pub use dial::{Dialer, TcpDialer};
pub use error::{is_closeable_io, ProxyError};
pub use mitm::{H2Passthrough, MitmConfig};
pub use proxy::{ErrorResponseFunc, Proxy, UpstreamProxyFunc, MAX_HEAD_BYTES};
pub use session::{ClientIo, Context, Session};
