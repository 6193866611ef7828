#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use warden_http::{Request, Response};
use warden_pipeline::{ModifierError, RequestModifier, ResponseModifier};
use warden_proxy::{Context, MitmConfig, Proxy, RoundTripper};

pub async fn start_proxy(
    proxy: Proxy,
) -> (
    SocketAddr,
    Arc<Proxy>,
    tokio::task::JoinHandle<io::Result<()>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let proxy = Arc::new(proxy);
    let handle = tokio::spawn(Arc::clone(&proxy).serve(listener));
    (addr, proxy, handle)
}

pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut data = Vec::new();
    let mut buf = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buf).await.expect("read head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
    }
    String::from_utf8_lossy(&data).to_string()
}

pub fn header_value(head: &str, name: &str) -> Option<String> {
    for line in head.split("\r\n").skip(1) {
        if let Some((candidate, value)) = line.split_once(':') {
            if candidate.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

pub fn content_length(head: &str) -> usize {
    header_value(head, "content-length")
        .map(|value| value.parse::<usize>().expect("valid content-length"))
        .unwrap_or(0)
}

pub async fn read_to_end_lossy<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buf[..read]),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                break;
            }
            Err(error) => panic!("read to end: {error}"),
        }
    }
    out
}

type StubHandler = dyn Fn(&mut Request) -> io::Result<Response> + Send + Sync;

pub struct StubRoundTripper {
    handler: Box<StubHandler>,
}

impl StubRoundTripper {
    pub fn new(
        handler: impl Fn(&mut Request) -> io::Result<Response> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
        })
    }
}

#[async_trait]
impl RoundTripper for StubRoundTripper {
    async fn round_trip(&self, _ctx: &Arc<Context>, req: &mut Request) -> io::Result<Response> {
        (self.handler)(req)
    }
}

#[derive(Default, Clone)]
pub struct RecordingModifier {
    pub requests: Arc<Mutex<Vec<(String, String, String)>>>,
    pub responses: Arc<Mutex<Vec<u16>>>,
}

impl RecordingModifier {
    pub fn observed_requests(&self) -> Vec<(String, String, String)> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn observed_responses(&self) -> Vec<u16> {
        self.responses.lock().expect("responses lock").clone()
    }
}

impl RequestModifier for RecordingModifier {
    fn modify_request(&self, req: &mut Request) -> Result<(), ModifierError> {
        self.requests.lock().expect("requests lock").push((
            req.method.clone(),
            req.url.scheme().to_string(),
            req.url.host_str().unwrap_or_default().to_string(),
        ));
        Ok(())
    }
}

impl ResponseModifier for RecordingModifier {
    fn modify_response(&self, res: &mut Response) -> Result<(), ModifierError> {
        self.responses.lock().expect("responses lock").push(res.status);
        Ok(())
    }
}

pub struct FailingModifier(pub &'static str);

impl RequestModifier for FailingModifier {
    fn modify_request(&self, _req: &mut Request) -> Result<(), ModifierError> {
        Err(self.0.into())
    }
}

impl ResponseModifier for FailingModifier {
    fn modify_response(&self, _res: &mut Response) -> Result<(), ModifierError> {
        Err(self.0.into())
    }
}

pub struct TestMitm {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl TestMitm {
    pub fn new() -> Arc<Self> {
        let ca_key = KeyPair::generate().expect("generate CA key");

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, "warden test CA");
        params.distinguished_name = distinguished_name;

        let ca_cert = params.self_signed(&ca_key).expect("self-sign CA");
        let ca_cert_der = ca_cert.der().clone();
        let issuer = Issuer::new(params, ca_key);

        Arc::new(Self {
            issuer,
            ca_cert_der,
            failures: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.ca_cert_der.clone())
            .expect("add CA root");
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    pub fn handshake_failures(&self) -> Vec<String> {
        self.failures.lock().expect("failures lock").clone()
    }
}

impl MitmConfig for TestMitm {
    fn server_config(&self, host: &str) -> io::Result<Arc<ServerConfig>> {
        let leaf_key = KeyPair::generate().map_err(io::Error::other)?;
        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(io::Error::other)?;
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params.subject_alt_names.push(SanType::DnsName(
                host.try_into().map_err(io::Error::other)?,
            ));
        }

        let leaf_cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(io::Error::other)?;
        let chain = vec![leaf_cert.der().clone(), self.ca_cert_der.clone()];
        let private_key =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .map_err(io::Error::other)?;
        Ok(Arc::new(config))
    }

    fn handshake_failure(&self, host: &str, error: &io::Error) {
        self.failures
            .lock()
            .expect("failures lock")
            .push(format!("{host}: {error}"));
    }
}
