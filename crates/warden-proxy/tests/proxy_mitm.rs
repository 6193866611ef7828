mod support;

use std::sync::Arc;

use http::header::HeaderValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use support::{header_value, read_head, start_proxy, RecordingModifier, StubRoundTripper, TestMitm};
use warden_http::Response;
use warden_proxy::Proxy;

async fn connect_through(addr: std::net::SocketAddr, authority: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await
        .expect("write CONNECT");
    let established = read_head(&mut client).await;
    assert!(
        established.starts_with("HTTP/1.1 200 Connection Established"),
        "{established}"
    );
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mitm_decrypts_and_round_trips_as_https() {
    let mitm = TestMitm::new();
    let recorder = RecordingModifier::default();

    let mut proxy = Proxy::new();
    proxy.set_mitm(Arc::clone(&mitm) as _);
    proxy.set_request_modifier(Arc::new(recorder.clone()));
    proxy.set_round_tripper(StubRoundTripper::new(|req| {
        assert_eq!(req.url.scheme(), "https");
        let mut res = Response::synthetic(200);
        res.headers
            .insert("x-intercepted", HeaderValue::from_static("yes"));
        Ok(res)
    }));

    let (addr, proxy, _serve) = start_proxy(proxy).await;

    let client = connect_through(addr, "example.com:443").await;

    let connector = TlsConnector::from(mitm.client_config());
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector
        .connect(server_name, client)
        .await
        .expect("TLS handshake with the minted leaf");

    tls.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("write intercepted request");

    let head = read_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
    assert_eq!(header_value(&head, "x-intercepted").as_deref(), Some("yes"));

    let requests = recorder.observed_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, "CONNECT");
    assert_eq!(requests[1].0, "GET");
    assert_eq!(requests[1].1, "https");
    assert_eq!(requests[1].2, "example.com");

    proxy.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mitm_keeps_serving_requests_on_the_decrypted_stream() {
    let mitm = TestMitm::new();
    let mut proxy = Proxy::new();
    proxy.set_mitm(Arc::clone(&mitm) as _);
    proxy.set_round_tripper(StubRoundTripper::new(|req| {
        let mut res = Response::synthetic(200);
        let path = req.url.path().to_string();
        res.headers
            .insert("x-path", HeaderValue::from_str(&path).expect("path header"));
        Ok(res)
    }));

    let (addr, proxy, _serve) = start_proxy(proxy).await;
    let client = connect_through(addr, "example.com:443").await;

    let connector = TlsConnector::from(mitm.client_config());
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector.connect(server_name, client).await.expect("handshake");

    for path in ["/first", "/second", "/third"] {
        tls.write_all(
            format!("GET {path} HTTP/1.1\r\nHost: example.com\r\n\r\n").as_bytes(),
        )
        .await
        .expect("write request");
        let head = read_head(&mut tls).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
        assert_eq!(header_value(&head, "x-path").as_deref(), Some(path));
    }

    proxy.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plaintext_through_connect_is_proxied_without_tls() {
    let mitm = TestMitm::new();
    let recorder = RecordingModifier::default();
    let mut proxy = Proxy::new();
    proxy.set_mitm(Arc::clone(&mitm) as _);
    proxy.set_request_modifier(Arc::new(recorder.clone()));
    proxy.set_round_tripper(StubRoundTripper::new(|_req| Ok(Response::synthetic(200))));

    let (addr, proxy, _serve) = start_proxy(proxy).await;
    let mut client = connect_through(addr, "example.com:80").await;

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("write plaintext request");

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");

    let requests = recorder.observed_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].0, "GET");
    assert_eq!(requests[1].1, "http", "plaintext tunnel must stay http");

    proxy.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_failure_invokes_the_callback_and_closes() {
    let mitm = TestMitm::new();
    let mut proxy = Proxy::new();
    proxy.set_mitm(Arc::clone(&mitm) as _);
    proxy.set_round_tripper(StubRoundTripper::new(|_req| Ok(Response::synthetic(200))));

    let (addr, proxy, _serve) = start_proxy(proxy).await;
    let mut client = connect_through(addr, "example.com:443").await;

    client
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef])
        .await
        .expect("write bogus handshake");

    let mut buf = [0_u8; 64];
    let mut saw_eof = false;
    for _ in 0..32 {
        match client.read(&mut buf).await {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => {
                saw_eof = true;
                break;
            }
        }
    }
    assert!(saw_eof, "connection must close after a failed handshake");

    let failures = mitm.handshake_failures();
    assert_eq!(failures.len(), 1, "{failures:?}");
    assert!(failures[0].starts_with("example.com:"), "{failures:?}");

    proxy.close().await;
}
