use proptest::prelude::*;

use warden_http::{read_request_head, BodyFraming, BodyStream, BoxedDuplex, BufferedStream};

fn run_async<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
        .block_on(future)
}

fn header_value() -> impl Strategy<Value = String> {
    "[0-9A-Za-z !#$%&'()*+,./;=?@_~-]{0,64}".prop_map(|s| s.trim().to_string())
}

proptest! {
    #[test]
    fn request_head_roundtrips_arbitrary_header_values(value in header_value()) {
        let wire = format!(
            "GET /p HTTP/1.1\r\nHost: example.com\r\nX-Probe: {value}\r\n\r\n"
        );
        let parsed = run_async(async move {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            tokio::io::AsyncWriteExt::write_all(&mut client, wire.as_bytes())
                .await
                .expect("write");
            let mut io = BufferedStream::new(Box::new(server) as BoxedDuplex);
            read_request_head(&mut io, 64 * 1024, false).await
        });
        let (request, _) = parsed.expect("parse").expect("present");
        let observed = request
            .headers
            .get("x-probe")
            .map(|v| v.to_str().expect("ascii").to_string())
            .unwrap_or_default();
        prop_assert_eq!(observed, value);
    }

    #[test]
    fn chunked_bodies_decode_to_original_payload(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..512),
            0..8,
        )
    ) {
        let mut wire = Vec::new();
        let mut expected = Vec::new();
        for chunk in &chunks {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
            expected.extend_from_slice(chunk);
        }
        wire.extend_from_slice(b"0\r\n\r\n");

        let decoded = run_async(async move {
            let (mut client, server) = tokio::io::duplex(1024 * 1024);
            tokio::io::AsyncWriteExt::write_all(&mut client, &wire)
                .await
                .expect("write");
            let io = BufferedStream::new(Box::new(server) as BoxedDuplex);
            let mut body = BodyStream::new(io, BodyFraming::Chunked);
            body.collect().await
        })
        .expect("decode");
        prop_assert_eq!(decoded.as_ref(), expected.as_slice());
    }
}
