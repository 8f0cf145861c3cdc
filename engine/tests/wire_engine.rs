//! End-to-end exercises against local TCP/TLS fixture servers, matching the
//! concrete scenarios documented for the wire engine: exact byte/status/body
//! preservation, chunked framing, timeouts, pooling, proxy+TLS, and the
//! body-size cap.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use wire_engine::{ErrorKind, Options, Scheme, Sender};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

async fn pick_listener() -> TestResult<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

fn localhost_opts(port: u16, scheme: Scheme) -> Options {
    Options {
        scheme,
        host: "localhost".into(),
        port,
        conn_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ..Default::default()
    }
}

async fn drain_request_headers<S>(reader: &mut tokio::io::BufReader<S>) -> TestResult<()>
where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn plain_get_returns_exact_bytes_and_metadata() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, World!";
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(stream);
        let _ = drain_request_headers(&mut reader).await;
        let _ = reader.get_mut().write_all(response).await;
    });

    let sender = Sender::new();
    let opts = localhost_opts(addr.port(), Scheme::Http);
    let cancel = CancellationToken::new();
    let resp = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await?;

    assert_eq!(resp.status_code, 200);
    assert_eq!(&resp.body[..], b"Hello, World!");
    assert_eq!(&resp.raw[..], response);
    assert_eq!(resp.protocol, "HTTP/1.1");
    assert!(resp.timing.total > Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn chunked_response_preserves_wire_bytes() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    let response: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n, World\r\n1\r\n!\r\n0\r\n\r\n";
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(stream);
        let _ = drain_request_headers(&mut reader).await;
        let _ = reader.get_mut().write_all(response).await;
    });

    let sender = Sender::new();
    let opts = localhost_opts(addr.port(), Scheme::Http);
    let cancel = CancellationToken::new();
    let resp = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await?;

    assert_eq!(&resp.raw[..], response);
    let text = String::from_utf8_lossy(&resp.raw);
    assert!(text.contains("chunked"));
    assert!(text.contains("5\r\n"));
    // `project` slices the body verbatim off `raw`; it does not decode
    // chunked framing, so the captured body is still chunk-encoded.
    assert_eq!(&resp.body[..], b"5\r\nHello\r\n7\r\n, World\r\n1\r\n!\r\n0\r\n\r\n");
    Ok(())
}

#[tokio::test]
async fn read_timeout_with_no_response() -> TestResult<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (listener, addr) = pick_listener().await?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(stream);
        let _ = drain_request_headers(&mut reader).await;
        sleep(Duration::from_secs(2)).await;
        // Never writes a response; the connection just sits open.
        drop(reader);
    });

    let sender = Sender::new();
    let opts = Options {
        read_timeout: Some(Duration::from_millis(500)),
        ..localhost_opts(addr.port(), Scheme::Http)
    };
    let cancel = CancellationToken::new();
    let err = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    Ok(())
}

#[tokio::test]
async fn connection_reuse_across_three_requests() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(stream);
        for _ in 0..3 {
            if drain_request_headers(&mut reader).await.is_err() {
                break;
            }
            if reader.get_mut().write_all(response).await.is_err() {
                break;
            }
        }
    });

    let sender = Sender::new();
    let opts = Options { reuse_connection: Some(true), ..localhost_opts(addr.port(), Scheme::Http) };
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let resp = sender
            .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
            .await?;
        assert_eq!(resp.status_code, 200);
    }

    // Give the final park a moment to land before inspecting (no direct pool
    // accessor is exposed on Sender; the pool's own unit tests cover the
    // exact-one-idle-entry invariant, so here the property under test is
    // that all three exchanges observed the single accepted connection).
    sleep(Duration::from_millis(20)).await;
    Ok(())
}

fn self_signed_tls_config(alpn: &[&str]) -> TestResult<Arc<ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

#[tokio::test]
async fn https_via_http_proxy_with_alpn_h2() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    let tls_config = self_signed_tls_config(&["h2"])?;
    let acceptor = TlsAcceptor::from(tls_config);
    let http_response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut plain = BufReader::new(stream);
        let _ = drain_request_headers(&mut plain).await;
        let mut tcp = plain.into_inner();
        let _ = tcp.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let tls_stream = match acceptor.accept(tcp).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut reader = BufReader::new(tls_stream);
        let _ = drain_request_headers(&mut reader).await;
        let _ = reader.get_mut().write_all(http_response).await;
    });

    let sender = Sender::new();
    let opts = Options {
        force_http2: true,
        insecure_skip_verify: true,
        proxy_url: Some(format!("http://127.0.0.1:{}", addr.port())),
        ..localhost_opts(443, Scheme::Https)
    };
    let cancel = CancellationToken::new();
    let resp = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await?;

    assert_eq!(resp.protocol, "HTTP/2");
    assert_eq!(resp.status_code, 200);
    assert!(resp.timing.proxy_connect > Duration::ZERO);
    assert!(resp.timing.tls_handshake > Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn body_cap_trip_discards_connection() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\n\r\n";
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(stream);
        let _ = drain_request_headers(&mut reader).await;
        let _ = reader.get_mut().write_all(response).await;
        // Never actually sends the declared body; the cap should trip
        // before the engine attempts to read it.
    });

    let sender = Sender::new();
    let opts = Options {
        body_mem_limit: Some(4 * 1024 * 1024),
        reuse_connection: Some(true),
        ..localhost_opts(addr.port(), Scheme::Http)
    };
    let cancel = CancellationToken::new();
    let err = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BodyTooLarge);
    Ok(())
}

#[tokio::test]
async fn connect_refused_yields_connection_error() -> TestResult<()> {
    let (listener, addr) = pick_listener().await?;
    drop(listener);

    let sender = Sender::new();
    let opts = localhost_opts(addr.port(), Scheme::Http);
    let cancel = CancellationToken::new();
    let err = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    Ok(())
}

#[tokio::test]
async fn invalid_proxy_url_yields_proxy_error() -> TestResult<()> {
    let sender = Sender::new();
    let opts = Options {
        proxy_url: Some("not-a-url".into()),
        ..localhost_opts(8080, Scheme::Http)
    };
    let cancel = CancellationToken::new();
    let err = sender
        .do_request(&cancel, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Proxy);
    Ok(())
}
