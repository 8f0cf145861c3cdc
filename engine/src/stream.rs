use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HttpError, Result};

/// A dialed connection, plain or TLS, behind a single type so the rest of
/// the engine never has to branch on scheme after connect time.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Whether ALPN negotiated `h2` on this connection (always false for
    /// plain transports; `enable_h2c` labeling is handled by the caller).
    pub fn negotiated_h2(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.get_ref().1.alpn_protocol() == Some(b"h2"),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Resolves `host` to its address list via the system resolver and returns
/// the first entry, matching the source's "pick the first address" policy.
/// Bypassed entirely when the caller supplied a literal `conn_ip`.
pub async fn resolve(host: &str, port: u16) -> Result<(IpAddr, Duration)> {
    let start = Instant::now();
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| HttpError::dns(format!("failed to resolve {host}: {e}")))?;
    let elapsed = start.elapsed();
    match addrs.next() {
        Some(addr) => Ok((addr.ip(), elapsed)),
        None => Err(HttpError::dns(format!("no addresses found for {host}"))),
    }
}

/// Dials a raw TCP connection, bounded by both `timeout` and `cancel`.
pub async fn dial_tcp(ip: IpAddr, port: u16, timeout: Duration, cancel: &CancellationToken) -> Result<(TcpStream, Duration)> {
    let start = Instant::now();
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(HttpError::Connection(std::io::Error::from(std::io::ErrorKind::Interrupted))),
        res = tokio::time::timeout(timeout, TcpStream::connect((ip, port))) => {
            match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(HttpError::Connection(e)),
                Err(_) => return Err(HttpError::timeout(format!("dial to {ip}:{port} timed out"))),
            }
        }
    };
    Ok((stream, start.elapsed()))
}

/// Performs a TLS client handshake over an already-dialed TCP stream.
///
/// When `server_name` is `None` (the caller set `disable_sni`), the peer's
/// literal IP is used as the `ServerName` instead: rustls only emits the SNI
/// extension for DNS-name identities, so an IP-address identity reaches the
/// server with no SNI at all, which is the behavior `disable_sni` asks for.
pub async fn tls_handshake(
    tcp: TcpStream,
    tls_config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
    peer_ip: IpAddr,
    cancel: &CancellationToken,
) -> Result<(TlsStream<TcpStream>, Duration)> {
    let name = server_name.unwrap_or(ServerName::IpAddress(rustls::pki_types::IpAddr::from(peer_ip)));
    let connector = TlsConnector::from(tls_config);
    let start = Instant::now();
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(HttpError::tls("handshake cancelled")),
        res = connector.connect(name, tcp) => {
            res.map_err(|e| HttpError::tls(format!("TLS handshake failed: {e}")))?
        }
    };
    Ok((stream, start.elapsed()))
}

/// Upstream proxy scheme. SOCKS5 URLs are accepted (parsed) but full SOCKS5
/// negotiation is out of scope, matching the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

/// Parses a `proxy_url` of the form `http://host:port` or `socks5://host:port`.
/// No general-purpose URL crate is in the dependency stack for this, since
/// only these two schemes are ever meaningful here.
pub fn parse_proxy_url(url: &str) -> Result<ProxyTarget> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| HttpError::proxy(format!("invalid proxy URL: {url}")))?;
    let scheme = match scheme {
        "http" => ProxyScheme::Http,
        "socks5" => ProxyScheme::Socks5,
        other => return Err(HttpError::proxy(format!("unsupported proxy scheme: {other}"))),
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| HttpError::proxy(format!("proxy URL missing port: {url}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| HttpError::proxy(format!("invalid proxy port: {port}")))?;
    if host.is_empty() {
        return Err(HttpError::proxy(format!("proxy URL missing host: {url}")));
    }
    Ok(ProxyTarget { scheme, host: host.to_string(), port })
}

/// Sends `CONNECT host:port HTTP/1.1` over an established proxy TCP
/// connection and waits for a success response. On success the same TCP
/// stream is returned, ready for a TLS handshake to the real target.
pub async fn connect_tunnel(
    mut tcp: TcpStream,
    target_host: &str,
    target_port: u16,
    read_timeout: Duration,
) -> Result<TcpStream> {
    let request = format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n");
    tokio::time::timeout(read_timeout, tcp.write_all(request.as_bytes()))
        .await
        .map_err(|_| HttpError::timeout("CONNECT request write timed out"))?
        .map_err(|e| HttpError::proxy(format!("CONNECT write failed: {e}")))?;

    let mut reader = BufReader::new(&mut tcp);
    let mut status_line = String::new();
    tokio::time::timeout(read_timeout, reader.read_line(&mut status_line))
        .await
        .map_err(|_| HttpError::timeout("CONNECT response read timed out"))?
        .map_err(|e| HttpError::proxy(format!("CONNECT read failed: {e}")))?;

    if !status_line.contains("200") {
        return Err(HttpError::proxy(format!(
            "CONNECT tunnel rejected: {}",
            status_line.trim()
        )));
    }
    debug!(status = %status_line.trim(), "CONNECT tunnel established");

    loop {
        let mut header_line = String::new();
        let n = tokio::time::timeout(read_timeout, reader.read_line(&mut header_line))
            .await
            .map_err(|_| HttpError::timeout("CONNECT header read timed out"))?
            .map_err(|e| HttpError::proxy(format!("CONNECT read failed: {e}")))?;
        if n == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    Ok(tcp)
}

/// Outcome of a liveness probe: whether the connection is alive, and a byte
/// the probe may have actually consumed off the wire (only possible for TLS
/// transports, which have no peek primitive — see [`probe_liveness`]).
pub struct Liveness {
    pub alive: bool,
    pub consumed_byte: Option<u8>,
}

/// Coarse liveness probe: a 1-byte read with a 1ms deadline. A timeout means
/// no data has arrived yet (alive); EOF or any other read error means dead.
///
/// Plain TCP uses `peek`, which never consumes data. `tokio-rustls` exposes
/// no peek primitive, so the TLS path does a real read and reports the
/// consumed byte back to the caller, which must push it back in front of
/// the next read on this connection (see [`Seeded`]) so a byte that
/// legitimately arrived is not silently dropped.
pub async fn probe_liveness(transport: &mut Transport) -> Liveness {
    match transport {
        Transport::Plain(s) => {
            let mut buf = [0u8; 1];
            match tokio::time::timeout(Duration::from_millis(1), s.peek(&mut buf)).await {
                Ok(Ok(0)) => Liveness { alive: false, consumed_byte: None },
                Ok(Ok(_)) => Liveness { alive: true, consumed_byte: None },
                Ok(Err(_)) => Liveness { alive: false, consumed_byte: None },
                Err(_) => Liveness { alive: true, consumed_byte: None },
            }
        }
        Transport::Tls(s) => {
            let mut buf = [0u8; 1];
            match tokio::time::timeout(Duration::from_millis(1), s.read(&mut buf)).await {
                Ok(Ok(0)) => Liveness { alive: false, consumed_byte: None },
                Ok(Ok(_)) => Liveness { alive: true, consumed_byte: Some(buf[0]) },
                Ok(Err(_)) => Liveness { alive: false, consumed_byte: None },
                Err(_) => Liveness { alive: true, consumed_byte: None },
            }
        }
    }
}

/// Serves a single pushed-back byte before delegating reads to `inner`.
/// Writes pass straight through. Used to replay a byte the liveness probe
/// consumed from a TLS connection that turned out to still be alive.
pub struct Seeded<'a> {
    pub byte: Option<u8>,
    pub inner: &'a mut Transport,
}

impl AsyncRead for Seeded<'_> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if let Some(b) = self.byte.take() {
            buf.put_slice(&[b]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Seeded<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_proxy_url() {
        let target = parse_proxy_url("http://proxy.example:8080").expect("parses");
        assert_eq!(target.scheme, ProxyScheme::Http);
        assert_eq!(target.host, "proxy.example");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn parses_socks5_proxy_url() {
        let target = parse_proxy_url("socks5://127.0.0.1:1080").expect("parses");
        assert_eq!(target.scheme, ProxyScheme::Socks5);
        assert_eq!(target.port, 1080);
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(parse_proxy_url("ftp://proxy:21").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_proxy_url("http://proxy.example").is_err());
    }
}
