use std::net::IpAddr;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HttpError, Result};
use crate::framing;
use crate::options::Options;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::response::{self, Response, Timing};
use crate::stream::{self, ProxyScheme, Seeded, Transport};

/// Ties DNS resolution, dialing, TLS, the connection pool, and the framing
/// reader together into a single request/response exchange.
pub struct Sender {
    pool: ConnectionPool,
}

impl Sender {
    pub fn new() -> Self {
        // rustls needs a process-wide default crypto provider; installing
        // it is idempotent and safe to call from every Sender.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { pool: ConnectionPool::new() }
    }

    /// Sends `raw` verbatim to the peer described by `opts` and returns the
    /// response bytes plus parsed projections. `cancel` governs DNS/dial/TLS
    /// only; read/write deadlines from `opts` govern the rest of the
    /// exchange (see DESIGN.md open-question (a)).
    pub async fn do_request(&self, cancel: &CancellationToken, raw: &[u8], opts: &Options) -> Result<Response> {
        let start = Instant::now();
        let mut opts = opts.clone();
        opts.set_defaults();

        let mut timing = Timing::default();

        let ip = match opts.conn_ip {
            Some(ip) => ip,
            None => {
                let (ip, dns_dur) = stream::resolve(&opts.host, opts.port).await?;
                timing.dns_lookup = dns_dur;
                ip
            }
        };

        let key = format!("{ip}:{}", opts.port);
        let reuse = opts.reuse_connection.unwrap_or(false);

        let pooled = if reuse { self.pool.get(&key).await } else { None };

        let (mut transport, protocol, pending_byte, tls) = match pooled {
            Some(PooledConnection { transport, protocol, pending_byte, tls, .. }) => {
                debug!(%key, "reusing pooled connection");
                (transport, protocol, pending_byte, tls)
            }
            None => {
                debug!(%key, "dialing new connection");
                let dialed = self.connect(cancel, &opts, ip, &mut timing).await?;
                (dialed.transport, dialed.protocol, None, dialed.tls)
            }
        };

        let write_timeout = opts.write_timeout.expect("defaulted");
        let write_result = tokio::time::timeout(write_timeout, transport.write_all(raw)).await;
        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(HttpError::Connection(e)),
            Err(_) => return Err(HttpError::timeout("write deadline exceeded")),
        }

        let read_timeout = opts.read_timeout.expect("defaulted");
        let body_mem_limit = opts.body_mem_limit.expect("defaulted");

        let read_result = {
            let seeded = Seeded { byte: pending_byte, inner: &mut transport };
            let mut buffered = BufReader::new(seeded);
            framing::read_response(&mut buffered, read_timeout, body_mem_limit).await
        };

        let (raw_bytes, ttfb) = match read_result {
            Ok(v) => v,
            Err(e) => {
                // The connection is not pooled on any read failure.
                return Err(e);
            }
        };
        timing.ttfb = ttfb;

        let (status_code, headers, body) = response::project(&raw_bytes);
        timing.total = start.elapsed();

        let response = Response {
            raw: raw_bytes,
            status_code,
            headers,
            body,
            timing,
            connected_ip: ip,
            connected_port: opts.port,
            protocol: protocol.clone(),
        };

        if reuse {
            let conn = PooledConnection::new(transport, protocol, key.clone(), tls);
            self.pool.put(key, conn).await;
        }

        Ok(response)
    }

    /// Releases the pool: aborts the background sweep and closes every idle
    /// connection.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        opts: &Options,
        target_ip: IpAddr,
        timing: &mut Timing,
    ) -> Result<Dialed> {
        match &opts.proxy_url {
            None => self.connect_direct(cancel, opts, target_ip, timing).await,
            Some(proxy_url) => self.connect_via_proxy(cancel, opts, proxy_url, target_ip, timing).await,
        }
    }

    async fn connect_direct(
        &self,
        cancel: &CancellationToken,
        opts: &Options,
        target_ip: IpAddr,
        timing: &mut Timing,
    ) -> Result<Dialed> {
        let conn_timeout = opts.conn_timeout.expect("defaulted");
        let (tcp, tcp_dur) = stream::dial_tcp(target_ip, opts.port, conn_timeout, cancel).await?;
        timing.tcp_connect = tcp_dur;

        if opts.scheme == crate::options::Scheme::Https {
            let tls_config = opts.build_tls_config()?;
            let server_name = opts.server_name()?;
            let (tls_stream, tls_dur) =
                stream::tls_handshake(tcp, tls_config, server_name, target_ip, cancel).await?;
            timing.tls_handshake = tls_dur;
            let transport = Transport::Tls(Box::new(tls_stream));
            let protocol = if transport.negotiated_h2() { "HTTP/2" } else { "HTTP/1.1" };
            return Ok(Dialed { transport, protocol: protocol.to_string(), tls: true });
        }

        let transport = Transport::Plain(tcp);
        let protocol = if opts.enable_h2c { "HTTP/2" } else { "HTTP/1.1" };
        Ok(Dialed { transport, protocol: protocol.to_string(), tls: false })
    }

    async fn connect_via_proxy(
        &self,
        cancel: &CancellationToken,
        opts: &Options,
        proxy_url: &str,
        target_ip: IpAddr,
        timing: &mut Timing,
    ) -> Result<Dialed> {
        let proxy = stream::parse_proxy_url(proxy_url)?;
        if proxy.scheme == ProxyScheme::Socks5 {
            return Err(HttpError::proxy("SOCKS5 proxy negotiation is not implemented"));
        }

        let conn_timeout = opts.conn_timeout.expect("defaulted");
        let (proxy_ip, _dns_dur) = stream::resolve(&proxy.host, proxy.port)
            .await
            .map_err(|e| HttpError::proxy(format!("failed to resolve proxy host: {e}")))?;

        let (proxy_tcp, proxy_dur) = stream::dial_tcp(proxy_ip, proxy.port, conn_timeout, cancel)
            .await
            .map_err(|e| HttpError::proxy(format!("failed to dial proxy: {e}")))?;
        timing.proxy_connect = proxy_dur;

        let read_timeout = opts.read_timeout.expect("defaulted");

        let tcp = if opts.scheme == crate::options::Scheme::Https {
            stream::connect_tunnel(proxy_tcp, &opts.host, opts.port, read_timeout).await?
        } else {
            // For a plain HTTP target through an HTTP proxy, the caller's
            // raw request is expected to be absolute-URI form and is
            // transmitted verbatim over the proxy connection directly.
            proxy_tcp
        };

        if opts.scheme == crate::options::Scheme::Https {
            let tls_config = opts.build_tls_config()?;
            let server_name = opts.server_name()?;
            let (tls_stream, tls_dur) =
                stream::tls_handshake(tcp, tls_config, server_name, target_ip, cancel).await?;
            timing.tls_handshake = tls_dur;
            let transport = Transport::Tls(Box::new(tls_stream));
            let protocol = if transport.negotiated_h2() { "HTTP/2" } else { "HTTP/1.1" };
            return Ok(Dialed { transport, protocol: protocol.to_string(), tls: true });
        }

        let transport = Transport::Plain(tcp);
        let protocol = if opts.enable_h2c { "HTTP/2" } else { "HTTP/1.1" };
        Ok(Dialed { transport, protocol: protocol.to_string(), tls: false })
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

struct Dialed {
    transport: Transport,
    protocol: String,
    tls: bool,
}
