//! Connection manager (C4) and event dispatcher (C5) fused into the body of
//! one tokio task per accepted client (§5): there is no shared registry to
//! consult for the plain `GET`/forward-other paths, only the cache (the one
//! genuine cross-task singleton, held in [`Shared`]).

use crate::cache::Cache;
use crate::config::ConnectMode;
use crate::errors::ProxyError;
use crate::framer::{self, Extracted, Method, RequestHead, ResponseHead};
use crate::limits::ProxyLimits;
use crate::stream::ProxyStream;
use crate::tls::TlsIdentity;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_rustls::TlsStream;
use tracing::{debug, info, warn};

/// Resources shared across every connection task.
pub struct Shared {
    pub cache: Mutex<Cache>,
    pub limits: ProxyLimits,
    pub connect_mode: ConnectMode,
    pub tls_identity: Option<Arc<TlsIdentity>>,
}

impl Shared {
    pub fn new(
        limits: ProxyLimits,
        connect_mode: ConnectMode,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        Self {
            cache: Mutex::new(Cache::new(limits.cache_capacity)),
            limits,
            connect_mode,
            tls_identity: tls_identity.map(Arc::new),
        }
    }
}

/// Whether a newly opened origin connection for this request should be
/// wrapped in TLS — true only while inside an already-intercepted MITM
/// `CONNECT` tunnel (§4.4).
#[derive(Clone)]
enum OriginTls {
    Plain,
    Mitm(Arc<TlsIdentity>),
}

/// Entry point: handles one accepted client connection end to end.
pub async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<Shared>) {
    let client = ProxyStream::Plain(stream);
    if let Err(err) = run_connection(client, peer_addr, &shared, OriginTls::Plain).await {
        debug!(%peer_addr, error = %err, "connection closed");
    }
}

/// The per-connection request loop (§4.5 `handle_ready`, role = client).
/// Returns a boxed future so the MITM `CONNECT` path can recurse into a
/// fresh instance of this loop running over the now-decrypted streams.
fn run_connection<'a>(
    mut client: ProxyStream,
    peer_addr: SocketAddr,
    shared: &'a Shared,
    origin_tls: OriginTls,
) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        let mut buf = Vec::new();

        loop {
            let Some((head, raw)) = read_one_request(&mut client, &mut buf, shared, &origin_tls).await? else {
                return Ok(());
            };

            debug!(
                %peer_addr,
                tls = client.is_tls(),
                method = ?head.method,
                host = %String::from_utf8_lossy(&head.hostname),
                "dispatching request"
            );

            match head.method {
                Method::Get => get_path(&mut client, &head, &raw, shared, &origin_tls).await?,
                Method::Connect => {
                    connect_path(client, peer_addr, &head, shared).await?;
                    return Ok(());
                }
                Method::Other => {
                    forward_other_path(&mut client, &head, &raw, shared, &origin_tls).await?
                }
            }
        }
    })
}

/// Get-path (§4.5): cache hit and fresh replies from the cache; otherwise
/// the request is forwarded and, on a complete response, the entry is
/// installed.
async fn get_path(
    client: &mut ProxyStream,
    head: &RequestHead,
    raw: &[u8],
    shared: &Shared,
    origin_tls: &OriginTls,
) -> Result<(), ProxyError> {
    let key = cache_key(&head.hostname, &head.url);

    let hit = { shared.cache.lock().await.get(&key) };
    if let Some(hit) = hit {
        let with_age = framer::insert_before_terminator(&hit.value, format!("Age: {}\r\n", hit.age).as_bytes());
        client.write_all(&with_age).await?;
        info!(key = %String::from_utf8_lossy(&key), age = hit.age, "cache hit");
        return Ok(());
    }

    match fetch_from_origin(&head.hostname, head.port, origin_tls, raw, shared).await {
        Ok(Some((resp_head, resp_raw))) => {
            client.write_all(&resp_raw).await?;
            shared.cache.lock().await.put(&key, resp_raw, resp_head.max_age);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) if !err.is_fatal_for_pair() => {
            warn!(key = %String::from_utf8_lossy(&key), error = %err, "origin request aborted, client connection continues");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Forward-other path (§4.5): opaque forward, no cache key attached.
async fn forward_other_path(
    client: &mut ProxyStream,
    head: &RequestHead,
    raw: &[u8],
    shared: &Shared,
    origin_tls: &OriginTls,
) -> Result<(), ProxyError> {
    match fetch_from_origin(&head.hostname, head.port, origin_tls, raw, shared).await {
        Ok(Some((_, resp_raw))) => {
            client.write_all(&resp_raw).await?;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) if !err.is_fatal_for_pair() => {
            warn!(error = %err, "origin request aborted, client connection continues");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Connects to the origin, writes the forwarded request, and reads back the
/// complete response. Shared by the get-path and forward-other path so both
/// can apply the same §4.4 resource-exhaustion-is-not-cascading-for-the-pair
/// handling around it.
async fn fetch_from_origin(
    hostname: &[u8],
    port: u16,
    origin_tls: &OriginTls,
    raw: &[u8],
    shared: &Shared,
) -> Result<Option<(ResponseHead, Vec<u8>)>, ProxyError> {
    let mut origin = connect_origin(hostname, port, origin_tls).await?;
    origin.write_all(raw).await?;
    read_full_response(&mut origin, shared).await
}

/// Connect-path (§4.4): opaque tunnel or MITM, depending on configuration.
/// Consumes `client` since both branches either hand it to a bidirectional
/// relay or rewrap it as a TLS stream.
async fn connect_path(
    client: ProxyStream,
    peer_addr: SocketAddr,
    head: &RequestHead,
    shared: &Shared,
) -> Result<(), ProxyError> {
    const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

    match &shared.connect_mode {
        ConnectMode::OpaqueTunnel => {
            let mut origin = TcpStream::connect((hostname_str(&head.hostname)?, head.port)).await?;
            let mut client = client;
            client.write_all(ESTABLISHED).await?;

            info!(%peer_addr, host = %String::from_utf8_lossy(&head.hostname), "opaque tunnel established");
            tokio::io::copy_bidirectional(&mut client, &mut origin).await?;
            Ok(())
        }
        ConnectMode::Mitm { .. } => {
            let identity = shared
                .tls_identity
                .clone()
                .expect("tls identity loaded whenever MITM mode is configured");

            let mut tcp_client = match client {
                ProxyStream::Plain(tcp) => tcp,
                ProxyStream::Tls(_) => {
                    return Err(ProxyError::ResourceExhausted("nested CONNECT inside a tunnel"))
                }
            };
            tcp_client.write_all(ESTABLISHED).await?;

            let tls_client = identity.acceptor().accept(tcp_client).await?;
            let wrapped_client = ProxyStream::Tls(TlsStream::from(tls_client));

            info!(%peer_addr, host = %String::from_utf8_lossy(&head.hostname), "MITM tunnel established");
            run_connection(wrapped_client, peer_addr, shared, OriginTls::Mitm(identity)).await
        }
    }
}

async fn connect_origin(
    hostname: &[u8],
    port: u16,
    origin_tls: &OriginTls,
) -> Result<ProxyStream, ProxyError> {
    let host = hostname_str(hostname)?;
    let tcp = TcpStream::connect((host, port)).await?;

    match origin_tls {
        OriginTls::Plain => Ok(ProxyStream::Plain(tcp)),
        OriginTls::Mitm(identity) => {
            let name = crate::tls::server_name(hostname)?;
            let tls = identity.connector().connect(name, tcp).await?;
            Ok(ProxyStream::Tls(TlsStream::from(tls)))
        }
    }
}

fn hostname_str(hostname: &[u8]) -> Result<&str, ProxyError> {
    std::str::from_utf8(hostname).map_err(|_| ProxyError::ResourceExhausted("non-utf8 hostname"))
}

fn cache_key(hostname: &[u8], url: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(hostname.len() + url.len());
    key.extend_from_slice(hostname);
    key.extend_from_slice(url);
    key
}

async fn read_one_request(
    client: &mut ProxyStream,
    buf: &mut Vec<u8>,
    shared: &Shared,
    origin_tls: &OriginTls,
) -> Result<Option<(RequestHead, Vec<u8>)>, ProxyError> {
    // A `GET` with no explicit `Host` port defaults to 443 once we're inside
    // an already-intercepted MITM tunnel, 80 otherwise (§4.1).
    let default_port: u16 = match origin_tls {
        OriginTls::Plain => 80,
        OriginTls::Mitm(_) => 443,
    };

    loop {
        if let Extracted::Complete(pair) = framer::extract_first_request(buf, default_port)? {
            return Ok(Some(pair));
        }

        if buf.len() > shared.limits.max_buffer_bytes {
            return Err(ProxyError::ResourceExhausted("client buffer cap exceeded"));
        }

        match read_chunk(client, shared.limits.read_chunk_size, shared.limits.idle_timeout).await {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(ProxyError::PeerClosed) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

async fn read_full_response(
    origin: &mut ProxyStream,
    shared: &Shared,
) -> Result<Option<(ResponseHead, Vec<u8>)>, ProxyError> {
    let mut buf = Vec::new();
    let mut chunked = false;

    loop {
        if let Extracted::Complete(pair) = framer::extract_first_response(&mut buf, &mut chunked)? {
            return Ok(Some(pair));
        }

        if buf.len() > shared.limits.max_buffer_bytes {
            return Err(ProxyError::ResourceExhausted("origin buffer cap exceeded"));
        }

        match read_chunk(origin, shared.limits.read_chunk_size, shared.limits.idle_timeout).await {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(ProxyError::PeerClosed) => {
                if !buf.is_empty() {
                    warn!("origin closed mid-response");
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Reads up to `chunk_size` bytes, racing the read against the idle
/// timeout (grounded in the teacher's own `write_bytes` read/sleep race).
/// A zero-byte read is an orderly peer close, surfaced as
/// `Err(ProxyError::PeerClosed)` rather than folded into the success case,
/// so callers can tell it apart from "more data is coming".
async fn read_chunk(
    stream: &mut ProxyStream,
    chunk_size: usize,
    idle: Duration,
) -> Result<Vec<u8>, ProxyError> {
    let mut chunk = vec![0u8; chunk_size];

    let n = tokio::select! {
        biased;

        result = stream.read(&mut chunk) => result?,
        _ = sleep(idle) => {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "idle timeout",
            )))
        }
    };

    if n == 0 {
        Err(ProxyError::PeerClosed)
    } else {
        chunk.truncate(n);
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectMode;
    use std::time::Duration as StdDuration;
    use tokio::net::TcpListener;

    fn test_shared() -> Arc<Shared> {
        Arc::new(Shared::new(
            ProxyLimits::default(),
            ConnectMode::OpaqueTunnel,
            None,
        ))
    }

    /// Loops `accept`, spawning `handle_client` per connection — the same
    /// shape as `main.rs`'s real accept loop — so a test can drive more than
    /// one client connection through a single proxy instance.
    async fn spawn_proxy(shared: Arc<Shared>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(handle_client(stream, peer, shared.clone()));
            }
        });
        addr
    }

    /// Accepts any number of sequential connections, replying once on each
    /// with `response` after the request's blank-line terminator arrives.
    async fn spawn_looping_origin(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        let mut chunk = [0u8; 256];
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let _ = stream.write_all(response).await;
                });
            }
        });
        port
    }

    /// A single-shot TCP echo, standing in for an opaque `CONNECT` target.
    async fn spawn_echo_origin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await.unwrap();
            let _ = stream.write_all(&chunk[..n]).await;
        });
        port
    }

    async fn read_until_ends_with(client: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before suffix {suffix:?} was seen");
            response.extend_from_slice(&chunk[..n]);
            if response.ends_with(suffix) {
                return response;
            }
        }
    }

    #[tokio::test]
    async fn get_miss_then_hit_end_to_end() {
        let origin_response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\nhello";
        let origin_port = spawn_looping_origin(origin_response).await;
        let proxy_addr = spawn_proxy(test_shared()).await;

        let request = format!("GET /index.html HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n");

        // First request on its own connection: a miss, forwarded verbatim.
        let mut first = TcpStream::connect(proxy_addr).await.unwrap();
        first.write_all(request.as_bytes()).await.unwrap();
        let miss_response = read_until_ends_with(&mut first, b"hello").await;
        assert_eq!(miss_response, origin_response);

        // Second request on a brand new client connection: must be served
        // from the cache, with an `Age:` header spliced in (§4.2), rather
        // than hitting the origin again.
        let mut second = TcpStream::connect(proxy_addr).await.unwrap();
        second.write_all(request.as_bytes()).await.unwrap();
        let hit_response = read_until_ends_with(&mut second, b"hello").await;

        assert_ne!(hit_response, origin_response);
        assert!(hit_response.windows(5).any(|w| w == b"Age: "));
        assert!(hit_response.ends_with(b"hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_entry_is_refetched_from_origin() {
        let origin_response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\nhello";
        let origin_port = spawn_looping_origin(origin_response).await;
        let proxy_addr = spawn_proxy(test_shared()).await;

        let request = format!("GET /index.html HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n");

        let mut first = TcpStream::connect(proxy_addr).await.unwrap();
        first.write_all(request.as_bytes()).await.unwrap();
        let first_response = read_until_ends_with(&mut first, b"hello").await;
        assert_eq!(first_response, origin_response);

        tokio::time::advance(StdDuration::from_secs(61)).await;

        let mut second = TcpStream::connect(proxy_addr).await.unwrap();
        second.write_all(request.as_bytes()).await.unwrap();
        let second_response = read_until_ends_with(&mut second, b"hello").await;

        // A genuine re-fetch: byte-identical to the origin's reply, no
        // `Age:` header, proving the stale entry was evicted rather than
        // served stale.
        assert_eq!(second_response, origin_response);
    }

    #[tokio::test]
    async fn chunked_response_is_forwarded_end_to_end() {
        let origin_response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let origin_port = spawn_looping_origin(origin_response).await;
        let proxy_addr = spawn_proxy(test_shared()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!("GET /chunked HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_until_ends_with(&mut client, b"0\r\n\r\n").await;
        assert_eq!(response, origin_response);
    }

    #[tokio::test]
    async fn connect_opaque_tunnel_relays_bytes_end_to_end() {
        const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

        let echo_port = spawn_echo_origin().await;
        let proxy_addr = spawn_proxy(test_shared()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let connect_req =
            format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n");
        client.write_all(connect_req.as_bytes()).await.unwrap();

        let established = read_until_ends_with(&mut client, ESTABLISHED).await;
        assert_eq!(established, ESTABLISHED);

        client.write_all(b"ping").await.unwrap();
        let echoed = read_until_ends_with(&mut client, b"ping").await;
        assert_eq!(echoed, b"ping");
    }
}
