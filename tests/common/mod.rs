//! Shared utilities for integration testing.
//!
//! Provides a generated certificate, a proxy bound to an ephemeral port, a
//! scriptable plaintext upstream and a raw HTTP/1.1-over-TLS client.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tls_edge_proxy::config::ProxyConfig;
use tls_edge_proxy::lifecycle::{self, Shutdown};
use tls_edge_proxy::net::listener::ListenerError;

pub const SERVER_NAME: &str = "localhost";

/// How long a test waits for any single network step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A self-signed certificate written to temporary PEM files.
pub struct TestCert {
    pub cert_der: CertificateDer<'static>,
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
}

impl TestCert {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut cert_file, certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut key_file, certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        Self {
            cert_der: certified.cert.der().clone(),
            cert_file,
            key_file,
        }
    }

    pub fn cert_path(&self) -> String {
        self.cert_file.path().display().to_string()
    }

    pub fn key_path(&self) -> String {
        self.key_file.path().display().to_string()
    }
}

/// Proxy configuration bound to an ephemeral local port.
pub fn test_config(cert: &TestCert, upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.tls.cert_path = cert.cert_path();
    config.tls.key_path = cert.key_path();
    config.upstream.address = upstream.to_string();
    config.timeouts.connect_secs = 2;
    config.timeouts.handshake_secs = 2;
    config.timeouts.shutdown_grace_secs = 1;
    config
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A running proxy.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cert: TestCert,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), ListenerError>>,
}

impl TestProxy {
    pub async fn start(config: ProxyConfig, cert: TestCert) -> Self {
        let server = lifecycle::start(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.run(shutdown.subscribe()));

        Self {
            addr,
            cert,
            shutdown,
            handle,
        }
    }

    /// Start a proxy with default settings in front of `upstream`.
    pub async fn in_front_of(upstream: SocketAddr) -> Self {
        let cert = TestCert::generate();
        let config = test_config(&cert, upstream);
        Self::start(config, cert).await
    }

    /// Connect with a client trusting the proxy certificate.
    pub async fn connect(&self) -> TestClient {
        let versions = [&rustls::version::TLS12, &rustls::version::TLS13];
        self.try_connect(client_config(&self.cert, &versions, None))
            .await
            .unwrap()
    }

    /// Connect with a specific client configuration.
    pub async fn try_connect(&self, config: ClientConfig) -> io::Result<TestClient> {
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(self.addr).await?;
        let server_name = ServerName::try_from(SERVER_NAME).unwrap();
        let tls = tokio::time::timeout(STEP_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
        Ok(TestClient {
            stream: BufReader::new(tls),
        })
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

/// A client configuration trusting `cert`, limited to `versions` and optionally `suites`.
pub fn client_config(
    cert: &TestCert,
    versions: &[&'static SupportedProtocolVersion],
    suites: Option<Vec<SupportedCipherSuite>>,
) -> ClientConfig {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(suites) = suites {
        provider.cipher_suites = suites;
    }

    let mut roots = RootCertStore::empty();
    roots.add(cert.cert_der.clone()).unwrap();

    ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read header lines up to the blank line.
async fn read_head<R>(reader: &mut R) -> io::Result<Option<(String, Vec<(String, String)>)>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut first = String::new();
    if reader.read_line(&mut first).await? == 0 {
        return Ok(None);
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(Some((first.trim_end().to_string(), headers)))
}

fn content_length(headers: &[(String, String)]) -> usize {
    find_header(headers, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    find_header(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Read a body framed by `Content-Length` or chunked transfer coding.
async fn read_body<R>(reader: &mut R, headers: &[(String, String)]) -> io::Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    if !is_chunked(headers) {
        let mut body = vec![0u8; content_length(headers)];
        reader.read_exact(&mut body).await?;
        return Ok(body);
    }

    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let size = line.trim_end().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size.trim(), 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if size == 0 {
            // Trailers, up to the blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 || trailer.trim_end().is_empty() {
                    return Ok(body);
                }
            }
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}

/// Raw HTTP/1.1 client over a TLS connection to the proxy.
pub struct TestClient {
    stream: BufReader<TlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.get_mut().write_all(raw).await.unwrap();
        self.stream.get_mut().flush().await.unwrap();
    }

    /// Send a request and read its response.
    pub async fn request(&mut self, raw: &str) -> TestResponse {
        self.send(raw.as_bytes()).await;
        self.read_response().await
    }

    /// Read one response with a `Content-Length` or chunked body (or none).
    pub async fn read_response(&mut self) -> TestResponse {
        let (status_line, headers) = tokio::time::timeout(STEP_TIMEOUT, read_head(&mut self.stream))
            .await
            .unwrap()
            .unwrap()
            .expect("connection closed before a response");

        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();

        let body = tokio::time::timeout(STEP_TIMEOUT, read_body(&mut self.stream, &headers))
            .await
            .unwrap()
            .unwrap();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(STEP_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    /// Read until the proxy closes the connection.
    pub async fn read_until_closed(&mut self) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return received,
                Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
                Err(_) => panic!("connection still open after {STEP_TIMEOUT:?}"),
            }
        }
    }

    /// Whether the proxy closed the connection (EOF or a reset).
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}

/// A request as seen by the mock upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Index of the upstream connection this request arrived on.
    pub connection: u64,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }
}

/// What the mock upstream does with a request.
pub enum Reply {
    /// Write these bytes as the response and keep the connection.
    Http(Vec<u8>),
    /// Answer `101 Switching Protocols`, then echo every byte back.
    UpgradeEcho,
    /// Answer `101 Switching Protocols`, then close the connection.
    UpgradeClose,
    /// Close the connection without answering.
    Close,
}

/// Build a `200 OK` response carrying `body`.
pub fn ok(body: &[u8]) -> Reply {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    Reply::Http(response)
}

/// Build a `200 OK` response sending each of `chunks` as one chunk.
pub fn chunked(chunks: &[&[u8]]) -> Reply {
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n"
            .to_vec();
    for chunk in chunks {
        response.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        response.extend_from_slice(chunk);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n\r\n");
    Reply::Http(response)
}

/// A scriptable plaintext HTTP/1.1 upstream.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    connections: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU64::new(0));
        let handler = Arc::new(handler);

        let handle = {
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let requests = Arc::clone(&requests);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _ = serve_mock(socket, index, requests, handler).await;
                    });
                }
            })
        };

        Self {
            addr,
            requests,
            connections,
            handle,
        }
    }

    /// An upstream that answers every request with `200 OK` and `body`.
    pub async fn fixed(body: &'static [u8]) -> Self {
        Self::start(move |_| ok(body)).await
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_mock<F>(
    socket: TcpStream,
    index: u64,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handler: Arc<F>,
) -> io::Result<()>
where
    F: Fn(&RecordedRequest) -> Reply,
{
    let mut reader = BufReader::new(socket);

    while let Some((request_line, headers)) = read_head(&mut reader).await? {
        let body = read_body(&mut reader, &headers).await?;

        let request = RecordedRequest {
            request_line,
            headers,
            body,
            connection: index,
        };
        requests.lock().unwrap().push(request.clone());

        match handler(&request) {
            Reply::Http(response) => {
                reader.get_mut().write_all(&response).await?;
            }
            Reply::UpgradeEcho => {
                let upgrade = request.header("upgrade").unwrap_or("websocket").to_string();
                let head = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: {upgrade}\r\nConnection: Upgrade\r\n\r\n"
                );
                reader.get_mut().write_all(head.as_bytes()).await?;

                let mut buf = vec![0u8; 1024];
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    reader.get_mut().write_all(&buf[..n]).await?;
                }
            }
            Reply::UpgradeClose => {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
                    .await?;
                return reader.get_mut().shutdown().await;
            }
            Reply::Close => return Ok(()),
        }
    }
    Ok(())
}
