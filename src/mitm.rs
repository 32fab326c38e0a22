//! HTTPS interception proxy.
//!
//! A TCP proxy that answers CONNECT and plain HTTP, terminates TLS with leaf
//! certificates issued from a locally configured CA, and pairs each
//! intercepted request with its response into a transaction. The CA material
//! is read from a directory (`ca-cert.pem` + `ca-key.pem`); generating and
//! trusting the CA is the cert collaborator's job, never this module's.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use http::uri::Scheme;
use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::hyper::{Request, Response};
use hudsucker::rcgen::{CertificateParams, KeyPair};
use hudsucker::{Body, HttpContext, HttpHandler, Proxy, RequestOrResponse};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Serialize, Serializer};
use tokio::sync::oneshot;

use crate::config;
use crate::dissect::http::Headers;
use crate::error::AppError;

fn ser_base64<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine as _;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
}

/// An intercepted request; the body is intact regardless of on-wire
/// segmentation because the proxy terminates the connection.
#[derive(Debug, Clone, Serialize)]
pub struct HttpsRequest {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub headers: Headers,
    #[serde(serialize_with = "ser_base64")]
    pub body: Vec<u8>,
    pub timestamp: f64,
    pub is_https: bool,
}

/// An intercepted response.
#[derive(Debug, Clone, Serialize)]
pub struct HttpsResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    #[serde(serialize_with = "ser_base64")]
    pub body: Vec<u8>,
    pub timestamp: f64,
}

/// A completed request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct HttpsTransaction {
    pub request: HttpsRequest,
    pub response: Option<HttpsResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// Joins intercepted requests and responses by flow identity.
///
/// Each proxied connection is one flow; requests queue FIFO per flow and a
/// response dequeues the oldest. A response with no pending request is logged
/// and discarded.
pub struct TransactionAssembler {
    pending: Mutex<HashMap<u64, VecDeque<HttpsRequest>>>,
    next_flow: AtomicU64,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_flow: AtomicU64::new(0),
        }
    }

    pub fn new_flow(&self) -> u64 {
        self.next_flow.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_request(&self, flow: u64, request: HttpsRequest) {
        self.pending
            .lock()
            .unwrap()
            .entry(flow)
            .or_default()
            .push_back(request);
    }

    /// Pair a response with the oldest pending request on its flow.
    pub fn on_response(&self, flow: u64, response: HttpsResponse) -> Option<HttpsTransaction> {
        let request = self
            .pending
            .lock()
            .unwrap()
            .get_mut(&flow)
            .and_then(VecDeque::pop_front);
        match request {
            Some(request) => {
                let duration_ms = (response.timestamp - request.timestamp) * 1000.0;
                Some(HttpsTransaction {
                    request,
                    response: Some(response),
                    duration_ms: Some(duration_ms),
                })
            }
            None => {
                tracing::warn!("No matching request for response on flow {flow}, discarding");
                None
            }
        }
    }

    pub fn forget_flow(&self, flow: u64) {
        self.pending.lock().unwrap().remove(&flow);
    }

    pub fn pending_count(&self, flow: u64) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(&flow)
            .map_or(0, VecDeque::len)
    }
}

impl Default for TransactionAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for the interception proxy.
#[derive(Debug, Clone)]
pub struct MitmConfig {
    pub port: u16,
    /// Directory holding `ca-cert.pem` and `ca-key.pem`.
    pub ca_dir: PathBuf,
    /// Skip upstream certificate validation. Off by default; only for
    /// debugging targets with broken chains.
    pub ssl_insecure: bool,
}

impl MitmConfig {
    pub fn new(port: u16, ca_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            ca_dir: ca_dir.into(),
            ssl_insecure: false,
        }
    }
}

type OnTransaction = Arc<dyn Fn(HttpsTransaction) + Send + Sync>;

/// Manages the proxy thread for one interception session.
pub struct MitmEngine {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MitmEngine {
    /// Load the CA, bind the port, and start the proxy on a dedicated
    /// thread. A missing CA or an occupied port rejects the start.
    pub fn start<F>(config: MitmConfig, on_transaction: F) -> Result<Self, AppError>
    where
        F: Fn(HttpsTransaction) + Send + Sync + 'static,
    {
        let ca = load_ca(&config.ca_dir)?;
        let client = build_upstream_client(config.ssl_insecure)?;
        if config.ssl_insecure {
            tracing::warn!("ssl_insecure enabled: upstream certificates are NOT validated");
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
        // Bind once, here, so an occupied port surfaces as a start error;
        // the listener itself is handed to the proxy.
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| AppError::Proxy(format!("cannot bind {addr}: {e}")))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let handler = InterceptHandler {
            assembler: Arc::new(TransactionAssembler::new()),
            on_transaction: Arc::new(on_transaction) as OnTransaction,
            flow_id: None,
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("procshark-mitm".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to build proxy runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!("Failed to adopt proxy listener: {e}");
                            return;
                        }
                    };
                    let proxy = Proxy::builder()
                        .with_listener(listener)
                        .with_client(client)
                        .with_ca(ca)
                        .with_http_handler(handler)
                        .with_graceful_shutdown(async {
                            shutdown_rx.await.ok();
                        })
                        .build();
                    tracing::info!("Interception proxy listening on {addr}");
                    if let Err(e) = proxy.start().await {
                        tracing::error!("Interception proxy exited: {e}");
                    }
                });
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Tell the event loop to stop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::info!("Interception proxy stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for MitmEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Load the signing CA from `ca-cert.pem` + `ca-key.pem` in `dir`.
fn load_ca(dir: &std::path::Path) -> Result<RcgenAuthority, AppError> {
    let cert_path = dir.join("ca-cert.pem");
    let key_path = dir.join("ca-key.pem");
    let cert_pem = std::fs::read_to_string(&cert_path)
        .map_err(|e| AppError::Io(format!("CA certificate {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read_to_string(&key_path)
        .map_err(|e| AppError::Io(format!("CA key {}: {e}", key_path.display())))?;

    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| AppError::Proxy(format!("invalid CA key: {e}")))?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| AppError::Proxy(format!("invalid CA certificate: {e}")))?
        .self_signed(&key_pair)
        .map_err(|e| AppError::Proxy(format!("cannot rebuild CA certificate: {e}")))?;

    Ok(RcgenAuthority::new(
        key_pair,
        ca_cert,
        config::MITM_CERT_CACHE,
    ))
}

/// Upstream HTTP client; validates server certificates against the native
/// roots unless `insecure` is set.
fn build_upstream_client(
    insecure: bool,
) -> Result<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>, AppError> {
    let https = if insecure {
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Proxy(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build()
    } else {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| AppError::Proxy(format!("no native root store: {e}")))?
            .https_or_http()
            .enable_http1()
            .build()
    };
    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// Accepts every upstream certificate. Installed only with `ssl_insecure`.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Cloned per proxied connection; the connection is the flow identity.
#[derive(Clone)]
struct InterceptHandler {
    assembler: Arc<TransactionAssembler>,
    on_transaction: OnTransaction,
    flow_id: Option<u64>,
}

impl HttpHandler for InterceptHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // CONNECT passes through; the proxy terminates TLS and re-enters this
        // handler with the decrypted requests.
        if req.method() == http::Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let flow = match self.flow_id {
            Some(flow) => flow,
            None => {
                let flow = self.assembler.new_flow();
                self.flow_id = Some(flow);
                flow
            }
        };

        let method = req.method().to_string();
        let url = reconstruct_url(&req);
        let is_https = req.uri().scheme() == Some(&Scheme::HTTPS);
        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get("host")
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let headers = extract_headers(req.headers());

        let (parts, body) = req.into_parts();
        let body_bytes = collect_body(body).await;

        tracing::debug!("Intercepted request: {method} {url}");
        self.assembler.on_request(
            flow,
            HttpsRequest {
                method,
                url,
                host,
                path,
                headers,
                body: body_bytes.clone(),
                timestamp: epoch_now(),
                is_https,
            },
        );

        RequestOrResponse::Request(Request::from_parts(parts, bytes_body(body_bytes)))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let (parts, body) = res.into_parts();
        let body_bytes = collect_body(body).await;
        let response = HttpsResponse {
            status: parts.status.as_u16(),
            reason: parts
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers: extract_headers(&parts.headers),
            body: body_bytes.clone(),
            timestamp: epoch_now(),
        };

        match self.flow_id {
            Some(flow) => {
                if let Some(txn) = self.assembler.on_response(flow, response) {
                    tracing::debug!(
                        "Transaction: {} {} -> {}",
                        txn.request.method,
                        txn.request.url,
                        txn.response.as_ref().map_or(0, |r| r.status)
                    );
                    (self.on_transaction)(txn);
                }
            }
            None => tracing::warn!("Response on a flow with no request, discarding"),
        }

        Response::from_parts(parts, bytes_body(body_bytes))
    }
}

fn reconstruct_url(req: &Request<Body>) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    // Inside a CONNECT tunnel the URI is just a path; rebuild from Host.
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{host}{path}")
}

fn extract_headers(headers: &http::HeaderMap) -> Headers {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

async fn collect_body(body: Body) -> Vec<u8> {
    use http_body_util::BodyExt as _;
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.len() > config::STREAM_BUFFER_CAP {
                bytes[..config::STREAM_BUFFER_CAP].to_vec()
            } else {
                bytes.to_vec()
            }
        }
        Err(_) => Vec::new(),
    }
}

fn bytes_body(data: Vec<u8>) -> Body {
    let bytes: bytes::Bytes = data.into();
    Body::from(http_body_util::Full::new(bytes))
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
