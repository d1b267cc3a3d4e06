//! The outbound HTTP capability.
//!
//! Jobs never talk to a socket directly; they receive an implementation of
//! [`HttpConnection`] and perform whole request/response exchanges through
//! it, checking in for cancellation and reporting transfer progress as the
//! body streams. The real implementation keeps one persistent HTTP/1.1
//! connection per instance (one instance per HTTP pool worker), established
//! lazily and re-established when the peer goes away. The mock
//! implementation replays a script of expected exchanges, for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::errors::{labels, Error, ErrorKind, Result};
use crate::job::{Job, JobContext};
use crate::pool::Executor;
use crate::progress::{CheckIn, ProgressReporter};
use crate::value::{Blob, Value};
use crate::codec;

/// An outbound HTTP request.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Blob,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Blob::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: Blob) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = body;
        request
    }

    pub fn put(url: impl Into<String>, body: Blob) -> Self {
        let mut request = Self::new(Method::PUT, url);
        request.body = body;
        request
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response, body fully collected.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Blob,
}

impl HttpResponse {
    pub fn with_status(status: u16, body: Blob) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn ok(body: Blob) -> Self {
        Self::with_status(200, body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decodes the body as JSON into a dynamic value.
    pub fn parse_json_body(&self) -> Result<Value> {
        codec::parse_json_value(self.body.as_slice())
    }

    /// Decodes the body as MessagePack into a dynamic value.
    pub fn parse_msgpack_body(&self) -> Result<Value> {
        codec::msgpack_to_value(self.body.as_slice())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.body.as_slice()).into_owned()
    }
}

/// The capability jobs use to reach the network.
pub trait HttpConnection: Send {
    /// Performs one exchange. Fails with `Transport` on network trouble,
    /// `Protocol` when the remote answers with an error status, and
    /// `Canceled` when a check-in observes cancellation mid-transfer.
    fn perform_request(
        &mut self,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
        request: &HttpRequest,
    ) -> Result<HttpResponse>;
}

struct Endpoint {
    host: String,
    port: u16,
    sender: SendRequest<Full<Bytes>>,
}

/// A single persistent HTTP/1.1 connection.
///
/// Owned by one HTTP pool worker and reused across that worker's jobs. The
/// connection task is driven by a private current-thread runtime, since
/// pool workers are plain OS threads.
pub struct PersistentHttpConnection {
    runtime: tokio::runtime::Runtime,
    endpoint: Option<Endpoint>,
}

impl PersistentHttpConnection {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| transport_error(&e))?;
        Ok(Self {
            runtime,
            endpoint: None,
        })
    }
}

fn transport_error(error: &dyn std::fmt::Display) -> Error {
    Error::new(ErrorKind::Transport).with_info(labels::SYSTEM_ERROR, error)
}

fn split_url(raw: &str) -> Result<(String, u16, String)> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| transport_error(&e).with_info(labels::INTERNAL_MESSAGE, raw))?;
    if parsed.scheme() != "http" {
        return Err(transport_error(&"unsupported URL scheme").with_info(
            labels::INTERNAL_MESSAGE,
            parsed.scheme(),
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| transport_error(&"URL has no host"))?
        .to_owned();
    let port = parsed.port_or_known_default().unwrap_or(80);
    let mut target = parsed.path().to_owned();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }
    Ok((host, port, target))
}

impl HttpConnection for PersistentHttpConnection {
    fn perform_request(
        &mut self,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
        request: &HttpRequest,
    ) -> Result<HttpResponse> {
        check_in.check_in()?;
        reporter.report(0.0);
        let (host, port, target) = split_url(&request.url)?;

        // A kept-alive connection may have been closed by the peer since the
        // last exchange, so one transparent reconnect is allowed before the
        // failure surfaces.
        let mut reused = self
            .endpoint
            .as_ref()
            .is_some_and(|e| e.host == host && e.port == port);
        loop {
            if self
                .endpoint
                .as_ref()
                .is_none_or(|e| e.host != host || e.port != port)
            {
                self.endpoint = Some(self.connect(host.clone(), port)?);
            }
            let sender = &mut self.endpoint.as_mut().unwrap().sender;
            match self
                .runtime
                .block_on(exchange(sender, request, &host, &target, check_in, reporter))
            {
                Ok(response) => {
                    reporter.report(1.0);
                    if response.status >= 400 {
                        return Err(Error::new(ErrorKind::Protocol)
                            .with_info(labels::HTTP_STATUS, response.status)
                            .with_info(labels::RESPONSE_BODY, response.text()));
                    }
                    return Ok(response);
                }
                Err(error) => {
                    self.endpoint = None;
                    if error.kind() == ErrorKind::Transport && reused {
                        reused = false;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }
}

impl PersistentHttpConnection {
    fn connect(&self, host: String, port: u16) -> Result<Endpoint> {
        self.runtime.block_on(async {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| transport_error(&e).with_info(labels::INTERNAL_MESSAGE, &host))?;
            let io = TokioIo::new(stream);
            let (sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io)
                .await
                .map_err(|e| transport_error(&e))?;
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    tracing::debug!("HTTP connection task ended: {err}");
                }
            });
            Ok(Endpoint { host, port, sender })
        })
    }
}

async fn exchange(
    sender: &mut SendRequest<Full<Bytes>>,
    request: &HttpRequest,
    host: &str,
    target: &str,
    check_in: &dyn CheckIn,
    reporter: &dyn ProgressReporter,
) -> Result<HttpResponse> {
    let mut builder = hyper::Request::builder()
        .method(request.method.clone())
        .uri(target)
        .header(http::header::HOST, host);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let outgoing = builder
        .body(Full::new(request.body.clone().into_bytes()))
        .map_err(|e| transport_error(&e))?;

    let response = sender
        .send_request(outgoing)
        .await
        .map_err(|e| transport_error(&e))?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(n, v)| {
            (
                n.as_str().to_owned(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let total: Option<u64> = response
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(frame) = body.frame().await {
        check_in.check_in()?;
        let frame = frame.map_err(|e| transport_error(&e))?;
        if let Some(chunk) = frame.data_ref() {
            collected.extend_from_slice(chunk);
            if let Some(total) = total.filter(|t| *t > 0) {
                reporter.report((collected.len() as f64 / total as f64).min(1.0) as f32);
            }
        }
    }
    Ok(HttpResponse {
        status,
        headers,
        body: Blob::from(collected),
    })
}

/// One expected request and the response to script for it.
#[derive(Clone, Debug)]
pub struct MockHttpExchange {
    pub request: HttpRequest,
    pub response: HttpResponse,
}

pub type MockHttpScript = Vec<MockHttpExchange>;

/// A scripted HTTP session shared by every mock connection in a test.
///
/// The script is consumed front to back. A request that does not match the
/// next expected exchange still receives that exchange's response, but the
/// session remembers that the script ran out of order.
pub struct MockHttpSession {
    script: Mutex<VecDeque<MockHttpExchange>>,
    in_order: AtomicBool,
}

impl MockHttpSession {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            in_order: AtomicBool::new(true),
        }
    }

    pub fn with_script(script: MockHttpScript) -> Self {
        let session = Self::new();
        session.set_script(script);
        session
    }

    pub fn set_script(&self, script: MockHttpScript) {
        *self.script.lock() = script.into();
        self.in_order.store(true, Ordering::Release);
    }

    /// Have all scripted exchanges been executed?
    pub fn is_complete(&self) -> bool {
        self.script.lock().is_empty()
    }

    /// Has the script been executed in order so far?
    pub fn is_in_order(&self) -> bool {
        self.in_order.load(Ordering::Acquire)
    }
}

impl Default for MockHttpSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection that answers from a [`MockHttpSession`] script.
pub struct MockHttpConnection {
    session: Arc<MockHttpSession>,
}

impl MockHttpConnection {
    pub fn new(session: Arc<MockHttpSession>) -> Self {
        Self { session }
    }
}

impl HttpConnection for MockHttpConnection {
    fn perform_request(
        &mut self,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
        request: &HttpRequest,
    ) -> Result<HttpResponse> {
        check_in.check_in()?;
        reporter.report(0.0);
        let exchange = self
            .session
            .script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::internal("request arrived past the end of the mock script"))?;
        if exchange.request != *request {
            self.session.in_order.store(false, Ordering::Release);
        }
        reporter.report(1.0);
        Ok(exchange.response)
    }
}

/// The executor HTTP pool workers run: it owns the worker's connection and
/// lends it to each job.
pub struct HttpRequestExecutor {
    connection: Box<dyn HttpConnection>,
}

impl HttpRequestExecutor {
    pub fn new(connection: Box<dyn HttpConnection>) -> Self {
        Self { connection }
    }

    pub fn with_real_connection() -> Result<Self> {
        Ok(Self::new(Box::new(PersistentHttpConnection::new()?)))
    }
}

impl Executor for HttpRequestExecutor {
    fn run(
        &mut self,
        job: &mut dyn Job,
        check_in: &dyn CheckIn,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        job.execute(&mut JobContext {
            check_in,
            reporter,
            connection: Some(self.connection.as_mut()),
        })
    }
}
