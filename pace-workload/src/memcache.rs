//! Memcached text-protocol transport with an HTTP view endpoint.
//!
//! Stores and fetches share one TCP connection and are serialized over it;
//! each request holds the stream for its full request/response exchange.
//! View queries go to a separate HTTP endpoint over a short-lived
//! connection per query.
//!
//! Any I/O error or timeout on the shared stream leaves it in an unknown
//! position, so the stream is dropped and the connection reports a
//! transport failure. Server-side rejections (`NOT_STORED`, `SERVER_ERROR`)
//! are per-request failures and keep the stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::{DriverConfig, Timeouts};
use crate::connection::{
    post, with_timeout, Connection, Connector, Event, EventSender, OpError, SubmitError, Token,
    TransportError,
};
use crate::document::DOCUMENT_SIZE_MAX;

/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;

/// Largest value accepted from the server: a full-size blob plus its JSON
/// envelope.
const MAX_VALUE_LEN: usize = DOCUMENT_SIZE_MAX + 1024;

type SharedStream = Arc<Mutex<Option<BufReader<TcpStream>>>>;

/// Opens connections to a memcached-compatible server.
#[derive(Debug, Clone)]
pub struct MemcacheConnector {
    endpoint: String,
    view_endpoint: Option<String>,
    bucket: String,
    timeouts: Timeouts,
}

impl MemcacheConnector {
    /// Creates a connector from the driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            view_endpoint: config.view_endpoint.clone(),
            bucket: config.bucket.clone(),
            timeouts: config.timeouts,
        }
    }
}

fn check_endpoint(endpoint: &str) -> Result<(), TransportError> {
    let invalid = |reason: &str| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok(())
}

impl Connector for MemcacheConnector {
    type Connection = MemcacheConnection;

    fn open(
        &mut self,
        generation: u64,
        events: EventSender,
    ) -> Result<MemcacheConnection, TransportError> {
        check_endpoint(&self.endpoint)?;
        if let Some(view) = &self.view_endpoint {
            check_endpoint(view)?;
        }
        Ok(MemcacheConnection {
            generation,
            endpoint: self.endpoint.clone(),
            view_endpoint: self.view_endpoint.clone(),
            bucket: self.bucket.clone(),
            timeouts: self.timeouts,
            events,
            stream: Arc::new(Mutex::new(None)),
            failed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// One memcached connection plus its view endpoint.
#[derive(Debug)]
pub struct MemcacheConnection {
    generation: u64,
    endpoint: String,
    view_endpoint: Option<String>,
    bucket: String,
    timeouts: Timeouts,
    events: EventSender,
    stream: SharedStream,
    failed: Arc<AtomicBool>,
}

/// Reports a transport failure once per connection.
#[derive(Debug, Clone)]
struct FailureReporter {
    generation: u64,
    events: EventSender,
    failed: Arc<AtomicBool>,
}

impl FailureReporter {
    fn report(&self, message: String) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!(generation = self.generation, %message, "memcached connection failed");
            post(
                &self.events,
                Event::TransportFailed {
                    generation: self.generation,
                    message,
                },
            );
        }
    }
}

impl MemcacheConnection {
    fn reporter(&self) -> FailureReporter {
        FailureReporter {
            generation: self.generation,
            events: self.events.clone(),
            failed: self.failed.clone(),
        }
    }

    fn check_usable(&self, key: &str) -> Result<(), SubmitError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        if key.is_empty()
            || key.len() > MAX_KEY_LEN
            || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(SubmitError::Invalid(format!("unusable key {key:?}")));
        }
        Ok(())
    }

    /// Runs one request/response exchange on the shared stream under
    /// `timeout`, posting `wrap(result)` when done.
    fn exchange<T, F, Fut, W>(&self, timeout: Duration, run: F, wrap: W)
    where
        T: Send + 'static,
        F: FnOnce(BufReader<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = (BufReader<TcpStream>, Result<T, OpError>)> + Send,
        W: FnOnce(Result<T, OpError>) -> Event + Send + 'static,
    {
        let stream = self.stream.clone();
        let reporter = self.reporter();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut guard = stream.lock().await;
            let Some(conn) = guard.take() else {
                post(&events, wrap(Err(OpError::Io("not connected".to_string()))));
                return;
            };

            let result = match tokio::time::timeout(timeout, run(conn)).await {
                Ok((conn, result)) => {
                    if matches!(result, Ok(_) | Err(OpError::NotFound | OpError::Rejected(_))) {
                        *guard = Some(conn);
                    } else if let Err(e) = &result {
                        reporter.report(e.to_string());
                    }
                    result
                }
                Err(_) => {
                    reporter.report(format!("request timed out after {timeout:?}"));
                    Err(OpError::Timeout(timeout))
                }
            };
            drop(guard);
            post(&events, wrap(result));
        });
    }
}

impl Connection for MemcacheConnection {
    fn connect(&mut self) -> Result<(), SubmitError> {
        let endpoint = self.endpoint.clone();
        let timeout = self.timeouts.connect();
        let stream = self.stream.clone();
        let reporter = self.reporter();
        let generation = self.generation;
        let events = self.events.clone();

        tokio::spawn(async move {
            let connected = with_timeout(timeout, async {
                TcpStream::connect(&endpoint)
                    .await
                    .map_err(|e| OpError::Io(e.to_string()))
            })
            .await;

            match connected {
                Ok(tcp) => {
                    if let Err(e) = tcp.set_nodelay(true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    *stream.lock().await = Some(BufReader::new(tcp));
                    tracing::info!(%endpoint, generation, "connected");
                    post(&events, Event::Configured { generation });
                }
                Err(e) => reporter.report(format!("connect to {endpoint} failed: {e}")),
            }
        });
        Ok(())
    }

    fn store(&mut self, token: Token, key: &str, value: Bytes) -> Result<(), SubmitError> {
        self.check_usable(key)?;
        let key = key.to_string();
        self.exchange(
            self.timeouts.store(),
            move |mut conn| async move {
                let result = set(&mut conn, &key, &value).await;
                (conn, result)
            },
            move |result| Event::Stored { token, result },
        );
        Ok(())
    }

    fn fetch(&mut self, token: Token, key: &str) -> Result<(), SubmitError> {
        self.check_usable(key)?;
        let key = key.to_string();
        self.exchange(
            self.timeouts.fetch(),
            move |mut conn| async move {
                let result = get(&mut conn, &key).await;
                (conn, result)
            },
            move |result| Event::Fetched { token, result },
        );
        Ok(())
    }

    fn query_view(&mut self, token: Token, path: &str) -> Result<(), SubmitError> {
        let Some(endpoint) = self.view_endpoint.clone() else {
            return Err(SubmitError::Invalid("no view endpoint configured".to_string()));
        };
        let path = format!("/{}{path}", self.bucket);
        let timeout = self.timeouts.view();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = with_timeout(timeout, http_get(&endpoint, &path)).await;
            post(&events, Event::Viewed { token, result });
        });
        Ok(())
    }
}

fn io_error(e: &std::io::Error) -> OpError {
    OpError::Io(e.to_string())
}

async fn read_line<S: AsyncBufRead + Unpin>(stream: &mut S) -> Result<String, OpError> {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await.map_err(|e| io_error(&e))?;
    if n == 0 {
        return Err(OpError::Io("connection closed by server".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Stores `value` under `key`.
pub(crate) async fn set<S>(stream: &mut S, key: &str, value: &[u8]) -> Result<(), OpError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let header = format!("set {key} 0 0 {}\r\n", value.len());
    stream.write_all(header.as_bytes()).await.map_err(|e| io_error(&e))?;
    stream.write_all(value).await.map_err(|e| io_error(&e))?;
    stream.write_all(b"\r\n").await.map_err(|e| io_error(&e))?;
    stream.flush().await.map_err(|e| io_error(&e))?;

    let reply = read_line(stream).await?;
    match reply.as_str() {
        "STORED" => Ok(()),
        "NOT_STORED" | "EXISTS" | "NOT_FOUND" => Err(OpError::Rejected(reply)),
        r if r.starts_with("SERVER_ERROR") || r.starts_with("CLIENT_ERROR") => {
            Err(OpError::Rejected(reply))
        }
        _ => Err(OpError::Io(format!("unexpected reply to set: {reply:?}"))),
    }
}

/// Fetches the value under `key`.
pub(crate) async fn get<S>(stream: &mut S, key: &str) -> Result<Bytes, OpError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("get {key}\r\n").as_bytes())
        .await
        .map_err(|e| io_error(&e))?;
    stream.flush().await.map_err(|e| io_error(&e))?;

    let header = read_line(stream).await?;
    if header == "END" {
        return Err(OpError::NotFound);
    }
    if header.starts_with("SERVER_ERROR") || header.starts_with("CLIENT_ERROR") {
        return Err(OpError::Rejected(header));
    }

    // VALUE <key> <flags> <bytes> [<cas>]
    let mut parts = header.split(' ');
    let len = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("VALUE"), Some(k), Some(_flags), Some(len)) if k == key => len
            .parse::<usize>()
            .map_err(|_| OpError::Io(format!("bad value length in {header:?}")))?,
        _ => return Err(OpError::Io(format!("unexpected reply to get: {header:?}"))),
    };

    if len > MAX_VALUE_LEN {
        return Err(OpError::Io(format!("value length {len} exceeds {MAX_VALUE_LEN}")));
    }
    let mut data = vec![0u8; len + 2];
    stream.read_exact(&mut data).await.map_err(|e| io_error(&e))?;
    if !data.ends_with(b"\r\n") {
        return Err(OpError::Io("value not terminated by CRLF".to_string()));
    }
    data.truncate(len);

    let end = read_line(stream).await?;
    if end != "END" {
        return Err(OpError::Io(format!("expected END, got {end:?}")));
    }
    Ok(Bytes::from(data))
}

/// Issues an HTTP/1.0 GET and returns the body of a 200 response.
async fn http_get(endpoint: &str, path: &str) -> Result<Bytes, OpError> {
    let mut tcp = TcpStream::connect(endpoint).await.map_err(|e| io_error(&e))?;
    let request =
        format!("GET {path} HTTP/1.0\r\nHost: {endpoint}\r\nAccept: application/json\r\n\r\n");
    tcp.write_all(request.as_bytes()).await.map_err(|e| io_error(&e))?;

    let mut response = Vec::new();
    tcp.read_to_end(&mut response).await.map_err(|e| io_error(&e))?;
    parse_http_response(&response)
}

/// Splits a complete HTTP response into status and body.
pub(crate) fn parse_http_response(response: &[u8]) -> Result<Bytes, OpError> {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| OpError::Io("truncated http response".to_string()))?;
    let head = std::str::from_utf8(&response[..split])
        .map_err(|_| OpError::Io("non-utf8 http header".to_string()))?;
    let status_line = head.lines().next().unwrap_or_default();

    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|_| status_line.starts_with("HTTP/1."))
        .ok_or_else(|| OpError::Io(format!("bad status line {status_line:?}")))?;

    if status != 200 {
        return Err(OpError::Http(status));
    }
    Ok(Bytes::copy_from_slice(&response[split + 4..]))
}
