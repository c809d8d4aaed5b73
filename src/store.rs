//! Backing-store client.
//!
//! Each worker process opens exactly one connection to a Redis-compatible
//! store and pushes ingested records onto a list. Only the handful of
//! commands the ingestion path needs are spoken here.
//!
//! Request handlers never touch the connection directly: a [`StoreClient`]
//! hands commands to a task that owns the [`StoreConnection`], so a request
//! dropped halfway (client hung up) cannot leave a reply unread on the wire.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default store port.
pub const DEFAULT_STORE_PORT: u16 = 6379;

/// Default bound on one command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests queued for the connection task before senders wait.
const REQUEST_QUEUE: usize = 256;

/// Connect retry policy. Only timeouts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total connection attempts (at least 1).
    pub attempts: u32,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(250),
        }
    }
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

/// Endpoint and credentials of the backing store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Longest a command may wait for its reply. A command that times out
    /// leaves the connection unusable.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,
}

impl StoreParams {
    /// Create parameters for an unauthenticated store.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: None,
            password: None,
            retry: RetryPolicy::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// `host:port` of the store.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Default for StoreParams {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_STORE_PORT)
    }
}

impl fmt::Debug for StoreParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreParams")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("retry", &self.retry)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// A decoded store reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Error(String),
}

impl Reply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Whether this is the status line `expected` (`OK`, `PONG`).
    pub fn is_status(&self, expected: &str) -> bool {
        matches!(self, Self::Status(s) if s == expected)
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// One open connection to the store.
///
/// Replies are matched to commands by order, so a command abandoned after
/// its request was written (timeout, dropped future) marks the connection
/// out of sync and every later command fails instead of reading a stale
/// reply.
pub struct StoreConnection {
    stream: BufReader<TcpStream>,
    endpoint: String,
    command_timeout: Duration,
    in_flight: bool,
}

impl StoreConnection {
    /// Connect, authenticate and verify the connection with `PING`.
    pub async fn connect(params: &StoreParams) -> Result<Self> {
        let endpoint = params.endpoint();
        let stream = connect_with_retry(&endpoint, &params.retry).await?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufReader::new(stream),
            endpoint,
            command_timeout: params.command_timeout,
            in_flight: false,
        };

        if let Some(password) = &params.password {
            let reply = match &params.username {
                Some(user) => {
                    conn.command(&[b"AUTH", user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => conn.command(&[b"AUTH", password.as_bytes()]).await?,
            };
            expect_status(reply, "OK")?;
        }

        conn.ping().await?;
        tracing::debug!(endpoint = %conn.endpoint, "Store connection established");
        Ok(conn)
    }

    /// `host:port` this connection talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether an earlier command was abandoned mid-exchange.
    pub fn is_broken(&self) -> bool {
        self.in_flight
    }

    /// Send a command and read its reply. Error replies become `Err`.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply> {
        if self.in_flight {
            return Err(IngestError::Store(format!(
                "connection to {} is out of sync after an interrupted command",
                self.endpoint
            )));
        }

        self.in_flight = true;
        let reply = match tokio::time::timeout(self.command_timeout, self.exchange(args)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(IngestError::Store(format!(
                    "no reply from {} within {:?}",
                    self.endpoint, self.command_timeout
                )));
            }
        };
        self.in_flight = false;

        match reply {
            Reply::Error(message) => Err(IngestError::Store(message)),
            reply => Ok(reply),
        }
    }

    async fn exchange(&mut self, args: &[&[u8]]) -> Result<Reply> {
        self.stream.get_mut().write_all(&encode_command(args)).await?;
        self.read_reply().await
    }

    /// Check the connection is alive.
    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.command(&[b"PING"]).await?;
        expect_status(reply, "PONG")
    }

    /// Append `value` to the list at `key`, returning the new list length.
    pub async fn rpush(&mut self, key: &str, value: &[u8]) -> Result<i64> {
        let reply = self.command(&[b"RPUSH", key.as_bytes(), value]).await?;
        reply.as_integer().ok_or_else(|| {
            IngestError::Store(format!("unexpected RPUSH reply: {:?}", reply))
        })
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(IngestError::Store(format!(
                "connection to {} closed",
                self.endpoint
            )));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let line = self.read_line().await?;
        let (kind, rest) = line.split_at_checked(1).unwrap_or(("", ""));
        match kind {
            "+" => Ok(Reply::Status(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => rest
                .parse()
                .map(Reply::Integer)
                .map_err(|_| IngestError::Store(format!("invalid integer reply: {}", rest))),
            "$" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| IngestError::Store(format!("invalid bulk length: {}", rest)))?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let mut buf = vec![0u8; len as usize + 2];
                self.stream.read_exact(&mut buf).await?;
                buf.truncate(len as usize);
                Ok(Reply::Bulk(Some(buf)))
            }
            _ => Err(IngestError::Store(format!("unsupported reply: {}", line))),
        }
    }
}

fn expect_status(reply: Reply, expected: &str) -> Result<()> {
    if reply.is_status(expected) {
        Ok(())
    } else {
        Err(IngestError::Store(format!(
            "expected +{}, got {:?}",
            expected, reply
        )))
    }
}

/// Work handed to the connection task.
enum Request {
    Push {
        key: String,
        values: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<i64>>,
    },
    Ping {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a worker's store connection.
///
/// Each request runs to completion on the connection task even if the
/// caller stops waiting for it.
#[derive(Clone)]
pub struct StoreClient {
    requests: mpsc::Sender<Request>,
    endpoint: Arc<str>,
}

impl StoreClient {
    /// Move `conn` onto its own task. The task closes the connection once
    /// every client has been dropped.
    pub fn spawn(conn: StoreConnection) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let client = Self {
            requests: tx,
            endpoint: Arc::from(conn.endpoint()),
        };
        (client, tokio::spawn(serve_requests(conn, rx)))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Append `values` to the list at `key` in order, returning the final
    /// list length. Stops at the first failure.
    pub async fn push(&self, key: &str, values: Vec<Vec<u8>>) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Push {
            key: key.to_string(),
            values,
            reply,
        })
        .await?;
        self.await_reply(rx).await
    }

    pub async fn ping(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Ping { reply }).await?;
        self.await_reply(rx).await
    }

    async fn submit(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| {
            IngestError::Store(format!("connection to {} has shut down", self.endpoint))
        })
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await.map_err(|_| {
            IngestError::Store(format!("connection to {} has shut down", self.endpoint))
        })?
    }
}

async fn serve_requests(mut conn: StoreConnection, mut requests: mpsc::Receiver<Request>) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Push { key, values, reply } => {
                let mut result = Ok(0);
                for value in &values {
                    result = conn.rpush(&key, value).await;
                    if result.is_err() {
                        break;
                    }
                }
                if let Err(e) = &result {
                    tracing::warn!(endpoint = %conn.endpoint, error = %e, "Store push failed");
                }
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            Request::Ping { reply } => {
                let _ = reply.send(conn.ping().await);
            }
        }
    }

    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Store connection already closed");
    }
}

/// Open a TCP connection, retrying attempts that time out.
async fn connect_with_retry(endpoint: &str, policy: &RetryPolicy) -> Result<TcpStream> {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let timed_out = match tokio::time::timeout(
            policy.connect_timeout,
            TcpStream::connect(endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => e.to_string(),
            Ok(Err(e)) => {
                return Err(IngestError::Store(format!(
                    "failed to connect to {}: {}",
                    endpoint, e
                )));
            }
            Err(_) => format!("no answer within {:?}", policy.connect_timeout),
        };

        tracing::warn!(
            endpoint,
            attempt,
            attempts,
            reason = %timed_out,
            "Store connection attempt timed out"
        );

        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(IngestError::Store(format!(
        "timed out connecting to {} after {} attempts",
        endpoint, attempts
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal in-process store answering PING, AUTH and RPUSH.
    ///
    /// Pushed values are forwarded to the returned receiver.
    pub(crate) async fn fake_store(
        password: Option<&'static str>,
    ) -> (u16, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        slow_store(password, Duration::ZERO).await
    }

    /// Like [`fake_store`], but every reply is held back for `delay`.
    pub(crate) async fn slow_store(
        password: Option<&'static str>,
        delay: Duration,
    ) -> (u16, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut stream = BufReader::new(socket);
                    let mut list_len = 0i64;
                    while let Some(args) = read_command(&mut stream).await {
                        let reply: Vec<u8> = match args[0].as_slice() {
                            b"PING" => b"+PONG\r\n".to_vec(),
                            b"AUTH" => {
                                let given = args.last().cloned().unwrap_or_default();
                                if password.map(str::as_bytes) == Some(given.as_slice()) {
                                    b"+OK\r\n".to_vec()
                                } else {
                                    b"-WRONGPASS invalid password\r\n".to_vec()
                                }
                            }
                            b"RPUSH" => {
                                list_len += 1;
                                let _ = tx.send(args[2].clone());
                                format!(":{}\r\n", list_len).into_bytes()
                            }
                            _ => b"-ERR unknown command\r\n".to_vec(),
                        };
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if stream.get_mut().write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (port, rx)
    }

    async fn read_command(stream: &mut BufReader<tokio::net::TcpStream>) -> Option<Vec<Vec<u8>>> {
        let mut line = String::new();
        if stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            stream.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(buf);
        }
        Some(args)
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[b"RPUSH", b"logs", b"hi"]);
        assert_eq!(encoded, b"*3\r\n$5\r\nRPUSH\r\n$4\r\nlogs\r\n$2\r\nhi\r\n");
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut params = StoreParams::new("redis.internal", 6380);
        params.username = Some("ingest".into());
        params.password = Some("hunter2".into());

        let debug = format!("{:?}", params);
        assert!(debug.contains("redis.internal"));
        assert!(debug.contains("ingest"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_params_default_endpoint() {
        let params = StoreParams::default();
        assert_eq!(params.endpoint(), "localhost:6379");
        assert_eq!(params.retry.attempts, 3);
    }

    #[test]
    fn test_params_deserialize_without_retry() {
        let params: StoreParams = serde_json::from_str(
            r#"{"hostname":"db","port":6379,"username":null,"password":null}"#,
        )
        .unwrap();
        assert_eq!(params.retry, RetryPolicy::default());
        assert_eq!(params.command_timeout, DEFAULT_COMMAND_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_and_push() {
        let (port, mut pushed) = fake_store(None).await;
        let mut conn = StoreConnection::connect(&StoreParams::new("127.0.0.1", port))
            .await
            .unwrap();

        assert_eq!(conn.rpush("ingest:logs", b"first").await.unwrap(), 1);
        assert_eq!(conn.rpush("ingest:logs", b"second").await.unwrap(), 2);
        assert_eq!(pushed.recv().await.unwrap(), b"first");
        assert_eq!(pushed.recv().await.unwrap(), b"second");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_pushes_batch_in_order() {
        let (port, mut pushed) = fake_store(None).await;
        let conn = StoreConnection::connect(&StoreParams::new("127.0.0.1", port))
            .await
            .unwrap();
        let (client, task) = StoreClient::spawn(conn);
        assert_eq!(client.endpoint(), format!("127.0.0.1:{}", port));

        let len = client
            .push("ingest:logs", vec![b"first".to_vec(), b"second".to_vec()])
            .await
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(pushed.recv().await.unwrap(), b"first");
        assert_eq!(pushed.recv().await.unwrap(), b"second");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_push_leaves_client_in_sync() {
        let (port, mut pushed) = slow_store(None, Duration::from_millis(200)).await;
        let conn = StoreConnection::connect(&StoreParams::new("127.0.0.1", port))
            .await
            .unwrap();
        let (client, _task) = StoreClient::spawn(conn);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.push("k", vec![b"a".to_vec()]),
        )
        .await;
        assert!(abandoned.is_err());

        // The push still completes, and the next reply belongs to the ping.
        client.ping().await.unwrap();
        assert_eq!(pushed.recv().await.unwrap(), b"a");
        assert_eq!(client.push("k", vec![b"b".to_vec()]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_command_timeout_marks_connection_broken() {
        let (port, _pushed) = slow_store(None, Duration::from_millis(300)).await;
        let mut params = StoreParams::new("127.0.0.1", port);
        params.command_timeout = Duration::from_secs(5);
        let mut conn = StoreConnection::connect(&params).await.unwrap();
        conn.command_timeout = Duration::from_millis(50);

        match conn.rpush("k", b"a").await {
            Err(IngestError::Store(msg)) => assert!(msg.contains("no reply")),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(conn.is_broken());

        // The late RPUSH reply must not be taken for the PONG.
        match conn.ping().await {
            Err(IngestError::Store(msg)) => assert!(msg.contains("out of sync")),
            other => panic!("expected out-of-sync error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_command_marks_connection_broken() {
        let (port, _pushed) = slow_store(None, Duration::from_millis(200)).await;
        let mut conn = StoreConnection::connect(&StoreParams::new("127.0.0.1", port))
            .await
            .unwrap();

        let dropped = tokio::time::timeout(Duration::from_millis(50), conn.rpush("k", b"a")).await;
        assert!(dropped.is_err());
        assert!(conn.is_broken());
        assert!(conn.ping().await.is_err());
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Integer(3).as_integer(), Some(3));
        assert_eq!(Reply::Status("OK".into()).as_integer(), None);
        assert!(Reply::Status("PONG".into()).is_status("PONG"));
        assert!(!Reply::Error("PONG".into()).is_status("PONG"));
    }

    #[tokio::test]
    async fn test_connect_authenticates() {
        let (port, _pushed) = fake_store(Some("s3cret")).await;
        let mut params = StoreParams::new("127.0.0.1", port);
        params.username = Some("default".into());
        params.password = Some("s3cret".into());

        assert!(StoreConnection::connect(&params).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let (port, _pushed) = fake_store(Some("s3cret")).await;
        let mut params = StoreParams::new("127.0.0.1", port);
        params.password = Some("guess".into());

        match StoreConnection::connect(&params).await {
            Err(IngestError::Store(msg)) => assert!(msg.contains("WRONGPASS")),
            Err(other) => panic!("expected store error, got {:?}", other),
            Ok(_) => panic!("expected authentication failure"),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_retried() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut params = StoreParams::new("127.0.0.1", port);
        params.retry.backoff = Duration::from_secs(60);

        let started = std::time::Instant::now();
        let result = StoreConnection::connect(&params).await;
        assert!(result.is_err());
        // A retry would have slept through the backoff.
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
