//! Shared test utilities and fixtures
//!
//! A scriptable handler and a framed protocol client that talks to a real
//! socket.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kiln_bsp::codec::{FrameReader, FrameWriter};
use kiln_bsp::{
    BoundAddress, BspListener, BuildHandler, ClientRegistry, ConnectionContext, ConnectionControl,
    ConnectionOutcome, DEFAULT_BACKLOG, Endpoint, Frame, HandlerError, Reaper, serve_connection,
};
use kiln_types::ClientId;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Concurrency probe shared between a test and its handlers.
#[derive(Debug, Default)]
pub struct Probe {
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
    pub completed: AtomicUsize,
    pub cancelled: AtomicUsize,
}

/// Test handler:
/// - `build/initialize` registers `params.clientId`
/// - `build/exit` unregisters and requests exit
/// - `test/sleep` sleeps `params.ms` and echoes `params`
/// - `test/fail` returns an error
/// - `test/wait` blocks until cancelled
pub struct ScriptedHandler {
    control: ConnectionControl,
    probe: Arc<Probe>,
}

impl ScriptedHandler {
    pub fn new(control: ConnectionControl, probe: Arc<Probe>) -> Self {
        Self { control, probe }
    }

    async fn run(
        &self,
        frame: Frame,
        cancel: CancellationToken,
    ) -> Result<Option<Value>, HandlerError> {
        match frame.method().unwrap_or_default() {
            "build/initialize" => {
                let id = frame
                    .params()
                    .and_then(|p| p.get("clientId"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::invalid_params("missing clientId"))?;
                let client =
                    ClientId::new(id).map_err(|e| HandlerError::invalid_params(e.to_string()))?;
                let dir = self
                    .control
                    .register_client(client)
                    .await
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                Ok(Some(json!({"displayName": "kiln-test", "clientDir": dir})))
            }
            "build/exit" => {
                self.control.unregister_client();
                self.control.request_exit();
                Ok(None)
            }
            "test/sleep" => {
                let ms = frame
                    .params()
                    .and_then(|p| p.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(frame.params().cloned())
            }
            "test/fail" => Err(HandlerError::internal("scripted failure")),
            "test/wait" => {
                cancel.cancelled().await;
                self.probe.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::cancelled())
            }
            method => Err(HandlerError::method_not_found(method)),
        }
    }
}

impl BuildHandler for ScriptedHandler {
    async fn handle(
        &self,
        frame: Frame,
        cancel: CancellationToken,
    ) -> Result<Option<Value>, HandlerError> {
        let now = self.probe.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.run(frame, cancel).await;

        self.probe.current.fetch_sub(1, Ordering::SeqCst);
        self.probe.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Per-test server resources rooted in a temp directory.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub registry: Arc<ClientRegistry>,
    pub probe: Arc<Probe>,
    pub reaper_delay: Duration,
}

impl Fixture {
    pub fn new(reaper_delay: Duration) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            registry: Arc::new(ClientRegistry::new()),
            probe: Arc::new(Probe::default()),
            reaper_delay,
        }
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.dir.path().join("clients")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("kiln.sock")
    }

    pub fn client_dir(&self, id: &str) -> PathBuf {
        self.clients_dir().join(id)
    }

    pub fn context(&self, workers: usize, shutdown: CancellationToken) -> ConnectionContext {
        ConnectionContext {
            registry: Arc::clone(&self.registry),
            reaper: Reaper::new(
                Arc::clone(&self.registry),
                self.clients_dir(),
                self.reaper_delay,
            ),
            workers,
            shutdown,
        }
    }

    pub fn handler_factory(&self) -> impl FnOnce(ConnectionControl) -> ScriptedHandler + use<> {
        let probe = Arc::clone(&self.probe);
        move |control| ScriptedHandler::new(control, probe)
    }
}

/// Framed protocol client.
pub struct TestClient<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    next_id: i64,
}

#[cfg(unix)]
pub type UnixClient =
    TestClient<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf>;
pub type TcpClient = TestClient<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

#[cfg(unix)]
pub async fn connect_unix(path: &Path) -> UnixClient {
    let stream = tokio::net::UnixStream::connect(path).await.unwrap();
    let (read, write) = stream.into_split();
    TestClient::new(read, write)
}

pub async fn connect(address: &BoundAddress) -> TcpClient {
    let BoundAddress::Tcp(addr) = address else {
        panic!("expected a tcp address, got {address}");
    };
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    TestClient::new(read, write)
}

impl<R, W> TestClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(read: R, write: W) -> Self {
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            next_id: 1,
        }
    }

    /// Send a request without waiting; returns its id.
    pub async fn send_request(&mut self, method: &str, params: Value) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.writer
            .write_value(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await
            .unwrap();
        id
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.writer
            .write_value(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
            .unwrap();
    }

    pub async fn cancel(&mut self, id: i64) {
        self.notify("$/cancelRequest", json!({"id": id})).await;
    }

    /// Next message from the server, or `None` once it closed the stream.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_value())
            .await
            .expect("server response timed out")
            .unwrap()
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.send_request(method, params).await;
        let response = self.recv().await.expect("server closed the connection");
        assert_eq!(response["id"], id);
        response
    }

    pub async fn initialize(&mut self, client_id: &str) -> Value {
        self.request("build/initialize", json!({"clientId": client_id}))
            .await
    }
}

/// One connection served off a freshly bound listener.
pub struct Served {
    pub address: BoundAddress,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<ConnectionOutcome>,
}

/// Bind `endpoint`, accept exactly one transport, and serve it.
pub async fn serve_one(fixture: &Fixture, endpoint: Endpoint, workers: usize) -> Served {
    let listener = BspListener::bind(&endpoint).await.unwrap();
    let address = listener.address().clone();
    let shutdown = CancellationToken::new();
    let ctx = fixture.context(workers, shutdown.clone());
    let factory = fixture.handler_factory();
    let task = tokio::spawn(async move {
        let (reader, writer) = listener.accept().await.unwrap().into_split();
        serve_connection(reader, writer, ctx, factory).await
    });
    Served {
        address,
        shutdown,
        task,
    }
}

pub fn local_tcp() -> Endpoint {
    Endpoint::Tcp {
        host: "127.0.0.1".to_string(),
        port: 0,
        backlog: DEFAULT_BACKLOG,
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
