use std::{
    fs,
    io::{ErrorKind, Write as _},
    net::SocketAddr,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use tempnode_common::{
    Board, Clock, ConfigRequest, ConfigResponse, InboundRequests, NoUpdates, NodeConfig,
    Peripherals, PostRequest, Radio, RadioError, ReportTransport, Scheduler, SettingsStorage,
    SettingsStore, StoreError, TemperatureSensor, TransportError, NO_READING_C, ROOT_PATH,
};

const STORAGE_SIZE: usize = 512;
const SETTINGS_FILE: &str = "settings.bin";
const REQUEST_QUEUE: usize = 8;
const POST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_HEAD: usize = 1024;
const ASSOCIATION_DELAY: Duration = Duration::from_millis(300);

struct HostConfig {
    data_dir: PathBuf,
    http_port: u16,
    node_config: Option<PathBuf>,
}

impl HostConfig {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("TEMPNODE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".tempnode")),
            http_port: std::env::var("TEMPNODE_HTTP_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(8080),
            node_config: std::env::var("TEMPNODE_NODE_CONFIG").ok().map(PathBuf::from),
        }
    }

    fn load_node_config(&self) -> anyhow::Result<NodeConfig> {
        let Some(path) = self.node_config.as_ref() else {
            return Ok(NodeConfig::default());
        };
        let raw = fs::read(path)
            .with_context(|| format!("failed to read node config {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("invalid node config {}", path.display()))
    }
}

struct HostBoard;

impl Board for HostBoard {
    type Storage = FileStorage;
    type Sensor = SimulatedSensor;
    type Radio = SimulatedRadio;
    type Transport = TcpTransport;
    type Requests = ChannelRequests;
    type Updater = NoUpdates;
    type Clock = SystemClock;
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    let node = config.load_node_config()?;

    let mut storage = FileStorage::open(config.data_dir.join(SETTINGS_FILE), STORAGE_SIZE)
        .context("failed to open settings storage")?;
    if cfg!(feature = "reset_settings") {
        let mut store = SettingsStore::new(storage);
        store.reset().context("failed to reset settings")?;
        storage = store.into_inner();
    }

    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let peripherals = Peripherals::<HostBoard> {
        storage,
        sensor: SimulatedSensor::new(),
        radio: SimulatedRadio::default(),
        transport: TcpTransport::new(Handle::current()),
        requests: ChannelRequests { rx },
        updater: NoUpdates,
        clock: SystemClock::new(),
    };

    thread::Builder::new()
        .name("main-loop".into())
        .spawn(move || Scheduler::start(node, peripherals).run())
        .context("failed to spawn main loop")?;

    let app = Router::new()
        .route(ROOT_PATH, get(handle_get_root).post(handle_post_root))
        .with_state(tx);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status page at {addr}"))?;

    info!("status page on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

struct PendingRequest {
    request: ConfigRequest,
    reply: oneshot::Sender<ConfigResponse>,
}

/// Requests queued by the web server, drained one per loop iteration.
struct ChannelRequests {
    rx: mpsc::Receiver<PendingRequest>,
}

impl InboundRequests for ChannelRequests {
    fn serve_one(&mut self, handler: &mut dyn FnMut(&ConfigRequest) -> ConfigResponse) -> bool {
        let Ok(pending) = self.rx.try_recv() else {
            return false;
        };
        // The client may have gone away; the update still happened.
        let _ = pending.reply.send(handler(&pending.request));
        true
    }
}

async fn handle_get_root(State(tx): State<mpsc::Sender<PendingRequest>>) -> Response {
    forward(&tx, ConfigRequest::get()).await
}

async fn handle_post_root(State(tx): State<mpsc::Sender<PendingRequest>>, body: Bytes) -> Response {
    forward(&tx, ConfigRequest::post_form(&body)).await
}

async fn forward(tx: &mpsc::Sender<PendingRequest>, request: ConfigRequest) -> Response {
    let (reply, response) = oneshot::channel();
    if tx.send(PendingRequest { request, reply }).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "main loop stopped").into_response();
    }
    match response.await {
        Ok(response) => into_http(response),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "main loop stopped").into_response(),
    }
}

fn into_http(response: ConfigResponse) -> Response {
    match response {
        ConfigResponse::Status(page) => Html(page.as_str().to_owned()).into_response(),
        ConfigResponse::Redirect(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        ConfigResponse::StorageFailed(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("settings not saved: {message}"),
        )
            .into_response(),
    }
}

/// Settings image in a file. Writes stay in memory until commit.
struct FileStorage {
    path: PathBuf,
    cache: Vec<u8>,
}

impl FileStorage {
    fn open(path: PathBuf, size: usize) -> anyhow::Result<Self> {
        let mut cache = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        cache.resize(size, 0xff);
        Ok(Self { path, cache })
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), StoreError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.cache.len() => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                offset,
                len,
                capacity: self.cache.len(),
            }),
        }
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

impl SettingsStorage for FileStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.cache[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, data.len())?;
        self.cache[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        write_synced(&self.path, &self.cache)
            .map_err(|err| StoreError::Backend(format!("{}: {err}", self.path.display())))
    }
}

/// Slow sine around room temperature with a conversion delay like the real probe.
struct SimulatedSensor {
    started: Instant,
    converted: f32,
}

impl SimulatedSensor {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            converted: NO_READING_C,
        }
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn request_conversion(&mut self) {
        let minutes = self.started.elapsed().as_secs_f32() / 60.0;
        self.converted = 21.5 + 1.5 * (minutes * std::f32::consts::TAU / 10.0).sin();
    }

    fn read_celsius(&mut self) -> f32 {
        self.converted
    }
}

/// Associates with any non-empty SSID after a short delay.
#[derive(Default)]
struct SimulatedRadio {
    associating_since: Option<Instant>,
}

impl Radio for SimulatedRadio {
    fn is_connected(&self) -> bool {
        self.associating_since
            .is_some_and(|since| since.elapsed() >= ASSOCIATION_DELAY)
    }

    fn connect(&mut self, ssid: &str, _pass: &str) -> Result<(), RadioError> {
        if ssid.is_empty() {
            return Err(RadioError::Configuration("empty ssid".into()));
        }
        info!("radio: associating with {ssid:?}");
        self.associating_since = Some(Instant::now());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.associating_since = None;
    }

    fn signal_dbm(&self) -> Option<i8> {
        self.is_connected().then_some(-55)
    }
}

/// Plain HTTP/1.0 POST over a tokio socket, driven from the loop thread.
struct TcpTransport {
    handle: Handle,
}

impl TcpTransport {
    fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl ReportTransport for TcpTransport {
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError> {
        // The timer must be created inside the runtime, not on the loop thread.
        let outcome = self
            .handle
            .block_on(async { tokio::time::timeout(POST_TIMEOUT, send_post(request)).await });
        match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

async fn send_post(request: &PostRequest<'_>) -> Result<u16, TransportError> {
    let mut stream = TcpStream::connect((request.host, request.port))
        .await
        .map_err(|err| TransportError::Unreachable(err.to_string()))?;

    let head = format!(
        "POST {} HTTP/1.0\r\nHost: {}:{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        request.path,
        request.host,
        request.port,
        request.content_type,
        request.body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|err| TransportError::Unreachable(err.to_string()))?;
    stream
        .write_all(request.body.as_bytes())
        .await
        .map_err(|err| TransportError::Unreachable(err.to_string()))?;

    let mut buf = Vec::with_capacity(MAX_RESPONSE_HEAD);
    let mut chunk = [0_u8; 256];
    while !buf.contains(&b'\n') && buf.len() < MAX_RESPONSE_HEAD {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    parse_status_line(&buf).ok_or_else(|| {
        let line = String::from_utf8_lossy(&buf);
        let line = line.lines().next().unwrap_or_default();
        warn!("unexpected response from {}: {line:?}", request.url());
        TransportError::InvalidResponse(line.to_owned())
    })
}

/// Status code from `HTTP/1.x NNN ...`.
fn parse_status_line(raw: &[u8]) -> Option<u16> {
    let line = raw.split(|byte| *byte == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.trim_end().split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok()
}

struct SystemClock {
    start: Instant,
}

impl SystemClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation gives the same wrapping counter as the device.
        self.start.elapsed().as_millis() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
