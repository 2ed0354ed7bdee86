use std::{
    sync::mpsc::{self, Receiver, SyncSender, TrySendError},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context};
use ds18b20::Ds18b20;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals as EspPeripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{
            Configuration as HttpConfiguration, EspHttpConnection as ServerConnection,
            EspHttpServer, Request,
        },
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    systime::EspSystemTime,
    wifi::EspWifi,
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use tempnode_common::{
    Board, Clock, ConfigRequest, ConfigResponse, FirmwareUpdate, InboundRequests, NodeConfig,
    Peripherals, PostRequest, Radio, RadioError, ReportTransport, Scheduler, SettingsStorage,
    SettingsStore, StoreError, TemperatureSensor, TransportError, NO_READING_C, ROOT_PATH,
};

const NVS_NAMESPACE: &str = "tempnode";
const NVS_IMAGE_KEY: &str = "eeprom";
const EEPROM_SIZE: usize = 512;

const DS18B20_PIN: i32 = 4;

const ACCESS_POINT_SSID: &str = "TempSensor01";
const ACCESS_POINT_PASS: &str = match option_env!("AP_PASS") {
    Some(pass) => pass,
    None => "sensorTemp",
};
// WPA2 passphrases are 8 to 63 characters.
const _: () = assert!(ACCESS_POINT_PASS.len() >= 8 && ACCESS_POINT_PASS.len() <= 63);
const ACCESS_POINT_CHANNEL: u8 = 1;

const REQUEST_QUEUE: usize = 4;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HTTP_BODY: usize = 1024;
const POST_TIMEOUT: Duration = Duration::from_secs(5);

const FIRMWARE_PATH: &str = "/fw";
const OTA_CHUNK_SIZE: usize = 4096;
const OTA_PROGRESS_STEP: u64 = 64 * 1024;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;

struct EspBoard;

impl Board for EspBoard {
    type Storage = NvsStorage;
    type Sensor = Ds18b20Sensor;
    type Radio = EspRadio;
    type Transport = EspTransport;
    type Requests = ChannelRequests;
    type Updater = OtaUpdater;
    type Clock = EspClock;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let EspPeripherals { modem, pins, .. } = EspPeripherals::take()?;

    let mut storage = NvsStorage::open(nvs_partition.clone(), EEPROM_SIZE)
        .context("failed to open settings storage")?;
    if cfg!(feature = "reset_settings") {
        let mut store = SettingsStore::new(storage);
        store.reset().context("failed to reset settings")?;
        storage = store.into_inner();
    }

    let sensor =
        Ds18b20Sensor::new(pins.gpio4.downgrade()).context("failed to initialize DS18B20")?;
    let radio = EspRadio::start(modem, sys_loop, nvs_partition).context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let (request_tx, request_rx) = mpsc::sync_channel(REQUEST_QUEUE);
    let (ota_tx, ota_rx) = mpsc::sync_channel(1);
    let _server = create_http_server(request_tx, ota_tx)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let peripherals = Peripherals::<EspBoard> {
        storage,
        sensor,
        radio,
        transport: EspTransport,
        requests: ChannelRequests { rx: request_rx },
        updater: OtaUpdater {
            requests: ota_rx,
            job: None,
        },
        clock: EspClock,
    };

    Scheduler::start(NodeConfig::default(), peripherals).run()
}

/// EEPROM-style image kept as one NVS blob. Writes stay in RAM until commit.
struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
    cache: Vec<u8>,
}

impl NvsStorage {
    fn open(partition: EspDefaultNvsPartition, size: usize) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut cache = vec![0xff; size];
        let mut raw = vec![0_u8; size];
        if let Some(stored) = nvs.get_raw(NVS_IMAGE_KEY, &mut raw)? {
            let len = stored.len().min(size);
            cache[..len].copy_from_slice(&stored[..len]);
        }
        Ok(Self { nvs, cache })
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

impl SettingsStorage for NvsStorage {
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
        self.nvs
            .set_raw(NVS_IMAGE_KEY, &self.cache)
            .map(|_| ())
            .map_err(|err| StoreError::Backend(format!("nvs: {err:?}")))
    }
}

struct Ds18b20Sensor {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl Ds18b20Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        let one_wire = OneWire::new(pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut sensor = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        sensor.scan();
        Ok(sensor)
    }

    fn scan(&mut self) {
        let mut found = None;
        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    found = Some(address);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = found;
        match self.address {
            Some(address) => info!("DS18B20 {address:?} on GPIO{DS18B20_PIN}"),
            None => warn!("no DS18B20 on GPIO{DS18B20_PIN}"),
        }
    }
}

impl TemperatureSensor for Ds18b20Sensor {
    fn request_conversion(&mut self) {
        if self.address.is_none() {
            self.scan();
        }
        if self.address.is_none() {
            return;
        }

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
        }
    }

    fn read_celsius(&mut self) -> f32 {
        let Some(address) = self.address else {
            return NO_READING_C;
        };
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return NO_READING_C;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => data.temperature,
            Err(err) => {
                warn!("failed to read DS18B20: {err:?}");
                self.address = None;
                NO_READING_C
            }
        }
    }
}

/// Station plus the always-on setup access point.
struct EspRadio {
    wifi: EspWifi<'static>,
}

impl EspRadio {
    fn start(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        wifi.set_configuration(&Configuration::Mixed(
            ClientConfiguration::default(),
            access_point()?,
        ))?;
        wifi.start()?;
        info!("wifi started, setup access point `{ACCESS_POINT_SSID}`");
        Ok(Self { wifi })
    }
}

fn access_point() -> anyhow::Result<AccessPointConfiguration> {
    Ok(AccessPointConfiguration {
        ssid: ACCESS_POINT_SSID
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: ACCESS_POINT_PASS
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: ACCESS_POINT_CHANNEL,
        ..Default::default()
    })
}

impl Radio for EspRadio {
    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn connect(&mut self, ssid: &str, pass: &str) -> Result<(), RadioError> {
        let client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::Configuration("ssid too long".into()))?,
            password: pass
                .try_into()
                .map_err(|_| RadioError::Configuration("password too long".into()))?,
            auth_method: if pass.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        let ap = access_point().map_err(|err| RadioError::Configuration(err.to_string()))?;

        self.wifi
            .set_configuration(&Configuration::Mixed(client, ap))
            .map_err(|err| RadioError::Configuration(format!("{err:?}")))?;
        self.wifi
            .connect()
            .map_err(|err| RadioError::Association(format!("{err:?}")))
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err:?}");
        }
    }

    fn signal_dbm(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

struct EspTransport;

fn unreachable(err: impl core::fmt::Debug) -> TransportError {
    TransportError::Unreachable(format!("{err:?}"))
}

impl ReportTransport for EspTransport {
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(POST_TIMEOUT),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&conf).map_err(unreachable)?);

        let url = request.url();
        let length = request.body.len().to_string();
        let headers = [
            ("Content-Type", request.content_type),
            ("Content-Length", length.as_str()),
        ];
        let mut outgoing = client
            .request(Method::Post, &url, &headers)
            .map_err(unreachable)?;
        outgoing
            .write_all(request.body.as_bytes())
            .map_err(unreachable)?;
        outgoing.flush().map_err(unreachable)?;

        let response = outgoing.submit().map_err(unreachable)?;
        Ok(response.status())
    }
}

struct PendingRequest {
    request: ConfigRequest,
    reply: SyncSender<ConfigResponse>,
}

/// Requests handed over by the HTTP server task, drained one per loop iteration.
struct ChannelRequests {
    rx: Receiver<PendingRequest>,
}

impl InboundRequests for ChannelRequests {
    fn serve_one(&mut self, handler: &mut dyn FnMut(&ConfigRequest) -> ConfigResponse) -> bool {
        let Ok(pending) = self.rx.try_recv() else {
            return false;
        };
        let _ = pending.reply.send(handler(&pending.request));
        true
    }
}

#[derive(Debug, Deserialize)]
struct OtaRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
}

fn create_http_server(
    requests: SyncSender<PendingRequest>,
    ota: SyncSender<OtaRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>(ROOT_PATH, Method::Get, move |req| {
            let response = forward(&requests, ConfigRequest::get())?;
            write_config_response(req, response)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(ROOT_PATH, Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let response = forward(&requests, ConfigRequest::post_form(&body))?;
        write_config_response(req, response)
    })?;

    server.fn_handler::<anyhow::Error, _>(FIRMWARE_PATH, Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let mut update: OtaRequest =
            serde_urlencoded::from_bytes(&body).context("invalid firmware form")?;
        update.sha256 = update
            .sha256
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());

        if let Err(message) = validate_ota_request(&update) {
            return write_text(req, 400, message);
        }
        match ota.try_send(update) {
            Ok(()) => write_config_response(req, ConfigResponse::Redirect(ROOT_PATH)),
            Err(TrySendError::Full(_)) => write_text(req, 409, "update already queued"),
            Err(TrySendError::Disconnected(_)) => write_text(req, 503, "updater stopped"),
        }
    })?;

    Ok(server)
}

fn forward(
    requests: &SyncSender<PendingRequest>,
    request: ConfigRequest,
) -> anyhow::Result<ConfigResponse> {
    let (reply, response) = mpsc::sync_channel(1);
    requests
        .send(PendingRequest { request, reply })
        .map_err(|_| anyhow!("main loop stopped"))?;
    response
        .recv_timeout(REPLY_TIMEOUT)
        .context("main loop did not answer")
}

fn read_request_body(req: &mut Request<&mut ServerConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_config_response(
    req: Request<&mut ServerConnection<'_>>,
    response: ConfigResponse,
) -> anyhow::Result<()> {
    match response {
        ConfigResponse::Status(page) => {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
        }
        ConfigResponse::Redirect(location) => {
            req.into_response(302, Some("Found"), &[("Location", location)])?;
        }
        ConfigResponse::StorageFailed(message) => {
            return write_text(req, 500, &format!("settings not saved: {message}"));
        }
    }
    Ok(())
}

fn write_text(
    req: Request<&mut ServerConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

fn validate_ota_request(update: &OtaRequest) -> Result<(), &'static str> {
    let url = update.url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !url.starts_with("http://") {
        return Err("url must start with http://");
    }

    if let Some(sha256) = update.sha256.as_deref() {
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("sha256 must be 64 hex characters");
        }
    }

    Ok(())
}

/// Runs queued firmware downloads on a worker and reboots into a finished image.
struct OtaUpdater {
    requests: Receiver<OtaRequest>,
    job: Option<JoinHandle<anyhow::Result<(u64, String)>>>,
}

impl FirmwareUpdate for OtaUpdater {
    fn poll(&mut self) {
        if let Some(job) = self.job.take() {
            if !job.is_finished() {
                self.job = Some(job);
                return;
            }
            match job.join() {
                Ok(Ok((bytes, digest))) => {
                    info!("ota: {bytes} bytes written (sha256 {digest}), restarting");
                    FreeRtos::delay_ms(500);
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }
                Ok(Err(err)) => warn!("ota: update failed: {err:#}"),
                Err(_) => warn!("ota: worker panicked"),
            }
            return;
        }

        let Ok(request) = self.requests.try_recv() else {
            return;
        };
        info!("ota: downloading {}", request.url);
        let spawned = thread::Builder::new()
            .name("ota-apply".into())
            .stack_size(16 * 1024)
            .spawn(move || download_and_apply_ota(&request.url, request.sha256.as_deref()));
        match spawned {
            Ok(job) => self.job = Some(job),
            Err(err) => warn!("ota: failed to spawn worker: {err}"),
        }
    }
}

fn download_and_apply_ota(url: &str, expected_sha256: Option<&str>) -> anyhow::Result<(u64, String)> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("download failed with HTTP {status}"));
    }
    let content_length = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok());

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut next_progress = OTA_PROGRESS_STEP;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        if total_written >= next_progress {
            next_progress += OTA_PROGRESS_STEP;
            match content_length {
                Some(total) if total > 0 => {
                    info!("ota: {}%", (total_written * 100 / total).min(100))
                }
                _ => info!("ota: {total_written} bytes"),
            }
        }
    }

    if total_written == 0 {
        return Err(anyhow!("firmware image is empty"));
    }

    let digest_hex = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            update
                .abort()
                .map_err(|err| anyhow!("failed aborting OTA update: {err:?}"))?;
            return Err(anyhow!(
                "sha256 mismatch (expected {expected}, got {digest_hex})"
            ));
        }
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

    Ok((total_written, digest_hex))
}

/// Millisecond uptime, wrapping like the device counter.
struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u32 {
        EspSystemTime {}.now().as_millis() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        // The loop yields here every iteration.
        feed_watchdog();
        FreeRtos::delay_ms(ms);
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
