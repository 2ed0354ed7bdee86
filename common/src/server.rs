use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::{
    config::Settings,
    link::LinkManager,
    page::{render_status, Page, StatusView},
    report::Reporter,
    store::{SettingsStorage, SettingsStore},
    types::{FixedStr, Reading},
};

pub const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

/// A request to `/` as the board's HTTP server hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub method: RequestMethod,
    pub fields: Vec<(String, String)>,
}

impl ConfigRequest {
    pub fn get() -> Self {
        Self {
            method: RequestMethod::Get,
            fields: Vec::new(),
        }
    }

    /// Parses an `application/x-www-form-urlencoded` body. An unparsable body carries no fields.
    pub fn post_form(body: &[u8]) -> Self {
        let fields = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body).unwrap_or_else(|err| {
            debug!("config: unparsable form body: {err}");
            Vec::new()
        });
        Self {
            method: RequestMethod::Post,
            fields,
        }
    }

    /// First value for `name`. Empty values count as missing.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|(key, _)| key == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigResponse {
    Status(Page),
    Redirect(&'static str),
    StorageFailed(String),
}

impl ConfigResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Status(_) => 200,
            Self::Redirect(_) => 302,
            Self::StorageFailed(_) => 500,
        }
    }
}

/// Live values shown on the status page besides the settings.
#[derive(Debug, Clone, Copy)]
pub struct Telemetry<'a> {
    pub reading: &'a Reading,
    pub reporter: &'a Reporter,
    pub signal_dbm: Option<i8>,
    pub now_ms: u32,
    pub boot_ms: u32,
}

/// Serves the status page and applies configuration posted back to it.
#[derive(Debug, Default)]
pub struct ConfigServer {
    served: u32,
}

impl ConfigServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn served(&self) -> u32 {
        self.served
    }

    /// On a valid update: persist, then replace `settings`, then force the link idle.
    pub fn handle_request<S: SettingsStorage>(
        &mut self,
        request: &ConfigRequest,
        settings: &mut Settings,
        store: &mut SettingsStore<S>,
        link: &mut LinkManager,
        telemetry: Telemetry<'_>,
    ) -> ConfigResponse {
        self.served = self.served.wrapping_add(1);

        if request.method == RequestMethod::Post {
            match apply_update(request, settings) {
                Some(updated) => {
                    return match store.save(updated) {
                        Ok(saved) => {
                            info!("config: settings updated: {saved:?}");
                            *settings = saved;
                            link.force_idle();
                            ConfigResponse::Redirect(ROOT_PATH)
                        }
                        Err(err) => {
                            warn!("config: keeping previous settings, save failed: {err}");
                            ConfigResponse::StorageFailed(err.to_string())
                        }
                    };
                }
                None => debug!("config: POST without a complete group"),
            }
        }

        ConfigResponse::Status(render_status(&StatusView {
            settings,
            reading: telemetry.reading,
            link: link.state(),
            signal_dbm: telemetry.signal_dbm,
            last_status: telemetry.reporter.last_status(),
            last_attempt_ms: telemetry.reporter.last_attempt_ms(),
            last_success_ms: telemetry.reporter.last_success_ms(),
            now_ms: telemetry.now_ms,
            boot_ms: telemetry.boot_ms,
        }))
    }
}

/// Builds the updated record, or `None` when no group is complete and well formed.
pub fn apply_update(request: &ConfigRequest, current: &Settings) -> Option<Settings> {
    let mut next = current.clone();
    let mut changed = false;

    if let (Some(ssid), Some(pass)) = (request.field("ssid"), request.field("pass")) {
        match (FixedStr::new(ssid), FixedStr::new(pass)) {
            (Ok(ssid), Ok(pass)) => {
                next.ssid = ssid;
                next.pass = pass;
                changed = true;
            }
            _ => debug!("config: network group ignored, value too long"),
        }
    }

    if let (Some(host), Some(port), Some(path)) =
        (request.field("host"), request.field("port"), request.field("path"))
    {
        let ip = host.trim().parse::<Ipv4Addr>().ok();
        let port = port.trim().parse::<u16>().ok().filter(|port| *port != 0);
        match (ip, port, FixedStr::new(path)) {
            (Some(ip), Some(port), Ok(path)) => {
                next.target_ip = ip;
                next.target_port = port;
                next.target_path = path;
                changed = true;
            }
            _ => debug!("config: target group ignored, malformed"),
        }
    }

    if let Some(delay) = request.field("delay") {
        match delay.trim().parse::<u16>() {
            Ok(seconds) if seconds > 0 => {
                next.report_interval_s = seconds;
                next.report_enabled = request.has("send");
                changed = true;
            }
            _ => debug!("config: report group ignored, bad delay {delay:?}"),
        }
    }

    changed.then_some(next)
}
