use core::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::FixedStr;

pub const SSID_FIELD_LEN: usize = 24;
pub const PASS_FIELD_LEN: usize = 24;
pub const PATH_FIELD_LEN: usize = 64;

/// Byte size of the persisted settings record.
pub const SETTINGS_RECORD_SIZE: usize =
    SSID_FIELD_LEN + PASS_FIELD_LEN + 4 + 2 + PATH_FIELD_LEN + 2 + 1;

/// Storage offset the record lives at.
pub const SETTINGS_OFFSET: usize = 0;

const SSID_AT: usize = 0;
const PASS_AT: usize = SSID_AT + SSID_FIELD_LEN;
const IP_AT: usize = PASS_AT + PASS_FIELD_LEN;
const PORT_AT: usize = IP_AT + 4;
const PATH_AT: usize = PORT_AT + 2;
const INTERVAL_AT: usize = PATH_AT + PATH_FIELD_LEN;
const ENABLED_AT: usize = INTERVAL_AT + 2;

const _: () = assert!(ENABLED_AT + 1 == SETTINGS_RECORD_SIZE);

const DEFAULT_TARGET_PORT: u16 = 8080;
const DEFAULT_TARGET_PATH: &str = "/temperature";
const DEFAULT_REPORT_INTERVAL_S: u16 = 60;

/// Timing knobs of the main loop. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub sample_interval_ms: u32,
    pub link_retry_interval_ms: u32,
    pub link_max_attempts: u8,
    pub sensor_settle_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            link_retry_interval_ms: 500,
            link_max_attempts: 20,
            sensor_settle_ms: 750,
        }
    }
}

/// The persisted settings record.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub ssid: FixedStr<SSID_FIELD_LEN>,
    pub pass: FixedStr<PASS_FIELD_LEN>,
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub target_path: FixedStr<PATH_FIELD_LEN>,
    pub report_interval_s: u16,
    pub report_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssid: FixedStr::truncated(option_env!("WIFI_SSID").unwrap_or("")),
            pass: FixedStr::truncated(option_env!("WIFI_PASS").unwrap_or("")),
            target_ip: Ipv4Addr::new(192, 168, 1, 100),
            target_port: DEFAULT_TARGET_PORT,
            target_path: FixedStr::truncated(DEFAULT_TARGET_PATH),
            report_interval_s: DEFAULT_REPORT_INTERVAL_S,
            report_enabled: false,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("ssid", &self.ssid)
            .field("pass_set", &!self.pass.is_empty())
            .field("target_ip", &self.target_ip)
            .field("target_port", &self.target_port)
            .field("target_path", &self.target_path)
            .field("report_interval_s", &self.report_interval_s)
            .field("report_enabled", &self.report_enabled)
            .finish()
    }
}

impl Settings {
    /// Report period in milliseconds. A zero interval (erased storage) is read as one second.
    pub fn report_interval_ms(&self) -> u32 {
        u32::from(self.report_interval_s.max(1)) * 1_000
    }

    pub fn to_record(&self) -> [u8; SETTINGS_RECORD_SIZE] {
        let mut record = [0_u8; SETTINGS_RECORD_SIZE];
        record[SSID_AT..PASS_AT].copy_from_slice(self.ssid.as_raw());
        record[PASS_AT..IP_AT].copy_from_slice(self.pass.as_raw());
        record[IP_AT..PORT_AT].copy_from_slice(&self.target_ip.octets());
        record[PORT_AT..PATH_AT].copy_from_slice(&self.target_port.to_le_bytes());
        record[PATH_AT..INTERVAL_AT].copy_from_slice(self.target_path.as_raw());
        record[INTERVAL_AT..ENABLED_AT].copy_from_slice(&self.report_interval_s.to_le_bytes());
        record[ENABLED_AT] = u8::from(self.report_enabled);
        record
    }

    /// Decodes a record without validating it; every byte pattern yields settings.
    pub fn from_record(record: &[u8; SETTINGS_RECORD_SIZE]) -> Self {
        let ip = &record[IP_AT..PORT_AT];
        Self {
            ssid: FixedStr::from_raw(&record[SSID_AT..PASS_AT]),
            pass: FixedStr::from_raw(&record[PASS_AT..IP_AT]),
            target_ip: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
            target_port: u16::from_le_bytes([record[PORT_AT], record[PORT_AT + 1]]),
            target_path: FixedStr::from_raw(&record[PATH_AT..INTERVAL_AT]),
            report_interval_s: u16::from_le_bytes([record[INTERVAL_AT], record[INTERVAL_AT + 1]]),
            report_enabled: record[ENABLED_AT] != 0,
        }
    }
}
