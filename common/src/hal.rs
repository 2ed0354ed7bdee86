//! Interfaces the main loop drives. Each board supplies one implementation per trait.

use thiserror::Error;

use crate::{
    report::{PostRequest, TransportError},
    server::{ConfigRequest, ConfigResponse},
    store::SettingsStorage,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio rejected configuration: {0}")]
    Configuration(String),
    #[error("radio failed to start association: {0}")]
    Association(String),
}

pub trait TemperatureSensor {
    /// Starts a conversion. The value is ready after the settle time.
    fn request_conversion(&mut self);

    /// Last converted value, or [`crate::types::NO_READING_C`] when nothing answered.
    fn read_celsius(&mut self) -> f32;
}

pub trait Radio {
    fn is_connected(&self) -> bool;

    /// Begins associating with `ssid`. Must not block until associated.
    fn connect(&mut self, ssid: &str, pass: &str) -> Result<(), RadioError>;

    fn disconnect(&mut self);

    fn signal_dbm(&self) -> Option<i8>;
}

pub trait ReportTransport {
    /// One blocking POST. Returns the HTTP status code.
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError>;
}

pub trait InboundRequests {
    /// Answers at most one pending request with `handler`. Returns `true` if one was served.
    fn serve_one(&mut self, handler: &mut dyn FnMut(&ConfigRequest) -> ConfigResponse) -> bool;
}

pub trait FirmwareUpdate {
    /// Performs one bounded step of any update in progress.
    fn poll(&mut self);
}

pub trait Clock {
    /// Wrapping millisecond counter.
    fn now_ms(&self) -> u32;

    fn delay_ms(&mut self, ms: u32);
}

/// Groups the collaborator types of one target.
pub trait Board {
    type Storage: SettingsStorage;
    type Sensor: TemperatureSensor;
    type Radio: Radio;
    type Transport: ReportTransport;
    type Requests: InboundRequests;
    type Updater: FirmwareUpdate;
    type Clock: Clock;
}

/// Concrete collaborators handed to the scheduler at start-up.
pub struct Peripherals<B: Board> {
    pub storage: B::Storage,
    pub sensor: B::Sensor,
    pub radio: B::Radio,
    pub transport: B::Transport,
    pub requests: B::Requests,
    pub updater: B::Updater,
    pub clock: B::Clock,
}

/// Updater for targets without over-the-air updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpdates;

impl FirmwareUpdate for NoUpdates {
    fn poll(&mut self) {}
}
