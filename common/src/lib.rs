pub mod config;
pub mod filter;
pub mod hal;
pub mod link;
pub mod page;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod timer;
pub mod types;

pub use config::{NodeConfig, Settings, SETTINGS_OFFSET, SETTINGS_RECORD_SIZE};
pub use filter::{SampleFilter, FILTER_WINDOW};
pub use hal::{
    Board, Clock, FirmwareUpdate, InboundRequests, NoUpdates, Peripherals, Radio, RadioError,
    ReportTransport, TemperatureSensor,
};
pub use link::{LinkEvent, LinkManager, LinkState};
pub use page::{Page, FIRMWARE_VERSION, PAGE_CAPACITY};
pub use report::{PostRequest, ReportOutcome, ReportStatus, Reporter, SkipReason, TransportError};
pub use scheduler::{AppState, Scheduler, TickSummary};
pub use server::{ConfigRequest, ConfigResponse, ConfigServer, RequestMethod, ROOT_PATH};
pub use store::{MemoryStorage, SettingsStorage, SettingsStore, StoreError};
pub use timer::Ticker;
pub use types::{FieldError, FixedStr, Reading, MIN_PLAUSIBLE_C, NO_READING_C};
