use log::{debug, info, warn};

use crate::{
    config::{NodeConfig, Settings},
    filter::{SampleFilter, FILTER_WINDOW},
    hal::{
        Board, Clock, FirmwareUpdate, InboundRequests, Peripherals, Radio, TemperatureSensor,
    },
    link::{LinkEvent, LinkManager},
    report::{ReportOutcome, Reporter},
    server::{ConfigRequest, ConfigServer, Telemetry},
    store::SettingsStore,
    timer::Ticker,
    types::Reading,
};

/// Yield between iterations so the idle task can feed the watchdog.
const LOOP_YIELD_MS: u32 = 1;

/// State shared by the loop's steps. Each field has exactly one writer.
#[derive(Debug, Clone)]
pub struct AppState {
    pub settings: Settings,
    pub reading: Reading,
    pub filter: SampleFilter<FILTER_WINDOW>,
    pub link: LinkManager,
    pub reporter: Reporter,
    pub sample_ticker: Ticker,
    pub boot_ms: u32,
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub now_ms: u32,
    pub sampled: Option<f32>,
    pub report: Option<ReportOutcome>,
    pub link: Option<LinkEvent>,
    pub served_request: bool,
}

pub struct Scheduler<B: Board> {
    config: NodeConfig,
    state: AppState,
    store: SettingsStore<B::Storage>,
    server: ConfigServer,
    sensor: B::Sensor,
    radio: B::Radio,
    transport: B::Transport,
    requests: B::Requests,
    updater: B::Updater,
    clock: B::Clock,
}

impl<B: Board> Scheduler<B> {
    /// Loads settings and takes the first reading. Blocks once for the sensor settle time.
    pub fn start(config: NodeConfig, peripherals: Peripherals<B>) -> Self {
        let Peripherals {
            storage,
            mut sensor,
            radio,
            transport,
            requests,
            updater,
            mut clock,
        } = peripherals;

        let boot_ms = clock.now_ms();
        let mut store = SettingsStore::new(storage);
        let settings = match store.load() {
            Ok(settings) => settings,
            Err(err) => {
                warn!("boot: cannot read settings, using defaults: {err}");
                Settings::default()
            }
        };
        info!("boot: {settings:?}");

        sensor.request_conversion();
        clock.delay_ms(config.sensor_settle_ms);

        let now = clock.now_ms();
        let mut filter = SampleFilter::new();
        let first = filter.push(sensor.read_celsius());
        sensor.request_conversion();
        info!("boot: first reading {first:.3} C");

        let state = AppState {
            settings,
            reading: Reading::new(first, now),
            filter,
            link: LinkManager::new(config.link_retry_interval_ms, config.link_max_attempts),
            reporter: Reporter::new(now),
            sample_ticker: Ticker::new(now),
            boot_ms,
        };

        Self {
            config,
            state,
            store,
            server: ConfigServer::new(),
            sensor,
            radio,
            transport,
            requests,
            updater,
            clock,
        }
    }

    /// One pass over every step: sample, report, link, one request, one update step.
    pub fn tick(&mut self) -> TickSummary {
        let now = self.clock.now_ms();
        let mut summary = TickSummary {
            now_ms: now,
            ..TickSummary::default()
        };

        if self.state.sample_ticker.poll(now, self.config.sample_interval_ms) {
            let raw = self.sensor.read_celsius();
            self.sensor.request_conversion();
            let filtered = self.state.filter.push(raw);
            self.state.reading = Reading::new(filtered, now);
            debug!("sample: raw {raw:.3} filtered {filtered:.3}");
            summary.sampled = Some(filtered);
        }

        summary.report = self.state.reporter.report_if_due(
            now,
            &self.state.settings,
            &self.state.reading,
            self.state.link.state(),
            &mut self.transport,
        );

        summary.link = self
            .state
            .link
            .tick(now, &mut self.radio, &self.state.settings);

        let Self {
            state,
            store,
            server,
            radio,
            requests,
            ..
        } = &mut *self;
        let signal_dbm = radio.signal_dbm();
        summary.served_request = requests.serve_one(&mut |request: &ConfigRequest| {
            server.handle_request(
                request,
                &mut state.settings,
                &mut *store,
                &mut state.link,
                Telemetry {
                    reading: &state.reading,
                    reporter: &state.reporter,
                    signal_dbm,
                    now_ms: now,
                    boot_ms: state.boot_ms,
                },
            )
        });

        self.updater.poll();

        summary
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.tick();
            self.clock.delay_ms(LOOP_YIELD_MS);
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &SettingsStore<B::Storage> {
        &self.store
    }

    pub fn sensor_mut(&mut self) -> &mut B::Sensor {
        &mut self.sensor
    }

    pub fn radio_mut(&mut self) -> &mut B::Radio {
        &mut self.radio
    }

    pub fn transport_mut(&mut self) -> &mut B::Transport {
        &mut self.transport
    }

    pub fn requests_mut(&mut self) -> &mut B::Requests {
        &mut self.requests
    }

    pub fn updater_mut(&mut self) -> &mut B::Updater {
        &mut self.updater
    }

    pub fn clock_mut(&mut self) -> &mut B::Clock {
        &mut self.clock
    }

    /// Hands the collaborators back, e.g. to simulate a reboot.
    pub fn into_peripherals(self) -> Peripherals<B> {
        Peripherals {
            storage: self.store.into_inner(),
            sensor: self.sensor,
            radio: self.radio,
            transport: self.transport,
            requests: self.requests,
            updater: self.updater,
            clock: self.clock,
        }
    }
}
