use log::{info, warn};

use crate::{config::Settings, hal::Radio, timer::elapsed_ms};

pub const DEFAULT_RETRY_INTERVAL_MS: u32 = 500;
pub const DEFAULT_MAX_ATTEMPTS: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Transition taken by one [`LinkManager::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    AttemptStarted,
    Connected,
    StillConnecting { attempt: u8 },
    GaveUp { attempts: u8 },
    Lost,
}

/// Wireless association state machine with bounded retries.
///
/// Hardware connect calls are only issued when leaving `Idle`, and never
/// twice within one retry interval.
#[derive(Debug, Clone)]
pub struct LinkManager {
    state: LinkState,
    attempts: u8,
    last_attempt_ms: u32,
    last_connect_ms: Option<u32>,
    retry_interval_ms: u32,
    max_attempts: u8,
}

impl LinkManager {
    pub fn new(retry_interval_ms: u32, max_attempts: u8) -> Self {
        Self {
            state: LinkState::Idle,
            attempts: 0,
            last_attempt_ms: 0,
            last_connect_ms: None,
            retry_interval_ms,
            // The counter saturates at u8::MAX, so the ceiling must stay below it.
            max_attempts: max_attempts.min(u8::MAX - 1),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn last_attempt_ms(&self) -> u32 {
        self.last_attempt_ms
    }

    /// Drops back to `Idle` so the next tick reconnects with fresh settings.
    pub fn force_idle(&mut self) {
        if self.state != LinkState::Idle {
            info!("link: forced idle from {}", self.state.as_str());
        }
        self.state = LinkState::Idle;
    }

    pub fn tick<R: Radio + ?Sized>(
        &mut self,
        now_ms: u32,
        radio: &mut R,
        settings: &Settings,
    ) -> Option<LinkEvent> {
        match self.state {
            LinkState::Idle => self.start_attempt(now_ms, radio, settings),
            LinkState::Connecting => {
                if radio.is_connected() {
                    self.state = LinkState::Connected;
                    self.attempts = 0;
                    info!("link: connected to {:?}", settings.ssid.as_str());
                    return Some(LinkEvent::Connected);
                }
                if elapsed_ms(now_ms, self.last_attempt_ms) < self.retry_interval_ms {
                    return None;
                }

                self.attempts = self.attempts.saturating_add(1);
                if self.attempts > self.max_attempts {
                    self.state = LinkState::Idle;
                    warn!("link: giving up after {} retry windows", self.attempts);
                    Some(LinkEvent::GaveUp {
                        attempts: self.attempts,
                    })
                } else {
                    self.last_attempt_ms = now_ms;
                    Some(LinkEvent::StillConnecting {
                        attempt: self.attempts,
                    })
                }
            }
            LinkState::Connected => {
                if radio.is_connected() {
                    None
                } else {
                    self.state = LinkState::Idle;
                    warn!("link: lost association");
                    Some(LinkEvent::Lost)
                }
            }
        }
    }

    fn start_attempt<R: Radio + ?Sized>(
        &mut self,
        now_ms: u32,
        radio: &mut R,
        settings: &Settings,
    ) -> Option<LinkEvent> {
        if let Some(last) = self.last_connect_ms {
            if elapsed_ms(now_ms, last) < self.retry_interval_ms {
                return None;
            }
        }

        radio.disconnect();
        if let Err(err) = radio.connect(settings.ssid.as_str(), settings.pass.as_str()) {
            // The retry window still runs; the next give-up cycles back here.
            warn!("link: connect failed to start: {err}");
        }

        self.state = LinkState::Connecting;
        self.attempts = 0;
        self.last_attempt_ms = now_ms;
        self.last_connect_ms = Some(now_ms);
        info!("link: connecting to {:?}", settings.ssid.as_str());
        Some(LinkEvent::AttemptStarted)
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL_MS, DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{hal::RadioError, types::FixedStr};

    #[derive(Default)]
    struct FakeRadio {
        connected: bool,
        connects: Vec<(String, String)>,
        disconnects: usize,
        fail_connect: bool,
    }

    impl Radio for FakeRadio {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self, ssid: &str, pass: &str) -> Result<(), RadioError> {
            self.connects.push((ssid.to_owned(), pass.to_owned()));
            if self.fail_connect {
                Err(RadioError::Association("no AP".into()))
            } else {
                Ok(())
            }
        }

        fn disconnect(&mut self) {
            self.connected = false;
            self.disconnects += 1;
        }

        fn signal_dbm(&self) -> Option<i8> {
            self.connected.then_some(-60)
        }
    }

    fn settings(ssid: &str) -> Settings {
        Settings {
            ssid: FixedStr::new(ssid).unwrap(),
            pass: FixedStr::new("secret").unwrap(),
            ..Settings::default()
        }
    }

    #[test]
    fn first_tick_starts_attempt_with_current_identity() {
        let mut link = LinkManager::default();
        let mut radio = FakeRadio::default();

        assert_eq!(
            link.tick(0, &mut radio, &settings("Home")),
            Some(LinkEvent::AttemptStarted)
        );
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(radio.disconnects, 1);
        assert_eq!(radio.connects, vec![("Home".into(), "secret".into())]);
    }

    #[test]
    fn connects_and_detects_loss() {
        let mut link = LinkManager::default();
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        link.tick(0, &mut radio, &home);
        radio.connected = true;
        assert_eq!(link.tick(10, &mut radio, &home), Some(LinkEvent::Connected));
        assert_eq!(link.tick(20, &mut radio, &home), None);
        assert_eq!(link.state(), LinkState::Connected);

        radio.connected = false;
        assert_eq!(link.tick(30, &mut radio, &home), Some(LinkEvent::Lost));
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn stays_connecting_inside_retry_window() {
        let mut link = LinkManager::new(500, 20);
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        link.tick(1_000, &mut radio, &home);
        assert_eq!(link.tick(1_499, &mut radio, &home), None);
        assert_eq!(link.attempts(), 0);
        assert_eq!(
            link.tick(1_500, &mut radio, &home),
            Some(LinkEvent::StillConnecting { attempt: 1 })
        );
        assert_eq!(link.last_attempt_ms(), 1_500);
        assert_eq!(radio.connects.len(), 1);
    }

    #[test]
    fn gives_up_after_maximum_plus_one_windows_then_restarts() {
        let mut link = LinkManager::new(500, 20);
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        link.tick(0, &mut radio, &home);
        let mut now = 0;
        for expected in 1..=20 {
            now += 500;
            assert_eq!(
                link.tick(now, &mut radio, &home),
                Some(LinkEvent::StillConnecting { attempt: expected })
            );
            assert!(link.attempts() <= 20);
        }
        assert_eq!(link.attempts(), 20);
        assert_eq!(link.state(), LinkState::Connecting);

        now += 500;
        assert_eq!(
            link.tick(now, &mut radio, &home),
            Some(LinkEvent::GaveUp { attempts: 21 })
        );
        assert_eq!(link.state(), LinkState::Idle);

        now += 1;
        assert_eq!(
            link.tick(now, &mut radio, &home),
            Some(LinkEvent::AttemptStarted)
        );
        assert_eq!(link.attempts(), 0);
        assert_eq!(radio.connects.len(), 2);
    }

    #[test]
    fn largest_ceiling_still_gives_up() {
        let mut link = LinkManager::new(500, u8::MAX);
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        link.tick(0, &mut radio, &home);
        let mut now = 0;
        let mut gave_up = None;
        for _ in 0..2_000 {
            now += 500;
            if let Some(LinkEvent::GaveUp { attempts }) = link.tick(now, &mut radio, &home) {
                gave_up = Some(attempts);
                break;
            }
        }

        assert_eq!(gave_up, Some(u8::MAX));
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(
            link.tick(now + 500, &mut radio, &home),
            Some(LinkEvent::AttemptStarted)
        );
        assert_eq!(radio.connects.len(), 2);
    }

    #[test]
    fn never_connects_twice_within_retry_interval() {
        let mut link = LinkManager::new(500, 3);
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        // Flap the hardware link for a while and record every connect call.
        let mut stamps = Vec::new();
        for now in (0..20_000_u32).step_by(7) {
            radio.connected = now % 3 == 0;
            let before = radio.connects.len();
            link.tick(now, &mut radio, &home);
            if radio.connects.len() > before {
                stamps.push(now);
            }
        }
        assert!(stamps.len() > 1);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= 500, "connects at {pair:?}");
        }
    }

    #[test]
    fn force_idle_reconnects_with_new_identity() {
        let mut link = LinkManager::default();
        let mut radio = FakeRadio::default();

        link.tick(0, &mut radio, &settings("Home"));
        radio.connected = true;
        link.tick(10, &mut radio, &settings("Home"));
        assert_eq!(link.state(), LinkState::Connected);

        link.force_idle();
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(
            link.tick(600, &mut radio, &settings("Office")),
            Some(LinkEvent::AttemptStarted)
        );
        assert_eq!(radio.connects.last().unwrap().0, "Office");
        assert_eq!(link.state(), LinkState::Connecting);
    }

    #[test]
    fn failed_connect_still_enters_retry_window() {
        let mut link = LinkManager::new(500, 1);
        let mut radio = FakeRadio {
            fail_connect: true,
            ..FakeRadio::default()
        };
        let home = settings("Home");

        assert_eq!(
            link.tick(0, &mut radio, &home),
            Some(LinkEvent::AttemptStarted)
        );
        assert_eq!(
            link.tick(500, &mut radio, &home),
            Some(LinkEvent::StillConnecting { attempt: 1 })
        );
        assert_eq!(
            link.tick(1_000, &mut radio, &home),
            Some(LinkEvent::GaveUp { attempts: 2 })
        );
    }

    #[test]
    fn retry_window_survives_clock_wrap() {
        let mut link = LinkManager::new(500, 20);
        let mut radio = FakeRadio::default();
        let home = settings("Home");

        link.tick(u32::MAX - 100, &mut radio, &home);
        assert_eq!(link.tick(300, &mut radio, &home), None);
        assert_eq!(
            link.tick(399, &mut radio, &home),
            Some(LinkEvent::StillConnecting { attempt: 1 })
        );
    }
}
