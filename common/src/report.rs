use core::fmt::Write as _;
use std::net::Ipv4Addr;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::Settings, hal::ReportTransport, link::LinkState, timer::Ticker, types::Reading,
};

pub const REPORT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Enough for `temp=` followed by any finite `f32` with three decimals.
const BODY_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One outbound POST as handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostRequest<'a> {
    pub host: Ipv4Addr,
    pub port: u16,
    pub path: &'a str,
    pub content_type: &'a str,
    pub body: &'a str,
}

impl PostRequest<'_> {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    Http(u16),
    Failed(TransportError),
}

impl ReportStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Http(200))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoReading,
    LinkDown,
}

/// What a due report cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Skipped(SkipReason),
    Sent(ReportStatus),
}

/// Periodic fire-and-forget reporting of the latest reading.
#[derive(Debug, Clone)]
pub struct Reporter {
    ticker: Ticker,
    last_status: Option<ReportStatus>,
    last_attempt_ms: Option<u32>,
    last_success_ms: Option<u32>,
}

impl Reporter {
    pub fn new(now_ms: u32) -> Self {
        Self {
            ticker: Ticker::new(now_ms),
            last_status: None,
            last_attempt_ms: None,
            last_success_ms: None,
        }
    }

    pub fn last_status(&self) -> Option<&ReportStatus> {
        self.last_status.as_ref()
    }

    pub fn last_attempt_ms(&self) -> Option<u32> {
        self.last_attempt_ms
    }

    pub fn last_success_ms(&self) -> Option<u32> {
        self.last_success_ms
    }

    /// Returns `None` when reporting is disabled or the interval has not elapsed.
    pub fn report_if_due<T: ReportTransport + ?Sized>(
        &mut self,
        now_ms: u32,
        settings: &Settings,
        reading: &Reading,
        link: LinkState,
        transport: &mut T,
    ) -> Option<ReportOutcome> {
        if !settings.report_enabled {
            return None;
        }
        if !self.ticker.poll(now_ms, settings.report_interval_ms()) {
            return None;
        }

        if !reading.is_valid() {
            debug!("report: skipped, no valid reading");
            return Some(ReportOutcome::Skipped(SkipReason::NoReading));
        }
        if link != LinkState::Connected {
            debug!("report: skipped, link is {}", link.as_str());
            return Some(ReportOutcome::Skipped(SkipReason::LinkDown));
        }

        let mut body = heapless::String::<BODY_CAPACITY>::new();
        if write!(body, "temp={:.3}", reading.celsius).is_err() {
            warn!("report: reading {} does not fit the body", reading.celsius);
            return Some(ReportOutcome::Skipped(SkipReason::NoReading));
        }

        let request = PostRequest {
            host: settings.target_ip,
            port: settings.target_port,
            path: settings.target_path.as_str(),
            content_type: REPORT_CONTENT_TYPE,
            body: &body,
        };

        let status = match transport.post(&request) {
            Ok(code) => ReportStatus::Http(code),
            Err(err) => ReportStatus::Failed(err),
        };
        match &status {
            ReportStatus::Http(200) => info!("report: {} -> 200", request.url()),
            ReportStatus::Http(code) => warn!("report: {} -> {code}", request.url()),
            ReportStatus::Failed(err) => warn!("report: {} failed: {err}", request.url()),
        }

        self.last_attempt_ms = Some(now_ms);
        if status.is_success() {
            self.last_success_ms = Some(now_ms);
        }
        self.last_status = Some(status.clone());
        Some(ReportOutcome::Sent(status))
    }
}
