//! Status page rendering into a fixed buffer.

use core::fmt::{self, Write};

use crate::{
    config::{Settings, PATH_FIELD_LEN, SSID_FIELD_LEN},
    link::LinkState,
    report::{ReportStatus, TransportError},
    timer::elapsed_ms,
    types::Reading,
};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const TEMPLATE: &str = include_str!("../assets/status.html");

/// Longest HTML escape of a single byte (`&quot;`).
const ESCAPE_MAX: usize = 6;

// Worst-case rendered width of every placeholder.
const TEMP_MAX: usize = 48;
const LINK_MAX: usize = 10;
const RSSI_MAX: usize = 8;
const STATUS_MAX: usize = 16;
const AGE_MAX: usize = 16;
const SSID_MAX: usize = (SSID_FIELD_LEN - 1) * ESCAPE_MAX;
const SEND_CHECKED_MAX: usize = 8;
const U16_MAX: usize = 5;
const HOST_MAX: usize = 15;
const PATH_MAX: usize = (PATH_FIELD_LEN - 1) * ESCAPE_MAX;
const UPTIME_MAX: usize = 16;

const WORST_CASE_FIELDS: usize = TEMP_MAX
    + LINK_MAX
    + RSSI_MAX
    + STATUS_MAX
    + 2 * AGE_MAX
    + SSID_MAX
    + SEND_CHECKED_MAX
    + 2 * U16_MAX
    + HOST_MAX
    + PATH_MAX
    + UPTIME_MAX
    + FIRMWARE_VERSION.len();

pub const PAGE_CAPACITY: usize = 4096;

const _: () = assert!(TEMPLATE.len() + WORST_CASE_FIELDS <= PAGE_CAPACITY);

pub type Page = heapless::String<PAGE_CAPACITY>;

/// Everything the status page shows.
#[derive(Debug, Clone, Copy)]
pub struct StatusView<'a> {
    pub settings: &'a Settings,
    pub reading: &'a Reading,
    pub link: LinkState,
    pub signal_dbm: Option<i8>,
    pub last_status: Option<&'a ReportStatus>,
    pub last_attempt_ms: Option<u32>,
    pub last_success_ms: Option<u32>,
    pub now_ms: u32,
    pub boot_ms: u32,
}

/// `fmt::Write` over a bounded string. Overflow truncates; debug builds assert.
pub struct PageWriter<const N: usize> {
    buf: heapless::String<N>,
    truncated: bool,
}

impl<const N: usize> PageWriter<N> {
    pub fn new() -> Self {
        Self {
            buf: heapless::String::new(),
            truncated: false,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_inner(self) -> heapless::String<N> {
        self.buf
    }
}

impl<const N: usize> Default for PageWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for PageWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.truncated {
            return Ok(());
        }
        if self.buf.push_str(s).is_ok() {
            return Ok(());
        }
        for c in s.chars() {
            if self.buf.push(c).is_err() {
                break;
            }
        }
        self.truncated = true;
        debug_assert!(false, "page buffer overflow at {N} bytes");
        Ok(())
    }
}

/// Writes `text` with the HTML metacharacters escaped.
pub fn escape_html<W: Write>(out: &mut W, text: &str) -> fmt::Result {
    let mut rest = text;
    while let Some(at) = rest.find(['&', '<', '>', '"', '\'']) {
        out.write_str(&rest[..at])?;
        out.write_str(match rest.as_bytes()[at] {
            b'&' => "&amp;",
            b'<' => "&lt;",
            b'>' => "&gt;",
            b'"' => "&quot;",
            _ => "&#39;",
        })?;
        rest = &rest[at + 1..];
    }
    out.write_str(rest)
}

fn write_age<W: Write>(out: &mut W, now_ms: u32, at_ms: Option<u32>) -> fmt::Result {
    match at_ms {
        Some(at) => write!(out, "{}s ago", elapsed_ms(now_ms, at) / 1_000),
        None => out.write_str("never"),
    }
}

fn write_status<W: Write>(out: &mut W, status: Option<&ReportStatus>) -> fmt::Result {
    match status {
        None => out.write_str("none"),
        Some(ReportStatus::Http(code)) => write!(out, "HTTP {code}"),
        Some(ReportStatus::Failed(TransportError::Timeout)) => out.write_str("timeout"),
        Some(ReportStatus::Failed(TransportError::Unreachable(_))) => out.write_str("unreachable"),
        Some(ReportStatus::Failed(TransportError::InvalidResponse(_))) => {
            out.write_str("bad response")
        }
    }
}

fn write_uptime<W: Write>(out: &mut W, secs: u32) -> fmt::Result {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let minutes = secs % 3_600 / 60;
    write!(out, "{days}d {hours:02}:{minutes:02}:{:02}", secs % 60)
}

fn write_field<W: Write>(out: &mut W, name: &str, view: &StatusView<'_>) -> fmt::Result {
    let settings = view.settings;
    match name {
        "temp" if view.reading.is_valid() => write!(out, "{:.3}", view.reading.celsius),
        "temp" => out.write_str("--"),
        "link" => out.write_str(view.link.as_str()),
        "rssi" => match view.signal_dbm {
            Some(dbm) => write!(out, "{dbm} dBm"),
            None => out.write_str("n/a"),
        },
        "status" => write_status(out, view.last_status),
        "attempt_age" => write_age(out, view.now_ms, view.last_attempt_ms),
        "success_age" => write_age(out, view.now_ms, view.last_success_ms),
        "ssid" => escape_html(out, settings.ssid.as_str()),
        "host" => write!(out, "{}", settings.target_ip),
        "port" => write!(out, "{}", settings.target_port),
        "path" => escape_html(out, settings.target_path.as_str()),
        "send_checked" if settings.report_enabled => out.write_str(" checked"),
        "send_checked" => Ok(()),
        "delay" => write!(out, "{}", settings.report_interval_s),
        "uptime" => write_uptime(out, elapsed_ms(view.now_ms, view.boot_ms) / 1_000),
        "version" => out.write_str(FIRMWARE_VERSION),
        _ => {
            debug_assert!(false, "unknown placeholder {name}");
            Ok(())
        }
    }
}

/// Renders the status page. Never fails; an oversized page is truncated.
pub fn render_status(view: &StatusView<'_>) -> Page {
    let mut out = PageWriter::<PAGE_CAPACITY>::new();
    let mut rest = TEMPLATE;

    while let Some(open) = rest.find("{{") {
        let _ = out.write_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            rest = &rest[open..];
            break;
        };
        let _ = write_field(&mut out, &after[..close], view);
        rest = &after[close + 2..];
    }
    let _ = out.write_str(rest);

    out.into_inner()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::FixedStr;

    fn view<'a>(settings: &'a Settings, reading: &'a Reading) -> StatusView<'a> {
        StatusView {
            settings,
            reading,
            link: LinkState::Connected,
            signal_dbm: Some(-61),
            last_status: None,
            last_attempt_ms: None,
            last_success_ms: None,
            now_ms: 90_061_000,
            boot_ms: 0,
        }
    }

    #[test]
    fn renders_reading_and_settings() {
        let settings = Settings {
            ssid: FixedStr::new("Home").unwrap(),
            target_ip: Ipv4Addr::new(10, 0, 0, 5),
            target_port: 9000,
            target_path: FixedStr::new("/ingest").unwrap(),
            report_interval_s: 30,
            report_enabled: true,
            ..Settings::default()
        };
        let reading = Reading::new(23.456, 0);
        let status = ReportStatus::Http(200);
        let mut view = view(&settings, &reading);
        view.last_status = Some(&status);
        view.last_attempt_ms = Some(90_000_000);

        let page = render_status(&view);

        assert!(page.contains("23.456 &deg;C"));
        assert!(page.contains("connected (-61 dBm)"));
        assert!(page.contains("HTTP 200, 61s ago"));
        assert!(page.contains("<td>never</td>"));
        assert!(page.contains("<td>1d 01:01:01</td>"));
        assert!(page.contains(r#"value="Home""#));
        assert!(page.contains(r#"value="10.0.0.5""#));
        assert!(page.contains(r#"value="9000""#));
        assert!(page.contains(r#"value="/ingest""#));
        assert!(page.contains(r#"type="checkbox" checked>"#));
        assert!(page.contains(r#"value="30""#));
        assert!(!page.contains("{{"));
    }

    #[test]
    fn invalid_reading_and_missing_signal() {
        let settings = Settings::default();
        let reading = Reading::none();
        let mut view = view(&settings, &reading);
        view.link = LinkState::Connecting;
        view.signal_dbm = None;

        let page = render_status(&view);

        assert!(page.contains("-- &deg;C"));
        assert!(page.contains("connecting (n/a)"));
        assert!(page.contains("none, never"));
        assert!(page.contains(r#"type="checkbox">"#));
    }

    #[test]
    fn user_strings_are_escaped() {
        let settings = Settings {
            ssid: FixedStr::new(r#""><script>"#).unwrap(),
            ..Settings::default()
        };
        let reading = Reading::none();
        let page = render_status(&view(&settings, &reading));

        assert!(!page.contains("<script>"));
        assert!(page.contains("&quot;&gt;&lt;script&gt;"));
    }

    #[test]
    fn worst_case_page_fits() {
        let settings = Settings {
            ssid: FixedStr::new(&"\"".repeat(23)).unwrap(),
            target_ip: Ipv4Addr::new(255, 255, 255, 255),
            target_port: u16::MAX,
            target_path: FixedStr::new(&"&".repeat(63)).unwrap(),
            report_interval_s: u16::MAX,
            report_enabled: true,
            ..Settings::default()
        };
        let reading = Reading::new(-99.999, 0);
        let status = ReportStatus::Failed(TransportError::InvalidResponse("x".repeat(500)));
        let mut view = view(&settings, &reading);
        view.last_status = Some(&status);
        view.last_attempt_ms = Some(1);
        view.last_success_ms = Some(1);
        view.now_ms = u32::MAX;

        let page = render_status(&view);
        assert!(page.ends_with("</html>\n"));
    }

    #[test]
    fn escape_html_passes_plain_text_through() {
        let mut out = String::new();
        escape_html(&mut out, "plain & <simple> 'text'").unwrap();
        assert_eq!(out, "plain &amp; &lt;simple&gt; &#39;text&#39;");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "page buffer overflow")]
    fn overflow_asserts_in_debug_builds() {
        let mut out = PageWriter::<4>::new();
        let _ = out.write_str("too long");
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn overflow_truncates_in_release_builds() {
        let mut out = PageWriter::<4>::new();
        let _ = out.write_str("too long");
        assert!(out.is_truncated());
        assert_eq!(out.into_inner().as_str(), "too ");
    }
}
