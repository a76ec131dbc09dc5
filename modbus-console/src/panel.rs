//! The console's view model: a projection of gateway status snapshots into
//! indicator/field/table state. All rendering rules live here so the event
//! loop can re-apply snapshots (real or optimistic) in any order.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use modbus_link::{ConnectionStatus, DisplayFormat, KeepAlive, Mode, RegisterData};

use crate::format;

/// Lines of the debug log shown at once.
const DEBUG_VIEWPORT_LINES: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indicator {
    Neutral,
    Connecting,
    Connected,
    Error,
}

impl Indicator {
    pub fn symbol(self) -> &'static str {
        match self {
            Indicator::Neutral => "○",
            Indicator::Connecting => "◌",
            Indicator::Connected => "●",
            Indicator::Error => "✗",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BannerSlot {
    Connection,
    Registers,
}

/// A transient message area. The generation counter lets a scheduled
/// auto-dismiss recognise that its message has since been replaced.
#[derive(Clone, Debug, Default)]
pub struct Banner {
    text: String,
    error: bool,
    gen: u64,
}

impl Banner {
    fn set(&mut self, text: String, error: bool) -> u64 {
        self.text = text;
        self.error = error;
        self.gen += 1;
        self.gen
    }

    fn clear(&mut self) {
        self.text.clear();
        self.error = false;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub address: u16,
    pub value: String,
    pub raw: Option<u16>,
}

/// The results table is either one explanatory notice or one row per
/// register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Table {
    Notice(String),
    Rows(Vec<Row>),
}

/// Scrollable view over the full gateway log text. A refresh replaces the
/// text and follows the tail only if the viewport already was at the tail.
#[derive(Clone, Debug)]
pub struct LogView {
    text: String,
    scroll_top: usize,
    viewport: usize,
}

impl LogView {
    fn new(viewport: usize) -> Self {
        LogView {
            text: String::new(),
            scroll_top: 0,
            viewport,
        }
    }

    pub fn replace(&mut self, lines: &[String]) {
        let stick = self.at_bottom();
        self.text = lines.join("\n");
        if stick {
            self.scroll_top = self.max_scroll();
        }
    }

    pub fn append_line(&mut self, line: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll_top = self.scroll_top.saturating_sub(lines);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_top = (self.scroll_top + lines).min(self.max_scroll());
    }

    pub fn at_bottom(&self) -> bool {
        self.scroll_top >= self.max_scroll()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn visible(&self) -> impl Iterator<Item = &str> {
        self.text
            .lines()
            .skip(self.scroll_top)
            .take(self.viewport)
    }

    fn line_count(&self) -> usize {
        if self.text.is_empty() {
            0
        } else {
            self.text.lines().count()
        }
    }

    fn max_scroll(&self) -> usize {
        self.line_count().saturating_sub(self.viewport)
    }
}

#[derive(Clone, Debug)]
pub struct Panel {
    status_line: String,
    indicator: Indicator,
    mode_label: String,
    uptime_label: String,
    keep_alive_label: String,
    keep_alive_failed: bool,

    ip: String,
    port: String,
    unit_id: String,
    mode: Mode,
    connect_enabled: bool,
    disconnect_enabled: bool,
    connection_inputs_enabled: bool,

    start_addr: String,
    reg_count: String,
    format: DisplayFormat,
    register_controls_enabled: bool,
    read_in_progress: bool,
    update_in_progress: bool,

    table: Table,
    last_update: String,

    connection_banner: Banner,
    register_banner: Banner,

    debug_open: bool,
    log: LogView,
}

impl Default for Panel {
    fn default() -> Self {
        Panel {
            status_line: "Status: Unknown".to_owned(),
            indicator: Indicator::Neutral,
            mode_label: String::new(),
            uptime_label: String::new(),
            keep_alive_label: String::new(),
            keep_alive_failed: false,

            ip: String::new(),
            port: Mode::Tcp.default_port().to_string(),
            unit_id: String::new(),
            mode: Mode::Tcp,
            connect_enabled: true,
            disconnect_enabled: false,
            connection_inputs_enabled: true,

            start_addr: "0".to_owned(),
            reg_count: "10".to_owned(),
            format: DisplayFormat::Dec,
            register_controls_enabled: false,
            read_in_progress: false,
            update_in_progress: false,

            table: Table::Notice("Disconnected.".to_owned()),
            last_update: "N/A".to_owned(),

            connection_banner: Banner::default(),
            register_banner: Banner::default(),

            debug_open: false,
            log: LogView::new(DEBUG_VIEWPORT_LINES),
        }
    }
}

impl Panel {
    /// Projects a status snapshot onto the panel. Holds for every snapshot,
    /// server-sent or optimistic; in particular it must never clobber
    /// in-progress edits of the connection fields while disconnected.
    pub fn apply_status(&mut self, status: &ConnectionStatus) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.apply_status_at(status, now);
    }

    pub fn apply_status_at(&mut self, status: &ConnectionStatus, now_epoch: f64) {
        let connected = status.connected;
        let connecting = status.is_connecting;
        let mode = status.mode.unwrap_or_default();

        self.status_line = format!(
            "Status: {}",
            status.message.as_deref().unwrap_or("Unknown")
        );
        self.indicator = if connected {
            Indicator::Connected
        } else if status.last_error.is_some() && !connecting {
            Indicator::Error
        } else if connecting {
            Indicator::Connecting
        } else {
            Indicator::Neutral
        };
        self.mode_label = if connected || connecting {
            format!("({})", mode.label())
        } else {
            String::new()
        };
        self.uptime_label = if connected {
            format!("(up {})", format::uptime(status.uptime_seconds.unwrap_or(0.0)))
        } else {
            String::new()
        };
        self.keep_alive_label = if connected {
            format::keep_alive(status.last_keep_alive_ok, now_epoch)
        } else {
            String::new()
        };
        self.keep_alive_failed = status.last_keep_alive_ok == KeepAlive::Failed;

        let connection_locked = connected || connecting;
        self.connect_enabled = !connection_locked;
        self.disconnect_enabled = connection_locked;
        self.connection_inputs_enabled = !connection_locked;
        self.register_controls_enabled = connected;

        // The connection fields belong to the server only while a link is up
        // or coming up; while disconnected they belong to the user. Skipping
        // the write when the value already matches leaves an actively edited
        // field untouched.
        if connection_locked {
            if let Some(ip) = &status.ip {
                if self.ip != *ip {
                    self.ip = ip.clone();
                }
            }
            if let Some(port) = status.port {
                let port = port.to_string();
                if self.port != port {
                    self.port = port;
                }
            }
            if let Some(unit_id) = status.unit_id {
                let unit_id = unit_id.to_string();
                if self.unit_id != unit_id {
                    self.unit_id = unit_id;
                }
            }
            if let Some(mode) = status.mode {
                if self.mode != mode {
                    self.mode = mode;
                }
            }
        }

        if !connection_locked {
            if status.last_error.is_none() || self.connection_banner.is_empty() {
                self.table = Table::Notice("Disconnected.".to_owned());
                self.last_update = "N/A".to_owned();
            }
        } else if connected && self.connection_banner.is_error() {
            self.connection_banner.clear();
        }

        if !connection_locked {
            if let Some(error) = &status.last_error {
                self.connection_banner
                    .set(format!("Error: {error}"), true);
            }
        }
    }

    /// Rebuilds the results table from a register read. Empty value lists
    /// are still a success and render as a notice, distinct per cause.
    pub fn show_registers(&mut self, data: &RegisterData) {
        let values = data.values.as_deref().unwrap_or(&[]);
        if !values.is_empty() {
            let start = data.start_addr.unwrap_or(0);
            let raw = data.raw_values.as_deref().unwrap_or(&[]);
            let rows = values
                .iter()
                .enumerate()
                .map(|(i, value)| Row {
                    address: start.wrapping_add(i as u16),
                    value: display_value(value),
                    raw: raw.get(i).copied(),
                })
                .collect();
            self.table = Table::Rows(rows);
        } else if data.count.unwrap_or(0) > 0 {
            self.table = Table::Notice("Read OK, 0 values received.".to_owned());
        } else {
            self.table = Table::Notice("Count to read is 0.".to_owned());
        }
        self.last_update = match data.last_update {
            Some(ts) => format::clock_time(ts),
            None => "now".to_owned(),
        };
    }

    pub fn set_banner<M: Into<String>>(&mut self, slot: BannerSlot, text: M, error: bool) -> u64 {
        self.banner_mut(slot).set(text.into(), error)
    }

    /// Clears a banner only if the scheduling generation still matches, so a
    /// stale auto-dismiss never erases a newer message.
    pub fn clear_banner_expired(&mut self, slot: BannerSlot, gen: u64) {
        let banner = self.banner_mut(slot);
        if banner.gen == gen {
            banner.clear();
        }
    }

    pub fn banner(&self, slot: BannerSlot) -> &Banner {
        match slot {
            BannerSlot::Connection => &self.connection_banner,
            BannerSlot::Registers => &self.register_banner,
        }
    }

    fn banner_mut(&mut self, slot: BannerSlot) -> &mut Banner {
        match slot {
            BannerSlot::Connection => &mut self.connection_banner,
            BannerSlot::Registers => &mut self.register_banner,
        }
    }

    pub fn set_ip(&mut self, value: String) {
        self.ip = value;
    }

    pub fn set_port(&mut self, value: String) {
        self.port = value;
    }

    pub fn set_unit_id(&mut self, value: String) {
        self.unit_id = value;
    }

    /// Switching mode re-seeds the port with the protocol default, once per
    /// switch; later edits belong to the user again.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.port = mode.default_port().to_string();
    }

    pub fn set_start_addr(&mut self, value: String) {
        self.start_addr = value;
    }

    pub fn set_reg_count(&mut self, value: String) {
        self.reg_count = value;
    }

    pub fn set_format(&mut self, format: DisplayFormat) {
        self.format = format;
    }

    pub fn set_read_in_progress(&mut self, busy: bool) {
        self.read_in_progress = busy;
    }

    pub fn set_update_in_progress(&mut self, busy: bool) {
        self.update_in_progress = busy;
    }

    pub fn set_debug_open(&mut self, open: bool) {
        self.debug_open = open;
    }

    pub fn log(&self) -> &LogView {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut LogView {
        &mut self.log
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn indicator(&self) -> Indicator {
        self.indicator
    }

    pub fn phase_labels(&self) -> (&str, &str, &str) {
        (&self.mode_label, &self.uptime_label, &self.keep_alive_label)
    }

    pub fn keep_alive_failed(&self) -> bool {
        self.keep_alive_failed
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn start_addr(&self) -> &str {
        &self.start_addr
    }

    pub fn reg_count(&self) -> &str {
        &self.reg_count
    }

    pub fn format(&self) -> DisplayFormat {
        self.format
    }

    pub fn connect_enabled(&self) -> bool {
        self.connect_enabled
    }

    pub fn disconnect_enabled(&self) -> bool {
        self.disconnect_enabled
    }

    pub fn connection_inputs_enabled(&self) -> bool {
        self.connection_inputs_enabled
    }

    pub fn register_controls_enabled(&self) -> bool {
        self.register_controls_enabled
    }

    pub fn read_in_progress(&self) -> bool {
        self.read_in_progress
    }

    pub fn update_in_progress(&self) -> bool {
        self.update_in_progress
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn last_update(&self) -> &str {
        &self.last_update
    }

    pub fn debug_open(&self) -> bool {
        self.debug_open
    }

    /// Renders the whole panel as a text block for the terminal.
    pub fn frame(&self) -> String {
        let mut out = String::new();

        let _ = write!(out, "{} {}", self.indicator.symbol(), self.status_line);
        for label in [
            &self.mode_label,
            &self.uptime_label,
            &self.keep_alive_label,
        ] {
            if !label.is_empty() {
                let _ = write!(out, " {label}");
            }
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "  link: ip={} port={} unit={} mode={}{}",
            self.ip,
            self.port,
            self.unit_id,
            self.mode,
            if self.connection_inputs_enabled {
                ""
            } else {
                " [locked]"
            }
        );
        let _ = writeln!(
            out,
            "  read: addr={} count={} format={}{}",
            self.start_addr,
            self.reg_count,
            self.format,
            if self.register_controls_enabled {
                ""
            } else {
                " [disabled]"
            }
        );

        for banner in [&self.connection_banner, &self.register_banner] {
            if !banner.is_empty() {
                let _ = writeln!(
                    out,
                    "  {} {}",
                    if banner.is_error() { "!" } else { "-" },
                    banner.text()
                );
            }
        }

        match &self.table {
            Table::Notice(notice) => {
                let _ = writeln!(out, "  [{notice}] (updated {})", self.last_update);
            }
            Table::Rows(rows) => {
                for row in rows {
                    let _ = write!(out, "  {:>5} (0x{:04X})  {}", row.address, row.address, row.value);
                    if let Some(raw) = row.raw {
                        let _ = write!(out, "  raw={raw}");
                    }
                    out.push('\n');
                }
                let _ = writeln!(out, "  updated {}", self.last_update);
            }
        }

        if self.debug_open {
            out.push_str("  --- debug log ---\n");
            for line in self.log.visible() {
                let _ = writeln!(out, "  | {line}");
            }
        }

        out
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn snapshot(connected: bool, connecting: bool) -> ConnectionStatus {
    ConnectionStatus {
        connected,
        is_connecting: connecting,
        ..Default::default()
    }
}

#[test]
fn disconnected_renders_never_touch_user_edits() {
    let mut panel = Panel::default();
    panel.set_ip("10.0.0.9".to_owned());
    panel.set_port("1502".to_owned());

    let mut status = snapshot(false, false);
    status.ip = Some("1.2.3.4".to_owned());
    status.port = Some(502);

    for _ in 0..5 {
        panel.apply_status(&status);
    }

    assert_eq!(panel.ip(), "10.0.0.9");
    assert_eq!(panel.port(), "1502");
}

#[test]
fn connected_snapshot_populates_inputs() {
    let mut panel = Panel::default();
    panel.set_ip("stale".to_owned());

    let mut status = snapshot(true, false);
    status.ip = Some("10.10.10.219".to_owned());
    status.port = Some(502);
    status.unit_id = Some(3);
    status.mode = Some(Mode::Rtu);
    panel.apply_status(&status);

    assert_eq!(panel.ip(), "10.10.10.219");
    assert_eq!(panel.port(), "502");
    assert_eq!(panel.unit_id(), "3");
    assert_eq!(panel.mode(), Mode::Rtu);
}

#[test]
fn phase_consistency_of_controls() {
    let mut panel = Panel::default();

    panel.apply_status(&snapshot(true, false));
    assert!(panel.register_controls_enabled());
    assert!(!panel.connection_inputs_enabled());
    assert!(!panel.connect_enabled());
    assert!(panel.disconnect_enabled());

    panel.apply_status(&snapshot(false, true));
    assert!(!panel.register_controls_enabled());
    assert!(!panel.connection_inputs_enabled());
    assert!(panel.disconnect_enabled());

    panel.apply_status(&snapshot(false, false));
    assert!(panel.connection_inputs_enabled());
    assert!(panel.connect_enabled());
    assert!(!panel.disconnect_enabled());
}

#[test]
fn indicator_precedence() {
    let mut panel = Panel::default();

    let mut status = snapshot(false, true);
    status.last_error = Some("timeout".to_owned());
    panel.apply_status(&status);
    // While connecting an old failure does not show as an error state.
    assert_eq!(panel.indicator(), Indicator::Connecting);

    status.is_connecting = false;
    panel.apply_status(&status);
    assert_eq!(panel.indicator(), Indicator::Error);

    status.connected = true;
    status.is_connecting = false;
    panel.apply_status(&status);
    assert_eq!(panel.indicator(), Indicator::Connected);
}

#[test]
fn error_banner_cleared_once_connected() {
    let mut panel = Panel::default();

    let mut status = snapshot(false, false);
    status.last_error = Some("device unreachable".to_owned());
    panel.apply_status(&status);
    assert!(panel.banner(BannerSlot::Connection).is_error());
    assert_eq!(
        panel.banner(BannerSlot::Connection).text(),
        "Error: device unreachable"
    );

    panel.apply_status(&snapshot(true, false));
    assert!(panel.banner(BannerSlot::Connection).is_empty());
}

#[test]
fn stale_banner_dismiss_is_ignored() {
    let mut panel = Panel::default();
    let old = panel.set_banner(BannerSlot::Registers, "first", false);
    let _new = panel.set_banner(BannerSlot::Registers, "second", true);

    panel.clear_banner_expired(BannerSlot::Registers, old);
    assert_eq!(panel.banner(BannerSlot::Registers).text(), "second");

    panel.clear_banner_expired(BannerSlot::Registers, _new);
    assert!(panel.banner(BannerSlot::Registers).is_empty());
}

#[test]
fn table_sequencing_for_empty_reads() {
    let mut panel = Panel::default();

    // Values present: one row per register, addresses from start_addr.
    let data = RegisterData {
        start_addr: Some(40_001),
        count: Some(2),
        values: Some(vec![
            serde_json::json!("0x9C41"),
            serde_json::json!("0x9C42"),
        ]),
        raw_values: Some(vec![40_001, 40_002]),
        last_update: Some(1_700_000_000.0),
        ..Default::default()
    };
    panel.show_registers(&data);
    match panel.table() {
        Table::Rows(rows) => {
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].address, 40_001);
            assert_eq!(rows[1].address, 40_002);
            assert_eq!(rows[0].value, "0x9C41");
            assert_eq!(rows[0].raw, Some(40_001));
        }
        other => panic!("expected rows, got {other:?}"),
    }

    // Empty values with a non-zero count: the read worked, nothing came back.
    let data = RegisterData {
        count: Some(3),
        values: Some(vec![]),
        ..Default::default()
    };
    panel.show_registers(&data);
    assert_eq!(
        panel.table(),
        &Table::Notice("Read OK, 0 values received.".to_owned())
    );

    // No values key at all and count zero: nothing was asked for.
    let data = RegisterData {
        count: Some(0),
        ..Default::default()
    };
    panel.show_registers(&data);
    assert_eq!(
        panel.table(),
        &Table::Notice("Count to read is 0.".to_owned())
    );
}

#[test]
fn disconnect_resets_table_unless_error_banner_shows() {
    let mut panel = Panel::default();
    let data = RegisterData {
        start_addr: Some(0),
        count: Some(1),
        values: Some(vec![serde_json::json!(7)]),
        ..Default::default()
    };
    panel.show_registers(&data);
    assert!(matches!(panel.table(), Table::Rows(_)));

    // A plain disconnect wipes the table back to the notice.
    panel.apply_status(&snapshot(false, false));
    assert_eq!(panel.table(), &Table::Notice("Disconnected.".to_owned()));
    assert_eq!(panel.last_update(), "N/A");

    // Once the failure banner is showing, later error renders leave the
    // table alone instead of flickering it back to the notice.
    let mut status = snapshot(false, false);
    status.last_error = Some("link dropped".to_owned());
    panel.apply_status(&status);
    assert!(!panel.banner(BannerSlot::Connection).is_empty());

    panel.show_registers(&data);
    panel.apply_status(&status);
    assert!(matches!(panel.table(), Table::Rows(_)));
}

#[test]
fn keep_alive_label_only_while_connected() {
    let mut panel = Panel::default();

    let mut status = snapshot(true, false);
    status.last_keep_alive_ok = KeepAlive::OkAt(1_000.0);
    panel.apply_status_at(&status, 1_003.0);
    assert_eq!(panel.phase_labels().2, "Keep-alive OK (3s ago)");

    status.last_keep_alive_ok = KeepAlive::Failed;
    panel.apply_status_at(&status, 1_003.0);
    assert_eq!(panel.phase_labels().2, "Keep-alive: FAILED");
    assert!(panel.keep_alive_failed());

    status.connected = false;
    panel.apply_status_at(&status, 1_003.0);
    assert_eq!(panel.phase_labels().2, "");
}

#[test]
fn log_view_sticks_to_bottom_only_from_bottom() {
    let mut log = LogView::new(3);

    let lines: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
    log.replace(&lines);
    // Was at the (empty) bottom, so it follows the tail.
    assert!(log.at_bottom());
    assert_eq!(log.visible().collect::<Vec<_>>(), vec![
        "line 7", "line 8", "line 9"
    ]);

    // Scrolled away: a refresh must not yank the viewport back down.
    log.scroll_up(5);
    let lines: Vec<String> = (0..12).map(|i| format!("line {i}")).collect();
    log.replace(&lines);
    assert!(!log.at_bottom());
    assert_eq!(log.visible().next(), Some("line 2"));

    log.scroll_down(100);
    assert!(log.at_bottom());
}

#[test]
fn frame_is_renderable_in_any_state() {
    let mut panel = Panel::default();
    assert!(panel.frame().contains("Status: Unknown"));

    let mut status = snapshot(true, false);
    status.message = Some("Connected".to_owned());
    status.uptime_seconds = Some(61.0);
    panel.apply_status(&status);
    panel.set_debug_open(true);
    panel.log_mut().replace(&["hello".to_owned()]);

    let frame = panel.frame();
    assert!(frame.contains("Status: Connected"));
    assert!(frame.contains("(up 1m 1s)"));
    assert!(frame.contains("debug log"));
    assert!(frame.contains("| hello"));
}
