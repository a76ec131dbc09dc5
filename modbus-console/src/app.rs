//! The application event loop and the transition handlers for each user
//! action. Every error is converted into a panel banner here; nothing is
//! propagated to the caller.

use std::time::Duration;

use modbus_link::{Client, ConnectRequest, ConnectionStatus, DisplayFormat, Mode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::panel::{BannerSlot, Panel};
use crate::poller::{Poll, Poller, Timing};

/// Default lifetime of a transient banner.
const BANNER_DISMISS: Duration = Duration::from_secs(4);
/// Critical connect failures linger longer.
const CONNECT_FAILURE_DISMISS: Duration = Duration::from_secs(8);
/// Slack after the debug-stop grace before the post-disconnect re-fetch.
const RECHECK_SLACK: Duration = Duration::from_millis(500);

/// Everything the application loop reacts to, in one stream: timer ticks,
/// user commands and deferred deadlines.
#[derive(Debug)]
pub enum Event {
    Poll(Poll),
    Command(Command),
    /// Post-disconnect confirmation fetch is due.
    StatusRecheck,
    BannerExpired {
        slot: BannerSlot,
        gen: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    UpdateParams,
    ReadNow,
    ToggleDebug,
    SetMode(Mode),
    SetIp(String),
    SetPort(String),
    SetUnitId(String),
    SetStartAddr(String),
    SetRegCount(String),
    SetFormat(DisplayFormat),
    LogUp,
    LogDown,
    Quit,
}

/// Lines moved per scroll command.
const LOG_SCROLL_STEP: usize = 5;

const HELP: &str = "\
commands:
  connect | disconnect | update | read | debug | quit
  ip <addr>      port <n>       unit <n>      mode <tcp|rtu>
  addr <n>       count <n>      format <dec|hex|bin>
  up | down      scroll the debug log";

impl Command {
    /// Parses one console input line. `Ok(None)` for a blank line; `Err`
    /// carries the text to show the user (help or a complaint).
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments for '{verb}' (try 'help')"));
        }

        let needs = |arg: Option<&str>| arg.map(str::to_owned).ok_or_else(|| {
            format!("'{verb}' needs a value (try 'help')")
        });

        match verb {
            "connect" => Ok(Some(Command::Connect)),
            "disconnect" => Ok(Some(Command::Disconnect)),
            "update" => Ok(Some(Command::UpdateParams)),
            "read" => Ok(Some(Command::ReadNow)),
            "debug" => Ok(Some(Command::ToggleDebug)),
            "quit" | "exit" => Ok(Some(Command::Quit)),
            "up" => Ok(Some(Command::LogUp)),
            "down" => Ok(Some(Command::LogDown)),
            "help" => Err(HELP.to_owned()),
            "ip" => Ok(Some(Command::SetIp(needs(arg)?))),
            "port" => Ok(Some(Command::SetPort(needs(arg)?))),
            "unit" => Ok(Some(Command::SetUnitId(needs(arg)?))),
            "addr" => Ok(Some(Command::SetStartAddr(needs(arg)?))),
            "count" => Ok(Some(Command::SetRegCount(needs(arg)?))),
            "mode" => Ok(Some(Command::SetMode(needs(arg)?.parse()?))),
            "format" => Ok(Some(Command::SetFormat(needs(arg)?.parse()?))),
            other => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

pub struct App {
    gateway: Client,
    panel: Panel,
    poller: Poller,
    tx: mpsc::Sender<Event>,
    timing: Timing,
    running: bool,
}

impl App {
    pub fn new(gateway: Client, timing: Timing) -> (App, mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(32);
        let app = App {
            gateway,
            panel: Panel::default(),
            poller: Poller::new(tx.clone(), timing),
            tx: tx.clone(),
            timing,
            running: true,
        };
        (app, tx, rx)
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Fetch the server's current state once and line everything up with it.
    pub async fn bootstrap(&mut self) {
        debug!("checking initial state");
        let status = match self.gateway.status().await {
            Ok(Some(status)) => status,
            Ok(None) => {
                self.render_fatal("Could not fetch initial state", "Empty status reply from gateway");
                return;
            }
            Err(error) => {
                self.render_fatal("Could not fetch initial state", &error.to_string());
                return;
            }
        };

        self.panel.apply_status(&status);
        if !status.connected && !status.is_connecting {
            self.poller.stop_all(true);
            return;
        }

        self.poller.start_status();
        self.start_debug_if_needed();

        if status.connected {
            // Preload the read configuration the gateway currently holds.
            match self.gateway.registers(self.panel.format()).await {
                Ok(Some(data)) => {
                    self.panel
                        .set_start_addr(data.start_addr.unwrap_or(0).to_string());
                    self.panel
                        .set_reg_count(data.count.unwrap_or(10).to_string());
                    if let Some(format) = data.format {
                        self.panel.set_format(format);
                    }
                }
                Ok(None) | Err(_) => {
                    self.panel.set_start_addr("0".to_owned());
                    self.panel.set_reg_count("10".to_owned());
                }
            }
        }
    }

    /// Drives the console until a quit command or the input side closing.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<Event>) {
        let mut last_frame = String::new();
        self.redraw(&mut last_frame);
        while self.running {
            let Some(event) = rx.recv().await else { break };
            self.handle_event(event).await;
            self.redraw(&mut last_frame);
        }
        self.poller.stop_all(true);
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Poll(Poll::Status) => self.fetch_status().await,
            Event::Poll(Poll::DebugLog) => self.fetch_debug_log().await,
            Event::Poll(Poll::DebugStopElapsed(gen)) => self.poller.debug_stop_elapsed(gen),
            Event::StatusRecheck => self.fetch_status().await,
            Event::BannerExpired { slot, gen } => self.panel.clear_banner_expired(slot, gen),
            Event::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::UpdateParams => self.update_params().await,
            Command::ReadNow => self.read_now().await,
            Command::ToggleDebug => self.toggle_debug(),
            Command::SetMode(mode) => {
                if self.panel.connection_inputs_enabled() {
                    self.panel.set_mode(mode);
                } else {
                    debug!("connection parameters are locked");
                }
            }
            Command::SetIp(value) => self.edit_connection(|panel| panel.set_ip(value)),
            Command::SetPort(value) => self.edit_connection(|panel| panel.set_port(value)),
            Command::SetUnitId(value) => self.edit_connection(|panel| panel.set_unit_id(value)),
            Command::SetStartAddr(value) => self.edit_registers(|panel| panel.set_start_addr(value)),
            Command::SetRegCount(value) => self.edit_registers(|panel| panel.set_reg_count(value)),
            Command::SetFormat(format) => self.edit_registers(|panel| panel.set_format(format)),
            Command::LogUp => self.panel.log_mut().scroll_up(LOG_SCROLL_STEP),
            Command::LogDown => self.panel.log_mut().scroll_down(LOG_SCROLL_STEP),
            Command::Quit => {
                self.poller.stop_all(true);
                self.running = false;
            }
        }
    }

    fn edit_connection<F: FnOnce(&mut Panel)>(&mut self, edit: F) {
        if self.panel.connection_inputs_enabled() {
            edit(&mut self.panel);
        } else {
            debug!("connection parameters are locked");
        }
    }

    fn edit_registers<F: FnOnce(&mut Panel)>(&mut self, edit: F) {
        if self.panel.register_controls_enabled() {
            edit(&mut self.panel);
        } else {
            debug!("register controls are disabled while disconnected");
        }
    }

    async fn connect(&mut self) {
        let ip = self.panel.ip().trim().to_owned();
        let port = self.panel.port().trim().to_owned();
        let unit_id = self.panel.unit_id().trim().to_owned();
        let mode = self.panel.mode();

        if ip.is_empty() || port.is_empty() || unit_id.is_empty() {
            self.show_banner(
                BannerSlot::Connection,
                "IP, port and unit ID are required.",
                true,
                Some(BANNER_DISMISS),
            );
            return;
        }
        let port = match port.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                self.show_banner(
                    BannerSlot::Connection,
                    "Port must be a number between 0 and 65535.",
                    true,
                    Some(BANNER_DISMISS),
                );
                return;
            }
        };
        let unit_id = match unit_id.parse::<u8>() {
            Ok(unit_id) => unit_id,
            Err(_) => {
                self.show_banner(
                    BannerSlot::Connection,
                    "Unit ID must be a number between 0 and 255.",
                    true,
                    Some(BANNER_DISMISS),
                );
                return;
            }
        };

        // Optimistic: show the attempt before the server confirms anything.
        self.panel.apply_status(&ConnectionStatus {
            is_connecting: true,
            message: Some("Starting connection...".to_owned()),
            mode: Some(mode),
            ..Default::default()
        });
        self.poller.start_status();
        self.start_debug_if_needed();

        let request = ConnectRequest {
            ip,
            port,
            unit_id,
            mode,
        };
        match self.gateway.connect(&request).await {
            Ok(reply) => {
                self.show_banner(
                    BannerSlot::Connection,
                    reply.message.clone(),
                    !reply.success,
                    Some(BANNER_DISMISS),
                );
            }
            Err(error) => {
                self.panel.apply_status(&ConnectionStatus {
                    message: Some("Critical connect failure".to_owned()),
                    last_error: Some(error.to_string()),
                    ..Default::default()
                });
                self.poller.stop_all(true);
                self.show_banner(
                    BannerSlot::Connection,
                    format!("Error: {error}"),
                    true,
                    Some(CONNECT_FAILURE_DISMISS),
                );
            }
        }
    }

    async fn disconnect(&mut self) {
        self.panel.apply_status(&ConnectionStatus {
            message: Some("Disconnecting...".to_owned()),
            ..Default::default()
        });
        self.poller.stop_status();
        self.poller.stop_debug(false);

        match self.gateway.disconnect().await {
            Ok(reply) => self.show_banner(
                BannerSlot::Connection,
                reply.message.clone(),
                !reply.success,
                Some(BANNER_DISMISS),
            ),
            Err(error) => self.show_banner(
                BannerSlot::Connection,
                format!("Error: {error}"),
                true,
                Some(BANNER_DISMISS),
            ),
        }

        // One confirmation fetch once the debounce window has passed, no
        // matter how the disconnect call went.
        let tx = self.tx.clone();
        let delay = self.timing.debug_stop_grace + RECHECK_SLACK;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::StatusRecheck).await;
        });
    }

    async fn update_params(&mut self) {
        // Re-verify against the server, not the cached view state.
        let connected = match self.gateway.status().await {
            Ok(Some(status)) => status.connected,
            _ => false,
        };
        if !connected {
            self.show_banner(
                BannerSlot::Registers,
                "Must be connected.",
                true,
                Some(BANNER_DISMISS),
            );
            return;
        }

        let start_addr = match self.panel.start_addr().trim().parse::<u16>() {
            Ok(start_addr) => start_addr,
            Err(_) => {
                self.show_banner(
                    BannerSlot::Registers,
                    "Start address must be a number between 0 and 65535.",
                    true,
                    Some(BANNER_DISMISS),
                );
                return;
            }
        };
        let count = match self.panel.reg_count().trim().parse::<u16>() {
            Ok(count) => count,
            Err(_) => {
                self.show_banner(
                    BannerSlot::Registers,
                    "Count must be a number between 0 and 65535.",
                    true,
                    Some(BANNER_DISMISS),
                );
                return;
            }
        };

        self.show_banner(BannerSlot::Registers, "Updating parameters...", false, None);
        self.panel.set_update_in_progress(true);
        match self.gateway.update_params(start_addr, count).await {
            Ok(reply) => self.show_banner(
                BannerSlot::Registers,
                reply.message.clone(),
                !reply.success,
                Some(BANNER_DISMISS),
            ),
            Err(error) => self.show_banner(
                BannerSlot::Registers,
                format!("Error: {error}"),
                true,
                Some(BANNER_DISMISS),
            ),
        }
        self.panel.set_update_in_progress(false);
    }

    async fn read_now(&mut self) {
        self.show_banner(BannerSlot::Registers, "Reading...", false, None);
        self.panel.set_read_in_progress(true);

        match self.gateway.read_now().await {
            Ok(reply) => {
                self.show_banner(
                    BannerSlot::Registers,
                    reply.message.clone(),
                    !reply.success,
                    Some(BANNER_DISMISS),
                );
                // The gateway conflates "read succeeded" and "data attached";
                // a failed read that still carries data refreshes the table.
                if reply.success || reply.data.is_some() {
                    match self.gateway.registers(self.panel.format()).await {
                        Ok(Some(data)) => self.panel.show_registers(&data),
                        Ok(None) => {}
                        Err(error) => self.show_banner(
                            BannerSlot::Registers,
                            format!("Read error: {error}"),
                            true,
                            Some(BANNER_DISMISS),
                        ),
                    }
                }
            }
            Err(error) => self.show_banner(
                BannerSlot::Registers,
                format!("Read error: {error}"),
                true,
                Some(BANNER_DISMISS),
            ),
        }

        self.panel.set_read_in_progress(false);
    }

    fn toggle_debug(&mut self) {
        let open = !self.panel.debug_open();
        self.panel.set_debug_open(open);
        if open {
            self.start_debug_if_needed();
        } else {
            // Tear down at once only when nothing is watching the link any
            // more; otherwise debounce so a quick reopen resumes the same
            // session without a gap.
            let idle = !self.poller.status_running() && !self.panel.disconnect_enabled();
            self.poller.stop_debug(idle);
        }
    }

    async fn fetch_status(&mut self) {
        match self.gateway.status().await {
            Ok(Some(status)) => self.panel.apply_status(&status),
            Ok(None) => {}
            Err(error) => {
                // The status endpoint itself is gone; polling it every second
                // cannot recover anything.
                warn!(%error, "status fetch failed, stopping all polling");
                self.render_fatal("Gateway unreachable", &error.to_string());
            }
        }
    }

    async fn fetch_debug_log(&mut self) {
        if !self.panel.debug_open() {
            return;
        }
        match self.gateway.debug_log().await {
            Ok(Some(log)) => self.panel.log_mut().replace(&log.logs),
            Ok(None) => {}
            Err(error) => self
                .panel
                .log_mut()
                .append_line(&format!("--- log error: {error} ---")),
        }
    }

    fn render_fatal(&mut self, message: &str, error: &str) {
        self.panel.apply_status(&ConnectionStatus {
            message: Some(message.to_owned()),
            last_error: Some(error.to_owned()),
            ..Default::default()
        });
        self.poller.stop_all(true);
    }

    fn start_debug_if_needed(&mut self) {
        self.poller
            .start_debug_if_needed(self.panel.debug_open(), self.panel.disconnect_enabled());
    }

    fn show_banner<M: Into<String>>(
        &mut self,
        slot: BannerSlot,
        text: M,
        error: bool,
        dismiss: Option<Duration>,
    ) {
        let gen = self.panel.set_banner(slot, text, error);
        if let Some(after) = dismiss {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(Event::BannerExpired { slot, gen }).await;
            });
        }
    }

    fn redraw(&self, last_frame: &mut String) {
        let frame = self.panel.frame();
        if frame != *last_frame {
            println!("{frame}");
            *last_frame = frame;
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_plain_verbs() {
    assert_eq!(Command::parse("connect"), Ok(Some(Command::Connect)));
    assert_eq!(Command::parse("  read  "), Ok(Some(Command::ReadNow)));
    assert_eq!(Command::parse("exit"), Ok(Some(Command::Quit)));
    assert_eq!(Command::parse(""), Ok(None));
    assert_eq!(Command::parse("   "), Ok(None));
}

#[test]
fn parse_field_edits() {
    assert_eq!(
        Command::parse("ip 10.0.0.5"),
        Ok(Some(Command::SetIp("10.0.0.5".to_owned())))
    );
    assert_eq!(
        Command::parse("mode rtu"),
        Ok(Some(Command::SetMode(Mode::Rtu)))
    );
    assert_eq!(
        Command::parse("format hex"),
        Ok(Some(Command::SetFormat(DisplayFormat::Hex)))
    );
    assert!(Command::parse("ip").is_err());
    assert!(Command::parse("mode warp").is_err());
    assert!(Command::parse("ip 1 2").is_err());
    assert!(Command::parse("reboot").is_err());
}
