//! End-to-end flows against a mocked gateway: the console side of every
//! transition, driven through the real event loop pieces with compressed
//! timing.

use std::time::Duration;

use modbus_console::app::{App, Command, Event};
use modbus_console::panel::{BannerSlot, Table};
use modbus_console::poller::Timing;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn fast_timing() -> Timing {
    Timing {
        status_period: ms(25),
        debug_period: ms(40),
        debug_stop_grace: ms(120),
    }
}

async fn new_app(server: &MockServer) -> (App, mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    let url = url::Url::parse(&server.uri()).unwrap();
    App::new(modbus_link::Client::new(url), fast_timing())
}

/// Pumps queued events through the app for a wall-clock window.
async fn pump_for(app: &mut App, rx: &mut mpsc::Receiver<Event>, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return;
        }
        match tokio::time::timeout(deadline - now, rx.recv()).await {
            Ok(Some(event)) => app.handle_event(event).await,
            _ => return,
        }
    }
}

async fn requests_to(server: &MockServer, endpoint: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == endpoint)
        .count()
}

async fn mount_status(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_debug_log(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/debuglog"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"logs": ["boot", "link idle"]})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn connect_posts_exact_body_and_starts_both_loops() {
    let server = MockServer::start().await;
    mount_status(
        &server,
        json!({"connected": false, "is_connecting": true, "message": "Opening link", "mode": "tcp"}),
    )
    .await;
    mount_debug_log(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/connect"))
        .and(body_json(
            json!({"ip": "10.0.0.5", "port": 502, "unit_id": 1, "mode": "tcp"}),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "message": "Connecting to 10.0.0.5"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, _tx, mut rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    app.handle_event(Event::Command(Command::SetIp("10.0.0.5".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::SetPort("502".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::SetUnitId("1".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::Connect)).await;

    // The optimistic render is still showing: no real snapshot has been
    // processed yet, but the panel is already in the connecting shape.
    assert_eq!(app.panel().status_line(), "Status: Starting connection...");
    assert!(app.panel().disconnect_enabled());
    assert!(!app.panel().connection_inputs_enabled());
    assert!(app.poller().status_running());
    assert!(app.poller().debug_running());
    assert_eq!(
        app.panel().banner(BannerSlot::Connection).text(),
        "Connecting to 10.0.0.5"
    );

    // The next processed poll replaces the optimistic state.
    pump_for(&mut app, &mut rx, ms(60)).await;
    assert_eq!(app.panel().status_line(), "Status: Opening link");
}

#[tokio::test]
async fn connect_without_required_fields_never_hits_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(0)
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::Connect)).await;

    assert!(app.panel().banner(BannerSlot::Connection).is_error());
    assert!(!app.poller().status_running());
}

#[tokio::test]
async fn connect_transport_failure_renders_error_and_stops_loops() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": false, "is_connecting": true})).await;
    Mock::given(method("POST"))
        .and(path("/api/connect"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"message": "Internal failure"})),
        )
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::SetIp("10.0.0.5".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::SetUnitId("1".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::Connect)).await;

    assert!(!app.poller().status_running());
    assert!(!app.poller().debug_running());
    assert_eq!(
        app.panel().banner(BannerSlot::Connection).text(),
        "Error: Internal failure"
    );
    assert_eq!(app.panel().status_line(), "Status: Critical connect failure");
}

#[tokio::test]
async fn disconnect_stops_status_now_debounces_debug_and_rechecks() {
    let server = MockServer::start().await;
    mount_status(
        &server,
        json!({"connected": true, "message": "Connected", "mode": "tcp", "ip": "10.0.0.5", "port": 502, "unit_id": 1}),
    )
    .await;
    mount_debug_log(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/disconnect"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "message": "Link closed"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, _tx, mut rx) = new_app(&server).await;
    app.bootstrap().await;
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(app.poller().status_running());
    assert!(app.poller().debug_running());

    app.handle_event(Event::Command(Command::Disconnect)).await;

    // Status polling dies at once; the debug loop only has a pending stop.
    assert!(!app.poller().status_running());
    assert!(app.poller().debug_running());
    assert_eq!(app.panel().status_line(), "Status: Disconnecting...");

    // Ticks queued before the stop are allowed to complete; discard them so
    // the only status fetch left to come is the forced re-check.
    while rx.try_recv().is_ok() {}
    let status_before = requests_to(&server, "/api/status").await;

    // Ride out the grace window plus the re-check slack (500 ms).
    pump_for(&mut app, &mut rx, ms(120) + ms(500) + ms(150)).await;

    // The debounced stop has landed and exactly one forced status fetch
    // happened after polling stopped.
    assert!(!app.poller().debug_running());
    let status_after = requests_to(&server, "/api/status").await;
    assert_eq!(status_after, status_before + 1);
}

#[tokio::test]
async fn debug_reopen_within_grace_keeps_the_session() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": true, "message": "Connected"})).await;
    mount_debug_log(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let (mut app, _tx, mut rx) = new_app(&server).await;
    app.bootstrap().await;
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(app.poller().debug_running());
    pump_for(&mut app, &mut rx, ms(50)).await;

    // Close while the link is still watched: stop is debounced, not instant.
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(!app.panel().debug_open());
    assert!(app.poller().debug_running());

    // Reopen inside the grace window.
    pump_for(&mut app, &mut rx, ms(40)).await;
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(app.panel().debug_open());
    assert!(app.poller().debug_running());

    // Well past the original deadline the same timer is still alive.
    pump_for(&mut app, &mut rx, ms(300)).await;
    assert!(app.poller().debug_running());
}

#[tokio::test]
async fn debug_close_while_idle_stops_immediately() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": false, "is_connecting": false})).await;
    mount_debug_log(&server).await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.bootstrap().await;

    // Nothing is watching the link, so opening does not start polling and
    // closing has nothing to debounce.
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(!app.poller().debug_running());
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(!app.poller().debug_running());
}

#[tokio::test]
async fn read_now_renders_rows_for_values() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": true})).await;
    Mock::given(method("POST"))
        .and(path("/api/readnow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"success": true, "message": "Read 2 registers", "data": [10, 11]}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "start_addr": 100,
            "count": 2,
            "values": ["10", "11"],
            "raw_values": [10, 11],
            "last_update": 1_700_000_000
        })))
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::ReadNow)).await;

    match app.panel().table() {
        Table::Rows(rows) => {
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].address, 100);
            assert_eq!(rows[0].value, "10");
        }
        other => panic!("expected rows, got {other:?}"),
    }
    assert!(!app.panel().read_in_progress());
}

#[tokio::test]
async fn read_now_distinguishes_empty_values_from_zero_count() {
    // success with data [] and a non-zero count: "0 values received".
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/readnow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"success": true, "message": "Read skipped", "data": []}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"start_addr": 0, "count": 3, "values": [], "raw_values": []}),
        ))
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::ReadNow)).await;
    assert_eq!(
        app.panel().table(),
        &Table::Notice("Read OK, 0 values received.".to_owned())
    );

    // No values at all and a zero count: the configuration asked for nothing.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/readnow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"success": true, "message": "Read skipped", "data": []}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"start_addr": 0, "count": 0})))
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::ReadNow)).await;
    assert_eq!(
        app.panel().table(),
        &Table::Notice("Count to read is 0.".to_owned())
    );
}

#[tokio::test]
async fn failed_read_without_data_keeps_the_table() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/readnow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"success": false, "message": "Not connected.", "data": null}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::ReadNow)).await;

    assert!(app.panel().banner(BannerSlot::Registers).is_error());
    assert_eq!(
        app.panel().banner(BannerSlot::Registers).text(),
        "Not connected."
    );
    assert_eq!(app.panel().table(), &Table::Notice("Disconnected.".to_owned()));
}

#[tokio::test]
async fn update_params_reverifies_connection_against_the_server() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": false, "is_connecting": false})).await;
    Mock::given(method("POST"))
        .and(path("/api/update_params"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(0)
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.handle_event(Event::Command(Command::UpdateParams)).await;

    assert_eq!(
        app.panel().banner(BannerSlot::Registers).text(),
        "Must be connected."
    );
}

#[tokio::test]
async fn update_params_sends_current_inputs() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": true})).await;
    Mock::given(method("POST"))
        .and(path("/api/update_params"))
        .and(body_json(json!({"start_addr": 200, "count": 4})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "message": "Parameters updated"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    // Unlock the register controls with a connected snapshot first.
    app.handle_event(Event::Poll(modbus_console::poller::Poll::Status))
        .await;
    app.handle_event(Event::Command(Command::SetStartAddr("200".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::SetRegCount("4".to_owned())))
        .await;
    app.handle_event(Event::Command(Command::UpdateParams)).await;

    assert_eq!(
        app.panel().banner(BannerSlot::Registers).text(),
        "Parameters updated"
    );
    assert!(!app.panel().update_in_progress());
}

#[tokio::test]
async fn fatal_status_failure_tears_down_both_loops() {
    let server = MockServer::start().await;
    mount_status(&server, json!({"connected": true, "message": "Connected"})).await;
    mount_debug_log(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let (mut app, _tx, mut rx) = new_app(&server).await;
    app.bootstrap().await;
    app.handle_event(Event::Command(Command::ToggleDebug)).await;
    assert!(app.poller().status_running());
    assert!(app.poller().debug_running());

    // The status endpoint goes away entirely.
    server.reset().await;
    pump_for(&mut app, &mut rx, ms(60)).await;

    assert!(!app.poller().status_running());
    assert!(!app.poller().debug_running());
    assert_eq!(app.panel().status_line(), "Status: Gateway unreachable");
    assert!(app.panel().banner(BannerSlot::Connection).is_error());
}

#[tokio::test]
async fn bootstrap_failure_renders_disconnected_error() {
    // Nothing listens here at all.
    let url = url::Url::parse("http://127.0.0.1:9/").unwrap();
    let (mut app, _tx, _rx) = App::new(modbus_link::Client::new(url), fast_timing());
    app.bootstrap().await;

    assert_eq!(
        app.panel().status_line(),
        "Status: Could not fetch initial state"
    );
    assert!(!app.poller().status_running());
    assert!(!app.poller().debug_running());
    assert!(app.panel().banner(BannerSlot::Connection).is_error());
}

#[tokio::test]
async fn bootstrap_preloads_register_configuration_when_connected() {
    let server = MockServer::start().await;
    mount_status(
        &server,
        json!({"connected": true, "message": "Connected", "ip": "10.0.0.5", "port": 502, "unit_id": 1, "mode": "rtu"}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/registers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"start_addr": 1000, "count": 16, "values": [], "format": "hex"}),
        ))
        .mount(&server)
        .await;

    let (mut app, _tx, _rx) = new_app(&server).await;
    app.bootstrap().await;

    assert_eq!(app.panel().start_addr(), "1000");
    assert_eq!(app.panel().reg_count(), "16");
    assert_eq!(app.panel().format(), modbus_link::DisplayFormat::Hex);
    assert_eq!(app.panel().ip(), "10.0.0.5");
    assert_eq!(app.panel().mode(), modbus_link::Mode::Rtu);
    assert!(app.poller().status_running());
}
