use clap::Parser;
use modbus_console::app::{App, Command, Event};
use modbus_console::poller::Timing;
use modbus_console::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use url::Url;

#[derive(Parser, Debug)]
#[clap(
    name = "modbus-console",
    version,
    author,
    about = "An interactive console for driving a Modbus link gateway"
)]
struct Cli {
    /// Base URL of the link gateway's HTTP API.
    #[clap(
        env = "GATEWAY_URL",
        default_value = "http://127.0.0.1:5000/",
        value_hint = clap::ValueHint::Url
    )]
    url: Url,

    /// Open the debug log panel on startup.
    #[clap(long)]
    debug_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let gateway = modbus_link::Client::new(args.url);
    let (mut app, tx, rx) = App::new(gateway, Timing::default());

    app.bootstrap().await;
    if args.debug_log {
        tx.send(Event::Command(Command::ToggleDebug))
            .await
            .map_err(|_| "console closed before startup")?;
    }

    let console = tokio::spawn(async move { app.run(rx).await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => match line? {
                Some(line) => match Command::parse(&line) {
                    Ok(Some(command)) => {
                        let quit = command == Command::Quit;
                        if tx.send(Event::Command(command)).await.is_err() || quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => eprintln!("{message}"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = tx.send(Event::Command(Command::Quit)).await;
    console.await.map_err(|_| "console task failed")?;

    Ok(())
}
