use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossterm::event::{Event as CrosstermEvent, EventStream};
use futures_util::StreamExt;
use log::{info, warn};

use chatrelay::api::ApiClient;
use chatrelay::app::App;
use chatrelay::config::RelayConfig;
use chatrelay::event::Event;
use chatrelay::foreground::ForegroundAgent;
use chatrelay::logging;
use chatrelay::relay::{BackgroundService, RelayBus, RelayRequest};
use chatrelay::store::{FileStore, SharedStore};
use chatrelay::tui::{self, Tui};
use chatrelay::ui::render;

const USAGE: &str = "usage: chatrelay [chat | login <email> <password> | logout]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Chat,
    Login { email: String, password: String },
    Logout,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = match args.next().as_deref() {
        None | Some("chat") => Command::Chat,
        Some("login") => match (args.next(), args.next()) {
            (Some(email), Some(password)) => Command::Login { email, password },
            _ => bail!("login needs an email and a password\n{USAGE}"),
        },
        Some("logout") => Command::Logout,
        Some(other) => bail!("unknown command `{other}`\n{USAGE}"),
    };
    if let Some(extra) = args.next() {
        bail!("unexpected argument `{extra}`\n{USAGE}");
    }
    Ok(command)
}

/// Starts the background side: the only place that talks to the API.
fn spawn_background(config: &RelayConfig) -> (RelayBus, SharedStore) {
    let store: SharedStore = Arc::new(FileStore::new(config.store_path.clone()));
    let client = ApiClient::new(config.api_base_url.as_str(), store.clone());
    let service = BackgroundService::new(Arc::new(client), store.clone());
    let (bus, _dispatch) = RelayBus::spawn(service);
    (bus, store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = parse_args(env::args().skip(1))?;
    let root = env::current_dir().context("Failed to resolve the working directory")?;
    let config = RelayConfig::load(&root)?;

    match command {
        Command::Chat => run_chat(&root, config).await,
        Command::Login { email, password } => {
            logging::init_console_logging(&config.log_level)?;
            let (bus, _) = spawn_background(&config);
            bus.send(RelayRequest::Authenticate { email, password })
                .await
                .into_result()
                .context("Login failed")?;
            println!("Logged in to {}", config.api_base_url);
            Ok(())
        }
        Command::Logout => {
            logging::init_console_logging(&config.log_level)?;
            let (bus, _) = spawn_background(&config);
            bus.send(RelayRequest::ClearStoredData)
                .await
                .into_result()
                .context("Failed to clear stored data")?;
            println!("Logged out");
            Ok(())
        }
    }
}

async fn run_chat(root: &Path, config: RelayConfig) -> Result<()> {
    logging::init_file_logging(root, &config.log_path, &config.log_level)?;
    info!("Starting chat against {}", config.api_base_url);

    let (bus, store) = spawn_background(&config);
    let agent = ForegroundAgent::start(bus, store)
        .await
        .context("Failed to restore the widget state")?;
    let mut app = App::new(agent);
    if let Err(err) = app.agent.refresh_directory().await {
        warn!("Directory unavailable: {}", err);
        app.status_message = format!("Could not load organizations: {err}");
    }

    let mut terminal = tui::init()?;
    let result = event_loop(&mut terminal, &mut app, Duration::from_millis(config.tick_rate_ms)).await;
    tui::restore()?;
    result
}

async fn event_loop(terminal: &mut Tui, app: &mut App, tick_rate: Duration) -> Result<()> {
    let mut stream = EventStream::new();
    let mut interval = tokio::time::interval(tick_rate);

    while app.running {
        terminal.draw(|frame| render(app, frame))?;

        let event = tokio::select! {
            _ = interval.tick() => Event::Tick,
            maybe_event = stream.next() => {
                match maybe_event {
                    Some(Ok(CrosstermEvent::Key(key))) => Event::Key(key),
                    Some(Ok(CrosstermEvent::Mouse(mouse))) => Event::Mouse(mouse),
                    Some(Ok(CrosstermEvent::Resize(width, height))) => Event::Resize(width, height),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err).context("Terminal input failed"),
                    None => break,
                }
            }
        };
        app.handle_event(event).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        parse_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn chat_is_the_default() {
        assert_eq!(parse(&[]).unwrap(), Command::Chat);
        assert_eq!(parse(&["chat"]).unwrap(), Command::Chat);
    }

    #[test]
    fn login_takes_two_arguments() {
        assert_eq!(
            parse(&["login", "me@example.com", "secret"]).unwrap(),
            Command::Login {
                email: "me@example.com".into(),
                password: "secret".into(),
            }
        );
        assert!(parse(&["login", "me@example.com"]).is_err());
        assert!(parse(&["logout", "now"]).is_err());
        assert!(parse(&["dance"]).is_err());
    }
}
