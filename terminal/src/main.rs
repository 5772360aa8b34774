use anyhow::Result;
use clap::Parser;
use client::{ClientConfig, GameEvent, GameServer};
use common::Variant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

mod app;

use app::{App, AppCommand};

#[derive(Parser, Debug)]
#[command(name = "brisker", about = "Keep Bezique scores, alone or against a remote opponent")]
struct Args {
    /// Relay WebSocket URL (overrides BRISKER_RELAY_URL)
    #[arg(long)]
    relay_url: Option<String>,

    /// Display name shown to other players
    #[arg(long)]
    name: Option<String>,

    /// Directory for settings and the game snapshot (overrides BRISKER_DATA_DIR)
    #[arg(long)]
    data_dir: Option<String>,

    /// Scoring variant: classic | turkish
    #[arg(long)]
    variant: Option<String>,

    /// Score that wins the game
    #[arg(long)]
    win_threshold: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(relay_url) = args.relay_url {
        config = config.with_relay_url(relay_url);
    }
    if let Some(data_dir) = args.data_dir {
        config = config.with_data_dir(data_dir);
    }

    // Variant and threshold are settings; apply flags before the engine reads them
    if args.variant.is_some() || args.win_threshold.is_some() {
        let storage = client::storage::FileStorage::new(&config.data_dir)?;
        let settings = client::storage::SettingsStore::load(std::sync::Arc::new(storage));
        settings.update(|settings| {
            if let Some(variant) = &args.variant {
                settings.variant = Variant::from_id_or_default(variant);
            }
            if let Some(threshold) = args.win_threshold {
                settings.win_threshold = threshold;
            }
        });
    }

    info!("Using relay {}", config.relay_url);
    let server = GameServer::open(config)?;
    if let Some(name) = &args.name {
        server.update_name(name);
    }

    let mut events = server.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} game events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app = App::new(server);
    println!("{}", app.status());
    println!("type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match AppCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{:#}", e);
                continue;
            }
        };
        let quit = command == AppCommand::Quit;
        match app.handle_command(command).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {:#}", e),
        }
        if quit {
            return Ok(());
        }
    }

    app.handle_command(AppCommand::Quit).await?;
    Ok(())
}

fn describe(event: &GameEvent) -> String {
    match event {
        GameEvent::ScoreChanged { total, last_three } => {
            format!("score {} (recent {:?})", total, last_three)
        }
        GameEvent::Congratulations { total, threshold } => {
            format!("*** {} reached {}, congratulations! ***", total, threshold)
        }
        GameEvent::OpponentChanged(Some(opponent)) => format!(
            "opponent {} ({}) {}",
            opponent.name,
            opponent.id,
            if opponent.is_online { "online" } else { "offline" }
        ),
        GameEvent::OpponentChanged(None) => "playing solo".to_string(),
        GameEvent::OpponentScored { score } => format!("opponent total {}", score),
        GameEvent::UndoRejected { reason } => format!("undo refused: {}", reason),
        GameEvent::Reset { remote: true } => "opponent started a new hand".to_string(),
        GameEvent::Reset { remote: false } => "new hand".to_string(),
    }
}
