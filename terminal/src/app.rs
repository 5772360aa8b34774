use anyhow::{Context, Result, anyhow, bail};
use client::GameServer;
use common::{Location, PlayerId, PlayerSummary};

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Add(i64),
    Brisk(u32),
    Undo,
    Reset { confirmed: bool },
    Search(String),
    Nearby { location: Location, radius_km: Option<f64> },
    Locate(Location),
    Play(PlayerId),
    Invite(String),
    Join(String),
    Name(String),
    Threshold(i64),
    Players,
    Status,
    Connect,
    Disconnect,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <points> | add <points>     score points
  brisk <count>               declare brisks (0-32)
  undo                        remove the last entry
  reset [yes]                 start a new hand
  search <name>               find players by name
  nearby <lat> <lon> [km]     find players near a location
  locate <lat> <lon>          share your location
  play <player id>            ask a player for a game
  invite <base url>           print an invite link
  join <invite url>           accept an invite link
  name <new name>             change your display name
  threshold <points>          change the winning score
  players                     players online right now
  status | connect | disconnect | help | quit";

fn parse_location(lat: Option<&str>, lon: Option<&str>) -> Result<Location> {
    let latitude: f64 = lat
        .ok_or_else(|| anyhow!("missing latitude"))?
        .parse()
        .context("latitude must be a number")?;
    let longitude: f64 = lon
        .ok_or_else(|| anyhow!("missing longitude"))?
        .parse()
        .context("longitude must be a number")?;
    Ok(Location {
        latitude,
        longitude,
    })
}

impl AppCommand {
    pub fn parse(line: &str) -> Result<Option<AppCommand>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if let Ok(points) = line.parse::<i64>() {
            return Ok(Some(AppCommand::Add(points)));
        }

        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut args = rest.split_whitespace();

        let command = match word.to_ascii_lowercase().as_str() {
            "add" => AppCommand::Add(rest.parse().context("points must be a whole number")?),
            "brisk" => AppCommand::Brisk(rest.parse().context("brisk count must be a whole number")?),
            "undo" => AppCommand::Undo,
            "reset" => AppCommand::Reset {
                confirmed: rest.eq_ignore_ascii_case("yes"),
            },
            "search" if !rest.is_empty() => AppCommand::Search(rest.to_string()),
            "nearby" => {
                let location = parse_location(args.next(), args.next())?;
                let radius_km = args
                    .next()
                    .map(|raw| raw.parse::<f64>().context("radius must be a number"))
                    .transpose()?;
                AppCommand::Nearby {
                    location,
                    radius_km,
                }
            }
            "locate" => AppCommand::Locate(parse_location(args.next(), args.next())?),
            "play" => AppCommand::Play(
                PlayerId::parse(rest).ok_or_else(|| anyhow!("{:?} is not a player id", rest))?,
            ),
            "invite" if !rest.is_empty() => AppCommand::Invite(rest.to_string()),
            "join" if !rest.is_empty() => AppCommand::Join(rest.to_string()),
            "name" if !rest.is_empty() => AppCommand::Name(rest.to_string()),
            "threshold" => {
                AppCommand::Threshold(rest.parse().context("threshold must be a whole number")?)
            }
            "players" => AppCommand::Players,
            "status" => AppCommand::Status,
            "connect" => AppCommand::Connect,
            "disconnect" => AppCommand::Disconnect,
            "help" | "?" => AppCommand::Help,
            "quit" | "exit" => AppCommand::Quit,
            _ => bail!("unknown command {:?}, try help", line),
        };
        Ok(Some(command))
    }
}

pub struct App {
    pub server: GameServer,
}

fn format_players(players: &[PlayerSummary]) -> String {
    if players.is_empty() {
        return "no players found".to_string();
    }
    players
        .iter()
        .map(|player| match player.distance {
            Some(distance) => format!("  {} {} ({:.1} km)", player.id, player.name, distance),
            None => format!("  {} {}", player.id, player.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl App {
    pub fn new(server: GameServer) -> Self {
        Self { server }
    }

    pub fn status(&self) -> String {
        let server = &self.server;
        let me = server
            .identity()
            .map(|identity| format!("{} ({})", identity.name, identity.id))
            .unwrap_or_else(|| server.settings().name);
        let opponent = server
            .opponent()
            .map(|opponent| format!("vs {} ({}): {}", opponent.name, opponent.id, opponent.score))
            .unwrap_or_else(|| "solo".to_string());
        format!(
            "{} [{:?}] total {} last {:?} target {} dealer {:?} {}",
            me,
            server.connection().state(),
            server.total(),
            server.last_three(),
            server.win_threshold(),
            server.dealer(),
            opponent
        )
    }

    /// Runs one command and returns the text to show
    pub async fn handle_command(&self, command: AppCommand) -> Result<String> {
        let server = &self.server;
        let output = match command {
            AppCommand::Add(points) => format!("total {}", server.add_points(points)?),
            AppCommand::Brisk(count) => format!("total {}", server.declare_brisk(count)?),
            AppCommand::Undo => match server.undo() {
                Some(entry) => format!("removed {}, total {}", entry.value, server.total()),
                None => "nothing to undo".to_string(),
            },
            AppCommand::Reset { confirmed } => {
                if server.reset(false, || confirmed) {
                    "new hand".to_string()
                } else {
                    "type `reset yes` to clear the scores".to_string()
                }
            }
            AppCommand::Search(term) => format_players(&server.search_players(&term).await?),
            AppCommand::Nearby {
                location,
                radius_km,
            } => format_players(&server.nearby_players(location, radius_km).await?),
            AppCommand::Locate(location) => {
                server.update_location(location);
                "location shared".to_string()
            }
            AppCommand::Play(opponent_id) => {
                server.start_game(&opponent_id).await?;
                format!("game requested with {}", opponent_id)
            }
            AppCommand::Invite(base) => {
                server.connect().await?;
                server.invite_link(&base)?
            }
            AppCommand::Join(url) => {
                let cleaned = server.accept_invite(&url).await?;
                format!("invite accepted, continue at {}", cleaned)
            }
            AppCommand::Name(name) => {
                server.update_name(&name);
                format!("you are now {}", name.trim())
            }
            AppCommand::Threshold(threshold) => {
                server.set_win_threshold(threshold);
                format!("playing to {}", server.win_threshold())
            }
            AppCommand::Players => format_players(&server.online_players()),
            AppCommand::Status => self.status(),
            AppCommand::Connect => {
                let identity = server.connect().await?;
                format!("connected as {}", identity.id)
            }
            AppCommand::Disconnect => {
                server.disconnect();
                "disconnected".to_string()
            }
            AppCommand::Help => HELP.to_string(),
            AppCommand::Quit => {
                server.shutdown().await;
                "bye".to_string()
            }
        };
        Ok(output)
    }
}
