//! Operator commands, answered with plain text lines.

use std::str::FromStr;

use herald_store::LastOnline;
use thiserror::Error;

use crate::bus::ALL_SERVERS;
use crate::error::Result;
use crate::helpers::format_last_seen;
use crate::herald::Herald;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `glist [showall]`
    List { show_all: bool },
    /// `find <player>`
    Find(String),
    /// `lastseen <player>`
    LastSeen(String),
    /// `ip <player>`
    Ip(String),
    /// `sendtoall <command...>`
    SendToAll(String),
    /// `serverid`
    ServerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("You must specify a player name.")]
    NoPlayer,
    #[error("You must specify a command to be run.")]
    NoCommand,
}

impl FromStr for AdminCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let line = line.strip_prefix('/').unwrap_or(line);
        let (name, rest) = line
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((line, ""));
        let player = || {
            rest.split_whitespace()
                .next()
                .map(str::to_string)
                .ok_or(CommandError::NoPlayer)
        };

        match name.to_lowercase().as_str() {
            "glist" => Ok(Self::List {
                show_all: rest.eq_ignore_ascii_case("showall"),
            }),
            "find" => player().map(Self::Find),
            "lastseen" => player().map(Self::LastSeen),
            "ip" | "playerip" => player().map(Self::Ip),
            "sendtoall" if rest.is_empty() => Err(CommandError::NoCommand),
            "sendtoall" => Ok(Self::SendToAll(rest.to_string())),
            "serverid" => Ok(Self::ServerId),
            _ => Err(CommandError::Unknown(name.to_string())),
        }
    }
}

const PLAYER_NOT_FOUND: &str = "No such player found.";

impl AdminCommand {
    pub async fn execute(&self, herald: &Herald) -> Result<Vec<String>> {
        match self {
            Self::List { show_all } => list(herald, *show_all).await,
            Self::Find(name) => {
                let Some(player) = herald.name_to_id(name, true).await else {
                    return Ok(vec![PLAYER_NOT_FOUND.to_string()]);
                };
                let line = match herald.player_location(player).await {
                    Some(location) => match (location.server, location.proxy) {
                        (Some(server), Some(proxy)) => {
                            format!("{name} is on {server} (proxy {proxy}).")
                        }
                        (Some(server), None) => format!("{name} is on {server}."),
                        (None, Some(proxy)) => format!("{name} is connected to proxy {proxy}."),
                        (None, None) => PLAYER_NOT_FOUND.to_string(),
                    },
                    None => PLAYER_NOT_FOUND.to_string(),
                };
                Ok(vec![line])
            }
            Self::LastSeen(name) => {
                let Some(player) = herald.name_to_id(name, true).await else {
                    return Ok(vec![PLAYER_NOT_FOUND.to_string()]);
                };
                let line = match herald.last_online(player).await? {
                    LastOnline::Online => format!("{name} is currently online."),
                    LastOnline::Seen(at) => {
                        format!("{name} was last online on {}.", format_last_seen(at))
                    }
                    LastOnline::Never => format!("{name} has never been online."),
                };
                Ok(vec![line])
            }
            Self::Ip(name) => {
                let Some(player) = herald.name_to_id(name, true).await else {
                    return Ok(vec![PLAYER_NOT_FOUND.to_string()]);
                };
                Ok(vec![match herald.player_ip(player).await {
                    Some(ip) => format!("{name} is connected from {ip}."),
                    None => PLAYER_NOT_FOUND.to_string(),
                }])
            }
            Self::SendToAll(command) => {
                herald.send_proxy_command(ALL_SERVERS, command).await?;
                Ok(vec![format!("Sent the command /{command} to all proxies.")])
            }
            Self::ServerId => Ok(vec![format!("You are on {}.", herald.proxy_id())]),
        }
    }
}

async fn list(herald: &Herald, show_all: bool) -> Result<Vec<String>> {
    let count = herald.player_count().await?;
    let mut lines = vec![format!("{count} player(s) are currently online.")];

    if show_all {
        for (server, players) in herald.server_to_players().await {
            let mut names = Vec::with_capacity(players.len());
            for player in &players {
                names.push(
                    herald
                        .id_to_name(*player, false)
                        .await
                        .unwrap_or_else(|| player.to_string()),
                );
            }
            names.sort_by_key(|name| name.to_lowercase());
            lines.push(format!("[{server}] ({}): {}", players.len(), names.join(", ")));
        }
    } else {
        lines.push("To see all players online, use glist showall.".to_string());
    }
    Ok(lines)
}
