/// Input validation for identifiers, names and commands crossing into the core
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Player id is not a valid UUID: {0}")]
    PlayerIdInvalid(String),

    #[error("Proxy id cannot be empty")]
    ProxyIdEmpty,

    #[error("Proxy id contains invalid characters (only alphanumeric, '-', '_' and '.' allowed)")]
    ProxyIdInvalidChars,

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Server name too long (max 100 characters, got {0})")]
    ServerNameTooLong(usize),

    #[error("Command cannot be empty")]
    CommandEmpty,

    #[error("Command too long (max {max} characters, got {actual})")]
    CommandTooLong { max: usize, actual: usize },

    #[error("Channel name cannot be empty or contain whitespace")]
    ChannelNameInvalid,

    #[error("Channel {0} is reserved")]
    ChannelReserved(String),
}

/// Validates a Minecraft player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    Ok(())
}

/// Parses a player id in hyphenated or simple (32 hex digits) form.
pub fn parse_player_id(raw: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ValidationError::PlayerIdInvalid(raw.to_string()))
}

/// Validates a proxy id. It becomes part of store keys and channel names.
pub fn validate_proxy_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::ProxyIdEmpty);
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::ProxyIdInvalidChars);
    }

    Ok(())
}

/// Validates a backend server name
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }

    if name.len() > 100 {
        return Err(ValidationError::ServerNameTooLong(name.len()));
    }

    Ok(())
}

/// Validates a command line sent across the fleet
pub fn validate_command(command: &str) -> Result<(), ValidationError> {
    const MAX_COMMAND_LEN: usize = 256;

    if command.trim().is_empty() {
        return Err(ValidationError::CommandEmpty);
    }

    if command.len() > MAX_COMMAND_LEN {
        return Err(ValidationError::CommandTooLong {
            max: MAX_COMMAND_LEN,
            actual: command.len(),
        });
    }

    Ok(())
}

/// Validates an application channel name. `reserved` holds the channels the
/// bus owns, which applications may not register or drop.
pub fn validate_channel_name(channel: &str, reserved: &[String]) -> Result<(), ValidationError> {
    if channel.is_empty() || channel.chars().any(char::is_whitespace) {
        return Err(ValidationError::ChannelNameInvalid);
    }

    if reserved.iter().any(|r| r == channel) {
        return Err(ValidationError::ChannelReserved(channel.to_string()));
    }

    Ok(())
}
