//! Cross-proxy presence events.
//!
//! Firehose payloads are decoded once at the bus boundary into
//! [`FirehoseEvent`]; everything in-process observes [`NetworkEvent`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire shape of a message on the firehose channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FirehoseEvent {
    Login { uuid: Uuid },
    Logoff { uuid: Uuid },
    Server { uuid: Uuid, server: String },
}

impl FirehoseEvent {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn player(&self) -> Uuid {
        match self {
            Self::Login { uuid } | Self::Logoff { uuid } | Self::Server { uuid, .. } => *uuid,
        }
    }
}

/// Notification delivered to in-process observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    PlayerJoinedNetwork { player: Uuid },
    PlayerLeftNetwork { player: Uuid },
    PlayerChangedServer { player: Uuid, server: String },
    /// Any non-firehose message, for applications listening on their own channels
    PubSubMessage { channel: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_firehose_messages() {
        let uuid = Uuid::parse_str("069a79f4-44e9-4726-a5be-fca90e38aaf5").unwrap();

        let login = FirehoseEvent::decode(
            r#"{"type":"login","uuid":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}"#,
        )
        .unwrap();
        assert_eq!(login, FirehoseEvent::Login { uuid });

        let moved = FirehoseEvent::decode(
            r#"{"type":"server","uuid":"069a79f4-44e9-4726-a5be-fca90e38aaf5","server":"lobby"}"#,
        )
        .unwrap();
        assert_eq!(
            moved,
            FirehoseEvent::Server {
                uuid,
                server: "lobby".to_string()
            }
        );
        assert_eq!(moved.player(), uuid);
    }

    #[test]
    fn test_reject_unknown_or_malformed() {
        assert!(FirehoseEvent::decode(r#"{"type":"kick","uuid":"x"}"#).is_err());
        assert!(FirehoseEvent::decode("[]").is_err());
        // server events need a destination
        assert!(
            FirehoseEvent::decode(
                r#"{"type":"server","uuid":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_encode_uses_type_tag() {
        let raw = FirehoseEvent::Logoff { uuid: Uuid::nil() }.encode().unwrap();
        assert_eq!(
            raw,
            r#"{"type":"logoff","uuid":"00000000-0000-0000-0000-000000000000"}"#
        );
    }
}
