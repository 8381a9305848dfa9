//! Wire frames sent by clients over the WebSocket.

use serde::Deserialize;

/// A decoded client frame. The `type` tag selects the variant; unknown
/// tags fail decoding and are answered with an error event.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A message for this connection's assistant.
    Message { data: String },
    /// Room chat, relayed to every connection.
    Chat { data: String },
    /// Replace this connection's trigger word list.
    Triggers { data: Vec<String> },
    /// Set or clear a collar directive, optionally on another connection.
    Collar {
        data: String,
        #[serde(default)]
        target: Option<String>,
    },
    /// Change this connection's display name.
    SetName { data: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "message", "data": "hello"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Message { data: "hello".into() });
    }

    #[test]
    fn decodes_chat() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "chat", "data": "hi room"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Chat { data: "hi room".into() });
    }

    #[test]
    fn decodes_triggers() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "triggers", "data": ["sleep", "drift"]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Triggers {
                data: vec!["sleep".into(), "drift".into()]
            }
        );
    }

    #[test]
    fn decodes_collar_without_target() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "collar", "data": "obey"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Collar {
                data: "obey".into(),
                target: None
            }
        );
    }

    #[test]
    fn decodes_collar_with_target() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "collar", "data": "obey", "target": "conn_01"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Collar {
                data: "obey".into(),
                target: Some("conn_01".into())
            }
        );
    }

    #[test]
    fn decodes_set_name() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "set_name", "data": "luna"}"#).unwrap();
        assert_eq!(frame, ClientFrame::SetName { data: "luna".into() });
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "nope", "data": ""}"#).is_err());
    }

    #[test]
    fn rejects_missing_data() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "message"}"#).is_err());
    }
}
