use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field that names an envelope command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKey {
    Action,
    Command,
}

impl EnvelopeKey {
    fn field(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Command => "command",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub key: EnvelopeKey,
    pub name: String,
    /// Serialized as `type`.
    pub variant: Option<String>,
    pub data: Option<Value>,
}

/// Outbound instruction for the robot backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Raw(String),
    Envelope(CommandEnvelope),
}

impl Command {
    pub fn raw(token: impl Into<String>) -> Self {
        Self::Raw(token.into())
    }

    pub fn action(name: impl Into<String>) -> Self {
        Self::Envelope(CommandEnvelope {
            key: EnvelopeKey::Action,
            name: name.into(),
            variant: None,
            data: None,
        })
    }

    pub fn command(name: impl Into<String>) -> Self {
        Self::Envelope(CommandEnvelope {
            key: EnvelopeKey::Command,
            name: name.into(),
            variant: None,
            data: None,
        })
    }

    /// Attaches a `data` payload. Raw commands become `{"command": .., "data": ..}`.
    pub fn with_data(self, data: Value) -> Self {
        match self {
            Self::Raw(name) => Self::Envelope(CommandEnvelope {
                key: EnvelopeKey::Command,
                name,
                variant: None,
                data: Some(data),
            }),
            Self::Envelope(mut envelope) => {
                envelope.data = Some(data);
                Self::Envelope(envelope)
            }
        }
    }

    pub fn with_variant(self, variant: impl Into<String>) -> Self {
        match self {
            Self::Raw(name) => Self::Envelope(CommandEnvelope {
                key: EnvelopeKey::Command,
                name,
                variant: Some(variant.into()),
                data: None,
            }),
            Self::Envelope(mut envelope) => {
                envelope.variant = Some(variant.into());
                Self::Envelope(envelope)
            }
        }
    }

    /// Command token or envelope name.
    pub fn name(&self) -> &str {
        match self {
            Self::Raw(token) => token,
            Self::Envelope(envelope) => &envelope.name,
        }
    }

    /// Envelope discriminator, `None` for bare tokens.
    pub fn kind(&self) -> Option<EnvelopeKey> {
        match self {
            Self::Raw(_) => None,
            Self::Envelope(envelope) => Some(envelope.key),
        }
    }

    /// Text written to the socket.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Raw(token) => Ok(token.clone()),
            Self::Envelope(envelope) => {
                let mut object = Map::new();
                object.insert(
                    envelope.key.field().to_string(),
                    Value::String(envelope.name.clone()),
                );
                if let Some(variant) = &envelope.variant {
                    object.insert("type".to_string(), Value::String(variant.clone()));
                }
                if let Some(data) = &envelope.data {
                    object.insert("data".to_string(), data.clone());
                }
                serde_json::to_string(&Value::Object(object))
            }
        }
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Self::raw(value)
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

/// JSON status frame pushed by the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    pub fn titled(title: impl Into<String>, data: Value) -> Self {
        Self {
            title: Some(title.into()),
            data,
            ..Self::default()
        }
    }

    /// Returns `None` for anything that is not a JSON object.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// `title`, or `command` when the title is missing or empty.
    pub fn discriminator(&self) -> Option<&str> {
        [self.title.as_deref(), self.command.as_deref()]
            .into_iter()
            .flatten()
            .find(|value| !value.is_empty())
    }

    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn raw_command_is_sent_verbatim() {
        assert_eq!(Command::from("bolliOs").to_frame().unwrap(), "bolliOs");
    }

    #[test]
    fn envelope_uses_discriminator_field() {
        let frame = Command::action("system_shutdown").to_frame().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&frame).unwrap(),
            json!({"action": "system_shutdown"})
        );

        let frame = Command::action("motionSettings")
            .with_variant("preset")
            .with_data(json!({"name": "indoor"}))
            .to_frame()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&frame).unwrap(),
            json!({"action": "motionSettings", "type": "preset", "data": {"name": "indoor"}})
        );
    }

    #[test]
    fn raw_command_with_data_becomes_command_envelope() {
        let command = Command::raw("video_start").with_data(json!({"fps": 30}));
        assert_eq!(command.kind(), Some(EnvelopeKey::Command));
        assert_eq!(command.name(), "video_start");
    }

    #[test]
    fn parse_rejects_plain_text_and_non_objects() {
        assert!(InboundFrame::parse("welcome").is_none());
        assert!(InboundFrame::parse("{broken").is_none());
        assert!(InboundFrame::parse("[1,2]").is_none());
        assert!(InboundFrame::parse("\"text\"").is_none());
    }

    #[test]
    fn discriminator_skips_empty_title() {
        let frame = InboundFrame::parse(r#"{"status":"ok","title":"","data":null}"#).unwrap();
        assert_eq!(frame.discriminator(), None);

        let frame = InboundFrame::parse(r#"{"title":"","command":"photo"}"#).unwrap();
        assert_eq!(frame.discriminator(), Some("photo"));

        let frame = InboundFrame::parse(r#"{"title":"bolliOs","data":"activated"}"#).unwrap();
        assert_eq!(frame.discriminator(), Some("bolliOs"));
        assert_eq!(frame.data_str(), Some("activated"));
    }
}
