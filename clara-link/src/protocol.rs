//! Wire format between the kiosk and the backend.
//!
//! Inbound frames are `{ "state": <integer>, "payload"?: <object> }`.
//! Outbound frames are arbitrary JSON; [`Intent`] covers the actions the
//! backend understands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LinkError, Result};

/// The backend-driven integer selecting which UI stage is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct AppState(u8);

impl AppState {
    pub const SLEEP: AppState = AppState(0);
    pub const LANGUAGE_SELECT: AppState = AppState(3);
    pub const MENU: AppState = AppState(4);
    pub const CHAT: AppState = AppState(5);
    /// Highest supported state code.
    pub const MAX: u8 = 8;

    /// `None` outside `0..=MAX`.
    pub fn new(code: u8) -> Option<Self> {
        (code <= Self::MAX).then_some(Self(code))
    }

    pub fn code(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage-specific data accompanying a state. Opaque to the link beyond
/// the typed read-only [`ChatView`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Typed view of the chat fields. Missing or mistyped fields fall back
    /// to their defaults.
    pub fn chat(&self) -> ChatView<'_> {
        ChatView { raw: &self.0 }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Borrowed accessors over the payload shape the backend always produces.
#[derive(Debug, Clone, Copy)]
pub struct ChatView<'a> {
    raw: &'a Value,
}

impl<'a> ChatView<'a> {
    fn flag(&self, key: &str) -> bool {
        self.raw.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn text(&self, key: &str) -> Option<&'a str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn messages(&self) -> &'a [Value] {
        self.raw
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_processing(&self) -> bool {
        self.flag("isProcessing")
    }

    pub fn is_speaking(&self) -> bool {
        self.flag("isSpeaking")
    }

    pub fn is_listening(&self) -> bool {
        self.flag("isListening")
    }

    pub fn audio_base64(&self) -> Option<&'a str> {
        self.text("audioBase64")
    }

    pub fn error(&self) -> Option<&'a str> {
        self.text("error")
    }

    pub fn error_code(&self) -> Option<&'a str> {
        self.text("errorCode")
    }
}

/// An inbound frame as decoded, before the monotonicity guard.
///
/// `state` is kept raw so the guard can reject non-integers itself.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl InboundFrame {
    /// Payload with an absent field normalised to null.
    pub fn take_payload(&mut self) -> Payload {
        Payload(self.payload.take().unwrap_or(Value::Null))
    }
}

/// Decode a text frame. Anything other than a JSON object is malformed.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    serde_json::from_str(text).map_err(LinkError::MalformedFrame)
}

/// UI-originated intents understood by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    Wake,
    LanguageSelected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    ConversationStarted,
    UserMessage {
        text: String,
    },
    DiaryTts {
        text: String,
    },
    ToggleMic,
    MicStart,
    MicStop,
    MicCancel,
    MenuSelect {
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
}
