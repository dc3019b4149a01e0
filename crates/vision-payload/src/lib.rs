//! Chat-completion payload model and the pure image-to-text transforms
//! applied to it.
//!
//! Parsing keeps every field it does not understand, and re-serialization
//! writes keys back in the order they arrived.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

mod inspect;
mod rewrite;

pub use inspect::{ImageLocation, ImageTask, inspect};
pub use rewrite::{CAPTION_FAILURE_MARKER, render_descriptions, rewrite};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("request body has no `messages` array")]
    MissingMessages,
    #[error("messages[{index}] is not a JSON object")]
    InvalidMessage { index: usize },
}

/// Captions keyed by image sequence index (1-based).
pub type Captions = BTreeMap<usize, CaptionResult>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionResult {
    Description(String),
    Failure { kind: FailureKind, detail: String },
}

impl CaptionResult {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Transport,
    Status,
    InvalidResponse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Other(other) => other,
        }
    }
}

/// Where an image points: a fetchable URL or a base64 `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Remote(String),
    Inline { media_type: String, base64: String },
}

impl ImageSource {
    pub fn parse(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((header, data)) = rest.split_once(',') {
                if let Some(media_type) = header.strip_suffix(";base64") {
                    return Self::Inline {
                        media_type: media_type.to_string(),
                        base64: data.to_string(),
                    };
                }
            }
        }
        Self::Remote(url.to_string())
    }

    pub fn to_url(&self) -> String {
        match self {
            Self::Remote(url) => url.clone(),
            Self::Inline { media_type, base64 } => format!("data:{media_type};base64,{base64}"),
        }
    }

    /// Short form for logs; never includes inline bytes.
    pub fn summary(&self) -> String {
        match self {
            Self::Remote(url) => format!("remote {url}"),
            Self::Inline { media_type, base64 } => {
                format!("inline {media_type} (~{} bytes)", base64.len() / 4 * 3)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum ContentPart {
    Text { text: String, raw: Map<String, JsonValue> },
    ImageRef { source: ImageSource, raw: Map<String, JsonValue> },
    Other(JsonValue),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut raw = Map::new();
        raw.insert("type".to_string(), JsonValue::from("text"));
        raw.insert("text".to_string(), JsonValue::from(text.clone()));
        Self::Text { text, raw }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::ImageRef { .. })
    }

    /// `detail` hint of an image part, if the caller supplied one.
    pub fn image_detail(&self) -> Option<&str> {
        match self {
            Self::ImageRef { raw, .. } => raw
                .get("image_url")
                .and_then(|v| v.get("detail"))
                .and_then(JsonValue::as_str),
            _ => None,
        }
    }

    fn classify(value: JsonValue) -> Self {
        let JsonValue::Object(raw) = value else {
            return Self::Other(value);
        };
        match raw.get("type").and_then(JsonValue::as_str) {
            Some("text") => match raw.get("text").and_then(JsonValue::as_str) {
                Some(text) => Self::Text {
                    text: text.to_string(),
                    raw,
                },
                None => Self::Other(JsonValue::Object(raw)),
            },
            Some("image_url") => {
                let url = match raw.get("image_url") {
                    Some(JsonValue::String(url)) => Some(url.clone()),
                    Some(JsonValue::Object(obj)) => obj
                        .get("url")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                match url {
                    Some(url) => Self::ImageRef {
                        source: ImageSource::parse(&url),
                        raw,
                    },
                    None => Self::Other(JsonValue::Object(raw)),
                }
            }
            _ => Self::Other(JsonValue::Object(raw)),
        }
    }
}

impl TryFrom<JsonValue> for ContentPart {
    type Error = std::convert::Infallible;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        Ok(Self::classify(value))
    }
}

impl From<ContentPart> for JsonValue {
    fn from(part: ContentPart) -> Self {
        match part {
            ContentPart::Text { text, mut raw } => {
                raw.insert("text".to_string(), JsonValue::from(text));
                JsonValue::Object(raw)
            }
            ContentPart::ImageRef { raw, .. } => JsonValue::Object(raw),
            ContentPart::Other(value) => value,
        }
    }
}

/// `content` is either a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn has_images(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Parts(parts) => parts.iter().any(ContentPart::is_image),
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Self::Text(text) => JsonValue::String(text),
            Self::Parts(parts) => {
                JsonValue::Array(parts.into_iter().map(JsonValue::from).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct Message {
    pub role: Option<Role>,
    /// `None` when `content` is absent or is neither a string nor an array;
    /// in the latter case the original value stays in `extra`.
    pub content: Option<MessageContent>,
    pub extra: Map<String, JsonValue>,
    key_order: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role: Some(role),
            content: Some(content),
            extra: Map::new(),
            key_order: vec!["role".to_string(), "content".to_string()],
        }
    }

    pub fn has_images(&self) -> bool {
        self.content.as_ref().is_some_and(MessageContent::has_images)
    }

    fn from_object(mut fields: Map<String, JsonValue>) -> Self {
        let key_order = fields.keys().cloned().collect();
        let role = match fields.remove("role") {
            Some(JsonValue::String(role)) => Some(Role::parse(&role)),
            Some(other) => {
                fields.insert("role".to_string(), other);
                None
            }
            None => None,
        };
        let content = match fields.remove("content") {
            Some(JsonValue::String(text)) => Some(MessageContent::Text(text)),
            Some(JsonValue::Array(items)) => Some(MessageContent::Parts(
                items.into_iter().map(ContentPart::classify).collect(),
            )),
            Some(other) => {
                fields.insert("content".to_string(), other);
                None
            }
            None => None,
        };
        Self {
            role,
            content,
            extra: fields,
            key_order,
        }
    }
}

impl TryFrom<JsonValue> for Message {
    type Error = PayloadError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Object(fields) => Ok(Self::from_object(fields)),
            _ => Err(PayloadError::InvalidMessage { index: 0 }),
        }
    }
}

impl From<Message> for JsonValue {
    fn from(message: Message) -> Self {
        let mut known = Map::new();
        if let Some(role) = message.role {
            known.insert("role".to_string(), JsonValue::from(role.as_str()));
        }
        if let Some(content) = message.content {
            known.insert("content".to_string(), content.into_json());
        }
        JsonValue::Object(assemble(&message.key_order, known, message.extra))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct ChatPayload {
    pub model: Option<String>,
    pub stream: Option<bool>,
    pub messages: Vec<Message>,
    /// Every other top-level field, untouched.
    pub extra: Map<String, JsonValue>,
    key_order: Vec<String>,
}

impl ChatPayload {
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        let value: JsonValue = serde_json::from_slice(body)?;
        Self::try_from(value)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // Serializing a `serde_json::Value` cannot fail.
        serde_json::to_vec(&JsonValue::from(self.clone())).unwrap_or_default()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(Message::has_images)
    }
}

impl TryFrom<JsonValue> for ChatPayload {
    type Error = PayloadError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let JsonValue::Object(mut fields) = value else {
            return Err(PayloadError::NotAnObject);
        };
        let key_order = fields.keys().cloned().collect();

        let Some(JsonValue::Array(raw_messages)) = fields.remove("messages") else {
            return Err(PayloadError::MissingMessages);
        };
        let messages = raw_messages
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                JsonValue::Object(obj) => Ok(Message::from_object(obj)),
                _ => Err(PayloadError::InvalidMessage { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let model = match fields.remove("model") {
            Some(JsonValue::String(model)) => Some(model),
            Some(other) => {
                fields.insert("model".to_string(), other);
                None
            }
            None => None,
        };
        let stream = match fields.remove("stream") {
            Some(JsonValue::Bool(stream)) => Some(stream),
            Some(other) => {
                fields.insert("stream".to_string(), other);
                None
            }
            None => None,
        };

        Ok(Self {
            model,
            stream,
            messages,
            extra: fields,
            key_order,
        })
    }
}

impl From<ChatPayload> for JsonValue {
    fn from(payload: ChatPayload) -> Self {
        let mut known = Map::new();
        if let Some(model) = payload.model {
            known.insert("model".to_string(), JsonValue::from(model));
        }
        if let Some(stream) = payload.stream {
            known.insert("stream".to_string(), JsonValue::from(stream));
        }
        known.insert(
            "messages".to_string(),
            JsonValue::Array(payload.messages.into_iter().map(JsonValue::from).collect()),
        );
        JsonValue::Object(assemble(&payload.key_order, known, payload.extra))
    }
}

/// Rebuild an object in its original key order; keys that were not in the
/// original go last.
fn assemble(
    order: &[String],
    mut known: Map<String, JsonValue>,
    mut extra: Map<String, JsonValue>,
) -> Map<String, JsonValue> {
    let mut out = Map::new();
    for key in order {
        if let Some(value) = known.remove(key).or_else(|| extra.remove(key)) {
            out.insert(key.clone(), value);
        }
    }
    out.extend(known);
    out.extend(extra);
    out
}
