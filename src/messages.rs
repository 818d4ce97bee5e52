//! Collapses an OpenAI-style multi-turn conversation into the single prompt
//! string the upstream model accepts, pulling out the system prompt and any
//! image references along the way.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(name) => name,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(value),
        }
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Role::from)
    }
}

/// A message whose role is missing or not a string fails to deserialize and
/// is skipped by [`parse_messages`]. Content of any other shape than a string
/// or an array reads as `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Any array element that is not a well-formed text or image part becomes
/// `Unknown` instead of failing the whole message.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text { text: Option<String> },
    ImageUrl { image_url: Option<ImageUrl> },
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedPart {
    Text {
        #[serde(default, deserialize_with = "lenient")]
        text: Option<String>,
    },
    ImageUrl {
        #[serde(default, deserialize_with = "lenient")]
        image_url: Option<ImageUrl>,
    },
}

impl<'de> Deserialize<'de> for ContentPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match serde_json::from_value::<TaggedPart>(value) {
            Ok(TaggedPart::Text { text }) => ContentPart::Text { text },
            Ok(TaggedPart::ImageUrl { image_url }) => ContentPart::ImageUrl { image_url },
            Err(_) => ContentPart::Unknown,
        })
    }
}

/// Reads a field as `None` when its value has the wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenResult {
    /// `None` when nothing usable remained; callers reject the request.
    pub conversation_text: Option<String>,
    pub system_prompt: String,
    pub image_urls: Vec<String>,
}

impl FlattenResult {
    fn invalid() -> Self {
        Self::default()
    }
}

/// Parses and flattens the raw `messages` value of a request body.
///
/// A missing, empty or non-array value, or one where no message survives,
/// degrades to an invalid result instead of an error, so every such request is
/// answered with the same `invalid_messages` response.
pub fn flatten_value(messages: Option<&Value>) -> FlattenResult {
    match parse_messages(messages) {
        Some(parsed) => flatten(&parsed),
        None => FlattenResult::invalid(),
    }
}

/// Returns `None` only when `messages` is missing, empty or not an array.
/// Elements that are not usable messages are skipped.
pub fn parse_messages(messages: Option<&Value>) -> Option<Vec<ChatMessage>> {
    let arr = messages?.as_array()?;
    if arr.is_empty() {
        return None;
    }
    let parsed = arr
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| match ChatMessage::deserialize(item) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::warn!(index = idx, "skipping malformed message: {err}");
                None
            }
        })
        .collect();
    Some(parsed)
}

/// Flattens `messages` without touching the caller's data.
pub fn flatten(messages: &[ChatMessage]) -> FlattenResult {
    if messages.is_empty() {
        return FlattenResult::invalid();
    }

    let system_prompt = extract_system_prompt(messages);
    let (conversation, image_urls) = strip_images(messages);
    let formatted = format_conversation(&conversation);

    tracing::debug!(
        images = image_urls.len(),
        prompt_len = formatted.len(),
        "flattened messages"
    );

    FlattenResult {
        conversation_text: (!formatted.is_empty()).then_some(formatted),
        system_prompt,
        image_urls,
    }
}

fn extract_system_prompt(messages: &[ChatMessage]) -> String {
    let mut system_prompt = String::new();
    for msg in messages.iter().filter(|m| m.role == Role::System) {
        match &msg.content {
            Some(MessageContent::Text(text)) => {
                system_prompt.push_str(text);
                system_prompt.push('\n');
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    if let ContentPart::Text { text: Some(text) } = part {
                        if !text.is_empty() {
                            system_prompt.push_str(text);
                            system_prompt.push('\n');
                        }
                    }
                }
            }
            None => {}
        }
    }
    system_prompt.trim().to_string()
}

/// Returns the non-system messages with image parts removed from user
/// messages, plus the extracted URLs in encounter order.
fn strip_images(messages: &[ChatMessage]) -> (Vec<ChatMessage>, Vec<String>) {
    let mut image_urls = Vec::new();
    let conversation = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|msg| {
            let content = match (&msg.role, &msg.content) {
                (Role::User, Some(MessageContent::Parts(parts))) => {
                    let mut text_only = Vec::with_capacity(parts.len());
                    for part in parts {
                        match part {
                            ContentPart::ImageUrl {
                                image_url: Some(ImageUrl { url: Some(url) }),
                            } if !url.is_empty() => image_urls.push(url.clone()),
                            ContentPart::Text { .. } => text_only.push(part.clone()),
                            _ => {}
                        }
                    }
                    Some(MessageContent::Parts(text_only))
                }
                (_, content) => content.clone(),
            };
            ChatMessage {
                role: msg.role.clone(),
                content,
            }
        })
        .collect();
    (conversation, image_urls)
}

fn format_conversation(messages: &[ChatMessage]) -> String {
    let mut formatted = String::new();
    for msg in messages {
        let Some(content) = &msg.content else {
            continue;
        };
        formatted.push_str(msg.role.as_str());
        formatted.push_str(": ");
        match content {
            MessageContent::Text(text) => formatted.push_str(text),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_deref().unwrap_or_default()),
                        _ => None,
                    })
                    .collect();
                formatted.push_str(&texts.join(" "));
            }
        }
        formatted.push('\n');
    }
    formatted
}
