use serde::Serialize;

pub const MAX_TOKENS: u32 = 64_000;
pub const MAX_IMAGE_RESOLUTION: f64 = 0.5;

/// Input object sent to the upstream model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInput {
    pub prompt: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub max_image_resolution: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The upstream model accepts a single image, so only the most recent one is
/// forwarded.
pub fn build(conversation_text: &str, system_prompt: &str, image_urls: &[String]) -> ModelInput {
    let image = image_urls.last().cloned();
    if image.is_some() {
        tracing::debug!(candidates = image_urls.len(), "attached image to model input");
    }
    ModelInput {
        prompt: conversation_text.to_string(),
        max_tokens: MAX_TOKENS,
        system_prompt: system_prompt.to_string(),
        max_image_resolution: MAX_IMAGE_RESOLUTION,
        image,
    }
}
