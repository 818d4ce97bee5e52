use std::time::Duration;

pub const DEFAULT_AUTH_KEY: &str = "default_api_key_value";
pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com";
pub const DEFAULT_MODEL_ID: &str = "anthropic/claude-3.7-sonnet";
pub const DEFAULT_PROXY_MODEL_NAME: &str = "anthropic/claude-3.7-sonnet";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("REPLICATE_API_KEYS is empty; at least one credential is required")]
    NoCredentials,
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Upstream and auth settings, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub credentials: Vec<String>,
    pub auth_key: String,
    pub base_url: String,
    pub model_id: String,
    pub proxy_model_name: String,
    pub stream_pacing: Duration,
    pub poll_interval: Duration,
    pub upstream_timeout: Option<Duration>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let credentials = parse_credentials(&non_empty("REPLICATE_API_KEYS").unwrap_or_default());
        if credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }

        let auth_key = match lookup("AUTH_KEY") {
            Some(v) => v,
            None => {
                tracing::warn!("AUTH_KEY not set, falling back to the built-in default secret");
                DEFAULT_AUTH_KEY.to_string()
            }
        };

        let base_url = non_empty("REPLICATE_BASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model_id = non_empty("REPLICATE_MODEL")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        if !is_valid_model_id(&model_id) {
            return Err(ConfigError::Invalid {
                name: "REPLICATE_MODEL",
                reason: format!("expected owner/name or owner/name:version, got {model_id}"),
            });
        }
        let proxy_model_name = non_empty("PROXY_MODEL_NAME")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| DEFAULT_PROXY_MODEL_NAME.to_string());

        let stream_pacing =
            parse_millis("REPLIGATE_STREAM_PACING_MS", non_empty("REPLIGATE_STREAM_PACING_MS"))?
                .unwrap_or(Duration::from_millis(5));
        let poll_interval =
            parse_millis("REPLIGATE_POLL_INTERVAL_MS", non_empty("REPLIGATE_POLL_INTERVAL_MS"))?
                .unwrap_or(Duration::from_millis(500));
        let upstream_timeout = parse_millis(
            "REPLIGATE_UPSTREAM_TIMEOUT_MS",
            non_empty("REPLIGATE_UPSTREAM_TIMEOUT_MS"),
        )?;

        Ok(Self {
            credentials,
            auth_key,
            base_url,
            model_id,
            proxy_model_name,
            stream_pacing,
            poll_interval,
            upstream_timeout,
        })
    }
}

pub fn parse_credentials(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .map(|key| key.to_string())
        .collect()
}

/// Masked form of a credential, safe for logs.
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

fn is_valid_model_id(model_id: &str) -> bool {
    let name = model_id.split(':').next().unwrap_or_default();
    let mut segments = name.split('/');
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(owner), Some(model), None) if !owner.is_empty() && !model.is_empty()
    )
}

fn parse_millis(name: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
        })
}
