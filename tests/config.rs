use repligate::config::{ConfigError, DEFAULT_AUTH_KEY, GatewayConfig};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn missing_credentials_are_rejected() {
    assert_eq!(
        GatewayConfig::from_lookup(lookup(&[])).unwrap_err(),
        ConfigError::NoCredentials
    );
    assert_eq!(
        GatewayConfig::from_lookup(lookup(&[("REPLICATE_API_KEYS", " , ,")])).unwrap_err(),
        ConfigError::NoCredentials
    );
}

#[test]
fn defaults_apply_when_only_credentials_are_set() {
    let config = GatewayConfig::from_lookup(lookup(&[("REPLICATE_API_KEYS", "r8_a, r8_b")]))
        .expect("config");
    assert_eq!(config.credentials, vec!["r8_a", "r8_b"]);
    assert_eq!(config.auth_key, DEFAULT_AUTH_KEY);
    assert_eq!(config.base_url, "https://api.replicate.com");
    assert_eq!(config.model_id, "anthropic/claude-3.7-sonnet");
    assert_eq!(config.proxy_model_name, "anthropic/claude-3.7-sonnet");
    assert_eq!(config.stream_pacing, Duration::from_millis(5));
    assert_eq!(config.poll_interval, Duration::from_millis(500));
    assert_eq!(config.upstream_timeout, None);
}

#[test]
fn explicit_values_override_defaults() {
    let config = GatewayConfig::from_lookup(lookup(&[
        ("REPLICATE_API_KEYS", "r8_only"),
        ("AUTH_KEY", "s3cret"),
        ("REPLICATE_BASE_URL", "http://localhost:9000/"),
        ("REPLICATE_MODEL", "owner/model:abc123"),
        ("PROXY_MODEL_NAME", "gpt-4o"),
        ("REPLIGATE_STREAM_PACING_MS", "0"),
        ("REPLIGATE_UPSTREAM_TIMEOUT_MS", "30000"),
    ]))
    .expect("config");
    assert_eq!(config.auth_key, "s3cret");
    assert_eq!(config.base_url, "http://localhost:9000");
    assert_eq!(config.model_id, "owner/model:abc123");
    assert_eq!(config.proxy_model_name, "gpt-4o");
    assert_eq!(config.stream_pacing, Duration::ZERO);
    assert_eq!(config.upstream_timeout, Some(Duration::from_secs(30)));
}

#[test]
fn invalid_numbers_are_config_errors() {
    let err = GatewayConfig::from_lookup(lookup(&[
        ("REPLICATE_API_KEYS", "r8_a"),
        ("REPLIGATE_POLL_INTERVAL_MS", "soon"),
    ]))
    .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            name: "REPLIGATE_POLL_INTERVAL_MS",
            ..
        }
    ));
}

#[test]
fn malformed_model_id_is_rejected() {
    let err = GatewayConfig::from_lookup(lookup(&[
        ("REPLICATE_API_KEYS", "r8_a"),
        ("REPLICATE_MODEL", "claude"),
    ]))
    .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            name: "REPLICATE_MODEL",
            ..
        }
    ));
}

#[test]
fn dotenv_file_feeds_config() {
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join(".env");
    let mut file = std::fs::File::create(&path).expect("create .env");
    writeln!(file, "# local overrides").unwrap();
    writeln!(file, "REPLICATE_API_KEYS=r8_one,r8_two,r8_three").unwrap();
    writeln!(file, "AUTH_KEY=\"from-dotenv\"").unwrap();
    writeln!(file, "REPLIGATE_STREAM_PACING_MS=20").unwrap();
    drop(file);

    let vars: HashMap<String, String> = dotenvy::from_path_iter(&path)
        .expect("read .env")
        .collect::<Result<_, _>>()
        .expect("parse .env");
    let config = GatewayConfig::from_lookup(|name| vars.get(name).cloned()).expect("config");
    assert_eq!(config.credentials.len(), 3);
    assert_eq!(config.auth_key, "from-dotenv");
    assert_eq!(config.stream_pacing, Duration::from_millis(20));
}
