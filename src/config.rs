use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::GatewayError;

/// Arguments passed to the backend binary for every invocation.
pub const DEFAULT_BACKEND_ARGS: [&str; 3] = ["http-backend", "--stateless-rpc", "--advertise-refs"];

/// What to do when the backend's CGI header block is malformed or truncated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Stop parsing, keep the headers seen so far and send an empty body.
    #[default]
    Permissive,
    /// Fail the invocation with `GatewayError::MalformedHeaders`.
    Strict,
}

/// Ordering between the request pump and the response side.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    /// Drain the whole request body into stdin before reading stdout.
    Sequential,
    /// Write stdin from a separate task while stdout is read.
    #[default]
    Concurrent,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory holding `{name}.git` repositories.
    pub base_path: PathBuf,
    pub git_binary: String,
    pub backend_args: Vec<String>,
    pub header_policy: HeaderPolicy,
    pub pump_mode: PumpMode,
    #[serde(deserialize_with = "string_or_usize")]
    pub read_buffer_size: usize,
    pub stderr_log_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("repos"),
            git_binary: "git".to_string(),
            backend_args: DEFAULT_BACKEND_ARGS.iter().map(|s| s.to_string()).collect(),
            header_policy: HeaderPolicy::default(),
            pump_mode: PumpMode::default(),
            read_buffer_size: 64 * 1024,
            stderr_log_limit: 4096,
        }
    }
}

impl GatewayConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_json::from_str(raw)
            .map_err(|e| GatewayError::Internal(format!("invalid gateway config: {e}")))?;
        config.validated()
    }

    pub fn from_json_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `GIT_GATEWAY_BASE_PATH` and `GIT_GATEWAY_GIT_BINARY` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(base) = std::env::var("GIT_GATEWAY_BASE_PATH") {
            self.base_path = PathBuf::from(base);
        }
        if let Ok(git) = std::env::var("GIT_GATEWAY_GIT_BINARY") {
            self.git_binary = git;
        }
        self
    }

    /// Reject unusable values and make `base_path` absolute, since it doubles as the
    /// backend's working directory prefix.
    pub fn validated(mut self) -> Result<Self, GatewayError> {
        if self.git_binary.trim().is_empty() {
            return Err(GatewayError::Internal("git_binary must not be empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(GatewayError::Internal(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        self.base_path = self.base_path.absolutize()?.into_owned();
        Ok(self)
    }
}

fn string_or_usize<'deserialize, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrUSize {
        String(String),
        USize(usize),
    }

    match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::USize(v) => Ok(v),
        StringOrUSize::String(v) => parse_size(&v).map_err(serde::de::Error::custom),
    }
}

/// Parse sizes such as `8192`, `64K` or `1M`.
fn parse_size(raw: &str) -> Result<usize, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('K' | 'k') => (&raw[..raw.len() - 1], 1024),
        Some('M' | 'm') => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid size `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.git_binary, "git");
        assert_eq!(
            config.backend_args,
            vec!["http-backend", "--stateless-rpc", "--advertise-refs"]
        );
        assert_eq!(config.header_policy, HeaderPolicy::Permissive);
        assert_eq!(config.pump_mode, PumpMode::Concurrent);
    }

    #[test]
    fn test_from_json_with_size_suffix() {
        let config = GatewayConfig::from_json_str(
            r#"{
                "base_path": "/srv/git",
                "read_buffer_size": "16K",
                "header_policy": "strict",
                "pump_mode": "sequential"
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_path, PathBuf::from("/srv/git"));
        assert_eq!(config.read_buffer_size, 16 * 1024);
        assert_eq!(config.header_policy, HeaderPolicy::Strict);
        assert_eq!(config.pump_mode, PumpMode::Sequential);
        assert_eq!(config.git_binary, "git");
    }

    #[test]
    fn test_relative_base_path_is_absolutized() {
        let config = GatewayConfig::new("repos").validated().unwrap();
        assert!(config.base_path.is_absolute());
        assert!(config.base_path.ends_with("repos"));
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let err = GatewayConfig::from_json_str(r#"{"read_buffer_size": 0}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert!(parse_size("12X").is_err());
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_oversized_size_is_rejected() {
        assert!(parse_size("18446744073709551615K").is_err());
        assert!(parse_size(&format!("{}M", usize::MAX)).is_err());
        let err =
            GatewayConfig::from_json_str(r#"{"read_buffer_size": "18446744073709551615K"}"#)
                .unwrap_err();
        assert!(err.to_string().contains("invalid size"));
    }
}
