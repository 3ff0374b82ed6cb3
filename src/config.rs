use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{
    Deserialize,
    de::{self, Visitor},
};
use thiserror::Error;

pub const DEFAULT_PLACEHOLDER: &str = "${PLACEHOLDER}";
/// searched in order when no config path is given, `~` is the home directory
pub const DEFAULT_PATHS: [&str; 4] = [
    "jumptunnel.toml",
    "config.toml",
    "~/.jumptunnel/config.toml",
    "~/.config/jumptunnel.toml",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("error while reading {1}: {0}")]
    Io(std::io::Error, String),
    #[error("error while parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct JumptunnelConfig {
    #[serde(default)]
    pub aws: AwsConfig,
    pub tunnel: TunnelSettings,
}
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct AwsConfig {
    pub default_region: Option<String>,
    pub profile: Option<String>,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct TunnelSettings {
    /// token replaced with the environment name in filters and parameter paths
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    pub jumphost_filter: String,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ServiceConfig {
    pub host: ConfigValue,
    pub remote_port: ConfigValue,
    pub local_port_range: PortRange,
    /// parameter paths only used by detail queries
    #[serde(default)]
    pub service_details: Vec<String>,
}
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortRange {
    pub start: u16,
    pub end: u16,
}
/// Either an inline value or a path into the parameter store. Exactly one of the two
/// must be set, which is checked when the value is resolved and not while loading.
#[derive(Clone, PartialEq, Debug, Default)]
pub(crate) struct ConfigValue {
    pub value: Option<String>,
    pub ssm_param: Option<String>,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
impl ConfigValue {
    pub fn literal(value: impl Into<String>) -> Self {
        ConfigValue {
            value: Some(value.into()),
            ssm_param: None,
        }
    }
    pub fn parameter(path: impl Into<String>) -> Self {
        ConfigValue {
            value: None,
            ssm_param: Some(path.into()),
        }
    }
}

impl TunnelSettings {
    pub fn get_service_config(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}

impl JumptunnelConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: JumptunnelConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e, path.display().to_string()))?;
        Self::from_toml(&raw)
    }
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.jumphost_filter.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "`tunnel.jumphost_filter` must not be empty".to_string(),
            ));
        }
        for (name, service) in &self.tunnel.services {
            let range = service.local_port_range;
            if range.start == 0 || range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "service `{name}` has an invalid local_port_range {range}"
                )));
            }
        }
        Ok(())
    }
}

/// Picks the explicit path if given (it has to exist), otherwise the first existing
/// default location.
pub fn find_config_file(explicit: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        let path = expand_home(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let candidates: Vec<PathBuf> = DEFAULT_PATHS.iter().map(|p| expand_home(p)).collect();
    first_existing(&candidates).ok_or_else(|| ConfigError::NotFound(DEFAULT_PATHS.join(", ")))
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // ports are often written as bare integers
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Text(String),
            Number(i64),
        }
        impl Scalar {
            fn into_string(self) -> String {
                match self {
                    Scalar::Text(s) => s,
                    Scalar::Number(n) => n.to_string(),
                }
            }
        }

        struct ConfigValueVisitor;
        impl<'de> Visitor<'de> for ConfigValueVisitor {
            type Value = ConfigValue;
            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map with the keys `value` and/or `ssm_param`")
            }
            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut value = None;
                let mut ssm_param = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "value" => value = Some(map.next_value::<Scalar>()?.into_string()),
                        "ssm_param" => ssm_param = Some(map.next_value::<String>()?),
                        _ => return Err(de::Error::unknown_field(&key, &["value", "ssm_param"])),
                    }
                }

                // an empty string means "not set"
                Ok(ConfigValue {
                    value: value.filter(|v| !v.is_empty()),
                    ssm_param: ssm_param.filter(|p| !p.is_empty()),
                })
            }
        }
        deserializer.deserialize_map(ConfigValueVisitor)
    }
}
