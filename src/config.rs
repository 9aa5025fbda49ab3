//! Configuration management

pub mod composite;
pub mod validation;

use std::{collections::HashMap, collections::HashSet, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::composer::{
    DEFAULT_MAX_PARALLEL_STEPS, DEFAULT_STEP_TIMEOUT, DEFAULT_WORKFLOW_TIMEOUT, MAX_RETRY_COUNT,
    WorkflowDefinition,
};
use crate::health::HealthFilterMode;
use crate::vmcp::Backend;
use crate::{Error, Result};

use composite::CompositeToolConfig;
pub use validation::validate_composite_tool_config;

/// Environment variable prefix for overrides (`VMCP_GATEWAY_DISCOVERY__CACHE_TTL=10m`)
pub const ENV_PREFIX: &str = "VMCP_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capability discovery and caching
    pub discovery: DiscoveryConfig,
    /// Client sessions
    pub sessions: SessionConfig,
    /// Workflow engine limits
    pub workflow: WorkflowConfig,
    /// Static backend list
    pub backends: Vec<BackendConfig>,
    /// Composite tools exposed to clients
    #[serde(alias = "compositeTools")]
    pub composite_tools: Vec<CompositeToolConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars()?;

        Ok(config)
    }

    /// Validate every composite tool and reject duplicate tool names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending tool.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, tool) in self.composite_tools.iter().enumerate() {
            validate_composite_tool_config(&format!("compositeTools[{i}]"), tool)?;
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate composite tool name: {}",
                    tool.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                return Err(Error::Config("backend id is required".into()));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(Error::Config(format!("duplicate backend id: {}", backend.id)));
            }
        }
        Ok(())
    }

    /// Executable definitions for every composite tool
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        self.validate()?;
        self.composite_tools
            .iter()
            .map(|tool| WorkflowDefinition::from_config(tool).map_err(Error::from))
            .collect()
    }

    /// Configured backends as registry entries
    #[must_use]
    pub fn registry_backends(&self) -> Vec<Backend> {
        self.backends.iter().map(BackendConfig::to_backend).collect()
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in backend settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for backend in &mut self.backends {
            backend.base_url = Self::expand_string(&re, &backend.base_url);
            for value in backend.metadata.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Capability discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long aggregated capabilities stay cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Cache capacity; new keys are rejected once full
    pub max_cache_size: usize,
    /// Interval of the expired-entry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Bound on discovery during session initialization
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Which backends discovery may use
    pub health_filter_mode: HealthFilterMode,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            max_cache_size: 1000,
            cleanup_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(15),
            health_filter_mode: HealthFilterMode::Fail,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session expires
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Timeout for workflows that declare none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Timeout for steps that declare none
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Duration,
    /// Steps run at once within one dependency level
    pub max_parallel_steps: usize,
    /// Upper bound on per-step retries
    pub max_retry_count: u32,
    /// How long finished workflow states are kept
    #[serde(with = "humantime_serde")]
    pub state_retention: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_WORKFLOW_TIMEOUT,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            max_retry_count: MAX_RETRY_COUNT,
            state_retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Static backend entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Unique identifier
    pub id: String,
    /// Human-readable name (defaults to the ID)
    pub name: String,
    /// Base URL (supports `${VAR}` expansion)
    pub base_url: String,
    /// Transport kind
    pub transport: String,
    /// Free-form metadata (supports `${VAR}` expansion)
    pub metadata: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            base_url: String::new(),
            transport: "streamable-http".to_string(),
            metadata: HashMap::new(),
        }
    }
}

impl BackendConfig {
    /// Registry entry for this backend; health starts unknown
    #[must_use]
    pub fn to_backend(&self) -> Backend {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name.clone()
        };
        Backend {
            id: self.id.clone(),
            name,
            base_url: self.base_url.clone(),
            transport_type: self.transport.clone(),
            metadata: self.metadata.clone(),
            ..Backend::default()
        }
    }
}

/// Human-readable durations for serde (`"100ms"`, `"30s"`, `"5m"`, `"2h"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Format a duration using the largest exact unit
    #[must_use]
    pub fn format(duration: &Duration) -> String {
        let millis = duration.as_millis();
        if millis % 1000 != 0 {
            return format!("{millis}ms");
        }
        let secs = duration.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"2h"` or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a message when the number or unit is not recognized.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let num = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration {s:?}: {e}"))
        };

        if let Some(ms) = s.strip_suffix("ms") {
            num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            num(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            num(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            num(s).map(Duration::from_secs)
        }
    }

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = StringOrNumber::deserialize(deserializer)?;
        s.into_duration().map_err(serde::de::Error::custom)
    }

    // Env overrides arrive as numbers when the value has no unit
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Str(String),
        Num(u64),
    }

    impl StringOrNumber {
        fn into_duration(self) -> Result<Duration, String> {
            match self {
                Self::Str(s) => parse(&s),
                Self::Num(secs) => Ok(Duration::from_secs(secs)),
            }
        }
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        use super::StringOrNumber;

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format(d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration; empty strings read as absent
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<StringOrNumber>::deserialize(deserializer)? {
                None => Ok(None),
                Some(StringOrNumber::Str(s)) if s.trim().is_empty() => Ok(None),
                Some(value) => value
                    .into_duration()
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
