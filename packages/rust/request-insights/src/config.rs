//! Configuration resolution for the instrumentation key and default request name.
//!
//! Three sources are consulted, in precedence order:
//!
//! | setting              | 1st (highest)      | 2nd                                | 3rd                         |
//! |----------------------|--------------------|------------------------------------|-----------------------------|
//! | instrumentation key  | explicit argument  | `APPINSIGHTS_INSTRUMENTATION_KEY`  | application configuration   |
//! | default request name | explicit argument  | application configuration          | `"HttpRequest"`             |
//!
//! Empty strings are treated as absent at every level. Resolution never fails:
//! a missing key only surfaces later, when a client is created.
//!
//! # Example
//!
//! ```
//! use request_insights::{AppConfig, InstrumentationConfig};
//!
//! let mut app_config = AppConfig::new();
//! app_config.insert("APPINSIGHTS_INSTRUMENTATION_KEY", "cfgkey");
//!
//! let config = InstrumentationConfig::resolve(Some("codekey"), None, &mut app_config, |_| None);
//! assert_eq!(config.instrumentation_key(), Some("codekey"));
//! assert_eq!(app_config.get("APPINSIGHTS_INSTRUMENTATION_KEY"), Some("codekey"));
//! ```

use crate::constants::{config_keys, defaults, env_vars};
use crate::logger::Logger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

static LOGGER: Logger = Logger::const_new("config");

/// The application's configuration store.
///
/// Plain string values, no schema beyond "present or absent". Hosts usually
/// deserialize it from their own configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppConfig {
    values: HashMap<String, String>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl<K, V> FromIterator<(K, V)> for AppConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Resolved instrumentation settings. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationConfig {
    instrumentation_key: Option<String>,
    default_request_name: String,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl InstrumentationConfig {
    /// Resolve the configuration from explicit values, an environment lookup
    /// and the application configuration store.
    ///
    /// When a non-empty key is resolved it is written back into `app_config`.
    pub fn resolve<F>(
        explicit_key: Option<&str>,
        explicit_request_name: Option<&str>,
        app_config: &mut AppConfig,
        env_lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_key = env_lookup(env_vars::INSTRUMENTATION_KEY);

        let instrumentation_key = non_empty(explicit_key)
            .or_else(|| non_empty(env_key.as_deref()))
            .or_else(|| non_empty(app_config.get(config_keys::INSTRUMENTATION_KEY)))
            .map(str::to_string);

        let default_request_name = non_empty(explicit_request_name)
            .or_else(|| non_empty(app_config.get(config_keys::DEFAULT_REQUEST_NAME)))
            .unwrap_or(defaults::REQUEST_NAME)
            .to_string();

        match &instrumentation_key {
            Some(key) => app_config.insert(config_keys::INSTRUMENTATION_KEY, key.clone()),
            None => LOGGER.warn(
                "InstrumentationConfig.resolve: no instrumentation key found, telemetry will be skipped",
            ),
        }

        LOGGER.debug(format!(
            "InstrumentationConfig.resolve: default request name is {}",
            default_request_name
        ));

        Self {
            instrumentation_key,
            default_request_name,
        }
    }

    /// Same as [`InstrumentationConfig::resolve`], reading the process environment.
    pub fn resolve_from_env(
        explicit_key: Option<&str>,
        explicit_request_name: Option<&str>,
        app_config: &mut AppConfig,
    ) -> Self {
        Self::resolve(explicit_key, explicit_request_name, app_config, |name| {
            env::var(name).ok()
        })
    }

    pub fn instrumentation_key(&self) -> Option<&str> {
        self.instrumentation_key.as_deref()
    }

    pub fn default_request_name(&self) -> &str {
        &self.default_request_name
    }
}
