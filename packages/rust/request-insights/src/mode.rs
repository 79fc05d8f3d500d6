use crate::constants;
use crate::logger::Logger;

/// Module-specific logger
static LOGGER: Logger = Logger::const_new("mode");

use std::{env, fmt};

/// Controls what happens when a property or measurement filler fails.
///
/// # Policies
///
/// - `Propagate`: the failure escapes the enrichment step
///   - Remaining stages do not run
///   - The failure is reported through the exception path
///   - The response becomes the generic 500 and no request event is sent
///
/// - `Isolate`: the failing stage is skipped
///   - The failure is logged
///   - Remaining stages still run and the request event is sent
///
/// # Configuration
///
/// The policy can be configured in two ways:
///
/// 1. Using the `APPINSIGHTS_ENRICHMENT_FAILURE` environment variable:
///    - "propagate" for Propagate (default)
///    - "isolate" for Isolate
///
/// 2. Programmatically through `InsightsConfig`:
///    ```no_run
///    use request_insights::{EnrichmentFailurePolicy, InsightsConfig};
///
///    let config = InsightsConfig::builder()
///        .enrichment_failure(EnrichmentFailurePolicy::Isolate)
///        .build();
///    ```
///
/// The environment variable takes precedence over programmatic configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnrichmentFailurePolicy {
    /// Abort enrichment and fault the request.
    #[default]
    Propagate,
    /// Log the failing stage and keep going.
    Isolate,
}

impl fmt::Display for EnrichmentFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentFailurePolicy::Propagate => write!(f, "propagate"),
            EnrichmentFailurePolicy::Isolate => write!(f, "isolate"),
        }
    }
}

impl EnrichmentFailurePolicy {
    /// Resolve the policy from the environment variable or the provided configuration.
    ///
    /// If APPINSIGHTS_ENRICHMENT_FAILURE is set to a valid value it takes precedence.
    /// Otherwise, uses the provided policy or defaults to Propagate.
    pub fn resolve(config_policy: Option<EnrichmentFailurePolicy>) -> Self {
        let result = match env::var(constants::env_vars::ENRICHMENT_FAILURE)
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("propagate") => EnrichmentFailurePolicy::Propagate,
            Ok("isolate") => EnrichmentFailurePolicy::Isolate,
            Ok(value) => {
                LOGGER.warn(format!(
                    "EnrichmentFailurePolicy.resolve: invalid policy in env: {}, using config or default",
                    value
                ));
                config_policy.unwrap_or_default()
            }
            Err(_) => config_policy.unwrap_or_default(),
        };

        LOGGER.debug(format!(
            "EnrichmentFailurePolicy.resolve: using {} policy",
            result
        ));

        result
    }
}
