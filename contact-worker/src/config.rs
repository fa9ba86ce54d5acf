use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use contact_common::retry::RetryPolicy;
use contact_common::routing::{RoutingOverrides, TargetSystem};
use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::pipeline::PipelineConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "5")]
    pub events_per_second: f64,

    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub queue_capacity: usize,

    #[envconfig(default = "http://localhost:8000/mock")]
    pub endpoint_base_url: NonEmptyString,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "salesforce")]
    pub default_target_system: TargetSystem,

    #[envconfig(default = "")]
    pub routing_overrides: RoutingOverrides,

    #[envconfig(default = "1000")]
    pub dequeue_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub drain_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub stats_log_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "true")]
    pub enable_dispatch: bool,
}

impl Config {
    /// Load the configuration from the environment and validate it.
    pub fn load() -> Result<Self, ConfigError> {
        Self::checked(Self::init_from_env())
    }

    /// Same as [`Config::load`], reading variables from `vars` instead of the environment.
    pub fn load_from_hashmap(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::checked(Self::init_from_hashmap(vars))
    }

    fn checked(loaded: Result<Self, envconfig::Error>) -> Result<Self, ConfigError> {
        let config = loaded.map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks envconfig cannot express with types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        PipelineConfig::from(self).validate()?;
        url::Url::parse(self.endpoint_base_url.as_str())
            .map_err(ConfigError::InvalidEndpointBaseUrl)?;

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .maximum_interval(self.retry_policy.maximum_interval.0)
        .max_retries(self.retry_policy.max_retries)
        .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "5")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use contact_common::contact::ContactCategory;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, envconfig::Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&vars)
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.events_per_second, 5.0);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.endpoint_base_url.as_str(), "http://localhost:8000/mock");
        assert_eq!(config.request_timeout.0, time::Duration::from_secs(5));
        assert_eq!(config.default_target_system, TargetSystem::Salesforce);
        assert!(config.routing_overrides.0.is_empty());
        assert!(config.enable_dispatch);
        assert!(config.validate().is_ok());

        let retry_policy = config.retry_policy();
        assert_eq!(retry_policy.max_retries, 5);
        assert_eq!(retry_policy.initial_interval, time::Duration::from_millis(500));
    }

    #[test]
    fn test_routing_overrides_from_env() {
        let config = config_from(&[("ROUTING_OVERRIDES", "customer=salesforce")]).unwrap();
        assert_eq!(
            config.routing_overrides.0.get(&ContactCategory::Customer),
            Some(&TargetSystem::Salesforce)
        );

        assert!(config_from(&[("ROUTING_OVERRIDES", "customer=zendesk")]).is_err());
        assert!(config_from(&[("DEFAULT_TARGET_SYSTEM", "zendesk")]).is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        let config = config_from(&[("EVENTS_PER_SECOND", "0")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveRate(_))
        ));

        let config = config_from(&[("EVENTS_PER_SECOND", "-2.5")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveRate(_))
        ));

        let config = config_from(&[("BATCH_SIZE", "0")]).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBatchSize)));

        let config = config_from(&[("QUEUE_CAPACITY", "0")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroQueueCapacity)
        ));

        let config = config_from(&[("ENDPOINT_BASE_URL", "not a url")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpointBaseUrl(_))
        ));

        let config = config_from(&[("DEQUEUE_TIMEOUT", "0")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration(_))
        ));

        // Negative batch sizes do not even parse
        assert!(config_from(&[("BATCH_SIZE", "-1")]).is_err());
    }

    #[test]
    fn test_load_reports_parse_and_validation_errors() {
        let vars = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        let config = Config::load_from_hashmap(&vars(&[("BATCH_SIZE", "25")])).unwrap();
        assert_eq!(config.batch_size, 25);

        assert!(matches!(
            Config::load_from_hashmap(&vars(&[("ROUTING_OVERRIDES", "customer=zendesk")])),
            Err(ConfigError::Load(_))
        ));
        assert!(matches!(
            Config::load_from_hashmap(&vars(&[("BATCH_SIZE", "lots")])),
            Err(ConfigError::Load(_))
        ));
        assert!(matches!(
            Config::load_from_hashmap(&vars(&[("EVENTS_PER_SECOND", "0")])),
            Err(ConfigError::NonPositiveRate(_))
        ));
    }
}
