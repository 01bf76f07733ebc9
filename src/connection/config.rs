use crate::core::{DbError, IsolationLevel, Result};
use serde::Deserialize;
use std::time::Duration;

/// How the registry treats a method carrying more than one category marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPolicy {
    /// Reject the declared type with a resolution fault.
    #[default]
    Reject,
    /// Take the first category in classification priority order.
    FirstMatch,
}

/// Sql object configuration
///
/// Shared by every handle opened through the same `Dbi`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SqlObjectConfig {
    /// Isolation level for transactions opened without an explicit level.
    /// `None` leaves the choice to the connection.
    pub default_isolation_level: Option<IsolationLevel>,

    /// Multi-marker resolution policy
    pub marker_policy: MarkerPolicy,

    /// Row limit applied to queries without their own `max_rows`
    pub max_rows: Option<usize>,

    /// Statement timeout in milliseconds, for statements without their own
    pub query_timeout_ms: Option<u64>,

    /// Check named placeholders against bound arguments before execution
    pub validate_bindings: bool,
}

impl SqlObjectConfig {
    pub fn new() -> Self {
        Self {
            default_isolation_level: None,
            marker_policy: MarkerPolicy::Reject,
            max_rows: None,
            query_timeout_ms: None,
            validate_bindings: true,
        }
    }

    /// Set the default isolation level
    pub fn default_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.default_isolation_level = Some(level);
        self
    }

    /// Set the marker policy
    pub fn marker_policy(mut self, policy: MarkerPolicy) -> Self {
        self.marker_policy = policy;
        self
    }

    /// Set the default row limit
    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Set the default statement timeout
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn validate_bindings(mut self, enabled: bool) -> Self {
        self.validate_bindings = enabled;
        self
    }

    pub fn query_timeout_duration(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// Parse from a JSON document
    ///
    /// Missing fields take their defaults.
    ///
    /// ```ignore
    /// let config = SqlObjectConfig::from_json(
    ///     r#"{ "default_isolation_level": "SERIALIZABLE", "max_rows": 100 }"#
    /// )?;
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DbError::ConfigurationFault(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_rows == Some(0) {
            return Err(DbError::ConfigurationFault(
                "max_rows must be > 0".to_string(),
            ));
        }

        if self.query_timeout_ms == Some(0) {
            return Err(DbError::ConfigurationFault(
                "query_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SqlObjectConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SqlObjectConfig::default();
        assert_eq!(config.default_isolation_level, None);
        assert_eq!(config.marker_policy, MarkerPolicy::Reject);
        assert!(config.validate_bindings);
    }

    #[test]
    fn test_builder_pattern() {
        let config = SqlObjectConfig::new()
            .default_isolation_level(IsolationLevel::Serializable)
            .marker_policy(MarkerPolicy::FirstMatch)
            .max_rows(50)
            .query_timeout(Duration::from_secs(2));

        assert_eq!(config.default_isolation_level, Some(IsolationLevel::Serializable));
        assert_eq!(config.marker_policy, MarkerPolicy::FirstMatch);
        assert_eq!(config.max_rows, Some(50));
        assert_eq!(config.query_timeout_duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_from_json() {
        let config = SqlObjectConfig::from_json(
            r#"{ "default_isolation_level": "REPEATABLE_READ", "marker_policy": "first_match" }"#,
        )
        .unwrap();

        assert_eq!(config.default_isolation_level, Some(IsolationLevel::RepeatableRead));
        assert_eq!(config.marker_policy, MarkerPolicy::FirstMatch);
        assert_eq!(config.max_rows, None);
    }

    #[test]
    fn test_invalid_json() {
        let err = SqlObjectConfig::from_json(r#"{ "max_rows": "many" }"#).unwrap_err();
        assert!(matches!(err, DbError::ConfigurationFault(_)));
    }

    #[test]
    fn test_validate() {
        assert!(SqlObjectConfig::new().validate().is_ok());
        assert!(SqlObjectConfig::new().max_rows(0).validate().is_err());

        let zero_timeout = SqlObjectConfig {
            query_timeout_ms: Some(0),
            ..SqlObjectConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }
}
