//! Configuration for the credits service.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

/// Credits service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreditsServiceConfig {
    /// Service endpoint configuration.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Credit allowances.
    #[serde(default)]
    pub credits: CreditsConfig,
    /// Public IP lookup.
    #[serde(default)]
    pub ip_lookup: IpLookupConfig,
    /// Identity channel configuration.
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Service endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (sqlite:... or postgres://...).
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Create the credits table on startup.
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// What happens to the authenticated balance when a session signs in.
///
/// Anonymous credits are never carried over under either policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInPolicy {
    /// Reset the account to the authenticated allowance on every sign-in.
    #[default]
    Reseed,
    /// Keep an existing account balance; seed only accounts never seen before.
    Preserve,
}

/// Credit allowances.
#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Allowance seeded for a never-seen anonymous visitor.
    #[serde(default = "default_anonymous_credits")]
    pub anonymous_default: u32,
    /// Allowance seeded for a signed-in account.
    #[serde(default = "default_authenticated_credits")]
    pub authenticated_default: u32,
    /// Sign-in reconciliation policy.
    #[serde(default)]
    pub sign_in_policy: SignInPolicy,
}

/// Public IP lookup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IpLookupConfig {
    /// Endpoint returning the caller's public IP address.
    #[serde(default = "default_ip_lookup_url")]
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_ip_lookup_timeout")]
    pub timeout_seconds: u64,
}

/// Identity channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Buffered events per browser session before slow receivers lag.
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
    /// Seconds a session may sit without receivers or holders before it is evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Seconds between eviction sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    50058
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_run_migrations() -> bool {
    true
}

const fn default_anonymous_credits() -> u32 {
    2
}

const fn default_authenticated_credits() -> u32 {
    10
}

fn default_ip_lookup_url() -> String {
    "https://api.ipify.org?format=json".to_string()
}

const fn default_ip_lookup_timeout() -> u64 {
    5
}

const fn default_channel_capacity() -> usize {
    16
}

const fn default_idle_timeout() -> u64 {
    1800
}

const fn default_cleanup_interval() -> u64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_seconds: default_connect_timeout(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            anonymous_default: default_anonymous_credits(),
            authenticated_default: default_authenticated_credits(),
            sign_in_policy: SignInPolicy::default(),
        }
    }
}

impl Default for IpLookupConfig {
    fn default() -> Self {
        Self {
            url: default_ip_lookup_url(),
            timeout_seconds: default_ip_lookup_timeout(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
            idle_timeout_seconds: default_idle_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl CreditsServiceConfig {
    /// Load configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Toml::file("config/local.toml"))
                .merge(Env::prefixed("CREDITS_SERVICE_").split("__")),
        )
    }

    /// Extract configuration from an already assembled figment.
    ///
    /// # Errors
    ///
    /// Returns an error if the figment does not describe a valid configuration.
    pub fn from_figment(figment: Figment) -> Result<Self, Box<figment::Error>> {
        figment.extract().map_err(Box::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CreditsServiceConfig::default();
        assert_eq!(config.service.port, 50058);
        assert_eq!(config.database.url, "sqlite::memory:");
        assert!(config.database.run_migrations);
        assert_eq!(config.credits.anonymous_default, 2);
        assert_eq!(config.credits.authenticated_default, 10);
        assert_eq!(config.credits.sign_in_policy, SignInPolicy::Reseed);
        assert_eq!(config.channel.capacity, 16);
        assert_eq!(config.channel.idle_timeout_seconds, 1800);
        assert_eq!(config.channel.cleanup_interval_seconds, 300);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let figment = Figment::new().merge(Toml::string(
            r#"
            [credits]
            authenticated_default = 25
            sign_in_policy = "preserve"

            [service]
            port = 6000
            "#,
        ));

        let config = CreditsServiceConfig::from_figment(figment).unwrap();
        assert_eq!(config.credits.authenticated_default, 25);
        assert_eq!(config.credits.anonymous_default, 2);
        assert_eq!(config.credits.sign_in_policy, SignInPolicy::Preserve);
        assert_eq!(config.service.port, 6000);
        assert_eq!(config.service.host, "0.0.0.0");
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let figment = Figment::new().merge(Toml::string(
            r#"
            [credits]
            sign_in_policy = "merge"
            "#,
        ));
        assert!(CreditsServiceConfig::from_figment(figment).is_err());
    }
}
