//! Gateway configuration: listener settings, probe and dispatch budgets,
//! conversation limits, routing keywords and the table of domain services.
//!
//! Loaded from `config/gateway.toml` (or `$QUERY_GATEWAY_CONFIG`). A missing
//! file falls back to the built-in table of domain services on their
//! conventional ports. `<NAME>_SERVICE_ADDR` overrides a service's base URL
//! and `GATEWAY_SERVICE_PORT` / `GATEWAY_SERVICE_ADDR` the listener.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::env;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "QUERY_GATEWAY_CONFIG";

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("service `{0}` is declared more than once")]
    DuplicateService(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a domain service's query endpoint expects to be called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMethod {
    Get,
    #[default]
    Post,
}

/// One `[[service]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub domain: String,
    pub base_url: String,
    pub capability_tags: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// May contain `{user_id}` and `{query}` placeholders
    #[serde(default = "default_query_path")]
    pub query_path: String,
    #[serde(default)]
    pub query_method: QueryMethod,
    /// Falls back to `dispatch.default_timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub sse_keepalive_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: crate::get_default_port("GATEWAY"),
            body_limit_bytes: 64 * 1024,
            sse_keepalive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failures after which a service is `unreachable`
    pub failure_threshold: u32,
    pub readiness_attempts: u32,
    pub readiness_initial_backoff_ms: u64,
    pub readiness_max_backoff_ms: u64,
    pub min_ready_services: usize,
    pub fail_if_unready: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            readiness_attempts: 5,
            readiness_initial_backoff_ms: 500,
            readiness_max_backoff_ms: 5_000,
            min_ready_services: 1,
            fail_if_unready: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub default_timeout_ms: u64,
    /// Multiplier applied to a degraded service's timeout, in (0, 1]
    pub degraded_timeout_factor: f64,
    pub retry_backoff_ms: u64,
    /// Added to the largest per-entry timeout to form the batch ceiling
    pub batch_margin_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            degraded_timeout_factor: 0.5,
            retry_backoff_ms: 200,
            batch_margin_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub max_history: usize,
    pub context_turns: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_history: 20,
            context_turns: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Word in a query → capability tags it implies
    pub keywords: BTreeMap<String, Vec<String>>,
    /// Gene symbols without a digit, recognized only when listed here
    pub gene_symbols: BTreeSet<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let pairs = [
            ("genetic", "gene"),
            ("genes", "gene"),
            ("genome", "genomics"),
            ("variants", "variant"),
            ("mutations", "mutation"),
            ("snps", "snp"),
            ("organs", "organ"),
            ("tissues", "tissue"),
            ("drugs", "drug"),
            ("medications", "medication"),
            ("pharmacogenomic", "pharmacogenomics"),
            ("papers", "literature"),
            ("studies", "study"),
            ("publications", "publication"),
            ("populations", "population"),
            ("twin", "digital_twin"),
        ];

        let mut keywords: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (word, tag) in pairs {
            keywords.entry(word.to_string()).or_default().push(tag.to_string());
        }

        let gene_symbols = [
            "APOE", "BRAF", "CFTR", "EGFR", "HBB", "KRAS", "MTHFR", "MYC", "NRAS", "PTEN", "VHL",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self { keywords, gene_symbols }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default = "default_services", rename = "service")]
    pub services: Vec<ServiceEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            health: HealthSettings::default(),
            dispatch: DispatchSettings::default(),
            conversation: ConversationSettings::default(),
            router: RouterSettings::default(),
            services: default_services(),
        }
    }
}

impl GatewayConfig {
    /// Path of the configuration file, honoring `$QUERY_GATEWAY_CONFIG`
    pub fn config_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Loads, applies environment overrides and validates
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Self::config_path())
    }

    /// Like [`GatewayConfig::load`] with an explicit path. A missing file
    /// yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(content) => toml::from_str::<GatewayConfig>(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "Configuration file {} not found, using built-in service table",
                    path.display()
                );
                GatewayConfig::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `<NAME>_SERVICE_ADDR` replaces a service's base URL and
    /// `GATEWAY_SERVICE_PORT` the listener port.
    pub fn apply_env_overrides(&mut self) {
        self.server.port = crate::get_service_port("GATEWAY", self.server.port);

        for service in &mut self.services {
            let var_name = format!("{}_SERVICE_ADDR", crate::env_prefix(&service.name));
            if let Ok(addr) = env::var(&var_name) {
                if !addr.trim().is_empty() {
                    service.base_url = addr.trim().to_string();
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::Invalid("service name must not be empty".into()));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if service.capability_tags.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service `{}` declares no capability tags",
                    service.name
                )));
            }
            if !service.base_url.starts_with("http://") && !service.base_url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "service `{}` has a non-http base_url `{}`",
                    service.name, service.base_url
                )));
            }
            if service.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "service `{}` has a zero timeout",
                    service.name
                )));
            }
        }

        if self.dispatch.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.default_timeout_ms must be positive".into()));
        }
        let factor = self.dispatch.degraded_timeout_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "dispatch.degraded_timeout_factor must be in (0, 1], got {}",
                factor
            )));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid("health.failure_threshold must be at least 1".into()));
        }
        if self.health.probe_interval_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("health probe interval and timeout must be positive".into()));
        }
        if self.conversation.max_history == 0 {
            return Err(ConfigError::Invalid("conversation.max_history must be at least 1".into()));
        }

        Ok(())
    }

    /// Address the gateway listens on
    pub fn bind_address(&self) -> SocketAddr {
        crate::get_bind_address("GATEWAY", self.server.port)
    }

    /// Declared timeout of `service`, falling back to the dispatch default
    pub fn service_timeout(&self, service: &ServiceEntry) -> Duration {
        Duration::from_millis(service.timeout_ms.unwrap_or(self.dispatch.default_timeout_ms))
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_query_path() -> String {
    "/query".to_string()
}

/// The domain services and their conventional ports
fn default_services() -> Vec<ServiceEntry> {
    let entry = |name: &str, tags: &[&str], query_path: &str, method: QueryMethod| ServiceEntry {
        name: name.to_string(),
        domain: name.to_string(),
        base_url: crate::get_client_address(name, crate::get_default_port(name), None),
        capability_tags: tags.iter().map(|t| t.to_string()).collect(),
        health_path: default_health_path(),
        query_path: query_path.to_string(),
        query_method: method,
        timeout_ms: None,
    };

    vec![
        entry(
            "genomics",
            &["genomics", "gene", "variant", "dna", "mutation", "snp", "pharmacogenomics"],
            "/query",
            QueryMethod::Post,
        ),
        entry(
            "anatomics",
            &["anatomics", "anatomy", "organ", "tissue", "heart", "brain", "liver", "kidney"],
            "/query",
            QueryMethod::Post,
        ),
        entry(
            "literature",
            &["literature", "research", "study", "publication", "evidence"],
            "/search/literature/{query}",
            QueryMethod::Get,
        ),
        entry(
            "metabolics",
            &["metabolics", "metabolism", "drug", "medication", "metabolite", "pharmacogenomics"],
            "/query",
            QueryMethod::Post,
        ),
        entry(
            "populomics",
            &["populomics", "population", "risk", "environment", "prevalence", "disease"],
            "/query",
            QueryMethod::Post,
        ),
        entry(
            "digital_twin",
            &["digital_twin", "simulation", "personal"],
            "/twin/{user_id}/model",
            QueryMethod::Get,
        ),
        entry(
            "users",
            &["users", "user", "profile", "account"],
            "/users/{user_id}",
            QueryMethod::Get,
        ),
    ]
}
