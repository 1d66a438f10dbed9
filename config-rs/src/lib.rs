//! config-rs/lib.rs
//! Shared configuration utilities for the query gateway and the domain
//! services it fronts. Provides standardized port/address resolution and the
//! TOML gateway configuration.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};

pub mod gateway;

pub use gateway::{
    ConfigError, ConversationSettings, DispatchSettings, GatewayConfig, HealthSettings,
    QueryMethod, RouterSettings, ServerSettings, ServiceEntry,
};

/// Get service port from environment variables with proper fallback
///
/// # Arguments
/// * `service_name` - The name of the service (e.g., "GATEWAY", "GENOMICS")
/// * `default_port` - The default port to use if not specified in environment
///
/// # Returns
/// The port number to use for the service
pub fn get_service_port(service_name: &str, default_port: u16) -> u16 {
    let var_name = format!("{}_SERVICE_PORT", env_prefix(service_name));
    env::var(&var_name)
        .unwrap_or_else(|_| default_port.to_string())
        .parse::<u16>()
        .unwrap_or_else(|_| {
            log::warn!("Invalid port in {}, using default {}", var_name, default_port);
            default_port
        })
}

/// Create a SocketAddr for binding a service
///
/// `<NAME>_SERVICE_ADDR` may hold a full `host:port` (optionally with an
/// `http://` scheme); otherwise the port comes from [`get_service_port`] and
/// the service binds on all interfaces.
pub fn get_bind_address(service_name: &str, default_port: u16) -> SocketAddr {
    let var_name = format!("{}_SERVICE_ADDR", env_prefix(service_name));

    if let Ok(addr_str) = env::var(&var_name) {
        let trimmed = addr_str
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            return addr;
        }
        log::warn!("Invalid address format in {}, using default", var_name);
    }

    let port = get_service_port(service_name, default_port);
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Get client connection address for connecting to a service
///
/// # Arguments
/// * `service_name` - The name of the service (e.g., "GENOMICS", "DIGITAL_TWIN")
/// * `default_port` - The default port to use if not specified in environment
/// * `host` - Optional host to use if not specified in environment (default: "localhost")
///
/// # Returns
/// A base URL for the client to connect to the service
pub fn get_client_address(service_name: &str, default_port: u16, host: Option<&str>) -> String {
    let prefix = env_prefix(service_name);
    let addr_var_name = format!("{}_SERVICE_ADDR", prefix);
    let port_var_name = format!("{}_SERVICE_PORT", prefix);

    if let Ok(addr) = env::var(&addr_var_name) {
        return addr;
    }

    let port = env::var(&port_var_name)
        .unwrap_or_else(|_| default_port.to_string())
        .parse::<u16>()
        .unwrap_or(default_port);

    let host = host.unwrap_or("localhost");
    format!("http://{}:{}", host, port)
}

/// Service definition with port information
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub default_port: u16,
    pub display_name: String,
}

/// Get default port for a specific service
pub fn get_default_port(service_name: &str) -> u16 {
    get_all_services()
        .into_iter()
        .find(|s| s.name == env_prefix(service_name))
        .map(|s| s.default_port)
        .unwrap_or(8100) // Unknown services start at 8100
}

/// Get all service definitions
pub fn get_all_services() -> Vec<ServiceDefinition> {
    [
        ("GENOMICS", 8001, "Genomics Service"),
        ("ANATOMICS", 8002, "Anatomics Service"),
        ("LITERATURE", 8003, "Literature Service"),
        ("METABOLICS", 8005, "Metabolics Service"),
        ("POPULOMICS", 8006, "Populomics Service"),
        ("USERS", 8007, "Users Service"),
        ("DIGITAL_TWIN", 8008, "Digital Twin Service"),
        ("GATEWAY", 8009, "Query Gateway"),
    ]
    .into_iter()
    .map(|(name, default_port, display_name)| ServiceDefinition {
        name: name.to_string(),
        default_port,
        display_name: display_name.to_string(),
    })
    .collect()
}

/// Loads a `.env` file from the working directory (or a parent) if present.
/// Variables already set in the environment win.
pub fn load_env_file() {
    match dotenv::dotenv() {
        Ok(path) => log::debug!("Loaded environment from {}", path.display()),
        Err(e) => log::debug!("No .env file loaded: {}", e),
    }
}

/// Normalizes a service name ("digital-twin", "Digital Twin") into the
/// upper snake case used by environment variables ("DIGITAL_TWIN").
pub fn env_prefix(service_name: &str) -> String {
    service_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
