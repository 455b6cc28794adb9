//! Server port configuration.

use thiserror::Error;

/// Fixed port for admin (shutdown) connections.
pub const ADMIN_PORT: u16 = 9999;

/// Default port for the event-source stream.
pub const DEFAULT_EVENT_PORT: u16 = 9090;

/// Default port for user-client connections.
pub const DEFAULT_USER_PORT: u16 = 9099;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Only unprivileged ports are accepted.
    #[error("port {port} is out of range; ports must be above 1024")]
    PortOutOfRange {
        /// The rejected port.
        port: u16,
    },
}

/// The three listening ports. The admin port is fixed; the other two are
/// configurable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub admin_port: u16,
    pub event_port: u16,
    pub user_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: ADMIN_PORT,
            event_port: DEFAULT_EVENT_PORT,
            user_port: DEFAULT_USER_PORT,
        }
    }
}

impl ServerConfig {
    /// Builds a configuration with the given event-source and user-client
    /// ports, rejecting privileged port numbers.
    pub fn with_ports(event_port: u16, user_port: u16) -> Result<Self, ConfigError> {
        for port in [event_port, user_port] {
            if port <= 1024 {
                return Err(ConfigError::PortOutOfRange { port });
            }
        }
        Ok(Self {
            admin_port: ADMIN_PORT,
            event_port,
            user_port,
        })
    }
}
