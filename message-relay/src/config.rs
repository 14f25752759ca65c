use clap::Args;

pub const DEFAULT_PORT: u16 = 5500;

/// Where the relay listens.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host or address the relay binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port the relay binds to. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl RelayConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new("0.0.0.0", DEFAULT_PORT)
    }
}

/// Which relay an agent dials.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Host name or address of the relay.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// TCP port of the relay.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl AgentConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}
