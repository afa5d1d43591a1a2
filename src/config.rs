use serde::Deserialize;

/// Master configuration.
///
/// The consumer constructs this struct however they want (CLI flags, TOML,
/// env vars). syncmaster does no file I/O or env reading. Every field has a
/// default, so partial documents deserialize cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port clients connect to for routing.
    pub client_port: u16,
    /// TCP port storage nodes connect to for the control channel.
    pub cluster_port: u16,
    /// Pause between heartbeat probes (ms).
    pub heartbeat_interval_ms: u64,
    /// How long a probe waits for the node's reply before the channel is
    /// considered broken (ms).
    pub probe_timeout_ms: u64,
    /// How often the sweeper prunes dead nodes and reports status (ms).
    pub sweep_interval_ms: u64,
    /// Maximum UTF-16 units in a client name, terminator excluded.
    pub max_name_len: usize,
    /// Maximum UTF-16 units in a client password, terminator excluded.
    pub max_password_len: usize,
    /// Maximum control line length in bytes.
    pub max_line_len: usize,
    /// Priority assigned to a node when it registers.
    pub default_priority: i32,
    /// Client capacity recorded for a node when it registers.
    pub default_max_clients: u32,
    /// Maximum number of active nodes admitted from one host. `None` disables
    /// the check.
    pub sessions_per_host: Option<usize>,
    /// Report the full cluster status on every sweep at `info` level.
    pub debug: bool,
    /// Log session transport failures at `debug` instead of `warn`.
    pub hide_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_port: 9990,
            cluster_port: 9991,
            heartbeat_interval_ms: 1000,
            probe_timeout_ms: 5000,
            sweep_interval_ms: 3000,
            max_name_len: 64,
            max_password_len: 64,
            max_line_len: 4096,
            default_priority: 5,
            default_max_clients: 100,
            sessions_per_host: Some(1),
            debug: false,
            hide_errors: false,
        }
    }
}

impl Config {
    /// Returns true if a host with `active` registered nodes may add another.
    pub fn admits_host(&self, active: usize) -> bool {
        match self.sessions_per_host {
            Some(limit) => active < limit,
            None => true,
        }
    }
}
