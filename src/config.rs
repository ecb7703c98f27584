//! Server configuration.
//!
//! Values and defaults follow the limits spelled out across spec.md §4.4
//! and §5. Populated from CLI flags in `src/bin/ircd.rs`, the same
//! division of labor as the teacher's `Cli` struct feeding `server::run`.

use std::time::Duration;

use crate::casemap::CaseMapping;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub case_mapping: CaseMapping,
    pub password: Option<String>,
    pub nick_length: usize,
    pub user_length: usize,
    pub real_name_max_length: usize,
    pub channel_types: Vec<char>,
    pub channel_limits: Vec<(char, usize)>,
    pub channel_name_max_length: usize,
    pub max_line_length: usize,
    pub egress_queue_capacity: usize,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub ping_deadline: Duration,
    pub connection_close_drain: Duration,
    pub dcc_port_range: (u16, u16),
    pub dcc_pairing_timeout: Duration,
    pub dcc_idle_ceiling: Duration,
    pub motd: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "irc.local".to_string(),
            case_mapping: CaseMapping::Rfc1459,
            password: None,
            nick_length: 30,
            user_length: 16,
            real_name_max_length: 128,
            channel_types: vec!['#', '&'],
            channel_limits: vec![('#', 120), ('&', 120)],
            channel_name_max_length: 64,
            max_line_length: 10_000,
            egress_queue_capacity: 200,
            max_connections: 1_000,
            ping_interval: Duration::from_secs(60),
            ping_deadline: Duration::from_secs(10 * 60),
            connection_close_drain: Duration::from_secs(5),
            dcc_port_range: (50_000, 50_100),
            dcc_pairing_timeout: Duration::from_secs(3 * 60),
            dcc_idle_ceiling: Duration::from_secs(10 * 60),
            motd: None,
        }
    }
}

impl ServerConfig {
    /// Whether `prefix` names a configured channel-type prefix.
    pub fn is_channel_prefix(&self, prefix: char) -> bool {
        self.channel_types.contains(&prefix)
    }

    /// The membership limit configured for channels under `prefix`, if any.
    pub fn channel_limit_for(&self, prefix: char) -> Option<usize> {
        self.channel_limits.iter().find(|(p, _)| *p == prefix).map(|(_, n)| *n)
    }
}
