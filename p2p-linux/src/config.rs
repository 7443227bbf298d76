//! Load node config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use p2p_core::{ProtocolVersion, SessionConfig};
use serde::Deserialize;

/// Node configuration. File: ~/.config/p2p-link/config.toml or /etc/p2p-link/config.toml.
/// Env overrides: P2P_LISTEN_PORT, P2P_LOCAL_ACCOUNT, P2P_REMOTE_ACCOUNT, P2P_PROTOCOL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Direct-connection TCP port (default 44300).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_local_account")]
    pub local_account: String,
    #[serde(default = "default_remote_account")]
    pub remote_account: String,
    /// Wire protocol, `v1` or `v2` (default v1).
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolVersion,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_listen_port() -> u16 {
    44300
}
fn default_local_account() -> String {
    "local@p2p.invalid".into()
}
fn default_remote_account() -> String {
    "remote@p2p.invalid".into()
}
fn default_protocol() -> ProtocolVersion {
    ProtocolVersion::V1
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            local_account: default_local_account(),
            remote_account: default_remote_account(),
            protocol: default_protocol(),
            session: SessionConfig::default(),
        }
    }
}

/// Load config: default, then config file (explicit path, or the first standard path that
/// exists), then env vars. An explicit path must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("P2P_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("P2P_LOCAL_ACCOUNT") {
        c.local_account = s;
    }
    if let Some(s) = var("P2P_REMOTE_ACCOUNT") {
        c.remote_account = s;
    }
    if let Some(s) = var("P2P_PROTOCOL") {
        if let Some(v) = parse_protocol(&s) {
            c.protocol = v;
        }
    }
}

fn parse_protocol(s: &str) -> Option<ProtocolVersion> {
    match s.trim().to_ascii_lowercase().as_str() {
        "v1" | "1" => Some(ProtocolVersion::V1),
        "v2" | "2" => Some(ProtocolVersion::V2),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2p-link/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2p-link/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<NodeConfig> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_with_session_table() {
        let c: NodeConfig = toml::from_str(
            r#"
            listen_port = 5000
            protocol = "v2"

            [session]
            v2_pacing_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.protocol, ProtocolVersion::V2);
        assert_eq!(c.session.v2_pacing_ms, 10);
        assert_eq!(c.session.relay_chunk_size, 1202);
        assert_eq!(c.local_account, default_local_account());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<NodeConfig>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c = NodeConfig::default();
        apply_env(&mut c, |key| match key {
            "P2P_LISTEN_PORT" => Some("6000".into()),
            "P2P_PROTOCOL" => Some("V2".into()),
            "P2P_REMOTE_ACCOUNT" => Some("bob@example.com".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.protocol, ProtocolVersion::V2);
        assert_eq!(c.remote_account, "bob@example.com");
        assert_eq!(c.local_account, default_local_account());
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let mut c = NodeConfig::default();
        apply_env(&mut c, |key| match key {
            "P2P_LISTEN_PORT" => Some("not-a-port".into()),
            "P2P_PROTOCOL" => Some("v9".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 44300);
        assert_eq!(c.protocol, ProtocolVersion::V1);
    }
}
