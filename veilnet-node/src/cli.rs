//! Command-line configuration (`spec.md` §6), following the
//! `clap::Parser`-derive pattern the teacher's binaries use (e.g.
//! `freeq-server`'s `ServerConfig`).

use std::path::PathBuf;

use clap::Parser;

use crate::error::NodeError;

#[derive(Debug, Parser)]
#[command(name = "veilnet-node", about = "Decentralized encrypted messaging overlay node")]
pub struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:7373.
    #[arg(long, env = "VEILNET_LISTEN")]
    pub listen: String,

    /// A known peer to bootstrap the routing table from, as
    /// `HOST:PORT,NODE_ID_HEX`. May be passed multiple times.
    #[arg(long = "bootstrap", value_name = "HOST:PORT,NODE_ID_HEX")]
    pub bootstrap: Vec<String>,

    /// Directory holding identity.bin, prekeys.bin, and sessions/.
    #[arg(long, env = "VEILNET_BASE_DIR")]
    pub base_dir: Option<PathBuf>,
}

/// A parsed `--bootstrap` entry.
#[derive(Debug, Clone)]
pub struct BootstrapPeer {
    pub host: String,
    pub port: u16,
    pub node_id: [u8; 32],
}

impl Cli {
    /// Resolve `--base-dir`, falling back to the platform config
    /// directory (`dirs::config_dir()/veilnet`), matching
    /// `freeq-tui::config::config_dir`'s fallback-to-cwd discipline.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("veilnet"))
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<BootstrapPeer>, NodeError> {
        self.bootstrap.iter().map(|s| parse_bootstrap(s)).collect()
    }
}

fn parse_bootstrap(s: &str) -> Result<BootstrapPeer, NodeError> {
    let (addr, node_id_hex) = s
        .rsplit_once(',')
        .ok_or_else(|| NodeError::Protocol(format!("malformed --bootstrap entry {s:?}: expected HOST:PORT,NODE_ID_HEX")))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| NodeError::Protocol(format!("malformed --bootstrap address {addr:?}: expected HOST:PORT")))?;
    let port: u16 = port.parse().map_err(|_| NodeError::Protocol(format!("invalid port in --bootstrap entry {s:?}")))?;
    let node_id = decode_node_id(node_id_hex)?;
    Ok(BootstrapPeer { host: host.to_string(), port, node_id })
}

fn decode_node_id(hex: &str) -> Result<[u8; 32], NodeError> {
    if hex.len() != 64 {
        return Err(NodeError::Protocol(format!("node id {hex:?} must be 64 hex chars")));
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| NodeError::Protocol(format!("node id {hex:?} is not valid hex")))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bootstrap_entry() {
        let hex = "11".repeat(32);
        let peer = parse_bootstrap(&format!("127.0.0.1:7373,{hex}")).unwrap();
        assert_eq!(peer.host, "127.0.0.1");
        assert_eq!(peer.port, 7373);
        assert_eq!(peer.node_id, [0x11u8; 32]);
    }

    #[test]
    fn rejects_malformed_node_id() {
        let err = parse_bootstrap("127.0.0.1:7373,not-hex").unwrap_err();
        assert!(matches!(err, NodeError::Protocol(_)));
    }

    #[test]
    fn rejects_missing_port() {
        let hex = "22".repeat(32);
        let err = parse_bootstrap(&format!("127.0.0.1,{hex}")).unwrap_err();
        assert!(matches!(err, NodeError::Protocol(_)));
    }
}
