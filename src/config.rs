//! CLI arguments and on-disk layout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:3128";
const DEFAULT_TOKEN_API_ADDR: &str = "127.0.0.1:9997";
const DEFAULT_APPROVAL_API_ADDR: &str = "127.0.0.1:9999";

/// Host-resident sidecar that mediates outbound network access for
/// sandboxed coding agents.
#[derive(Parser, Debug, Clone)]
#[command(name = "guardian", version, about)]
pub struct Args {
    /// Address the sandbox-facing CONNECT proxy listens on.
    #[arg(long, default_value = DEFAULT_PROXY_ADDR)]
    pub proxy_addr: SocketAddr,

    /// Address the host-loopback Token API listens on.
    #[arg(long, default_value = DEFAULT_TOKEN_API_ADDR)]
    pub token_api_addr: SocketAddr,

    /// Address the host-loopback Approval API listens on.
    #[arg(long, default_value = DEFAULT_APPROVAL_API_ADDR)]
    pub approval_api_addr: SocketAddr,

    /// Directory for persisted decision files (created if missing).
    #[arg(long, default_value = "/var/lib/guardian")]
    pub data_dir: PathBuf,

    /// Default allowlist file (domains/patterns visible to every project).
    /// No default layer is loaded if unset.
    #[arg(long)]
    pub default_allowlist: Option<PathBuf>,

    /// Directory of per-project static allowlist files, named `<project>.allow`.
    #[arg(long)]
    pub project_allowlist_dir: Option<PathBuf>,

    /// How long a pending domain request waits for an operator decision
    /// before it is treated as denied.
    #[arg(long, default_value = "3", value_parser = parse_duration_secs)]
    pub approval_timeout: Duration,

    /// Write the proxy's bound address to this file once listening —
    /// lets a test harness discover an OS-assigned port.
    #[arg(long)]
    pub proxy_addr_file: Option<PathBuf>,

    #[arg(long)]
    pub token_api_addr_file: Option<PathBuf>,

    #[arg(long)]
    pub approval_api_addr_file: Option<PathBuf>,

    /// Populated from `GUARDIAN_INSTANCE_ID` by `apply_instance_id`. Not a
    /// CLI flag; carried on `Args` so it can be threaded into the logging
    /// context alongside the ports it offsets.
    #[arg(skip)]
    pub instance_id: Option<String>,
}

fn parse_duration_secs(raw: &str) -> Result<Duration, String> {
    let secs: u64 = raw.parse().map_err(|_| format!("not a whole number of seconds: {raw}"))?;
    Ok(Duration::from_secs(secs))
}

impl Args {
    /// Shifts all three listen addresses by a deterministic port offset
    /// derived from `GUARDIAN_INSTANCE_ID`, so multiple Guardian instances
    /// (one per sandbox host) can coexist without an explicit `--*-addr`
    /// on every invocation. A no-op when the env var is unset.
    pub fn apply_instance_id(mut self) -> Self {
        let Ok(instance_id) = std::env::var("GUARDIAN_INSTANCE_ID") else {
            return self;
        };
        if instance_id.is_empty() {
            return self;
        }

        let offset = instance_port_offset(&instance_id);
        self.proxy_addr = shift_port(self.proxy_addr, offset);
        self.token_api_addr = shift_port(self.token_api_addr, offset);
        self.approval_api_addr = shift_port(self.approval_api_addr, offset);
        self.instance_id = Some(instance_id);
        self
    }
}

fn instance_port_offset(instance_id: &str) -> u16 {
    let digest = blake3::hash(instance_id.as_bytes());
    let bytes = digest.as_bytes();
    let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
    raw % 1000
}

fn shift_port(addr: SocketAddr, offset: u16) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(addr.port().saturating_add(offset));
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_offset_is_deterministic_and_bounded() {
        let a = instance_port_offset("sandbox-7");
        let b = instance_port_offset("sandbox-7");
        assert_eq!(a, b);
        assert!(a < 1000);
    }

    #[test]
    fn different_instance_ids_usually_produce_different_offsets() {
        let a = instance_port_offset("sandbox-7");
        let b = instance_port_offset("sandbox-8");
        assert_ne!(a, b);
    }

    #[test]
    fn apply_instance_id_is_a_no_op_without_the_env_var() {
        std::env::remove_var("GUARDIAN_INSTANCE_ID");
        let args = Args {
            proxy_addr: DEFAULT_PROXY_ADDR.parse().unwrap(),
            token_api_addr: DEFAULT_TOKEN_API_ADDR.parse().unwrap(),
            approval_api_addr: DEFAULT_APPROVAL_API_ADDR.parse().unwrap(),
            data_dir: PathBuf::from("/var/lib/guardian"),
            default_allowlist: None,
            project_allowlist_dir: None,
            approval_timeout: Duration::from_secs(3),
            proxy_addr_file: None,
            token_api_addr_file: None,
            approval_api_addr_file: None,
            instance_id: None,
        };
        let unchanged = args.clone().apply_instance_id();
        assert_eq!(unchanged.proxy_addr, args.proxy_addr);
    }
}
