//! SLURM allocation discovery

use crate::{Result, RuntimeError};
use tokio::net::lookup_host;
use tokio::process::Command;
use tracing::{debug, warn};

/// Job id of the enclosing allocation, if any
pub fn slurm_job_id() -> Option<String> {
    ["SLURM_JOB_ID", "SLURM_JOBID"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .filter(|id| !id.trim().is_empty())
}

/// Compressed node list of the enclosing allocation
pub fn slurm_nodelist() -> Option<String> {
    ["SLURM_JOB_NODELIST", "SLURM_NODELIST"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .filter(|list| !list.trim().is_empty())
}

/// Expand a compressed node list (`gpu-[01-04]`) into hostnames.
///
/// Plain comma lists are split directly. Bracket expressions go through
/// `scontrol show hostnames`; if that is unavailable the raw string is
/// returned as a single host.
pub async fn expand_nodelist(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RuntimeError::Launch("Empty node list".to_string()));
    }
    if !raw.contains('[') {
        return Ok(split_plain(raw));
    }

    match Command::new("scontrol").args(["show", "hostnames", raw]).output().await {
        Ok(output) if output.status.success() => {
            let hosts: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            if hosts.is_empty() {
                return Err(RuntimeError::Launch(format!("scontrol expanded '{}' to nothing", raw)));
            }
            debug!("Expanded {} to {} hosts", raw, hosts.len());
            Ok(hosts)
        }
        Ok(output) => {
            warn!(
                "scontrol failed to expand '{}': {}",
                raw,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(vec![raw.to_string()])
        }
        Err(e) => {
            warn!("scontrol unavailable ({}), using '{}' as a single host", e, raw);
            Ok(vec![raw.to_string()])
        }
    }
}

fn split_plain(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Resolve a hostname to an IP string, falling back to the name itself
pub async fn resolve_host_ip(host: &str) -> String {
    match lookup_host((host, 0)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip().to_string(),
            None => host.to_string(),
        },
        Err(e) => {
            debug!("Could not resolve {}: {}", host, e);
            host.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_lists_split() {
        let hosts = expand_nodelist("node0, node1,node2").await.unwrap();
        assert_eq!(hosts, vec!["node0", "node1", "node2"]);
        assert_eq!(expand_nodelist("gpu-07").await.unwrap(), vec!["gpu-07"]);
    }

    #[tokio::test]
    async fn test_empty_list_rejected() {
        assert!(expand_nodelist("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_and_fallback() {
        assert_eq!(resolve_host_ip("127.0.0.1").await, "127.0.0.1");
        assert_eq!(
            resolve_host_ip("no-such-host.invalid").await,
            "no-such-host.invalid"
        );
    }
}
