//! Configuration: a JSON file describing the server identity, DHCP tuning,
//! the persistence mirror and the ordered segment table.
//!
//! Segments are a list, not a map — classification tries their detect rules
//! in file order and the first match wins, so the order is part of the
//! configuration.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_id: String,
    pub dhcp: DhcpConfig,
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    /// Addresses to bind on port 67, one listener each.
    pub listen: Vec<Ipv4Addr>,

    /// Tentative lease lifetime handed out on DISCOVER. Deliberately much
    /// shorter than subnet TTLs so never-confirmed offers expire quickly.
    pub grace_ttl_seconds: u32,

    /// Random probes tried before the linear range scan.
    #[serde(default)]
    pub random_tries: u32,

    /// Kernel send/receive buffer size per socket.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// How long past expiry a lease stays in memory before the cleanup
    /// worker evicts it.
    #[serde(default = "default_cleanup_age")]
    pub cleanup_age_seconds: u64,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Key/value store URL, e.g. "redis://127.0.0.1:6379/0".
    pub url: String,
    pub key_leases: String,
    pub key_subnets: String,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Tracing filter applied unless RUST_LOG overrides it.
    #[serde(default)]
    pub level: Option<String>,
    /// Emit a log line per background worker pass.
    #[serde(default)]
    pub tickers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub id: u32,
    pub name: String,
    pub detect_rule: String,
    #[serde(default)]
    pub dns_random: bool,
    #[serde(default)]
    pub automode: Option<AutomodeConfig>,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

/// Template for subnets materialized on demand. Range start/end and router
/// are host offsets within the synthesized network, in dotted-quad form
/// (e.g. "0.0.0.10").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomodeConfig {
    pub enable: bool,
    pub mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub router: Ipv4Addr,
    pub lease_ttl_seconds: u32,
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub net: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub router: Option<Ipv4Addr>,
    pub lease_ttl_seconds: u32,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(Error::InvalidConfig("server_id must be set".to_string()));
        }

        if self.dhcp.grace_ttl_seconds == 0 {
            return Err(Error::InvalidConfig(
                "dhcp.grace_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if self.dhcp.buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "dhcp.buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.mirror.key_leases.is_empty() || self.mirror.key_subnets.is_empty() {
            return Err(Error::InvalidConfig(
                "mirror.key_leases and mirror.key_subnets must be set".to_string(),
            ));
        }

        if self.segments.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one segment must be defined".to_string(),
            ));
        }

        let mut seen_ids: HashSet<u32> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();
        for segment in &self.segments {
            if segment.id == 0 {
                return Err(Error::InvalidConfig(format!(
                    "segment '{}': id must be greater than 0",
                    segment.name
                )));
            }
            if !seen_ids.insert(segment.id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate segment id {}",
                    segment.id
                )));
            }
            if !seen_names.insert(segment.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate segment name '{}'",
                    segment.name
                )));
            }
            if segment.detect_rule.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "segment '{}': detect_rule must be set",
                    segment.name
                )));
            }

            for subnet in &segment.subnets {
                validate_subnet(&segment.name, subnet)?;
            }

            if let Some(automode) = &segment.automode
                && automode.enable
            {
                validate_automode(&segment.name, automode)?;
            }
        }

        Ok(())
    }
}

fn validate_subnet(segment: &str, subnet: &SubnetConfig) -> Result<()> {
    if !net::is_contiguous_mask(subnet.mask) {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': subnet {}: invalid mask {}",
            segment, subnet.net, subnet.mask
        )));
    }

    if u32::from(subnet.net) & u32::from(subnet.mask) != u32::from(subnet.net) {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': {} is not the network address of its mask {}",
            segment, subnet.net, subnet.mask
        )));
    }

    let start = u32::from(subnet.range_start);
    let end = u32::from(subnet.range_end);
    if start > end {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': subnet {}: range_start must not exceed range_end",
            segment, subnet.net
        )));
    }

    let net_addr = u32::from(subnet.net);
    let mask = u32::from(subnet.mask);
    if start & mask != net_addr || end & mask != net_addr {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': subnet {}: allocation range leaves the network",
            segment, subnet.net
        )));
    }

    if subnet.lease_ttl_seconds == 0 {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': subnet {}: lease_ttl_seconds must be greater than 0",
            segment, subnet.net
        )));
    }

    Ok(())
}

fn validate_automode(segment: &str, automode: &AutomodeConfig) -> Result<()> {
    if !net::is_contiguous_mask(automode.mask) {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': automode: invalid mask {}",
            segment, automode.mask
        )));
    }

    let start = u32::from(automode.range_start);
    let end = u32::from(automode.range_end);
    if start == 0 || end == 0 || start > end {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': automode: invalid range offsets",
            segment
        )));
    }

    if u32::from(automode.router) == 0 {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': automode: router offset must be set",
            segment
        )));
    }

    if automode.lease_ttl_seconds == 0 {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': automode: lease_ttl_seconds must be greater than 0",
            segment
        )));
    }

    if automode.dns.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "segment '{}': automode: at least one DNS server is required",
            segment
        )));
    }

    Ok(())
}

fn default_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_cleanup_interval() -> u64 {
    5
}

fn default_cleanup_age() -> u64 {
    60 * 60
}

fn default_stats_interval() -> u64 {
    1
}

fn default_scan_timeout() -> u64 {
    30
}
