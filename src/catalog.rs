//! Segment and subnet catalog, including the in-memory lease store.
//!
//! The catalog is the ordered set of segments built at startup. Each segment
//! owns a directory of subnets keyed by network address; each subnet owns a
//! dual-index lease store protected by its own lock:
//!
//! - `by_ip`: IP address → lease
//! - `by_mac`: client MAC → lease
//!
//! For a canonical binding both indices hold the same lease value. Takeovers
//! of expired slots can leave a stale `by_mac` back-reference behind; lookups
//! treat those as repair events and the cleanup worker removes them.
//!
//! # Thread Safety
//!
//! The segment directory and each subnet store use [`parking_lot::RwLock`];
//! critical sections are pure memory and never cross an await point. Lock
//! order is segment before subnet, and no task holds two subnet locks at
//! once.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::config::{AutomodeConfig, Config, SegmentConfig, SubnetConfig};
use crate::error::{Error, Result};
use crate::expr::{Env, Expr};
use crate::net::{self, Mac};
use crate::options::DhcpOption;
use crate::stats::Stats;

/// A single IP↔MAC binding.
///
/// Created tentatively on DISCOVER (grace TTL, `discover` set) and confirmed
/// by a matching REQUEST (subnet TTL, `discover` cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: Mac,
    pub expires: DateTime<Utc>,
    pub discover: bool,
    pub discover_at: DateTime<Utc>,
}

impl Lease {
    /// A fresh tentative binding made while answering a DISCOVER.
    pub fn offered(ip: Ipv4Addr, mac: Mac, now: DateTime<Utc>, grace_secs: u32) -> Self {
        Self {
            ip,
            mac,
            expires: now + TimeDelta::seconds(i64::from(grace_secs)),
            discover: true,
            discover_at: now,
        }
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }

    /// Seconds until expiry, or 0 if already expired.
    pub fn expires_in(&self) -> i64 {
        (self.expires - Utc::now()).num_seconds().max(0)
    }

    /// Time between the tentative offer and now, for transaction latency.
    pub fn tx_duration_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.discover_at).num_milliseconds().max(0)
    }
}

/// The dual-index lease store of one subnet, plus the counters the stats
/// worker refreshes.
#[derive(Debug, Default)]
pub struct LeaseStore {
    pub by_ip: HashMap<Ipv4Addr, Lease>,
    pub by_mac: HashMap<Mac, Lease>,
    pub active_count: usize,
    pub expired_count: usize,
}

impl LeaseStore {
    /// Inserts a lease into both indices, overwriting stale entries.
    pub fn insert(&mut self, lease: Lease) {
        self.by_ip.insert(lease.ip, lease);
        self.by_mac.insert(lease.mac, lease);
    }
}

/// An IPv4 network with an allocation range and precomputed reply options.
#[derive(Debug)]
pub struct Subnet {
    /// True iff this subnet was synthesized by automode.
    pub dynamic: bool,

    pub net: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// "a.b.c.d/len", used in logs, metrics and dumps.
    pub prefix: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub lease_ttl_secs: u32,
    pub dns: Vec<Ipv4Addr>,

    /// Reply options shared by every OFFER/ACK from this subnet.
    pub options: Vec<DhcpOption>,

    pub stats: Stats,
    store: RwLock<LeaseStore>,
}

impl Subnet {
    pub(crate) fn from_static(config: &SubnetConfig) -> Self {
        let mut options = vec![DhcpOption::SubnetMask(config.mask)];
        if let Some(router) = config.router {
            options.push(DhcpOption::Router(vec![router]));
        }

        Self {
            dynamic: false,
            net: config.net,
            mask: config.mask,
            prefix: net::prefix_string(config.net, config.mask),
            range_start: config.range_start,
            range_end: config.range_end,
            router: config.router,
            lease_ttl_secs: config.lease_ttl_seconds,
            dns: config.dns.clone(),
            options,
            stats: Stats::new(),
            store: RwLock::new(LeaseStore::default()),
        }
    }

    pub fn store(&self) -> &RwLock<LeaseStore> {
        &self.store
    }

    /// Number of addresses in the inclusive allocation range.
    pub fn capacity(&self) -> usize {
        (u32::from(self.range_end) - u32::from(self.range_start) + 1) as usize
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.mask) == u32::from(self.net)
    }

    /// Recomputes the active/expired counters by scanning `by_ip`.
    pub fn recount(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut store = self.store.write();
        let mut active = 0;
        let mut expired = 0;
        for lease in store.by_ip.values() {
            if lease.expired_at(now) {
                expired += 1;
            } else {
                active += 1;
            }
        }
        store.active_count = active;
        store.expired_count = expired;
        (active, expired)
    }

    /// Last counters computed by [`Subnet::recount`], as (active, expired).
    pub fn lease_counts(&self) -> (usize, usize) {
        let store = self.store.read();
        (store.active_count, store.expired_count)
    }

    /// Removes leases expired for longer than `age` from both indices.
    ///
    /// Scans `by_mac`; the matching `by_ip` entry is removed only when it
    /// still points at the same MAC, so a takeover is never undone. Returns
    /// the number of removals per index.
    pub fn cleanup_expired(&self, now: DateTime<Utc>, age: TimeDelta) -> (usize, usize) {
        let mut store = self.store.write();

        let stale: Vec<Mac> = store
            .by_mac
            .iter()
            .filter(|(_, lease)| now.signed_duration_since(lease.expires) > age)
            .map(|(mac, _)| *mac)
            .collect();

        let mut removed_by_mac = 0;
        let mut removed_by_ip = 0;

        for mac in stale {
            if let Some(lease) = store.by_mac.remove(&mac) {
                removed_by_mac += 1;
                if store
                    .by_ip
                    .get(&lease.ip)
                    .is_some_and(|entry| entry.mac == lease.mac)
                {
                    store.by_ip.remove(&lease.ip);
                    removed_by_ip += 1;
                }
            }
        }

        (removed_by_mac, removed_by_ip)
    }
}

/// Automode parameters of a segment. Range, router and network offsets are
/// relative to the synthesized network address.
#[derive(Debug, Clone)]
pub struct Automode {
    pub mask: Ipv4Addr,
    pub range_start: u32,
    pub range_end: u32,
    pub router: u32,
    pub lease_ttl_secs: u32,
    pub dns: Vec<Ipv4Addr>,
}

impl Automode {
    fn from_config(config: &AutomodeConfig) -> Self {
        Self {
            mask: config.mask,
            range_start: u32::from(config.range_start),
            range_end: u32::from(config.range_end),
            router: u32::from(config.router),
            lease_ttl_secs: config.lease_ttl_seconds,
            dns: config.dns.clone(),
        }
    }

    /// Materializes a subnet from the template for the given network.
    pub fn synthesize(&self, net_addr: Ipv4Addr) -> Subnet {
        let router = net::offset_ip(net_addr, self.router);

        Subnet {
            dynamic: true,
            net: net_addr,
            mask: self.mask,
            prefix: net::prefix_string(net_addr, self.mask),
            range_start: net::offset_ip(net_addr, self.range_start),
            range_end: net::offset_ip(net_addr, self.range_end),
            router: Some(router),
            lease_ttl_secs: self.lease_ttl_secs,
            dns: self.dns.clone(),
            options: vec![
                DhcpOption::Router(vec![router]),
                DhcpOption::SubnetMask(self.mask),
            ],
            stats: Stats::new(),
            store: RwLock::new(LeaseStore::default()),
        }
    }
}

/// An administrative domain: a predicate over relay/remote addresses and the
/// subnets it routes to.
#[derive(Debug)]
pub struct Segment {
    pub id: u32,
    pub name: String,
    pub detect_rule: String,
    rule: Expr,
    pub dns_random: bool,
    pub automode: Option<Automode>,

    /// Distinct masks of this segment's subnets, most specific first.
    pub masks: Vec<Ipv4Addr>,

    subnets: RwLock<HashMap<Ipv4Addr, Arc<Subnet>>>,
    pub stats: Stats,
}

impl Segment {
    fn from_config(config: &SegmentConfig) -> Result<Self> {
        let rule = Expr::parse(&config.detect_rule).map_err(|source| Error::DetectRule {
            segment: config.name.clone(),
            source,
        })?;

        let automode = config
            .automode
            .as_ref()
            .filter(|automode| automode.enable)
            .map(Automode::from_config);

        let mut subnets = HashMap::new();
        let mut masks: Vec<Ipv4Addr> = Vec::new();
        for subnet_config in &config.subnets {
            let subnet = Subnet::from_static(subnet_config);
            if !masks.contains(&subnet.mask) {
                masks.push(subnet.mask);
            }
            subnets.insert(subnet.net, Arc::new(subnet));
        }

        if let Some(automode) = &automode
            && !masks.contains(&automode.mask)
        {
            masks.push(automode.mask);
        }

        // Most specific mask first.
        masks.sort_by_key(|mask| std::cmp::Reverse(u32::from(*mask)));

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            detect_rule: config.detect_rule.clone(),
            rule,
            dns_random: config.dns_random,
            automode,
            masks,
            subnets: RwLock::new(subnets),
            stats: Stats::new(),
        })
    }

    pub fn matches(&self, env: &Env) -> std::result::Result<bool, crate::expr::ExprError> {
        self.rule.matches(env)
    }

    /// Resolves the subnet for a relay address against the configured masks.
    ///
    /// A directory hit counts only when the stored subnet's own mask equals
    /// the applied one; a shorter prefix mapping into an unrelated
    /// longer-prefix network is rejected.
    pub fn find_subnet(&self, relay_ip: Ipv4Addr) -> Option<Arc<Subnet>> {
        let subnets = self.subnets.read();
        for mask in &self.masks {
            let net_addr = Ipv4Addr::from(u32::from(relay_ip) & u32::from(*mask));
            if let Some(subnet) = subnets.get(&net_addr)
                && subnet.mask == *mask
            {
                return Some(Arc::clone(subnet));
            }
        }
        None
    }

    pub fn subnet_by_net(&self, net_addr: Ipv4Addr) -> Option<Arc<Subnet>> {
        self.subnets.read().get(&net_addr).cloned()
    }

    /// Inserts a dynamic subnet for `net_addr`, synthesizing it from the
    /// automode template. Idempotent: a requester losing the insertion race
    /// adopts the winner's subnet. Returns the subnet and whether this call
    /// created it.
    pub fn insert_dynamic(&self, net_addr: Ipv4Addr) -> Option<(Arc<Subnet>, bool)> {
        let automode = self.automode.as_ref()?;

        let mut subnets = self.subnets.write();
        if let Some(existing) = subnets.get(&net_addr) {
            return Some((Arc::clone(existing), false));
        }

        let subnet = Arc::new(automode.synthesize(net_addr));
        subnets.insert(net_addr, Arc::clone(&subnet));
        Some((subnet, true))
    }

    /// Drops every automode-synthesized subnet, returning how many.
    pub fn drop_dynamic_subnets(&self) -> usize {
        let mut subnets = self.subnets.write();
        let before = subnets.len();
        subnets.retain(|_, subnet| !subnet.dynamic);
        before - subnets.len()
    }

    /// Stable-ordered snapshot of the subnet directory.
    pub fn subnets_snapshot(&self) -> Vec<Arc<Subnet>> {
        let mut snapshot: Vec<Arc<Subnet>> = self.subnets.read().values().cloned().collect();
        snapshot.sort_by_key(|subnet| u32::from(subnet.net));
        snapshot
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets.read().len()
    }
}

/// The ordered segment table. Classification walks it in configuration
/// order; the first matching predicate wins.
#[derive(Debug)]
pub struct Catalog {
    pub segments: Vec<Arc<Segment>>,
}

impl Catalog {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut segments = Vec::with_capacity(config.segments.len());
        for segment_config in &config.segments {
            let segment = Segment::from_config(segment_config)?;
            warn!(
                segment = %segment.name,
                id = segment.id,
                subnets = segment.subnet_count(),
                masks = segment.masks.len(),
                automode = segment.automode.is_some(),
                "segment loaded"
            );
            segments.push(Arc::new(segment));
        }
        Ok(Self { segments })
    }

    pub fn segment_by_id(&self, id: u32) -> Option<&Arc<Segment>> {
        self.segments.iter().find(|segment| segment.id == id)
    }

    /// First segment whose predicate matches. Evaluation failures are logged
    /// and treated as a non-match for that segment.
    pub fn classify(&self, env: &Env) -> Option<Arc<Segment>> {
        for segment in &self.segments {
            match segment.matches(env) {
                Ok(true) => return Some(Arc::clone(segment)),
                Ok(false) => {}
                Err(err) => {
                    error!(segment = %segment.name, error = %err, "detect rule evaluation failed");
                }
            }
        }
        None
    }
}
