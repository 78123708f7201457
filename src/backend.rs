//! Lease backend: allocation, renewal, deletion and the periodic workers.
//!
//! Every operation here runs under one subnet's write lock for its whole
//! duration; the critical sections are pure memory. Callers receive
//! value-copied outcomes — a live lease never escapes the lock.
//!
//! Two background workers share an exclusion so only one runs at a time:
//! the stats worker recounts active/expired leases, the cleanup worker
//! evicts leases that stayed expired longer than the configured age. Both
//! take the shared side of the cache-reload barrier and hold at most one
//! subnet lock at any moment.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::catalog::{Lease, LeaseStore, Subnet};
use crate::context::Services;
use crate::metrics::{self, CleanupMetric, SegmentStatsMetric, SubnetStatsMetric};
use crate::net::Mac;

/// How an OFFER's address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseSource {
    Existing,
    Random,
    Range,
}

impl fmt::Display for LeaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Existing => write!(f, "Existing"),
            Self::Random => write!(f, "Random"),
            Self::Range => write!(f, "Range"),
        }
    }
}

/// Why a REQUEST could not be matched to a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NotFound,
    Expired,
    AnotherMac,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NotFound"),
            Self::Expired => write!(f, "Expired"),
            Self::AnotherMac => write!(f, "AnotherMAC"),
        }
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    /// Snapshot of the renewed lease, taken under the subnet lock. The
    /// snapshot keeps the discover flag for transaction metrics; the live
    /// lease has it cleared.
    Updated(Lease),
    Miss(NotFoundReason),
}

/// Finds or allocates a lease for a DISCOVER.
///
/// Order: adopt the MAC's existing binding if the indices agree on it, then
/// up to `random_tries` uniform probes over the range, then a linear scan.
/// An inconsistent `by_mac` entry is repaired (deleted) and allocation
/// continues. Returns `None` when the range is exhausted.
pub fn lease_find(
    subnet: &Subnet,
    mac: Mac,
    start: DateTime<Utc>,
    grace_secs: u32,
    random_tries: u32,
) -> Option<(Ipv4Addr, LeaseSource)> {
    let mut store = subnet.store().write();

    if let Some(entry) = store.by_mac.get(&mac).copied() {
        match store.by_ip.get(&entry.ip).copied() {
            Some(owner) if owner.mac == mac => {
                debug!(ip = %owner.ip, %mac, expired = owner.expired_at(start), "adopting existing lease");
                let renewed = Lease::offered(owner.ip, mac, start, grace_secs);
                store.insert(renewed);
                return Some((owner.ip, LeaseSource::Existing));
            }
            Some(owner) => {
                debug!(ip = %entry.ip, owner = %owner.mac, %mac, "lease points at address owned by another MAC");
            }
            None => {
                debug!(ip = %entry.ip, %mac, "lease has no by-ip counterpart, removing stale entry");
                store.by_mac.remove(&mac);
            }
        }
    }

    let range_start = u32::from(subnet.range_start);
    let range_end = u32::from(subnet.range_end);

    let mut rng = rand::thread_rng();
    for _ in 0..random_tries {
        let ip = Ipv4Addr::from(rng.gen_range(range_start..=range_end));
        if lease_add(&mut store, ip, mac, start, grace_secs) {
            return Some((ip, LeaseSource::Random));
        }
    }

    for value in range_start..=range_end {
        let ip = Ipv4Addr::from(value);
        if lease_add(&mut store, ip, mac, start, grace_secs) {
            return Some((ip, LeaseSource::Range));
        }
    }

    None
}

/// Probes a single address. An occupied, unexpired slot fails; an expired
/// one is taken over.
fn lease_add(
    store: &mut LeaseStore,
    ip: Ipv4Addr,
    mac: Mac,
    start: DateTime<Utc>,
    grace_secs: u32,
) -> bool {
    if let Some(existing) = store.by_ip.get(&ip) {
        if !existing.expired_at(start) {
            return false;
        }
        debug!(%ip, previous = %existing.mac, "occupied lease already expired, taking over");
    }

    store.insert(Lease::offered(ip, mac, start, grace_secs));
    true
}

/// Confirms a REQUEST against the store.
///
/// On success the lease is extended to the subnet TTL and its discover
/// phase ends.
pub fn lease_check_and_update(
    subnet: &Subnet,
    ip: Ipv4Addr,
    mac: Mac,
    start: DateTime<Utc>,
) -> UpdateOutcome {
    let mut store = subnet.store().write();

    let Some(entry) = store.by_ip.get(&ip).copied() else {
        return UpdateOutcome::Miss(NotFoundReason::NotFound);
    };
    if entry.expired_at(start) {
        return UpdateOutcome::Miss(NotFoundReason::Expired);
    }
    if entry.mac != mac {
        return UpdateOutcome::Miss(NotFoundReason::AnotherMac);
    }

    let snapshot = Lease {
        expires: start + TimeDelta::seconds(i64::from(subnet.lease_ttl_secs)),
        ..entry
    };
    let live = Lease {
        discover: false,
        ..snapshot
    };

    store.by_ip.insert(ip, live);
    if store.by_mac.get(&mac).is_some_and(|lease| lease.ip == ip) {
        store.by_mac.insert(mac, live);
    }

    UpdateOutcome::Updated(snapshot)
}

/// Deletes the lease for `ip` if it belongs to `mac`, expired or not.
/// A MAC mismatch is a silent no-op. Returns the removed lease.
pub fn lease_check_and_delete(subnet: &Subnet, ip: Ipv4Addr, mac: Mac) -> Option<Lease> {
    let mut store = subnet.store().write();

    match store.by_ip.get(&ip).copied() {
        Some(entry) if entry.mac == mac => {
            store.by_ip.remove(&ip);
            store.by_mac.remove(&mac);
            debug!(%ip, %mac, "lease removed");
            Some(entry)
        }
        Some(entry) => {
            debug!(%ip, owner = %entry.mac, %mac, "lease belongs to another MAC, keeping it");
            None
        }
        None => {
            debug!(%ip, "lease not found");
            None
        }
    }
}

/// Starts the stats and cleanup workers.
pub fn spawn_workers(services: Arc<Services>) {
    let worker_lock = Arc::new(Mutex::new(()));
    tokio::spawn(stats_worker(Arc::clone(&services), Arc::clone(&worker_lock)));
    tokio::spawn(cleanup_worker(services, worker_lock));
}

async fn stats_worker(services: Arc<Services>, worker_lock: Arc<Mutex<()>>) {
    let interval = Duration::from_secs(services.config.dhcp.stats_interval_seconds);

    loop {
        tokio::time::sleep(interval).await;

        let _worker = worker_lock.lock().await;
        let _barrier = services.reload_barrier.read().await;
        let now = Utc::now();

        for segment in &services.catalog.segments {
            let segment_started = Instant::now();
            let mut capacity = 0;
            let mut active = 0;
            let mut expired = 0;

            let subnets = segment.subnets_snapshot();
            for subnet in &subnets {
                let subnet_started = Instant::now();
                let (subnet_active, subnet_expired) = subnet.recount(now);
                capacity += subnet.capacity();
                active += subnet_active;
                expired += subnet_expired;

                let metric = SubnetStatsMetric {
                    server_id: services.config.server_id.clone(),
                    segment_id: segment.id,
                    segment_name: segment.name.clone(),
                    subnet: subnet.prefix.clone(),
                    duration: subnet_started.elapsed(),
                    capacity: subnet.capacity(),
                    active: subnet_active,
                    expired: subnet_expired,
                };
                tokio::spawn(async move { metrics::emit_subnet_stats(&metric) });
            }

            let metric = SegmentStatsMetric {
                server_id: services.config.server_id.clone(),
                segment_id: segment.id,
                segment_name: segment.name.clone(),
                duration: segment_started.elapsed(),
                capacity,
                active,
                expired,
            };
            tokio::spawn(async move { metrics::emit_segment_stats(&metric) });

            if services.config.log.tickers {
                warn!(
                    segment = %segment.name,
                    id = segment.id,
                    subnets = subnets.len(),
                    capacity,
                    active,
                    expired,
                    elapsed = ?segment_started.elapsed(),
                    "ticker: stats worker pass done"
                );
            }
        }
    }
}

async fn cleanup_worker(services: Arc<Services>, worker_lock: Arc<Mutex<()>>) {
    let interval = Duration::from_secs(services.config.dhcp.cleanup_interval_seconds);
    let age = TimeDelta::seconds(services.config.dhcp.cleanup_age_seconds as i64);

    loop {
        tokio::time::sleep(interval).await;

        let _worker = worker_lock.lock().await;
        let _barrier = services.reload_barrier.read().await;
        let now = Utc::now();

        for segment in &services.catalog.segments {
            let segment_started = Instant::now();
            let mut total_by_mac = 0;
            let mut total_by_ip = 0;

            let subnets = segment.subnets_snapshot();
            for subnet in &subnets {
                let subnet_started = Instant::now();
                let (by_mac, by_ip) = subnet.cleanup_expired(now, age);
                total_by_mac += by_mac;
                total_by_ip += by_ip;

                let metric = CleanupMetric {
                    server_id: services.config.server_id.clone(),
                    segment_id: segment.id,
                    segment_name: segment.name.clone(),
                    subnet: subnet.prefix.clone(),
                    duration: subnet_started.elapsed(),
                    expired_by_mac: by_mac,
                    expired_by_ip: by_ip,
                };
                tokio::spawn(async move { metrics::emit_cleanup(&metric) });
            }

            if services.config.log.tickers {
                warn!(
                    segment = %segment.name,
                    id = segment.id,
                    subnets = subnets.len(),
                    expired_by_mac = total_by_mac,
                    expired_by_ip = total_by_ip,
                    elapsed = ?segment_started.elapsed(),
                    "ticker: cleanup worker pass done"
                );
            }
        }
    }
}
