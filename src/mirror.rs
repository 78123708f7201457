//! Persistence mirror: one-way replication of leases and dynamic subnets to
//! an external Redis-protocol key/value store, and the bulk reload that
//! rebuilds the in-memory cache from it.
//!
//! Mirroring is fire-and-forget: writers run in their own tasks, failures
//! are logged and never block request handling. Lease records carry a TTL
//! slightly past their lease expiry so the store prunes itself; subnet
//! records live until overwritten by the next reload cycle.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::catalog::{Catalog, Lease};
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::net::Mac;

/// Extra seconds a mirrored lease outlives its in-memory expiry.
const LEASE_TTL_SLACK_SECS: i64 = 5;

/// A mirrored lease: key `{key_leases}:{segment_id}:{ip}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub segment_id: u32,
    pub subnet: u32,
    pub ip: u32,
    pub mac: u64,
    pub expires: i64,
}

/// A mirrored dynamic subnet: key `{key_subnets}:{segment_id}:{net}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub segment_id: u32,
    pub subnet: u32,
}

pub struct Mirror {
    connection: redis::aio::ConnectionManager,
    key_leases: String,
    key_subnets: String,
    scan_timeout: Duration,
    reloading: AtomicBool,
}

impl Mirror {
    pub async fn connect(config: &MirrorConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = client.get_connection_manager().await?;

        Ok(Self {
            connection,
            key_leases: config.key_leases.clone(),
            key_subnets: config.key_subnets.clone(),
            scan_timeout: Duration::from_secs(config.scan_timeout_seconds),
            reloading: AtomicBool::new(false),
        })
    }

    fn lease_key(&self, segment_id: u32, ip: Ipv4Addr) -> String {
        format!("{}:{}:{}", self.key_leases, segment_id, u32::from(ip))
    }

    fn subnet_key(&self, segment_id: u32, net_addr: Ipv4Addr) -> String {
        format!("{}:{}:{}", self.key_subnets, segment_id, u32::from(net_addr))
    }

    /// Upserts a lease snapshot with a TTL covering its remaining lifetime.
    pub async fn upsert_lease(
        &self,
        segment_id: u32,
        subnet_net: Ipv4Addr,
        lease: &Lease,
    ) -> Result<()> {
        let record = LeaseRecord {
            segment_id,
            subnet: u32::from(subnet_net),
            ip: u32::from(lease.ip),
            mac: lease.mac.0,
            expires: lease.expires.timestamp(),
        };

        let ttl = (lease.expires_in() + LEASE_TTL_SLACK_SECS).max(1) as u64;
        let payload = serde_json::to_string(&record)?;

        let mut connection = self.connection.clone();
        let _: () = connection
            .set_ex(self.lease_key(segment_id, lease.ip), payload, ttl)
            .await?;
        Ok(())
    }

    pub async fn delete_lease(&self, segment_id: u32, ip: Ipv4Addr) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(self.lease_key(segment_id, ip)).await?;
        Ok(())
    }

    pub async fn upsert_subnet(&self, segment_id: u32, net_addr: Ipv4Addr) -> Result<()> {
        let record = SubnetRecord {
            segment_id,
            subnet: u32::from(net_addr),
        };
        let payload = serde_json::to_string(&record)?;

        let mut connection = self.connection.clone();
        let _: () = connection
            .set(self.subnet_key(segment_id, net_addr), payload)
            .await?;
        Ok(())
    }

    /// Round-trips a PING, for the admin self-test.
    pub async fn selftest(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    pub async fn scan_leases(&self) -> Result<Vec<LeaseRecord>> {
        self.scan_set(&self.key_leases).await
    }

    pub async fn scan_subnets(&self) -> Result<Vec<SubnetRecord>> {
        self.scan_set(&self.key_subnets).await
    }

    async fn scan_set<T: serde::de::DeserializeOwned>(&self, key_prefix: &str) -> Result<Vec<T>> {
        let pattern = format!("{}:*", key_prefix);
        tokio::time::timeout(self.scan_timeout, self.scan_pattern(pattern))
            .await
            .map_err(|_| Error::MirrorScanTimeout)?
    }

    async fn scan_pattern<T: serde::de::DeserializeOwned>(&self, pattern: String) -> Result<Vec<T>> {
        let mut connection = self.connection.clone();

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(512)
                .query_async(&mut connection)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = connection.mget(&keys).await?;

        let mut records = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            // Keys can expire between SCAN and MGET.
            let Some(value) = value else { continue };
            match serde_json::from_str(&value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(%key, error = %err, "skipping undecodable mirror record");
                }
            }
        }
        Ok(records)
    }
}

/// Imports mirrored dynamic subnets into automode-enabled segments.
/// Records for unknown segments, automode-disabled segments or already
/// present networks are skipped. No outward writes happen here.
pub fn import_subnets(catalog: &Catalog, records: &[SubnetRecord]) -> usize {
    let mut imported = 0;

    for record in records {
        let net_addr = Ipv4Addr::from(record.subnet);

        let Some(segment) = catalog.segment_by_id(record.segment_id) else {
            warn!(segment_id = record.segment_id, net = %net_addr, "unknown segment, skipping subnet");
            continue;
        };

        if segment.automode.is_none() {
            warn!(segment = %segment.name, net = %net_addr, "segment has automode disabled, skipping subnet");
            continue;
        }

        if segment.subnet_by_net(net_addr).is_some() {
            debug!(segment = %segment.name, net = %net_addr, "subnet already present, skipping");
            continue;
        }

        if let Some((subnet, created)) = segment.insert_dynamic(net_addr)
            && created
        {
            debug!(segment = %segment.name, subnet = %subnet.prefix, "subnet imported");
            imported += 1;
        }
    }

    imported
}

/// Imports mirrored leases into both indices of their subnets. Expired
/// records and records pointing at unknown segments or subnets are skipped;
/// a MAC already present in a subnet counts as a duplicate and is skipped.
/// Returns (imported, duplicates).
pub fn import_leases(
    catalog: &Catalog,
    records: &[LeaseRecord],
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut imported = 0;
    let mut duplicates = 0;

    for record in records {
        let expires = match Utc.timestamp_opt(record.expires, 0).single() {
            Some(expires) => expires,
            None => {
                warn!(expires = record.expires, "lease record carries an invalid timestamp, skipping");
                continue;
            }
        };
        if expires <= now {
            continue;
        }

        let net_addr = Ipv4Addr::from(record.subnet);
        let ip = Ipv4Addr::from(record.ip);
        let mac = Mac(record.mac);

        let Some(segment) = catalog.segment_by_id(record.segment_id) else {
            warn!(segment_id = record.segment_id, %ip, "unknown segment, skipping lease");
            continue;
        };

        let Some(subnet) = segment.subnet_by_net(net_addr) else {
            warn!(segment = %segment.name, net = %net_addr, %ip, "unknown subnet, skipping lease");
            continue;
        };

        let mut store = subnet.store().write();
        if store.by_mac.contains_key(&mac) {
            duplicates += 1;
            continue;
        }

        store.insert(Lease {
            ip,
            mac,
            expires,
            discover: false,
            discover_at: DateTime::<Utc>::MIN_UTC,
        });
        imported += 1;
    }

    (imported, duplicates)
}

#[derive(Debug, Clone, Copy)]
pub struct ReloadSummary {
    pub duration: Duration,
    pub subnets: usize,
    pub leases: usize,
    pub duplicates: usize,
}

/// Rebuilds the dynamic-subnet and lease cache from the mirror.
///
/// Fails fast if a reload is already running. Takes the reload barrier
/// exclusively, so in-flight requests drain before any state changes;
/// every dynamic subnet is dropped and re-imported, then leases follow.
pub async fn cache_reload(
    catalog: &Catalog,
    mirror: &Mirror,
    barrier: &RwLock<()>,
) -> Result<ReloadSummary> {
    if mirror
        .reloading
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        error!("cache reload already in progress");
        return Err(Error::ReloadInProgress);
    }

    let result = reload_locked(catalog, mirror, barrier).await;
    mirror.reloading.store(false, Ordering::SeqCst);

    match &result {
        Ok(summary) => warn!(
            subnets = summary.subnets,
            leases = summary.leases,
            duplicates = summary.duplicates,
            elapsed = ?summary.duration,
            "cache reloaded"
        ),
        Err(err) => error!(error = %err, "cache reload failed"),
    }

    result
}

async fn reload_locked(
    catalog: &Catalog,
    mirror: &Mirror,
    barrier: &RwLock<()>,
) -> Result<ReloadSummary> {
    let started = Instant::now();
    warn!("starting cache reload from the mirror");

    let _exclusive = barrier.write().await;

    for segment in &catalog.segments {
        let dropped = segment.drop_dynamic_subnets();
        if dropped > 0 {
            debug!(segment = %segment.name, dropped, "dynamic subnets dropped");
        }
    }

    let subnet_records = mirror.scan_subnets().await?;
    let subnets = import_subnets(catalog, &subnet_records);

    let lease_records = mirror.scan_leases().await?;
    let (leases, duplicates) = import_leases(catalog, &lease_records, Utc::now());

    Ok(ReloadSummary {
        duration: started.elapsed(),
        subnets,
        leases,
        duplicates,
    })
}

/// Spawns a fire-and-forget lease upsert.
pub fn spawn_upsert_lease(mirror: &Arc<Mirror>, segment_id: u32, subnet_net: Ipv4Addr, lease: Lease) {
    let mirror = Arc::clone(mirror);
    tokio::spawn(async move {
        if let Err(err) = mirror.upsert_lease(segment_id, subnet_net, &lease).await {
            error!(ip = %lease.ip, error = %err, "unable to mirror lease");
        }
    });
}

/// Spawns a fire-and-forget lease deletion.
pub fn spawn_delete_lease(mirror: &Arc<Mirror>, segment_id: u32, ip: Ipv4Addr) {
    let mirror = Arc::clone(mirror);
    tokio::spawn(async move {
        if let Err(err) = mirror.delete_lease(segment_id, ip).await {
            error!(%ip, error = %err, "unable to mirror lease deletion");
        }
    });
}

/// Spawns a fire-and-forget subnet upsert.
pub fn spawn_upsert_subnet(mirror: &Arc<Mirror>, segment_id: u32, net_addr: Ipv4Addr) {
    let mirror = Arc::clone(mirror);
    tokio::spawn(async move {
        if let Err(err) = mirror.upsert_subnet(segment_id, net_addr).await {
            error!(net = %net_addr, error = %err, "unable to mirror subnet");
        }
    });
}
