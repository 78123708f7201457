//! Counter registry and the dump surfaces consumed by the control plane.
//!
//! One [`Stats`] instance exists per process (ingress-level counters), per
//! segment and per subnet. Counters are lock-free atomics; the dump
//! functions only take read locks on the catalog they walk.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RequestsTotal,
    RequestsDiscover,
    RequestsRequest,
    RequestsRelease,
    RequestsDecline,
    RequestsInform,

    RepliesOffer,
    RepliesAck,
    RepliesNak,
    RepliesDrop,

    RelayOption82,
    RelayGiaddr,
    RelayUnicast,

    LeaseExisting,
    LeaseRandom,
    LeaseRange,
    LeaseNoFree,

    ErrorsRelayIpNotFound,
    ErrorsMalformedPacket,
    ErrorsUnknownSegment,
    ErrorsUnknownSubnet,
    ErrorsIncorrectServer,
    ErrorsNoRequestedIp,
    ErrorsConcurrent,
    ErrorsUnsupportedRequest,
    ErrorsOther,

    PacketsIn,
    PacketsOut,
    BytesIn,
    BytesOut,
}

impl Counter {
    pub const ALL: [Counter; 30] = [
        Counter::RequestsTotal,
        Counter::RequestsDiscover,
        Counter::RequestsRequest,
        Counter::RequestsRelease,
        Counter::RequestsDecline,
        Counter::RequestsInform,
        Counter::RepliesOffer,
        Counter::RepliesAck,
        Counter::RepliesNak,
        Counter::RepliesDrop,
        Counter::RelayOption82,
        Counter::RelayGiaddr,
        Counter::RelayUnicast,
        Counter::LeaseExisting,
        Counter::LeaseRandom,
        Counter::LeaseRange,
        Counter::LeaseNoFree,
        Counter::ErrorsRelayIpNotFound,
        Counter::ErrorsMalformedPacket,
        Counter::ErrorsUnknownSegment,
        Counter::ErrorsUnknownSubnet,
        Counter::ErrorsIncorrectServer,
        Counter::ErrorsNoRequestedIp,
        Counter::ErrorsConcurrent,
        Counter::ErrorsUnsupportedRequest,
        Counter::ErrorsOther,
        Counter::PacketsIn,
        Counter::PacketsOut,
        Counter::BytesIn,
        Counter::BytesOut,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::RequestsTotal => "requests_total",
            Counter::RequestsDiscover => "requests_discover",
            Counter::RequestsRequest => "requests_request",
            Counter::RequestsRelease => "requests_release",
            Counter::RequestsDecline => "requests_decline",
            Counter::RequestsInform => "requests_inform",
            Counter::RepliesOffer => "replies_offer",
            Counter::RepliesAck => "replies_ack",
            Counter::RepliesNak => "replies_nak",
            Counter::RepliesDrop => "replies_drop",
            Counter::RelayOption82 => "relay_ip_option82",
            Counter::RelayGiaddr => "relay_ip_giaddr",
            Counter::RelayUnicast => "relay_ip_unicast",
            Counter::LeaseExisting => "lease_existing",
            Counter::LeaseRandom => "lease_random",
            Counter::LeaseRange => "lease_range",
            Counter::LeaseNoFree => "lease_no_free",
            Counter::ErrorsRelayIpNotFound => "errors_relay_ip_not_found",
            Counter::ErrorsMalformedPacket => "errors_malformed_packet",
            Counter::ErrorsUnknownSegment => "errors_unknown_segment",
            Counter::ErrorsUnknownSubnet => "errors_unknown_subnet",
            Counter::ErrorsIncorrectServer => "errors_incorrect_server",
            Counter::ErrorsNoRequestedIp => "errors_no_requested_ip",
            Counter::ErrorsConcurrent => "errors_concurrent_request",
            Counter::ErrorsUnsupportedRequest => "errors_unsupported_request",
            Counter::ErrorsOther => "errors_other",
            Counter::PacketsIn => "packets_in",
            Counter::PacketsOut => "packets_out",
            Counter::BytesIn => "bytes_in",
            Counter::BytesOut => "bytes_out",
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; Counter::ALL.len()],
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, by: u64) {
        self.counters[counter as usize].fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|counter| (counter.name(), self.get(*counter)))
            .collect()
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for counter in Counter::ALL {
            let _ = writeln!(out, "{:<28} {}", counter.name(), self.get(counter));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct SubnetReport {
    pub subnet: String,
    pub capacity: usize,
    pub leases_active: usize,
    pub leases_expired: usize,
    pub stats: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Serialize)]
pub struct SegmentReport {
    pub name: String,
    pub capacity: usize,
    pub leases_active: usize,
    pub leases_expired: usize,
    pub stats: BTreeMap<&'static str, u64>,
    pub subnets: BTreeMap<String, SubnetReport>,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub generated_in: String,
    pub segments: BTreeMap<String, SegmentReport>,
}

pub fn dump_global(stats: &Stats, uptime: Duration) -> String {
    let mut out = format!("Process uptime: {:?}\n\nGlobal statistics:\n", uptime);
    for line in stats.dump().lines() {
        let _ = writeln!(out, " {}", line);
    }
    out
}

pub fn dump_segments(catalog: &Catalog) -> String {
    let mut out = String::new();
    for segment in &catalog.segments {
        let mut capacity = 0;
        let mut active = 0;
        let mut expired = 0;
        let subnets = segment.subnets_snapshot();
        for subnet in &subnets {
            let (subnet_active, subnet_expired) = subnet.lease_counts();
            capacity += subnet.capacity();
            active += subnet_active;
            expired += subnet_expired;
        }

        let _ = writeln!(
            out,
            "Segment '{}' statistics ({} subnets, {}/{}/{} leases total/active/expired):",
            segment.name,
            subnets.len(),
            capacity,
            active,
            expired,
        );
        for line in segment.stats.dump().lines() {
            let _ = writeln!(out, " {}", line);
        }
    }
    out
}

pub fn dump_subnets(catalog: &Catalog) -> String {
    let mut out = String::new();
    for segment in &catalog.segments {
        let _ = writeln!(out, "Segment '{}' statistics:", segment.name);
        for subnet in segment.subnets_snapshot() {
            let (active, expired) = subnet.lease_counts();
            let _ = writeln!(
                out,
                " Subnet '{}' ({}/{}/{} leases total/active/expired):",
                subnet.prefix,
                subnet.capacity(),
                active,
                expired,
            );
            for line in subnet.stats.dump().lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }
    }
    out
}

pub fn dump_leases(catalog: &Catalog) -> String {
    let mut out = String::new();
    for segment in &catalog.segments {
        let _ = writeln!(out, "Segment '{}':", segment.name);
        for subnet in segment.subnets_snapshot() {
            let store = subnet.store().read();
            if store.by_ip.is_empty() {
                continue;
            }

            let _ = writeln!(out, " Subnet '{}' ({} leases):", subnet.prefix, store.by_ip.len());

            let mut leases: Vec<_> = store.by_ip.values().collect();
            leases.sort_by_key(|lease| u32::from(lease.ip));
            for lease in leases {
                let _ = writeln!(
                    out,
                    "  {:<15} {} ({} sec)",
                    lease.ip,
                    lease.mac,
                    lease.expires_in()
                );
            }
        }
    }
    out
}

pub fn report(catalog: &Catalog, generated_in: Duration) -> StatsReport {
    let mut segments = BTreeMap::new();

    for segment in &catalog.segments {
        let mut segment_report = SegmentReport {
            name: segment.name.clone(),
            capacity: 0,
            leases_active: 0,
            leases_expired: 0,
            stats: segment.stats.snapshot(),
            subnets: BTreeMap::new(),
        };

        for subnet in segment.subnets_snapshot() {
            let (active, expired) = subnet.lease_counts();
            let subnet_report = SubnetReport {
                subnet: subnet.prefix.clone(),
                capacity: subnet.capacity(),
                leases_active: active,
                leases_expired: expired,
                stats: subnet.stats.snapshot(),
            };

            segment_report.capacity += subnet_report.capacity;
            segment_report.leases_active += active;
            segment_report.leases_expired += expired;
            segment_report
                .subnets
                .insert(subnet.prefix.clone(), subnet_report);
        }

        segments.insert(segment.name.clone(), segment_report);
    }

    StatsReport {
        generated_in: format!("{:?}", generated_in),
        segments,
    }
}
