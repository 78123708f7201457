//! Metric emission seam.
//!
//! The core emits one metric per handled request plus per-subnet stats and
//! cleanup metrics from the workers. Shipping to a time-series sink lives
//! outside this crate; here every metric becomes a structured `tracing`
//! event on the `segdhcpd::metrics` target that an exporter layer can
//! subscribe to. Everything passed in is a snapshot copy — never a live
//! catalog reference.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::info;

use crate::backend::{LeaseSource, NotFoundReason};
use crate::context::{DropReason, NakReason, RelaySource};
use crate::net::Mac;
use crate::options::MessageType;

const TARGET: &str = "segdhcpd::metrics";

/// Everything worth recording about one handled request.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub server_id: String,
    pub local_ip: Ipv4Addr,
    pub mac: Mac,
    pub remote_ip: Ipv4Addr,
    pub request: MessageType,
    pub response: Option<MessageType>,
    pub segment_id: Option<u32>,
    pub segment_name: Option<String>,
    pub subnet: Option<String>,
    pub relay_ip: Option<Ipv4Addr>,
    pub relay_source: Option<RelaySource>,
    pub lease_ip: Option<Ipv4Addr>,
    pub lease_source: Option<LeaseSource>,
    pub drop_reason: Option<DropReason>,
    pub nak_reason: Option<NakReason>,
    pub notfound_reason: Option<NotFoundReason>,
    pub request_size: usize,
    pub response_size: usize,
    pub duration: Duration,
    /// DISCOVER-to-ACK latency, present when the confirmed lease was still
    /// in its discover phase.
    pub tx_duration_ms: Option<i64>,
    /// Remaining lease TTL, present on ACK.
    pub ttl: Option<i64>,
}

pub fn emit_request(metric: &RequestMetric) {
    info!(
        target: TARGET,
        server_id = %metric.server_id,
        local_ip = %metric.local_ip,
        mac = %metric.mac,
        remote_ip = %metric.remote_ip,
        request = %metric.request,
        response = metric.response.map(tracing::field::display),
        segment_id = metric.segment_id,
        segment = metric.segment_name.as_deref(),
        subnet = metric.subnet.as_deref(),
        relay_ip = metric.relay_ip.map(tracing::field::display),
        relay_source = metric.relay_source.map(tracing::field::display),
        lease_ip = metric.lease_ip.map(tracing::field::display),
        lease_source = metric.lease_source.map(tracing::field::display),
        drop_reason = metric.drop_reason.map(tracing::field::display),
        nak_reason = metric.nak_reason.map(tracing::field::display),
        notfound_reason = metric.notfound_reason.map(tracing::field::display),
        request_size = metric.request_size,
        response_size = metric.response_size,
        duration_us = metric.duration.as_micros() as u64,
        tx_duration_ms = metric.tx_duration_ms,
        ttl = metric.ttl,
        "request"
    );
}

#[derive(Debug, Clone)]
pub struct SubnetStatsMetric {
    pub server_id: String,
    pub segment_id: u32,
    pub segment_name: String,
    pub subnet: String,
    pub duration: Duration,
    pub capacity: usize,
    pub active: usize,
    pub expired: usize,
}

pub fn emit_subnet_stats(metric: &SubnetStatsMetric) {
    info!(
        target: TARGET,
        server_id = %metric.server_id,
        segment_id = metric.segment_id,
        segment = %metric.segment_name,
        subnet = %metric.subnet,
        duration_us = metric.duration.as_micros() as u64,
        capacity = metric.capacity,
        active = metric.active,
        expired = metric.expired,
        "subnet stats"
    );
}

#[derive(Debug, Clone)]
pub struct SegmentStatsMetric {
    pub server_id: String,
    pub segment_id: u32,
    pub segment_name: String,
    pub duration: Duration,
    pub capacity: usize,
    pub active: usize,
    pub expired: usize,
}

pub fn emit_segment_stats(metric: &SegmentStatsMetric) {
    info!(
        target: TARGET,
        server_id = %metric.server_id,
        segment_id = metric.segment_id,
        segment = %metric.segment_name,
        duration_us = metric.duration.as_micros() as u64,
        capacity = metric.capacity,
        active = metric.active,
        expired = metric.expired,
        "segment stats"
    );
}

#[derive(Debug, Clone)]
pub struct CleanupMetric {
    pub server_id: String,
    pub segment_id: u32,
    pub segment_name: String,
    pub subnet: String,
    pub duration: Duration,
    pub expired_by_mac: usize,
    pub expired_by_ip: usize,
}

pub fn emit_cleanup(metric: &CleanupMetric) {
    info!(
        target: TARGET,
        server_id = %metric.server_id,
        segment_id = metric.segment_id,
        segment = %metric.segment_name,
        subnet = %metric.subnet,
        duration_us = metric.duration.as_micros() as u64,
        expired_by_mac = metric.expired_by_mac,
        expired_by_ip = metric.expired_by_ip,
        "cleanup"
    );
}
