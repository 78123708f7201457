//! Per-request context assembly and the packet-processing pipeline.
//!
//! One context lives per accepted datagram. The pipeline resolves the relay
//! address, classifies the segment, resolves the subnet (synthesizing it in
//! automode), serializes work per client MAC and dispatches on the message
//! type. Whatever the outcome, it funnels into [`RequestContext::finish`],
//! which assembles the reply, settles counters, releases the in-flight
//! marker and emits the request metric.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::backend::{self, LeaseSource, NotFoundReason, UpdateOutcome};
use crate::catalog::{Catalog, Lease, Segment, Subnet};
use crate::config::Config;
use crate::expr::Env;
use crate::metrics::{self, RequestMetric};
use crate::mirror::{self, Mirror};
use crate::net::Mac;
use crate::options::{self, DhcpOption, MessageType};
use crate::packet::DhcpPacket;
use crate::shard::InflightMacs;
use crate::stats::{Counter, Stats};

/// Why a request produced no reply. The in-memory lease backend is
/// infallible, so there is no backend-error tag; every drop maps to one of
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MalformedPacket,
    RelayIpNotFound,
    UnknownSegment,
    UnknownSubnet,
    ConcurrentRequest,
    NoFreeLeases,
    IncorrectServer,
    NoRequestedIp,
    UnsupportedRequest,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPacket => write!(f, "MalformedPacket"),
            Self::RelayIpNotFound => write!(f, "RelayIPNotFound"),
            Self::UnknownSegment => write!(f, "UnknownSegment"),
            Self::UnknownSubnet => write!(f, "UnknownSubnet"),
            Self::ConcurrentRequest => write!(f, "ConcurrentRequest"),
            Self::NoFreeLeases => write!(f, "NoFreeLeases"),
            Self::IncorrectServer => write!(f, "IncorrectServer"),
            Self::NoRequestedIp => write!(f, "NoRequestedIP"),
            Self::UnsupportedRequest => write!(f, "UnsupportedRequest"),
        }
    }
}

/// Why a REQUEST was answered with NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    IpSubnetMismatch,
    LeaseNotFound,
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpSubnetMismatch => write!(f, "IPSubnetMismatch"),
            Self::LeaseNotFound => write!(f, "LeaseNotFound"),
        }
    }
}

/// Where the relay address came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySource {
    Option82,
    GiAddr,
    Unicast,
}

impl RelaySource {
    fn counter(self) -> Counter {
        match self {
            Self::Option82 => Counter::RelayOption82,
            Self::GiAddr => Counter::RelayGiaddr,
            Self::Unicast => Counter::RelayUnicast,
        }
    }
}

impl fmt::Display for RelaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Option82 => write!(f, "Option82"),
            Self::GiAddr => write!(f, "GIAddr"),
            Self::Unicast => write!(f, "Unicast"),
        }
    }
}

fn lease_source_counter(source: LeaseSource) -> Counter {
    match source {
        LeaseSource::Existing => Counter::LeaseExisting,
        LeaseSource::Random => Counter::LeaseRandom,
        LeaseSource::Range => Counter::LeaseRange,
    }
}

/// Process-wide collaborators carried by every request.
pub struct Services {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub stats: Arc<Stats>,
    pub inflight: Arc<InflightMacs>,
    pub reload_barrier: Arc<tokio::sync::RwLock<()>>,
    pub mirror: Option<Arc<Mirror>>,
}

enum RelayResolution {
    Resolved(Ipv4Addr),
    Malformed,
    NotFound,
}

enum SubnetResolution {
    Resolved(Arc<Subnet>),
    Synthesized(Arc<Subnet>),
    Unknown,
}

enum Reply {
    Offer,
    Ack,
    Nak,
    Drop,
}

pub struct RequestContext {
    services: Arc<Services>,
    packet: DhcpPacket,
    request_type: MessageType,
    response_type: Option<MessageType>,

    mac: Mac,
    remote_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    relay_ip: Option<Ipv4Addr>,
    relay_source: Option<RelaySource>,
    ip: Option<Ipv4Addr>,

    segment: Option<Arc<Segment>>,
    subnet: Option<Arc<Subnet>>,
    lease: Option<Lease>,

    reply_options: Vec<DhcpOption>,

    drop_reason: Option<DropReason>,
    nak_reason: Option<NakReason>,
    notfound_reason: Option<NotFoundReason>,
    lease_source: Option<LeaseSource>,

    started: DateTime<Utc>,
    started_at: Instant,
    request_size: usize,
    response_size: usize,
    work_started: bool,
}

/// Runs one validated datagram through the pipeline. Returns the encoded
/// reply, or `None` for a drop.
pub async fn handle_request(
    services: &Arc<Services>,
    packet: DhcpPacket,
    request_type: MessageType,
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
    request_size: usize,
) -> Option<Vec<u8>> {
    // Shared hold for the whole request; cache reload takes the exclusive
    // side, so in-flight work drains before state changes.
    let _shared = services.reload_barrier.read().await;

    let mut ctx = RequestContext::new(services, packet, request_type, local_ip, remote_ip, request_size);

    let relay_ip = match ctx.resolve_relay_ip() {
        RelayResolution::Resolved(relay_ip) => relay_ip,
        RelayResolution::Malformed => {
            services.stats.inc(Counter::ErrorsMalformedPacket);
            ctx.drop_reason = Some(DropReason::MalformedPacket);
            return ctx.finish(Reply::Drop);
        }
        RelayResolution::NotFound => {
            warn!(mac = %ctx.mac, remote = %remote_ip, "cannot determine relay IP, dropping");
            services.stats.inc(Counter::ErrorsRelayIpNotFound);
            ctx.drop_reason = Some(DropReason::RelayIpNotFound);
            return ctx.finish(Reply::Drop);
        }
    };

    if ctx.mac.is_zero() {
        warn!(remote = %remote_ip, "zero MAC, dropping request");
        services.stats.inc(Counter::ErrorsMalformedPacket);
        ctx.drop_reason = Some(DropReason::MalformedPacket);
        return ctx.finish(Reply::Drop);
    }

    let env = Env {
        remote_ip: u32::from(remote_ip),
        relay_ip: u32::from(relay_ip),
    };
    let Some(segment) = services.catalog.classify(&env) else {
        warn!(mac = %ctx.mac, relay = %relay_ip, "no segment matched, dropping request");
        services.stats.inc(Counter::ErrorsUnknownSegment);
        ctx.drop_reason = Some(DropReason::UnknownSegment);
        return ctx.finish(Reply::Drop);
    };
    debug!(segment = %segment.name, "segment detected");
    ctx.segment = Some(Arc::clone(&segment));

    let subnet = match ctx.obtain_subnet(&segment, relay_ip) {
        SubnetResolution::Resolved(subnet) | SubnetResolution::Synthesized(subnet) => subnet,
        SubnetResolution::Unknown => {
            warn!(relay = %relay_ip, segment = %segment.name, "relay IP belongs to no configured subnet, dropping");
            services.stats.inc(Counter::ErrorsUnknownSubnet);
            ctx.drop_reason = Some(DropReason::UnknownSubnet);
            return ctx.finish(Reply::Drop);
        }
    };
    debug!(subnet = %subnet.prefix, "subnet detected");
    ctx.subnet = Some(Arc::clone(&subnet));

    ctx.stats_inc(Counter::RequestsTotal);
    ctx.stats_inc(Counter::PacketsIn);
    ctx.stats_add(Counter::BytesIn, request_size as u64);
    if let Some(source) = ctx.relay_source {
        ctx.stats_inc(source.counter());
    }

    if !services.inflight.try_begin(ctx.mac) {
        debug!(mac = %ctx.mac, "already working on a request for this MAC, dropping");
        ctx.stats_inc(Counter::ErrorsConcurrent);
        ctx.drop_reason = Some(DropReason::ConcurrentRequest);
        return ctx.finish(Reply::Drop);
    }
    ctx.work_started = true;

    match request_type {
        MessageType::Discover => {
            ctx.stats_inc(Counter::RequestsDiscover);

            let grace = services.config.dhcp.grace_ttl_seconds;
            let tries = services.config.dhcp.random_tries;
            match backend::lease_find(&subnet, ctx.mac, ctx.started, grace, tries) {
                Some((ip, source)) => {
                    ctx.ip = Some(ip);
                    ctx.lease_source = Some(source);
                    ctx.stats_inc(lease_source_counter(source));
                    ctx.add_dns(&segment, &subnet);
                    debug!(%ip, "offering address");
                    ctx.finish(Reply::Offer)
                }
                None => {
                    warn!(subnet = %subnet.prefix, mac = %ctx.mac, "no free leases");
                    ctx.stats_inc(Counter::LeaseNoFree);
                    ctx.drop_reason = Some(DropReason::NoFreeLeases);
                    ctx.finish(Reply::Drop)
                }
            }
        }

        MessageType::Request => {
            ctx.stats_inc(Counter::RequestsRequest);

            if let Some(server_id) = ctx.packet.server_identifier()
                && server_id != local_ip
            {
                warn!(%server_id, %local_ip, "REQUEST is for another server, dropping");
                ctx.stats_inc(Counter::ErrorsIncorrectServer);
                ctx.drop_reason = Some(DropReason::IncorrectServer);
                return ctx.finish(Reply::Drop);
            }

            let Some(ip) = ctx.obtain_requested_ip() else {
                info!(mac = %ctx.mac, "REQUEST carries no requested IP nor client IP, dropping");
                ctx.stats_inc(Counter::ErrorsNoRequestedIp);
                ctx.drop_reason = Some(DropReason::NoRequestedIp);
                return ctx.finish(Reply::Drop);
            };

            // Clients commonly REQUEST their old address from another
            // subnet; those get a NAK so they restart with DISCOVER.
            if !subnet.contains(ip) {
                debug!(%ip, subnet = %subnet.prefix, "requested IP outside subnet, NAK");
                ctx.nak_reason = Some(NakReason::IpSubnetMismatch);
                return ctx.finish(Reply::Nak);
            }

            match backend::lease_check_and_update(&subnet, ip, ctx.mac, ctx.started) {
                UpdateOutcome::Updated(lease) => {
                    ctx.lease = Some(lease);
                    if let Some(mirror) = &services.mirror {
                        mirror::spawn_upsert_lease(mirror, segment.id, subnet.net, lease);
                    }
                    ctx.add_dns(&segment, &subnet);
                    debug!(%ip, "ACKing lease");
                    ctx.finish(Reply::Ack)
                }
                UpdateOutcome::Miss(reason) => {
                    ctx.notfound_reason = Some(reason);
                    ctx.nak_reason = Some(NakReason::LeaseNotFound);
                    ctx.finish(Reply::Nak)
                }
            }
        }

        MessageType::Release => {
            ctx.stats_inc(Counter::RequestsRelease);

            if ctx.packet.ciaddr == Ipv4Addr::UNSPECIFIED {
                warn!(mac = %ctx.mac, "RELEASE without client IP, dropping");
                ctx.stats_inc(Counter::ErrorsNoRequestedIp);
                ctx.drop_reason = Some(DropReason::NoRequestedIp);
                return ctx.finish(Reply::Drop);
            }

            let ip = ctx.packet.ciaddr;
            ctx.ip = Some(ip);
            if let Some(removed) = backend::lease_check_and_delete(&subnet, ip, ctx.mac)
                && let Some(mirror) = &services.mirror
            {
                mirror::spawn_delete_lease(mirror, segment.id, removed.ip);
            }
            ctx.finish(Reply::Drop)
        }

        MessageType::Decline => {
            ctx.stats_inc(Counter::RequestsDecline);

            let Some(ip) = ctx.packet.requested_ip() else {
                warn!(mac = %ctx.mac, "DECLINE without requested IP, dropping");
                ctx.stats_inc(Counter::ErrorsNoRequestedIp);
                ctx.drop_reason = Some(DropReason::NoRequestedIp);
                return ctx.finish(Reply::Drop);
            };

            ctx.ip = Some(ip);
            if let Some(removed) = backend::lease_check_and_delete(&subnet, ip, ctx.mac)
                && let Some(mirror) = &services.mirror
            {
                mirror::spawn_delete_lease(mirror, segment.id, removed.ip);
            }
            ctx.finish(Reply::Drop)
        }

        MessageType::Inform => {
            ctx.stats_inc(Counter::RequestsInform);
            ctx.add_dns(&segment, &subnet);
            debug!(mac = %ctx.mac, "ACKing INFORM");
            ctx.finish(Reply::Ack)
        }

        MessageType::Offer | MessageType::Ack | MessageType::Nak => {
            warn!(request = %request_type, "unsupported DHCP message type, dropping");
            ctx.stats_inc(Counter::ErrorsUnsupportedRequest);
            ctx.drop_reason = Some(DropReason::UnsupportedRequest);
            ctx.finish(Reply::Drop)
        }
    }
}

impl RequestContext {
    fn new(
        services: &Arc<Services>,
        packet: DhcpPacket,
        request_type: MessageType,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        request_size: usize,
    ) -> Self {
        let mac = packet.mac();
        Self {
            services: Arc::clone(services),
            packet,
            request_type,
            response_type: None,
            mac,
            remote_ip,
            local_ip,
            relay_ip: None,
            relay_source: None,
            ip: None,
            segment: None,
            subnet: None,
            lease: None,
            reply_options: Vec::new(),
            drop_reason: None,
            nak_reason: None,
            notfound_reason: None,
            lease_source: None,
            started: Utc::now(),
            started_at: Instant::now(),
            request_size,
            response_size: 0,
            work_started: false,
        }
    }

    /// Bumps a counter on the resolved segment and subnet.
    fn stats_inc(&self, counter: Counter) {
        self.stats_add(counter, 1);
    }

    fn stats_add(&self, counter: Counter, by: u64) {
        if let Some(segment) = &self.segment {
            segment.stats.add(counter, by);
        }
        if let Some(subnet) = &self.subnet {
            subnet.stats.add(counter, by);
        }
    }

    /// Determines the relay address: Option-82 link-selection first, then
    /// GIADDR, then the unicast-renewal pattern for REQUEST.
    fn resolve_relay_ip(&mut self) -> RelayResolution {
        if let Some(info) = self.packet.relay_agent_info() {
            match options::relay_sub_option(info, options::RELAY_SUB_LINK_SELECTION) {
                Some(value) if value.len() == 4 => {
                    let relay_ip = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                    debug!(%relay_ip, "relay IP from Option-82 link-selection");
                    self.relay_ip = Some(relay_ip);
                    self.relay_source = Some(RelaySource::Option82);
                    return RelayResolution::Resolved(relay_ip);
                }
                Some(value) => {
                    warn!(length = value.len(), "wrong Option-82 link-selection length, expected 4");
                    return RelayResolution::Malformed;
                }
                None => {
                    warn!(mac = %self.mac, "Option-82 without link-selection sub-option");
                }
            }
        }

        if self.packet.giaddr != Ipv4Addr::UNSPECIFIED {
            self.relay_ip = Some(self.packet.giaddr);
            self.relay_source = Some(RelaySource::GiAddr);
            return RelayResolution::Resolved(self.packet.giaddr);
        }

        // A renewing client may talk to us directly; its own address then
        // selects the subnet, but only when it claims an address it owns.
        if self.request_type != MessageType::Request {
            return RelayResolution::NotFound;
        }

        if let Some(ip) = self.obtain_requested_ip() {
            if ip == self.remote_ip {
                self.relay_ip = Some(ip);
                self.relay_source = Some(RelaySource::Unicast);
                return RelayResolution::Resolved(ip);
            }
            warn!(requested = %ip, remote = %self.remote_ip, "requested IP does not match remote address");
        }

        RelayResolution::NotFound
    }

    /// Requested address from option 50, falling back to CIADDR.
    fn obtain_requested_ip(&mut self) -> Option<Ipv4Addr> {
        let ip = self.packet.requested_ip().or_else(|| {
            (self.packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(self.packet.ciaddr)
        })?;
        self.ip = Some(ip);
        Some(ip)
    }

    /// Subnet for the relay address: static lookup first, then automode
    /// synthesis. A freshly synthesized subnet is mirrored outward.
    fn obtain_subnet(&mut self, segment: &Arc<Segment>, relay_ip: Ipv4Addr) -> SubnetResolution {
        if let Some(subnet) = segment.find_subnet(relay_ip) {
            return SubnetResolution::Resolved(subnet);
        }

        let Some(automode) = &segment.automode else {
            return SubnetResolution::Unknown;
        };

        let net_addr = Ipv4Addr::from(u32::from(relay_ip) & u32::from(automode.mask));
        match segment.insert_dynamic(net_addr) {
            Some((subnet, created)) => {
                if created {
                    debug!(
                        subnet = %subnet.prefix,
                        range_start = %subnet.range_start,
                        range_end = %subnet.range_end,
                        "automode subnet synthesized"
                    );
                    if let Some(mirror) = &self.services.mirror {
                        mirror::spawn_upsert_subnet(mirror, segment.id, net_addr);
                    }
                }
                SubnetResolution::Synthesized(subnet)
            }
            None => SubnetResolution::Unknown,
        }
    }

    /// Queues the DNS reply option, shuffled when the segment asks for it.
    fn add_dns(&mut self, segment: &Segment, subnet: &Subnet) {
        let mut dns = subnet.dns.clone();
        if segment.dns_random {
            dns.shuffle(&mut rand::thread_rng());
        }
        if !dns.is_empty() {
            self.reply_options.push(DhcpOption::DnsServer(dns));
        }
    }

    fn build_reply(&self, message_type: MessageType) -> Vec<u8> {
        let yiaddr = self.ip.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let mut reply_options = vec![DhcpOption::ServerIdentifier(self.local_ip)];
        if let Some(subnet) = &self.subnet {
            reply_options.push(DhcpOption::LeaseTime(subnet.lease_ttl_secs));
            reply_options.extend(self.reply_options.iter().cloned());
            reply_options.extend(subnet.options.iter().cloned());
        }

        DhcpPacket::create_reply(&self.packet, message_type, yiaddr, self.local_ip, reply_options)
            .encode()
    }

    fn build_nak(&self) -> Vec<u8> {
        // NAK: zero yiaddr, no TTL, no options beyond the server identity.
        DhcpPacket::create_reply(
            &self.packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.local_ip,
            vec![DhcpOption::ServerIdentifier(self.local_ip)],
        )
        .encode()
    }

    /// Terminal step for every path through the pipeline.
    fn finish(mut self, reply: Reply) -> Option<Vec<u8>> {
        let encoded = match reply {
            Reply::Offer => {
                self.response_type = Some(MessageType::Offer);
                self.stats_inc(Counter::RepliesOffer);
                Some(self.build_reply(MessageType::Offer))
            }
            Reply::Ack => {
                self.response_type = Some(MessageType::Ack);
                self.stats_inc(Counter::RepliesAck);
                Some(self.build_reply(MessageType::Ack))
            }
            Reply::Nak => {
                self.response_type = Some(MessageType::Nak);
                self.stats_inc(Counter::RepliesNak);
                Some(self.build_nak())
            }
            Reply::Drop => {
                self.stats_inc(Counter::RepliesDrop);
                None
            }
        };

        if let Some(bytes) = &encoded {
            self.response_size = bytes.len();
            self.stats_inc(Counter::PacketsOut);
            self.stats_add(Counter::BytesOut, bytes.len() as u64);
        }

        if self.work_started {
            self.services.inflight.finish(self.mac);
        }

        let duration = self.started_at.elapsed();
        info!(
            mac = %self.mac,
            request = %self.request_type,
            response = self.response_type.map(tracing::field::display),
            remote_ip = %self.remote_ip,
            relay_ip = self.relay_ip.map(tracing::field::display),
            relay_source = self.relay_source.map(tracing::field::display),
            segment = self.segment.as_ref().map(|segment| segment.name.as_str()),
            subnet = self.subnet.as_ref().map(|subnet| subnet.prefix.as_str()),
            ip = self.ip.map(tracing::field::display),
            lease_source = self.lease_source.map(tracing::field::display),
            drop_reason = self.drop_reason.map(tracing::field::display),
            nak_reason = self.nak_reason.map(tracing::field::display),
            notfound_reason = self.notfound_reason.map(tracing::field::display),
            duration_us = duration.as_micros() as u64,
            "request handled"
        );

        let metric = self.request_metric(duration);
        tokio::spawn(async move { metrics::emit_request(&metric) });

        encoded
    }

    fn request_metric(&self, duration: std::time::Duration) -> RequestMetric {
        let acked = self.response_type == Some(MessageType::Ack);
        RequestMetric {
            server_id: self.services.config.server_id.clone(),
            local_ip: self.local_ip,
            mac: self.mac,
            remote_ip: self.remote_ip,
            request: self.request_type,
            response: self.response_type,
            segment_id: self.segment.as_ref().map(|segment| segment.id),
            segment_name: self.segment.as_ref().map(|segment| segment.name.clone()),
            subnet: self.subnet.as_ref().map(|subnet| subnet.prefix.clone()),
            relay_ip: self.relay_ip,
            relay_source: self.relay_source,
            lease_ip: self.ip,
            lease_source: self.lease_source,
            drop_reason: self.drop_reason,
            nak_reason: self.nak_reason,
            notfound_reason: self.notfound_reason,
            request_size: self.request_size,
            response_size: self.response_size,
            duration,
            tx_duration_ms: self
                .lease
                .filter(|lease| lease.discover)
                .map(|lease| lease.tx_duration_ms(Utc::now())),
            ttl: acked.then(|| self.lease.map(|lease| lease.expires_in())).flatten(),
        }
    }
}
