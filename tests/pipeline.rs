use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use segdhcpd::catalog::{Catalog, Lease};
use segdhcpd::config::{
    AutomodeConfig, Config, DhcpConfig, LogConfig, MirrorConfig, SegmentConfig, SubnetConfig,
};
use segdhcpd::context::{self, Services};
use segdhcpd::net::Mac;
use segdhcpd::options::{DhcpOption, MessageType};
use segdhcpd::packet::{BOOTREQUEST, DhcpPacket, HLEN_ETHERNET, HTYPE_ETHERNET};
use segdhcpd::shard::InflightMacs;
use segdhcpd::stats::{Counter, Stats};

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 50);

fn subnet(net: [u8; 4], mask: [u8; 4], start: [u8; 4], end: [u8; 4]) -> SubnetConfig {
    SubnetConfig {
        net: Ipv4Addr::from(net),
        mask: Ipv4Addr::from(mask),
        range_start: Ipv4Addr::from(start),
        range_end: Ipv4Addr::from(end),
        router: Some(Ipv4Addr::from([net[0], net[1], net[2], 1])),
        lease_ttl_seconds: 3600,
        dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
    }
}

fn segment(id: u32, name: &str, rule: &str, subnets: Vec<SubnetConfig>) -> SegmentConfig {
    SegmentConfig {
        id,
        name: name.to_string(),
        detect_rule: rule.to_string(),
        dns_random: false,
        automode: None,
        subnets,
    }
}

fn services(segments: Vec<SegmentConfig>) -> Arc<Services> {
    let config = Config {
        server_id: "test-1".to_string(),
        dhcp: DhcpConfig {
            listen: vec![LOCAL_IP],
            grace_ttl_seconds: 60,
            random_tries: 0,
            buffer_size: 4 * 1024 * 1024,
            cleanup_interval_seconds: 5,
            cleanup_age_seconds: 3600,
            stats_interval_seconds: 1,
        },
        mirror: MirrorConfig {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_leases: "dhcp:leases".to_string(),
            key_subnets: "dhcp:subnets".to_string(),
            scan_timeout_seconds: 30,
        },
        segments,
        log: LogConfig::default(),
    };
    config.validate().unwrap();

    let config = Arc::new(config);
    let catalog = Arc::new(Catalog::from_config(&config).unwrap());
    Arc::new(Services {
        config,
        catalog,
        stats: Arc::new(Stats::new()),
        inflight: Arc::new(InflightMacs::new()),
        reload_barrier: Arc::new(tokio::sync::RwLock::new(())),
        mirror: None,
    })
}

fn request(message_type: MessageType, mac: [u8; 6], options: Vec<DhcpOption>) -> DhcpPacket {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&mac);

    let mut all_options = vec![DhcpOption::MessageType(message_type)];
    all_options.extend(options);

    DhcpPacket {
        op: BOOTREQUEST,
        htype: HTYPE_ETHERNET,
        hlen: HLEN_ETHERNET,
        hops: 1,
        xid: 0x1234_5678,
        secs: 0,
        flags: 0,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        sname: [0u8; 64],
        file: [0u8; 128],
        options: all_options,
    }
}

async fn handle(services: &Arc<Services>, packet: DhcpPacket) -> Option<DhcpPacket> {
    let message_type = packet.message_type().unwrap();
    context::handle_request(services, packet, message_type, LOCAL_IP, REMOTE_IP, 300)
        .await
        .map(|bytes| DhcpPacket::parse(&bytes).unwrap())
}

fn lease_time(reply: &DhcpPacket) -> Option<u32> {
    reply.options.iter().find_map(|option| match option {
        DhcpOption::LeaseTime(seconds) => Some(*seconds),
        _ => None,
    })
}

#[tokio::test]
async fn option82_link_selection_beats_giaddr_and_first_segment_wins() {
    let services = services(vec![
        segment(
            1,
            "a",
            "InNetwork(RelayIP, 10.1.0.0, 255.255.0.0)",
            vec![subnet([10, 1, 0, 0], [255, 255, 255, 0], [10, 1, 0, 10], [10, 1, 0, 250])],
        ),
        segment(
            2,
            "b",
            "InNetwork(RelayIP, 10.2.0.0, 255.255.0.0)",
            vec![subnet([10, 2, 0, 0], [255, 255, 255, 0], [10, 2, 0, 10], [10, 2, 0, 250])],
        ),
    ]);

    // Option-82 link-selection says 10.1.0.1, GIADDR says 10.2.0.1.
    let mut packet = request(
        MessageType::Discover,
        [0xaa, 0, 0, 0, 0, 1],
        vec![DhcpOption::RelayAgentInfo(vec![5, 4, 10, 1, 0, 1])],
    );
    packet.giaddr = Ipv4Addr::new(10, 2, 0, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 1, 0, 10));

    let segment_a = services.catalog.segment_by_id(1).unwrap();
    let segment_b = services.catalog.segment_by_id(2).unwrap();
    assert_eq!(segment_a.stats.get(Counter::RelayOption82), 1);
    assert_eq!(segment_a.stats.get(Counter::RepliesOffer), 1);
    assert_eq!(segment_b.stats.get(Counter::RequestsTotal), 0);
}

#[tokio::test]
async fn malformed_link_selection_length_drops() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 1, 0, 0], [255, 255, 255, 0], [10, 1, 0, 10], [10, 1, 0, 250])],
    )]);

    let packet = request(
        MessageType::Discover,
        [0xaa, 0, 0, 0, 0, 1],
        vec![DhcpOption::RelayAgentInfo(vec![5, 2, 10, 1])],
    );

    assert!(handle(&services, packet).await.is_none());
    assert_eq!(services.stats.get(Counter::ErrorsMalformedPacket), 1);
}

#[tokio::test]
async fn concurrent_request_for_same_mac_is_suppressed() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    assert!(services.inflight.try_begin(Mac::from_bytes(&mac)));

    let mut packet = request(MessageType::Discover, mac, vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    assert!(handle(&services, packet).await.is_none());

    let segment = services.catalog.segment_by_id(1).unwrap();
    assert_eq!(segment.stats.get(Counter::ErrorsConcurrent), 1);
    assert_eq!(segment.stats.get(Counter::RepliesDrop), 1);

    // Once the first request finishes, the MAC processes normally again.
    services.inflight.finish(Mac::from_bytes(&mac));
    let mut packet = request(MessageType::Discover, mac, vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Offer));
}

#[tokio::test]
async fn expired_lease_is_taken_over_by_range_scan() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 11])],
    )]);

    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(10, 0, 0, 0)).unwrap();
    let now = Utc::now();
    subnet.store().write().insert(Lease {
        ip: Ipv4Addr::new(10, 0, 0, 10),
        mac: Mac::from_bytes(&[0xa, 0, 0, 0, 0, 1]),
        expires: now - TimeDelta::seconds(1),
        discover: false,
        discover_at: now,
    });

    let mac_b = [0xb, 0, 0, 0, 0, 2];
    let mut packet = request(MessageType::Discover, mac_b, vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 10));

    let store = subnet.store().read();
    assert_eq!(store.by_ip[&Ipv4Addr::new(10, 0, 0, 10)].mac, Mac::from_bytes(&mac_b));
    drop(store);
    assert_eq!(subnet.stats.get(Counter::LeaseRange), 1);
}

#[tokio::test]
async fn request_for_foreign_subnet_gets_nak() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let mut packet = request(
        MessageType::Request,
        [0xaa, 0, 0, 0, 0, 1],
        vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 1, 0, 5))],
    );
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Nak));
    assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
    assert!(lease_time(&reply).is_none());

    // Lease indices stay untouched.
    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(10, 0, 0, 0)).unwrap();
    assert!(subnet.store().read().by_ip.is_empty());
    assert_eq!(subnet.stats.get(Counter::RepliesNak), 1);
}

#[tokio::test]
async fn release_with_wrong_mac_keeps_the_lease_and_stays_silent() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(10, 0, 0, 0)).unwrap();
    let owner = Mac::from_bytes(&[0xa, 0, 0, 0, 0, 1]);
    subnet
        .store()
        .write()
        .insert(Lease::offered(Ipv4Addr::new(10, 0, 0, 20), owner, Utc::now(), 600));

    let mut packet = request(MessageType::Release, [0xb, 0, 0, 0, 0, 2], vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    packet.ciaddr = Ipv4Addr::new(10, 0, 0, 20);

    assert!(handle(&services, packet).await.is_none());

    let store = subnet.store().read();
    assert_eq!(store.by_ip[&Ipv4Addr::new(10, 0, 0, 20)].mac, owner);
}

#[tokio::test]
async fn discover_then_request_confirms_the_lease() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);
    let mac = [0xaa, 0xbb, 0xcc, 0, 0, 1];

    let mut discover = request(MessageType::Discover, mac, vec![]);
    discover.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    let offer = handle(&services, discover).await.unwrap();
    assert_eq!(offer.message_type(), Some(MessageType::Offer));
    let offered_ip = offer.yiaddr;

    let mut confirm = request(
        MessageType::Request,
        mac,
        vec![DhcpOption::RequestedIpAddress(offered_ip)],
    );
    confirm.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    let ack = handle(&services, confirm).await.unwrap();
    assert_eq!(ack.message_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr, offered_ip);
    assert_eq!(lease_time(&ack), Some(3600));

    // Confirmed: discover phase over, TTL extended past the grace window.
    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(10, 0, 0, 0)).unwrap();
    let store = subnet.store().read();
    let lease = store.by_ip[&offered_ip];
    assert!(!lease.discover);
    assert!(lease.expires_in() > 3000);
}

#[tokio::test]
async fn request_for_unknown_lease_gets_nak() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let mut packet = request(
        MessageType::Request,
        [0xaa, 0, 0, 0, 0, 1],
        vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 42))],
    );
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Nak));
}

#[tokio::test]
async fn request_for_another_server_is_dropped() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let mut packet = request(
        MessageType::Request,
        [0xaa, 0, 0, 0, 0, 1],
        vec![
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 42)),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 0, 2, 99)),
        ],
    );
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    assert!(handle(&services, packet).await.is_none());

    let segment = services.catalog.segment_by_id(1).unwrap();
    assert_eq!(segment.stats.get(Counter::ErrorsIncorrectServer), 1);
}

#[tokio::test]
async fn inform_is_acked_with_dns() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let mut packet = request(MessageType::Inform, [0xaa, 0, 0, 0, 0, 1], vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Ack));
    assert!(reply.options.iter().any(|option| matches!(
        option,
        DhcpOption::DnsServer(servers) if servers == &vec![Ipv4Addr::new(8, 8, 8, 8)]
    )));
}

#[tokio::test]
async fn unicast_renewal_resolves_relay_from_requested_ip() {
    // The remote address itself must fall into the subnet for the
    // unicast-renewal pattern to resolve.
    let services = services(vec![segment(
        1,
        "a",
        "InNetwork(RelayIP, 192.0.2.0, 255.255.255.0)",
        vec![subnet([192, 0, 2, 0], [255, 255, 255, 0], [192, 0, 2, 10], [192, 0, 2, 250])],
    )]);

    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(192, 0, 2, 0)).unwrap();
    let mac = [0xaa, 0, 0, 0, 0, 7];
    subnet.store().write().insert(Lease::offered(
        REMOTE_IP,
        Mac::from_bytes(&mac),
        Utc::now(),
        600,
    ));

    // No Option-82, no GIADDR; ciaddr carries the renewed address.
    let mut packet = request(MessageType::Request, mac, vec![]);
    packet.ciaddr = REMOTE_IP;

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Ack));
    assert_eq!(reply.yiaddr, REMOTE_IP);
    assert_eq!(segment.stats.get(Counter::RelayUnicast), 1);
}

#[tokio::test]
async fn discover_without_any_relay_information_is_dropped() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    let packet = request(MessageType::Discover, [0xaa, 0, 0, 0, 0, 1], vec![]);
    assert!(handle(&services, packet).await.is_none());
    assert_eq!(services.stats.get(Counter::ErrorsRelayIpNotFound), 1);
}

#[tokio::test]
async fn automode_synthesizes_subnet_on_demand() {
    let mut auto_segment = segment(1, "auto", "InNetwork(RelayIP, 10.0.0.0, 255.0.0.0)", vec![]);
    auto_segment.automode = Some(AutomodeConfig {
        enable: true,
        mask: Ipv4Addr::new(255, 255, 255, 0),
        range_start: Ipv4Addr::new(0, 0, 0, 10),
        range_end: Ipv4Addr::new(0, 0, 0, 250),
        router: Ipv4Addr::new(0, 0, 0, 1),
        lease_ttl_seconds: 1800,
        dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
    });
    let services = services(vec![auto_segment]);

    let mut packet = request(MessageType::Discover, [0xaa, 0, 0, 0, 0, 1], vec![]);
    packet.giaddr = Ipv4Addr::new(10, 77, 3, 1);

    let reply = handle(&services, packet).await.unwrap();
    assert_eq!(reply.message_type(), Some(MessageType::Offer));
    assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 77, 3, 10));
    assert_eq!(lease_time(&reply), Some(1800));

    let segment = services.catalog.segment_by_id(1).unwrap();
    let subnet = segment.subnet_by_net(Ipv4Addr::new(10, 77, 3, 0)).unwrap();
    assert!(subnet.dynamic);
    assert_eq!(subnet.router, Some(Ipv4Addr::new(10, 77, 3, 1)));
}

#[tokio::test]
async fn server_to_server_message_types_are_unsupported() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 250])],
    )]);

    // An OFFER arriving at a server passes the ingress type-range gate but
    // has no handler.
    let mut packet = request(MessageType::Offer, [0xaa, 0, 0, 0, 0, 1], vec![]);
    packet.giaddr = Ipv4Addr::new(10, 0, 0, 1);

    assert!(handle(&services, packet).await.is_none());

    let segment = services.catalog.segment_by_id(1).unwrap();
    assert_eq!(segment.stats.get(Counter::ErrorsUnsupportedRequest), 1);
    assert_eq!(segment.stats.get(Counter::ErrorsOther), 0);
    assert_eq!(segment.stats.get(Counter::RepliesDrop), 1);
}

#[tokio::test]
async fn pool_exhaustion_drops_with_counter() {
    let services = services(vec![segment(
        1,
        "a",
        "RelayIP > 0",
        vec![subnet([10, 0, 0, 0], [255, 255, 255, 0], [10, 0, 0, 10], [10, 0, 0, 10])],
    )]);

    let mut first = request(MessageType::Discover, [0xaa, 0, 0, 0, 0, 1], vec![]);
    first.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    assert!(handle(&services, first).await.is_some());

    let mut second = request(MessageType::Discover, [0xaa, 0, 0, 0, 0, 2], vec![]);
    second.giaddr = Ipv4Addr::new(10, 0, 0, 1);
    assert!(handle(&services, second).await.is_none());

    let segment = services.catalog.segment_by_id(1).unwrap();
    assert_eq!(segment.stats.get(Counter::LeaseNoFree), 1);
}
