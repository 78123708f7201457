//! Fuzz properties for the wire codec, focused on what the relay path
//! feeds it: Option-82 payloads and their sub-option TLVs, the served
//! option set, the message-type gate and reply correlation fields.

use std::net::Ipv4Addr;

use proptest::prelude::*;

use segdhcpd::net::Mac;
use segdhcpd::options::{self, DhcpOption, MessageType, RELAY_SUB_LINK_SELECTION};
use segdhcpd::packet::{BOOTREPLY, BOOTREQUEST, DhcpPacket, HLEN_ETHERNET, HTYPE_ETHERNET};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Assembles a BOOTREQUEST datagram field by field. `option_bytes` is
/// appended verbatim after the cookie, so callers control whether the
/// stream is well formed or garbage.
fn raw_request(
    hops: u8,
    xid: u32,
    flags: u16,
    giaddr: [u8; 4],
    mac: [u8; 6],
    cookie: [u8; 4],
    option_bytes: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(300);
    bytes.extend_from_slice(&[BOOTREQUEST, HTYPE_ETHERNET, HLEN_ETHERNET, hops]);
    bytes.extend_from_slice(&xid.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&flags.to_be_bytes());
    bytes.extend_from_slice(&[0u8; 4]); // ciaddr
    bytes.extend_from_slice(&[0u8; 4]); // yiaddr
    bytes.extend_from_slice(&[0u8; 4]); // siaddr
    bytes.extend_from_slice(&giaddr);
    bytes.extend_from_slice(&mac);
    bytes.extend_from_slice(&[0u8; 10]); // chaddr padding
    bytes.extend_from_slice(&[0u8; 64]); // sname
    bytes.extend_from_slice(&[0u8; 128]); // file
    bytes.extend_from_slice(&cookie);
    bytes.extend_from_slice(option_bytes);
    bytes
}

fn discover_bytes(giaddr: [u8; 4], mac: [u8; 6], option_bytes: &[u8]) -> Vec<u8> {
    let mut stream = vec![53u8, 1, MessageType::Discover as u8];
    stream.extend_from_slice(option_bytes);
    stream.push(255);
    raw_request(1, 0x2f2f_0001, 0, giaddr, mac, MAGIC_COOKIE, &stream)
}

/// Relay-agent sub-options other than link-selection, as a relay would
/// stack them (circuit-id, remote-id, vendor extras).
fn foreign_sub_options() -> impl Strategy<Value = Vec<(u8, Vec<u8>)>> {
    prop::collection::vec(
        (
            any::<u8>().prop_filter("anything but link-selection", |code| {
                *code != RELAY_SUB_LINK_SELECTION
            }),
            prop::collection::vec(any::<u8>(), 0..12),
        ),
        0..4,
    )
}

fn encode_sub_options(pairs: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (code, value) in pairs {
        bytes.push(*code);
        bytes.push(value.len() as u8);
        bytes.extend_from_slice(value);
    }
    bytes
}

/// The options this server actually puts into OFFER/ACK replies.
fn served_option() -> impl Strategy<Value = DhcpOption> {
    let ip = any::<[u8; 4]>().prop_map(Ipv4Addr::from);
    let ip_list = |max: usize| prop::collection::vec(any::<[u8; 4]>().prop_map(Ipv4Addr::from), 1..max);

    prop_oneof![
        ip.clone().prop_map(DhcpOption::SubnetMask),
        ip_list(3).prop_map(DhcpOption::Router),
        ip_list(6).prop_map(DhcpOption::DnsServer),
        ip.clone().prop_map(DhcpOption::RequestedIpAddress),
        any::<u32>().prop_map(DhcpOption::LeaseTime),
        ip.prop_map(DhcpOption::ServerIdentifier),
    ]
}

proptest! {
    #[test]
    fn parser_and_accessors_survive_arbitrary_datagrams(
        data in prop::collection::vec(any::<u8>(), 0..600)
    ) {
        if let Ok(packet) = DhcpPacket::parse(&data) {
            // Everything the pipeline reads must be total.
            let _ = packet.mac();
            let _ = packet.message_type();
            let _ = packet.requested_ip();
            let _ = packet.server_identifier();
            let _ = packet
                .relay_agent_info()
                .and_then(|info| options::relay_sub_option(info, RELAY_SUB_LINK_SELECTION));
        }
    }

    #[test]
    fn datagrams_below_the_fixed_header_are_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn garbage_option_streams_never_panic(
        giaddr in any::<[u8; 4]>(),
        mac in any::<[u8; 6]>(),
        tail in prop::collection::vec(any::<u8>(), 0..300)
    ) {
        let bytes = raw_request(1, 1, 0, giaddr, mac, MAGIC_COOKIE, &tail);
        let _ = DhcpPacket::parse(&bytes);
    }

    #[test]
    fn the_magic_cookie_gates_parsing(cookie in any::<[u8; 4]>()) {
        let bytes = raw_request(1, 1, 0, [10, 0, 0, 1], [0xaa; 6], cookie, &[53, 1, 1, 255]);
        prop_assert_eq!(DhcpPacket::parse(&bytes).is_ok(), cookie == MAGIC_COOKIE);
    }

    #[test]
    fn the_relay_hop_limit_is_enforced(hops in any::<u8>()) {
        let bytes = raw_request(hops, 1, 0, [10, 0, 0, 1], [0xaa; 6], MAGIC_COOKIE, &[53, 1, 1, 255]);
        prop_assert_eq!(DhcpPacket::parse(&bytes).is_ok(), hops <= 16);
    }

    #[test]
    fn sub_option_scan_stays_in_bounds(
        payload in prop::collection::vec(any::<u8>(), 0..128),
        wanted in any::<u8>()
    ) {
        // Truncated or lying TLV lengths must never read past the payload.
        if let Some(value) = options::relay_sub_option(&payload, wanted) {
            prop_assert!(value.len() <= payload.len());
        }
    }

    #[test]
    fn link_selection_is_found_among_foreign_sub_options(
        prefix in foreign_sub_options(),
        suffix in foreign_sub_options(),
        link in any::<[u8; 4]>()
    ) {
        let mut payload = encode_sub_options(&prefix);
        payload.push(RELAY_SUB_LINK_SELECTION);
        payload.push(4);
        payload.extend_from_slice(&link);
        payload.extend_from_slice(&encode_sub_options(&suffix));

        let found = options::relay_sub_option(&payload, RELAY_SUB_LINK_SELECTION);
        prop_assert_eq!(found, Some(&link[..]));
    }

    #[test]
    fn option82_payloads_round_trip_through_the_packet(
        giaddr in any::<[u8; 4]>(),
        mac in any::<[u8; 6]>(),
        payload in prop::collection::vec(any::<u8>(), 0..200)
    ) {
        let option_bytes = DhcpOption::RelayAgentInfo(payload.clone()).encode();
        let bytes = discover_bytes(giaddr, mac, &option_bytes);

        let packet = DhcpPacket::parse(&bytes).unwrap();
        prop_assert_eq!(packet.relay_agent_info(), Some(&payload[..]));
        prop_assert_eq!(packet.giaddr, Ipv4Addr::from(giaddr));

        let reparsed = DhcpPacket::parse(&packet.encode()).unwrap();
        prop_assert_eq!(reparsed.relay_agent_info(), Some(&payload[..]));
    }

    #[test]
    fn fixed_length_options_enforce_their_length(
        code in prop::sample::select(vec![1u8, 50, 51, 54]),
        data in prop::collection::vec(any::<u8>(), 0..12)
    ) {
        prop_assert_eq!(DhcpOption::parse(code, &data).is_ok(), data.len() == 4);
    }

    #[test]
    fn served_reply_options_survive_their_own_encoding(option in served_option()) {
        let encoded = option.encode();
        let decoded = DhcpOption::parse(encoded[0], &encoded[2..]).unwrap();
        prop_assert_eq!(decoded, option);
    }

    #[test]
    fn the_message_type_gate_accepts_exactly_the_dhcp_range(value in any::<u8>()) {
        match DhcpOption::parse(53, &[value]) {
            Ok(DhcpOption::MessageType(message_type)) => {
                prop_assert!((1..=8).contains(&value));
                prop_assert_eq!(message_type as u8, value);
            }
            Ok(other) => prop_assert!(false, "unexpected option {:?}", other),
            Err(_) => prop_assert!(!(1..=8).contains(&value)),
        }
    }

    #[test]
    fn replies_preserve_the_relay_correlation_fields(
        xid in any::<u32>(),
        flags in any::<u16>(),
        giaddr in any::<[u8; 4]>(),
        mac in any::<[u8; 6]>(),
        yiaddr in any::<[u8; 4]>()
    ) {
        let bytes = raw_request(2, xid, flags, giaddr, mac, MAGIC_COOKIE, &[53, 1, 1, 255]);
        let request = DhcpPacket::parse(&bytes).unwrap();

        let reply = DhcpPacket::create_reply(
            &request,
            MessageType::Offer,
            Ipv4Addr::from(yiaddr),
            Ipv4Addr::new(192, 0, 2, 1),
            vec![],
        );

        // The relay routes replies by these fields; they must carry over.
        prop_assert_eq!(reply.op, BOOTREPLY);
        prop_assert_eq!(reply.xid, xid);
        prop_assert_eq!(reply.flags, flags);
        prop_assert_eq!(reply.giaddr, Ipv4Addr::from(giaddr));
        prop_assert_eq!(reply.mac(), Mac::from_bytes(&mac));

        let encoded = reply.encode();
        prop_assert!(encoded.len() >= 300);

        let reparsed = DhcpPacket::parse(&encoded).unwrap();
        prop_assert_eq!(reparsed.message_type(), Some(MessageType::Offer));
        prop_assert_eq!(reparsed.yiaddr, Ipv4Addr::from(yiaddr));
    }
}
