//! ARP resolution end to end: broadcast request, learned reply, probe
//! retries and give-up.

mod common;

use std::net::Ipv4Addr;

use acorn_net::{MacAddr, MacLookup};
use common::*;

#[test]
fn resolve_gateway() {
	let mut ts = stack();

	ts.stack.request_mac(GATEWAY).unwrap();
	let sent = ts.sent();
	assert_eq!(sent.len(), 1);
	let request = parse_arp(&sent[0]).unwrap();
	assert_eq!(request.dst_mac, MacAddr::BROADCAST);
	assert_eq!(request.operation, 1);
	assert_eq!(request.sender_mac, OUR_MAC);
	assert_eq!(request.sender_ip, OUR_IP);
	assert_eq!(request.target_mac, MacAddr::NULL);
	assert_eq!(request.target_ip, GATEWAY);

	let gw_mac = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
	ts.deliver(arp_reply_frame(gw_mac, GATEWAY, OUR_MAC, OUR_IP));
	assert_eq!(ts.stack.lookup_mac(GATEWAY), MacLookup::Resolved(gw_mac));
}

#[test]
fn we_answer_requests_for_our_address() {
	let mut ts = stack();
	let asker_mac = MacAddr([0x10; 6]);
	let asker_ip = Ipv4Addr::new(192, 168, 1, 77);
	let payload = arp_payload(1, asker_mac, asker_ip, MacAddr::NULL, OUR_IP);
	ts.deliver(eth_frame(MacAddr::BROADCAST, asker_mac, 0x0806, &payload));

	let sent = ts.sent();
	let reply = parse_arp(&sent[0]).unwrap();
	assert_eq!(reply.operation, 2);
	assert_eq!(reply.dst_mac, asker_mac);
	assert_eq!(reply.sender_mac, OUR_MAC);
	assert_eq!(reply.sender_ip, OUR_IP);
	assert_eq!(reply.target_mac, asker_mac);
	assert_eq!(reply.target_ip, asker_ip);
}

#[test]
fn requests_for_other_addresses_are_ignored() {
	let mut ts = stack();
	let payload = arp_payload(
		1,
		MacAddr([0x10; 6]),
		Ipv4Addr::new(192, 168, 1, 77),
		MacAddr::NULL,
		Ipv4Addr::new(192, 168, 1, 99),
	);
	ts.deliver(eth_frame(MacAddr::BROADCAST, MacAddr([0x10; 6]), 0x0806, &payload));
	assert!(ts.sent().is_empty());
}

#[test]
fn probe_retries_every_quarter_second_then_gives_up() {
	let mut ts = stack();
	ts.stack.request_mac(PEER_IP).unwrap();
	assert_eq!(ts.sent().len(), 1);

	// Four retries at 250 ms spacing.
	for _ in 0..4 {
		ts.tick(300);
		let sent = ts.sent();
		assert_eq!(sent.len(), 1);
		assert_eq!(parse_arp(&sent[0]).unwrap().target_ip, PEER_IP);
	}

	// Budget spent: the entry is cleared and the probing stops.
	ts.tick(300);
	assert!(ts.sent().is_empty());
	assert_eq!(ts.stack.lookup_mac(PEER_IP), MacLookup::Unknown);

	// Quiet table: the sweep timer is gone too.
	ts.tick(300);
	assert!(ts.sent().is_empty());
}
