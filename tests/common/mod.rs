//! Shared test fixture: a RAM-backed mock of an ENC28J60-class link
//! device, a hand-cranked clock, wire-format builders for the frames a
//! peer would send, and parsers for the frames the stack emits.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;

use acorn_net::{
	Config, Error, LinkDriver, MacAddr, NetCx, PacketBuffer, Region, RxFrame, Socket,
	SocketCore, SocketEvents, Stack, TimeSource,
};

pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const OUR_MAC: MacAddr = MacAddr([0x02, 0x12, 0x34, 0x56, 0x78, 0x9A]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
pub const PEER_MAC: MacAddr = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
pub const DNS_PRIMARY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 53);
pub const DNS_BACKUP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 54);
pub const DNS_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x00, 0x00, 0x53]);

/// Largest TCP payload the stack advertises: IP receive payload
/// (1500 - 14 - 20) minus TCP header and the option margin.
pub const MSS: u16 = 1500 - 14 - 20 - 20 - 4;

const MEM_SIZE: usize = 0x2000;
const RX_START: u16 = 0x0000;
const RX_END: u16 = 0x0BFF;
const TX_START: u16 = 0x0C00;
const TX_END: u16 = 0x11FF;
const STASH_START: u16 = 0x1200;
const STASH_END: u16 = 0x1FFF;
const MAX_FRAME: u16 = 1500;

/// 8 KiB of "controller SRAM" plus frame queues on either side.
pub struct MockDriver {
	mem: [u8; MEM_SIZE],
	rx_queue: VecDeque<Vec<u8>>,
	pub tx_frames: Vec<Vec<u8>>,
	pub copies: Vec<(u16, u16, u16)>,
	pub link_up: bool,
	pub powered: bool,
}

impl MockDriver {
	pub fn new() -> Self {
		Self {
			mem: [0; MEM_SIZE],
			rx_queue: VecDeque::new(),
			tx_frames: Vec::new(),
			copies: Vec::new(),
			link_up: true,
			powered: true,
		}
	}

	pub fn push_rx(&mut self, frame: Vec<u8>) {
		self.rx_queue.push_back(frame);
	}
}

impl LinkDriver for MockDriver {
	fn mac_address(&self) -> MacAddr {
		OUR_MAC
	}

	fn send_region(&self) -> Region {
		Region {
			start: TX_START,
			end: TX_END,
			len: MAX_FRAME,
			wrap: false,
		}
	}

	fn receive_region(&self) -> Region {
		Region {
			start: RX_START,
			end: RX_END,
			len: MAX_FRAME,
			wrap: true,
		}
	}

	fn stash_region(&self) -> Region {
		Region {
			start: STASH_START,
			end: STASH_END,
			len: STASH_END - STASH_START + 1,
			wrap: false,
		}
	}

	fn read(&mut self, addr: u16, out: &mut [u8]) -> Result<(), Error> {
		let start = addr as usize;
		let end = start + out.len();
		if end > MEM_SIZE {
			return Err(Error::OutOfBounds);
		}
		out.copy_from_slice(&self.mem[start..end]);
		Ok(())
	}

	fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
		let start = addr as usize;
		let end = start + data.len();
		if end > MEM_SIZE {
			return Err(Error::OutOfBounds);
		}
		self.mem[start..end].copy_from_slice(data);
		Ok(())
	}

	fn copy(&mut self, src: u16, dst: u16, len: u16) -> Result<(), Error> {
		let (src, dst, len) = (src as usize, dst as usize, len as usize);
		if src + len > MEM_SIZE || dst + len > MEM_SIZE {
			return Err(Error::OutOfBounds);
		}
		self.mem.copy_within(src..src + len, dst);
		self.copies.push((src as u16, dst as u16, len as u16));
		Ok(())
	}

	fn send_frame(&mut self, len: u16) {
		let start = TX_START as usize;
		self.tx_frames
			.push(self.mem[start..start + len as usize].to_vec());
	}

	fn receive_frame(&mut self) -> Option<RxFrame> {
		let frame = self.rx_queue.pop_front()?;
		let len = frame.len() as u16;
		self.mem[..frame.len()].copy_from_slice(&frame);
		Some(RxFrame { offset: 0, len })
	}

	fn is_link_up(&mut self) -> bool {
		self.link_up
	}

	fn power_down(&mut self) {
		self.powered = false;
	}

	fn power_up(&mut self) {
		self.powered = true;
	}
}

pub struct TestClock(pub Rc<Cell<u32>>);

impl TimeSource for TestClock {
	fn now_ms(&mut self) -> u32 {
		self.0.get()
	}
}

/// A [`Stack`] over the mock driver plus the levers the tests pull.
pub struct TestStack {
	pub stack: Stack<MockDriver>,
	pub clock: Rc<Cell<u32>>,
}

pub fn config() -> Config {
	let mut config = Config::new(OUR_IP, GATEWAY, NETMASK);
	config.seed = 42;
	config.dns_primary = DNS_PRIMARY;
	config.dns_backup = Some(DNS_BACKUP);
	config
}

pub fn stack() -> TestStack {
	stack_with(config())
}

pub fn stack_with(config: Config) -> TestStack {
	let clock = Rc::new(Cell::new(0u32));
	let stack = Stack::new(
		MockDriver::new(),
		Box::new(TestClock(clock.clone())),
		config,
	)
	.unwrap();
	TestStack { stack, clock }
}

impl TestStack {
	/// Move the clock without polling.
	pub fn advance(&mut self, ms: u32) {
		self.clock.set(self.clock.get().wrapping_add(ms));
	}

	/// Move the clock, then run one loop iteration (timers included).
	pub fn tick(&mut self, ms: u32) {
		self.advance(ms);
		self.stack.process_frame();
	}

	/// Hand the stack one inbound frame and run one loop iteration.
	pub fn deliver(&mut self, frame: Vec<u8>) {
		self.stack.device().borrow_mut().push_rx(frame);
		self.stack.process_frame();
	}

	/// Drain everything the stack has transmitted so far.
	pub fn sent(&mut self) -> Vec<Vec<u8>> {
		std::mem::take(&mut self.stack.device().borrow_mut().tx_frames)
	}

	/// Resolve `ip` in the stack's ARP table by answering its probe.
	pub fn resolve_arp(&mut self, ip: Ipv4Addr, mac: MacAddr) {
		self.stack.request_mac(ip).unwrap();
		self.deliver(arp_reply_frame(mac, ip, OUR_MAC, OUR_IP));
		self.sent();
	}
}

// ---------------------------------------------------------------------
// Wire builders (what a peer would put on the wire)
// ---------------------------------------------------------------------

pub fn inet_checksum(data: &[u8], skip: Option<usize>, pseudo: u32) -> u16 {
	let mut sum = pseudo;
	let mut i = 0;
	while i < data.len() {
		if Some(i) == skip {
			i += 2;
			continue;
		}
		let word = if i + 1 < data.len() {
			u16::from_be_bytes([data[i], data[i + 1]]) as u32
		} else {
			(data[i] as u32) << 8
		};
		sum += word;
		i += 2;
	}
	while sum >> 16 != 0 {
		sum = (sum & 0xFFFF) + (sum >> 16);
	}
	!(sum as u16)
}

fn ip_words(addr: Ipv4Addr) -> u32 {
	let o = addr.octets();
	u16::from_be_bytes([o[0], o[1]]) as u32 + u16::from_be_bytes([o[2], o[3]]) as u32
}

pub fn eth_frame(dst: MacAddr, src: MacAddr, ether_type: u16, payload: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(14 + payload.len());
	frame.extend_from_slice(&dst.0);
	frame.extend_from_slice(&src.0);
	frame.extend_from_slice(&ether_type.to_be_bytes());
	frame.extend_from_slice(payload);
	frame
}

pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
	let total = 20 + payload.len() as u16;
	let mut packet = vec![0u8; total as usize];
	packet[0] = 0x45;
	packet[2..4].copy_from_slice(&total.to_be_bytes());
	packet[6] = 0x40; // DF
	packet[8] = 64;
	packet[9] = protocol;
	packet[12..16].copy_from_slice(&src.octets());
	packet[16..20].copy_from_slice(&dst.octets());
	let ck = inet_checksum(&packet[..20], Some(10), 0);
	packet[10..12].copy_from_slice(&ck.to_be_bytes());
	packet[20..].copy_from_slice(payload);
	packet
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_segment(
	src: Ipv4Addr,
	dst: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	seq: u32,
	ack: u32,
	flags: u8,
	window: u16,
	mss: Option<u16>,
	payload: &[u8],
) -> Vec<u8> {
	let header_len: usize = if mss.is_some() { 24 } else { 20 };
	let mut seg = vec![0u8; header_len + payload.len()];
	seg[0..2].copy_from_slice(&src_port.to_be_bytes());
	seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
	seg[4..8].copy_from_slice(&seq.to_be_bytes());
	seg[8..12].copy_from_slice(&ack.to_be_bytes());
	seg[12] = ((header_len / 4) as u8) << 4;
	seg[13] = flags;
	seg[14..16].copy_from_slice(&window.to_be_bytes());
	if let Some(mss) = mss {
		seg[20..22].copy_from_slice(&[0x02, 0x04]);
		seg[22..24].copy_from_slice(&mss.to_be_bytes());
	}
	seg[header_len..].copy_from_slice(payload);

	let pseudo = 6 + seg.len() as u32 + ip_words(src) + ip_words(dst);
	let ck = inet_checksum(&seg, Some(16), pseudo);
	seg[16..18].copy_from_slice(&ck.to_be_bytes());
	seg
}

/// A full Ethernet frame carrying a TCP segment from the peer.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
	src: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	seq: u32,
	ack: u32,
	flags: u8,
	mss: Option<u16>,
	payload: &[u8],
) -> Vec<u8> {
	let seg = tcp_segment(
		src, OUR_IP, src_port, dst_port, seq, ack, flags, 8192, mss, payload,
	);
	eth_frame(OUR_MAC, PEER_MAC, 0x0800, &ipv4_packet(src, OUR_IP, 6, &seg))
}

pub fn udp_datagram(
	src: Ipv4Addr,
	dst: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	payload: &[u8],
) -> Vec<u8> {
	let len = 8 + payload.len() as u16;
	let mut dgram = vec![0u8; len as usize];
	dgram[0..2].copy_from_slice(&src_port.to_be_bytes());
	dgram[2..4].copy_from_slice(&dst_port.to_be_bytes());
	dgram[4..6].copy_from_slice(&len.to_be_bytes());
	dgram[8..].copy_from_slice(payload);
	let pseudo = 17 + len as u32 + ip_words(src) + ip_words(dst);
	let ck = inet_checksum(&dgram, Some(6), pseudo);
	dgram[6..8].copy_from_slice(&ck.to_be_bytes());
	dgram
}

pub fn udp_frame(src: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
	let dgram = udp_datagram(src, OUR_IP, src_port, dst_port, payload);
	eth_frame(OUR_MAC, PEER_MAC, 0x0800, &ipv4_packet(src, OUR_IP, 17, &dgram))
}

pub fn arp_payload(
	operation: u16,
	sender_mac: MacAddr,
	sender_ip: Ipv4Addr,
	target_mac: MacAddr,
	target_ip: Ipv4Addr,
) -> Vec<u8> {
	let mut p = vec![0u8; 28];
	p[0..2].copy_from_slice(&1u16.to_be_bytes());
	p[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
	p[4] = 6;
	p[5] = 4;
	p[6..8].copy_from_slice(&operation.to_be_bytes());
	p[8..14].copy_from_slice(&sender_mac.0);
	p[14..18].copy_from_slice(&sender_ip.octets());
	p[18..24].copy_from_slice(&target_mac.0);
	p[24..28].copy_from_slice(&target_ip.octets());
	p
}

pub fn arp_reply_frame(
	sender_mac: MacAddr,
	sender_ip: Ipv4Addr,
	target_mac: MacAddr,
	target_ip: Ipv4Addr,
) -> Vec<u8> {
	let payload = arp_payload(2, sender_mac, sender_ip, target_mac, target_ip);
	eth_frame(target_mac, sender_mac, 0x0806, &payload)
}

/// A one-answer DNS response for transaction `id`, delivered from
/// `server`. `qname` is the label-encoded question name.
pub fn dns_response_frame(
	server: Ipv4Addr,
	id: u16,
	rcode: u8,
	qname: &[u8],
	addr: Ipv4Addr,
	ttl: u32,
) -> Vec<u8> {
	let mut msg = Vec::new();
	msg.extend_from_slice(&id.to_be_bytes());
	msg.extend_from_slice(&(0x8180u16 | rcode as u16).to_be_bytes());
	msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
	msg.extend_from_slice(&1u16.to_be_bytes()); // ancount
	msg.extend_from_slice(&[0, 0, 0, 0]);
	msg.extend_from_slice(qname);
	msg.extend_from_slice(&[0, 1, 0, 1]); // QTYPE, QCLASS
	msg.extend_from_slice(&[0xC0, 0x0C]); // compressed NAME
	msg.extend_from_slice(&[0, 1, 0, 1]);
	msg.extend_from_slice(&ttl.to_be_bytes());
	msg.extend_from_slice(&4u16.to_be_bytes());
	msg.extend_from_slice(&addr.octets());

	let dgram = udp_datagram(server, OUR_IP, 53, 53, &msg);
	eth_frame(
		OUR_MAC,
		DNS_MAC,
		0x0800,
		&ipv4_packet(server, OUR_IP, 17, &dgram),
	)
}

// ---------------------------------------------------------------------
// Parsers (what the stack put on the wire)
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct ArpOut {
	pub dst_mac: MacAddr,
	pub operation: u16,
	pub sender_mac: MacAddr,
	pub sender_ip: Ipv4Addr,
	pub target_mac: MacAddr,
	pub target_ip: Ipv4Addr,
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpOut> {
	if frame.len() < 42 || u16::from_be_bytes([frame[12], frame[13]]) != 0x0806 {
		return None;
	}
	let p = &frame[14..];
	Some(ArpOut {
		dst_mac: MacAddr(frame[0..6].try_into().unwrap()),
		operation: u16::from_be_bytes([p[6], p[7]]),
		sender_mac: MacAddr(p[8..14].try_into().unwrap()),
		sender_ip: Ipv4Addr::new(p[14], p[15], p[16], p[17]),
		target_mac: MacAddr(p[18..24].try_into().unwrap()),
		target_ip: Ipv4Addr::new(p[24], p[25], p[26], p[27]),
	})
}

#[derive(Debug)]
pub struct TcpOut {
	pub dst_mac: MacAddr,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	pub flags: u8,
	pub window: u16,
	pub mss: Option<u16>,
	pub payload: Vec<u8>,
}

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

pub fn parse_tcp(frame: &[u8]) -> Option<TcpOut> {
	if frame.len() < 54 || u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
		return None;
	}
	let ip = &frame[14..];
	if ip[9] != 6 {
		return None;
	}
	let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
	let seg = &ip[20..total];
	let header_len = ((seg[12] >> 4) as usize) * 4;
	let mss = if header_len >= 24 && seg[20] == 0x02 && seg[21] == 0x04 {
		Some(u16::from_be_bytes([seg[22], seg[23]]))
	} else {
		None
	};
	Some(TcpOut {
		dst_mac: MacAddr(frame[0..6].try_into().unwrap()),
		src_ip: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
		dst_ip: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
		src_port: u16::from_be_bytes([seg[0], seg[1]]),
		dst_port: u16::from_be_bytes([seg[2], seg[3]]),
		seq: u32::from_be_bytes(seg[4..8].try_into().unwrap()),
		ack: u32::from_be_bytes(seg[8..12].try_into().unwrap()),
		flags: seg[13],
		window: u16::from_be_bytes([seg[14], seg[15]]),
		mss,
		payload: seg[header_len..].to_vec(),
	})
}

/// The TCP frames among `frames`, parsed.
pub fn tcp_outputs(frames: &[Vec<u8>]) -> Vec<TcpOut> {
	frames.iter().filter_map(|f| parse_tcp(f)).collect()
}

#[derive(Debug)]
pub struct UdpOut {
	pub dst_mac: MacAddr,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub checksum: u16,
	pub payload: Vec<u8>,
}

pub fn parse_udp(frame: &[u8]) -> Option<UdpOut> {
	if frame.len() < 42 || u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
		return None;
	}
	let ip = &frame[14..];
	if ip[9] != 17 {
		return None;
	}
	let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
	let dgram = &ip[20..total];
	Some(UdpOut {
		dst_mac: MacAddr(frame[0..6].try_into().unwrap()),
		src_ip: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
		dst_ip: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
		src_port: u16::from_be_bytes([dgram[0], dgram[1]]),
		dst_port: u16::from_be_bytes([dgram[2], dgram[3]]),
		checksum: u16::from_be_bytes([dgram[6], dgram[7]]),
		payload: dgram[8..].to_vec(),
	})
}

pub fn udp_outputs(frames: &[Vec<u8>]) -> Vec<UdpOut> {
	frames.iter().filter_map(|f| parse_udp(f)).collect()
}

// ---------------------------------------------------------------------
// Event recording
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ev {
	Established,
	Data(Vec<u8>),
	ReadyToSend,
	RemoteClosed,
	LocalClosed,
	Closed,
	Reset(bool),
}

/// Records every upcall; data acceptance is switchable for
/// backpressure tests.
pub struct Recorder {
	pub log: Rc<RefCell<Vec<Ev>>>,
	pub accept: Rc<Cell<bool>>,
}

impl Recorder {
	pub fn new() -> (Box<Self>, Rc<RefCell<Vec<Ev>>>, Rc<Cell<bool>>) {
		let log = Rc::new(RefCell::new(Vec::new()));
		let accept = Rc::new(Cell::new(true));
		(
			Box::new(Self {
				log: log.clone(),
				accept: accept.clone(),
			}),
			log,
			accept,
		)
	}
}

impl SocketEvents<MockDriver> for Recorder {
	fn on_established(&mut self, _s: &mut SocketCore<MockDriver>, _cx: &mut NetCx<'_, MockDriver>) {
		self.log.borrow_mut().push(Ev::Established);
	}

	fn on_data_received(
		&mut self,
		_s: &mut SocketCore<MockDriver>,
		_cx: &mut NetCx<'_, MockDriver>,
		data: &PacketBuffer<MockDriver>,
	) -> bool {
		if !self.accept.get() {
			return false;
		}
		let mut bytes = vec![0u8; data.size() as usize];
		data.read(0, &mut bytes).unwrap();
		self.log.borrow_mut().push(Ev::Data(bytes));
		true
	}

	fn on_ready_to_send(
		&mut self,
		_s: &mut SocketCore<MockDriver>,
		_cx: &mut NetCx<'_, MockDriver>,
	) {
		self.log.borrow_mut().push(Ev::ReadyToSend);
	}

	fn on_remote_closed(
		&mut self,
		_s: &mut SocketCore<MockDriver>,
		_cx: &mut NetCx<'_, MockDriver>,
	) {
		self.log.borrow_mut().push(Ev::RemoteClosed);
	}

	fn on_local_closed(
		&mut self,
		_s: &mut SocketCore<MockDriver>,
		_cx: &mut NetCx<'_, MockDriver>,
	) {
		self.log.borrow_mut().push(Ev::LocalClosed);
	}

	fn on_closed(&mut self, _s: &mut SocketCore<MockDriver>, _cx: &mut NetCx<'_, MockDriver>) {
		self.log.borrow_mut().push(Ev::Closed);
	}

	fn on_reset(
		&mut self,
		_s: &mut SocketCore<MockDriver>,
		_cx: &mut NetCx<'_, MockDriver>,
		by_remote: bool,
	) {
		self.log.borrow_mut().push(Ev::Reset(by_remote));
	}
}

/// Drive a client socket through the three-way handshake. Returns the
/// handle plus our next sequence number and the expected ack for the
/// peer (its ISN + 1).
pub fn establish_client(
	ts: &mut TestStack,
	socket: Socket<MockDriver>,
	peer_port: u16,
	peer_isn: u32,
) -> (acorn_net::SocketHandle, u32, u32) {
	ts.resolve_arp(PEER_IP, PEER_MAC);
	let handle = ts.stack.add_socket(socket).map_err(|(_, e)| e).unwrap();
	ts.stack.connect(handle).unwrap();

	let sent = ts.sent();
	let syn = tcp_outputs(&sent).pop().expect("SYN emitted");
	assert_eq!(syn.flags, SYN);
	let local_port = syn.src_port;

	ts.deliver(tcp_frame(
		PEER_IP,
		peer_port,
		local_port,
		peer_isn,
		syn.seq.wrapping_add(1),
		SYN | ACK,
		Some(1460),
		&[],
	));
	let sent = ts.sent();
	let ack = tcp_outputs(&sent).pop().expect("handshake ACK emitted");
	assert_eq!(ack.flags, ACK);

	(handle, syn.seq.wrapping_add(1), peer_isn.wrapping_add(1))
}
