//! IPv4 framing and routing.
//!
//! Outbound packets get a fixed 20-octet header (no options, DF set,
//! TTL 64) and are routed by a subnet test: on-link destinations resolve
//! through ARP, the subnet broadcast maps to the Ethernet broadcast
//! address, everything else goes to the gateway. Inbound packets are
//! checksum-verified and dispatched by protocol number.

use alloc::boxed::Box;
use core::net::Ipv4Addr;

use crate::Error;
use crate::arp::{ArpResolver, MacLookup};
use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::ether::{EtherControl, EtherProtocol, MacAddr};

pub(crate) const ETHERTYPE: u16 = 0x0800;
pub(crate) const HEADER_LEN: u16 = 20;

/// Room for UDP and TCP plus one spare slot.
const PROTOCOL_SLOTS: usize = 3;

/// The known IP protocol handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
	Udp,
	Tcp,
}

struct ProtocolSlot {
	protocol: u8,
	handler: IpProtocol,
}

/// The IPv4 layer: validates and demultiplexes inbound packets, frames
/// and routes outbound ones.
pub struct Ipv4Layer<D: LinkDriver> {
	addr: Ipv4Addr,
	gateway: Ipv4Addr,
	subnet_mask: Ipv4Addr,
	network: Ipv4Addr,
	broadcast: Ipv4Addr,
	next_port: u16,
	protocols: Box<[Option<ProtocolSlot>]>,
	tx_payload: PacketBuffer<D>,
}

impl<D: LinkDriver> Ipv4Layer<D> {
	pub fn new(
		eth: &mut EtherControl<D>,
		addr: Ipv4Addr,
		gateway: Ipv4Addr,
		subnet_mask: Ipv4Addr,
		port_seed: u16,
	) -> Result<Self, Error> {
		eth.register_protocol(ETHERTYPE, EtherProtocol::Ipv4)?;

		let mut network = [0u8; 4];
		let mut broadcast = [0u8; 4];
		for i in 0..4 {
			network[i] = addr.octets()[i] & subnet_mask.octets()[i];
			broadcast[i] = network[i] | !subnet_mask.octets()[i];
		}

		let tx_payload = PacketBuffer::view(&eth.send_payload(), HEADER_LEN, 0);
		Ok(Self {
			addr,
			gateway,
			subnet_mask,
			network: Ipv4Addr::from(network),
			broadcast: Ipv4Addr::from(broadcast),
			next_port: port_seed,
			protocols: (0..PROTOCOL_SLOTS).map(|_| None).collect(),
			tx_payload,
		})
	}

	pub fn address(&self) -> Ipv4Addr {
		self.addr
	}

	pub fn gateway(&self) -> Ipv4Addr {
		self.gateway
	}

	pub fn subnet_mask(&self) -> Ipv4Addr {
		self.subnet_mask
	}

	/// The packet payload window (transmit region past the Ethernet and
	/// IP headers).
	pub fn send_payload(&self) -> PacketBuffer<D> {
		self.tx_payload.clone()
	}

	/// Next ephemeral source port. A monotonic counter seeded from the
	/// stack's entropy stream, wrapping at 16 bits (skipping zero).
	pub(crate) fn ephemeral_port(&mut self) -> u16 {
		if self.next_port == 0 {
			self.next_port = 1;
		}
		let port = self.next_port;
		self.next_port = self.next_port.wrapping_add(1);
		port
	}

	fn is_local(&self, dst: Ipv4Addr) -> bool {
		let dst = dst.octets();
		let mask = self.subnet_mask.octets();
		let network = self.network.octets();
		(0..4).all(|i| (mask[i] & dst[i]) == network[i])
	}

	/// Where a packet for `dst` is physically sent: the host itself when
	/// on-link, the gateway otherwise.
	pub(crate) fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
		if self.is_local(dst) { dst } else { self.gateway }
	}

	/// The MAC a packet for `dst` should carry, if known.
	pub(crate) fn mac_for(&self, arp: &ArpResolver, dst: Ipv4Addr) -> Option<MacAddr> {
		if self.is_local(dst) && dst == self.broadcast {
			return Some(MacAddr::BROADCAST);
		}
		match arp.lookup(self.next_hop(dst)) {
			MacLookup::Resolved(mac) => Some(mac),
			_ => None,
		}
	}

	pub(crate) fn register_protocol(
		&mut self,
		protocol: u8,
		handler: IpProtocol,
	) -> Result<(), Error> {
		for slot in self.protocols.iter_mut() {
			match slot {
				Some(entry) if entry.protocol != protocol => continue,
				_ => {
					*slot = Some(ProtocolSlot { protocol, handler });
					return Ok(());
				}
			}
		}
		Err(Error::CapacityExhausted)
	}

	fn handler_for(&self, protocol: u8) -> Option<IpProtocol> {
		self.protocols
			.iter()
			.flatten()
			.find(|slot| slot.protocol == protocol)
			.map(|slot| slot.handler)
	}

	/// Frame and transmit `payload_len` octets already present in the
	/// packet payload window. When the next hop's MAC is unknown an ARP
	/// probe is kicked off and the caller gets [`Error::RouteUnresolved`];
	/// retry-driven callers (DNS, TCP) heal on their timers.
	pub fn send_packet(
		&mut self,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
		dst: Ipv4Addr,
		protocol: u8,
		payload_len: u16,
	) -> Result<(), Error> {
		let mut p = eth.send_payload();
		if p.size() < HEADER_LEN + payload_len {
			return Err(Error::PayloadTooLarge);
		}

		let Some(mac) = self.mac_for(arp, dst) else {
			let _ = arp.request_mac_address(eth, now, self.next_hop(dst));
			return Err(Error::RouteUnresolved);
		};

		p.write_u8(0, 0x45)?; // version 4, 5-word header
		p.write_u8(1, 0x00)?;
		p.write_net16(2, HEADER_LEN + payload_len)?;
		p.write_net16(4, 0)?; // identification
		p.write_net16(6, 0x4000)?; // DF, fragment offset 0
		p.write_u8(8, 64)?; // TTL
		p.write_u8(9, protocol)?;
		p.write(12, &self.addr.octets())?;
		p.write(16, &dst.octets())?;
		let checksum = p.checksum(HEADER_LEN, Some(10), 0)?;
		p.write_net16(10, checksum)?;

		eth.send_frame(mac, ETHERTYPE, HEADER_LEN + payload_len)
	}

	/// Validate an inbound IPv4 payload. Returns the registered handler,
	/// the source address and a view of the packet payload; anything
	/// malformed or not addressed to us is silently dropped.
	pub(crate) fn handle_payload(
		&self,
		p: &PacketBuffer<D>,
	) -> Option<(IpProtocol, Ipv4Addr, PacketBuffer<D>)> {
		if p.size() < HEADER_LEN {
			return None;
		}

		let stored = p.read_net16(10).ok()?;
		let computed = p.checksum(HEADER_LEN, Some(10), 0).ok()?;
		if stored != computed {
			debug!("IP header checksum mismatch, dropping");
			return None;
		}

		let total_len = p.read_net16(2).ok()?;
		if total_len < HEADER_LEN || p.size() < total_len {
			return None;
		}

		let mut dst = [0u8; 4];
		p.read(16, &mut dst).ok()?;
		let dst = Ipv4Addr::from(dst);
		if dst != self.addr && dst != self.broadcast {
			return None;
		}

		let protocol = p.read_u8(9).ok()?;
		let handler = self.handler_for(protocol)?;

		let mut src = [0u8; 4];
		p.read(12, &mut src).ok()?;
		let payload = PacketBuffer::view(p, HEADER_LEN, total_len - HEADER_LEN);
		Some((handler, Ipv4Addr::from(src), payload))
	}

	/// Octets of IP payload the controller can receive in one packet.
	pub fn max_receive_payload(&self, eth: &EtherControl<D>) -> u16 {
		eth.max_receive_payload() - HEADER_LEN
	}
}
