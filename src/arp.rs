//! ARP resolution on the local subnet, RFC 826 request/reply only;
//! no probe, announcement or mediation variants.
//!
//! The routing table is deliberately small: entries are never evicted,
//! and once every slot is used further lookups fail until a timed-out
//! probe clears its slot. Re-probing an already-resolved entry keeps the
//! old MAC visible while the probe is in flight.

use alloc::boxed::Box;
use core::fmt;
use core::net::Ipv4Addr;

use crate::Error;
use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::ether::{EtherControl, EtherProtocol, MacAddr, TimerId, TimerOwner};

pub(crate) const ETHERTYPE: u16 = 0x0806;

const HTYPE_ETHERNET: u16 = 0x0001;
const PTYPE_IPV4: u16 = 0x0800;
const OP_REQUEST: u16 = 0x0001;
const OP_REPLY: u16 = 0x0002;
/// Fixed ARP payload: header (8) + two MAC/IPv4 pairs (10 each).
const PAYLOAD_LEN: u16 = 28;

const RETRY_MS: u32 = 250;
const MAX_ATTEMPTS: u8 = 5;

/// Result of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacLookup {
	Resolved(MacAddr),
	/// An entry exists but the reply has not arrived yet.
	Pending,
	/// No entry; call [`ArpResolver::request_mac_address`] first.
	Unknown,
}

#[derive(Clone, Copy)]
struct ArpRoute {
	ip: Ipv4Addr,
	mac: MacAddr,
	lookup_time: u32,
	resolved: bool,
	attempts: u8,
}

impl ArpRoute {
	const EMPTY: ArpRoute = ArpRoute {
		ip: Ipv4Addr::UNSPECIFIED,
		mac: MacAddr::NULL,
		lookup_time: 0,
		resolved: false,
		attempts: 0,
	};

	// A slot is free exactly when it is unresolved with no attempts.
	fn is_free(&self) -> bool {
		!self.resolved && self.attempts == 0
	}
}

/// IPv4 → MAC resolver over EtherType 0x0806.
pub struct ArpResolver {
	our_ip: Ipv4Addr,
	table: Box<[ArpRoute]>,
	timer: Option<TimerId>,
}

impl ArpResolver {
	pub fn new<D: LinkDriver>(
		eth: &mut EtherControl<D>,
		our_ip: Ipv4Addr,
		capacity: u8,
	) -> Result<Self, Error> {
		eth.register_protocol(ETHERTYPE, EtherProtocol::Arp)?;
		Ok(Self {
			our_ip,
			table: (0..capacity).map(|_| ArpRoute::EMPTY).collect(),
			timer: None,
		})
	}

	/// Start (or refresh) resolution of `target`. An unresolved entry for
	/// the same address counts as success, the lookup is in flight. A
	/// resolved entry is re-probed in place without dropping the old MAC.
	pub fn request_mac_address<D: LinkDriver>(
		&mut self,
		eth: &mut EtherControl<D>,
		now: u32,
		target: Ipv4Addr,
	) -> Result<(), Error> {
		let mut index = None;
		for (i, route) in self.table.iter().enumerate() {
			if !route.is_free() && route.ip == target {
				if !route.resolved {
					return Ok(());
				}
				index = Some(i);
			}
		}

		let index = match index {
			Some(i) => i,
			None => match self.table.iter().position(|route| route.is_free()) {
				Some(i) => i,
				None => {
					warn!("ARP table full, cannot resolve {target}");
					return Err(Error::CapacityExhausted);
				}
			},
		};

		if self.timer.is_none() {
			self.timer = Some(eth.register_timer(TimerOwner::Arp, RETRY_MS, now)?);
		}

		let route = &mut self.table[index];
		route.attempts = 1;
		route.lookup_time = now;
		route.ip = target;

		self.send_request(eth, target)
	}

	/// Table lookup without side effects.
	pub fn lookup(&self, ip: Ipv4Addr) -> MacLookup {
		for route in self.table.iter() {
			if !route.is_free() && route.ip == ip {
				return if route.resolved {
					MacLookup::Resolved(route.mac)
				} else {
					MacLookup::Pending
				};
			}
		}
		MacLookup::Unknown
	}

	fn send_request<D: LinkDriver>(
		&self,
		eth: &mut EtherControl<D>,
		target: Ipv4Addr,
	) -> Result<(), Error> {
		let our_mac = eth.mac_address();
		let mut p = eth.send_payload();
		p.write_net16(0, HTYPE_ETHERNET)?;
		p.write_net16(2, PTYPE_IPV4)?;
		p.write_u8(4, 6)?;
		p.write_u8(5, 4)?;
		p.write_net16(6, OP_REQUEST)?;
		p.write(8, &our_mac.0)?;
		p.write(14, &self.our_ip.octets())?;
		p.write(18, &MacAddr::NULL.0)?;
		p.write(24, &target.octets())?;
		eth.send_frame(MacAddr::BROADCAST, ETHERTYPE, PAYLOAD_LEN)
	}

	fn send_reply<D: LinkDriver>(
		&self,
		eth: &mut EtherControl<D>,
		target_mac: MacAddr,
		target_ip: Ipv4Addr,
	) -> Result<(), Error> {
		let our_mac = eth.mac_address();
		let mut p = eth.send_payload();
		p.write_net16(0, HTYPE_ETHERNET)?;
		p.write_net16(2, PTYPE_IPV4)?;
		p.write_u8(4, 6)?;
		p.write_u8(5, 4)?;
		p.write_net16(6, OP_REPLY)?;
		p.write(8, &our_mac.0)?;
		p.write(14, &self.our_ip.octets())?;
		p.write(18, &target_mac.0)?;
		p.write(24, &target_ip.octets())?;
		eth.send_frame(target_mac, ETHERTYPE, PAYLOAD_LEN)
	}

	pub(crate) fn handle_payload<D: LinkDriver>(
		&mut self,
		eth: &mut EtherControl<D>,
		payload: &PacketBuffer<D>,
	) {
		if let Err(err) = self.process(eth, payload) {
			debug!("dropping ARP frame: {err}");
		}
	}

	fn process<D: LinkDriver>(
		&mut self,
		eth: &mut EtherControl<D>,
		p: &PacketBuffer<D>,
	) -> Result<(), Error> {
		if p.size() < PAYLOAD_LEN {
			return Ok(());
		}
		if p.read_net16(0)? != HTYPE_ETHERNET || p.read_net16(2)? != PTYPE_IPV4 {
			return Ok(());
		}
		if p.read_u8(4)? != 6 || p.read_u8(5)? != 4 {
			return Ok(());
		}

		let operation = p.read_net16(6)?;
		let mut sender_mac = [0u8; 6];
		let mut sender_ip = [0u8; 4];
		let mut target_mac = [0u8; 6];
		let mut target_ip = [0u8; 4];
		p.read(8, &mut sender_mac)?;
		p.read(14, &mut sender_ip)?;
		p.read(18, &mut target_mac)?;
		p.read(24, &mut target_ip)?;
		let sender_ip = Ipv4Addr::from(sender_ip);
		let target_ip = Ipv4Addr::from(target_ip);

		match operation {
			OP_REQUEST => {
				if target_ip == self.our_ip {
					self.send_reply(eth, MacAddr(sender_mac), sender_ip)?;
				}
			}
			OP_REPLY => {
				// Unsolicited replies, and replies not addressed to us,
				// never touch the table.
				if MacAddr(target_mac) != eth.mac_address() || target_ip != self.our_ip {
					return Ok(());
				}
				for route in self.table.iter_mut() {
					if !route.is_free() && route.ip == sender_ip {
						route.mac = MacAddr(sender_mac);
						route.resolved = true;
						debug!("ARP resolved {sender_ip} -> {}", route.mac);
						return Ok(());
					}
				}
			}
			_ => {}
		}
		Ok(())
	}

	/// 250 ms sweep: retransmit overdue probes, clear entries that used
	/// up their attempts, and drop the timer once nothing is in flight.
	pub(crate) fn on_timer<D: LinkDriver>(&mut self, eth: &mut EtherControl<D>, now: u32) {
		for index in 0..self.table.len() {
			let route = self.table[index];
			if route.is_free() || route.resolved {
				continue;
			}
			if now.wrapping_sub(route.lookup_time) < RETRY_MS {
				continue;
			}
			if route.attempts >= MAX_ATTEMPTS {
				debug!("ARP gave up on {}", route.ip);
				self.table[index] = ArpRoute::EMPTY;
				continue;
			}
			let route = &mut self.table[index];
			route.attempts += 1;
			route.lookup_time = now;
			let target = route.ip;
			let _ = self.send_request(eth, target);
		}

		let pending = self
			.table
			.iter()
			.any(|route| !route.is_free() && !route.resolved);
		if !pending {
			if let Some(timer) = self.timer.take() {
				eth.unregister_timer(timer);
			}
		}
	}
}

impl fmt::Display for ArpResolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "ARP routing table")?;
		for route in self.table.iter() {
			if route.is_free() {
				continue;
			}
			let state = if route.resolved { "resolved" } else { "fetching" };
			writeln!(f, "{} -> {} | {state}", route.ip, route.mac)?;
		}
		Ok(())
	}
}
