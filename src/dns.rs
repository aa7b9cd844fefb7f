//! DNS A-record resolution over UDP/53 (RFC 1035 subset).
//!
//! The cache is a bounded, insertion-ordered table; entries are never
//! evicted, and an entry's 1-based index doubles as the DNS transaction
//! id on the wire, so responses map straight back to their slot. Retries
//! run on a 1 s timer and alternate between the primary and backup
//! resolver; responses from any other address are treated as poisoning
//! attempts and ignored.

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use num_enum::FromPrimitive;

use crate::Error;
use crate::arp::ArpResolver;
use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::ether::{EtherControl, TimerId, TimerOwner};
use crate::ip::Ipv4Layer;
use crate::udp::{UdpLayer, UdpListener};

pub(crate) const PORT: u16 = 53;
const HEADER_LEN: u16 = 12;
/// RFC 1035 limit on a full domain name.
const MAX_NAME: usize = 255;
const RETRY_MS: u32 = 1000;
const MAX_ATTEMPTS: u8 = 5;

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
/// Standard query, recursion desired.
const CONTROL_RD: u16 = 0x0100;

/// Where a lookup stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
	Init,
	Pending,
	Done,
	Expired,
}

/// The RFC 1035 RCODE lane, extended with two local codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
	NoError = 0,
	FormatError = 1,
	ServerFailure = 2,
	NameError = 3,
	NotImplemented = 4,
	Refused = 5,
	/// Local: the query could not be built or sent, or the cache is full.
	ClientError = 8,
	/// Local: the resolvers never answered.
	NoResponse = 9,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Lookup-lane and response-code-lane pair returned by every resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsStatus {
	pub state: LookupState,
	pub code: ResponseCode,
}

struct DnsEntry {
	name: heapless::String<MAX_NAME>,
	ip: Ipv4Addr,
	state: LookupState,
	code: ResponseCode,
	request_time: u32,
	ttl: u32,
	attempts: u8,
}

/// Bounded cache of A-record lookups.
pub struct DnsResolver {
	primary: Ipv4Addr,
	backup: Ipv4Addr,
	cache: Vec<DnsEntry>,
	capacity: usize,
	timer: Option<TimerId>,
}

impl DnsResolver {
	pub fn new<D: LinkDriver>(
		udp: &mut UdpLayer<D>,
		primary: Ipv4Addr,
		backup: Option<Ipv4Addr>,
		capacity: u8,
	) -> Result<Self, Error> {
		udp.register(PORT, UdpListener::Dns)?;
		Ok(Self {
			primary,
			backup: backup.unwrap_or(primary),
			cache: Vec::with_capacity(capacity as usize),
			capacity: capacity as usize,
			timer: None,
		})
	}

	/// Resolve `name`, consulting the cache first.
	///
	/// A fresh or `force`d (or TTL-expired) lookup sends a query and
	/// reports `Pending`; poll again later. The address is only returned
	/// while the entry is `Done` with `NoError`.
	#[allow(clippy::too_many_arguments)]
	pub fn resolve<D: LinkDriver>(
		&mut self,
		udp: &mut UdpLayer<D>,
		ip: &mut Ipv4Layer<D>,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
		name: &str,
		force: bool,
	) -> (Option<Ipv4Addr>, DnsStatus) {
		for index in 0..self.cache.len() {
			if self.cache[index].name.as_str() != name {
				continue;
			}
			self.check_expiration(index, now);

			let refresh = force || self.cache[index].state == LookupState::Expired;
			if refresh {
				let id = index as u16 + 1;
				let sent = Self::send_query(udp, ip, eth, arp, now, name, id, self.primary);
				let entry = &mut self.cache[index];
				entry.state = LookupState::Pending;
				entry.code = ResponseCode::NoError;
				if sent.is_ok() {
					entry.request_time = now;
					entry.attempts = 1;
					self.ensure_timer(eth, now);
				} else {
					entry.state = LookupState::Done;
					entry.code = ResponseCode::ClientError;
				}
			}

			let entry = &self.cache[index];
			let status = DnsStatus {
				state: entry.state,
				code: entry.code,
			};
			let addr = (entry.state == LookupState::Done
				&& entry.code == ResponseCode::NoError)
				.then_some(entry.ip);
			return (addr, status);
		}

		// Cache miss: take the next slot in insertion order.
		let failed = DnsStatus {
			state: LookupState::Done,
			code: ResponseCode::ClientError,
		};
		if self.cache.len() >= self.capacity {
			warn!("DNS cache full, cannot resolve {name}");
			return (None, failed);
		}
		let Ok(name_owned) = heapless::String::try_from(name) else {
			return (None, failed);
		};

		let id = self.cache.len() as u16 + 1;
		self.cache.push(DnsEntry {
			name: name_owned,
			ip: Ipv4Addr::UNSPECIFIED,
			state: LookupState::Pending,
			code: ResponseCode::NoError,
			request_time: now,
			ttl: 0,
			attempts: 1,
		});

		if Self::send_query(udp, ip, eth, arp, now, name, id, self.primary).is_err() {
			// Do not leak the slot when the first query cannot go out.
			self.cache.pop();
			return (None, failed);
		}
		self.ensure_timer(eth, now);

		(
			None,
			DnsStatus {
				state: LookupState::Pending,
				code: ResponseCode::NoError,
			},
		)
	}

	/// Encode and send one query. Label encoding per RFC 1035 §4.1.2:
	/// each dot-separated host becomes a length-prefixed run, terminated
	/// by a zero length.
	#[allow(clippy::too_many_arguments)]
	fn send_query<D: LinkDriver>(
		udp: &mut UdpLayer<D>,
		ip: &mut Ipv4Layer<D>,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
		name: &str,
		id: u16,
		server: Ipv4Addr,
	) -> Result<(), Error> {
		if name.len() > MAX_NAME {
			return Err(Error::NameTooLong);
		}

		let mut buf = udp.send_payload();
		if buf.size() < HEADER_LEN {
			return Err(Error::PayloadTooLarge);
		}

		buf.write_net16(0, id)?;
		buf.write_net16(2, CONTROL_RD)?;
		buf.write_net16(4, 0x0001)?; // one question
		buf.write_net16(6, 0x0000)?;
		buf.write_net16(8, 0x0000)?;
		buf.write_net16(10, 0x0000)?;

		let mut offset = HEADER_LEN;
		for label in name.split('.') {
			buf.write_u8(offset, label.len() as u8)?;
			buf.write(offset + 1, label.as_bytes())?;
			offset += 1 + label.len() as u16;
		}
		buf.write_u8(offset, 0)?;
		offset += 1;

		buf.write_net16(offset, QTYPE_A)?;
		buf.write_net16(offset + 2, QCLASS_IN)?;
		let length = offset + 4;

		match udp.send_datagram(ip, eth, arp, now, server, PORT, PORT, length) {
			// The gateway's MAC may still be resolving; the retry timer
			// picks this lookup up again.
			Err(Error::RouteUnresolved) => Ok(()),
			other => other,
		}
	}

	fn ensure_timer<D: LinkDriver>(&mut self, eth: &mut EtherControl<D>, now: u32) {
		if self.timer.is_none() {
			self.timer = eth.register_timer(TimerOwner::Dns, RETRY_MS, now).ok();
		}
	}

	fn check_expiration(&mut self, index: usize, now: u32) {
		let entry = &mut self.cache[index];
		if entry.state == LookupState::Done
			&& entry.code == ResponseCode::NoError
			&& now.wrapping_sub(entry.request_time) > entry.ttl.saturating_mul(1000)
		{
			entry.state = LookupState::Expired;
		}
	}

	/// 1 s sweep: retransmit pending lookups older than a second,
	/// alternating resolvers by attempt parity, and give up after five
	/// tries. The timer stays armed while anything is pending.
	pub(crate) fn on_timer<D: LinkDriver>(
		&mut self,
		udp: &mut UdpLayer<D>,
		ip: &mut Ipv4Layer<D>,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
	) {
		for index in 0..self.cache.len() {
			let entry = &self.cache[index];
			if entry.state != LookupState::Pending {
				continue;
			}
			if now.wrapping_sub(entry.request_time) <= RETRY_MS {
				continue;
			}
			if entry.attempts >= MAX_ATTEMPTS {
				let entry = &mut self.cache[index];
				entry.state = LookupState::Done;
				entry.code = ResponseCode::NoResponse;
				debug!("DNS gave up on {}", entry.name);
				continue;
			}

			let entry = &mut self.cache[index];
			entry.attempts += 1;
			entry.request_time = now;
			let server = if entry.attempts % 2 == 0 {
				self.backup
			} else {
				self.primary
			};
			let name = entry.name.clone();
			let _ = Self::send_query(udp, ip, eth, arp, now, &name, index as u16 + 1, server);
		}

		let pending = self
			.cache
			.iter()
			.any(|entry| entry.state == LookupState::Pending);
		if !pending {
			if let Some(timer) = self.timer.take() {
				eth.unregister_timer(timer);
			}
		}
	}

	pub(crate) fn handle_datagram<D: LinkDriver>(
		&mut self,
		now: u32,
		source: Ipv4Addr,
		packet: &PacketBuffer<D>,
	) {
		if let Err(err) = self.parse_response(now, source, packet) {
			debug!("dropping DNS response: {err}");
		}
	}

	fn parse_response<D: LinkDriver>(
		&mut self,
		now: u32,
		source: Ipv4Addr,
		p: &PacketBuffer<D>,
	) -> Result<(), Error> {
		if p.size() < HEADER_LEN {
			return Ok(());
		}
		// Responses must come from a configured resolver; anything else
		// could be a poisoning attempt.
		if source != self.primary && source != self.backup {
			return Ok(());
		}

		let id = p.read_net16(0)?;
		let control = p.read_net16(2)?;
		let qdcount = p.read_net16(4)?;
		let ancount = p.read_net16(6)?;

		// QR must mark a response and TC must be clear.
		if control >> 15 != 1 {
			return Ok(());
		}
		if control & 0x0200 != 0 {
			return Ok(());
		}

		let Some(index) = (id as usize).checked_sub(1) else {
			return Ok(());
		};
		if index >= self.cache.len() {
			return Ok(());
		}
		if self.cache[index].state != LookupState::Pending {
			return Ok(());
		}

		let code = ResponseCode::from((control & 0x000F) as u8);
		let entry = &mut self.cache[index];
		entry.state = LookupState::Done;
		entry.code = code;
		if code != ResponseCode::NoError {
			debug!("DNS {} failed: {code:?}", entry.name);
			return Ok(());
		}

		// The TTL countdown starts when the answer arrives.
		entry.request_time = now;

		if ancount == 0 {
			// A NoError response must answer; treat it as a server fault.
			entry.code = ResponseCode::ServerFailure;
			return Ok(());
		}

		let mut offset = HEADER_LEN;
		for _ in 0..qdcount {
			let mut size = p.read_u8(offset)?;
			offset += 1;
			while size > 0 {
				offset += size as u16;
				size = p.read_u8(offset)?;
				offset += 1;
			}
			offset += 4; // QTYPE + QCLASS
		}

		for _ in 0..ancount {
			// Skip the NAME field. A label byte with the top two bits
			// set is a 2-octet compressed pointer and ends the name.
			let mut size = p.read_u8(offset)?;
			offset += 1;
			while size > 0 {
				if size >> 6 == 0b11 {
					offset += 1; // low octet of the pointer
					break;
				}
				offset += size as u16;
				size = p.read_u8(offset)?;
				offset += 1;
			}

			offset += 4; // TYPE + CLASS
			let ttl = p.read_net32(offset)?;
			offset += 4;
			let rdlength = p.read_net16(offset)?;
			offset += 2;

			if rdlength == 4 {
				let mut addr = [0u8; 4];
				p.read(offset, &mut addr)?;
				let entry = &mut self.cache[index];
				entry.ip = Ipv4Addr::from(addr);
				entry.ttl = ttl;
				debug!("DNS resolved {} -> {}", entry.name, entry.ip);
				break;
			}
			offset += rdlength;
		}

		Ok(())
	}
}

impl fmt::Display for DnsResolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "DNS cache")?;
		for entry in self.cache.iter() {
			match entry.state {
				LookupState::Pending => {
					writeln!(f, "{} -> (pending:{})", entry.name, entry.attempts)?;
				}
				LookupState::Expired => writeln!(f, "{} -> {} | expired", entry.name, entry.ip)?,
				_ => writeln!(
					f,
					"{} -> {} | {:?} ttl {}",
					entry.name, entry.ip, entry.code, entry.ttl
				)?,
			}
		}
		Ok(())
	}
}
