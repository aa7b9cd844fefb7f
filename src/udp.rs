//! Stateless UDP datagrams (IPv4 protocol 17).
//!
//! Outbound datagrams always carry the pseudo-header checksum. Inbound
//! ones are verified only when the checksum field is nonzero (it is
//! optional over IPv4) and dispatched by destination port to whatever is
//! listening there.

use alloc::boxed::Box;
use core::net::Ipv4Addr;

use crate::Error;
use crate::arp::ArpResolver;
use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::ether::EtherControl;
use crate::ip::{IpProtocol, Ipv4Layer};

pub(crate) const PROTOCOL: u8 = 17;
pub(crate) const HEADER_LEN: u16 = 8;

/// Callback for datagrams arriving on a registered port.
pub trait DatagramReceiver<D: LinkDriver> {
	fn handle_datagram(&mut self, source: Ipv4Addr, source_port: u16, payload: &PacketBuffer<D>);
}

/// What is listening on a port: the stack's own DNS resolver, or an
/// application callback.
pub(crate) enum UdpListener<D: LinkDriver> {
	Dns,
	Handler(Box<dyn DatagramReceiver<D>>),
}

struct ListenerSlot<D: LinkDriver> {
	port: u16,
	listener: UdpListener<D>,
}

/// The UDP layer: per-port listener registry plus datagram send/receive.
pub struct UdpLayer<D: LinkDriver> {
	listeners: Box<[Option<ListenerSlot<D>>]>,
	tx_payload: PacketBuffer<D>,
}

impl<D: LinkDriver> UdpLayer<D> {
	pub fn new(ip: &mut Ipv4Layer<D>, capacity: u8) -> Result<Self, Error> {
		ip.register_protocol(PROTOCOL, IpProtocol::Udp)?;
		let tx_payload = PacketBuffer::view(&ip.send_payload(), HEADER_LEN, 0);
		Ok(Self {
			listeners: (0..capacity).map(|_| None).collect(),
			tx_payload,
		})
	}

	/// The datagram payload window (past all headers).
	pub fn send_payload(&self) -> PacketBuffer<D> {
		self.tx_payload.clone()
	}

	pub fn register_listener(
		&mut self,
		port: u16,
		receiver: Box<dyn DatagramReceiver<D>>,
	) -> Result<(), Error> {
		self.register(port, UdpListener::Handler(receiver))
	}

	pub(crate) fn register(&mut self, port: u16, listener: UdpListener<D>) -> Result<(), Error> {
		// Replace an existing listener on the same port first.
		for slot in self.listeners.iter_mut().flatten() {
			if slot.port == port {
				slot.listener = listener;
				return Ok(());
			}
		}
		for slot in self.listeners.iter_mut() {
			if slot.is_none() {
				*slot = Some(ListenerSlot { port, listener });
				return Ok(());
			}
		}
		error!("listener registry full, cannot listen on port {port}");
		Err(Error::CapacityExhausted)
	}

	pub fn unregister_listener(&mut self, port: u16) {
		for slot in self.listeners.iter_mut() {
			if slot.as_ref().is_some_and(|s| s.port == port) {
				*slot = None;
			}
		}
	}

	pub(crate) fn listener_for(&mut self, port: u16) -> Option<&mut UdpListener<D>> {
		self.listeners
			.iter_mut()
			.flatten()
			.find(|slot| slot.port == port)
			.map(|slot| &mut slot.listener)
	}

	/// Pseudo-header checksum over `len` octets of `buf`: UDP length and
	/// protocol plus both addresses, with the checksum slot at offset 6
	/// skipped.
	fn checksum(
		buf: &PacketBuffer<D>,
		len: u16,
		local: Ipv4Addr,
		remote: Ipv4Addr,
	) -> Result<u16, Error> {
		let mut pseudo = len as u32 + PROTOCOL as u32;
		let l = local.octets();
		let r = remote.octets();
		pseudo += u16::from_be_bytes([l[0], l[1]]) as u32;
		pseudo += u16::from_be_bytes([l[2], l[3]]) as u32;
		pseudo += u16::from_be_bytes([r[0], r[1]]) as u32;
		pseudo += u16::from_be_bytes([r[2], r[3]]) as u32;
		buf.checksum(len, Some(6), pseudo)
	}

	/// Transmit `payload_len` octets already present in the datagram
	/// payload window.
	#[allow(clippy::too_many_arguments)]
	pub fn send_datagram(
		&mut self,
		ip: &mut Ipv4Layer<D>,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
		dst: Ipv4Addr,
		dst_port: u16,
		src_port: u16,
		payload_len: u16,
	) -> Result<(), Error> {
		let len = HEADER_LEN + payload_len;
		let mut datagram = ip.send_payload();
		if datagram.size() < len {
			return Err(Error::PayloadTooLarge);
		}

		datagram.write_net16(0, src_port)?;
		datagram.write_net16(2, dst_port)?;
		datagram.write_net16(4, len)?;
		let checksum = Self::checksum(&datagram, len, ip.address(), dst)?;
		datagram.write_net16(6, checksum)?;

		ip.send_packet(eth, arp, now, dst, PROTOCOL, len)
	}

	/// Copy `payload` into the datagram window, then transmit it.
	#[allow(clippy::too_many_arguments)]
	pub fn send_datagram_with_payload(
		&mut self,
		ip: &mut Ipv4Layer<D>,
		eth: &mut EtherControl<D>,
		arp: &mut ArpResolver,
		now: u32,
		dst: Ipv4Addr,
		dst_port: u16,
		src_port: u16,
		payload: &[u8],
	) -> Result<(), Error> {
		let mut datagram = ip.send_payload();
		if datagram.size() < HEADER_LEN + payload.len() as u16 {
			return Err(Error::PayloadTooLarge);
		}
		datagram.write(HEADER_LEN, payload)?;
		self.send_datagram(
			ip,
			eth,
			arp,
			now,
			dst,
			dst_port,
			src_port,
			payload.len() as u16,
		)
	}

	/// Validate an inbound datagram. Returns destination port, source
	/// port and a payload view; the caller dispatches to the listener.
	pub(crate) fn handle_packet(
		&self,
		local: Ipv4Addr,
		source: Ipv4Addr,
		datagram: &PacketBuffer<D>,
	) -> Option<(u16, u16, PacketBuffer<D>)> {
		if datagram.size() < HEADER_LEN {
			return None;
		}

		let declared = datagram.read_net16(4).ok()?;
		if declared < HEADER_LEN || declared > datagram.size() {
			return None;
		}

		let stored = datagram.read_net16(6).ok()?;
		if stored != 0 {
			let computed =
				Self::checksum(datagram, datagram.size(), local, source).ok()?;
			if stored != computed {
				debug!("UDP checksum mismatch from {source}, dropping");
				return None;
			}
		}

		let src_port = datagram.read_net16(0).ok()?;
		let dst_port = datagram.read_net16(2).ok()?;
		let payload = PacketBuffer::view(datagram, HEADER_LEN, declared - HEADER_LEN);
		Some((dst_port, src_port, payload))
	}
}
