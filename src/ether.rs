//! Ethernet frame demultiplexer and the stack's relative-delay timers.
//!
//! [`EtherControl`] owns the link driver handle, a small EtherType →
//! handler registry, and the timer registry every protocol layer hangs
//! its retries off. ARP uses one slot while a lookup is in flight, DNS
//! one while the cache has pending entries, TCP one while any socket is
//! registered.

use alloc::boxed::Box;
use core::fmt;

use crate::Error;
use crate::buffer::PacketBuffer;
use crate::device::{DevHandle, LinkDriver};

/// Destination + source MAC + EtherType.
pub(crate) const HEADER_LEN: u16 = 14;

/// An IEEE 802 station address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
	pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
	pub const NULL: MacAddr = MacAddr([0x00; 6]);
}

impl fmt::Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let m = &self.0;
		write!(
			f,
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			m[0], m[1], m[2], m[3], m[4], m[5]
		)
	}
}

/// The known EtherType payload handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherProtocol {
	Arp,
	Ipv4,
}

/// The components that may own a timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
	Arp,
	Dns,
	Tcp,
}

/// 1-based id of a registered timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u8);

struct ProtocolSlot {
	ether_type: u16,
	handler: EtherProtocol,
}

struct TimerSlot {
	owner: TimerOwner,
	start: u32,
	delay_ms: u32,
}

/// Owner of the link driver: builds and sends frames, hands received
/// frames to the registered protocol handler, pumps timers.
pub struct EtherControl<D: LinkDriver> {
	dev: DevHandle<D>,
	mac: MacAddr,
	tx: PacketBuffer<D>,
	rx: PacketBuffer<D>,
	tx_payload: PacketBuffer<D>,
	protocols: Box<[Option<ProtocolSlot>]>,
	timers: Box<[Option<TimerSlot>]>,
}

impl<D: LinkDriver> EtherControl<D> {
	pub fn new(dev: DevHandle<D>, protocol_slots: u8, timer_slots: u8) -> Self {
		let (mac, send_region, receive_region) = {
			let dev = dev.borrow();
			(dev.mac_address(), dev.send_region(), dev.receive_region())
		};
		let tx = PacketBuffer::controller(dev.clone(), send_region, 0);
		let rx = PacketBuffer::controller(dev.clone(), receive_region, 0);
		let tx_payload = PacketBuffer::view(&tx, HEADER_LEN, 0);
		let protocols = (0..protocol_slots).map(|_| None).collect();
		let timers = (0..timer_slots).map(|_| None).collect();
		Self {
			dev,
			mac,
			tx,
			rx,
			tx_payload,
			protocols,
			timers,
		}
	}

	pub fn mac_address(&self) -> MacAddr {
		self.mac
	}

	/// The frame payload window: the transmit region past the 14-octet
	/// Ethernet header. Upper layers build their packets in here.
	pub fn send_payload(&self) -> PacketBuffer<D> {
		self.tx_payload.clone()
	}

	/// Octets the controller can receive for higher-level protocols,
	/// excluding the Ethernet header.
	pub fn max_receive_payload(&self) -> u16 {
		self.rx.size() - HEADER_LEN
	}

	/// Register (or replace) the handler for an EtherType.
	pub fn register_protocol(&mut self, ether_type: u16, handler: EtherProtocol) -> Result<(), Error> {
		for slot in self.protocols.iter_mut() {
			match slot {
				Some(entry) if entry.ether_type != ether_type => continue,
				_ => {
					*slot = Some(ProtocolSlot {
						ether_type,
						handler,
					});
					return Ok(());
				}
			}
		}
		error!("protocol registry full, cannot register {ether_type:#06x}");
		Err(Error::CapacityExhausted)
	}

	pub(crate) fn handler_for(&self, ether_type: u16) -> Option<EtherProtocol> {
		self.protocols
			.iter()
			.flatten()
			.find(|slot| slot.ether_type == ether_type)
			.map(|slot| slot.handler)
	}

	/// Send a frame whose payload is already in the transmit window:
	/// writes the Ethernet header and hands `14 + payload_len` octets to
	/// the driver.
	pub fn send_frame(
		&mut self,
		dst: MacAddr,
		ether_type: u16,
		payload_len: u16,
	) -> Result<(), Error> {
		if payload_len > self.tx.size() - HEADER_LEN {
			return Err(Error::PayloadTooLarge);
		}
		self.tx.write(0, &dst.0)?;
		self.tx.write(6, &self.mac.0)?;
		self.tx.write_net16(12, ether_type)?;
		debug!("tx {ether_type:#06x} -> {dst}, {payload_len} octets");
		self.dev.borrow_mut().send_frame(HEADER_LEN + payload_len);
		Ok(())
	}

	/// Copy `payload` into the transmit window, then send it.
	pub fn send_frame_with_payload(
		&mut self,
		dst: MacAddr,
		ether_type: u16,
		payload: &[u8],
	) -> Result<(), Error> {
		self.tx.write(HEADER_LEN, payload)?;
		self.send_frame(dst, ether_type, payload.len() as u16)
	}

	/// Fetch the next received frame from the driver. Returns the frame's
	/// EtherType and a view of its payload.
	pub(crate) fn receive(&mut self) -> Result<Option<(u16, PacketBuffer<D>)>, Error> {
		let frame = self.dev.borrow_mut().receive_frame();
		let Some(frame) = frame else {
			return Ok(None);
		};
		if frame.len <= HEADER_LEN {
			return Ok(None);
		}
		self.rx.set_payload_pointer(frame.offset);
		let ether_type = self.rx.read_net16(12)?;
		let payload = PacketBuffer::view(&self.rx, HEADER_LEN, frame.len - HEADER_LEN);
		Ok(Some((ether_type, payload)))
	}

	/// Claim a timer slot firing every `delay_ms` milliseconds.
	pub fn register_timer(
		&mut self,
		owner: TimerOwner,
		delay_ms: u32,
		now: u32,
	) -> Result<TimerId, Error> {
		for (index, slot) in self.timers.iter_mut().enumerate() {
			if slot.is_none() {
				*slot = Some(TimerSlot {
					owner,
					start: now,
					delay_ms,
				});
				return Ok(TimerId(index as u8 + 1));
			}
		}
		error!("timer registry full, cannot register {owner:?}");
		Err(Error::CapacityExhausted)
	}

	pub fn unregister_timer(&mut self, id: TimerId) {
		if let Some(slot) = self.timers.get_mut(id.0 as usize - 1) {
			*slot = None;
		}
	}

	pub(crate) fn timer_slots(&self) -> usize {
		self.timers.len()
	}

	/// If the slot at `index` is live and due, restamp it and return its
	/// owner for dispatch. State is read fresh per call, so handlers may
	/// mutate the registry between calls.
	pub(crate) fn take_due(&mut self, index: usize, now: u32) -> Option<TimerOwner> {
		let slot = self.timers.get_mut(index)?.as_mut()?;
		if now.wrapping_sub(slot.start) > slot.delay_ms {
			slot.start = now;
			Some(slot.owner)
		} else {
			None
		}
	}
}
