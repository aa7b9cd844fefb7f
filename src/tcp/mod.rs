//! TCP (IPv4 protocol 6): the socket registry and segment demultiplexer.
//!
//! A connection is a [`Socket`](socket::Socket) registered here. The
//! layer owns the registered sockets, slices the caller-provided
//! outbound buffer into equal per-socket retransmit stashes (the slice
//! size is the per-socket send limit), and runs the shared 1 s state
//! timer that drives retransmission and timeouts. Inbound segments are
//! matched first against connected sockets by (remote address, remote
//! port, local port), then against listeners by local port alone.

pub mod buffered;
pub mod socket;

use alloc::boxed::Box;
use core::net::Ipv4Addr;

use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::ether::{EtherControl, TimerId, TimerOwner};
use crate::ip::{IpProtocol, Ipv4Layer};
use crate::tcp::socket::Socket;
use crate::{Error, NetCx};

pub(crate) const PROTOCOL: u8 = 6;
pub(crate) const HEADER_LEN: u16 = 20;

/// One tick per second drives retransmission, timeouts and TIME_WAIT.
const STATE_TIMER_MS: u32 = 1000;

bitflags! {
	/// TCP control bits (header octet 13).
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TcpFlags: u8 {
		const FIN = 0x01;
		const SYN = 0x02;
		const RST = 0x04;
		const PSH = 0x08;
		const ACK = 0x10;
		const URG = 0x20;
		const ECE = 0x40;
		const CWR = 0x80;
	}
}

/// Index of a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub(crate) u8);

/// The TCP layer.
pub struct TcpLayer<D: LinkDriver> {
	slots: Box<[Option<Socket<D>>]>,
	stashes: Box<[PacketBuffer<D>]>,
	max_outbound: u16,
	timer: Option<TimerId>,
}

impl<D: LinkDriver> TcpLayer<D> {
	/// `outbound` is divided evenly: with a 1000-octet buffer and four
	/// sockets, each socket can have 250 octets in flight.
	pub fn new(
		ip: &mut Ipv4Layer<D>,
		capacity: u8,
		outbound: &PacketBuffer<D>,
	) -> Result<Self, Error> {
		ip.register_protocol(PROTOCOL, IpProtocol::Tcp)?;

		// A stash slice never needs to exceed what one segment can carry.
		let per_packet = ip.send_payload().size() - HEADER_LEN;
		let stash_size = outbound.size().min(per_packet);
		let max_outbound = stash_size / capacity.max(1) as u16;

		let stashes = (0..capacity)
			.map(|i| PacketBuffer::view(outbound, i as u16 * max_outbound, max_outbound))
			.collect();
		Ok(Self {
			slots: (0..capacity).map(|_| None).collect(),
			stashes,
			max_outbound,
			timer: None,
		})
	}

	/// The per-socket send limit (the stash slice size).
	pub fn max_outbound(&self) -> u16 {
		self.max_outbound
	}

	/// Register `socket`: assign its stash slice and send window, give it
	/// an initial sequence number, promote a listener to LISTEN, and make
	/// sure the shared state timer runs. On failure the socket is handed
	/// back.
	pub fn register(
		&mut self,
		eth: &mut EtherControl<D>,
		ip: &Ipv4Layer<D>,
		now: u32,
		isn: u32,
		mut socket: Socket<D>,
	) -> Result<SocketHandle, (Socket<D>, Error)> {
		let Some(index) = self.slots.iter().position(|slot| slot.is_none()) else {
			warn!("socket table full");
			return Err((socket, Error::CapacityExhausted));
		};

		if self.timer.is_none() {
			match eth.register_timer(TimerOwner::Tcp, STATE_TIMER_MS, now) {
				Ok(timer) => self.timer = Some(timer),
				Err(err) => return Err((socket, err)),
			}
		}

		let send_view = PacketBuffer::view(&ip.send_payload(), HEADER_LEN, 0);
		socket.attach(self.stashes[index].clone(), send_view, isn, now);
		self.slots[index] = Some(socket);
		Ok(SocketHandle(index as u8))
	}

	/// Unregister and return the socket, resetting the connection if it
	/// is still open. Releases the state timer with the last socket.
	pub fn unregister(&mut self, cx: &mut NetCx<'_, D>, handle: SocketHandle) -> Option<Socket<D>> {
		let mut socket = self.slots.get_mut(handle.0 as usize)?.take()?;
		socket.force_close(cx);
		socket.detach();

		if self.slots.iter().all(|slot| slot.is_none()) {
			if let Some(timer) = self.timer.take() {
				cx.eth.unregister_timer(timer);
			}
		}
		Some(socket)
	}

	pub fn socket(&self, handle: SocketHandle) -> Option<&Socket<D>> {
		self.slots.get(handle.0 as usize)?.as_ref()
	}

	pub fn socket_mut(&mut self, handle: SocketHandle) -> Option<&mut Socket<D>> {
		self.slots.get_mut(handle.0 as usize)?.as_mut()
	}

	fn socket_or(&mut self, handle: SocketHandle) -> Result<&mut Socket<D>, Error> {
		self.slots
			.get_mut(handle.0 as usize)
			.and_then(|slot| slot.as_mut())
			.ok_or(Error::NotRegistered)
	}

	pub fn connect(&mut self, cx: &mut NetCx<'_, D>, handle: SocketHandle) -> Result<(), Error> {
		self.socket_or(handle)?.connect(cx)
	}

	pub fn close(&mut self, cx: &mut NetCx<'_, D>, handle: SocketHandle) -> Result<(), Error> {
		self.socket_or(handle)?.close(cx)
	}

	pub fn force_close(
		&mut self,
		cx: &mut NetCx<'_, D>,
		handle: SocketHandle,
	) -> Result<(), Error> {
		self.socket_or(handle)?.force_close(cx);
		Ok(())
	}

	pub fn send(
		&mut self,
		cx: &mut NetCx<'_, D>,
		handle: SocketHandle,
		data: &[u8],
	) -> Result<(), Error> {
		self.socket_or(handle)?.send_bytes(cx, data)
	}

	/// Route an inbound segment to its socket: connected sockets first,
	/// then listeners.
	pub(crate) fn handle_packet(
		&mut self,
		cx: &mut NetCx<'_, D>,
		source: Ipv4Addr,
		segment: &PacketBuffer<D>,
	) {
		let Ok(source_port) = segment.read_net16(0) else {
			return;
		};
		let Ok(local_port) = segment.read_net16(2) else {
			return;
		};

		for slot in self.slots.iter_mut().flatten() {
			if slot.matches_connection(source, source_port, local_port) {
				slot.handle_segment(cx, source, segment);
				return;
			}
		}
		for slot in self.slots.iter_mut().flatten() {
			if slot.matches_listener(local_port) {
				slot.handle_segment(cx, source, segment);
				return;
			}
		}
		debug!("TCP segment from {source}:{source_port} to port {local_port} matches no socket");
	}

	/// The shared 1 s tick: every registered socket re-examines its
	/// state.
	pub(crate) fn on_timer(&mut self, cx: &mut NetCx<'_, D>) {
		for slot in self.slots.iter_mut().flatten() {
			slot.check_state(cx);
		}
	}
}
