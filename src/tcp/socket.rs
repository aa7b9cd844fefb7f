//! The per-connection TCP state machine (RFC 793 subset).
//!
//! A [`Socket`] couples the connection state ([`SocketCore`]) with the
//! application's event handler. The core owns the sequence bookkeeping,
//! the retransmit stash and the send/receive windows; the wrapper runs
//! the state machine and fires upcalls. Handlers get the core and a
//! [`NetCx`] back, so they may send or close from inside an upcall;
//! such handler-initiated transitions do not recursively notify the
//! handler already on the stack.
//!
//! Only the MSS option is understood. There is no window scaling, no
//! selective acknowledgment, and at most one data segment in flight per
//! socket: after `send` the socket refuses further sends until the
//! segment is acknowledged (or retransmitted from the stash by the 1 s
//! timer).

use alloc::boxed::Box;
use core::net::Ipv4Addr;

use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::tcp::{HEADER_LEN, PROTOCOL, TcpFlags};
use crate::{Error, NetCx};

/// Give up on a peer after this many deliveries of the same segment.
const MAX_ATTEMPTS: u8 = 10;
/// How long to wait for an ACK before retransmitting.
const ACK_WAIT_MS: u32 = 1000;
/// 2 × MSL. The port pair is quarantined this long after both sides
/// close, so stray segments cannot bleed into a new connection.
const TIME_WAIT_MS: u32 = 240_000;

/// Connection states: the RFC 793 set plus two client-side pseudo-states
/// for name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
	Closed,
	Listen,
	SynSent,
	SynReceived,
	Established,
	FinWait1,
	FinWait2,
	CloseWait,
	Closing,
	LastAck,
	TimeWait,
	/// Waiting for DNS before the connect can start.
	Resolving,
	/// Name resolution failed.
	UnknownHost,
}

/// Application upcalls. All default to no-ops except `on_data_received`,
/// which every socket must answer: returning `false` refuses the payload
/// (the peer's sequence number is not acknowledged, so it retransmits).
pub trait SocketEvents<D: LinkDriver> {
	fn on_established(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>) {}

	fn on_data_received(
		&mut self,
		socket: &mut SocketCore<D>,
		cx: &mut NetCx<'_, D>,
		data: &PacketBuffer<D>,
	) -> bool;

	fn on_ready_to_send(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>) {}

	fn on_remote_closed(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>) {}

	fn on_local_closed(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>) {}

	fn on_closed(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>) {}

	fn on_reset(&mut self, _socket: &mut SocketCore<D>, _cx: &mut NetCx<'_, D>, _by_remote: bool) {
	}

	/// How many octets the application is prepared to accept; advertised
	/// (capped by the MSS) as the TCP window.
	fn application_window(&self) -> u16 {
		u16::MAX
	}
}

/// Accept-and-discard events, for probe sockets and tests.
impl<D: LinkDriver> SocketEvents<D> for () {
	fn on_data_received(
		&mut self,
		_socket: &mut SocketCore<D>,
		_cx: &mut NetCx<'_, D>,
		_data: &PacketBuffer<D>,
	) -> bool {
		true
	}
}

/// Connection state and the send/receive surface handed to upcalls.
pub struct SocketCore<D: LinkDriver> {
	state: TcpState,
	awaiting_ack: bool,
	listen_port: u16,
	local_port: u16,
	remote_ip: Ipv4Addr,
	remote_port: u16,
	remote_name: Option<heapless::String<255>>,
	connect_after_resolve: bool,
	local_seq: u32,
	remote_seq: u32,
	remote_mss: u16,
	remote_window: u16,
	/// When the current state was entered (ms).
	state_since: u32,
	timeout_ms: u32,
	attempts: u8,
	last_payload_len: u16,
	stash: Option<PacketBuffer<D>>,
	send_view: Option<PacketBuffer<D>>,
	recv_view: Option<PacketBuffer<D>>,
	app_window: u16,
	registered: bool,
}

/// A TCP connection endpoint: state machine plus application events.
pub struct Socket<D: LinkDriver> {
	core: SocketCore<D>,
	events: Box<dyn SocketEvents<D>>,
}

impl<D: LinkDriver> core::fmt::Debug for Socket<D> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Socket")
			.field("state", &self.core.state)
			.finish_non_exhaustive()
	}
}

impl<D: LinkDriver> SocketCore<D> {
	fn new(listen_port: u16) -> Self {
		Self {
			state: TcpState::Closed,
			awaiting_ack: false,
			listen_port,
			local_port: listen_port,
			remote_ip: Ipv4Addr::UNSPECIFIED,
			remote_port: 0,
			remote_name: None,
			connect_after_resolve: false,
			local_seq: 0,
			remote_seq: 0,
			remote_mss: 0,
			remote_window: 0,
			state_since: 0,
			timeout_ms: 0,
			attempts: 0,
			last_payload_len: 0,
			stash: None,
			send_view: None,
			recv_view: None,
			app_window: u16::MAX,
			registered: false,
		}
	}

	pub fn state(&self) -> TcpState {
		self.state
	}

	pub fn listen_port(&self) -> u16 {
		self.listen_port
	}

	pub fn local_port(&self) -> u16 {
		self.local_port
	}

	pub fn remote_ip(&self) -> Ipv4Addr {
		self.remote_ip
	}

	pub fn remote_port(&self) -> u16 {
		self.remote_port
	}

	/// When the current state was entered, in clock milliseconds.
	pub fn state_since(&self) -> u32 {
		self.state_since
	}

	/// Idle timeout: close (then force-close) the connection when its
	/// state goes unchanged this long. Zero disables the timeout.
	pub fn set_timeout(&mut self, timeout_ms: u32) {
		self.timeout_ms = timeout_ms;
	}

	/// A server socket listens; a client socket connects.
	pub fn is_server(&self) -> bool {
		self.listen_port > 0
	}

	pub fn is_client(&self) -> bool {
		self.listen_port == 0
	}

	/// Sends are possible only in ESTABLISHED with no segment in flight.
	pub fn ready_to_send(&self) -> bool {
		self.state == TcpState::Established && !self.awaiting_ack
	}

	/// Our side has sent its FIN (or never opened).
	pub fn local_closed(&self) -> bool {
		matches!(
			self.state,
			TcpState::FinWait1
				| TcpState::FinWait2
				| TcpState::Closing
				| TcpState::LastAck
				| TcpState::TimeWait
				| TcpState::Listen
				| TcpState::Closed
		)
	}

	/// The peer has sent its FIN (or never opened).
	pub fn remote_closed(&self) -> bool {
		matches!(
			self.state,
			TcpState::CloseWait
				| TcpState::LastAck
				| TcpState::Closing
				| TcpState::TimeWait
				| TcpState::Listen
				| TcpState::Closed
		)
	}

	/// The most data one `send` may carry: bounded by the stash slice,
	/// the peer's advertised window and (when known) the peer's MSS.
	pub fn max_send_payload(&self) -> u16 {
		let mut limit = self.stash.as_ref().map_or(0, PacketBuffer::size);
		if self.remote_window < limit {
			limit = self.remote_window;
		}
		if self.remote_mss > 0 && self.remote_mss < limit {
			limit = self.remote_mss;
		}
		limit
	}

	/// The send window: the transmit region past the Ethernet, IP and
	/// TCP headers. Write payload here, then call [`SocketCore::send`].
	pub fn send_buffer(&self) -> Option<PacketBuffer<D>> {
		self.send_view.clone()
	}

	/// Copy out of the most recently delivered payload view. Returns the
	/// number of octets read.
	pub fn read(&self, offset: u16, out: &mut [u8]) -> u16 {
		let Some(view) = &self.recv_view else {
			return 0;
		};
		let len = (out.len() as u16).min(view.size().saturating_sub(offset));
		match view.read(offset, &mut out[..len as usize]) {
			Ok(()) => len,
			Err(_) => 0,
		}
	}

	/// Transmit `length` octets already written to the send window. The
	/// payload is stashed first so the 1 s timer can retransmit it, and
	/// further sends are refused until the peer acknowledges.
	pub fn send(&mut self, cx: &mut NetCx<'_, D>, length: u16) -> Result<(), Error> {
		if length == 0 {
			return Ok(());
		}
		if !self.ready_to_send() {
			return Err(Error::InvalidState);
		}
		if length > self.max_send_payload() {
			return Err(Error::PayloadTooLarge);
		}

		self.attempts = 1;
		let send_view = self.send_view.clone().ok_or(Error::NotRegistered)?;
		let mut stash = self.stash.clone().ok_or(Error::NotRegistered)?;
		send_view.copy_to(&mut stash, 0, 0, length)?;

		self.send_segment(cx, TcpFlags::ACK | TcpFlags::PSH, length)?;
		self.state_since = cx.now;
		Ok(())
	}

	/// Copy `data` into the send window and transmit it.
	pub fn send_bytes(&mut self, cx: &mut NetCx<'_, D>, data: &[u8]) -> Result<(), Error> {
		let mut send_view = self.send_view.clone().ok_or(Error::NotRegistered)?;
		send_view.write(0, data)?;
		self.send(cx, data.len() as u16)
	}

	/// Politely close: send FIN and move toward the closed states. From
	/// a not-yet-synchronized state this degenerates to a force-close.
	/// No-op when our side is already closed.
	pub fn close(&mut self, cx: &mut NetCx<'_, D>) -> Result<(), Error> {
		if self.local_closed() {
			return Ok(());
		}
		match self.state {
			TcpState::Established | TcpState::SynReceived | TcpState::CloseWait => {}
			_ => {
				self.force_close(cx);
				return Ok(());
			}
		}

		self.send_segment(cx, TcpFlags::FIN | TcpFlags::ACK, 0)?;
		self.attempts = 1;
		let next = match self.state {
			TcpState::CloseWait => TcpState::LastAck,
			_ => TcpState::FinWait1,
		};
		self.set_state(cx.now, next);
		Ok(())
	}

	/// Reset the connection: emit RST on the current sequence pair and
	/// drop straight to CLOSED (LISTEN for a registered server),
	/// bypassing TIME_WAIT.
	pub fn force_close(&mut self, cx: &mut NetCx<'_, D>) {
		if self.state != TcpState::TimeWait {
			let _ = self.send_reset(cx, self.local_seq, self.remote_seq);
		}
		self.set_state(cx.now, self.closed_target());
	}

	/// CLOSED, unless this is a registered server socket, which returns
	/// to LISTEN instead.
	fn closed_target(&self) -> TcpState {
		if self.registered && self.is_server() {
			TcpState::Listen
		} else {
			TcpState::Closed
		}
	}

	fn set_state(&mut self, now: u32, state: TcpState) {
		self.state = state;
		self.state_since = now;
		if state != TcpState::Established {
			self.awaiting_ack = false;
		}
	}

	fn send_reset(&mut self, cx: &mut NetCx<'_, D>, seq: u32, ack: u32) -> Result<(), Error> {
		let control = if ack == self.remote_seq {
			TcpFlags::RST | TcpFlags::ACK
		} else {
			TcpFlags::RST
		};
		self.send_segment_raw(cx, control, 0, seq, ack)
	}

	fn send_segment(
		&mut self,
		cx: &mut NetCx<'_, D>,
		control: TcpFlags,
		length: u16,
	) -> Result<(), Error> {
		self.send_segment_raw(cx, control, length, 0, 0)
	}

	/// Build and transmit one segment. Sequence bookkeeping lives here:
	/// SYN and FIN consume one sequence number, data consumes its length
	/// and arms the retransmit state. RST segments carry caller-supplied
	/// sequence values; everything else uses the connection's.
	fn send_segment_raw(
		&mut self,
		cx: &mut NetCx<'_, D>,
		control: TcpFlags,
		length: u16,
		mut seq: u32,
		mut ack: u32,
	) -> Result<(), Error> {
		if !control.contains(TcpFlags::RST) {
			seq = self.local_seq;
			ack = self.remote_seq;
		}

		let mut buf = cx.ip.send_payload();
		buf.write_net16(0, self.local_port)?;
		buf.write_net16(2, self.remote_port)?;
		buf.write_net32(4, seq)?;
		buf.write_net32(8, ack)?;

		let mut option_len = 0u16;
		if control.contains(TcpFlags::SYN) {
			// Six header words: room for the MSS option.
			buf.write_u8(12, 6 << 4)?;
			buf.write_net16(20, 0x0204)?;
			buf.write_net16(22, cx.max_segment_size())?;
			self.local_seq = self.local_seq.wrapping_add(1);
			option_len = 4;
		} else if control.contains(TcpFlags::FIN) {
			buf.write_u8(12, 5 << 4)?;
			self.local_seq = self.local_seq.wrapping_add(1);
		} else {
			buf.write_u8(12, 5 << 4)?;
			if length > 0 {
				self.awaiting_ack = true;
				self.last_payload_len = length;
				self.local_seq = self.local_seq.wrapping_add(length as u32);
			}
		}

		buf.write_u8(13, control.bits())?;
		buf.write_net16(14, self.window_size(cx))?;
		buf.write_net16(18, 0)?;

		self.transmit(cx, length, option_len)
	}

	/// What we tell the peer it may send: the application's appetite,
	/// capped by what one segment can carry.
	fn window_size(&self, cx: &NetCx<'_, D>) -> u16 {
		self.app_window.min(cx.max_segment_size())
	}

	fn checksum(
		&self,
		cx: &NetCx<'_, D>,
		buf: &PacketBuffer<D>,
		len: u16,
	) -> Result<u16, Error> {
		let mut pseudo = PROTOCOL as u32 + len as u32;
		let local = cx.ip.address().octets();
		let remote = self.remote_ip.octets();
		pseudo += u16::from_be_bytes([local[0], local[1]]) as u32;
		pseudo += u16::from_be_bytes([local[2], local[3]]) as u32;
		pseudo += u16::from_be_bytes([remote[0], remote[1]]) as u32;
		pseudo += u16::from_be_bytes([remote[2], remote[3]]) as u32;
		buf.checksum(len, Some(16), pseudo)
	}

	/// Checksum the finished segment and hand it to IP. When the next
	/// hop's MAC is still unresolved the send "succeeds" without hitting
	/// the wire: IP has kicked ARP, and the state timer retransmits
	/// once the route exists.
	fn transmit(
		&mut self,
		cx: &mut NetCx<'_, D>,
		length: u16,
		option_len: u16,
	) -> Result<(), Error> {
		let len = length + HEADER_LEN + option_len;
		let mut buf = cx.ip.send_payload();
		let checksum = self.checksum(cx, &buf, len)?;
		buf.write_net16(16, checksum)?;

		match cx
			.ip
			.send_packet(cx.eth, cx.arp, cx.now, self.remote_ip, PROTOCOL, len)
		{
			Err(Error::RouteUnresolved) => Ok(()),
			other => other,
		}
	}

	/// Rewind the sequence number and send the stashed payload again.
	fn resend_data(&mut self, cx: &mut NetCx<'_, D>) -> Result<(), Error> {
		self.local_seq = self.local_seq.wrapping_sub(self.last_payload_len as u32);
		let stash = self.stash.clone().ok_or(Error::NotRegistered)?;
		let mut send_view = self.send_view.clone().ok_or(Error::NotRegistered)?;
		stash.copy_to(&mut send_view, 0, 0, self.last_payload_len)?;
		self.send_segment(cx, TcpFlags::ACK | TcpFlags::PSH, self.last_payload_len)
	}

	fn matches_connection(&self, source: Ipv4Addr, source_port: u16, local_port: u16) -> bool {
		if self.is_server() && self.state == TcpState::Listen {
			return false;
		}
		if self.state == TcpState::Closed {
			return false;
		}
		self.remote_port == source_port
			&& self.local_port == local_port
			&& self.remote_ip == source
	}

	fn matches_listener(&self, local_port: u16) -> bool {
		self.is_server() && self.state == TcpState::Listen && self.listen_port == local_port
	}

	/// Pull the peer's MSS out of a SYN whose data offset leaves room
	/// for exactly one option word.
	fn parse_mss(&mut self, segment: &PacketBuffer<D>) -> Result<(), Error> {
		let header_words = segment.read_u8(12)? >> 4;
		if header_words == 6 {
			let option = segment.read_net32(20)?;
			if option >> 16 == 0x0204 {
				self.remote_mss = option as u16;
			}
		}
		Ok(())
	}
}

impl<D: LinkDriver> Socket<D> {
	/// A client socket for a known peer address.
	pub fn client(remote_ip: Ipv4Addr, remote_port: u16, events: Box<dyn SocketEvents<D>>) -> Self {
		let mut core = SocketCore::new(0);
		core.remote_ip = remote_ip;
		core.remote_port = remote_port;
		Self { core, events }
	}

	/// A client socket for a named peer; the address is resolved through
	/// DNS when `connect` runs.
	pub fn client_named(
		server: &str,
		remote_port: u16,
		events: Box<dyn SocketEvents<D>>,
	) -> Result<Self, Error> {
		let name = heapless::String::try_from(server).map_err(|_| Error::NameTooLong)?;
		let mut core = SocketCore::new(0);
		core.remote_name = Some(name);
		core.remote_port = remote_port;
		Ok(Self { core, events })
	}

	/// A server socket; enters LISTEN when registered.
	pub fn server(listen_port: u16, events: Box<dyn SocketEvents<D>>) -> Self {
		Self {
			core: SocketCore::new(listen_port),
			events,
		}
	}

	pub fn core(&self) -> &SocketCore<D> {
		&self.core
	}

	pub fn core_mut(&mut self) -> &mut SocketCore<D> {
		&mut self.core
	}

	pub fn events_mut(&mut self) -> &mut dyn SocketEvents<D> {
		&mut *self.events
	}

	pub(crate) fn attach(
		&mut self,
		stash: PacketBuffer<D>,
		send_view: PacketBuffer<D>,
		isn: u32,
		now: u32,
	) {
		self.core.stash = Some(stash);
		self.core.send_view = Some(send_view);
		self.core.local_seq = isn;
		self.core.registered = true;
		if self.core.is_server() {
			self.core.set_state(now, TcpState::Listen);
		}
	}

	pub(crate) fn detach(&mut self) {
		self.core.registered = false;
		self.core.stash = None;
		self.core.send_view = None;
		self.core.recv_view = None;
		self.core.state = TcpState::Closed;
		self.core.awaiting_ack = false;
		self.core.connect_after_resolve = false;
	}

	pub(crate) fn matches_connection(
		&self,
		source: Ipv4Addr,
		source_port: u16,
		local_port: u16,
	) -> bool {
		self.core.matches_connection(source, source_port, local_port)
	}

	pub(crate) fn matches_listener(&self, local_port: u16) -> bool {
		self.core.matches_listener(local_port)
	}

	/// Transition helper that also fires the events tied to a state:
	/// entering CLOSED reports `on_closed` (except when leaving the
	/// resolver pseudo-state), entering ESTABLISHED reports
	/// `on_established` and the first `on_ready_to_send`.
	fn set_state(&mut self, cx: &mut NetCx<'_, D>, state: TcpState) {
		let prior = self.core.state;
		self.core.set_state(cx.now, state);

		if state == TcpState::Closed && prior != TcpState::Resolving {
			self.events.on_closed(&mut self.core, cx);
		}
		if state == TcpState::Established {
			self.events.on_established(&mut self.core, cx);
			self.events.on_ready_to_send(&mut self.core, cx);
		}
	}

	fn enter_closed(&mut self, cx: &mut NetCx<'_, D>) {
		self.set_state(cx, self.core.closed_target());
	}

	/// Resolve the peer's hostname, if any. `false` means resolution is
	/// impossible right now (wrong state, or DNS failed and the socket
	/// moved to UNKNOWN_HOST).
	fn resolve_ip(&mut self, cx: &mut NetCx<'_, D>) -> bool {
		if !matches!(
			self.core.state,
			TcpState::Resolving | TcpState::Closed | TcpState::UnknownHost
		) {
			return false;
		}
		let Some(name) = self.core.remote_name.clone() else {
			return true;
		};

		let (addr, status) =
			cx.dns
				.resolve(cx.udp, cx.ip, cx.eth, cx.arp, cx.now, name.as_str(), false);
		if status.code != crate::dns::ResponseCode::NoError {
			warn!("cannot resolve {name}: {:?}", status.code);
			self.core.set_state(cx.now, TcpState::UnknownHost);
			return false;
		}

		match addr {
			Some(addr) => {
				self.core.remote_ip = addr;
				if self.core.state == TcpState::Resolving {
					self.enter_closed(cx);
					if self.core.connect_after_resolve {
						self.core.connect_after_resolve = false;
						return self.connect(cx).is_ok();
					}
				}
				true
			}
			None => {
				self.core.set_state(cx.now, TcpState::Resolving);
				true
			}
		}
	}

	/// Client connect: allocate an ephemeral port and send the SYN. A
	/// hostname socket may first park in RESOLVING and finish the
	/// connect from the state timer once DNS answers.
	pub(crate) fn connect(&mut self, cx: &mut NetCx<'_, D>) -> Result<(), Error> {
		self.core.app_window = self.events.application_window();

		if !self.resolve_ip(cx) {
			return Err(if self.core.state == TcpState::UnknownHost {
				Error::UnknownHost
			} else {
				Error::InvalidState
			});
		}
		if self.core.state == TcpState::Resolving {
			self.core.connect_after_resolve = true;
			return Ok(());
		}
		if self.core.state != TcpState::Closed {
			return Err(Error::InvalidState);
		}
		if !self.core.registered {
			return Err(Error::NotRegistered);
		}

		self.core.local_port = cx.ip.ephemeral_port();
		self.core.send_segment(cx, TcpFlags::SYN, 0)?;
		self.core.attempts = 1;
		self.set_state(cx, TcpState::SynSent);
		Ok(())
	}

	pub(crate) fn close(&mut self, cx: &mut NetCx<'_, D>) -> Result<(), Error> {
		self.core.app_window = self.events.application_window();
		if self.core.local_closed() {
			return Ok(());
		}
		match self.core.state {
			TcpState::Established | TcpState::SynReceived | TcpState::CloseWait => {
				self.core.close(cx)?;
				self.events.on_local_closed(&mut self.core, cx);
				Ok(())
			}
			// Not synchronized yet: nothing to wave goodbye to.
			_ => {
				self.force_close(cx);
				Ok(())
			}
		}
	}

	pub(crate) fn force_close(&mut self, cx: &mut NetCx<'_, D>) {
		self.core.app_window = self.events.application_window();
		if self.core.state != TcpState::TimeWait {
			let _ = self
				.core
				.send_reset(cx, self.core.local_seq, self.core.remote_seq);
			self.events.on_reset(&mut self.core, cx, false);
		}
		self.enter_closed(cx);
	}

	pub(crate) fn send_bytes(&mut self, cx: &mut NetCx<'_, D>, data: &[u8]) -> Result<(), Error> {
		self.core.app_window = self.events.application_window();
		self.core.send_bytes(cx, data)
	}

	/// The shared 1 s tick: idle timeout, DNS progress, retransmission
	/// with exponential give-up, and TIME_WAIT expiry.
	pub(crate) fn check_state(&mut self, cx: &mut NetCx<'_, D>) {
		self.core.app_window = self.events.application_window();

		match self.core.state {
			TcpState::Closed | TcpState::Listen => return,
			_ => {}
		}

		let elapsed = cx.now.wrapping_sub(self.core.state_since);

		if self.core.timeout_ms > 0 && elapsed > self.core.timeout_ms {
			if !self.core.local_closed() {
				let _ = self.close(cx);
				return;
			}
			self.force_close(cx);
			return;
		}

		if self.core.state == TcpState::Established && !self.core.awaiting_ack {
			return;
		}

		if self.core.state == TcpState::Resolving {
			self.resolve_ip(cx);
			return;
		}

		if elapsed < ACK_WAIT_MS {
			return;
		}

		match self.core.state {
			TcpState::Established => {
				// AWAITING_ACK is set or we would have returned above.
				if self.core.attempts >= MAX_ATTEMPTS {
					self.force_close(cx);
					return;
				}
				self.core.attempts += 1;
				debug!(
					"retransmitting {} octets (attempt {})",
					self.core.last_payload_len, self.core.attempts
				);
				if self.core.resend_data(cx).is_err() {
					self.force_close(cx);
				}
				return;
			}
			TcpState::SynSent => {
				self.retransmit_control(cx, TcpFlags::SYN);
				return;
			}
			TcpState::SynReceived => {
				self.retransmit_control(cx, TcpFlags::SYN | TcpFlags::ACK);
				return;
			}
			TcpState::FinWait1 | TcpState::Closing => {
				self.retransmit_control(cx, TcpFlags::FIN | TcpFlags::ACK);
				return;
			}
			_ => {}
		}

		if elapsed < TIME_WAIT_MS {
			return;
		}
		if self.core.state == TcpState::TimeWait {
			self.enter_closed(cx);
		}
	}

	/// Resend a SYN or FIN control segment, rewinding the sequence
	/// number it consumed the first time.
	fn retransmit_control(&mut self, cx: &mut NetCx<'_, D>, control: TcpFlags) {
		if self.core.attempts >= MAX_ATTEMPTS {
			self.force_close(cx);
			return;
		}
		self.core.attempts += 1;
		self.core.local_seq = self.core.local_seq.wrapping_sub(1);
		let _ = self.core.send_segment(cx, control, 0);
	}

	pub(crate) fn handle_segment(
		&mut self,
		cx: &mut NetCx<'_, D>,
		source: Ipv4Addr,
		segment: &PacketBuffer<D>,
	) {
		self.core.app_window = self.events.application_window();
		if let Err(err) = self.segment(cx, source, segment) {
			debug!("dropping TCP segment: {err}");
		}
	}

	/// RFC 793 §3.9, distilled to this stack's subset.
	fn segment(
		&mut self,
		cx: &mut NetCx<'_, D>,
		source: Ipv4Addr,
		segment: &PacketBuffer<D>,
	) -> Result<(), Error> {
		let control = TcpFlags::from_bits_truncate(segment.read_u8(13)?);
		let ack = segment.read_net32(8)?;
		let seq = segment.read_net32(4)?;

		// An empty delivery view until this segment proves to carry data.
		self.core.recv_view = Some(PacketBuffer::view(segment, segment.size(), 0));

		// The pseudo-header needs the peer's address, and a listener only
		// learns its peer from the frame itself. Capturing the port too
		// routes the stray-segment reset back to whoever sent it.
		if self.core.state == TcpState::Listen {
			self.core.remote_ip = source;
			self.core.remote_port = segment.read_net16(0)?;
		}

		let computed = self.core.checksum(cx, segment, segment.size())?;
		if segment.read_net16(16)? != computed {
			debug!("TCP checksum mismatch from {source}, dropping");
			return Ok(());
		}
		self.core.remote_window = segment.read_net16(14)?;

		let state = self.core.state;
		let seg_len = segment.size() as u32;

		// RFC 793 reset generation, case 1: nothing should arrive on a
		// closed connection, and a listener expects only SYN.
		let listen_junk = state == TcpState::Listen
			&& !control.contains(TcpFlags::SYN)
			&& !control.contains(TcpFlags::RST);
		if (state == TcpState::Closed && !control.contains(TcpFlags::RST)) || listen_junk {
			if control.contains(TcpFlags::ACK) {
				self.send_reset_event(cx, ack, 0)?;
			} else {
				self.send_reset_event(cx, 0, seq.wrapping_add(seg_len))?;
			}
			return Ok(());
		}

		// Case 2: a not-yet-synchronized socket must reset anything that
		// acknowledges data we never sent.
		if matches!(
			state,
			TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
		) && control.contains(TcpFlags::ACK)
			&& ack > self.core.local_seq
		{
			self.send_reset_event(cx, ack, 0)?;
			return Ok(());
		}

		// Case 3: in a synchronized state an unacceptable segment only
		// earns a bare ACK announcing where we stand.
		if matches!(
			state,
			TcpState::Established
				| TcpState::FinWait1
				| TcpState::FinWait2
				| TcpState::CloseWait
				| TcpState::Closing
				| TcpState::LastAck
				| TcpState::TimeWait
		) {
			if control.contains(TcpFlags::ACK) && ack > self.core.local_seq {
				self.core.send_segment(cx, TcpFlags::ACK, 0)?;
				return Ok(());
			}
			if seq > self.core.remote_seq {
				self.core.send_segment(cx, TcpFlags::ACK, 0)?;
				return Ok(());
			}
		}

		if control.contains(TcpFlags::RST) {
			if state == TcpState::SynSent && ack == self.core.local_seq {
				self.enter_closed(cx);
				self.events.on_reset(&mut self.core, cx, true);
			} else if seq == self.core.remote_seq {
				match state {
					TcpState::Listen => {}
					TcpState::SynReceived => self.enter_closed(cx),
					_ => {
						self.enter_closed(cx);
						self.events.on_reset(&mut self.core, cx, true);
					}
				}
			}
			return Ok(());
		}

		// A connection attempt: pure SYN on a listener. The peer's address
		// and port were captured above.
		if state == TcpState::Listen && control == TcpFlags::SYN {
			self.core.remote_seq = seq.wrapping_add(1);
			self.core.parse_mss(segment)?;
			if self
				.core
				.send_segment(cx, TcpFlags::SYN | TcpFlags::ACK, 0)
				.is_ok()
			{
				self.core.set_state(cx.now, TcpState::SynReceived);
				self.core.attempts = 1;
			}
			return Ok(());
		}

		// Simultaneous open: our SYN crossed the peer's.
		if state == TcpState::SynSent && control == TcpFlags::SYN {
			self.core.remote_seq = seq.wrapping_add(1);
			self.core.parse_mss(segment)?;
			self.core.set_state(cx.now, TcpState::SynReceived);
			self.core.send_segment(cx, TcpFlags::ACK, 0)?;
			return Ok(());
		}

		// The peer accepted our connect.
		if state == TcpState::SynSent
			&& control == (TcpFlags::SYN | TcpFlags::ACK)
			&& ack == self.core.local_seq
		{
			self.core.remote_seq = seq.wrapping_add(1);
			self.core.parse_mss(segment)?;
			self.core.send_segment(cx, TcpFlags::ACK, 0)?;
			self.set_state(cx, TcpState::Established);
			return Ok(());
		}

		// The data-capable states: payload and FIN processing.
		if matches!(
			state,
			TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
		) {
			if !control.contains(TcpFlags::ACK) {
				return Ok(());
			}

			// Noted now, applied after processing so that the ready-to-
			// send upcall is the last thing the application hears.
			let clear_ack = ack == self.core.local_seq && self.core.awaiting_ack;

			if seq != self.core.remote_seq {
				// Out of order (or a duplicate): re-announce our position.
				self.core.send_segment(cx, TcpFlags::ACK, 0)?;
				return Ok(());
			}

			let header_len = (segment.read_u8(12)? >> 4) as u16 * 4;
			let payload_len = segment.size().saturating_sub(header_len);

			let mut accepted = true;
			if payload_len > 0 {
				let view = PacketBuffer::view(segment, header_len, payload_len);
				self.core.recv_view = Some(view.clone());
				accepted = self.events.on_data_received(&mut self.core, cx, &view);
				if accepted {
					// The queue just shrank; advertise what is left.
					self.core.app_window = self.events.application_window();
					self.core.remote_seq = seq.wrapping_add(payload_len as u32);
					self.core.state_since = cx.now;
					self.core.send_segment(cx, TcpFlags::ACK, 0)?;
				}
			}

			// A FIN only counts once the bytes in front of it have been
			// consumed; a refused payload leaves the whole segment for the
			// peer to retransmit.
			if control.contains(TcpFlags::FIN) && accepted {
				self.core.remote_seq = self.core.remote_seq.wrapping_add(1);
				if payload_len == 0 {
					self.core.send_segment(cx, TcpFlags::ACK, 0)?;
				}
				match self.core.state {
					TcpState::FinWait1 => {
						if ack == self.core.local_seq {
							self.core.set_state(cx.now, TcpState::TimeWait);
						} else {
							self.core.set_state(cx.now, TcpState::Closing);
						}
					}
					TcpState::FinWait2 => self.core.set_state(cx.now, TcpState::TimeWait),
					TcpState::Established => self.core.set_state(cx.now, TcpState::CloseWait),
					_ => {}
				}
				self.events.on_remote_closed(&mut self.core, cx);
			} else if self.core.state == TcpState::FinWait1 && ack == self.core.local_seq {
				// Our FIN is acknowledged; the peer is not done yet.
				self.core.set_state(cx.now, TcpState::FinWait2);
			}

			if clear_ack {
				self.core.awaiting_ack = false;
				self.events.on_ready_to_send(&mut self.core, cx);
			}
			return Ok(());
		}

		// Remaining states advance on a matching ACK alone.
		if control.contains(TcpFlags::ACK) && ack == self.core.local_seq {
			match state {
				TcpState::SynReceived => self.set_state(cx, TcpState::Established),
				TcpState::Closing => self.core.set_state(cx.now, TcpState::TimeWait),
				TcpState::LastAck => self.enter_closed(cx),
				_ => {}
			}
			return Ok(());
		}

		// Nothing else is acceptable here.
		self.force_close(cx);
		Ok(())
	}

	fn send_reset_event(
		&mut self,
		cx: &mut NetCx<'_, D>,
		seq: u32,
		ack: u32,
	) -> Result<(), Error> {
		self.core.send_reset(cx, seq, ack)?;
		self.events.on_reset(&mut self.core, cx, false);
		Ok(())
	}
}
