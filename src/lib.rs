//! A cooperative TCP/IP stack for small microcontrollers paired with a
//! memory-mapped Ethernet controller (ENC28J60-class parts with a few KiB
//! of on-chip packet SRAM behind SPI).
//!
//! The stack is single-threaded: a host program calls
//! [`Stack::process_frame`] in its main loop, and everything (frame
//! demultiplexing, ARP probes, DNS retries, TCP retransmission and
//! timeouts) happens inside that call. There is no allocation after
//! construction; all registries are sized once from [`Config`].
//!
//! Protocol layers are built leaves-first: the link driver contract
//! ([`LinkDriver`]), a buffer abstraction over host RAM and controller
//! SRAM ([`PacketBuffer`]), the Ethernet frame demultiplexer with its
//! relative-delay timers, then ARP, IPv4, UDP, DNS and TCP.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;
use core::net::Ipv4Addr;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{Rng, SeedableRng};

pub mod arp;
pub mod buffer;
pub mod device;
pub mod dns;
pub mod ether;
pub mod ip;
pub mod tcp;
pub mod time;
pub mod udp;

pub use crate::arp::{ArpResolver, MacLookup};
pub use crate::buffer::PacketBuffer;
pub use crate::device::{DevHandle, LinkDriver, Region, RxFrame};
pub use crate::dns::{DnsResolver, DnsStatus, LookupState, ResponseCode};
pub use crate::ether::{EtherControl, EtherProtocol, MacAddr, TimerId, TimerOwner};
pub use crate::ip::{IpProtocol, Ipv4Layer};
pub use crate::tcp::buffered::BufferedReceiver;
pub use crate::tcp::socket::{Socket, SocketCore, SocketEvents, TcpState};
pub use crate::tcp::{SocketHandle, TcpFlags, TcpLayer};
pub use crate::time::TimeSource;
pub use crate::udp::{DatagramReceiver, UdpLayer};

use crate::udp::UdpListener;

/// Errors surfaced to callers of the stack.
///
/// Inbound malformed traffic never produces an error; it is silently
/// discarded per protocol. Retries for ARP, DNS and TCP are driven by
/// the owning component's timer, so a transient [`Error::RouteUnresolved`]
/// usually heals itself a tick later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// A fixed-capacity registry or table has no free slot.
	#[error("registry or table is full")]
	CapacityExhausted,
	/// An offset or length fell outside a buffer window.
	#[error("offset or length outside the buffer bounds")]
	OutOfBounds,
	/// The payload does not fit the transmit region.
	#[error("payload too large for the transmit buffer")]
	PayloadTooLarge,
	/// The next hop's MAC address is not resolved yet.
	#[error("no route to host yet")]
	RouteUnresolved,
	/// The operation is not valid in the socket's current state.
	#[error("operation not valid in the current state")]
	InvalidState,
	/// The socket is not registered with the TCP layer, or the handle
	/// does not name a registered socket.
	#[error("socket is not registered")]
	NotRegistered,
	/// A hostname exceeded the 255-octet DNS limit.
	#[error("hostname exceeds the DNS length limit")]
	NameTooLong,
	/// The peer's hostname could not be resolved.
	#[error("host name resolution failed")]
	UnknownHost,
}

/// Where the TCP layer's shared outbound (retransmit stash) buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
	/// Use the link device's spare stash region. Costs no host RAM, and
	/// stash copies ride the controller's internal DMA.
	ControllerStash,
	/// Allocate a host-RAM buffer of the given size at construction.
	Ram(u16),
}

/// Construction-time configuration. No environment variables, no CLI.
#[derive(Debug, Clone)]
pub struct Config {
	pub ip: Ipv4Addr,
	pub gateway: Ipv4Addr,
	pub subnet_mask: Ipv4Addr,
	/// Seed for the stack's deterministic entropy stream (initial TCP
	/// sequence numbers, ephemeral port counter).
	pub seed: u64,
	pub arp_entries: u8,
	pub dns_primary: Ipv4Addr,
	pub dns_backup: Option<Ipv4Addr>,
	pub dns_cache_entries: u8,
	pub udp_listeners: u8,
	pub tcp_sockets: u8,
	pub tcp_outbound: Outbound,
	/// EtherType handler slots in the frame demultiplexer.
	pub protocol_slots: u8,
	/// Relative-delay timer slots in the frame demultiplexer.
	pub timer_slots: u8,
}

impl Config {
	/// A configuration with usual defaults: the gateway doubles as the
	/// DNS resolver, four slots in every table, and the TCP stash in the
	/// controller's spare memory.
	pub fn new(ip: Ipv4Addr, gateway: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
		Self {
			ip,
			gateway,
			subnet_mask,
			seed: 0,
			arp_entries: 4,
			dns_primary: gateway,
			dns_backup: None,
			dns_cache_entries: 4,
			udp_listeners: 4,
			tcp_sockets: 4,
			tcp_outbound: Outbound::ControllerStash,
			protocol_slots: 2,
			timer_slots: 3,
		}
	}
}

/// Mutable access to every layer below TCP, bundled so that socket event
/// handlers can transmit from inside an upcall.
pub struct NetCx<'a, D: LinkDriver> {
	pub(crate) eth: &'a mut EtherControl<D>,
	pub(crate) arp: &'a mut ArpResolver,
	pub(crate) ip: &'a mut Ipv4Layer<D>,
	pub(crate) udp: &'a mut UdpLayer<D>,
	pub(crate) dns: &'a mut DnsResolver,
	pub(crate) now: u32,
}

impl<D: LinkDriver> NetCx<'_, D> {
	/// The millisecond clock value this dispatch was entered with.
	pub fn now(&self) -> u32 {
		self.now
	}

	/// The largest TCP payload we can accept in one segment: the IP
	/// receive payload less the TCP header and a 4-octet margin for one
	/// option word.
	pub(crate) fn max_segment_size(&self) -> u16 {
		self.ip.max_receive_payload(self.eth) - tcp::HEADER_LEN - 4
	}
}

struct Layers<D: LinkDriver> {
	eth: EtherControl<D>,
	arp: ArpResolver,
	ip: Ipv4Layer<D>,
	udp: UdpLayer<D>,
	dns: DnsResolver,
}

impl<D: LinkDriver> Layers<D> {
	fn cx(&mut self, now: u32) -> NetCx<'_, D> {
		NetCx {
			eth: &mut self.eth,
			arp: &mut self.arp,
			ip: &mut self.ip,
			udp: &mut self.udp,
			dns: &mut self.dns,
			now,
		}
	}
}

/// The assembled protocol stack.
///
/// Owns the link driver (behind a shared handle that buffer views also
/// hold), the protocol layers, the millisecond clock and the entropy
/// stream. All progress happens inside [`Stack::process_frame`].
pub struct Stack<D: LinkDriver> {
	dev: DevHandle<D>,
	clock: Box<dyn TimeSource>,
	rng: ChaCha20Rng,
	layers: Layers<D>,
	tcp: TcpLayer<D>,
}

impl<D: LinkDriver> Stack<D> {
	pub fn new(driver: D, clock: Box<dyn TimeSource>, config: Config) -> Result<Self, Error> {
		let dev = Rc::new(RefCell::new(driver));
		let mut rng = ChaCha20Rng::seed_from_u64(config.seed);

		let mut eth = EtherControl::new(dev.clone(), config.protocol_slots, config.timer_slots);
		let arp = ArpResolver::new(&mut eth, config.ip, config.arp_entries)?;
		let mut ip = Ipv4Layer::new(
			&mut eth,
			config.ip,
			config.gateway,
			config.subnet_mask,
			rng.next_u32() as u16,
		)?;
		let mut udp = UdpLayer::new(&mut ip, config.udp_listeners)?;
		let dns = DnsResolver::new(
			&mut udp,
			config.dns_primary,
			config.dns_backup,
			config.dns_cache_entries,
		)?;

		let outbound = match config.tcp_outbound {
			Outbound::ControllerStash => {
				let region = dev.borrow().stash_region();
				PacketBuffer::controller(dev.clone(), region, 0)
			}
			Outbound::Ram(len) => PacketBuffer::memory(len),
		};
		let tcp = TcpLayer::new(&mut ip, config.tcp_sockets, &outbound)?;

		info!(
			"stack up: {} via {} mask {}, mac {}",
			config.ip,
			config.gateway,
			config.subnet_mask,
			eth.mac_address()
		);

		Ok(Self {
			dev,
			clock,
			rng,
			layers: Layers {
				eth,
				arp,
				ip,
				udp,
				dns,
			},
			tcp,
		})
	}

	/// Pull the next received frame (if any) through the protocol stack,
	/// then run every due timer. Call this from the host's main loop.
	pub fn process_frame(&mut self) {
		let now = self.clock.now_ms();

		match self.layers.eth.receive() {
			Ok(Some((ether_type, frame))) => match self.layers.eth.handler_for(ether_type) {
				Some(EtherProtocol::Arp) => {
					self.layers.arp.handle_payload(&mut self.layers.eth, &frame);
				}
				Some(EtherProtocol::Ipv4) => self.handle_ip(now, &frame),
				None => debug!("no handler for EtherType {ether_type:#06x}"),
			},
			Ok(None) => {}
			Err(err) => debug!("receive failed: {err}"),
		}

		self.process_timers(now);
	}

	fn handle_ip(&mut self, now: u32, frame: &PacketBuffer<D>) {
		let Some((handler, source, packet)) = self.layers.ip.handle_payload(frame) else {
			return;
		};
		match handler {
			IpProtocol::Udp => {
				let local = self.layers.ip.address();
				let Some((dst_port, src_port, payload)) =
					self.layers.udp.handle_packet(local, source, &packet)
				else {
					return;
				};
				match self.layers.udp.listener_for(dst_port) {
					Some(UdpListener::Dns) => {
						self.layers.dns.handle_datagram(now, source, &payload);
					}
					Some(UdpListener::Handler(receiver)) => {
						receiver.handle_datagram(source, src_port, &payload);
					}
					None => debug!("datagram for port {dst_port} has no listener"),
				}
			}
			IpProtocol::Tcp => {
				let mut cx = self.layers.cx(now);
				self.tcp.handle_packet(&mut cx, source, &packet);
			}
		}
	}

	fn process_timers(&mut self, now: u32) {
		// Slot state is re-read per index so that a handler may register
		// or unregister timers while the sweep is running.
		for index in 0..self.layers.eth.timer_slots() {
			let Some(owner) = self.layers.eth.take_due(index, now) else {
				continue;
			};
			match owner {
				TimerOwner::Arp => self.layers.arp.on_timer(&mut self.layers.eth, now),
				TimerOwner::Dns => {
					let layers = &mut self.layers;
					layers.dns.on_timer(
						&mut layers.udp,
						&mut layers.ip,
						&mut layers.eth,
						&mut layers.arp,
						now,
					);
				}
				TimerOwner::Tcp => {
					let mut cx = self.layers.cx(now);
					self.tcp.on_timer(&mut cx);
				}
			}
		}
	}

	/// Resolve `name` to an IPv4 address via the DNS cache, issuing a
	/// query on a miss (or when `force` is set). Non-blocking: a `None`
	/// address with a pending status means "ask again later".
	pub fn resolve(&mut self, name: &str, force: bool) -> (Option<Ipv4Addr>, DnsStatus) {
		let now = self.clock.now_ms();
		let layers = &mut self.layers;
		layers.dns.resolve(
			&mut layers.udp,
			&mut layers.ip,
			&mut layers.eth,
			&mut layers.arp,
			now,
			name,
			force,
		)
	}

	/// Start resolving `ip` on the local subnet. Succeeds immediately if
	/// a lookup is already in flight.
	pub fn request_mac(&mut self, ip: Ipv4Addr) -> Result<(), Error> {
		let now = self.clock.now_ms();
		self.layers
			.arp
			.request_mac_address(&mut self.layers.eth, now, ip)
	}

	/// Non-blocking ARP table lookup.
	pub fn lookup_mac(&self, ip: Ipv4Addr) -> MacLookup {
		self.layers.arp.lookup(ip)
	}

	/// A view of the UDP send payload window (past all headers). Write
	/// a datagram here, then call [`Stack::send_datagram`].
	pub fn udp_payload(&self) -> PacketBuffer<D> {
		self.layers.udp.send_payload()
	}

	/// Transmit `payload_len` bytes already present in the UDP payload
	/// window.
	pub fn send_datagram(
		&mut self,
		dst: Ipv4Addr,
		dst_port: u16,
		src_port: u16,
		payload_len: u16,
	) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let layers = &mut self.layers;
		layers.udp.send_datagram(
			&mut layers.ip,
			&mut layers.eth,
			&mut layers.arp,
			now,
			dst,
			dst_port,
			src_port,
			payload_len,
		)
	}

	/// Copy `payload` into the UDP send window and transmit it.
	pub fn send_datagram_with(
		&mut self,
		dst: Ipv4Addr,
		dst_port: u16,
		src_port: u16,
		payload: &[u8],
	) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let layers = &mut self.layers;
		layers.udp.send_datagram_with_payload(
			&mut layers.ip,
			&mut layers.eth,
			&mut layers.arp,
			now,
			dst,
			dst_port,
			src_port,
			payload,
		)
	}

	pub fn register_udp_listener(
		&mut self,
		port: u16,
		receiver: Box<dyn DatagramReceiver<D>>,
	) -> Result<(), Error> {
		self.layers.udp.register_listener(port, receiver)
	}

	pub fn unregister_udp_listener(&mut self, port: u16) {
		self.layers.udp.unregister_listener(port);
	}

	/// Register a socket with the TCP layer. On success the socket gets
	/// its retransmit stash and send window and (for servers) enters
	/// LISTEN. On failure the socket is handed back untouched.
	pub fn add_socket(&mut self, socket: Socket<D>) -> Result<SocketHandle, (Socket<D>, Error)> {
		let now = self.clock.now_ms();
		let isn = self.rng.next_u32() % 1000;
		self.tcp
			.register(&mut self.layers.eth, &self.layers.ip, now, isn, socket)
	}

	/// Unregister a socket, attempting a clean shutdown first, and hand
	/// it back to the caller.
	pub fn remove_socket(&mut self, handle: SocketHandle) -> Option<Socket<D>> {
		let now = self.clock.now_ms();
		let mut cx = self.layers.cx(now);
		self.tcp.unregister(&mut cx, handle)
	}

	/// Initiate a client connection (spec'd three-way handshake). For a
	/// hostname socket this may first transition to RESOLVING and finish
	/// the connect once DNS answers.
	pub fn connect(&mut self, handle: SocketHandle) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let mut cx = self.layers.cx(now);
		self.tcp.connect(&mut cx, handle)
	}

	/// Politely close the connection (FIN handshake).
	pub fn close(&mut self, handle: SocketHandle) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let mut cx = self.layers.cx(now);
		self.tcp.close(&mut cx, handle)
	}

	/// Reset the connection and return to CLOSED (or LISTEN for a server
	/// socket), bypassing TIME_WAIT.
	pub fn force_close(&mut self, handle: SocketHandle) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let mut cx = self.layers.cx(now);
		self.tcp.force_close(&mut cx, handle)
	}

	/// Copy `data` into the socket's send window and transmit it as one
	/// segment. Refused while a previous segment awaits its ACK.
	pub fn send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<(), Error> {
		let now = self.clock.now_ms();
		let mut cx = self.layers.cx(now);
		self.tcp.send(&mut cx, handle, data)
	}

	pub fn socket(&self, handle: SocketHandle) -> Option<&Socket<D>> {
		self.tcp.socket(handle)
	}

	pub fn socket_mut(&mut self, handle: SocketHandle) -> Option<&mut Socket<D>> {
		self.tcp.socket_mut(handle)
	}

	pub fn mac_address(&self) -> MacAddr {
		self.layers.eth.mac_address()
	}

	pub fn ip_address(&self) -> Ipv4Addr {
		self.layers.ip.address()
	}

	pub fn is_link_up(&mut self) -> bool {
		self.dev.borrow_mut().is_link_up()
	}

	pub fn power_down(&mut self) {
		self.dev.borrow_mut().power_down();
	}

	pub fn power_up(&mut self) {
		self.dev.borrow_mut().power_up();
	}

	/// The shared handle to the link driver.
	pub fn device(&self) -> DevHandle<D> {
		self.dev.clone()
	}
}
