//! A buffered receive adapter: queue inbound payloads, let the
//! application drain them at its own pace.
//!
//! Backpressure falls out of the event contract: when a payload no
//! longer fits, `on_data_received` returns `false`, the peer's sequence
//! number is not acknowledged, and the segment comes back later. The
//! advertised window tracks the queue's free space, so a well-behaved
//! peer rarely hits that path.

use crate::buffer::PacketBuffer;
use crate::device::LinkDriver;
use crate::tcp::socket::{SocketCore, SocketEvents};
use crate::NetCx;

/// FIFO byte queue implementing [`SocketEvents`].
pub struct BufferedReceiver {
	buf: alloc::boxed::Box<[u8]>,
	len: usize,
}

impl BufferedReceiver {
	pub fn new(capacity: u16) -> Self {
		Self {
			buf: alloc::vec![0u8; capacity as usize].into_boxed_slice(),
			len: 0,
		}
	}

	/// Octets queued and not yet read.
	pub fn available(&self) -> u16 {
		self.len as u16
	}

	/// Drain up to `out.len()` octets from the front of the queue.
	pub fn read(&mut self, out: &mut [u8]) -> u16 {
		let n = out.len().min(self.len);
		out[..n].copy_from_slice(&self.buf[..n]);
		self.buf.copy_within(n..self.len, 0);
		self.len -= n;
		n as u16
	}
}

impl<D: LinkDriver> SocketEvents<D> for BufferedReceiver {
	fn on_data_received(
		&mut self,
		_socket: &mut SocketCore<D>,
		_cx: &mut NetCx<'_, D>,
		data: &PacketBuffer<D>,
	) -> bool {
		let n = data.size() as usize;
		if self.len + n > self.buf.len() {
			return false;
		}
		if data.read(0, &mut self.buf[self.len..self.len + n]).is_err() {
			return false;
		}
		self.len += n;
		true
	}

	fn application_window(&self) -> u16 {
		(self.buf.len() - self.len) as u16
	}
}
