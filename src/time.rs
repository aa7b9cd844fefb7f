//! Host clock capability.
//!
//! The stack keeps every timestamp as a wrapping `u32` millisecond value,
//! which is what small parts natively provide. The host injects the
//! source at construction; on an AVR-class target this is the usual
//! timer-tick counter, on a hosted test it is whatever the test wants.

/// A monotonic millisecond clock.
pub trait TimeSource {
	/// Milliseconds since an arbitrary epoch. Expected to wrap; all
	/// arithmetic on the returned values is `wrapping_sub`.
	fn now_ms(&mut self) -> u32;
}
