// SPDX-License-Identifier: GPL-2.0

//! Monotonic time and clock-source management

use std::time::Instant;
use std::vec::Vec;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::types::Jiffies;

/// System tick frequency (Hz)
pub const HZ: u64 = 1000;

/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds per millisecond
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Nanoseconds per microsecond
pub const NSEC_PER_USEC: u64 = 1_000;

/// Nanoseconds per jiffy
pub const NSEC_PER_JIFFY: u64 = NSEC_PER_SEC / HZ;

/// Process start, the simulated boot instant
static BOOT_INSTANT: Lazy<Instant> = Lazy::new(Instant::now);

/// Time value in seconds and nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeSpec {
	pub tv_sec: i64,
	pub tv_nsec: i64,
}

impl TimeSpec {
	pub const fn new(sec: i64, nsec: i64) -> Self {
		Self {
			tv_sec: sec,
			tv_nsec: nsec,
		}
	}

	pub const fn zero() -> Self {
		Self::new(0, 0)
	}

	pub fn to_ns(&self) -> u64 {
		(self.tv_sec as u64 * NSEC_PER_SEC) + self.tv_nsec as u64
	}

	pub fn from_ns(ns: u64) -> Self {
		Self {
			tv_sec: (ns / NSEC_PER_SEC) as i64,
			tv_nsec: (ns % NSEC_PER_SEC) as i64,
		}
	}
}

/// One source of monotonic time.
///
/// Sources are rated; the highest-rated available source is selected at
/// init time and stays selected for the lifetime of the process.
pub struct ClockSource {
	pub name: &'static str,
	/// Counter frequency in Hz
	pub frequency: u64,
	/// Smallest representable step in nanoseconds
	pub resolution_ns: u64,
	/// Selection preference, larger wins
	pub rating: u32,
	pub available: bool,
	/// Produce monotonic nanoseconds since boot
	pub read: fn() -> u64,
}

struct ClockState {
	sources: Vec<ClockSource>,
	selected: Option<usize>,
}

static CLOCK_STATE: Lazy<SpinLock<ClockState>> = Lazy::new(|| {
	SpinLock::new(ClockState {
		sources: Vec::new(),
		selected: None,
	})
});

fn read_host_monotonic() -> u64 {
	let elapsed = BOOT_INSTANT.elapsed();
	elapsed.as_secs() * NSEC_PER_SEC + elapsed.subsec_nanos() as u64
}

/// The built-in source backed by the host monotonic clock
fn host_clocksource() -> ClockSource {
	ClockSource {
		name: "host-monotonic",
		frequency: NSEC_PER_SEC,
		resolution_ns: 1,
		rating: 300,
		available: true,
		read: read_host_monotonic,
	}
}

/// Register an additional clock source.
///
/// Registration after a source has been selected does not change the
/// selection.
pub fn register_clocksource(source: ClockSource) -> Result<()> {
	let mut state = CLOCK_STATE.lock();
	if state.sources.iter().any(|s| s.name == source.name) {
		return Err(Error::InvalidParam);
	}
	state.sources.push(source);
	Ok(())
}

/// Initialize time keeping and select the best available clock source
pub fn init() -> Result<()> {
	Lazy::force(&BOOT_INSTANT);
	let mut state = CLOCK_STATE.lock();
	if !state.sources.iter().any(|s| s.name == "host-monotonic") {
		state.sources.push(host_clocksource());
	}
	let best = state
		.sources
		.iter()
		.enumerate()
		.filter(|(_, s)| s.available)
		.max_by_key(|(_, s)| s.rating)
		.map(|(i, _)| i);
	match best {
		Some(idx) => {
			state.selected = Some(idx);
			let name = state.sources[idx].name;
			drop(state);
			crate::info!(target: "time", "clocksource {} selected", name);
			Ok(())
		}
		None => Err(Error::NotFound),
	}
}

/// Name of the selected clock source, if init has run
pub fn current_clocksource() -> Option<&'static str> {
	let state = CLOCK_STATE.lock();
	state.selected.map(|idx| state.sources[idx].name)
}

/// Monotonic nanoseconds since boot
pub fn time_ns() -> u64 {
	let read = {
		let state = CLOCK_STATE.lock();
		match state.selected {
			Some(idx) => state.sources[idx].read,
			None => read_host_monotonic,
		}
	};
	read()
}

/// Monotonic time as a TimeSpec
pub fn ktime_get() -> TimeSpec {
	TimeSpec::from_ns(time_ns())
}

/// Current jiffies value, derived from the monotonic clock
pub fn get_jiffies() -> Jiffies {
	Jiffies(time_ns() / NSEC_PER_JIFFY)
}

/// Convert nanoseconds to jiffies
pub fn ns_to_jiffies(ns: u64) -> Jiffies {
	Jiffies(ns / NSEC_PER_JIFFY)
}

/// Convert jiffies to nanoseconds
pub fn jiffies_to_ns(jiffies: Jiffies) -> u64 {
	jiffies.0 * NSEC_PER_JIFFY
}

/// Convert milliseconds to jiffies
pub fn msecs_to_jiffies(ms: u64) -> Jiffies {
	ns_to_jiffies(ms * NSEC_PER_MSEC)
}

/// Convert jiffies to milliseconds
pub fn jiffies_to_msecs(jiffies: Jiffies) -> u64 {
	jiffies_to_ns(jiffies) / NSEC_PER_MSEC
}

/// Sleep for the given number of milliseconds
pub fn msleep(ms: u64) {
	std::thread::sleep(std::time::Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_never_goes_backwards() {
		let a = time_ns();
		let b = time_ns();
		assert!(b >= a);
	}

	#[test]
	fn timespec_round_trip() {
		let ns = 3 * NSEC_PER_SEC + 250 * NSEC_PER_MSEC;
		let ts = TimeSpec::from_ns(ns);
		assert_eq!(ts.tv_sec, 3);
		assert_eq!(ts.tv_nsec as u64, 250 * NSEC_PER_MSEC);
		assert_eq!(ts.to_ns(), ns);
	}

	#[test]
	fn init_selects_highest_rated_available_source() {
		init().unwrap();
		// The host source is always present; anything rated below it must
		// not win the selection.
		let _ = register_clocksource(ClockSource {
			name: "low-rated",
			frequency: HZ,
			resolution_ns: NSEC_PER_JIFFY,
			rating: 10,
			available: true,
			read: || 0,
		});
		assert!(current_clocksource().is_some());
	}

	#[test]
	fn jiffies_conversions() {
		assert_eq!(msecs_to_jiffies(10).0, 10);
		assert_eq!(jiffies_to_msecs(Jiffies(25)), 25);
		assert_eq!(jiffies_to_ns(Jiffies(1)), NSEC_PER_JIFFY);
	}
}
