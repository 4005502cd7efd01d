// SPDX-License-Identifier: GPL-2.0

//! Character device pipeline
//!
//! A bounded byte ring per device, guarded by one mutex and a pair of
//! condition variables. Writers block until their whole payload fits;
//! readers block until data or EOF arrives. The NONBLOCK device flag turns
//! both waits into immediate results.

use std::sync::{Arc, Mutex, PoisonError};

use crate::device::{
	self, ioctl, Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState,
};
use crate::error::{Error, Result};
use crate::sync::WaitQueue;
use crate::types::DeviceNumber;

/// Default ring capacity in bytes
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Per-device transfer counters
#[derive(Debug, Clone, Default)]
pub struct CharStats {
	pub chars_in: u64,
	pub chars_out: u64,
	pub read_calls: u64,
	pub write_calls: u64,
}

struct CharInner {
	buf: Vec<u8>,
	head: usize,
	tail: usize,
	size: usize,
	eof: bool,
	stats: CharStats,
}

/// Character pipeline state
pub struct CharState {
	capacity: usize,
	inner: Mutex<CharInner>,
	readers: WaitQueue,
	writers: WaitQueue,
}

impl CharState {
	fn new(capacity: usize) -> Self {
		Self {
			capacity,
			inner: Mutex::new(CharInner {
				buf: vec![0; capacity],
				head: 0,
				tail: 0,
				size: 0,
				eof: false,
				stats: CharStats::default(),
			}),
			readers: WaitQueue::new(),
			writers: WaitQueue::new(),
		}
	}
}

fn char_state(dev: &Device) -> Result<&CharState> {
	match dev.state() {
		DeviceState::Char(state) => Ok(state),
		_ => Err(Error::InvalidParam),
	}
}

fn push_bytes(inner: &mut CharInner, capacity: usize, data: &[u8]) {
	for &byte in data {
		inner.buf[inner.tail] = byte;
		inner.tail = (inner.tail + 1) % capacity;
	}
	inner.size += data.len();
	inner.stats.chars_in += data.len() as u64;
}

fn pop_bytes(inner: &mut CharInner, capacity: usize, buf: &mut [u8]) -> usize {
	let count = buf.len().min(inner.size);
	for slot in buf.iter_mut().take(count) {
		*slot = inner.buf[inner.head];
		inner.head = (inner.head + 1) % capacity;
	}
	inner.size -= count;
	inner.stats.chars_out += count as u64;
	count
}

fn write_common(dev: &Device, data: &[u8], timeout_ms: Option<u64>) -> Result<usize> {
	let state = char_state(dev)?;
	if data.is_empty() {
		return Ok(0);
	}
	if data.len() > state.capacity {
		return Err(Error::InvalidParam);
	}
	let nonblock = dev.flags().contains(DeviceFlags::NONBLOCK);
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.stats.write_calls += 1;
	if inner.eof {
		return Err(Error::Io);
	}
	if nonblock {
		let free = state.capacity - inner.size;
		if free == 0 {
			return Err(Error::Busy);
		}
		let count = free.min(data.len());
		push_bytes(&mut inner, state.capacity, &data[..count]);
		drop(inner);
		state.readers.notify_all();
		return Ok(count);
	}
	let needed = data.len();
	let mut inner = state.writers.wait_until(inner, timeout_ms, |inner| {
		inner.eof || state.capacity - inner.size >= needed
	})?;
	if inner.eof {
		return Err(Error::Io);
	}
	push_bytes(&mut inner, state.capacity, data);
	drop(inner);
	state.readers.notify_all();
	Ok(needed)
}

fn read_common(dev: &Device, buf: &mut [u8], timeout_ms: Option<u64>) -> Result<usize> {
	let state = char_state(dev)?;
	if buf.is_empty() {
		return Ok(0);
	}
	let nonblock = dev.flags().contains(DeviceFlags::NONBLOCK);
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.stats.read_calls += 1;
	if inner.size == 0 && !inner.eof {
		if nonblock {
			return Err(Error::Busy);
		}
		inner = state
			.readers
			.wait_until(inner, timeout_ms, |inner| inner.size > 0 || inner.eof)?;
	}
	if inner.size == 0 {
		// EOF with an empty ring.
		return Ok(0);
	}
	let count = pop_bytes(&mut inner, state.capacity, buf);
	drop(inner);
	state.writers.notify_all();
	Ok(count)
}

fn dev_read(dev: &Device, buf: &mut [u8], _offset: u64) -> Result<usize> {
	read_common(dev, buf, None)
}

fn dev_write(dev: &Device, data: &[u8], _offset: u64) -> Result<usize> {
	write_common(dev, data, None)
}

fn dev_flush(dev: &Device) -> Result<()> {
	let state = char_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.eof = true;
	drop(inner);
	state.readers.notify_all();
	state.writers.notify_all();
	Ok(())
}

fn dev_ioctl(dev: &Device, cmd: u32, _arg: usize) -> Result<usize> {
	let state = char_state(dev)?;
	match cmd {
		ioctl::RESET => {
			let mut inner =
				state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			inner.head = 0;
			inner.tail = 0;
			inner.size = 0;
			drop(inner);
			state.writers.notify_all();
			Ok(0)
		}
		ioctl::FLUSH => {
			dev_flush(dev)?;
			Ok(0)
		}
		ioctl::GET_INFO => {
			let inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			crate::info!(
				target: "chardev",
				"{}: size {}/{} eof {} in {} out {}",
				dev.name(),
				inner.size,
				state.capacity,
				inner.eof,
				inner.stats.chars_in,
				inner.stats.chars_out
			);
			Ok(0)
		}
		_ => Err(Error::NotSupported),
	}
}

const CHAR_OPS: DeviceOps = DeviceOps {
	read: Some(dev_read),
	write: Some(dev_write),
	ioctl: Some(dev_ioctl),
	flush: Some(dev_flush),
};

/// Create and register a character device
pub fn create(name: &str, buf_size: usize, flags: DeviceFlags) -> Result<Arc<Device>> {
	if buf_size == 0 {
		return Err(Error::InvalidParam);
	}
	let device = Device::new(
		name,
		DeviceClass::Char,
		DeviceNumber::new(0, 0),
		flags,
		CHAR_OPS,
		DeviceState::Char(CharState::new(buf_size)),
	);
	device::register_device(device)
}

/// Blocking read with a deadline
pub fn read_timeout(dev: &Device, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
	read_common(dev, buf, Some(timeout_ms))
}

/// Blocking write with a deadline
pub fn write_timeout(dev: &Device, data: &[u8], timeout_ms: u64) -> Result<usize> {
	write_common(dev, data, Some(timeout_ms))
}

/// Transfer counter snapshot
pub fn stats(dev: &Device) -> Result<CharStats> {
	let state = char_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.stats
		.clone())
}
