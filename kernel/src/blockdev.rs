// SPDX-License-Identifier: GPL-2.0

//! Block device pipeline
//!
//! Backing storage of `total_blocks * block_size` bytes behind a small
//! write-through cache. Logical I/O takes a shared lock for reads and an
//! exclusive lock for writes; cache state has its own lock underneath.
//! Eviction is LRU over valid slots, flushing dirty data before reuse.

use std::sync::{Arc, PoisonError, RwLock};

use spin::Mutex as SpinLock;

use crate::device::{
	self, ioctl, Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState,
};
use crate::error::{Error, Result};
use crate::types::DeviceNumber;

/// Cache slots per device
pub const CACHE_SLOTS: usize = 16;

/// Per-device I/O counters
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
	pub reads: u64,
	pub writes: u64,
	pub read_bytes: u64,
	pub write_bytes: u64,
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub flushes: u64,
}

struct CacheSlot {
	block: u64,
	data: Vec<u8>,
	valid: bool,
	dirty: bool,
	lru: u64,
}

struct BlockInner {
	backing: Vec<u8>,
	slots: Vec<CacheSlot>,
	lru_clock: u64,
	stats: BlockStats,
}

/// Block pipeline state
pub struct BlockState {
	block_size: usize,
	total_blocks: u64,
	io: RwLock<()>,
	cache: SpinLock<BlockInner>,
}

impl BlockState {
	fn new(block_size: usize, total_blocks: u64) -> Self {
		Self {
			block_size,
			total_blocks,
			io: RwLock::new(()),
			cache: SpinLock::new(BlockInner {
				backing: vec![0; block_size * total_blocks as usize],
				slots: (0..CACHE_SLOTS)
					.map(|_| CacheSlot {
						block: 0,
						data: vec![0; block_size],
						valid: false,
						dirty: false,
						lru: 0,
					})
					.collect(),
				lru_clock: 0,
				stats: BlockStats::default(),
			}),
		}
	}

	fn total_size(&self) -> u64 {
		self.total_blocks * self.block_size as u64
	}
}

fn block_state(dev: &Device) -> Result<&BlockState> {
	match dev.state() {
		DeviceState::Block(state) => Ok(state),
		_ => Err(Error::InvalidParam),
	}
}

fn flush_slot(backing: &mut [u8], slot: &mut CacheSlot, block_size: usize) {
	if slot.valid && slot.dirty {
		let start = slot.block as usize * block_size;
		backing[start..start + block_size].copy_from_slice(&slot.data);
		slot.dirty = false;
	}
}

/// Find or claim a cache slot for `block`.
///
/// On a miss the least-recently-used slot is evicted, flushed first when
/// dirty. With `load` set the backing block is read into the slot;
/// otherwise the slot is claimed for a full overwrite.
fn ensure_slot(inner: &mut BlockInner, block_size: usize, block: u64, load: bool) -> usize {
	inner.lru_clock += 1;
	let clock = inner.lru_clock;
	if let Some(idx) = inner
		.slots
		.iter()
		.position(|slot| slot.valid && slot.block == block)
	{
		inner.slots[idx].lru = clock;
		inner.stats.cache_hits += 1;
		return idx;
	}
	inner.stats.cache_misses += 1;
	let idx = inner
		.slots
		.iter()
		.position(|slot| !slot.valid)
		.unwrap_or_else(|| {
			inner
				.slots
				.iter()
				.enumerate()
				.min_by_key(|(_, slot)| slot.lru)
				.map(|(idx, _)| idx)
				.unwrap_or(0)
		});
	let (backing, slots) = (&mut inner.backing, &mut inner.slots);
	flush_slot(backing, &mut slots[idx], block_size);
	let slot = &mut slots[idx];
	slot.block = block;
	slot.valid = true;
	slot.dirty = false;
	slot.lru = clock;
	if load {
		let start = block as usize * block_size;
		slot.data.copy_from_slice(&backing[start..start + block_size]);
	}
	idx
}

fn dev_read(dev: &Device, buf: &mut [u8], offset: u64) -> Result<usize> {
	let state = block_state(dev)?;
	let _shared = state.io.read().unwrap_or_else(PoisonError::into_inner);
	let total = state.total_size();
	if offset >= total {
		return Ok(0);
	}
	let count = (buf.len() as u64).min(total - offset) as usize;
	let block_size = state.block_size;
	let mut inner = state.cache.lock();
	let mut copied = 0;
	while copied < count {
		let pos = offset + copied as u64;
		let block = pos / block_size as u64;
		let in_block = (pos % block_size as u64) as usize;
		let chunk = (block_size - in_block).min(count - copied);
		let idx = ensure_slot(&mut inner, block_size, block, true);
		buf[copied..copied + chunk]
			.copy_from_slice(&inner.slots[idx].data[in_block..in_block + chunk]);
		copied += chunk;
	}
	inner.stats.reads += 1;
	inner.stats.read_bytes += count as u64;
	Ok(count)
}

fn dev_write(dev: &Device, data: &[u8], offset: u64) -> Result<usize> {
	let state = block_state(dev)?;
	let _exclusive = state.io.write().unwrap_or_else(PoisonError::into_inner);
	let total = state.total_size();
	if offset + data.len() as u64 > total {
		return Err(Error::InvalidParam);
	}
	if data.is_empty() {
		return Ok(0);
	}
	let block_size = state.block_size;
	let mut inner = state.cache.lock();
	let mut written = 0;
	while written < data.len() {
		let pos = offset + written as u64;
		let block = pos / block_size as u64;
		let in_block = (pos % block_size as u64) as usize;
		let chunk = (block_size - in_block).min(data.len() - written);
		// Partial blocks read-modify; full blocks overwrite in place.
		let partial = chunk < block_size;
		let idx = ensure_slot(&mut inner, block_size, block, partial);
		inner.slots[idx].data[in_block..in_block + chunk]
			.copy_from_slice(&data[written..written + chunk]);
		inner.slots[idx].dirty = true;
		// Write through immediately; the slot stays clean afterwards.
		let inner = &mut *inner;
		let (backing, slots) = (&mut inner.backing, &mut inner.slots);
		flush_slot(backing, &mut slots[idx], block_size);
		written += chunk;
	}
	inner.stats.writes += 1;
	inner.stats.write_bytes += data.len() as u64;
	Ok(data.len())
}

fn dev_fsync(dev: &Device) -> Result<()> {
	let state = block_state(dev)?;
	let _exclusive = state.io.write().unwrap_or_else(PoisonError::into_inner);
	let block_size = state.block_size;
	let mut inner = state.cache.lock();
	{
		let inner = &mut *inner;
		let (backing, slots) = (&mut inner.backing, &mut inner.slots);
		for slot in slots.iter_mut() {
			flush_slot(backing, slot, block_size);
		}
	}
	inner.stats.flushes += 1;
	Ok(())
}

fn dev_ioctl(dev: &Device, cmd: u32, _arg: usize) -> Result<usize> {
	let state = block_state(dev)?;
	match cmd {
		ioctl::BLKGETSIZE => Ok(state.total_blocks as usize),
		ioctl::BLKFLSBUF => {
			dev_fsync(dev)?;
			Ok(0)
		}
		ioctl::GET_INFO => {
			let inner = state.cache.lock();
			crate::info!(
				target: "blockdev",
				"{}: {} blocks of {} bytes, {} reads {} writes, hits {} misses {}",
				dev.name(),
				state.total_blocks,
				state.block_size,
				inner.stats.reads,
				inner.stats.writes,
				inner.stats.cache_hits,
				inner.stats.cache_misses
			);
			Ok(0)
		}
		_ => Err(Error::NotSupported),
	}
}

const BLOCK_OPS: DeviceOps = DeviceOps {
	read: Some(dev_read),
	write: Some(dev_write),
	ioctl: Some(dev_ioctl),
	flush: Some(dev_fsync),
};

/// Create and register a block device
pub fn create(
	name: &str,
	block_size: usize,
	total_blocks: u64,
	flags: DeviceFlags,
) -> Result<Arc<Device>> {
	if block_size == 0 || total_blocks == 0 {
		return Err(Error::InvalidParam);
	}
	let device = Device::new(
		name,
		DeviceClass::Block,
		DeviceNumber::new(0, 0),
		flags,
		BLOCK_OPS,
		DeviceState::Block(BlockState::new(block_size, total_blocks)),
	);
	device::register_device(device)
}

/// Number of dirty cache entries
pub fn dirty_entries(dev: &Device) -> Result<usize> {
	let state = block_state(dev)?;
	let inner = state.cache.lock();
	Ok(inner
		.slots
		.iter()
		.filter(|slot| slot.valid && slot.dirty)
		.count())
}

/// I/O counter snapshot
pub fn stats(dev: &Device) -> Result<BlockStats> {
	let state = block_state(dev)?;
	Ok(state.cache.lock().stats.clone())
}

/// Flush dirty cache state; used by device teardown
pub(crate) fn teardown(state: &BlockState) {
	let block_size = state.block_size;
	let mut inner = state.cache.lock();
	let inner = &mut *inner;
	let (backing, slots) = (&mut inner.backing, &mut inner.slots);
	for slot in slots.iter_mut() {
		flush_slot(backing, slot, block_size);
	}
}
