// SPDX-License-Identifier: GPL-2.0

//! Timer subsystem
//!
//! Two structures share one driver task: a coarse hashed wheel for
//! millisecond timers and a sorted queue for high-resolution timers.
//! Callbacks run on the driver task and may reschedule their own timer;
//! they must not wait on the driver task itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::sync::WaitQueue;
use crate::time::{self, NSEC_PER_MSEC};

/// Wheel slot count
pub const WHEEL_SIZE: usize = 256;

/// Wheel resolution in nanoseconds
pub const WHEEL_RESOLUTION_NS: u64 = NSEC_PER_MSEC;

/// Timer identifier
pub type TimerId = u64;

/// Callback invoked on the driver task with the timer's id
pub type TimerCallback = Arc<dyn Fn(TimerId) + Send + Sync>;

/// Timer flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
	Oneshot,
	Periodic,
	HrTimer,
}

/// Timer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
	Inactive,
	Active,
	Expired,
	Cancelled,
}

struct TimerRecord {
	ty: TimerType,
	state: TimerState,
	/// Absolute expiration, monotonic nanoseconds
	expires_ns: u64,
	/// Period for periodic timers, zero otherwise
	interval_ns: u64,
	callback: TimerCallback,
	fire_count: u64,
}

/// Subsystem counters
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
	pub created: u64,
	pub started: u64,
	pub fired: u64,
	pub cancelled: u64,
	pub active: u64,
	pub wheel_pending: u64,
	pub hr_pending: u64,
}

struct TimerCore {
	timers: BTreeMap<TimerId, TimerRecord>,
	next_id: TimerId,
	wheel: Vec<Vec<TimerId>>,
	current_jiffies: u64,
	/// HR timer ids sorted by ascending expiration
	hr_queue: Vec<TimerId>,
	stats: TimerStats,
	stop: bool,
}

struct TimerSubsystem {
	core: Mutex<TimerCore>,
	wq: WaitQueue,
	running: AtomicBool,
	task: SpinLock<Option<JoinHandle<()>>>,
}

static SUBSYS: Lazy<TimerSubsystem> = Lazy::new(|| TimerSubsystem {
	core: Mutex::new(TimerCore {
		timers: BTreeMap::new(),
		next_id: 1,
		wheel: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
		current_jiffies: 0,
		hr_queue: Vec::new(),
		stats: TimerStats::default(),
		stop: false,
	}),
	wq: WaitQueue::new(),
	running: AtomicBool::new(false),
	task: SpinLock::new(None),
});

fn lock_core() -> std::sync::MutexGuard<'static, TimerCore> {
	SUBSYS.core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize the subsystem and start the driver task
pub fn init() -> Result<()> {
	if SUBSYS.running.swap(true, Ordering::SeqCst) {
		return Ok(());
	}
	{
		let mut core = lock_core();
		core.stop = false;
		core.current_jiffies = time::time_ns() / WHEEL_RESOLUTION_NS;
	}
	let handle = std::thread::Builder::new()
		.name("ktimerd".into())
		.spawn(driver_loop)
		.map_err(|_| {
			SUBSYS.running.store(false, Ordering::SeqCst);
			Error::NoMemory
		})?;
	*SUBSYS.task.lock() = Some(handle);
	crate::info!(target: "ktimer", "timer driver started, wheel {} slots", WHEEL_SIZE);
	Ok(())
}

/// Stop the driver task; timer records survive for a later init
pub fn shutdown() {
	if !SUBSYS.running.swap(false, Ordering::SeqCst) {
		return;
	}
	lock_core().stop = true;
	SUBSYS.wq.notify_all();
	if let Some(task) = SUBSYS.task.lock().take() {
		let _ = task.join();
	}
}

/// Create an inactive timer and return its id
pub fn create(ty: TimerType, callback: TimerCallback) -> Result<TimerId> {
	let mut core = lock_core();
	let id = core.next_id;
	core.next_id += 1;
	core.timers.insert(
		id,
		TimerRecord {
			ty,
			state: TimerState::Inactive,
			expires_ns: 0,
			interval_ns: 0,
			callback,
			fire_count: 0,
		},
	);
	core.stats.created += 1;
	Ok(id)
}

fn insert_wheel(core: &mut TimerCore, id: TimerId, expires_ns: u64) {
	let tick = (expires_ns / WHEEL_RESOLUTION_NS).max(core.current_jiffies + 1);
	let slot = (tick as usize) % WHEEL_SIZE;
	core.wheel[slot].push(id);
}

fn insert_hr(core: &mut TimerCore, id: TimerId, expires_ns: u64) {
	let pos = core
		.hr_queue
		.partition_point(|other| {
			core.timers
				.get(other)
				.map(|rec| rec.expires_ns <= expires_ns)
				.unwrap_or(true)
		});
	core.hr_queue.insert(pos, id);
}

/// Arm a timer with an absolute expiration.
///
/// Requires the timer to be inactive. Periodic timers need a non-zero
/// interval; one-shot timers must leave it zero.
pub fn start(id: TimerId, expires_ns: u64, interval_ns: u64) -> Result<()> {
	{
		let mut core = lock_core();
		let rec = core.timers.get_mut(&id).ok_or(Error::NotFound)?;
		if rec.state != TimerState::Inactive {
			return Err(Error::Busy);
		}
		let periodic = rec.ty == TimerType::Periodic
			|| (rec.ty == TimerType::HrTimer && interval_ns > 0);
		if rec.ty == TimerType::Periodic && interval_ns == 0 {
			return Err(Error::InvalidParam);
		}
		if rec.ty == TimerType::Oneshot && interval_ns != 0 {
			return Err(Error::InvalidParam);
		}
		rec.state = TimerState::Active;
		rec.expires_ns = expires_ns;
		rec.interval_ns = if periodic { interval_ns } else { 0 };
		let ty = rec.ty;
		core.stats.started += 1;
		if ty == TimerType::HrTimer {
			insert_hr(&mut core, id, expires_ns);
		} else {
			insert_wheel(&mut core, id, expires_ns);
		}
	}
	SUBSYS.wq.notify_all();
	Ok(())
}

/// Arm a timer relative to now
pub fn start_in(id: TimerId, delay_ns: u64, interval_ns: u64) -> Result<()> {
	start(id, time::time_ns() + delay_ns, interval_ns)
}

fn remove_from_structure(core: &mut TimerCore, id: TimerId, ty: TimerType, expires_ns: u64) {
	if ty == TimerType::HrTimer {
		core.hr_queue.retain(|other| *other != id);
	} else {
		let tick = (expires_ns / WHEEL_RESOLUTION_NS).max(1);
		let slot = (tick as usize) % WHEEL_SIZE;
		if let Some(pos) = core.wheel[slot].iter().position(|other| *other == id) {
			core.wheel[slot].remove(pos);
		} else {
			// Re-hashed while the driver drained its slot; sweep.
			for slot in core.wheel.iter_mut() {
				slot.retain(|other| *other != id);
			}
		}
	}
}

/// Cancel an active timer.
///
/// An in-flight callback completes without interruption.
pub fn stop(id: TimerId) -> Result<()> {
	let mut core = lock_core();
	let rec = core.timers.get_mut(&id).ok_or(Error::NotFound)?;
	if rec.state != TimerState::Active {
		return Err(Error::InvalidParam);
	}
	rec.state = TimerState::Cancelled;
	let (ty, expires) = (rec.ty, rec.expires_ns);
	core.stats.cancelled += 1;
	remove_from_structure(&mut core, id, ty, expires);
	Ok(())
}

/// Cancel if needed and destroy the timer record
pub fn delete(id: TimerId) -> Result<()> {
	let mut core = lock_core();
	let rec = core.timers.get(&id).ok_or(Error::NotFound)?;
	if rec.state == TimerState::Active {
		let (ty, expires) = (rec.ty, rec.expires_ns);
		core.stats.cancelled += 1;
		remove_from_structure(&mut core, id, ty, expires);
	}
	core.timers.remove(&id);
	Ok(())
}

/// Current state of a timer
pub fn state(id: TimerId) -> Result<TimerState> {
	let core = lock_core();
	core.timers.get(&id).map(|rec| rec.state).ok_or(Error::NotFound)
}

/// Number of times a timer has fired
pub fn fire_count(id: TimerId) -> Result<u64> {
	let core = lock_core();
	core.timers
		.get(&id)
		.map(|rec| rec.fire_count)
		.ok_or(Error::NotFound)
}

/// Subsystem counter snapshot
pub fn stats() -> TimerStats {
	let core = lock_core();
	let mut stats = core.stats.clone();
	stats.active = core
		.timers
		.values()
		.filter(|rec| rec.state == TimerState::Active)
		.count() as u64;
	stats.wheel_pending = core.wheel.iter().map(|slot| slot.len() as u64).sum();
	stats.hr_pending = core.hr_queue.len() as u64;
	stats
}

/// Fire one timer inside the core lock; returns the callback to run
fn expire_locked(core: &mut TimerCore, id: TimerId, now: u64) -> Option<TimerCallback> {
	let rec = core.timers.get_mut(&id)?;
	if rec.state != TimerState::Active || rec.expires_ns > now {
		return None;
	}
	rec.fire_count += 1;
	let callback = rec.callback.clone();
	if rec.interval_ns > 0 {
		// Schedule from the fire instant so successive callbacks are
		// never closer than one interval.
		rec.expires_ns = now + rec.interval_ns;
		let (ty, expires) = (rec.ty, rec.expires_ns);
		if ty == TimerType::HrTimer {
			insert_hr(core, id, expires);
		} else {
			insert_wheel(core, id, expires);
		}
	} else {
		rec.state = TimerState::Expired;
	}
	core.stats.fired += 1;
	Some(callback)
}

/// Advance the wheel and HR queue; collects due callbacks
fn collect_due(core: &mut TimerCore, now: u64) -> Vec<(TimerId, TimerCallback)> {
	let mut due = Vec::new();
	let target = now / WHEEL_RESOLUTION_NS;
	while core.current_jiffies < target {
		core.current_jiffies += 1;
		let slot = (core.current_jiffies as usize) % WHEEL_SIZE;
		let drained: Vec<TimerId> = core.wheel[slot].drain(..).collect();
		for id in drained {
			let (active, expired) = match core.timers.get(&id) {
				Some(rec) => {
					(rec.state == TimerState::Active, rec.expires_ns <= now)
				}
				None => (false, false),
			};
			if !active {
				continue;
			}
			if expired {
				if let Some(cb) = expire_locked(core, id, now) {
					due.push((id, cb));
				}
			} else {
				// A later lap of the wheel.
				core.wheel[slot].push(id);
			}
		}
	}
	loop {
		let head = match core.hr_queue.first() {
			Some(&id) => id,
			None => break,
		};
		let expired = core
			.timers
			.get(&head)
			.map(|rec| rec.state == TimerState::Active && rec.expires_ns <= now)
			.unwrap_or(false);
		let stale = core.timers.get(&head).map(|rec| {
			rec.state != TimerState::Active
		}).unwrap_or(true);
		if stale {
			core.hr_queue.remove(0);
			continue;
		}
		if !expired {
			break;
		}
		core.hr_queue.remove(0);
		if let Some(cb) = expire_locked(core, head, now) {
			due.push((head, cb));
		}
	}
	due
}

fn next_deadline(core: &TimerCore) -> Option<u64> {
	let wheel_next = if core.wheel.iter().any(|slot| !slot.is_empty()) {
		Some((core.current_jiffies + 1) * WHEEL_RESOLUTION_NS)
	} else {
		None
	};
	let hr_next = core
		.hr_queue
		.first()
		.and_then(|id| core.timers.get(id))
		.map(|rec| rec.expires_ns);
	match (wheel_next, hr_next) {
		(Some(a), Some(b)) => Some(a.min(b)),
		(Some(a), None) => Some(a),
		(None, Some(b)) => Some(b),
		(None, None) => None,
	}
}

fn driver_loop() {
	loop {
		let due = {
			let mut core = lock_core();
			if core.stop {
				return;
			}
			collect_due(&mut core, time::time_ns())
		};
		for (id, callback) in due {
			callback(id);
		}
		let core = lock_core();
		if core.stop {
			return;
		}
		let now = time::time_ns();
		let timeout_ms = match next_deadline(&core) {
			Some(deadline) if deadline <= now => {
				drop(core);
				continue;
			}
			Some(deadline) => ((deadline - now) / NSEC_PER_MSEC).clamp(1, 50),
			None => 50,
		};
		let _unused = SUBSYS.wq.wait_until(core, Some(timeout_ms), |core| core.stop);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicU64;

	fn noop() -> TimerCallback {
		Arc::new(|_| {})
	}

	#[test]
	fn create_returns_inactive_timer() {
		let id = create(TimerType::Oneshot, noop()).unwrap();
		assert_eq!(state(id).unwrap(), TimerState::Inactive);
		assert_eq!(fire_count(id).unwrap(), 0);
		delete(id).unwrap();
		assert_eq!(state(id), Err(Error::NotFound));
	}

	#[test]
	fn start_requires_inactive() {
		let id = create(TimerType::Oneshot, noop()).unwrap();
		start_in(id, 60 * 1_000_000_000, 0).unwrap();
		assert_eq!(start_in(id, 1, 0), Err(Error::Busy));
		stop(id).unwrap();
		assert_eq!(state(id).unwrap(), TimerState::Cancelled);
		// A cancelled timer cannot be re-armed or re-stopped.
		assert_eq!(stop(id), Err(Error::InvalidParam));
		delete(id).unwrap();
	}

	#[test]
	fn periodic_requires_interval() {
		let id = create(TimerType::Periodic, noop()).unwrap();
		assert_eq!(start_in(id, 1000, 0), Err(Error::InvalidParam));
		delete(id).unwrap();
	}

	#[test]
	fn oneshot_rejects_interval() {
		let id = create(TimerType::Oneshot, noop()).unwrap();
		assert_eq!(start_in(id, 1000, 5), Err(Error::InvalidParam));
		delete(id).unwrap();
	}

	#[test]
	fn oneshot_fires_once() {
		init().unwrap();
		let hits = Arc::new(AtomicU64::new(0));
		let witness = hits.clone();
		let id = create(
			TimerType::Oneshot,
			Arc::new(move |_| {
				witness.fetch_add(1, Ordering::SeqCst);
			}),
		)
		.unwrap();
		start_in(id, 50 * NSEC_PER_MSEC, 0).unwrap();
		time::msleep(150);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(state(id).unwrap(), TimerState::Expired);
		assert_eq!(fire_count(id).unwrap(), 1);
		delete(id).unwrap();
	}

	#[test]
	fn hr_timers_fire_in_expiration_order() {
		init().unwrap();
		let order = Arc::new(SpinLock::new(Vec::new()));
		let mut ids = Vec::new();
		for delay_ms in [90u64, 30, 60] {
			let order = order.clone();
			let id = create(
				TimerType::HrTimer,
				Arc::new(move |tid| {
					order.lock().push(tid);
				}),
			)
			.unwrap();
			start_in(id, delay_ms * NSEC_PER_MSEC, 0).unwrap();
			ids.push((delay_ms, id));
		}
		time::msleep(250);
		let fired = order.lock().clone();
		ids.sort_by_key(|(delay, _)| *delay);
		let expected: Vec<TimerId> = ids.iter().map(|(_, id)| *id).collect();
		assert_eq!(fired, expected);
		for (_, id) in ids {
			delete(id).unwrap();
		}
	}

	#[test]
	fn periodic_fires_repeatedly_until_stopped() {
		init().unwrap();
		let id = create(TimerType::Periodic, noop()).unwrap();
		start_in(id, 10 * NSEC_PER_MSEC, 10 * NSEC_PER_MSEC).unwrap();
		time::msleep(120);
		let count = fire_count(id).unwrap();
		assert!(count >= 5, "fired only {} times", count);
		assert_eq!(state(id).unwrap(), TimerState::Active);
		stop(id).unwrap();
		let frozen = fire_count(id).unwrap();
		time::msleep(40);
		assert_eq!(fire_count(id).unwrap(), frozen);
		delete(id).unwrap();
	}
}
