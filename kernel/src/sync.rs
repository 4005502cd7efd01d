// SPDX-License-Identifier: GPL-2.0

//! Synchronization primitives
//!
//! Short critical sections use spin locks; anything that sleeps goes
//! through a [`WaitQueue`], which wraps a condition variable and supports
//! the optional millisecond deadlines every bounded wait accepts.

pub use std::sync::Arc;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use spin::Mutex as SpinLock;
pub use spin::RwLock as SpinRwLock;

use crate::error::{Error, Result};

/// Condition-variable wait queue with deadline support.
///
/// The protected state lives in a `std::sync::Mutex` owned by the caller;
/// the queue only sleeps and wakes.
pub struct WaitQueue {
	cond: Condvar,
}

impl WaitQueue {
	pub const fn new() -> Self {
		Self {
			cond: Condvar::new(),
		}
	}

	/// Sleep on `guard` until `ready` returns true.
	///
	/// With a deadline, returns [`Error::Timeout`] if the deadline expires
	/// while `ready` is still false; the guarded state is unchanged by the
	/// wait itself.
	pub fn wait_until<'a, T, F>(
		&self,
		guard: MutexGuard<'a, T>,
		timeout_ms: Option<u64>,
		mut ready: F,
	) -> Result<MutexGuard<'a, T>>
	where
		F: FnMut(&mut T) -> bool,
	{
		match timeout_ms {
			None => {
				let mut guard = guard;
				while !ready(&mut guard) {
					guard = self
						.cond
						.wait(guard)
						.unwrap_or_else(PoisonError::into_inner);
				}
				Ok(guard)
			}
			Some(ms) => {
				let (mut guard, result) = self
					.cond
					.wait_timeout_while(
						guard,
						Duration::from_millis(ms),
						|state| !ready(state),
					)
					.unwrap_or_else(PoisonError::into_inner);
				if result.timed_out() && !ready(&mut guard) {
					drop(guard);
					return Err(Error::Timeout);
				}
				Ok(guard)
			}
		}
	}

	/// Sleep once on `guard`; the caller rechecks its predicate
	pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
		self.cond
			.wait(guard)
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Wake one waiter
	pub fn notify_one(&self) {
		self.cond.notify_one();
	}

	/// Wake all waiters
	pub fn notify_all(&self) {
		self.cond.notify_all();
	}
}

impl Default for WaitQueue {
	fn default() -> Self {
		Self::new()
	}
}

/// Counting semaphore
pub struct Semaphore {
	count: Mutex<u32>,
	queue: WaitQueue,
}

impl Semaphore {
	pub fn new(initial: u32) -> Self {
		Self {
			count: Mutex::new(initial),
			queue: WaitQueue::new(),
		}
	}

	/// Take one unit, sleeping until one is available
	pub fn acquire(&self) {
		let mut guard = self
			.count
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		while *guard == 0 {
			guard = self.queue.wait(guard);
		}
		*guard -= 1;
	}

	/// Take one unit without sleeping
	pub fn try_acquire(&self) -> Result<()> {
		let mut guard = self
			.count
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if *guard == 0 {
			return Err(Error::Busy);
		}
		*guard -= 1;
		Ok(())
	}

	/// Take one unit, giving up after `timeout_ms` milliseconds
	pub fn acquire_timeout(&self, timeout_ms: u64) -> Result<()> {
		let guard = self
			.count
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		let mut guard =
			self.queue
				.wait_until(guard, Some(timeout_ms), |count| *count > 0)?;
		*guard -= 1;
		Ok(())
	}

	/// Return one unit and wake a waiter
	pub fn release(&self) {
		let mut guard = self
			.count
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		*guard += 1;
		drop(guard);
		self.queue.notify_one();
	}
}
