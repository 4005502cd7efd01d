// SPDX-License-Identifier: GPL-2.0

//! Interrupt dispatch and balancing engine
//!
//! A fixed table of per-source descriptors, each carrying a chain of
//! handlers. Sources are raised from any thread; non-threaded chains run
//! on the raising thread, threaded chains on a dedicated worker. One
//! dispatcher drains a source at a time, so handlers on one source are
//! serialized while distinct sources run concurrently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::sync::WaitQueue;
use crate::sysctl;

/// Number of interrupt sources
pub const NR_IRQS: usize = 64;

/// Simulated CPUs available to the balancer
pub const NR_CPUS: usize = 4;

/// Handler chain capacity per source
pub const MAX_ACTIONS: usize = 8;

/// Per-source trace ring capacity
pub const TRACE_CAPACITY: usize = 32;

bitflags! {
	/// Handler registration flags
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct IrqFlags: u32 {
		/// Source may be shared by several handlers
		const SHARED = 0x0080;
		/// Chain runs on a dedicated worker task
		const THREADED = 0x0100;
	}
}

/// Handler return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
	/// The stimulus was not ours
	None,
	/// The stimulus was handled
	Handled,
}

/// Interrupt handler callback, invoked with the source id
pub type IrqHandlerFn = Arc<dyn Fn(u32) -> IrqReturn + Send + Sync>;

/// Source state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqState {
	Inactive,
	Active,
	Disabled,
	Handling,
}

/// Balancing policy for target-CPU selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
	None,
	RoundRobin,
	LoadBased,
	Adaptive,
}

struct IrqAction {
	name: String,
	handler: IrqHandlerFn,
	flags: IrqFlags,
	count: u64,
}

/// One trace ring entry
#[derive(Debug, Clone, Copy)]
pub struct IrqTraceEntry {
	pub timestamp_ns: u64,
	pub handled: bool,
}

struct IrqDesc {
	state: IrqState,
	actions: Vec<IrqAction>,
	threaded: bool,
	target_cpu: u32,
	pending: u64,
	total: u64,
	spurious: u64,
	unhandled: u64,
	nested: u64,
	trace: VecDeque<IrqTraceEntry>,
	trace_dropped: u64,
	worker_stop: bool,
}

impl IrqDesc {
	fn new() -> Self {
		Self {
			state: IrqState::Inactive,
			actions: Vec::new(),
			threaded: false,
			target_cpu: 0,
			pending: 0,
			total: 0,
			spurious: 0,
			unhandled: 0,
			nested: 0,
			trace: VecDeque::with_capacity(TRACE_CAPACITY),
			trace_dropped: 0,
			worker_stop: false,
		}
	}

	fn push_trace(&mut self, handled: bool) {
		if self.trace.len() >= TRACE_CAPACITY {
			self.trace.pop_front();
			self.trace_dropped += 1;
		}
		self.trace.push_back(IrqTraceEntry {
			timestamp_ns: crate::time::time_ns(),
			handled,
		});
	}
}

struct IrqSlot {
	desc: Mutex<IrqDesc>,
	wq: WaitQueue,
	worker: SpinLock<Option<JoinHandle<()>>>,
}

struct Balancer {
	policy: SpinLock<BalancePolicy>,
	rr_next: AtomicUsize,
	/// Dispatches per CPU in the current window
	window: SpinLock<[u64; NR_CPUS]>,
	/// Smoothed per-CPU load estimate, adaptive policy only
	estimate: SpinLock<[u64; NR_CPUS]>,
	interval_ms: Arc<AtomicU64>,
	running: AtomicBool,
	stop: Arc<(Mutex<bool>, WaitQueue)>,
	task: SpinLock<Option<JoinHandle<()>>>,
}

struct IrqEngine {
	slots: Vec<IrqSlot>,
	balancer: Balancer,
}

static ENGINE: Lazy<IrqEngine> = Lazy::new(|| IrqEngine {
	slots: (0..NR_IRQS)
		.map(|_| IrqSlot {
			desc: Mutex::new(IrqDesc::new()),
			wq: WaitQueue::new(),
			worker: SpinLock::new(None),
		})
		.collect(),
	balancer: Balancer {
		policy: SpinLock::new(BalancePolicy::None),
		rr_next: AtomicUsize::new(0),
		window: SpinLock::new([0; NR_CPUS]),
		estimate: SpinLock::new([0; NR_CPUS]),
		interval_ms: Arc::new(AtomicU64::new(100)),
		running: AtomicBool::new(false),
		stop: Arc::new((Mutex::new(false), WaitQueue::new())),
		task: SpinLock::new(None),
	},
});

fn slot(irq: u32) -> Result<&'static IrqSlot> {
	ENGINE.slots.get(irq as usize).ok_or(Error::InvalidParam)
}

/// Initialize the interrupt engine and start the balancing task
pub fn init() -> Result<()> {
	Lazy::force(&ENGINE);
	let entry = sysctl::CtlEntry::new(
		"kernel.irq_balance_interval_ms",
		"Interval between balancing passes",
		sysctl::CtlFlags::RW,
		sysctl::CtlValue::U64(ENGINE.balancer.interval_ms.clone()),
	)
	.with_bounds(10, 60_000);
	match sysctl::register(entry) {
		Ok(()) | Err(Error::Busy) => {}
		Err(e) => return Err(e),
	}
	start_balancer();
	crate::info!(target: "irq", "interrupt engine ready, {} sources", NR_IRQS);
	Ok(())
}

/// Stop the balancing task
pub fn shutdown() {
	let balancer = &ENGINE.balancer;
	if !balancer.running.swap(false, Ordering::SeqCst) {
		return;
	}
	*balancer.stop.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
	balancer.stop.1.notify_all();
	if let Some(task) = balancer.task.lock().take() {
		let _ = task.join();
	}
}

fn pick_cpu() -> u32 {
	let balancer = &ENGINE.balancer;
	match *balancer.policy.lock() {
		BalancePolicy::None => 0,
		_ => (balancer.rr_next.fetch_add(1, Ordering::Relaxed) % NR_CPUS) as u32,
	}
}

/// Register a handler on a source.
///
/// The first handler activates the source; additional handlers require the
/// shared flag on the whole chain. A threaded chain gets a worker task the
/// first time a threaded handler registers.
pub fn register_handler(
	irq: u32,
	name: &str,
	flags: IrqFlags,
	handler: IrqHandlerFn,
) -> Result<()> {
	if name.is_empty() {
		return Err(Error::InvalidParam);
	}
	let slot = slot(irq)?;
	let spawn_worker;
	{
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		if desc.actions.len() >= MAX_ACTIONS {
			return Err(Error::NoMemory);
		}
		if desc.actions.iter().any(|a| a.name == name) {
			return Err(Error::Busy);
		}
		if desc.actions.is_empty() {
			desc.threaded = flags.contains(IrqFlags::THREADED);
			desc.target_cpu = pick_cpu();
			desc.state = IrqState::Active;
			desc.worker_stop = false;
			desc.pending = 0;
		} else {
			let chain_shared = desc
				.actions
				.iter()
				.all(|a| a.flags.contains(IrqFlags::SHARED));
			if !chain_shared || !flags.contains(IrqFlags::SHARED) {
				return Err(Error::Busy);
			}
			if desc.threaded != flags.contains(IrqFlags::THREADED) {
				return Err(Error::InvalidParam);
			}
		}
		spawn_worker = desc.threaded && slot.worker.lock().is_none();
		desc.actions.push(IrqAction {
			name: name.into(),
			handler,
			flags,
			count: 0,
		});
	}
	if spawn_worker {
		let handle = std::thread::Builder::new()
			.name(format!("irq/{}", irq))
			.spawn(move || worker_loop(irq))
			.map_err(|_| Error::NoMemory)?;
		*slot.worker.lock() = Some(handle);
	}
	crate::debug!(target: "irq", "irq {}: handler {} registered", irq, name);
	Ok(())
}

/// Remove a handler from a source.
///
/// Removing the last handler deactivates the source; for a threaded chain
/// this waits for the worker to drain pending events and exit.
pub fn free_handler(irq: u32, name: &str) -> Result<()> {
	let slot = slot(irq)?;
	let stop_worker;
	{
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		let idx = desc
			.actions
			.iter()
			.position(|a| a.name == name)
			.ok_or(Error::NotFound)?;
		desc.actions.remove(idx);
		stop_worker = desc.actions.is_empty() && desc.threaded;
		if desc.actions.is_empty() {
			if !desc.threaded {
				desc.state = IrqState::Inactive;
				desc.pending = 0;
			}
			desc.worker_stop = stop_worker;
		}
	}
	if stop_worker {
		slot.wq.notify_all();
		if let Some(worker) = slot.worker.lock().take() {
			let _ = worker.join();
		}
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		desc.state = IrqState::Inactive;
		desc.threaded = false;
		desc.pending = 0;
	}
	crate::debug!(target: "irq", "irq {}: handler {} freed", irq, name);
	Ok(())
}

/// Disable an active source; stimuli arriving meanwhile count as spurious
pub fn disable(irq: u32) -> Result<()> {
	let slot = slot(irq)?;
	let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
	match desc.state {
		IrqState::Active | IrqState::Handling => {
			desc.state = IrqState::Disabled;
			Ok(())
		}
		_ => Err(Error::InvalidParam),
	}
}

/// Re-enable a disabled source
pub fn enable(irq: u32) -> Result<()> {
	let slot = slot(irq)?;
	let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
	if desc.state != IrqState::Disabled || desc.actions.is_empty() {
		return Err(Error::InvalidParam);
	}
	desc.state = IrqState::Active;
	Ok(())
}

/// Run the chain once and account the outcome
fn run_chain(irq: u32, slot: &IrqSlot) {
	let handlers: Vec<IrqHandlerFn> = {
		let desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		desc.actions.iter().map(|a| a.handler.clone()).collect()
	};
	let mut handled = false;
	for handler in &handlers {
		if handler(irq) == IrqReturn::Handled {
			handled = true;
		}
	}
	let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
	let invoked = handlers.len().min(desc.actions.len());
	for action in desc.actions.iter_mut().take(invoked) {
		action.count += 1;
	}
	if !handled {
		desc.unhandled += 1;
	}
	desc.push_trace(handled);
	let cpu = desc.target_cpu as usize;
	drop(desc);
	ENGINE.balancer.window.lock()[cpu % NR_CPUS] += 1;
}

/// Post a stimulus to a source.
///
/// The posting primitive is thread-safe and never blocks on a threaded
/// chain; for non-threaded chains the chain runs on the calling thread
/// before the call returns, unless another dispatch is already draining
/// the source.
pub fn raise(irq: u32) -> Result<()> {
	let slot = slot(irq)?;
	{
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		desc.total += 1;
		match desc.state {
			IrqState::Active | IrqState::Handling => {}
			_ => {
				desc.spurious += 1;
				desc.push_trace(false);
				return Ok(());
			}
		}
		desc.pending += 1;
		if desc.threaded {
			drop(desc);
			slot.wq.notify_all();
			return Ok(());
		}
		if desc.state == IrqState::Handling {
			// Another dispatcher is draining this source; it will pick
			// the event up.
			desc.nested += 1;
			return Ok(());
		}
		desc.state = IrqState::Handling;
	}
	drain(irq, slot);
	Ok(())
}

/// Drain pending events; the caller has moved the source to Handling
fn drain(irq: u32, slot: &IrqSlot) {
	loop {
		{
			let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
			if desc.pending == 0 {
				if desc.state == IrqState::Handling {
					desc.state = IrqState::Active;
				}
				return;
			}
			desc.pending -= 1;
		}
		run_chain(irq, slot);
	}
}

fn worker_loop(irq: u32) {
	let slot = match slot(irq) {
		Ok(slot) => slot,
		Err(_) => return,
	};
	loop {
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		while desc.pending == 0 && !desc.worker_stop {
			desc = slot.wq.wait(desc);
		}
		if desc.pending == 0 && desc.worker_stop {
			return;
		}
		desc.pending -= 1;
		desc.state = IrqState::Handling;
		drop(desc);
		run_chain(irq, slot);
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		if desc.state == IrqState::Handling {
			desc.state = IrqState::Active;
		}
	}
}

/// Select the balancing policy; takes effect on the next pass
pub fn set_balance_policy(policy: BalancePolicy) {
	*ENGINE.balancer.policy.lock() = policy;
	crate::info!(target: "irq", "balance policy set to {:?}", policy);
}

/// Current balancing policy
pub fn balance_policy() -> BalancePolicy {
	*ENGINE.balancer.policy.lock()
}

fn start_balancer() {
	let balancer = &ENGINE.balancer;
	if balancer.running.swap(true, Ordering::SeqCst) {
		return;
	}
	*balancer.stop.0.lock().unwrap_or_else(PoisonError::into_inner) = false;
	let handle = std::thread::Builder::new()
		.name("irq-balance".into())
		.spawn(balancer_loop)
		.ok();
	*balancer.task.lock() = handle;
}

fn balancer_loop() {
	let balancer = &ENGINE.balancer;
	loop {
		let interval = balancer.interval_ms.load(Ordering::Relaxed).max(1);
		let guard = balancer
			.stop
			.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		match balancer.stop.1.wait_until(guard, Some(interval), |stop| *stop) {
			Ok(_) => return,
			Err(Error::Timeout) => {}
			Err(_) => return,
		}
		rebalance();
	}
}

/// One balancing pass: recompute target CPUs per the current policy
pub fn rebalance() {
	let balancer = &ENGINE.balancer;
	let policy = *balancer.policy.lock();
	let window = {
		let mut window = balancer.window.lock();
		let snapshot = *window;
		*window = [0; NR_CPUS];
		snapshot
	};
	match policy {
		BalancePolicy::None => {}
		BalancePolicy::RoundRobin => {
			let mut next = balancer.rr_next.load(Ordering::Relaxed);
			for slot in &ENGINE.slots {
				let mut desc =
					slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
				if desc.state != IrqState::Inactive {
					desc.target_cpu = (next % NR_CPUS) as u32;
					next += 1;
				}
			}
			balancer.rr_next.store(next, Ordering::Relaxed);
		}
		BalancePolicy::LoadBased => assign_least_loaded(window),
		BalancePolicy::Adaptive => {
			let estimate = {
				let mut estimate = balancer.estimate.lock();
				for (est, seen) in estimate.iter_mut().zip(window.iter()) {
					// Exponential smoothing over balancing windows.
					*est = (*est * 3 + *seen) / 4;
				}
				*estimate
			};
			assign_least_loaded(estimate);
		}
	}
}

fn assign_least_loaded(mut load: [u64; NR_CPUS]) {
	for slot in &ENGINE.slots {
		let mut desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
		if desc.state == IrqState::Inactive {
			continue;
		}
		let (cpu, _) = load
			.iter()
			.enumerate()
			.min_by_key(|(_, l)| **l)
			.unwrap_or((0, &0));
		desc.target_cpu = cpu as u32;
		load[cpu] += 1 + desc.total / 16;
	}
}

/// Statistics snapshot for one source
#[derive(Debug, Clone)]
pub struct IrqStats {
	pub irq: u32,
	pub state: IrqState,
	pub target_cpu: u32,
	pub handlers: Vec<(String, u64)>,
	pub total: u64,
	pub spurious: u64,
	pub unhandled: u64,
	pub nested: u64,
	pub trace_len: usize,
	pub trace_dropped: u64,
}

/// Snapshot one source's counters
pub fn stats(irq: u32) -> Result<IrqStats> {
	let slot = slot(irq)?;
	let desc = slot.desc.lock().unwrap_or_else(PoisonError::into_inner);
	Ok(IrqStats {
		irq,
		state: desc.state,
		target_cpu: desc.target_cpu,
		handlers: desc
			.actions
			.iter()
			.map(|a| (a.name.clone(), a.count))
			.collect(),
		total: desc.total,
		spurious: desc.spurious,
		unhandled: desc.unhandled,
		nested: desc.nested,
		trace_len: desc.trace.len(),
		trace_dropped: desc.trace_dropped,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicU32;

	fn counting_handler(hits: Arc<AtomicU32>, claim: bool) -> IrqHandlerFn {
		Arc::new(move |_| {
			hits.fetch_add(1, Ordering::SeqCst);
			if claim {
				IrqReturn::Handled
			} else {
				IrqReturn::None
			}
		})
	}

	#[test]
	fn unregistered_source_counts_spurious() {
		raise(40).unwrap();
		let stats = stats(40).unwrap();
		assert_eq!(stats.state, IrqState::Inactive);
		assert!(stats.spurious >= 1);
	}

	#[test]
	fn shared_chain_runs_every_handler_once_per_dispatch() {
		let first = Arc::new(AtomicU32::new(0));
		let second = Arc::new(AtomicU32::new(0));
		register_handler(
			41,
			"shared-a",
			IrqFlags::SHARED,
			counting_handler(first.clone(), true),
		)
		.unwrap();
		register_handler(
			41,
			"shared-b",
			IrqFlags::SHARED,
			counting_handler(second.clone(), false),
		)
		.unwrap();
		for _ in 0..5 {
			raise(41).unwrap();
		}
		assert_eq!(first.load(Ordering::SeqCst), 5);
		assert_eq!(second.load(Ordering::SeqCst), 5);
		let stats = stats(41).unwrap();
		assert_eq!(stats.handlers[0].1, 5);
		assert_eq!(stats.handlers[1].1, 5);
		assert_eq!(stats.unhandled, 0);
		free_handler(41, "shared-a").unwrap();
		free_handler(41, "shared-b").unwrap();
	}

	#[test]
	fn exclusive_source_rejects_second_handler() {
		let hits = Arc::new(AtomicU32::new(0));
		register_handler(42, "excl", IrqFlags::empty(), counting_handler(hits.clone(), true))
			.unwrap();
		let err = register_handler(
			42,
			"other",
			IrqFlags::SHARED,
			counting_handler(hits.clone(), true),
		);
		assert_eq!(err.err(), Some(Error::Busy));
		free_handler(42, "excl").unwrap();
	}

	#[test]
	fn unclaimed_dispatch_counts_unhandled() {
		let hits = Arc::new(AtomicU32::new(0));
		register_handler(43, "noclaim", IrqFlags::empty(), counting_handler(hits, false))
			.unwrap();
		raise(43).unwrap();
		assert_eq!(stats(43).unwrap().unhandled, 1);
		free_handler(43, "noclaim").unwrap();
	}

	#[test]
	fn threaded_chain_runs_on_worker_and_drains_on_free() {
		let hits = Arc::new(AtomicU32::new(0));
		register_handler(
			44,
			"worker",
			IrqFlags::THREADED,
			counting_handler(hits.clone(), true),
		)
		.unwrap();
		for _ in 0..3 {
			raise(44).unwrap();
		}
		// Deregistration joins the worker after it drains the backlog.
		free_handler(44, "worker").unwrap();
		assert_eq!(hits.load(Ordering::SeqCst), 3);
		assert_eq!(stats(44).unwrap().state, IrqState::Inactive);
	}

	#[test]
	fn disabled_source_counts_spurious() {
		let hits = Arc::new(AtomicU32::new(0));
		register_handler(45, "gate", IrqFlags::empty(), counting_handler(hits.clone(), true))
			.unwrap();
		disable(45).unwrap();
		raise(45).unwrap();
		assert_eq!(hits.load(Ordering::SeqCst), 0);
		assert_eq!(stats(45).unwrap().spurious, 1);
		enable(45).unwrap();
		raise(45).unwrap();
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		free_handler(45, "gate").unwrap();
	}

	#[test]
	fn trace_ring_drops_oldest_on_overflow() {
		let hits = Arc::new(AtomicU32::new(0));
		register_handler(46, "tracer", IrqFlags::empty(), counting_handler(hits, true))
			.unwrap();
		for _ in 0..(TRACE_CAPACITY + 5) {
			raise(46).unwrap();
		}
		let stats = stats(46).unwrap();
		assert_eq!(stats.trace_len, TRACE_CAPACITY);
		assert_eq!(stats.trace_dropped, 5);
		free_handler(46, "tracer").unwrap();
	}

	#[test]
	fn round_robin_rebalance_assigns_cpus() {
		let hits = Arc::new(AtomicU32::new(0));
		for (i, name) in ["rr-a", "rr-b"].iter().enumerate() {
			register_handler(
				47 + i as u32,
				name,
				IrqFlags::empty(),
				counting_handler(hits.clone(), true),
			)
			.unwrap();
		}
		let saved = balance_policy();
		set_balance_policy(BalancePolicy::RoundRobin);
		rebalance();
		let a = stats(47).unwrap().target_cpu;
		let b = stats(48).unwrap().target_cpu;
		assert!(a < NR_CPUS as u32 && b < NR_CPUS as u32);
		set_balance_policy(saved);
		free_handler(47, "rr-a").unwrap();
		free_handler(48, "rr-b").unwrap();
	}
}
