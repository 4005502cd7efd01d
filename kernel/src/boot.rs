// SPDX-License-Identifier: GPL-2.0

//! Boot orchestrator
//!
//! Drives an ordered table of init modules by ascending priority. A
//! failing non-critical module is reported and skipped; a failing critical
//! module puts the orchestrator into emergency mode, where a console
//! decides between reboot, shutdown and continue. Shutdown cleans up
//! exactly the modules whose init succeeded, in reverse order.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
use std::sync::Arc;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::sysctl::{self, CtlEntry, CtlFlags, CtlValue};

/// One entry in the init table
#[derive(Clone, Copy)]
pub struct InitModule {
	pub name: &'static str,
	pub priority: i32,
	pub critical: bool,
	pub init: fn() -> Result<()>,
	pub cleanup: fn() -> Result<()>,
}

/// Coarse boot progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
	Halted,
	Booting,
	Complete,
	Emergency,
}

/// Emergency-mode resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyAction {
	Reboot,
	Shutdown,
	Continue,
}

/// Decides how to leave emergency mode.
///
/// The interactive prompt lives outside the kernel; tests and embedders
/// supply scripted consoles.
pub trait EmergencyConsole: Send + Sync {
	fn decide(&self, failed_module: &str, error: Error) -> EmergencyAction;
}

/// Default console: report and keep booting
pub struct AutoContinue;

impl EmergencyConsole for AutoContinue {
	fn decide(&self, failed_module: &str, error: Error) -> EmergencyAction {
		crate::emerg!(
			target: "boot",
			"critical module {} failed ({}), continuing",
			failed_module,
			error
		);
		EmergencyAction::Continue
	}
}

struct BootState {
	stage: BootStage,
	emergency: bool,
	initialized: Vec<(&'static str, fn() -> Result<()>)>,
	boot_count: u64,
}

static STATE: Lazy<SpinLock<BootState>> = Lazy::new(|| {
	SpinLock::new(BootState {
		stage: BootStage::Halted,
		emergency: false,
		initialized: Vec::new(),
		boot_count: 0,
	})
});

/// Current boot stage
pub fn stage() -> BootStage {
	STATE.lock().stage
}

/// Whether emergency mode is (stickily) engaged
pub fn emergency_mode() -> bool {
	STATE.lock().emergency
}

/// Number of completed boot passes, reboots included
pub fn boot_count() -> u64 {
	STATE.lock().boot_count
}

/// Run the init table.
///
/// Returns `Err(Fatal)` only when the console answers a critical failure
/// with shutdown; reboot restarts the table from the top after cleaning
/// up, continue resumes with the next module and clears emergency mode.
pub fn boot(modules: &[InitModule], console: &dyn EmergencyConsole) -> Result<()> {
	let mut order: Vec<&InitModule> = modules.iter().collect();
	order.sort_by_key(|module| module.priority);

	'reboot: loop {
		{
			let mut state = STATE.lock();
			state.stage = BootStage::Booting;
		}
		crate::info!(target: "boot", "booting, {} modules", order.len());
		for module in &order {
			match (module.init)() {
				Ok(()) => {
					STATE.lock().initialized.push((module.name, module.cleanup));
					crate::info!(target: "boot", "{} initialized", module.name);
				}
				Err(error) if !module.critical => {
					crate::warn!(
						target: "boot",
						"module {} failed ({}), boot continues",
						module.name,
						error
					);
				}
				Err(error) => {
					{
						let mut state = STATE.lock();
						state.stage = BootStage::Emergency;
						state.emergency = true;
					}
					crate::emerg!(
						target: "boot",
						"critical module {} failed: {}",
						module.name,
						error
					);
					match console.decide(module.name, error) {
						EmergencyAction::Continue => {
							let mut state = STATE.lock();
							state.emergency = false;
							state.stage = BootStage::Booting;
						}
						EmergencyAction::Shutdown => {
							shutdown();
							STATE.lock().emergency = false;
							return Err(Error::Fatal);
						}
						EmergencyAction::Reboot => {
							shutdown();
							STATE.lock().emergency = false;
							continue 'reboot;
						}
					}
				}
			}
		}
		let mut state = STATE.lock();
		state.stage = BootStage::Complete;
		state.boot_count += 1;
		drop(state);
		crate::info!(target: "boot", "boot complete");
		return Ok(());
	}
}

/// Clean up initialized modules in reverse init order.
///
/// Cleanup errors are logged and do not stop the shutdown.
pub fn shutdown() {
	let initialized: Vec<(&'static str, fn() -> Result<()>)> = {
		let mut state = STATE.lock();
		state.stage = BootStage::Halted;
		state.initialized.drain(..).collect()
	};
	for (name, cleanup) in initialized.into_iter().rev() {
		match cleanup() {
			Ok(()) => crate::info!(target: "boot", "{} cleaned up", name),
			Err(error) => crate::error!(
				target: "boot",
				"cleanup of {} failed: {}",
				name,
				error
			),
		}
	}
}

/// Names of modules currently initialized, in init order
pub fn initialized_modules() -> Vec<&'static str> {
	STATE.lock().initialized.iter().map(|(name, _)| *name).collect()
}

fn cleanup_noop() -> Result<()> {
	Ok(())
}

fn cleanup_irq() -> Result<()> {
	crate::irq::shutdown();
	Ok(())
}

fn cleanup_ktimer() -> Result<()> {
	crate::ktimer::shutdown();
	Ok(())
}

fn cleanup_security() -> Result<()> {
	crate::security::shutdown();
	Ok(())
}

/// Backing storage for the published kernel parameters
struct KernelParams {
	sched_latency_ns: Arc<AtomicU64>,
	sched_min_granularity_ns: Arc<AtomicU64>,
	pid_max: Arc<AtomicI64>,
	hostname: Arc<spin::Mutex<String>>,
	swappiness: Arc<AtomicU64>,
	ip_forward: Arc<AtomicBool>,
	randomize_va_space: Arc<AtomicBool>,
}

static PARAMS: Lazy<KernelParams> = Lazy::new(|| KernelParams {
	sched_latency_ns: Arc::new(AtomicU64::new(6_000_000)),
	sched_min_granularity_ns: Arc::new(AtomicU64::new(750_000)),
	pid_max: Arc::new(AtomicI64::new(32_768)),
	hostname: Arc::new(spin::Mutex::new(String::from("kos"))),
	swappiness: Arc::new(AtomicU64::new(60)),
	ip_forward: Arc::new(AtomicBool::new(false)),
	randomize_va_space: Arc::new(AtomicBool::new(true)),
});

/// Current hostname parameter
pub fn hostname() -> String {
	PARAMS.hostname.lock().clone()
}

fn init_kernel_params() -> Result<()> {
	let entries = [
		CtlEntry::new(
			"kernel.sched_latency_ns",
			"Scheduler latency target",
			CtlFlags::RW,
			CtlValue::U64(PARAMS.sched_latency_ns.clone()),
		)
		.with_bounds(100_000, 1_000_000_000),
		CtlEntry::new(
			"kernel.sched_min_granularity_ns",
			"Minimal preemption granularity",
			CtlFlags::RW,
			CtlValue::U64(PARAMS.sched_min_granularity_ns.clone()),
		)
		.with_bounds(100_000, 1_000_000_000),
		CtlEntry::new(
			"kernel.pid_max",
			"Largest process id plus one",
			CtlFlags::RW,
			CtlValue::I64(PARAMS.pid_max.clone()),
		)
		.with_bounds(301, 4_194_304),
		CtlEntry::new(
			"kernel.hostname",
			"System host name",
			CtlFlags::RW,
			CtlValue::Str(PARAMS.hostname.clone()),
		)
		.with_capacity(256),
		CtlEntry::new(
			"vm.swappiness",
			"Swap aggressiveness",
			CtlFlags::RW,
			CtlValue::U64(PARAMS.swappiness.clone()),
		)
		.with_bounds(0, 100),
		CtlEntry::new(
			"net.ipv4.ip_forward",
			"Forward IPv4 packets between interfaces",
			CtlFlags::RW,
			CtlValue::Bool(PARAMS.ip_forward.clone()),
		),
		CtlEntry::new(
			"kernel.randomize_va_space",
			"Address-space layout randomization",
			CtlFlags::RW | CtlFlags::SECURE,
			CtlValue::Bool(PARAMS.randomize_va_space.clone()),
		),
	];
	for entry in entries {
		match sysctl::register(entry) {
			Ok(()) | Err(Error::Busy) => {}
			Err(e) => return Err(e),
		}
	}
	Ok(())
}

/// The standard init table wiring the whole fabric
pub fn default_modules() -> Vec<InitModule> {
	vec![
		InitModule {
			name: "klog",
			priority: 10,
			critical: true,
			init: crate::klog::init,
			cleanup: cleanup_noop,
		},
		InitModule {
			name: "time",
			priority: 20,
			critical: true,
			init: crate::time::init,
			cleanup: cleanup_noop,
		},
		InitModule {
			name: "sysctl",
			priority: 30,
			critical: true,
			init: crate::sysctl::init,
			cleanup: cleanup_noop,
		},
		InitModule {
			name: "irq",
			priority: 40,
			critical: true,
			init: crate::irq::init,
			cleanup: cleanup_irq,
		},
		InitModule {
			name: "ktimer",
			priority: 50,
			critical: true,
			init: crate::ktimer::init,
			cleanup: cleanup_ktimer,
		},
		InitModule {
			name: "device",
			priority: 60,
			critical: true,
			init: crate::device::init,
			cleanup: cleanup_noop,
		},
		InitModule {
			name: "security",
			priority: 70,
			critical: true,
			init: crate::security::init,
			cleanup: cleanup_security,
		},
		InitModule {
			name: "kernel-params",
			priority: 80,
			critical: false,
			init: init_kernel_params,
			cleanup: cleanup_noop,
		},
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	// Boot state is a process-wide singleton.
	static TEST_LOCK: SpinLock<()> = SpinLock::new(());
	static TRACE: SpinLock<Vec<&'static str>> = SpinLock::new(Vec::new());

	fn trace(event: &'static str) {
		TRACE.lock().push(event);
	}

	fn init_a() -> Result<()> {
		trace("init-a");
		Ok(())
	}
	fn cleanup_a() -> Result<()> {
		trace("cleanup-a");
		Ok(())
	}
	fn init_b() -> Result<()> {
		trace("init-b");
		Ok(())
	}
	fn cleanup_b() -> Result<()> {
		trace("cleanup-b");
		Ok(())
	}
	fn init_fail() -> Result<()> {
		trace("init-fail");
		Err(Error::Io)
	}
	fn cleanup_fail() -> Result<()> {
		trace("cleanup-fail");
		Ok(())
	}

	fn module(
		name: &'static str,
		priority: i32,
		critical: bool,
		init: fn() -> Result<()>,
		cleanup: fn() -> Result<()>,
	) -> InitModule {
		InitModule {
			name,
			priority,
			critical,
			init,
			cleanup,
		}
	}

	struct Scripted(EmergencyAction);

	impl EmergencyConsole for Scripted {
		fn decide(&self, _failed: &str, _error: Error) -> EmergencyAction {
			self.0
		}
	}

	#[test]
	fn cleanup_mirrors_successful_inits_in_reverse() {
		let _guard = TEST_LOCK.lock();
		TRACE.lock().clear();
		let modules = [
			module("b", 20, false, init_b, cleanup_b),
			module("a", 10, false, init_a, cleanup_a),
			module("broken", 30, false, init_fail, cleanup_fail),
		];
		boot(&modules, &AutoContinue).unwrap();
		assert_eq!(initialized_modules(), vec!["a", "b"]);
		shutdown();
		let trace = TRACE.lock().clone();
		// Ascending priority in, reverse order out; the failed module
		// never sees cleanup.
		assert_eq!(
			trace,
			vec!["init-a", "init-b", "init-fail", "cleanup-b", "cleanup-a"]
		);
	}

	#[test]
	fn critical_failure_with_continue_resumes_boot() {
		let _guard = TEST_LOCK.lock();
		TRACE.lock().clear();
		let modules = [
			module("a", 10, false, init_a, cleanup_a),
			module("broken", 20, true, init_fail, cleanup_fail),
			module("b", 30, false, init_b, cleanup_b),
		];
		boot(&modules, &Scripted(EmergencyAction::Continue)).unwrap();
		assert!(!emergency_mode());
		assert_eq!(stage(), BootStage::Complete);
		assert_eq!(initialized_modules(), vec!["a", "b"]);
		shutdown();
	}

	#[test]
	fn critical_failure_with_shutdown_aborts() {
		let _guard = TEST_LOCK.lock();
		TRACE.lock().clear();
		let modules = [
			module("a", 10, false, init_a, cleanup_a),
			module("broken", 20, true, init_fail, cleanup_fail),
			module("b", 30, false, init_b, cleanup_b),
		];
		let err = boot(&modules, &Scripted(EmergencyAction::Shutdown));
		assert_eq!(err, Err(Error::Fatal));
		assert_eq!(stage(), BootStage::Halted);
		// Cleanup covered exactly the successful init.
		let trace = TRACE.lock().clone();
		assert_eq!(trace, vec!["init-a", "init-fail", "cleanup-a"]);
		assert!(!TRACE.lock().contains(&"init-b"));
	}

	#[test]
	fn default_modules_are_priority_ordered() {
		let modules = default_modules();
		let priorities: Vec<i32> = modules.iter().map(|m| m.priority).collect();
		let mut sorted = priorities.clone();
		sorted.sort_unstable();
		assert_eq!(priorities, sorted);
		assert!(modules.iter().any(|m| m.name == "kernel-params"));
	}
}
