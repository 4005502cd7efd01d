// SPDX-License-Identifier: GPL-2.0

//! Syscall filter engine
//!
//! Per-subject filter chains over a three-step mode lattice: disabled <
//! strict < filter. The mode only ever climbs. Filter mode scans an
//! ordered list; the first entry whose syscall number and argument
//! predicates match supplies the action.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::security::audit::{self, AuditType};
use crate::types::SubjectId;

/// Maximum syscall argument index
pub const MAX_ARGS: usize = 6;

/// errno delivered when no filter matches
pub const EACCES: u16 = 13;

/// Syscall numbers allowed in strict mode
pub const STRICT_ALLOWED: [u64; 4] = [0, 1, 15, 60]; // read, write, sigreturn, exit

/// Raw action encoding space
pub const RET_KILL_THREAD: u32 = 0x0000_0000;
pub const RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const RET_ERRNO: u32 = 0x0005_0000;
pub const RET_TRACE: u32 = 0x7ff0_0000;
pub const RET_LOG: u32 = 0x7ffc_0000;
pub const RET_ALLOW: u32 = 0x7fff_0000;
pub const RET_DATA_MASK: u32 = 0x0000_FFFF;
pub const RET_ACTION_MASK: u32 = !RET_DATA_MASK;

/// Filter mode lattice, most restrictive last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SeccompMode {
	Disabled = 0,
	Strict = 1,
	Filter = 2,
}

/// Filter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
	Allow,
	Errno(u16),
	Trace,
	Log,
	KillThread,
	KillProcess,
}

impl FilterAction {
	/// Encode into the dedicated integer space
	pub fn to_raw(self) -> u32 {
		match self {
			FilterAction::Allow => RET_ALLOW,
			FilterAction::Errno(errno) => RET_ERRNO | errno as u32,
			FilterAction::Trace => RET_TRACE,
			FilterAction::Log => RET_LOG,
			FilterAction::KillThread => RET_KILL_THREAD,
			FilterAction::KillProcess => RET_KILL_PROCESS,
		}
	}

	/// Decode from the integer space
	pub fn from_raw(raw: u32) -> Option<Self> {
		match raw & RET_ACTION_MASK {
			RET_ALLOW => Some(FilterAction::Allow),
			RET_ERRNO => Some(FilterAction::Errno((raw & RET_DATA_MASK) as u16)),
			RET_TRACE => Some(FilterAction::Trace),
			RET_LOG => Some(FilterAction::Log),
			RET_KILL_THREAD => Some(FilterAction::KillThread),
			RET_KILL_PROCESS => Some(FilterAction::KillProcess),
			_ => None,
		}
	}
}

/// Argument comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgOp {
	Eq,
	Gt,
	Ge,
	Lt,
	Le,
	/// All bits of the operand present in the argument
	MaskedEq,
}

/// One argument predicate
#[derive(Debug, Clone, Copy)]
pub struct ArgCmp {
	pub index: usize,
	pub op: ArgOp,
	pub value: u64,
}

impl ArgCmp {
	fn holds(&self, args: &[u64]) -> bool {
		let arg = args.get(self.index).copied().unwrap_or(0);
		match self.op {
			ArgOp::Eq => arg == self.value,
			ArgOp::Gt => arg > self.value,
			ArgOp::Ge => arg >= self.value,
			ArgOp::Lt => arg < self.value,
			ArgOp::Le => arg <= self.value,
			ArgOp::MaskedEq => arg & self.value == self.value,
		}
	}
}

/// One rule in a subject's chain
#[derive(Debug, Clone)]
pub struct SyscallFilter {
	pub nr: u64,
	pub action: FilterAction,
	pub args: Vec<ArgCmp>,
}

struct SubjectFilters {
	mode: SeccompMode,
	filters: Vec<SyscallFilter>,
}

/// Engine counters
#[derive(Debug, Clone, Default)]
pub struct SeccompStats {
	pub checks: u64,
	pub allowed: u64,
	pub denied: u64,
	pub killed: u64,
}

struct SeccompCore {
	subjects: HashMap<SubjectId, SubjectFilters>,
	stats: SeccompStats,
}

static CORE: Lazy<SpinLock<SeccompCore>> = Lazy::new(|| {
	SpinLock::new(SeccompCore {
		subjects: HashMap::new(),
		stats: SeccompStats::default(),
	})
});

/// Current mode for a subject
pub fn mode_of(subject: SubjectId) -> SeccompMode {
	CORE.lock()
		.subjects
		.get(&subject)
		.map(|s| s.mode)
		.unwrap_or(SeccompMode::Disabled)
}

/// Raise a subject's mode; lowering is a permission error
pub fn set_mode(subject: SubjectId, mode: SeccompMode) -> Result<()> {
	let mut core = CORE.lock();
	let entry = core.subjects.entry(subject).or_insert_with(|| SubjectFilters {
		mode: SeccompMode::Disabled,
		filters: Vec::new(),
	});
	if mode < entry.mode {
		return Err(Error::Permission);
	}
	entry.mode = mode;
	Ok(())
}

/// Append one filter to a subject's chain
pub fn add_filter(subject: SubjectId, filter: SyscallFilter) -> Result<()> {
	if filter.args.iter().any(|cmp| cmp.index >= MAX_ARGS) {
		return Err(Error::InvalidParam);
	}
	let mut core = CORE.lock();
	let entry = core.subjects.entry(subject).or_insert_with(|| SubjectFilters {
		mode: SeccompMode::Disabled,
		filters: Vec::new(),
	});
	entry.filters.push(filter);
	Ok(())
}

/// Number of filters installed for a subject
pub fn filter_count(subject: SubjectId) -> usize {
	CORE.lock()
		.subjects
		.get(&subject)
		.map(|s| s.filters.len())
		.unwrap_or(0)
}

/// Evaluate one syscall against a subject's filter state
pub fn check(subject: SubjectId, nr: u64, args: &[u64]) -> FilterAction {
	let mut core = CORE.lock();
	core.stats.checks += 1;
	let action = match core.subjects.get(&subject) {
		None => FilterAction::Allow,
		Some(state) => match state.mode {
			SeccompMode::Disabled => FilterAction::Allow,
			SeccompMode::Strict => {
				if STRICT_ALLOWED.contains(&nr) {
					FilterAction::Allow
				} else {
					FilterAction::KillProcess
				}
			}
			SeccompMode::Filter => state
				.filters
				.iter()
				.find(|filter| {
					filter.nr == nr && filter.args.iter().all(|cmp| cmp.holds(args))
				})
				.map(|filter| filter.action)
				.unwrap_or(FilterAction::Errno(EACCES)),
		},
	};
	match action {
		FilterAction::Allow | FilterAction::Trace => core.stats.allowed += 1,
		FilterAction::Log => {
			core.stats.allowed += 1;
			drop(core);
			audit::log_event(
				AuditType::Seccomp,
				subject,
				&format!("seccomp: logged syscall {}", nr),
			);
			return action;
		}
		FilterAction::Errno(_) => core.stats.denied += 1,
		FilterAction::KillThread | FilterAction::KillProcess => {
			core.stats.killed += 1;
			drop(core);
			audit::log_event(
				AuditType::Seccomp,
				subject,
				&format!("seccomp: killed on syscall {}", nr),
			);
			return action;
		}
	}
	action
}

/// Engine counter snapshot
pub fn stats() -> SeccompStats {
	CORE.lock().stats.clone()
}

/// Forget a subject entirely
pub fn remove_subject(subject: SubjectId) {
	CORE.lock().subjects.remove(&subject);
}
