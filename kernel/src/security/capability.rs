// SPDX-License-Identifier: GPL-2.0

//! Capability subsystem
//!
//! Five 64-bit masks per subject. A subject starts with the full root-like
//! set; every transition only narrows what it can ever regain.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::types::SubjectId;

/// Capability bit numbers
pub const CAP_CHOWN: u32 = 0;
pub const CAP_DAC_OVERRIDE: u32 = 1;
pub const CAP_FOWNER: u32 = 3;
pub const CAP_KILL: u32 = 5;
pub const CAP_SETGID: u32 = 6;
pub const CAP_SETUID: u32 = 7;
pub const CAP_NET_BIND_SERVICE: u32 = 10;
pub const CAP_NET_ADMIN: u32 = 12;
pub const CAP_NET_RAW: u32 = 13;
pub const CAP_SYS_MODULE: u32 = 16;
pub const CAP_SYS_ADMIN: u32 = 21;
pub const CAP_SYS_BOOT: u32 = 22;
pub const CAP_SYS_TIME: u32 = 25;
pub const CAP_AUDIT_WRITE: u32 = 29;
pub const CAP_AUDIT_CONTROL: u32 = 30;

/// Highest valid capability bit
pub const CAP_LAST: u32 = 40;

/// Every valid capability bit set
pub const CAP_ALL: u64 = (1u64 << (CAP_LAST + 1)) - 1;

/// Mask for one capability bit
pub const fn cap_mask(cap: u32) -> u64 {
	1u64 << cap
}

fn is_subset(a: u64, b: u64) -> bool {
	a & !b == 0
}

/// Per-subject capability masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapSet {
	pub effective: u64,
	pub permitted: u64,
	pub inheritable: u64,
	pub bounding: u64,
	pub ambient: u64,
}

impl CapSet {
	/// Root-like initial set for a freshly seen subject
	pub fn root() -> Self {
		Self {
			effective: CAP_ALL,
			permitted: CAP_ALL,
			inheritable: 0,
			bounding: CAP_ALL,
			ambient: 0,
		}
	}

	/// Fully empty set
	pub fn empty() -> Self {
		Self {
			effective: 0,
			permitted: 0,
			inheritable: 0,
			bounding: 0,
			ambient: 0,
		}
	}
}

static TABLE: Lazy<SpinLock<HashMap<SubjectId, CapSet>>> =
	Lazy::new(|| SpinLock::new(HashMap::new()));

/// Current capability set, creating the subject on first touch
pub fn get(subject: SubjectId) -> CapSet {
	*TABLE.lock().entry(subject).or_insert_with(CapSet::root)
}

/// Replace a subject's capability set under the transition rules.
///
/// Permitted and bounding never grow; effective stays within permitted;
/// inheritable stays within what the subject could pass on. Ambient is
/// governed by [`exec_transition`] alone.
pub fn set(subject: SubjectId, new: CapSet) -> Result<()> {
	let mut table = TABLE.lock();
	let current = *table.entry(subject).or_insert_with(CapSet::root);
	if !is_subset(new.permitted, current.permitted)
		|| !is_subset(new.effective, new.permitted)
		|| !is_subset(new.inheritable, new.permitted & current.bounding)
		|| !is_subset(new.bounding, current.bounding)
	{
		return Err(Error::Permission);
	}
	table.insert(subject, new);
	Ok(())
}

/// Drop one capability across all five masks
pub fn drop_cap(subject: SubjectId, cap: u32) -> Result<()> {
	if cap > CAP_LAST {
		return Err(Error::InvalidParam);
	}
	let mut table = TABLE.lock();
	let set = table.entry(subject).or_insert_with(CapSet::root);
	let mask = !cap_mask(cap);
	set.effective &= mask;
	set.permitted &= mask;
	set.inheritable &= mask;
	set.bounding &= mask;
	set.ambient &= mask;
	Ok(())
}

/// Raise one permitted capability into the effective set
pub fn raise(subject: SubjectId, cap: u32) -> Result<()> {
	if cap > CAP_LAST {
		return Err(Error::InvalidParam);
	}
	let mut table = TABLE.lock();
	let set = table.entry(subject).or_insert_with(CapSet::root);
	if set.permitted & cap_mask(cap) == 0 {
		return Err(Error::Permission);
	}
	set.effective |= cap_mask(cap);
	Ok(())
}

/// Clear one capability from the effective set only
pub fn lower(subject: SubjectId, cap: u32) -> Result<()> {
	if cap > CAP_LAST {
		return Err(Error::InvalidParam);
	}
	let mut table = TABLE.lock();
	let set = table.entry(subject).or_insert_with(CapSet::root);
	set.effective &= !cap_mask(cap);
	Ok(())
}

/// Apply the exec-time transition.
///
/// `has_file_caps` reports whether the executed image carries its own file
/// capabilities; ambient survives only when it does not.
pub fn exec_transition(subject: SubjectId, has_file_caps: bool) -> Result<()> {
	let mut table = TABLE.lock();
	let set = table.entry(subject).or_insert_with(CapSet::root);
	let ambient = if has_file_caps { 0 } else { set.ambient };
	set.permitted = set.inheritable & set.bounding;
	set.effective = ambient;
	set.ambient = ambient;
	Ok(())
}

/// Whether a capability is in the subject's effective set
pub fn capable(subject: SubjectId, cap: u32) -> bool {
	if cap > CAP_LAST {
		return false;
	}
	get(subject).effective & cap_mask(cap) != 0
}

/// Forget a subject entirely
pub fn remove_subject(subject: SubjectId) {
	TABLE.lock().remove(&subject);
}
