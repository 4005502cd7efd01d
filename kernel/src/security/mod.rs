// SPDX-License-Identifier: GPL-2.0

//! Security core
//!
//! Capability sets per subject, a policy engine with an access-vector
//! cache, a per-subject syscall filter engine, and the audit ring. All
//! mediation is advisory within the simulation: callers consult these
//! engines before acting.

pub mod audit;
pub mod capability;
pub mod policy;
pub mod seccomp;

use crate::error::Result;

/// Initialize the security core
pub fn init() -> Result<()> {
	policy::init()?;
	crate::info!(target: "security", "security core initialized");
	Ok(())
}

/// Reverse-order cleanup hook for the boot orchestrator
pub fn shutdown() {
	audit::disable_file_sink();
}
