// SPDX-License-Identifier: GPL-2.0

//! Audit ring and file sink
//!
//! Security-relevant observations enter a bounded ring; the oldest entry
//! gives way when it fills. An optional append-only file sink formats
//! every accepted event with a monotonic sequence number. When no rules
//! are configured every event is accepted; otherwise an event needs at
//! least one enabled matching rule.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::types::SubjectId;

/// Ring capacity
pub const RING_CAPACITY: usize = 1024;

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditType {
	Kernel,
	Syscall,
	Avc,
	Seccomp,
	Config,
	User,
}

impl AuditType {
	pub fn as_str(&self) -> &'static str {
		match self {
			AuditType::Kernel => "KERNEL",
			AuditType::Syscall => "SYSCALL",
			AuditType::Avc => "AVC",
			AuditType::Seccomp => "SECCOMP",
			AuditType::Config => "CONFIG_CHANGE",
			AuditType::User => "USER",
		}
	}
}

/// One security-relevant observation
#[derive(Debug, Clone)]
pub struct AuditEvent {
	pub seq: u64,
	pub timestamp_ns: u64,
	pub wall_ms: u64,
	pub subject: SubjectId,
	pub uid: u32,
	pub gid: u32,
	pub ty: AuditType,
	pub message: String,
	pub comm: String,
	pub exe: String,
}

impl AuditEvent {
	/// Render the file-sink line format
	pub fn format_line(&self) -> String {
		format!(
			"type={} msg=audit({}.{:03}:{}): pid={} uid={} gid={} comm=\"{}\" exe=\"{}\" msg=\"{}\"",
			self.ty.as_str(),
			self.wall_ms / 1000,
			self.wall_ms % 1000,
			self.seq,
			self.subject,
			self.uid,
			self.gid,
			self.comm,
			self.exe,
			self.message
		)
	}
}

/// One filter rule; `None` fields are wildcards
#[derive(Debug, Clone)]
pub struct AuditRule {
	pub ty: Option<AuditType>,
	pub subject: Option<SubjectId>,
	pub contains: Option<String>,
	pub enabled: bool,
}

impl AuditRule {
	fn matches(&self, ty: AuditType, subject: SubjectId, message: &str) -> bool {
		if !self.enabled {
			return false;
		}
		if let Some(rule_ty) = self.ty {
			if rule_ty != ty {
				return false;
			}
		}
		if let Some(rule_subject) = self.subject {
			if rule_subject != subject {
				return false;
			}
		}
		if let Some(needle) = &self.contains {
			if !message.contains(needle.as_str()) {
				return false;
			}
		}
		true
	}
}

/// Ring counters
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
	pub accepted: u64,
	pub filtered: u64,
	pub dropped: u64,
	pub sink_errors: u64,
	pub ring_len: usize,
}

struct AuditCore {
	ring: VecDeque<AuditEvent>,
	rules: Vec<AuditRule>,
	seq: u64,
	sink: Option<File>,
	comm: String,
	exe: String,
	stats: AuditStats,
}

static CORE: Lazy<SpinLock<AuditCore>> = Lazy::new(|| {
	SpinLock::new(AuditCore {
		ring: VecDeque::with_capacity(RING_CAPACITY),
		rules: Vec::new(),
		seq: 1,
		sink: None,
		comm: "kos".into(),
		exe: "/sbin/kos".into(),
		stats: AuditStats::default(),
	})
});

/// Set the process name and executable path stamped on events
pub fn set_process_identity(comm: &str, exe: &str) {
	let mut core = CORE.lock();
	core.comm = comm.into();
	core.exe = exe.into();
}

/// Install one rule
pub fn add_rule(rule: AuditRule) {
	CORE.lock().rules.push(rule);
}

/// Remove every rule; all events are accepted again
pub fn clear_rules() {
	CORE.lock().rules.clear();
}

/// Record an event with explicit credentials
pub fn log_event_full(
	ty: AuditType,
	subject: SubjectId,
	uid: u32,
	gid: u32,
	message: &str,
) {
	let mut core = CORE.lock();
	if !core.rules.is_empty()
		&& !core.rules.iter().any(|rule| rule.matches(ty, subject, message))
	{
		core.stats.filtered += 1;
		return;
	}
	let event = AuditEvent {
		seq: core.seq,
		timestamp_ns: crate::time::time_ns(),
		wall_ms: SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0),
		subject,
		uid,
		gid,
		ty,
		message: message.into(),
		comm: core.comm.clone(),
		exe: core.exe.clone(),
	};
	core.seq += 1;
	if core.ring.len() >= RING_CAPACITY {
		core.ring.pop_front();
		core.stats.dropped += 1;
	}
	core.stats.accepted += 1;
	let line = event.format_line();
	core.ring.push_back(event);
	if let Some(sink) = core.sink.as_mut() {
		if writeln!(sink, "{}", line).is_err() {
			core.stats.sink_errors += 1;
		}
	}
}

/// Record an event; credentials default to the subject id
pub fn log_event(ty: AuditType, subject: SubjectId, message: &str) {
	log_event_full(ty, subject, subject.0, subject.0, message);
}

/// Open (or create) the append-only file sink
pub fn enable_file_sink<P: AsRef<Path>>(path: P) -> Result<()> {
	let file = OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.map_err(|_| Error::Io)?;
	CORE.lock().sink = Some(file);
	Ok(())
}

/// Close the file sink
pub fn disable_file_sink() {
	CORE.lock().sink = None;
}

/// Snapshot of the ring, oldest first
pub fn events() -> Vec<AuditEvent> {
	CORE.lock().ring.iter().cloned().collect()
}

/// Drain the ring
pub fn drain() -> Vec<AuditEvent> {
	CORE.lock().ring.drain(..).collect()
}

/// Counter snapshot
pub fn stats() -> AuditStats {
	let core = CORE.lock();
	let mut stats = core.stats.clone();
	stats.ring_len = core.ring.len();
	stats
}
