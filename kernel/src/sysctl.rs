// SPDX-License-Identifier: GPL-2.0

//! Runtime-configurable parameter tree
//!
//! Hierarchical dotted-path namespace of typed leaves. Subsystems register
//! entries at init and keep ownership of the backing values; the tree owns
//! only metadata. A single reader/writer lock covers the tree: lookups are
//! read-only, registration takes the write side.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use spin::RwLock as SpinRwLock;

use crate::error::{Error, Result};

/// Default capacity for string leaves, bytes including the terminator
pub const DEFAULT_STRING_CAPACITY: usize = 256;

bitflags! {
	/// Entry access flags
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct CtlFlags: u32 {
		/// Readable
		const RD = 0x01;
		/// Writable
		const WR = 0x02;
		/// Writable after boot completes
		const RUNTIME = 0x04;
		/// Security-sensitive; writes are audited
		const SECURE = 0x08;
	}
}

impl CtlFlags {
	pub const RO: CtlFlags = CtlFlags::RD;
	pub const RW: CtlFlags = CtlFlags::RD.union(CtlFlags::WR).union(CtlFlags::RUNTIME);
}

/// Entry value type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlType {
	I32,
	U32,
	I64,
	U64,
	String,
	Bool,
	Node,
}

/// Shared backing storage for a leaf.
///
/// The registering subsystem keeps its own clone of the `Arc` and reads
/// the value directly; the tree goes through the same handle.
#[derive(Clone)]
pub enum CtlValue {
	I32(Arc<AtomicI32>),
	U32(Arc<AtomicU32>),
	I64(Arc<AtomicI64>),
	U64(Arc<AtomicU64>),
	Bool(Arc<AtomicBool>),
	Str(Arc<spin::Mutex<String>>),
	Node,
}

impl CtlValue {
	fn ty(&self) -> CtlType {
		match self {
			CtlValue::I32(_) => CtlType::I32,
			CtlValue::U32(_) => CtlType::U32,
			CtlValue::I64(_) => CtlType::I64,
			CtlValue::U64(_) => CtlType::U64,
			CtlValue::Bool(_) => CtlType::Bool,
			CtlValue::Str(_) => CtlType::String,
			CtlValue::Node => CtlType::Node,
		}
	}
}

/// Per-leaf read/write override.
///
/// A leaf with a handler delegates both directions to it; the raw backing
/// is untouched by the tree.
pub trait CtlHandler: Send + Sync {
	fn read(&self) -> Result<String>;
	fn write(&self, value: &str) -> Result<()>;
}

/// One tree entry
#[derive(Clone)]
pub struct CtlEntry {
	pub path: String,
	pub description: String,
	pub flags: CtlFlags,
	pub value: CtlValue,
	pub min: Option<i64>,
	pub max: Option<i64>,
	/// Byte capacity for string leaves, terminator included
	pub capacity: usize,
	pub handler: Option<Arc<dyn CtlHandler>>,
}

impl CtlEntry {
	pub fn new(path: &str, description: &str, flags: CtlFlags, value: CtlValue) -> Self {
		Self {
			path: path.into(),
			description: description.into(),
			flags,
			value,
			min: None,
			max: None,
			capacity: DEFAULT_STRING_CAPACITY,
			handler: None,
		}
	}

	pub fn with_bounds(mut self, min: i64, max: i64) -> Self {
		self.min = Some(min);
		self.max = Some(max);
		self
	}

	pub fn with_capacity(mut self, capacity: usize) -> Self {
		self.capacity = capacity;
		self
	}

	pub fn with_handler(mut self, handler: Arc<dyn CtlHandler>) -> Self {
		self.handler = Some(handler);
		self
	}
}

/// Read-only description of an entry
#[derive(Debug, Clone)]
pub struct CtlInfo {
	pub path: String,
	pub value: String,
	pub description: String,
	pub ty: CtlType,
	pub flags: CtlFlags,
}

static TREE: Lazy<SpinRwLock<BTreeMap<String, CtlEntry>>> =
	Lazy::new(|| SpinRwLock::new(BTreeMap::new()));

/// Initialize the parameter tree
pub fn init() -> Result<()> {
	Lazy::force(&TREE);
	crate::info!(target: "sysctl", "parameter tree initialized");
	Ok(())
}

fn valid_path(path: &str) -> bool {
	!path.is_empty()
		&& path
			.split('.')
			.all(|comp| !comp.is_empty() && comp.chars().all(|c| {
				c.is_ascii_alphanumeric() || c == '_' || c == '-'
			}))
}

/// Register one entry, creating intermediate nodes as needed
pub fn register(entry: CtlEntry) -> Result<()> {
	if !valid_path(&entry.path) {
		return Err(Error::InvalidParam);
	}
	if matches!(entry.value, CtlValue::Str(_)) && entry.capacity < 2 {
		return Err(Error::InvalidParam);
	}
	let mut tree = TREE.write();
	if tree.contains_key(&entry.path) {
		return Err(Error::Busy);
	}
	// A leaf cannot shadow an existing subtree.
	let subtree_prefix = format!("{}.", entry.path);
	if !matches!(entry.value, CtlValue::Node)
		&& tree.keys().any(|k| k.starts_with(&subtree_prefix))
	{
		return Err(Error::InvalidParam);
	}
	// Ancestors must be nodes, never leaves.
	let mut ancestor = String::new();
	let components: Vec<&str> = entry.path.split('.').collect();
	for comp in &components[..components.len() - 1] {
		if !ancestor.is_empty() {
			ancestor.push('.');
		}
		ancestor.push_str(comp);
		match tree.get(&ancestor) {
			Some(existing) if !matches!(existing.value, CtlValue::Node) => {
				return Err(Error::InvalidParam);
			}
			Some(_) => {}
			None => {
				tree.insert(
					ancestor.clone(),
					CtlEntry::new(&ancestor, "", CtlFlags::RD, CtlValue::Node),
				);
			}
		}
	}
	crate::debug!(target: "sysctl", "registered {}", entry.path);
	tree.insert(entry.path.clone(), entry);
	Ok(())
}

/// Remove one leaf entry
pub fn unregister(path: &str) -> Result<()> {
	let mut tree = TREE.write();
	match tree.get(path) {
		Some(entry) if matches!(entry.value, CtlValue::Node) => Err(Error::InvalidParam),
		Some(_) => {
			tree.remove(path);
			Ok(())
		}
		None => Err(Error::NotFound),
	}
}

fn lookup(path: &str) -> Result<CtlEntry> {
	TREE.read().get(path).cloned().ok_or(Error::NotFound)
}

fn format_value(entry: &CtlEntry) -> Result<String> {
	if let Some(handler) = &entry.handler {
		return handler.read();
	}
	Ok(match &entry.value {
		CtlValue::I32(v) => v.load(Ordering::Relaxed).to_string(),
		CtlValue::U32(v) => v.load(Ordering::Relaxed).to_string(),
		CtlValue::I64(v) => v.load(Ordering::Relaxed).to_string(),
		CtlValue::U64(v) => v.load(Ordering::Relaxed).to_string(),
		CtlValue::Bool(v) => {
			if v.load(Ordering::Relaxed) {
				"1".into()
			} else {
				"0".into()
			}
		}
		CtlValue::Str(v) => v.lock().clone(),
		CtlValue::Node => String::new(),
	})
}

fn check_bounds(entry: &CtlEntry, value: i128) -> Result<()> {
	if let Some(min) = entry.min {
		if value < min as i128 {
			return Err(Error::InvalidParam);
		}
	}
	if let Some(max) = entry.max {
		if value > max as i128 {
			return Err(Error::InvalidParam);
		}
	}
	Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
	match value.trim() {
		"1" | "true" | "y" => Ok(true),
		"0" | "false" | "n" => Ok(false),
		_ => Err(Error::InvalidParam),
	}
}

/// Truncate to at most `max_bytes` without splitting a character
fn truncate_str(value: &str, max_bytes: usize) -> &str {
	if value.len() <= max_bytes {
		return value;
	}
	let mut end = max_bytes;
	while end > 0 && !value.is_char_boundary(end) {
		end -= 1;
	}
	&value[..end]
}

fn store_value(entry: &CtlEntry, value: &str) -> Result<()> {
	if let Some(handler) = &entry.handler {
		return handler.write(value);
	}
	let value = value.trim();
	match &entry.value {
		CtlValue::I32(backing) => {
			let parsed: i32 = value.parse().map_err(|_| Error::InvalidParam)?;
			check_bounds(entry, parsed as i128)?;
			backing.store(parsed, Ordering::Relaxed);
		}
		CtlValue::U32(backing) => {
			let parsed: u32 = value.parse().map_err(|_| Error::InvalidParam)?;
			check_bounds(entry, parsed as i128)?;
			backing.store(parsed, Ordering::Relaxed);
		}
		CtlValue::I64(backing) => {
			let parsed: i64 = value.parse().map_err(|_| Error::InvalidParam)?;
			check_bounds(entry, parsed as i128)?;
			backing.store(parsed, Ordering::Relaxed);
		}
		CtlValue::U64(backing) => {
			let parsed: u64 = value.parse().map_err(|_| Error::InvalidParam)?;
			check_bounds(entry, parsed as i128)?;
			backing.store(parsed, Ordering::Relaxed);
		}
		CtlValue::Bool(backing) => {
			backing.store(parse_bool(value)?, Ordering::Relaxed);
		}
		CtlValue::Str(backing) => {
			let truncated = truncate_str(value, entry.capacity - 1);
			*backing.lock() = truncated.into();
		}
		CtlValue::Node => return Err(Error::NotSupported),
	}
	Ok(())
}

/// Format the entry's value into `buf` with a guaranteed NUL terminator.
///
/// Returns the number of value bytes copied, the terminator excluded.
pub fn read(path: &str, buf: &mut [u8]) -> Result<usize> {
	if buf.is_empty() {
		return Err(Error::InvalidParam);
	}
	let entry = lookup(path)?;
	if !entry.flags.contains(CtlFlags::RD) {
		return Err(Error::Permission);
	}
	let value = format_value(&entry)?;
	let copied = truncate_str(&value, buf.len() - 1);
	buf[..copied.len()].copy_from_slice(copied.as_bytes());
	buf[copied.len()] = 0;
	Ok(copied.len())
}

/// Parse `data` against the entry's type and store it
pub fn write(path: &str, data: &[u8]) -> Result<()> {
	let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
	let value = core::str::from_utf8(&data[..end]).map_err(|_| Error::InvalidParam)?;
	set_string(path, value)
}

/// Write a leaf from its string representation
pub fn set_string(path: &str, value: &str) -> Result<()> {
	let entry = lookup(path)?;
	if !entry.flags.contains(CtlFlags::WR) || !entry.flags.contains(CtlFlags::RUNTIME) {
		return Err(Error::Permission);
	}
	store_value(&entry, value)?;
	if entry.flags.contains(CtlFlags::SECURE) {
		crate::notice!(target: "sysctl", "secure parameter {} changed", path);
	}
	Ok(())
}

/// Read a leaf as its string representation
pub fn get_string(path: &str) -> Result<String> {
	let entry = lookup(path)?;
	if !entry.flags.contains(CtlFlags::RD) {
		return Err(Error::Permission);
	}
	format_value(&entry)
}

/// Describe one entry
pub fn get_info(path: &str) -> Result<CtlInfo> {
	let entry = lookup(path)?;
	let value = format_value(&entry).unwrap_or_default();
	Ok(CtlInfo {
		path: entry.path.clone(),
		value,
		description: entry.description.clone(),
		ty: entry.value.ty(),
		flags: entry.flags,
	})
}

/// Visit every entry below `prefix` in path order.
///
/// An empty prefix visits the whole tree.
pub fn list(prefix: &str, visitor: &mut dyn FnMut(&CtlInfo)) -> Result<()> {
	let entries: Vec<CtlEntry> = {
		let tree = TREE.read();
		tree.values()
			.filter(|e| {
				prefix.is_empty()
					|| e.path == prefix
					|| e.path.starts_with(&format!("{}.", prefix))
			})
			.cloned()
			.collect()
	};
	if entries.is_empty() && !prefix.is_empty() {
		return Err(Error::NotFound);
	}
	for entry in &entries {
		let value = format_value(entry).unwrap_or_default();
		let info = CtlInfo {
			path: entry.path.clone(),
			value,
			description: entry.description.clone(),
			ty: entry.value.ty(),
			flags: entry.flags,
		};
		visitor(&info);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn register_u64(path: &str, initial: u64, flags: CtlFlags) -> Arc<AtomicU64> {
		let backing = Arc::new(AtomicU64::new(initial));
		register(CtlEntry::new(path, "test entry", flags, CtlValue::U64(backing.clone())))
			.unwrap();
		backing
	}

	#[test]
	fn readonly_leaf_rejects_writes() {
		let backing = register_u64("test.sysctl.ro-leaf", 7, CtlFlags::RO);
		assert_eq!(set_string("test.sysctl.ro-leaf", "9"), Err(Error::Permission));
		assert_eq!(backing.load(Ordering::Relaxed), 7);
	}

	#[test]
	fn non_runtime_leaf_rejects_writes() {
		let flags = CtlFlags::RD | CtlFlags::WR;
		let backing = register_u64("test.sysctl.boot-leaf", 1, flags);
		assert_eq!(set_string("test.sysctl.boot-leaf", "2"), Err(Error::Permission));
		assert_eq!(backing.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn bounded_leaf_rejects_out_of_range_and_keeps_backing() {
		let backing = Arc::new(AtomicU64::new(60));
		register(
			CtlEntry::new(
				"test.sysctl.bounded",
				"0..100",
				CtlFlags::RW,
				CtlValue::U64(backing.clone()),
			)
			.with_bounds(0, 100),
		)
		.unwrap();
		assert_eq!(set_string("test.sysctl.bounded", "101"), Err(Error::InvalidParam));
		assert_eq!(backing.load(Ordering::Relaxed), 60);
		set_string("test.sysctl.bounded", "100").unwrap();
		assert_eq!(backing.load(Ordering::Relaxed), 100);
	}

	#[test]
	fn string_leaf_truncates_with_nul() {
		let backing = Arc::new(spin::Mutex::new(String::from("initial")));
		register(
			CtlEntry::new(
				"test.sysctl.name",
				"short string",
				CtlFlags::RW,
				CtlValue::Str(backing.clone()),
			)
			.with_capacity(8),
		)
		.unwrap();
		set_string("test.sysctl.name", "a-very-long-value").unwrap();
		assert_eq!(backing.lock().as_str(), "a-very-");

		let mut buf = [0xFFu8; 4];
		let n = read("test.sysctl.name", &mut buf).unwrap();
		assert_eq!(n, 3);
		assert_eq!(&buf[..4], b"a-v\0");
	}

	#[test]
	fn handler_bypasses_backing() {
		struct Doubler(AtomicU64);
		impl CtlHandler for Doubler {
			fn read(&self) -> Result<String> {
				Ok((self.0.load(Ordering::Relaxed) * 2).to_string())
			}
			fn write(&self, value: &str) -> Result<()> {
				let parsed: u64 = value.parse().map_err(|_| Error::InvalidParam)?;
				self.0.store(parsed, Ordering::Relaxed);
				Ok(())
			}
		}
		let backing = Arc::new(AtomicU64::new(999));
		register(
			CtlEntry::new(
				"test.sysctl.handled",
				"handler delegation",
				CtlFlags::RW,
				CtlValue::U64(backing.clone()),
			)
			.with_handler(Arc::new(Doubler(AtomicU64::new(0)))),
		)
		.unwrap();
		set_string("test.sysctl.handled", "21").unwrap();
		assert_eq!(get_string("test.sysctl.handled").unwrap(), "42");
		// Raw backing untouched.
		assert_eq!(backing.load(Ordering::Relaxed), 999);
	}

	#[test]
	fn duplicate_paths_rejected() {
		register_u64("test.sysctl.unique", 0, CtlFlags::RW);
		let other = Arc::new(AtomicU64::new(0));
		let err = register(CtlEntry::new(
			"test.sysctl.unique",
			"dup",
			CtlFlags::RW,
			CtlValue::U64(other),
		));
		assert_eq!(err.err(), Some(Error::Busy));
	}

	#[test]
	fn list_visits_subtree_in_order() {
		register_u64("test.listing.b", 2, CtlFlags::RW);
		register_u64("test.listing.a", 1, CtlFlags::RW);
		let mut seen = Vec::new();
		list("test.listing", &mut |info| seen.push(info.path.clone())).unwrap();
		assert_eq!(
			seen,
			vec!["test.listing", "test.listing.a", "test.listing.b"]
		);
		assert!(list("test.absent", &mut |_| {}).is_err());
	}
}
