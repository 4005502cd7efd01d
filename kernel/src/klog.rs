// SPDX-License-Identifier: GPL-2.0

//! Kernel logging
//!
//! Records carry a monotonic sequence number, wall-clock timestamp, level
//! tag, category, source location and message. They land in a bounded ring
//! (oldest dropped, drop counter raised) and nowhere else: formatting and
//! destinations belong to the host application, which either installs its
//! own `log` backend before [`init`] runs or reads the ring.
//!
//! The logger doubles as a [`log::Log`] implementation so records emitted
//! through the standard facade by other crates share the same ring.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

/// Capacity of the record ring
pub const LOG_RING_CAPACITY: usize = 1024;

/// Log levels, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
	Emergency = 0,
	Alert = 1,
	Critical = 2,
	Error = 3,
	Warning = 4,
	Notice = 5,
	Info = 6,
	Debug = 7,
	Trace = 8,
}

impl LogLevel {
	/// Four-character level tag
	pub fn tag(&self) -> &'static str {
		match self {
			LogLevel::Emergency => "EMRG",
			LogLevel::Alert => "ALRT",
			LogLevel::Critical => "CRIT",
			LogLevel::Error => "ERRO",
			LogLevel::Warning => "WARN",
			LogLevel::Notice => "NOTI",
			LogLevel::Info => "INFO",
			LogLevel::Debug => "DEBG",
			LogLevel::Trace => "TRCE",
		}
	}

	fn from_u8(value: u8) -> Self {
		match value {
			0 => LogLevel::Emergency,
			1 => LogLevel::Alert,
			2 => LogLevel::Critical,
			3 => LogLevel::Error,
			4 => LogLevel::Warning,
			5 => LogLevel::Notice,
			6 => LogLevel::Info,
			7 => LogLevel::Debug,
			_ => LogLevel::Trace,
		}
	}
}

impl From<log::Level> for LogLevel {
	fn from(level: log::Level) -> Self {
		match level {
			log::Level::Error => LogLevel::Error,
			log::Level::Warn => LogLevel::Warning,
			log::Level::Info => LogLevel::Info,
			log::Level::Debug => LogLevel::Debug,
			log::Level::Trace => LogLevel::Trace,
		}
	}
}

/// One log record
#[derive(Debug, Clone)]
pub struct LogRecord {
	/// Monotonic sequence number
	pub seq: u64,
	/// Wall-clock milliseconds since the Unix epoch
	pub wall_ms: u64,
	/// Monotonic nanoseconds since boot
	pub mono_ns: u64,
	pub level: LogLevel,
	pub category: String,
	pub module: String,
	pub file: String,
	pub line: u32,
	pub message: String,
}

impl fmt::Display for LogRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"<{}> [{}] {}:{} {} {}",
			self.level.tag(),
			self.category,
			self.file,
			self.line,
			self.module,
			self.message
		)
	}
}

/// Logging statistics
#[derive(Debug, Clone, Default)]
pub struct LogStats {
	pub emitted: u64,
	pub dropped: u64,
	pub by_level: [u64; 9],
}

struct LogRing {
	records: VecDeque<LogRecord>,
	stats: LogStats,
}

struct KernelLogger {
	ring: Lazy<SpinLock<LogRing>>,
	seq: AtomicU64,
	min_level: AtomicU8,
}

static KLOGGER: KernelLogger = KernelLogger {
	ring: Lazy::new(|| {
		SpinLock::new(LogRing {
			records: VecDeque::with_capacity(LOG_RING_CAPACITY),
			stats: LogStats::default(),
		})
	}),
	seq: AtomicU64::new(1),
	min_level: AtomicU8::new(LogLevel::Info as u8),
};

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
		LogLevel::from(metadata.level()) as u8 <= self.min_level.load(Ordering::Relaxed)
	}

	fn log(&self, record: &log::Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		dispatch(
			record.level().into(),
			record.target(),
			record.module_path().unwrap_or("unknown"),
			record.file().unwrap_or("unknown"),
			record.line().unwrap_or(0),
			*record.args(),
		);
	}

	fn flush(&self) {}
}

/// Initialize logging and install the kernel logger as the `log` backend.
///
/// If the host application installed its own backend first, that backend
/// stays; the kernel ring still receives everything emitted through the
/// crate macros.
pub fn init() -> crate::error::Result<()> {
	Lazy::force(&KLOGGER.ring);
	if log::set_logger(&KLOGGER).is_ok() {
		log::set_max_level(log::LevelFilter::Trace);
	}
	Ok(())
}

/// Append one record to the ring; the entry point behind the crate macros
pub fn dispatch(
	level: LogLevel,
	category: &str,
	module: &str,
	file: &str,
	line: u32,
	args: fmt::Arguments<'_>,
) {
	if level as u8 > KLOGGER.min_level.load(Ordering::Relaxed) {
		return;
	}
	let record = LogRecord {
		seq: KLOGGER.seq.fetch_add(1, Ordering::Relaxed),
		wall_ms: SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0),
		mono_ns: crate::time::time_ns(),
		level,
		category: category.into(),
		module: module.into(),
		file: file.into(),
		line,
		message: args.to_string(),
	};
	let mut ring = KLOGGER.ring.lock();
	if ring.records.len() >= LOG_RING_CAPACITY {
		ring.records.pop_front();
		ring.stats.dropped += 1;
	}
	ring.stats.emitted += 1;
	ring.stats.by_level[level as u8 as usize] += 1;
	ring.records.push_back(record);
}

/// Lowest severity that still enters the ring
pub fn set_min_level(level: LogLevel) {
	KLOGGER.min_level.store(level as u8, Ordering::Relaxed);
}

/// Current minimum level
pub fn min_level() -> LogLevel {
	LogLevel::from_u8(KLOGGER.min_level.load(Ordering::Relaxed))
}

/// Copy of the current ring contents, oldest first
pub fn snapshot() -> Vec<LogRecord> {
	KLOGGER.ring.lock().records.iter().cloned().collect()
}

/// Drain the ring, returning its contents
pub fn drain() -> Vec<LogRecord> {
	KLOGGER.ring.lock().records.drain(..).collect()
}

/// Logging statistics snapshot
pub fn stats() -> LogStats {
	KLOGGER.ring.lock().stats.clone()
}

#[macro_export]
macro_rules! emerg {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Emergency, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::emerg!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! error {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Error, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::error!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! warn {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Warning, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::warn!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! notice {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Notice, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::notice!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! info {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Info, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::info!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! debug {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Debug, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::debug!(target: "kernel", $($arg)+) };
}

#[macro_export]
macro_rules! trace {
	(target: $target:expr, $($arg:tt)+) => {
		$crate::klog::dispatch($crate::klog::LogLevel::Trace, $target,
			module_path!(), file!(), line!(), format_args!($($arg)+))
	};
	($($arg:tt)+) => { $crate::trace!(target: "kernel", $($arg)+) };
}
