// SPDX-License-Identifier: GPL-2.0

//! TTY pipeline
//!
//! Line discipline with raw, cooked and cbreak modes. Received characters
//! pass through editing, echo and signal generation before readers see
//! them; output passes through ONLCR mapping into a bounded ring the host
//! drains. Control-character signals go to the negative process-group id
//! through a pluggable sink; a bounded queue records them for observers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use spin::Mutex as SpinLock;

use crate::device::{
	self, ioctl, Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState,
};
use crate::error::{Error, Result};
use crate::sync::WaitQueue;
use crate::types::DeviceNumber;

/// Control-character table size
pub const NCCS: usize = 8;

/// Control-character table indices
pub const VINTR: usize = 0;
pub const VSUSP: usize = 1;
pub const VEOF: usize = 2;
pub const VERASE: usize = 3;

/// Input ring capacity in bytes
pub const INPUT_CAPACITY: usize = 4096;

/// Output ring capacity in bytes
pub const OUTPUT_CAPACITY: usize = 4096;

/// Cooked-mode line buffer capacity
pub const LINE_CAPACITY: usize = 256;

/// Recorded-signal queue capacity
pub const SIGNAL_QUEUE_CAPACITY: usize = 32;

bitflags! {
	/// Input mode flags
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct InputFlags: u32 {
		/// Map CR to NL on input
		const ICRNL = 0x0100;
	}
}

bitflags! {
	/// Output mode flags
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct OutputFlags: u32 {
		/// Output processing enabled
		const OPOST = 0x0001;
		/// Emit CR before NL
		const ONLCR = 0x0004;
	}
}

bitflags! {
	/// Local mode flags
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct LocalFlags: u32 {
		/// Generate signals for control characters
		const ISIG = 0x0001;
		/// Canonical (line) input
		const ICANON = 0x0002;
		/// Echo received characters
		const ECHO = 0x0008;
	}
}

/// Terminal attribute block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
	pub iflag: InputFlags,
	pub oflag: OutputFlags,
	pub cflag: u32,
	pub lflag: LocalFlags,
	pub cc: [u8; NCCS],
}

impl Termios {
	fn default_cc() -> [u8; NCCS] {
		let mut cc = [0u8; NCCS];
		cc[VINTR] = 0x03; // ^C
		cc[VSUSP] = 0x1A; // ^Z
		cc[VEOF] = 0x04; // ^D
		cc[VERASE] = 0x7F; // DEL
		cc
	}

	/// Canonical defaults: editing, echo and signals on
	pub fn cooked() -> Self {
		Self {
			iflag: InputFlags::ICRNL,
			oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
			cflag: 0,
			lflag: LocalFlags::ISIG | LocalFlags::ICANON | LocalFlags::ECHO,
			cc: Self::default_cc(),
		}
	}

	/// Raw defaults: every byte delivered verbatim
	pub fn raw() -> Self {
		Self {
			iflag: InputFlags::empty(),
			oflag: OutputFlags::empty(),
			cflag: 0,
			lflag: LocalFlags::empty(),
			cc: Self::default_cc(),
		}
	}

	/// Cbreak defaults: immediate delivery, signals still generated
	pub fn cbreak() -> Self {
		Self {
			iflag: InputFlags::empty(),
			oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
			cflag: 0,
			lflag: LocalFlags::ISIG,
			cc: Self::default_cc(),
		}
	}
}

/// Line-discipline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyMode {
	Raw,
	Cooked,
	Cbreak,
}

/// Window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Winsize {
	pub rows: u16,
	pub cols: u16,
}

/// Signals the discipline can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
	Interrupt = 2,
	TermStop = 20,
	WindowChange = 28,
}

/// Receives `(target, signal)` pairs; target is the negative group id
pub type SignalSink = Arc<dyn Fn(i32, Signal) + Send + Sync>;

/// Pipeline counters
#[derive(Debug, Clone, Default)]
pub struct TtyStats {
	pub chars_received: u64,
	pub chars_read: u64,
	pub chars_output: u64,
	pub lines_assembled: u64,
	pub signals_sent: u64,
	pub input_dropped: u64,
	pub output_dropped: u64,
	pub line_overruns: u64,
}

struct TtyInner {
	termios: Termios,
	mode: TtyMode,
	winsize: Winsize,
	input: VecDeque<u8>,
	lines_ready: usize,
	line: Vec<u8>,
	output: VecDeque<u8>,
	eof: bool,
	pgrp: i32,
	stats: TtyStats,
}

/// TTY pipeline state
pub struct TtyState {
	inner: Mutex<TtyInner>,
	readers: WaitQueue,
	signals: SpinLock<VecDeque<(i32, Signal)>>,
	signals_dropped: SpinLock<u64>,
	sink: SpinLock<Option<SignalSink>>,
}

impl TtyState {
	fn new() -> Self {
		Self {
			inner: Mutex::new(TtyInner {
				termios: Termios::cooked(),
				mode: TtyMode::Cooked,
				winsize: Winsize { rows: 24, cols: 80 },
				input: VecDeque::with_capacity(INPUT_CAPACITY),
				lines_ready: 0,
				line: Vec::with_capacity(LINE_CAPACITY),
				output: VecDeque::with_capacity(OUTPUT_CAPACITY),
				eof: false,
				pgrp: 0,
				stats: TtyStats::default(),
			}),
			readers: WaitQueue::new(),
			signals: SpinLock::new(VecDeque::with_capacity(SIGNAL_QUEUE_CAPACITY)),
			signals_dropped: SpinLock::new(0),
			sink: SpinLock::new(None),
		}
	}
}

fn tty_state(dev: &Device) -> Result<&TtyState> {
	match dev.state() {
		DeviceState::Tty(state) => Ok(state),
		_ => Err(Error::InvalidParam),
	}
}

fn push_signal(state: &TtyState, inner: &mut TtyInner, signal: Signal) {
	let target = -inner.pgrp;
	inner.stats.signals_sent += 1;
	{
		let mut queue = state.signals.lock();
		if queue.len() >= SIGNAL_QUEUE_CAPACITY {
			queue.pop_front();
			*state.signals_dropped.lock() += 1;
		}
		queue.push_back((target, signal));
	}
	let sink = state.sink.lock().clone();
	if let Some(sink) = sink {
		sink(target, signal);
	}
}

fn push_output_byte(inner: &mut TtyInner, byte: u8) {
	if inner.output.len() >= OUTPUT_CAPACITY {
		inner.output.pop_front();
		inner.stats.output_dropped += 1;
	}
	inner.output.push_back(byte);
	inner.stats.chars_output += 1;
}

/// Output processing: ONLCR maps NL to CR-NL
fn output_processed(inner: &mut TtyInner, byte: u8) {
	let oflag = inner.termios.oflag;
	if byte == b'\n'
		&& oflag.contains(OutputFlags::OPOST)
		&& oflag.contains(OutputFlags::ONLCR)
	{
		push_output_byte(inner, b'\r');
	}
	push_output_byte(inner, byte);
}

fn echo_byte(inner: &mut TtyInner, byte: u8) {
	if inner.termios.lflag.contains(LocalFlags::ECHO) {
		output_processed(inner, byte);
	}
}

fn echo_erase(inner: &mut TtyInner) {
	if inner.termios.lflag.contains(LocalFlags::ECHO) {
		for byte in [0x08, b' ', 0x08] {
			push_output_byte(inner, byte);
		}
	}
}

fn push_input_byte(inner: &mut TtyInner, byte: u8) {
	if inner.input.len() >= INPUT_CAPACITY {
		inner.input.pop_front();
		inner.stats.input_dropped += 1;
	}
	inner.input.push_back(byte);
}

/// Commit the line buffer, newline included, to the input ring
fn commit_line(inner: &mut TtyInner) {
	let line: Vec<u8> = inner.line.drain(..).collect();
	for byte in line {
		push_input_byte(inner, byte);
	}
	push_input_byte(inner, b'\n');
	inner.lines_ready += 1;
	inner.stats.lines_assembled += 1;
}

/// Feed one received character through the discipline
pub fn receive_input(dev: &Device, byte: u8) -> Result<()> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.stats.chars_received += 1;
	let lflag = inner.termios.lflag;
	let cc = inner.termios.cc;

	if lflag.contains(LocalFlags::ISIG) {
		if byte == cc[VINTR] {
			push_signal(state, &mut inner, Signal::Interrupt);
			return Ok(());
		}
		if byte == cc[VSUSP] {
			push_signal(state, &mut inner, Signal::TermStop);
			return Ok(());
		}
		if byte == cc[VEOF] {
			inner.eof = true;
			drop(inner);
			state.readers.notify_all();
			return Ok(());
		}
	}

	match inner.mode {
		TtyMode::Cooked => {
			if byte == 0x08 || byte == cc[VERASE] {
				if !inner.line.is_empty() {
					inner.line.pop();
					echo_erase(&mut inner);
				}
			} else if byte == b'\n'
				|| (byte == b'\r' && inner.termios.iflag.contains(InputFlags::ICRNL))
			{
				commit_line(&mut inner);
				echo_byte(&mut inner, b'\n');
				drop(inner);
				state.readers.notify_all();
			} else if inner.line.len() < LINE_CAPACITY {
				inner.line.push(byte);
				echo_byte(&mut inner, byte);
			} else {
				inner.stats.line_overruns += 1;
			}
		}
		TtyMode::Raw | TtyMode::Cbreak => {
			push_input_byte(&mut inner, byte);
			echo_byte(&mut inner, byte);
			drop(inner);
			state.readers.notify_all();
		}
	}
	Ok(())
}

/// Feed a whole buffer through the discipline
pub fn receive_bytes(dev: &Device, bytes: &[u8]) -> Result<()> {
	for &byte in bytes {
		receive_input(dev, byte)?;
	}
	Ok(())
}

fn dev_read(dev: &Device, buf: &mut [u8], _offset: u64) -> Result<usize> {
	let state = tty_state(dev)?;
	if buf.is_empty() {
		return Ok(0);
	}
	let nonblock = dev.flags().contains(DeviceFlags::NONBLOCK);
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	let canonical = inner.mode == TtyMode::Cooked;
	let ready = |inner: &mut TtyInner| {
		if inner.eof {
			return true;
		}
		if inner.mode == TtyMode::Cooked {
			inner.lines_ready > 0
		} else {
			!inner.input.is_empty()
		}
	};
	let mut probe = ready;
	if !probe(&mut inner) {
		if nonblock {
			return Err(Error::Busy);
		}
		inner = state.readers.wait_until(inner, None, &mut probe)?;
	}
	if inner.input.is_empty() {
		// EOF with nothing pending.
		return Ok(0);
	}
	let count = buf.len().min(inner.input.len());
	let mut copied = 0;
	while copied < count {
		let byte = match inner.input.pop_front() {
			Some(byte) => byte,
			None => break,
		};
		buf[copied] = byte;
		copied += 1;
		if canonical && byte == b'\n' && inner.lines_ready > 0 {
			inner.lines_ready -= 1;
		}
	}
	inner.stats.chars_read += copied as u64;
	Ok(copied)
}

fn dev_write(dev: &Device, data: &[u8], _offset: u64) -> Result<usize> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	for &byte in data {
		output_processed(&mut inner, byte);
	}
	Ok(data.len())
}

fn dev_flush(dev: &Device) -> Result<()> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.input.clear();
	inner.output.clear();
	inner.line.clear();
	inner.lines_ready = 0;
	Ok(())
}

fn dev_ioctl(dev: &Device, cmd: u32, _arg: usize) -> Result<usize> {
	let state = tty_state(dev)?;
	match cmd {
		ioctl::TTYSETRAW => {
			let mut inner =
				state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			inner.mode = TtyMode::Raw;
			inner.termios = Termios::raw();
			inner.line.clear();
			inner.lines_ready = 0;
			Ok(0)
		}
		ioctl::TTYSETCOOKED => {
			let mut inner =
				state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			inner.mode = TtyMode::Cooked;
			inner.termios = Termios::cooked();
			Ok(0)
		}
		ioctl::TTYGETATTR => {
			let inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			Ok(inner.termios.lflag.bits() as usize)
		}
		ioctl::RESET => {
			dev_flush(dev)?;
			Ok(0)
		}
		ioctl::GET_INFO => {
			let inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
			crate::info!(
				target: "tty",
				"{}: mode {:?} winsize {}x{} in {} out {} lines {} signals {}",
				dev.name(),
				inner.mode,
				inner.winsize.rows,
				inner.winsize.cols,
				inner.stats.chars_received,
				inner.stats.chars_output,
				inner.stats.lines_assembled,
				inner.stats.signals_sent
			);
			Ok(0)
		}
		_ => Err(Error::NotSupported),
	}
}

const TTY_OPS: DeviceOps = DeviceOps {
	read: Some(dev_read),
	write: Some(dev_write),
	ioctl: Some(dev_ioctl),
	flush: Some(dev_flush),
};

/// Create and register a TTY device in cooked mode
pub fn create(name: &str, flags: DeviceFlags) -> Result<Arc<Device>> {
	let device = Device::new(
		name,
		DeviceClass::Tty,
		DeviceNumber::new(0, 0),
		flags,
		TTY_OPS,
		DeviceState::Tty(TtyState::new()),
	);
	device::register_device(device)
}

/// Switch the line-discipline mode, loading its default attributes
pub fn set_mode(dev: &Device, mode: TtyMode) -> Result<()> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.mode = mode;
	inner.termios = match mode {
		TtyMode::Raw => Termios::raw(),
		TtyMode::Cooked => Termios::cooked(),
		TtyMode::Cbreak => Termios::cbreak(),
	};
	if mode != TtyMode::Cooked {
		inner.line.clear();
		inner.lines_ready = 0;
	}
	Ok(())
}

/// Current mode
pub fn mode(dev: &Device) -> Result<TtyMode> {
	let state = tty_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.mode)
}

/// Terminal attributes snapshot
pub fn get_termios(dev: &Device) -> Result<Termios> {
	let state = tty_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.termios)
}

/// Replace the terminal attributes
pub fn set_termios(dev: &Device, termios: Termios) -> Result<()> {
	let state = tty_state(dev)?;
	state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.termios = termios;
	Ok(())
}

/// Set the foreground process group for signal delivery
pub fn set_pgrp(dev: &Device, pgrp: i32) -> Result<()> {
	if pgrp < 0 {
		return Err(Error::InvalidParam);
	}
	let state = tty_state(dev)?;
	state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.pgrp = pgrp;
	Ok(())
}

/// Foreground process group
pub fn pgrp(dev: &Device) -> Result<i32> {
	let state = tty_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.pgrp)
}

/// Change the window size, notifying the foreground group with SIGWINCH
pub fn set_winsize(dev: &Device, winsize: Winsize) -> Result<()> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	inner.winsize = winsize;
	push_signal(state, &mut inner, Signal::WindowChange);
	Ok(())
}

/// Current window size
pub fn winsize(dev: &Device) -> Result<Winsize> {
	let state = tty_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.winsize)
}

/// Install the signal sink
pub fn set_signal_sink(dev: &Device, sink: SignalSink) -> Result<()> {
	let state = tty_state(dev)?;
	*state.sink.lock() = Some(sink);
	Ok(())
}

/// Drain the recorded signal queue
pub fn take_signals(dev: &Device) -> Result<Vec<(i32, Signal)>> {
	let state = tty_state(dev)?;
	Ok(state.signals.lock().drain(..).collect())
}

/// Drain processed output into `buf`; never blocks
pub fn drain_output(dev: &Device, buf: &mut [u8]) -> Result<usize> {
	let state = tty_state(dev)?;
	let mut inner = state.inner.lock().unwrap_or_else(PoisonError::into_inner);
	let count = buf.len().min(inner.output.len());
	for slot in buf.iter_mut().take(count) {
		*slot = match inner.output.pop_front() {
			Some(byte) => byte,
			None => break,
		};
	}
	Ok(count)
}

/// Pipeline counter snapshot
pub fn stats(dev: &Device) -> Result<TtyStats> {
	let state = tty_state(dev)?;
	Ok(state
		.inner
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.stats
		.clone())
}
