// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities

use core::fmt;

/// Kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Caller supplied a null, out-of-range, or structurally invalid argument
	InvalidParam,
	/// Allocation failed
	NoMemory,
	/// A non-blocking operation would have had to wait
	Busy,
	/// Operation vtable lacks the requested method
	NotSupported,
	/// Backing failure (cache flush, device register failure)
	Io,
	/// A bounded wait expired
	Timeout,
	/// Path, device, or id did not exist
	NotFound,
	/// Capability, policy, or write-flag rejected the operation
	Permission,
	/// Critical-boot failure or explicit panic recovery path
	Fatal,
}

impl Error {
	/// Convert error to its negative integer code
	pub fn to_errno(self) -> i32 {
		match self {
			Error::InvalidParam => -1,
			Error::NoMemory => -2,
			Error::Busy => -3,
			Error::NotSupported => -4,
			Error::Io => -5,
			Error::Timeout => -6,
			Error::NotFound => -7,
			Error::Permission => -8,
			Error::Fatal => -9,
		}
	}

	/// Convert an integer code back to an error, if it names one
	pub fn from_errno(errno: i32) -> Option<Self> {
		match errno {
			-1 => Some(Error::InvalidParam),
			-2 => Some(Error::NoMemory),
			-3 => Some(Error::Busy),
			-4 => Some(Error::NotSupported),
			-5 => Some(Error::Io),
			-6 => Some(Error::Timeout),
			-7 => Some(Error::NotFound),
			-8 => Some(Error::Permission),
			-9 => Some(Error::Fatal),
			_ => None,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InvalidParam => write!(f, "Invalid parameter"),
			Error::NoMemory => write!(f, "Out of memory"),
			Error::Busy => write!(f, "Device or resource busy"),
			Error::NotSupported => write!(f, "Operation not supported"),
			Error::Io => write!(f, "I/O error"),
			Error::Timeout => write!(f, "Operation timed out"),
			Error::NotFound => write!(f, "Not found"),
			Error::Permission => write!(f, "Permission denied"),
			Error::Fatal => write!(f, "Fatal error"),
		}
	}
}

impl std::error::Error for Error {}

/// Kernel result type
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn errno_values_match_the_wire_namespace() {
		assert_eq!(Error::InvalidParam.to_errno(), -1);
		assert_eq!(Error::NoMemory.to_errno(), -2);
		assert_eq!(Error::Busy.to_errno(), -3);
		assert_eq!(Error::NotSupported.to_errno(), -4);
		assert_eq!(Error::Io.to_errno(), -5);
		assert_eq!(Error::Timeout.to_errno(), -6);
	}

	#[test]
	fn errno_round_trip() {
		for errno in -9..=-1 {
			let err = Error::from_errno(errno).unwrap();
			assert_eq!(err.to_errno(), errno);
		}
		assert!(Error::from_errno(0).is_none());
		assert!(Error::from_errno(-100).is_none());
	}
}
