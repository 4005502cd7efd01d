// SPDX-License-Identifier: GPL-2.0

//! Commonly used kernel types

pub use crate::device::{Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState};
pub use crate::driver::Driver;
pub use crate::error::{Error, Result};
pub use crate::sync::{Arc, Semaphore, SpinLock, SpinRwLock, WaitQueue};
pub use crate::types::{DeviceNumber, Jiffies, SubjectId};
