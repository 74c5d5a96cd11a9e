//! Various auxillary types

use serde::{Deserialize, Serialize};

/// A virtual address in the target process
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Hash)]
pub struct VirtAddr(pub u64);

impl From<u64> for VirtAddr {
    fn from(val: u64) -> VirtAddr {
        VirtAddr(val)
    }
}

impl VirtAddr {
    /// Return a [`VirtAddr`] `offset` bytes away from `self`
    ///
    /// Example:
    ///
    /// ```
    /// use taintrace::VirtAddr;
    ///
    /// let page = VirtAddr(0xdead_0000);
    /// let entry = page.offset(0x1234);
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn offset(self, offset: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(offset))
    }
}

impl std::ops::Deref for VirtAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for VirtAddr {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let no_prefix = s.trim_start_matches("0x");

        // Attempt to parse the hex digit
        Ok(VirtAddr(u64::from_str_radix(no_prefix, 16)?))
    }
}
