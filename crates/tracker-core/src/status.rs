//! Device-wide condition flags shared between the runtime engines and the LED task.

use core::sync::atomic::{AtomicU32, Ordering};

/// Named conditions the runtime can raise.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Loading = 0,
    LowBattery = 1,
    ImuError = 2,
    WifiConnecting = 3,
    ServerConnecting = 4,
    StorageError = 5,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Loading,
        Status::LowBattery,
        Status::ImuError,
        Status::WifiConnecting,
        Status::ServerConnecting,
        Status::StorageError,
    ];

    const fn mask(self) -> u32 {
        1 << (self as u8)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Loading => "LOADING",
            Status::LowBattery => "LOW_BATTERY",
            Status::ImuError => "IMU_ERROR",
            Status::WifiConnecting => "WIFI_CONNECTING",
            Status::ServerConnecting => "SERVER_CONNECTING",
            Status::StorageError => "STORAGE_ERROR",
        }
    }
}

/// Immutable view of the flags at one point in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    bits: u32,
    pub revision: u32,
}

impl StatusSnapshot {
    pub const fn has(self, status: Status) -> bool {
        self.bits & status.mask() != 0
    }

    pub const fn is_clear(self) -> bool {
        self.bits == 0
    }
}

/// Lock-free shared status set.
///
/// Every change bumps `revision` so pollers can skip redundant LED updates.
#[derive(Debug)]
pub struct StatusFlags {
    bits: AtomicU32,
    revision: AtomicU32,
}

impl StatusFlags {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            revision: AtomicU32::new(0),
        }
    }

    pub fn set_status(&self, status: Status, active: bool) {
        let previous = if active {
            self.bits.fetch_or(status.mask(), Ordering::AcqRel)
        } else {
            self.bits.fetch_and(!status.mask(), Ordering::AcqRel)
        };

        if (previous & status.mask() != 0) != active {
            log::debug!(
                "status {} {}",
                status.as_str(),
                if active { "raised" } else { "cleared" }
            );
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn has_status(&self, status: Status) -> bool {
        self.bits.load(Ordering::Acquire) & status.mask() != 0
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            bits: self.bits.load(Ordering::Acquire),
            revision: self.revision.load(Ordering::Acquire),
        }
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::new()
    }
}
