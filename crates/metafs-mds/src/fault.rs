//! Fault injection for exercising error paths.
//!
//! A single armed fail location is checked at fixed points in request
//! handling. With [`FAIL_ONCE`] set, the first hit disarms it.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use tracing::warn;

use crate::types::status;

/// Flag bit: disarm after the first hit.
pub const FAIL_ONCE: u32 = 0x8000_0000;

/// Points in request handling where a failure can be forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FailPoint {
    /// Request body decode; the packet is dropped.
    HandleUnpack = 0x101,
    /// GETATTR after decode.
    GetattrNet = 0x102,
    /// GETATTR before the reply.
    GetattrPack = 0x103,
    /// READPAGE after decode.
    ReadpageNet = 0x104,
    /// READPAGE before the reply.
    ReadpagePack = 0x105,
    /// Bulk send of a page.
    Sendpage = 0x106,
    /// REINT after decode.
    ReintNet = 0x107,
    /// REINT record decode.
    ReintUnpack = 0x108,
    /// OPEN after decode.
    OpenNet = 0x109,
    /// OPEN before the reply.
    OpenPack = 0x10a,
    /// CLOSE after decode.
    CloseNet = 0x10b,
    /// CLOSE before the reply.
    ClosePack = 0x10c,
}

impl FailPoint {
    /// Every fail point.
    pub const ALL: [FailPoint; 12] = [
        FailPoint::HandleUnpack,
        FailPoint::GetattrNet,
        FailPoint::GetattrPack,
        FailPoint::ReadpageNet,
        FailPoint::ReadpagePack,
        FailPoint::Sendpage,
        FailPoint::ReintNet,
        FailPoint::ReintUnpack,
        FailPoint::OpenNet,
        FailPoint::OpenPack,
        FailPoint::CloseNet,
        FailPoint::ClosePack,
    ];

    /// Numeric id.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Looks up a numeric id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Status reported when no status was forced explicitly.
    pub fn default_status(self) -> i32 {
        match self {
            FailPoint::GetattrPack
            | FailPoint::ReadpagePack
            | FailPoint::OpenPack
            | FailPoint::ClosePack => status::ENOMEM,
            FailPoint::ReintUnpack | FailPoint::HandleUnpack => status::EINVAL,
            _ => status::EIO,
        }
    }
}

impl fmt::Display for FailPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x})", self, self.id())
    }
}

/// Shared fail location.
#[derive(Debug, Default)]
pub struct FaultInjector {
    fail_loc: AtomicU32,
    fail_status: AtomicI32,
    hits: AtomicU64,
}

impl FaultInjector {
    /// Creates a disarmed injector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the raw fail location and an optional forced status.
    pub fn set(&self, fail_loc: u32, forced_status: Option<i32>) {
        self.fail_status
            .store(forced_status.unwrap_or(0), Ordering::SeqCst);
        self.fail_loc.store(fail_loc, Ordering::SeqCst);
    }

    /// Arms `point`.
    pub fn arm(&self, point: FailPoint, once: bool, forced_status: Option<i32>) {
        let loc = if once { point.id() | FAIL_ONCE } else { point.id() };
        self.set(loc, forced_status);
    }

    /// Disarms everything.
    pub fn clear(&self) {
        self.set(0, None);
    }

    /// Current raw fail location.
    pub fn fail_loc(&self) -> u32 {
        self.fail_loc.load(Ordering::SeqCst)
    }

    /// Number of times a point fired.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// True if `point` fires now. A ONCE location fires for one caller only.
    pub fn check(&self, point: FailPoint) -> bool {
        let loc = self.fail_loc.load(Ordering::SeqCst);
        if loc == 0 || loc & !FAIL_ONCE != point.id() {
            return false;
        }
        if loc & FAIL_ONCE != 0
            && self
                .fail_loc
                .compare_exchange(loc, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return false;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        warn!(point = %point, "fail point hit");
        true
    }

    /// Status to report if `point` fires now.
    pub fn checkpoint(&self, point: FailPoint) -> Option<i32> {
        if !self.check(point) {
            return None;
        }
        match self.fail_status.load(Ordering::SeqCst) {
            0 => Some(point.default_status()),
            forced => Some(forced),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_fires() {
        let injector = FaultInjector::new();
        for point in FailPoint::ALL {
            assert!(injector.checkpoint(point).is_none());
        }
        assert_eq!(injector.hits(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        for point in FailPoint::ALL {
            assert_eq!(FailPoint::from_id(point.id()), Some(point));
        }
        assert_eq!(FailPoint::from_id(0x999), None);
    }

    #[test]
    fn test_persistent_point_keeps_firing() {
        let injector = FaultInjector::new();
        injector.arm(FailPoint::GetattrNet, false, Some(-5));
        assert_eq!(injector.checkpoint(FailPoint::GetattrNet), Some(-5));
        assert_eq!(injector.checkpoint(FailPoint::GetattrNet), Some(-5));
        assert!(injector.checkpoint(FailPoint::OpenNet).is_none());
        assert_eq!(injector.hits(), 2);
    }

    #[test]
    fn test_once_point_disarms() {
        let injector = FaultInjector::new();
        injector.arm(FailPoint::GetattrPack, true, None);
        assert_eq!(
            injector.checkpoint(FailPoint::GetattrPack),
            Some(status::ENOMEM)
        );
        assert!(injector.checkpoint(FailPoint::GetattrPack).is_none());
        assert_eq!(injector.fail_loc(), 0);
    }

    #[test]
    fn test_raw_fail_loc() {
        let injector = FaultInjector::new();
        injector.set(0x8000_0108, None);
        assert_eq!(
            injector.checkpoint(FailPoint::ReintUnpack),
            Some(status::EINVAL)
        );
        assert!(!injector.check(FailPoint::ReintUnpack));
    }

    #[test]
    fn test_clear() {
        let injector = FaultInjector::new();
        injector.arm(FailPoint::Sendpage, false, None);
        injector.clear();
        assert!(!injector.check(FailPoint::Sendpage));
    }
}
