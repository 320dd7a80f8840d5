//! Monotonic time sources.
//!
//! Exemption expiries are compared against a clock the user cannot move by
//! editing the wall-clock time. Readings are plain milliseconds so they can be
//! persisted; the timeline id says which readings are comparable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic millisecond clock with a named timeline.
pub trait MonotonicClock: Send + Sync + fmt::Debug {
    /// Milliseconds elapsed on this clock's timeline. Never decreases.
    fn now_ms(&self) -> u64;

    /// Identity of the timeline. Two readings are only comparable when they
    /// were taken on clocks with equal ids.
    fn timeline_id(&self) -> &str;
}

/// Production clock.
///
/// Reads a clock that keeps counting through suspend and is shared by every
/// process of the same boot: `CLOCK_BOOTTIME` on Linux, `CLOCK_MONOTONIC` on
/// macOS. The timeline is named after the kernel boot id (Linux) or boot
/// session uuid (macOS), so persisted exemptions survive a daemon restart but
/// not a reboot. Other platforms count from process start on a fresh
/// timeline, so persisted exemptions never outlive the granting process.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    origin_ms: u64,
    boot_clock: bool,
    timeline_id: String,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        if let (Some(origin_ms), Some(boot_id)) = (boot_clock_ms(), boot_session_id()) {
            return Self {
                origin: Instant::now(),
                origin_ms,
                boot_clock: true,
                timeline_id: format!("boot:{boot_id}"),
            };
        }

        Self {
            origin: Instant::now(),
            origin_ms: 0,
            boot_clock: false,
            timeline_id: format!("process:{}", uuid::Uuid::new_v4()),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u64 {
        if self.boot_clock {
            if let Some(ms) = boot_clock_ms() {
                return ms.max(self.origin_ms);
            }
        }
        self.elapsed_ms()
    }

    fn timeline_id(&self) -> &str {
        &self.timeline_id
    }
}

#[cfg(target_os = "linux")]
fn boot_clock_ms() -> Option<u64> {
    clock_gettime_ms(libc::CLOCK_BOOTTIME)
}

// Darwin's CLOCK_MONOTONIC is backed by mach_continuous_time and includes sleep
#[cfg(target_os = "macos")]
fn boot_clock_ms() -> Option<u64> {
    clock_gettime_ms(libc::CLOCK_MONOTONIC)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn boot_clock_ms() -> Option<u64> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[allow(unsafe_code)]
fn clock_gettime_ms(clock: libc::clockid_t) -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u64::try_from(ts.tv_nsec).ok()?;
    Some(secs.saturating_mul(1000).saturating_add(nanos / 1_000_000))
}

#[cfg(target_os = "linux")]
fn boot_session_id() -> Option<String> {
    let id = std::fs::read_to_string("/proc/sys/kernel/random/boot_id").ok()?;
    non_empty(&id)
}

#[cfg(target_os = "macos")]
#[allow(unsafe_code)]
fn boot_session_id() -> Option<String> {
    let mut buf = [0u8; 64];
    let mut len = buf.len();
    // SAFETY: the name is NUL-terminated, `buf` is writable for `len` bytes and
    // `len` is updated in place by the kernel.
    let rc = unsafe {
        libc::sysctlbyname(
            b"kern.bootsessionuuid\0".as_ptr().cast(),
            buf.as_mut_ptr().cast(),
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        return None;
    }
    let raw = buf[..len.min(buf.len())].split(|b| *b == 0).next()?;
    non_empty(std::str::from_utf8(raw).ok()?)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn boot_session_id() -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn non_empty(id: &str) -> Option<String> {
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    timeline_id: String,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self::on_timeline(start_ms, "manual")
    }

    #[must_use]
    pub fn on_timeline(start_ms: u64, timeline_id: &str) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            timeline_id: timeline_id.to_string(),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .now_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }
}

impl MonotonicClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn timeline_id(&self) -> &str {
        &self.timeline_id
    }
}
