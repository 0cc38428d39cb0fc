//! Completion polling
//!
//! The device has no interrupt line; completion is observed by reading the
//! status register until it turns non-zero. Between reads the thread yields
//! (or sleeps for the configured interval) so other work can run, but the
//! session lock stays held.

use crate::error::{GemminiError, Result};
use crate::mmio::Registers;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Read status until non-zero or `deadline` passes, returning the read count
///
/// # Errors
///
/// Returns `Timeout` once `deadline` has passed with status still zero.
pub fn wait_for_completion(
    registers: &Registers,
    deadline: Instant,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<u32> {
    let mut polls: u32 = 0;
    loop {
        polls = polls.saturating_add(1);
        let status = registers.status();
        if status != 0 {
            debug!("Completion after {polls} polls (status={status:#x})");
            return Ok(polls);
        }
        if Instant::now() > deadline {
            warn!("Device did not complete within {timeout:?} ({polls} polls)");
            return Err(GemminiError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        relax(poll_interval);
    }
}

fn relax(interval: Duration) {
    std::hint::spin_loop();
    if interval.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::RegisterBlock;
    use gemmini_chip::regs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct DoneAfter {
        remaining: AtomicU32,
    }

    impl RegisterBlock for DoneAfter {
        fn read64(&self, offset: usize) -> u64 {
            assert_eq!(offset, regs::STATUS);
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                1
            } else {
                self.remaining.store(left - 1, Ordering::SeqCst);
                0
            }
        }

        fn write64(&self, _offset: usize, _value: u64) {}
    }

    #[test]
    fn returns_poll_count() {
        let regs_drv = Registers::new(Arc::new(DoneAfter {
            remaining: AtomicU32::new(3),
        }));
        let deadline = Instant::now() + Duration::from_secs(5);
        let polls =
            wait_for_completion(&regs_drv, deadline, Duration::from_secs(5), Duration::ZERO)
                .unwrap();
        assert_eq!(polls, 4);
    }

    #[test]
    fn times_out_when_status_stays_zero() {
        let regs_drv = Registers::new(Arc::new(DoneAfter {
            remaining: AtomicU32::new(u32::MAX),
        }));
        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        let err = wait_for_completion(
            &regs_drv,
            start + timeout,
            timeout,
            Duration::from_micros(100),
        )
        .unwrap_err();
        assert!(matches!(err, GemminiError::Timeout { duration_ms: 20 }));
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn already_done_after_deadline_still_succeeds() {
        let regs_drv = Registers::new(Arc::new(DoneAfter {
            remaining: AtomicU32::new(0),
        }));
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(
            wait_for_completion(&regs_drv, past, Duration::from_millis(1), Duration::ZERO)
                .unwrap(),
            1
        );
    }
}
