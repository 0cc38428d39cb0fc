//! Per-device submission session
//!
//! One [`DeviceSession`] exists per mapped register block. It serializes
//! submissions with a single lock that guards the register driver itself:
//! the registers are only reachable through the lock guard, so exactly one
//! submission can program or poll the device at a time. Everything a
//! submission allocates lives inside the guard's scope and is released on
//! every return path.
//!
//! ```text
//! submit ─► lock ─► size plan ─► allocate M,K,O ─► copy in ─► program
//!                                                              │
//!   unlock ◄─ free M,K,O ◄─ copy out ◄─ poll STATUS ◄─ START ◄─┘
//! ```

use crate::config::DriverConfig;
use crate::control::ControlHandle;
use crate::dma::{DmaAllocator, OperandBuffers};
use crate::error::Result;
use crate::mmio::{RegisterBlock, RegisterImage, Registers};
use crate::poll;
use crate::request::Request;
use crate::sizing::SizePlan;
use crate::user::UserMemory;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Whether a submission currently holds the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No submission in flight
    Idle,
    /// A submission holds the device lock
    Busy,
}

/// Outcome of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Buffer sizes used
    pub plan: SizePlan,
    /// Status reads until completion was observed
    pub polls: u32,
    /// Time from the start pulse to completion
    pub device_time: Duration,
}

/// Submission front end for one accelerator instance
#[derive(Debug)]
pub struct DeviceSession {
    registers: Mutex<Registers>,
    dma: Arc<dyn DmaAllocator>,
    config: DriverConfig,
    submissions: AtomicU64,
}

impl DeviceSession {
    /// Session over a mapped register block and a DMA allocator
    pub fn new(
        block: Arc<dyn RegisterBlock>,
        dma: Arc<dyn DmaAllocator>,
        config: DriverConfig,
    ) -> Self {
        info!(
            "Opened GemminiDevA session (timeout {:?}, DMA mask {} bits)",
            config.timeout, config.dma_mask_bits
        );
        Self {
            registers: Mutex::new(Registers::new(block)),
            dma,
            config,
            submissions: AtomicU64::new(0),
        }
    }

    /// New control-channel handle sharing this session
    pub fn open(self: &Arc<Self>) -> ControlHandle {
        ControlHandle::new(Arc::clone(self))
    }

    /// Configuration in effect
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Number of submissions that have finished, successfully or not
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Idle or busy
    pub fn state(&self) -> SessionState {
        if self.registers.is_locked() {
            SessionState::Busy
        } else {
            SessionState::Idle
        }
    }

    /// Run `request` to completion
    ///
    /// Blocks while another submission holds the device. Input buffers are
    /// read from `user` before the device starts; the output is written to
    /// `user` after it completes.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a request the size rules reject or that lacks
    ///   a required caller address; nothing is allocated
    /// - `OutOfMemory` if a buffer cannot be allocated; the device is not touched
    /// - `Fault` if caller memory cannot be read (device not touched) or the
    ///   result cannot be written back (device already ran)
    /// - `Timeout` if the device does not complete within the configured bound
    ///
    /// In every case all buffers are freed and the session is idle again on return.
    pub fn submit(&self, request: &Request, user: &dyn UserMemory) -> Result<Completion> {
        let registers = self.registers.lock();
        let result = self.run_locked(&registers, request, user);
        self.submissions.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            warn!("{} m={} k={} failed: {e}", request.opcode(), request.m_size(), request.k_size());
        }
        result
    }

    fn run_locked(
        &self,
        registers: &Registers,
        request: &Request,
        user: &dyn UserMemory,
    ) -> Result<Completion> {
        let plan = request.plan()?;
        request.check_operands(&plan)?;
        debug!(
            "Submit {} m={} k={}: m={}B k={}B o={}B",
            request.opcode(),
            request.m_size(),
            request.k_size(),
            plan.m_bytes(),
            plan.k_bytes(),
            plan.o_bytes()
        );

        let mut buffers = OperandBuffers::allocate(self.dma.as_ref(), &plan)?;
        buffers.stage(user, request)?;

        let image = RegisterImage::new(request, &plan, &buffers);
        registers.program(&image);
        registers.start();
        let started = Instant::now();
        let deadline = self.config.deadline_from(started);

        let polls = poll::wait_for_completion(
            registers,
            deadline,
            self.config.timeout,
            self.config.poll_interval,
        )?;
        let device_time = started.elapsed();

        buffers.retrieve(user, request.o_user())?;

        Ok(Completion {
            plan,
            polls,
            device_time,
        })
    }
}
