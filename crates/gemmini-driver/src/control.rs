//! Control channel
//!
//! The character-device view of a session: callers issue numbered commands
//! with a pointer-sized argument, exactly as they would through `ioctl(2)`.
//! Only [`ioctl::RUN`] is understood; its argument is the caller address of
//! a [`RawRequest`].

use crate::error::{GemminiError, Result};
use crate::request::{RawRequest, Request};
use crate::session::{Completion, DeviceSession};
use crate::user::UserMemory;
use gemmini_chip::ioctl;
use std::sync::Arc;
use tracing::debug;

/// An open handle on a device session
#[derive(Debug, Clone)]
pub struct ControlHandle {
    session: Arc<DeviceSession>,
}

impl ControlHandle {
    pub(crate) const fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    /// Session behind this handle
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Dispatch a control command
    ///
    /// # Errors
    ///
    /// - `UnsupportedOperation` for any command other than RUN
    /// - `Fault` if the request struct at `arg` cannot be read
    /// - `InvalidArgument` for an unknown opcode
    /// - anything [`DeviceSession::submit`] returns
    pub fn ioctl(&self, cmd: u32, arg: u64, user: &dyn UserMemory) -> Result<Completion> {
        if cmd != ioctl::RUN {
            debug!("Rejecting control command {cmd:#010x}");
            return Err(GemminiError::UnsupportedOperation { cmd });
        }

        let mut bytes = [0u8; ioctl::REQUEST_SIZE];
        user.copy_from_user(arg, &mut bytes)?;
        let request = Request::try_from(RawRequest::from_bytes(&bytes)?)?;
        self.run(&request, user)
    }

    /// [`ControlHandle::ioctl`] with a kernel-style return: `0` or `-errno`
    pub fn ioctl_errno(&self, cmd: u32, arg: u64, user: &dyn UserMemory) -> i32 {
        match self.ioctl(cmd, arg, user) {
            Ok(_) => 0,
            Err(e) => -e.errno(),
        }
    }

    /// Submit an already-decoded request
    ///
    /// # Errors
    ///
    /// See [`DeviceSession::submit`].
    pub fn run(&self, request: &Request, user: &dyn UserMemory) -> Result<Completion> {
        self.session.submit(request, user)
    }
}
