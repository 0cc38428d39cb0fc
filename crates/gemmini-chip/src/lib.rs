//! Silicon model for the GemminiDevA near-data accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the device contract: register offsets, the opcode table,
//! the control-channel ABI and the platform defaults the gem5 device tree
//! advertises.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Register block: eight 64-bit slots at fixed offsets |
//! | [`opcode`] | The nine operation kinds and their stable ordinals |
//! | [`ioctl`] | Request struct layout and the RUN command number |
//! | [`platform`] | Default MMIO window, device-tree identity, DMA mask |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ioctl;
pub mod opcode;
pub mod platform;
pub mod regs;

pub use opcode::{Opcode, UnknownOpcode};
