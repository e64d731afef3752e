// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB device driver for the NXP LPC214x/LPC17xx USB engine.
//!
//! These parts don't give you a USB controller so much as a small protocol
//! engine (the SIE) that you drive by writing command bytes into a register
//! and waiting for it to get back to you. This crate wraps that in layers,
//! each of which you can read on its own:
//!
//! - `hci` speaks the SIE command protocol.
//! - `endpoint` realizes endpoints, stalls them, and moves packets.
//! - `descriptor` walks the flat descriptor table you provide.
//! - `request` decodes SETUP packets and answers the standard requests.
//! - `control` runs endpoint 0 through the SETUP / DATA / STATUS stages.
//! - `device` owns all of the above and dispatches interrupts into it.
//!
//! A minimal device looks like this:
//!
//! ```ignore
//! let regs = unsafe { Mmio::new() };
//! let mut usb = UsbDevice::new(regs, &DESCRIPTORS, NoHooks, Config::default());
//! usb.init()?;
//! usb.connect(true)?;
//! // ...then, from the USB interrupt:
//! usb.on_interrupt()?;
//! ```
//!
//! Getting the clocks, PLL and pins set up so the USB block is alive at all
//! is up to you.
//!
//! Nothing here allocates. Diagnostics go through the `log` facade; install
//! a logger if you want to see them.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod hci;
pub mod request;
pub mod shared;

#[cfg(test)]
mod mock;

pub use descriptor::DescriptorTable;
pub use device::{Config, DeviceState, DeviceStatus, Hooks, NoHooks, UsbDevice};
pub use endpoint::{EndpointAddress, EndpointHandler, Endpoints, EpStatus, UsbDir};
pub use error::{Error, Result};
pub use hci::{Mmio, Registers};
pub use request::{Reply, SetupPacket};
pub use shared::Shared;
