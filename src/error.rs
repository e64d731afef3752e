// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver error type.

use core::fmt;

/// Everything that can go wrong while talking to the USB engine or serving a
/// control transfer.
///
/// Most of these are confined to a single control transfer: the control
/// engine stalls EP0 and waits for the next SETUP. `HardwareTimeout` is the
/// exception, and is what escapes from `UsbDevice::on_interrupt`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The host asked for something we don't understand or don't support.
    Protocol { request_type: u8, request: u8 },
    /// A busy-wait on the given `DevIntSt` (or `RxPLen`/`Ctrl`) flags ran out
    /// of polls.
    HardwareTimeout { flags: u32 },
    /// No descriptor of this type and index in the table.
    DescriptorNotFound { descriptor_type: u8, index: u8 },
    /// Data doesn't fit in the buffer or packet it's headed for.
    BufferOverrun { len: usize, capacity: usize },
    /// Address with bits 4..=6 set, or an otherwise unusable endpoint.
    InvalidEndpoint(u8),
    /// The engine handed us a packet without the data-valid bit.
    InvalidPacket,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Protocol { request_type, request } => write!(
                f,
                "unsupported request {request:#04x} (type {request_type:#04x})"
            ),
            Error::HardwareTimeout { flags } => {
                write!(f, "timed out waiting for flags {flags:#x}")
            }
            Error::DescriptorNotFound { descriptor_type, index } => write!(
                f,
                "descriptor type {descriptor_type} index {index} not found"
            ),
            Error::BufferOverrun { len, capacity } => {
                write!(f, "{len} bytes do not fit in {capacity}")
            }
            Error::InvalidEndpoint(addr) => {
                write!(f, "invalid endpoint address {addr:#04x}")
            }
            Error::InvalidPacket => f.write_str("packet not marked valid"),
        }
    }
}

impl Error {
    /// Whether the hardware stopped answering, as opposed to the host asking
    /// for something unreasonable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::HardwareTimeout { .. })
    }
}
