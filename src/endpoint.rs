// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoints: addressing, realization, stalls, and moving packets.

use crate::error::{Error, Result};
use crate::hci::*;

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In endpoint addresses OUT is a 0 in the top bit,
/// and IN is `0x80`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

/// An endpoint address: bottom 4 bits are the endpoint number, the top bit
/// the direction. Bits 4..=6 must be zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const EP0_OUT: Self = Self(0x00);
    pub const EP0_IN: Self = Self(0x80);

    pub const fn new(dir: UsbDir, number: u8) -> Self {
        Self((number & 0xF) | dir as u8)
    }

    /// The dense hardware index the SIE uses for this endpoint: the number
    /// shifted up, with the direction in bit 0.
    pub const fn index(self) -> usize {
        (((self.0 & 0xF) << 1) | (self.0 >> 7)) as usize
    }

    /// Inverse of `index`. Only the bottom 5 bits of `idx` are used.
    pub const fn from_index(idx: usize) -> Self {
        let idx = idx as u8 & 0x1F;
        Self(((idx & 1) << 7) | (idx >> 1))
    }

    pub const fn number(self) -> u8 {
        self.0 & 0xF
    }

    pub const fn dir(self) -> UsbDir {
        if self.0 & 0x80 != 0 {
            UsbDir::In
        } else {
            UsbDir::Out
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for EndpointAddress {
    type Error = Error;

    fn try_from(addr: u8) -> Result<Self> {
        if addr & 0x70 != 0 {
            Err(Error::InvalidEndpoint(addr))
        } else {
            Ok(Self(addr))
        }
    }
}

/// Endpoint status, translated out of the SIE's select-endpoint byte into
/// something that doesn't depend on this particular hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EpStatus(u8);

impl EpStatus {
    /// Buffer holds data (OUT) or is still full (IN).
    pub const DATA: Self = Self(1 << 0);
    pub const STALLED: Self = Self(1 << 1);
    /// The last packet received was a SETUP.
    pub const SETUP: Self = Self(1 << 2);
    /// Something went wrong at the packet level (overwritten packet).
    pub const ERROR: Self = Self(1 << 3);
    /// The last access was NAKed.
    pub const NACKED: Self = Self(1 << 4);

    pub fn from_raw(raw: u8) -> Self {
        let mut s = 0;
        if raw & EPSTAT_FE != 0 {
            s |= Self::DATA.0;
        }
        if raw & EPSTAT_ST != 0 {
            s |= Self::STALLED.0;
        }
        if raw & EPSTAT_STP != 0 {
            s |= Self::SETUP.0;
        }
        if raw & EPSTAT_EPN != 0 {
            s |= Self::NACKED.0;
        }
        if raw & EPSTAT_PO != 0 {
            s |= Self::ERROR.0;
        }
        Self(s)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl core::ops::BitOr for EpStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Something that wants to hear about activity on an endpoint.
///
/// Handlers run inside the USB interrupt, with the bus handed to them so they
/// can read or refill the endpoint that woke them.
pub trait EndpointHandler<R: Registers> {
    fn on_event(&mut self, bus: &mut Endpoints<R>, ep: EndpointAddress, status: EpStatus);
}

/// The endpoint manager. Owns the SIE and remembers what we've done to each of
/// the 32 hardware endpoints.
pub struct Endpoints<R> {
    sie: Sie<R>,
    realized: u32,
    stalled: u32,
    max_packet: [u16; 32],
}

impl<R: Registers> Endpoints<R> {
    pub fn new(sie: Sie<R>) -> Self {
        Self {
            sie,
            realized: 0,
            stalled: 0,
            max_packet: [0; 32],
        }
    }

    pub fn sie(&mut self) -> &mut Sie<R> {
        &mut self.sie
    }

    /// Realizes the endpoint (has the engine allocate buffer space for it) with
    /// the given max packet size, and turns on its interrupt.
    ///
    /// Doing this again for the same endpoint only changes the packet size.
    pub fn configure(&mut self, ep: EndpointAddress, max_packet_size: u16) -> Result<()> {
        let idx = ep.index();
        log::debug!("realize {:#04x} (index {}), mps {}", ep.raw(), idx, max_packet_size);

        self.sie.set_bits(Reg::ReEp, 1 << idx);
        self.sie.write(Reg::EpInd, idx as u32);
        self.sie.write(Reg::MaxPSize, u32::from(max_packet_size));
        self.sie.wait_for_device_int(EP_RLZED)?;

        self.sie.set_bits(Reg::EpIntEn, 1 << idx);
        self.sie.set_bits(Reg::DevIntEn, EP_SLOW);

        self.realized |= 1 << idx;
        self.max_packet[idx] = max_packet_size;
        Ok(())
    }

    pub fn is_realized(&self, ep: EndpointAddress) -> bool {
        self.realized & 1 << ep.index() != 0
    }

    /// Max packet size this endpoint was realized with, if it was.
    pub fn max_packet_size(&self, ep: EndpointAddress) -> Option<u16> {
        self.is_realized(ep).then(|| self.max_packet[ep.index()])
    }

    pub fn stall(&mut self, ep: EndpointAddress) -> Result<()> {
        self.sie.command_write(CMD_EP_SET_STATUS | ep.index() as u8, EP_ST)?;
        self.stalled |= 1 << ep.index();
        Ok(())
    }

    pub fn unstall(&mut self, ep: EndpointAddress) -> Result<()> {
        self.sie.command_write(CMD_EP_SET_STATUS | ep.index() as u8, 0)?;
        self.stalled &= !(1 << ep.index());
        Ok(())
    }

    /// Whether we last told the engine to stall this endpoint. The engine can
    /// clear a stall on its own (EP0 on SETUP); `status` asks it directly.
    pub fn is_stalled(&self, ep: EndpointAddress) -> bool {
        self.stalled & 1 << ep.index() != 0
    }

    /// Forgets stalls on the control endpoints, which the engine drops by
    /// itself when a SETUP arrives.
    pub(crate) fn note_setup(&mut self) {
        self.stalled &= !0b11;
    }

    /// Asks the engine for the endpoint's current status.
    pub fn status(&mut self, ep: EndpointAddress) -> Result<EpStatus> {
        self.status_by_index(ep.index())
    }

    pub(crate) fn status_by_index(&mut self, idx: usize) -> Result<EpStatus> {
        let raw = self.sie.command_read(CMD_EP_SELECT | idx as u8)?;
        Ok(EpStatus::from_raw(raw))
    }

    /// Reads the packet waiting in an OUT endpoint into `buffer`.
    ///
    /// Returns the length of the packet, which may be more than
    /// `buffer.len()`; bytes that don't fit are dropped. The endpoint's buffer
    /// is released to the engine either way.
    pub fn read(&mut self, ep: EndpointAddress, buffer: &mut [u8]) -> Result<usize> {
        self.sie.write(Reg::Ctrl, RD_EN | u32::from(ep.number()) << 2);

        let len = self.sie.poll(Reg::RxPLen, PKT_RDY, |v| v & PKT_RDY != 0)?;
        if len & DV == 0 {
            self.sie.write(Reg::Ctrl, 0);
            log::warn!("invalid packet on {:#04x}", ep.raw());
            return Err(Error::InvalidPacket);
        }
        let len = (len & PKT_LNGTH_MASK) as usize;

        let mut word = [0u8; 4];
        for i in 0..len {
            if i % 4 == 0 {
                word = self.sie.read(Reg::RxData).to_le_bytes();
            }
            if let Some(b) = buffer.get_mut(i) {
                *b = word[i % 4];
            }
        }

        self.sie.write(Reg::Ctrl, 0);

        self.sie.command(CMD_EP_SELECT | ep.index() as u8)?;
        self.sie.command(CMD_EP_CLEAR_BUFFER)?;

        Ok(len)
    }

    /// Loads `data` as the next packet of an IN endpoint. `data` may be empty.
    pub fn write(&mut self, ep: EndpointAddress, data: &[u8]) -> Result<()> {
        let capacity = usize::from(self.max_packet[ep.index()]);
        if data.len() > capacity {
            return Err(Error::BufferOverrun { len: data.len(), capacity });
        }

        self.sie.write(Reg::Ctrl, WR_EN | u32::from(ep.number()) << 2);
        self.sie.write(Reg::TxPLen, data.len() as u32);

        // The engine drops WR_EN once it has TxPLen bytes. A zero-length
        // packet still takes one (ignored) word.
        let mut chunks = data.chunks(4);
        for _ in 0..self.sie.spin_budget() {
            if self.sie.read(Reg::Ctrl) & WR_EN == 0 {
                break;
            }
            let mut word = [0u8; 4];
            if let Some(c) = chunks.next() {
                word[..c.len()].copy_from_slice(c);
            }
            self.sie.write(Reg::TxData, u32::from_le_bytes(word));
        }
        if self.sie.read(Reg::Ctrl) & WR_EN != 0 {
            log::error!("TX on {:#04x} never completed", ep.raw());
            return Err(Error::HardwareTimeout { flags: WR_EN });
        }

        self.sie.command(CMD_EP_SELECT | ep.index() as u8)?;
        self.sie.command(CMD_EP_VALIDATE_BUFFER)
    }
}
