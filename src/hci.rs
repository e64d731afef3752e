// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware command interface.
//!
//! The LPC USB block doesn't expose most of its state as registers. Instead
//! there's a little protocol engine, the SIE, that you talk to through a pair
//! of registers: `CmdCode` takes a command byte (or a data byte) together with
//! a phase code, and `CmdData` hands back the result of a read phase. Each
//! phase completes asynchronously, signaled by a flag in `DevIntSt`:
//!
//! - `CCEMTY` ("command code empty") once a command or write phase has been
//!   consumed,
//! - `CDFULL` ("command data full") once a read phase has produced a byte.
//!
//! Everything in this file is a thin layer over that dance. It is not
//! reentrant: call it from the USB interrupt, or with the USB interrupt
//! masked.

use crate::error::{Error, Result};

cfg_if::cfg_if! {
    if #[cfg(feature = "target-lpc17xx")] {
        /// Base of the USB device register block (`USBDevIntSt`).
        pub const USB_BASE: usize = 0x5000_C200;
    } else if #[cfg(feature = "target-lpc214x")] {
        /// Base of the USB device register block (`USBDevIntSt`).
        pub const USB_BASE: usize = 0xE009_0000;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// Registers of the USB device block, by offset from `USB_BASE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    DevIntSt = 0x00,
    DevIntEn = 0x04,
    DevIntClr = 0x08,
    DevIntSet = 0x0C,
    CmdCode = 0x10,
    CmdData = 0x14,
    RxData = 0x18,
    TxData = 0x1C,
    RxPLen = 0x20,
    TxPLen = 0x24,
    Ctrl = 0x28,
    DevIntPri = 0x2C,
    EpIntSt = 0x30,
    EpIntEn = 0x34,
    EpIntClr = 0x38,
    EpIntSet = 0x3C,
    EpIntPri = 0x40,
    ReEp = 0x44,
    EpInd = 0x48,
    MaxPSize = 0x4C,
}

/// Access to the USB register block.
///
/// On hardware this is [`Mmio`]. Reads take `&mut self` because several of
/// these registers are FIFOs (`RxData`) or change state when read.
pub trait Registers {
    fn read(&mut self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);
}

/// The real register block, accessed with volatile loads and stores.
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Creates an accessor for the block at `USB_BASE`.
    ///
    /// # Safety
    ///
    /// There must be only one of these alive at a time, and the USB block must
    /// be powered and clocked before it's used. Board bring-up is up to you.
    pub const unsafe fn new() -> Self {
        Self { base: USB_BASE }
    }

    /// Like `new`, for a block living somewhere else.
    ///
    /// # Safety
    ///
    /// Same as `new`, and `base` must actually point at the block.
    pub const unsafe fn at(base: usize) -> Self {
        Self { base }
    }
}

impl Registers for Mmio {
    #[inline(always)]
    fn read(&mut self, reg: Reg) -> u32 {
        // Safety: `new`/`at` promised us `base` is the register block, and
        // every `Reg` is a 32-bit register inside it.
        unsafe { core::ptr::read_volatile((self.base + reg as usize) as *const u32) }
    }

    #[inline(always)]
    fn write(&mut self, reg: Reg, value: u32) {
        // Safety: as for `read`.
        unsafe { core::ptr::write_volatile((self.base + reg as usize) as *mut u32, value) }
    }
}

// DevIntSt / DevIntEn / DevIntClr bits.
pub const FRAME: u32 = 1 << 0;
pub const EP_FAST: u32 = 1 << 1;
pub const EP_SLOW: u32 = 1 << 2;
pub const DEV_STAT: u32 = 1 << 3;
pub const CCEMTY: u32 = 1 << 4;
pub const CDFULL: u32 = 1 << 5;
pub const RX_ENDPKT: u32 = 1 << 6;
pub const TX_ENDPKT: u32 = 1 << 7;
pub const EP_RLZED: u32 = 1 << 8;
pub const ERR_INT: u32 = 1 << 9;

// RxPLen bits.
pub const PKT_LNGTH_MASK: u32 = 0x3FF;
pub const DV: u32 = 1 << 10;
pub const PKT_RDY: u32 = 1 << 11;

// Ctrl bits. The logical endpoint number goes in bits 2..=5.
pub const RD_EN: u32 = 1 << 0;
pub const WR_EN: u32 = 1 << 1;

// CmdCode phase codes, in bits 8..=15.
pub const PHASE_COMMAND: u32 = 0x05 << 8;
pub const PHASE_WRITE: u32 = 0x01 << 8;
pub const PHASE_READ: u32 = 0x02 << 8;

// Device commands.
pub const CMD_DEV_SET_ADDRESS: u8 = 0xD0;
pub const CMD_DEV_CONFIG: u8 = 0xD8;
pub const CMD_DEV_SET_MODE: u8 = 0xF3;
pub const CMD_DEV_READ_CUR_FRAME_NR: u8 = 0xF5;
pub const CMD_DEV_STATUS: u8 = 0xFE;

// Endpoint commands; the select/set-status commands take the hardware index
// in their low bits.
pub const CMD_EP_SELECT: u8 = 0x00;
pub const CMD_EP_SET_STATUS: u8 = 0x40;
pub const CMD_EP_CLEAR_BUFFER: u8 = 0xF2;
pub const CMD_EP_VALIDATE_BUFFER: u8 = 0xFA;

// Set address.
pub const DEV_EN: u8 = 1 << 7;

// Configure device.
pub const CONF_DEVICE: u8 = 1 << 0;

// Set mode: which NAKs raise endpoint interrupts. C is control, I interrupt,
// B bulk; the last letter is the direction.
pub const AP_CLK: u8 = 1 << 0;
pub const INAK_CI: u8 = 1 << 1;
pub const INAK_CO: u8 = 1 << 2;
pub const INAK_II: u8 = 1 << 3;
pub const INAK_IO: u8 = 1 << 4;
pub const INAK_BI: u8 = 1 << 5;
pub const INAK_BO: u8 = 1 << 6;

// Get/set device status.
pub const CON: u8 = 1 << 0;
pub const CON_CH: u8 = 1 << 1;
pub const SUS: u8 = 1 << 2;
pub const SUS_CH: u8 = 1 << 3;
pub const RST: u8 = 1 << 4;

// Select endpoint status byte.
pub const EPSTAT_FE: u8 = 1 << 0;
pub const EPSTAT_ST: u8 = 1 << 1;
pub const EPSTAT_STP: u8 = 1 << 2;
pub const EPSTAT_PO: u8 = 1 << 3;
pub const EPSTAT_EPN: u8 = 1 << 4;

// Set endpoint status.
pub const EP_ST: u8 = 1 << 0;

/// Default number of polls before a wait gives up. At the clock rates these
/// parts run, this is a few milliseconds, which is an eternity for the SIE.
pub const DEFAULT_SPIN_BUDGET: u32 = 100_000;

/// The serial interface engine, as seen through its command registers.
pub struct Sie<R> {
    regs: R,
    spin_budget: u32,
}

impl<R: Registers> Sie<R> {
    pub fn new(regs: R, spin_budget: u32) -> Self {
        Self { regs, spin_budget }
    }

    pub fn read(&mut self, reg: Reg) -> u32 {
        self.regs.read(reg)
    }

    pub fn write(&mut self, reg: Reg, value: u32) {
        self.regs.write(reg, value)
    }

    /// Read-modify-write that sets `bits`.
    pub fn set_bits(&mut self, reg: Reg, bits: u32) {
        let v = self.regs.read(reg);
        self.regs.write(reg, v | bits);
    }

    pub fn registers(&mut self) -> &mut R {
        &mut self.regs
    }

    pub fn spin_budget(&self) -> u32 {
        self.spin_budget
    }

    /// Polls `reg` until `done` says so, giving up after the spin budget.
    /// `flags` is only used to describe the failure.
    pub fn poll(
        &mut self,
        reg: Reg,
        flags: u32,
        mut done: impl FnMut(u32) -> bool,
    ) -> Result<u32> {
        for _ in 0..self.spin_budget {
            let v = self.regs.read(reg);
            if done(v) {
                return Ok(v);
            }
            core::hint::spin_loop();
        }
        log::error!("SIE timeout: {:?} never showed {:#x}", reg, flags);
        Err(Error::HardwareTimeout { flags })
    }

    /// Waits until all of `flags` are set in `DevIntSt`, then clears them.
    pub fn wait_for_device_int(&mut self, flags: u32) -> Result<()> {
        self.poll(Reg::DevIntSt, flags, |st| st & flags == flags)?;
        self.regs.write(Reg::DevIntClr, flags);
        Ok(())
    }

    /// Command phase only.
    pub fn command(&mut self, cmd: u8) -> Result<()> {
        self.regs.write(Reg::DevIntClr, CDFULL | CCEMTY);
        self.regs.write(Reg::CmdCode, PHASE_COMMAND | u32::from(cmd) << 16);
        self.wait_for_device_int(CCEMTY)
    }

    /// Command phase followed by a write-data phase.
    pub fn command_write(&mut self, cmd: u8, data: u8) -> Result<()> {
        self.command(cmd)?;
        self.regs.write(Reg::CmdCode, PHASE_WRITE | u32::from(data) << 16);
        self.wait_for_device_int(CCEMTY)
    }

    /// Command phase followed by a read-data phase. The read phase repeats
    /// the command code, which is how the SIE knows what we're reading.
    pub fn command_read(&mut self, cmd: u8) -> Result<u8> {
        self.command(cmd)?;
        self.regs.write(Reg::CmdCode, PHASE_READ | u32::from(cmd) << 16);
        self.wait_for_device_int(CDFULL)?;
        Ok(self.regs.read(Reg::CmdData) as u8)
    }

    /// Sets the device address and enables the device function. Takes effect
    /// immediately.
    pub fn set_address(&mut self, addr: u8) -> Result<()> {
        self.command_write(CMD_DEV_SET_ADDRESS, DEV_EN | (addr & 0x7F))
    }

    /// Drives the soft-connect pin through the device status register.
    pub fn set_connected(&mut self, connect: bool) -> Result<()> {
        self.command_write(CMD_DEV_STATUS, if connect { CON } else { 0 })
    }

    /// Tells the SIE whether the device is configured, which lets non-control
    /// endpoints move data.
    pub fn configure_device(&mut self, configured: bool) -> Result<()> {
        self.command_write(CMD_DEV_CONFIG, if configured { CONF_DEVICE } else { 0 })
    }

    /// Chooses which NAKs raise endpoint interrupts. By default only ACKs do.
    pub fn set_nak_interrupts(&mut self, bits: u8) -> Result<()> {
        self.command_write(CMD_DEV_SET_MODE, bits)
    }

    /// Raw device status byte (`CON`, `CON_CH`, ...). Reading it clears the
    /// change bits.
    pub fn device_status(&mut self) -> Result<u8> {
        self.command_read(CMD_DEV_STATUS)
    }

    /// The 11-bit frame number of the last SOF. The SIE returns it as two
    /// bytes from consecutive read phases, low byte first.
    pub fn frame_number(&mut self) -> Result<u16> {
        self.command(CMD_DEV_READ_CUR_FRAME_NR)?;
        let mut bytes = [0u8; 2];
        for b in &mut bytes {
            self.regs.write(
                Reg::CmdCode,
                PHASE_READ | u32::from(CMD_DEV_READ_CUR_FRAME_NR) << 16,
            );
            self.wait_for_device_int(CDFULL)?;
            *b = self.regs.read(Reg::CmdData) as u8;
        }
        Ok(u16::from_le_bytes(bytes) & 0x7FF)
    }
}
