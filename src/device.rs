// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device session and its interrupt dispatcher.
//!
//! A `UsbDevice` owns everything the driver remembers between interrupts: the
//! endpoint manager (and through it the hardware), the device state, the
//! control transfer in progress, the descriptor table, and the application's
//! hooks and endpoint handlers. Build one at startup, `init` it, `connect`,
//! and then call `on_interrupt` from the USB interrupt handler.

use crate::control::ControlTransfer;
use crate::descriptor::DescriptorTable;
use crate::endpoint::{EndpointAddress, EndpointHandler, EpStatus, Endpoints};
use crate::error::{Error, Result};
use crate::hci::*;
use crate::request::{self, Reply, SetupPacket};

/// Number of hardware endpoints, counting each direction separately.
pub const NUM_ENDPOINTS: usize = 32;

/// Runtime settings. The register block base is picked by Cargo feature
/// instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Max packet size for EP0. Must match the device descriptor.
    pub ep0_max_packet_size: u16,
    /// How many times to poll a hardware flag before giving up.
    pub spin_budget: u32,
    /// `SET_MODE` bits choosing which NAKs interrupt (see `INAK_*`).
    pub nak_interrupts: u8,
    /// Whether to take an interrupt every start-of-frame.
    pub frame_interrupt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ep0_max_packet_size: 64,
            spin_budget: DEFAULT_SPIN_BUDGET,
            nak_interrupts: 0,
            frame_interrupt: false,
        }
    }
}

/// What we know about the device from the host's point of view.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Address assigned by `SET_ADDRESS`, 0 until then.
    pub address: u8,
    /// Active configuration value, 0 when unconfigured.
    pub configuration: u8,
    pub connected: bool,
    pub suspended: bool,
    /// The last status change included a bus reset.
    pub reset: bool,
    /// From the attributes of the active configuration.
    pub self_powered: bool,
}

/// Device status change, as handed to `Hooks::device_status`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceStatus(u8);

impl DeviceStatus {
    pub const CONNECT: Self = Self(1 << 0);
    pub const SUSPEND: Self = Self(1 << 1);
    pub const RESET: Self = Self(1 << 2);

    pub fn from_raw(raw: u8) -> Self {
        let mut s = 0;
        if raw & CON != 0 {
            s |= Self::CONNECT.0;
        }
        if raw & SUS != 0 {
            s |= Self::SUSPEND.0;
        }
        if raw & RST != 0 {
            s |= Self::RESET.0;
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

/// Application callbacks. Every method has a default that does nothing or
/// declines, so implement only what you need.
///
/// The request hooks get the setup packet and a staging buffer at least 64
/// bytes long. For host-to-device requests the buffer holds the data the host
/// sent. Return `None` to decline, which stalls the request (or, for
/// `custom_request`, passes it on to the standard handling).
pub trait Hooks<'a, R: Registers> {
    /// Start of frame, if `Config::frame_interrupt` is on.
    fn start_of_frame(&mut self, _bus: &mut Endpoints<R>) {}

    /// Connect, suspend or reset changed.
    fn device_status(&mut self, _bus: &mut Endpoints<R>, _status: DeviceStatus) {}

    /// Sees standard requests before the built-in handling does.
    fn custom_request(
        &mut self,
        _bus: &mut Endpoints<R>,
        _setup: &SetupPacket,
        _buf: &mut [u8],
    ) -> Option<Reply<'a>> {
        None
    }

    fn class_request(
        &mut self,
        _bus: &mut Endpoints<R>,
        _setup: &SetupPacket,
        _buf: &mut [u8],
    ) -> Option<Reply<'a>> {
        None
    }

    fn vendor_request(
        &mut self,
        _bus: &mut Endpoints<R>,
        _setup: &SetupPacket,
        _buf: &mut [u8],
    ) -> Option<Reply<'a>> {
        None
    }

    fn reserved_request(
        &mut self,
        _bus: &mut Endpoints<R>,
        _setup: &SetupPacket,
        _buf: &mut [u8],
    ) -> Option<Reply<'a>> {
        None
    }
}

/// Hooks for a device that only does chapter 9.
pub struct NoHooks;

impl<'a, R: Registers> Hooks<'a, R> for NoHooks {}

pub struct UsbDevice<'a, R: Registers + 'a, H> {
    bus: Endpoints<R>,
    state: DeviceState,
    control: ControlTransfer<'a>,
    descriptors: DescriptorTable<'a>,
    hooks: H,
    handlers: [Option<&'a mut dyn EndpointHandler<R>>; NUM_ENDPOINTS],
    config: Config,
}

impl<'a, R: Registers + 'a, H: Hooks<'a, R>> UsbDevice<'a, R, H> {
    /// Wraps the hardware. Nothing is touched until `init`.
    pub fn new(regs: R, descriptors: &'a [u8], hooks: H, config: Config) -> Self {
        Self {
            bus: Endpoints::new(Sie::new(regs, config.spin_budget)),
            state: DeviceState::default(),
            control: ControlTransfer::new(config.ep0_max_packet_size),
            descriptors: DescriptorTable::new(descriptors),
            hooks,
            handlers: core::array::from_fn(|_| None),
            config,
        }
    }

    /// Puts the controller into a known state: all interrupts off and
    /// cleared, NAK interrupts as configured, device status (and maybe frame)
    /// interrupts on, and EP0 realized in both directions.
    ///
    /// This doesn't connect to the bus; see `connect`.
    pub fn init(&mut self) -> Result<()> {
        let sie = self.bus.sie();
        sie.write(Reg::DevIntEn, 0);
        sie.write(Reg::DevIntClr, !0);
        sie.write(Reg::DevIntPri, 0);
        sie.write(Reg::EpIntEn, 0);
        sie.write(Reg::EpIntClr, !0);
        sie.write(Reg::EpIntPri, 0);

        sie.set_nak_interrupts(self.config.nak_interrupts)?;

        let mut enable = DEV_STAT;
        if self.config.frame_interrupt {
            enable |= FRAME;
        }
        sie.set_bits(Reg::DevIntEn, enable);

        let mps = self.config.ep0_max_packet_size;
        self.bus.configure(EndpointAddress::EP0_OUT, mps)?;
        self.bus.configure(EndpointAddress::EP0_IN, mps)?;

        self.state = DeviceState::default();
        self.control.reset();
        Ok(())
    }

    /// Connects to (or disconnects from) the bus with the soft-connect pin.
    pub fn connect(&mut self, connect: bool) -> Result<()> {
        log::debug!("soft connect {}", connect);
        self.bus.sie().set_connected(connect)
    }

    /// Routes events on `ep` to `handler` from now on. EP0 belongs to the
    /// control engine and can't be taken.
    pub fn register_handler(
        &mut self,
        ep: EndpointAddress,
        handler: &'a mut dyn EndpointHandler<R>,
    ) -> Result<()> {
        if ep.number() == 0 {
            return Err(Error::InvalidEndpoint(ep.raw()));
        }
        self.handlers[ep.index()] = Some(handler);
        Ok(())
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn bus(&mut self) -> &mut Endpoints<R> {
        &mut self.bus
    }

    pub fn hooks(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn control(&self) -> &ControlTransfer<'a> {
        &self.control
    }

    pub fn frame_number(&mut self) -> Result<u16> {
        self.bus.sie().frame_number()
    }

    /// Handles whatever the controller is signaling. Call this from the USB
    /// interrupt.
    ///
    /// Only a hardware timeout is reported; anything wrong with a request has
    /// already been dealt with by stalling it.
    pub fn on_interrupt(&mut self) -> Result<()> {
        let pending = self.bus.sie().read(Reg::DevIntSt);

        if pending & FRAME != 0 {
            self.bus.sie().write(Reg::DevIntClr, FRAME);
            self.hooks.start_of_frame(&mut self.bus);
        }

        if pending & DEV_STAT != 0 {
            // Must be cleared before the status read, or the read comes back
            // corrupted.
            self.bus.sie().write(Reg::DevIntClr, DEV_STAT);
            let raw = self.bus.sie().device_status()?;
            if raw & (CON_CH | SUS_CH | RST) != 0 {
                self.on_device_status(DeviceStatus::from_raw(raw));
            }
        }

        if pending & EP_SLOW != 0 {
            self.bus.sie().write(Reg::DevIntClr, EP_SLOW);
            for idx in 0..NUM_ENDPOINTS {
                let bit = 1u32 << idx;
                if self.bus.sie().read(Reg::EpIntSt) & bit == 0 {
                    continue;
                }
                self.bus.sie().write(Reg::EpIntClr, bit);
                let status = self.bus.status_by_index(idx)?;
                self.on_endpoint(idx, status)?;
            }
        }

        Ok(())
    }

    fn on_device_status(&mut self, status: DeviceStatus) {
        log::debug!("device status {:#x}", status.bits());
        self.state.connected = status.contains(DeviceStatus::CONNECT);
        self.state.suspended = status.contains(DeviceStatus::SUSPEND);
        self.state.reset = status.contains(DeviceStatus::RESET);
        if self.state.reset {
            self.state.address = 0;
            self.state.configuration = 0;
            self.state.self_powered = false;
            self.control.reset();
        }
        self.hooks.device_status(&mut self.bus, status);
    }

    fn on_endpoint(&mut self, idx: usize, status: EpStatus) -> Result<()> {
        match idx {
            0 => self.control_out(status),
            1 => self.control.on_in(&mut self.bus, status),
            _ => {
                let ep = EndpointAddress::from_index(idx);
                if !self.bus.is_realized(ep) {
                    log::debug!("event on unrealized endpoint {:#04x}", ep.raw());
                    return Ok(());
                }
                if let Some(handler) = &mut self.handlers[idx] {
                    handler.on_event(&mut self.bus, ep, status);
                }
                Ok(())
            }
        }
    }

    fn control_out(&mut self, status: EpStatus) -> Result<()> {
        let Self { bus, state, control, descriptors, hooks, .. } = self;
        control.on_out(bus, status, |bus, setup, buf| {
            request::dispatch(bus, state, descriptors, hooks, setup, buf)
        })
    }
}
