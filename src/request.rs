// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SETUP packets and the standard ("chapter 9") requests.
//!
//! The control engine hands every complete request to `dispatch`, which picks
//! a handler by the type bits of `request_type`. Class, vendor and reserved
//! requests belong to the application's `Hooks`; standard requests are
//! offered to `Hooks::custom_request` first and handled here if it declines.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

use crate::descriptor::{DescriptorTable, ATTR_SELF_POWERED};
use crate::device::{DeviceState, Hooks};
use crate::endpoint::{EndpointAddress, EpStatus, Endpoints, UsbDir};
use crate::error::{Error, Result};
use crate::hci::Registers;

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction in bit 7, type in bits 5..=6, recipient in bits 0..=4.
    pub request_type: u8,
    /// Request. Standard requests are in the `Request` enum; class and vendor
    /// requests define their own.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Usually an interface or endpoint number, sometimes a language ID.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), the number of bytes (OUT) or maximum number of
    /// bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const EMPTY: Self = Self {
        request_type: 0,
        request: 0,
        value: U16::from_bytes([0; 2]),
        index: U16::from_bytes([0; 2]),
        length: U16::from_bytes([0; 2]),
    };

    /// Reinterprets exactly 8 bytes as a setup packet.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        LayoutVerified::<_, Self>::new_unaligned(bytes).map(|lv| *lv)
    }

    pub fn direction(&self) -> UsbDir {
        if self.request_type & 0x80 != 0 {
            UsbDir::In
        } else {
            UsbDir::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    /// The standard request this is, if it's one we know by name.
    pub fn standard_request(&self) -> Option<Request> {
        Request::from_u8(self.request)
    }

    /// The error to fail this request with.
    pub fn unsupported(&self) -> Error {
        Error::Protocol { request_type: self.request_type, request: self.request }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The standard requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Feature selectors for `ClearFeature`/`SetFeature`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Feature {
    EndpointHalt = 0,
    RemoteWakeup = 1,
    TestMode = 2,
}

/// What a request handler wants sent back in the data stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply<'a> {
    /// No data; just the status stage.
    Empty,
    /// The first `n` bytes of the staging buffer the handler was given.
    Staged(usize),
    /// Bytes that live elsewhere for at least as long as the device, such as a
    /// descriptor.
    Borrowed(&'a [u8]),
}

impl Reply<'_> {
    pub fn len(&self) -> usize {
        match *self {
            Reply::Empty => 0,
            Reply::Staged(n) => n,
            Reply::Borrowed(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes a complete request to whoever handles its type. `buf` holds any
/// OUT data stage, and is where handlers put `Reply::Staged` data.
pub fn dispatch<'a, R: Registers, H: Hooks<'a, R>>(
    bus: &mut Endpoints<R>,
    state: &mut DeviceState,
    descriptors: &DescriptorTable<'a>,
    hooks: &mut H,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<Reply<'a>> {
    let declined = setup.unsupported();
    match setup.kind() {
        RequestKind::Standard => match hooks.custom_request(bus, setup, buf) {
            Some(reply) => Ok(reply),
            None => standard(bus, state, descriptors, setup, buf),
        },
        RequestKind::Class => hooks.class_request(bus, setup, buf).ok_or(declined),
        RequestKind::Vendor => hooks.vendor_request(bus, setup, buf).ok_or(declined),
        RequestKind::Reserved => hooks.reserved_request(bus, setup, buf).ok_or(declined),
    }
}

/// Handles a standard request by recipient.
pub fn standard<'a, R: Registers>(
    bus: &mut Endpoints<R>,
    state: &mut DeviceState,
    descriptors: &DescriptorTable<'a>,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<Reply<'a>> {
    match setup.recipient() {
        Some(Recipient::Device) => device(bus, state, descriptors, setup, buf),
        Some(Recipient::Interface) => interface(setup, buf),
        Some(Recipient::Endpoint) => endpoint(bus, setup, buf),
        _ => Err(setup.unsupported()),
    }
}

fn device<'a, R: Registers>(
    bus: &mut Endpoints<R>,
    state: &mut DeviceState,
    descriptors: &DescriptorTable<'a>,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<Reply<'a>> {
    match setup.standard_request() {
        Some(Request::GetStatus) => {
            // Bit 1 would be remote wakeup, which we don't do.
            buf[..2].copy_from_slice(&[u8::from(state.self_powered), 0]);
            Ok(Reply::Staged(2))
        }
        Some(Request::SetAddress) => {
            let addr = setup.value.get() as u8 & 0x7F;
            bus.sie().set_address(addr)?;
            state.address = addr;
            Ok(Reply::Empty)
        }
        Some(Request::GetDescriptor) => descriptors
            .find(setup.value.get(), setup.index.get())
            .map(Reply::Borrowed),
        Some(Request::GetConfiguration) => {
            buf[0] = state.configuration;
            Ok(Reply::Staged(1))
        }
        Some(Request::SetConfiguration) => {
            let config = setup.value.get() as u8;
            descriptors.configure_for_setting(bus, config, 0)?;
            state.configuration = config;
            state.self_powered = descriptors
                .configuration_attributes(config)
                .map_or(false, |a| a & ATTR_SELF_POWERED != 0);
            Ok(Reply::Empty)
        }
        Some(Request::ClearFeature | Request::SetFeature) => {
            match Feature::from_u16(setup.value.get()) {
                Some(Feature::RemoteWakeup) => log::debug!("remote wakeup not supported"),
                Some(Feature::TestMode) => log::debug!("test mode not supported"),
                _ => (),
            }
            Err(setup.unsupported())
        }
        _ => Err(setup.unsupported()),
    }
}

fn interface<'a>(setup: &SetupPacket, buf: &mut [u8]) -> Result<Reply<'a>> {
    match setup.standard_request() {
        Some(Request::GetStatus) => {
            buf[..2].copy_from_slice(&[0, 0]);
            Ok(Reply::Staged(2))
        }
        // Only one interface setting, number 0.
        Some(Request::GetInterface) => {
            buf[0] = 0;
            Ok(Reply::Staged(1))
        }
        Some(Request::SetInterface) if setup.value.get() == 0 => Ok(Reply::Empty),
        _ => Err(setup.unsupported()),
    }
}

fn endpoint<'a, R: Registers>(
    bus: &mut Endpoints<R>,
    setup: &SetupPacket,
    buf: &mut [u8],
) -> Result<Reply<'a>> {
    // The high byte of wIndex is reserved for endpoint requests.
    let ep = u8::try_from(setup.index.get())
        .map_err(|_| setup.unsupported())
        .and_then(|addr| EndpointAddress::try_from(addr))?;
    let halt = Feature::from_u16(setup.value.get()) == Some(Feature::EndpointHalt);
    match setup.standard_request() {
        Some(Request::GetStatus) => {
            let halted = bus.status(ep)?.contains(EpStatus::STALLED);
            buf[..2].copy_from_slice(&[u8::from(halted), 0]);
            Ok(Reply::Staged(2))
        }
        Some(Request::ClearFeature) if halt => {
            bus.unstall(ep)?;
            Ok(Reply::Empty)
        }
        Some(Request::SetFeature) if halt => {
            bus.stall(ep)?;
            Ok(Reply::Empty)
        }
        _ => Err(setup.unsupported()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::tests::sample_table;
    use crate::descriptor::DescType;
    use crate::device::NoHooks;
    use crate::hci::Sie;
    use crate::mock::MockSie;

    /// Builds the 8 wire bytes of a setup packet.
    pub fn setup_bytes(
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = request_type;
        b[1] = request;
        b[2..4].copy_from_slice(&value.to_le_bytes());
        b[4..6].copy_from_slice(&index.to_le_bytes());
        b[6..8].copy_from_slice(&length.to_le_bytes());
        b
    }

    pub fn setup(
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> SetupPacket {
        SetupPacket::parse(&setup_bytes(request_type, request, value, index, length)).unwrap()
    }

    struct Fixture {
        bus: Endpoints<MockSie>,
        state: DeviceState,
        table: Vec<u8>,
        buf: [u8; 64],
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bus: Endpoints::new(Sie::new(MockSie::new(), 1_000)),
                state: DeviceState::default(),
                table: sample_table(),
                buf: [0; 64],
            }
        }

        fn run(&mut self, s: SetupPacket) -> Result<Reply<'_>> {
            let table = DescriptorTable::new(&self.table);
            dispatch(&mut self.bus, &mut self.state, &table, &mut NoHooks, &s, &mut self.buf)
        }
    }

    #[test]
    fn setup_packet_fields() {
        let s = setup(0x80, 0x06, 0x0100, 0x0409, 18);
        assert_eq!(s.direction(), UsbDir::In);
        assert_eq!(s.kind(), RequestKind::Standard);
        assert_eq!(s.recipient(), Some(Recipient::Device));
        assert_eq!(s.standard_request(), Some(Request::GetDescriptor));
        assert_eq!(s.value.get(), 0x0100);
        assert_eq!(s.index.get(), 0x0409);
        assert_eq!(s.length.get(), 18);
        assert_eq!(s.as_bytes(), &setup_bytes(0x80, 0x06, 0x0100, 0x0409, 18));
        assert_eq!(SetupPacket::parse(&[0; 7]), None);
    }

    #[test]
    fn request_type_decoding() {
        assert_eq!(setup(0x21, 0, 0, 0, 0).kind(), RequestKind::Class);
        assert_eq!(setup(0x21, 0, 0, 0, 0).recipient(), Some(Recipient::Interface));
        assert_eq!(setup(0xC0, 0, 0, 0, 0).kind(), RequestKind::Vendor);
        assert_eq!(setup(0x62, 0, 0, 0, 0).kind(), RequestKind::Reserved);
        assert_eq!(setup(0x04, 0, 0, 0, 0).recipient(), None);
    }

    #[test]
    fn get_device_descriptor() {
        let mut f = Fixture::new();
        let reply = f.run(setup(0x80, 0x06, 0x0100, 0, 18)).unwrap();
        assert!(matches!(
            reply,
            Reply::Borrowed(d) if d.len() == 18 && d[1] == DescType::Device as u8
        ));
    }

    #[test]
    fn missing_descriptor_fails() {
        let mut f = Fixture::new();
        assert_eq!(
            f.run(setup(0x80, 0x06, 0x0600, 0, 10)),
            Err(Error::DescriptorNotFound { descriptor_type: 6, index: 0 })
        );
    }

    #[test]
    fn set_address_applies_immediately() {
        let mut f = Fixture::new();
        assert_eq!(f.run(setup(0x00, 0x05, 5, 0, 0)), Ok(Reply::Empty));
        assert_eq!(f.state.address, 5);
        assert_eq!(f.bus.sie().registers().address(), Some(5));
    }

    #[test]
    fn set_then_get_configuration() {
        let mut f = Fixture::new();
        assert_eq!(f.run(setup(0x00, 0x09, 1, 0, 0)), Ok(Reply::Empty));
        assert_eq!(f.state.configuration, 1);
        assert!(f.state.self_powered);
        assert_eq!(f.run(setup(0x80, 0x08, 0, 0, 1)), Ok(Reply::Staged(1)));
        assert_eq!(f.buf[0], 1);
    }

    #[test]
    fn bad_configuration_leaves_state_alone() {
        let mut f = Fixture::new();
        assert!(f.run(setup(0x00, 0x09, 9, 0, 0)).is_err());
        assert_eq!(f.state.configuration, 0);
    }

    #[test]
    fn device_status_reports_self_powered() {
        let mut f = Fixture::new();
        assert_eq!(f.run(setup(0x80, 0x00, 0, 0, 2)), Ok(Reply::Staged(2)));
        assert_eq!(&f.buf[..2], &[0, 0]);
        f.run(setup(0x00, 0x09, 1, 0, 0)).unwrap();
        f.run(setup(0x80, 0x00, 0, 0, 2)).unwrap();
        assert_eq!(&f.buf[..2], &[1, 0]);
    }

    #[test]
    fn device_features_fail() {
        let mut f = Fixture::new();
        for feature in [0, 1, 2, 7] {
            assert!(f.run(setup(0x00, 0x03, feature, 0, 0)).is_err());
            assert!(f.run(setup(0x00, 0x01, feature, 0, 0)).is_err());
        }
    }

    #[test]
    fn interface_requests() {
        let mut f = Fixture::new();
        assert_eq!(f.run(setup(0x81, 0x00, 0, 0, 2)), Ok(Reply::Staged(2)));
        assert_eq!(&f.buf[..2], &[0, 0]);
        f.buf[0] = 0xAA;
        assert_eq!(f.run(setup(0x81, 0x0A, 0, 0, 1)), Ok(Reply::Staged(1)));
        assert_eq!(f.buf[0], 0);
        assert_eq!(f.run(setup(0x01, 0x0B, 0, 0, 0)), Ok(Reply::Empty));
        assert!(f.run(setup(0x01, 0x0B, 1, 0, 0)).is_err());
        assert!(f.run(setup(0x01, 0x03, 0, 0, 0)).is_err());
    }

    #[test]
    fn endpoint_halt_toggles_only_target() {
        let mut f = Fixture::new();
        assert_eq!(f.run(setup(0x02, 0x03, 0, 0x82, 0)), Ok(Reply::Empty));
        assert!(f.bus.sie().registers().is_stalled(5));
        assert!(!f.bus.sie().registers().is_stalled(4));

        assert_eq!(f.run(setup(0x82, 0x00, 0, 0x82, 2)), Ok(Reply::Staged(2)));
        assert_eq!(&f.buf[..2], &[1, 0]);

        assert_eq!(f.run(setup(0x02, 0x01, 0, 0x82, 0)), Ok(Reply::Empty));
        assert!(!f.bus.sie().registers().is_stalled(5));
        f.run(setup(0x82, 0x00, 0, 0x82, 2)).unwrap();
        assert_eq!(&f.buf[..2], &[0, 0]);
    }

    #[test]
    fn endpoint_index_high_byte_is_refused() {
        let mut f = Fixture::new();
        assert_eq!(
            f.run(setup(0x02, 0x03, 0, 0x0182, 0)),
            Err(Error::Protocol { request_type: 0x02, request: 0x03 })
        );
        assert!(!f.bus.sie().registers().is_stalled(5));
        assert!(f.run(setup(0x82, 0x00, 0, 0x0182, 2)).is_err());
    }

    #[test]
    fn other_endpoint_features_fail() {
        let mut f = Fixture::new();
        assert!(f.run(setup(0x02, 0x03, 1, 0x82, 0)).is_err());
        assert!(f.run(setup(0x02, 0x01, 2, 0x82, 0)).is_err());
        assert!(!f.bus.sie().registers().is_stalled(5));
    }

    #[test]
    fn unimplemented_requests_fail() {
        let mut f = Fixture::new();
        // SYNCH_FRAME, SET_DESCRIPTOR, and a code nobody defines.
        assert!(f.run(setup(0x82, 0x0C, 0, 0x81, 2)).is_err());
        assert!(f.run(setup(0x00, 0x07, 0x0100, 0, 18)).is_err());
        assert_eq!(
            f.run(setup(0x00, 0x42, 0, 0, 0)),
            Err(Error::Protocol { request_type: 0x00, request: 0x42 })
        );
    }

    #[test]
    fn class_request_without_hook_fails() {
        let mut f = Fixture::new();
        assert_eq!(
            f.run(setup(0x21, 0x0A, 0, 0, 0)),
            Err(Error::Protocol { request_type: 0x21, request: 0x0A })
        );
    }
}
