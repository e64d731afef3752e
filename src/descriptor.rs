// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor store.
//!
//! The application hands us all of its descriptors as one flat byte table,
//! back to back in the order a host would expect to see them inside a
//! configuration: device, then each configuration followed by its interfaces
//! and their endpoints, then strings. A descriptor with a length byte of zero
//! ends the table (so does the end of the slice, if you forget).

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

use crate::endpoint::{EndpointAddress, Endpoints};
use crate::error::{Error, Result};
use crate::hci::Registers;

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum DescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfig = 0x07,
    InterfacePower = 0x08,
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct DeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Must be `DescType::Device`.
    pub descriptor_type: u8,
    /// USB version in binary-coded decimal, typically `0x01_10`.
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Max packet size of EP0: 8, 16, 32 or 64.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    pub bcd_device: U16<LittleEndian>,
    /// String table indices.
    pub manufacturer_s: u8,
    pub product_s: u8,
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct ConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Must be `DescType::Config`.
    pub descriptor_type: u8,
    /// Total length of all descriptors in this configuration, concatenated:
    /// this one, its interfaces, and their endpoints.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via
    /// `SetConfiguration`.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 must be set, bit 6 means self-powered, bit 5 remote wakeup.
    pub attributes: u8,
    /// Max power draw in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct InterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Must be `DescType::Interface`.
    pub descriptor_type: u8,
    pub interface_number: u8,
    /// Allows one `interface_number` to have several alternate settings.
    /// Normally there's only one, and this is zero.
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct EndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Must be `DescType::Endpoint`.
    pub descriptor_type: u8,
    /// Bottom 4 bits are the endpoint number, top bit is IN.
    pub endpoint_address: u8,
    /// Transfer type in the bottom 2 bits.
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    pub interval: u8,
}

/// Configuration attribute bit meaning the device has its own power.
pub const ATTR_SELF_POWERED: u8 = 1 << 6;

/// Overlays the fixed part of a descriptor of type `T` on `bytes`.
fn overlay<T: FromBytes + Unaligned>(bytes: &[u8]) -> Option<&T> {
    LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes).map(|(lv, _)| lv.into_ref())
}

/// A descriptor table, and the walks we do over it.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorTable<'a> {
    bytes: &'a [u8],
}

impl<'a> DescriptorTable<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Iterates over descriptors up to the terminator. Each item starts at a
    /// descriptor and runs to the end of the table.
    fn entries(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let mut rest = self.bytes;
        core::iter::from_fn(move || {
            let len = usize::from(*rest.first()?);
            if len == 0 || rest.len() < 2 {
                return None;
            }
            let here = rest;
            rest = rest.get(len..).unwrap_or(&[]);
            Some(here)
        })
    }

    /// Finds a descriptor for `GET_DESCRIPTOR`. The high byte of `type_index`
    /// is the descriptor type, the low byte which one of that type we want,
    /// counting from zero in table order.
    ///
    /// For configuration descriptors the result covers `total_length` bytes,
    /// so it includes the interfaces and endpoints that follow.
    ///
    /// `_lang_id` is accepted because hosts send it with string requests, but
    /// the table only holds one language.
    pub fn find(&self, type_index: u16, _lang_id: u16) -> Result<&'a [u8]> {
        let [index, ty] = type_index.to_le_bytes();
        let not_found = Error::DescriptorNotFound { descriptor_type: ty, index };

        let here = self
            .entries()
            .filter(|d| d[1] == ty)
            .nth(usize::from(index))
            .ok_or_else(|| {
                log::debug!("descriptor type {} index {} not found", ty, index);
                not_found
            })?;

        let len = if ty == DescType::Config as u8 {
            let cd = overlay::<ConfigurationDescriptor>(here).ok_or(not_found)?;
            usize::from(cd.total_length.get())
        } else {
            usize::from(here[0])
        };
        here.get(..len).ok_or(not_found)
    }

    /// Attributes byte of the configuration with this value.
    pub fn configuration_attributes(&self, config: u8) -> Option<u8> {
        self.entries()
            .filter(|d| d[1] == DescType::Config as u8)
            .filter_map(overlay::<ConfigurationDescriptor>)
            .find(|cd| cd.configuration_value == config)
            .map(|cd| cd.attributes)
    }

    /// Endpoint descriptors listed under configuration `config`, alternate
    /// setting `alt`.
    fn endpoints_for(
        &self,
        config: u8,
        alt: u8,
    ) -> impl Iterator<Item = &'a EndpointDescriptor> + 'a {
        // 0xFF never matches a real configuration value, so nothing matches
        // before the first configuration/interface header.
        let mut cur_config = 0xFF;
        let mut cur_alt = 0xFF;

        self.entries().filter_map(move |d| {
            match num_traits::FromPrimitive::from_u8(d[1]) {
                Some(DescType::Config) => {
                    if let Some(cd) = overlay::<ConfigurationDescriptor>(d) {
                        cur_config = cd.configuration_value;
                    }
                    None
                }
                Some(DescType::Interface) => {
                    if let Some(id) = overlay::<InterfaceDescriptor>(d) {
                        cur_alt = id.alternate_setting;
                    }
                    None
                }
                Some(DescType::Endpoint) if cur_config == config && cur_alt == alt => {
                    overlay::<EndpointDescriptor>(d)
                }
                _ => None,
            }
        })
    }

    /// Sets up the hardware for configuration `config`, alternate setting
    /// `alt`: every endpoint listed under a matching interface gets realized,
    /// and then the device is marked configured. Configuration 0 unconfigures
    /// the device instead.
    ///
    /// Fails without touching anything if no configuration has that value, or
    /// if one of its endpoint addresses is invalid.
    pub fn configure_for_setting<R: Registers>(
        &self,
        bus: &mut Endpoints<R>,
        config: u8,
        alt: u8,
    ) -> Result<()> {
        if config == 0 {
            return bus.sie().configure_device(false);
        }
        if self.configuration_attributes(config).is_none() {
            log::warn!("no configuration {}", config);
            return Err(Error::DescriptorNotFound {
                descriptor_type: DescType::Config as u8,
                index: config,
            });
        }

        // Check every address first so a bad one can't leave the
        // configuration half realized.
        for ed in self.endpoints_for(config, alt) {
            EndpointAddress::try_from(ed.endpoint_address)?;
        }
        for ed in self.endpoints_for(config, alt) {
            let ep = EndpointAddress::try_from(ed.endpoint_address)?;
            bus.configure(ep, ed.max_packet_size.get())?;
        }

        bus.sie().configure_device(true)
    }
}
