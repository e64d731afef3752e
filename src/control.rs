// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control transfer engine, which owns endpoint 0 in both directions.
//!
//! A control transfer has up to three stages:
//!
//! 1. SETUP: the host sends 8 bytes describing the request. This always lands
//!    in EP0 OUT, flagged as a SETUP by the engine.
//! 2. DATA (optional): `length` bytes move in the direction given by the setup
//!    packet, in chunks of at most the EP0 max packet size.
//! 3. STATUS: a zero-length packet in the _opposite_ direction acknowledges
//!    the whole thing.
//!
//! Device-to-host and data-less requests are dispatched as soon as the SETUP
//! arrives, since everything the handler needs is in the setup packet.
//! Host-to-device requests with data are dispatched once the whole data
//! stage has been collected into the staging buffer.
//!
//! Any failure stalls EP0 IN and drops the transfer. The host will try again
//! with a fresh SETUP, which resets everything here.

use zerocopy::AsBytes;

use crate::endpoint::{EndpointAddress, EpStatus, Endpoints, UsbDir};
use crate::error::{Error, Result};
use crate::hci::Registers;
use crate::request::{Reply, SetupPacket};

/// Size of the staging buffer: the largest full-speed EP0 packet.
pub const STAGING_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    /// A setup packet has been read and is being dispatched.
    SetupCaptured,
    /// Sending reply data to the host.
    DataIn,
    /// Collecting request data from the host.
    DataOut,
    /// Waiting for the status stage to finish.
    Status,
}

/// Where the bytes we're sending come from.
#[derive(Copy, Clone, Debug)]
enum Source<'a> {
    Staging,
    Borrowed(&'a [u8]),
}

/// State of the control transfer in progress, if any.
pub struct ControlTransfer<'a> {
    setup: SetupPacket,
    stage: Stage,
    source: Source<'a>,
    /// Offset of the next byte to send or receive.
    pos: usize,
    /// Bytes left in the data stage. Never more than `setup.length`.
    remaining: usize,
    /// Whether a zero-length packet is owed to end a short reply.
    terminate: bool,
    max_packet: usize,
    staging: [u8; STAGING_LEN],
}

impl<'a> ControlTransfer<'a> {
    pub fn new(max_packet_size: u16) -> Self {
        Self {
            setup: SetupPacket::EMPTY,
            stage: Stage::Idle,
            source: Source::Staging,
            pos: 0,
            remaining: 0,
            terminate: false,
            max_packet: usize::from(max_packet_size).clamp(1, STAGING_LEN),
            staging: [0; STAGING_LEN],
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The setup packet of the current (or last) transfer.
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet
    }

    /// Drops whatever transfer was in progress.
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.source = Source::Staging;
        self.pos = 0;
        self.remaining = 0;
        self.terminate = false;
    }

    /// Handles an EP0 OUT event. `dispatch` runs the request once it is
    /// complete; it gets the staging buffer, holding any data the host sent,
    /// to put its reply in.
    pub fn on_out<R, F>(
        &mut self,
        bus: &mut Endpoints<R>,
        status: EpStatus,
        dispatch: F,
    ) -> Result<()>
    where
        R: Registers,
        F: FnOnce(&mut Endpoints<R>, &SetupPacket, &mut [u8]) -> Result<Reply<'a>>,
    {
        if status.contains(EpStatus::SETUP) {
            self.reset();
            bus.note_setup();
            return self.on_setup(bus, dispatch);
        }

        if self.stage == Stage::DataOut && self.remaining > 0 {
            let end = self.pos + self.remaining;
            let n = match bus.read(EndpointAddress::EP0_OUT, &mut self.staging[self.pos..end]) {
                Ok(n) => n.min(self.remaining),
                Err(e) => return self.fail(bus, e),
            };
            self.pos += n;
            self.remaining -= n;
            if self.remaining > 0 {
                return Ok(());
            }

            let setup = self.setup;
            let reply = match dispatch(bus, &setup, &mut self.staging) {
                Ok(r) => r,
                Err(e) => return self.fail(bus, e),
            };
            if !reply.is_empty() {
                log::debug!("dropping {} byte reply to OUT request", reply.len());
            }
            // Status stage: zero-length IN.
            self.source = Source::Staging;
            self.pos = 0;
            return match self.send_chunk(bus) {
                Ok(()) => Ok(()),
                Err(e) => self.fail(bus, e),
            };
        }

        // Anything else should be the host's zero-length status packet after
        // we've sent it data. Absorb it.
        match bus.read(EndpointAddress::EP0_OUT, &mut []) {
            Ok(0) => (),
            Ok(n) => log::debug!("ignoring {} byte packet on EP0 in {:?}", n, self.stage),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => log::debug!("ignoring bad status packet: {}", e),
        }
        self.reset();
        Ok(())
    }

    fn on_setup<R, F>(&mut self, bus: &mut Endpoints<R>, dispatch: F) -> Result<()>
    where
        R: Registers,
        F: FnOnce(&mut Endpoints<R>, &SetupPacket, &mut [u8]) -> Result<Reply<'a>>,
    {
        let mut raw = [0u8; 8];
        let n = match bus.read(EndpointAddress::EP0_OUT, &mut raw) {
            Ok(n) => n,
            Err(e) => return self.fail(bus, e),
        };
        // A short packet leaves the tail of `raw` zeroed. Keep whatever did
        // arrive so the stall is logged against these bytes.
        let Some(setup) = SetupPacket::parse(&raw) else {
            return self.fail(bus, Error::InvalidPacket);
        };
        self.setup = setup;
        if n != raw.len() {
            log::warn!("{} byte setup packet", n);
            let e = Error::Protocol { request_type: raw[0], request: raw[1] };
            return self.fail(bus, e);
        }
        log::trace!("SETUP {:02x?}", raw);

        self.stage = Stage::SetupCaptured;
        let requested = usize::from(setup.length.get());
        self.remaining = requested;

        if requested == 0 || setup.direction() == UsbDir::In {
            let reply = match dispatch(bus, &setup, &mut self.staging) {
                Ok(r) => r,
                Err(e) => return self.fail(bus, e),
            };
            if let Err(e) = self.start_reply(reply, requested) {
                return self.fail(bus, e);
            }
            match self.send_chunk(bus) {
                Ok(()) => Ok(()),
                Err(e) => self.fail(bus, e),
            }
        } else if requested > STAGING_LEN {
            self.fail(bus, Error::BufferOverrun { len: requested, capacity: STAGING_LEN })
        } else {
            self.stage = Stage::DataOut;
            Ok(())
        }
    }

    /// Handles an EP0 IN event: the host has taken the last packet we loaded.
    pub fn on_in<R: Registers>(&mut self, bus: &mut Endpoints<R>, _status: EpStatus) -> Result<()> {
        match self.stage {
            Stage::DataIn => match self.send_chunk(bus) {
                Ok(()) => Ok(()),
                Err(e) => self.fail(bus, e),
            },
            // Our zero-length status packet went out; done.
            Stage::Status if self.setup.direction() == UsbDir::Out => {
                self.reset();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start_reply(&mut self, reply: Reply<'a>, requested: usize) -> Result<()> {
        let len = reply.len();
        self.source = match reply {
            Reply::Staged(n) if n > STAGING_LEN => {
                return Err(Error::BufferOverrun { len: n, capacity: STAGING_LEN });
            }
            Reply::Empty | Reply::Staged(_) => Source::Staging,
            Reply::Borrowed(b) => Source::Borrowed(b),
        };
        self.pos = 0;
        self.remaining = len.min(requested);
        // The host stops reading at a short packet, or once it has
        // `requested` bytes. A reply that is shorter than requested and ends
        // on a packet boundary needs an explicit zero-length packet to tell
        // the host it's over. A reply of exactly `requested` bytes doesn't.
        self.terminate = len > 0 && len < requested && len % self.max_packet == 0;
        Ok(())
    }

    /// Loads the next chunk of up to one max packet into EP0 IN.
    fn send_chunk<R: Registers>(&mut self, bus: &mut Endpoints<R>) -> Result<()> {
        let n = self.remaining.min(self.max_packet);
        let data = match self.source {
            Source::Staging => &self.staging[self.pos..self.pos + n],
            Source::Borrowed(b) => &b[self.pos..self.pos + n],
        };
        bus.write(EndpointAddress::EP0_IN, data)?;

        self.pos += n;
        self.remaining -= n;
        if n < self.max_packet {
            self.terminate = false;
        }
        self.stage = if self.remaining > 0 || self.terminate {
            Stage::DataIn
        } else {
            Stage::Status
        };
        Ok(())
    }

    /// Abandons the transfer. Unless the hardware itself is the problem, that
    /// means stalling EP0 IN so the host knows.
    fn fail<R: Registers>(&mut self, bus: &mut Endpoints<R>, e: Error) -> Result<()> {
        self.reset();
        if e.is_fatal() {
            return Err(e);
        }
        log::warn!("STALL on {:02x?}: {}", self.setup.as_bytes(), e);
        bus.stall(EndpointAddress::EP0_IN)
    }
}
