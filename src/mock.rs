// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A behavioral model of the USB block, for tests.
//!
//! This is not cycle-accurate and doesn't try to be. It runs the SIE command
//! protocol, endpoint realization, the RX/TX packet paths, stall bits, and the
//! interrupt status registers, closely enough that the driver can't tell the
//! difference for the sequences we exercise. Completion flags are raised
//! instantly unless the model has been told to `hang`.

use std::collections::VecDeque;
use std::vec::Vec;

use crate::hci::*;

struct Packet {
    data: Vec<u8>,
    setup: bool,
    valid: bool,
}

pub struct MockSie {
    dev_int_st: u32,
    dev_int_en: u32,
    ep_int_st: u32,
    ep_int_en: u32,
    re_ep: u32,
    ep_ind: u32,
    max_psize: [u32; 32],
    ctrl: u32,
    hung: bool,

    pending: Option<u8>,
    cmd_data: u32,
    cmd_code_writes: Vec<u32>,
    frame_byte: usize,

    address: Option<u8>,
    configured: bool,
    connected: bool,
    nak_mode: u8,
    dev_status: u8,
    frame: u16,
    stalled: u32,
    ep_flags: [u8; 32],
    selected: usize,
    corrupted_status_reads: usize,

    rx: Vec<VecDeque<Packet>>,
    read_idx: Option<usize>,
    rx_offset: usize,

    tx_len: u32,
    tx_filling: Option<(usize, Vec<u8>)>,
    tx_ready: Option<(usize, Vec<u8>)>,
    sent: Vec<(usize, Vec<u8>)>,
}

impl MockSie {
    pub fn new() -> Self {
        Self {
            dev_int_st: 0,
            dev_int_en: 0,
            ep_int_st: 0,
            ep_int_en: 0,
            re_ep: 0,
            ep_ind: 0,
            max_psize: [0; 32],
            ctrl: 0,
            hung: false,
            pending: None,
            cmd_data: 0,
            cmd_code_writes: Vec::new(),
            frame_byte: 0,
            address: None,
            configured: false,
            connected: false,
            nak_mode: 0,
            dev_status: 0,
            frame: 0,
            stalled: 0,
            ep_flags: [0; 32],
            selected: 0,
            corrupted_status_reads: 0,
            rx: (0..32).map(|_| VecDeque::new()).collect(),
            read_idx: None,
            rx_offset: 0,
            tx_len: 0,
            tx_filling: None,
            tx_ready: None,
            sent: Vec::new(),
        }
    }

    /// From now on, never raise a completion flag.
    pub fn hang(&mut self) {
        self.hung = true;
    }

    pub fn cmd_code_writes(&self) -> &[u32] {
        &self.cmd_code_writes
    }

    pub fn address(&self) -> Option<u8> {
        self.address
    }

    pub fn configured(&self) -> bool {
        self.configured
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn nak_mode(&self) -> u8 {
        self.nak_mode
    }

    pub fn is_stalled(&self, idx: usize) -> bool {
        self.stalled & 1 << idx != 0
    }

    pub fn realized(&self) -> u32 {
        self.re_ep
    }

    pub fn max_packet(&self, idx: usize) -> u32 {
        self.max_psize[idx]
    }

    pub fn ep_int_enabled(&self) -> u32 {
        self.ep_int_en
    }

    pub fn dev_int_enabled(&self) -> u32 {
        self.dev_int_en
    }

    pub fn corrupted_status_reads(&self) -> usize {
        self.corrupted_status_reads
    }

    pub fn set_device_status(&mut self, status: u8) {
        self.dev_status = status;
    }

    pub fn set_frame(&mut self, frame: u16) {
        self.frame = frame;
    }

    /// Extra raw select-endpoint status bits to report for `idx`.
    pub fn set_ep_flags(&mut self, idx: usize, flags: u8) {
        self.ep_flags[idx] = flags;
    }

    pub fn raise_frame(&mut self) {
        self.dev_int_st |= FRAME;
    }

    pub fn raise_device_status(&mut self, status: u8) {
        self.dev_status = status;
        self.dev_int_st |= DEV_STAT;
    }

    /// A SETUP token with its 8 bytes landed in EP0 OUT. Like the hardware,
    /// this clears any stall on the control endpoints.
    pub fn raise_setup(&mut self, packet: [u8; 8]) {
        self.stalled &= !0b11;
        self.rx[0].push_back(Packet { data: packet.to_vec(), setup: true, valid: true });
        self.raise_ep(0);
    }

    /// A SETUP token followed by fewer than the 8 bytes it should carry.
    pub fn raise_short_setup(&mut self, packet: &[u8]) {
        self.stalled &= !0b11;
        self.rx[0].push_back(Packet { data: packet.to_vec(), setup: true, valid: true });
        self.raise_ep(0);
    }

    /// An OUT data packet landed in endpoint `idx`.
    pub fn raise_out(&mut self, idx: usize, data: &[u8]) {
        self.rx[idx].push_back(Packet { data: data.to_vec(), setup: false, valid: true });
        self.raise_ep(idx);
    }

    /// An OUT packet that failed its CRC, so DV stays clear.
    pub fn raise_invalid_out(&mut self, idx: usize) {
        self.rx[idx].push_back(Packet { data: Vec::new(), setup: false, valid: false });
        self.raise_ep(idx);
    }

    /// The host collected whatever was in IN endpoint `idx`.
    pub fn raise_in(&mut self, idx: usize) {
        self.raise_ep(idx);
    }

    fn raise_ep(&mut self, idx: usize) {
        self.ep_int_st |= 1 << idx;
        self.dev_int_st |= EP_SLOW;
    }

    /// Everything written and validated so far, as (index, bytes).
    pub fn take_sent(&mut self) -> Vec<(usize, Vec<u8>)> {
        core::mem::take(&mut self.sent)
    }

    /// Lengths of the packets validated on `idx`, draining them.
    pub fn take_sent_lengths(&mut self, idx: usize) -> Vec<usize> {
        self.take_sent()
            .into_iter()
            .filter(|(i, _)| *i == idx)
            .map(|(_, d)| d.len())
            .collect()
    }

    pub fn pending_rx(&self, idx: usize) -> usize {
        self.rx[idx].len()
    }

    fn ep_status(&self, idx: usize) -> u8 {
        let mut s = self.ep_flags[idx];
        if let Some(p) = self.rx[idx].front() {
            s |= EPSTAT_FE;
            if p.setup {
                s |= EPSTAT_STP;
            }
        }
        if self.is_stalled(idx) {
            s |= EPSTAT_ST;
        }
        s
    }

    fn run_command(&mut self, cmd: u8) {
        self.pending = Some(cmd);
        self.frame_byte = 0;
        match cmd {
            0x00..=0x1F => self.selected = usize::from(cmd),
            CMD_EP_CLEAR_BUFFER => {
                self.rx[self.selected].pop_front();
            }
            CMD_EP_VALIDATE_BUFFER => {
                if let Some(p) = self.tx_ready.take() {
                    self.sent.push(p);
                }
            }
            _ => (),
        }
        self.dev_int_st |= CCEMTY;
    }

    fn run_write(&mut self, data: u8) {
        match self.pending {
            Some(CMD_DEV_SET_ADDRESS) => {
                if data & DEV_EN != 0 {
                    self.address = Some(data & 0x7F);
                }
            }
            Some(CMD_DEV_CONFIG) => self.configured = data & CONF_DEVICE != 0,
            Some(CMD_DEV_SET_MODE) => self.nak_mode = data,
            Some(CMD_DEV_STATUS) => self.connected = data & CON != 0,
            Some(c @ 0x40..=0x5F) => {
                let bit = 1 << (c - CMD_EP_SET_STATUS);
                if data & EP_ST != 0 {
                    self.stalled |= bit;
                } else {
                    self.stalled &= !bit;
                }
            }
            _ => (),
        }
        self.dev_int_st |= CCEMTY;
    }

    fn run_read(&mut self, cmd: u8) {
        let value = match self.pending.filter(|&p| p == cmd) {
            Some(CMD_DEV_STATUS) => {
                if self.dev_int_st & DEV_STAT != 0 {
                    // The user manual warns that this read comes back as
                    // garbage if DEV_STAT is still pending.
                    self.corrupted_status_reads += 1;
                    0xFF
                } else {
                    let s = self.dev_status;
                    self.dev_status &= !(CON_CH | SUS_CH | RST);
                    s
                }
            }
            Some(CMD_DEV_READ_CUR_FRAME_NR) => {
                let b = self.frame.to_le_bytes()[self.frame_byte.min(1)];
                self.frame_byte += 1;
                b
            }
            Some(c @ 0x00..=0x1F) => self.ep_status(usize::from(c)),
            _ => 0,
        };
        self.cmd_data = u32::from(value);
        self.dev_int_st |= CDFULL;
    }
}

impl Registers for MockSie {
    fn read(&mut self, reg: Reg) -> u32 {
        match reg {
            Reg::DevIntSt => self.dev_int_st,
            Reg::DevIntEn => self.dev_int_en,
            Reg::CmdData => self.cmd_data,
            Reg::EpIntSt => self.ep_int_st,
            Reg::EpIntEn => self.ep_int_en,
            Reg::ReEp => self.re_ep,
            Reg::EpInd => self.ep_ind,
            Reg::MaxPSize => self.max_psize[self.ep_ind as usize & 31],
            Reg::Ctrl => self.ctrl,
            Reg::RxPLen => match self.read_idx {
                Some(idx) => match self.rx[idx].front() {
                    Some(p) => {
                        PKT_RDY | if p.valid { DV } else { 0 } | p.data.len() as u32
                    }
                    None => PKT_RDY | DV,
                },
                None => 0,
            },
            Reg::RxData => {
                let Some(idx) = self.read_idx else { return 0 };
                let Some(p) = self.rx[idx].front() else { return 0 };
                let mut word = [0u8; 4];
                for (i, b) in word.iter_mut().enumerate() {
                    *b = p.data.get(self.rx_offset + i).copied().unwrap_or(0);
                }
                self.rx_offset += 4;
                u32::from_le_bytes(word)
            }
            _ => 0,
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        match reg {
            Reg::DevIntClr => self.dev_int_st &= !value,
            Reg::DevIntSet => self.dev_int_st |= value,
            Reg::DevIntEn => self.dev_int_en = value,
            Reg::EpIntClr => self.ep_int_st &= !value,
            Reg::EpIntSet => self.ep_int_st |= value,
            Reg::EpIntEn => self.ep_int_en = value,
            Reg::ReEp => self.re_ep = value,
            Reg::EpInd => self.ep_ind = value,
            Reg::MaxPSize => {
                self.max_psize[self.ep_ind as usize & 31] = value;
                if !self.hung {
                    self.dev_int_st |= EP_RLZED;
                }
            }
            Reg::CmdCode => {
                self.cmd_code_writes.push(value);
                if self.hung {
                    return;
                }
                let byte = (value >> 16) as u8;
                match value & 0xFF00 {
                    PHASE_COMMAND => self.run_command(byte),
                    PHASE_WRITE => self.run_write(byte),
                    PHASE_READ => self.run_read(byte),
                    _ => (),
                }
            }
            Reg::Ctrl => {
                self.ctrl = value;
                let logical = ((value >> 2) & 0xF) as usize;
                if value & RD_EN != 0 {
                    self.read_idx = Some(logical << 1);
                    self.rx_offset = 0;
                } else {
                    self.read_idx = None;
                }
                if value & WR_EN != 0 {
                    self.tx_filling = Some(((logical << 1) | 1, Vec::new()));
                }
            }
            Reg::TxPLen => self.tx_len = value,
            Reg::TxData => {
                if let Some((idx, mut data)) = self.tx_filling.take() {
                    data.extend_from_slice(&value.to_le_bytes());
                    if data.len() >= self.tx_len as usize {
                        data.truncate(self.tx_len as usize);
                        self.tx_ready = Some((idx, data));
                        self.ctrl &= !WR_EN;
                    } else {
                        self.tx_filling = Some((idx, data));
                    }
                }
            }
            _ => (),
        }
    }
}
