// Zilog 8530 SCC, as much of it as the Macintosh Plus exercises: the
// indirect register-pointer access protocol, the SDLC receive path that
// carries LocalTalk frames, and the DCD status interrupts the mouse
// quadrature lines are wired to. Channel A is the modem port (mouse X1),
// channel B the printer port (mouse Y1).

use crate::checkpoint::{StateReader, StateWriter};
use crate::devices::{Device, IrqLines, Shared};
use crate::fields::{OpResult, Size};
use crate::scheduler::{EventKind, Scheduler};
use log::{debug, trace};
use std::collections::VecDeque;
use std::rc::Rc;

pub const CHANNEL_A: usize = 0;
pub const CHANNEL_B: usize = 1;

/// Complete SDLC frames waiting to be clocked in, per channel.
const FRAME_QUEUE_DEPTH: usize = 8;
/// Largest frame LocalTalk will hand us.
pub const MAX_FRAME_LEN: usize = 1024;
/// Receive FIFO depth of the real chip.
const RX_FIFO_DEPTH: usize = 3;
/// Cycles between received bytes: 230.4 kbit SDLC, 8 bits per byte.
const CYCLES_PER_RX_BYTE: u64 = 272;

// RR0 bits.
const RR0_RX_AVAILABLE: u8 = 0x01;
const RR0_TX_EMPTY: u8 = 0x04;
const RR0_DCD: u8 = 0x08;
// RR1 bits.
const RR1_ALL_SENT: u8 = 0x01;
const RR1_END_OF_FRAME: u8 = 0x80;
// WR1 receive interrupt mode mask.
const WR1_RX_INT_MASK: u8 = 0x18;
// WR3 receiver enable.
const WR3_RX_ENABLE: u8 = 0x01;
// WR9 master interrupt enable.
const WR9_MIE: u8 = 0x08;
// WR15 DCD interrupt enable.
const WR15_DCD_IE: u8 = 0x08;

struct SccChannel {
    wr: [u8; 16],
    dcd: bool,
    rx_fifo: VecDeque<u8>,
    staging: VecDeque<u8>,
    frames: VecDeque<Vec<u8>>,
    overflow_count: u64,
    rx_irq: bool,
    ext_irq: bool,
    end_of_frame: bool,
    delivery_running: bool,
}

impl SccChannel {
    fn new() -> Self {
        SccChannel {
            wr: [0; 16],
            dcd: false,
            rx_fifo: VecDeque::new(),
            staging: VecDeque::new(),
            frames: VecDeque::new(),
            overflow_count: 0,
            rx_irq: false,
            ext_irq: false,
            end_of_frame: false,
            delivery_running: false,
        }
    }

    fn rx_enabled(&self) -> bool {
        self.wr[3] & WR3_RX_ENABLE != 0
    }

    fn rr0(&self) -> u8 {
        let mut value = RR0_TX_EMPTY;
        if !self.rx_fifo.is_empty() {
            value |= RR0_RX_AVAILABLE;
        }
        if self.dcd {
            value |= RR0_DCD;
        }
        value
    }

    fn rr1(&self) -> u8 {
        let mut value = RR1_ALL_SENT;
        if self.end_of_frame {
            value |= RR1_END_OF_FRAME;
        }
        value
    }
}

pub struct Scc {
    channels: [SccChannel; 2],
    /// Register pointer shared by both channels, set through WR0.
    pointer: u8,
    wr9: u8,
    irq: Rc<IrqLines>,
    sched: Shared<Scheduler>,
}

impl Scc {
    pub fn new(sched: Shared<Scheduler>, irq: Rc<IrqLines>) -> Self {
        Scc {
            channels: [SccChannel::new(), SccChannel::new()],
            pointer: 0,
            wr9: 0,
            irq,
            sched,
        }
    }

    fn update_irq(&mut self) {
        let pending = self
            .channels
            .iter()
            .any(|ch| ch.rx_irq || ch.ext_irq);
        self.irq.set(2, pending && self.wr9 & WR9_MIE != 0);
    }

    /// Interrupt-pending summary, RR3 layout (read through channel A).
    fn rr3(&self) -> u8 {
        let mut value = 0;
        if self.channels[CHANNEL_A].rx_irq {
            value |= 0x20;
        }
        if self.channels[CHANNEL_A].ext_irq {
            value |= 0x08;
        }
        if self.channels[CHANNEL_B].rx_irq {
            value |= 0x04;
        }
        if self.channels[CHANNEL_B].ext_irq {
            value |= 0x01;
        }
        value
    }

    /// Inject a complete SDLC frame, as LocalTalk hands them over. A full
    /// queue drops the frame and counts the overflow.
    pub fn sdlc_send(&mut self, channel: usize, frame: &[u8]) {
        let ch = &mut self.channels[channel];
        if frame.len() > MAX_FRAME_LEN || ch.frames.len() >= FRAME_QUEUE_DEPTH {
            ch.overflow_count += 1;
            debug!(
                "SDLC frame dropped on channel {} (queue {}, {} overflows)",
                channel,
                ch.frames.len(),
                ch.overflow_count
            );
            return;
        }
        ch.frames.push_back(frame.to_vec());
        self.pump_receive(channel);
    }

    /// Stage the next queued frame and start pacing bytes into the FIFO.
    fn pump_receive(&mut self, channel: usize) {
        let ch = &mut self.channels[channel];
        if !ch.rx_enabled() || ch.delivery_running {
            return;
        }
        if ch.staging.is_empty() {
            match ch.frames.pop_front() {
                Some(frame) => ch.staging = frame.into(),
                None => return,
            }
        }
        ch.delivery_running = true;
        self.sched
            .borrow_mut()
            .schedule(EventKind::SccRxByte, channel as u64, CYCLES_PER_RX_BYTE);
    }

    /// One receive-character interval elapsed: move a staged byte into
    /// the FIFO and keep the pace while the frame lasts.
    pub fn rx_byte_event(&mut self, channel: u64) {
        let channel = channel as usize;
        let ch = &mut self.channels[channel];
        ch.delivery_running = false;
        if !ch.rx_enabled() {
            return;
        }
        if let Some(byte) = ch.staging.pop_front() {
            if ch.rx_fifo.len() >= RX_FIFO_DEPTH {
                ch.rx_fifo.pop_front();
                trace!("SCC rx FIFO overrun on channel {}", channel);
            }
            ch.rx_fifo.push_back(byte);
            if ch.staging.is_empty() {
                ch.end_of_frame = true;
            }
            if ch.wr[1] & WR1_RX_INT_MASK != 0 {
                ch.rx_irq = true;
            }
        }
        if !ch.staging.is_empty() {
            ch.delivery_running = true;
            self.sched
                .borrow_mut()
                .schedule(EventKind::SccRxByte, channel as u64, CYCLES_PER_RX_BYTE);
        }
        self.update_irq();
        if self.channels[channel].staging.is_empty() {
            self.pump_receive(channel);
        }
    }

    /// Mouse quadrature edge: the X1/Y1 lines drive the DCD inputs.
    pub fn set_dcd(&mut self, channel: usize, state: bool) {
        let ch = &mut self.channels[channel];
        if ch.dcd == state {
            return;
        }
        ch.dcd = state;
        if ch.wr[15] & WR15_DCD_IE != 0 {
            ch.ext_irq = true;
        }
        self.update_irq();
    }

    pub fn overflow_count(&self, channel: usize) -> u64 {
        self.channels[channel].overflow_count
    }

    fn read_data(&mut self, channel: usize) -> u8 {
        let byte = self.channels[channel].rx_fifo.pop_front().unwrap_or(0);
        if self.channels[channel].rx_fifo.is_empty() {
            self.channels[channel].rx_irq = false;
        }
        self.update_irq();
        self.pump_receive(channel);
        byte
    }

    fn write_control(&mut self, channel: usize, value: u8) {
        if self.pointer == 0 {
            let low = value & 7;
            let command = (value >> 3) & 7;
            match command {
                0 => self.pointer = low,
                1 => self.pointer = low + 8,
                2 => {
                    // Reset external/status interrupts.
                    self.channels[channel].ext_irq = false;
                    self.pointer = 0;
                    self.update_irq();
                }
                3 => {
                    trace!("SDLC abort on channel {}", channel);
                    self.pointer = 0;
                }
                6 => {
                    self.channels[channel].end_of_frame = false;
                    self.pointer = 0;
                }
                _ => {
                    trace!("SCC WR0 command {} ignored", command);
                    self.pointer = 0;
                }
            }
            return;
        }
        let reg = self.pointer as usize;
        self.pointer = 0;
        match reg {
            9 => {
                if value & 0xc0 != 0 {
                    debug!("SCC reset command {:02x}", value >> 6);
                    for ch in self.channels.iter_mut() {
                        ch.rx_irq = false;
                        ch.ext_irq = false;
                        ch.rx_fifo.clear();
                    }
                }
                self.wr9 = value & 0x3f;
                self.update_irq();
            }
            _ => {
                self.channels[channel].wr[reg] = value;
                if reg == 3 {
                    self.pump_receive(channel);
                }
            }
        }
    }

    fn read_control(&mut self, channel: usize) -> u8 {
        let reg = self.pointer as usize;
        self.pointer = 0;
        match reg {
            0 => self.channels[channel].rr0(),
            1 => {
                let value = self.channels[channel].rr1();
                self.channels[channel].end_of_frame = false;
                value
            }
            2 => 0, // interrupt vector, unused by the ROM's polling driver
            3 => {
                if channel == CHANNEL_A {
                    self.rr3()
                } else {
                    0
                }
            }
            8 => self.read_data(channel),
            _ => {
                trace!("SCC read of RR{} on channel {}", reg, channel);
                0
            }
        }
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(self.pointer);
        w.put_u8(self.wr9);
        for ch in &self.channels {
            w.put_bytes(&ch.wr);
            w.put_u8(ch.dcd as u8);
            w.put_u8(
                (ch.rx_irq as u8)
                    | (ch.ext_irq as u8) << 1
                    | (ch.end_of_frame as u8) << 2
                    | (ch.delivery_running as u8) << 3,
            );
            w.put_u64(ch.overflow_count);
            w.put_u16(ch.rx_fifo.len() as u16);
            for &b in &ch.rx_fifo {
                w.put_u8(b);
            }
            w.put_u16(ch.staging.len() as u16);
            for &b in &ch.staging {
                w.put_u8(b);
            }
            w.put_u16(ch.frames.len() as u16);
            for frame in &ch.frames {
                w.put_u16(frame.len() as u16);
                w.put_bytes(frame);
            }
        }
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        self.pointer = r.take_u8();
        self.wr9 = r.take_u8();
        for ch in self.channels.iter_mut() {
            r.take_bytes(&mut ch.wr);
            ch.dcd = r.take_u8() != 0;
            let flags = r.take_u8();
            ch.rx_irq = flags & 1 != 0;
            ch.ext_irq = flags & 2 != 0;
            ch.end_of_frame = flags & 4 != 0;
            ch.delivery_running = flags & 8 != 0;
            ch.overflow_count = r.take_u64();
            let n = r.take_u16() as usize;
            ch.rx_fifo = (0..n).map(|_| r.take_u8()).collect();
            let n = r.take_u16() as usize;
            ch.staging = (0..n).map(|_| r.take_u8()).collect();
            let n = r.take_u16() as usize;
            ch.frames = (0..n)
                .map(|_| {
                    let len = r.take_u16() as usize;
                    r.take_vec(len)
                })
                .collect();
        }
        self.update_irq();
    }
}

impl Device for Scc {
    /// Offsets within either SCC region: bit 1 selects channel A, bit 2
    /// selects the data register.
    fn read(&mut self, offset: u32, _size: Size) -> OpResult {
        let channel = if offset & 2 != 0 { CHANNEL_A } else { CHANNEL_B };
        let value = if offset & 4 != 0 {
            self.read_data(channel)
        } else {
            self.read_control(channel)
        };
        OpResult::Byte(value)
    }
    fn write(&mut self, offset: u32, value: OpResult) {
        let channel = if offset & 2 != 0 { CHANNEL_A } else { CHANNEL_B };
        let value = value.inner() as u8;
        if offset & 4 != 0 {
            trace!("SCC transmit byte {:02x} on channel {}", value, channel);
        } else {
            self.write_control(channel, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::shared;

    fn fixture() -> (Shared<Scheduler>, Scc) {
        let sched = shared(Scheduler::new(7_833_600));
        let scc = Scc::new(sched.clone(), IrqLines::new());
        (sched, scc)
    }

    fn drain_events(sched: &Shared<Scheduler>, scc: &mut Scc) {
        loop {
            let event = {
                let mut s = sched.borrow_mut();
                if s.begin_sprint(1_000_000) > 0 {
                    s.burndown_handle().set(0);
                }
                s.finish_sprint();
                s.pop_due()
            };
            match event {
                Some(e) if e.kind == EventKind::SccRxByte => scc.rx_byte_event(e.data),
                Some(_) => {}
                None => break,
            }
        }
    }

    fn write_reg(scc: &mut Scc, channel: usize, reg: u8, value: u8) {
        if reg < 8 {
            scc.write_control(channel, reg);
        } else {
            scc.write_control(channel, 0x08 | (reg - 8));
        }
        scc.write_control(channel, value);
    }

    #[test]
    fn register_pointer_protocol() {
        let (_sched, mut scc) = fixture();
        write_reg(&mut scc, CHANNEL_A, 15, WR15_DCD_IE);
        assert_eq!(scc.channels[CHANNEL_A].wr[15], WR15_DCD_IE);
        write_reg(&mut scc, CHANNEL_B, 3, WR3_RX_ENABLE);
        assert_eq!(scc.channels[CHANNEL_B].wr[3], WR3_RX_ENABLE);
    }

    #[test]
    fn frame_delivery_paces_bytes() {
        let (sched, mut scc) = fixture();
        write_reg(&mut scc, CHANNEL_B, 9, WR9_MIE);
        write_reg(&mut scc, CHANNEL_B, 3, WR3_RX_ENABLE);
        write_reg(&mut scc, CHANNEL_B, 1, WR1_RX_INT_MASK);
        scc.sdlc_send(CHANNEL_B, &[0x10, 0x20, 0x30]);
        drain_events(&sched, &mut scc);
        // All bytes delivered; read them back through the data register.
        assert!(scc.channels[CHANNEL_B].rr0() & RR0_RX_AVAILABLE != 0);
        assert!(scc.irq.pending_level() == 2);
        assert_eq!(scc.read_data(CHANNEL_B), 0x10);
        assert_eq!(scc.read_data(CHANNEL_B), 0x20);
        assert_eq!(scc.read_data(CHANNEL_B), 0x30);
        assert!(scc.channels[CHANNEL_B].rr0() & RR0_RX_AVAILABLE == 0);
        // End of frame is flagged and clears on RR1 read.
        assert!(scc.channels[CHANNEL_B].rr1() & RR1_END_OF_FRAME != 0);
        scc.pointer = 1;
        scc.read_control(CHANNEL_B);
        assert!(scc.channels[CHANNEL_B].rr1() & RR1_END_OF_FRAME == 0);
    }

    #[test]
    fn queue_overflow_drops_frames() {
        let (_sched, mut scc) = fixture();
        // Receiver disabled, so frames pile up in the queue.
        for _ in 0..FRAME_QUEUE_DEPTH {
            scc.sdlc_send(CHANNEL_A, &[1, 2, 3]);
        }
        assert_eq!(scc.overflow_count(CHANNEL_A), 0);
        scc.sdlc_send(CHANNEL_A, &[4, 5, 6]);
        assert_eq!(scc.overflow_count(CHANNEL_A), 1);
    }

    #[test]
    fn back_to_back_frames_are_not_clobbered() {
        let (sched, mut scc) = fixture();
        write_reg(&mut scc, CHANNEL_B, 9, WR9_MIE);
        write_reg(&mut scc, CHANNEL_B, 3, WR3_RX_ENABLE);
        scc.sdlc_send(CHANNEL_B, &[0xaa; 4]);
        scc.sdlc_send(CHANNEL_B, &[0xbb; 4]);
        let mut seen = Vec::new();
        for _ in 0..16 {
            drain_events(&sched, &mut scc);
            while scc.channels[CHANNEL_B].rr0() & RR0_RX_AVAILABLE != 0 {
                seen.push(scc.read_data(CHANNEL_B));
            }
        }
        assert_eq!(seen, vec![0xaa, 0xaa, 0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb]);
    }

    #[test]
    fn dcd_transition_raises_external_interrupt() {
        let (_sched, mut scc) = fixture();
        write_reg(&mut scc, CHANNEL_A, 9, WR9_MIE);
        write_reg(&mut scc, CHANNEL_A, 15, WR15_DCD_IE);
        scc.set_dcd(CHANNEL_A, true);
        assert_eq!(scc.irq.pending_level(), 2);
        assert!(scc.rr3() & 0x08 != 0);
        // WR0 command 2 resets external/status interrupts.
        scc.write_control(CHANNEL_A, 0x10);
        assert_eq!(scc.irq.pending_level(), 0);
    }
}
