// Input routing: the M0110 keyboard talks over the VIA shift register
// (command out, reply clocked back in), the mouse feeds quadrature steps
// into the SCC DCD inputs with direction bits on VIA port B.

use crate::checkpoint::{StateReader, StateWriter};
use crate::devices::{PortInput, Shared};
use crate::scc::{Scc, CHANNEL_A, CHANNEL_B};
use crate::scheduler::{EventKind, Scheduler};
use log::trace;
use std::collections::VecDeque;
use std::rc::Rc;

// Keyboard protocol bytes.
const CMD_INQUIRY: u8 = 0x10;
const CMD_INSTANT: u8 = 0x14;
const CMD_MODEL: u8 = 0x16;
const CMD_TEST: u8 = 0x36;
const REPLY_NULL: u8 = 0x7b;
const REPLY_TEST_ACK: u8 = 0x7d;
const REPLY_MODEL: u8 = 0x03;

/// Inquiry waits up to a quarter second for a key before replying null.
const INQUIRY_TIMEOUT_MS: u64 = 250;
const REPLY_DELAY_MS: u64 = 1;

pub struct Keyboard {
    queue: VecDeque<u8>,
    pending: Option<u8>,
    sched: Shared<Scheduler>,
}

impl Keyboard {
    pub fn new(sched: Shared<Scheduler>) -> Self {
        Keyboard { queue: VecDeque::new(), pending: None, sched }
    }

    fn ms_to_cycles(&self, ms: u64) -> u64 {
        self.sched.borrow().clock_hz() / 1000 * ms
    }

    /// A command byte finished shifting out of the VIA.
    pub fn command(&mut self, cmd: u8) {
        trace!("keyboard command {:02x}", cmd);
        self.pending = Some(cmd);
        let delay = if cmd == CMD_INQUIRY && self.queue.is_empty() {
            self.ms_to_cycles(INQUIRY_TIMEOUT_MS)
        } else {
            self.ms_to_cycles(REPLY_DELAY_MS)
        };
        let mut sched = self.sched.borrow_mut();
        sched.cancel(EventKind::KeyboardReply, None);
        sched.schedule(EventKind::KeyboardReply, 0, delay);
    }

    /// Host injected a key transition. Keycodes use the M0110 scan code
    /// space; the wire byte carries the code in bits 6..1.
    pub fn key_event(&mut self, down: bool, keycode: u8) {
        let byte = ((keycode & 0x3f) << 1) | 0x01 | if down { 0x00 } else { 0x80 };
        self.queue.push_back(byte);
        // A waiting inquiry answers as soon as a key shows up.
        if self.pending == Some(CMD_INQUIRY) {
            let delay = self.ms_to_cycles(REPLY_DELAY_MS);
            let mut sched = self.sched.borrow_mut();
            sched.cancel(EventKind::KeyboardReply, None);
            sched.schedule(EventKind::KeyboardReply, 0, delay);
        }
    }

    /// The reply interval elapsed; produce the byte the keyboard clocks
    /// back into the VIA.
    pub fn take_reply(&mut self) -> Option<u8> {
        let cmd = self.pending.take()?;
        Some(match cmd {
            CMD_INQUIRY | CMD_INSTANT => self.queue.pop_front().unwrap_or(REPLY_NULL),
            CMD_MODEL => REPLY_MODEL,
            CMD_TEST => REPLY_TEST_ACK,
            other => {
                trace!("unknown keyboard command {:02x}", other);
                REPLY_NULL
            }
        })
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(self.pending.is_some() as u8);
        w.put_u8(self.pending.unwrap_or(0));
        w.put_u16(self.queue.len() as u16);
        for &b in &self.queue {
            w.put_u8(b);
        }
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        let has_pending = r.take_u8() != 0;
        let cmd = r.take_u8();
        self.pending = if has_pending { Some(cmd) } else { None };
        let n = r.take_u16() as usize;
        self.queue = (0..n).map(|_| r.take_u8()).collect();
    }
}

// VIA port B wiring for the mouse.
const PB_BUTTON: u8 = 3;
const PB_X2: u8 = 4;
const PB_Y2: u8 = 5;

/// Cycles between generated quadrature steps, roughly half a millisecond.
const STEP_INTERVAL_CYCLES: u64 = 4_000;

pub struct Mouse {
    dx: i32,
    dy: i32,
    x_phase: bool,
    y_phase: bool,
    stepping: bool,
    pb_in: Rc<PortInput>,
    scc: Shared<Scc>,
    sched: Shared<Scheduler>,
}

impl Mouse {
    pub fn new(sched: Shared<Scheduler>, scc: Shared<Scc>, pb_in: Rc<PortInput>) -> Self {
        pb_in.set_bit(PB_BUTTON, true); // button released reads high
        Mouse {
            dx: 0,
            dy: 0,
            x_phase: false,
            y_phase: false,
            stepping: false,
            pb_in,
            scc,
            sched,
        }
    }

    pub fn inject(&mut self, button_down: bool, dx: i32, dy: i32) {
        self.pb_in.set_bit(PB_BUTTON, !button_down);
        self.dx += dx;
        self.dy += dy;
        if !self.stepping && (self.dx != 0 || self.dy != 0) {
            self.stepping = true;
            self.sched
                .borrow_mut()
                .schedule(EventKind::MouseStep, 0, STEP_INTERVAL_CYCLES);
        }
    }

    /// Emit one quadrature step per axis: toggle the X1/Y1 line into the
    /// SCC DCD input, with the second phase bit on port B carrying the
    /// direction relative to the edge.
    pub fn step_event(&mut self) {
        self.stepping = false;
        if self.dx != 0 {
            let positive = self.dx > 0;
            self.dx -= if positive { 1 } else { -1 };
            self.x_phase = !self.x_phase;
            self.pb_in.set_bit(PB_X2, self.x_phase ^ !positive);
            self.scc.borrow_mut().set_dcd(CHANNEL_A, self.x_phase);
        }
        if self.dy != 0 {
            let positive = self.dy > 0;
            self.dy -= if positive { 1 } else { -1 };
            self.y_phase = !self.y_phase;
            self.pb_in.set_bit(PB_Y2, self.y_phase ^ !positive);
            self.scc.borrow_mut().set_dcd(CHANNEL_B, self.y_phase);
        }
        if self.dx != 0 || self.dy != 0 {
            self.stepping = true;
            self.sched
                .borrow_mut()
                .schedule(EventKind::MouseStep, 0, STEP_INTERVAL_CYCLES);
        }
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u32(self.dx as u32);
        w.put_u32(self.dy as u32);
        w.put_u8(
            (self.x_phase as u8) | (self.y_phase as u8) << 1 | (self.stepping as u8) << 2,
        );
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        self.dx = r.take_u32() as i32;
        self.dy = r.take_u32() as i32;
        let flags = r.take_u8();
        self.x_phase = flags & 1 != 0;
        self.y_phase = flags & 2 != 0;
        self.stepping = flags & 4 != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{shared, IrqLines};

    fn advance_past(sched: &Shared<Scheduler>) {
        let mut s = sched.borrow_mut();
        let n = s.begin_sprint(u64::MAX / 2);
        if n > 0 {
            s.burndown_handle().set(0);
        }
        s.finish_sprint();
    }

    #[test]
    fn inquiry_with_queued_key_replies_quickly() {
        let sched = shared(Scheduler::new(7_833_600));
        let mut kb = Keyboard::new(sched.clone());
        kb.key_event(true, 0x00);
        kb.command(CMD_INQUIRY);
        advance_past(&sched);
        let e = sched.borrow_mut().pop_due().expect("reply event");
        assert_eq!(e.kind, EventKind::KeyboardReply);
        assert_eq!(kb.take_reply(), Some(0x01));
    }

    #[test]
    fn empty_inquiry_times_out_with_null() {
        let sched = shared(Scheduler::new(7_833_600));
        let mut kb = Keyboard::new(sched.clone());
        kb.command(CMD_INQUIRY);
        let due = sched.borrow().next_event_timestamp().unwrap();
        assert!(due >= 1_900_000); // about a quarter second of cycles
        advance_past(&sched);
        sched.borrow_mut().pop_due().unwrap();
        assert_eq!(kb.take_reply(), Some(REPLY_NULL));
    }

    #[test]
    fn key_up_sets_high_bit() {
        let sched = shared(Scheduler::new(7_833_600));
        let mut kb = Keyboard::new(sched.clone());
        kb.key_event(false, 0x32);
        kb.command(CMD_INSTANT);
        assert_eq!(kb.take_reply(), Some(0x80 | (0x32 << 1) | 1));
    }

    #[test]
    fn mouse_steps_toggle_dcd_and_direction_bits() {
        let sched = shared(Scheduler::new(7_833_600));
        let scc = shared(Scc::new(sched.clone(), IrqLines::new()));
        let pb = PortInput::new(0xff);
        let mut mouse = Mouse::new(sched.clone(), scc.clone(), pb.clone());
        mouse.inject(true, 2, -1);
        assert!(!pb.bit(PB_BUTTON));
        let mut steps = 0;
        loop {
            advance_past(&sched);
            let event = sched.borrow_mut().pop_due();
            match event {
                Some(e) if e.kind == EventKind::MouseStep => {
                    mouse.step_event();
                    steps += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(steps, 2);
        assert_eq!(mouse.dx, 0);
        assert_eq!(mouse.dy, 0);
    }
}
