// MOS 6522 VIA as wired in the Macintosh Plus: registers on a 0x200
// stride, port A carrying the overlay/sound/SCC/head-select lines, port B
// the RTC serial port and mouse inputs, CA1 the VBL, CB2 the keyboard
// data line. The two timers and the shift register run on the VIA clock,
// one tick per ten CPU cycles.

use crate::checkpoint::{StateReader, StateWriter};
use crate::devices::{Device, IrqLines, PortInput, Shared};
use crate::fields::{OpResult, Size};
use crate::scheduler::{EventKind, Scheduler};
use log::trace;
use std::rc::Rc;

pub const CYCLES_PER_VIA_TICK: u64 = 10;

pub const IFR_CA2: u8 = 0x01;
pub const IFR_CA1: u8 = 0x02;
pub const IFR_SR: u8 = 0x04;
pub const IFR_CB2: u8 = 0x08;
pub const IFR_CB1: u8 = 0x10;
pub const IFR_T2: u8 = 0x20;
pub const IFR_T1: u8 = 0x40;

// Register select, bits A9..A12 on the Plus.
const REG_ORB: u32 = 0;
const REG_ORA: u32 = 1;
const REG_DDRB: u32 = 2;
const REG_DDRA: u32 = 3;
const REG_T1C_L: u32 = 4;
const REG_T1C_H: u32 = 5;
const REG_T1L_L: u32 = 6;
const REG_T1L_H: u32 = 7;
const REG_T2C_L: u32 = 8;
const REG_T2C_H: u32 = 9;
const REG_SR: u32 = 10;
const REG_ACR: u32 = 11;
const REG_PCR: u32 = 12;
const REG_IFR: u32 = 13;
const REG_IER: u32 = 14;
const REG_ORA_NH: u32 = 15;

/// Observer for output port changes, handed the effective pin values and
/// the data direction mask.
pub type PortObserver = Box<dyn FnMut(u8, u8)>;

pub struct Via {
    ora: u8,
    orb: u8,
    ddra: u8,
    ddrb: u8,
    t1_latch: u16,
    t2_latch_lo: u8,
    t1_value: u16,
    t2_value: u16,
    t1_load_time: u64,
    t2_load_time: u64,
    t1_irq_armed: bool,
    t2_irq_armed: bool,
    pb7_state: bool,
    sr: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,
    sched: Shared<Scheduler>,
    irq: Rc<IrqLines>,
    pa_in: Rc<PortInput>,
    pb_in: Rc<PortInput>,
    port_a_observer: Option<PortObserver>,
    port_b_observer: Option<PortObserver>,
    sr_out_observer: Option<Box<dyn FnMut(u8)>>,
}

impl Via {
    pub fn new(sched: Shared<Scheduler>, irq: Rc<IrqLines>, pa_in: Rc<PortInput>, pb_in: Rc<PortInput>) -> Self {
        Via {
            ora: 0,
            orb: 0,
            ddra: 0,
            ddrb: 0,
            t1_latch: 0,
            t2_latch_lo: 0,
            t1_value: 0,
            t2_value: 0,
            t1_load_time: 0,
            t2_load_time: 0,
            t1_irq_armed: false,
            t2_irq_armed: false,
            pb7_state: true,
            sr: 0,
            acr: 0,
            pcr: 0,
            ifr: 0,
            ier: 0,
            sched,
            irq,
            pa_in,
            pb_in,
            port_a_observer: None,
            port_b_observer: None,
            sr_out_observer: None,
        }
    }

    pub fn observe_port_a(&mut self, observer: PortObserver) {
        self.port_a_observer = Some(observer);
    }
    pub fn observe_port_b(&mut self, observer: PortObserver) {
        self.port_b_observer = Some(observer);
    }
    pub fn observe_shift_out(&mut self, observer: Box<dyn FnMut(u8)>) {
        self.sr_out_observer = Some(observer);
    }

    /// Effective pin level of port A: outputs drive, inputs float to the
    /// externally latched level.
    pub fn port_a(&self) -> u8 {
        (self.ora & self.ddra) | (self.pa_in.value() & !self.ddra)
    }
    pub fn port_b(&self) -> u8 {
        let mut value = (self.orb & self.ddrb) | (self.pb_in.value() & !self.ddrb);
        if self.acr & 0x80 != 0 {
            value = (value & 0x7f) | if self.pb7_state { 0x80 } else { 0 };
        }
        value
    }

    fn set_ifr(&mut self, bits: u8) {
        self.ifr |= bits & 0x7f;
        self.update_irq();
    }
    fn clear_ifr(&mut self, bits: u8) {
        self.ifr &= !(bits & 0x7f);
        self.update_irq();
    }
    fn update_irq(&mut self) {
        self.irq.set(1, self.ifr & self.ier & 0x7f != 0);
    }

    pub fn pulse_ca1(&mut self) {
        self.set_ifr(IFR_CA1);
    }
    pub fn pulse_ca2(&mut self) {
        self.set_ifr(IFR_CA2);
    }
    pub fn pulse_cb1(&mut self) {
        self.set_ifr(IFR_CB1);
    }
    pub fn pulse_cb2(&mut self) {
        self.set_ifr(IFR_CB2);
    }

    /// Externally clocked byte into the shift register (keyboard reply).
    pub fn shift_in(&mut self, value: u8) {
        self.sr = value;
        self.set_ifr(IFR_SR);
    }

    /// Timer 1 fired. In free run the latch reloads and PB7 toggles;
    /// one-shot timers keep decrementing but stay quiet until rewritten.
    pub fn timer1_expired(&mut self) {
        if !self.t1_irq_armed {
            return;
        }
        self.set_ifr(IFR_T1);
        if self.acr & 0x40 != 0 {
            if self.acr & 0x80 != 0 {
                self.pb7_state = !self.pb7_state;
            }
            self.t1_value = self.t1_latch;
            self.t1_load_time = self.sched.borrow().cpu_cycles();
            let delta = (self.t1_latch as u64 + 1) * CYCLES_PER_VIA_TICK;
            self.sched.borrow_mut().schedule(EventKind::ViaTimer1, 0, delta);
        } else {
            if self.acr & 0x80 != 0 {
                self.pb7_state = true;
            }
            self.t1_irq_armed = false;
        }
    }

    pub fn timer2_expired(&mut self) {
        if !self.t2_irq_armed {
            return;
        }
        self.set_ifr(IFR_T2);
        self.t2_irq_armed = false;
    }

    /// The shift-out interval elapsed: latch the byte towards the
    /// keyboard and flag the shift register ready.
    pub fn shift_done(&mut self) {
        let value = self.sr;
        self.set_ifr(IFR_SR);
        if let Some(observer) = self.sr_out_observer.as_mut() {
            observer(value);
        }
    }

    fn elapsed_ticks(&self, since: u64) -> u64 {
        (self.sched.borrow().cpu_cycles().saturating_sub(since)) / CYCLES_PER_VIA_TICK
    }

    fn t1_counter(&self) -> u16 {
        let elapsed = self.elapsed_ticks(self.t1_load_time);
        if self.acr & 0x40 != 0 && self.t1_latch != 0 {
            let period = self.t1_latch as u64 + 1;
            (self.t1_value as u64).wrapping_sub(elapsed % period) as u16
        } else {
            (self.t1_value as u64).wrapping_sub(elapsed) as u16
        }
    }

    fn t2_counter(&self) -> u16 {
        (self.t2_value as u64).wrapping_sub(self.elapsed_ticks(self.t2_load_time)) as u16
    }

    fn write_register(&mut self, reg: u32, value: u8) {
        match reg {
            REG_ORB => {
                self.orb = value;
                self.clear_ifr(IFR_CB1 | IFR_CB2);
                let (pins, ddr) = (self.port_b(), self.ddrb);
                if let Some(observer) = self.port_b_observer.as_mut() {
                    observer(pins, ddr);
                }
            }
            REG_ORA | REG_ORA_NH => {
                self.ora = value;
                if reg == REG_ORA {
                    self.clear_ifr(IFR_CA1 | IFR_CA2);
                }
                let (pins, ddr) = (self.port_a(), self.ddra);
                if let Some(observer) = self.port_a_observer.as_mut() {
                    observer(pins, ddr);
                }
            }
            REG_DDRB => {
                self.ddrb = value;
                let (pins, ddr) = (self.port_b(), self.ddrb);
                if let Some(observer) = self.port_b_observer.as_mut() {
                    observer(pins, ddr);
                }
            }
            REG_DDRA => {
                self.ddra = value;
                let (pins, ddr) = (self.port_a(), self.ddra);
                if let Some(observer) = self.port_a_observer.as_mut() {
                    observer(pins, ddr);
                }
            }
            REG_T1C_L | REG_T1L_L => {
                self.t1_latch = (self.t1_latch & 0xff00) | value as u16;
            }
            REG_T1L_H => {
                self.t1_latch = (self.t1_latch & 0x00ff) | ((value as u16) << 8);
                self.clear_ifr(IFR_T1);
            }
            REG_T1C_H => {
                self.t1_latch = (self.t1_latch & 0x00ff) | ((value as u16) << 8);
                self.t1_value = self.t1_latch;
                self.t1_load_time = self.sched.borrow().cpu_cycles();
                self.t1_irq_armed = true;
                self.clear_ifr(IFR_T1);
                if self.acr & 0x80 != 0 {
                    self.pb7_state = false;
                }
                let delta = (self.t1_latch as u64 + 1) * CYCLES_PER_VIA_TICK;
                let mut sched = self.sched.borrow_mut();
                sched.cancel(EventKind::ViaTimer1, None);
                sched.schedule(EventKind::ViaTimer1, 0, delta);
            }
            REG_T2C_L => {
                self.t2_latch_lo = value;
            }
            REG_T2C_H => {
                self.t2_value = ((value as u16) << 8) | self.t2_latch_lo as u16;
                self.t2_load_time = self.sched.borrow().cpu_cycles();
                self.t2_irq_armed = true;
                self.clear_ifr(IFR_T2);
                if self.acr & 0x20 == 0 {
                    let delta = (self.t2_value as u64 + 1) * CYCLES_PER_VIA_TICK;
                    let mut sched = self.sched.borrow_mut();
                    sched.cancel(EventKind::ViaTimer2, None);
                    sched.schedule(EventKind::ViaTimer2, 0, delta);
                } else {
                    // PB6 pulse counting; nothing on the Plus drives it.
                    trace!("T2 pulse-count mode armed");
                }
            }
            REG_SR => {
                self.sr = value;
                self.clear_ifr(IFR_SR);
                if self.acr & 0x10 != 0 {
                    // Shift-out mode: the byte takes eight VIA ticks to
                    // clock out before IFR.SR sets; keyboard code times
                    // this, so it must not collapse to zero.
                    let mut sched = self.sched.borrow_mut();
                    sched.cancel(EventKind::ViaShift, None);
                    sched.schedule(EventKind::ViaShift, 0, 8 * CYCLES_PER_VIA_TICK);
                }
            }
            REG_ACR => {
                self.acr = value;
            }
            REG_PCR => {
                self.pcr = value;
            }
            REG_IFR => {
                self.clear_ifr(value);
            }
            REG_IER => {
                if value & 0x80 != 0 {
                    self.ier |= value & 0x7f;
                } else {
                    self.ier &= !(value & 0x7f);
                }
                self.update_irq();
            }
            _ => unreachable!(),
        }
    }

    fn read_register(&mut self, reg: u32) -> u8 {
        match reg {
            REG_ORB => {
                self.clear_ifr(IFR_CB1 | IFR_CB2);
                self.port_b()
            }
            REG_ORA => {
                self.clear_ifr(IFR_CA1 | IFR_CA2);
                self.port_a()
            }
            REG_ORA_NH => self.port_a(),
            REG_DDRB => self.ddrb,
            REG_DDRA => self.ddra,
            REG_T1C_L => {
                self.clear_ifr(IFR_T1);
                self.t1_counter() as u8
            }
            REG_T1C_H => (self.t1_counter() >> 8) as u8,
            REG_T1L_L => self.t1_latch as u8,
            REG_T1L_H => (self.t1_latch >> 8) as u8,
            REG_T2C_L => {
                self.clear_ifr(IFR_T2);
                self.t2_counter() as u8
            }
            REG_T2C_H => (self.t2_counter() >> 8) as u8,
            REG_SR => {
                self.clear_ifr(IFR_SR);
                self.sr
            }
            REG_ACR => self.acr,
            REG_PCR => self.pcr,
            REG_IFR => {
                let mut value = self.ifr & 0x7f;
                if self.ifr & self.ier & 0x7f != 0 {
                    value |= 0x80;
                }
                value
            }
            REG_IER => self.ier | 0x80,
            _ => unreachable!(),
        }
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(self.ora);
        w.put_u8(self.orb);
        w.put_u8(self.ddra);
        w.put_u8(self.ddrb);
        w.put_u16(self.t1_latch);
        w.put_u8(self.t2_latch_lo);
        w.put_u16(self.t1_value);
        w.put_u16(self.t2_value);
        w.put_u64(self.t1_load_time);
        w.put_u64(self.t2_load_time);
        w.put_u8(self.t1_irq_armed as u8);
        w.put_u8(self.t2_irq_armed as u8);
        w.put_u8(self.pb7_state as u8);
        w.put_u8(self.sr);
        w.put_u8(self.acr);
        w.put_u8(self.pcr);
        w.put_u8(self.ifr);
        w.put_u8(self.ier);
        w.put_u8(self.pa_in.value());
        w.put_u8(self.pb_in.value());
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        self.ora = r.take_u8();
        self.orb = r.take_u8();
        self.ddra = r.take_u8();
        self.ddrb = r.take_u8();
        self.t1_latch = r.take_u16();
        self.t2_latch_lo = r.take_u8();
        self.t1_value = r.take_u16();
        self.t2_value = r.take_u16();
        self.t1_load_time = r.take_u64();
        self.t2_load_time = r.take_u64();
        self.t1_irq_armed = r.take_u8() != 0;
        self.t2_irq_armed = r.take_u8() != 0;
        self.pb7_state = r.take_u8() != 0;
        self.sr = r.take_u8();
        self.acr = r.take_u8();
        self.pcr = r.take_u8();
        self.ifr = r.take_u8();
        self.ier = r.take_u8();
        self.pa_in.load(r.take_u8());
        self.pb_in.load(r.take_u8());
        self.update_irq();
    }
}

impl Device for Via {
    fn read(&mut self, offset: u32, _size: Size) -> OpResult {
        OpResult::Byte(self.read_register((offset >> 9) & 0xf))
    }
    fn write(&mut self, offset: u32, value: OpResult) {
        self.write_register((offset >> 9) & 0xf, value.inner() as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::shared;

    fn fixture() -> (Shared<Scheduler>, Via) {
        let sched = shared(Scheduler::new(7_833_600));
        let irq = IrqLines::new();
        let via = Via::new(sched.clone(), irq, PortInput::new(0xff), PortInput::new(0xff));
        (sched, via)
    }

    fn advance(sched: &Shared<Scheduler>, cycles: u64) {
        let mut s = sched.borrow_mut();
        let target = s.cpu_cycles() + cycles;
        while s.cpu_cycles() < target {
            let remaining = target - s.cpu_cycles();
            let n = s.begin_sprint(remaining);
            s.burndown_handle().set(0);
            s.finish_sprint();
            if n == 0 {
                break;
            }
        }
    }

    #[test]
    fn t1_write_schedules_and_fires() {
        let (sched, mut via) = fixture();
        via.write_register(REG_IER, 0x80 | IFR_T1);
        via.write_register(REG_T1C_L, 100);
        via.write_register(REG_T1C_H, 0);
        assert!(sched.borrow().pending(EventKind::ViaTimer1, None));
        advance(&sched, 101 * CYCLES_PER_VIA_TICK);
        let event = sched.borrow_mut().pop_due().expect("timer due");
        assert_eq!(event.kind, EventKind::ViaTimer1);
        via.timer1_expired();
        assert!(via.read_register(REG_IFR) & IFR_T1 != 0);
        assert!(via.irq.pending_level() == 1);
        // Reading T1C-L acknowledges.
        via.read_register(REG_T1C_L);
        assert_eq!(via.read_register(REG_IFR) & IFR_T1, 0);
        assert_eq!(via.irq.pending_level(), 0);
    }

    #[test]
    fn t1_counter_tracks_elapsed_time() {
        let (sched, mut via) = fixture();
        via.write_register(REG_T1C_L, 0xff);
        via.write_register(REG_T1C_H, 0x00);
        advance(&sched, 50 * CYCLES_PER_VIA_TICK);
        let count = ((via.read_register(REG_T1C_H) as u16) << 8) | via.read_register(REG_T1C_L) as u16;
        assert_eq!(count, 0xff - 50);
    }

    #[test]
    fn ier_set_and_clear_protocol() {
        let (_sched, mut via) = fixture();
        via.write_register(REG_IER, 0x80 | 0x12);
        assert_eq!(via.read_register(REG_IER), 0x80 | 0x12);
        via.write_register(REG_IER, 0x02);
        assert_eq!(via.read_register(REG_IER), 0x80 | 0x10);
    }

    #[test]
    fn ifr_write_clears_flags() {
        let (_sched, mut via) = fixture();
        via.write_register(REG_IER, 0xff);
        via.pulse_ca1();
        via.pulse_ca2();
        assert_eq!(via.read_register(REG_IFR) & 0x7f, IFR_CA1 | IFR_CA2);
        via.write_register(REG_IFR, IFR_CA1);
        assert_eq!(via.read_register(REG_IFR) & 0x7f, IFR_CA2);
    }

    #[test]
    fn shift_write_delays_interrupt() {
        let (sched, mut via) = fixture();
        via.write_register(REG_ACR, 0x1c); // shift out under T2
        via.write_register(REG_SR, 0x55);
        assert_eq!(via.read_register(REG_IFR) & IFR_SR, 0);
        assert!(sched.borrow().pending(EventKind::ViaShift, None));
        advance(&sched, 8 * CYCLES_PER_VIA_TICK);
        sched.borrow_mut().pop_due().expect("shift event");
        via.shift_done();
        assert!(via.read_register(REG_IFR) & IFR_SR != 0);
    }
}
