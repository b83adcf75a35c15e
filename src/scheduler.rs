// Emulated time is counted in CPU clock cycles and advances in sprints:
// bounded runs of the interpreter between event drains. The cycle counter
// is only ever updated at sprint boundaries; mid-sprint readers see a
// value derived from the shared burndown counter the CPU decrements.

use log::debug;
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// Sprint burndown counter, shared between the scheduler and the CPU the
/// same way the processor shares its register cells.
pub type CounterPtr = Rc<Cell<u64>>;

/// Hard sanity bound on the event queue; devices schedule a handful of
/// events each, so thousands means a reschedule loop has run away.
const QUEUE_SANITY: usize = 10_000;

/// Instructions granted per host iteration when nothing throttles us.
const UNBOUNDED_SPRINT_INSTRUCTIONS: u64 = 500_000;

/// Smoothing factor for the host-time averages in live mode.
const SMOOTH: f64 = 0.05;

/// How far (in ms) emulated time may run ahead of the host before live
/// mode skips CPU execution for an iteration.
const MAX_AHEAD_MS: f64 = 2.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimingMode {
    Unbounded,
    HardwareAccurate,
    WallClockLive,
}

impl TimingMode {
    pub fn to_tag(self) -> u8 {
        match self {
            TimingMode::Unbounded => 0,
            TimingMode::HardwareAccurate => 1,
            TimingMode::WallClockLive => 2,
        }
    }
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TimingMode::Unbounded),
            1 => Some(TimingMode::HardwareAccurate),
            2 => Some(TimingMode::WallClockLive),
            _ => None,
        }
    }
}

/// Every schedulable callback in the machine. The tag is the serialized
/// identity of the callback, so checkpointed queues survive reload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Vbl,
    RtcSecond,
    ViaTimer1,
    ViaTimer2,
    ViaShift,
    KeyboardReply,
    MouseStep,
    SccRxByte,
    IwmSettle,
    IwmMotor,
}

impl EventKind {
    pub fn to_tag(self) -> u16 {
        match self {
            EventKind::Vbl => 0,
            EventKind::RtcSecond => 1,
            EventKind::ViaTimer1 => 2,
            EventKind::ViaTimer2 => 3,
            EventKind::ViaShift => 4,
            EventKind::KeyboardReply => 5,
            EventKind::MouseStep => 6,
            EventKind::SccRxByte => 7,
            EventKind::IwmSettle => 8,
            EventKind::IwmMotor => 9,
        }
    }
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(EventKind::Vbl),
            1 => Some(EventKind::RtcSecond),
            2 => Some(EventKind::ViaTimer1),
            3 => Some(EventKind::ViaTimer2),
            4 => Some(EventKind::ViaShift),
            5 => Some(EventKind::KeyboardReply),
            6 => Some(EventKind::MouseStep),
            7 => Some(EventKind::SccRxByte),
            8 => Some(EventKind::IwmSettle),
            9 => Some(EventKind::IwmMotor),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    pub timestamp: u64,
    pub kind: EventKind,
    pub data: u64,
    seq: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.seq).cmp(&(other.timestamp, other.seq))
    }
}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Scheduler {
    mode: TimingMode,
    pub running: bool,
    clock_hz: u64,
    cycles: u64,
    sprint_total: u64,
    burndown: CounterPtr,
    instructions: u64,
    queue: BinaryHeap<Reverse<Event>>,
    seq: u64,
    // Wall-clock smoothing for live mode.
    host_ms_per_vbl: f64,
    host_ms_per_iteration: f64,
    vbl_error_ms: f64,
    last_host_ms: Option<f64>,
    last_vbl_host_ms: Option<f64>,
}

impl Scheduler {
    pub fn new(clock_hz: u64) -> Self {
        Scheduler {
            mode: TimingMode::Unbounded,
            running: false,
            clock_hz,
            cycles: 0,
            sprint_total: 0,
            burndown: Rc::new(Cell::new(0)),
            instructions: 0,
            queue: BinaryHeap::new(),
            seq: 0,
            host_ms_per_vbl: 1000.0 / 60.147,
            host_ms_per_iteration: 10.0,
            vbl_error_ms: 0.0,
            last_host_ms: None,
            last_vbl_host_ms: None,
        }
    }

    pub fn clock_hz(&self) -> u64 {
        self.clock_hz
    }

    pub fn burndown_handle(&self) -> CounterPtr {
        Rc::clone(&self.burndown)
    }

    /// Cycles per instruction: the uniform cost model the sprint math is
    /// built on. Hardware-accurate timing charges the documented average.
    pub fn cpi(&self) -> u64 {
        match self.mode {
            TimingMode::HardwareAccurate => 12,
            _ => 4,
        }
    }

    pub fn mode(&self) -> TimingMode {
        self.mode
    }

    /// Changing the mode changes CPI from this point on; accumulated
    /// cycles are never rewritten, so the instruction-to-cycle relation
    /// is piecewise linear.
    pub fn set_mode(&mut self, mode: TimingMode) {
        self.mode = mode;
    }

    /// Authoritative emulated time, valid mid-sprint as well as between
    /// sprints.
    pub fn cpu_cycles(&self) -> u64 {
        self.cycles + (self.sprint_total - self.burndown.get()) * self.cpi()
    }

    pub fn instruction_count(&self) -> u64 {
        self.instructions + self.sprint_total - self.burndown.get()
    }

    /// Fold sprint progress into `sprint_total` so "now" is stable. The
    /// cycle counter itself is only advanced at sprint end; zeroing the
    /// burndown also ends the CPU's current sprint at the next boundary.
    fn reconcile_sprint(&mut self) {
        let burned = self.burndown.get();
        debug_assert!(burned <= self.sprint_total, "sprint counter discipline");
        self.sprint_total -= burned;
        self.burndown.set(0);
    }

    pub fn schedule(&mut self, kind: EventKind, data: u64, delta_cycles: u64) {
        self.reconcile_sprint();
        assert!(self.queue.len() < QUEUE_SANITY, "event queue runaway ({:?})", kind);
        let timestamp = self.cpu_cycles() + delta_cycles;
        self.seq += 1;
        self.queue.push(Reverse(Event { timestamp, kind, data, seq: self.seq }));
    }

    /// Drop all pending events of one kind, or just those whose data
    /// matches, when a device clears its pending state.
    pub fn cancel(&mut self, kind: EventKind, data: Option<u64>) {
        let events: Vec<Event> = self.queue.drain().map(|Reverse(e)| e).collect();
        for e in events {
            if e.kind == kind && data.map_or(true, |d| d == e.data) {
                continue;
            }
            self.queue.push(Reverse(e));
        }
    }

    pub fn pending(&self, kind: EventKind, data: Option<u64>) -> bool {
        self.queue.iter().any(|Reverse(e)| e.kind == kind && data.map_or(true, |d| d == e.data))
    }

    /// Plan the next sprint: budget cycles up to the nearest event (or the
    /// iteration allowance), floored to at least one instruction when any
    /// budget remains. Returns the instruction count; zero means "drain
    /// events instead of running the CPU".
    pub fn begin_sprint(&mut self, iteration_cycles: u64) -> u64 {
        debug_assert_eq!(self.sprint_total, 0, "sprint already in progress");
        let cpi = self.cpi();
        let budget = match self.queue.peek() {
            Some(Reverse(head)) => {
                (head.timestamp.saturating_sub(self.cycles)).min(iteration_cycles)
            }
            None => iteration_cycles,
        };
        let mut n = budget / cpi;
        if n == 0 && budget > 0 {
            // Instruction atomicity: events closer than one CPI still let
            // one instruction through.
            n = 1;
        }
        self.sprint_total = n;
        self.burndown.set(n);
        n
    }

    /// Close the sprint: credit executed instructions to the counters.
    /// Unused budget (STOP, early return) is given back.
    pub fn finish_sprint(&mut self) {
        self.reconcile_sprint();
        self.cycles += self.sprint_total * self.cpi();
        self.instructions += self.sprint_total;
        self.sprint_total = 0;
    }

    /// Remove and return the head event if it is due. The head may lag
    /// `cycles` by up to CPI-1 because instructions are atomic.
    pub fn pop_due(&mut self) -> Option<Event> {
        match self.queue.peek() {
            Some(Reverse(head)) if head.timestamp <= self.cycles => {
                self.queue.pop().map(|Reverse(e)| e)
            }
            _ => None,
        }
    }

    pub fn next_event_timestamp(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse(e)| e.timestamp)
    }

    /// Jump emulated time forward to the next event. Used while the CPU
    /// sits in STOP with nothing to burn cycles on.
    pub fn advance_to_next_event(&mut self) {
        debug_assert_eq!(self.sprint_total, 0);
        if let Some(t) = self.next_event_timestamp() {
            if t > self.cycles {
                self.cycles = t;
            }
        }
    }

    /// Per-iteration cycle allowance for the current timing mode, fed by
    /// the host's wall clock.
    pub fn plan_iteration(&mut self, host_ms: f64) -> u64 {
        let dt = match self.last_host_ms {
            Some(prev) => (host_ms - prev).clamp(0.0, 100.0),
            None => self.host_ms_per_iteration,
        };
        self.last_host_ms = Some(host_ms);
        self.host_ms_per_iteration += (dt - self.host_ms_per_iteration) * SMOOTH;
        match self.mode {
            TimingMode::Unbounded => UNBOUNDED_SPRINT_INSTRUCTIONS * self.cpi(),
            TimingMode::HardwareAccurate => {
                // Capped at the emulated clock; host time only defers work.
                (dt * self.clock_hz as f64 / 1000.0) as u64
            }
            TimingMode::WallClockLive => {
                if self.vbl_error_ms < -MAX_AHEAD_MS {
                    // Emulation is ahead of the wall clock; let it catch
                    // down by draining events only.
                    0
                } else {
                    (dt * self.clock_hz as f64 / 1000.0) as u64
                }
            }
        }
    }

    /// Called by the VBL handler with the host clock so live mode can
    /// converge emulated VBL cadence onto wall time.
    pub fn note_vbl(&mut self, host_ms: f64, nominal_vbl_ms: f64) {
        if let Some(prev) = self.last_vbl_host_ms {
            let dt = (host_ms - prev).clamp(0.0, 200.0);
            self.host_ms_per_vbl += (dt - self.host_ms_per_vbl) * SMOOTH;
            self.vbl_error_ms += dt - nominal_vbl_ms;
            self.vbl_error_ms = self.vbl_error_ms.clamp(-250.0, 250.0);
        }
        self.last_vbl_host_ms = Some(host_ms);
    }

    /// Proportional-integral correction applied to the next scheduled VBL
    /// in live mode, in cycles. Positive error (host slower) stretches
    /// the cadence, negative shrinks it.
    pub fn vbl_correction_cycles(&self, nominal_cycles: u64) -> u64 {
        if self.mode != TimingMode::WallClockLive {
            return nominal_cycles;
        }
        let proportional = (self.host_ms_per_vbl - 1000.0 / 60.147) * 0.5;
        let integral = self.vbl_error_ms * 0.05;
        let adjust_ms = (proportional + integral).clamp(-8.0, 8.0);
        let adjust = (adjust_ms * self.clock_hz as f64 / 1000.0) as i64;
        (nominal_cycles as i64 + adjust).max(nominal_cycles as i64 / 2) as u64
    }

    // Checkpoint plumbing: counters and the queue as plain data.

    pub fn state(&self) -> (u8, u64, u64) {
        (self.mode.to_tag(), self.cycles, self.instructions)
    }

    pub fn load_state(&mut self, mode_tag: u8, cycles: u64, instructions: u64) {
        if let Some(mode) = TimingMode::from_tag(mode_tag) {
            self.mode = mode;
        }
        self.cycles = cycles;
        self.instructions = instructions;
        self.sprint_total = 0;
        self.burndown.set(0);
    }

    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.queue.iter().map(|Reverse(e)| *e).collect();
        events.sort();
        events
    }

    pub fn load_events(&mut self, events: &[(u16, u64, u64)]) {
        self.queue.clear();
        for &(tag, data, timestamp) in events {
            match EventKind::from_tag(tag) {
                Some(kind) => {
                    self.seq += 1;
                    self.queue.push(Reverse(Event { timestamp, kind, data, seq: self.seq }));
                }
                None => debug!("dropping checkpointed event with unknown tag {}", tag),
            }
        }
    }
}
