// NCR 5380 and the disk targets behind it. The controller is a register
// window onto the SCSI bus state machine; targets are polled through the
// REQ/ACK handshake one byte per access, with the Plus's pseudo-DMA
// addresses advancing the handshake synchronously. Command dispatch
// covers the mandatory direct-access set; everything else gets CHECK
// CONDITION with ILLEGAL REQUEST sense.

use crate::checkpoint::{StateReader, StateWriter};
use crate::devices::Device;
use crate::fields::{OpResult, Size};
use crate::storage::{BlockStore, BLOCK_SIZE};
use log::{debug, trace, warn};

pub const TARGET_COUNT: usize = 8;
pub const INITIATOR_ID: u8 = 7;

// Register numbers, decoded from address bits 4..6.
const REG_DATA: u32 = 0;
const REG_ICR: u32 = 1;
const REG_MODE: u32 = 2;
const REG_TCR: u32 = 3;
const REG_BUS_STATUS: u32 = 4; // read; write is select-enable
const REG_BSR: u32 = 5; // read; write starts DMA send
const REG_INPUT_DATA: u32 = 6;
const REG_RESET_IRQ: u32 = 7;

// Initiator command register bits.
const ICR_ASSERT_DATA: u8 = 0x01;
const ICR_ASSERT_ATN: u8 = 0x02;
const ICR_ASSERT_SEL: u8 = 0x04;
const ICR_ASSERT_BSY: u8 = 0x08;
const ICR_ASSERT_ACK: u8 = 0x10;
const ICR_AIP: u8 = 0x40;
const ICR_ASSERT_RST: u8 = 0x80;

// Mode register bits.
const MODE_ARBITRATE: u8 = 0x01;
const MODE_DMA: u8 = 0x02;

// Current-bus-status bits.
const CBSR_SEL: u8 = 0x02;
const CBSR_IO: u8 = 0x04;
const CBSR_CD: u8 = 0x08;
const CBSR_MSG: u8 = 0x10;
const CBSR_REQ: u8 = 0x20;
const CBSR_BSY: u8 = 0x40;

// Bus-and-status bits.
const BSR_ACK: u8 = 0x01;
const BSR_ATN: u8 = 0x02;
const BSR_PHASE_MATCH: u8 = 0x08;
const BSR_IRQ: u8 = 0x10;
const BSR_DRQ: u8 = 0x40;
const BSR_END_OF_DMA: u8 = 0x80;

// Sense keys.
pub const SK_NO_SENSE: u8 = 0x0;
pub const SK_NOT_READY: u8 = 0x2;
pub const SK_MEDIUM_ERROR: u8 = 0x3;
pub const SK_ILLEGAL_REQUEST: u8 = 0x5;
pub const SK_UNIT_ATTENTION: u8 = 0x6;
pub const SK_DATA_PROTECT: u8 = 0x7;

// ASC/ASCQ pairs.
pub const ASC_LBA_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
pub const ASC_INVALID_FIELD: (u8, u8) = (0x24, 0x00);
pub const ASC_INVALID_OPCODE: (u8, u8) = (0x20, 0x00);
pub const ASC_WRITE_PROTECTED: (u8, u8) = (0x27, 0x00);
pub const ASC_RESET_OCCURRED: (u8, u8) = (0x29, 0x00);
pub const ASC_MEDIUM_NOT_PRESENT: (u8, u8) = (0x3a, 0x00);
pub const ASC_LUN_NOT_SUPPORTED: (u8, u8) = (0x25, 0x00);

const STATUS_GOOD: u8 = 0x00;
const STATUS_CHECK_CONDITION: u8 = 0x02;
const MSG_COMMAND_COMPLETE: u8 = 0x00;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    BusFree,
    Arbitration,
    Selection,
    Command,
    DataIn,
    DataOut,
    Status,
    MessageIn,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::BusFree => 0,
            Phase::Arbitration => 1,
            Phase::Selection => 2,
            Phase::Command => 3,
            Phase::DataIn => 4,
            Phase::DataOut => 5,
            Phase::Status => 6,
            Phase::MessageIn => 7,
        }
    }
    fn from_tag(tag: u8) -> Phase {
        match tag {
            1 => Phase::Arbitration,
            2 => Phase::Selection,
            3 => Phase::Command,
            4 => Phase::DataIn,
            5 => Phase::DataOut,
            6 => Phase::Status,
            7 => Phase::MessageIn,
            _ => Phase::BusFree,
        }
    }
    /// MSG/CD/IO lines the target drives in this phase.
    fn lines(self) -> u8 {
        match self {
            Phase::Command => CBSR_CD,
            Phase::DataIn => CBSR_IO,
            Phase::DataOut => 0,
            Phase::Status => CBSR_CD | CBSR_IO,
            Phase::MessageIn => CBSR_MSG | CBSR_CD | CBSR_IO,
            _ => 0,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    fn none() -> Self {
        SenseData { key: SK_NO_SENSE, asc: 0, ascq: 0 }
    }
}

pub struct ScsiTarget {
    store: Option<BlockStore>,
    block_count: u64,
    write_protect: bool,
    sense: SenseData,
    unit_attention: bool,
    prevent_removal: bool,
    started: bool,
}

impl ScsiTarget {
    pub fn new(store: BlockStore, write_protect: bool) -> Self {
        let block_count = store.block_count();
        ScsiTarget {
            store: Some(store),
            block_count,
            write_protect,
            sense: SenseData::none(),
            // Power-on: reset unit attention until the first command.
            unit_attention: true,
            prevent_removal: false,
            started: true,
        }
    }

    pub fn store_mut(&mut self) -> Option<&mut BlockStore> {
        self.store.as_mut()
    }

    fn stage_sense(&mut self, key: u8, (asc, ascq): (u8, u8)) {
        self.sense = SenseData { key, asc, ascq };
    }
}

/// What the current command resolved to, before data transfer.
enum Outcome {
    Good,
    Check,
    DataIn(Vec<u8>),
    DataOut { expected: usize, write_lba: Option<u64> },
}

pub struct ScsiBus {
    targets: [Option<ScsiTarget>; TARGET_COUNT],
    phase: Phase,
    selected: Option<usize>,
    odr: u8,
    icr: u8,
    mode: u8,
    tcr: u8,
    select_enable: u8,
    cdb: Vec<u8>,
    data_in: Vec<u8>,
    data_in_pos: usize,
    data_out: Vec<u8>,
    data_out_expected: usize,
    pending_write_lba: Option<u64>,
    status_byte: u8,
    message_byte: u8,
    irq_flag: bool,
    last_ack: bool,
}

impl ScsiBus {
    pub fn new() -> Self {
        ScsiBus {
            targets: [None, None, None, None, None, None, None, None],
            phase: Phase::BusFree,
            selected: None,
            odr: 0,
            icr: 0,
            mode: 0,
            tcr: 0,
            select_enable: 0,
            cdb: Vec::new(),
            data_in: Vec::new(),
            data_in_pos: 0,
            data_out: Vec::new(),
            data_out_expected: 0,
            pending_write_lba: None,
            status_byte: 0,
            message_byte: 0,
            irq_flag: false,
            last_ack: false,
        }
    }

    pub fn attach(&mut self, id: usize, target: ScsiTarget) {
        debug_assert!(id < TARGET_COUNT && id != INITIATOR_ID as usize);
        self.targets[id] = Some(target);
    }

    pub fn target_mut(&mut self, id: usize) -> Option<&mut ScsiTarget> {
        self.targets[id].as_mut()
    }

    /// Per-VBL background consolidation across every attached store.
    pub fn tick_storage(&mut self, max_merges: usize) {
        for target in self.targets.iter_mut().flatten() {
            if let Some(store) = target.store.as_mut() {
                if let Err(e) = store.tick(max_merges) {
                    warn!("storage consolidation failed: {}", e);
                }
            }
        }
    }

    fn bus_free(&mut self) {
        self.phase = Phase::BusFree;
        self.selected = None;
        self.cdb.clear();
        self.data_in.clear();
        self.data_in_pos = 0;
        self.data_out.clear();
        self.data_out_expected = 0;
        self.pending_write_lba = None;
    }

    /// REQ is up whenever the target is waiting on the initiator and the
    /// initiator has not acknowledged yet.
    fn req_asserted(&self) -> bool {
        matches!(
            self.phase,
            Phase::Command | Phase::DataIn | Phase::DataOut | Phase::Status | Phase::MessageIn
        ) && !self.last_ack
    }

    fn current_data(&self) -> u8 {
        match self.phase {
            Phase::DataIn => self.data_in.get(self.data_in_pos).copied().unwrap_or(0),
            Phase::Status => self.status_byte,
            Phase::MessageIn => self.message_byte,
            _ => self.odr,
        }
    }

    /// One REQ/ACK handshake completed in the current phase.
    fn advance_handshake(&mut self) {
        match self.phase {
            Phase::Command => {
                self.cdb.push(self.odr);
                let needed = cdb_length(self.cdb[0]);
                if self.cdb.len() >= needed {
                    self.execute_command();
                }
            }
            Phase::DataIn => {
                self.data_in_pos += 1;
                if self.data_in_pos >= self.data_in.len() {
                    self.enter_status(STATUS_GOOD);
                }
            }
            Phase::DataOut => {
                self.data_out.push(self.odr);
                if self.data_out.len() >= self.data_out_expected {
                    self.finish_data_out();
                }
            }
            Phase::Status => {
                self.phase = Phase::MessageIn;
                self.message_byte = MSG_COMMAND_COMPLETE;
            }
            Phase::MessageIn => {
                self.irq_flag = true;
                self.bus_free();
            }
            _ => {}
        }
    }

    fn enter_status(&mut self, status: u8) {
        self.status_byte = status;
        self.phase = Phase::Status;
    }

    fn execute_command(&mut self) {
        let target_id = match self.selected {
            Some(id) => id,
            None => {
                self.bus_free();
                return;
            }
        };
        let cdb = std::mem::take(&mut self.cdb);
        let outcome = match self.targets[target_id].as_mut() {
            Some(target) => dispatch_cdb(target, &cdb),
            None => {
                self.bus_free();
                return;
            }
        };
        trace!("SCSI target {} opcode {:02x} -> phase change", target_id, cdb.first().unwrap_or(&0));
        match outcome {
            Outcome::Good => self.enter_status(STATUS_GOOD),
            Outcome::Check => self.enter_status(STATUS_CHECK_CONDITION),
            Outcome::DataIn(data) => {
                if data.is_empty() {
                    self.enter_status(STATUS_GOOD);
                } else {
                    self.data_in = data;
                    self.data_in_pos = 0;
                    self.phase = Phase::DataIn;
                }
            }
            Outcome::DataOut { expected, write_lba } => {
                if expected == 0 {
                    self.enter_status(STATUS_GOOD);
                } else {
                    self.data_out.clear();
                    self.data_out_expected = expected;
                    self.pending_write_lba = write_lba;
                    self.phase = Phase::DataOut;
                }
            }
        }
    }

    fn finish_data_out(&mut self) {
        let target_id = self.selected.unwrap_or(0);
        let mut status = STATUS_GOOD;
        if let (Some(lba), Some(target)) = (self.pending_write_lba, self.targets[target_id].as_mut()) {
            if let Some(store) = target.store.as_mut() {
                for (i, chunk) in self.data_out.chunks(BLOCK_SIZE).enumerate() {
                    let mut block = [0u8; BLOCK_SIZE];
                    block[..chunk.len()].copy_from_slice(chunk);
                    if let Err(e) = store.write_block(lba + i as u64, &block) {
                        warn!("SCSI write at lba {} failed: {}", lba + i as u64, e);
                        target.stage_sense(SK_MEDIUM_ERROR, (0x0c, 0x00));
                        status = STATUS_CHECK_CONDITION;
                        break;
                    }
                }
            }
        }
        self.pending_write_lba = None;
        self.data_out.clear();
        self.data_out_expected = 0;
        self.enter_status(status);
    }

    fn write_icr(&mut self, value: u8) {
        let old_ack = self.icr & ICR_ASSERT_ACK != 0;
        let new_ack = value & ICR_ASSERT_ACK != 0;
        if value & ICR_ASSERT_RST != 0 {
            debug!("SCSI bus reset");
            self.reset_bus();
            self.icr = value;
            return;
        }
        // Selection: SEL asserted with the target ID on the data bus.
        if value & ICR_ASSERT_SEL != 0 && value & ICR_ASSERT_DATA != 0 && self.phase != Phase::Selection {
            let bits = self.odr & !(1 << INITIATOR_ID);
            if let Some(id) = (0..TARGET_COUNT).find(|&id| bits & (1 << id) != 0) {
                if self.targets[id].is_some() {
                    self.selected = Some(id);
                    self.phase = Phase::Selection;
                    trace!("SCSI selection of target {}", id);
                }
            }
        } else if value & ICR_ASSERT_SEL == 0 && self.phase == Phase::Selection {
            // SEL released: the target takes the bus and asks for a command.
            self.phase = Phase::Command;
            self.cdb.clear();
            self.last_ack = false;
        }
        if new_ack && !old_ack && self.req_asserted() {
            self.last_ack = true;
        } else if !new_ack && old_ack && self.last_ack {
            self.last_ack = false;
            self.advance_handshake();
        }
        self.icr = value;
    }

    fn reset_bus(&mut self) {
        self.bus_free();
        self.irq_flag = true;
        for target in self.targets.iter_mut().flatten() {
            target.unit_attention = true;
            target.stage_sense(SK_UNIT_ATTENTION, ASC_RESET_OCCURRED);
        }
    }

    fn read_register(&mut self, reg: u32, dack: bool) -> u8 {
        if dack {
            // Pseudo-DMA: the access itself completes the handshake.
            let byte = self.current_data();
            if self.phase == Phase::DataIn {
                self.advance_handshake_pdma();
            }
            return byte;
        }
        match reg {
            REG_DATA => self.current_data(),
            REG_ICR => {
                let mut value = self.icr & 0x9f;
                if self.mode & MODE_ARBITRATE != 0 {
                    value |= ICR_AIP;
                }
                value
            }
            REG_MODE => self.mode,
            REG_TCR => self.tcr,
            REG_BUS_STATUS => {
                let mut value = 0;
                if self.icr & ICR_ASSERT_SEL != 0 {
                    value |= CBSR_SEL;
                }
                if self.phase != Phase::BusFree && self.phase != Phase::Arbitration {
                    value |= CBSR_BSY;
                }
                if self.req_asserted() {
                    value |= CBSR_REQ;
                }
                value |= self.phase.lines();
                value
            }
            REG_BSR => {
                let mut value = 0;
                if self.icr & ICR_ASSERT_ACK != 0 {
                    value |= BSR_ACK;
                }
                if self.icr & ICR_ASSERT_ATN != 0 {
                    value |= BSR_ATN;
                }
                // Phase match: target phase lines equal the TCR's.
                if self.phase.lines() == (self.tcr & 0x07) << 2 {
                    value |= BSR_PHASE_MATCH;
                }
                if self.irq_flag {
                    value |= BSR_IRQ;
                }
                if self.mode & MODE_DMA != 0 && self.req_asserted() {
                    value |= BSR_DRQ;
                }
                if self.mode & MODE_DMA != 0 && self.phase == Phase::Status {
                    value |= BSR_END_OF_DMA;
                }
                value
            }
            REG_INPUT_DATA => self.current_data(),
            REG_RESET_IRQ => {
                self.irq_flag = false;
                0
            }
            _ => 0,
        }
    }

    /// Pseudo-DMA variant of the handshake: no explicit ACK edge, the
    /// wait-state generator has already stalled the CPU for us.
    fn advance_handshake_pdma(&mut self) {
        self.last_ack = false;
        self.advance_handshake();
    }

    fn write_register(&mut self, reg: u32, value: u8, dack: bool) {
        if dack {
            self.odr = value;
            if self.phase == Phase::DataOut || self.phase == Phase::Command {
                self.advance_handshake_pdma();
            }
            return;
        }
        match reg {
            REG_DATA => self.odr = value,
            REG_ICR => self.write_icr(value),
            REG_MODE => {
                let was = self.mode;
                self.mode = value;
                if value & MODE_ARBITRATE != 0 && was & MODE_ARBITRATE == 0 {
                    self.phase = Phase::Arbitration;
                }
                if value & MODE_ARBITRATE == 0 && self.phase == Phase::Arbitration {
                    self.phase = Phase::BusFree;
                }
            }
            REG_TCR => self.tcr = value & 0x0f,
            REG_BUS_STATUS => self.select_enable = value,
            REG_BSR | REG_INPUT_DATA | REG_RESET_IRQ => {
                // DMA start strobes; transfers advance per data access.
                trace!("SCSI DMA start via register {}", reg);
            }
            _ => {}
        }
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(self.phase.tag());
        w.put_u8(self.selected.map_or(0xff, |s| s as u8));
        w.put_u8(self.odr);
        w.put_u8(self.icr);
        w.put_u8(self.mode);
        w.put_u8(self.tcr);
        w.put_u8(self.select_enable);
        w.put_u8(self.status_byte);
        w.put_u8(self.message_byte);
        w.put_u8((self.irq_flag as u8) | (self.last_ack as u8) << 1);
        w.put_u16(self.cdb.len() as u16);
        w.put_bytes(&self.cdb);
        w.put_u32(self.data_in.len() as u32);
        w.put_bytes(&self.data_in);
        w.put_u32(self.data_in_pos as u32);
        w.put_u32(self.data_out.len() as u32);
        w.put_bytes(&self.data_out);
        w.put_u32(self.data_out_expected as u32);
        w.put_u8(self.pending_write_lba.is_some() as u8);
        w.put_u64(self.pending_write_lba.unwrap_or(0));
        for target in &self.targets {
            match target {
                Some(t) => {
                    w.put_u8(1);
                    w.put_u64(t.block_count);
                    w.put_u8(t.write_protect as u8);
                    w.put_u8(t.sense.key);
                    w.put_u8(t.sense.asc);
                    w.put_u8(t.sense.ascq);
                    w.put_u8(
                        (t.unit_attention as u8) | (t.prevent_removal as u8) << 1 | (t.started as u8) << 2,
                    );
                }
                None => w.put_u8(0),
            }
        }
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        self.phase = Phase::from_tag(r.take_u8());
        let sel = r.take_u8();
        self.selected = if sel == 0xff { None } else { Some(sel as usize) };
        self.odr = r.take_u8();
        self.icr = r.take_u8();
        self.mode = r.take_u8();
        self.tcr = r.take_u8();
        self.select_enable = r.take_u8();
        self.status_byte = r.take_u8();
        self.message_byte = r.take_u8();
        let flags = r.take_u8();
        self.irq_flag = flags & 1 != 0;
        self.last_ack = flags & 2 != 0;
        let n = r.take_u16() as usize;
        self.cdb = r.take_vec(n);
        let n = r.take_u32() as usize;
        self.data_in = r.take_vec(n);
        self.data_in_pos = r.take_u32() as usize;
        let n = r.take_u32() as usize;
        self.data_out = r.take_vec(n);
        self.data_out_expected = r.take_u32() as usize;
        let has_lba = r.take_u8() != 0;
        let lba = r.take_u64();
        self.pending_write_lba = if has_lba { Some(lba) } else { None };
        for target in self.targets.iter_mut() {
            if r.take_u8() == 0 {
                continue;
            }
            let block_count = r.take_u64();
            let write_protect = r.take_u8() != 0;
            let sense = SenseData { key: r.take_u8(), asc: r.take_u8(), ascq: r.take_u8() };
            let flags = r.take_u8();
            if let Some(t) = target.as_mut() {
                t.block_count = block_count;
                t.write_protect = write_protect;
                t.sense = sense;
                t.unit_attention = flags & 1 != 0;
                t.prevent_removal = flags & 2 != 0;
                t.started = flags & 4 != 0;
            }
        }
    }
}

fn cdb_length(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        5 => 12,
        _ => 6,
    }
}

fn be32(b: &[u8]) -> u64 {
    ((b[0] as u64) << 24) | ((b[1] as u64) << 16) | ((b[2] as u64) << 8) | b[3] as u64
}

fn dispatch_cdb(target: &mut ScsiTarget, cdb: &[u8]) -> Outcome {
    let opcode = cdb[0];
    let lun = (cdb.get(1).copied().unwrap_or(0) >> 5) as usize;
    if lun != 0 && opcode != 0x03 && opcode != 0x12 {
        target.stage_sense(SK_ILLEGAL_REQUEST, ASC_LUN_NOT_SUPPORTED);
        return Outcome::Check;
    }
    // A pending unit attention preempts everything but INQUIRY and
    // REQUEST SENSE.
    if target.unit_attention && opcode != 0x03 && opcode != 0x12 {
        target.unit_attention = false;
        target.stage_sense(SK_UNIT_ATTENTION, ASC_RESET_OCCURRED);
        return Outcome::Check;
    }
    match opcode {
        // TEST UNIT READY
        0x00 => {
            if target.store.is_some() {
                target.sense = SenseData::none();
                Outcome::Good
            } else {
                target.stage_sense(SK_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
                Outcome::Check
            }
        }
        // REQUEST SENSE
        0x03 => {
            let allocation = cdb[4] as usize;
            let mut data = vec![0u8; 18];
            data[0] = 0x70;
            data[2] = target.sense.key;
            data[7] = 10;
            data[12] = target.sense.asc;
            data[13] = target.sense.ascq;
            target.sense = SenseData::none();
            data.truncate(allocation.max(4).min(18));
            Outcome::DataIn(data)
        }
        // INQUIRY
        0x12 => {
            let allocation = cdb[4] as usize;
            let mut data = vec![0u8; 36];
            data[0] = if lun == 0 { 0x00 } else { 0x7f };
            data[1] = 0x00;
            data[2] = 0x02;
            data[3] = 0x02;
            data[4] = 31;
            data[8..16].copy_from_slice(b"EMPLUS  ");
            data[16..32].copy_from_slice(b"BLOCK STORE     ");
            data[32..36].copy_from_slice(b"1.0 ");
            data.truncate(allocation.min(36));
            Outcome::DataIn(data)
        }
        // READ(6) / READ(10)
        0x08 | 0x28 => {
            let (lba, count) = if opcode == 0x08 {
                let lba = (((cdb[1] & 0x1f) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
                let count = if cdb[4] == 0 { 256 } else { cdb[4] as u64 };
                (lba, count)
            } else {
                (be32(&cdb[2..6]), ((cdb[7] as u64) << 8) | cdb[8] as u64)
            };
            read_blocks(target, lba, count)
        }
        // WRITE(6) / WRITE(10)
        0x0a | 0x2a => {
            let (lba, count) = if opcode == 0x0a {
                let lba = (((cdb[1] & 0x1f) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
                let count = if cdb[4] == 0 { 256 } else { cdb[4] as u64 };
                (lba, count)
            } else {
                (be32(&cdb[2..6]), ((cdb[7] as u64) << 8) | cdb[8] as u64)
            };
            if target.write_protect {
                target.stage_sense(SK_DATA_PROTECT, ASC_WRITE_PROTECTED);
                return Outcome::Check;
            }
            if lba + count > target.block_count {
                target.stage_sense(SK_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
                return Outcome::Check;
            }
            Outcome::DataOut { expected: (count as usize) * BLOCK_SIZE, write_lba: Some(lba) }
        }
        // READ CAPACITY(10)
        0x25 => {
            let last = target.block_count.saturating_sub(1);
            let mut data = vec![0u8; 8];
            data[0..4].copy_from_slice(&(last as u32).to_be_bytes());
            data[4..8].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
            Outcome::DataIn(data)
        }
        // MODE SENSE(6)
        0x1a => {
            let allocation = cdb[4] as usize;
            let mut data = vec![0u8; 12];
            data[0] = 11;
            data[2] = if target.write_protect { 0x80 } else { 0x00 };
            data[3] = 8;
            let blocks = target.block_count.min(0xff_ffff);
            data[5..8].copy_from_slice(&[(blocks >> 16) as u8, (blocks >> 8) as u8, blocks as u8]);
            data[9..12].copy_from_slice(&[0, (BLOCK_SIZE >> 8) as u8, BLOCK_SIZE as u8]);
            data.truncate(allocation.min(12));
            Outcome::DataIn(data)
        }
        // MODE SELECT(6): accept and forget; pages are in-memory only.
        0x15 => Outcome::DataOut { expected: cdb[4] as usize, write_lba: None },
        // START STOP UNIT
        0x1b => {
            target.started = cdb[4] & 1 != 0;
            Outcome::Good
        }
        // PREVENT/ALLOW MEDIUM REMOVAL
        0x1e => {
            target.prevent_removal = cdb[4] & 1 != 0;
            Outcome::Good
        }
        // FORMAT UNIT, VERIFY(10), RESERVE, RELEASE: accepted no-ops.
        0x04 | 0x2f | 0x16 | 0x17 => Outcome::Good,
        _ => {
            debug!("unsupported SCSI opcode {:02x}", opcode);
            target.stage_sense(SK_ILLEGAL_REQUEST, ASC_INVALID_OPCODE);
            Outcome::Check
        }
    }
}

fn read_blocks(target: &mut ScsiTarget, lba: u64, count: u64) -> Outcome {
    if lba + count > target.block_count {
        target.stage_sense(SK_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
        return Outcome::Check;
    }
    let store = match target.store.as_ref() {
        Some(store) => store,
        None => {
            target.stage_sense(SK_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
            return Outcome::Check;
        }
    };
    let mut data = Vec::with_capacity((count as usize) * BLOCK_SIZE);
    for i in 0..count {
        match store.read_block(lba + i) {
            Ok(block) => data.extend_from_slice(&block),
            Err(e) => {
                warn!("SCSI read at lba {} failed: {}", lba + i, e);
                target.stage_sense(SK_MEDIUM_ERROR, (0x11, 0x00));
                return Outcome::Check;
            }
        }
    }
    Outcome::DataIn(data)
}

impl Device for ScsiBus {
    /// Address bits 4..6 select the register, bit 9 the pseudo-DMA
    /// window. Reads decode even addresses, writes odd ones.
    fn read(&mut self, offset: u32, _size: Size) -> OpResult {
        let reg = (offset >> 4) & 7;
        let dack = offset & 0x200 != 0;
        OpResult::Byte(self.read_register(reg, dack))
    }
    fn write(&mut self, offset: u32, value: OpResult) {
        let reg = (offset >> 4) & 7;
        let dack = offset & 0x200 != 0;
        self.write_register(reg, value.inner() as u8, dack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_disk(blocks: u64) -> (ScsiBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), blocks).unwrap();
        let mut bus = ScsiBus::new();
        bus.attach(0, ScsiTarget::new(store, false));
        (bus, dir)
    }

    fn select_target(bus: &mut ScsiBus, id: u8) {
        bus.write_register(REG_DATA, (1 << id) | (1 << INITIATOR_ID), false);
        bus.write_register(REG_ICR, ICR_ASSERT_SEL | ICR_ASSERT_DATA, false);
        bus.write_register(REG_ICR, 0, false);
        assert_eq!(bus.phase, Phase::Command);
    }

    fn send_byte(bus: &mut ScsiBus, byte: u8) {
        bus.write_register(REG_DATA, byte, false);
        bus.write_register(REG_ICR, ICR_ASSERT_ACK, false);
        bus.write_register(REG_ICR, 0, false);
    }

    fn send_cdb(bus: &mut ScsiBus, cdb: &[u8]) {
        for &b in cdb {
            send_byte(bus, b);
        }
    }

    fn recv_data(bus: &mut ScsiBus) -> Vec<u8> {
        let mut out = Vec::new();
        while bus.phase == Phase::DataIn {
            out.push(bus.read_register(REG_DATA, false));
            bus.write_register(REG_ICR, ICR_ASSERT_ACK, false);
            bus.write_register(REG_ICR, 0, false);
        }
        out
    }

    fn finish_command(bus: &mut ScsiBus) -> u8 {
        assert_eq!(bus.phase, Phase::Status);
        let status = bus.read_register(REG_DATA, false);
        bus.write_register(REG_ICR, ICR_ASSERT_ACK, false);
        bus.write_register(REG_ICR, 0, false);
        assert_eq!(bus.phase, Phase::MessageIn);
        let message = bus.read_register(REG_DATA, false);
        assert_eq!(message, MSG_COMMAND_COMPLETE);
        bus.write_register(REG_ICR, ICR_ASSERT_ACK, false);
        bus.write_register(REG_ICR, 0, false);
        assert_eq!(bus.phase, Phase::BusFree);
        status
    }

    fn clear_unit_attention(bus: &mut ScsiBus) {
        select_target(bus, 0);
        send_cdb(bus, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(finish_command(bus), STATUS_CHECK_CONDITION);
    }

    #[test]
    fn inquiry_identifies_direct_access_device() {
        let (mut bus, _dir) = bus_with_disk(100);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x12, 0, 0, 0, 36, 0]);
        let data = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(data.len(), 36);
        assert_eq!(data[0] & 0x1f, 0);
        assert_eq!(data[2], 0x02);
        assert!(data[8..16].iter().any(|&b| b != 0 && b != b' '));
    }

    #[test]
    fn power_on_unit_attention_then_ready() {
        let (mut bus, _dir) = bus_with_disk(100);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(finish_command(&mut bus), STATUS_CHECK_CONDITION);
        // REQUEST SENSE reports the reset condition and clears it.
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x03, 0, 0, 0, 18, 0]);
        let sense = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(sense[2] & 0x0f, SK_UNIT_ATTENTION);
        assert_eq!((sense[12], sense[13]), ASC_RESET_OCCURRED);
        // Now the unit is ready.
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
    }

    #[test]
    fn read6_returns_block_contents() {
        let (mut bus, _dir) = bus_with_disk(100);
        let mut block = vec![0u8; BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        bus.target_mut(0).unwrap().store_mut().unwrap().write_block(0, &block).unwrap();
        clear_unit_attention(&mut bus);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x08, 0, 0, 0, 1, 0]);
        let data = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(data, block);
    }

    #[test]
    fn write10_then_read10_round_trip() {
        let (mut bus, _dir) = bus_with_disk(100);
        clear_unit_attention(&mut bus);
        let payload: Vec<u8> = (0..BLOCK_SIZE * 2).map(|i| (i * 7) as u8).collect();
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x2a, 0, 0, 0, 0, 5, 0, 0, 2, 0]);
        assert_eq!(bus.phase, Phase::DataOut);
        for &b in &payload {
            send_byte(&mut bus, b);
        }
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x28, 0, 0, 0, 0, 5, 0, 0, 2, 0]);
        let data = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(data, payload);
    }

    #[test]
    fn out_of_range_read_stages_sense() {
        let (mut bus, _dir) = bus_with_disk(100);
        clear_unit_attention(&mut bus);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x08, 0, 0, 99, 2, 0]);
        assert_eq!(finish_command(&mut bus), STATUS_CHECK_CONDITION);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x03, 0, 0, 0, 18, 0]);
        let sense = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(sense[2] & 0x0f, SK_ILLEGAL_REQUEST);
        assert_eq!((sense[12], sense[13]), ASC_LBA_OUT_OF_RANGE);
    }

    #[test]
    fn write_protected_disk_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 100).unwrap();
        let mut bus = ScsiBus::new();
        bus.attach(0, ScsiTarget::new(store, true));
        clear_unit_attention(&mut bus);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x0a, 0, 0, 0, 1, 0]);
        assert_eq!(finish_command(&mut bus), STATUS_CHECK_CONDITION);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x03, 0, 0, 0, 18, 0]);
        let sense = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(sense[2] & 0x0f, SK_DATA_PROTECT);
    }

    #[test]
    fn read_capacity_reports_geometry() {
        let (mut bus, _dir) = bus_with_disk(4096);
        clear_unit_attention(&mut bus);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let data = recv_data(&mut bus);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
        assert_eq!(be32(&data[0..4]), 4095);
        assert_eq!(be32(&data[4..8]), BLOCK_SIZE as u64);
    }

    #[test]
    fn pseudo_dma_reads_advance_without_ack() {
        let (mut bus, _dir) = bus_with_disk(100);
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i ^ 0x5a) as u8).collect();
        bus.target_mut(0).unwrap().store_mut().unwrap().write_block(3, &block).unwrap();
        clear_unit_attention(&mut bus);
        select_target(&mut bus, 0);
        send_cdb(&mut bus, &[0x08, 0, 0, 3, 1, 0]);
        assert_eq!(bus.phase, Phase::DataIn);
        let mut data = Vec::new();
        for _ in 0..BLOCK_SIZE {
            data.push(bus.read_register(REG_INPUT_DATA, true));
        }
        assert_eq!(data, block);
        assert_eq!(finish_command(&mut bus), STATUS_GOOD);
    }
}
