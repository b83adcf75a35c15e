// The Macintosh Plus profile: who lives where in the address map, how the
// chips are wired to each other, and the main loop that trades control
// between the CPU interpreter and the event queue. Other machine profiles
// would be siblings of this module.

use crate::checkpoint::{CheckpointKind, ChunkReader, ChunkWriter, StateReader, StateWriter};
use crate::devices::{Host, IrqLines, PortInput, Shared};
use crate::input::{Keyboard, Mouse};
use crate::iwm::{HeadSelect, Iwm};
use crate::memory::{MemPtr, MemoryMap};
use crate::processor::CPU;
use crate::rtc::Rtc;
use crate::scc::Scc;
use crate::scheduler::{Event, EventKind, Scheduler, TimingMode};
use crate::scsi::{ScsiBus, ScsiTarget};
use crate::sound::SoundOutput;
use crate::storage::{blocks_dir, BlockStore, BLOCK_SIZE};
use crate::via::Via;
use crate::EmuError;
use log::{debug, info};
use std::cell::Cell;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const CLOCK_HZ: u64 = 7_833_600;
/// Vertical blanking at 60.147 Hz.
pub const VBL_CYCLES: u64 = 130_240;
pub const VBL_PERIOD_MS: f64 = 1000.0 / 60.147;

pub const SCREEN_WIDTH: usize = 512;
pub const SCREEN_HEIGHT: usize = 342;
pub const FRAME_BYTES: usize = SCREEN_WIDTH * SCREEN_HEIGHT / 8;

// Address map.
const ROM_BASE: u32 = 0x40_0000;
const ROM_SLOT: u32 = 0x2_0000;
const SCSI_BASE: u32 = 0x58_0000;
const SCC_RD_PAGE: u32 = 0x9f_f000;
const SCC_WR_PAGE: u32 = 0xbf_f000;
const IWM_PAGE: u32 = 0xdf_e000;
const VIA_PAGE: u32 = 0xef_e000;

// Screen buffers below the top of RAM.
const MAIN_SCREEN_OFFSET: u32 = 0x5900;
const ALT_SCREEN_OFFSET: u32 = 0xd900;

// Port A wiring.
const PA_OVERLAY: u8 = 0x10;
const PA_HEAD_SEL: u8 = 0x20;
const PA_ALT_SCREEN: u8 = 0x40;

/// RAM window reachable at 0x600000 while the overlay is up; capped so it
/// cannot shadow the SCC.
const OVERLAY_RAM_WINDOW: u32 = 0x3f_0000;

/// Background consolidation work per VBL and disk.
const TICK_MERGES: usize = 2;

/// Floppy images: 800 blocks single sided, 1600 double.
pub const FLOPPY_400K_BLOCKS: u64 = 800;
pub const FLOPPY_800K_BLOCKS: u64 = 1600;

pub struct MachineConfig {
    pub ram_size: usize,
    pub rom: Vec<u8>,
}

impl MachineConfig {
    pub fn plus_4mb(rom: Vec<u8>) -> Self {
        MachineConfig { ram_size: 0x40_0000, rom }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageTarget {
    Floppy(usize),
    Scsi(usize),
}

struct ImageBinding {
    target: ImageTarget,
    path: PathBuf,
    blocks: u64,
}

pub struct Macintosh {
    pub mem: MemPtr,
    pub cpu: CPU,
    pub sched: Shared<Scheduler>,
    pub via: Shared<Via>,
    pub rtc: Shared<Rtc>,
    pub scc: Shared<Scc>,
    pub iwm: Shared<Iwm>,
    pub scsi: Shared<ScsiBus>,
    pub keyboard: Shared<Keyboard>,
    pub mouse: Shared<Mouse>,
    pub sound: Shared<SoundOutput>,
    pub irq: Rc<IrqLines>,
    host: Shared<dyn Host>,
    overlay: Rc<Cell<bool>>,
    head_sel: HeadSelect,
    ram_size: usize,
    images: Vec<ImageBinding>,
}

fn apply_address_space(mem: &MemoryMap, ram_size: usize, overlay: bool) {
    if overlay {
        // Boot: ROM answers at address zero, RAM hides at 0x600000.
        mem.map_rom(0, 0x10_0000, 0);
        mem.unmap(0x10_0000, 0x30_0000);
        let window = (ram_size as u32).min(OVERLAY_RAM_WINDOW);
        mem.map_ram(0x60_0000, window, 0, true);
    } else {
        mem.map_ram(0, 0x40_0000, 0, true);
        mem.unmap(0x60_0000, OVERLAY_RAM_WINDOW);
    }
}

impl Macintosh {
    pub fn new(config: MachineConfig, host: Shared<dyn Host>) -> Result<Self, EmuError> {
        if config.rom.is_empty() {
            return Err(EmuError::Config("no ROM image".into()));
        }
        if config.ram_size == 0 || config.ram_size & 0xfff != 0 {
            return Err(EmuError::Config(format!("bad RAM size {:#x}", config.ram_size)));
        }
        let ram_size = config.ram_size;
        let mem = MemoryMap::new(ram_size, config.rom);
        let sched = crate::devices::shared(Scheduler::new(CLOCK_HZ));
        let irq = IrqLines::new();
        let pa_in = PortInput::new(0xff);
        let pb_in = PortInput::new(0xff);
        let overlay = Rc::new(Cell::new(true));
        let head_sel: HeadSelect = Rc::new(Cell::new(true));

        let via = crate::devices::shared(Via::new(sched.clone(), irq.clone(), pa_in.clone(), pb_in.clone()));
        let rtc = crate::devices::shared(Rtc::new(pb_in.clone()));
        let scc = crate::devices::shared(Scc::new(sched.clone(), irq.clone()));
        let iwm = crate::devices::shared(Iwm::new(sched.clone(), head_sel.clone()));
        let scsi = crate::devices::shared(ScsiBus::new());
        let keyboard = crate::devices::shared(Keyboard::new(sched.clone()));
        let mouse = crate::devices::shared(Mouse::new(sched.clone(), scc.clone(), pb_in.clone()));
        let sound = crate::devices::shared(SoundOutput::new());

        // Port A drives the overlay flip, head select and mixer volume.
        {
            let mem = Rc::clone(&mem);
            let overlay = Rc::clone(&overlay);
            let head_sel = Rc::clone(&head_sel);
            let sound = sound.clone();
            via.borrow_mut().observe_port_a(Box::new(move |pins, _ddr| {
                head_sel.set(pins & PA_HEAD_SEL != 0);
                sound.borrow_mut().set_volume(pins & 7);
                let want = pins & PA_OVERLAY != 0;
                if want != overlay.get() {
                    debug!("ROM overlay {}", if want { "on" } else { "off" });
                    overlay.set(want);
                    apply_address_space(&mem, ram_size, want);
                }
            }));
        }
        // Port B carries the RTC serial lines.
        {
            let rtc = rtc.clone();
            via.borrow_mut().observe_port_b(Box::new(move |pins, ddr| {
                rtc.borrow_mut().port_write(pins, ddr);
            }));
        }
        // Shift register output clocks commands into the keyboard.
        {
            let keyboard = keyboard.clone();
            via.borrow_mut().observe_shift_out(Box::new(move |byte| {
                keyboard.borrow_mut().command(byte);
            }));
        }

        // Fixed device decode.
        for slot in 0u32..8 {
            let base = ROM_BASE + slot * ROM_SLOT;
            if slot % 2 == 0 {
                mem.map_rom(base, ROM_SLOT, 0);
            } else {
                // A17 output-enable: alternate images float high.
                mem.map_open(base, ROM_SLOT, 0xff);
            }
        }
        apply_address_space(&mem, ram_size, true);
        mem.map_device(SCSI_BASE, 0x1000, scsi.clone(), SCSI_BASE);
        mem.map_device(SCC_RD_PAGE, 0x1000, scc.clone(), SCC_RD_PAGE);
        mem.map_device(SCC_WR_PAGE, 0x1000, scc.clone(), SCC_WR_PAGE);
        mem.map_device(IWM_PAGE, 0x2000, iwm.clone(), IWM_PAGE | 0x1ff);
        mem.map_device(VIA_PAGE, 0x2000, via.clone(), VIA_PAGE | 0x1fe);

        let mut cpu = CPU::new(Rc::clone(&mem), irq.clone());
        cpu.reset();

        {
            let mut s = sched.borrow_mut();
            s.schedule(EventKind::Vbl, 0, VBL_CYCLES);
            s.schedule(EventKind::RtcSecond, 0, CLOCK_HZ);
        }

        Ok(Macintosh {
            mem,
            cpu,
            sched,
            via,
            rtc,
            scc,
            iwm,
            scsi,
            keyboard,
            mouse,
            sound,
            irq,
            host,
            overlay,
            head_sel,
            ram_size,
            images: Vec::new(),
        })
    }

    pub fn attach_floppy(&mut self, drive: usize, image: &Path, blocks: u64) -> Result<(), EmuError> {
        let dir = blocks_dir(image);
        let store = BlockStore::open(&dir, blocks)?;
        let sides = if blocks > FLOPPY_400K_BLOCKS { 2 } else { 1 };
        self.iwm.borrow_mut().drives[drive].insert(store, sides, false);
        self.images.push(ImageBinding { target: ImageTarget::Floppy(drive), path: image.to_path_buf(), blocks });
        info!("floppy {} attached: {} ({} blocks)", drive, image.display(), blocks);
        Ok(())
    }

    pub fn attach_scsi(&mut self, id: usize, image: &Path, blocks: u64) -> Result<(), EmuError> {
        let dir = blocks_dir(image);
        let store = BlockStore::open(&dir, blocks)?;
        self.scsi.borrow_mut().attach(id, ScsiTarget::new(store, false));
        self.images.push(ImageBinding { target: ImageTarget::Scsi(id), path: image.to_path_buf(), blocks });
        info!("SCSI {} attached: {} ({} blocks)", id, image.display(), blocks);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: TimingMode) {
        self.sched.borrow_mut().set_mode(mode);
    }

    pub fn cpu_cycles(&self) -> u64 {
        self.sched.borrow().cpu_cycles()
    }

    pub fn instruction_count(&self) -> u64 {
        self.sched.borrow().instruction_count()
    }

    /// Break the current main-loop iteration at the next sprint boundary.
    pub fn stop(&mut self) {
        self.sched.borrow_mut().running = false;
    }

    /// One host-driven slice of emulation: plan a cycle budget for the
    /// timing mode, alternate CPU sprints with event drains until the
    /// budget is gone.
    pub fn run_one_iteration(&mut self, host_ms: f64) {
        let budget = self.sched.borrow_mut().plan_iteration(host_ms);
        self.sched.borrow_mut().running = true;
        let start = self.sched.borrow().cpu_cycles();
        self.drain_events();
        loop {
            if !self.sched.borrow().running {
                break;
            }
            let used = self.sched.borrow().cpu_cycles() - start;
            if used >= budget {
                break;
            }
            if self.cpu.stopped {
                // STOP burns no instructions; jump straight to the next
                // event if it falls inside this iteration.
                let next = self.sched.borrow().next_event_timestamp();
                match next {
                    Some(t) if t <= start + budget => self.sched.borrow_mut().advance_to_next_event(),
                    _ => break,
                }
            } else {
                let granted = self.sched.borrow_mut().begin_sprint(budget - used);
                if granted > 0 {
                    let burndown = self.sched.borrow().burndown_handle();
                    self.cpu.run_sprint(&burndown);
                }
                self.sched.borrow_mut().finish_sprint();
            }
            self.drain_events();
        }
        self.sched.borrow_mut().running = false;
    }

    fn drain_events(&mut self) {
        loop {
            let event = self.sched.borrow_mut().pop_due();
            match event {
                Some(e) => self.dispatch_event(e),
                None => break,
            }
        }
    }

    fn dispatch_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Vbl => self.vbl(),
            EventKind::RtcSecond => {
                self.rtc.borrow_mut().tick_second();
                self.via.borrow_mut().pulse_ca2();
                self.sched.borrow_mut().schedule(EventKind::RtcSecond, 0, CLOCK_HZ);
            }
            EventKind::ViaTimer1 => self.via.borrow_mut().timer1_expired(),
            EventKind::ViaTimer2 => self.via.borrow_mut().timer2_expired(),
            EventKind::ViaShift => self.via.borrow_mut().shift_done(),
            EventKind::KeyboardReply => {
                let reply = self.keyboard.borrow_mut().take_reply();
                if let Some(byte) = reply {
                    self.via.borrow_mut().shift_in(byte);
                }
            }
            EventKind::MouseStep => self.mouse.borrow_mut().step_event(),
            EventKind::SccRxByte => self.scc.borrow_mut().rx_byte_event(event.data),
            EventKind::IwmSettle => self.iwm.borrow_mut().settle_done(event.data),
            EventKind::IwmMotor => self.iwm.borrow_mut().motor_ready(event.data),
        }
    }

    /// Vertical blanking: CA1 pulse into the VIA, one sound slice, one
    /// frame to the host, a little storage housekeeping, and the next VBL
    /// goes on the queue (nudged by the wall-clock loop in live mode).
    fn vbl(&mut self) {
        let pa = self.via.borrow().port_a();
        self.via.borrow_mut().pulse_ca1();

        let samples = self.sound.borrow().vbl_slice(&self.mem, pa);
        let volume = self.sound.borrow().volume();
        self.host.borrow_mut().play_8bit_pwm(&samples, volume);

        let screen_offset = if pa & PA_ALT_SCREEN != 0 { MAIN_SCREEN_OFFSET } else { ALT_SCREEN_OFFSET };
        let base = (self.ram_size as u32).wrapping_sub(screen_offset);
        let frame = self.mem.read_region(base, FRAME_BYTES);
        self.host.borrow_mut().refresh_screen(&frame);

        for drive in self.iwm.borrow_mut().drives.iter_mut() {
            if let Some(store) = drive.store_mut() {
                if let Err(e) = store.tick(TICK_MERGES) {
                    log::warn!("floppy consolidation failed: {}", e);
                }
            }
        }
        self.scsi.borrow_mut().tick_storage(TICK_MERGES);

        let host_ms = self.host.borrow_mut().time_ms();
        let mut sched = self.sched.borrow_mut();
        sched.note_vbl(host_ms, VBL_PERIOD_MS);
        let delta = sched.vbl_correction_cycles(VBL_CYCLES);
        sched.schedule(EventKind::Vbl, 0, delta);
    }

    pub fn keyboard_event(&mut self, down: bool, keycode: u8) {
        self.keyboard.borrow_mut().key_event(down, keycode);
    }

    pub fn mouse_event(&mut self, button_down: bool, dx: i32, dy: i32) {
        self.mouse.borrow_mut().inject(button_down, dx, dy);
    }

    /// Inject a LocalTalk frame into an SCC channel.
    pub fn sdlc_send(&mut self, channel: usize, frame: &[u8]) {
        self.scc.borrow_mut().sdlc_send(channel, frame);
    }

    // ---- Checkpointing ------------------------------------------------

    fn save_cpu(&self, w: &mut StateWriter) {
        w.put_u32(self.cpu.pc);
        w.put_u16(self.cpu.sr);
        for reg in &self.cpu.dr {
            w.put_u32(*reg.borrow());
        }
        for reg in &self.cpu.ar {
            w.put_u32(*reg.borrow());
        }
        w.put_u32(*self.cpu.ssp.borrow());
        w.put_u8(self.cpu.stopped as u8);
        w.put_u8(self.irq.raw());
    }

    fn load_cpu(&mut self, r: &mut StateReader) {
        self.cpu.pc = r.take_u32();
        self.cpu.sr = r.take_u16();
        for reg in &self.cpu.dr {
            reg.replace(r.take_u32());
        }
        for reg in &self.cpu.ar {
            reg.replace(r.take_u32());
        }
        self.cpu.ssp.replace(r.take_u32());
        self.cpu.stopped = r.take_u8() != 0;
        self.irq.load(r.take_u8());
    }

    fn save_scheduler(&self, w: &mut StateWriter) {
        let sched = self.sched.borrow();
        let (mode, cycles, instructions) = sched.state();
        w.put_u8(mode);
        w.put_u64(cycles);
        w.put_u64(instructions);
        let events = sched.events();
        w.put_u32(events.len() as u32);
        for e in events {
            w.put_u16(e.kind.to_tag());
            w.put_u64(e.data);
            w.put_u64(e.timestamp);
        }
    }

    fn load_scheduler(&mut self, r: &mut StateReader) {
        let mode = r.take_u8();
        let cycles = r.take_u64();
        let instructions = r.take_u64();
        let n = r.take_u32() as usize;
        let events: Vec<(u16, u64, u64)> =
            (0..n).map(|_| (r.take_u16(), r.take_u64(), r.take_u64())).collect();
        let mut sched = self.sched.borrow_mut();
        sched.load_state(mode, cycles, instructions);
        sched.load_events(&events);
    }

    fn save_images(&mut self, w: &mut ChunkWriter<impl Write>, kind: CheckpointKind) -> Result<(), EmuError> {
        let mut header = StateWriter::new();
        header.put_u32(self.images.len() as u32);
        for binding in &self.images {
            let (tag, unit) = match binding.target {
                ImageTarget::Floppy(d) => (0u8, d as u8),
                ImageTarget::Scsi(id) => (1u8, id as u8),
            };
            header.put_u8(tag);
            header.put_u8(unit);
            let path = binding.path.to_string_lossy();
            header.put_u16(path.len() as u16);
            header.put_bytes(path.as_bytes());
            header.put_u64(binding.blocks);
            header.put_u8((kind == CheckpointKind::Consolidated) as u8);
        }
        write_sized(w, &header.into_bytes());

        for binding in &self.images {
            let store_ops = |store: &mut BlockStore| -> Result<Option<Vec<u8>>, EmuError> {
                // The checkpoint becomes the new rollback baseline.
                store.commit_checkpoint()?;
                if kind == CheckpointKind::Consolidated {
                    let mut data = Vec::with_capacity((binding.blocks as usize) * BLOCK_SIZE);
                    store.save_state(|b| data.extend_from_slice(b))?;
                    Ok(Some(data))
                } else {
                    Ok(None)
                }
            };
            let payload = match binding.target {
                ImageTarget::Floppy(d) => {
                    let mut iwm = self.iwm.borrow_mut();
                    match iwm.drives[d].store_mut() {
                        Some(store) => store_ops(store)?,
                        None => None,
                    }
                }
                ImageTarget::Scsi(id) => {
                    let mut scsi = self.scsi.borrow_mut();
                    match scsi.target_mut(id).and_then(|t| t.store_mut()) {
                        Some(store) => store_ops(store)?,
                        None => None,
                    }
                }
            };
            if let Some(data) = payload {
                write_sized(w, &data);
            }
        }
        Ok(())
    }

    /// Serialize the whole machine. Must be called between iterations,
    /// never from inside an event callback.
    pub fn save_checkpoint<W: Write>(&mut self, sink: W, kind: CheckpointKind) -> Result<(), EmuError> {
        let mut w = ChunkWriter::new(sink, kind);
        write_sized(&mut w, &self.mem.snapshot_ram());
        write_device(&mut w, |sw| self.save_cpu(sw));
        write_device(&mut w, |sw| self.save_scheduler(sw));
        write_device(&mut w, |sw| self.rtc.borrow().save_state(sw));
        write_device(&mut w, |sw| self.scc.borrow().save_state(sw));
        write_device(&mut w, |sw| self.sound.borrow().save_state(sw));
        write_device(&mut w, |sw| self.via.borrow().save_state(sw));
        write_device(&mut w, |sw| self.mouse.borrow().save_state(sw));
        write_device(&mut w, |sw| self.scsi.borrow().save_state(sw));
        write_device(&mut w, |sw| self.keyboard.borrow().save_state(sw));
        write_device(&mut w, |sw| self.iwm.borrow().save_state(sw));
        self.save_images(&mut w, kind)?;
        w.finish()
    }

    /// Rebuild a machine from a checkpoint stream. The ROM still comes
    /// from the configuration; the stream carries everything else.
    pub fn restore<R: Read>(config: MachineConfig, host: Shared<dyn Host>, source: R) -> Result<Self, EmuError> {
        let mut machine = Macintosh::new(config, host)?;
        let mut r = ChunkReader::open(source)?;
        let kind = r.kind();

        let ram = read_sized(&mut r);
        machine.mem.load_ram(&ram);
        let chunk = read_sized(&mut r);
        machine.load_cpu(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.load_scheduler(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.rtc.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.scc.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.sound.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.via.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.mouse.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.scsi.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.keyboard.borrow_mut().load_state(&mut StateReader::new(&chunk));
        let chunk = read_sized(&mut r);
        machine.iwm.borrow_mut().load_state(&mut StateReader::new(&chunk));

        // Image bindings and, for consolidated streams, their payloads.
        let header = read_sized(&mut r);
        let mut hr = StateReader::new(&header);
        let count = hr.take_u32() as usize;
        for _ in 0..count {
            let tag = hr.take_u8();
            let unit = hr.take_u8() as usize;
            let path_len = hr.take_u16() as usize;
            let path = PathBuf::from(String::from_utf8_lossy(&hr.take_vec(path_len)).into_owned());
            let blocks = hr.take_u64();
            let has_data = hr.take_u8() != 0;
            if kind == CheckpointKind::Quick && !blocks_dir(&path).exists() {
                return Err(EmuError::Checkpoint(format!(
                    "quick checkpoint needs the block store of {} on disk",
                    path.display()
                )));
            }
            let target = if tag == 0 { ImageTarget::Floppy(unit) } else { ImageTarget::Scsi(unit) };
            match target {
                ImageTarget::Floppy(d) => machine.attach_floppy(d, &path, blocks)?,
                ImageTarget::Scsi(id) => machine.attach_scsi(id, &path, blocks)?,
            }
            if has_data {
                let data = read_sized(&mut r);
                let mut cursor = 0;
                let mut feed = || {
                    let end = (cursor + BLOCK_SIZE).min(data.len());
                    let mut block = vec![0; BLOCK_SIZE];
                    block[..end - cursor].copy_from_slice(&data[cursor..end]);
                    cursor = end;
                    block
                };
                match target {
                    ImageTarget::Floppy(d) => {
                        if let Some(store) = machine.iwm.borrow_mut().drives[d].store_mut() {
                            store.load_state(&mut feed)?;
                        }
                    }
                    ImageTarget::Scsi(id) => {
                        let mut scsi = machine.scsi.borrow_mut();
                        if let Some(store) = scsi.target_mut(id).and_then(|t| t.store_mut()) {
                            store.load_state(&mut feed)?;
                        }
                    }
                }
            }
        }

        if r.has_error() {
            return Err(EmuError::Checkpoint("checkpoint stream did not validate".into()));
        }
        machine.sync_derived_state();
        Ok(machine)
    }

    /// Re-derive the wiring state that normally tracks VIA port writes.
    fn sync_derived_state(&mut self) {
        let pa = self.via.borrow().port_a();
        self.head_sel.set(pa & PA_HEAD_SEL != 0);
        let overlay = pa & PA_OVERLAY != 0;
        self.overlay.set(overlay);
        apply_address_space(&self.mem, self.ram_size, overlay);
    }
}

fn write_device<W: Write>(w: &mut ChunkWriter<W>, save: impl FnOnce(&mut StateWriter)) {
    let mut sw = StateWriter::new();
    save(&mut sw);
    write_sized(w, &sw.into_bytes());
}

fn write_sized<W: Write>(w: &mut ChunkWriter<W>, payload: &[u8]) {
    w.write_chunk(&(payload.len() as u32).to_be_bytes());
    w.write_chunk(payload);
}

/// Largest single chunk a well-formed checkpoint carries (a whole 20 MB
/// class disk image plus slack).
const CHUNK_SANITY: usize = 256 << 20;

fn read_sized<R: Read>(r: &mut ChunkReader<R>) -> Vec<u8> {
    let header = r.read_chunk(4);
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > CHUNK_SANITY {
        return r.read_chunk(0);
    }
    r.read_chunk(len)
}
