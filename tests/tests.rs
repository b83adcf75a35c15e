// Machine-level scenarios: a synthetic boot ROM stands in for the real
// one, with hand-assembled 68000 code exercising the interpreter, the
// memory map, the overlay switch and the checkpoint paths end to end.

use emplus::checkpoint::CheckpointKind;
use emplus::devices::NullHost;
use emplus::mac::{Macintosh, MachineConfig};
use emplus::scheduler::TimingMode;
use emplus::storage::{blocks_dir, BlockStore, BLOCK_SIZE};

const ROM_LEN: usize = 0x2_0000;
const RAM_SIZE: usize = 0x40_0000;

fn word(rom: &mut [u8], offset: usize, value: u16) -> usize {
    rom[offset] = (value >> 8) as u8;
    rom[offset + 1] = value as u8;
    offset + 2
}

fn long(rom: &mut [u8], offset: usize, value: u32) -> usize {
    let offset = word(rom, offset, (value >> 16) as u16);
    word(rom, offset, value as u16)
}

/// ROM with reset vectors and a program at 0x400010 that settles into a
/// busy loop.
fn arithmetic_rom() -> Vec<u8> {
    let mut rom = vec![0u8; ROM_LEN];
    long(&mut rom, 0x0, 0x0060_2000); // initial SSP in the overlay RAM window
    long(&mut rom, 0x4, 0x0040_0010); // initial PC
    long(&mut rom, 0x80, 0x0040_0050); // TRAP #0 vector

    let mut at = 0x10;
    at = word(&mut rom, at, 0x7005); // MOVEQ #5,D0
    at = word(&mut rom, at, 0x72ff); // MOVEQ #-1,D1
    at = word(&mut rom, at, 0xd081); // ADD.L D1,D0
    at = word(&mut rom, at, 0x5380); // SUBQ.L #1,D0
    at = word(&mut rom, at, 0xe588); // LSL.L #2,D0
    at = word(&mut rom, at, 0x4840); // SWAP D0
    at = word(&mut rom, at, 0x7403); // MOVEQ #3,D2
    at = word(&mut rom, at, 0x5243); // ADDQ.W #1,D3
    at = word(&mut rom, at, 0x51ca); // DBF D2,loop
    at = word(&mut rom, at, 0xfffc);
    at = word(&mut rom, at, 0x4eb9); // JSR 0x400040
    at = long(&mut rom, at, 0x0040_0040);
    at = word(&mut rom, at, 0x4e40); // TRAP #0
    word(&mut rom, at, 0x60fe); // BRA *

    let mut sub = 0x40;
    sub = word(&mut rom, sub, 0x7807); // MOVEQ #7,D4
    word(&mut rom, sub, 0x4e75); // RTS

    let mut handler = 0x50;
    handler = word(&mut rom, handler, 0x7a09); // MOVEQ #9,D5
    word(&mut rom, handler, 0x4e73); // RTE

    rom
}

/// ROM whose program drops the overlay through VIA port A and then
/// writes and reads low RAM.
fn overlay_rom() -> Vec<u8> {
    let mut rom = vec![0u8; ROM_LEN];
    long(&mut rom, 0x0, 0x0060_2000);
    long(&mut rom, 0x4, 0x0040_0010);

    let mut at = 0x10;
    at = word(&mut rom, at, 0x13fc); // MOVE.B #0xFF,VIA DDRA
    at = word(&mut rom, at, 0x00ff);
    at = long(&mut rom, at, 0x00ef_e7fe);
    at = word(&mut rom, at, 0x13fc); // MOVE.B #0x00,VIA ORA (overlay off)
    at = word(&mut rom, at, 0x0000);
    at = long(&mut rom, at, 0x00ef_e3fe);
    at = word(&mut rom, at, 0x23fc); // MOVE.L #0xDEADBEEF,0x1000
    at = long(&mut rom, at, 0xdead_beef);
    at = long(&mut rom, at, 0x0000_1000);
    at = word(&mut rom, at, 0x2239); // MOVE.L 0x1000,D1
    at = long(&mut rom, at, 0x0000_1000);
    word(&mut rom, at, 0x60fe); // BRA *

    rom
}

fn machine_with(rom: Vec<u8>) -> Macintosh {
    let host = NullHost::new();
    Macintosh::new(MachineConfig { ram_size: RAM_SIZE, rom }, host).unwrap()
}

fn run_emulated_second(machine: &mut Macintosh, host_ms: &mut f64) {
    // Unbounded mode grants a fixed instruction slab per iteration.
    for _ in 0..8 {
        *host_ms += 10.0;
        machine.run_one_iteration(*host_ms);
    }
}

#[test]
fn boot_loop_executes_from_rom() {
    let mut machine = machine_with(arithmetic_rom());
    let mut host_ms = 0.0;
    run_emulated_second(&mut machine, &mut host_ms);
    assert!(machine.instruction_count() > 1_000_000);
    assert!(machine.cpu.pc >= 0x40_0000 && machine.cpu.pc < 0x50_0000);
}

#[test]
fn interpreter_arithmetic_and_control_flow() {
    let mut machine = machine_with(arithmetic_rom());
    machine.run_one_iteration(5.0);
    assert_eq!(*machine.cpu.dr[0].borrow(), 0x000c_0000);
    assert_eq!(*machine.cpu.dr[1].borrow(), 0xffff_ffff);
    // DBF ran the loop body four times.
    assert_eq!(*machine.cpu.dr[3].borrow() & 0xffff, 4);
    // JSR/RTS and TRAP #0/RTE both completed.
    assert_eq!(*machine.cpu.dr[4].borrow(), 7);
    assert_eq!(*machine.cpu.dr[5].borrow(), 9);
    // Settled in the terminal busy loop.
    assert_eq!(machine.cpu.pc, 0x40_002c);
}

#[test]
fn overlay_switch_exposes_ram_at_zero() {
    let mut machine = machine_with(overlay_rom());
    machine.run_one_iteration(5.0);
    assert_eq!(machine.mem.read32(0x1000), 0xdead_beef);
    assert_eq!(*machine.cpu.dr[1].borrow(), 0xdead_beef);
    // ROM is still visible at its nominal base, and its alternate 128 KB
    // slots float high.
    assert_eq!(machine.mem.read16(0x40_0010), 0x13fc);
    assert_eq!(machine.mem.read8(0x42_0010), 0xff);
}

#[test]
fn scheduler_mode_switch_is_piecewise_linear() {
    let mut machine = machine_with(arithmetic_rom());
    machine.set_mode(TimingMode::HardwareAccurate);
    machine.run_one_iteration(10.0);
    let n1 = machine.instruction_count();
    assert!(n1 > 0);
    assert_eq!(machine.cpu_cycles(), n1 * 12);
    machine.set_mode(TimingMode::Unbounded);
    machine.run_one_iteration(20.0);
    let n2 = machine.instruction_count();
    assert!(n2 > n1);
    assert_eq!(machine.cpu_cycles(), n1 * 12 + (n2 - n1) * 4);
}

#[test]
fn monotone_counters_across_iterations() {
    let mut machine = machine_with(arithmetic_rom());
    let mut cycles = 0;
    let mut instructions = 0;
    for i in 0..20 {
        machine.run_one_iteration(i as f64 * 5.0);
        let c = machine.cpu_cycles();
        let n = machine.instruction_count();
        assert!(c >= cycles);
        assert!(n >= instructions);
        cycles = c;
        instructions = n;
    }
}

#[test]
fn quick_checkpoint_round_trip() {
    let mut machine = machine_with(arithmetic_rom());
    machine.run_one_iteration(5.0);
    let cycles = machine.cpu_cycles();
    let instructions = machine.instruction_count();
    machine.mem.write32(0x60_1234, 0xcafe_f00d);

    let mut buffer = Vec::new();
    machine.save_checkpoint(&mut buffer, CheckpointKind::Quick).unwrap();
    drop(machine);

    let restored = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        buffer.as_slice(),
    )
    .unwrap();
    assert_eq!(restored.cpu_cycles(), cycles);
    assert_eq!(restored.instruction_count(), instructions);
    assert_eq!(restored.cpu.pc, 0x40_002c);
    assert_eq!(*restored.cpu.dr[0].borrow(), 0x000c_0000);
    assert_eq!(*restored.cpu.dr[5].borrow(), 9);
    assert_eq!(restored.mem.read32(0x60_1234), 0xcafe_f00d);
}

#[test]
fn restored_machine_keeps_running() {
    let mut machine = machine_with(arithmetic_rom());
    machine.run_one_iteration(5.0);
    let mut buffer = Vec::new();
    machine.save_checkpoint(&mut buffer, CheckpointKind::Quick).unwrap();

    let mut restored = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        buffer.as_slice(),
    )
    .unwrap();
    let before = restored.instruction_count();
    restored.run_one_iteration(10.0);
    assert!(restored.instruction_count() > before);
    assert_eq!(restored.cpu.pc, 0x40_002c);
}

#[test]
fn consolidated_checkpoint_carries_disk_blocks() {
    let images = tempfile::tempdir().unwrap();
    let image_path = images.path().join("hd.img");
    let mut machine = machine_with(arithmetic_rom());
    machine.attach_scsi(0, &image_path, 4096).unwrap();

    let mut block = vec![0u8; BLOCK_SIZE];
    block[0] = 0x4c;
    block[42] = 0x99;
    machine
        .scsi
        .borrow_mut()
        .target_mut(0)
        .unwrap()
        .store_mut()
        .unwrap()
        .write_block(7, &block)
        .unwrap();
    machine.run_one_iteration(5.0);

    let mut consolidated = Vec::new();
    machine.save_checkpoint(&mut consolidated, CheckpointKind::Consolidated).unwrap();
    let mut quick = Vec::new();
    machine.save_checkpoint(&mut quick, CheckpointKind::Quick).unwrap();
    drop(machine);

    // Blow away the on-disk block store: consolidated restore rebuilds it.
    std::fs::remove_dir_all(blocks_dir(&image_path)).unwrap();
    let restored = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        consolidated.as_slice(),
    )
    .unwrap();
    {
        let mut scsi = restored.scsi.borrow_mut();
        let stored = scsi.target_mut(0).unwrap().store_mut().unwrap().read_block(7).unwrap();
        assert_eq!(stored[0], 0x4c);
        assert_eq!(stored[42], 0x99);
    }
    drop(restored);

    // A quick checkpoint depends on that tree and must refuse to load.
    std::fs::remove_dir_all(blocks_dir(&image_path)).unwrap();
    let err = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        quick.as_slice(),
    );
    assert!(err.is_err());
}

#[test]
fn quick_checkpoint_reuses_block_store() {
    let images = tempfile::tempdir().unwrap();
    let image_path = images.path().join("floppy.img");
    let mut machine = machine_with(arithmetic_rom());
    machine.attach_floppy(0, &image_path, 1600).unwrap();
    {
        let mut iwm = machine.iwm.borrow_mut();
        let store = iwm.drives[0].store_mut().unwrap();
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0] = 0x77;
        store.write_block(3, &block).unwrap();
    }
    machine.run_one_iteration(5.0);
    let mut buffer = Vec::new();
    machine.save_checkpoint(&mut buffer, CheckpointKind::Quick).unwrap();
    drop(machine);

    let restored = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        buffer.as_slice(),
    )
    .unwrap();
    let mut iwm = restored.iwm.borrow_mut();
    let stored = iwm.drives[0].store_mut().unwrap().read_block(3).unwrap();
    assert_eq!(stored[0], 0x77);
}

#[test]
fn bad_checkpoint_magic_is_rejected() {
    let err = Macintosh::restore(
        MachineConfig { ram_size: RAM_SIZE, rom: arithmetic_rom() },
        NullHost::new(),
        &b"NOTACHKPxxxxxxxxxxxxxxxx"[..],
    );
    assert!(err.is_err());
}

#[test]
fn rollback_overlay_rewinds_uncommitted_writes() {
    let images = tempfile::tempdir().unwrap();
    let image_path = images.path().join("hd.img");
    let dir = blocks_dir(&image_path);
    let mut block_a = vec![0u8; BLOCK_SIZE];
    block_a[0] = 0xaa;
    let mut block_b = vec![0u8; BLOCK_SIZE];
    block_b[0] = 0xbb;
    {
        let mut machine = machine_with(arithmetic_rom());
        machine.attach_scsi(0, &image_path, 256).unwrap();
        {
            let mut scsi = machine.scsi.borrow_mut();
            let store = scsi.target_mut(0).unwrap().store_mut().unwrap();
            store.write_block(5, &block_a).unwrap();
        }
        // The checkpoint commits the store baseline.
        let mut buffer = Vec::new();
        machine.save_checkpoint(&mut buffer, CheckpointKind::Quick).unwrap();
        // A post-checkpoint write that never gets committed.
        let mut scsi = machine.scsi.borrow_mut();
        let store = scsi.target_mut(0).unwrap().store_mut().unwrap();
        store.write_block(5, &block_b).unwrap();
    }
    // Reopening applies the rollback overlay: the uncommitted write is
    // gone, the checkpointed content is back.
    let store = BlockStore::open(&dir, 256).unwrap();
    assert_eq!(store.read_block(5).unwrap()[0], 0xaa);
}
