// Per-VBL sound slice: 370 PWM samples pulled from the active sound
// buffer near the top of RAM, one byte per 16-bit word (the high byte
// carries the sample). Which buffer is active and the mixer volume ride
// on VIA port A.

use crate::checkpoint::{StateReader, StateWriter};
use crate::memory::MemoryMap;

pub const SLICE_LEN: usize = 370;

/// Main and alternate buffer offsets below the top of RAM.
const MAIN_BUFFER_OFFSET: u32 = 0x300;
const ALT_BUFFER_OFFSET: u32 = 0x5f00;

/// The System 6 sound driver leaves its buffer 90 words into the region.
const DRIVER_WORD_OFFSET: u32 = 90;

/// Port A bit 3 selects the main buffer when high.
const PA_MAIN_BUFFER: u8 = 0x08;

pub struct SoundOutput {
    volume: u8,
}

impl SoundOutput {
    /// Audible before the guest ever touches the volume latches.
    pub fn new() -> Self {
        SoundOutput { volume: 4 }
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume & 7;
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Extract this VBL's 370 samples from guest RAM.
    pub fn vbl_slice(&self, mem: &MemoryMap, port_a: u8) -> Vec<u8> {
        let ram_top = mem.ram_size() as u32;
        let offset = if port_a & PA_MAIN_BUFFER != 0 { MAIN_BUFFER_OFFSET } else { ALT_BUFFER_OFFSET };
        let base = ram_top.wrapping_sub(offset).wrapping_add(2 * DRIVER_WORD_OFFSET);
        let mut samples = vec![0u8; SLICE_LEN];
        for (i, sample) in samples.iter_mut().enumerate() {
            *sample = mem.read8(base.wrapping_add(2 * i as u32));
        }
        samples
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(self.volume);
    }

    pub fn load_state(&mut self, r: &mut StateReader) {
        self.volume = r.take_u8() & 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_takes_high_bytes_of_words() {
        let mem = MemoryMap::new(0x40_0000, Vec::new());
        mem.map_ram(0, 0x40_0000, 0, true);
        let base = 0x40_0000 - MAIN_BUFFER_OFFSET + 2 * DRIVER_WORD_OFFSET;
        for i in 0..SLICE_LEN as u32 {
            mem.write16(base + 2 * i, ((i as u16 & 0xff) << 8) | 0x55);
        }
        let sound = SoundOutput::new();
        let samples = sound.vbl_slice(&mem, PA_MAIN_BUFFER);
        assert_eq!(samples.len(), SLICE_LEN);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[10], 10);
        assert_eq!(samples[255], 255);
        assert_eq!(sound.volume(), 4);
    }
}
