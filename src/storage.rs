// Directory-of-blocks persistence for disk images. Every write replaces a
// whole file via tmp-then-rename, so a crash can never tear a block; the
// rollback overlay keeps preimages of blocks touched since the last
// checkpoint commit so an aborted run can be rewound. A file at level L
// covers 16^L consecutive blocks and carries L trailing X characters in
// its name; the background tick merges sixteen aligned siblings into
// their parent to keep the directory small.

use crate::EmuError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const BLOCK_SIZE: usize = 512;

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct Meta {
    block_count: u64,
    block_size: u32,
}

pub struct BlockStore {
    dir: PathBuf,
    block_count: u64,
    max_level: u32,
    /// Per-level sorted base LBAs of existing files.
    index: Vec<Vec<u64>>,
}

fn span(level: u32) -> u64 {
    16u64.pow(level)
}

fn level_file_name(base: u64, level: u32) -> String {
    let mut name = format!("{:08x}", base);
    let keep = 8 - level as usize;
    name.truncate(keep);
    for _ in 0..level {
        name.push('X');
    }
    name.push_str(".dat");
    name
}

fn parse_file_name(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_suffix(".dat")?;
    if stem.len() != 8 {
        return None;
    }
    let level = stem.chars().rev().take_while(|&c| c == 'X').count() as u32;
    let digits: String = stem.chars().map(|c| if c == 'X' { '0' } else { c }).collect();
    let base = u64::from_str_radix(&digits, 16).ok()?;
    if base % span(level) != 0 {
        return None;
    }
    Some((base, level))
}

/// Atomic whole-file replacement: write a sibling temp file, then rename
/// over the target. Rename within one directory is the only durability
/// primitive this engine relies on.
fn replace_file(target: &Path, content: &[u8]) -> Result<(), EmuError> {
    let tmp = target.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content)?;
    f.sync_data()?;
    drop(f);
    fs::rename(&tmp, target)?;
    Ok(())
}

/// Where the block directory for an image lives: next to the image, or
/// relocated under `GS_STORAGE_CACHE` when that is set.
pub fn blocks_dir(image: &Path) -> PathBuf {
    let suffixed = PathBuf::from(format!("{}.blocks", image.display()));
    match std::env::var_os("GS_STORAGE_CACHE") {
        Some(cache) => {
            let abs = image
                .canonicalize()
                .unwrap_or_else(|_| image.to_path_buf());
            let mut relocated = PathBuf::from(cache);
            for component in abs.components() {
                if let std::path::Component::Normal(part) = component {
                    relocated.push(part);
                }
            }
            PathBuf::from(format!("{}.blocks", relocated.display()))
        }
        None => suffixed,
    }
}

impl BlockStore {
    pub fn open(dir: &Path, block_count: u64) -> Result<Self, EmuError> {
        fs::create_dir_all(dir)?;
        let meta_path = dir.join("meta.json");
        let meta = Meta { block_count, block_size: BLOCK_SIZE as u32 };
        if meta_path.exists() {
            let existing: Meta = serde_json::from_str(&fs::read_to_string(&meta_path)?)
                .map_err(|e| EmuError::Config(format!("bad meta.json in {}: {}", dir.display(), e)))?;
            if existing != meta {
                return Err(EmuError::Config(format!(
                    "block store {} is {}x{}, expected {}x{}",
                    dir.display(),
                    existing.block_count,
                    existing.block_size,
                    block_count,
                    BLOCK_SIZE
                )));
            }
        } else {
            let json = serde_json::to_string(&meta)
                .map_err(|e| EmuError::Config(format!("meta.json encode: {}", e)))?;
            replace_file(&meta_path, json.as_bytes())?;
        }
        let mut max_level = 0;
        while span(max_level + 1) <= block_count {
            max_level += 1;
        }
        let mut store = BlockStore {
            dir: dir.to_path_buf(),
            block_count,
            max_level,
            index: vec![Vec::new(); max_level as usize + 1],
        };
        store.scan()?;
        store.apply_rollback()?;
        Ok(store)
    }

    fn scan(&mut self) -> Result<(), EmuError> {
        for level in self.index.iter_mut() {
            level.clear();
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((base, level)) = name.to_str().and_then(parse_file_name) {
                if level <= self.max_level && base < self.block_count {
                    self.index[level as usize].push(base);
                } else {
                    warn!("ignoring out-of-range block file {:?}", name);
                }
            }
        }
        for level in self.index.iter_mut() {
            level.sort_unstable();
        }
        Ok(())
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn level_path(&self, base: u64, level: u32) -> PathBuf {
        self.dir.join(level_file_name(base, level))
    }

    fn rollback_dir(&self) -> PathBuf {
        self.dir.join("rollback")
    }

    fn has_level_entry(&self, base: u64, level: u32) -> bool {
        self.index[level as usize].binary_search(&base).is_ok()
    }

    /// Lowest-level file covering the block wins; untouched blocks read
    /// as zeros.
    pub fn read_block(&self, lba: u64) -> Result<Vec<u8>, EmuError> {
        debug_assert!(lba < self.block_count);
        for level in 0..=self.max_level {
            let base = lba & !(span(level) - 1);
            if self.has_level_entry(base, level) {
                let mut file = fs::File::open(self.level_path(base, level))?;
                file.seek(SeekFrom::Start((lba - base) * BLOCK_SIZE as u64))?;
                let mut block = vec![0; BLOCK_SIZE];
                file.read_exact(&mut block)?;
                return Ok(block);
            }
        }
        Ok(vec![0; BLOCK_SIZE])
    }

    pub fn write_block(&mut self, lba: u64, data: &[u8]) -> Result<(), EmuError> {
        debug_assert!(lba < self.block_count);
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.stage_rollback(lba)?;
        replace_file(&self.level_path(lba, 0), data)?;
        if let Err(at) = self.index[0].binary_search(&lba) {
            self.index[0].insert(at, lba);
        }
        Ok(())
    }

    /// Keep the preimage of the first write to each block per checkpoint
    /// epoch. If the preimage cannot be secured the write is refused.
    fn stage_rollback(&mut self, lba: u64) -> Result<(), EmuError> {
        let dir = self.rollback_dir();
        let pre = dir.join(format!("{:08x}.pre", lba));
        if pre.exists() {
            return Ok(());
        }
        fs::create_dir_all(&dir)?;
        let current = self.read_block(lba)?;
        replace_file(&pre, &current)
    }

    /// Merge up to `max_merges` groups of sixteen aligned same-level
    /// files into their parent. Either generation of a crashed merge is
    /// consistent: children win while they exist because lower levels
    /// probe first.
    pub fn tick(&mut self, max_merges: usize) -> Result<usize, EmuError> {
        let mut merges = 0;
        for level in 0..self.max_level {
            if merges >= max_merges {
                break;
            }
            let mut candidates = Vec::new();
            for &base in &self.index[level as usize] {
                let parent_base = base & !(span(level + 1) - 1);
                if base != parent_base || self.has_level_entry(parent_base, level + 1) {
                    continue;
                }
                let complete = (0..16).all(|j| self.has_level_entry(parent_base + j * span(level), level));
                if complete {
                    candidates.push(parent_base);
                    if candidates.len() + merges >= max_merges {
                        break;
                    }
                }
            }
            for parent_base in candidates {
                self.merge(parent_base, level)?;
                merges += 1;
            }
        }
        Ok(merges)
    }

    fn merge(&mut self, parent_base: u64, child_level: u32) -> Result<(), EmuError> {
        debug!("merging 16 level-{} files at {:08x}", child_level, parent_base);
        let child_span = span(child_level);
        let mut content = Vec::with_capacity((span(child_level + 1) * BLOCK_SIZE as u64) as usize);
        for j in 0..16 {
            let base = parent_base + j * child_span;
            let mut file = fs::File::open(self.level_path(base, child_level))?;
            file.read_to_end(&mut content)?;
        }
        replace_file(&self.level_path(parent_base, child_level + 1), &content)?;
        if let Err(at) = self.index[child_level as usize + 1].binary_search(&parent_base) {
            self.index[child_level as usize + 1].insert(at, parent_base);
        }
        for j in 0..16 {
            let base = parent_base + j * child_span;
            fs::remove_file(self.level_path(base, child_level))?;
            if let Ok(at) = self.index[child_level as usize].binary_search(&base) {
                self.index[child_level as usize].remove(at);
            }
        }
        Ok(())
    }

    /// The current disk state becomes the new baseline: drop every
    /// preimage.
    pub fn commit_checkpoint(&mut self) -> Result<(), EmuError> {
        let dir = self.rollback_dir();
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().map_or(false, |e| e == "pre") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Rewind every block modified since the last commit. Runs on open so
    /// a crash between commit and cleanup self-heals.
    pub fn apply_rollback(&mut self) -> Result<(), EmuError> {
        let dir = self.rollback_dir();
        if !dir.exists() {
            return Ok(());
        }
        let mut restored = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let lba = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            {
                Some(lba) if path.extension().map_or(false, |e| e == "pre") => lba,
                _ => continue,
            };
            let content = fs::read(&path)?;
            if content.len() == BLOCK_SIZE && lba < self.block_count {
                replace_file(&self.level_path(lba, 0), &content)?;
                if let Err(at) = self.index[0].binary_search(&lba) {
                    self.index[0].insert(at, lba);
                }
                restored += 1;
            } else {
                warn!("ignoring malformed rollback preimage {:?}", path);
            }
            fs::remove_file(&path)?;
        }
        if restored > 0 {
            debug!("rolled back {} blocks in {}", restored, self.dir.display());
        }
        Ok(())
    }

    /// Stream every block, in order, to the sink.
    pub fn save_state(&self, mut sink: impl FnMut(&[u8])) -> Result<(), EmuError> {
        for lba in 0..self.block_count {
            sink(&self.read_block(lba)?);
        }
        Ok(())
    }

    /// Replace the whole store from a block stream, rebuilding dense
    /// regions as the largest aligned level files and skipping zero runs.
    pub fn load_state(
        &mut self,
        mut source: impl FnMut() -> Vec<u8>,
    ) -> Result<(), EmuError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_str().and_then(parse_file_name).is_some() {
                fs::remove_file(entry.path())?;
            }
        }
        for level in self.index.iter_mut() {
            level.clear();
        }
        let mut data = Vec::with_capacity((self.block_count * BLOCK_SIZE as u64) as usize);
        for _ in 0..self.block_count {
            let block = source();
            debug_assert_eq!(block.len(), BLOCK_SIZE);
            data.extend_from_slice(&block);
        }
        let mut lba = 0u64;
        while lba < self.block_count {
            let mut level = 0;
            while level < self.max_level
                && lba % span(level + 1) == 0
                && lba + span(level + 1) <= self.block_count
            {
                level += 1;
            }
            let length = span(level);
            let bytes =
                &data[(lba * BLOCK_SIZE as u64) as usize..((lba + length) * BLOCK_SIZE as u64) as usize];
            if bytes.iter().any(|&b| b != 0) {
                replace_file(&self.level_path(lba, level), bytes)?;
                if let Err(at) = self.index[level as usize].binary_search(&lba) {
                    self.index[level as usize].insert(at, lba);
                }
            }
            lba += length;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    fn block_of(tag: u8) -> Vec<u8> {
        let mut b = vec![0u8; BLOCK_SIZE];
        b[0] = tag;
        b[BLOCK_SIZE - 1] = tag ^ 0xff;
        b
    }

    #[test]
    fn file_name_round_trip() {
        assert_eq!(level_file_name(0xabc, 0), "00000abc.dat");
        assert_eq!(level_file_name(0x120, 1), "0000012X.dat");
        assert_eq!(level_file_name(0x100, 2), "000001XX.dat");
        assert_eq!(parse_file_name("00000abc.dat"), Some((0xabc, 0)));
        assert_eq!(parse_file_name("0000012X.dat"), Some((0x120, 1)));
        assert_eq!(parse_file_name("meta.json"), None);
        assert_eq!(parse_file_name("0000012.dat"), None);
        assert_eq!(parse_file_name("0000zzzz.dat"), None);
    }

    #[test]
    fn read_your_writes_random() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 4096).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut shadow: HashMap<u64, u8> = HashMap::new();
        for _ in 0..300 {
            let lba = rng.gen_range(0..4096);
            let tag: u8 = rng.gen();
            store.write_block(lba, &block_of(tag)).unwrap();
            shadow.insert(lba, tag);
        }
        for (lba, tag) in &shadow {
            assert_eq!(store.read_block(*lba).unwrap(), block_of(*tag));
        }
        // A block never written reads as zeros even between written ones.
        let untouched = (0..4096).find(|lba| !shadow.contains_key(lba)).unwrap();
        assert_eq!(store.read_block(untouched).unwrap(), vec![0; BLOCK_SIZE]);
    }

    #[test]
    fn consolidation_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 512).unwrap();
        for lba in 0..48 {
            store.write_block(lba, &block_of(lba as u8)).unwrap();
        }
        store.commit_checkpoint().unwrap();
        let mut total = 0;
        loop {
            let merged = store.tick(4).unwrap();
            if merged == 0 {
                break;
            }
            total += merged;
        }
        assert!(total >= 3, "expected at least three level-1 merges, got {}", total);
        for lba in 0..48 {
            assert_eq!(store.read_block(lba).unwrap(), block_of(lba as u8));
        }
        assert_eq!(store.read_block(100).unwrap(), vec![0; BLOCK_SIZE]);
        // Reopen rebuilds the index from the directory alone.
        drop(store);
        let store = BlockStore::open(dir.path(), 512).unwrap();
        for lba in 0..48 {
            assert_eq!(store.read_block(lba).unwrap(), block_of(lba as u8));
        }
    }

    #[test]
    fn rollback_restores_preimages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 64).unwrap();
        store.write_block(5, &block_of(1)).unwrap();
        store.commit_checkpoint().unwrap();
        store.write_block(5, &block_of(2)).unwrap();
        store.write_block(9, &block_of(3)).unwrap();
        store.apply_rollback().unwrap();
        assert_eq!(store.read_block(5).unwrap(), block_of(1));
        assert_eq!(store.read_block(9).unwrap(), vec![0; BLOCK_SIZE]);
    }

    #[test]
    fn rollback_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), 64).unwrap();
            store.write_block(7, &block_of(0x11)).unwrap();
            store.commit_checkpoint().unwrap();
            store.write_block(7, &block_of(0x22)).unwrap();
            // Simulated crash: no commit.
        }
        let store = BlockStore::open(dir.path(), 64).unwrap();
        assert_eq!(store.read_block(7).unwrap(), block_of(0x11));
    }

    #[test]
    fn meta_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        BlockStore::open(dir.path(), 64).unwrap();
        assert!(BlockStore::open(dir.path(), 128).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 300).unwrap();
        for lba in [0u64, 17, 255, 299] {
            store.write_block(lba, &block_of(lba as u8)).unwrap();
        }
        let mut streamed = Vec::new();
        store.save_state(|b| streamed.extend_from_slice(b)).unwrap();
        assert_eq!(streamed.len(), 300 * BLOCK_SIZE);

        let dir2 = tempfile::tempdir().unwrap();
        let mut copy = BlockStore::open(dir2.path(), 300).unwrap();
        let mut cursor = 0;
        copy.load_state(|| {
            let b = streamed[cursor..cursor + BLOCK_SIZE].to_vec();
            cursor += BLOCK_SIZE;
            b
        })
        .unwrap();
        for lba in [0u64, 17, 255, 299] {
            assert_eq!(copy.read_block(lba).unwrap(), block_of(lba as u8));
        }
        assert_eq!(copy.read_block(100).unwrap(), vec![0; BLOCK_SIZE]);
    }
}
