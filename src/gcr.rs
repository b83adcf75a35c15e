// Group Code Recording for the Sony 3.5" drive: 6-and-2 nibblization with
// the carry-chained three-accumulator checksum, the zoned track geometry
// (five speed zones, 12 down to 8 sectors per track) and on-demand track
// synthesis from 512-byte logical blocks.

use log::warn;

/// User payload of one sector: 12 tag bytes followed by 512 data bytes.
pub const SECTOR_PAYLOAD: usize = 524;
/// On-wire GCR bytes encoding one sector payload, checksum excluded.
pub const GCR_DATA_LEN: usize = 699;

pub const TRACKS_PER_SIDE: usize = 80;
pub const ZONE_TRACKS: usize = 16;
pub const ZONE_SECTORS: [usize; 5] = [12, 11, 10, 9, 8];

/// Blocks on one side of a disk: 16 tracks per zone.
pub const BLOCKS_PER_SIDE: usize = 800;

/// Format byte: bit 5 flags a double-sided (2:1 interleaved) disk.
pub const FORMAT_2TO1_SINGLE: u8 = 0x02;
pub const FORMAT_2TO1_DOUBLE: u8 = 0x22;

/// The canonical 6-bit-to-disk-byte table; every entry has the MSB set.
pub const NIB_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9a, 0x9b, 0x9d, 0x9e, 0x9f, 0xa6, 0xa7, 0xab, 0xac, 0xad, 0xae, 0xaf, 0xb2, 0xb3,
    0xb4, 0xb5, 0xb6, 0xb7, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf, 0xcb, 0xcd, 0xce, 0xcf, 0xd3,
    0xd6, 0xd7, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde, 0xdf, 0xe5, 0xe6, 0xe7, 0xe9, 0xea, 0xeb, 0xec,
    0xed, 0xee, 0xef, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];

pub fn denib(byte: u8) -> Option<u8> {
    NIB_TABLE.iter().position(|&b| b == byte).map(|p| p as u8)
}

pub fn zone(track: usize) -> usize {
    track / ZONE_TRACKS
}

pub fn sectors_on_track(track: usize) -> usize {
    ZONE_SECTORS[zone(track)]
}

/// Blocks on one side before the given track.
pub fn blocks_before_track(track: usize) -> usize {
    let z = zone(track);
    let full: usize = ZONE_SECTORS[..z].iter().map(|s| s * ZONE_TRACKS).sum();
    full + (track % ZONE_TRACKS) * ZONE_SECTORS[z]
}

/// Logical block to (side, track, sector). Single-sided disks fill side 0
/// sequentially; double-sided disks interleave by cylinder, side 0 then
/// side 1 of each track.
pub fn block_to_chs(lba: usize, sides: usize) -> (usize, usize, usize) {
    if sides == 1 {
        let track = (0..TRACKS_PER_SIDE)
            .find(|&t| blocks_before_track(t) + sectors_on_track(t) > lba)
            .expect("block out of range");
        (0, track, lba - blocks_before_track(track))
    } else {
        let track = (0..TRACKS_PER_SIDE)
            .find(|&t| 2 * (blocks_before_track(t) + sectors_on_track(t)) > lba)
            .expect("block out of range");
        let within = lba - 2 * blocks_before_track(track);
        let spt = sectors_on_track(track);
        (within / spt, track, within % spt)
    }
}

pub fn chs_to_block(side: usize, track: usize, sector: usize, sides: usize) -> usize {
    if sides == 1 {
        blocks_before_track(track) + sector
    } else {
        2 * blocks_before_track(track) + side * sectors_on_track(track) + sector
    }
}

/// Physical sector order for a 2:1 interleave: logical sectors land two
/// slots apart, skipping occupied slots.
pub fn interleave_order(nsectors: usize) -> Vec<usize> {
    let mut slots = vec![usize::MAX; nsectors];
    let mut pos = 0;
    for sector in 0..nsectors {
        while slots[pos] != usize::MAX {
            pos = (pos + 1) % nsectors;
        }
        slots[pos] = sector;
        pos = (pos + 2) % nsectors;
    }
    slots
}

/// Nibblize a 524-byte payload: returns the 699 six-bit values plus the
/// four six-bit checksum values (pre-table, 0..=63 each).
pub fn nibblize(payload: &[u8; SECTOR_PAYLOAD]) -> ([u8; GCR_DATA_LEN], [u8; 4]) {
    let mut b1 = [0u8; 175];
    let mut b2 = [0u8; 175];
    let mut b3 = [0u8; 175];
    let (mut c1, mut c2, mut c3): (u32, u32, u32) = (0, 0, 0);
    let mut i = 0;
    let mut j = 0;
    loop {
        c1 = (c1 & 0xff) << 1;
        if c1 & 0x100 != 0 {
            c1 += 1;
        }
        let val = payload[i] as u32;
        i += 1;
        c3 += val;
        if c1 & 0x100 != 0 {
            c3 += 1;
            c1 &= 0xff;
        }
        b1[j] = (val ^ c1) as u8;

        let val = payload[i] as u32;
        i += 1;
        c2 += val;
        if c3 > 0xff {
            c2 += 1;
            c3 &= 0xff;
        }
        b2[j] = (val ^ c3) as u8;

        if i == SECTOR_PAYLOAD {
            break;
        }
        let val = payload[i] as u32;
        i += 1;
        c1 += val;
        if c2 > 0xff {
            c1 += 1;
            c2 &= 0xff;
        }
        b3[j] = (val ^ c2) as u8;
        j += 1;
    }
    let c4 = ((c1 & 0xc0) >> 6) | ((c2 & 0xc0) >> 4) | ((c3 & 0xc0) >> 2);
    b3[174] = 0;

    let mut out = [0u8; GCR_DATA_LEN];
    let mut k = 0;
    for idx in 0..175 {
        let w4 = ((b1[idx] & 0xc0) >> 2) | ((b2[idx] & 0xc0) >> 4) | ((b3[idx] & 0xc0) >> 6);
        out[k] = w4;
        out[k + 1] = b1[idx] & 0x3f;
        out[k + 2] = b2[idx] & 0x3f;
        k += 3;
        if idx != 174 {
            out[k] = b3[idx] & 0x3f;
            k += 1;
        }
    }
    (out, [(c1 & 0x3f) as u8, (c2 & 0x3f) as u8, (c3 & 0x3f) as u8, c4 as u8])
}

/// Inverse of `nibblize`. Returns the payload when the checksum holds.
pub fn denibblize(nibbles: &[u8; GCR_DATA_LEN], checksum: &[u8; 4]) -> Option<[u8; SECTOR_PAYLOAD]> {
    let mut b1 = [0u8; 175];
    let mut b2 = [0u8; 175];
    let mut b3 = [0u8; 175];
    let mut k = 0;
    for idx in 0..175 {
        let w4 = nibbles[k];
        b1[idx] = nibbles[k + 1] | ((w4 << 2) & 0xc0);
        b2[idx] = nibbles[k + 2] | ((w4 << 4) & 0xc0);
        k += 3;
        if idx != 174 {
            b3[idx] = nibbles[k] | ((w4 << 6) & 0xc0);
            k += 1;
        }
    }
    let mut payload = [0u8; SECTOR_PAYLOAD];
    let (mut c1, mut c2, mut c3): (u32, u32, u32) = (0, 0, 0);
    let mut i = 0;
    let mut j = 0;
    loop {
        c1 = (c1 & 0xff) << 1;
        if c1 & 0x100 != 0 {
            c1 += 1;
        }
        let carry1 = c1 & 0x100 != 0;
        if carry1 {
            c1 &= 0xff;
        }
        let val = b1[j] ^ c1 as u8;
        c3 += val as u32 + carry1 as u32;
        payload[i] = val;
        i += 1;

        let carry3 = c3 > 0xff;
        if carry3 {
            c3 &= 0xff;
        }
        let val = b2[j] ^ c3 as u8;
        c2 += val as u32 + carry3 as u32;
        payload[i] = val;
        i += 1;

        if i == SECTOR_PAYLOAD {
            break;
        }
        let carry2 = c2 > 0xff;
        if carry2 {
            c2 &= 0xff;
        }
        let val = b3[j] ^ c2 as u8;
        c1 += val as u32 + carry2 as u32;
        payload[i] = val;
        i += 1;
        j += 1;
    }
    let c4 = ((c1 & 0xc0) >> 6) | ((c2 & 0xc0) >> 4) | ((c3 & 0xc0) >> 2);
    let ok = checksum[0] == (c1 & 0x3f) as u8
        && checksum[1] == (c2 & 0x3f) as u8
        && checksum[2] == (c3 & 0x3f) as u8
        && checksum[3] == c4 as u8;
    if ok {
        Some(payload)
    } else {
        warn!("GCR data checksum mismatch");
        None
    }
}

pub const HEADER_PROLOGUE: [u8; 3] = [0xd5, 0xaa, 0x96];
pub const DATA_PROLOGUE: [u8; 3] = [0xd5, 0xaa, 0xad];
pub const EPILOGUE: [u8; 2] = [0xde, 0xaa];

const HEADER_SYNC: usize = 6;
const DATA_SYNC: usize = 5;

fn push_sync(out: &mut Vec<u8>, count: usize) {
    out.extend(std::iter::repeat(0xff).take(count));
}

/// Append one encoded sector (address field + data field) to a track
/// image. The payload is tag bytes plus user data.
pub fn encode_sector(
    out: &mut Vec<u8>,
    track: usize,
    side: usize,
    sector: usize,
    format: u8,
    payload: &[u8; SECTOR_PAYLOAD],
) {
    let t = (track & 0x3f) as u8;
    let s = sector as u8;
    let side_bits = ((side as u8) << 5) | ((track >> 6) as u8);
    push_sync(out, HEADER_SYNC);
    out.extend_from_slice(&HEADER_PROLOGUE);
    out.push(NIB_TABLE[t as usize & 0x3f]);
    out.push(NIB_TABLE[s as usize & 0x3f]);
    out.push(NIB_TABLE[side_bits as usize & 0x3f]);
    out.push(NIB_TABLE[format as usize & 0x3f]);
    out.push(NIB_TABLE[(t ^ s ^ side_bits ^ format) as usize & 0x3f]);
    out.extend_from_slice(&EPILOGUE);
    out.push(0xff);
    push_sync(out, DATA_SYNC);
    out.extend_from_slice(&DATA_PROLOGUE);
    out.push(NIB_TABLE[sector & 0x3f]);
    let (nibbles, checksum) = nibblize(payload);
    out.extend(nibbles.iter().map(|&n| NIB_TABLE[n as usize]));
    out.extend(checksum.iter().map(|&n| NIB_TABLE[n as usize]));
    out.extend_from_slice(&EPILOGUE);
    out.push(0xff);
}

/// Synthesize a whole track in physical (interleaved) sector order from a
/// payload provider.
pub fn encode_track(
    track: usize,
    side: usize,
    format: u8,
    mut payload_for: impl FnMut(usize) -> [u8; SECTOR_PAYLOAD],
) -> Vec<u8> {
    let nsectors = sectors_on_track(track);
    let mut out = Vec::with_capacity(nsectors * 800);
    for &sector in &interleave_order(nsectors) {
        encode_sector(&mut out, track, side, sector, format, &payload_for(sector));
    }
    out
}

pub struct DecodedSector {
    pub track: usize,
    pub side: usize,
    pub sector: usize,
    pub payload: [u8; SECTOR_PAYLOAD],
}

/// Scan a track image for address marks and decode every complete sector.
/// Sectors with bad checksums or unknown disk bytes are skipped.
pub fn decode_track(data: &[u8]) -> Vec<DecodedSector> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i..i + 3] != HEADER_PROLOGUE {
            i += 1;
            continue;
        }
        i += 3;
        if i + 5 > data.len() {
            break;
        }
        let fields: Vec<Option<u8>> = data[i..i + 5].iter().map(|&b| denib(b)).collect();
        i += 5;
        let (t, s, side_bits, format, check) = match fields.as_slice() {
            [Some(a), Some(b), Some(c), Some(d), Some(e)] => (*a, *b, *c, *d, *e),
            _ => continue,
        };
        if t ^ s ^ side_bits ^ format != check {
            warn!("GCR header checksum mismatch");
            continue;
        }
        // Find the matching data field.
        let mut j = i;
        let mut found = None;
        while j + 3 <= data.len() && j < i + 64 {
            if data[j..j + 3] == DATA_PROLOGUE {
                found = Some(j + 3);
                break;
            }
            j += 1;
        }
        let Some(mut p) = found else { continue };
        if p + 1 + GCR_DATA_LEN + 4 > data.len() {
            break;
        }
        let data_sector = denib(data[p]);
        p += 1;
        if data_sector != Some(s) {
            continue;
        }
        let mut nibbles = [0u8; GCR_DATA_LEN];
        let mut bad = false;
        for (k, slot) in nibbles.iter_mut().enumerate() {
            match denib(data[p + k]) {
                Some(v) => *slot = v,
                None => {
                    bad = true;
                    break;
                }
            }
        }
        if bad {
            continue;
        }
        p += GCR_DATA_LEN;
        let mut checksum = [0u8; 4];
        for (k, slot) in checksum.iter_mut().enumerate() {
            match denib(data[p + k]) {
                Some(v) => *slot = v,
                None => {
                    bad = true;
                    break;
                }
            }
        }
        if bad {
            continue;
        }
        p += 4;
        if let Some(payload) = denibblize(&nibbles, &checksum) {
            out.push(DecodedSector {
                track: (t as usize) | (((side_bits & 0x01) as usize) << 6),
                side: (side_bits >> 5) as usize & 1,
                sector: s as usize,
                payload,
            });
        }
        i = p;
    }
    out
}
