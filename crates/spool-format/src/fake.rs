use chrono::{Datelike, TimeZone, Timelike, Utc};

use crate::{
    FILL_PATTERN, crc12_mark4,
    header::{MK5B_SYNCWORD, TrackFormat},
};

const MK4_TRACK_FRAME_WORDS: usize = 2500 / 4;
const MK5B_FRAME_WORDS: usize = 2504;

/// A synthesised, header-valid frame of the current format, kept around by
/// the faker and re-stamped with the wall clock whenever the real source
/// goes quiet. The payload is fill pattern; only the headers are real.
pub struct FakeFrame {
    format: TrackFormat,
    ntrack: u32,
    buffer: Vec<u8>,
}

impl FakeFrame {
    pub fn new(format: TrackFormat, ntrack: u32) -> Option<Self> {
        let mut f = match format {
            TrackFormat::Mark4 => FakeFrame {
                format,
                ntrack,
                buffer: vec![0u8; ntrack as usize * 2500],
            },
            TrackFormat::Mark5B => FakeFrame {
                format,
                ntrack,
                // sixteen frames per go, the way a disk frame transfer
                // would deliver them
                buffer: vec![0u8; 16 * MK5B_FRAME_WORDS * 4],
            },
            _ => return None,
        };
        f.init();
        Some(f)
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn init(&mut self) {
        match self.format {
            TrackFormat::Mark4 => self.init_mk4(),
            TrackFormat::Mark5B => self.init_mk5b(),
            _ => {}
        }
    }

    /// Re-stamp the header time fields for `clock` (UNIX seconds).
    pub fn update(&mut self, clock: i64) {
        match self.format {
            TrackFormat::Mark4 => mk4_encode_time(&mut self.buffer, self.ntrack, clock),
            TrackFormat::Mark5B => self.update_mk5b(clock),
            _ => {}
        }
    }

    fn init_mk4(&mut self) {
        let n = self.ntrack as usize;
        // track-header bytes 8..12 are the all-ones syncword; data words
        // after the 20-byte header area are fill pattern
        for w in 0..MK4_TRACK_FRAME_WORDS {
            let word: u32 = match w {
                0..=1 => 0,
                2 => 0xffff_ffff,
                3..=4 => 0,
                _ => 0x1122_3344,
            };
            for t in 0..n {
                let idx = (w * n + t) * 4;
                self.buffer[idx..idx + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
    }

    fn init_mk5b(&mut self) {
        for i in 0..16 {
            let base = i * MK5B_FRAME_WORDS * 4;
            self.buffer[base..base + 4].copy_from_slice(&MK5B_SYNCWORD);
            self.buffer[base + 4..base + 8].copy_from_slice(&(i as u32).to_le_bytes());
            self.buffer[base + 8..base + 16].fill(0);
            for w in 4..MK5B_FRAME_WORDS {
                let idx = base + w * 4;
                self.buffer[idx..idx + 4]
                    .copy_from_slice(&(FILL_PATTERN as u32).to_le_bytes());
            }
        }
    }

    fn update_mk5b(&mut self, clock: i64) {
        let mjd = 40587 + clock.div_euclid(86_400);
        let sec = clock.rem_euclid(86_400);

        let mut word: u32 = 0;
        word |= ((sec / 1) % 10) as u32;
        word |= (((sec / 10) % 10) as u32) << 4;
        word |= (((sec / 100) % 10) as u32) << 8;
        word |= (((sec / 1_000) % 10) as u32) << 12;
        word |= (((sec / 10_000) % 10) as u32) << 16;
        word |= (((mjd / 1) % 10) as u32) << 20;
        word |= (((mjd / 10) % 10) as u32) << 24;
        word |= (((mjd / 100) % 10) as u32) << 28;

        for i in 0..16 {
            let idx = i * MK5B_FRAME_WORDS * 4 + 8;
            self.buffer[idx..idx + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Build the 20 Mark4 track-header bytes for `clock`, CRC included, and
/// spread them bit-interleaved over all tracks (every track gets the same
/// header, which is what a single-dish test signal looks like).
pub(crate) fn mk4_encode_time(frame: &mut [u8], ntrack: u32, clock: i64) {
    let dt = Utc.timestamp_opt(clock, 0).unwrap();
    let doy = dt.ordinal();
    let (h, m, s) = (dt.hour(), dt.minute(), dt.second());

    let mut hdr = [0u8; 20];
    hdr[8..12].fill(0xff);
    hdr[12] = ((((dt.year() as u32) % 10) << 4) | (doy / 100) % 10) as u8;
    hdr[13] = ((((doy / 10) % 10) << 4) | doy % 10) as u8;
    hdr[14] = ((((h / 10) % 10) << 4) | h % 10) as u8;
    hdr[15] = ((((m / 10) % 10) << 4) | m % 10) as u8;
    hdr[16] = ((((s / 10) % 10) << 4) | s % 10) as u8;
    let crc = crc12_mark4(&hdr);
    hdr[18] = ((crc >> 8) & 0x0f) as u8;
    hdr[19] = (crc & 0xff) as u8;

    // bit j of header byte i lands in the ntrack-wide word i*8+j,
    // replicated across every track
    let n = ntrack as usize;
    for (i, hb) in hdr.iter().enumerate().skip(12) {
        for j in 0..8 {
            let word_idx = i * 8 + j;
            let value: u64 = if hb & (1 << (7 - j)) != 0 { u64::MAX } else { 0 };
            let start = word_idx * n / 8;
            match n {
                8 => frame[start] = value as u8,
                16 => frame[start..start + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                32 => frame[start..start + 4].copy_from_slice(&(value as u32).to_le_bytes()),
                64 => frame[start..start + 8].copy_from_slice(&value.to_le_bytes()),
                _ => {}
            }
        }
    }
}
