use strum::{Display, EnumString};
use thiserror::Error;

pub const MK5B_SYNCWORD: [u8; 4] = 0xabad_deedu32.to_le_bytes();
const MK5B_FRAME_WORDS: usize = 2504;
pub const MK5B_FRAMESIZE: usize = MK5B_FRAME_WORDS * 4;
pub const MK5B_PAYLOAD: usize = MK5B_FRAMESIZE - 16;

/// Mark4: one track frame is 2500 bytes; a frame interleaves `ntrack`
/// tracks. Track header is 20 bytes, of which bytes 8..12 are the all-ones
/// syncword.
const MK4_TRACK_FRAME: usize = 2500;
const MK4_TRACK_HEADER: usize = 20;
const MK4_TRACK_SYNC_OFF: usize = 8;
const MK4_TRACK_SYNC_LEN: usize = 4;

// 4 sync bytes per track, widest mode is 64 tracks
static MK4_SYNC_BYTES: [u8; 64 * MK4_TRACK_SYNC_LEN] = [0xff; 64 * MK4_TRACK_SYNC_LEN];

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("format '{0}' cannot be framed")]
    NotFramable(TrackFormat),
    #[error("unsupported track count {0} for {1}")]
    BadTrackCount(u32, TrackFormat),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TrackFormat {
    #[default]
    None,
    Mark4,
    Mark5B,
    Vdif,
}

impl TrackFormat {
    pub fn is_vdif(self) -> bool {
        matches!(self, TrackFormat::Vdif)
    }
}

/// Data timestamp decoded from a frame header: UNIX seconds plus the
/// in-second offset in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameTime {
    pub sec: i64,
    pub ns: u32,
}

/// Everything the framer, fill generator and time decoders need to know
/// about one track format at one mode setting: where the syncword lives,
/// how big a frame is, and how to get a timestamp out of (or into) a
/// header. The tables behind it are fixed per format; the instance is just
/// the (format, ntrack, trackbitrate) binding.
#[derive(Clone, Copy, Debug)]
pub struct HeaderSearch {
    pub format: TrackFormat,
    pub ntrack: u32,
    /// bits per second per track
    pub trackbitrate: u64,
    pub framesize: usize,
    pub headersize: usize,
    pub syncword: &'static [u8],
    pub syncword_offset: usize,
}

impl HeaderSearch {
    pub fn new(format: TrackFormat, ntrack: u32, trackbitrate: u64) -> Result<Self, FormatError> {
        match format {
            TrackFormat::Mark4 => {
                if !matches!(ntrack, 8 | 16 | 32 | 64) {
                    return Err(FormatError::BadTrackCount(ntrack, format));
                }
                let n = ntrack as usize;
                // 32 sync bits per track, interleaved: 4*ntrack bytes of 0xff
                let sync_len = n * MK4_TRACK_SYNC_LEN;
                Ok(HeaderSearch {
                    format,
                    ntrack,
                    trackbitrate,
                    framesize: n * MK4_TRACK_FRAME,
                    headersize: n * MK4_TRACK_HEADER,
                    syncword: &MK4_SYNC_BYTES[..sync_len],
                    syncword_offset: n * MK4_TRACK_SYNC_OFF,
                })
            }
            TrackFormat::Mark5B => Ok(HeaderSearch {
                format,
                ntrack,
                trackbitrate,
                framesize: MK5B_FRAMESIZE,
                headersize: 16,
                syncword: &MK5B_SYNCWORD,
                syncword_offset: 0,
            }),
            TrackFormat::None | TrackFormat::Vdif => Err(FormatError::NotFramable(format)),
        }
    }

    /// Bytes from frame start up to and including the syncword; the framer
    /// must cache at least this much before it can recognise a frame.
    #[inline]
    pub fn syncword_area(&self) -> usize {
        self.syncword_offset + self.syncword.len()
    }

    /// Aggregate payload data rate in bytes per second.
    pub fn byterate(&self) -> u64 {
        self.ntrack as u64 * self.trackbitrate / 8
    }

    /// Mark5B frames per second for the current mode; the frame-number
    /// field wraps there.
    pub fn frames_per_sec(&self) -> u64 {
        match self.format {
            TrackFormat::Mark5B => (self.byterate() / MK5B_PAYLOAD as u64).max(1),
            _ => {
                let bits = self.framesize as u64 * 8;
                (self.ntrack as u64 * self.trackbitrate / bits).max(1)
            }
        }
    }

    /// Write the syncword (and for Mark5B, the frame-number word) into a
    /// frame-sized buffer. Used by the framed fill generator.
    pub fn stamp_header(&self, frame: &mut [u8], frame_idx: u64) {
        let off = self.syncword_offset;
        frame[off..off + self.syncword.len()].copy_from_slice(self.syncword);
        if self.format == TrackFormat::Mark5B {
            let frameno = (frame_idx % 0x8000) as u32;
            frame[4..8].copy_from_slice(&frameno.to_le_bytes());
            frame[8..12].fill(0);
            frame[12..16].fill(0);
        }
    }

    /// Decode the data timestamp of a frame. Both Mark4 (day-of-year) and
    /// Mark5B (truncated MJD) carry ambiguous dates; `ref_sec` anchors the
    /// decode to the era the data was taken in.
    pub fn timestamp(&self, frame: &[u8], ref_sec: i64) -> FrameTime {
        match self.format {
            TrackFormat::Mark5B => mk5b_timestamp(frame, ref_sec, self.frames_per_sec()),
            TrackFormat::Mark4 => mk4_timestamp(frame, self.ntrack, ref_sec),
            _ => FrameTime::default(),
        }
    }

    /// Encode `time` into the header of a frame-sized buffer (faker,
    /// tests). Inverse of [`timestamp`](Self::timestamp) to header
    /// resolution.
    pub fn encode_time(&self, frame: &mut [u8], time: FrameTime) {
        match self.format {
            TrackFormat::Mark5B => mk5b_encode_time(frame, time, self.frames_per_sec()),
            TrackFormat::Mark4 => crate::fake::mk4_encode_time(frame, self.ntrack, time.sec),
            _ => {}
        }
    }
}

fn bcd(value: u32, digit: u32) -> u32 {
    (value >> (4 * digit)) & 0xf
}

/// Mark5B word 2: BCD `JJJSSSSS` - 3 digits truncated MJD, 5 digits
/// second-of-day. Word 1 low 15 bits: frame number within the second.
fn mk5b_timestamp(frame: &[u8], ref_sec: i64, frames_per_sec: u64) -> FrameTime {
    let w1 = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    let w2 = u32::from_le_bytes(frame[8..12].try_into().unwrap());

    let tmjd = (bcd(w2, 7) * 100 + bcd(w2, 6) * 10 + bcd(w2, 5)) as i64;
    let sod = (bcd(w2, 4) * 10_000
        + bcd(w2, 3) * 1_000
        + bcd(w2, 2) * 100
        + bcd(w2, 1) * 10
        + bcd(w2, 0)) as i64;

    // resolve the truncated MJD against the reference era
    let ref_mjd = 40587 + ref_sec / 86_400;
    let mut mjd = ref_mjd - ref_mjd % 1000 + tmjd;
    if mjd > ref_mjd + 500 {
        mjd -= 1000;
    } else if mjd < ref_mjd - 500 {
        mjd += 1000;
    }

    let frameno = (w1 & 0x7fff) as u64 % frames_per_sec.max(1);
    let ns = (frameno * 1_000_000_000 / frames_per_sec.max(1)) as u32;
    FrameTime { sec: (mjd - 40587) * 86_400 + sod, ns }
}

fn mk5b_encode_time(frame: &mut [u8], time: FrameTime, frames_per_sec: u64) {
    let mjd = (40587 + time.sec.div_euclid(86_400)) % 1000;
    let sod = time.sec.rem_euclid(86_400);

    let mut w2: u32 = 0;
    w2 |= ((sod / 1) % 10) as u32;
    w2 |= (((sod / 10) % 10) as u32) << 4;
    w2 |= (((sod / 100) % 10) as u32) << 8;
    w2 |= (((sod / 1_000) % 10) as u32) << 12;
    w2 |= (((sod / 10_000) % 10) as u32) << 16;
    w2 |= (((mjd / 1) % 10) as u32) << 20;
    w2 |= (((mjd / 10) % 10) as u32) << 24;
    w2 |= (((mjd / 100) % 10) as u32) << 28;

    let frameno = (time.ns as u64 * frames_per_sec / 1_000_000_000) as u32 & 0x7fff;
    frame[4..8].copy_from_slice(&frameno.to_le_bytes());
    frame[8..12].copy_from_slice(&w2.to_le_bytes());
}

/// Mark4 header time lives in BCD track-header bytes 12..18 (year digit,
/// day-of-year, hour, minute, second). Tracks are bit-interleaved across
/// the frame: bit `j` of track-header byte `i` occupies the `ntrack`-bit
/// word at index `i*8 + j`, so sampling the lowest track's bit of each word
/// reconstructs the header bytes.
fn mk4_header_byte(frame: &[u8], ntrack: u32, byte_idx: usize) -> u8 {
    let mut out = 0u8;
    for j in 0..8 {
        let word_idx = byte_idx * 8 + j;
        let bit_pos = word_idx * ntrack as usize;
        let bit = (frame[bit_pos / 8] >> (bit_pos % 8)) & 1;
        out |= bit << (7 - j);
    }
    out
}

fn mk4_timestamp(frame: &[u8], ntrack: u32, ref_sec: i64) -> FrameTime {
    use chrono::{Datelike, TimeZone, Utc};

    let b: Vec<u8> = (12..17).map(|i| mk4_header_byte(frame, ntrack, i)).collect();
    let doy = ((b[0] & 0xf) as u32) * 100 + ((b[1] >> 4) as u32) * 10 + (b[1] & 0xf) as u32;
    let hour = ((b[2] >> 4) as u32) * 10 + (b[2] & 0xf) as u32;
    let min = ((b[3] >> 4) as u32) * 10 + (b[3] & 0xf) as u32;
    let sec = ((b[4] >> 4) as u32) * 10 + (b[4] & 0xf) as u32;

    // year digit is the last decimal of the year; resolve against ref era
    let ydigit = (b[0] >> 4) as i32;
    let ref_year = Utc.timestamp_opt(ref_sec, 0).unwrap().year();
    let mut year = ref_year - ref_year % 10 + ydigit;
    if year > ref_year + 5 {
        year -= 10;
    } else if year < ref_year - 5 {
        year += 10;
    }

    let day0 = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap().timestamp();
    FrameTime {
        sec: day0 + (doy.saturating_sub(1)) as i64 * 86_400
            + hour as i64 * 3_600
            + min as i64 * 60
            + sec as i64,
        ns: 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mark5b_geometry() {
        let h = HeaderSearch::new(TrackFormat::Mark5B, 32, 32_000_000).unwrap();
        assert_eq!(h.framesize, 10_016);
        assert_eq!(h.syncword_offset, 0);
        assert_eq!(h.syncword, &MK5B_SYNCWORD);
        assert_eq!(h.syncword_area(), 4);
        assert_eq!(h.byterate(), 128_000_000);
    }

    #[test]
    fn mark4_geometry_scales_with_tracks() {
        let h = HeaderSearch::new(TrackFormat::Mark4, 8, 8_000_000).unwrap();
        assert_eq!(h.framesize, 20_000);
        assert_eq!(h.headersize, 160);
        assert_eq!(h.syncword_offset, 64);
        assert_eq!(h.syncword.len(), 32);

        assert!(HeaderSearch::new(TrackFormat::Mark4, 12, 8_000_000).is_err());
    }

    #[test]
    fn vdif_is_not_framable() {
        assert!(HeaderSearch::new(TrackFormat::Vdif, 1, 8_000_000).is_err());
    }

    #[test]
    fn mk5b_time_roundtrip() {
        let h = HeaderSearch::new(TrackFormat::Mark5B, 32, 32_000_000).unwrap();
        let mut frame = vec![0u8; h.framesize];
        h.stamp_header(&mut frame, 0);

        // 2020-06-15 12:34:56 UTC
        let t = FrameTime { sec: 1_592_224_496, ns: 0 };
        h.encode_time(&mut frame, t);
        let got = h.timestamp(&frame, t.sec - 86_400 * 30);
        assert_eq!(got.sec, t.sec);
        assert_eq!(got.ns, 0);
    }

    #[test]
    fn mk5b_frame_number_sets_subsecond() {
        let h = HeaderSearch::new(TrackFormat::Mark5B, 32, 32_000_000).unwrap();
        let fps = h.frames_per_sec();
        let mut frame = vec![0u8; h.framesize];
        h.stamp_header(&mut frame, 0);
        let t = FrameTime { sec: 1_592_224_496, ns: 500_000_000 };
        h.encode_time(&mut frame, t);
        let got = h.timestamp(&frame, t.sec);
        // quantised to a frame boundary
        let expect_frame = 500_000_000u64 * fps / 1_000_000_000;
        assert_eq!(got.ns as u64, expect_frame * 1_000_000_000 / fps);
    }

    #[test]
    fn trackformat_strings() {
        assert_eq!("mark5b".parse::<TrackFormat>().unwrap(), TrackFormat::Mark5B);
        assert_eq!(TrackFormat::Mark4.to_string(), "mark4");
        assert!("mark9z".parse::<TrackFormat>().is_err());
    }
}
