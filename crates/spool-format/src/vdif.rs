use chrono::{Datelike, TimeZone, Utc};

pub const VDIF_HEADER_SIZE: usize = 16;

/// VDIF v1.0 legacy header, 4 little-endian 32-bit words:
///
/// ```text
/// w0: invalid[31] legacy[30] epoch_seconds[29:0]
/// w1: ref_epoch[29:24] data_frame_num[23:0]
/// w2: version[31:29] log2nchans[28:24] data_frame_len8[23:0]
/// w3: complex[31] bits_per_sample[30:26] thread_id[25:16] station_id[15:0]
/// ```
///
/// `data_frame_len8` counts 8-byte units and includes the header itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VdifHeader {
    pub invalid: bool,
    pub epoch_seconds: u32,
    pub ref_epoch: u8,
    pub data_frame_num: u32,
    pub log2nchans: u8,
    pub data_frame_len8: u32,
    pub bits_per_sample: u8,
    pub thread_id: u16,
    pub station_id: u16,
}

impl VdifHeader {
    /// The "valid invalid" replacement header written over lost datagrams:
    /// only the frame length and the invalid bit carry information.
    pub fn invalid_marker(frame_len: usize) -> Self {
        VdifHeader {
            invalid: true,
            data_frame_len8: (frame_len / 8) as u32,
            ..Default::default()
        }
    }

    pub fn to_bytes(self) -> [u8; VDIF_HEADER_SIZE] {
        let w0: u32 = ((self.invalid as u32) << 31)
            | 1 << 30 // legacy, always: we never emit the extended words
            | (self.epoch_seconds & 0x3fff_ffff);
        let w1: u32 =
            ((self.ref_epoch as u32 & 0x3f) << 24) | (self.data_frame_num & 0x00ff_ffff);
        let w2: u32 =
            ((self.log2nchans as u32 & 0x1f) << 24) | (self.data_frame_len8 & 0x00ff_ffff);
        let w3: u32 = ((self.bits_per_sample as u32 & 0x1f) << 26)
            | ((self.thread_id as u32 & 0x3ff) << 16)
            | self.station_id as u32;

        let mut out = [0u8; VDIF_HEADER_SIZE];
        out[0..4].copy_from_slice(&w0.to_le_bytes());
        out[4..8].copy_from_slice(&w1.to_le_bytes());
        out[8..12].copy_from_slice(&w2.to_le_bytes());
        out[12..16].copy_from_slice(&w3.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let w0 = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let w2 = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let w3 = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        VdifHeader {
            invalid: w0 >> 31 == 1,
            epoch_seconds: w0 & 0x3fff_ffff,
            ref_epoch: ((w1 >> 24) & 0x3f) as u8,
            data_frame_num: w1 & 0x00ff_ffff,
            log2nchans: ((w2 >> 24) & 0x1f) as u8,
            data_frame_len8: w2 & 0x00ff_ffff,
            bits_per_sample: ((w3 >> 26) & 0x1f) as u8,
            thread_id: ((w3 >> 16) & 0x3ff) as u16,
            station_id: (w3 & 0xffff) as u16,
        }
    }

    pub fn is_legacy(buf: &[u8]) -> bool {
        buf.len() >= 4 && (u32::from_le_bytes(buf[0..4].try_into().unwrap()) >> 30) & 1 == 1
    }
}

/// VDIF reference epochs advance every half year starting 1 Jan 2000:
/// epoch `2k` is 1 Jan of year 2000+k, epoch `2k+1` the following 1 Jul.
/// Returns (epoch number, epoch start as UNIX seconds) for the half-year
/// containing `unix_sec`.
pub fn vdif_epoch(unix_sec: i64) -> (u8, i64) {
    let dt = Utc.timestamp_opt(unix_sec, 0).unwrap();
    let epoch = ((dt.year() - 2000) * 2 + i32::from(dt.month() >= 7)) as u8;
    let month = if dt.month() >= 7 { 7 } else { 1 };
    let start = Utc.with_ymd_and_hms(dt.year(), month, 1, 0, 0, 0).unwrap().timestamp();
    (epoch & 0x3f, start)
}
