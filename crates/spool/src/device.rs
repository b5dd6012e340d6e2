use std::{
    collections::HashMap,
    io,
    sync::{Mutex, MutexGuard},
};

use spool_stages::{DiskRead, FifoIo};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("pack is write-protected")]
    Protected,
    #[error("no such scan #{0}")]
    NoSuchScan(usize),
    #[error("bank {0:?} is empty")]
    EmptyBank(BankId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankId {
    A,
    B,
}

/// Disk-pack condition label kept with the recording, updated by the
/// transfer guard when a transfer runs to completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordState {
    #[default]
    Unknown,
    Recorded,
    Played,
}

/// One scan in the pack's directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan {
    pub name: String,
    pub start: u64,
    pub length: u64,
}

/// The full contract against the vendor storage device: streaming append
/// on the record path, random reads on the replay path, plus the
/// bank/erase/protect housekeeping the command set needs. How any of it is
/// laid out on the physical disks is the vendor's business.
pub trait BlockDevice: DiskRead + FifoIo {
    fn append(&self, data: &[u8]) -> Result<(), DeviceError>;
    fn erase(&self) -> Result<(), DeviceError>;
    fn set_protect(&self, on: bool);
    fn protected(&self) -> bool;
    fn select_bank(&self, bank: BankId) -> Result<(), DeviceError>;
    fn active_bank(&self) -> BankId;
    fn vsn(&self) -> String;
    fn set_vsn(&self, vsn: &str);
    fn scans(&self) -> Vec<Scan>;
    fn add_scan(&self, name: &str, start: u64, length: u64);
    fn record_state(&self) -> RecordState;
    fn set_record_state(&self, state: RecordState);
}

struct PackState {
    data: Vec<u8>,
    fifo: Vec<u8>,
    scans: Vec<Scan>,
    vsn: String,
    protect: bool,
    bank: BankId,
    record_state: RecordState,
}

/// RAM-backed stand-in for the vendor device: the generic host class runs
/// on it, and so does the whole test suite. The streaming FIFO is a plain
/// byte queue with a configurable capacity.
pub struct RamPack {
    state: Mutex<PackState>,
    fifo_capacity: u64,
}

impl RamPack {
    pub fn new(fifo_capacity: u64) -> Self {
        RamPack {
            state: Mutex::new(PackState {
                data: Vec::new(),
                fifo: Vec::new(),
                scans: Vec::new(),
                vsn: String::from("SPOOL-00"),
                protect: true,
                bank: BankId::A,
                record_state: RecordState::Unknown,
            }),
            fifo_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PackState> {
        self.state.lock().unwrap()
    }

    /// Test hook: preload recording bytes.
    pub fn preload(&self, data: &[u8]) {
        self.lock().data.extend_from_slice(data);
    }
}

impl Default for RamPack {
    fn default() -> Self {
        RamPack::new(512 * 1024 * 1024)
    }
}

impl DiskRead for RamPack {
    fn length(&self) -> u64 {
        self.lock().data.len() as u64
    }

    fn read_at(&self, at: u64, buf: &mut [u8]) -> io::Result<()> {
        let st = self.lock();
        let at = at as usize;
        if at + buf.len() > st.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past recording"));
        }
        buf.copy_from_slice(&st.data[at..at + buf.len()]);
        Ok(())
    }
}

impl FifoIo for RamPack {
    fn capacity(&self) -> u64 {
        self.fifo_capacity
    }

    fn occupancy(&self) -> u64 {
        self.lock().fifo.len() as u64
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut st = self.lock();
        let n = buf.len().min(st.fifo.len());
        buf[..n].copy_from_slice(&st.fifo[..n]);
        st.fifo.drain(..n);
        buf[n..].fill(0);
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut st = self.lock();
        if st.fifo.len() as u64 + buf.len() as u64 > self.fifo_capacity {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "fifo overflow"));
        }
        st.fifo.extend_from_slice(buf);
        Ok(())
    }
}

impl BlockDevice for RamPack {
    fn append(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut st = self.lock();
        if st.protect {
            return Err(DeviceError::Protected);
        }
        st.data.extend_from_slice(data);
        Ok(())
    }

    fn erase(&self) -> Result<(), DeviceError> {
        let mut st = self.lock();
        if st.protect {
            return Err(DeviceError::Protected);
        }
        st.data.clear();
        st.scans.clear();
        st.record_state = RecordState::Unknown;
        Ok(())
    }

    fn set_protect(&self, on: bool) {
        self.lock().protect = on;
    }

    fn protected(&self) -> bool {
        self.lock().protect
    }

    fn select_bank(&self, bank: BankId) -> Result<(), DeviceError> {
        self.lock().bank = bank;
        Ok(())
    }

    fn active_bank(&self) -> BankId {
        self.lock().bank
    }

    fn vsn(&self) -> String {
        self.lock().vsn.clone()
    }

    fn set_vsn(&self, vsn: &str) {
        self.lock().vsn = vsn.to_string();
    }

    fn scans(&self) -> Vec<Scan> {
        self.lock().scans.clone()
    }

    fn add_scan(&self, name: &str, start: u64, length: u64) {
        self.lock().scans.push(Scan { name: name.to_string(), start, length });
    }

    fn record_state(&self) -> RecordState {
        self.lock().record_state
    }

    fn set_record_state(&self, state: RecordState) {
        self.lock().record_state = state;
    }
}

/// Keyed register file of the sampler I/O board, bit-field accessors
/// included. The real board sits behind the vendor library; this map keeps
/// the command side honest about which registers it touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoReg {
    Dim,
    Dom,
    ChannelSelect,
    TrackMask,
    Gocom,
}

#[derive(Debug, Default)]
pub struct IoBoard {
    regs: Mutex<HashMap<IoReg, u32>>,
}

impl IoBoard {
    pub fn read(&self, reg: IoReg) -> u32 {
        *self.regs.lock().unwrap().get(&reg).unwrap_or(&0)
    }

    pub fn write(&self, reg: IoReg, value: u32) {
        self.regs.lock().unwrap().insert(reg, value);
    }

    /// Read-modify-write of a bit field: `width` bits starting at `shift`.
    pub fn write_field(&self, reg: IoReg, shift: u32, width: u32, value: u32) {
        let mask = ((1u64 << width) - 1) as u32;
        let mut regs = self.regs.lock().unwrap();
        let cur = regs.entry(reg).or_insert(0);
        *cur = (*cur & !(mask << shift)) | ((value & mask) << shift);
    }

    pub fn read_field(&self, reg: IoReg, shift: u32, width: u32) -> u32 {
        let mask = ((1u64 << width) - 1) as u32;
        (self.read(reg) >> shift) & mask
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protect_guards_erase_and_append() {
        let pack = RamPack::default();
        assert!(pack.protected());
        assert!(matches!(pack.erase(), Err(DeviceError::Protected)));
        assert!(matches!(pack.append(b"x"), Err(DeviceError::Protected)));

        pack.set_protect(false);
        pack.append(b"hello").unwrap();
        assert_eq!(pack.length(), 5);
        pack.erase().unwrap();
        assert_eq!(pack.length(), 0);
    }

    #[test]
    fn scan_directory_roundtrip() {
        let pack = RamPack::default();
        pack.add_scan("exp01_st_scan1", 0, 1000);
        pack.add_scan("exp01_st_scan2", 1000, 500);
        let scans = pack.scans();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[1].start, 1000);
    }

    #[test]
    fn io_board_bit_fields() {
        let board = IoBoard::default();
        board.write(IoReg::Dim, 0xffff_0000);
        board.write_field(IoReg::Dim, 4, 4, 0xa);
        assert_eq!(board.read(IoReg::Dim), 0xffff_00a0);
        assert_eq!(board.read_field(IoReg::Dim, 4, 4), 0xa);
    }

    #[test]
    fn fifo_read_consumes() {
        let pack = RamPack::new(64);
        FifoIo::write(&pack, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pack.occupancy(), 4);
        let mut buf = [0u8; 2];
        FifoIo::read(&pack, &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(pack.occupancy(), 2);
        assert!(FifoIo::write(&pack, &[0u8; 100]).is_err());
    }
}
