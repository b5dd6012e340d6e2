use std::io;

/// What the disk reader needs from the vendor block device: random reads
/// out of the logical recording. The full device contract (erase, banks,
/// scan directory) lives with the runtime; stages only see this slice.
pub trait DiskRead: Send + Sync {
    /// Length of the recording in bytes.
    fn length(&self) -> u64;
    /// Fill `buf` from byte offset `at`. Reading past the end is an error.
    fn read_at(&self, at: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// The vendor streaming FIFO between the sampler I/O board and the disks.
/// Occupancy is what the high-water logic keys off; the device stalls hard
/// when the FIFO fills, which is why readers drain and writers skip.
pub trait FifoIo: Send + Sync {
    fn capacity(&self) -> u64;
    fn occupancy(&self) -> u64;
    fn read(&self, buf: &mut [u8]) -> io::Result<()>;
    fn write(&self, buf: &[u8]) -> io::Result<()>;
}
