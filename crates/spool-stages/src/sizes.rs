use thiserror::Error;

#[derive(Error, Debug)]
pub enum SizesError {
    #[error("blocksize {0} is zero")]
    ZeroBlock(usize),
    #[error("read_size {read_size} does not divide blocksize {blocksize}")]
    ReadVsBlock { read_size: usize, blocksize: usize },
    #[error("write_size {write_size} does not divide blocksize {blocksize}")]
    WriteVsBlock { write_size: usize, blocksize: usize },
    #[error("write_size {write_size} larger than read_size {read_size}")]
    WriteVsRead { write_size: usize, read_size: usize },
    #[error("read_size {read_size} does not divide framesize {framesize}")]
    ReadVsFrame { read_size: usize, framesize: usize },
    #[error("compress_offset {compress_offset} does not fit read_size {read_size}")]
    OffsetVsRead { compress_offset: usize, read_size: usize },
}

/// The mutually consistent chunk sizes every stage of a running transfer
/// works in, produced by the constraint solver from the mode knobs and
/// consumed read-only by the stages.
///
/// `read_size` is what the first stage produces per chunk, `write_size`
/// what the last stage consumes; they differ exactly when compression is
/// active. `blocksize` is the queue element size and a common multiple of
/// both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sizes {
    pub blocksize: usize,
    pub read_size: usize,
    pub write_size: usize,
    pub compress_offset: usize,
    pub framesize: Option<usize>,
    /// datagrams per compressed block on the wire, when constrained by mtu
    pub n_mtu: Option<usize>,
}

impl Sizes {
    /// Uncompressed equal-chunk layout, the TCP/file case.
    pub fn plain(blocksize: usize) -> Self {
        Sizes {
            blocksize,
            read_size: blocksize,
            write_size: blocksize,
            compress_offset: 0,
            framesize: None,
            n_mtu: None,
        }
    }

    pub fn datagrams_per_block(&self) -> usize {
        self.blocksize / self.write_size
    }

    pub fn chunks_per_block(&self) -> usize {
        self.blocksize / self.read_size
    }

    pub fn is_compressed(&self) -> bool {
        self.write_size != self.read_size
    }

    pub fn validate(&self) -> Result<(), SizesError> {
        if self.blocksize == 0 {
            return Err(SizesError::ZeroBlock(self.blocksize));
        }
        if self.read_size == 0 || self.blocksize % self.read_size != 0 {
            return Err(SizesError::ReadVsBlock {
                read_size: self.read_size,
                blocksize: self.blocksize,
            });
        }
        if self.write_size == 0 || self.blocksize % self.write_size != 0 {
            return Err(SizesError::WriteVsBlock {
                write_size: self.write_size,
                blocksize: self.blocksize,
            });
        }
        if self.write_size > self.read_size {
            return Err(SizesError::WriteVsRead {
                write_size: self.write_size,
                read_size: self.read_size,
            });
        }
        if let Some(framesize) = self.framesize {
            if framesize % self.read_size != 0 {
                return Err(SizesError::ReadVsFrame { read_size: self.read_size, framesize });
            }
        }
        if self.compress_offset >= self.read_size {
            return Err(SizesError::OffsetVsRead {
                compress_offset: self.compress_offset,
                read_size: self.read_size,
            });
        }
        Ok(())
    }
}
