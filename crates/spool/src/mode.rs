use bitflags::bitflags;
use strum::{Display, EnumString};

/// Which flavour of recorder this runtime speaks for; commands are mapped
/// per class, and a command aimed at the wrong class earns reply code 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceClass {
    Mk5A,
    Mk5BDim,
    Mk5BDom,
    Generic,
}

/// Every named directed transfer the engine can run. At most one is active
/// per runtime; `NoTransfer` is the idle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TransferMode {
    #[default]
    #[strum(serialize = "no_transfer")]
    NoTransfer,
    In2Net,
    In2Disk,
    In2Fork,
    In2Mem,
    In2Memfork,
    In2File,
    Disk2Net,
    Disk2File,
    Disk2Out,
    Fill2Net,
    Fill2File,
    Fill2Out,
    File2Net,
    File2Disk,
    File2Mem,
    File2Check,
    Net2Out,
    Net2Disk,
    Net2Fork,
    Net2File,
    Net2Check,
    Net2Sfxc,
    Net2Sfxcfork,
    Net2Mem,
    Mem2Net,
    Mem2File,
    Mem2Sfxc,
    Mem2Time,
    Spill2Net,
    Spill2File,
    Spid2Net,
    Spid2File,
    Spif2Net,
    Spif2File,
    Spin2Net,
    Spin2File,
    Splet2Net,
    Splet2File,
    Condition,
}

impl TransferMode {
    pub fn is_idle(self) -> bool {
        self == TransferMode::NoTransfer
    }

    /// Transfers that read from the disk pack.
    pub fn reads_disk(self) -> bool {
        matches!(
            self,
            TransferMode::Disk2Net
                | TransferMode::Disk2File
                | TransferMode::Disk2Out
                | TransferMode::Spid2Net
                | TransferMode::Spid2File
                | TransferMode::Condition
        )
    }

    /// Transfers that record onto the disk pack.
    pub fn writes_disk(self) -> bool {
        matches!(
            self,
            TransferMode::In2Disk
                | TransferMode::In2Fork
                | TransferMode::Net2Disk
                | TransferMode::Net2Fork
                | TransferMode::File2Disk
                | TransferMode::Condition
        )
    }
}

bitflags! {
    /// Non-exclusive phase bits of the current transfer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubMode: u8 {
        const WAIT = 1 << 0;
        const CONNECTED = 1 << 1;
        const RUN = 1 << 2;
        const PAUSE = 1 << 3;
    }
}

impl std::fmt::Display for SubMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(SubMode::WAIT) {
            parts.push("wait");
        }
        if self.contains(SubMode::CONNECTED) {
            parts.push("connected");
        }
        if self.contains(SubMode::RUN) {
            parts.push("run");
        }
        if self.contains(SubMode::PAUSE) {
            parts.push("pause");
        }
        if parts.is_empty() {
            parts.push("idle");
        }
        write!(f, "{}", parts.join("+"))
    }
}
