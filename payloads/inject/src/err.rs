use thiserror::Error as TError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TError)]
pub enum Error {
    /// The FPB reports no usable code comparators
    #[error("FPB has no code comparators")]
    Unsupported,
    /// Slot index beyond the comparator count reported by hardware
    #[error("Invalid slot {0}")]
    InvalidSlot(usize),
    /// Address outside the region the selected strategy can reach
    #[error("Invalid address {0:#010x}")]
    InvalidAddress(u32),
    /// Operation attempted before `init`
    #[error("Engine is not initialized")]
    NotInitialized,
    /// Branch offset does not fit the selected encoding
    #[error("Branch from {from:#010x} to {to:#010x} is out of range")]
    BranchOutOfRange { from: u32, to: u32 },
    /// Address does not satisfy the alignment of the selected mode
    #[error("Misaligned address {0:#010x}")]
    Misaligned(u32),
    /// The RTOS refused to add or remove a debugpoint
    #[error("Debugpoint registration failed")]
    Debugpoint,
}
