use embedded_storage::nor_flash::NorFlashErrorKind;

use crate::store::StoreError;
use crate::stream::TransportError;

/// Why an update session ended without committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortReason {
    /// The stream ended before a full 288 byte image prefix arrived.
    TruncatedHeader,
    /// The offered version matches the version marked invalid by a previous
    /// failed boot.
    RollbackLoopRejected,
    /// The offered version is already running. Not a failure.
    AlreadyCurrent,
    /// The transport failed mid transfer.
    TransportFailure(TransportError),
    /// A write handle was already open, or a stale handle was used.
    PartitionBusy,
    /// The flash driver rejected an erase or write.
    FlashWrite(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] NorFlashErrorKind),
    /// The received image failed structural validation.
    ImageCorrupt,
    /// No inactive slot is available to update into.
    NoUpdateSlot,
}

impl AbortReason {
    /// True for aborts that leave the device in its intended state, such as
    /// being offered the version that is already running.
    pub fn is_benign(&self) -> bool {
        matches!(self, AbortReason::AlreadyCurrent)
    }
}

impl From<TransportError> for AbortReason {
    fn from(e: TransportError) -> Self {
        AbortReason::TransportFailure(e)
    }
}

impl From<StoreError> for AbortReason {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoUpdateSlot => AbortReason::NoUpdateSlot,
            StoreError::PartitionBusy => AbortReason::PartitionBusy,
            StoreError::ImageInvalid => AbortReason::ImageCorrupt,
            StoreError::OutOfBounds => AbortReason::FlashWrite(NorFlashErrorKind::OutOfBounds),
            StoreError::InvalidLayout => AbortReason::FlashWrite(NorFlashErrorKind::Other),
            StoreError::Flash(kind) => AbortReason::FlashWrite(kind),
        }
    }
}
