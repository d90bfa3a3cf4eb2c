//! Partition bookkeeping and durable image storage.

pub mod flash;

use embedded_storage::nor_flash::NorFlashErrorKind;

use crate::image::AppDescriptor;

/// One application slot in the device's flash layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    /// Slot index in the partition table.
    pub index: u8,
    /// Absolute flash offset of the slot.
    pub offset: u32,
    /// Slot capacity in bytes.
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// No inactive slot exists to receive an update.
    NoUpdateSlot,
    /// A write handle is already open, or the handle does not match the
    /// active write.
    PartitionBusy,
    /// The write would run past the end of the slot.
    OutOfBounds,
    /// The stored image failed structural validation.
    ImageInvalid,
    /// The partition layout is unusable on this flash.
    InvalidLayout,
    /// The flash driver failed.
    Flash(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] NorFlashErrorKind),
}

/// Exclusive, sequential write session on one partition.
///
/// Handles are only issued by [`PartitionStore::open_write`] and are spent
/// by `finalize` or `abort`.
#[derive(Debug)]
pub struct WriteHandle {
    partition: Partition,
    written: usize,
}

impl WriteHandle {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            written: 0,
        }
    }

    /// Partition this handle writes into.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Bytes accepted so far, including any not yet flushed to flash.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Store implementations call this after accepting an append.
    pub fn advance(&mut self, n: usize) {
        self.written += n;
    }
}

/// Dual slot partition store.
///
/// The store owns three pieces of state: the partition table, the persisted
/// boot pointer and at most one active write. The running partition can
/// never be the target of a write.
pub trait PartitionStore {
    /// Partition the current firmware is executing from.
    fn running_partition(&self) -> Partition;

    /// Partition the next boot will load. Equal to the running partition
    /// until a commit moves it.
    fn boot_partition(&self) -> Partition;

    /// Inactive slot that would receive an update.
    fn next_update_target(&self) -> Result<Partition, StoreError>;

    /// Slot marked invalid by an earlier failed boot, if the platform
    /// recorded one.
    fn last_invalid_partition(&self) -> Option<Partition>;

    /// Descriptor of the image held by `partition`, or `None` when the slot
    /// does not hold a structurally valid image.
    fn read_descriptor(&mut self, partition: Partition) -> Option<AppDescriptor>;

    /// Opens the single write handle. Fails with `PartitionBusy` while
    /// another handle is live or when `partition` is the running slot.
    fn open_write(&mut self, partition: Partition) -> Result<WriteHandle, StoreError>;

    /// Appends bytes at the handle's cursor. Partial trailing words are
    /// buffered until alignment or `finalize`.
    fn write(&mut self, handle: &mut WriteHandle, bytes: &[u8]) -> Result<(), StoreError>;

    /// Flushes any buffered tail and validates the written image. On error
    /// the slot's content is not eligible to boot.
    fn finalize(&mut self, handle: WriteHandle) -> Result<(), StoreError>;

    /// Discards the write and scrubs the slot so a partial image can never
    /// pass validation.
    fn abort(&mut self, handle: WriteHandle);

    /// Durably points the next boot at `partition`. The slot must hold a
    /// structurally valid image.
    fn commit_boot(&mut self, partition: Partition) -> Result<(), StoreError>;
}
