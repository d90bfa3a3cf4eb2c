//! [`PartitionStore`] implementation on a raw NOR flash.
//!
//! The boot pointer lives in a dedicated two sector state region. Each
//! commit writes a fresh sequence numbered, CRC protected record into the
//! copy selected by the sequence parity, so a torn write can only damage
//! the newest record and the previous one still decodes.

use embedded_storage::nor_flash::{NorFlash, NorFlashError};

use crate::image::{self, AppDescriptor, HEADER_PREFIX_LEN};

use super::{Partition, PartitionStore, StoreError, WriteHandle};

/// Maximum number of application slots in a layout.
pub const MAX_SLOTS: usize = 4;

/// Largest supported `NorFlash::WRITE_SIZE`.
pub const MAX_WRITE_ALIGN: usize = 32;

/// Serialized boot record size. Sized so it is writable at any supported
/// alignment: sequence (4), slot (4), CRC32 over the first 8 bytes (4),
/// 0xFF padding (20).
const BOOT_RECORD_LEN: usize = 32;

const BOOT_RECORD_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Flash geometry handed to [`FlashStore::new`].
#[derive(Debug, Clone)]
pub struct FlashLayout {
    /// Application slots, ordered by table index.
    pub slots: heapless::Vec<Partition, MAX_SLOTS>,
    /// Offset of the two sector boot record region.
    pub boot_record_offset: u32,
    /// Index of the slot the device booted from.
    pub running: u8,
    /// Slot holding the version a previous boot marked invalid, if any.
    pub last_invalid: Option<u8>,
}

impl FlashLayout {
    /// Standard dual slot arrangement. Each slot is `(offset, size)`.
    pub fn dual(slot0: (u32, u32), slot1: (u32, u32), boot_record_offset: u32, running: u8) -> Self {
        let mut slots = heapless::Vec::new();
        slots
            .push(Partition {
                index: 0,
                offset: slot0.0,
                size: slot0.1,
            })
            .ok();
        slots
            .push(Partition {
                index: 1,
                offset: slot1.0,
                size: slot1.1,
            })
            .ok();
        Self {
            slots,
            boot_record_offset,
            running,
            last_invalid: None,
        }
    }

    pub fn with_last_invalid(mut self, index: u8) -> Self {
        self.last_invalid = Some(index);
        self
    }
}

struct ActiveWrite {
    slot: u8,
    /// Bytes flushed to flash, always a multiple of `F::WRITE_SIZE`.
    cursor: u32,
    /// Slot relative offset erased so far.
    erased_to: u32,
    /// Partial trailing word, shorter than `F::WRITE_SIZE`.
    tail: heapless::Vec<u8, MAX_WRITE_ALIGN>,
}

/// Dual slot [`PartitionStore`] over a [`NorFlash`] driver.
pub struct FlashStore<F: NorFlash> {
    flash: F,
    layout: FlashLayout,
    boot: u8,
    boot_seq: u32,
    writer: Option<ActiveWrite>,
}

impl<F: NorFlash> FlashStore<F> {
    /// Validates the layout against the flash geometry and loads the boot
    /// record. With no decodable record the boot pointer starts at the
    /// running slot.
    pub fn new(flash: F, layout: FlashLayout) -> Result<Self, StoreError> {
        let erase = F::ERASE_SIZE as u32;
        if F::WRITE_SIZE > MAX_WRITE_ALIGN
            || F::ERASE_SIZE % F::WRITE_SIZE != 0
            || F::ERASE_SIZE < BOOT_RECORD_LEN
            || BOOT_RECORD_LEN % F::WRITE_SIZE != 0
        {
            return Err(StoreError::InvalidLayout);
        }
        if layout.slots.is_empty() || layout.running as usize >= layout.slots.len() {
            return Err(StoreError::InvalidLayout);
        }
        if let Some(index) = layout.last_invalid {
            if index as usize >= layout.slots.len() {
                return Err(StoreError::InvalidLayout);
            }
        }
        let capacity = flash.capacity() as u32;
        for (i, slot) in layout.slots.iter().enumerate() {
            let end = match slot.offset.checked_add(slot.size) {
                Some(end) => end,
                None => return Err(StoreError::InvalidLayout),
            };
            if slot.index as usize != i
                || slot.size == 0
                || slot.offset % erase != 0
                || slot.size % erase != 0
                || end > capacity
            {
                return Err(StoreError::InvalidLayout);
            }
        }
        if layout.boot_record_offset % erase != 0
            || layout.boot_record_offset.checked_add(2 * erase).map_or(true, |end| end > capacity)
        {
            return Err(StoreError::InvalidLayout);
        }

        let mut store = Self {
            flash,
            layout,
            boot: 0,
            boot_seq: 0,
            writer: None,
        };
        let (slot, seq) = store.load_boot_record();
        store.boot = slot;
        store.boot_seq = seq;
        debug!("Boot record: slot {} seq {}", slot, seq);
        Ok(store)
    }

    /// Borrow of the underlying flash driver.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Releases the flash driver.
    pub fn into_inner(self) -> F {
        self.flash
    }

    /// True while a write handle is open.
    pub fn write_active(&self) -> bool {
        self.writer.is_some()
    }

    /// Records that `partition` holds a version which failed boot
    /// validation. Admission will refuse that version until it changes.
    pub fn mark_invalid(&mut self, partition: Partition) -> Result<(), StoreError> {
        match self.slot_of(&partition) {
            Some(index) => {
                self.layout.last_invalid = Some(index);
                Ok(())
            }
            None => Err(StoreError::InvalidLayout),
        }
    }

    fn slot_of(&self, partition: &Partition) -> Option<u8> {
        self.layout
            .slots
            .iter()
            .find(|s| *s == partition)
            .map(|s| s.index)
    }

    fn record_offset(&self, copy: u8) -> u32 {
        self.layout.boot_record_offset + copy as u32 * F::ERASE_SIZE as u32
    }

    fn read_record(&mut self, copy: u8) -> Option<(u8, u32)> {
        let mut buf = [0u8; BOOT_RECORD_LEN];
        self.flash.read(self.record_offset(copy), &mut buf).ok()?;
        let seq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let slot = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if seq == 0 || seq == u32::MAX || crc != BOOT_RECORD_CRC.checksum(&buf[..8]) {
            return None;
        }
        if slot as usize >= self.layout.slots.len() {
            return None;
        }
        Some((slot as u8, seq))
    }

    fn load_boot_record(&mut self) -> (u8, u32) {
        let mut best = (self.layout.running, 0);
        for copy in 0..2u8 {
            if let Some((slot, seq)) = self.read_record(copy) {
                if seq > best.1 {
                    best = (slot, seq);
                }
            }
        }
        best
    }

    fn write_boot_record(&mut self, slot: u8) -> Result<(), StoreError> {
        let seq = match self.boot_seq.wrapping_add(1) {
            0 | u32::MAX => 1,
            seq => seq,
        };
        let copy = (seq % 2) as u8;
        let offset = self.record_offset(copy);

        let mut buf = [0xFFu8; BOOT_RECORD_LEN];
        buf[0..4].copy_from_slice(&seq.to_le_bytes());
        buf[4..8].copy_from_slice(&(slot as u32).to_le_bytes());
        let crc = BOOT_RECORD_CRC.checksum(&buf[..8]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());

        self.flash
            .erase(offset, offset + F::ERASE_SIZE as u32)
            .map_err(flash_err)?;
        self.flash.write(offset, &buf).map_err(flash_err)?;
        self.boot = slot;
        self.boot_seq = seq;
        Ok(())
    }

    fn erase_ahead(
        flash: &mut F,
        base: u32,
        erased_to: &mut u32,
        needed: u32,
    ) -> Result<(), StoreError> {
        let erase = F::ERASE_SIZE as u32;
        while *erased_to < needed {
            flash
                .erase(base + *erased_to, base + *erased_to + erase)
                .map_err(flash_err)?;
            *erased_to += erase;
        }
        Ok(())
    }
}

impl<F: NorFlash> PartitionStore for FlashStore<F> {
    fn running_partition(&self) -> Partition {
        self.layout.slots[self.layout.running as usize]
    }

    fn boot_partition(&self) -> Partition {
        self.layout.slots[self.boot as usize]
    }

    fn next_update_target(&self) -> Result<Partition, StoreError> {
        if self.layout.slots.len() < 2 {
            return Err(StoreError::NoUpdateSlot);
        }
        let next = (self.layout.running as usize + 1) % self.layout.slots.len();
        Ok(self.layout.slots[next])
    }

    fn last_invalid_partition(&self) -> Option<Partition> {
        self.layout
            .last_invalid
            .map(|index| self.layout.slots[index as usize])
    }

    fn read_descriptor(&mut self, partition: Partition) -> Option<AppDescriptor> {
        if self.slot_of(&partition).is_none() || partition.size < HEADER_PREFIX_LEN as u32 {
            return None;
        }
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        self.flash.read(partition.offset, &mut prefix).ok()?;
        if !image::prefix_valid(&prefix) {
            return None;
        }
        AppDescriptor::from_image_prefix(&prefix)
    }

    fn open_write(&mut self, partition: Partition) -> Result<WriteHandle, StoreError> {
        if self.writer.is_some() {
            return Err(StoreError::PartitionBusy);
        }
        if self.slot_of(&partition).is_none() {
            return Err(StoreError::InvalidLayout);
        }
        if partition.index == self.layout.running {
            error!("Refusing to overwrite the running slot {}", partition.index);
            return Err(StoreError::PartitionBusy);
        }
        self.writer = Some(ActiveWrite {
            slot: partition.index,
            cursor: 0,
            erased_to: 0,
            tail: heapless::Vec::new(),
        });
        debug!("Opened write on slot {}", partition.index);
        Ok(WriteHandle::new(partition))
    }

    fn write(&mut self, handle: &mut WriteHandle, bytes: &[u8]) -> Result<(), StoreError> {
        let writer = match self.writer.as_mut() {
            Some(w) if w.slot == handle.partition().index => w,
            _ => return Err(StoreError::PartitionBusy),
        };
        let partition = handle.partition();
        let total = handle.written() as u64 + bytes.len() as u64;
        if total > partition.size as u64 {
            return Err(StoreError::OutOfBounds);
        }
        Self::erase_ahead(
            &mut self.flash,
            partition.offset,
            &mut writer.erased_to,
            total as u32,
        )?;

        let align = F::WRITE_SIZE;
        let mut data = bytes;

        // Complete a buffered partial word first.
        if !writer.tail.is_empty() {
            let take = (align - writer.tail.len()).min(data.len());
            writer.tail.extend_from_slice(&data[..take]).ok();
            data = &data[take..];
            if writer.tail.len() == align {
                self.flash
                    .write(partition.offset + writer.cursor, &writer.tail)
                    .map_err(flash_err)?;
                writer.cursor += align as u32;
                writer.tail.clear();
            }
        }

        let aligned = data.len() - data.len() % align;
        if aligned > 0 {
            self.flash
                .write(partition.offset + writer.cursor, &data[..aligned])
                .map_err(flash_err)?;
            writer.cursor += aligned as u32;
        }
        writer.tail.extend_from_slice(&data[aligned..]).ok();

        handle.advance(bytes.len());
        Ok(())
    }

    fn finalize(&mut self, handle: WriteHandle) -> Result<(), StoreError> {
        let writer = match self.writer.take() {
            Some(w) if w.slot == handle.partition().index => w,
            other => {
                self.writer = other;
                return Err(StoreError::PartitionBusy);
            }
        };
        let partition = handle.partition();

        if !writer.tail.is_empty() {
            let mut word = [0xFFu8; MAX_WRITE_ALIGN];
            word[..writer.tail.len()].copy_from_slice(&writer.tail);
            self.flash
                .write(partition.offset + writer.cursor, &word[..F::WRITE_SIZE])
                .map_err(flash_err)?;
        }

        if handle.written() < HEADER_PREFIX_LEN {
            warn!(
                "Image on slot {} is truncated at {} bytes",
                partition.index,
                handle.written()
            );
            return Err(StoreError::ImageInvalid);
        }
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        self.flash
            .read(partition.offset, &mut prefix)
            .map_err(flash_err)?;
        if !image::prefix_valid(&prefix) {
            warn!("Image on slot {} failed validation", partition.index);
            return Err(StoreError::ImageInvalid);
        }
        info!(
            "Slot {} holds a complete image, {} bytes",
            partition.index,
            handle.written()
        );
        Ok(())
    }

    fn abort(&mut self, handle: WriteHandle) {
        match self.writer.take() {
            Some(writer) if writer.slot == handle.partition().index => {
                let partition = handle.partition();
                if writer.erased_to > 0 {
                    // Scrub the prefix so the partial image can never validate.
                    let end = partition.offset + F::ERASE_SIZE as u32;
                    if self.flash.erase(partition.offset, end).is_err() {
                        warn!("Failed to scrub aborted slot {}", partition.index);
                    }
                }
                info!(
                    "Aborted write on slot {} after {} bytes",
                    partition.index,
                    handle.written()
                );
            }
            other => self.writer = other,
        }
    }

    fn commit_boot(&mut self, partition: Partition) -> Result<(), StoreError> {
        if self.slot_of(&partition).is_none() {
            return Err(StoreError::InvalidLayout);
        }
        if self
            .writer
            .as_ref()
            .map_or(false, |w| w.slot == partition.index)
        {
            return Err(StoreError::PartitionBusy);
        }
        if partition.size < HEADER_PREFIX_LEN as u32 {
            return Err(StoreError::ImageInvalid);
        }
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        self.flash
            .read(partition.offset, &mut prefix)
            .map_err(flash_err)?;
        if !image::prefix_valid(&prefix) {
            return Err(StoreError::ImageInvalid);
        }
        self.write_boot_record(partition.index)?;
        info!("Boot pointer moved to slot {}", partition.index);
        Ok(())
    }
}

fn flash_err<E: NorFlashError>(e: E) -> StoreError {
    StoreError::Flash(e.kind())
}
