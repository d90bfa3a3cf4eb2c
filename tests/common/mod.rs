//! Test doubles shared by the integration tests.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use otaswap::agent::Restarter;
use otaswap::image::{self, HEADER_PREFIX_LEN};
use otaswap::store::flash::FlashLayout;
use otaswap::stream::{ImageSource, ImageStream, ReadOutcome, TransportError};

pub const TEST_TIMER_HZ: u32 = 1000;

const SECTOR: usize = 4096;
pub const FLASH_SIZE: usize = 0x50000;
pub const SLOT0_OFFSET: u32 = 0x2000;
pub const SLOT1_OFFSET: u32 = 0x22000;
const SLOT_SIZE: u32 = 0x20000;

/// Two slot layout, boot record in the first two sectors, running slot 0.
pub fn test_layout() -> FlashLayout {
    FlashLayout::dual((SLOT0_OFFSET, SLOT_SIZE), (SLOT1_OFFSET, SLOT_SIZE), 0, 0)
}

/// In-memory NOR flash that panics on writes to unerased bytes.
pub struct MemFlash {
    pub mem: Vec<u8>,
    pub writes: usize,
    pub erases: usize,
}

impl MemFlash {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xFF; size],
            writes: 0,
            erases: 0,
        }
    }
}

#[derive(Debug)]
pub struct MemFlashError(NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % SECTOR != 0 || to % SECTOR != 0 || from > to {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        if to > self.mem.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[from..to].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if start % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        if end > self.mem.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        assert!(
            self.mem[start..end].iter().all(|&b| b == 0xFF),
            "write to unerased flash at {:#x}",
            start
        );
        self.mem[start..end].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

/// Writes an image straight into the backing memory, bypassing the
/// counters. Used to set up the pre-existing running image.
pub fn program_slot(flash: &mut MemFlash, offset: u32, image: &[u8]) {
    let start = offset as usize;
    flash.mem[start..start + image.len()].copy_from_slice(image);
}

/// Builds a structurally valid image with the given version and a
/// patterned body.
pub fn make_image(version: &str, total_len: usize) -> Vec<u8> {
    assert!(total_len >= HEADER_PREFIX_LEN);
    assert!(version.len() <= image::VERSION_LEN);

    let mut bytes = vec![0u8; total_len];
    bytes[0] = image::IMAGE_MAGIC;
    bytes[1] = 1;
    bytes[4..8].copy_from_slice(&0x4008_0000u32.to_le_bytes());
    bytes[24..28].copy_from_slice(&0x3F40_0020u32.to_le_bytes());
    bytes[28..32].copy_from_slice(&((total_len - 32) as u32).to_le_bytes());
    bytes[32..36].copy_from_slice(&image::DESCRIPTOR_MAGIC_WORD.to_le_bytes());
    bytes[48..48 + version.len()].copy_from_slice(version.as_bytes());
    for (i, b) in bytes[HEADER_PREFIX_LEN..].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    bytes
}

pub enum StreamStep {
    Data(Vec<u8>),
    Eof,
    Fail(TransportError),
}

/// Stream replaying a script, splitting oversized `Data` steps across
/// reads.
pub struct ScriptedStream {
    steps: VecDeque<StreamStep>,
}

impl ScriptedStream {
    pub fn new(steps: Vec<StreamStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn from_image(image: &[u8], chunks: &[usize]) -> Self {
        let mut steps = Vec::new();
        let mut offset = 0;
        for &len in chunks {
            steps.push(StreamStep::Data(image[offset..offset + len].to_vec()));
            offset += len;
        }
        if offset < image.len() {
            steps.push(StreamStep::Data(image[offset..].to_vec()));
        }
        steps.push(StreamStep::Eof);
        Self::new(steps)
    }
}

impl ImageStream for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.steps.pop_front() {
            Some(StreamStep::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    self.steps.push_front(StreamStep::Data(rest));
                }
                ReadOutcome::Data(n)
            }
            Some(StreamStep::Eof) | None => ReadOutcome::EndOfStream,
            Some(StreamStep::Fail(e)) => ReadOutcome::TransportError(e),
        }
    }
}

pub struct ScriptedSource {
    streams: VecDeque<ScriptedStream>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            streams: VecDeque::new(),
        }
    }

    pub fn push(&mut self, stream: ScriptedStream) {
        self.streams.push_back(stream);
    }
}

impl ImageSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn open(&mut self) -> Result<ScriptedStream, TransportError> {
        self.streams
            .pop_front()
            .ok_or(TransportError::NotConnected)
    }
}

pub struct MockTimer {
    pub fire_times: usize,
}

impl fugit_timer::Timer<TEST_TIMER_HZ> for MockTimer {
    type Error = ();

    fn now(&mut self) -> fugit_timer::TimerInstantU32<TEST_TIMER_HZ> {
        todo!()
    }

    fn start(
        &mut self,
        _duration: fugit_timer::TimerDurationU32<TEST_TIMER_HZ>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn wait(&mut self) -> nb::Result<(), Self::Error> {
        if self.fire_times > 0 {
            self.fire_times -= 1;
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

#[derive(Clone, Default)]
pub struct MockRestart {
    pub restarts: Rc<Cell<usize>>,
}

impl Restarter for MockRestart {
    fn restart(&mut self) {
        self.restarts.set(self.restarts.get() + 1);
    }
}
