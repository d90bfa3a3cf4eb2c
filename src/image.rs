//! Firmware image prefix layout.
//!
//! Every bootable image begins with a fixed 24 byte image header, the first
//! 8 byte segment header and a 256 byte application descriptor. Those 288
//! bytes are all the engine needs to admit or reject an incoming image.

/// First byte of a bootable image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Magic word at the start of the application descriptor.
pub const DESCRIPTOR_MAGIC_WORD: u32 = 0xABCD_5432;

pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const DESCRIPTOR_LEN: usize = 256;

/// Image prefix length that must be buffered before admission can run.
pub const HEADER_PREFIX_LEN: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + DESCRIPTOR_LEN;

/// Capacity of the NUL padded version field inside the descriptor.
pub const VERSION_LEN: usize = 32;

const DESCRIPTOR_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
const VERSION_OFFSET: usize = DESCRIPTOR_OFFSET + 16;

/// Fixed image header at offset zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub segment_count: u8,
    pub entry_addr: u32,
    pub hash_appended: bool,
}

impl ImageHeader {
    /// Parses the header, returning `None` when the buffer is too short or
    /// the magic byte does not match.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IMAGE_HEADER_LEN || bytes[0] != IMAGE_MAGIC {
            return None;
        }
        Some(Self {
            segment_count: bytes[1],
            entry_addr: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            hash_appended: bytes[23] == 1,
        })
    }
}

/// Application descriptor embedded behind the first segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppDescriptor {
    pub version: heapless::String<VERSION_LEN>,
}

impl AppDescriptor {
    /// Reads the descriptor out of an image prefix.
    ///
    /// Returns `None` only while the prefix is still shorter than
    /// [`HEADER_PREFIX_LEN`]. A complete prefix always yields a descriptor;
    /// a version field that is not valid UTF-8 comes back empty.
    pub fn from_image_prefix(prefix: &[u8]) -> Option<Self> {
        if prefix.len() < HEADER_PREFIX_LEN {
            return None;
        }
        let field = &prefix[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN];
        let end = field.iter().position(|&b| b == 0).unwrap_or(VERSION_LEN);
        let version = core::str::from_utf8(&field[..end]).unwrap_or("");
        Some(Self {
            version: heapless::String::from(version),
        })
    }
}

/// Structural validity check used when inspecting flash contents. Both magic
/// values must match and the header must describe at least one segment.
pub fn prefix_valid(prefix: &[u8]) -> bool {
    if prefix.len() < HEADER_PREFIX_LEN {
        return false;
    }
    let header = match ImageHeader::from_bytes(prefix) {
        Some(h) => h,
        None => return false,
    };
    let magic_word = u32::from_le_bytes([
        prefix[DESCRIPTOR_OFFSET],
        prefix[DESCRIPTOR_OFFSET + 1],
        prefix[DESCRIPTOR_OFFSET + 2],
        prefix[DESCRIPTOR_OFFSET + 3],
    ]);
    header.segment_count > 0 && magic_word == DESCRIPTOR_MAGIC_WORD
}
