use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

use crate::error::{ArchiveError, Result};

pub const MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];
pub const SUPERBLOCK_SIZE: usize = 32;
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Superblock {
    pub major: u8,
    pub minor: u8,
    /// Metadata offset relative to the end of this header.
    pub next_header_offset: u64,
    pub next_header_size: u64,
    pub next_header_crc: u32,
}

impl Superblock {
    pub fn new(next_header_offset: u64, next_header_size: u64, next_header_crc: u32) -> Self {
        Self { major: VERSION_MAJOR, minor: VERSION_MINOR, next_header_offset, next_header_size, next_header_crc }
    }

    /// Offset, length and CRC all zero: the writer died before patching the header.
    pub fn is_unfinished(&self) -> bool {
        self.next_header_offset == 0 && self.next_header_size == 0 && self.next_header_crc == 0
    }

    pub fn metadata_position(&self) -> Option<u64> {
        self.next_header_offset.checked_add(SUPERBLOCK_SIZE as u64)
    }

    /// Written at offset 0 until `finish` patches it: signature and version,
    /// everything else zero.  The zero CRC never matches, so the header reads
    /// as unfinished.
    pub fn placeholder() -> [u8; SUPERBLOCK_SIZE] {
        let mut out = [0u8; SUPERBLOCK_SIZE];
        out[..6].copy_from_slice(&MAGIC);
        out[6] = VERSION_MAJOR;
        out[7] = VERSION_MINOR;
        out
    }

    fn tail_bytes(&self) -> [u8; 20] {
        let mut tail = [0u8; 20];
        let mut w = Cursor::new(&mut tail[..]);
        // Writing into a fixed 20-byte slice cannot fail.
        let _ = w.write_u64::<LittleEndian>(self.next_header_offset);
        let _ = w.write_u64::<LittleEndian>(self.next_header_size);
        let _ = w.write_u32::<LittleEndian>(self.next_header_crc);
        tail
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let tail = self.tail_bytes();
        let mut out = [0u8; SUPERBLOCK_SIZE];
        out[..6].copy_from_slice(&MAGIC);
        out[6] = self.major;
        out[7] = self.minor;
        out[8..12].copy_from_slice(&crc32fast::hash(&tail).to_le_bytes());
        out[12..].copy_from_slice(&tail);
        out
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Parse the start header. The boolean is `true` when its CRC matched.
    pub fn parse(bytes: &[u8; SUPERBLOCK_SIZE]) -> Result<(Self, bool)> {
        if bytes[..6] != MAGIC {
            return Err(ArchiveError::BadMagic);
        }
        let (major, minor) = (bytes[6], bytes[7]);
        if major != VERSION_MAJOR || minor > VERSION_MINOR {
            return Err(ArchiveError::UnsupportedVersion { major, minor });
        }
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut r = Cursor::new(&bytes[12..]);
        let sb = Self {
            major,
            minor,
            next_header_offset: r.read_u64::<LittleEndian>()?,
            next_header_size: r.read_u64::<LittleEndian>()?,
            next_header_crc: r.read_u32::<LittleEndian>()?,
        };
        Ok((sb, crc32fast::hash(&bytes[12..]) == stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_header_layout() {
        let sb = Superblock::new(0x1234, 0x56, 0xDEADBEEF);
        let bytes = sb.to_bytes();
        assert_eq!(&bytes[..6], &MAGIC);
        assert_eq!(bytes[7], VERSION_MINOR);
        assert_eq!(&bytes[12..20], &0x1234u64.to_le_bytes());
        let (parsed, crc_ok) = Superblock::parse(&bytes).unwrap();
        assert!(crc_ok);
        assert_eq!(parsed, sb);
    }

    #[test]
    fn damaged_crc_is_reported_not_fatal() {
        let mut bytes = Superblock::new(1, 2, 3).to_bytes();
        bytes[9] ^= 0xFF;
        let (_, crc_ok) = Superblock::parse(&bytes).unwrap();
        assert!(!crc_ok);
    }

    #[test]
    fn placeholder_reads_as_unfinished() {
        let (sb, crc_ok) = Superblock::parse(&Superblock::placeholder()).unwrap();
        assert!(!crc_ok);
        assert!(sb.is_unfinished());
    }

    #[test]
    fn rejects_newer_minor_version() {
        let mut bytes = Superblock::new(0, 0, 0).to_bytes();
        bytes[7] = 9;
        assert!(matches!(
            Superblock::parse(&bytes),
            Err(ArchiveError::UnsupportedVersion { major: 0, minor: 9 })
        ));
    }
}
