//! CBM DOS directories

use std::fmt;
use std::fmt::Write;
use std::io;

use log::debug;

use crate::disk::block::{BlockDevice, Location, Position, PositionedData, BLOCK_SIZE};
use crate::disk::chain::{ChainIterator, ChainLink};
use crate::disk::file::Scheme;
use crate::disk::{DiskError, D64, PADDING_BYTE};
use crate::util;

const FILE_TYPE_DEL: u8 = 0x00;
const FILE_TYPE_SEQ: u8 = 0x01;
const FILE_TYPE_PRG: u8 = 0x02;
const FILE_TYPE_USR: u8 = 0x03;
const FILE_TYPE_REL: u8 = 0x04;
const FILE_ATTRIB_FILE_TYPE_MASK: u8 = 0x0F;
const FILE_ATTRIB_UNUSED_MASK: u8 = 0x10;
const FILE_ATTRIB_SAVE_WITH_REPLACE_MASK: u8 = 0x20;
const FILE_ATTRIB_LOCKED_MASK: u8 = 0x40;
const FILE_ATTRIB_CLOSED_MASK: u8 = 0x80;

/// A directory entry categorizes files as SEQ, PRG, USR, or REL, along with a
/// pseudo-file-type of DEL to indicate deleted files.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum FileType {
    DEL,
    SEQ,
    PRG,
    USR,
    REL,
    Unknown(u8),
}

impl FileType {
    /// Parse a file type name such as "prg" (case-insensitive).
    pub fn from_string(string: &str) -> Option<FileType> {
        match string.to_uppercase().as_str() {
            "DEL" => Some(FileType::DEL),
            "SEQ" => Some(FileType::SEQ),
            "PRG" => Some(FileType::PRG),
            "USR" => Some(FileType::USR),
            "REL" => Some(FileType::REL),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FileType::DEL => "del",
            FileType::SEQ => "seq",
            FileType::PRG => "prg",
            FileType::USR => "usr",
            FileType::REL => "rel",
            FileType::Unknown(_) => "unk",
        })
    }
}

/// We introduce the term "file attributes" to refer to the full 8-bit
/// directory entry field which contains the file type along with several flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// Bits 0-3 indicate the file type.
    pub file_type: FileType,
    /// Bit 4 is unused, but we store it anyway so we can reproduce this field
    /// verbatim.
    pub unused_bit: bool,
    /// Bit 5 is the "save with replace" flag.
    pub save_with_replace_flag: bool,
    /// Bit 6 is the "locked" flag, indicated by a "<" in directory listings.
    pub locked_flag: bool,
    /// Bit 7 is the "closed" flag.  An entry is in use exactly when this bit
    /// is set.
    pub closed_flag: bool,
}

impl FileAttributes {
    /// Attributes for a newly written, closed file of the given type.
    pub fn new(file_type: FileType) -> FileAttributes {
        FileAttributes {
            file_type,
            unused_bit: false,
            save_with_replace_flag: false,
            locked_flag: false,
            closed_flag: true,
        }
    }

    /// Parse a byte into a `FileAttributes` struct.
    pub fn from_byte(byte: u8) -> FileAttributes {
        let file_type = match byte & FILE_ATTRIB_FILE_TYPE_MASK {
            FILE_TYPE_DEL => FileType::DEL,
            FILE_TYPE_SEQ => FileType::SEQ,
            FILE_TYPE_PRG => FileType::PRG,
            FILE_TYPE_USR => FileType::USR,
            FILE_TYPE_REL => FileType::REL,
            b => FileType::Unknown(b),
        };
        FileAttributes {
            file_type,
            unused_bit: byte & FILE_ATTRIB_UNUSED_MASK != 0,
            save_with_replace_flag: byte & FILE_ATTRIB_SAVE_WITH_REPLACE_MASK != 0,
            locked_flag: byte & FILE_ATTRIB_LOCKED_MASK != 0,
            closed_flag: byte & FILE_ATTRIB_CLOSED_MASK != 0,
        }
    }

    /// Generate the byte which encodes this `FileAttributes` struct.
    pub fn to_byte(&self) -> u8 {
        let mut byte = match self.file_type {
            FileType::DEL => FILE_TYPE_DEL,
            FileType::SEQ => FILE_TYPE_SEQ,
            FileType::PRG => FILE_TYPE_PRG,
            FileType::USR => FILE_TYPE_USR,
            FileType::REL => FILE_TYPE_REL,
            FileType::Unknown(b) => b & FILE_ATTRIB_FILE_TYPE_MASK,
        };
        if self.unused_bit {
            byte |= FILE_ATTRIB_UNUSED_MASK
        };
        if self.save_with_replace_flag {
            byte |= FILE_ATTRIB_SAVE_WITH_REPLACE_MASK
        };
        if self.locked_flag {
            byte |= FILE_ATTRIB_LOCKED_MASK
        };
        if self.closed_flag {
            byte |= FILE_ATTRIB_CLOSED_MASK
        };
        byte
    }

    /// Return true if this entry describes a file.  Entries without the
    /// closed flag are free for reuse.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.closed_flag
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.closed_flag { ' ' } else { '*' },
            self.file_type,
            match (self.locked_flag, self.save_with_replace_flag) {
                (true, false) => "<",
                (false, true) => "@",
                (true, true) => "<@",
                (false, false) => " ",
            },
        )
    }
}

impl fmt::Debug for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // This is different from the Display impl in that there is no padding.
        if !self.closed_flag {
            f.write_char('*')?;
        }
        <FileType as fmt::Debug>::fmt(&self.file_type, f)?;
        f.write_str(match (self.locked_flag, self.save_with_replace_flag) {
            (true, false) => "<",
            (false, true) => "@",
            (true, true) => "<@",
            (false, false) => "",
        })
    }
}

pub(crate) const ENTRY_SIZE: usize = 32;
pub(crate) const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / ENTRY_SIZE;
pub(crate) const FILENAME_LENGTH: usize = 16;
const ENTRY_FILE_ATTRIBUTE_OFFSET: usize = 0x02;
const ENTRY_FIRST_SECTOR_OFFSET: usize = 0x03;
const ENTRY_FILENAME_OFFSET: usize = 0x05;
const ENTRY_SIDE_SECTOR_OFFSET: usize = 0x15;
const ENTRY_RECORD_LENGTH_OFFSET: usize = 0x17;
const ENTRY_UNUSED_OFFSET: usize = 0x18;
const ENTRY_UNUSED_SIZE: usize = 4;
const ENTRY_REPLACE_SECTOR_OFFSET: usize = 0x1C;
const ENTRY_FILE_SIZE_OFFSET: usize = 0x1E;

/// A CBM DOS directory entry.
///
/// The first two bytes of each 32-byte slot are not part of the entry: in
/// the first slot of a directory sector they hold the link to the next
/// directory sector, and they are never touched when an entry is written.
#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub file_attributes: FileAttributes,
    pub first_sector: Location,
    /// The raw filename, padded with 0xA0.
    pub filename: [u8; FILENAME_LENGTH],
    /// The first side sector (REL files only).
    pub first_side_sector: Location,
    /// The record length (REL files only).
    pub record_length: u8,
    pub unused: [u8; ENTRY_UNUSED_SIZE],
    /// Track/sector of the replacement chain during a save-with-replace.
    pub replace_sector: Location,
    /// The number of sectors used by the file.
    pub file_size: u16,
    /// The disk image position where this entry is stored, if available.
    pub position: Option<Position>,
}

impl DirectoryEntry {
    /// Create an unpositioned, closed entry.  The name must already have been
    /// checked with `check_filename_validity()`.
    pub fn new(filename: [u8; FILENAME_LENGTH], file_type: FileType) -> DirectoryEntry {
        let mut entry = DirectoryEntry::from_bytes(&[0u8; ENTRY_SIZE]);
        entry.file_attributes = FileAttributes::new(file_type);
        entry.filename = filename;
        entry
    }

    pub fn from_bytes(bytes: &[u8]) -> DirectoryEntry {
        Self::parse(bytes, None)
    }

    pub(crate) fn from_positioned_bytes(bytes: &[u8], position: Position) -> DirectoryEntry {
        Self::parse(bytes, Some(position))
    }

    fn parse(bytes: &[u8], position: Option<Position>) -> DirectoryEntry {
        assert_eq!(bytes.len(), ENTRY_SIZE);
        let mut filename = [0u8; FILENAME_LENGTH];
        filename.copy_from_slice(
            &bytes[ENTRY_FILENAME_OFFSET..ENTRY_FILENAME_OFFSET + FILENAME_LENGTH],
        );
        let mut unused = [0u8; ENTRY_UNUSED_SIZE];
        unused.copy_from_slice(&bytes[ENTRY_UNUSED_OFFSET..ENTRY_UNUSED_OFFSET + ENTRY_UNUSED_SIZE]);
        DirectoryEntry {
            file_attributes: FileAttributes::from_byte(bytes[ENTRY_FILE_ATTRIBUTE_OFFSET]),
            first_sector: Location::from_bytes(&bytes[ENTRY_FIRST_SECTOR_OFFSET..]),
            filename,
            first_side_sector: Location::from_bytes(&bytes[ENTRY_SIDE_SECTOR_OFFSET..]),
            record_length: bytes[ENTRY_RECORD_LENGTH_OFFSET],
            unused,
            replace_sector: Location::from_bytes(&bytes[ENTRY_REPLACE_SECTOR_OFFSET..]),
            file_size: ((bytes[ENTRY_FILE_SIZE_OFFSET + 1] as u16) << 8)
                | (bytes[ENTRY_FILE_SIZE_OFFSET] as u16),
            position,
        }
    }

    /// Write the serialized directory entry to the provided mutable byte
    /// slice.  This operation preserves any existing "next directory sector"
    /// field.
    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), ENTRY_SIZE);
        bytes[ENTRY_FILE_ATTRIBUTE_OFFSET] = self.file_attributes.to_byte();
        self.first_sector
            .write_bytes(&mut bytes[ENTRY_FIRST_SECTOR_OFFSET..]);
        bytes[ENTRY_FILENAME_OFFSET..ENTRY_FILENAME_OFFSET + FILENAME_LENGTH]
            .copy_from_slice(&self.filename);
        self.first_side_sector
            .write_bytes(&mut bytes[ENTRY_SIDE_SECTOR_OFFSET..]);
        bytes[ENTRY_RECORD_LENGTH_OFFSET] = self.record_length;
        bytes[ENTRY_UNUSED_OFFSET..ENTRY_UNUSED_OFFSET + ENTRY_UNUSED_SIZE]
            .copy_from_slice(&self.unused);
        self.replace_sector
            .write_bytes(&mut bytes[ENTRY_REPLACE_SECTOR_OFFSET..]);
        bytes[ENTRY_FILE_SIZE_OFFSET] = (self.file_size & 0xFF) as u8;
        bytes[ENTRY_FILE_SIZE_OFFSET + 1] = (self.file_size >> 8) as u8;
    }

    /// Reset all fields to their cleared values.  The position is kept.
    pub(crate) fn reset(&mut self) {
        let position = self.position;
        *self = DirectoryEntry::parse(&[0u8; ENTRY_SIZE], position);
    }

    /// Return the filename without its padding.
    pub fn name(&self) -> String {
        util::decode_padded(&self.filename)
    }

    pub fn set_filename(&mut self, name: &str) -> io::Result<()> {
        self.filename = check_filename_validity(name)?;
        Ok(())
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.file_attributes.is_live()
    }

    /// Return the storage scheme implied by the file type.
    pub fn scheme(&self) -> Scheme {
        match self.file_attributes.file_type {
            FileType::REL => Scheme::Relative,
            _ => Scheme::Linear,
        }
    }
}

impl PositionedData for DirectoryEntry {
    fn position(&self) -> io::Result<Position> {
        match self.position {
            Some(p) => Ok(p),
            None => Err(DiskError::Unpositioned.into()),
        }
    }

    fn positioned_read(&mut self, buffer: &[u8]) -> io::Result<()> {
        let position = self.position()?;
        if buffer.len() < ENTRY_SIZE {
            return Err(DiskError::InvalidOffset.into());
        }
        *self = DirectoryEntry::parse(&buffer[..ENTRY_SIZE], Some(position));
        Ok(())
    }

    fn positioned_write(&self, buffer: &mut [u8]) -> io::Result<()> {
        if buffer.len() < ENTRY_SIZE {
            return Err(DiskError::WriteUnderrun.into());
        }
        self.to_bytes(&mut buffer[..ENTRY_SIZE]);
        Ok(())
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<4} {:18}{}",
            self.file_size,
            format!("\"{}\"", self.name()),
            self.file_attributes
        )?;
        if f.alternate() && self.scheme() == Scheme::Relative {
            // verbose
            write!(
                f,
                " REL(side={} rec_len={})",
                self.first_side_sector, self.record_length
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\",{},{:?} @ {:?}",
            self.name(),
            self.file_size,
            self.file_attributes,
            self.position
        )
    }
}

/// This iterator walks the directory chain and returns a sequence of entries.
/// By default only live entries are returned; `slots()` returns every slot.
pub struct DirectoryIterator<'a> {
    chain: ChainIterator<'a>,
    chunks: ::std::vec::IntoIter<Vec<u8>>,
    position: Position,
    live_only: bool,
    done: bool,
}

impl<'a> DirectoryIterator<'a> {
    /// Iterate over the live entries of the directory starting at `start`.
    pub fn new(blocks: &'a dyn BlockDevice, start: Location) -> DirectoryIterator<'a> {
        DirectoryIterator {
            chain: ChainIterator::new(blocks, start),
            chunks: vec![].into_iter(), // Arrange to fetch a block the first time.
            position: Position {
                location: start,
                offset: 0,
                size: ENTRY_SIZE as u8,
            },
            live_only: true,
            done: false,
        }
    }

    /// Iterate over every slot of the directory, live or not.
    pub fn slots(blocks: &'a dyn BlockDevice, start: Location) -> DirectoryIterator<'a> {
        DirectoryIterator {
            live_only: false,
            ..DirectoryIterator::new(blocks, start)
        }
    }
}

impl<'a> Iterator for DirectoryIterator<'a> {
    type Item = io::Result<DirectoryEntry>;

    fn next(&mut self) -> Option<io::Result<DirectoryEntry>> {
        if self.done {
            return None;
        }
        loop {
            match self.chunks.next() {
                Some(chunk) => {
                    if chunk.len() != ENTRY_SIZE {
                        continue;
                    }
                    let entry_position = self.position;
                    // The offset wraps back to 0x00 after the last entry in a sector.
                    self.position.offset = self.position.offset.wrapping_add(ENTRY_SIZE as u8);

                    let entry = DirectoryEntry::from_positioned_bytes(&chunk, entry_position);
                    if self.live_only && !entry.is_live() {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                None => match self.chain.next() {
                    Some(Ok(block)) => {
                        self.chunks = block
                            .data
                            .chunks(ENTRY_SIZE)
                            .map(|c| c.to_vec())
                            .collect::<Vec<_>>()
                            .into_iter();
                        self.position.location = block.location;
                        self.position.offset = 0;
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => return None,
                },
            }
        }
    }
}

/// Return the locations of the directory sectors, in chain order.
pub(crate) fn directory_sectors(
    blocks: &dyn BlockDevice,
    start: Location,
) -> io::Result<Vec<Location>> {
    ChainIterator::new(blocks, start).locations()
}

/// Return a `DirectoryEntry` representing the next free slot in the
/// directory.  If every slot of the existing chain is in use, a new
/// directory sector is allocated on the directory track, zeroed, and linked
/// to the end of the chain.  The returned entry may be populated and written
/// back with `D64::write_directory_entry()`.
pub(crate) fn next_free_directory_entry(d64: &mut D64) -> io::Result<DirectoryEntry> {
    let format = d64.disk_format();
    let first_sector = format.first_directory_location();
    let mut last_sector = first_sector;

    // Search the existing directory chain for a free slot.
    for entry in DirectoryIterator::slots(d64.blocks(), first_sector) {
        let entry = entry?;
        if !entry.is_live() {
            return Ok(entry);
        }
        last_sector = entry.position()?.location;
    }

    // No free slots are available in the currently allocated directory
    // sectors, so extend the chain.
    let new_sector = format.next_free_directory_block(&d64.bam()?, last_sector)?;
    d64.bam_mut()?.allocate(new_sector)?;
    {
        let blocks = d64.blocks_mut();
        let block = blocks.sector_mut(new_sector)?;
        block.iter_mut().for_each(|b| *b = 0);
        ChainLink::Tail(BLOCK_SIZE).to_bytes(block);
        ChainLink::Next(new_sector).to_bytes(blocks.sector_mut(last_sector)?);
    }
    debug!("extended directory: {} -> {}", last_sector, new_sector);

    Ok(DirectoryEntry::from_positioned_bytes(
        &[0u8; ENTRY_SIZE],
        Position {
            location: new_sector,
            offset: 0,
            size: ENTRY_SIZE as u8,
        },
    ))
}

/// Confirm that the specified filename is valid and return its padded
/// on-disk form.  A filename is valid if it is non-empty, at most 16
/// characters, and every character fits in a byte other than the padding
/// byte.
pub fn check_filename_validity(name: &str) -> io::Result<[u8; FILENAME_LENGTH]> {
    if name.is_empty() {
        return Err(DiskError::InvalidFilename.into());
    }
    let mut filename = [PADDING_BYTE; FILENAME_LENGTH];
    util::encode_padded(name, &mut filename)?;
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_directory_entry() {
        const MAX_NEW_ENTRIES: usize = 1000;
        const MAX_DIRECTORY_ENTRIES: usize = 144;
        let mut disk = D64::new().unwrap();
        let mut disk_full: bool = false;
        let mut entries_written: usize = 0;
        for _ in 0..MAX_NEW_ENTRIES {
            let mut entry = match next_free_directory_entry(&mut disk) {
                Ok(entry) => entry,
                Err(ref e) => match DiskError::from_io_error(e) {
                    Some(ref e) if *e == DiskError::DiskFull => {
                        disk_full = true;
                        break;
                    }
                    Some(ref e) => panic!("error: {}", e),
                    None => break,
                },
            };

            entry.file_attributes = FileAttributes::new(FileType::PRG);
            entry.set_filename("filename").unwrap();
            disk.write_directory_entry(&entry).unwrap();
            entries_written += 1;
        }
        assert!(disk_full);
        assert_eq!(entries_written, MAX_DIRECTORY_ENTRIES);
        // Every sector on the directory track is now in use.
        assert_eq!(disk.bam().unwrap().free_count(18).unwrap(), 0);
        let sectors = directory_sectors(disk.blocks(), Location(18, 1)).unwrap();
        assert_eq!(sectors.len(), 18);
        assert_eq!(&sectors[..3], &[Location(18, 1), Location(18, 11), Location(18, 2)]);
    }

    #[test]
    fn test_directory_entry() {
        // All bits cleared
        static BUFFER1: [u8; ENTRY_SIZE] = [0u8; ENTRY_SIZE];
        let entry = DirectoryEntry::from_bytes(&BUFFER1);
        let mut output = [0u8; ENTRY_SIZE];
        entry.to_bytes(&mut output);
        assert_eq!(output, BUFFER1);
        assert_eq!(entry.file_attributes.file_type, FileType::DEL);
        assert!(!entry.file_attributes.unused_bit);
        assert!(!entry.file_attributes.save_with_replace_flag);
        assert!(!entry.file_attributes.locked_flag);
        assert!(!entry.is_live());
        assert_eq!(entry.first_sector, Location(0, 0));
        assert_eq!(entry.file_size, 0);

        // All bits set
        static BUFFER2: [u8; ENTRY_SIZE] = [0xFFu8; ENTRY_SIZE];
        let entry = DirectoryEntry::from_bytes(&BUFFER2);
        let mut output = [0u8; ENTRY_SIZE];
        output[0] = 0xff; // to_bytes() doesn't touch the first two bytes
        output[1] = 0xff;
        entry.to_bytes(&mut output);
        assert_eq!(output, BUFFER2);
        assert_eq!(entry.file_attributes.file_type, FileType::Unknown(0x0F));
        assert!(entry.file_attributes.unused_bit);
        assert!(entry.file_attributes.save_with_replace_flag);
        assert!(entry.file_attributes.locked_flag);
        assert!(entry.is_live());
        assert_eq!(entry.first_side_sector, Location(0xFF, 0xFF));
        assert_eq!(entry.record_length, 0xFF);
        assert_eq!(entry.replace_sector, Location(0xFF, 0xFF));
        assert_eq!(entry.file_size, 0xFFFF);

        // A real world example.
        // 00016620: 5347 8211 0541 5343 4949 2043 4f44 4553  SG...ASCII CODES
        // 00016630: a0a0 a0a0 a000 0000 0000 0000 0000 0600  ................
        static BUFFER3: [u8; ENTRY_SIZE] = [
            0x53, 0x47, 0x82, 0x11, 0x05, 0x41, 0x53, 0x43, 0x49, 0x49, 0x20, 0x43, 0x4f, 0x44,
            0x45, 0x53, 0xa0, 0xa0, 0xa0, 0xa0, 0xa0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x06, 0x00,
        ];
        let entry = DirectoryEntry::from_bytes(&BUFFER3);
        let mut output = [0u8; ENTRY_SIZE];
        output[0] = BUFFER3[0];
        output[1] = BUFFER3[1];
        entry.to_bytes(&mut output);
        assert_eq!(output, BUFFER3);
        assert_eq!(entry.file_attributes.file_type, FileType::PRG);
        assert!(entry.is_live());
        assert_eq!(entry.first_sector, Location(0x11, 0x05));
        assert_eq!(entry.name(), "ASCII CODES");
        assert_eq!(entry.scheme(), Scheme::Linear);
        assert_eq!(entry.file_size, 0x0006);
        assert_eq!(entry.to_string(), "6    \"ASCII CODES\"      prg ");
    }

    #[test]
    fn test_file_attributes() {
        let attributes = FileAttributes::from_byte(0xC4);
        assert_eq!(attributes.file_type, FileType::REL);
        assert!(attributes.locked_flag);
        assert!(attributes.is_live());
        assert_eq!(attributes.to_byte(), 0xC4);
        assert_eq!(attributes.to_string(), " rel<");
        assert_eq!(FileAttributes::new(FileType::SEQ).to_byte(), 0x81);
        assert_eq!(FileType::from_string("usr"), Some(FileType::USR));
        assert_eq!(FileType::from_string("xyz"), None);
    }

    #[test]
    fn test_filename_validity() {
        let name = check_filename_validity("HELLO").unwrap();
        assert_eq!(&name[..5], b"HELLO");
        assert_eq!(&name[5..], &[PADDING_BYTE; 11]);
        assert!(check_filename_validity("").unwrap_err() == DiskError::InvalidFilename);
        assert!(
            check_filename_validity("SEVENTEEN CHARS!!").unwrap_err()
                == DiskError::FilenameTooLong
        );
        assert!(check_filename_validity("SIXTEEN CHARS!!!").is_ok());
        assert!(check_filename_validity("\u{2603}").unwrap_err() == DiskError::InvalidFilename);
    }
}
