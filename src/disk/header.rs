use std::fmt;
use std::io;

use crate::disk::block::{BlockDevice, Location};
use crate::disk::format::DiskFormat;
use crate::disk::{Id, DISK_NAME_SIZE, PADDING_BYTE};
use crate::util;

/// A HeaderFormat describes how header information is stored for a particular
/// disk image format.
pub struct HeaderFormat {
    pub location: Location,
    // offsets
    pub first_directory_offset: usize,
    pub disk_format_type_offset: usize,
    pub disk_name_offset: usize,
    pub disk_id_offset: usize,
    pub dos_type_offset: usize,
    pub padding_offsets: &'static [u8],
    // defaults
    pub default_disk_format_type: u8,
    pub default_dos_type: [u8; 2],
}

/// The disk header: name, id, and DOS version information.
#[derive(Clone, PartialEq)]
pub struct Header {
    pub first_directory_sector: Location,
    pub disk_format_type: u8,
    pub disk_name: [u8; DISK_NAME_SIZE],
    pub disk_id: Id,
    pub dos_type: [u8; 2],
}

impl Header {
    pub fn new(disk_format: &DiskFormat, name: &str, id: &Id) -> io::Result<Header> {
        let header_format = disk_format.header;
        let mut disk_name = [PADDING_BYTE; DISK_NAME_SIZE];
        util::encode_padded(name, &mut disk_name)?;
        Ok(Header {
            first_directory_sector: disk_format.first_directory_location(),
            disk_format_type: header_format.default_disk_format_type,
            disk_name,
            disk_id: *id,
            dos_type: header_format.default_dos_type,
        })
    }

    /// Read a header from disk using the provided header format.
    pub fn read(blocks: &dyn BlockDevice, format: &HeaderFormat) -> io::Result<Header> {
        let block = blocks.sector(format.location)?;
        let mut disk_name = [0u8; DISK_NAME_SIZE];
        disk_name
            .copy_from_slice(&block[format.disk_name_offset..format.disk_name_offset + DISK_NAME_SIZE]);
        Ok(Header {
            first_directory_sector: Location::from_bytes(&block[format.first_directory_offset..]),
            disk_format_type: block[format.disk_format_type_offset],
            disk_name,
            disk_id: Id::from_bytes(&block[format.disk_id_offset..format.disk_id_offset + 2]),
            dos_type: [
                block[format.dos_type_offset],
                block[format.dos_type_offset + 1],
            ],
        })
    }

    /// Write the header into its sector.  Only the regions corresponding to
    /// the fields we know about are touched, so the BAM bytes sharing the
    /// sector are preserved.
    pub fn write(&self, blocks: &mut dyn BlockDevice, format: &HeaderFormat) -> io::Result<()> {
        let block = blocks.sector_mut(format.location)?;
        self.first_directory_sector
            .write_bytes(&mut block[format.first_directory_offset..]);
        block[format.disk_format_type_offset] = self.disk_format_type;
        block[format.disk_name_offset..format.disk_name_offset + DISK_NAME_SIZE]
            .copy_from_slice(&self.disk_name);
        block[format.disk_id_offset] = self.disk_id[0];
        block[format.disk_id_offset + 1] = self.disk_id[1];
        block[format.dos_type_offset] = self.dos_type[0];
        block[format.dos_type_offset + 1] = self.dos_type[1];

        // Headers should have certain bytes set to the padding byte (0xA0).  If this
        // is not done, directory listings generated by CBM DOS will be garbled
        // on the "blocks free" line.
        for padding_offset in format.padding_offsets {
            block[*padding_offset as usize] = PADDING_BYTE;
        }
        Ok(())
    }

    /// Return the disk name without its padding.
    pub fn name(&self) -> String {
        util::decode_padded(&self.disk_name)
    }

    pub fn set_name(&mut self, name: &str) -> io::Result<()> {
        let mut disk_name = [PADDING_BYTE; DISK_NAME_SIZE];
        util::encode_padded(name, &mut disk_name)?;
        self.disk_name = disk_name;
        Ok(())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "0 \"{:16}\" {} {}{}",
            self.name(),
            self.disk_id,
            self.dos_type[0] as char,
            self.dos_type[1] as char
        )
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "disk name: {:?}", self.name())?;
        writeln!(f, "disk id: {:?}", self.disk_id)?;
        writeln!(
            f,
            "dos type: {}{}",
            self.dos_type[0] as char, self.dos_type[1] as char
        )?;
        writeln!(f, "first directory sector: {}", self.first_directory_sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::D64;

    #[test]
    fn test_header_bytes() {
        let mut d64 = D64::new().unwrap();
        d64.format_with_id("TEST DISK", &"t1".into()).unwrap();
        let block = d64.read_sector(Location(18, 0)).unwrap();
        assert_eq!(&block[0x00..0x03], &[18, 1, b'A']);
        assert_eq!(&block[0x90..0x99], b"TEST DISK");
        assert_eq!(&block[0x99..0xA2], &[PADDING_BYTE; 9]);
        assert_eq!(&block[0xA2..0xAB], &[b't', b'1', 0xA0, b'2', b'A', 0xA0, 0xA0, 0xA0, 0xA0]);

        let header = d64.header().unwrap();
        assert_eq!(header.name(), "TEST DISK");
        assert_eq!(header.to_string(), "0 \"TEST DISK       \" t1 2A");
    }
}
