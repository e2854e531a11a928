//! CBM DOS files

use std::io::{self, Cursor, Read, Write};

use crate::disk::block::{BlockDevice, Location, Position, BLOCK_SIZE};
use crate::disk::chain::{self, ChainIterator, ChainLink, CHAIN_PAYLOAD_SIZE};
use crate::disk::directory::DirectoryEntry;
use crate::disk::DiskError;
use crate::util;

/// A scheme represents a particular file layout scheme.  This is different
/// from `FileType` which represents the CBM file type (PRG, SEQ, REL, or USR).
/// `Scheme` is used to differentiate between files that require different
/// access methods due to their structure.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Scheme {
    /// A regular, linear file that can be read from the beginning to the end.
    /// CBM PRG, SEQ, and USR files fall into this category.
    Linear,
    /// A CBM relative (REL) file.  In addition to the linear byte stream, this
    /// file type stores a record size value in the directory entry, and
    /// index information in a number of "side sectors" to allow random
    /// access of specific records.
    Relative,
}

/// A File represents a file that has been opened from a CBM disk image.
/// It borrows the disk image for as long as it is open.
pub enum File<'a> {
    /// The file is a regular, linear file that can be fully read from the
    /// beginning to the end.
    Linear(LinearFile<'a>),
    /// The file is a CBM relative (REL) file.
    Relative(RelativeFile<'a>),
}

/// This trait defines methods that are common across all file schemes.
pub trait FileOps {
    /// Return a reference to the directory entry from which this file was
    /// opened.
    fn entry(&self) -> &DirectoryEntry;
    /// Return the number of records that this file offers.  This will always
    /// be 1 for `Linear` files.
    fn record_count(&self) -> io::Result<usize>;
    /// Read an entire record into memory and return it.
    fn record(&self, index: usize) -> io::Result<Vec<u8>>;
    /// Write debug-level information about the file to the provided writer.
    fn details(&self, writer: &mut dyn Write, verbosity: usize) -> io::Result<()>;
    /// Return a list of sectors occupied by this file.
    fn occupied_sectors(&self) -> io::Result<Vec<Location>>;
    /// Read the entire byte stream of this file.
    fn contents(&self) -> io::Result<Vec<u8>>;

    /// Return a reader for the contents of this file.
    fn reader(&self) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.contents()?)))
    }

    /// Return the filename.
    fn name(&self) -> String {
        self.entry().name()
    }

    /// Hex-dump the file contents to the provided writer.
    fn dump(&self, writer: &mut dyn Write) -> io::Result<()> {
        writeln!(writer, "Filename: \"{}\"", self.name())?;
        for i in 0..self.record_count()? {
            writeln!(writer, "Record: {}", i)?;
            writeln!(writer, "{}", util::hex(&self.record(i)?))?;
        }
        Ok(())
    }
}

impl<'a> File<'a> {
    pub(crate) fn open_from_entry(
        blocks: &'a dyn BlockDevice,
        entry: &DirectoryEntry,
    ) -> io::Result<File<'a>> {
        let entry = entry.clone();
        let file = match entry.scheme() {
            Scheme::Linear => File::Linear(LinearFile::new(blocks, entry)),
            Scheme::Relative => File::Relative(RelativeFile::new(blocks, entry)?),
        };
        Ok(file)
    }

    /// Return a reference to the underlying specialized file.
    fn get_specialized_file(&self) -> &dyn FileOps {
        match self {
            File::Linear(f) => f,
            File::Relative(f) => f,
        }
    }
}

impl<'a> FileOps for File<'a> {
    fn entry(&self) -> &DirectoryEntry {
        self.get_specialized_file().entry()
    }

    fn record_count(&self) -> io::Result<usize> {
        self.get_specialized_file().record_count()
    }

    fn record(&self, index: usize) -> io::Result<Vec<u8>> {
        self.get_specialized_file().record(index)
    }

    fn details(&self, writer: &mut dyn Write, verbosity: usize) -> io::Result<()> {
        self.get_specialized_file().details(writer, verbosity)
    }

    fn occupied_sectors(&self) -> io::Result<Vec<Location>> {
        self.get_specialized_file().occupied_sectors()
    }

    fn contents(&self) -> io::Result<Vec<u8>> {
        self.get_specialized_file().contents()
    }
}

/// This is a specialized file type for conventional linear files that can be
/// fully read from the beginning to the end.
pub struct LinearFile<'a> {
    blocks: &'a dyn BlockDevice,
    entry: DirectoryEntry,
}

impl<'a> LinearFile<'a> {
    pub fn new(blocks: &'a dyn BlockDevice, entry: DirectoryEntry) -> LinearFile<'a> {
        LinearFile { blocks, entry }
    }
}

impl<'a> FileOps for LinearFile<'a> {
    fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    fn record_count(&self) -> io::Result<usize> {
        // A linear file always has one record.
        Ok(1)
    }

    fn record(&self, index: usize) -> io::Result<Vec<u8>> {
        if index == 0 {
            self.contents()
        } else {
            Err(DiskError::InvalidRecordIndex.into())
        }
    }

    fn details(&self, writer: &mut dyn Write, verbosity: usize) -> io::Result<()> {
        if verbosity > 0 {
            if let Some(position) = self.entry().position {
                writeln!(writer, "Directory position: {}", position)?;
            }
            let locations = ChainIterator::new(self.blocks, self.entry.first_sector).locations()?;
            writeln!(
                writer,
                "Occupied sectors: {}",
                Location::format_locations(&locations)
            )?;
        }
        Ok(())
    }

    fn occupied_sectors(&self) -> io::Result<Vec<Location>> {
        ChainIterator::new(self.blocks, self.entry.first_sector).locations()
    }

    fn contents(&self) -> io::Result<Vec<u8>> {
        chain::read_chain(self.blocks, self.entry.first_sector)
    }
}

pub(crate) const MAX_SIDE_SECTORS: usize = 6;
const SIDE_SECTOR_BLOCK_INDEX_OFFSET: usize = 0x02;
const SIDE_SECTOR_RECORD_LENGTH_OFFSET: usize = 0x03;
const SIDE_SECTOR_SSLIST_OFFSET: usize = 0x04;
const SIDE_SECTOR_DATA_OFFSET: usize = 0x10;
/// The number of data sector locations a single side sector can hold.
pub(crate) const SIDE_SECTOR_CAPACITY: usize = (BLOCK_SIZE - SIDE_SECTOR_DATA_OFFSET) / 2;

/// Return the number of side sectors needed to index `data_sectors` sectors.
#[inline]
pub(crate) fn side_sectors_needed(data_sectors: usize) -> usize {
    (data_sectors + SIDE_SECTOR_CAPACITY - 1) / SIDE_SECTOR_CAPACITY
}

/// Write the side sectors of a relative file.  Each side sector holds its
/// block index, the record length, the list of all side sectors of the file,
/// and the locations of up to 120 data sectors.
pub(crate) fn write_side_sectors(
    blocks: &mut dyn BlockDevice,
    side_sectors: &[Location],
    data_sectors: &[Location],
    record_length: u8,
) -> io::Result<()> {
    if side_sectors.len() > MAX_SIDE_SECTORS {
        return Err(DiskError::TooManySideSectors.into());
    }
    if side_sectors.len() != side_sectors_needed(data_sectors.len()) {
        return Err(DiskError::InvalidRelativeFile.into());
    }
    for (index, (location, chunk)) in side_sectors
        .iter()
        .zip(data_sectors.chunks(SIDE_SECTOR_CAPACITY))
        .enumerate()
    {
        let block = blocks.sector_mut(*location)?;
        block.iter_mut().for_each(|b| *b = 0);
        let link = match side_sectors.get(index + 1) {
            Some(next) => ChainLink::Next(*next),
            None => ChainLink::Tail(SIDE_SECTOR_DATA_OFFSET + chunk.len() * 2),
        };
        link.to_bytes(block);
        block[SIDE_SECTOR_BLOCK_INDEX_OFFSET] = index as u8;
        block[SIDE_SECTOR_RECORD_LENGTH_OFFSET] = record_length;
        for (i, side_sector) in side_sectors.iter().enumerate() {
            side_sector.write_bytes(&mut block[SIDE_SECTOR_SSLIST_OFFSET + i * 2..]);
        }
        for (i, data_sector) in chunk.iter().enumerate() {
            data_sector.write_bytes(&mut block[SIDE_SECTOR_DATA_OFFSET + i * 2..]);
        }
    }
    Ok(())
}

/// Relative ("REL") files are a special feature of the CBM filesystem where an
/// otherwise sequential data stream is split into fixed-size records, and
/// these records can be randomly accessed by way of an index stored in
/// so-called "side sectors".
pub struct RelativeFile<'a> {
    blocks: &'a dyn BlockDevice,
    entry: DirectoryEntry,
    record_size: usize,
    data_sectors: Vec<Location>,
    side_sectors: Vec<Location>,
    records: usize,
}

impl<'a> RelativeFile<'a> {
    pub fn new(blocks: &'a dyn BlockDevice, entry: DirectoryEntry) -> io::Result<RelativeFile<'a>> {
        let record_size = entry.record_length as usize;
        if record_size == 0 {
            return Err(DiskError::InvalidRelativeFile.into());
        }

        // Side sector locations are stored redundantly: once as a linked chain
        // of sectors, and also as a list within each side sector.  We check
        // all instances and consider it a formatting error if they are not
        // consistent.
        let mut side_sectors: Vec<Location> = vec![];
        let mut side_sector_lists: Vec<Vec<Location>> = vec![];
        let mut data_sectors: Vec<Location> = vec![];
        for sector in ChainIterator::new(blocks, entry.first_side_sector) {
            let sector = sector?;
            side_sectors.push(sector.location);
            let size = sector.data.len();
            if size < SIDE_SECTOR_DATA_OFFSET || size % 2 == 1 {
                // We must have an even number of bytes beyond SIDE_SECTOR_DATA_OFFSET.
                return Err(DiskError::InvalidRelativeFile.into());
            }
            if sector.data[SIDE_SECTOR_RECORD_LENGTH_OFFSET] as usize != record_size {
                return Err(DiskError::InvalidRelativeFile.into());
            }

            let list: Vec<Location> = sector.data
                [SIDE_SECTOR_SSLIST_OFFSET..SIDE_SECTOR_SSLIST_OFFSET + MAX_SIDE_SECTORS * 2]
                .chunks(2)
                .map(|c| Location::new(c[0], c[1]))
                .filter(|l| l.0 != 0)
                .collect();
            side_sector_lists.push(list);

            data_sectors.extend(
                sector.data[SIDE_SECTOR_DATA_OFFSET..size]
                    .chunks(2)
                    .map(|c| Location::new(c[0], c[1])),
            );
        }

        if side_sectors.len() > MAX_SIDE_SECTORS {
            return Err(DiskError::TooManySideSectors.into());
        }
        if side_sector_lists.iter().any(|list| *list != side_sectors) {
            return Err(DiskError::InvalidRelativeFile.into());
        }

        // Determine the total number of records
        let data_bytes_in_last_block = match data_sectors.last() {
            Some(location) => match ChainLink::new(blocks.sector(*location)?)? {
                ChainLink::Next(_) => return Err(DiskError::InvalidRelativeFile.into()),
                ChainLink::Tail(size) => size - 2, // Subtract link bytes
            },
            None => 0,
        };
        let data_in_full_blocks = data_sectors.len().saturating_sub(1) * CHAIN_PAYLOAD_SIZE;
        let data_size = data_in_full_blocks + data_bytes_in_last_block;
        if data_size % record_size != 0 {
            return Err(DiskError::InvalidRelativeFile.into());
        }

        Ok(RelativeFile {
            blocks,
            entry,
            record_size,
            data_sectors,
            side_sectors,
            records: data_size / record_size,
        })
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    #[inline]
    pub fn side_sectors(&self) -> &[Location] {
        &self.side_sectors
    }

    #[inline]
    pub fn data_sectors(&self) -> &[Location] {
        &self.data_sectors
    }

    /// Return position information for the given record.  Since a record may
    /// straddle sector boundaries, a second position may be required to
    /// fully represent the record's storage.
    fn record_position(&self, index: usize) -> io::Result<(Position, Option<Position>)> {
        if index >= self.records {
            return Err(DiskError::InvalidRecordIndex.into());
        }
        let data_offset = self.record_size * index;
        let sector_index = data_offset / CHAIN_PAYLOAD_SIZE;
        let sector_offset = data_offset % CHAIN_PAYLOAD_SIZE + 2;
        if sector_offset + self.record_size <= BLOCK_SIZE {
            Ok((
                Position {
                    location: self.data_sectors[sector_index],
                    offset: sector_offset as u8,
                    size: self.record_size as u8,
                },
                None,
            ))
        } else {
            let bytes_in_next_sector = (sector_offset + self.record_size) - BLOCK_SIZE;
            Ok((
                Position {
                    location: self.data_sectors[sector_index],
                    offset: sector_offset as u8,
                    size: (self.record_size - bytes_in_next_sector) as u8,
                },
                Some(Position {
                    location: self.data_sectors[sector_index + 1],
                    offset: 2,
                    size: bytes_in_next_sector as u8,
                }),
            ))
        }
    }
}

impl<'a> FileOps for RelativeFile<'a> {
    fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    fn record_count(&self) -> io::Result<usize> {
        Ok(self.records)
    }

    fn record(&self, index: usize) -> io::Result<Vec<u8>> {
        let positions = self.record_position(index)?;
        let mut record = self.blocks.read_position(&positions.0)?.to_vec();
        if let Some(position) = positions.1 {
            record.extend_from_slice(self.blocks.read_position(&position)?);
        }
        if record.len() != self.record_size {
            return Err(DiskError::InvalidRelativeFile.into());
        }
        Ok(record)
    }

    fn details(&self, writer: &mut dyn Write, verbosity: usize) -> io::Result<()> {
        writeln!(writer, "Record length: {}", self.record_size)?;
        writeln!(writer, "Records: {}", self.records)?;
        if verbosity > 0 {
            if let Some(position) = self.entry().position {
                writeln!(writer, "Directory position: {}", position)?;
            }
            writeln!(
                writer,
                "Data sectors: {}",
                Location::format_locations(&self.data_sectors)
            )?;
            writeln!(
                writer,
                "Side sectors: {}",
                Location::format_locations(&self.side_sectors)
            )?;
        }
        Ok(())
    }

    fn occupied_sectors(&self) -> io::Result<Vec<Location>> {
        let mut locations = self.side_sectors.clone();
        locations.extend(self.data_sectors.iter());
        Ok(locations)
    }

    fn contents(&self) -> io::Result<Vec<u8>> {
        chain::read_sectors(self.blocks, &self.data_sectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::D64;

    #[test]
    fn test_side_sector_layout() {
        let mut d64 = D64::new().unwrap();
        let data: Vec<u8> = (0..130 * 10).map(|i| (i / 10) as u8).collect();
        let entry = d64.add_relative_file("RECORDS", &data, 10).unwrap();
        assert_eq!(entry.record_length, 10);
        let side = d64.read_sector(entry.first_side_sector).unwrap();
        // 1300 bytes need 6 data sectors, all listed in a single side sector.
        assert_eq!(side[0], 0x00);
        assert_eq!(side[1] as usize, SIDE_SECTOR_DATA_OFFSET + 6 * 2 - 1);
        assert_eq!(side[SIDE_SECTOR_BLOCK_INDEX_OFFSET], 0);
        assert_eq!(side[SIDE_SECTOR_RECORD_LENGTH_OFFSET], 10);
        assert_eq!(
            &side[SIDE_SECTOR_SSLIST_OFFSET..SIDE_SECTOR_SSLIST_OFFSET + 2],
            &[entry.first_side_sector.0, entry.first_side_sector.1]
        );
        assert_eq!(
            &side[SIDE_SECTOR_DATA_OFFSET..SIDE_SECTOR_DATA_OFFSET + 2],
            &[entry.first_sector.0, entry.first_sector.1]
        );
    }

    #[test]
    fn test_relative_records() {
        let mut d64 = D64::new().unwrap();
        let data: Vec<u8> = (0..200 * 64).map(|i| (i / 64) as u8).collect();
        d64.add_relative_file("REL", &data, 64).unwrap();
        let file = d64.open_file("REL").unwrap();
        assert_eq!(file.record_count().unwrap(), 200);
        // Record 3 straddles the first and second data sectors.
        assert_eq!(file.record(3).unwrap(), vec![3u8; 64]);
        assert_eq!(file.record(199).unwrap(), vec![199u8; 64]);
        assert!(file.record(200).unwrap_err() == DiskError::InvalidRecordIndex);
        assert_eq!(file.contents().unwrap(), data);
        match file {
            File::Relative(ref rel) => {
                assert_eq!(rel.side_sectors().len(), 1);
                assert_eq!(rel.data_sectors().len(), 51);
                assert_eq!(rel.record_size(), 64);
            }
            File::Linear(_) => panic!("expected a relative file"),
        }
        assert_eq!(file.occupied_sectors().unwrap().len(), 52);
    }

    #[test]
    fn test_linear_file_ops() {
        let mut d64 = D64::new().unwrap();
        let data = vec![0x42u8; 300];
        d64.add_file("LINEAR", crate::disk::FileType::PRG, &data)
            .unwrap();
        let file = d64.open_file("LINEAR").unwrap();
        assert_eq!(file.name(), "LINEAR");
        assert_eq!(file.record_count().unwrap(), 1);
        assert_eq!(file.record(0).unwrap(), data);
        assert!(file.record(1).unwrap_err() == DiskError::InvalidRecordIndex);
        assert_eq!(
            file.occupied_sectors().unwrap(),
            vec![Location(17, 10), Location(17, 20)]
        );
        let mut read_back = vec![];
        file.reader().unwrap().read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, data);

        let mut details = vec![];
        file.details(&mut details, 1).unwrap();
        let details = String::from_utf8(details).unwrap();
        assert!(details.contains("Occupied sectors: (17,10) (17,20)"));
    }

    #[test]
    fn test_side_sectors_needed() {
        assert_eq!(SIDE_SECTOR_CAPACITY, 120);
        assert_eq!(side_sectors_needed(1), 1);
        assert_eq!(side_sectors_needed(120), 1);
        assert_eq!(side_sectors_needed(121), 2);
        assert_eq!(side_sectors_needed(720), 6);
        assert_eq!(side_sectors_needed(721), 7);
    }
}
