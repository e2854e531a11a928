use std::fmt;
use std::fmt::Write;
use std::io;

use crate::disk::block::Location;
use crate::disk::error::DiskError;
use crate::disk::DiskFormat;

/// A BamFormat describes how BAM information is stored for a particular disk
/// image format.
pub struct BamFormat {
    /// The sector holding the BAM.
    pub location: Location,
    /// The list of sections where BAM entries are stored within that sector.
    pub sections: &'static [BamSection],
}

/// BAM can be stored in one or more sections.  Each section stores BAM
/// entries for a consecutive range of tracks.  (The 40-track layout keeps
/// tracks 36-40 in a second section.)
pub struct BamSection {
    /// The first track described by this section.
    pub first_track: u8,
    /// The total number of tracks (and hence entries) in this section.
    pub tracks: u8,
    /// The offset of the first track's free sector count.
    pub free_offset: usize,
    /// The offset of the first track's bitmap.
    pub bitmap_offset: usize,
    /// The size in bytes of the bitmap.
    pub bitmap_size: usize,
    /// How many bytes apart are consecutive entries?
    pub stride: usize,
}

impl BamSection {
    #[inline]
    fn contains(&self, track: u8) -> bool {
        track >= self.first_track && track < self.first_track + self.tracks
    }
}

/// The decoded BAM entry of one track: the stored free sector count and the
/// bitmap of free sectors (bit set means free).
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BamEntry {
    pub free_sectors: u8,
    pub sector_map: u32,
}

impl BamEntry {
    /// An entry with every one of `sectors` sectors free.
    pub fn new(sectors: u8) -> BamEntry {
        BamEntry {
            free_sectors: sectors,
            sector_map: (1u32 << sectors) - 1,
        }
    }

    pub fn from_bytes(free_sectors: u8, bitmap: &[u8]) -> BamEntry {
        let sector_map = bitmap
            .iter()
            .rev()
            .fold(0u32, |map, byte| (map << 8) | *byte as u32);
        BamEntry {
            free_sectors,
            sector_map,
        }
    }

    pub fn write_bitmap(&self, bitmap: &mut [u8]) {
        let mut sector_map = self.sector_map;
        for output_byte_ref in bitmap.iter_mut() {
            *output_byte_ref = (sector_map & 0xFF) as u8;
            sector_map >>= 8;
        }
    }

    #[inline]
    pub fn sector_map(&self) -> u32 {
        self.sector_map
    }

    #[inline]
    pub fn is_free(&self, sector: u8) -> bool {
        self.sector_map >> sector & 1 == 1
    }

    /// Count the free bits among the first `sectors` sectors.
    #[inline]
    pub fn bitmap_free_count(&self, sectors: u8) -> u8 {
        (self.sector_map & ((1u32 << sectors) - 1)).count_ones() as u8
    }
}

/// A view of the BAM sector.  The BAM holds no state of its own; every query
/// and update goes straight to the sector bytes, so low-level sector writes
/// are always reflected.  `S` is `&[u8]` for reading and `&mut [u8]` for
/// updating.
pub struct Bam<S> {
    format: &'static DiskFormat,
    block: S,
}

impl<S: AsRef<[u8]>> Bam<S> {
    pub fn new(format: &'static DiskFormat, block: S) -> Bam<S> {
        Bam { format, block }
    }

    fn section(&self, track: u8) -> io::Result<(&'static BamSection, usize)> {
        if track > self.format.last_track {
            return Err(DiskError::InvalidLocation.into());
        }
        self.format
            .bam
            .sections
            .iter()
            .find(|s| s.contains(track))
            .map(|s| (s, (track - s.first_track) as usize * s.stride))
            .ok_or_else(|| DiskError::InvalidLocation.into())
    }

    fn check_location(&self, location: Location) -> io::Result<()> {
        if self.format.is_valid_location(location) {
            Ok(())
        } else {
            Err(DiskError::InvalidLocation.into())
        }
    }

    pub fn entry(&self, track: u8) -> io::Result<BamEntry> {
        let (section, offset) = self.section(track)?;
        let block = self.block.as_ref();
        let bitmap = section.bitmap_offset + offset;
        Ok(BamEntry::from_bytes(
            block[section.free_offset + offset],
            &block[bitmap..bitmap + section.bitmap_size],
        ))
    }

    #[inline]
    pub fn free_count(&self, track: u8) -> io::Result<u8> {
        Ok(self.entry(track)?.free_sectors)
    }

    pub fn is_free(&self, location: Location) -> io::Result<bool> {
        self.check_location(location)?;
        Ok(self.entry(location.0)?.is_free(location.1))
    }

    /// Return the number of blocks free on the disk image, sans the directory
    /// track.  This is equivalent to the "blocks free" output at the bottom
    /// of a directory listing, and is calculated from the stored free sector
    /// counts rather than the bitmaps.
    pub fn blocks_free(&self) -> usize {
        (self.format.first_track..=self.format.last_track)
            .filter(|t| *t != self.format.directory_track)
            .filter_map(|t| self.free_count(t).ok())
            .map(|n| n as usize)
            .sum()
    }

    fn sectors_with_state(&self, free: bool) -> io::Result<Vec<Location>> {
        let mut locations = vec![];
        for track in self.format.first_track..=self.format.last_track {
            let entry = self.entry(track)?;
            for sector in 0..self.format.sectors_in_track(track) {
                if entry.is_free(sector) == free {
                    locations.push(Location::new(track, sector));
                }
            }
        }
        Ok(locations)
    }

    pub fn allocated_sectors(&self) -> io::Result<Vec<Location>> {
        self.sectors_with_state(false)
    }

    pub fn free_sectors(&self) -> io::Result<Vec<Location>> {
        self.sectors_with_state(true)
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Bam<S> {
    pub fn set_entry(&mut self, track: u8, entry: &BamEntry) -> io::Result<()> {
        let (section, offset) = self.section(track)?;
        let block = self.block.as_mut();
        block[section.free_offset + offset] = entry.free_sectors;
        let bitmap = section.bitmap_offset + offset;
        entry.write_bitmap(&mut block[bitmap..bitmap + section.bitmap_size]);
        Ok(())
    }

    /// Mark a free sector as allocated and decrement the track's free count.
    pub fn allocate(&mut self, location: Location) -> io::Result<()> {
        self.check_location(location)?;
        let mut entry = self.entry(location.0)?;
        if !entry.is_free(location.1) {
            return Err(DiskError::SectorAlreadyAllocated.into());
        }
        entry.sector_map &= !(1u32 << location.1);
        entry.free_sectors = entry.free_sectors.saturating_sub(1);
        self.set_entry(location.0, &entry)
    }

    /// Mark an allocated sector as free and increment the track's free count.
    pub fn free(&mut self, location: Location) -> io::Result<()> {
        self.check_location(location)?;
        let mut entry = self.entry(location.0)?;
        if entry.is_free(location.1) {
            return Err(DiskError::SectorAlreadyFree.into());
        }
        entry.sector_map |= 1u32 << location.1;
        entry.free_sectors = entry.free_sectors.saturating_add(1);
        self.set_entry(location.0, &entry)
    }

    /// Set a sector's bitmap bit without touching the free count.
    pub fn set_sector_free(&mut self, location: Location, free: bool) -> io::Result<()> {
        self.check_location(location)?;
        let mut entry = self.entry(location.0)?;
        if free {
            entry.sector_map |= 1u32 << location.1;
        } else {
            entry.sector_map &= !(1u32 << location.1);
        }
        self.set_entry(location.0, &entry)
    }

    pub fn set_free_count(&mut self, track: u8, free_sectors: u8) -> io::Result<()> {
        let mut entry = self.entry(track)?;
        entry.free_sectors = free_sectors;
        self.set_entry(track, &entry)
    }

    /// Mark every sector on the disk as free.
    pub fn reset(&mut self) -> io::Result<()> {
        for track in self.format.first_track..=self.format.last_track {
            let entry = BamEntry::new(self.format.sectors_in_track(track));
            self.set_entry(track, &entry)?;
        }
        Ok(())
    }
}

impl<S: AsRef<[u8]>> fmt::Debug for Bam<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for track in self.format.first_track..=self.format.last_track {
            let entry = self.entry(track).map_err(|_| fmt::Error)?;
            let sectors = self.format.sectors_in_track(track);
            write!(
                f,
                "t{:02}: [{:02}/{:02}] ",
                track, entry.free_sectors, sectors
            )?;
            for sector in 0..sectors {
                f.write_char(if entry.is_free(sector) { '.' } else { 'x' })?;
            }
            f.write_char('\n')?;
        }
        writeln!(f, "{} blocks free.", self.blocks_free())
    }
}
