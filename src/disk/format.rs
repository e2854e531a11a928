use std::io;

use crate::disk::bam::{Bam, BamFormat};
use crate::disk::block::{Location, BLOCK_SIZE};
use crate::disk::directory::ENTRY_SIZE;
use crate::disk::error::DiskError;
use crate::disk::header::HeaderFormat;
use crate::disk::Geometry;

#[derive(Debug)]
pub struct Track {
    pub sectors: u8,
    pub sector_offset: u16,
    pub byte_offset: u32,
}

/// A description of how CBM DOS lays out its structures on a disk of a
/// particular geometry.
pub struct DiskFormat {
    pub directory_track: u8,
    /// This is also pointed to from the header sector.
    pub first_directory_sector: u8,
    pub first_track: u8,
    /// The last track in use.  (I.e., inclusive -- not the last track plus
    /// one.)
    pub last_track: u8,
    /// The sector skip used when searching a track for a free sector.
    pub interleave: u8,
    /// Per-track parameters for this format (e.g. sectors in each track, byte
    /// offsets, etc.)
    pub tracks: &'static [Track],
    /// The image layout this format applies to.
    pub geometry: &'static Geometry,
    /// A description of the header format for this disk format.
    pub header: &'static HeaderFormat,
    /// A description of the BAM format for this disk format.
    pub bam: &'static BamFormat,
}

impl DiskFormat {
    #[inline]
    pub fn sectors_in_track(&self, track: u8) -> u8 {
        if track < self.first_track || track > self.last_track {
            0
        } else {
            self.tracks[track as usize].sectors
        }
    }

    #[inline]
    pub fn first_directory_location(&self) -> Location {
        Location(self.directory_track, self.first_directory_sector)
    }

    #[inline]
    pub fn bam_location(&self) -> Location {
        self.bam.location
    }

    /// Return the list of locations which are reserved by CBM DOS and marked
    /// as allocated when a disk image is newly formatted.
    pub fn system_locations(&self) -> Vec<Location> {
        let mut locations = vec![
            self.header.location,
            self.bam.location,
            self.first_directory_location(),
        ];
        // On the 1541 the BAM sector and header sector are the same.
        locations.sort();
        locations.dedup();
        locations
    }

    /// Return the maximum number of directory entries that are possible for
    /// this format.
    pub fn max_directory_entries(&self) -> usize {
        let total_sectors = self.sectors_in_track(self.directory_track) as usize;
        // -1 because system_locations includes the first directory sector.
        let used_sectors = self
            .system_locations()
            .iter()
            .filter(|Location(t, _)| *t == self.directory_track)
            .count()
            - 1;
        (total_sectors - used_sectors) * BLOCK_SIZE / ENTRY_SIZE
    }

    /// Return the total number of data blocks available for files on a freshly
    /// formatted disk. This is the equivalent of the listed "blocks free"
    /// on a blank disk.
    pub fn total_data_blocks(&self) -> usize {
        (self.first_track..=self.last_track)
            .filter(|t| *t != self.directory_track)
            .map(|t| self.sectors_in_track(t) as usize)
            .sum()
    }

    /// Return the order in which tracks are searched for free sectors: the
    /// directory track first, then alternating outward from it, lower track
    /// first.
    pub fn track_search_order(&self) -> Vec<u8> {
        let mut order = vec![self.directory_track];
        let max_distance = ::std::cmp::max(
            self.directory_track - self.first_track,
            self.last_track - self.directory_track,
        );
        for distance in 1..=max_distance {
            if distance <= self.directory_track - self.first_track {
                order.push(self.directory_track - distance);
            }
            if distance <= self.last_track - self.directory_track {
                order.push(self.directory_track + distance);
            }
        }
        order
    }

    /// Scan a track for a free sector, starting at `start` and wrapping
    /// around.
    fn free_sector_in_track<S: AsRef<[u8]>>(
        &self,
        bam: &Bam<S>,
        track: u8,
        start: u8,
    ) -> io::Result<Option<u8>> {
        let num_sectors = self.sectors_in_track(track);
        let map = bam.entry(track)?.sector_map();
        Ok((0..num_sectors)
            .map(|i| (start + i) % num_sectors)
            .find(|sector| map >> sector & 1 == 1))
    }

    /// Find the next free data sector.  The directory track is never used
    /// for file data.  Within a track, the search starts one interleave past
    /// the last sector allocated on that track, or past sector 0 if nothing
    /// has been allocated there yet.
    pub fn next_free_block<S: AsRef<[u8]>>(
        &self,
        bam: &Bam<S>,
        last_sector_used: &[u8],
    ) -> io::Result<Location> {
        for track in self.track_search_order() {
            if track == self.directory_track {
                continue;
            }
            let num_sectors = self.sectors_in_track(track);
            let last = last_sector_used.get(track as usize).cloned().unwrap_or(0);
            let start = (last + self.interleave) % num_sectors;
            if let Some(sector) = self.free_sector_in_track(bam, track, start)? {
                return Ok(Location(track, sector));
            }
        }
        Err(DiskError::DiskFull.into())
    }

    /// Find a free sector on the directory track to extend the directory
    /// chain whose current last sector is `previous`.
    pub fn next_free_directory_block<S: AsRef<[u8]>>(
        &self,
        bam: &Bam<S>,
        previous: Location,
    ) -> io::Result<Location> {
        let track = self.directory_track;
        let start = (previous.1 + self.interleave) % self.sectors_in_track(track);
        match self.free_sector_in_track(bam, track, start)? {
            Some(sector) => Ok(Location(track, sector)),
            None => Err(DiskError::DiskFull.into()),
        }
    }

    #[inline]
    pub fn is_valid_location(&self, location: Location) -> bool {
        location.1 < self.sectors_in_track(location.0)
    }
}
