//! Types and functions for working with 1541 disk images.
//!
//! A disk image is a single owned byte buffer.  Every other structure (the
//! header, the BAM, directory sectors, file chains, and side sectors) is a
//! view over some range of that buffer, addressed by track and sector through
//! [`Geometry::offset`].

mod bam;
mod block;
mod chain;
mod d64;
mod error;
mod format;
mod header;
mod image;
mod validation;

pub mod directory;
pub mod file;

use std::fmt;
use std::io;
use std::ops::{Index, IndexMut};

pub use self::bam::{Bam, BamEntry};
pub use self::block::{BlockDevice, Location, Position, BLOCK_SIZE};
pub use self::d64::D64;
pub use self::directory::{DirectoryEntry, FileAttributes, FileType};
pub use self::error::DiskError;
pub use self::file::{File, FileOps, Scheme};
pub use self::format::{DiskFormat, Track};
pub use self::header::Header;
pub use self::image::Image;
pub use self::validation::ValidationError;

const PADDING_BYTE: u8 = 0xa0; // For padding filenames, disk name, etc.
const DISK_NAME_SIZE: usize = 16;

/// A `Geometry` specifies the track and sector layout of a disk image.  Track
/// numbers are 1-based and sector numbers are 0-based.
#[derive(Debug)]
pub struct Geometry {
    track_layouts: &'static [Track],
    tracks: u8,
}

impl Geometry {
    /// Given a disk image file size, return the first matching geometry.
    pub fn find_by_size(
        size: usize,
        geometries: &[&'static Geometry],
    ) -> Option<&'static Geometry> {
        geometries.iter().find(|g| g.size() == size).copied()
    }

    /// Return the number of tracks in this geometry.
    #[inline]
    pub fn tracks(&self) -> u8 {
        self.tracks
    }

    /// Return the number of sectors in the specified track, or zero if the
    /// track does not exist in this geometry.
    #[inline]
    pub fn sectors_in_track(&self, track: u8) -> u8 {
        if track < 1 || track > self.tracks {
            0
        } else {
            self.track_layouts[track as usize].sectors
        }
    }

    /// Return the total number of sectors on the disk.
    pub fn total_sectors(&self) -> usize {
        (1..=self.tracks)
            .map(|t| self.sectors_in_track(t) as usize)
            .sum()
    }

    /// Return the total number of bytes used to represent a disk image in this
    /// geometry.
    pub fn size(&self) -> usize {
        let last = &self.track_layouts[self.tracks as usize];
        last.byte_offset as usize + last.sectors as usize * BLOCK_SIZE
    }

    /// Return true if the location is a valid track and sector.
    #[inline]
    pub fn contains(&self, location: Location) -> bool {
        location.1 < self.sectors_in_track(location.0)
    }

    /// Translate a track, sector, and byte offset into an index into the
    /// image buffer.
    pub fn offset(&self, location: Location, byte_offset: usize) -> io::Result<usize> {
        if !self.contains(location) {
            return Err(DiskError::InvalidLocation.into());
        }
        if byte_offset >= BLOCK_SIZE {
            return Err(DiskError::InvalidOffset.into());
        }
        let track = &self.track_layouts[location.0 as usize];
        Ok(track.byte_offset as usize + location.1 as usize * BLOCK_SIZE + byte_offset)
    }
}

/// The two-byte disk identifier stored in the header and shown in directory
/// listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Id([u8; 2]);

impl Id {
    pub fn from_bytes(bytes: &[u8]) -> Id {
        bytes.into()
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<'a> From<&'a [u8]> for Id {
    fn from(bytes: &[u8]) -> Id {
        // Best-effort only.  Missing bytes are padded.
        Id([
            bytes.first().copied().unwrap_or(PADDING_BYTE),
            bytes.get(1).copied().unwrap_or(PADDING_BYTE),
        ])
    }
}

impl<'a> From<&'a str> for Id {
    fn from(string: &str) -> Id {
        let bytes: Vec<u8> = string
            .chars()
            .take(2)
            .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
            .collect();
        Id::from(&bytes[..])
    }
}

impl Index<usize> for Id {
    type Output = u8;
    fn index(&self, i: usize) -> &u8 {
        &self.0[i]
    }
}

impl IndexMut<usize> for Id {
    fn index_mut(&mut self, i: usize) -> &mut u8 {
        &mut self.0[i]
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{}", *b as char)?;
        }
        Ok(())
    }
}
