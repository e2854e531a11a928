use std::fmt;
use std::io::{self, Write};

use crate::disk::error::DiskError;
use crate::disk::image::Image;
use crate::disk::Geometry;
use crate::util;

pub const BLOCK_SIZE: usize = 256;

/// Sector-level access to a disk image.  All track/sector to byte translation
/// goes through the geometry's `offset()`.
pub trait BlockDevice {
    fn check_writability(&self) -> io::Result<()>;
    fn geometry(&self) -> &Geometry;
    fn sector(&self, location: Location) -> io::Result<&[u8]>;
    fn sector_mut(&mut self, location: Location) -> io::Result<&mut [u8]>;
    fn flush(&mut self) -> io::Result<()>;

    /// Return the absolute image offset of a byte within a sector.
    #[inline]
    fn offset(&self, location: Location, byte_offset: usize) -> io::Result<usize> {
        self.geometry().offset(location, byte_offset)
    }

    fn sector_owned(&self, location: Location) -> io::Result<Vec<u8>> {
        Ok(self.sector(location)?.to_owned())
    }

    fn byte(&self, location: Location, byte_offset: usize) -> io::Result<u8> {
        if byte_offset >= BLOCK_SIZE {
            return Err(DiskError::InvalidOffset.into());
        }
        Ok(self.sector(location)?[byte_offset])
    }

    fn set_byte(&mut self, location: Location, byte_offset: usize, value: u8) -> io::Result<()> {
        if byte_offset >= BLOCK_SIZE {
            return Err(DiskError::InvalidOffset.into());
        }
        self.sector_mut(location)?[byte_offset] = value;
        Ok(())
    }

    fn read_position<'a>(&'a self, position: &Position) -> io::Result<&'a [u8]> {
        let block = self.sector(position.location)?;
        Ok(&block[position.range()])
    }

    fn positioned_read(&self, positioned_data: &mut dyn PositionedData) -> io::Result<()> {
        let position = positioned_data.position()?;
        let block = self.sector(position.location)?;
        positioned_data.positioned_read(&block[position.range()])
    }

    fn positioned_write(&mut self, positioned_data: &dyn PositionedData) -> io::Result<()> {
        let position = positioned_data.position()?;
        let block = self.sector_mut(position.location)?;
        positioned_data.positioned_write(&mut block[position.range()])
    }

    /// Write a hex dump of every sector to the provided writer.
    fn dump(&self, writer: &mut dyn Write) -> io::Result<()> {
        for location in LocationIterator::from_geometry(self.geometry()) {
            writeln!(writer)?;
            writeln!(writer, "track {:02} sector {:02}", location.0, location.1)?;
            let block = self.sector(location)?;
            writeln!(writer, "{}", util::hex(block))?;
        }
        Ok(())
    }
}

pub struct ImageBlockDevice {
    image: Image,
    geometry: &'static Geometry,
}

impl ImageBlockDevice {
    pub fn new(image: Image, geometry: &'static Geometry) -> ImageBlockDevice {
        ImageBlockDevice { image, geometry }
    }

    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }
}

impl BlockDevice for ImageBlockDevice {
    #[inline]
    fn check_writability(&self) -> io::Result<()> {
        self.image.check_writability()
    }

    #[inline]
    fn geometry(&self) -> &Geometry {
        self.geometry
    }

    fn sector(&self, location: Location) -> io::Result<&[u8]> {
        let offset = self.geometry.offset(location, 0)?;
        self.image.slice(offset, BLOCK_SIZE)
    }

    fn sector_mut(&mut self, location: Location) -> io::Result<&mut [u8]> {
        self.image.check_writability()?;
        let offset = self.geometry.offset(location, 0)?;
        self.image.slice_mut(offset, BLOCK_SIZE)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.image.check_writability()?;
        self.image.flush()
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct Location(pub u8, pub u8); // Track and sector

impl Location {
    #[inline]
    pub fn new(track: u8, sector: u8) -> Location {
        Location(track, sector)
    }

    pub fn from_bytes(bytes: &[u8]) -> Location {
        assert!(bytes.len() >= 2);
        Location(bytes[0], bytes[1])
    }

    pub fn write_bytes(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= 2);
        bytes[0] = self.0;
        bytes[1] = self.1;
    }

    pub fn format_locations(locations: &[Location]) -> String {
        locations
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.0, self.1)
    }
}

/// A byte range within a sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub location: Location,
    pub offset: u8,
    pub size: u8,
}

impl Position {
    #[inline]
    fn range(&self) -> ::std::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({},{}@0x{:02x})",
            self.location.0, self.location.1, self.offset
        )
    }
}

/// Structures which remember where on the disk they were read from, and can
/// be written back to the same place.
pub trait PositionedData {
    fn position(&self) -> io::Result<Position>;
    fn positioned_read(&mut self, buffer: &[u8]) -> io::Result<()>;
    fn positioned_write(&self, buffer: &mut [u8]) -> io::Result<()>;
}

/// Iterate over every location of a geometry, in image order.
pub struct LocationIterator<'a> {
    geometry: &'a Geometry,
    next: Option<Location>,
}

impl<'a> LocationIterator<'a> {
    pub fn from_geometry(geometry: &'a Geometry) -> LocationIterator<'a> {
        LocationIterator {
            geometry,
            next: Some(Location::new(1, 0)),
        }
    }
}

impl<'a> Iterator for LocationIterator<'a> {
    type Item = Location;

    fn next(&mut self) -> Option<Location> {
        let location = self.next?;
        let mut next_location = location;
        next_location.1 += 1;
        if next_location.1 >= self.geometry.sectors_in_track(next_location.0) {
            next_location.0 += 1;
            next_location.1 = 0;
        }
        self.next = if next_location.0 > self.geometry.tracks() {
            None
        } else {
            Some(next_location)
        };
        Some(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::D64;

    #[test]
    fn test_location_iterator() {
        let geometry = D64::geometry();
        let locations: Vec<Location> = LocationIterator::from_geometry(geometry).collect();
        assert_eq!(locations.len(), 683);
        assert_eq!(locations[0], Location(1, 0));
        assert_eq!(locations[21], Location(2, 0));
        assert_eq!(locations.last(), Some(&Location(35, 16)));
    }

    #[test]
    fn test_image_block_device() {
        let geometry = D64::geometry();
        let mut blocks = ImageBlockDevice::new(Image::open_memory(geometry.size()), geometry);
        blocks.set_byte(Location(18, 1), 1, 0xff).unwrap();
        assert_eq!(blocks.byte(Location(18, 1), 1).unwrap(), 0xff);
        assert_eq!(blocks.image().as_bytes()[0x16601], 0xff);
        assert!(blocks.sector(Location(18, 19)).unwrap_err() == DiskError::InvalidLocation);
        assert!(blocks.byte(Location(18, 1), 256).unwrap_err() == DiskError::InvalidOffset);
    }
}
