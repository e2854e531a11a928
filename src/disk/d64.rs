use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::disk::bam::{Bam, BamFormat, BamSection};
use crate::disk::block::{BlockDevice, ImageBlockDevice, Location, LocationIterator, BLOCK_SIZE};
use crate::disk::chain::{self, ChainLink, CHAIN_PAYLOAD_SIZE};
use crate::disk::directory::{
    self, DirectoryEntry, DirectoryIterator, FileAttributes, FileType, ENTRIES_PER_SECTOR,
};
use crate::disk::error::DiskError;
use crate::disk::file::{self, File, FileOps};
use crate::disk::format::{DiskFormat, Track};
use crate::disk::header::{Header, HeaderFormat};
use crate::disk::image::Image;
use crate::disk::validation::{self, ValidationError};
use crate::disk::{Geometry, Id, PADDING_BYTE};

/// The name given to a disk image that is formatted implicitly.
const DEFAULT_DISK_NAME: &str = "NEW DISK";

/// A description of the header format for this disk image type.
static HEADER_FORMAT: HeaderFormat = HeaderFormat {
    location: Location(18, 0),
    first_directory_offset: 0x00,
    disk_format_type_offset: 0x02,
    disk_name_offset: 0x90,
    disk_id_offset: 0xA2,
    dos_type_offset: 0xA5,
    padding_offsets: &[0xA0, 0xA1, 0xA4, 0xA7, 0xA8, 0xA9, 0xAA],
    default_disk_format_type: b'A',
    default_dos_type: [b'2', b'A'],
};

const BAM_SECTION_STANDARD: BamSection = BamSection {
    first_track: 1,
    tracks: 35,
    free_offset: 0x04,
    bitmap_offset: 0x05,
    bitmap_size: 3,
    stride: 4,
};

/// Tracks 36-40 of the 40-track layout, as stored by Dolphin DOS.
const BAM_SECTION_EXTENDED: BamSection = BamSection {
    first_track: 36,
    tracks: 5,
    free_offset: 0xAC,
    bitmap_offset: 0xAD,
    bitmap_size: 3,
    stride: 4,
};

static BAM_FORMAT_35: BamFormat = BamFormat {
    location: Location(18, 0),
    sections: &[BAM_SECTION_STANDARD],
};

static BAM_FORMAT_40: BamFormat = BamFormat {
    location: Location(18, 0),
    sections: &[BAM_SECTION_STANDARD, BAM_SECTION_EXTENDED],
};

static DISK_FORMAT_35: DiskFormat = DiskFormat {
    directory_track: 18,
    first_directory_sector: 1,
    first_track: 1,
    last_track: 35,
    interleave: 10,
    tracks: &TRACKS,
    geometry: &GEOMETRY_35,
    header: &HEADER_FORMAT,
    bam: &BAM_FORMAT_35,
};

static DISK_FORMAT_40: DiskFormat = DiskFormat {
    directory_track: 18,
    first_directory_sector: 1,
    first_track: 1,
    last_track: 40,
    interleave: 10,
    tracks: &TRACKS,
    geometry: &GEOMETRY_40,
    header: &HEADER_FORMAT,
    bam: &BAM_FORMAT_40,
};

static GEOMETRY_35: Geometry = Geometry {
    track_layouts: &TRACKS,
    tracks: 35,
};

static GEOMETRY_40: Geometry = Geometry {
    track_layouts: &TRACKS,
    tracks: 40,
};

static ALLOWED_GEOMETRIES: [&Geometry; 2] = [&GEOMETRY_35, &GEOMETRY_40];

static DISK_FORMATS: [&DiskFormat; 2] = [&DISK_FORMAT_35, &DISK_FORMAT_40];

#[rustfmt::skip]
static TRACKS: [Track; 41] = [
    Track { sectors: 0,  sector_offset: 0,   byte_offset: 0, }, // There is no track 0.
    Track { sectors: 21, sector_offset: 0,   byte_offset: 0x00000, }, // 1
    Track { sectors: 21, sector_offset: 21,  byte_offset: 0x01500, }, // 2
    Track { sectors: 21, sector_offset: 42,  byte_offset: 0x02A00, }, // 3
    Track { sectors: 21, sector_offset: 63,  byte_offset: 0x03F00, }, // 4
    Track { sectors: 21, sector_offset: 84,  byte_offset: 0x05400, }, // 5
    Track { sectors: 21, sector_offset: 105, byte_offset: 0x06900, }, // 6
    Track { sectors: 21, sector_offset: 126, byte_offset: 0x07E00, }, // 7
    Track { sectors: 21, sector_offset: 147, byte_offset: 0x09300, }, // 8
    Track { sectors: 21, sector_offset: 168, byte_offset: 0x0A800, }, // 9
    Track { sectors: 21, sector_offset: 189, byte_offset: 0x0BD00, }, // 10
    Track { sectors: 21, sector_offset: 210, byte_offset: 0x0D200, }, // 11
    Track { sectors: 21, sector_offset: 231, byte_offset: 0x0E700, }, // 12
    Track { sectors: 21, sector_offset: 252, byte_offset: 0x0FC00, }, // 13
    Track { sectors: 21, sector_offset: 273, byte_offset: 0x11100, }, // 14
    Track { sectors: 21, sector_offset: 294, byte_offset: 0x12600, }, // 15
    Track { sectors: 21, sector_offset: 315, byte_offset: 0x13B00, }, // 16
    Track { sectors: 21, sector_offset: 336, byte_offset: 0x15000, }, // 17
    Track { sectors: 19, sector_offset: 357, byte_offset: 0x16500, }, // 18
    Track { sectors: 19, sector_offset: 376, byte_offset: 0x17800, }, // 19
    Track { sectors: 19, sector_offset: 395, byte_offset: 0x18B00, }, // 20
    Track { sectors: 19, sector_offset: 414, byte_offset: 0x19E00, }, // 21
    Track { sectors: 19, sector_offset: 433, byte_offset: 0x1B100, }, // 22
    Track { sectors: 19, sector_offset: 452, byte_offset: 0x1C400, }, // 23
    Track { sectors: 19, sector_offset: 471, byte_offset: 0x1D700, }, // 24
    Track { sectors: 18, sector_offset: 490, byte_offset: 0x1EA00, }, // 25
    Track { sectors: 18, sector_offset: 508, byte_offset: 0x1FC00, }, // 26
    Track { sectors: 18, sector_offset: 526, byte_offset: 0x20E00, }, // 27
    Track { sectors: 18, sector_offset: 544, byte_offset: 0x22000, }, // 28
    Track { sectors: 18, sector_offset: 562, byte_offset: 0x23200, }, // 29
    Track { sectors: 18, sector_offset: 580, byte_offset: 0x24400, }, // 30
    Track { sectors: 17, sector_offset: 598, byte_offset: 0x25600, }, // 31
    Track { sectors: 17, sector_offset: 615, byte_offset: 0x26700, }, // 32
    Track { sectors: 17, sector_offset: 632, byte_offset: 0x27800, }, // 33
    Track { sectors: 17, sector_offset: 649, byte_offset: 0x28900, }, // 34
    Track { sectors: 17, sector_offset: 666, byte_offset: 0x29A00, }, // 35
    Track { sectors: 17, sector_offset: 683, byte_offset: 0x2AB00, }, // 36
    Track { sectors: 17, sector_offset: 700, byte_offset: 0x2BC00, }, // 37
    Track { sectors: 17, sector_offset: 717, byte_offset: 0x2CD00, }, // 38
    Track { sectors: 17, sector_offset: 734, byte_offset: 0x2DE00, }, // 39
    Track { sectors: 17, sector_offset: 751, byte_offset: 0x2EF00, }, // 40
];

/// Represent a 1541 disk image in D64 format.  Geometries for this disk image
/// type can describe either 35-track or 40-track (Dolphin DOS) disks.
///
/// The image bytes are the only persistent state.  The header, the BAM and
/// the directory are read from (and written to) the image on every access.
pub struct D64 {
    blocks: ImageBlockDevice,
    format: &'static DiskFormat,
    /// The last sector allocated on each track, for the interleave search.
    /// Indexed by track number.
    last_sector_used: Vec<u8>,
}

impl D64 {
    /// Create a new in-memory 35-track disk image, formatted as "NEW DISK".
    pub fn new() -> io::Result<D64> {
        Self::with_geometry(Self::geometry())
    }

    /// Create a new in-memory disk image with the given geometry, formatted
    /// as "NEW DISK".
    pub fn with_geometry(geometry: &'static Geometry) -> io::Result<D64> {
        let mut d64 = Self::from_image(Image::open_memory(geometry.size()))?;
        d64.format(DEFAULT_DISK_NAME)?;
        Ok(d64)
    }

    /// Wrap an image without checking its contents.
    fn from_image(image: Image) -> io::Result<D64> {
        // Determine the disk image geometry
        let geometry = match Geometry::find_by_size(image.len(), &ALLOWED_GEOMETRIES[..]) {
            Some(geometry) => geometry,
            None => return Err(DiskError::InvalidLayout.into()),
        };
        let format = DISK_FORMATS
            .iter()
            .find(|f| f.geometry.tracks() == geometry.tracks())
            .copied()
            .ok_or(DiskError::InvalidLayout)?;
        Ok(D64 {
            blocks: ImageBlockDevice::new(image, geometry),
            format,
            last_sector_used: vec![0; format.last_track as usize + 1],
        })
    }

    /// Read a disk image file into memory.  The file must have one of the
    /// two supported sizes and a valid header and directory root.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<D64> {
        let d64 = Self::from_image(Image::from_bytes(fs::read(path.as_ref())?))?;
        if !d64.has_valid_structure()? {
            return Err(DiskError::InvalidImage.into());
        }
        info!("read {}", path.as_ref().display());
        Ok(d64)
    }

    /// Open an existing D64 disk image file for in-place access, as read-only
    /// (if `writable` is false) or read-write (if `writable` is true).  The
    /// file is never reformatted: an image that fails the structural check
    /// is rejected.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<D64> {
        let image = if writable {
            Image::open_read_write(path.as_ref())?
        } else {
            Image::open_read_only(path.as_ref())?
        };
        let d64 = Self::from_image(image)?;
        if !d64.has_valid_structure()? {
            return Err(DiskError::InvalidImage.into());
        }
        info!(
            "opened {} ({})",
            path.as_ref().display(),
            if writable { "read-write" } else { "read-only" }
        );
        Ok(d64)
    }

    /// Replace this disk image with the contents of a file.  A file of the
    /// wrong size is rejected and the current image is left untouched.  A
    /// file of the right size that fails the structural check is replaced
    /// by a freshly formatted image of the same geometry, and
    /// `InvalidImage` is returned.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let bytes = fs::read(path.as_ref())?;
        *self = Self::from_image(Image::from_bytes(bytes))?;
        if !self.has_valid_structure()? {
            warn!(
                "{}: invalid disk structure, resetting to a blank disk",
                path.as_ref().display()
            );
            self.format(DEFAULT_DISK_NAME)?;
            return Err(DiskError::InvalidImage.into());
        }
        info!("loaded {}", path.as_ref().display());
        Ok(())
    }

    /// Write the entire image to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        fs::write(path.as_ref(), self.as_bytes())?;
        info!("saved {}", path.as_ref().display());
        Ok(())
    }

    /// Flush a memory-mapped image to its file.
    pub fn flush(&mut self) -> io::Result<()> {
        self.blocks.flush()
    }

    /// Return the 35-track geometry for D64 disks.
    #[inline]
    pub fn geometry() -> &'static Geometry {
        &GEOMETRY_35
    }

    /// Return the 40-track geometry for D64 disks.
    #[inline]
    pub fn geometry_40_tracks() -> &'static Geometry {
        &GEOMETRY_40
    }

    /// The header must point at the directory root, and the root must either
    /// end the chain or link to another sector on the directory track other
    /// than the BAM and the root itself.
    fn has_valid_structure(&self) -> io::Result<bool> {
        let first_directory = self.format.first_directory_location();
        if self.header()?.first_directory_sector != first_directory {
            return Ok(false);
        }
        let root = self.blocks.sector(first_directory)?;
        Ok(match ChainLink::new(root) {
            Ok(ChainLink::Tail(BLOCK_SIZE)) => true,
            Ok(ChainLink::Next(next)) => {
                next.0 == self.format.directory_track
                    && self.format.is_valid_location(next)
                    && next != self.format.bam_location()
                    && next != first_directory
            }
            _ => false,
        })
    }

    #[inline]
    pub fn disk_format(&self) -> &'static DiskFormat {
        self.format
    }

    #[inline]
    pub fn blocks(&self) -> &ImageBlockDevice {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut ImageBlockDevice {
        &mut self.blocks
    }

    /// Return the raw image bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.blocks.image().as_bytes()
    }

    pub fn header(&self) -> io::Result<Header> {
        Header::read(&self.blocks, self.format.header)
    }

    /// Return a read-only view of the BAM.
    pub fn bam(&self) -> io::Result<Bam<&[u8]>> {
        let block = self.blocks.sector(self.format.bam_location())?;
        Ok(Bam::new(self.format, block))
    }

    /// Return a view of the BAM through which sectors may be allocated and
    /// freed.  Changes are written directly to the image.
    pub fn bam_mut(&mut self) -> io::Result<Bam<&mut [u8]>> {
        let block = self.blocks.sector_mut(self.format.bam_location())?;
        Ok(Bam::new(self.format, block))
    }

    /// Format the disk image with the given name and a blank ($A0 $A0) id.
    pub fn format(&mut self, name: &str) -> io::Result<()> {
        self.format_with_id(name, &Id::from_bytes(&[PADDING_BYTE, PADDING_BYTE]))
    }

    /// Format the disk image: zero every sector, write a fresh header and
    /// directory root, and reset the BAM with only the system sectors
    /// allocated.
    pub fn format_with_id(&mut self, name: &str, id: &Id) -> io::Result<()> {
        let format = self.format;
        let header = Header::new(format, name, id)?;
        self.blocks.check_writability()?;

        // Zero all sectors
        for location in LocationIterator::from_geometry(format.geometry) {
            self.blocks
                .sector_mut(location)?
                .iter_mut()
                .for_each(|b| *b = 0);
        }

        // The initial directory sector ends the chain and is used in its
        // entirety.
        ChainLink::Tail(BLOCK_SIZE).to_bytes(
            self.blocks
                .sector_mut(format.first_directory_location())?,
        );

        header.write(&mut self.blocks, format.header)?;

        {
            let mut bam = self.bam_mut()?;
            bam.reset()?;
            for location in format.system_locations() {
                bam.allocate(location)?;
            }
        }

        self.last_sector_used.iter_mut().for_each(|s| *s = 0);
        info!(
            "formatted \"{}\" ({} tracks)",
            name,
            self.blocks.geometry().tracks()
        );
        Ok(())
    }

    /// Change the disk name in the header.
    pub fn rename_disk(&mut self, name: &str) -> io::Result<()> {
        let mut header = self.header()?;
        header.set_name(name)?;
        header.write(&mut self.blocks, self.format.header)
    }

    pub fn disk_name(&self) -> io::Result<String> {
        Ok(self.header()?.name())
    }

    pub fn disk_id(&self) -> io::Result<Id> {
        Ok(self.header()?.disk_id)
    }

    /// Return the blocks free based on the BAM free sector counts, excluding
    /// the directory track.  (Not based on the BAM bitmaps, nor on the file
    /// sizes in the directory entries.)
    pub fn blocks_free(&self) -> io::Result<usize> {
        Ok(self.bam()?.blocks_free())
    }

    pub fn is_free(&self, location: Location) -> io::Result<bool> {
        self.bam()?.is_free(location)
    }

    /// Mark a specific sector as allocated.
    pub fn allocate_sector(&mut self, location: Location) -> io::Result<()> {
        self.bam_mut()?.allocate(location)?;
        debug!("allocated {}", location);
        Ok(())
    }

    /// Mark a specific sector as free.  The BAM sector and the directory root
    /// can never be freed.
    pub fn free_sector(&mut self, location: Location) -> io::Result<()> {
        if location == self.format.bam_location()
            || location == self.format.first_directory_location()
        {
            return Err(DiskError::ProtectedSector.into());
        }
        self.bam_mut()?.free(location)?;
        debug!("freed {}", location);
        Ok(())
    }

    /// Find the next free data sector according to the track search order
    /// and interleave, and allocate it.
    pub fn find_and_allocate_free_sector(&mut self) -> io::Result<Location> {
        let location = self
            .format
            .next_free_block(&self.bam()?, &self.last_sector_used)?;
        self.bam_mut()?.allocate(location)?;
        self.last_sector_used[location.0 as usize] = location.1;
        debug!("allocated {}", location);
        Ok(location)
    }

    /// Allocate `count` sectors, releasing them all again if the disk fills
    /// up part way.
    fn allocate_sectors(&mut self, count: usize) -> io::Result<Vec<Location>> {
        let mut locations = Vec::with_capacity(count);
        for _ in 0..count {
            match self.find_and_allocate_free_sector() {
                Ok(location) => locations.push(location),
                Err(e) => {
                    self.release_sectors(&locations);
                    return Err(e);
                }
            }
        }
        Ok(locations)
    }

    fn release_sectors(&mut self, locations: &[Location]) {
        for location in locations {
            if let Err(e) = self.free_sector(*location) {
                warn!("cannot release {}: {}", location, e);
            }
        }
    }

    fn check_capacity(&self, sectors: usize) -> io::Result<()> {
        if self.blocks_free()? < sectors {
            Err(DiskError::DiskFull.into())
        } else {
            Ok(())
        }
    }

    /// Read a block of data from a specific track and sector.
    pub fn read_sector(&self, location: Location) -> io::Result<Vec<u8>> {
        self.blocks.sector_owned(location)
    }

    /// Write a block of data to a specific location on the disk.  The BAM is
    /// not updated.
    pub fn write_sector(&mut self, location: Location, data: &[u8]) -> io::Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(DiskError::WriteUnderrun.into());
        }
        self.blocks.sector_mut(location)?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_byte(&self, location: Location, offset: usize) -> io::Result<u8> {
        self.blocks.byte(location, offset)
    }

    pub fn write_byte(&mut self, location: Location, offset: usize, value: u8) -> io::Result<()> {
        self.blocks.set_byte(location, offset, value)
    }

    /// Return the absolute image offset of a byte within a sector.
    pub fn offset(&self, location: Location, byte_offset: usize) -> io::Result<usize> {
        self.blocks.offset(location, byte_offset)
    }

    /// Write a hex dump of the disk image to the provided writer.
    pub fn dump(&self, writer: &mut dyn Write) -> io::Result<()> {
        self.blocks.dump(writer)
    }

    /// Return an iterator of the live directory entries on this disk image.
    pub fn iter(&self) -> DirectoryIterator<'_> {
        DirectoryIterator::new(&self.blocks, self.format.first_directory_location())
    }

    /// Return a list of all live directory entries, in directory order.
    pub fn directory(&self) -> io::Result<Vec<DirectoryEntry>> {
        self.iter().collect::<io::Result<Vec<_>>>()
    }

    /// Locate a directory entry based on its filename.
    pub fn find_file(&self, name: &str) -> io::Result<DirectoryEntry> {
        self.iter()
            .find(|x| match x {
                Err(_) => true,
                Ok(entry) => entry.name() == name,
            })
            .unwrap_or_else(|| Err(DiskError::NotFound.into()))
    }

    /// Write the provided directory entry to disk, using the same slot as it
    /// was originally read from.
    pub fn write_directory_entry(&mut self, entry: &DirectoryEntry) -> io::Result<()> {
        self.blocks.positioned_write(entry)
    }

    /// Confirm that no directory entry currently exists with the provided
    /// filename.
    fn check_filename_availability(&self, name: &str) -> io::Result<()> {
        match self.find_file(name) {
            Ok(_) => Err(DiskError::FileExists.into()),
            Err(e) => match DiskError::from_io_error(&e) {
                Some(DiskError::NotFound) => Ok(()),
                _ => Err(e),
            },
        }
    }

    /// Open a file based on its filename.
    pub fn open_file(&self, name: &str) -> io::Result<File<'_>> {
        let entry = self.find_file(name)?;
        self.open_file_from_entry(&entry)
    }

    /// Open a file based on its directory entry.
    pub fn open_file_from_entry(&self, entry: &DirectoryEntry) -> io::Result<File<'_>> {
        File::open_from_entry(&self.blocks, entry)
    }

    /// Read the entire contents of a file.  For relative files, this is the
    /// concatenation of all records.
    pub fn read_file(&self, name: &str) -> io::Result<Vec<u8>> {
        self.open_file(name)?.contents()
    }

    /// Write the contents of a file to `<directory>/<name>.<type>` and
    /// return the path written.
    pub fn extract_file<P: AsRef<Path>>(&self, name: &str, directory: P) -> io::Result<PathBuf> {
        let file = self.open_file(name)?;
        let stem: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = directory.as_ref().join(format!(
            "{}.{}",
            stem,
            file.entry().file_attributes.file_type
        ));
        fs::write(&path, file.contents()?)?;
        info!("extracted \"{}\" to {}", name, path.display());
        Ok(path)
    }

    /// Store `data` as a new sequential (SEQ, PRG, USR, or DEL) file.  If the
    /// file cannot be written completely, every sector claimed for it is
    /// released before the error is returned.
    pub fn add_file(
        &mut self,
        name: &str,
        file_type: FileType,
        data: &[u8],
    ) -> io::Result<DirectoryEntry> {
        if file_type == FileType::REL {
            return Err(DiskError::InvalidRelativeFile.into());
        }
        let filename = directory::check_filename_validity(name)?;
        if data.is_empty() {
            return Err(DiskError::EmptyFile.into());
        }
        self.check_filename_availability(name)?;
        let count = chain::sectors_needed(data.len());
        self.check_capacity(count)?;

        let mut entry = directory::next_free_directory_entry(self)?;
        let locations = self.allocate_sectors(count)?;
        if let Err(e) = chain::write_chain(&mut self.blocks, &locations, data) {
            self.release_sectors(&locations);
            return Err(e);
        }

        entry.reset();
        entry.file_attributes = FileAttributes::new(file_type);
        entry.filename = filename;
        entry.first_sector = locations[0];
        entry.file_size = count as u16;
        if let Err(e) = self.write_directory_entry(&entry) {
            self.release_sectors(&locations);
            return Err(e);
        }
        info!("added \"{}\": {} bytes in {} blocks", name, data.len(), count);
        Ok(entry)
    }

    /// Store `data` as a new relative file of fixed-size records.  The data
    /// length must be a multiple of `record_length`.  The data sectors are
    /// chained as for a sequential file, and indexed by up to six side
    /// sectors.
    pub fn add_relative_file(
        &mut self,
        name: &str,
        data: &[u8],
        record_length: usize,
    ) -> io::Result<DirectoryEntry> {
        let filename = directory::check_filename_validity(name)?;
        if record_length == 0 {
            return Err(DiskError::InvalidRelativeFile.into());
        }
        if record_length > CHAIN_PAYLOAD_SIZE {
            return Err(DiskError::RecordTooLarge.into());
        }
        if data.is_empty() {
            return Err(DiskError::EmptyFile.into());
        }
        if data.len() % record_length != 0 {
            return Err(DiskError::InvalidRelativeFile.into());
        }
        self.check_filename_availability(name)?;
        let data_count = chain::sectors_needed(data.len());
        let side_count = file::side_sectors_needed(data_count);
        if side_count > file::MAX_SIDE_SECTORS {
            return Err(DiskError::TooManySideSectors.into());
        }
        self.check_capacity(data_count + side_count)?;

        let mut entry = directory::next_free_directory_entry(self)?;
        let data_sectors = self.allocate_sectors(data_count)?;
        let side_sectors = match self.allocate_sectors(side_count) {
            Ok(side_sectors) => side_sectors,
            Err(e) => {
                self.release_sectors(&data_sectors);
                return Err(e);
            }
        };
        let mut all_sectors = data_sectors.clone();
        all_sectors.extend(side_sectors.iter());

        let written = chain::write_chain(&mut self.blocks, &data_sectors, data).and_then(|_| {
            file::write_side_sectors(
                &mut self.blocks,
                &side_sectors,
                &data_sectors,
                record_length as u8,
            )
        });
        if let Err(e) = written {
            self.release_sectors(&all_sectors);
            return Err(e);
        }

        entry.reset();
        entry.file_attributes = FileAttributes::new(FileType::REL);
        entry.filename = filename;
        entry.first_sector = data_sectors[0];
        entry.first_side_sector = side_sectors[0];
        entry.record_length = record_length as u8;
        entry.file_size = all_sectors.len() as u16;
        if let Err(e) = self.write_directory_entry(&entry) {
            self.release_sectors(&all_sectors);
            return Err(e);
        }
        info!(
            "added relative file \"{}\": {} records of {} bytes, {} side sectors",
            name,
            data.len() / record_length,
            record_length,
            side_count
        );
        Ok(entry)
    }

    /// Delete a file: free every sector it occupies (including side sectors)
    /// and clear its directory entry.
    pub fn remove_file(&mut self, name: &str) -> io::Result<()> {
        let entry = self.find_file(name)?;
        let sectors = self.open_file_from_entry(&entry)?.occupied_sectors()?;
        {
            let mut bam = self.bam_mut()?;
            for location in sectors.iter() {
                match bam.free(*location) {
                    Ok(()) => {}
                    Err(ref e) if *e == DiskError::SectorAlreadyFree => {
                        warn!("\"{}\": sector {} was already free", name, location);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let mut cleared = entry;
        cleared.reset();
        self.write_directory_entry(&cleared)?;
        info!("removed \"{}\" ({} blocks)", name, sectors.len());
        Ok(())
    }

    /// Rename a file.
    pub fn rename_file(&mut self, original_name: &str, new_name: &str) -> io::Result<()> {
        let mut entry = self.find_file(original_name)?;
        entry.set_filename(new_name)?;
        if new_name != original_name {
            self.check_filename_availability(new_name)?;
        }
        self.write_directory_entry(&entry)
    }

    fn set_locked(&mut self, name: &str, locked: bool) -> io::Result<()> {
        let mut entry = self.find_file(name)?;
        entry.file_attributes.locked_flag = locked;
        self.write_directory_entry(&entry)
    }

    pub fn lock_file(&mut self, name: &str) -> io::Result<()> {
        self.set_locked(name, true)
    }

    pub fn unlock_file(&mut self, name: &str) -> io::Result<()> {
        self.set_locked(name, false)
    }

    /// Write `entries` into the directory slots in chain order, and clear
    /// every remaining slot.  The sector links are not changed.
    fn rewrite_directory(&mut self, entries: &[DirectoryEntry]) -> io::Result<()> {
        let slots = DirectoryIterator::slots(&self.blocks, self.format.first_directory_location())
            .map(|r| r.map(|entry| entry.position))
            .collect::<io::Result<Vec<_>>>()?;
        if slots.len() < entries.len() {
            return Err(DiskError::InvalidDirectoryOrder.into());
        }
        for (i, position) in slots.into_iter().enumerate() {
            let mut entry = match entries.get(i) {
                Some(entry) => entry.clone(),
                None => DirectoryEntry::from_bytes(&[0u8; directory::ENTRY_SIZE]),
            };
            entry.position = position;
            self.write_directory_entry(&entry)?;
        }
        Ok(())
    }

    /// Rewrite the directory so the live entries appear in the order given.
    /// `entries` must hold every live entry exactly once, as returned by
    /// `directory()`.  Returns false, without touching the image, if the
    /// order is unchanged.
    pub fn reorder_directory(&mut self, entries: &[DirectoryEntry]) -> io::Result<bool> {
        let current = self.directory()?;
        if entries.len() != current.len() {
            return Err(DiskError::InvalidDirectoryOrder.into());
        }
        let mut taken = vec![false; current.len()];
        let mut ordered = Vec::with_capacity(current.len());
        for entry in entries {
            let index = current
                .iter()
                .enumerate()
                .position(|(i, c)| !taken[i] && c.position == entry.position)
                .ok_or(DiskError::InvalidDirectoryOrder)?;
            taken[index] = true;
            ordered.push(current[index].clone());
        }
        if ordered
            .iter()
            .zip(current.iter())
            .all(|(a, b)| a.position == b.position)
        {
            return Ok(false);
        }
        self.rewrite_directory(&ordered)?;
        debug!("reordered {} directory entries", ordered.len());
        Ok(true)
    }

    /// Reorder the directory so the named files come first, in the given
    /// order.  Unknown names are ignored; the remaining files follow in
    /// their current order.
    pub fn reorder_directory_by_names(&mut self, names: &[&str]) -> io::Result<bool> {
        let mut remaining = self.directory()?;
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in names {
            if let Some(index) = remaining.iter().position(|e| e.name() == *name) {
                ordered.push(remaining.remove(index));
            }
        }
        ordered.append(&mut remaining);
        self.reorder_directory(&ordered)
    }

    /// Sort the directory with a comparator.  The sort is stable.
    pub fn sort_directory_by<F>(&mut self, compare: F) -> io::Result<bool>
    where
        F: FnMut(&DirectoryEntry, &DirectoryEntry) -> Ordering,
    {
        let mut entries = self.directory()?;
        if entries.is_empty() {
            return Ok(false);
        }
        entries.sort_by(compare);
        self.reorder_directory(&entries)
    }

    /// Move a file to the head of the directory, keeping the order of the
    /// others.
    pub fn move_file_first(&mut self, name: &str) -> io::Result<bool> {
        let mut entries = self.directory()?;
        let index = entries
            .iter()
            .position(|e| e.name() == name)
            .ok_or(DiskError::NotFound)?;
        let entry = entries.remove(index);
        entries.insert(0, entry);
        self.reorder_directory(&entries)
    }

    /// Swap a file with its neighbour above (`up`) or below.  Returns false if
    /// the file is already at that end of the directory.
    pub fn move_file(&mut self, name: &str, up: bool) -> io::Result<bool> {
        let mut entries = self.directory()?;
        let index = entries
            .iter()
            .position(|e| e.name() == name)
            .ok_or(DiskError::NotFound)?;
        let other = match (up, index) {
            (true, 0) => return Ok(false),
            (true, i) => i - 1,
            (false, i) if i + 1 == entries.len() => return Ok(false),
            (false, i) => i + 1,
        };
        entries.swap(index, other);
        self.reorder_directory(&entries)
    }

    /// Pack the live entries at the start of the directory chain and free
    /// the directory sectors no longer needed.  The directory root is always
    /// kept.  Returns the number of sectors freed.
    pub fn compact_directory(&mut self) -> io::Result<usize> {
        let entries = self.directory()?;
        let sectors = directory::directory_sectors(
            &self.blocks,
            self.format.first_directory_location(),
        )?;
        self.rewrite_directory(&entries)?;

        let needed = ::std::cmp::max(
            1,
            (entries.len() + ENTRIES_PER_SECTOR - 1) / ENTRIES_PER_SECTOR,
        );
        if needed >= sectors.len() {
            return Ok(0);
        }
        ChainLink::Tail(BLOCK_SIZE).to_bytes(self.blocks.sector_mut(sectors[needed - 1])?);
        for location in &sectors[needed..] {
            self.free_sector(*location)?;
        }
        let freed = sectors.len() - needed;
        info!("compacted directory, freed {} sectors", freed);
        Ok(freed)
    }

    /// Check the consistency of the disk image.  This is a read-only
    /// operation.  A list of validation errors is returned.
    #[inline]
    pub fn validate(&self) -> io::Result<Vec<ValidationError>> {
        validation::validate(self)
    }

    /// Cross-check the BAM against the sectors reachable from the directory.
    /// Mismatches are written to `log` if given (or the logger otherwise),
    /// and corrected if `fix` is set.  Returns true if no mismatch was found.
    pub fn verify(&mut self, fix: bool, log: Option<&mut dyn Write>) -> io::Result<bool> {
        validation::verify(self, fix, log)
    }
}

impl fmt::Display for D64 {
    /// Render a directory listing in the style of `LOAD "$",8`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.header() {
            Ok(header) => writeln!(f, "{}", header)?,
            Err(e) => return writeln!(f, "Cannot read header: {}", e),
        }
        for entry in self.iter() {
            match entry {
                Ok(entry) => writeln!(f, "{}", entry)?,
                Err(e) => return writeln!(f, "Cannot read directory: {}", e),
            }
        }
        match self.blocks_free() {
            Ok(free) => write!(f, "{} blocks free.", free),
            Err(e) => write!(f, "Cannot read BAM: {}", e),
        }
    }
}

impl fmt::Debug for D64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:?}", self.header())?;
        match self.bam() {
            Ok(bam) => write!(f, "{:?}", bam),
            Err(e) => writeln!(f, "BAM: {}", e),
        }
    }
}

impl<'a> IntoIterator for &'a D64 {
    type Item = io::Result<DirectoryEntry>;
    type IntoIter = DirectoryIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_track_consistency() {
        let mut sector_offset = 0;
        let mut byte_offset = 0;
        for track in super::TRACKS.iter() {
            assert_eq!(track.sector_offset, sector_offset);
            assert_eq!(track.byte_offset, byte_offset);
            sector_offset += track.sectors as u16;
            byte_offset += track.sectors as u32 * BLOCK_SIZE as u32;
        }
    }

    #[test]
    fn test_blank_disk() {
        let mut d64 = D64::new().unwrap();
        assert_eq!(d64.disk_name().unwrap(), "NEW DISK");
        assert_eq!(d64.directory().unwrap().len(), 0);
        assert_eq!(d64.blocks_free().unwrap(), 664);
        assert_eq!(d64.as_bytes().len(), 174_848);
        assert_eq!(
            d64.to_string(),
            "0 \"NEW DISK        \" \u{a0}\u{a0} 2A\n664 blocks free."
        );
        assert!(d64.verify(false, None).unwrap());

        let d64 = D64::with_geometry(D64::geometry_40_tracks()).unwrap();
        assert_eq!(d64.blocks_free().unwrap(), 749);
        assert_eq!(d64.as_bytes().len(), 196_608);
    }

    #[test]
    fn test_add_and_read_boundaries() {
        let mut d64 = D64::new().unwrap();
        let sizes = [1, 253, 254, 255, 508, 509, 2 * 254 + 100, 10 * 254];
        for (i, size) in sizes.iter().enumerate() {
            let name = format!("FILE{}", i);
            let data = payload(*size, i as u8);
            let free = d64.blocks_free().unwrap();
            let entry = d64.add_file(&name, FileType::SEQ, &data).unwrap();
            let blocks = (size + 253) / 254;
            assert_eq!(entry.file_size as usize, blocks);
            assert_eq!(d64.blocks_free().unwrap(), free - blocks);
            assert_eq!(d64.read_file(&name).unwrap(), data);
        }
        assert_eq!(d64.directory().unwrap().len(), sizes.len());
        assert!(d64.verify(false, None).unwrap());
    }

    #[test]
    fn test_allocation_order() {
        let mut d64 = D64::new().unwrap();
        let first: Vec<Location> = (0..4)
            .map(|_| d64.find_and_allocate_free_sector().unwrap())
            .collect();
        assert_eq!(
            first,
            vec![Location(17, 10), Location(17, 20), Location(17, 9), Location(17, 19)]
        );
    }

    #[test]
    fn test_allocate_until_full() {
        for geometry in [D64::geometry(), D64::geometry_40_tracks()].iter() {
            let mut d64 = D64::with_geometry(*geometry).unwrap();
            let total = d64.blocks_free().unwrap();
            let mut seen = ::std::collections::HashSet::new();
            let mut track_order: Vec<u8> = vec![];
            loop {
                match d64.find_and_allocate_free_sector() {
                    Ok(location) => {
                        assert!(seen.insert(location));
                        assert_ne!(location.0, 18);
                        if track_order.last() != Some(&location.0) {
                            track_order.push(location.0);
                        }
                        assert_eq!(d64.blocks_free().unwrap(), total - seen.len());
                    }
                    Err(e) => {
                        assert!(e == DiskError::DiskFull);
                        break;
                    }
                }
            }
            assert_eq!(seen.len(), total);
            let expected: Vec<u8> = d64
                .disk_format()
                .track_search_order()
                .into_iter()
                .filter(|t| *t != 18)
                .collect();
            assert_eq!(track_order, expected);
            assert!(d64.add_file("X", FileType::PRG, &[1]).unwrap_err() == DiskError::DiskFull);
        }
    }

    #[test]
    fn test_add_file_errors() {
        let mut d64 = D64::new().unwrap();
        d64.add_file("DUP", FileType::PRG, &[1, 2, 3]).unwrap();
        assert!(d64.add_file("DUP", FileType::PRG, &[1]).unwrap_err() == DiskError::FileExists);
        assert!(d64.add_file("EMPTY", FileType::PRG, &[]).unwrap_err() == DiskError::EmptyFile);
        assert!(d64.add_file("", FileType::PRG, &[1]).unwrap_err() == DiskError::InvalidFilename);
        assert!(
            d64.add_file("A NAME THAT IS TOO LONG", FileType::PRG, &[1])
                .unwrap_err()
                == DiskError::FilenameTooLong
        );
        assert!(
            d64.add_file("REL", FileType::REL, &[1]).unwrap_err()
                == DiskError::InvalidRelativeFile
        );
        assert!(d64.read_file("MISSING").unwrap_err() == DiskError::NotFound);
        assert_eq!(d64.directory().unwrap().len(), 1);
    }

    #[test]
    fn test_disk_full_rolls_back() {
        let mut d64 = D64::new().unwrap();
        let free = d64.blocks_free().unwrap();
        let too_big = vec![0u8; (free + 1) * 254];
        assert!(d64.add_file("BIG", FileType::SEQ, &too_big).unwrap_err() == DiskError::DiskFull);
        assert_eq!(d64.blocks_free().unwrap(), free);

        // Claim sectors behind the free count's back, so that the capacity
        // check passes but allocation runs dry part way.
        {
            let mut bam = d64.bam_mut().unwrap();
            for sector in 0..21 {
                bam.set_sector_free(Location(1, sector), false).unwrap();
            }
        }
        let data = vec![0u8; free * 254];
        assert!(d64.add_file("BIG", FileType::SEQ, &data).unwrap_err() == DiskError::DiskFull);
        assert_eq!(d64.blocks_free().unwrap(), free);
        assert!(d64.find_file("BIG").unwrap_err() == DiskError::NotFound);
    }

    #[test]
    fn test_remove_file() {
        let mut d64 = D64::new().unwrap();
        let free = d64.blocks_free().unwrap();
        d64.add_file("KEEP", FileType::PRG, &payload(1000, 1)).unwrap();
        let after_keep = d64.blocks_free().unwrap();
        d64.add_file("GONE", FileType::USR, &payload(3000, 2)).unwrap();
        d64.add_relative_file("RECS", &payload(50 * 20, 3), 20).unwrap();
        d64.remove_file("GONE").unwrap();
        d64.remove_file("RECS").unwrap();
        assert_eq!(d64.blocks_free().unwrap(), after_keep);
        assert!(d64.remove_file("GONE").unwrap_err() == DiskError::NotFound);
        assert!(d64.verify(false, None).unwrap());
        let names: Vec<String> = d64.directory().unwrap().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["KEEP"]);

        // Removed slots are reused.
        let entry = d64.add_file("NEW", FileType::SEQ, &[9]).unwrap();
        assert_eq!(entry.position.unwrap().offset, 0x20);
        d64.remove_file("KEEP").unwrap();
        d64.remove_file("NEW").unwrap();
        assert_eq!(d64.blocks_free().unwrap(), free);
    }

    #[test]
    fn test_relative_file() {
        let mut d64 = D64::new().unwrap();
        let records: Vec<u8> = (0..200u32).flat_map(|r| vec![r as u8; 64]).collect();
        let free = d64.blocks_free().unwrap();
        let entry = d64.add_relative_file("CUSTOMERS", &records, 64).unwrap();
        // 12800 bytes need 51 data sectors and one side sector.
        assert_eq!(entry.file_size, 52);
        assert_eq!(d64.blocks_free().unwrap(), free - 52);
        assert_eq!(entry.file_attributes.file_type, FileType::REL);
        assert_eq!(d64.read_file("CUSTOMERS").unwrap(), records);
        assert!(d64.verify(false, None).unwrap());

        assert!(
            d64.add_relative_file("ZERO", &[1, 2], 0).unwrap_err()
                == DiskError::InvalidRelativeFile
        );
        assert!(
            d64.add_relative_file("ODD", &[1, 2, 3], 2).unwrap_err()
                == DiskError::InvalidRelativeFile
        );
        assert!(
            d64.add_relative_file("HUGE", &[0; 255], 255).unwrap_err()
                == DiskError::RecordTooLarge
        );
        // 721 data sectors would need a seventh side sector.
        let too_many = vec![0u8; 720 * 254 + 2];
        assert!(
            d64.add_relative_file("MANY", &too_many, 2).unwrap_err()
                == DiskError::TooManySideSectors
        );
        assert_eq!(d64.blocks_free().unwrap(), free - 52);
    }

    #[test]
    fn test_free_sector_protection() {
        let mut d64 = D64::new().unwrap();
        assert!(d64.free_sector(Location(18, 0)).unwrap_err() == DiskError::ProtectedSector);
        assert!(d64.free_sector(Location(18, 1)).unwrap_err() == DiskError::ProtectedSector);
        assert!(d64.free_sector(Location(1, 0)).unwrap_err() == DiskError::SectorAlreadyFree);
        d64.allocate_sector(Location(1, 0)).unwrap();
        assert!(
            d64.allocate_sector(Location(1, 0)).unwrap_err() == DiskError::SectorAlreadyAllocated
        );
        assert!(!d64.is_free(Location(1, 0)).unwrap());
        d64.free_sector(Location(1, 0)).unwrap();
        assert!(d64.is_free(Location(1, 0)).unwrap());
        assert!(d64.is_free(Location(36, 0)).unwrap_err() == DiskError::InvalidLocation);
    }

    #[test]
    fn test_sector_access() {
        let mut d64 = D64::new().unwrap();
        let data = payload(BLOCK_SIZE, 7);
        d64.write_sector(Location(3, 4), &data).unwrap();
        assert_eq!(d64.read_sector(Location(3, 4)).unwrap(), data);
        assert!(d64.write_sector(Location(3, 4), &data[1..]).unwrap_err() == DiskError::WriteUnderrun);
        d64.write_byte(Location(3, 4), 255, 0x42).unwrap();
        assert_eq!(d64.read_byte(Location(3, 4), 255).unwrap(), 0x42);
        assert_eq!(d64.offset(Location(3, 4), 255).unwrap(), 0x02A00 + 4 * 256 + 255);
        assert!(d64.read_byte(Location(3, 21), 0).unwrap_err() == DiskError::InvalidLocation);
        assert!(d64.read_byte(Location(3, 4), 256).unwrap_err() == DiskError::InvalidOffset);
    }

    #[test]
    fn test_rename_lock_unlock() {
        let mut d64 = D64::new().unwrap();
        d64.add_file("ONE", FileType::PRG, &[1]).unwrap();
        d64.add_file("TWO", FileType::PRG, &[2]).unwrap();
        assert!(d64.rename_file("ONE", "TWO").unwrap_err() == DiskError::FileExists);
        d64.rename_file("ONE", "ONE").unwrap();
        assert_eq!(d64.read_file("ONE").unwrap(), vec![1]);
        assert_eq!(d64.directory().unwrap().len(), 2);
        d64.rename_file("ONE", "THREE").unwrap();
        assert_eq!(d64.read_file("THREE").unwrap(), vec![1]);
        assert!(d64.find_file("ONE").unwrap_err() == DiskError::NotFound);

        d64.lock_file("THREE").unwrap();
        let entry = d64.find_file("THREE").unwrap();
        assert!(entry.file_attributes.locked_flag);
        assert_eq!(entry.file_attributes.to_byte(), 0xC2);
        d64.unlock_file("THREE").unwrap();
        assert!(!d64.find_file("THREE").unwrap().file_attributes.locked_flag);

        d64.rename_disk("GAMES").unwrap();
        assert_eq!(d64.disk_name().unwrap(), "GAMES");
        d64.format_with_id("WORK", &"w1".into()).unwrap();
        assert_eq!(d64.disk_id().unwrap(), Id::from("w1"));
        assert_eq!(d64.directory().unwrap().len(), 0);
        assert_eq!(d64.blocks_free().unwrap(), 664);
    }

    fn names(d64: &D64) -> Vec<String> {
        d64.directory().unwrap().iter().map(|e| e.name()).collect()
    }

    #[test]
    fn test_reorder_directory() {
        let mut d64 = D64::new().unwrap();
        for name in ["C", "A", "D", "B"].iter() {
            d64.add_file(name, FileType::PRG, name.as_bytes()).unwrap();
        }
        let unchanged = d64.directory().unwrap();
        assert!(!d64.reorder_directory(&unchanged).unwrap());
        assert_eq!(names(&d64), vec!["C", "A", "D", "B"]);

        assert!(d64.sort_directory_by(|a, b| a.name().cmp(&b.name())).unwrap());
        assert_eq!(names(&d64), vec!["A", "B", "C", "D"]);
        assert!(!d64.sort_directory_by(|a, b| a.name().cmp(&b.name())).unwrap());

        assert!(d64.reorder_directory_by_names(&["D", "NOPE", "B"]).unwrap());
        assert_eq!(names(&d64), vec!["D", "B", "A", "C"]);

        assert!(d64.move_file_first("C").unwrap());
        assert_eq!(names(&d64), vec!["C", "D", "B", "A"]);
        assert!(!d64.move_file_first("C").unwrap());

        assert!(d64.move_file("B", true).unwrap());
        assert_eq!(names(&d64), vec!["C", "B", "D", "A"]);
        assert!(!d64.move_file("A", false).unwrap());
        assert!(!d64.move_file("C", true).unwrap());
        assert!(d64.move_file("Z", true).unwrap_err() == DiskError::NotFound);

        // Contents follow their entries.
        assert_eq!(d64.read_file("D").unwrap(), b"D".to_vec());

        let mut partial = d64.directory().unwrap();
        partial.pop();
        assert!(d64.reorder_directory(&partial).unwrap_err() == DiskError::InvalidDirectoryOrder);
        let mut duplicated = d64.directory().unwrap();
        duplicated[1] = duplicated[0].clone();
        assert!(
            d64.reorder_directory(&duplicated).unwrap_err() == DiskError::InvalidDirectoryOrder
        );
        assert!(d64.verify(false, None).unwrap());

        let mut empty = D64::new().unwrap();
        assert!(!empty.sort_directory_by(|a, b| a.name().cmp(&b.name())).unwrap());
    }

    #[test]
    fn test_compact_directory() {
        let mut d64 = D64::new().unwrap();
        for i in 0..20 {
            d64.add_file(&format!("FILE{:02}", i), FileType::SEQ, &[i as u8])
                .unwrap();
        }
        // Twenty entries span three directory sectors.
        assert_eq!(d64.bam().unwrap().free_count(18).unwrap(), 15);
        for i in 0..20 {
            if i % 3 != 0 {
                d64.remove_file(&format!("FILE{:02}", i)).unwrap();
            }
        }
        let before = names(&d64);
        assert_eq!(before.len(), 7);
        assert_eq!(d64.compact_directory().unwrap(), 2);
        assert_eq!(names(&d64), before);
        assert_eq!(d64.bam().unwrap().free_count(18).unwrap(), 17);
        let root = d64.read_sector(Location(18, 1)).unwrap();
        assert_eq!(&root[0..2], &[0x00, 0xFF]);
        assert_eq!(d64.compact_directory().unwrap(), 0);
        assert!(d64.verify(false, None).unwrap());
        assert_eq!(d64.read_file("FILE18").unwrap(), vec![18]);

        // The directory grows again after compaction.
        for i in 0..10 {
            d64.add_file(&format!("MORE{}", i), FileType::SEQ, &[1]).unwrap();
        }
        assert_eq!(d64.directory().unwrap().len(), 17);
        assert!(d64.verify(false, None).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.d64");
        let mut d64 = D64::new().unwrap();
        d64.add_file("HELLO", FileType::PRG, b"HELLO WORLD").unwrap();
        d64.save(&path).unwrap();

        let mut other = D64::with_geometry(D64::geometry_40_tracks()).unwrap();
        other.load(&path).unwrap();
        assert_eq!(other.as_bytes(), d64.as_bytes());
        assert_eq!(other.read_file("HELLO").unwrap(), b"HELLO WORLD".to_vec());
        assert_eq!(other.disk_format().last_track, 35);

        let copy = D64::from_file(&path).unwrap();
        assert_eq!(copy.directory().unwrap().len(), 1);

        let extracted = d64.extract_file("HELLO", dir.path()).unwrap();
        assert_eq!(extracted, dir.path().join("HELLO.prg"));
        assert_eq!(fs::read(&extracted).unwrap(), b"HELLO WORLD".to_vec());
    }

    #[test]
    fn test_load_rejects_bad_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut d64 = D64::new().unwrap();
        d64.add_file("KEEP", FileType::PRG, &[1]).unwrap();

        // Wrong size: nothing changes.
        let short = dir.path().join("short.d64");
        fs::write(&short, vec![0u8; 1000]).unwrap();
        assert!(d64.load(&short).unwrap_err() == DiskError::InvalidLayout);
        assert_eq!(d64.read_file("KEEP").unwrap(), vec![1]);

        // Right size, but not a formatted disk: reset to a blank disk.
        let blank = dir.path().join("blank.d64");
        fs::write(&blank, vec![0u8; 196_608]).unwrap();
        assert!(d64.load(&blank).unwrap_err() == DiskError::InvalidImage);
        assert_eq!(d64.disk_name().unwrap(), "NEW DISK");
        assert_eq!(d64.directory().unwrap().len(), 0);
        assert_eq!(d64.blocks_free().unwrap(), 749);
        assert!(D64::from_file(&blank).unwrap_err() == DiskError::InvalidImage);
        assert!(D64::open(&blank, false).unwrap_err() == DiskError::InvalidImage);
    }

    #[test]
    fn test_load_multi_sector_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.d64");
        let mut d64 = D64::new().unwrap();
        for i in 0..9 {
            d64.add_file(&format!("FILE{}", i), FileType::PRG, &[i as u8])
                .unwrap();
        }
        let root = d64.read_sector(Location(18, 1)).unwrap();
        assert_eq!(&root[0..2], &[18, 11]);
        d64.save(&path).unwrap();

        let copy = D64::from_file(&path).unwrap();
        assert_eq!(copy.as_bytes(), d64.as_bytes());
        assert_eq!(names(&copy), names(&d64));
        assert_eq!(copy.read_file("FILE8").unwrap(), vec![8]);
        let mut other = D64::new().unwrap();
        other.load(&path).unwrap();
        assert_eq!(other.directory().unwrap().len(), 9);
        assert!(other.verify(false, None).unwrap());
    }

    #[test]
    fn test_load_rejects_bad_root_link() {
        let dir = tempfile::tempdir().unwrap();
        for (i, link) in [Location(18, 0), Location(18, 1), Location(17, 3)]
            .iter()
            .enumerate()
        {
            let path = dir.path().join(format!("bad{}.d64", i));
            let mut d64 = D64::new().unwrap();
            d64.write_byte(Location(18, 1), 0, link.0).unwrap();
            d64.write_byte(Location(18, 1), 1, link.1).unwrap();
            d64.save(&path).unwrap();
            assert!(D64::from_file(&path).unwrap_err() == DiskError::InvalidImage);
        }
    }

    #[test]
    fn test_mapped_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.d64");
        D64::new().unwrap().save(&path).unwrap();

        {
            let mut d64 = D64::open(&path, true).unwrap();
            d64.add_file("MAPPED", FileType::SEQ, &[5; 300]).unwrap();
            d64.flush().unwrap();
        }
        let mut d64 = D64::open(&path, false).unwrap();
        assert_eq!(d64.read_file("MAPPED").unwrap(), vec![5; 300]);
        assert!(d64.add_file("NO", FileType::SEQ, &[1]).unwrap_err() == DiskError::ReadOnly);
        assert!(d64.rename_disk("NO").unwrap_err() == DiskError::ReadOnly);
    }
}
