use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};

use log::{error, warn};
use thiserror::Error;

use crate::disk::chain;
use crate::disk::directory::{self, FileType};
use crate::disk::error::DiskError;
use crate::disk::file::FileOps;
use crate::disk::{Bam, Location, D64};

/// A validation error represents an inconsistency in the disk image found by
/// the validate() function.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("System sector not allocated: {0}")]
    SystemSectorNotAllocated(Location),
    /// The sector is marked allocated, but nothing occupies it.
    #[error("Sector misallocated: {0}")]
    SectorMisallocated(Location),
    /// The sector is occupied by a file, but marked free.
    #[error("Sector {0} misoccupied by file: {1:?}")]
    SectorMisoccupied(Location, String),
    #[error("Sector {0} occupied by multiple files, including at least: {1:?} {2:?}")]
    SectorOveroccupied(Location, String, String),
    /// The stored free count of a track disagrees with its bitmap.
    #[error("Track {track} free count is {stored}, bitmap shows {expected}")]
    FreeCountMismatch { track: u8, stored: u8, expected: u8 },
    #[error("Error scanning {1:?}: {0}")]
    FileScanError(DiskError, String),
}

static SYSTEM_OWNER: &str = "CBM DOS";
static DIRECTORY_OWNER: &str = "directory";

/// Open the specified file and return a list of all occupied sectors.  This is
/// its own function so we can handle either of two possible error sources as
/// one.
fn scan_file(d64: &D64, entry: &directory::DirectoryEntry) -> io::Result<Vec<Location>> {
    d64.open_file_from_entry(entry)?.occupied_sectors()
}

/// Collect the sectors of a damaged file that are still reachable by
/// following its links up to the first bad one.
fn salvage_file(d64: &D64, entry: &directory::DirectoryEntry) -> Vec<Location> {
    let (mut locations, _) = chain::reachable_locations(d64.blocks(), entry.first_sector);
    if entry.file_attributes.file_type == FileType::REL {
        let (side_sectors, _) = chain::reachable_locations(d64.blocks(), entry.first_side_sector);
        locations.extend(side_sectors);
    }
    locations
}

/// Turn a scan failure into a validation error.  Plain I/O errors are not
/// disk inconsistencies and are passed through.
fn scan_error(e: io::Error, owner: &str) -> io::Result<ValidationError> {
    match DiskError::from_io_error(&e) {
        Some(error) => Ok(ValidationError::FileScanError(error, owner.to_string())),
        None => Err(e),
    }
}

/// Check the consistency of the provided disk.  Unlike the "validate" ("v0:")
/// command in CBM DOS, this is a read-only operation and does not attempt any
/// repairs.  A list of validation errors is returned.
pub fn validate(d64: &D64) -> io::Result<Vec<ValidationError>> {
    let mut errors: Vec<ValidationError> = vec![];
    let format = d64.disk_format();
    let bam = d64.bam()?;
    let system_sectors: BTreeSet<Location> = format.system_locations().into_iter().collect();
    let allocated_sectors: BTreeSet<Location> = bam.allocated_sectors()?.into_iter().collect();

    // Build a list of all occupied sectors and their owners
    // 1. System sectors and the directory chain.
    let mut occupied: BTreeMap<Location, String> = BTreeMap::new();
    let (directory_sectors, directory_error) =
        chain::reachable_locations(d64.blocks(), format.first_directory_location());
    if let Some(e) = directory_error {
        errors.push(scan_error(e, DIRECTORY_OWNER)?);
    }
    for location in system_sectors.iter().cloned().chain(directory_sectors) {
        occupied.insert(location, SYSTEM_OWNER.to_string());
    }
    // 2. All files
    for entry in d64.iter() {
        // A broken directory chain was reported above.
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => break,
        };
        let file_occupied_sectors = match scan_file(d64, &entry) {
            Ok(file_occupied_sectors) => file_occupied_sectors,
            Err(e) => {
                errors.push(scan_error(e, &entry.name())?);
                salvage_file(d64, &entry)
            }
        };
        for location in file_occupied_sectors {
            match occupied.entry(location) {
                Entry::Occupied(owner) => {
                    errors.push(ValidationError::SectorOveroccupied(
                        location,
                        owner.get().clone(),
                        entry.name(),
                    ));
                }
                Entry::Vacant(v) => {
                    v.insert(entry.name());
                }
            };
        }
    }

    // Confirm all system sectors are still allocated
    for location in system_sectors.iter() {
        if !allocated_sectors.contains(location) {
            errors.push(ValidationError::SystemSectorNotAllocated(*location));
        }
    }

    // Look for sectors that are allocated but not occupied.
    for location in allocated_sectors.iter() {
        if !occupied.contains_key(location) {
            errors.push(ValidationError::SectorMisallocated(*location));
        }
    }

    // Look for sectors that are occupied but not allocated.
    for (location, owner) in occupied.iter() {
        if system_sectors.contains(location) || allocated_sectors.contains(location) {
            // System sector misoccupation was handled with SystemSectorNotAllocated above.
            continue;
        }
        if !format.is_valid_location(*location) {
            // An out-of-range link is reported by the file scan.
            continue;
        }
        errors.push(ValidationError::SectorMisoccupied(*location, owner.clone()));
    }

    // Confirm the stored free counts agree with the bitmaps.
    for track in format.first_track..=format.last_track {
        let entry = bam.entry(track)?;
        let expected = entry.bitmap_free_count(format.sectors_in_track(track));
        if entry.free_sectors != expected {
            errors.push(ValidationError::FreeCountMismatch {
                track,
                stored: entry.free_sectors,
                expected,
            });
        }
    }

    Ok(errors)
}

/// Apply the BAM change that resolves `error`, if there is one.  Returns true
/// if the BAM was changed.
fn repair(bam: &mut Bam<&mut [u8]>, error: &ValidationError) -> io::Result<bool> {
    use self::ValidationError::*;
    match *error {
        SystemSectorNotAllocated(location) | SectorMisoccupied(location, _) => {
            bam.set_sector_free(location, false)?;
            Ok(true)
        }
        SectorMisallocated(location) => {
            bam.set_sector_free(location, true)?;
            Ok(true)
        }
        FreeCountMismatch {
            track, expected, ..
        } => {
            bam.set_free_count(track, expected)?;
            Ok(true)
        }
        SectorOveroccupied(..) | FileScanError(..) => Ok(false),
    }
}

/// Send a verification message to the log destination if one was supplied,
/// or to the logger otherwise.
fn report(
    log: &mut Option<&mut dyn Write>,
    prefix: &str,
    message: &dyn fmt::Display,
) -> io::Result<()> {
    match log {
        Some(writer) => writeln!(writer, "{}: {}", prefix, message),
        None => {
            if prefix == "ERROR" {
                error!("{}", message);
            } else {
                warn!("{}: {}", prefix, message);
            }
            Ok(())
        }
    }
}

/// Cross-check the BAM against the sectors actually reachable from the
/// directory.  Every mismatch is reported; with `fix`, bitmap bits and free
/// counts are corrected to match.  Returns false if any mismatch was found,
/// whether or not it was fixed.
pub(crate) fn verify(
    d64: &mut D64,
    fix: bool,
    mut log: Option<&mut dyn Write>,
) -> io::Result<bool> {
    let errors = validate(d64)?;
    for error in errors.iter() {
        report(&mut log, "ERROR", error)?;
    }
    if !fix {
        return Ok(errors.is_empty());
    }

    let format = d64.disk_format();
    let mut bam = d64.bam_mut()?;
    for error in errors.iter() {
        if let ValidationError::FreeCountMismatch { .. } = error {
            // Counts are recomputed below, after the bitmaps are settled.
            continue;
        }
        if repair(&mut bam, error)? {
            report(&mut log, "FIXING", error)?;
        }
    }
    for track in format.first_track..=format.last_track {
        let entry = bam.entry(track)?;
        let expected = entry.bitmap_free_count(format.sectors_in_track(track));
        if entry.free_sectors != expected {
            let error = ValidationError::FreeCountMismatch {
                track,
                stored: entry.free_sectors,
                expected,
            };
            repair(&mut bam, &error)?;
            report(&mut log, "FIXING", &error)?;
        }
    }
    Ok(errors.is_empty())
}
