//! This is a Rust library for creating, editing, and checking disk images of
//! the Commodore 1541 floppy drive, the standard disk drive of the legendary
//! Commodore 64 home computer.  Disk images use the D64 format: a flat dump of
//! every 256-byte sector on the disk.
//!
//! Features:
//!
//! * Create, load, and save 35-track and 40-track (Dolphin DOS) D64 images.
//! * Format disk images, and rename disks.
//! * Iterate directory entries.
//! * Read, write, delete, rename, lock, and unlock files.
//! * Write sequential (SEQ, PRG, USR) and relative (REL) files, including
//! the side sectors which index relative file records.
//! * Emulate the 1541 CBM DOS's "next available track and sector" algorithm
//! (interleave 10, searching outward from the directory track) when
//! writing files.
//! * Reorder, sort, and compact the directory.
//! * Allocate and free individual sectors in the Block Availability Map (BAM).
//! * Validate the consistency of disk images, and repair the BAM.
//! * A sample `cdisk` program for operating on D64 disk images.
//!
//! Current shortcomings:
//!
//! * Error tables appended to disk images are not supported.
//! * Files are written in one piece; there is no streaming writer, and
//! relative files cannot be extended record by record.
//!
//! # Example
//!
//! The following example creates a disk image, stores a program on it, and
//! prints the directory listing:
//!
//! ```
//! use std::io;
//! use cbm_d64::disk::{FileType, D64};
//! # fn main() -> io::Result<()> {
//!
//! let mut disk = D64::new()?;
//! disk.rename_disk("DEMO")?;
//! disk.add_file("HELLO", FileType::PRG, &[0x01, 0x08, 0x00, 0x00])?;
//! assert_eq!(disk.read_file("HELLO")?, vec![0x01, 0x08, 0x00, 0x00]);
//! println!("{}", disk);
//! # Ok(())
//! # }
//! ```
//!
//! This prints a listing in the same style as `LOAD "$",8`:
//!
//! ```text
//! 0 "DEMO            "    2A
//! 1    "HELLO"            prg
//! 663 blocks free.
//! ```
//!
//! For more examples, see the accompanying `cdisk` program, which allows
//! various operations to be performed on disk images from the command line.
//!
//! # Design of disk image access
//!
//! Support for disk images was built using a layered scheme:
//!
//! 1. `Image` provides access to the underlying storage containing the disk
//!    image -- either a memory-mapped disk image file or an in-memory array.
//! 2. `BlockDevice` divides the image into tracks and sectors according to
//!    a `Geometry`.
//! 3. `DiskFormat` describes how CBM DOS uses the tracks and sectors to store
//!    and retrieve common structures such as the disk header, Block
//!    Availability Map (BAM), and directories.
//! 4. `D64` exposes high-level functionality such as opening files,
//!    formatting the disk, validating, etc.
//! 5. Opening a file yields a `File` object which is accessed in varying ways
//!    according to the scheme used to implement its underlying structure
//!    (linear files or relative files).
//!
//! The image bytes are the only state that matters.  The header, the BAM, and
//! the directory are never cached: every operation reads them from the image
//! and writes changes straight back, so the image can always be saved as-is.
//! Open files borrow the disk image, so a file cannot outlive (or observe a
//! reformat of) the disk it was opened from.
//!
//! # Design shortcomings
//!
//! CBM DOS tracks start at 1 instead of 0, which causes no end of
//! implementation confusion.  The API provided by this crate reflects this
//! 1-based indexing.  In particular, `Geometry` track tables are indexed by
//! track number, with the zeroth entry unused.
//!
//! # License
//!
//! Distributed under the terms of both the MIT license and the Apache License
//! (Version 2.0).

pub mod disk;

mod util;
