use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap::{Mmap, MmapMut, MmapOptions};

use crate::disk::error::DiskError;

/// Backing storage for a disk image: either an owned buffer, or a file mapped
/// into memory for in-place editing.
pub enum Image {
    ReadOnlyMap(Mmap),
    ReadWriteMap(MmapMut),
    Memory(Box<[u8]>),
}

impl Image {
    /// Create a zero-filled in-memory image.
    pub fn open_memory(length: usize) -> Image {
        Image::Memory(vec![0; length].into_boxed_slice())
    }

    /// Take ownership of an existing buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Image {
        Image::Memory(bytes.into_boxed_slice())
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Image::ReadOnlyMap(mmap))
    }

    pub fn open_read_write<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Image::ReadWriteMap(mmap))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return true if this image is backed by a file mapping.
    pub fn is_mapped(&self) -> bool {
        !matches!(self, Image::Memory(_))
    }

    /// Return the whole image.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Image::ReadOnlyMap(mmap) => &mmap[..],
            Image::ReadWriteMap(mmap) => &mmap[..],
            Image::Memory(array) => &array[..],
        }
    }

    fn check_bounds(&self, end: usize) -> io::Result<()> {
        if end > self.len() {
            Err(DiskError::InvalidOffset.into())
        } else {
            Ok(())
        }
    }

    pub fn check_writability(&self) -> io::Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::ReadOnly.into()),
            Image::ReadWriteMap(_) | Image::Memory(_) => Ok(()),
        }
    }

    pub fn slice(&self, offset: usize, length: usize) -> io::Result<&[u8]> {
        self.check_bounds(offset + length)?;
        Ok(&self.as_bytes()[offset..offset + length])
    }

    pub fn slice_mut(&mut self, offset: usize, length: usize) -> io::Result<&mut [u8]> {
        self.check_bounds(offset + length)?;
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::ReadOnly.into()),
            Image::ReadWriteMap(mmap) => Ok(&mut mmap[offset..offset + length]),
            Image::Memory(array) => Ok(&mut array[offset..offset + length]),
        }
    }

    /// Sync a writable mapping to its file.  This is a no-op for in-memory
    /// images.
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Err(DiskError::ReadOnly.into()),
            Image::ReadWriteMap(mmap) => mmap.flush(),
            Image::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_image_bounds() {
        let mut image = Image::open_memory(512);
        assert_eq!(image.len(), 512);
        assert!(!image.is_mapped());
        image.slice_mut(256, 256).unwrap()[0] = 0x42;
        assert_eq!(image.slice(256, 1).unwrap(), &[0x42]);
        assert!(image.slice(300, 256).unwrap_err() == DiskError::InvalidOffset);
        assert!(image.check_writability().is_ok());
        assert!(image.flush().is_ok());
    }
}
