use std::collections::HashSet;
use std::io;

use log::debug;

use crate::disk::block::{BlockDevice, Location, BLOCK_SIZE};
use crate::disk::error::DiskError;

/// The number of payload bytes in each chained sector.
pub const CHAIN_PAYLOAD_SIZE: usize = BLOCK_SIZE - 2;

/// The first two bytes of every chained sector: either the location of the
/// next sector, or a tail marker holding the number of bytes used in this
/// sector (including the two link bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    Next(Location),
    Tail(usize), // used bytes
}

impl ChainLink {
    #[inline]
    pub fn new(block: &[u8]) -> io::Result<ChainLink> {
        if block[0] == 0x00 {
            // This is the last sector of the chain, so the next byte indicates how much of
            // this sector is actually used.
            if block[1] < 1 {
                // It's not valid for a chain sector to not include the first two bytes
                // as allocated.
                return Err(DiskError::InvalidChainLink.into());
            }
            Ok(ChainLink::Tail(block[1] as usize + 1)) // 2..=256
        } else {
            Ok(ChainLink::Next(Location::new(block[0], block[1])))
        }
    }

    #[inline]
    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= 2);
        match self {
            ChainLink::Next(location) => location.write_bytes(bytes),
            ChainLink::Tail(size) => {
                assert!(*size >= 2 && *size <= BLOCK_SIZE);
                bytes[0] = 0x00;
                bytes[1] = (*size - 1) as u8;
            }
        }
    }
}

/// A ChainSector is the result of a chain iteration, and provides the block contents and the
/// location from which it was read.
pub struct ChainSector {
    /// The used part of the block, including the two-byte link.
    pub data: Vec<u8>,
    pub location: Location,
}

/// Walks a chain of linked sectors, yielding each sector in order.
pub struct ChainIterator<'a> {
    blocks: &'a dyn BlockDevice,
    next_sector: Option<Location>,
    visited_sectors: HashSet<Location>,
}

impl<'a> ChainIterator<'a> {
    /// Create a new chain iterator starting at the specified location.
    pub fn new(blocks: &'a dyn BlockDevice, starting_sector: Location) -> ChainIterator<'a> {
        ChainIterator {
            blocks,
            next_sector: Some(starting_sector),
            visited_sectors: HashSet::new(),
        }
    }

    /// Read the entire chain and return a list of locations.
    pub fn locations(self) -> io::Result<Vec<Location>> {
        self.map(|r| r.map(|cs| cs.location)).collect()
    }
}

impl<'a> Iterator for ChainIterator<'a> {
    type Item = io::Result<ChainSector>;

    fn next(&mut self) -> Option<io::Result<ChainSector>> {
        let location = self.next_sector.take()?;

        // Loop detection.
        if !self.visited_sectors.insert(location) {
            return Some(Err(DiskError::ChainLoop.into()));
        }

        let block = match self.blocks.sector(location) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };

        // Trim the block if needed.
        let size = match ChainLink::new(block) {
            Ok(ChainLink::Next(next)) => {
                self.next_sector = Some(next);
                BLOCK_SIZE // The entire sector is used.
            }
            Ok(ChainLink::Tail(size)) => size,
            Err(e) => return Some(Err(e)),
        };

        Some(Ok(ChainSector {
            data: block[..size].to_vec(),
            location,
        }))
    }
}

/// Follow the chain from `start` for as long as it stays intact.  Returns
/// every sector reached, including one whose own link is bad, and the error
/// that stopped the walk, if any.
pub fn reachable_locations(
    blocks: &dyn BlockDevice,
    start: Location,
) -> (Vec<Location>, Option<io::Error>) {
    let mut locations = vec![];
    let mut visited = HashSet::new();
    let mut next = Some(start);
    while let Some(location) = next.take() {
        if !visited.insert(location) {
            return (locations, Some(DiskError::ChainLoop.into()));
        }
        let block = match blocks.sector(location) {
            Ok(block) => block,
            Err(e) => return (locations, Some(e)),
        };
        locations.push(location);
        match ChainLink::new(block) {
            Ok(ChainLink::Next(location)) => next = Some(location),
            Ok(ChainLink::Tail(_)) => {}
            Err(e) => return (locations, Some(e)),
        }
    }
    (locations, None)
}

/// Return the number of sectors needed to chain `len` bytes.
#[inline]
pub fn sectors_needed(len: usize) -> usize {
    (len + CHAIN_PAYLOAD_SIZE - 1) / CHAIN_PAYLOAD_SIZE
}

/// Read the payload of a chain, following the links from `start`.
pub fn read_chain(blocks: &dyn BlockDevice, start: Location) -> io::Result<Vec<u8>> {
    let mut contents = vec![];
    for sector in ChainIterator::new(blocks, start) {
        contents.extend_from_slice(&sector?.data[2..]);
    }
    Ok(contents)
}

/// Read the payload of an explicit list of data sectors, as found in the
/// side sectors of a relative file.  Every sector but the last contributes
/// its full payload; the last contributes the number of bytes given by its
/// tail link.
pub fn read_sectors(blocks: &dyn BlockDevice, locations: &[Location]) -> io::Result<Vec<u8>> {
    let mut contents = Vec::with_capacity(locations.len() * CHAIN_PAYLOAD_SIZE);
    for (i, location) in locations.iter().enumerate() {
        let block = blocks.sector(*location)?;
        let size = match ChainLink::new(block)? {
            ChainLink::Next(_) if i + 1 < locations.len() => BLOCK_SIZE,
            ChainLink::Tail(size) if i + 1 == locations.len() => size,
            _ => return Err(DiskError::InvalidChainLink.into()),
        };
        contents.extend_from_slice(&block[2..size]);
    }
    Ok(contents)
}

/// Write `data` as a chain across the provided (already allocated)
/// locations.  The number of locations must match `sectors_needed()`.
pub fn write_chain(
    blocks: &mut dyn BlockDevice,
    locations: &[Location],
    data: &[u8],
) -> io::Result<()> {
    if data.is_empty() {
        return Err(DiskError::EmptyFile.into());
    }
    if locations.len() != sectors_needed(data.len()) {
        return Err(DiskError::WriteUnderrun.into());
    }
    for (i, chunk) in data.chunks(CHAIN_PAYLOAD_SIZE).enumerate() {
        let link = match locations.get(i + 1) {
            Some(next) => ChainLink::Next(*next),
            None => ChainLink::Tail(chunk.len() + 2),
        };
        let block = blocks.sector_mut(locations[i])?;
        block.iter_mut().for_each(|b| *b = 0);
        link.to_bytes(block);
        block[2..2 + chunk.len()].copy_from_slice(chunk);
    }
    debug!(
        "wrote {} bytes to chain {}",
        data.len(),
        Location::format_locations(locations)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::block::ImageBlockDevice;
    use crate::disk::image::Image;
    use crate::disk::D64;

    fn blank_device() -> ImageBlockDevice {
        let geometry = D64::geometry();
        ImageBlockDevice::new(Image::open_memory(geometry.size()), geometry)
    }

    #[test]
    fn test_chain_link() {
        assert_eq!(
            ChainLink::new(&[0x11, 0x05]).unwrap(),
            ChainLink::Next(Location(17, 5))
        );
        assert_eq!(ChainLink::new(&[0x00, 0xFF]).unwrap(), ChainLink::Tail(256));
        assert_eq!(ChainLink::new(&[0x00, 0x01]).unwrap(), ChainLink::Tail(2));
        assert!(ChainLink::new(&[0x00, 0x00]).unwrap_err() == DiskError::InvalidChainLink);

        let mut bytes = [0u8; 2];
        ChainLink::Tail(12).to_bytes(&mut bytes);
        assert_eq!(bytes, [0x00, 11]);
    }

    #[test]
    fn test_write_and_read_chain() {
        let mut blocks = blank_device();
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let locations = [Location(17, 0), Location(17, 10), Location(17, 20)];
        assert_eq!(sectors_needed(data.len()), 3);
        write_chain(&mut blocks, &locations, &data).unwrap();

        // The final sector holds 600 - 2*254 = 92 bytes.
        assert_eq!(blocks.byte(Location(17, 20), 0).unwrap(), 0);
        assert_eq!(blocks.byte(Location(17, 20), 1).unwrap(), 93);
        assert_eq!(blocks.byte(Location(17, 0), 0).unwrap(), 17);
        assert_eq!(blocks.byte(Location(17, 0), 1).unwrap(), 10);

        assert_eq!(read_chain(&blocks, Location(17, 0)).unwrap(), data);
        assert_eq!(read_sectors(&blocks, &locations).unwrap(), data);
        assert_eq!(
            ChainIterator::new(&blocks, Location(17, 0))
                .locations()
                .unwrap(),
            locations.to_vec()
        );
    }

    #[test]
    fn test_exact_sector_payload() {
        let mut blocks = blank_device();
        let data = vec![0x5a; CHAIN_PAYLOAD_SIZE];
        write_chain(&mut blocks, &[Location(1, 0)], &data).unwrap();
        assert_eq!(blocks.byte(Location(1, 0), 1).unwrap(), 0xFF);
        assert_eq!(read_chain(&blocks, Location(1, 0)).unwrap(), data);
    }

    #[test]
    fn test_chain_loop() {
        let mut blocks = blank_device();
        Location(1, 1).write_bytes(blocks.sector_mut(Location(1, 0)).unwrap());
        Location(1, 0).write_bytes(blocks.sector_mut(Location(1, 1)).unwrap());
        assert!(read_chain(&blocks, Location(1, 0)).unwrap_err() == DiskError::ChainLoop);
    }

    #[test]
    fn test_reachable_locations() {
        let mut blocks = blank_device();
        let data = vec![0x11; 600];
        let locations = [Location(17, 0), Location(17, 10), Location(17, 20)];
        write_chain(&mut blocks, &locations, &data).unwrap();
        let (reached, error) = reachable_locations(&blocks, Location(17, 0));
        assert_eq!(reached, locations.to_vec());
        assert!(error.is_none());

        // A link off the disk stops the walk after the sector holding it.
        blocks.set_byte(Location(17, 10), 0, 99).unwrap();
        let (reached, error) = reachable_locations(&blocks, Location(17, 0));
        assert_eq!(reached, vec![Location(17, 0), Location(17, 10)]);
        assert!(error.is_some());

        // A zero tail size still counts the sector as reached.
        let (reached, error) = reachable_locations(&blocks, Location(1, 0));
        assert_eq!(reached, vec![Location(1, 0)]);
        assert!(error.unwrap() == DiskError::InvalidChainLink);

        Location(17, 0).write_bytes(blocks.sector_mut(Location(17, 10)).unwrap());
        let (reached, error) = reachable_locations(&blocks, Location(17, 0));
        assert_eq!(reached, vec![Location(17, 0), Location(17, 10)]);
        assert!(error.unwrap() == DiskError::ChainLoop);
    }

    #[test]
    fn test_location_count_mismatch() {
        let mut blocks = blank_device();
        let e = write_chain(&mut blocks, &[Location(1, 0)], &[0u8; 300]).unwrap_err();
        assert!(e == DiskError::WriteUnderrun);
        let e = write_chain(&mut blocks, &[Location(1, 0)], &[]).unwrap_err();
        assert!(e == DiskError::EmptyFile);
    }
}
