use std::io;

use thiserror::Error;

/// Errors that can be returned from disk image operations.  These are
/// generally converted into `io::Error`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DiskError {
    /// Unknown error
    #[error("unknown error")]
    Unknown,
    /// Write access attempted to read-only media
    #[error("write access attempted to read-only media")]
    ReadOnly,
    /// Bad track or sector
    #[error("bad track or sector")]
    InvalidLocation,
    /// Offset out of bounds
    #[error("offset out of bounds")]
    InvalidOffset,
    /// The image size matches no known geometry
    #[error("invalid layout")]
    InvalidLayout,
    /// The image failed structural validation
    #[error("invalid disk image")]
    InvalidImage,
    /// Invalid BAM
    #[error("invalid BAM")]
    InvalidBAM,
    /// File not found
    #[error("file not found")]
    NotFound,
    /// Chain loop detected
    #[error("chain loop detected")]
    ChainLoop,
    /// Invalid chain link
    #[error("invalid chain link")]
    InvalidChainLink,
    /// Invalid relative file layout, or a relative-only operation on another
    /// kind of file
    #[error("invalid relative file layout")]
    InvalidRelativeFile,
    /// A relative file would need more side sectors than the format allows
    #[error("too many side sectors")]
    TooManySideSectors,
    /// Attempt to write a resource with no embedded position
    #[error("attempt to write a resource with no embedded position")]
    Unpositioned,
    /// Write underrun
    #[error("write underrun")]
    WriteUnderrun,
    /// Filename exceeds maximum length
    #[error("filename exceeds maximum length")]
    FilenameTooLong,
    /// Filename is empty or not representable
    #[error("invalid filename")]
    InvalidFilename,
    /// A file must contain at least one byte
    #[error("file contents are empty")]
    EmptyFile,
    /// A file with the specified filename already exists
    #[error("a file with the specified filename already exists")]
    FileExists,
    /// Disk is full
    #[error("disk is full")]
    DiskFull,
    /// Invalid record index
    #[error("invalid record index")]
    InvalidRecordIndex,
    /// A record exceeded the maximum size.
    #[error("a record exceeded the maximum size")]
    RecordTooLarge,
    /// The sector is already marked free in the BAM
    #[error("sector is already free")]
    SectorAlreadyFree,
    /// The sector is already marked allocated in the BAM
    #[error("sector is already allocated")]
    SectorAlreadyAllocated,
    /// The BAM sector and the first directory sector can never be freed
    #[error("attempt to free a reserved system sector")]
    ProtectedSector,
    /// A requested directory order does not match the directory contents
    #[error("directory order does not match the directory contents")]
    InvalidDirectoryOrder,
}

impl From<DiskError> for io::Error {
    fn from(error: DiskError) -> io::Error {
        use std::io::ErrorKind;
        let kind = match error {
            DiskError::Unknown | DiskError::ReadOnly | DiskError::DiskFull => ErrorKind::Other,
            DiskError::InvalidLocation
            | DiskError::InvalidOffset
            | DiskError::Unpositioned
            | DiskError::WriteUnderrun => ErrorKind::InvalidInput,
            DiskError::FilenameTooLong
            | DiskError::InvalidFilename
            | DiskError::EmptyFile
            | DiskError::FileExists => ErrorKind::InvalidInput,
            DiskError::InvalidRecordIndex
            | DiskError::RecordTooLarge
            | DiskError::InvalidDirectoryOrder => ErrorKind::InvalidInput,
            DiskError::SectorAlreadyFree
            | DiskError::SectorAlreadyAllocated
            | DiskError::ProtectedSector => ErrorKind::InvalidInput,
            DiskError::TooManySideSectors => ErrorKind::InvalidInput,
            DiskError::InvalidLayout | DiskError::InvalidImage | DiskError::InvalidBAM => {
                ErrorKind::InvalidData
            }
            DiskError::ChainLoop | DiskError::InvalidChainLink | DiskError::InvalidRelativeFile => {
                ErrorKind::InvalidData
            }
            DiskError::NotFound => ErrorKind::NotFound,
        };
        io::Error::new(kind, error)
    }
}

impl From<io::Error> for DiskError {
    fn from(error: io::Error) -> DiskError {
        DiskError::from_io_error(&error).unwrap_or(DiskError::Unknown)
    }
}

impl DiskError {
    /// If the provided `io::Error` contains a `DiskError`, return the
    /// underlying `DiskError`.  If not, return None.
    pub fn from_io_error(error: &io::Error) -> Option<DiskError> {
        error
            .get_ref()
            .and_then(|e| e.downcast_ref::<DiskError>())
            .cloned()
    }

    /// This is sometimes useful instead of .into() when the compiler doesn't
    /// have enough information to perform type inference.
    pub fn to_io_error(&self) -> io::Error {
        self.clone().into()
    }
}

impl PartialEq<io::Error> for DiskError {
    fn eq(&self, other: &io::Error) -> bool {
        matches!(DiskError::from_io_error(other), Some(ref e) if e == self)
    }
}

impl PartialEq<DiskError> for io::Error {
    fn eq(&self, other: &DiskError) -> bool {
        matches!(DiskError::from_io_error(self), Some(ref e) if e == other)
    }
}
