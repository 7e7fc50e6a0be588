//! # Sector level access to Ole containers
//!
//! Resolve streams stored in the *Compound File Binary Format* down to their sectors
//!
//! The container is never copied: sectors are addressed directly inside the backing
//! buffer (usually a read only memory map, see [`Backing`]) and chains are walked one
//! link at a time. Every sector id is bound checked against the number of sectors the
//! container can actually hold, therefore cyclic or dangling chains end in an error
//! rather than in an endless walk
//!
//! See [`Ole`] for the main interface
//!

#![warn(missing_docs)]

mod directory;
mod lazy;
mod stream;

pub use directory::{DirEntry, DIR_ENTRY_SIZE};
pub use lazy::{ByteRange, LazyStream, PAGE_SIZE};
pub use stream::StreamCursor;

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Next sector sentinel: sector holds part of the FAT
pub const FATSECT: u32 = 0xfffffffd;
/// Next sector sentinel: last sector of a chain
pub const ENDOFCHAIN: u32 = 0xfffffffe;
/// Next sector sentinel: unallocated sector
pub const FREESECT: u32 = 0xffffffff;
/// Highest regular sector id
pub const MAXREGSID: u32 = 0xfffffffa;

const SIGNATURE: [u8; 8] = [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];
const HEADER_SIZE: usize = 512;
const INLINE_MSAT: usize = 109;

/// The two sector universes of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorClass {
    /// Regular sectors, addressed directly in the file
    Large,
    /// Mini sectors, sub-allocated out of the root entry stream
    Small,
}

impl fmt::Display for SectorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Large => f.write_str("large"),
            Self::Small => f.write_str("small"),
        }
    }
}

/// Errors raised while resolving the container structure
#[derive(Debug, Error)]
pub enum OleError {
    /// A sector id outside the valid range was requested
    #[error("Invalid {class} sector 0x{id:x}")]
    InvalidSector {
        /// The sector class the id was looked up in
        class: SectorClass,
        /// The offending id
        id: u32,
    },
    /// A chain ended before the requested offset was reached
    #[error("Stream exhausted at offset {offset}")]
    StreamExhausted {
        /// The stream offset which could not be reached
        offset: u64,
    },
    /// A chain is longer than the container can hold (i.e. it loops)
    #[error("Sector chain is longer than the container")]
    ChainTooLong,
    /// Neither a `Workbook` nor a `Book` stream exists
    #[error("No Workbook found")]
    NoWorkbookStream,
    /// The mini stream or its allocation table are missing
    #[error("Small sector storage empty")]
    EmptySmallStorage,
    /// The requested stream has no valid start sector
    #[error("Stream is empty")]
    EmptyStream,
    /// The byte order mark is not little endian
    #[error("Not LE file")]
    NotLittleEndian,
    /// The sector size exponents are unusable
    #[error("Invalid sector shift {0}")]
    BadSectorShift(u16),
    /// The header does not point to a root directory
    #[error("There's no root stream")]
    NoRoot,
    /// The file is too short to contain a header
    #[error("File truncated")]
    TruncatedHeader,
    /// Error from the IO layer
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Little endian readers over byte slices
///
/// All readers return `None` when the requested bytes are out of bounds
pub mod le {
    /// Reads the `u16` at `offset`
    pub fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
        let end = offset.checked_add(2)?;
        buf.get(offset..end)?.try_into().ok().map(u16::from_le_bytes)
    }

    /// Reads the `u32` at `offset`
    pub fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        buf.get(offset..end)?.try_into().ok().map(u32::from_le_bytes)
    }
}

/// The fixed container header
#[derive(Debug, Clone)]
pub struct Header {
    /// Minor version
    pub minor_version: u16,
    /// Major version
    pub major_version: u16,
    /// Large sector size exponent
    pub large_shift: u32,
    /// Small sector size exponent
    pub small_shift: u32,
    /// Number of FAT sectors
    pub fat_sectors: u32,
    /// First sector of the root directory
    pub root: u32,
    /// Streams shorter than this live in small sectors
    pub mini_cutoff: u32,
    /// First sector of the small sector allocation table
    pub ssat_start: u32,
    /// Number of sectors in the small sector allocation table
    pub ssat_sectors: u32,
    /// First allocation table overflow (DIFAT) sector
    pub msat_start: u32,
    /// Number of overflow sectors
    pub msat_sectors: u32,
    /// The FAT sector ids stored inline in the header
    pub msat: [u32; INLINE_MSAT],
}

impl Header {
    /// Parses and validates the header, pushing non fatal oddities into `anomalies`
    pub fn parse(buf: &[u8], anomalies: &mut Vec<String>) -> Result<Self, OleError> {
        if buf.len() < HEADER_SIZE {
            return Err(OleError::TruncatedHeader);
        }
        let u16_at = |o| le::u16_at(buf, o).ok_or(OleError::TruncatedHeader);
        let u32_at = |o| le::u32_at(buf, o).ok_or(OleError::TruncatedHeader);

        if u16_at(0x1c)? != 0xfffe {
            return Err(OleError::NotLittleEndian);
        }
        let minor_version = u16_at(0x18)?;
        let major_version = u16_at(0x1a)?;
        if !(3..=4).contains(&major_version) {
            anomalies.push(format!(
                "Major version set to {} (expected 3 or 4)",
                major_version
            ));
        }

        let large_shift = u16_at(0x1e)?;
        if !(7..=16).contains(&large_shift) {
            return Err(OleError::BadSectorShift(large_shift));
        }
        if large_shift != 9 && large_shift != 12 {
            anomalies.push(format!("Unusual sector size {}", 1u32 << large_shift));
        }
        let small_shift = u16_at(0x20)?;
        if !(2..=large_shift).contains(&small_shift) {
            return Err(OleError::BadSectorShift(small_shift));
        }
        if small_shift != 6 {
            anomalies.push(format!(
                "Mini sector size should be set to 64 but is set to {}",
                1u32 << small_shift
            ));
        }

        let mini_cutoff = u32_at(0x38)?;
        if mini_cutoff != 0x1000 {
            anomalies.push(format!(
                "Mini Stream Cutoff Size should be {:x} but is {:x}",
                0x1000, mini_cutoff
            ));
        }
        let root = u32_at(0x30)?;
        if root > MAXREGSID {
            return Err(OleError::NoRoot);
        }

        let mut msat = [FREESECT; INLINE_MSAT];
        for (i, slot) in msat.iter_mut().enumerate() {
            *slot = u32_at(0x4c + i * 4)?;
        }

        Ok(Self {
            minor_version,
            major_version,
            large_shift: large_shift.into(),
            small_shift: small_shift.into(),
            fat_sectors: u32_at(0x2c)?,
            root,
            mini_cutoff,
            ssat_start: u32_at(0x3c)?,
            ssat_sectors: u32_at(0x40)?,
            msat_start: u32_at(0x44)?,
            msat_sectors: u32_at(0x48)?,
            msat,
        })
    }
}

/// The backing storage of a container
///
/// Files are memory mapped read only; [`Backing::Owned`] serves buffers already in memory
#[derive(Debug)]
pub enum Backing {
    /// Data owned in memory
    Owned(Vec<u8>),
    /// A read only map of a file
    Mmap(memmap2::Mmap),
}

impl Backing {
    /// Maps the file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OleError> {
        let f = File::open(path)?;
        if f.metadata()?.len() == 0 {
            // Empty files cannot be mapped
            return Ok(Self::Owned(Vec::new()));
        }
        // Safety: the map is read only and the file is not expected to change while open
        let map = unsafe { memmap2::MmapOptions::new().map(&f) }?;
        Ok(Self::Mmap(map))
    }
}

impl AsRef<[u8]> for Backing {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v.as_slice(),
            Self::Mmap(m) => m,
        }
    }
}

impl From<Vec<u8>> for Backing {
    fn from(v: Vec<u8>) -> Self {
        Self::Owned(v)
    }
}

/// The mini stream and its allocation table, opened on demand
#[derive(Debug)]
struct SmallStorage {
    container: StreamCursor,
    ssat: StreamCursor,
    count: u32,
}

/// A parsed Ole container
///
/// # Examples
/// ```no_run
/// use olestore::{Backing, ByteRange, Ole};
///
/// let backing = Backing::open("MyBook.xls").unwrap();
/// let ole = Ole::new(backing).unwrap();
/// let mut workbook = ole.open_workbook().unwrap();
/// let first = workbook.range(0, 4).unwrap();
/// assert_eq!(first[0], 9);
/// ```
///
/// # Errors
/// All failures are reported as [`OleError`]
pub struct Ole<D: AsRef<[u8]>> {
    data: D,
    header: Header,
    anomalies: Vec<String>,
    base: usize,
    large_count: u32,
    small: RefCell<Option<SmallStorage>>,
}

impl<D: AsRef<[u8]>> fmt::Debug for Ole<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ole")
            .field("header", &self.header)
            .field("anomalies", &self.anomalies)
            .field("large_count", &self.large_count)
            .finish()
    }
}

impl<D: AsRef<[u8]>> Ole<D> {
    /// Checks whether `data` starts with the container signature
    pub fn is_ole(data: &[u8]) -> bool {
        data.starts_with(&SIGNATURE)
    }

    /// Parses the container header and sizes the large sector universe
    pub fn new(data: D) -> Result<Self, OleError> {
        let mut anomalies = Vec::new();
        let buf = data.as_ref();
        if buf.len() < HEADER_SIZE {
            return Err(OleError::TruncatedHeader);
        }
        if !Self::is_ole(buf) {
            anomalies.push("Invalid signature".to_string());
        }
        let header = Header::parse(buf, &mut anomalies)?;

        let sector_size = 1usize << header.large_shift;
        let base = HEADER_SIZE.max(sector_size);
        let fat_entries = u64::from(header.fat_sectors) << (header.large_shift - 2);
        let file_sectors = (buf.len().saturating_sub(base) / sector_size) as u64;
        if buf.len().saturating_sub(base) % sector_size != 0 {
            anomalies.push("File ends with a partial sector".to_string());
        }
        let large_count = fat_entries
            .min(file_sectors)
            .min(u64::from(MAXREGSID) + 1) as u32; // Safe: capped above

        for anomaly in &anomalies {
            warn!("{}", anomaly);
        }
        debug!(
            "Ole container: sector size {}, {} sectors, root at {}",
            sector_size, large_count, header.root
        );
        Ok(Self {
            data,
            header,
            anomalies,
            base,
            large_count,
            small: RefCell::new(None),
        })
    }

    /// Returns the parsed header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Lists the anomalies detected in the header
    pub fn anomalies(&self) -> &[String] {
        self.anomalies.as_slice()
    }

    /// Returns the sector size (in bytes) of the given class
    pub fn sector_size(&self, class: SectorClass) -> usize {
        match class {
            SectorClass::Large => 1 << self.header.large_shift,
            SectorClass::Small => 1 << self.header.small_shift,
        }
    }

    /// Returns the number of addressable sectors of the given class
    ///
    /// The small class is empty until the small storage is opened
    pub fn sector_count(&self, class: SectorClass) -> u32 {
        match class {
            SectorClass::Large => self.large_count,
            SectorClass::Small => self.small.borrow().as_ref().map_or(0, |s| s.count),
        }
    }

    /// Checks whether `id` addresses an existing sector
    pub fn is_valid(&self, class: SectorClass, id: u32) -> bool {
        id < self.sector_count(class)
    }

    /// Returns the bytes of sector `id`
    ///
    /// The returned slice is exactly [`sector_size`](Self::sector_size) bytes long
    pub fn sector(&self, class: SectorClass, id: u32) -> Result<&[u8], OleError> {
        match class {
            SectorClass::Large => {
                if id >= self.large_count {
                    return Err(OleError::InvalidSector { class, id });
                }
                let size = self.sector_size(class);
                let start = self.base + id as usize * size;
                self.data
                    .as_ref()
                    .get(start..start + size)
                    .ok_or(OleError::InvalidSector { class, id })
            }
            SectorClass::Small => {
                let mut small = self.small.borrow_mut();
                let small = small.as_mut().ok_or(OleError::EmptySmallStorage)?;
                if id >= small.count {
                    return Err(OleError::InvalidSector { class, id });
                }
                let size = self.sector_size(class);
                let local = small
                    .container
                    .seek(self, u64::from(id) << self.header.small_shift)?;
                let container = self.sector(SectorClass::Large, small.container.sector())?;
                container
                    .get(local..local + size)
                    .ok_or(OleError::InvalidSector { class, id })
            }
        }
    }

    /// Returns the id following `id` in its chain
    ///
    /// The result may be one of the sentinels ([`ENDOFCHAIN`], [`FREESECT`], ...)
    pub fn next_sector(&self, class: SectorClass, id: u32) -> Result<u32, OleError> {
        match class {
            SectorClass::Large => {
                if id >= self.large_count {
                    return Err(OleError::InvalidSector { class, id });
                }
                let per_sector = self.sector_size(class) / 4;
                let fat_sector = self.fat_sector(id as usize / per_sector)?;
                let fat = self.sector(class, fat_sector)?;
                le::u32_at(fat, (id as usize % per_sector) * 4)
                    .ok_or(OleError::InvalidSector { class, id })
            }
            SectorClass::Small => {
                let mut small = self.small.borrow_mut();
                let small = small.as_mut().ok_or(OleError::EmptySmallStorage)?;
                if id >= small.count {
                    return Err(OleError::InvalidSector { class, id });
                }
                let local = small.ssat.seek(self, u64::from(id) * 4)?;
                let ssat = self.sector(SectorClass::Large, small.ssat.sector())?;
                le::u32_at(ssat, local).ok_or(OleError::InvalidSector { class, id })
            }
        }
    }

    /// Locates the `index`-th FAT sector, either inline or along the overflow chain
    fn fat_sector(&self, index: usize) -> Result<u32, OleError> {
        let class = SectorClass::Large;
        let id = match self.header.msat.get(index) {
            Some(&id) => id,
            None => {
                let per_sector = self.sector_size(class) / 4 - 1;
                let mut remaining = index - INLINE_MSAT;
                let mut msat = self.header.msat_start;
                loop {
                    let sector = self.sector(class, msat)?;
                    if remaining < per_sector {
                        break le::u32_at(sector, remaining * 4)
                            .ok_or(OleError::InvalidSector { class, id: msat })?;
                    }
                    // The last slot links the next overflow sector
                    msat = le::u32_at(sector, per_sector * 4)
                        .ok_or(OleError::InvalidSector { class, id: msat })?;
                    remaining -= per_sector;
                }
            }
        };
        if id >= self.large_count {
            return Err(OleError::InvalidSector { class, id });
        }
        Ok(id)
    }

    /// Opens the mini stream and the small sector allocation table
    ///
    /// Does nothing if they are already open
    pub fn open_small_storage(&self) -> Result<(), OleError> {
        if self.small.borrow().is_some() {
            return Ok(());
        }
        let root = self.root_entry()?;
        let large = SectorClass::Large;
        if !self.is_valid(large, self.header.ssat_start) || !self.is_valid(large, root.start) {
            return Err(OleError::EmptySmallStorage);
        }
        let ssat_entries = u64::from(self.header.ssat_sectors) << (self.header.large_shift - 2);
        let container_sectors = u64::from(root.size) >> self.header.small_shift;
        let count = ssat_entries.min(container_sectors).min(u64::from(MAXREGSID)) as u32; // Safe: capped above
        debug!("Small storage: {} sectors", count);
        *self.small.borrow_mut() = Some(SmallStorage {
            container: StreamCursor::new(large, root.start),
            ssat: StreamCursor::new(large, self.header.ssat_start),
            count,
        });
        Ok(())
    }
}
