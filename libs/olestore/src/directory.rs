//! Directory lookup

use crate::{le, LazyStream, Ole, OleError, SectorClass, ENDOFCHAIN, FREESECT};
use tracing::{debug, warn};

/// Size of a directory entry
pub const DIR_ENTRY_SIZE: usize = 128;

const TYPE_STREAM: u8 = 2;

/// The fields of a directory entry needed to reach its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Object type (1 storage, 2 stream, 5 root)
    pub objtype: u8,
    /// First sector of the stream
    pub start: u32,
    /// Stream size in bytes
    pub size: u32,
}

impl DirEntry {
    fn parse(buf: &[u8]) -> Option<Self> {
        let name_len = usize::from(le::u16_at(buf, 0x40)?).min(64);
        let units: Vec<u16> = (0..name_len / 2)
            .filter_map(|i| le::u16_at(buf, i * 2))
            .take_while(|&c| c != 0)
            .collect();
        Some(Self {
            name: String::from_utf16_lossy(&units),
            objtype: *buf.get(0x42)?,
            start: le::u32_at(buf, 0x74)?,
            size: le::u32_at(buf, 0x78)?,
        })
    }

    /// Checks whether this is a stream entry named exactly `name`
    fn is_stream_named(buf: &[u8], name: &str) -> bool {
        let units: Vec<u16> = name.encode_utf16().collect();
        if buf.get(0x42) != Some(&TYPE_STREAM)
            || le::u16_at(buf, 0x40) != Some(((units.len() + 1) * 2) as u16)
        {
            return false;
        }
        units
            .iter()
            .enumerate()
            .all(|(i, &c)| le::u16_at(buf, i * 2) == Some(c))
    }
}

impl<D: AsRef<[u8]>> Ole<D> {
    /// Returns the root entry (the first entry of the directory)
    pub fn root_entry(&self) -> Result<DirEntry, OleError> {
        let root = self.header().root;
        let sector = self.sector(SectorClass::Large, root)?;
        DirEntry::parse(sector).ok_or(OleError::NoRoot)
    }

    /// Scans the directory for a stream named `name`
    ///
    /// The directory chain is walked until it ends or turns invalid; a chain longer than
    /// the container fails with [`OleError::ChainTooLong`]
    pub fn find_stream(&self, name: &str) -> Result<Option<DirEntry>, OleError> {
        let class = SectorClass::Large;
        let mut sector_id = self.header().root;
        let mut walked = 0u32;
        loop {
            let sector = self.sector(class, sector_id)?;
            if let Some(entry) = sector
                .chunks_exact(DIR_ENTRY_SIZE)
                .find(|e| DirEntry::is_stream_named(e, name))
            {
                let entry = DirEntry::parse(entry);
                debug!("Found directory entry {:?}", entry);
                return Ok(entry);
            }
            walked += 1;
            if walked >= self.sector_count(class) {
                return Err(OleError::ChainTooLong);
            }
            sector_id = match self.next_sector(class, sector_id)? {
                ENDOFCHAIN | FREESECT => return Ok(None),
                next if !self.is_valid(class, next) => {
                    warn!("Directory chain ends with sector 0x{:x}", next);
                    return Ok(None);
                }
                next => next,
            };
        }
    }

    /// Locates the workbook stream, named `Workbook` or, in older files, `Book`
    pub fn workbook_entry(&self) -> Result<DirEntry, OleError> {
        match self.find_stream("Workbook")? {
            Some(entry) => Ok(entry),
            None => self.find_stream("Book")?.ok_or(OleError::NoWorkbookStream),
        }
    }

    /// Tells which sector universe holds the stream of `entry`
    pub fn stream_class(&self, entry: &DirEntry) -> SectorClass {
        if entry.size < self.header().mini_cutoff {
            SectorClass::Small
        } else {
            SectorClass::Large
        }
    }

    /// Opens the stream of `entry` as a [`LazyStream`]
    pub fn open_stream(&self, entry: &DirEntry) -> Result<LazyStream<'_, D>, OleError> {
        let class = self.stream_class(entry);
        if class == SectorClass::Small {
            self.open_small_storage()?;
        }
        if !self.is_valid(class, entry.start) {
            return Err(OleError::EmptyStream);
        }
        Ok(LazyStream::new(self, class, entry.start, entry.size as usize))
    }

    /// Opens the workbook stream
    pub fn open_workbook(&self) -> Result<LazyStream<'_, D>, OleError> {
        let entry = self.workbook_entry()?;
        self.open_stream(&entry)
    }
}
