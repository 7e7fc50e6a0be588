//! Forward biased cursor over a sector chain

use crate::{Ole, OleError, SectorClass, ENDOFCHAIN, FREESECT};
use fixedbitset::FixedBitSet;

/// Maps stream offsets to sectors of a chain
///
/// The cursor caches the sector it last resolved together with the stream offset of its
/// first byte. Seeking inside the cached sector is free, seeking forward walks the chain
/// from the cached sector and seeking backwards restarts the walk from the stream start.
/// Sectors met since the last restart are remembered so a chain looping back onto itself
/// is caught the first time it revisits a sector
#[derive(Debug, Clone)]
pub struct StreamCursor {
    class: SectorClass,
    start: u32,
    sector: u32,
    pos: u64,
    visited: FixedBitSet,
}

impl StreamCursor {
    /// Creates a cursor positioned on the first sector of the chain starting at `start`
    pub fn new(class: SectorClass, start: u32) -> Self {
        Self {
            class,
            start,
            sector: start,
            pos: 0,
            visited: FixedBitSet::new(),
        }
    }

    /// The sector class of the stream
    pub fn class(&self) -> SectorClass {
        self.class
    }

    /// The first sector of the stream
    pub fn start(&self) -> u32 {
        self.start
    }

    /// The currently cached sector id
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// The stream offset of the first byte of the cached sector
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Moves to the sector covering `offset` and returns the offset within that sector
    ///
    /// # Errors
    /// * [`OleError::StreamExhausted`] if the chain ends before `offset`
    /// * [`OleError::InvalidSector`] if the chain links to a non existent sector
    /// * [`OleError::ChainTooLong`] if `offset` lies beyond what the container can hold
    ///   or if the chain loops
    pub fn seek<D: AsRef<[u8]>>(&mut self, ole: &Ole<D>, offset: u64) -> Result<usize, OleError> {
        let size = ole.sector_size(self.class) as u64;
        if offset >= self.pos && offset - self.pos < size {
            return Ok((offset - self.pos) as usize);
        }
        let target = offset / size;
        if target >= u64::from(ole.sector_count(self.class)) {
            return Err(OleError::ChainTooLong);
        }
        let count = ole.sector_count(self.class) as usize;
        if self.visited.len() < count {
            self.visited.grow(count);
        }
        let (sector, index) = if offset < self.pos || self.visited.is_clear() {
            self.visited.clear();
            if (self.start as usize) < count {
                self.visited.insert(self.start as usize);
            }
            (self.start, 0)
        } else {
            (self.sector, self.pos / size)
        };
        match self.walk(ole, sector, target - index, offset) {
            Ok(sector) => {
                self.sector = sector;
                self.pos = target * size;
                Ok((offset - self.pos) as usize)
            }
            Err(e) => {
                // Forget the partial walk, the next seek restarts from the top
                self.visited.clear();
                self.sector = self.start;
                self.pos = 0;
                Err(e)
            }
        }
    }

    fn walk<D: AsRef<[u8]>>(
        &mut self,
        ole: &Ole<D>,
        mut sector: u32,
        steps: u64,
        offset: u64,
    ) -> Result<u32, OleError> {
        for _ in 0..steps {
            sector = match ole.next_sector(self.class, sector)? {
                ENDOFCHAIN | FREESECT => return Err(OleError::StreamExhausted { offset }),
                next if !ole.is_valid(self.class, next) => {
                    return Err(OleError::InvalidSector {
                        class: self.class,
                        id: next,
                    })
                }
                next if self.visited.put(next as usize) => return Err(OleError::ChainTooLong),
                next => next,
            };
        }
        Ok(sector)
    }

    /// Returns the bytes of the cached sector
    pub fn bytes<'o, D: AsRef<[u8]>>(&self, ole: &'o Ole<D>) -> Result<&'o [u8], OleError> {
        ole.sector(self.class, self.sector)
    }
}
