//! On demand materialization of a stream as one contiguous byte range

use crate::{Ole, OleError, SectorClass, StreamCursor};
use fixedbitset::FixedBitSet;
use tracing::{debug, warn};

/// Granularity of the on demand fill
pub const PAGE_SIZE: usize = 4096;

/// A randomly addressable, bounded range of bytes
///
/// Implemented by plain slices and by [`LazyStream`], which fills itself on first touch
pub trait ByteRange {
    /// The total length of the range
    fn len(&self) -> usize;

    /// Returns true if the range holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `len` bytes starting at `offset`
    ///
    /// Fails with [`OleError::StreamExhausted`] if the bytes lie (even partially) past the end
    fn range(&mut self, offset: usize, len: usize) -> Result<&[u8], OleError>;
}

impl ByteRange for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn range(&mut self, offset: usize, len: usize) -> Result<&[u8], OleError> {
        offset
            .checked_add(len)
            .and_then(|end| self.get(offset..end))
            .ok_or(OleError::StreamExhausted {
                offset: offset as u64,
            })
    }
}

/// A stream presented as a single buffer, filled page by page as it gets touched
///
/// The buffer is allocated once for the whole (clamped) stream length, so its address
/// never changes for the life of the stream. Each [`PAGE_SIZE`] page is pulled through a
/// [`StreamCursor`] the first time any byte in it is requested
pub struct LazyStream<'o, D: AsRef<[u8]>> {
    ole: &'o Ole<D>,
    cursor: StreamCursor,
    buf: Vec<u8>,
    filled: FixedBitSet,
    /// Where the chain was found to end, if short of the declared length
    chain_end: Option<usize>,
}

impl<'o, D: AsRef<[u8]>> LazyStream<'o, D> {
    /// Wraps the chain starting at `start`, declared to be `len` bytes long
    ///
    /// The length is clamped to the capacity of the sector class
    pub fn new(ole: &'o Ole<D>, class: SectorClass, start: u32, len: usize) -> Self {
        let capacity = ole.sector_count(class) as usize * ole.sector_size(class);
        let len = if len > capacity {
            warn!(
                "Stream length {} exceeds the {} bytes the {} sectors can hold",
                len, capacity, class
            );
            capacity
        } else {
            len
        };
        debug!("Lazy {} stream at sector {}, {} bytes", class, start, len);
        Self {
            ole,
            cursor: StreamCursor::new(class, start),
            buf: vec![0u8; len],
            filled: FixedBitSet::with_capacity(len.div_ceil(PAGE_SIZE)),
            chain_end: None,
        }
    }

    /// The offset where the chain ended, if it ended before the declared length
    pub fn chain_end(&self) -> Option<usize> {
        self.chain_end
    }

    /// The number of pages materialized so far
    pub fn resident_pages(&self) -> usize {
        self.filled.count_ones(..)
    }

    fn fill_page(&mut self, page: usize) -> Result<(), OleError> {
        let ole = self.ole;
        let start = page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(self.buf.len());
        let mut offset = start;
        while offset < end {
            let local = match self.cursor.seek(ole, offset as u64) {
                Ok(local) => local,
                Err(OleError::StreamExhausted { .. }) => {
                    warn!("Stream chain ends at offset {} of {}", offset, self.buf.len());
                    self.chain_end = Some(self.chain_end.map_or(offset, |e| e.min(offset)));
                    break;
                }
                Err(e) => return Err(e),
            };
            let sector = self.cursor.bytes(ole)?;
            let avail = &sector[local..];
            let n = avail.len().min(end - offset);
            self.buf[offset..offset + n].copy_from_slice(&avail[..n]);
            offset += n;
        }
        self.filled.insert(page);
        Ok(())
    }
}

impl<D: AsRef<[u8]>> ByteRange for LazyStream<'_, D> {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn range(&mut self, offset: usize, len: usize) -> Result<&[u8], OleError> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(OleError::StreamExhausted {
                offset: offset as u64,
            })?;
        if len > 0 {
            for page in offset / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
                if !self.filled.contains(page) {
                    self.fill_page(page)?;
                }
            }
        }
        if let Some(chain_end) = self.chain_end.filter(|&e| end > e) {
            return Err(OleError::StreamExhausted {
                offset: chain_end as u64,
            });
        }
        Ok(&self.buf[offset..end])
    }
}
