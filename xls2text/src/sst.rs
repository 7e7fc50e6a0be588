//! Shared string table
//!
//! The SST record lists the workbook strings referenced by index from LABELSST cells.
//! A string may overflow into one or more CONTINUE records; when the character data is
//! split, each continuation opens with a fresh option byte telling whether the remaining
//! characters are compressed or UTF-16. Trailing rich text runs and phonetic blocks can
//! themselves span continuations but carry no option byte.
//!
//! Only the location of each string is recorded when the table is built; the text is
//! decoded on demand.

use crate::{
    records::{read_header, RecordHeader, RecordType},
    ExcelError,
};
use olestore::ByteRange;
use std::io::Write;
use textconv::TextWriter;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Stream offset of the string header
    pos: usize,
    /// End of the record holding the header
    record_end: usize,
}

/// Index of the strings of an SST record
#[derive(Debug, Default)]
pub struct SharedStringTable {
    entries: Vec<Entry>,
}

fn read_u8<S: ByteRange>(src: &mut S, offset: usize) -> Result<u8, ExcelError> {
    Ok(src.range(offset, 1)?[0])
}

fn read_u16<S: ByteRange>(src: &mut S, offset: usize) -> Result<u16, ExcelError> {
    let b = src.range(offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32<S: ByteRange>(src: &mut S, offset: usize) -> Result<u32, ExcelError> {
    let b = src.range(offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Enters the CONTINUE record at `offset`, returning its payload start and end
fn enter_continue<S: ByteRange>(src: &mut S, offset: usize) -> Result<(usize, usize), ExcelError> {
    match read_header(src, offset)? {
        Some(h) if h.ty == RecordType::Continue => Ok((h.payload(), h.end())),
        _ => Err(ExcelError::bad_format("String truncated")),
    }
}

/// Reads a string header: character count, option byte and the size of the trailing
/// rich text and phonetic data
fn string_header<S: ByteRange>(
    src: &mut S,
    pos: usize,
) -> Result<(usize, u8, usize, usize), ExcelError> {
    let chars = usize::from(read_u16(src, pos)?);
    let flags = read_u8(src, pos + 2)?;
    let mut p = pos + 3;
    let mut extra = 0usize;
    if flags & 8 != 0 {
        extra += 4 * usize::from(read_u16(src, p)?);
        p += 2;
    }
    if flags & 4 != 0 {
        extra += read_u32(src, p)? as usize;
        p += 4;
    }
    Ok((chars, flags, p, extra))
}

impl SharedStringTable {
    /// Indexes the strings of the SST record `header`
    ///
    /// Returns the table and the offset where record scanning resumes, that is past the
    /// last CONTINUE record consumed
    pub fn build<S: ByteRange>(
        src: &mut S,
        header: &RecordHeader,
    ) -> Result<(Self, usize), ExcelError> {
        let mut p = header.payload();
        let mut re = header.end();
        if header.len < 8 {
            return Err(ExcelError::bad_format("Record too short"));
        }
        let count = read_u32(src, p + 4)? as usize;
        if count == 0 {
            return Ok((Self::default(), re));
        }
        p += 8;
        // Each string takes at least 3 bytes
        let mut entries = Vec::with_capacity(count.min(src.len() / 3));
        loop {
            if re < p || re - p < 3 {
                return Err(ExcelError::bad_format("String table truncated"));
            }
            entries.push(Entry { pos: p, record_end: re });
            if entries.len() == count {
                break;
            }
            let (mut chars, mut flags, start, mut extra) = string_header(src, p)?;
            p = start;
            loop {
                if p > re {
                    return Err(ExcelError::bad_format("String table truncated"));
                }
                let avail = re - p;
                let wide = usize::from(flags & 1);
                if avail >= chars << wide {
                    p += chars << wide;
                    break;
                }
                if avail & wide != 0 {
                    return Err(ExcelError::bad_format("String cut at the middle of a char"));
                }
                chars -= avail >> wide;
                let (payload, end) = enter_continue(src, re)?;
                flags = read_u8(src, payload)?;
                p = payload + 1;
                re = end;
            }
            loop {
                let avail = re - p;
                if avail > extra {
                    p += extra;
                    break;
                }
                extra -= avail;
                (p, re) = enter_continue(src, re)?;
            }
        }
        debug!("Shared string table: {} strings", entries.len());
        Ok((Self { entries }, re))
    }

    /// The number of strings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks the character runs of string `index`
    ///
    /// `emit` receives each run and whether it is UTF-16; returns false if the index is
    /// out of range
    fn walk<S: ByteRange, F>(
        &self,
        src: &mut S,
        index: usize,
        mut emit: F,
    ) -> Result<bool, ExcelError>
    where
        F: FnMut(&[u8], bool) -> Result<(), ExcelError>,
    {
        let entry = match self.entries.get(index) {
            Some(e) => *e,
            None => return Ok(false),
        };
        let (mut chars, mut flags, mut p, _) = string_header(src, entry.pos)?;
        let mut re = entry.record_end;
        loop {
            if p > re {
                return Err(ExcelError::bad_format("String truncated"));
            }
            let avail = re - p;
            let wide = usize::from(flags & 1);
            if chars <= avail >> wide {
                break;
            }
            let (payload, end) = enter_continue(src, re)?;
            chars -= avail >> wide;
            if avail & wide != 0 {
                return Err(ExcelError::bad_format("String cut at the middle of a char"));
            }
            emit(src.range(p, avail)?, wide != 0)?;
            flags = read_u8(src, payload)?;
            p = payload + 1;
            re = end;
        }
        let wide = flags & 1 != 0;
        emit(src.range(p, chars << usize::from(wide))?, wide)?;
        Ok(true)
    }

    /// Emits string `index`
    ///
    /// An index outside of the table is logged and emits nothing
    pub fn write<S: ByteRange, W: Write>(
        &self,
        src: &mut S,
        index: u32,
        out: &mut TextWriter<W>,
    ) -> Result<(), ExcelError> {
        let found = self.walk(src, index as usize, |run, wide| {
            if wide {
                out.write_utf16le(run)?;
            } else {
                out.write_latin1(run)?;
            }
            Ok(())
        })?;
        out.finish_text()?;
        if !found {
            warn!("Wrong string index {} -- ignored", index);
        }
        Ok(())
    }

    /// Returns string `index` as text, `None` if the index is out of range
    pub fn get<S: ByteRange>(
        &self,
        src: &mut S,
        index: u32,
    ) -> Result<Option<String>, ExcelError> {
        let mut units: Vec<u16> = Vec::new();
        let found = self.walk(src, index as usize, |run, wide| {
            if wide {
                units.extend(run.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])));
            } else {
                units.extend(run.iter().map(|&b| u16::from(b)));
            }
            Ok(())
        })?;
        Ok(found.then(|| String::from_utf16_lossy(&units)))
    }
}
