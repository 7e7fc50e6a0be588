//! *BIFF record* framing and decoding
//!
//! A record is a 4 byte header (type and payload length, both little endian `u16`)
//! followed by the payload. The cursor here walks records over any [`ByteRange`] and
//! decodes the handful of record types the converter cares about into owned values.

use crate::{format::XfEntry, ExcelError};
use num_enum::FromPrimitive;
use olestore::{le, ByteRange};
use std::io::{self, Write};
use textconv::TextWriter;
use tracing::trace;

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = 4;

/// BIFF variant, as detected from the leading BOF record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BiffVersion {
    /// Excel 3.0
    Biff3,
    /// Excel 4.0
    Biff4,
    /// Excel 5.0 and 95
    Biff5,
    /// Excel 97 and later
    Biff8,
}

impl BiffVersion {
    /// Detects the variant from the first bytes of the workbook stream
    ///
    /// The stream must open with a BOF record; its type high byte selects the family and,
    /// for the `0x0809` family, the high byte of the version field selects the variant
    pub fn detect(head: &[u8]) -> Result<Self, ExcelError> {
        if head.len() < 6 {
            return Err(ExcelError::Truncated);
        }
        if head[0] != 0x09 {
            return Err(ExcelError::FormatNotRecognized);
        }
        match head[1] {
            0 => Err(ExcelError::UnsupportedVariant("BIFF2")),
            2 => Ok(Self::Biff3),
            4 => Ok(Self::Biff4),
            8 => match head[5] {
                0 | 5 => Ok(Self::Biff5),
                2 => Err(ExcelError::UnsupportedVariant("BIFF2")),
                3 => Ok(Self::Biff3),
                4 => Ok(Self::Biff4),
                6 => Ok(Self::Biff8),
                _ => Err(ExcelError::UnsupportedVariant("Format")),
            },
            _ => Err(ExcelError::UnsupportedVariant("Format")),
        }
    }
}

/// Type of BIFF record
///
/// Only the records the converter acts upon are named, the variants of the same record
/// across BIFF versions map to a single type
#[allow(clippy::upper_case_acronyms)]
#[repr(u16)]
#[derive(Debug, FromPrimitive, PartialEq, Eq, Clone, Copy)]
pub enum RecordType {
    /// Beginning of a substream
    #[num_enum(alternatives = [0x0009, 0x0209, 0x0409])]
    BOF = 0x0809,
    /// End of a substream
    EOF = 0x000a,
    /// Workbook code page
    CodePage = 0x0042,
    /// Date system selector
    Date1904 = 0x0022,
    /// Shared string table
    SST = 0x00fc,
    /// Payload overflow of the previous record
    Continue = 0x003c,
    /// Number format definition
    #[num_enum(alternatives = [0x001e])]
    Format = 0x041e,
    /// Cell style
    #[num_enum(alternatives = [0x0043, 0x0243, 0x0443])]
    XF = 0x00e0,
    /// Sheet information in the workbook globals
    BoundSheet = 0x0085,
    /// Location of the first sheet of a BIFF4 workbook
    SheetOffset = 0x008e,
    /// Sheet header of a BIFF4 workbook
    SheetHdr = 0x008f,
    /// Inline string cell
    #[num_enum(alternatives = [0x0004])]
    Label = 0x0204,
    /// Rich text inline string cell
    RString = 0x00d6,
    /// Shared string cell
    LabelSst = 0x00fd,
    /// Floating point cell
    #[num_enum(alternatives = [0x0003])]
    Number = 0x0203,
    /// Compressed number cell
    #[num_enum(alternatives = [0x007e])]
    RK = 0x027e,
    /// Run of compressed number cells
    MulRk = 0x00bd,
    /// Formula cell with its cached result
    #[num_enum(alternatives = [0x0006, 0x0406])]
    Formula = 0x0206,
    /// String result of the preceding formula
    #[num_enum(alternatives = [0x0007])]
    String = 0x0207,
    /// Boolean or error cell
    #[num_enum(alternatives = [0x0005])]
    BoolErr = 0x0205,
    /// Anything else
    #[num_enum(default)]
    Unsupported = 0xffff,
}

impl RecordType {
    /// Maps a raw record type
    pub fn new(value: u16) -> Self {
        let result = RecordType::from_primitive(value);
        if result == RecordType::Unsupported {
            trace!("Skipping record type: 0x{value:04X}");
        }
        result
    }
}

/// Location and type of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Stream offset of the record header
    pub offset: usize,
    /// Raw record type
    pub code: u16,
    /// Mapped record type
    pub ty: RecordType,
    /// Payload length
    pub len: usize,
}

impl RecordHeader {
    /// Stream offset of the payload
    pub fn payload(&self) -> usize {
        self.offset + RECORD_HEADER_SIZE
    }

    /// Stream offset right past the record
    pub fn end(&self) -> usize {
        self.payload() + self.len
    }
}

/// Sequential reader of records
pub struct RecordCursor<'s, S: ByteRange> {
    src: &'s mut S,
    offset: usize,
}

impl<'s, S: ByteRange> RecordCursor<'s, S> {
    /// Creates a cursor reading records from `offset`
    pub fn new(src: &'s mut S, offset: usize) -> Self {
        Self { src, offset }
    }

    /// The offset of the next record
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Moves to the record starting at `offset`
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Gives access to the underlying stream
    pub fn source(&mut self) -> &mut S {
        &mut *self.src
    }

    /// Reads the header of the next record and moves past the record
    ///
    /// Returns `None` when the stream ends exactly at a record boundary
    ///
    /// # Errors
    /// [`ExcelError::Truncated`] if the header or the payload runs past the stream end
    pub fn next_header(&mut self) -> Result<Option<RecordHeader>, ExcelError> {
        let header = match read_header(self.src, self.offset)? {
            Some(h) => h,
            None => return Ok(None),
        };
        self.offset = header.end();
        Ok(Some(header))
    }

    /// Reads the payload of a record
    pub fn payload(&mut self, header: &RecordHeader) -> Result<&[u8], ExcelError> {
        Ok(self.src.range(header.payload(), header.len)?)
    }

    /// Reads and decodes the next record
    ///
    /// Running out of records is an error here: every substream is terminated by EOF
    pub fn next_record(
        &mut self,
        version: BiffVersion,
    ) -> Result<(RecordHeader, Record), ExcelError> {
        let header = self.next_header()?.ok_or(ExcelError::Truncated)?;
        let record = match header.ty {
            RecordType::Unsupported | RecordType::SST | RecordType::Continue => {
                Record::Other(header.ty)
            }
            _ => Record::decode(header.ty, self.payload(&header)?, version)?,
        };
        Ok((header, record))
    }

    /// Skips a nested substream whose BOF was just consumed
    ///
    /// Nested BOF/EOF pairs are balanced, the cursor is left right past the matching EOF
    pub fn skip_substream(&mut self) -> Result<(), ExcelError> {
        let mut depth = 1usize;
        loop {
            let header = self.next_header()?.ok_or(ExcelError::Truncated)?;
            match header.ty {
                RecordType::BOF => depth += 1,
                RecordType::EOF => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }
}

/// Reads the record header at `offset` of `src`
pub(crate) fn read_header<S: ByteRange>(
    src: &mut S,
    offset: usize,
) -> Result<Option<RecordHeader>, ExcelError> {
    let total = src.len();
    if offset == total {
        return Ok(None);
    }
    if offset > total || total - offset < RECORD_HEADER_SIZE {
        return Err(ExcelError::Truncated);
    }
    let head = src.range(offset, RECORD_HEADER_SIZE)?;
    let code = u16::from_le_bytes([head[0], head[1]]);
    let len = usize::from(u16::from_le_bytes([head[2], head[3]]));
    if len > total - offset - RECORD_HEADER_SIZE {
        return Err(ExcelError::Truncated);
    }
    Ok(Some(RecordHeader {
        offset,
        code,
        ty: RecordType::new(code),
        len,
    }))
}

/// Text as stored in a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XlString {
    /// Bytes in the workbook code page (BIFF5 and earlier)
    CodePage(Vec<u8>),
    /// Compressed Unicode, one byte per character
    Compressed(Vec<u8>),
    /// UTF-16LE code units
    Wide(Vec<u8>),
}

impl XlString {
    /// Parses a string with an explicit character count
    ///
    /// In BIFF8 the characters are preceded by an option byte and, depending on its bits,
    /// by a rich text run count and an extension size; the trailing rich text and
    /// extension blocks are not part of the text
    pub fn parse(version: BiffVersion, chars: usize, data: &[u8]) -> Result<Self, ExcelError> {
        if version < BiffVersion::Biff8 {
            return data
                .get(..chars)
                .map(|b| Self::CodePage(b.to_vec()))
                .ok_or_else(|| ExcelError::bad_format("String too short"));
        }
        let flags = *data
            .first()
            .ok_or_else(|| ExcelError::bad_format("String too short"))?;
        let mut start = 1;
        if flags & 8 != 0 {
            start += 2;
        }
        if flags & 4 != 0 {
            start += 4;
        }
        let wide = flags & 1 != 0;
        let bytes = data
            .get(start..)
            .and_then(|d| d.get(..chars << usize::from(wide)))
            .ok_or_else(|| ExcelError::bad_format("String too short"))?
            .to_vec();
        Ok(if wide {
            Self::Wide(bytes)
        } else {
            Self::Compressed(bytes)
        })
    }

    /// Parses a string prefixed by an 8 bit character count
    pub fn parse_short(version: BiffVersion, data: &[u8]) -> Result<Self, ExcelError> {
        let chars = *data
            .first()
            .ok_or_else(|| ExcelError::bad_format("String too short"))?;
        Self::parse(version, usize::from(chars), &data[1..])
    }

    /// Emits the text
    pub fn write_to<W: Write>(&self, out: &mut TextWriter<W>) -> io::Result<()> {
        match self {
            Self::CodePage(b) => out.write_codepage(b),
            Self::Compressed(b) => out.write_latin1(b),
            Self::Wide(b) => {
                out.write_utf16le(b)?;
                out.finish_text()
            }
        }
    }
}

/// Position and style of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// Zero based row
    pub row: u16,
    /// Zero based column
    pub col: u16,
    /// Cell style (XF) index
    pub xf: u16,
}

impl Cell {
    fn parse(p: &[u8]) -> Self {
        Self {
            row: u16::from_le_bytes([p[0], p[1]]),
            col: u16::from_le_bytes([p[2], p[3]]),
            xf: u16::from_le_bytes([p[4], p[5]]),
        }
    }
}

/// Cached result of a formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FormulaValue {
    /// A number
    Number(f64),
    /// A string, carried by the following STRING record
    String,
    /// A boolean
    Bool(bool),
    /// An error code
    Error(u8),
    /// An empty string
    Empty,
}

/// A decoded record
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Bof {
        /// Substream type
        kind: u16,
    },
    Eof,
    CodePage(u16),
    Date1904(bool),
    Format {
        /// Format index (appended when absent)
        index: Option<u16>,
        /// Format pattern code units
        code: Vec<u16>,
    },
    Xf(Option<XfEntry>),
    BoundSheet {
        /// Stream offset of the sheet BOF
        offset: u32,
        visible: bool,
        kind: u8,
        name: XlString,
    },
    SheetOffset(u32),
    SheetHdr {
        /// Size of the sheet substream which follows
        size: u32,
        name: XlString,
    },
    Label {
        cell: Cell,
        text: XlString,
    },
    LabelSst {
        cell: Cell,
        index: u32,
    },
    Number {
        cell: Cell,
        value: f64,
    },
    Rk {
        cell: Cell,
        rk: u32,
    },
    MulRk {
        row: u16,
        first_col: u16,
        /// Style and value pairs of consecutive cells
        cells: Vec<(u16, u32)>,
    },
    Formula {
        cell: Cell,
        value: FormulaValue,
    },
    String(XlString),
    BoolErr {
        cell: Cell,
        value: u8,
        is_error: bool,
    },
    /// Records which are not decoded
    Other(RecordType),
}

fn need(p: &[u8], len: usize) -> Result<(), ExcelError> {
    if p.len() < len {
        Err(ExcelError::bad_format("Record too short"))
    } else {
        Ok(())
    }
}

fn u16_at(p: &[u8], offset: usize) -> u16 {
    le::u16_at(p, offset).unwrap_or_default()
}

fn u32_at(p: &[u8], offset: usize) -> u32 {
    le::u32_at(p, offset).unwrap_or_default()
}

impl Record {
    /// Decodes the payload of a record of type `ty`
    ///
    /// # Errors
    /// [`ExcelError::BadFormat`] when the payload is too short for its fields
    pub fn decode(ty: RecordType, p: &[u8], version: BiffVersion) -> Result<Self, ExcelError> {
        let record = match ty {
            RecordType::BOF => {
                need(p, 4)?;
                Self::Bof {
                    kind: u16_at(p, 2),
                }
            }
            RecordType::EOF => Self::Eof,
            RecordType::CodePage => {
                need(p, 2)?;
                Self::CodePage(u16_at(p, 0))
            }
            RecordType::Date1904 => {
                need(p, 1)?;
                Self::Date1904(p[0] != 0)
            }
            RecordType::Format => Self::decode_format(p, version)?,
            RecordType::XF => Self::Xf(XfEntry::decode(version, p)),
            RecordType::BoundSheet => {
                if version < BiffVersion::Biff5 {
                    Self::BoundSheet {
                        offset: 0,
                        visible: true,
                        kind: 0,
                        name: XlString::parse_short(version, p)?,
                    }
                } else {
                    need(p, 7)?;
                    Self::BoundSheet {
                        offset: u32_at(p, 0),
                        visible: p[4] == 0,
                        kind: p[5],
                        name: XlString::parse_short(version, &p[6..])?,
                    }
                }
            }
            RecordType::SheetOffset => {
                need(p, 4)?;
                Self::SheetOffset(u32_at(p, 0))
            }
            RecordType::SheetHdr => {
                need(p, 5)?;
                Self::SheetHdr {
                    size: u32_at(p, 0),
                    name: XlString::parse_short(version, &p[4..])?,
                }
            }
            RecordType::Label | RecordType::RString => {
                need(p, 8)?;
                Self::Label {
                    cell: Cell::parse(p),
                    text: XlString::parse(version, usize::from(u16_at(p, 6)), &p[8..])?,
                }
            }
            RecordType::LabelSst => {
                need(p, 8)?;
                Self::LabelSst {
                    cell: Cell::parse(p),
                    index: le::u32_at(p, 6).unwrap_or_else(|| u32::from(u16_at(p, 6))),
                }
            }
            RecordType::Number => {
                need(p, 14)?;
                Self::Number {
                    cell: Cell::parse(p),
                    value: f64::from_le_bytes(p[6..14].try_into().unwrap_or_default()),
                }
            }
            RecordType::RK => {
                need(p, 10)?;
                Self::Rk {
                    cell: Cell::parse(p),
                    rk: u32_at(p, 6),
                }
            }
            RecordType::MulRk => {
                need(p, 12)?;
                let cells = p[4..p.len() - 2]
                    .chunks_exact(6)
                    .map(|c| (u16_at(c, 0), u32_at(c, 2)))
                    .collect();
                Self::MulRk {
                    row: u16_at(p, 0),
                    first_col: u16_at(p, 2),
                    cells,
                }
            }
            RecordType::Formula => {
                need(p, 14)?;
                let value = if u16_at(p, 12) == 0xffff {
                    match p[6] {
                        0 => FormulaValue::String,
                        1 => FormulaValue::Bool(p[8] != 0),
                        2 => FormulaValue::Error(p[8]),
                        _ => FormulaValue::Empty,
                    }
                } else {
                    FormulaValue::Number(f64::from_le_bytes(
                        p[6..14].try_into().unwrap_or_default(),
                    ))
                };
                Self::Formula {
                    cell: Cell::parse(p),
                    value,
                }
            }
            RecordType::String => {
                need(p, 2)?;
                Self::String(XlString::parse(
                    version,
                    usize::from(u16_at(p, 0)),
                    &p[2..],
                )?)
            }
            RecordType::BoolErr => {
                need(p, 8)?;
                Self::BoolErr {
                    cell: Cell::parse(p),
                    value: p[6],
                    is_error: p[7] != 0,
                }
            }
            RecordType::SST | RecordType::Continue | RecordType::Unsupported => Self::Other(ty),
        };
        Ok(record)
    }

    fn decode_format(p: &[u8], version: BiffVersion) -> Result<Self, ExcelError> {
        let (index, chars, start, wide) = match version {
            BiffVersion::Biff3 => {
                need(p, 1)?;
                (None, usize::from(p[0]), 1, false)
            }
            BiffVersion::Biff4 => {
                need(p, 3)?;
                (None, usize::from(p[2]), 3, false)
            }
            BiffVersion::Biff5 => {
                need(p, 3)?;
                (Some(u16_at(p, 0)), usize::from(p[2]), 3, false)
            }
            BiffVersion::Biff8 => {
                need(p, 5)?;
                (Some(u16_at(p, 0)), usize::from(u16_at(p, 2)), 5, p[4] & 1 != 0)
            }
        };
        if chars > MAX_FORMAT_LEN {
            trace!("Ignoring format of {chars} characters");
            return Ok(Self::Other(RecordType::Format));
        }
        let body = &p[start..];
        let code = if wide {
            body.chunks_exact(2)
                .take(chars)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect()
        } else {
            body.iter().take(chars).map(|&b| u16::from(b)).collect()
        };
        Ok(Self::Format { index, code })
    }
}

/// Longest format pattern considered
const MAX_FORMAT_LEN: usize = 128;

/// Decodes an RK compressed number
///
/// Bit 1 selects a 30 bit signed integer over the upper 30 bits of an IEEE double, bit 0
/// scales the result down by 100
pub fn decode_rk(rk: u32) -> f64 {
    let v = if rk & 2 != 0 {
        f64::from((rk as i32) >> 2)
    } else {
        f64::from_bits(u64::from(rk & !3) << 32)
    };
    if rk & 1 != 0 {
        v / 100.0
    } else {
        v
    }
}
