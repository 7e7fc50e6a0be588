//! Sheet rendering
//!
//! The cells of a sheet are emitted as a tab separated grid: one line per row and one
//! tab between adjacent columns, empty cells included, clipped to the requested
//! [`Viewport`].

use crate::{
    format::format_value,
    records::{decode_rk, BiffVersion, FormulaValue, Record, RecordCursor, XlString},
    workbook::Globals,
    ExcelError, RenderOptions,
};
use olestore::ByteRange;
use std::{
    io::{self, Write},
    str::FromStr,
};
use textconv::TextWriter;
use tracing::debug;

/// Highest row or column index
const MAX_INDEX: u32 = 0xffff;

/// A rectangle of cells, inclusive on all sides
///
/// Parsed from spreadsheet coordinates: `A1:C5`, `D2:E` (rows from 2 down to the end of
/// the sheet), `B3` (everything from B3 to the bottom right)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    /// First row
    pub top: u16,
    /// First column
    pub left: u16,
    /// Last row, unbounded if `None`
    pub bottom: Option<u16>,
    /// Last column, unbounded if `None`
    pub right: Option<u16>,
}

fn clamp(v: u32) -> u16 {
    v.min(MAX_INDEX) as u16
}

/// Parses an optional column name and an optional row number
fn parse_cell(s: &[u8]) -> (usize, Option<u16>, Option<u16>) {
    let mut i = 0;
    let mut col = None;
    let mut row = None;
    if s.first().is_some_and(u8::is_ascii_uppercase) {
        let mut v = 0u32;
        while let Some(c) = s.get(i).filter(|c| c.is_ascii_uppercase()) {
            v = v.saturating_mul(26).saturating_add(u32::from(c - b'A') + 1);
            i += 1;
        }
        col = Some(clamp(v - 1));
    }
    if s.get(i).is_some_and(u8::is_ascii_digit) {
        let mut v = 0u32;
        while let Some(c) = s.get(i).filter(|c| c.is_ascii_digit()) {
            v = v.saturating_mul(10).saturating_add(u32::from(c - b'0'));
            i += 1;
        }
        row = Some(clamp(v.saturating_sub(1)));
    }
    (i, row, col)
}

impl FromStr for Viewport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let unexpected = |at: usize| {
            let c = s[at..].chars().next().unwrap_or_default();
            format!("unexpected char '{c}' in cell range")
        };
        let mut vp = Viewport::default();
        let (mut i, row, col) = parse_cell(bytes);
        vp.top = row.unwrap_or(vp.top);
        vp.left = col.unwrap_or(vp.left);
        if i == bytes.len() {
            return Ok(vp);
        }
        if bytes[i] != b':' {
            return Err(unexpected(i));
        }
        i += 1;
        let (n, row, col) = parse_cell(&bytes[i..]);
        vp.bottom = row;
        vp.right = col;
        i += n;
        if i == bytes.len() {
            Ok(vp)
        } else {
            Err(unexpected(i))
        }
    }
}

/// Tracks the output position within the grid
///
/// Cells must be placed in increasing row order; rows and columns skipped over are
/// emitted as empty. When the viewport is bounded the grid is padded to its full size.
#[derive(Debug)]
pub(crate) struct OutputCursor {
    top: u32,
    left: u32,
    bottom: Option<u32>,
    right: Option<u32>,
    row: u32,
    col: u32,
    last_row: u32,
}

impl OutputCursor {
    pub(crate) fn new(vp: &Viewport) -> Self {
        Self {
            top: vp.top.into(),
            left: vp.left.into(),
            bottom: vp.bottom.map(u32::from),
            right: vp.right.map(u32::from),
            row: vp.top.into(),
            col: vp.left.into(),
            last_row: 0,
        }
    }

    fn bottom(&self) -> u32 {
        self.bottom.unwrap_or(MAX_INDEX)
    }

    fn pad_row<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if let Some(right) = self.right {
            while self.col < right {
                out.write_all(b"\t")?;
                self.col += 1;
            }
        }
        Ok(())
    }

    fn empty_row<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(b"\n")?;
        if let Some(right) = self.right {
            for _ in self.left..right {
                out.write_all(b"\t")?;
            }
        }
        Ok(())
    }

    /// Moves to cell (`row`, `col`), returns whether it lies within the viewport
    pub(crate) fn place<W: Write>(&mut self, out: &mut W, row: u16, col: u16) -> io::Result<bool> {
        let (row, col) = (u32::from(row), u32::from(col));
        self.last_row = row;
        if row < self.top || row > self.bottom() {
            return Ok(false);
        }
        if row > self.row {
            self.pad_row(out)?;
            self.col = self.left;
            for _ in self.row + 1..row {
                self.empty_row(out)?;
            }
            out.write_all(b"\n")?;
            self.row = row;
        }
        if col < self.left || self.right.is_some_and(|right| col > right) {
            return Ok(false);
        }
        while self.col < col {
            out.write_all(b"\t")?;
            self.col += 1;
        }
        Ok(true)
    }

    /// Whether a cell below the viewport was met
    pub(crate) fn past_bottom(&self) -> bool {
        self.last_row > self.bottom()
    }

    /// Completes the grid
    pub(crate) fn finish<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.pad_row(out)?;
        if let Some(bottom) = self.bottom {
            for _ in self.row..bottom {
                self.empty_row(out)?;
            }
        }
        out.write_all(b"\n")
    }
}

fn error_text(code: u8) -> &'static str {
    match code {
        0x00 => "#NULL!",
        0x07 => "#DIV/0!",
        0x0f => "#VALUE!",
        0x17 => "#REF!",
        0x1d => "#NAME?",
        0x24 => "#NUM!",
        0x2a => "#N/A",
        _ => "#ERR",
    }
}

fn bool_text(v: bool) -> &'static str {
    if v {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// Emits the cells of one sheet substream
pub(crate) struct SheetRenderer<'r, W: Write> {
    pub(crate) version: BiffVersion,
    pub(crate) globals: &'r mut Globals,
    pub(crate) opts: &'r RenderOptions,
    pub(crate) out: &'r mut TextWriter<W>,
}

impl<W: Write> SheetRenderer<'_, W> {
    fn number(&mut self, xf: u16, v: f64) -> Result<(), ExcelError> {
        let spec = if self.opts.raw_numbers {
            None
        } else {
            Some(self.globals.formats.resolve(xf))
        };
        let text = format_value(spec, v, self.globals.date1904);
        self.out.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Renders the sheet whose records start at the cursor (right past the sheet BOF)
    ///
    /// `ordinal` counts the sheets already rendered; with titles enabled each sheet after
    /// the first is preceded by a form feed
    pub(crate) fn render<S: ByteRange>(
        &mut self,
        cursor: &mut RecordCursor<S>,
        name: Option<&XlString>,
        ordinal: usize,
    ) -> Result<(), ExcelError> {
        debug!("Rendering sheet {} at offset {}", ordinal, cursor.offset());
        if self.opts.titles {
            if ordinal > 0 {
                self.out.write_all(b"\x0c")?;
            }
            if let Some(name) = name {
                name.write_to(self.out)?;
            }
            self.out.write_all(b"\n")?;
        }

        let mut grid = OutputCursor::new(&self.opts.viewport);
        let mut string_pending = false;
        loop {
            let (_, record) = cursor.next_record(self.version)?;
            let transparent = matches!(record, Record::Other(_));
            let mut string_expected = false;
            match record {
                Record::Eof => break,
                Record::Bof { .. } => cursor.skip_substream()?,
                Record::Label { cell, text } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        text.write_to(self.out)?;
                    }
                }
                Record::LabelSst { cell, index } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        self.globals.sst.write(cursor.source(), index, self.out)?;
                    }
                }
                Record::Number { cell, value } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        self.number(cell.xf, value)?;
                    }
                }
                Record::Rk { cell, rk } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        self.number(cell.xf, decode_rk(rk))?;
                    }
                }
                Record::MulRk {
                    row,
                    first_col,
                    cells,
                } => {
                    for (col, (xf, rk)) in (first_col..=u16::MAX).zip(cells) {
                        if grid.place(self.out, row, col)? {
                            self.number(xf, decode_rk(rk))?;
                        }
                    }
                }
                Record::Formula { cell, value } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        match value {
                            FormulaValue::Number(v) => self.number(cell.xf, v)?,
                            FormulaValue::String => string_expected = true,
                            FormulaValue::Bool(v) => self.out.write_all(bool_text(v).as_bytes())?,
                            FormulaValue::Error(code) => {
                                self.out.write_all(error_text(code).as_bytes())?
                            }
                            FormulaValue::Empty => {}
                        }
                    }
                }
                Record::String(text) => {
                    if string_pending {
                        text.write_to(self.out)?;
                    }
                }
                Record::BoolErr {
                    cell,
                    value,
                    is_error,
                } => {
                    if grid.place(self.out, cell.row, cell.col)? {
                        let text = if is_error {
                            error_text(value)
                        } else {
                            bool_text(value != 0)
                        };
                        self.out.write_all(text.as_bytes())?;
                    }
                }
                _ => {}
            }
            // Records in between a formula and its string result are skipped over
            if !transparent {
                string_pending = string_expected;
            }
            if grid.past_bottom() {
                debug!("Stopping below the requested range");
                break;
            }
        }
        grid.finish(self.out)?;
        Ok(())
    }
}
