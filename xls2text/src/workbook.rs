//! Workbook level navigation
//!
//! A workbook stream opens with a BOF record whose substream type tells how sheets are
//! laid out:
//! * a single worksheet (BIFF2 to BIFF4 worksheet files)
//! * a BIFF4 workspace, a chain of sheet headers each followed by a whole sheet
//! * BIFF5 and later workbook globals, where BOUNDSHEET records give the offset of each
//!   sheet substream
//!
//! The globals (code page, shared strings, formats and styles) precede the sheet data.

use crate::{
    format::FormatResolver,
    records::{BiffVersion, Record, RecordCursor, RecordType, XlString},
    sst::SharedStringTable,
    worksheet::SheetRenderer,
    ExcelError, RenderOptions,
};
use olestore::ByteRange;
use std::io::Write;
use textconv::TextWriter;
use tracing::{debug, info};

/// BOF substream type of workbook globals
pub const SUBSTREAM_GLOBALS: u16 = 0x0005;
/// BOF substream type of a worksheet
pub const SUBSTREAM_WORKSHEET: u16 = 0x0010;
/// BOF substream type of a BIFF4 workspace
pub const SUBSTREAM_WORKSPACE: u16 = 0x0100;

/// The state gathered from the globals section
#[derive(Debug, Default)]
pub struct Globals {
    /// Shared strings
    pub sst: SharedStringTable,
    /// Number formats and styles
    pub formats: FormatResolver,
    /// Whether dates count from 1904
    pub date1904: bool,
}

/// Scans the globals records up to the first cell or the end of the substream
///
/// Also looks for the BOUNDSHEET record of sheet `sheet_index`, returning its offset
fn scan_globals<S: ByteRange, W: Write>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
    sheet_index: usize,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(Globals, Option<usize>), ExcelError> {
    let mut globals = Globals::default();
    let mut remaining = Some(sheet_index);
    let mut sheet = None;
    loop {
        let (header, record) = cursor.next_record(version)?;
        if header.ty == RecordType::SST {
            let (sst, resume) = SharedStringTable::build(cursor.source(), &header)?;
            globals.sst = sst;
            cursor.seek(resume);
            continue;
        }
        match record {
            Record::CodePage(cp) => {
                if opts.codepage.is_none() {
                    out.set_codepage(cp);
                }
            }
            Record::Format { index, code } => globals.formats.define(index, &code),
            Record::Xf(xf) => globals.formats.add_xf(xf),
            Record::Date1904(v) => globals.date1904 = v,
            Record::BoundSheet { .. } => {
                if remaining == Some(0) {
                    sheet = Some(header.offset);
                }
                remaining = remaining.and_then(|n| n.checked_sub(1));
            }
            Record::Bof { .. } => cursor.skip_substream()?,
            Record::Eof
            | Record::Label { .. }
            | Record::LabelSst { .. }
            | Record::Number { .. }
            | Record::Rk { .. }
            | Record::MulRk { .. }
            | Record::Formula { .. }
            | Record::String(_)
            | Record::BoolErr { .. } => break,
            _ => {}
        }
    }
    debug!(
        "Globals: {} strings, {} styles, 1904 dates: {}",
        globals.sst.len(),
        globals.formats.xf_count(),
        globals.date1904
    );
    Ok((globals, sheet))
}

/// A workbook stream
pub struct Workbook<S: ByteRange> {
    src: S,
    version: BiffVersion,
}

impl<S: ByteRange> Workbook<S> {
    /// Opens a workbook stream, detecting its BIFF version
    pub fn new(mut src: S) -> Result<Self, ExcelError> {
        let head = src.range(0, src.len().min(6))?;
        let version = BiffVersion::detect(head)?;
        info!("Workbook stream of {} bytes, {:?}", src.len(), version);
        Ok(Self { src, version })
    }

    /// The detected BIFF version
    pub fn version(&self) -> BiffVersion {
        self.version
    }

    /// Reads the leading BOF record, returning its substream type
    fn open<'s>(
        src: &'s mut S,
        version: BiffVersion,
    ) -> Result<(RecordCursor<'s, S>, u16), ExcelError> {
        let mut cursor = RecordCursor::new(src, 0);
        match cursor.next_record(version)? {
            (_, Record::Bof { kind }) => Ok((cursor, kind)),
            _ => Err(ExcelError::bad_format("Bad content")),
        }
    }

    /// Renders the selected sheet(s)
    pub fn render<W: Write>(
        &mut self,
        opts: &RenderOptions,
        out: &mut TextWriter<W>,
    ) -> Result<(), ExcelError> {
        if let Some(cp) = opts.codepage {
            out.set_codepage(cp);
        }
        let version = self.version;
        let (mut cursor, kind) = Self::open(&mut self.src, version)?;
        match kind {
            SUBSTREAM_WORKSHEET => {
                if opts.sheet != 0 {
                    return Err(ExcelError::NoSuchSheet);
                }
                let body = cursor.offset();
                let (mut globals, _) = scan_globals(&mut cursor, version, 0, opts, out)?;
                cursor.seek(body);
                SheetRenderer {
                    version,
                    globals: &mut globals,
                    opts,
                    out,
                }
                .render(&mut cursor, None, 0)
            }
            SUBSTREAM_GLOBALS => render_globals(&mut cursor, version, opts, out),
            SUBSTREAM_WORKSPACE => render_workspace(&mut cursor, version, opts, out),
            _ => Err(ExcelError::bad_format("Bad content")),
        }
    }

    /// Lists the sheets of the workbook, one per line
    pub fn list<W: Write>(
        &mut self,
        opts: &RenderOptions,
        out: &mut TextWriter<W>,
    ) -> Result<(), ExcelError> {
        if let Some(cp) = opts.codepage {
            out.set_codepage(cp);
        }
        let version = self.version;
        let (mut cursor, kind) = Self::open(&mut self.src, version)?;
        match kind {
            SUBSTREAM_WORKSHEET => {
                writeln!(out, "Single sheet")?;
                return Ok(());
            }
            SUBSTREAM_WORKSPACE => return list_workspace(&mut cursor, version, opts, out),
            SUBSTREAM_GLOBALS => {}
            _ => {
                writeln!(out, "Unknown contents")?;
                return Ok(());
            }
        }
        let mut nr = 0usize;
        loop {
            match cursor.next_record(version)?.1 {
                Record::Eof => return Ok(()),
                Record::Bof { .. } => cursor.skip_substream()?,
                Record::CodePage(cp) => {
                    if opts.codepage.is_none() {
                        out.set_codepage(cp);
                    }
                }
                Record::BoundSheet { kind, name, .. } => {
                    let label = if version < BiffVersion::Biff5 {
                        "sheet"
                    } else {
                        match kind {
                            0 => "sheet",
                            2 => "chart",
                            6 => "vbasic",
                            _ => "",
                        }
                    };
                    list_line(out, nr, label, &name)?;
                    nr += 1;
                }
                _ => {}
            }
        }
    }
}

fn list_line<W: Write>(
    out: &mut TextWriter<W>,
    nr: usize,
    label: &str,
    name: &XlString,
) -> Result<(), ExcelError> {
    write!(out, "{:2}. {:<8} ", nr, label)?;
    name.write_to(out)?;
    writeln!(out)?;
    Ok(())
}

/// Renders from the BOUNDSHEET directory of BIFF5 and later workbooks
fn render_globals<S: ByteRange, W: Write>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(), ExcelError> {
    let (mut globals, sheet) = scan_globals(cursor, version, opts.sheet, opts, out)?;
    cursor.seek(sheet.ok_or(ExcelError::NoSuchSheet)?);
    let mut done = 0usize;
    loop {
        let (header, record) = cursor.next_record(version)?;
        let (offset, visible, name) = match record {
            Record::BoundSheet {
                offset,
                visible,
                name,
                ..
            } => (offset as usize, visible, name),
            _ => break,
        };
        let next = cursor.offset();
        if offset >= cursor.source().len() {
            return Err(ExcelError::Truncated);
        }
        if offset <= header.payload() {
            return Err(ExcelError::bad_format("Sheet offset points backwards"));
        }
        if visible {
            cursor.seek(offset);
            if !matches!(cursor.next_record(version)?.1, Record::Bof { .. }) {
                return Err(ExcelError::bad_format("Sheet does not start with BOF"));
            }
            SheetRenderer {
                version,
                globals: &mut globals,
                opts,
                out: &mut *out,
            }
            .render(cursor, Some(&name), done)?;
            done += 1;
            if !opts.all {
                break;
            }
        } else if opts.explicit {
            return Err(ExcelError::NoSuchSheet);
        } else {
            debug!("Skipping hidden sheet at offset {}", offset);
        }
        cursor.seek(next);
    }
    Ok(())
}

/// Locates the first sheet header of a BIFF4 workspace
fn first_sheet_header<S: ByteRange, W: Write>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<Option<(u32, XlString)>, ExcelError> {
    loop {
        match cursor.next_record(version)?.1 {
            Record::CodePage(cp) => {
                if opts.codepage.is_none() {
                    out.set_codepage(cp);
                }
            }
            Record::SheetOffset(offset) => {
                if offset as usize >= cursor.source().len() {
                    return Err(ExcelError::Truncated);
                }
                cursor.seek(offset as usize);
                break;
            }
            Record::Eof => return Err(ExcelError::bad_format("No sheets in workspace")),
            _ => {}
        }
    }
    next_sheet_header(cursor, version)
}

/// Reads the record at the cursor if it is a sheet header
fn next_sheet_header<S: ByteRange>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
) -> Result<Option<(u32, XlString)>, ExcelError> {
    let header = match cursor.next_header()? {
        Some(h) if h.ty == RecordType::SheetHdr => h,
        _ => return Ok(None),
    };
    match Record::decode(header.ty, cursor.payload(&header)?, version)? {
        Record::SheetHdr { size, name } => Ok(Some((size, name))),
        _ => Ok(None),
    }
}

/// Computes the offset of the next sheet header from the size of the current sheet
fn skip_sheet<S: ByteRange>(cursor: &mut RecordCursor<S>, size: u32) -> Result<usize, ExcelError> {
    let base = cursor.offset();
    let size = size as usize;
    if size >= cursor.source().len() - base {
        return Err(ExcelError::Truncated);
    }
    Ok(base + size)
}

/// Renders from the sheet header chain of a BIFF4 workspace
fn render_workspace<S: ByteRange, W: Write>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(), ExcelError> {
    let (mut size, mut name) =
        first_sheet_header(cursor, version, opts, out)?.ok_or(ExcelError::NoSuchSheet)?;
    let mut remaining = opts.sheet;
    let mut done = 0usize;
    loop {
        let next = skip_sheet(cursor, size)?;
        if remaining == 0 {
            let kind = match cursor.next_record(version)?.1 {
                Record::Bof { kind } => kind,
                _ => return Err(ExcelError::bad_format("Sheet does not start with BOF")),
            };
            if kind == SUBSTREAM_WORKSHEET {
                let body = cursor.offset();
                let (mut globals, _) = scan_globals(cursor, version, 0, opts, out)?;
                cursor.seek(body);
                SheetRenderer {
                    version,
                    globals: &mut globals,
                    opts,
                    out: &mut *out,
                }
                .render(cursor, Some(&name), done)?;
                done += 1;
                if !opts.all {
                    break;
                }
            } else if opts.explicit {
                return Err(ExcelError::NotASheet);
            }
        } else {
            remaining -= 1;
        }
        cursor.seek(next);
        match next_sheet_header(cursor, version)? {
            Some((s, n)) => (size, name) = (s, n),
            None if done == 0 => return Err(ExcelError::NoSuchSheet),
            None => break,
        }
    }
    Ok(())
}

/// Lists the sheets of a BIFF4 workspace
fn list_workspace<S: ByteRange, W: Write>(
    cursor: &mut RecordCursor<S>,
    version: BiffVersion,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(), ExcelError> {
    let mut current = first_sheet_header(cursor, version, opts, out)?;
    let mut nr = 0usize;
    while let Some((size, name)) = current {
        let next = skip_sheet(cursor, size)?;
        let label = match cursor.next_record(version)?.1 {
            Record::Bof {
                kind: SUBSTREAM_WORKSHEET,
            } => "sheet",
            Record::Bof { kind: 0x0020 } => "chart",
            Record::Bof { kind: 0x0040 } => "macro",
            _ => "",
        };
        list_line(out, nr, label, &name)?;
        nr += 1;
        cursor.seek(next);
        current = next_sheet_header(cursor, version)?;
    }
    Ok(())
}
