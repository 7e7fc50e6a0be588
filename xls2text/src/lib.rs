//! # Excel BIFF to text converter
//!
//! Renders the cells of legacy Excel workbooks (BIFF3 to BIFF8, that is Excel 3.0 to
//! Excel 2003) as tab separated text.
//!
//! BIFF5 and later workbooks are *Compound File Binary Format* containers holding a
//! `Workbook` (or `Book`) stream: check the [olestore] crate for details. Earlier
//! versions, and raw workbook streams, are read as they are.
//!
//! ```no_run
//! use textconv::{Charset, TextWriter};
//! use xls2text::{convert, Mode, RenderOptions};
//!
//! let data = std::fs::read("sheet.xls").unwrap();
//! let mut out = TextWriter::new(std::io::stdout().lock(), Charset::Utf8);
//! convert(&data, Mode::Render, &RenderOptions::default(), &mut out).unwrap();
//! ```

#![warn(missing_docs)]

mod error;
pub mod format;
pub mod records;
pub mod sst;
pub mod workbook;
pub mod worksheet;
pub use error::ExcelError;
pub use records::BiffVersion;
pub use workbook::Workbook;
pub use worksheet::Viewport;

use olestore::{ByteRange, Ole};
use std::io::Write;
use textconv::TextWriter;
use tracing::debug;

/// What to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// The cells of the selected sheet(s)
    #[default]
    Render,
    /// The list of sheets
    List,
}

/// Rendering settings
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Index of the (first) sheet to render, counting all sheets
    pub sheet: usize,
    /// Whether the sheet was explicitly requested; a hidden or missing sheet is then an
    /// error rather than skipped
    pub explicit: bool,
    /// Render all visible sheets from `sheet` onwards
    pub all: bool,
    /// Precede each sheet with its name (and sheets after the first with a form feed)
    pub titles: bool,
    /// Print numbers without applying their format
    pub raw_numbers: bool,
    /// The cells to render
    pub viewport: Viewport,
    /// Code page overriding the one declared by the workbook
    pub codepage: Option<u16>,
}

fn run<S: ByteRange, W: Write>(
    mut workbook: Workbook<S>,
    mode: Mode,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(), ExcelError> {
    match mode {
        Mode::Render => workbook.render(opts, out),
        Mode::List => workbook.list(opts, out),
    }
}

/// Converts a workbook file
///
/// `data` is either a compound file holding the workbook stream or the bare stream
pub fn convert<W: Write>(
    data: &[u8],
    mode: Mode,
    opts: &RenderOptions,
    out: &mut TextWriter<W>,
) -> Result<(), ExcelError> {
    if Ole::<&[u8]>::is_ole(data) {
        let ole = Ole::new(data)?;
        let stream = ole.open_workbook()?;
        run(Workbook::new(stream)?, mode, opts, out)
    } else {
        debug!("Not a compound file, reading a bare workbook stream");
        run(Workbook::new(data)?, mode, opts, out)
    }
}
