use clap::Parser;
use olestore::Backing;
use std::{io::Write, path::PathBuf, process::ExitCode};
use textconv::{Charset, TextWriter};
use tracing::warn;
use tracing_subscriber::{prelude::*, EnvFilter};
use xls2text::{convert, ExcelError, Mode, RenderOptions, Viewport};

/// Converts Excel (BIFF) workbooks to tab separated text
#[derive(Parser, Debug)]
#[command(name = "xls2txt", version)]
struct Args {
    /// Select sheet (counting from 0)
    #[arg(short = 'n', value_name = "NUM")]
    sheet: Option<usize>,

    /// All sheets (\f separated)
    #[arg(short = 'A')]
    all: bool,

    /// List sheets
    #[arg(short = 'l')]
    list: bool,

    /// Output charset (utf8 asc iso1 iso2), utf8 is default
    #[arg(short = 'C', value_name = "CS")]
    charset: Option<String>,

    /// ASCII output (same as -C asc)
    #[arg(short = 'a')]
    ascii: bool,

    /// ISO-8859-1 output
    #[arg(short = '1')]
    latin1: bool,

    /// ISO-8859-2 output
    #[arg(short = '2')]
    latin2: bool,

    /// Code page of 8 bit strings, overriding the workbook's
    #[arg(short = 'P', value_name = "CP")]
    codepage: Option<u16>,

    /// Don't try to format numbers
    #[arg(short = 'f')]
    raw_numbers: bool,

    /// Workbook file
    file: PathBuf,

    /// Cell range (eg. A1:C5, D2:E)
    #[arg(value_name = "X:X", value_parser = parse_range)]
    range: Option<Viewport>,
}

fn parse_range(s: &str) -> Result<Viewport, String> {
    s.parse()
}

impl Args {
    fn charset(&self) -> Charset {
        let mut charset = Charset::default();
        if let Some(name) = &self.charset {
            match name.parse() {
                Ok(cs) => charset = cs,
                Err(e) => warn!("{}", e),
            }
        }
        if self.ascii {
            charset = Charset::Ascii;
        }
        if self.latin1 {
            charset = Charset::Latin1;
        }
        if self.latin2 {
            charset = Charset::Latin2;
        }
        charset
    }

    fn options(&self) -> RenderOptions {
        RenderOptions {
            sheet: self.sheet.unwrap_or(0),
            explicit: self.sheet.is_some() && !self.all,
            all: self.all,
            titles: self.all,
            raw_numbers: self.raw_numbers,
            viewport: self.range.unwrap_or_default(),
            codepage: self.codepage.filter(|&cp| cp != 0),
        }
    }
}

fn process(args: &Args) -> Result<(), ExcelError> {
    let backing = Backing::open(&args.file)?;
    let stdout = std::io::stdout();
    let mut out = TextWriter::new(std::io::BufWriter::new(stdout.lock()), args.charset());
    let mode = if args.list { Mode::List } else { Mode::Render };
    let result = convert(backing.as_ref(), mode, &args.options(), &mut out);
    // Whatever was rendered before a failure is still emitted
    out.flush()?;
    result
}

/// Warnings are shown unless `RUST_LOG` asks otherwise
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let args = Args::parse();
    match process(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xls2txt: {}", e);
            ExitCode::FAILURE
        }
    }
}
