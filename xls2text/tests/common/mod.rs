//! Synthetic workbook assembly for tests

#![allow(dead_code)]

use textconv::{Charset, TextWriter};
use xls2text::{convert, ExcelError, Mode, RenderOptions};

pub fn record(code: u16, payload: &[u8]) -> Vec<u8> {
    let mut v = code.to_le_bytes().to_vec();
    v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

fn cell(row: u16, col: u16, xf: u16) -> Vec<u8> {
    [row.to_le_bytes(), col.to_le_bytes(), xf.to_le_bytes()].concat()
}

/// BIFF8 compressed string with a 16 bit length
fn str16(text: &str) -> Vec<u8> {
    let mut v = (text.len() as u16).to_le_bytes().to_vec();
    v.push(0);
    v.extend_from_slice(text.as_bytes());
    v
}

/// BIFF8 compressed string with an 8 bit length
fn str8(text: &str) -> Vec<u8> {
    let mut v = vec![text.len() as u8, 0];
    v.extend_from_slice(text.as_bytes());
    v
}

pub fn bof8(kind: u16) -> Vec<u8> {
    let mut p = vec![0x00, 0x06];
    p.extend_from_slice(&kind.to_le_bytes());
    p.extend_from_slice(&[0; 12]);
    record(0x0809, &p)
}

pub fn eof() -> Vec<u8> {
    record(0x000a, &[])
}

pub fn codepage(cp: u16) -> Vec<u8> {
    record(0x0042, &cp.to_le_bytes())
}

pub fn date1904() -> Vec<u8> {
    record(0x0022, &[1, 0])
}

/// An uninteresting record of `len` bytes
pub fn filler(len: usize) -> Vec<u8> {
    record(0x00e1, &vec![0x55; len])
}

pub fn sst(strings: &[&str]) -> Vec<u8> {
    let mut p = (strings.len() as u32).to_le_bytes().to_vec();
    p.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in strings {
        p.extend(str16(s));
    }
    record(0x00fc, &p)
}

pub fn format8(index: u16, pattern: &str) -> Vec<u8> {
    let mut p = index.to_le_bytes().to_vec();
    p.extend(str16(pattern));
    record(0x041e, &p)
}

/// A style record selecting number format `format`
///
/// `inherit` leaves the format to the parent style
pub fn xf8(format: u16, style: bool, inherit: bool, parent: u16) -> Vec<u8> {
    let mut p = vec![0u8; 20];
    p[2..4].copy_from_slice(&format.to_le_bytes());
    let flags = (parent << 4) | if style { 4 } else { 0 };
    p[4..6].copy_from_slice(&flags.to_le_bytes());
    // The used attribute bit has inverted meaning for styles
    if style == inherit {
        p[9] = 0x04;
    }
    record(0x00e0, &p)
}

pub fn label8(row: u16, col: u16, text: &str) -> Vec<u8> {
    let mut p = cell(row, col, 0);
    p.extend(str16(text));
    record(0x0204, &p)
}

pub fn label_sst(row: u16, col: u16, index: u32) -> Vec<u8> {
    let mut p = cell(row, col, 0);
    p.extend_from_slice(&index.to_le_bytes());
    record(0x00fd, &p)
}

pub fn number(row: u16, col: u16, xf: u16, v: f64) -> Vec<u8> {
    let mut p = cell(row, col, xf);
    p.extend_from_slice(&v.to_le_bytes());
    record(0x0203, &p)
}

pub fn rk(row: u16, col: u16, xf: u16, value: u32) -> Vec<u8> {
    let mut p = cell(row, col, xf);
    p.extend_from_slice(&value.to_le_bytes());
    record(0x027e, &p)
}

pub fn mulrk(row: u16, first_col: u16, cells: &[(u16, u32)]) -> Vec<u8> {
    let mut p = [row.to_le_bytes(), first_col.to_le_bytes()].concat();
    for (xf, value) in cells {
        p.extend_from_slice(&xf.to_le_bytes());
        p.extend_from_slice(&value.to_le_bytes());
    }
    p.extend_from_slice(&(first_col + cells.len() as u16 - 1).to_le_bytes());
    record(0x00bd, &p)
}

fn formula(row: u16, col: u16, xf: u16, result: [u8; 8]) -> Vec<u8> {
    let mut p = cell(row, col, xf);
    p.extend_from_slice(&result);
    // Options, cache, then an empty parsed expression
    p.extend_from_slice(&[0; 8]);
    record(0x0006, &p)
}

pub fn formula_number(row: u16, col: u16, xf: u16, v: f64) -> Vec<u8> {
    formula(row, col, xf, v.to_le_bytes())
}

pub fn formula_special(row: u16, col: u16, kind: u8, value: u8) -> Vec<u8> {
    formula(row, col, 0, [kind, 0, value, 0, 0, 0, 0xff, 0xff])
}

pub fn string8(text: &str) -> Vec<u8> {
    record(0x0207, &str16(text))
}

pub fn boolerr(row: u16, col: u16, value: u8, is_error: bool) -> Vec<u8> {
    let mut p = cell(row, col, 0);
    p.extend_from_slice(&[value, is_error as u8]);
    record(0x0205, &p)
}

/// A sheet of a BIFF8 workbook
pub struct Sheet {
    pub name: &'static str,
    pub hidden: bool,
    pub kind: u8,
    pub records: Vec<Vec<u8>>,
}

impl Sheet {
    pub fn new(name: &'static str, records: Vec<Vec<u8>>) -> Self {
        Self {
            name,
            hidden: false,
            kind: 0,
            records,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn chart(mut self) -> Self {
        self.kind = 2;
        self
    }
}

fn boundsheet(offset: u32, sheet: &Sheet) -> Vec<u8> {
    let mut p = offset.to_le_bytes().to_vec();
    p.push(sheet.hidden as u8);
    p.push(sheet.kind);
    p.extend(str8(sheet.name));
    record(0x0085, &p)
}

/// Lays out a BIFF8 workbook stream: globals, then the sheet substreams
pub fn workbook8(globals: &[Vec<u8>], sheets: &[Sheet]) -> Vec<u8> {
    let head: Vec<u8> = std::iter::once(bof8(0x0005))
        .chain(globals.iter().cloned())
        .flatten()
        .collect();
    let directory_len: usize = sheets.iter().map(|s| boundsheet(0, s).len()).sum();
    let mut offset = head.len() + directory_len + eof().len();
    let mut directory = Vec::new();
    let mut bodies = Vec::new();
    for sheet in sheets {
        directory.extend(boundsheet(offset as u32, sheet));
        let kind = if sheet.kind == 2 { 0x0020 } else { 0x0010 };
        let body: Vec<u8> = std::iter::once(bof8(kind))
            .chain(sheet.records.iter().cloned())
            .chain(std::iter::once(eof()))
            .flatten()
            .collect();
        offset += body.len();
        bodies.extend(body);
    }
    [head, directory, eof(), bodies].concat()
}

const SECTOR: usize = 512;
const ENDOFCHAIN: u32 = 0xfffffffe;
const FREESECT: u32 = 0xffffffff;
const FATSECT: u32 = 0xfffffffd;

fn put16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn dir_entry(name: &str, objtype: u8, start: u32, size: u32) -> Vec<u8> {
    let mut e = vec![0u8; 128];
    let units: Vec<u16> = name.encode_utf16().collect();
    for (i, u) in units.iter().enumerate() {
        put16(&mut e, i * 2, *u);
    }
    put16(&mut e, 0x40, ((units.len() + 1) * 2) as u16);
    e[0x42] = objtype;
    put32(&mut e, 0x44, FREESECT);
    put32(&mut e, 0x48, FREESECT);
    put32(&mut e, 0x4c, FREESECT);
    put32(&mut e, 0x74, start);
    put32(&mut e, 0x78, size);
    e
}

/// Wraps `stream` into a compound file as stream `name`
///
/// The stream is padded with filler records to stay out of the mini stream
pub fn container(name: &str, stream: &[u8]) -> Vec<u8> {
    let mut stream = stream.to_vec();
    while stream.len() < 4096 {
        stream.extend(filler(1000));
    }
    let data_sectors = stream.len().div_ceil(SECTOR);
    let dir_sector = data_sectors;
    let mut nfat = 1;
    while (data_sectors + 1 + nfat).div_ceil(SECTOR / 4) > nfat {
        nfat += 1;
    }
    let mut fat = vec![FREESECT; nfat * SECTOR / 4];
    for (i, slot) in fat.iter_mut().enumerate().take(data_sectors) {
        *slot = if i + 1 < data_sectors {
            i as u32 + 1
        } else {
            ENDOFCHAIN
        };
    }
    fat[dir_sector] = ENDOFCHAIN;
    for slot in fat.iter_mut().skip(dir_sector + 1).take(nfat) {
        *slot = FATSECT;
    }

    let mut h = vec![0u8; SECTOR];
    h[0..8].copy_from_slice(&[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1]);
    put16(&mut h, 0x18, 0x3e);
    put16(&mut h, 0x1a, 3);
    put16(&mut h, 0x1c, 0xfffe);
    put16(&mut h, 0x1e, 9);
    put16(&mut h, 0x20, 6);
    put32(&mut h, 0x2c, nfat as u32);
    put32(&mut h, 0x30, dir_sector as u32);
    put32(&mut h, 0x38, 4096);
    put32(&mut h, 0x3c, ENDOFCHAIN);
    put32(&mut h, 0x44, ENDOFCHAIN);
    for i in 0..109 {
        let id = if i < nfat {
            (dir_sector + 1 + i) as u32
        } else {
            FREESECT
        };
        put32(&mut h, 0x4c + i * 4, id);
    }

    let mut out = h;
    out.extend_from_slice(&stream);
    out.resize(SECTOR * (1 + data_sectors), 0);
    let mut dir = dir_entry("Root Entry", 5, ENDOFCHAIN, 0);
    dir.extend(dir_entry(name, 2, 0, stream.len() as u32));
    dir.resize(SECTOR, 0);
    out.extend(dir);
    out.extend(fat.iter().flat_map(|v| v.to_le_bytes()));
    out
}

/// Runs a conversion, returning the output as text
pub fn run_with(
    data: &[u8],
    mode: Mode,
    opts: &RenderOptions,
    charset: Charset,
) -> Result<String, ExcelError> {
    let mut out = TextWriter::new(Vec::new(), charset);
    convert(data, mode, opts, &mut out)?;
    Ok(String::from_utf8_lossy(&out.into_inner()).into_owned())
}

pub fn render(data: &[u8], opts: &RenderOptions) -> Result<String, ExcelError> {
    run_with(data, Mode::Render, opts, Charset::Utf8)
}

pub fn list(data: &[u8]) -> Result<String, ExcelError> {
    run_with(data, Mode::List, &RenderOptions::default(), Charset::Utf8)
}
