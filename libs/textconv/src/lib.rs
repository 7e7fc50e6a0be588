//! Text conversion for spreadsheet output
//!
//! Spreadsheet text arrives in three shapes: 8 bit strings in the workbook code page,
//! "compressed" 16 bit strings (one byte per character, i.e. Latin-1) and UTF-16LE.
//! [`TextWriter`] decodes all of them and re-encodes the result into the selected output
//! [`Charset`]; characters the output charset cannot represent are replaced with `?`
//!
//! Notes:
//! * decoding is done with `encoding_rs`, which covers every Windows code page found in
//!   practice; DOS code pages it does not know fall back to Windows-1252
//! * `ISO-8859-1` is handled internally: `encoding_rs` treats it as Windows-1252

#![warn(missing_docs)]

use encoding_rs::{EncoderResult, Encoding};
use std::io::{self, Write};
use tracing::debug;

/// The workbook default code page
pub const DEFAULT_CODEPAGE: u16 = 1252;

/// Output charsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8
    #[default]
    Utf8,
    /// 7 bit ASCII
    Ascii,
    /// ISO-8859-1
    Latin1,
    /// ISO-8859-2
    Latin2,
}

impl Charset {
    /// Looks up a charset by name (case insensitive)
    ///
    /// Besides the short names `utf8`, `asc`, `iso1` and `iso2` a few common aliases are
    /// recognized
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        CHARSET_NAMES
            .binary_search_by_key(&name.as_str(), |&(k, _)| k)
            .ok()
            .map(|i| CHARSET_NAMES[i].1)
    }
}

impl std::str::FromStr for Charset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("{}: Unknown charset", s))
    }
}

/// Charset alias mapping
// NOTE: this (k, v) slice MUST be sorted by k!
static CHARSET_NAMES: &[(&str, Charset)] = &[
    ("asc", Charset::Ascii),
    ("ascii", Charset::Ascii),
    ("iso-8859-1", Charset::Latin1),
    ("iso-8859-2", Charset::Latin2),
    ("iso1", Charset::Latin1),
    ("iso2", Charset::Latin2),
    ("latin1", Charset::Latin1),
    ("latin2", Charset::Latin2),
    ("us-ascii", Charset::Ascii),
    ("utf-8", Charset::Utf8),
    ("utf8", Charset::Utf8),
];

/// Code page to decoder mapping
// NOTE: this (k, v) slice MUST be sorted by k!
static CPMAP: &[(u16, &Encoding)] = &[
    (866, encoding_rs::IBM866),
    (874, encoding_rs::WINDOWS_874),
    (932, encoding_rs::SHIFT_JIS),
    (936, encoding_rs::GBK),
    (949, encoding_rs::EUC_KR),
    (950, encoding_rs::BIG5),
    (1250, encoding_rs::WINDOWS_1250),
    (1251, encoding_rs::WINDOWS_1251),
    (1252, encoding_rs::WINDOWS_1252),
    (1253, encoding_rs::WINDOWS_1253),
    (1254, encoding_rs::WINDOWS_1254),
    (1255, encoding_rs::WINDOWS_1255),
    (1256, encoding_rs::WINDOWS_1256),
    (1257, encoding_rs::WINDOWS_1257),
    (1258, encoding_rs::WINDOWS_1258),
    (10000, encoding_rs::MACINTOSH),
    (10007, encoding_rs::X_MAC_CYRILLIC),
    (20866, encoding_rs::KOI8_R),
    (21866, encoding_rs::KOI8_U),
    (28592, encoding_rs::ISO_8859_2),
    (28593, encoding_rs::ISO_8859_3),
    (28594, encoding_rs::ISO_8859_4),
    (28595, encoding_rs::ISO_8859_5),
    (28596, encoding_rs::ISO_8859_6),
    (28597, encoding_rs::ISO_8859_7),
    (28598, encoding_rs::ISO_8859_8),
    (28603, encoding_rs::ISO_8859_13),
    (28605, encoding_rs::ISO_8859_15),
    (32768, encoding_rs::MACINTOSH),
    (32769, encoding_rs::WINDOWS_1252),
    (51932, encoding_rs::EUC_JP),
    (54936, encoding_rs::GB18030),
    (65001, encoding_rs::UTF_8),
];

/// How 8 bit workbook strings are decoded
#[derive(Debug, Clone, Copy)]
enum Source {
    /// Bytes are Unicode code points (code page 1200 and ISO-8859-1)
    Latin1,
    Encoding(&'static Encoding),
}

fn source_for_codepage(cp: u16) -> Source {
    match cp {
        1200 | 28591 => Source::Latin1,
        _ => Source::Encoding(
            CPMAP
                .binary_search_by_key(&cp, |&(k, _)| k)
                .map(|i| CPMAP[i].1)
                .unwrap_or_else(|_| {
                    debug!("Code page {} not supported, using windows-1252", cp);
                    encoding_rs::WINDOWS_1252
                }),
        ),
    }
}

/// A [`Write`] adaptor emitting workbook text in the output charset
///
/// The [`Write`] implementation passes bytes through untouched and is meant for the ASCII
/// glue around text (separators, numbers)
pub struct TextWriter<W: Write> {
    inner: W,
    charset: Charset,
    codepage: u16,
    source: Source,
    pending_surrogate: Option<u16>,
}

impl<W: Write> TextWriter<W> {
    /// Creates a writer for `charset` with the default code page
    pub fn new(inner: W, charset: Charset) -> Self {
        Self {
            inner,
            charset,
            codepage: DEFAULT_CODEPAGE,
            source: source_for_codepage(DEFAULT_CODEPAGE),
            pending_surrogate: None,
        }
    }

    /// The output charset
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// The code page used for 8 bit strings
    pub fn codepage(&self) -> u16 {
        self.codepage
    }

    /// Sets the code page used for 8 bit strings
    pub fn set_codepage(&mut self, cp: u16) {
        if cp != self.codepage {
            debug!("Code page set to {}", cp);
            self.codepage = cp;
            self.source = source_for_codepage(cp);
        }
    }

    /// Emits a string in the workbook code page
    pub fn write_codepage(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.source {
            Source::Latin1 => self.write_latin1(bytes),
            Source::Encoding(encoding) => {
                let (text, _) = encoding.decode_without_bom_handling(bytes);
                self.write_str(&text)
            }
        }
    }

    /// Emits a compressed (one byte per character) Unicode string
    pub fn write_latin1(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text: String = bytes.iter().map(|&b| char::from(b)).collect();
        self.write_str(&text)
    }

    /// Emits UTF-16LE code units
    ///
    /// A trailing high surrogate is held back so a character split across two calls is
    /// reassembled; [`finish_text`](Self::finish_text) flushes it
    pub fn write_utf16le(&mut self, bytes: &[u8]) -> io::Result<()> {
        let units = self
            .pending_surrogate
            .take()
            .into_iter()
            .chain(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])));
        let mut units: Vec<u16> = units.collect();
        if let Some(&last) = units.last() {
            if (0xd800..0xdc00).contains(&last) {
                self.pending_surrogate = Some(last);
                units.pop();
            }
        }
        let text: String = char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        self.write_str(&text)
    }

    /// Terminates a run of text, flushing an unpaired surrogate as a replacement
    pub fn finish_text(&mut self) -> io::Result<()> {
        if self.pending_surrogate.take().is_some() {
            self.write_str("\u{fffd}")?;
        }
        Ok(())
    }

    /// Emits Unicode text in the output charset
    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        match self.charset {
            Charset::Utf8 => self.inner.write_all(text.as_bytes()),
            Charset::Ascii => {
                for c in text.chars() {
                    self.inner.write_all(&[if c.is_ascii() { c as u8 } else { b'?' }])?;
                }
                Ok(())
            }
            Charset::Latin1 => {
                for c in text.chars() {
                    self.inner
                        .write_all(&[u8::try_from(u32::from(c)).unwrap_or(b'?')])?;
                }
                Ok(())
            }
            Charset::Latin2 => self.encode_with(encoding_rs::ISO_8859_2, text),
        }
    }

    fn encode_with(&mut self, encoding: &'static Encoding, text: &str) -> io::Result<()> {
        let mut encoder = encoding.new_encoder();
        let mut src = text;
        let mut buf = [0u8; 256];
        loop {
            let (result, read, written) =
                encoder.encode_from_utf8_without_replacement(src, &mut buf, true);
            self.inner.write_all(&buf[..written])?;
            src = &src[read..];
            match result {
                EncoderResult::InputEmpty => return Ok(()),
                EncoderResult::OutputFull => {}
                EncoderResult::Unmappable(_) => self.inner.write_all(b"?")?,
            }
        }
    }

    /// Unwraps this `TextWriter`, returning the underlying writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for TextWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
