//! Number formats and their application to cell values
//!
//! A number cell points to a style record (XF) which either carries a number format index
//! or defers to its parent style. Format patterns are reduced to a coarse class (general,
//! fixed decimals, scientific, date, time, date and time) plus a decimal count, which is
//! all the text rendering needs.

use crate::records::BiffVersion;
use olestore::le;
use time::OffsetDateTime;
use tracing::warn;

/// Coarse class of a number format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatKind {
    /// Integers without decimals, anything else with six
    #[default]
    General,
    /// A fixed number of decimals
    Fixed,
    /// Mantissa and exponent
    Scientific,
    /// A calendar date
    Date,
    /// A time of day
    Time,
    /// A date followed by a time of day
    DateTime,
}

/// A resolved number format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatSpec {
    /// The format class
    pub kind: FormatKind,
    /// Number of decimals (ignored by date and time classes)
    pub arg: u8,
}

impl FormatSpec {
    /// Creates a format spec
    pub const fn new(kind: FormatKind, arg: u8) -> Self {
        Self { kind, arg }
    }

    fn from_code(code: u8) -> Self {
        let kind = match code >> 4 {
            1 => FormatKind::Fixed,
            2 => FormatKind::Scientific,
            3 => FormatKind::Date,
            4 => FormatKind::Time,
            5 => FormatKind::DateTime,
            _ => FormatKind::General,
        };
        Self::new(kind, code & 0xf)
    }
}

/// Built-in formats, indexed by format number
///
/// Each entry packs the class in the high nibble and the decimal count in the low one
static BUILTIN_FORMATS: [u8; 49] = [
    0x00, 0x10, 0x12, 0x10, 0x12, 0x10, 0x10, 0x12, 0x12, 0x12, 0x14, 0x22, 0x00, 0x00, 0x30,
    0x30, 0x30, 0x30, 0x40, 0x40, 0x40, 0x40, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x10, 0x12, 0x12, 0x10, 0x10, 0x12, 0x12,
    0x40, 0x40, 0x40, 0x21,
];

fn unit_is(u: u16, set: &str) -> bool {
    u < 128 && set.as_bytes().contains(&(u as u8))
}

/// Classifies a number format pattern
///
/// Leading bracketed sections (colors, conditions, locales), quoted literals, escaped
/// characters and currency or sign symbols are skipped. A pattern then starting with a
/// year, month or day letter is a date, with an hour or minute letter a time. Otherwise
/// a run of digit placeholders optionally followed by a decimal point gives a fixed
/// format whose decimal count is the number of placeholders after the point.
pub fn classify_pattern(code: &[u16]) -> FormatSpec {
    let general = FormatSpec::default();
    let at = |i: usize| code.get(i).copied().unwrap_or(0);
    let mut q = 0;
    loop {
        match at(q) {
            0x5b /* [ */ => {
                let end = match code[q..].iter().position(|&c| c == u16::from(b']')) {
                    Some(end) => q + end,
                    None => return general,
                };
                if unit_is(at(q + 1), "hHmMsS") {
                    // Elapsed time
                    return FormatSpec::new(FormatKind::Time, 0);
                }
                q = end + 1;
            }
            0x22 /* " */ => {
                match code[q + 1..].iter().position(|&c| c == u16::from(b'"')) {
                    Some(end) => q += end + 2,
                    None => return general,
                }
            }
            0x5c /* \ */ => q += 2,
            c if unit_is(c, "$-+(") => q += 1,
            _ => break,
        }
    }
    if q >= code.len() {
        return general;
    }

    let first = code[q];
    if unit_is(first, "YyMDd") {
        return FormatSpec::new(FormatKind::DateTime, 0);
    }
    if unit_is(first, "hH") {
        return FormatSpec::new(FormatKind::Time, 0);
    }
    if first == u16::from(b'm') {
        // Minutes are followed by seconds, months by anything else
        let after = code[q..]
            .iter()
            .position(|&c| c != u16::from(b'm'))
            .map(|n| at(q + n));
        return if after == Some(u16::from(b':')) {
            FormatSpec::new(FormatKind::Time, 0)
        } else {
            FormatSpec::new(FormatKind::DateTime, 0)
        };
    }

    let start = q;
    while q < code.len() && unit_is(code[q], "0#?, ") {
        q += 1;
    }
    let exponent = |i: usize| unit_is(at(i), "Ee");
    if at(q) == u16::from(b'.') {
        let decimals = code[q + 1..]
            .iter()
            .take_while(|&&c| unit_is(c, "0#"))
            .count();
        let kind = if exponent(q + 1 + decimals) {
            FormatKind::Scientific
        } else {
            FormatKind::Fixed
        };
        return FormatSpec::new(kind, u8::try_from(decimals).unwrap_or(u8::MAX));
    }
    if q > start && at(q) != u16::from(b'/') {
        let kind = if exponent(q) {
            FormatKind::Scientific
        } else {
            FormatKind::Fixed
        };
        return FormatSpec::new(kind, 0);
    }
    general
}

/// The number format related bits of a style record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfEntry {
    /// Number format index
    pub format: u16,
    /// Whether this is a style XF (as opposed to a cell XF)
    pub is_style: bool,
    /// Whether the number format is defined here rather than inherited
    pub format_present: bool,
    /// Parent style index
    pub parent: u16,
}

impl XfEntry {
    /// Decodes the XF record payload `p`; `None` if too short
    pub fn decode(version: BiffVersion, p: &[u8]) -> Option<Self> {
        let (format, state, used, parent) = match version {
            BiffVersion::Biff3 => (
                u16::from(*p.get(1)?),
                *p.get(2)?,
                *p.get(3)?,
                le::u16_at(p, 4)?,
            ),
            BiffVersion::Biff4 => (
                u16::from(*p.get(1)?),
                *p.get(2)?,
                *p.get(5)?,
                le::u16_at(p, 2)?,
            ),
            BiffVersion::Biff5 => (le::u16_at(p, 2)?, *p.get(4)?, *p.get(7)?, le::u16_at(p, 4)?),
            BiffVersion::Biff8 => (le::u16_at(p, 2)?, *p.get(4)?, *p.get(9)?, le::u16_at(p, 4)?),
        };
        // The "used attribute" bits have inverted meaning in style records
        Some(Self {
            format,
            is_style: state & 4 != 0,
            format_present: (state ^ used) & 4 != 0,
            parent: parent >> 4,
        })
    }
}

/// Maps style (XF) indexes to number formats
#[derive(Debug)]
pub struct FormatResolver {
    formats: Vec<FormatSpec>,
    appended: usize,
    xfs: Vec<Option<XfEntry>>,
    memo: Vec<Option<FormatSpec>>,
}

impl Default for FormatResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatResolver {
    /// Creates a resolver knowing only the built-in formats
    pub fn new() -> Self {
        Self {
            formats: BUILTIN_FORMATS
                .iter()
                .map(|&c| FormatSpec::from_code(c))
                .collect(),
            appended: 0,
            xfs: Vec::new(),
            memo: Vec::new(),
        }
    }

    /// Defines a format from its pattern
    ///
    /// Without an explicit index (BIFF4 and earlier) formats are numbered in order of
    /// definition
    pub fn define(&mut self, index: Option<u16>, pattern: &[u16]) {
        let index = match index {
            Some(i) => usize::from(i),
            None => {
                self.appended += 1;
                self.appended - 1
            }
        };
        if index >= self.formats.len() {
            self.formats.resize(index + 1, FormatSpec::default());
        }
        self.formats[index] = classify_pattern(pattern);
    }

    /// Registers the next style record; `None` marks an undecodable one
    pub fn add_xf(&mut self, xf: Option<XfEntry>) {
        self.xfs.push(xf);
        self.memo.push(None);
    }

    /// The number of registered style records
    pub fn xf_count(&self) -> usize {
        self.xfs.len()
    }

    /// Returns the number format applying to cells of style `xf`
    ///
    /// Unknown styles are logged and get the general format. Inheritance follows parent
    /// links until a style defining its number format is met; a chain looping back or
    /// leaving the table falls back to the general format.
    pub fn resolve(&mut self, xf: u16) -> FormatSpec {
        let org = usize::from(xf);
        if let Some(Some(spec)) = self.memo.get(org) {
            return *spec;
        }
        if org >= self.xfs.len() {
            warn!("Strange XF index {} -- ignored", xf);
            return FormatSpec::default();
        }
        let mut cur = org;
        let mut spec = FormatSpec::default();
        for _ in 0..=self.xfs.len() {
            let entry = match self.xfs[cur] {
                Some(entry) => entry,
                None => {
                    warn!("Strange XF index {} -- ignored", cur);
                    return spec;
                }
            };
            if entry.format_present {
                if let Some(f) = self.formats.get(usize::from(entry.format)) {
                    spec = *f;
                }
                break;
            }
            if entry.is_style && cur == org {
                break;
            }
            let parent = usize::from(entry.parent);
            if parent == org || parent >= self.xfs.len() {
                break;
            }
            cur = parent;
        }
        self.memo[org] = Some(spec);
        spec
    }
}

/// Number of days between 1899-12-31 and the Unix epoch, adjusted by one for the
/// phantom 1900-02-29 of the 1900 date system
const UNIX_EPOCH_SERIAL: i64 = 25569;

/// Offset of the 1904 date system from the 1900 one
const DATE1904_OFFSET: i64 = 1462;

fn c_float(v: f64) -> Option<&'static str> {
    if v.is_nan() {
        Some("nan")
    } else if v == f64::INFINITY {
        Some("inf")
    } else if v == f64::NEG_INFINITY {
        Some("-inf")
    } else {
        None
    }
}

fn fixed(v: f64, decimals: usize) -> String {
    match c_float(v) {
        Some(s) => s.to_string(),
        None => format!("{:.*}", decimals, v),
    }
}

fn scientific(v: f64, decimals: usize) -> String {
    if let Some(s) = c_float(v) {
        return s.to_uppercase();
    }
    let s = format!("{:.*E}", decimals, v);
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or_default();
            format!(
                "{}E{}{:02}",
                mantissa,
                if exp < 0 { '-' } else { '+' },
                exp.unsigned_abs()
            )
        }
        None => s,
    }
}

/// Renders a date serial number
///
/// A date and time format whose value has no time part prints the date only
fn date_time(spec: FormatSpec, v: f64, date1904: bool) -> String {
    let days = v.trunc();
    let frac = v - days;
    let mut days = days as i64;
    if date1904 {
        days = days.saturating_add(DATE1904_OFFSET);
    } else if days <= 60 {
        days += 1;
    }
    days = days.saturating_sub(UNIX_EPOCH_SERIAL);
    let ts = days
        .checked_mul(86400)
        .and_then(|t| t.checked_add((frac * 86400.0) as i64));
    let dt = match ts.map(OffsetDateTime::from_unix_timestamp) {
        Some(Ok(dt)) => dt,
        _ => return "#BAD".to_string(),
    };
    let (date, time) = match spec.kind {
        FormatKind::Date => (true, false),
        FormatKind::Time => (false, true),
        _ if spec.arg == 0 && frac == 0.0 => (true, false),
        _ => (true, true),
    };
    let mut out = String::new();
    if date {
        out.push_str(&format!(
            "{:04}-{:02}-{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day()
        ));
        if !time {
            return out;
        }
        out.push(' ');
    }
    out.push_str(&format!(
        "{:2}:{:02}:{:02}",
        dt.hour(),
        dt.minute(),
        dt.second()
    ));
    out
}

/// Renders a number according to `spec`
///
/// Without a format the number is printed with six decimals
pub fn format_value(spec: Option<FormatSpec>, v: f64, date1904: bool) -> String {
    let spec = match spec {
        Some(spec) => spec,
        None => return fixed(v, 6),
    };
    match spec.kind {
        FormatKind::General if v.ceil() == v => fixed(v, 0),
        FormatKind::General => fixed(v, 6),
        FormatKind::Fixed => fixed(v, usize::from(spec.arg)),
        FormatKind::Scientific => scientific(v, usize::from(spec.arg)),
        FormatKind::Date | FormatKind::Time | FormatKind::DateTime => {
            date_time(spec, v, date1904)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn classify(pattern: &str) -> FormatSpec {
        classify_pattern(&pattern.encode_utf16().collect::<Vec<_>>())
    }

    fn xf(format: u16, style: bool, present: bool, parent: u16) -> Option<XfEntry> {
        Some(XfEntry {
            format,
            is_style: style,
            format_present: present,
            parent,
        })
    }

    #[test]
    fn builtins() {
        let r = FormatResolver::new();
        assert_eq!(r.formats.len(), 49);
        assert_eq!(r.formats[2], FormatSpec::new(FormatKind::Fixed, 2));
        assert_eq!(r.formats[11], FormatSpec::new(FormatKind::Scientific, 2));
        assert_eq!(r.formats[14], FormatSpec::new(FormatKind::Date, 0));
        assert_eq!(r.formats[22], FormatSpec::new(FormatKind::DateTime, 0));
        assert_eq!(r.formats[48], FormatSpec::new(FormatKind::Scientific, 1));
    }

    #[test]
    fn patterns() {
        use FormatKind::*;
        assert_eq!(classify("General"), FormatSpec::new(General, 0));
        assert_eq!(classify(""), FormatSpec::new(General, 0));
        assert_eq!(classify("@"), FormatSpec::new(General, 0));
        assert_eq!(classify("0"), FormatSpec::new(Fixed, 0));
        assert_eq!(classify("#,##0"), FormatSpec::new(Fixed, 0));
        assert_eq!(classify("0.00"), FormatSpec::new(Fixed, 2));
        assert_eq!(classify(".000"), FormatSpec::new(Fixed, 3));
        assert_eq!(classify("#,##0.0_);[Red](#,##0.0)"), FormatSpec::new(Fixed, 1));
        assert_eq!(classify("[Blue]0.000"), FormatSpec::new(Fixed, 3));
        assert_eq!(classify("\"$\"#,##0.00"), FormatSpec::new(Fixed, 2));
        assert_eq!(classify("$#,##0"), FormatSpec::new(Fixed, 0));
        assert_eq!(classify("0.00E+00"), FormatSpec::new(Scientific, 2));
        assert_eq!(classify("# ?/?"), FormatSpec::new(General, 0));
        assert_eq!(classify("YYYY-MM-DD"), FormatSpec::new(DateTime, 0));
        assert_eq!(classify("d-mmm-yy"), FormatSpec::new(DateTime, 0));
        assert_eq!(classify("mmm-yy"), FormatSpec::new(DateTime, 0));
        assert_eq!(classify("mm:ss"), FormatSpec::new(Time, 0));
        assert_eq!(classify("h:mm AM/PM"), FormatSpec::new(Time, 0));
        assert_eq!(classify("[h]:mm:ss"), FormatSpec::new(Time, 0));
        assert_eq!(classify("[$-409]d/m/yyyy"), FormatSpec::new(DateTime, 0));
        assert_eq!(classify("[Red"), FormatSpec::new(General, 0));
    }

    #[test]
    fn definitions() {
        let mut r = FormatResolver::new();
        let pattern: Vec<u16> = "0.000".encode_utf16().collect();
        r.define(Some(200), &pattern);
        assert_eq!(r.formats.len(), 201);
        assert_eq!(r.formats[100], FormatSpec::default());
        assert_eq!(r.formats[200], FormatSpec::new(FormatKind::Fixed, 3));

        let mut r = FormatResolver::new();
        r.define(None, &"General".encode_utf16().collect::<Vec<_>>());
        r.define(None, &pattern);
        assert_eq!(r.formats[0], FormatSpec::default());
        assert_eq!(r.formats[1], FormatSpec::new(FormatKind::Fixed, 3));
    }

    #[test]
    fn xf_decoding() {
        let mut p = [0u8; 20];
        p[2..4].copy_from_slice(&14u16.to_le_bytes());
        p[4..6].copy_from_slice(&(3u16 << 4).to_le_bytes());
        p[9] = 0x04;
        let e = XfEntry::decode(BiffVersion::Biff8, &p).unwrap();
        assert_eq!(
            (e.format, e.is_style, e.format_present, e.parent),
            (14, false, true, 3)
        );
        // A style: the used bit set means the format is not defined
        p[4] |= 4;
        let e = XfEntry::decode(BiffVersion::Biff8, &p).unwrap();
        assert!(e.is_style && !e.format_present);
        let e = XfEntry::decode(BiffVersion::Biff5, &p).unwrap();
        assert!(e.is_style && e.format_present);
        assert!(XfEntry::decode(BiffVersion::Biff8, &p[..8]).is_none());

        let p = [0u8, 2, 0, 4, 0x10, 0];
        let e = XfEntry::decode(BiffVersion::Biff3, &p).unwrap();
        assert_eq!((e.format, e.format_present, e.parent), (2, true, 1));
    }

    #[test]
    fn inheritance() {
        let mut r = FormatResolver::new();
        r.add_xf(xf(2, true, true, 0xfff));
        r.add_xf(xf(0, false, false, 0));
        r.add_xf(xf(11, false, false, 1));
        r.add_xf(xf(11, false, true, 0));
        assert_eq!(r.resolve(1), FormatSpec::new(FormatKind::Fixed, 2));
        assert_eq!(r.resolve(2), FormatSpec::new(FormatKind::Fixed, 2));
        assert_eq!(r.resolve(3), FormatSpec::new(FormatKind::Scientific, 2));
        assert_eq!(r.resolve(2), FormatSpec::new(FormatKind::Fixed, 2));
        // Out of range indexes degrade to the general format
        assert_eq!(r.resolve(99), FormatSpec::default());
    }

    #[test]
    fn cyclic_inheritance() {
        let mut r = FormatResolver::new();
        r.add_xf(xf(2, false, false, 2));
        r.add_xf(xf(2, false, false, 2));
        r.add_xf(xf(2, false, false, 1));
        r.add_xf(None);
        r.add_xf(xf(2, false, false, 3));
        r.add_xf(xf(2, true, false, 4));
        assert_eq!(r.resolve(0), FormatSpec::default());
        assert_eq!(r.resolve(1), FormatSpec::default());
        assert_eq!(r.resolve(4), FormatSpec::default());
        // A style without a format does not consult its parent
        assert_eq!(r.resolve(5), FormatSpec::default());
        assert_eq!(r.xf_count(), 6);
    }

    #[test]
    fn numbers() {
        let general = Some(FormatSpec::default());
        assert_eq!(format_value(general, 42.0, false), "42");
        assert_eq!(format_value(general, -3.0, false), "-3");
        assert_eq!(format_value(general, 0.5, false), "0.500000");
        assert_eq!(format_value(None, 42.0, false), "42.000000");
        let fixed = Some(FormatSpec::new(FormatKind::Fixed, 2));
        assert_eq!(format_value(fixed, 3.0, false), "3.00");
        assert_eq!(format_value(fixed, 2.345678, false), "2.35");
        let integer = Some(FormatSpec::new(FormatKind::Fixed, 0));
        assert_eq!(format_value(integer, 1234.75, false), "1235");
        let sci = Some(FormatSpec::new(FormatKind::Scientific, 2));
        assert_eq!(format_value(sci, 12345.0, false), "1.23E+04");
        assert_eq!(format_value(sci, 0.000123, false), "1.23E-04");
        assert_eq!(format_value(sci, 0.0, false), "0.00E+00");
        assert_eq!(format_value(general, f64::INFINITY, false), "inf");
        assert_eq!(format_value(general, f64::NAN, false), "nan");
    }

    #[test]
    fn dates() {
        let date = Some(FormatSpec::new(FormatKind::Date, 0));
        let time = Some(FormatSpec::new(FormatKind::Time, 0));
        let both = Some(FormatSpec::new(FormatKind::DateTime, 0));
        assert_eq!(format_value(date, 1.0, false), "1900-01-01");
        assert_eq!(format_value(date, 59.0, false), "1900-02-28");
        assert_eq!(format_value(date, 61.0, false), "1900-03-01");
        assert_eq!(format_value(date, 25569.0, false), "1970-01-01");
        assert_eq!(format_value(date, 45000.0, false), "2023-03-15");
        assert_eq!(format_value(date, 0.0, true), "1904-01-01");
        assert_eq!(format_value(date, 1.0, true), "1904-01-02");
        assert_eq!(format_value(time, 0.75, false), "18:00:00");
        assert_eq!(format_value(time, 0.25, false), " 6:00:00");
        assert_eq!(format_value(both, 45000.0, false), "2023-03-15");
        assert_eq!(format_value(both, 45000.5, false), "2023-03-15 12:00:00");
        assert_eq!(format_value(date, 1e300, false), "#BAD");
    }
}
