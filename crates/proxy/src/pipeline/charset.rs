use std::str;
use std::sync::LazyLock;

use mime::Mime;
use regex::bytes::Regex;

use crate::error::BoxError;

/// Character sets text filters can work with.
///
/// Single byte charsets map every byte to the code point of the same value, so a line
/// that no filter changed re-encodes to exactly the bytes it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Latin1,
    Windows1252,
}

/// Code points of windows-1252 bytes 0x80 to 0x9F. The five bytes the code page leaves
/// undefined keep the C1 control of the same value, so every byte still decodes.
const WINDOWS_1252_HIGH: [char; 32] = [
    '\u{20ac}', '\u{81}', '\u{201a}', '\u{192}', '\u{201e}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{2c6}', '\u{2030}', '\u{160}', '\u{2039}', '\u{152}', '\u{8d}', '\u{17d}', '\u{8f}',
    '\u{90}', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{2dc}', '\u{2122}', '\u{161}', '\u{203a}', '\u{153}', '\u{9d}', '\u{17e}', '\u{178}',
];

impl Charset {
    /// Looks up a charset label as found in a Content-Type parameter or a markup header.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches(|c| c == '"' || c == '\'');
        match label.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "l1" | "us-ascii" | "ascii" => Some(Charset::Latin1),
            "windows-1252" | "cp1252" | "x-cp1252" => Some(Charset::Windows1252),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Latin1 => "iso-8859-1",
            Charset::Windows1252 => "windows-1252",
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, BoxError> {
        match self {
            Charset::Utf8 => Ok(str::from_utf8(bytes)?.to_string()),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Charset::Windows1252 => Ok(bytes
                .iter()
                .map(|&b| match b {
                    0x80..=0x9f => WINDOWS_1252_HIGH[usize::from(b - 0x80)],
                    _ => char::from(b),
                })
                .collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, BoxError> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => text.chars().map(|c| latin1_byte(c).ok_or_else(|| unrepresentable(c, self))).collect(),
            Charset::Windows1252 => text.chars().map(|c| windows_1252_byte(c).ok_or_else(|| unrepresentable(c, self))).collect(),
        }
    }
}

fn latin1_byte(c: char) -> Option<u8> {
    u8::try_from(u32::from(c)).ok()
}

fn windows_1252_byte(c: char) -> Option<u8> {
    if let Some(index) = WINDOWS_1252_HIGH.iter().position(|&high| high == c) {
        return u8::try_from(0x80 + index).ok();
    }
    latin1_byte(c).filter(|b| !(0x80..=0x9f).contains(b))
}

fn unrepresentable(c: char, charset: Charset) -> BoxError {
    format!("{c:?} is not representable in {}", charset.name()).into()
}

/// Returns true for media types that can declare their charset in their content.
pub fn is_markup(mime: &Mime) -> bool {
    let subtype = mime.subtype();
    subtype == mime::HTML || subtype == mime::XML || mime.suffix() == Some(mime::XML)
}

static DECLARATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i-u)(?:charset|encoding)\s*=\s*["']?([A-Za-z0-9._:\-]+)"#).expect("charset declaration pattern is valid"));

/// Finds a charset declared in the first block of a markup body, for example
/// `<meta charset="utf-8">` or `<?xml version="1.0" encoding="ISO-8859-1"?>`.
pub fn sniff(block: &[u8]) -> Option<&str> {
    DECLARATION.captures(block).and_then(|captures| captures.get(1)).and_then(|label| str::from_utf8(label.as_bytes()).ok())
}
