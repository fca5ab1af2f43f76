//! Minimal delimited-text codec (RFC 4180 quoting, configurable delimiter).
//!
//! Records are returned with the 1-based line number they start on and the
//! raw text they were parsed from, so rejected rows can be reported verbatim.

use std::borrow::Cow;
use std::iter::Peekable;
use std::str::Chars;

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Line on which the record starts (1-based).
    pub line: usize,
    pub fields: Vec<String>,
    /// The record's source text without its line terminator.
    pub raw: String,
}

impl Record {
    /// A line holding nothing but whitespace.
    pub fn is_blank(&self) -> bool {
        self.fields.iter().all(|f| f.trim().is_empty()) && self.raw.trim().is_empty()
    }
}

/// Decode raw bytes as UTF-8, replacing invalid sequences and dropping a BOM.
pub fn decode(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes)
}

/// Split `text` into records.
///
/// Quoted fields may contain the delimiter, doubled quotes and line breaks.
/// `\n`, `\r\n` and a lone `\r` all terminate a record. A final line without
/// a terminator is still returned.
pub fn parse(text: &str, delimiter: char) -> Vec<Record> {
    let mut parser = Parser {
        chars: text.chars().peekable(),
        delimiter,
        line: 1,
    };
    let mut records = Vec::new();
    while let Some(record) = parser.next_record() {
        records.push(record);
    }
    records
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    delimiter: char,
    line: usize,
}

impl Parser<'_> {
    fn next_record(&mut self) -> Option<Record> {
        self.chars.peek()?;

        let start = self.line;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut raw = String::new();
        let mut in_quotes = false;

        while let Some(c) = self.chars.next() {
            if in_quotes {
                raw.push(c);
                match c {
                    '"' if self.chars.peek() == Some(&'"') => {
                        self.chars.next();
                        raw.push('"');
                        field.push('"');
                    }
                    '"' => in_quotes = false,
                    '\n' => {
                        self.line += 1;
                        field.push(c);
                    }
                    _ => field.push(c),
                }
                continue;
            }

            match c {
                '\r' | '\n' => {
                    if c == '\r' && self.chars.peek() == Some(&'\n') {
                        self.chars.next();
                    }
                    self.line += 1;
                    fields.push(field);
                    return Some(Record {
                        line: start,
                        fields,
                        raw,
                    });
                }
                '"' if field.is_empty() => {
                    raw.push(c);
                    in_quotes = true;
                }
                c if c == self.delimiter => {
                    raw.push(c);
                    fields.push(std::mem::take(&mut field));
                }
                _ => {
                    raw.push(c);
                    field.push(c);
                }
            }
        }

        fields.push(field);
        Some(Record {
            line: start,
            fields,
            raw,
        })
    }
}

/// Append one record (with a trailing `\n`) to `out`, quoting fields that
/// contain the delimiter, a quote or a line break.
pub fn write_record<S: AsRef<str>>(out: &mut String, fields: &[S], delimiter: char) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        let field = field.as_ref();
        if field.contains(|c: char| c == delimiter || c == '"' || c == '\n' || c == '\r') {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

// ── Tests ─────────────────────────────────────────────────────────────────────
