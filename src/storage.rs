use crate::error::Result;
use crate::types::Bundle;
use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Four-space pretty printing that keeps the output pure ASCII: anything
/// outside `' '..='~'` is written as `\uXXXX` (UTF-16 surrogate pairs above
/// the BMP), matching the bundles already committed under `data/`.
struct AsciiPrettyFormatter<'a> {
    inner: PrettyFormatter<'a>,
}

impl<'a> AsciiPrettyFormatter<'a> {
    fn new() -> Self {
        Self {
            inner: PrettyFormatter::with_indent(b"    "),
        }
    }
}

impl<'a> Formatter for AsciiPrettyFormatter<'a> {
    fn write_string_fragment<W: ?Sized + Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if (' '..='~').contains(&c) {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }

    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }
}

/// Canonical text form of a bundle: sorted keys, four-space indent, ASCII-only,
/// no trailing newline.
///
/// Key order comes from `serde_json::Map`, which is a `BTreeMap` as long as
/// nothing in the build enables serde_json's `preserve_order` feature.
pub fn to_canonical_string(bundle: &Bundle) -> Result<String> {
    let value = serde_json::to_value(bundle)?;
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, AsciiPrettyFormatter::new());
    value.serialize(&mut ser)?;
    // every byte written above is ASCII
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Write a bundle to `path`, replacing whatever is there
pub fn write_bundle(bundle: &Bundle, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let content = to_canonical_string(bundle)?;
    let mut writer = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?,
    );
    writer.write_all(content.as_bytes())?;
    writer.flush()?;
    info!(
        "Wrote {} objects to {} ({} bytes)",
        bundle.objects.len(),
        path.display(),
        content.len()
    );
    Ok(())
}
