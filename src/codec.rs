//! stdin/stdout adapters for message encoding and decoding.
//!
//! `--encode` and `--decode` lean on prost-reflect's dynamic messages and
//! text format; `--decode_raw` walks the wire format directly with no schema
//! at all, guessing at the shape of length-delimited values.

use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use prost::Message;
use prost_reflect::text_format::FormatOptions;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};

use crate::wire::{self, CodedReader, WireType};

fn find_message(pool: &DescriptorPool, type_name: &str) -> Result<MessageDescriptor> {
    pool.get_message_by_name(type_name)
        .ok_or_else(|| anyhow!("type not defined: {type_name}"))
}

/// Reads a text-format message of the given type from `input` and writes
/// its binary encoding to `output`.
pub fn encode_message(
    pool: &DescriptorPool,
    type_name: &str,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    let desc = find_message(pool, type_name)?;

    let mut text = String::new();
    input
        .read_to_string(&mut text)
        .context("failed to read input")?;
    let message = DynamicMessage::parse_text_format(desc, &text)
        .map_err(|err| anyhow!("failed to parse input: {err}"))?;
    output
        .write_all(&message.encode_to_vec())
        .context("failed to write encoded message")?;
    Ok(())
}

/// Reads a binary message of the given type from `input` and writes its
/// indented text form to `output`.
pub fn decode_message(
    pool: &DescriptorPool,
    type_name: &str,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    let desc = find_message(pool, type_name)?;

    let mut bytes = Vec::new();
    input
        .read_to_end(&mut bytes)
        .context("failed to read input")?;
    let message = DynamicMessage::decode(desc, bytes.as_slice())
        .map_err(|err| anyhow!("failed to parse input: {err}"))?;
    let mut text = message.to_text_format_with_options(&FormatOptions::new().pretty(true));
    if !text.ends_with('\n') {
        text.push('\n');
    }
    output
        .write_all(text.as_bytes())
        .context("failed to write decoded message")?;
    Ok(())
}

/// Reads an arbitrary binary message from `input` and writes its raw
/// tag/value pairs to `output`.
pub fn decode_raw(input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
    let mut data = Vec::new();
    input
        .read_to_end(&mut data)
        .context("failed to read input")?;
    decode_raw_message(&mut CodedReader::new(&data), output, "", false)
}

fn decode_raw_message(
    reader: &mut CodedReader,
    out: &mut dyn Write,
    indent: &str,
    in_group: bool,
) -> Result<()> {
    loop {
        if reader.eof() {
            if in_group {
                bail!("unexpected EOF");
            }
            return Ok(());
        }
        let (tag, wire_type) = reader.decode_tag_and_wire_type()?;
        if wire_type == WireType::EndGroup {
            if in_group {
                return Ok(());
            }
            bail!("input contains unexpected 'end group' wire type");
        }
        if wire::is_illegal_tag(tag) {
            bail!("input contains illegal tag number: {tag}");
        }
        match wire_type {
            WireType::Varint => {
                let v = reader.decode_varint()?;
                writeln!(out, "{indent}{tag}: {v}")?;
            }
            WireType::Fixed32 => {
                let v = f32::from_bits(reader.decode_fixed32()?);
                writeln!(out, "{indent}{tag}: {v:.6}")?;
            }
            WireType::Fixed64 => {
                let v = f64::from_bits(reader.decode_fixed64()?);
                writeln!(out, "{indent}{tag}: {v:.6}")?;
            }
            WireType::LengthDelimited => {
                let bytes = reader.decode_raw_bytes()?;
                if wire::is_probably_message(bytes) {
                    writeln!(out, "{indent}{tag}: <")?;
                    let nested_indent = format!("{indent}  ");
                    decode_raw_message(&mut CodedReader::new(bytes), out, &nested_indent, false)?;
                    writeln!(out, "{indent}>")?;
                } else if wire::is_probably_string(bytes) {
                    writeln!(out, "{indent}{tag}: {}", quote_string(bytes))?;
                } else {
                    writeln!(out, "{indent}{tag}: {}", quote_bytes(bytes))?;
                }
            }
            WireType::StartGroup => {
                writeln!(out, "{indent}{tag} {{")?;
                let nested_indent = format!("{indent}  ");
                decode_raw_message(reader, out, &nested_indent, true)?;
                writeln!(out, "{indent}}}")?;
            }
            WireType::EndGroup => unreachable!(),
        }
    }
}

fn quote_string(s: &[u8]) -> String {
    let mut buf = String::with_capacity(s.len() + 2);
    buf.push('"');
    // escape byte by byte; apostrophes pass through unescaped
    for &c in s {
        match c {
            b'\n' => buf.push_str("\\n"),
            b'\r' => buf.push_str("\\r"),
            b'\t' => buf.push_str("\\t"),
            b'"' => buf.push_str("\\\""),
            b'\\' => buf.push_str("\\\\"),
            0x20..=0x7e => buf.push(c as char),
            _ => buf.push_str(&format!("\\{c:03o}")),
        }
    }
    buf.push('"');
    buf
}

fn quote_bytes(b: &[u8]) -> String {
    let mut buf = String::with_capacity(b.len() * 4 + 2);
    buf.push('"');
    for &c in b {
        buf.push_str(&format!("\\{c:03o}"));
    }
    buf.push('"');
    buf
}
