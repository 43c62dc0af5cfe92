//! Reporting of unused field numbers.

use std::io::Write;

use anyhow::Result;
use prost_reflect::{FileDescriptor, MessageDescriptor};

use crate::wire::MAX_TAG;

/// Prints one line per message (nested messages first) listing the field
/// numbers not taken by fields, reserved ranges, or extension ranges.
pub fn print_free_field_numbers(files: &[FileDescriptor], out: &mut dyn Write) -> Result<()> {
    for fd in files {
        for md in fd.messages() {
            print_message_free_fields(&md, out)?;
        }
    }
    Ok(())
}

fn print_message_free_fields(md: &MessageDescriptor, out: &mut dyn Write) -> Result<()> {
    for nested in md.child_messages() {
        print_message_free_fields(&nested, out)?;
    }

    write!(out, "{:<35} free:", md.full_name())?;
    for (start, end) in free_ranges(md) {
        if end == MAX_TAG {
            write!(out, " {start}-INF")?;
        } else if start == end {
            write!(out, " {start}")?;
        } else {
            write!(out, " {start}-{end}")?;
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Computes the complement of the used tag ranges, as inclusive pairs.
fn free_ranges(md: &MessageDescriptor) -> Vec<(i32, i32)> {
    let mut used: Vec<(i32, i32)> = Vec::new();
    for field in md.fields() {
        let number = field.number() as i32;
        used.push((number, number));
    }
    let proto = md.descriptor_proto();
    for range in &proto.reserved_range {
        // half-open in the descriptor, inclusive here
        used.push((range.start(), range.end() - 1));
    }
    for range in &proto.extension_range {
        used.push((range.start(), range.end() - 1));
    }
    used.sort_by_key(|r| r.0);

    let mut free = Vec::with_capacity(used.len() + 1);
    let mut last = 0i32;
    for (start, end) in used {
        if start > last + 1 {
            free.push((last + 1, start - 1));
        }
        last = last.max(end);
    }
    if last < MAX_TAG {
        free.push((last + 1, MAX_TAG));
    }
    free
}
