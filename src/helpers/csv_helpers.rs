use memchr::{memchr, memchr_iter};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Returns the line starting at `offset` (without its terminator) and the
/// offset of the following line, or `None` at end of input.
pub fn next_line(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    if offset >= data.len() {
        return None;
    }
    let rest = &data[offset..];
    let (line, next) = match memchr(b'\n', rest) {
        Some(pos) => (&rest[..pos], offset + pos + 1),
        None => (rest, data.len()),
    };
    Some((trim_cr(line), next))
}

pub fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

pub fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM).unwrap_or(data)
}

pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Splits a line on commas into `fields`, reusing its allocation. A single
/// pair of surrounding double quotes is removed from each field.
pub fn split_fields<'a>(line: &'a [u8], fields: &mut Vec<&'a [u8]>) {
    fields.clear();
    let mut field_start = 0;
    for comma_pos in memchr_iter(b',', line) {
        fields.push(unquote(&line[field_start..comma_pos]));
        field_start = comma_pos + 1;
    }
    fields.push(unquote(&line[field_start..]));
}

fn unquote(field: &[u8]) -> &[u8] {
    field
        .strip_prefix(b"\"")
        .and_then(|f| f.strip_suffix(b"\""))
        .unwrap_or(field)
}

/// Skips up to `rows` non-blank lines starting at `offset`.
///
/// Returns the offset after the last skipped row, the number of physical lines
/// consumed and the number of rows actually skipped.
pub fn skip_rows(data: &[u8], mut offset: usize, rows: usize) -> (usize, u64, usize) {
    let mut lines = 0u64;
    let mut skipped = 0;
    while skipped < rows {
        let Some((line, next)) = next_line(data, offset) else {
            break;
        };
        offset = next;
        lines += 1;
        if !is_blank(line) {
            skipped += 1;
        }
    }
    (offset, lines, skipped)
}

/// True if any non-blank line remains at or after `offset`.
pub fn has_rows_after(data: &[u8], offset: usize) -> bool {
    data.get(offset..)
        .is_some_and(|rest| !rest.iter().all(u8::is_ascii_whitespace))
}
