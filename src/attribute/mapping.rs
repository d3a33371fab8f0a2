//! Flat form of an attribute tree.
//!
//! A tree is persisted as one full path per quark, in quark order. Segments
//! are joined with `/`; a `/` or `\` inside a segment is escaped with `\`.
//! On disk the paths form a section:
//!
//! ```text
//! magic: u32 = 0x06EC3671
//! size:  u32   (whole section, header included)
//! count: u32
//! count x { len: u8, path: [u8; len], 0u8 }
//! ```

use crate::error::{Result, StateSystemError};
use bytes::{Buf, BufMut, BytesMut};

pub const ATTRIBUTE_SECTION_MAGIC: u32 = 0x06EC_3671;
const SECTION_HEADER_LEN: usize = 12;

/// Escape one segment so it can be joined into a path.
pub fn escape_segment(segment: &str, out: &mut String) {
    for c in segment.chars() {
        if c == '/' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Join segments into an escaped path.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut path = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            path.push('/');
        }
        escape_segment(segment.as_ref(), &mut path);
    }
    path
}

/// Split an escaped path back into its segments.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '/' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Append the attribute section for `paths` to `buf`.
pub fn encode_section(paths: &[String], buf: &mut BytesMut) -> Result<()> {
    let size: usize = SECTION_HEADER_LEN + paths.iter().map(|p| p.len() + 2).sum::<usize>();
    let size = u32::try_from(size).map_err(|_| {
        StateSystemError::UnsupportedOperation("attribute section larger than 4 GiB")
    })?;

    buf.reserve(size as usize);
    buf.put_u32(ATTRIBUTE_SECTION_MAGIC);
    buf.put_u32(size);
    buf.put_u32(paths.len() as u32);
    for path in paths {
        let len = u8::try_from(path.len()).map_err(|_| {
            StateSystemError::UnsupportedOperation(
                "attribute paths longer than 255 bytes cannot be persisted",
            )
        })?;
        buf.put_u8(len);
        buf.put_slice(path.as_bytes());
        buf.put_u8(0);
    }
    Ok(())
}

/// Size recorded in a section header, read from its first bytes.
pub fn section_size(header: &[u8]) -> Result<usize> {
    if header.len() < SECTION_HEADER_LEN {
        return Err(corrupt("truncated attribute section header"));
    }
    let mut header = header;
    if header.get_u32() != ATTRIBUTE_SECTION_MAGIC {
        return Err(corrupt("bad attribute section magic"));
    }
    Ok(header.get_u32() as usize)
}

/// Decode a complete attribute section.
pub fn decode_section(section: &[u8]) -> Result<Vec<String>> {
    let size = section_size(section)?;
    if size != section.len() {
        return Err(corrupt(format!(
            "attribute section size {} does not match {} bytes read",
            size,
            section.len()
        )));
    }

    let mut buf = &section[8..];
    let count = buf.get_u32() as usize;
    let mut paths = Vec::with_capacity(count.min(buf.remaining()));
    for index in 0..count {
        if buf.remaining() < 1 {
            return Err(corrupt(format!("attribute entry {} truncated", index)));
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len + 1 {
            return Err(corrupt(format!("attribute entry {} truncated", index)));
        }
        let path = std::str::from_utf8(&buf[..len])
            .map_err(|_| corrupt(format!("attribute entry {} is not UTF-8", index)))?
            .to_string();
        buf.advance(len);
        if buf.get_u8() != 0 {
            return Err(corrupt(format!("attribute entry {} not terminated", index)));
        }
        paths.push(path);
    }

    if buf.has_remaining() {
        return Err(corrupt("trailing bytes after attribute entries"));
    }
    Ok(paths)
}

fn corrupt(message: impl Into<String>) -> StateSystemError {
    StateSystemError::CorruptPersistedState(message.into())
}
