//! Minimal DER cursor for the keystore attestation extension.
//!
//! The extension payload is a vendor-defined ASN.1 structure, so this is
//! a small tag/length/value reader rather than a full X.509 stack; the
//! certificates themselves are handled by x509-parser. Definite lengths
//! only; indefinite lengths are not valid DER and fail closed.

use auditord_types::{AttestError, Result};

pub const CLASS_UNIVERSAL: u8 = 0;
pub const CLASS_CONTEXT: u8 = 2;

pub const TAG_BOOLEAN: u32 = 1;
pub const TAG_INTEGER: u32 = 2;
pub const TAG_OCTET_STRING: u32 = 4;
pub const TAG_ENUMERATED: u32 = 10;
pub const TAG_SEQUENCE: u32 = 16;

/// Decoded identifier + length octets of one TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerHeader {
    pub class: u8,
    pub constructed: bool,
    pub tag: u32,
    pub len: usize,
}

/// Forward-only cursor over a DER-encoded byte slice.
pub struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| truncated("identifier"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read one identifier + length header, leaving the cursor at the
    /// start of the content octets.
    pub fn read_header(&mut self) -> Result<DerHeader> {
        let first = self.read_byte()?;
        let class = first >> 6;
        let constructed = first & 0x20 != 0;

        let mut tag = u32::from(first & 0x1f);
        if tag == 0x1f {
            // High tag number: base-128 continuation bytes.
            tag = 0;
            loop {
                let byte = self.read_byte()?;
                tag = tag
                    .checked_mul(128)
                    .and_then(|t| t.checked_add(u32::from(byte & 0x7f)))
                    .ok_or_else(|| AttestError::Malformed("tag number overflow".into()))?;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }

        let first_len = self.read_byte()?;
        let len = if first_len & 0x80 == 0 {
            usize::from(first_len)
        } else {
            let count = usize::from(first_len & 0x7f);
            if count == 0 || count > 4 {
                return Err(AttestError::Malformed("unsupported DER length".into()));
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = len << 8 | usize::from(self.read_byte()?);
            }
            len
        };

        Ok(DerHeader { class, constructed, tag, len })
    }

    /// Consume `len` content octets.
    pub fn read_value(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| truncated("content"))?;
        let value = &self.data[self.pos..end];
        self.pos = end;
        Ok(value)
    }

    /// Read one complete TLV.
    pub fn read_tlv(&mut self) -> Result<(DerHeader, &'a [u8])> {
        let header = self.read_header()?;
        let value = self.read_value(header.len)?;
        Ok((header, value))
    }
}

fn truncated(what: &str) -> AttestError {
    AttestError::Malformed(format!("truncated DER {what}"))
}

/// Decode a non-negative INTEGER / ENUMERATED content into i64.
pub fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(AttestError::Malformed("bad DER integer width".into()));
    }
    if content[0] & 0x80 != 0 {
        return Err(AttestError::Malformed("negative DER integer".into()));
    }
    let mut value = 0i64;
    for &byte in content {
        value = value << 8 | i64::from(byte);
    }
    Ok(value)
}

/// Decode a BOOLEAN content octet.
pub fn decode_boolean(content: &[u8]) -> Result<bool> {
    match content {
        [0x00] => Ok(false),
        [_] => Ok(true),
        _ => Err(AttestError::Malformed("bad DER boolean".into())),
    }
}
