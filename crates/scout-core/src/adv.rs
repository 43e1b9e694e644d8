//! # Advertising Data Decoding
//!
//! BLE advertising payloads are a flat sequence of AD structures:
//!
//! ```text
//! ┌────────┬────────┬──────────────────────┐
//! │ length │  type  │  data (length-1 B)   │  repeated until end of payload
//! └────────┴────────┴──────────────────────┘
//! ```
//!
//! The bridge only cares about a handful of AD types: the device's local
//! name (complete 0x09, shortened 0x08) and the service class UUID lists
//! (16-bit 0x02/0x03, 128-bit 0x06/0x07) used for advertisement filtering.
//!
//! The walk is strict: a length byte that overruns the payload or a
//! zero-length structure is a [`CoreError`], never a silent truncation.

use crate::error::{CoreError, CoreResult};

// =============================================================================
// AD Type Constants
// =============================================================================

/// Shortened Local Name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;

/// Complete Local Name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Incomplete List of 16-bit Service Class UUIDs.
const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;
/// Complete List of 16-bit Service Class UUIDs.
const AD_TYPE_COMPLETE_UUID16: u8 = 0x03;
/// Incomplete List of 128-bit Service Class UUIDs.
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
/// Complete List of 128-bit Service Class UUIDs.
const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;

// =============================================================================
// AD Structure Iterator
// =============================================================================

/// One decoded AD structure, borrowing from the raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdField<'a> {
    /// AD type byte.
    pub ad_type: u8,

    /// Field data, excluding the length and type bytes.
    pub data: &'a [u8],
}

/// Iterator over the AD structures of a raw advertising payload.
///
/// Yields `Err` once on the first malformed structure and then stops.
pub struct AdFieldIter<'a> {
    payload: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> AdFieldIter<'a> {
    /// Creates an iterator over `payload`.
    pub fn new(payload: &'a [u8]) -> Self {
        AdFieldIter {
            payload,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for AdFieldIter<'a> {
    type Item = CoreResult<AdField<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.payload.len() {
            return None;
        }

        let offset = self.offset;
        let field_len = self.payload[offset] as usize;

        if field_len == 0 {
            self.failed = true;
            return Some(Err(CoreError::EmptyField { offset }));
        }

        // field_len counts the type byte plus the data bytes
        let end = offset + 1 + field_len;
        if end > self.payload.len() {
            self.failed = true;
            return Some(Err(CoreError::TruncatedField {
                offset,
                claimed: field_len,
                available: self.payload.len() - offset - 1,
            }));
        }

        let ad_type = self.payload[offset + 1];
        let data = &self.payload[offset + 2..end];
        self.offset = end;

        Some(Ok(AdField { ad_type, data }))
    }
}

// =============================================================================
// Local Name Extraction
// =============================================================================

/// Local names found in an advertising payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNames {
    /// Complete Local Name (AD type 0x09), if present.
    pub complete: Option<String>,

    /// Shortened Local Name (AD type 0x08), if present.
    pub short: Option<String>,
}

impl LocalNames {
    /// Returns the best available name: complete if present, else shortened.
    pub fn best(&self) -> Option<&str> {
        self.complete.as_deref().or(self.short.as_deref())
    }
}

/// Extracts the complete and shortened local names from a raw payload.
///
/// A payload may carry both; later occurrences of the same AD type win,
/// matching a linear walk of the structures. Names that are not valid
/// UTF-8 are rejected rather than lossily converted.
pub fn parse_local_names(payload: &[u8]) -> CoreResult<LocalNames> {
    let mut names = LocalNames::default();

    for field in AdFieldIter::new(payload) {
        let field = field?;
        match field.ad_type {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                names.complete = Some(decode_name(field.data)?);
            }
            AD_TYPE_SHORT_LOCAL_NAME => {
                names.short = Some(decode_name(field.data)?);
            }
            _ => {}
        }
    }

    Ok(names)
}

fn decode_name(data: &[u8]) -> CoreResult<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| CoreError::InvalidName)
}

// =============================================================================
// Service UUID Search
// =============================================================================

/// Searches the service class UUID lists of a payload for `uuid`.
///
/// `uuid` must be 2 bytes (16-bit) or 16 bytes (128-bit), in the same byte
/// order the advertisement carries. Returns `Ok(true)` if any list entry
/// matches.
pub fn find_service_uuid(payload: &[u8], uuid: &[u8]) -> CoreResult<bool> {
    let (incomplete_list, complete_list) = match uuid.len() {
        2 => (AD_TYPE_INCOMPLETE_UUID16, AD_TYPE_COMPLETE_UUID16),
        16 => (AD_TYPE_INCOMPLETE_UUID128, AD_TYPE_COMPLETE_UUID128),
        other => return Err(CoreError::InvalidUuidLength(other)),
    };

    for field in AdFieldIter::new(payload) {
        let field = field?;
        if field.ad_type != incomplete_list && field.ad_type != complete_list {
            continue;
        }
        if field.data.chunks_exact(uuid.len()).any(|entry| entry == uuid) {
            return Ok(true);
        }
    }

    Ok(false)
}

// =============================================================================
// Tests
// =============================================================================
