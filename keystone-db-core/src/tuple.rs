//! Order-preserving tuple encoding for primary keys.
//!
//! Packs a tuple of scalar elements into bytes such that the lexicographic
//! order of the packed forms equals the order of the tuples themselves. This
//! is the property every range operation in the store relies on: cursors,
//! subspace scans, and the built-range bookkeeping all compare raw bytes.
//!
//! ## Element layout
//!
//! | Element  | Tag           | Layout after tag                              |
//! |----------|---------------|-----------------------------------------------|
//! | `Null`   | `0x00`        | (nothing)                                     |
//! | `Bytes`  | `0x01`        | content, `0x00` escaped as `0x00 0xFF`, `0x00` |
//! | `String` | `0x02`        | UTF-8, same escaping and terminator           |
//! | `Int`    | `0x0C`–`0x1C` | big-endian magnitude, tag encodes sign+length |
//!
//! Integers use a biased tag: `0x14` is zero, `0x14 + n` a positive integer
//! of `n` magnitude bytes, `0x14 - n` a negative one stored as the offset
//! from the maximum `n`-byte value. More-negative values therefore sort
//! before less-negative ones byte-wise.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

const NULL_TAG: u8 = 0x00;
const BYTES_TAG: u8 = 0x01;
const STRING_TAG: u8 = 0x02;
const INT_ZERO_TAG: u8 = 0x14;
const ESCAPE: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// One element of a primary-key tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TupleValue {
    /// Absent component; sorts before everything else
    Null,
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 string
    String(String),
    /// Signed integer
    Int(i64),
}

impl From<i64> for TupleValue {
    fn from(v: i64) -> Self {
        TupleValue::Int(v)
    }
}

impl From<&str> for TupleValue {
    fn from(v: &str) -> Self {
        TupleValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for TupleValue {
    fn from(v: Vec<u8>) -> Self {
        TupleValue::Bytes(v)
    }
}

/// An ordered tuple of scalar elements, totally ordered by its packed form
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Tuple {
    elements: Vec<TupleValue>,
}

impl Tuple {
    /// Create an empty tuple
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tuple from elements
    pub fn from_elements(elements: impl IntoIterator<Item = TupleValue>) -> Self {
        Self {
            elements: elements.into_iter().collect(),
        }
    }

    /// Single-integer tuple, the common shape for subspace keys
    pub fn int(value: i64) -> Self {
        Self::from_elements([TupleValue::Int(value)])
    }

    /// Append an element
    pub fn push(&mut self, value: impl Into<TupleValue>) {
        self.elements.push(value.into());
    }

    /// Builder-style append
    pub fn with(mut self, value: impl Into<TupleValue>) -> Self {
        self.push(value);
        self
    }

    /// The elements of this tuple
    pub fn elements(&self) -> &[TupleValue] {
        &self.elements
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the tuple has no elements
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Concatenate two tuples
    pub fn concat(&self, other: &Tuple) -> Tuple {
        let mut elements = self.elements.clone();
        elements.extend(other.elements.iter().cloned());
        Tuple { elements }
    }

    /// Pack into the order-preserving byte form
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for element in &self.elements {
            pack_value(element, &mut out);
        }
        out
    }

    /// Decode a packed tuple, consuming the whole input
    pub fn unpack(bytes: &[u8]) -> Result<Tuple> {
        let mut elements = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (value, next) = unpack_value(bytes, pos)?;
            elements.push(value);
            pos = next;
        }
        Ok(Tuple { elements })
    }
}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pack().cmp(&other.pack())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match e {
                TupleValue::Null => write!(f, "null")?,
                TupleValue::Bytes(b) => write!(f, "b[{}]", b.len())?,
                TupleValue::String(s) => write!(f, "{s:?}")?,
                TupleValue::Int(n) => write!(f, "{n}")?,
            }
        }
        write!(f, ")")
    }
}

fn pack_value(value: &TupleValue, out: &mut Vec<u8>) {
    match value {
        TupleValue::Null => out.push(NULL_TAG),
        TupleValue::Bytes(b) => {
            out.push(BYTES_TAG);
            pack_escaped(b, out);
        }
        TupleValue::String(s) => {
            out.push(STRING_TAG);
            pack_escaped(s.as_bytes(), out);
        }
        TupleValue::Int(n) => pack_int(*n, out),
    }
}

fn pack_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(ESCAPE);
        }
    }
    out.push(TERMINATOR);
}

fn magnitude_len(mut v: u64) -> u8 {
    let mut len = 0;
    while v > 0 {
        len += 1;
        v >>= 8;
    }
    len
}

fn pack_int(n: i64, out: &mut Vec<u8>) {
    match n.cmp(&0) {
        Ordering::Equal => out.push(INT_ZERO_TAG),
        Ordering::Greater => {
            let len = magnitude_len(n as u64);
            out.push(INT_ZERO_TAG + len);
            out.extend_from_slice(&(n as u64).to_be_bytes()[8 - len as usize..]);
        }
        Ordering::Less => {
            let magnitude = n.unsigned_abs();
            let len = magnitude_len(magnitude);
            let max = if len == 8 {
                u64::MAX
            } else {
                (1u64 << (8 * len)) - 1
            };
            out.push(INT_ZERO_TAG - len);
            out.extend_from_slice(&(max - magnitude).to_be_bytes()[8 - len as usize..]);
        }
    }
}

fn unpack_escaped(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut content = Vec::new();
    while pos < bytes.len() {
        if bytes[pos] == TERMINATOR {
            if pos + 1 < bytes.len() && bytes[pos + 1] == ESCAPE {
                content.push(0x00);
                pos += 2;
            } else {
                return Ok((content, pos + 1));
            }
        } else {
            content.push(bytes[pos]);
            pos += 1;
        }
    }
    Err(Error::invalid_tuple("unterminated byte element"))
}

fn unpack_value(bytes: &[u8], pos: usize) -> Result<(TupleValue, usize)> {
    let tag = bytes[pos];
    match tag {
        NULL_TAG => Ok((TupleValue::Null, pos + 1)),
        BYTES_TAG => {
            let (content, next) = unpack_escaped(bytes, pos + 1)?;
            Ok((TupleValue::Bytes(content), next))
        }
        STRING_TAG => {
            let (content, next) = unpack_escaped(bytes, pos + 1)?;
            let s = String::from_utf8(content)
                .map_err(|_| Error::invalid_tuple("invalid UTF-8 in string element"))?;
            Ok((TupleValue::String(s), next))
        }
        0x0C..=0x1C => {
            let (n, next) = unpack_int(bytes, pos)?;
            Ok((TupleValue::Int(n), next))
        }
        other => Err(Error::invalid_tuple(format!(
            "unknown element tag 0x{other:02x}"
        ))),
    }
}

fn unpack_int(bytes: &[u8], pos: usize) -> Result<(i64, usize)> {
    let tag = bytes[pos];
    if tag == INT_ZERO_TAG {
        return Ok((0, pos + 1));
    }
    let negative = tag < INT_ZERO_TAG;
    let len = if negative {
        (INT_ZERO_TAG - tag) as usize
    } else {
        (tag - INT_ZERO_TAG) as usize
    };
    let end = pos + 1 + len;
    if end > bytes.len() {
        return Err(Error::invalid_tuple("truncated integer element"));
    }
    let mut raw = [0u8; 8];
    raw[8 - len..].copy_from_slice(&bytes[pos + 1..end]);
    let raw = u64::from_be_bytes(raw);
    if negative {
        let max = if len == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * len)) - 1
        };
        let magnitude = max - raw;
        if magnitude > (i64::MAX as u64) + 1 {
            return Err(Error::invalid_tuple("negative integer out of range"));
        }
        Ok(((magnitude as i128).wrapping_neg() as i64, end))
    } else {
        if raw > i64::MAX as u64 {
            return Err(Error::invalid_tuple("integer out of range"));
        }
        Ok((raw as i64, end))
    }
}

// ============================================================================
// Tuple ranges
// ============================================================================

/// Whether a range bound includes its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// The endpoint (and anything extending it) is inside the range
    Inclusive,
    /// The endpoint (and anything extending it) is outside the range
    Exclusive,
}

/// A (possibly unbounded) interval of tuples.
///
/// `None` bounds mean unbounded on that side. Inclusive bounds cover the
/// endpoint tuple and every tuple extending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleRange {
    /// Lower bound, `None` for unbounded below
    pub low: Option<Tuple>,
    /// Upper bound, `None` for unbounded above
    pub high: Option<Tuple>,
    /// How the lower bound treats its endpoint
    pub low_endpoint: EndpointType,
    /// How the upper bound treats its endpoint
    pub high_endpoint: EndpointType,
}

/// Sentinel byte for "unbounded below" in raw bound form
pub const BOUND_MIN: u8 = 0x00;
/// Sentinel byte for "unbounded above" in raw bound form
pub const BOUND_MAX: u8 = 0xFF;

impl TupleRange {
    /// The whole key space
    pub fn all() -> Self {
        Self::between(None, None)
    }

    /// `[low, high)` with an inclusive low and exclusive high
    pub fn between(low: Option<Tuple>, high: Option<Tuple>) -> Self {
        TupleRange {
            low,
            high,
            low_endpoint: EndpointType::Inclusive,
            high_endpoint: EndpointType::Exclusive,
        }
    }

    /// Both endpoints inclusive
    pub fn between_inclusive(low: Option<Tuple>, high: Option<Tuple>) -> Self {
        TupleRange {
            low,
            high,
            low_endpoint: EndpointType::Inclusive,
            high_endpoint: EndpointType::Inclusive,
        }
    }

    /// Whether this range covers the whole key space
    pub fn is_all(&self) -> bool {
        self.low.is_none() && self.high.is_none()
    }

    /// Raw byte bounds of the range, with `0x00` / `0xFF` sentinels for the
    /// unbounded sides. Lexicographic comparison of these bounds matches the
    /// tuple order, which is what lets range bookkeeping work on raw bytes.
    ///
    /// A bound that must step past a tuple and all of its extensions (an
    /// inclusive high, an exclusive low) uses [`prefix_successor`], which for
    /// packed tuples is itself a packed tuple, so such bounds stay decodable.
    pub fn bound_bytes(&self) -> (Vec<u8>, Vec<u8>) {
        let low = match &self.low {
            None => vec![BOUND_MIN],
            Some(t) => {
                let b = t.pack();
                if self.low_endpoint == EndpointType::Exclusive {
                    prefix_successor(&b)
                } else {
                    b
                }
            }
        };
        let high = match &self.high {
            None => vec![BOUND_MAX],
            Some(t) => {
                let b = t.pack();
                if self.high_endpoint == EndpointType::Inclusive {
                    prefix_successor(&b)
                } else {
                    b
                }
            }
        };
        (low, high)
    }

    /// Absolute `[begin, end)` key range under a subspace prefix
    pub fn to_key_range(&self, prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let (low, high) = self.bound_bytes();
        let mut begin = Vec::with_capacity(prefix.len() + low.len());
        begin.extend_from_slice(prefix);
        begin.extend_from_slice(&low);
        let mut end = Vec::with_capacity(prefix.len() + high.len());
        end.extend_from_slice(prefix);
        end.extend_from_slice(&high);
        (begin, end)
    }
}

/// The immediate successor of a key in raw byte order
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}

/// The first key after every key prefixed by `key`: truncate trailing
/// `0xFF` bytes and increment the last remaining byte
pub fn prefix_successor(key: &[u8]) -> Vec<u8> {
    match key.iter().rposition(|&b| b != 0xFF) {
        Some(i) => {
            let mut next = key[..=i].to_vec();
            next[i] += 1;
            next
        }
        // All-0xFF keys have no successor; saturate at the top of the space.
        None => vec![BOUND_MAX],
    }
}
