//! Packed fixed-point decimal codec.
//!
//! MySQL stores `DECIMAL(precision, scale)` columns in a compact big-endian
//! format: the integer and fractional parts are split into groups of nine
//! decimal digits, each full group takes four bytes and a partial group takes
//! between one and four bytes. The sign is folded into the top bit of the first
//! byte and negative values have every byte inverted.
//!
//! This module converts between that packed form, the in-memory [`Decimal`]
//! (base 10^9 digit groups) and text.
//!
//! # Example
//!
//! ```rust
//! use binlog_capture::decimal::{bin2decimal, decimal2string, Decimal};
//!
//! // -12.34 as DECIMAL(4,2)
//! let packed = [0x73, 0xDD];
//! let mut value = Decimal::default();
//! bin2decimal(&packed, &mut value, 4, 2).unwrap();
//!
//! let mut text = String::new();
//! decimal2string(&value, &mut text, 64, 0, 0, b'0').unwrap();
//! assert_eq!(text, "-12.34");
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::DecimalError;

/// Decimal digits held by one digit group.
pub const DIG_PER_DEC1: usize = 9;

/// Base of one digit group.
pub const DIG_BASE: i32 = 1_000_000_000;

const DIG_MAX: i32 = DIG_BASE - 1;
const DIG_MASK: i32 = 100_000_000;

/// Largest precision a MySQL decimal column can declare.
pub const MAX_PRECISION: usize = 65;

/// Group capacity large enough for any column of [`MAX_PRECISION`] digits.
pub const DEFAULT_CAPACITY: usize = 9;

const POWERS10: [i32; DIG_PER_DEC1 + 1] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
];

const DIG2BYTES: [usize; DIG_PER_DEC1 + 1] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

const GROUP_BYTES: usize = 4;

fn round_up(digits: usize) -> usize {
    (digits + DIG_PER_DEC1 - 1) / DIG_PER_DEC1
}

/// A fixed-point decimal number made of base 10^9 digit groups.
///
/// `intg` and `frac` count decimal digits before and after the point. The
/// first `round_up(intg)` groups of `buf` hold the integer part (the first
/// one possibly partial), the following `round_up(frac)` groups hold the
/// fractional part, left aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal {
    pub intg: usize,
    pub frac: usize,
    pub sign: bool,
    buf: Vec<i32>,
}

impl Decimal {
    /// Creates a zero value able to hold `len` digit groups.
    pub fn with_capacity(len: usize) -> Self {
        let mut decimal = Self {
            intg: 1,
            frac: 0,
            sign: false,
            buf: vec![0; len.max(1)],
        };
        decimal.make_zero();
        decimal
    }

    /// Capacity in digit groups.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The digit groups currently in use.
    pub fn digits(&self) -> &[i32] {
        let used = (round_up(self.intg) + round_up(self.frac)).min(self.buf.len());
        &self.buf[..used]
    }

    /// Resets to the canonical zero: one integer digit, no fraction, positive.
    pub fn make_zero(&mut self) {
        self.buf.iter_mut().for_each(|group| *group = 0);
        self.intg = 1;
        self.frac = 0;
        self.sign = false;
    }

    pub fn is_zero(&self) -> bool {
        self.digits().iter().all(|&group| group == 0)
    }

    /// Decodes a packed column value using a default sized buffer.
    pub fn from_bin(from: &[u8], precision: usize, scale: usize) -> Result<Self, DecimalError> {
        let mut decimal = Self::default();
        bin2decimal(from, &mut decimal, precision, scale)?;
        Ok(decimal)
    }

    /// Encodes into a freshly allocated packed buffer.
    pub fn to_bin(&self, precision: usize, scale: usize) -> Result<Vec<u8>, DecimalError> {
        let mut out = vec![0u8; decimal_bin_size(precision, scale)];
        decimal2bin(self, &mut out, precision, scale)?;
        Ok(out)
    }
}

impl Default for Decimal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        let capacity = self.intg + self.frac + 3;
        decimal2string(self, &mut text, capacity, 0, 0, b'0').map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl FromStr for Decimal {
    type Err = DecimalError;

    /// Parses `[-+]digits[.digits]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (sign, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (unsigned, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DecimalError::BadNumber);
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(DecimalError::BadNumber);
        }

        let int_part = int_part.trim_start_matches('0');
        let intg = int_part.len();
        let frac = frac_part.len();

        let groups = round_up(intg) + round_up(frac);
        if groups > DEFAULT_CAPACITY {
            return Err(DecimalError::Overflow);
        }

        let mut decimal = Self::default();
        let mut idx = 0;

        // Integer groups are aligned on the point, so the first may be partial.
        let head = intg - (round_up(intg).saturating_sub(1)) * DIG_PER_DEC1;
        let mut rest = int_part;
        if intg > 0 {
            let (first, tail) = rest.split_at(head);
            decimal.buf[idx] = parse_group(first);
            idx += 1;
            rest = tail;
        }
        while !rest.is_empty() {
            let (group, tail) = rest.split_at(DIG_PER_DEC1);
            decimal.buf[idx] = parse_group(group);
            idx += 1;
            rest = tail;
        }

        let mut rest = frac_part;
        while !rest.is_empty() {
            let take = rest.len().min(DIG_PER_DEC1);
            let (group, tail) = rest.split_at(take);
            decimal.buf[idx] = parse_group(group) * POWERS10[DIG_PER_DEC1 - take];
            idx += 1;
            rest = tail;
        }

        decimal.intg = intg;
        decimal.frac = frac;
        decimal.sign = sign;

        if decimal.intg == 0 && decimal.frac == 0 {
            decimal.make_zero();
        } else if decimal.is_zero() {
            decimal.sign = false;
        }
        Ok(decimal)
    }
}

fn parse_group(digits: &str) -> i32 {
    digits
        .bytes()
        .fold(0i32, |acc, b| acc * 10 + i32::from(b - b'0'))
}

/// Number of bytes the packed form of `DECIMAL(precision, scale)` occupies.
pub fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    let intg = precision.saturating_sub(scale);
    let intg0 = intg / DIG_PER_DEC1;
    let frac0 = scale / DIG_PER_DEC1;
    let intg0x = intg - intg0 * DIG_PER_DEC1;
    let frac0x = scale - frac0 * DIG_PER_DEC1;

    intg0 * GROUP_BYTES + DIG2BYTES[intg0x] + frac0 * GROUP_BYTES + DIG2BYTES[frac0x]
}

/// Reads `bytes.len()` bytes as a big-endian unsigned integer and applies the
/// sign mask of the value.
fn read_group(bytes: &[u8], negative: bool) -> i64 {
    let raw = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let value = if negative {
        let width = (bytes.len() * 8) as u32;
        !raw & (u64::MAX >> (64 - width))
    } else {
        raw
    };
    value as i64
}

fn write_group(out: &mut [u8], value: u32, negative: bool) {
    let value = if negative { !value } else { value };
    let be = value.to_be_bytes();
    let width = out.len();
    out.copy_from_slice(&be[GROUP_BYTES - width..]);
}

/// Decodes the packed binary form of a `DECIMAL(precision, scale)` value.
///
/// The input is copied before decoding, so `from` is never modified. When
/// `to` cannot hold every group the value is clipped and `Overflow` (integer
/// digits lost) or `Truncated` (fraction digits lost) is returned; `to` still
/// holds the retained digits. Malformed groups yield `BadNumber` and leave
/// `to` as canonical zero.
pub fn bin2decimal(
    from: &[u8],
    to: &mut Decimal,
    precision: usize,
    scale: usize,
) -> Result<(), DecimalError> {
    let intg = precision.saturating_sub(scale);
    let mut intg0 = intg / DIG_PER_DEC1;
    let mut frac0 = scale / DIG_PER_DEC1;
    let mut intg0x = intg - intg0 * DIG_PER_DEC1;
    let mut frac0x = scale - frac0 * DIG_PER_DEC1;
    let mut intg1 = intg0 + usize::from(intg0x > 0);
    let mut frac1 = frac0 + usize::from(frac0x > 0);
    let bin_size = decimal_bin_size(precision, scale);

    if to.buf.is_empty() {
        return Err(DecimalError::OutOfMemory);
    }
    if from.len() < bin_size || bin_size == 0 {
        to.make_zero();
        return Err(DecimalError::BadNumber);
    }

    let mut copy = from[..bin_size].to_vec();
    let negative = copy[0] & 0x80 == 0;
    copy[0] ^= 0x80;

    let mut status = Ok(());
    let len = to.buf.len();
    if intg1 + frac1 > len {
        if intg1 > len {
            intg1 = len;
            frac1 = 0;
            status = Err(DecimalError::Overflow);
        } else {
            frac1 = len - intg1;
            status = Err(DecimalError::Truncated);
        }
    }

    let mut pos = 0usize;
    if status.is_err() {
        if intg1 < intg0 + usize::from(intg0x > 0) {
            pos += DIG2BYTES[intg0x] + GROUP_BYTES * (intg0 - intg1);
            frac0 = 0;
            frac0x = 0;
            intg0x = 0;
            intg0 = intg1;
        } else {
            frac0x = 0;
            frac0 = frac1;
        }
    }

    to.sign = negative;
    to.intg = intg0 * DIG_PER_DEC1 + intg0x;
    to.frac = frac0 * DIG_PER_DEC1 + frac0x;

    let mut idx = 0usize;

    if intg0x > 0 {
        let width = DIG2BYTES[intg0x];
        let x = read_group(&copy[pos..pos + width], negative);
        pos += width;
        if x >= i64::from(POWERS10[intg0x + 1]) {
            to.make_zero();
            return Err(DecimalError::BadNumber);
        }
        to.buf[idx] = x as i32;
        if idx > 0 || x != 0 {
            idx += 1;
        } else {
            to.intg -= intg0x;
        }
    }

    for _ in 0..intg0 {
        let x = read_group(&copy[pos..pos + GROUP_BYTES], negative);
        pos += GROUP_BYTES;
        if x > i64::from(DIG_MAX) {
            to.make_zero();
            return Err(DecimalError::BadNumber);
        }
        to.buf[idx] = x as i32;
        if idx > 0 || x != 0 {
            idx += 1;
        } else {
            to.intg -= DIG_PER_DEC1;
        }
    }

    for _ in 0..frac0 {
        let x = read_group(&copy[pos..pos + GROUP_BYTES], negative);
        pos += GROUP_BYTES;
        if x > i64::from(DIG_MAX) {
            to.make_zero();
            return Err(DecimalError::BadNumber);
        }
        to.buf[idx] = x as i32;
        idx += 1;
    }

    if frac0x > 0 {
        let width = DIG2BYTES[frac0x];
        let x = read_group(&copy[pos..pos + width], negative)
            * i64::from(POWERS10[DIG_PER_DEC1 - frac0x]);
        if x > i64::from(DIG_MAX) {
            to.make_zero();
            return Err(DecimalError::BadNumber);
        }
        to.buf[idx] = x as i32;
    }

    if to.intg == 0 && to.frac == 0 {
        to.make_zero();
    }
    status
}

/// Skips leading zero groups and leading zero digits of the integer part.
/// Returns the remaining groups and the count of significant integer digits.
fn remove_leading_zeroes(from: &Decimal) -> (&[i32], usize) {
    let mut intg = from.intg;
    let mut digits: &[i32] = &from.buf;
    if intg == 0 {
        return (digits, 0);
    }

    let mut step = (intg - 1) % DIG_PER_DEC1 + 1;
    while intg > 0 && digits.first() == Some(&0) {
        intg = intg.saturating_sub(step);
        step = DIG_PER_DEC1;
        digits = &digits[1..];
    }

    if intg > 0 {
        let first = digits.first().copied().unwrap_or(0);
        let mut i = (intg - 1) % DIG_PER_DEC1;
        while first < POWERS10[i] && intg > 0 {
            intg -= 1;
            if i == 0 {
                break;
            }
            i -= 1;
        }
    }
    (digits, intg)
}

/// Renders `from` as text into `to`.
///
/// `max_len` is the largest number of characters the caller accepts. When the
/// value does not fit, fraction digits are dropped first (`Truncated`), then
/// integer digits (`Overflow`). With a non-zero `fixed_precision` the output
/// has exactly that many digits, `fixed_decimals` of them after the point,
/// padded with `filler`.
pub fn decimal2string(
    from: &Decimal,
    to: &mut String,
    max_len: usize,
    fixed_precision: usize,
    fixed_decimals: usize,
    filler: u8,
) -> Result<(), DecimalError> {
    to.clear();
    let sign = usize::from(from.sign);
    if max_len < 2 + sign {
        return Err(DecimalError::Overflow);
    }

    const ZERO: [i32; 1] = [0];
    let (mut digits, mut intg) = remove_leading_zeroes(from);
    let mut frac = from.frac;
    if intg + frac == 0 {
        intg = 1;
        digits = &ZERO;
    }

    let fixed_intg = fixed_precision.saturating_sub(fixed_decimals);
    let mut intg_len = if fixed_precision > 0 { fixed_intg } else { intg };
    if intg_len == 0 {
        intg_len = 1;
    }
    let mut frac_len = if fixed_precision > 0 { fixed_decimals } else { frac };
    let mut len = sign + intg_len + usize::from(frac > 0) + frac_len;
    let mut status = Ok(());

    if fixed_precision > 0 {
        if frac > fixed_decimals {
            status = Err(DecimalError::Truncated);
            frac = fixed_decimals;
        }
        if intg > fixed_intg {
            status = Err(DecimalError::Overflow);
            intg = fixed_intg;
        }
        len = sign + intg_len + usize::from(frac > 0) + frac_len;
    } else if len > max_len {
        let mut j = len - max_len;
        status = if frac > 0 && j <= frac + 1 {
            Err(DecimalError::Truncated)
        } else {
            Err(DecimalError::Overflow)
        };
        if frac > 0 && j >= frac + 1 {
            j -= 1;
        }
        if j > frac {
            intg = intg.saturating_sub(j - frac);
            intg_len = intg;
            frac = 0;
        } else {
            frac -= j;
        }
        frac_len = frac;
        len = sign + intg_len + usize::from(frac > 0) + frac_len;
    }

    let group = |idx: usize| digits.get(idx).copied().unwrap_or(0);
    let mut out = vec![filler; len];
    let mut s = 0usize;
    if from.sign {
        out[0] = b'-';
        s = 1;
    }

    if frac > 0 {
        let mut s1 = s + intg_len;
        out[s1] = b'.';
        s1 += 1;
        let mut idx = round_up(intg);
        let mut remaining = frac;
        while remaining > 0 {
            let mut x = group(idx);
            idx += 1;
            for _ in 0..remaining.min(DIG_PER_DEC1) {
                let y = x / DIG_MASK;
                out[s1] = b'0' + y as u8;
                s1 += 1;
                x -= y * DIG_MASK;
                x *= 10;
            }
            remaining = remaining.saturating_sub(DIG_PER_DEC1);
        }
        // Remaining fraction positions already hold the filler.
    }

    let mut fill = intg_len.saturating_sub(intg);
    if intg == 0 {
        fill = fill.saturating_sub(1);
    }
    s += fill;

    if intg > 0 {
        let mut end = s + intg;
        let mut idx = round_up(intg);
        let mut remaining = intg;
        while remaining > 0 {
            idx -= 1;
            let mut x = group(idx);
            for _ in 0..remaining.min(DIG_PER_DEC1) {
                end -= 1;
                out[end] = b'0' + (x % 10) as u8;
                x /= 10;
            }
            remaining = remaining.saturating_sub(DIG_PER_DEC1);
        }
    } else {
        out[s] = b'0';
    }

    to.push_str(&String::from_utf8_lossy(&out));
    status
}

/// Encodes `from` into the packed binary form of `DECIMAL(precision, scale)`.
///
/// `to` must be at least [`decimal_bin_size`] bytes. Integer digits beyond
/// `precision - scale` are dropped from the top (`Overflow`); fraction digits
/// beyond `scale` are cut (`Truncated`). The buffer is filled in both cases.
pub fn decimal2bin(
    from: &Decimal,
    to: &mut [u8],
    precision: usize,
    scale: usize,
) -> Result<(), DecimalError> {
    let bin_size = decimal_bin_size(precision, scale);
    if bin_size == 0 || to.len() < bin_size {
        return Err(DecimalError::Overflow);
    }

    let intg = precision.saturating_sub(scale);
    let mut status = Ok(());

    // Expand into plain digits, most significant first.
    let (groups, from_intg) = remove_leading_zeroes(from);
    let mut int_digits = Vec::with_capacity(from_intg);
    let int_groups = round_up(from_intg);
    for i in 0..int_groups {
        let value = groups.get(i).copied().unwrap_or(0);
        let width = if i == 0 {
            from_intg - (int_groups - 1) * DIG_PER_DEC1
        } else {
            DIG_PER_DEC1
        };
        push_digits(&mut int_digits, value, width);
    }

    let mut frac_digits = Vec::with_capacity(from.frac);
    let mut remaining = from.frac;
    let mut idx = int_groups;
    while remaining > 0 {
        let value = groups.get(idx).copied().unwrap_or(0);
        let take = remaining.min(DIG_PER_DEC1);
        push_digits(&mut frac_digits, value / POWERS10[DIG_PER_DEC1 - take], take);
        remaining -= take;
        idx += 1;
    }

    if int_digits.len() > intg {
        status = Err(DecimalError::Overflow);
        int_digits.drain(..int_digits.len() - intg);
    }
    if frac_digits.len() > scale {
        if status.is_ok() {
            status = Err(DecimalError::Truncated);
        }
        frac_digits.truncate(scale);
    }

    let mut padded_int = vec![0u8; intg - int_digits.len()];
    padded_int.extend_from_slice(&int_digits);
    frac_digits.resize(scale, 0);

    let negative = from.sign
        && (padded_int.iter().any(|&d| d != 0) || frac_digits.iter().any(|&d| d != 0));

    let mut pos = 0usize;
    let intg0x = intg % DIG_PER_DEC1;
    let mut cursor: &[u8] = &padded_int;
    if intg0x > 0 {
        let width = DIG2BYTES[intg0x];
        write_group(&mut to[pos..pos + width], digits_value(&cursor[..intg0x]), negative);
        pos += width;
        cursor = &cursor[intg0x..];
    }
    for chunk in cursor.chunks(DIG_PER_DEC1) {
        write_group(&mut to[pos..pos + GROUP_BYTES], digits_value(chunk), negative);
        pos += GROUP_BYTES;
    }

    for chunk in frac_digits.chunks(DIG_PER_DEC1) {
        let width = if chunk.len() == DIG_PER_DEC1 {
            GROUP_BYTES
        } else {
            DIG2BYTES[chunk.len()]
        };
        write_group(&mut to[pos..pos + width], digits_value(chunk), negative);
        pos += width;
    }

    to[0] ^= 0x80;
    status
}

fn push_digits(out: &mut Vec<u8>, value: i32, width: usize) {
    let start = out.len();
    out.resize(start + width, 0);
    let mut value = value;
    for slot in out[start..].iter_mut().rev() {
        *slot = (value % 10) as u8;
        value /= 10;
    }
}

fn digits_value(digits: &[u8]) -> u32 {
    digits.iter().fold(0u32, |acc, &d| acc * 10 + u32::from(d))
}
