//! Base-62 fractional indexing.
//!
//! Keys are strings over `0-9A-Za-z`, compared byte-wise. The charset is
//! lexicographically ordered (`'0' < '9' < 'A' < 'Z' < 'a' < 'z'`), so
//! comparing keys as plain strings orders them correctly.
//!
//! A valid key never ends with the minimum digit `'0'`. Without that rule
//! `"V"` and `"V0"` would be adjacent with nothing representable between
//! them; with it, every pair of distinct valid keys has a midpoint.

use crate::error::KeyError;

/// Base-62 charset for fractional indexing (0-9, A-Z, a-z).
pub const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const BASE: usize = 62;

/// Mid-alphabet digit (`'V'`), used to extend keys and as the first key.
const MID: usize = BASE / 2;

/// Value of a base-62 digit, or `None` outside the alphabet.
fn digit_value(c: u8) -> Option<usize> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as usize),
        b'A'..=b'Z' => Some((c - b'A') as usize + 10),
        b'a'..=b'z' => Some((c - b'a') as usize + 36),
        _ => None,
    }
}

/// Check that a key is usable: non-empty, base-62 only, no trailing `'0'`.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::InvalidKey {
            key: key.to_string(),
            reason: "empty key",
        });
    }
    if key.bytes().any(|b| digit_value(b).is_none()) {
        return Err(KeyError::InvalidKey {
            key: key.to_string(),
            reason: "character outside the base-62 alphabet",
        });
    }
    if key.ends_with('0') {
        return Err(KeyError::InvalidKey {
            key: key.to_string(),
            reason: "ends with the minimum digit",
        });
    }
    Ok(())
}

/// Boolean form of [`validate_key`].
pub fn is_valid_key(key: &str) -> bool {
    validate_key(key).is_ok()
}

/// Key for the first block of an empty collection.
pub fn initial_key() -> String {
    (BASE62[MID] as char).to_string()
}

/// A key strictly less than `key`.
pub fn key_before(key: &str) -> Result<String, KeyError> {
    let hi = range_digits(None, key)?;
    Ok(encode(&midpoint(&[], Some(&hi))))
}

/// A key strictly greater than `key`.
pub fn key_after(key: &str) -> Result<String, KeyError> {
    let lo = range_digits(Some(key), key)?;
    Ok(encode(&midpoint(&lo, None)))
}

/// A key strictly between `lo` and `hi`.
///
/// Never fails for valid `lo < hi`: when the two keys leave no free digit at
/// their first difference, the result grows by one symbol instead.
pub fn key_between(lo: &str, hi: &str) -> Result<String, KeyError> {
    let lo_digits = range_digits(Some(hi), lo)?;
    let hi_digits = range_digits(Some(lo), hi)?;
    if lo >= hi {
        return Err(KeyError::InvalidKeyRange {
            lo: Some(lo.to_string()),
            hi: Some(hi.to_string()),
            reason: "lower bound is not below upper bound",
        });
    }
    Ok(encode(&midpoint(&lo_digits, Some(&hi_digits))))
}

/// `n` short, evenly spaced, strictly increasing keys, all greater than
/// `bound` (or anywhere in the key space when `bound` is `None`).
///
/// Used to renumber a collection. All results share one prefix that sorts
/// above `bound`, followed by a fixed-width suffix; every key is therefore
/// greater than every key that was `<= bound`.
pub fn spaced_keys_after(bound: Option<&str>, n: usize) -> Result<Vec<String>, KeyError> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let head: Vec<usize> = match bound {
        None => Vec::new(),
        Some(b) => {
            let digits = range_digits(None, b)?;
            match digits.iter().position(|&d| d + 1 < BASE) {
                // Bump the first digit that has room; everything under the new
                // prefix sorts above `b`.
                Some(i) => {
                    let mut head = digits[..i].to_vec();
                    head.push(digits[i] + 1);
                    head
                }
                // All 'z': any extension of `b` sorts above it.
                None => {
                    let mut head = digits;
                    head.push(1);
                    head
                }
            }
        }
    };

    // Smallest width leaving at least two slots between neighbours.
    let slots = n as u128 + 1;
    let mut width = 1u32;
    let mut space = BASE as u128;
    while space < 2 * slots {
        width += 1;
        space *= BASE as u128;
    }
    let step = space / slots;

    let mut keys = Vec::with_capacity(n);
    for i in 1..=n as u128 {
        let mut digits = head.clone();
        digits.extend(fixed_width(i * step, width));
        while digits.last() == Some(&0) {
            digits.pop();
        }
        keys.push(encode(&digits));
    }
    Ok(keys)
}

/// Mean key length in symbols (0.0 for no keys).
pub fn average_len<'a>(keys: impl IntoIterator<Item = &'a str>) -> f64 {
    let (count, total) = keys
        .into_iter()
        .fold((0usize, 0usize), |(c, t), k| (c + 1, t + k.len()));
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

// ============================================================================
// Internals
// ============================================================================

/// Validate `key` and decode it, reporting failures as a range error.
fn range_digits(other: Option<&str>, key: &str) -> Result<Vec<usize>, KeyError> {
    validate_key(key).map_err(|e| KeyError::InvalidKeyRange {
        lo: Some(key.to_string()),
        hi: other.map(str::to_string),
        reason: e.reason(),
    })?;
    Ok(key.bytes().filter_map(digit_value).collect())
}

fn encode(digits: &[usize]) -> String {
    digits.iter().map(|&d| BASE62[d] as char).collect()
}

/// Big-endian base-62 digits of `value`, left-padded to `width`.
fn fixed_width(mut value: u128, width: u32) -> Vec<usize> {
    let mut out = vec![0usize; width as usize];
    for slot in out.iter_mut().rev() {
        *slot = (value % BASE as u128) as usize;
        value /= BASE as u128;
    }
    out
}

/// Digits strictly between `lo` and `hi` (`None` = +infinity).
///
/// Requires `lo < hi` and no trailing zero digits in either; the result has
/// no trailing zero either. Missing digits of `lo` read as 0.
fn midpoint(lo: &[usize], hi: Option<&[usize]>) -> Vec<usize> {
    if let Some(hi) = hi {
        // Shared prefix (lo padded with zeros) is copied through.
        let mut n = 0;
        while n < hi.len() && lo.get(n).copied().unwrap_or(0) == hi[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = hi[..n].to_vec();
            let rest = lo.get(n..).unwrap_or(&[]);
            out.extend(midpoint(rest, Some(&hi[n..])));
            return out;
        }
    }

    let dl = lo.first().copied().unwrap_or(0);
    let dh = hi.map(|h| h[0]).unwrap_or(BASE);

    if dh - dl > 1 {
        return vec![(dl + dh) / 2];
    }

    // Consecutive digits. A longer `hi` leaves room under its first digit.
    if let Some(hi) = hi {
        if hi.len() > 1 {
            return vec![hi[0]];
        }
    }

    let mut out = vec![dl];
    out.extend(midpoint(lo.get(1..).unwrap_or(&[]), None));
    out
}
