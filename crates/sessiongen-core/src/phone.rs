//! International phone number normalization
//!
//! Numbers are accepted in any punctuation, reduced to digits and checked
//! against E.164: a known country calling code followed by a national number
//! of plausible length, at most 15 digits in total. The normalized form is
//! digits only, without the leading `+`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Shortest number accepted, country code included
const MIN_DIGITS: usize = 8;
/// E.164 maximum
const MAX_DIGITS: usize = 15;

const SINGLE_DIGIT_CODES: &[u16] = &[1, 7];

const TWO_DIGIT_CODES: &[u16] = &[
    20, 27, 30, 31, 32, 33, 34, 36, 39, 40, 41, 43, 44, 45, 46, 47, 48, 49, 51, 52, 53, 54, 55,
    56, 57, 58, 60, 61, 62, 63, 64, 65, 66, 81, 82, 84, 86, 90, 91, 92, 93, 94, 95, 98,
];

const THREE_DIGIT_RANGES: &[(u16, u16)] = &[
    (211, 213),
    (216, 216),
    (218, 218),
    (220, 258),
    (260, 269),
    (290, 291),
    (297, 299),
    (350, 359),
    (370, 383),
    (385, 387),
    (389, 389),
    (420, 421),
    (423, 423),
    (500, 509),
    (590, 599),
    (670, 670),
    (672, 692),
    (850, 850),
    (852, 853),
    (855, 856),
    (880, 880),
    (886, 886),
    (960, 968),
    (970, 977),
    (992, 996),
    (998, 998),
];

/// National number length bounds for countries with well-known plans
fn national_length(code: u16) -> Option<(usize, usize)> {
    let bounds = match code {
        1 | 7 => (10, 10),
        20 => (9, 10),
        27 | 33 | 34 | 61 | 94 | 254 => (9, 9),
        39 => (6, 11),
        44 => (9, 10),
        49 => (7, 13),
        52 | 90 | 91 | 92 | 880 => (10, 10),
        55 => (10, 11),
        62 => (9, 12),
        81 => (9, 10),
        82 => (8, 10),
        84 => (9, 10),
        86 => (10, 11),
        234 => (8, 10),
        _ => return None,
    };
    Some(bounds)
}

fn is_three_digit_code(code: u16) -> bool {
    THREE_DIGIT_RANGES
        .iter()
        .any(|&(lo, hi)| (lo..=hi).contains(&code))
}

/// Split a digit string into its country calling code and length
fn country_code(digits: &str) -> Option<(u16, usize)> {
    // Calling codes are prefix-free, so the first match is the only match
    for len in 1..=3 {
        let code: u16 = digits.get(..len)?.parse().ok()?;
        let known = match len {
            1 => SINGLE_DIGIT_CODES.contains(&code),
            2 => TWO_DIGIT_CODES.contains(&code),
            _ => is_three_digit_code(code),
        };
        if known {
            return Some((code, len));
        }
    }
    None
}

/// A validated international phone number in E.164 form, without `+`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber {
    digits: String,
    code_len: usize,
}

impl PhoneNumber {
    /// Normalize and validate user input
    pub fn parse(input: &str) -> Result<Self> {
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();

        if digits.is_empty() {
            return Err(Error::invalid_number("no digits found"));
        }
        if digits.starts_with('0') {
            return Err(Error::invalid_number(
                "international numbers cannot start with 0",
            ));
        }
        if digits.len() < MIN_DIGITS {
            return Err(Error::invalid_number("too short"));
        }
        if digits.len() > MAX_DIGITS {
            return Err(Error::invalid_number("too long"));
        }

        let (code, code_len) = country_code(&digits)
            .ok_or_else(|| Error::invalid_number("unknown country calling code"))?;
        let national = &digits[code_len..];

        let (min, max) = national_length(code).unwrap_or((4, MAX_DIGITS - code_len));
        if national.len() < min || national.len() > max {
            return Err(Error::invalid_number(format!(
                "national number for +{} must have {}-{} digits",
                code, min, max
            )));
        }

        // NANP area codes never start with 0 or 1
        if code == 1 && matches!(national.as_bytes()[0], b'0' | b'1') {
            return Err(Error::invalid_number("invalid area code"));
        }

        Ok(Self { digits, code_len })
    }

    /// Digits only, country code first
    pub fn as_str(&self) -> &str {
        &self.digits
    }

    /// Country calling code digits
    pub fn country_code(&self) -> &str {
        &self.digits[..self.code_len]
    }

    /// National significant number
    pub fn national_number(&self) -> &str {
        &self.digits[self.code_len..]
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digits)
    }
}

impl std::str::FromStr for PhoneNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<PhoneNumber> for String {
    fn from(number: PhoneNumber) -> Self {
        number.digits
    }
}
