//! Byte values of storage quantities such as `100Gi` or `500M`.

use std::cmp::Ordering;
use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

use crate::{Error, Result};

fn multiplier(suffix: &str) -> Option<i128> {
    const KI: i128 = 1024;
    const K: i128 = 1000;
    Some(match suffix {
        "" => 1,
        "Ki" => KI,
        "Mi" => KI.pow(2),
        "Gi" => KI.pow(3),
        "Ti" => KI.pow(4),
        "Pi" => KI.pow(5),
        "Ei" => KI.pow(6),
        "k" => K,
        "M" => K.pow(2),
        "G" => K.pow(3),
        "T" => K.pow(4),
        "P" => K.pow(5),
        "E" => K.pow(6),
        _ => return None,
    })
}

pub trait QuantityExt {
    /// The quantity in bytes. Fractions below one byte are truncated.
    fn to_bytes(&self) -> Result<i128>;
}

impl QuantityExt for Quantity {
    fn to_bytes(&self) -> Result<i128> {
        static REGEX: OnceLock<Regex> = OnceLock::new();
        let invalid = || Error::InvalidQuantity(self.0.clone());

        let caps = REGEX
            .get_or_init(|| {
                Regex::new(r"^([0-9]+)(?:\.([0-9]+))?([[:alpha:]]{0,2})$").expect("valid regex")
            })
            .captures(self.0.trim())
            .ok_or_else(invalid)?;

        let factor = multiplier(&caps[3]).ok_or_else(invalid)?;
        let whole: i128 = caps[1].parse().map_err(|_| invalid())?;
        let fraction = match caps.get(2) {
            None => 0,
            Some(digits) => {
                let digits = digits.as_str();
                let value: i128 = digits.parse().map_err(|_| invalid())?;
                let scale = 10i128
                    .checked_pow(digits.len() as u32)
                    .ok_or_else(invalid)?;
                value * factor / scale
            }
        };
        whole
            .checked_mul(factor)
            .and_then(|bytes| bytes.checked_add(fraction))
            .ok_or_else(invalid)
    }
}

/// Compares two quantities by their byte value
pub fn compare(a: &Quantity, b: &Quantity) -> Result<Ordering> {
    Ok(a.to_bytes()?.cmp(&b.to_bytes()?))
}
