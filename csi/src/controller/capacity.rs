//! Volume sizing policy.

use tonic::{Code, Status};

use crate::csi::CapacityRange;

pub const GIB: i64 = 1 << 30;
pub const MIN_VOLUME_SIZE: i64 = 10 * GIB;
pub const MAX_VOLUME_SIZE: i64 = 4096 * GIB;
pub const DEFAULT_VOLUME_SIZE: i64 = MIN_VOLUME_SIZE;

const UNITS: [(i64, &str); 4] = [
    (1 << 40, "Ti"),
    (1 << 30, "Gi"),
    (1 << 20, "Mi"),
    (1 << 10, "Ki"),
];

/// Human readable binary size, e.g. `10Gi` or `1.5Ti`.
pub fn format_bytes(bytes: i64) -> String {
    for (unit, suffix) in UNITS.iter() {
        if bytes.abs() >= *unit {
            let value = format!("{:.1}", bytes as f64 / *unit as f64);
            let value = value.trim_end_matches(".0");
            return format!("{}{}", value, suffix);
        }
    }
    bytes.to_string()
}

/// Size in GiB for a capacity range, rounded up.
///
/// An absent range, or one with neither bound set, yields the default size.
/// Sizes are bounded by the minimum and maximum supported volume sizes.
pub fn volume_size_gib(range: Option<&CapacityRange>) -> Result<u64, Status> {
    let (required, limit) = match range {
        Some(range) => (range.required_bytes, range.limit_bytes),
        None => (0, 0),
    };

    if required < 0 || limit < 0 {
        return Err(failure!(
            Code::InvalidArgument,
            "capacity range can not be negative: required {} limit {}",
            required,
            limit
        ));
    }
    if required == 0 && limit == 0 {
        return Ok((DEFAULT_VOLUME_SIZE / GIB) as u64);
    }
    if required > 0 && limit > 0 && limit < required {
        return Err(failure!(
            Code::OutOfRange,
            "limit ({}) can not be less than required ({}) size",
            format_bytes(limit),
            format_bytes(required)
        ));
    }

    let (bound, size) = if required > 0 {
        ("required", required)
    } else {
        ("limit", limit)
    };
    if size < MIN_VOLUME_SIZE {
        return Err(failure!(
            Code::OutOfRange,
            "{} ({}) can not be less than minimum supported volume size ({})",
            bound,
            format_bytes(size),
            format_bytes(MIN_VOLUME_SIZE)
        ));
    }
    if size > MAX_VOLUME_SIZE {
        return Err(failure!(
            Code::OutOfRange,
            "{} ({}) can not exceed maximum supported volume size ({})",
            bound,
            format_bytes(size),
            format_bytes(MAX_VOLUME_SIZE)
        ));
    }

    let gib = (size + GIB - 1) / GIB;
    if limit > 0 && gib * GIB > limit {
        return Err(failure!(
            Code::OutOfRange,
            "size rounded up to {} exceeds limit ({})",
            format_bytes(gib * GIB),
            format_bytes(limit)
        ));
    }
    Ok(gib as u64)
}
