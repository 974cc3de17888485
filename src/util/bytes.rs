//! Byte-count helpers for cache budgets and human-readable reports.

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
const MIB: u64 = 1024 * 1024;

/// Convert a budget expressed in mebibytes into bytes, saturating on overflow.
pub fn mebibytes(value: u64) -> u64 {
    value.saturating_mul(MIB)
}

/// Format a byte count into IEC units with at most two decimals.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes} {}", UNITS[0]);
    }

    let precision = if value >= 10.0 { 1 } else { 2 };
    let rendered = format!("{value:.precision$}");
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');

    format!("{trimmed} {}", UNITS[unit])
}
