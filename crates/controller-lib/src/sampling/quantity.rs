//! Parsing of Kubernetes resource quantity strings.
//!
//! Quantities arrive as strings like `250m`, `1536Mi`, or `12345678n`.
//! CPU values are normalized to millicores, memory to bytes. Strings that
//! do not parse yield zero; the sampler treats a zero aggregate request as
//! "no request declared".

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// CPU quantity in millicores. `1` core == `1000` millicores.
pub fn cpu_millicores(quantity: &Quantity) -> i64 {
    let (value, multiplier) = split(&quantity.0);
    (value * multiplier * 1000.0).round() as i64
}

/// Memory quantity in bytes.
pub fn memory_bytes(quantity: &Quantity) -> i64 {
    let (value, multiplier) = split(&quantity.0);
    (value * multiplier).round() as i64
}

fn split(raw: &str) -> (f64, f64) {
    let raw = raw.trim();
    let boundary = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(boundary);

    let value: f64 = match number.parse() {
        Ok(v) => v,
        Err(_) => return (0.0, 0.0),
    };

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return (0.0, 0.0),
    };

    (value, multiplier)
}
