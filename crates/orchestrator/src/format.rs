//! Human-readable formatting of sizes, counts, ranks and floats for log
//! lines and file names.

const MEM_SUFFIXES: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count with a binary suffix, e.g. `1.5 KiB`.
///
/// The value is divided by 1024 while it exceeds 1024, up to TiB, and shown
/// with 3, 4 or 5 significant digits depending on its magnitude.
pub fn mem_string(bytes: usize) -> String {
    let mut mem = bytes as f64;
    let mut idx = 0;
    while mem > 1024.0 && idx < MEM_SUFFIXES.len() - 1 {
        mem /= 1024.0;
        idx += 1;
    }
    let digits = if mem < 10.0 {
        3
    } else if mem < 100.0 {
        4
    } else {
        5
    };
    format!("{} {}", significant(mem, digits), MEM_SUFFIXES[idx])
}

/// `value` rounded to `digits` significant digits, trailing zeros removed.
fn significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits - 1 - magnitude).max(0) as usize;
    trim_fraction(format!("{:.*}", decimals, value))
}

/// Drop trailing zeros of the fractional part, and the point if nothing is
/// left after it.
fn trim_fraction(mut out: String) -> String {
    if out.contains('.') {
        let trimmed = out.trim_end_matches('0').trim_end_matches('.').len();
        out.truncate(trimmed);
    }
    out
}

/// Shortest form of `value` with 6 significant digits, as printf's `%g`.
///
/// Exponents below -4 or from 6 up switch to scientific notation with a
/// signed, two-digit exponent: `0.02`, `1e-05`, `1.23457e+06`.
pub fn general_float(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return value.to_string();
    }
    let sci = format!("{:.5e}", value);
    let parsed = sci
        .split_once('e')
        .and_then(|(mantissa, exp)| Some((mantissa, exp.parse::<i32>().ok()?)));
    let Some((mantissa, exp)) = parsed else {
        return sci;
    };
    if !(-4..6).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa.to_string()),
            sign,
            exp.unsigned_abs()
        )
    } else {
        trim_fraction(format!("{:.*}", (5 - exp) as usize, value))
    }
}

/// Decimal representation with a comma every three digits, e.g. `-1,234,567`.
pub fn add_separators(number: i64) -> String {
    let digits = number.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if number < 0 {
        out.push('-');
    }
    let lead = digits.len() % 3;
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `"<rank>.<nodes>"`, as used in per-process file names.
pub fn rank_string(rank: usize, nodes: usize) -> String {
    format!("{}.{}", rank, nodes)
}
