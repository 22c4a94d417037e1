//! Kubernetes quantity parsing and SI formatting.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const UNITS: [&str; 6] = ["", "K", "M", "G", "T", "P"];
const FRACTIONAL: [&str; 6] = ["", "m", "u", "n", "p", "f"];

static QUANTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9.-]+)\s*([^0-9.-]?)([^0-9.-]?)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatOptions {
    pub increment: f64,
    /// Appended after the unit letter (`"i"` for binary, `"m"`, `"B"`, ...).
    pub suffix: &'static str,
    /// Used instead of `suffix` when no unit letter applies.
    pub first_suffix: Option<&'static str>,
    pub starting_exponent: usize,
    pub min_exponent: usize,
    pub max_precision: u8,
    /// Never render a non-zero value as `0`.
    pub at_least_one: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            increment: 1000.0,
            suffix: "",
            first_suffix: None,
            starting_exponent: 0,
            min_exponent: 0,
            max_precision: 2,
            at_least_one: true,
        }
    }
}

impl FormatOptions {
    /// Base-1024 with the `i` suffix: `1536 -> 1.5Ki`.
    pub fn binary() -> Self { Self { increment: 1024.0, suffix: "i", ..Self::default() } }

    pub fn precision(mut self, max_precision: u8) -> Self {
        self.max_precision = max_precision;
        self
    }
}

pub fn format_si(value: f64, opts: &FormatOptions) -> String {
    let mut val = value;
    let mut exp = opts.starting_exponent.min(UNITS.len() - 1);
    while (val >= opts.increment && exp + 1 < UNITS.len()) || exp < opts.min_exponent.min(UNITS.len() - 1) {
        val /= opts.increment;
        exp += 1;
    }

    let mut out = if val < 10.0 && opts.max_precision >= 2 {
        (val * 100.0).round() / 100.0
    } else if val < 100.0 && opts.max_precision >= 1 {
        (val * 10.0).round() / 10.0
    } else {
        val.round()
    };
    if opts.at_least_one && out == 0.0 && value != 0.0 {
        out = 1.0;
    }

    match opts.first_suffix {
        Some(first) if exp == 0 => format!("{out}{first}"),
        _ => format!("{out}{}{}", UNITS[exp], opts.suffix),
    }
}

/// Parse a quantity such as `128Mi`, `500m`, `1.5G` or `2`. Returns `None`
/// when no leading number is present.
pub fn parse_si(input: &str) -> Option<f64> { parse_si_with(input, None, true) }

/// `increment` forces the unit base; by default a trailing `i` selects 1024.
pub fn parse_si_with(input: &str, increment: Option<f64>, allow_fractional: bool) -> Option<f64> {
    let cleaned = input.replace(',', "");
    let caps = QUANTITY_RE.captures(&cleaned)?;
    let val = parse_leading_float(caps.get(1)?.as_str())?;
    let mut unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let inc_str = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    if unit.is_empty() {
        return Some(val);
    }
    if unit == "\u{b5}" || unit == "\u{3bc}" {
        unit = "u";
    }

    let upper = unit.to_uppercase();
    let divide = FRACTIONAL[1..].contains(&unit);
    let multiply = UNITS[1..].contains(&upper.as_str());
    let increment = increment.unwrap_or(if (multiply || divide) && inc_str == "i" { 1024.0 } else { 1000.0 });

    if divide && allow_fractional {
        let exp = FRACTIONAL.iter().position(|u| *u == unit).unwrap_or(0);
        return Some(val / increment.powi(exp as i32));
    }
    if multiply {
        let exp = UNITS.iter().position(|u| *u == upper).unwrap_or(0);
        return Some(val * increment.powi(exp as i32));
    }
    Some(val)
}

/// Longest numeric prefix, so `1.2.3` reads as `1.2`.
fn parse_leading_float(s: &str) -> Option<f64> {
    (1..=s.len()).rev().find_map(|end| s[..end].parse::<f64>().ok())
}

/// Render CPU cores: millicores below one core, otherwise cores.
pub fn format_cpu(cores: f64) -> String {
    if cores > 0.0 && cores < 1.0 {
        format!("{}m", (cores * 1000.0).round())
    } else {
        format_si(cores, &FormatOptions::default())
    }
}

pub fn format_memory(bytes: f64) -> String { format_si(bytes, &FormatOptions::binary()) }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub si: String,
}

impl Quantity {
    pub fn cpu(cores: f64) -> Self { Self { value: cores, si: format_cpu(cores) } }
    pub fn memory(bytes: f64) -> Self { Self { value: bytes, si: format_memory(bytes) } }
}

/// CPU (cores) and memory (bytes) totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    pub cpu: Quantity,
    pub memory: Quantity,
}

impl ResourceQuantity {
    pub fn new(cpu: f64, memory: f64) -> Self { Self { cpu: Quantity::cpu(cpu), memory: Quantity::memory(memory) } }
}
