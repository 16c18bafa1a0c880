use std::cmp::Ordering;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity '{0}'")]
    Invalid(String),
    #[error("unknown quantity suffix '{suffix}' in '{raw}'")]
    UnknownSuffix { raw: String, suffix: String },
}

/// A Kubernetes resource quantity such as `100m`, `512Mi`, or `0.2G`.
///
/// Values are normalized to a base unit so that quantities with different
/// suffixes compare correctly (`0.2G` > `100M`, `1Gi` > `1G`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    value: f64,
}

impl Quantity {
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(raw: &str) -> Result<Self, QuantityError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = raw
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit() && *c != '.' && *c != '-' && *c != '+')
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        let (number, suffix) = raw.split_at(split);

        let base: f64 = number
            .parse()
            .map_err(|_| QuantityError::Invalid(raw.to_string()))?;

        let multiplier = match suffix {
            "" => 1.0,
            "n" => 1e-9,
            "u" => 1e-6,
            "m" => 1e-3,
            "k" => 1e3,
            "M" => 1e6,
            "G" => 1e9,
            "T" => 1e12,
            "P" => 1e15,
            "E" => 1e18,
            "Ki" => 1024.0,
            "Mi" => 1024.0 * 1024.0,
            "Gi" => 1024.0 * 1024.0 * 1024.0,
            "Ti" => 1024f64.powi(4),
            "Pi" => 1024f64.powi(5),
            "Ei" => 1024f64.powi(6),
            other => {
                // scientific notation, e.g. 123e6
                if let Some(exp) = other.strip_prefix(['e', 'E']) {
                    let exp: i32 = exp
                        .parse()
                        .map_err(|_| QuantityError::Invalid(raw.to_string()))?;
                    return Ok(Quantity {
                        value: base * 10f64.powi(exp),
                    });
                }
                return Err(QuantityError::UnknownSuffix {
                    raw: raw.to_string(),
                    suffix: other.to_string(),
                });
            }
        };

        Ok(Quantity {
            value: base * multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_decimal_suffixes() {
        assert_eq!(parse("100m").value(), 0.1);
        assert_eq!(parse("1").value(), 1.0);
        assert_eq!(parse("0.5").value(), 0.5);
        assert_eq!(parse("100M").value(), 100_000_000.0);
        assert_eq!(parse("0.2G").value(), 200_000_000.0);
        assert_eq!(parse("1k").value(), 1000.0);
    }

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse("128Mi").value(), 128.0 * 1024.0 * 1024.0);
        assert_eq!(parse("1Gi").value(), 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse("512Ki").value(), 512.0 * 1024.0);
    }

    #[test]
    fn test_parse_scientific() {
        assert_eq!(parse("123e6").value(), 123_000_000.0);
        assert_eq!(parse("1E3").value(), 1000.0);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Quantity>(), Err(QuantityError::Empty));
        assert!(matches!(
            "100X".parse::<Quantity>(),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            "abc".parse::<Quantity>(),
            Err(QuantityError::Invalid(_))
        ));
    }

    #[test]
    fn test_comparison_across_suffixes() {
        assert!(parse("0.2G") > parse("100M"));
        assert!(parse("200M") >= parse("100M"));
        assert!(parse("50M") < parse("100M"));
        assert!(parse("99999999") < parse("100M"));
        assert!(parse("1Gi") > parse("1G"));
        assert!(parse("100m") < parse("1"));
    }
}
