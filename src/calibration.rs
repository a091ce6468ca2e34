//! Radiometric calibration descriptors.
//!
//! A [Calibration] is the persisted form; it is compiled into a [Calibrator]
//! once per channel so evaluating radiance for a pixel never re-parses anything.
use serde::{Deserialize, Serialize};

use crate::{expr::Expression, Result};

/// Variables available to custom calibration expressions, in evaluation order.
///
/// `val` is the raw sensor count and `line` the scan line of the pixel.
pub const CALIBRATION_VARIABLES: [&str; 2] = ["val", "line"];

/// Calibration of raw counts to radiance for one channel.
///
/// Polynomial coefficients are in ascending order, i.e., `c0 + c1*val + c2*val^2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Calibration {
    Polynomial {
        #[serde(with = "crate::nonfinite::vec")]
        coefs: Vec<f64>,
    },
    PolynomialPerLine {
        #[serde(with = "crate::nonfinite::vec2")]
        coefs: Vec<Vec<f64>>,
    },
    Custom { equation: String },
    CustomPerLine { equations: Vec<String> },
}

/// Compiled form of a [Calibration].
#[derive(Debug, Clone)]
pub enum Calibrator {
    Polynomial(Vec<f64>),
    PolynomialPerLine(Vec<Vec<f64>>),
    Custom(Expression),
    CustomPerLine(Vec<Expression>),
}

fn polynomial(coefs: &[f64], x: f64) -> f64 {
    coefs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

impl Calibrator {
    /// # Errors
    /// [crate::Error::Expression] if a custom equation does not compile.
    pub fn compile(calibration: &Calibration) -> Result<Self> {
        Ok(match calibration {
            Calibration::Polynomial { coefs } => Self::Polynomial(coefs.clone()),
            Calibration::PolynomialPerLine { coefs } => Self::PolynomialPerLine(coefs.clone()),
            Calibration::Custom { equation } => {
                Self::Custom(Expression::parse(equation, &CALIBRATION_VARIABLES)?)
            }
            Calibration::CustomPerLine { equations } => Self::CustomPerLine(
                equations
                    .iter()
                    .map(|e| Expression::parse(e, &CALIBRATION_VARIABLES))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Radiance for raw count `raw` on scan line `line`, or `None` if a per-line
    /// calibration has no entry for `line`.
    #[must_use]
    pub fn radiance(&self, raw: u16, line: usize) -> Option<f64> {
        let val = f64::from(raw);
        match self {
            Self::Polynomial(coefs) => Some(polynomial(coefs, val)),
            Self::PolynomialPerLine(lines) => lines.get(line).map(|c| polynomial(c, val)),
            Self::Custom(expr) => Some(expr.eval(&[val, line as f64])),
            Self::CustomPerLine(exprs) => exprs.get(line).map(|e| e.eval(&[val, line as f64])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_is_ascending() {
        let cal = Calibrator::compile(&Calibration::Polynomial {
            coefs: vec![1.0, 2.0, 3.0],
        })
        .unwrap();
        assert_eq!(cal.radiance(2, 0), Some(1.0 + 4.0 + 12.0));
        assert_eq!(cal.radiance(2, 1_000_000), Some(17.0));
    }

    #[test]
    fn per_line() {
        let cal = Calibrator::compile(&Calibration::PolynomialPerLine {
            coefs: vec![vec![0.0, 1.0], vec![10.0, 2.0]],
        })
        .unwrap();
        assert_eq!(cal.radiance(5, 0), Some(5.0));
        assert_eq!(cal.radiance(5, 1), Some(20.0));
        assert_eq!(cal.radiance(5, 2), None);

        let cal = Calibrator::compile(&Calibration::CustomPerLine {
            equations: vec!["val".into(), "val * line".into()],
        })
        .unwrap();
        assert_eq!(cal.radiance(3, 1), Some(3.0));
        assert_eq!(cal.radiance(3, 5), None);
    }

    #[test]
    fn custom() {
        let cal = Calibrator::compile(&Calibration::Custom {
            equation: "val / 2 + line".into(),
        })
        .unwrap();
        assert_eq!(cal.radiance(10, 3), Some(8.0));

        let zult = Calibrator::compile(&Calibration::Custom {
            equation: "val +".into(),
        });
        assert!(zult.is_err());
    }

    #[test]
    fn serialized_form_is_tagged() {
        let cal = Calibration::Custom {
            equation: "val".into(),
        };
        let json = serde_json::to_value(&cal).unwrap();
        assert_eq!(json["type"], "custom");
        assert_eq!(json["equation"], "val");

        let back: Calibration =
            serde_json::from_str(r#"{"type": "polynomial_per_line", "coefs": [[1.0]]}"#).unwrap();
        assert_eq!(
            back,
            Calibration::PolynomialPerLine {
                coefs: vec![vec![1.0]]
            }
        );

        let missing = serde_json::from_str::<Calibration>(r#"{"type": "polynomial"}"#);
        assert!(missing.is_err(), "coefs are required for polynomials");
    }
}
