//! Window functions applied before the transform.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Window function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowType {
    /// No tapering
    Rectangular,
    /// Good general purpose choice
    #[default]
    Hann,
    Hamming,
    Blackman,
    /// Very low sidelobes, wider main lobe
    BlackmanHarris,
}

impl WindowType {
    /// Generate `size` window coefficients.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "window lengths are far below 2^23")]
    pub fn coefficients(self, size: usize) -> Vec<f32> {
        let n = size as f32;
        (0..size)
            .map(|i| {
                let x = i as f32;
                match self {
                    Self::Rectangular => 1.0,
                    Self::Hann => 0.5 * (1.0 - (2.0 * PI * x / n).cos()),
                    Self::Hamming => 0.54 - 0.46 * (2.0 * PI * x / n).cos(),
                    Self::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * x / n).cos() + 0.08 * (4.0 * PI * x / n).cos()
                    }
                    Self::BlackmanHarris => {
                        0.358_75 - 0.488_29 * (2.0 * PI * x / n).cos()
                            + 0.141_28 * (4.0 * PI * x / n).cos()
                            - 0.011_68 * (6.0 * PI * x / n).cos()
                    }
                }
            })
            .collect()
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rectangular => "rectangular",
            Self::Hann => "hann",
            Self::Hamming => "hamming",
            Self::Blackman => "blackman",
            Self::BlackmanHarris => "blackman-harris",
        };
        f.write_str(name)
    }
}

impl FromStr for WindowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rectangular" | "rect" | "none" => Ok(Self::Rectangular),
            "hann" | "hanning" => Ok(Self::Hann),
            "hamming" => Ok(Self::Hamming),
            "blackman" => Ok(Self::Blackman),
            "blackman-harris" | "blackmanharris" => Ok(Self::BlackmanHarris),
            other => Err(format!("unknown window function '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window() {
        let window = WindowType::Hann.coefficients(4);
        assert!(window[0].abs() < 0.01); // ~0 at the edge
        assert!((window[2] - 1.0).abs() < 0.01); // ~1 at the center
    }

    #[test]
    fn test_rectangular_is_flat() {
        assert!(WindowType::Rectangular.coefficients(8).iter().all(|&w| (w - 1.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Hanning".parse::<WindowType>(), Ok(WindowType::Hann));
        assert_eq!("blackman-harris".parse::<WindowType>(), Ok(WindowType::BlackmanHarris));
        assert!("triangle".parse::<WindowType>().is_err());
        assert_eq!(WindowType::BlackmanHarris.to_string(), "blackman-harris");
    }
}
