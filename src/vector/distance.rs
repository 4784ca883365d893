//! Distance functions. Every space orders ascending: smaller means closer,
//! so inner product is negated.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    #[default]
    L2,
    #[serde(rename = "ip")]
    InnerProduct,
    Cosine,
    Hamming,
}

impl Space {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Space::L2 => l2(a, b),
            Space::InnerProduct => inner_product(a, b),
            Space::Cosine => cosine(a, b),
            Space::Hamming => hamming(a, b),
        }
    }

    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            Space::L2 => 0,
            Space::InnerProduct => 1,
            Space::Cosine => 2,
            Space::Hamming => 3,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Option<Space> {
        match tag {
            0 => Some(Space::L2),
            1 => Some(Space::InnerProduct),
            2 => Some(Space::Cosine),
            3 => Some(Space::Hamming),
            _ => None,
        }
    }
}

impl std::str::FromStr for Space {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "l2" => Ok(Space::L2),
            "ip" => Ok(Space::InnerProduct),
            "cosine" => Ok(Space::Cosine),
            "hamming" => Ok(Space::Hamming),
            other => Err(crate::error::Error::InvalidParameter(format!(
                "unknown space {other}"
            ))),
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Space::L2 => write!(f, "l2"),
            Space::InnerProduct => write!(f, "ip"),
            Space::Cosine => write!(f, "cosine"),
            Space::Hamming => write!(f, "hamming"),
        }
    }
}

/// Squared euclidean distance (no square root).
fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Negated dot product so that closer vectors sort first.
fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
}

/// `1 - cos(a, b)`; a zero-norm operand yields the maximal distance 1.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum();
    let norm_b: f32 = b.iter().map(|x| x * x).sum();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b).sqrt()
}

/// Count of differing positions.
fn hamming(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).filter(|(x, y)| x != y).count() as f32
}
