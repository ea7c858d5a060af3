//! Bank (tenant) profile types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent-style disposition traits for a bank, each in `[0, 1]`.
///
/// Rendered qualitatively into reflect prompts; `bias_strength` governs how
/// forcefully the traits are phrased.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    /// Tendency to doubt claims without supporting context.
    pub skepticism: f32,
    /// Preference for literal over figurative readings.
    pub literalism: f32,
    /// Weight given to the emotional framing of retrieved facts.
    pub empathy: f32,
    /// How strongly the traits shape phrasing.
    pub bias_strength: f32,
}

impl Default for Disposition {
    fn default() -> Self {
        Self {
            skepticism: 0.5,
            literalism: 0.5,
            empathy: 0.5,
            bias_strength: 0.5,
        }
    }
}

impl Disposition {
    /// Clamps all traits into `[0, 1]`.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            skepticism: self.skepticism.clamp(0.0, 1.0),
            literalism: self.literalism.clamp(0.0, 1.0),
            empathy: self.empathy.clamp(0.0, 1.0),
            bias_strength: self.bias_strength.clamp(0.0, 1.0),
        }
    }

    /// Renders a trait value as a qualitative descriptor.
    #[must_use]
    pub fn describe(value: f32) -> &'static str {
        if value >= 0.75 {
            "high"
        } else if value >= 0.4 {
            "moderate"
        } else {
            "low"
        }
    }
}

/// The tenant unit. Lazily created on first use; deletion cascades every
/// dependent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bank {
    /// Short opaque identifier, unique.
    pub bank_id: String,
    /// Optional display name.
    pub name: Option<String>,
    /// Free text shaping consolidation and reflection. Often identifies the
    /// bank owner by name.
    pub mission: Option<String>,
    /// Disposition traits.
    pub disposition: Disposition,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Bank {
    /// Creates a bank profile with default disposition.
    #[must_use]
    pub fn new(bank_id: impl Into<String>) -> Self {
        Self {
            bank_id: bank_id.into(),
            name: None,
            mission: None,
            disposition: Disposition::default(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_clamped() {
        let d = Disposition {
            skepticism: 1.5,
            literalism: -0.2,
            empathy: 0.5,
            bias_strength: 0.9,
        }
        .clamped();
        assert!((d.skepticism - 1.0).abs() < f32::EPSILON);
        assert!(d.literalism.abs() < f32::EPSILON);
    }

    #[test]
    fn test_describe_bands() {
        assert_eq!(Disposition::describe(0.9), "high");
        assert_eq!(Disposition::describe(0.5), "moderate");
        assert_eq!(Disposition::describe(0.1), "low");
    }
}
