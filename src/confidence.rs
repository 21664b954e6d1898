//! Confidence assessment at decision points.
//!
//! The score is a fixed weighted sum of five factors. Missing or NaN factors
//! contribute zero, so an uninformed assessment leans toward handing control
//! back rather than pressing on.
//!
//! # Invariants
//! - Weights sum to 1.0
//! - Every contribution and the final score lie in [0, 1]
//! - `assess` is pure: the same factors always yield the same assessment

use serde::{Deserialize, Serialize};

/// The five inputs to a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceFactor {
    TaskClarity,
    SolutionCertainty,
    VerificationSuccess,
    PrecedentMatch,
    ResourceAvailability,
}

impl ConfidenceFactor {
    pub const ALL: [ConfidenceFactor; 5] = [
        ConfidenceFactor::TaskClarity,
        ConfidenceFactor::SolutionCertainty,
        ConfidenceFactor::VerificationSuccess,
        ConfidenceFactor::PrecedentMatch,
        ConfidenceFactor::ResourceAvailability,
    ];

    pub fn weight(self) -> f64 {
        match self {
            Self::TaskClarity => 0.25,
            Self::SolutionCertainty => 0.30,
            Self::VerificationSuccess => 0.20,
            Self::PrecedentMatch => 0.15,
            Self::ResourceAvailability => 0.10,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TaskClarity => "task clarity",
            Self::SolutionCertainty => "solution certainty",
            Self::VerificationSuccess => "verification success",
            Self::PrecedentMatch => "precedent match",
            Self::ResourceAvailability => "resource availability",
        }
    }
}

impl std::fmt::Display for ConfidenceFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw factor values as reported at a decision point.
///
/// `resource_availability` is usually filled in by the supervisor from the
/// node's budget rather than by the reasoner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    #[serde(default)]
    pub task_clarity: Option<f64>,
    #[serde(default)]
    pub solution_certainty: Option<f64>,
    #[serde(default)]
    pub verification_success: Option<f64>,
    #[serde(default)]
    pub precedent_match: Option<f64>,
    #[serde(default)]
    pub resource_availability: Option<f64>,
}

impl ConfidenceFactors {
    /// Every factor set to `value`.
    pub fn uniform(value: f64) -> Self {
        Self {
            task_clarity: Some(value),
            solution_certainty: Some(value),
            verification_success: Some(value),
            precedent_match: Some(value),
            resource_availability: Some(value),
        }
    }

    pub fn get(&self, factor: ConfidenceFactor) -> Option<f64> {
        match factor {
            ConfidenceFactor::TaskClarity => self.task_clarity,
            ConfidenceFactor::SolutionCertainty => self.solution_certainty,
            ConfidenceFactor::VerificationSuccess => self.verification_success,
            ConfidenceFactor::PrecedentMatch => self.precedent_match,
            ConfidenceFactor::ResourceAvailability => self.resource_availability,
        }
    }
}

/// One factor's part of the score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FactorContribution {
    pub factor: ConfidenceFactor,
    /// Clamped input, 0 when missing
    pub value: f64,
    pub weight: f64,
    /// `value * weight`
    pub weighted: f64,
}

/// Result of one assessment. Recomputed at every decision point, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceAssessment {
    pub score: f64,
    pub contributions: Vec<FactorContribution>,
}

impl ConfidenceAssessment {
    /// Factor with the lowest weighted contribution (first in declaration order on ties).
    pub fn weakest_factor(&self) -> ConfidenceFactor {
        self.contributions
            .iter()
            .fold(None::<&FactorContribution>, |lowest, c| match lowest {
                Some(l) if l.weighted <= c.weighted => Some(l),
                _ => Some(c),
            })
            .map(|c| c.factor)
            .unwrap_or(ConfidenceFactor::TaskClarity)
    }

    /// Human-readable breakdown used in handoff summaries.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .contributions
            .iter()
            .map(|c| format!("{} {:.2}×{:.2}", c.factor, c.value, c.weight))
            .collect();
        format!("confidence {:.2} ({})", self.score, parts.join(", "))
    }
}

fn clamp_unit(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        Some(v) if v == f64::INFINITY => 1.0,
        _ => 0.0,
    }
}

/// Compute the weighted confidence score.
pub fn assess(factors: &ConfidenceFactors) -> ConfidenceAssessment {
    let contributions: Vec<FactorContribution> = ConfidenceFactor::ALL
        .iter()
        .map(|&factor| {
            let value = clamp_unit(factors.get(factor));
            let weight = factor.weight();
            FactorContribution {
                factor,
                value,
                weight,
                weighted: value * weight,
            }
        })
        .collect();

    let score = contributions
        .iter()
        .map(|c| c.weighted)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    ConfidenceAssessment {
        score,
        contributions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackPolicy;

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = ConfidenceFactor::ALL.iter().map(|f| f.weight()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_high_stays_above_threshold() {
        let assessment = assess(&ConfidenceFactors::uniform(0.9));
        assert!((assessment.score - 0.9).abs() < 1e-9);
        assert!(!FallbackPolicy::default().confidence_crossed(assessment.score));
    }

    #[test]
    fn test_uniform_low_names_resource_availability_weakest() {
        let assessment = assess(&ConfidenceFactors::uniform(0.4));
        assert!((assessment.score - 0.4).abs() < 1e-9);
        assert!(FallbackPolicy::default().confidence_crossed(assessment.score));
        assert_eq!(
            assessment.weakest_factor(),
            ConfidenceFactor::ResourceAvailability
        );
    }

    #[test]
    fn test_missing_and_invalid_factors_count_as_zero() {
        let factors = ConfidenceFactors {
            task_clarity: Some(f64::NAN),
            solution_certainty: Some(1.0),
            verification_success: Some(-3.0),
            precedent_match: None,
            resource_availability: Some(7.0),
        };
        let assessment = assess(&factors);
        assert!((assessment.score - 0.40).abs() < 1e-9);
        assert_eq!(assessment.weakest_factor(), ConfidenceFactor::TaskClarity);
        assert!(assess(&ConfidenceFactors::default()).score == 0.0);
    }

    #[test]
    fn test_describe_lists_every_factor() {
        let text = assess(&ConfidenceFactors::uniform(0.5)).describe();
        for factor in ConfidenceFactor::ALL {
            assert!(text.contains(factor.label()));
        }
    }
}
