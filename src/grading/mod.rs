//! Rubric grading of a submission.
//!
//! The grading model itself is an external collaborator behind [`Grader`].
//! This module owns the deterministic parts around it: the ten rubric
//! criteria, score mining from the model's reply, and the percentage and
//! letter-grade arithmetic. [`ledger`] keeps every graded submission on
//! disk.

pub mod ledger;
mod llm;

pub use ledger::{grade_and_record, GradedSubmission, SubmissionRecord, SubmissionStore};
pub use llm::{GraderConfig, LlmGrader};

use crate::error::PipelineError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Highest score per criterion.
pub const MAX_CRITERION_SCORE: u8 = 5;

/// The ten rubric criteria, in rubric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    ArchitectChosen,
    DocumentSetup,
    Biography,
    BiographyReferences,
    ImageQuality,
    ImageCitations,
    TenBuildings,
    ImageRelevance,
    PersonalBioPhoto,
    OverallCompleteness,
}

impl Criterion {
    pub const ALL: [Criterion; 10] = [
        Criterion::ArchitectChosen,
        Criterion::DocumentSetup,
        Criterion::Biography,
        Criterion::BiographyReferences,
        Criterion::ImageQuality,
        Criterion::ImageCitations,
        Criterion::TenBuildings,
        Criterion::ImageRelevance,
        Criterion::PersonalBioPhoto,
        Criterion::OverallCompleteness,
    ];

    /// Category name as it appears in the rubric.
    pub fn label(self) -> &'static str {
        match self {
            Criterion::ArchitectChosen => "Architect Selection & Scope",
            Criterion::DocumentSetup => "Organization & Document Setup",
            Criterion::Biography => "Biographical Content",
            Criterion::BiographyReferences => "Citation of Architect Biography",
            Criterion::ImageQuality => "Selection & Quality of Images",
            Criterion::ImageCitations => "Image Citation & Attribution",
            Criterion::TenBuildings => "Coverage of 10 Famous Buildings",
            Criterion::ImageRelevance => "Image Relevance",
            Criterion::PersonalBioPhoto => "Personal Bio & Photo",
            Criterion::OverallCompleteness => "Overall Completeness & Presentation",
        }
    }

    /// Match a category name written by the model.
    ///
    /// Models shorten and decorate names freely, so this matches on a
    /// distinctive lowercase fragment.
    pub fn from_category(category: &str) -> Option<Self> {
        const KEYS: [(&str, Criterion); 10] = [
            ("architect selection", Criterion::ArchitectChosen),
            ("organization", Criterion::DocumentSetup),
            ("biographical content", Criterion::Biography),
            ("citation of architect", Criterion::BiographyReferences),
            ("quality of images", Criterion::ImageQuality),
            ("image citation", Criterion::ImageCitations),
            ("famous buildings", Criterion::TenBuildings),
            ("image relevance", Criterion::ImageRelevance),
            ("personal bio", Criterion::PersonalBioPhoto),
            ("overall completeness", Criterion::OverallCompleteness),
        ];
        let lower = category.to_lowercase();
        KEYS.iter()
            .find(|(key, _)| lower.contains(key))
            .map(|&(_, c)| c)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Letter grade for a final percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterGrade {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "D-")]
    DMinus,
    #[serde(rename = "F")]
    F,
}

impl LetterGrade {
    /// Lower bounds, highest first.
    const THRESHOLDS: [(f64, LetterGrade); 11] = [
        (93.0, LetterGrade::A),
        (90.0, LetterGrade::AMinus),
        (87.0, LetterGrade::BPlus),
        (83.0, LetterGrade::B),
        (80.0, LetterGrade::BMinus),
        (77.0, LetterGrade::CPlus),
        (73.0, LetterGrade::C),
        (70.0, LetterGrade::CMinus),
        (67.0, LetterGrade::DPlus),
        (63.0, LetterGrade::D),
        (60.0, LetterGrade::DMinus),
    ];

    pub fn from_percent(percent: f64) -> Self {
        Self::THRESHOLDS
            .iter()
            .find(|(min, _)| percent >= *min)
            .map(|&(_, grade)| grade)
            .unwrap_or(LetterGrade::F)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LetterGrade::A => "A",
            LetterGrade::AMinus => "A-",
            LetterGrade::BPlus => "B+",
            LetterGrade::B => "B",
            LetterGrade::BMinus => "B-",
            LetterGrade::CPlus => "C+",
            LetterGrade::C => "C",
            LetterGrade::CMinus => "C-",
            LetterGrade::DPlus => "D+",
            LetterGrade::D => "D",
            LetterGrade::DMinus => "D-",
            LetterGrade::F => "F",
        }
    }
}

impl fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-criterion scores with the derived total, percentage and grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    /// Clamped to `0..=5`; criteria the model did not score are absent.
    pub scores: BTreeMap<Criterion, u8>,
    pub total: u32,
    pub max_total: u32,
    /// Rounded to two decimals.
    pub final_percent: f64,
    pub grade: LetterGrade,
}

impl Scorecard {
    /// Missing criteria count as zero against the full 50-point maximum.
    pub fn from_scores(scores: BTreeMap<Criterion, u8>) -> Self {
        let scores: BTreeMap<_, _> = scores
            .into_iter()
            .map(|(c, s)| (c, s.min(MAX_CRITERION_SCORE)))
            .collect();
        let total: u32 = scores.values().map(|&s| u32::from(s)).sum();
        let max_total = u32::from(MAX_CRITERION_SCORE) * Criterion::ALL.len() as u32;
        let final_percent = (total as f64 / max_total as f64 * 10_000.0).round() / 100.0;
        Self {
            scores,
            total,
            max_total,
            final_percent,
            grade: LetterGrade::from_percent(final_percent),
        }
    }
}

static FINAL_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\*\*Final Summary:\*\*\s*(.*?)(?:\n\s*\n|$)").unwrap());

static SUMMARY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)\d+\.\s+([^:\n]+):\s+(\d+)\s*/\s*5").unwrap());

/// Mine `N. Category: X/5` lines from a model reply.
///
/// Looks inside the `**Final Summary:**` block when there is one, otherwise
/// across the whole text. Later lines for the same criterion win.
pub fn parse_summary_scores(text: &str) -> BTreeMap<Criterion, u8> {
    let block = FINAL_SUMMARY
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str());

    SUMMARY_LINE
        .captures_iter(block)
        .filter_map(|caps| {
            let criterion = Criterion::from_category(&caps[1])?;
            let score = caps[2].parse::<u8>().ok()?;
            Some((criterion, score))
        })
        .collect()
}

/// Outcome of grading one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub architect: String,
    pub scorecard: Scorecard,
    /// The model's full reply.
    pub evaluation: String,
}

impl GradeReport {
    pub fn from_evaluation(architect: &str, evaluation: String) -> Self {
        Self {
            architect: architect.to_string(),
            scorecard: Scorecard::from_scores(parse_summary_scores(&evaluation)),
            evaluation,
        }
    }
}

/// The student a submission belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub name: String,
    /// Student ID as entered on the submission form.
    pub pid: String,
}

impl Student {
    pub fn new(name: impl Into<String>, pid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: pid.into(),
        }
    }
}

/// Grades one submission against the rubric.
#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, pdf: &Path, architect: &str) -> Result<GradeReport, PipelineError>;

    /// Short feedback addressed to the student, built from a finished report.
    async fn feedback(
        &self,
        student: &Student,
        report: &GradeReport,
    ) -> Result<String, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "**1. Architect Selection & Scope**\nJustification: fine.\nScore: 2/5\n\n\
**Final Summary:**\n\
1. Architect Selection & Scope: 5/5\n\
2. Organization & Document Setup: 4/5\n\
3. Biographical Content (750 words): 4/5\n\
4. Citation of Architect Biography: 3/5\n\
5. Selection & Quality of Images: 5/5\n\
6. Image Citation & Attribution: 4/5\n\
7. Coverage of 10 Famous Buildings: 5/5\n\
8. Image Relevance: 5/5\n\
9. Personal Bio & Photo: 4/5\n\
10. Overall Completeness & Presentation: 4/5\n\nThanks.";

    #[test]
    fn parses_final_summary_block() {
        let scores = parse_summary_scores(REPLY);
        assert_eq!(scores.len(), 10);
        assert_eq!(scores[&Criterion::ArchitectChosen], 5);
        assert_eq!(scores[&Criterion::BiographyReferences], 3);
        assert_eq!(scores[&Criterion::ImageCitations], 4);
    }

    #[test]
    fn scorecard_arithmetic() {
        let card = Scorecard::from_scores(parse_summary_scores(REPLY));
        assert_eq!(card.total, 43);
        assert_eq!(card.max_total, 50);
        assert_eq!(card.final_percent, 86.0);
        assert_eq!(card.grade, LetterGrade::B);
    }

    #[test]
    fn missing_and_oversized_scores() {
        let mut scores = BTreeMap::new();
        scores.insert(Criterion::ArchitectChosen, 9);
        let card = Scorecard::from_scores(scores);
        assert_eq!(card.total, 5);
        assert_eq!(card.final_percent, 10.0);
        assert_eq!(card.grade, LetterGrade::F);
    }

    #[test]
    fn letter_grade_boundaries() {
        assert_eq!(LetterGrade::from_percent(93.0), LetterGrade::A);
        assert_eq!(LetterGrade::from_percent(92.99), LetterGrade::AMinus);
        assert_eq!(LetterGrade::from_percent(60.0), LetterGrade::DMinus);
        assert_eq!(LetterGrade::from_percent(59.99), LetterGrade::F);
        assert_eq!(LetterGrade::CPlus.to_string(), "C+");
    }

    #[test]
    fn category_matching() {
        assert_eq!(
            Criterion::from_category("Image Citation & Attribution"),
            Some(Criterion::ImageCitations)
        );
        assert_eq!(
            Criterion::from_category("**Citation of Architect Biography**"),
            Some(Criterion::BiographyReferences)
        );
        assert_eq!(Criterion::from_category("Weather"), None);
    }

    #[test]
    fn no_summary_block_scans_everything() {
        let scores = parse_summary_scores("8. Image Relevance: 3/5\nnoise");
        assert_eq!(scores[&Criterion::ImageRelevance], 3);
    }
}
