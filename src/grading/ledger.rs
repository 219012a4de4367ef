//! Ledger of graded submissions.
//!
//! Each graded submission is kept as one pretty-printed JSON file,
//! `{pid}_{YYYYmmdd_HHMMSS}.json`, in the submissions folder. Listing reads
//! every record back, newest first. A file that does not parse is logged and
//! left out of the listing; it never hides the others.

use super::{Criterion, GradeReport, Grader, LetterGrade, Student};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::aggregate::atomic_write;
use crate::service::sanitize_file_name;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `strftime` format of [`SubmissionRecord::timestamp`].
pub const LEDGER_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One graded submission as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub student_name: String,
    pub student_pid: String,
    pub architect_name: String,
    /// Local time, `YYYYmmdd_HHMMSS`; sorts chronologically as text.
    pub timestamp: String,
    pub grade: LetterGrade,
    /// Final percentage.
    pub score: f64,
    pub rubric_scores: BTreeMap<Criterion, u8>,
    pub detailed_evaluation: String,
}

impl SubmissionRecord {
    pub fn new(student: &Student, report: &GradeReport, graded_at: DateTime<Local>) -> Self {
        Self {
            student_name: student.name.clone(),
            student_pid: student.pid.clone(),
            architect_name: report.architect.clone(),
            timestamp: graded_at.format(LEDGER_TIMESTAMP_FORMAT).to_string(),
            grade: report.scorecard.grade,
            score: report.scorecard.final_percent,
            rubric_scores: report.scorecard.scores.clone(),
            detailed_evaluation: report.evaluation.clone(),
        }
    }
}

/// Folder of [`SubmissionRecord`] files.
#[derive(Debug, Clone)]
pub struct SubmissionStore {
    dir: PathBuf,
}

impl SubmissionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.submissions_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `record` and return its path.
    ///
    /// A second record for the same student within the same second gets a
    /// `_2`, `_3`, … suffix instead of replacing the first.
    pub fn save(&self, record: &SubmissionRecord) -> Result<PathBuf, PipelineError> {
        fs::create_dir_all(&self.dir).map_err(PipelineError::io(&self.dir))?;

        let pid = sanitize_file_name(&record.student_pid).unwrap_or_else(|| "unknown".to_string());
        let stem = format!("{}_{}", pid, record.timestamp);
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut n = 2;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.json"));
            n += 1;
        }

        atomic_write(&path, |file| {
            serde_json::to_writer_pretty(&mut *file, record).map_err(|source| {
                PipelineError::Ledger {
                    path: path.clone(),
                    source,
                }
            })?;
            file.write_all(b"\n").map_err(PipelineError::io(&path))
        })?;
        info!("Submission recorded: {}", path.display());
        Ok(path)
    }

    /// Every stored record, newest first. An absent folder is an empty ledger.
    pub fn list(&self) -> Result<Vec<SubmissionRecord>, PipelineError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&self.dir)(e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(PipelineError::io(&self.dir))?.path();
            if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records: Vec<SubmissionRecord> = paths
            .iter()
            .filter_map(|path| match read_record(path) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping submission record: {}", e);
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<SubmissionRecord, PipelineError> {
    let text = fs::read_to_string(path).map_err(PipelineError::io(path))?;
    serde_json::from_str(&text).map_err(|source| PipelineError::Ledger {
        path: path.to_path_buf(),
        source,
    })
}

/// Everything one grading request produced.
#[derive(Debug, Clone, Serialize)]
pub struct GradedSubmission {
    pub report: GradeReport,
    /// Student-facing feedback.
    pub feedback: String,
    pub record: SubmissionRecord,
    pub record_path: PathBuf,
}

/// Grade `pdf`, ask for student feedback, then record the result.
///
/// Nothing is recorded if grading or feedback fails.
pub async fn grade_and_record(
    grader: &dyn Grader,
    store: &SubmissionStore,
    pdf: &Path,
    student: &Student,
    architect: &str,
) -> Result<GradedSubmission, PipelineError> {
    let report = grader.grade(pdf, architect).await?;
    let feedback = grader.feedback(student, &report).await?;
    let record = SubmissionRecord::new(student, &report, Local::now());

    let writer = store.clone();
    let to_write = record.clone();
    let record_path = tokio::task::spawn_blocking(move || writer.save(&to_write))
        .await
        .map_err(|e| PipelineError::TaskPanicked {
            stage: "Submission record",
            detail: e.to_string(),
        })??;

    Ok(GradedSubmission {
        report,
        feedback,
        record,
        record_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REPLY: &str = "**Final Summary:**\n\
1. Architect Selection & Scope: 5/5\n\
2. Organization & Document Setup: 4/5\n\
5. Selection & Quality of Images: 3/5\n";

    fn student() -> Student {
        Student::new("Ada Lovelace", "A1234567")
    }

    fn at(hour: u32, sec: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 3, 14, hour, 0, sec)
            .single()
            .unwrap()
    }

    fn record(pid: &str, graded_at: DateTime<Local>) -> SubmissionRecord {
        let report = GradeReport::from_evaluation("Zaha Hadid", REPLY.to_string());
        SubmissionRecord::new(&Student::new("S", pid), &report, graded_at)
    }

    #[test]
    fn record_carries_report_fields() {
        let report = GradeReport::from_evaluation("Zaha Hadid", REPLY.to_string());
        let r = SubmissionRecord::new(&student(), &report, at(9, 5));
        assert_eq!(r.student_pid, "A1234567");
        assert_eq!(r.architect_name, "Zaha Hadid");
        assert_eq!(r.timestamp, "20260314_090005");
        assert_eq!(r.score, 24.0);
        assert_eq!(r.grade, LetterGrade::F);
        assert_eq!(r.rubric_scores[&Criterion::ImageQuality], 3);
        assert_eq!(r.detailed_evaluation, REPLY);
    }

    #[test]
    fn save_names_file_by_pid_and_time() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SubmissionStore::new(tmp.path().join("submissions"));
        let path = store.save(&record("A1234567", at(9, 5))).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "A1234567_20260314_090005.json"
        );

        let again = store.save(&record("A1234567", at(9, 5))).unwrap();
        assert_eq!(
            again.file_name().unwrap().to_string_lossy(),
            "A1234567_20260314_090005_2.json"
        );

        let odd = store.save(&record("../x y", at(9, 6))).unwrap();
        assert_eq!(odd.parent().unwrap(), store.dir());
    }

    #[test]
    fn list_is_newest_first_and_skips_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SubmissionStore::new(tmp.path());
        assert!(store.list().unwrap().is_empty());

        store.save(&record("B2", at(8, 0))).unwrap();
        store.save(&record("A1", at(10, 0))).unwrap();
        store.save(&record("C3", at(9, 0))).unwrap();
        fs::write(tmp.path().join("broken.json"), "{").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignore me").unwrap();

        let pids: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.student_pid)
            .collect();
        assert_eq!(pids, ["A1", "C3", "B2"]);
    }

    #[test]
    fn missing_folder_is_empty_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SubmissionStore::new(tmp.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
        assert!(!store.dir().exists());
    }

    struct CannedGrader {
        feedback_calls: AtomicUsize,
        fail_feedback: bool,
    }

    #[async_trait]
    impl Grader for CannedGrader {
        async fn grade(&self, _pdf: &Path, architect: &str) -> Result<GradeReport, PipelineError> {
            Ok(GradeReport::from_evaluation(architect, REPLY.to_string()))
        }

        async fn feedback(
            &self,
            student: &Student,
            report: &GradeReport,
        ) -> Result<String, PipelineError> {
            self.feedback_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_feedback {
                return Err(PipelineError::LlmApiError {
                    message: "quota".into(),
                });
            }
            Ok(format!(
                "{}: {} ({}%)",
                student.name, report.scorecard.grade, report.scorecard.final_percent
            ))
        }
    }

    #[tokio::test]
    async fn grade_and_record_stores_one_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SubmissionStore::new(tmp.path());
        let grader = CannedGrader {
            feedback_calls: AtomicUsize::new(0),
            fail_feedback: false,
        };

        let done = grade_and_record(&grader, &store, Path::new("s.pdf"), &student(), "Zaha Hadid")
            .await
            .unwrap();
        assert_eq!(done.feedback, "Ada Lovelace: F (24%)");
        assert_eq!(grader.feedback_calls.load(Ordering::SeqCst), 1);
        assert!(done.record_path.is_file());

        let listed = store.list().unwrap();
        assert_eq!(listed, [done.record]);
    }

    #[tokio::test]
    async fn failed_feedback_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SubmissionStore::new(tmp.path());
        let grader = CannedGrader {
            feedback_calls: AtomicUsize::new(0),
            fail_feedback: true,
        };

        let err = grade_and_record(&grader, &store, Path::new("s.pdf"), &student(), "Zaha Hadid")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LlmApiError { .. }));
        assert!(store.list().unwrap().is_empty());
    }
}
