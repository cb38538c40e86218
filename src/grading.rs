//! Derivation of result fields from raw subject marks.
//!
//! Everything here is pure: callers validate and persist.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUBJECT_COUNT: usize = 8;
pub const PASS_MARK: i64 = 40;
pub const MAX_MARKS: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectInput {
    pub name: String,
    pub marks: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "C+")]
    CPlus,
    C,
    #[serde(rename = "D+")]
    DPlus,
    D,
    E,
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Pass,
    Fail,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "Pass",
            Self::Fail => "Fail",
        }
    }
}

/// Lower bound (inclusive) of each band, highest first. Shared by the grade and
/// GPA lookups so both always agree on band edges.
const BANDS: [(f64, Grade, f64); 10] = [
    (90.0, Grade::APlus, 4.0),
    (80.0, Grade::A, 3.7),
    (75.0, Grade::BPlus, 3.3),
    (70.0, Grade::B, 3.0),
    (65.0, Grade::CPlus, 2.7),
    (60.0, Grade::C, 2.3),
    (55.0, Grade::DPlus, 2.0),
    (50.0, Grade::D, 1.7),
    (40.0, Grade::E, 1.0),
    (f64::NEG_INFINITY, Grade::F, 0.0),
];

fn band(marks: f64) -> (Grade, f64) {
    for (floor, grade, gpa) in BANDS {
        if marks >= floor {
            return (grade, gpa);
        }
    }
    (Grade::F, 0.0)
}

/// Letter grade for a subject mark or an overall average.
pub fn grade_for(marks: f64) -> Grade {
    band(marks).0
}

/// 4.0-scale GPA for an overall average.
pub fn gpa_for(average: f64) -> f64 {
    band(average).1
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedSubject {
    pub name: String,
    pub marks: i64,
    pub grade: Grade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedResult {
    pub subjects: Vec<GradedSubject>,
    pub total_marks: i64,
    pub average_marks: f64,
    pub overall_grade: Grade,
    pub gpa: f64,
    pub status: ResultStatus,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeriveError {
    #[error("a result must have exactly 8 subjects, got {found}")]
    InvalidSubjectCount { found: usize },
    #[error("subject {index} ({name}) has invalid marks {marks}: expected an integer 0-100")]
    InvalidMarks {
        index: usize,
        name: String,
        marks: serde_json::Value,
    },
}

impl DeriveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSubjectCount { .. } => "invalid_subject_count",
            Self::InvalidMarks { .. } => "invalid_marks",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InvalidSubjectCount { found } => serde_json::json!({
                "expected": SUBJECT_COUNT,
                "found": found,
            }),
            Self::InvalidMarks { index, name, marks } => serde_json::json!({
                "index": index,
                "name": name,
                "marks": marks,
            }),
        }
    }
}

/// Recomputes every derived field. Fails before producing anything if the input
/// is not exactly eight subjects with marks in `0..=100`.
pub fn derive_result(subjects: &[SubjectInput]) -> Result<DerivedResult, DeriveError> {
    if subjects.len() != SUBJECT_COUNT {
        return Err(DeriveError::InvalidSubjectCount {
            found: subjects.len(),
        });
    }
    for (index, s) in subjects.iter().enumerate() {
        if !(0..=MAX_MARKS).contains(&s.marks) {
            return Err(DeriveError::InvalidMarks {
                index,
                name: s.name.clone(),
                marks: serde_json::json!(s.marks),
            });
        }
    }

    let graded: Vec<GradedSubject> = subjects
        .iter()
        .map(|s| GradedSubject {
            name: s.name.clone(),
            marks: s.marks,
            grade: grade_for(s.marks as f64),
        })
        .collect();
    let total_marks: i64 = subjects.iter().map(|s| s.marks).sum();
    let average_marks = total_marks as f64 / SUBJECT_COUNT as f64;
    let status = if subjects.iter().all(|s| s.marks >= PASS_MARK) {
        ResultStatus::Pass
    } else {
        ResultStatus::Fail
    };

    Ok(DerivedResult {
        subjects: graded,
        total_marks,
        average_marks,
        overall_grade: grade_for(average_marks),
        gpa: gpa_for(average_marks),
        status,
    })
}

#[derive(Debug)]
pub enum SubjectParseError {
    Shape(String),
    Derive(DeriveError),
}

/// Parses `[{name, marks}, ...]` as it arrives over IPC. Count and range checks
/// are left to `derive_result`; this only rejects marks that are not integers.
pub fn parse_subject_items(items: &[serde_json::Value]) -> Result<Vec<SubjectInput>, SubjectParseError> {
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(SubjectParseError::Shape(format!(
                "subjects[{}] must be an object",
                index
            )));
        };
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(SubjectParseError::Shape(format!(
                "subjects[{}].name is required",
                index
            )));
        }
        let raw_marks = obj.get("marks").cloned().unwrap_or(serde_json::Value::Null);
        let Some(marks) = integral_marks(&raw_marks) else {
            return Err(SubjectParseError::Derive(DeriveError::InvalidMarks {
                index,
                name,
                marks: raw_marks,
            }));
        };
        out.push(SubjectInput { name, marks });
    }
    Ok(out)
}

fn integral_marks(v: &serde_json::Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    let f = v.as_f64()?;
    if f.fract() == 0.0 && f.abs() < 1e12 {
        Some(f as i64)
    } else {
        None
    }
}

/// Mean GPA across a student's results, rounded to two decimals.
pub fn summarize_gpa<I>(gpas: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut n = 0usize;
    let mut sum = 0.0;
    for g in gpas {
        n += 1;
        sum += g;
    }
    if n == 0 {
        return 0.0;
    }
    ((sum / n as f64) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects(marks: &[i64]) -> Vec<SubjectInput> {
        marks
            .iter()
            .enumerate()
            .map(|(i, m)| SubjectInput {
                name: format!("Subject {}", i + 1),
                marks: *m,
            })
            .collect()
    }

    #[test]
    fn grade_bands_use_inclusive_lower_bounds() {
        let cases = [
            (100.0, "A+"),
            (90.0, "A+"),
            (89.9, "A"),
            (80.0, "A"),
            (79.0, "B+"),
            (75.0, "B+"),
            (74.0, "B"),
            (70.0, "B"),
            (69.375, "C+"),
            (65.0, "C+"),
            (64.0, "C"),
            (60.0, "C"),
            (59.0, "D+"),
            (55.0, "D+"),
            (54.0, "D"),
            (50.0, "D"),
            (49.0, "E"),
            (40.0, "E"),
            (39.0, "F"),
            (0.0, "F"),
        ];
        for (marks, expected) in cases {
            assert_eq!(grade_for(marks).as_str(), expected, "marks {}", marks);
        }
    }

    #[test]
    fn gpa_bands_follow_average() {
        assert_eq!(gpa_for(95.0), 4.0);
        assert_eq!(gpa_for(80.0), 3.7);
        assert_eq!(gpa_for(77.5), 3.3);
        assert_eq!(gpa_for(70.0), 3.0);
        assert_eq!(gpa_for(69.375), 2.7);
        assert_eq!(gpa_for(60.0), 2.3);
        assert_eq!(gpa_for(55.0), 2.0);
        assert_eq!(gpa_for(50.0), 1.7);
        assert_eq!(gpa_for(40.0), 1.0);
        assert_eq!(gpa_for(39.99), 0.0);
    }

    #[test]
    fn mixed_marks_derive_expected_aggregate() {
        let input = subjects(&[95, 85, 76, 71, 66, 61, 56, 45]);
        let d = derive_result(&input).expect("derive");
        assert_eq!(d.total_marks, 555);
        assert!((d.average_marks - 69.375).abs() < 1e-12);
        assert_eq!(d.overall_grade, Grade::CPlus);
        assert_eq!(d.gpa, 2.7);
        assert_eq!(d.status, ResultStatus::Pass);
        let grades: Vec<&str> = d.subjects.iter().map(|s| s.grade.as_str()).collect();
        assert_eq!(grades, vec!["A+", "A", "B+", "B", "C+", "C", "D+", "E"]);

        assert_eq!(derive_result(&input).expect("derive again"), d);
    }

    #[test]
    fn pass_mark_boundary() {
        let at_forty = derive_result(&subjects(&[40, 90, 90, 90, 90, 90, 90, 90])).expect("derive");
        assert_eq!(at_forty.subjects[0].grade, Grade::E);
        assert_eq!(at_forty.status, ResultStatus::Pass);

        let at_39 = derive_result(&subjects(&[39, 100, 100, 100, 100, 100, 100, 100])).expect("derive");
        assert_eq!(at_39.subjects[0].grade, Grade::F);
        assert_eq!(at_39.status, ResultStatus::Fail);
        // A single failed subject does not drag the overall grade down to F.
        assert_eq!(at_39.overall_grade, Grade::APlus);
    }

    #[test]
    fn rejects_wrong_subject_count() {
        for n in [0usize, 7, 9] {
            let input = subjects(&vec![50; n]);
            assert_eq!(
                derive_result(&input),
                Err(DeriveError::InvalidSubjectCount { found: n })
            );
        }
    }

    #[test]
    fn rejects_out_of_range_marks() {
        for bad in [101, -1] {
            let mut input = subjects(&[50; 8]);
            input[3].marks = bad;
            let e = derive_result(&input).expect_err("out of range");
            assert_eq!(e.code(), "invalid_marks");
            assert_eq!(e.details()["index"], 3);
            assert_eq!(e.details()["marks"], bad);
        }
    }

    #[test]
    fn parse_rejects_fractional_marks_but_accepts_integral_floats() {
        let raw = serde_json::json!([
            { "name": "Math", "marks": 70.0 },
            { "name": "Physics", "marks": 70.5 }
        ]);
        let items = raw.as_array().expect("array");
        match parse_subject_items(items) {
            Err(SubjectParseError::Derive(DeriveError::InvalidMarks { index, name, .. })) => {
                assert_eq!(index, 1);
                assert_eq!(name, "Physics");
            }
            other => panic!("unexpected: {:?}", other),
        }
        let ok = parse_subject_items(&items[..1]).expect("integral float");
        assert_eq!(ok[0].marks, 70);
    }

    #[test]
    fn gpa_summary_rounds_to_two_decimals() {
        assert_eq!(summarize_gpa(Vec::<f64>::new()), 0.0);
        assert_eq!(summarize_gpa([3.7, 3.3, 2.7]), 3.23);
    }
}
