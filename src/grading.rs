use serde::Serialize;
use serde_json::json;

pub const EXAM_COMPONENT_MAX: f64 = 30.0;
pub const ATTENDANCE_MAX: f64 = 10.0;
/// Applied twice: to exam points alone (attendance eligibility) and to the
/// total (overall pass/fail).
pub const PASS_THRESHOLD: f64 = 51.0;
pub const FAILING_GRADE: u8 = 5;

// Upper bounds are inclusive and checked in ascending order; totals that fall
// between two bands (possible with fractional scores) take the next band up.
const GRADE_BANDS: [(f64, u8); 5] = [
    (60.0, 6),
    (70.0, 7),
    (80.0, 8),
    (90.0, 9),
    (100.0, 10),
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("missing score: {field}")]
    Missing { field: &'static str },
    #[error("{field} must be a number")]
    NotNumeric { field: &'static str },
}

impl ScoreError {
    pub fn code(&self) -> &'static str {
        match self {
            ScoreError::OutOfRange { .. } | ScoreError::NotNumeric { .. } => "invalid_score",
            ScoreError::Missing { .. } => "missing_score",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            ScoreError::OutOfRange {
                field,
                value,
                min,
                max,
            } => json!({ "field": field, "value": value, "min": min, "max": max }),
            ScoreError::Missing { field } | ScoreError::NotNumeric { field } => {
                json!({ "field": field })
            }
        }
    }
}

/// One student's raw scores for an exam attempt: two midterms and a final
/// (0-30 each) plus attendance (0-10). Construction validates the ranges, so
/// a value that exists is in range; out-of-range input is rejected, never
/// clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScores {
    midterm1: f64,
    midterm2: f64,
    final_exam: f64,
    attendance: f64,
}

fn check_range(field: &'static str, value: f64, max: f64) -> Result<f64, ScoreError> {
    if !(0.0..=max).contains(&value) {
        return Err(ScoreError::OutOfRange {
            field,
            value,
            min: 0.0,
            max,
        });
    }
    Ok(value)
}

impl ComponentScores {
    pub fn new(
        midterm1: f64,
        midterm2: f64,
        final_exam: f64,
        attendance: f64,
    ) -> Result<Self, ScoreError> {
        Ok(Self {
            midterm1: check_range("midterm1", midterm1, EXAM_COMPONENT_MAX)?,
            midterm2: check_range("midterm2", midterm2, EXAM_COMPONENT_MAX)?,
            final_exam: check_range("finalExam", final_exam, EXAM_COMPONENT_MAX)?,
            attendance: check_range("attendance", attendance, ATTENDANCE_MAX)?,
        })
    }

    /// Reads `{midterm1, midterm2, finalExam, attendance}` from request JSON.
    /// Absent or null fields are an error, not zero; the caller must say what
    /// it means.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, ScoreError> {
        fn field(raw: &serde_json::Value, key: &'static str) -> Result<f64, ScoreError> {
            match raw.get(key) {
                None => Err(ScoreError::Missing { field: key }),
                Some(v) if v.is_null() => Err(ScoreError::Missing { field: key }),
                Some(v) => v.as_f64().ok_or(ScoreError::NotNumeric { field: key }),
            }
        }

        Self::new(
            field(raw, "midterm1")?,
            field(raw, "midterm2")?,
            field(raw, "finalExam")?,
            field(raw, "attendance")?,
        )
    }

    pub fn midterm1(&self) -> f64 {
        self.midterm1
    }

    pub fn midterm2(&self) -> f64 {
        self.midterm2
    }

    pub fn final_exam(&self) -> f64 {
        self.final_exam
    }

    pub fn attendance(&self) -> f64 {
        self.attendance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResult {
    pub exam_points: f64,
    pub attendance_bonus: f64,
    pub total_points: f64,
    pub grade: u8,
    pub passed: bool,
}

/// Converts validated component scores into the final verdict. Attendance
/// counts only once the three exam components alone reach the passing
/// threshold; a failing attempt is always reported as grade 5, regardless of
/// its point total. Pure: no I/O, no shared state.
pub fn compute_grade(scores: &ComponentScores) -> GradeResult {
    let exam_points = scores.midterm1 + scores.midterm2 + scores.final_exam;
    let attendance_bonus = if exam_points >= PASS_THRESHOLD {
        scores.attendance
    } else {
        0.0
    };
    let total_points = exam_points + attendance_bonus;
    let passed = total_points >= PASS_THRESHOLD;
    let grade = if passed {
        grade_for_total(total_points)
    } else {
        FAILING_GRADE
    };

    GradeResult {
        exam_points,
        attendance_bonus,
        total_points,
        grade,
        passed,
    }
}

fn grade_for_total(total: f64) -> u8 {
    for (upper, grade) in GRADE_BANDS {
        if total <= upper {
            return grade;
        }
    }
    // Unreachable for validated scores (total <= 100); the top band absorbs
    // anything else rather than panicking.
    GRADE_BANDS[GRADE_BANDS.len() - 1].1
}

/// Arithmetic mean of numeric grades, rounded to two decimals. `None` when
/// there is nothing to average.
pub fn grade_point_average<I>(grades: I) -> Option<f64>
where
    I: IntoIterator<Item = u8>,
{
    let mut sum: f64 = 0.0;
    let mut count: usize = 0;
    for g in grades {
        sum += g as f64;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some((100.0 * sum / (count as f64)).round() / 100.0)
}
