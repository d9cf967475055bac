//! Grouping tasks, grades and graded results.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

// =============================================================================
// Range bounds
// =============================================================================

/// One end of a range. Infinite ends serialize as `"inf"` / `"-inf"` since
/// JSON has no infinity literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound(pub f64);

impl Serialize for Bound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_finite() {
            serializer.serialize_f64(self.0)
        } else if self.0 == f64::INFINITY {
            serializer.serialize_str("inf")
        } else if self.0 == f64::NEG_INFINITY {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_str("nan")
        }
    }
}

impl<'de> Deserialize<'de> for Bound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawBound {
            Number(f64),
            Text(String),
        }

        match RawBound::deserialize(deserializer)? {
            RawBound::Number(v) => Ok(Bound(v)),
            RawBound::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" | "+infinity" => Ok(Bound(f64::INFINITY)),
                "-inf" | "-infinity" => Ok(Bound(f64::NEG_INFINITY)),
                other => other
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(Bound)
                    .ok_or_else(|| de::Error::custom(format!("invalid range bound: {s:?}"))),
            },
        }
    }
}

// =============================================================================
// Value ranges
// =============================================================================

/// A `(low, high)` range. Either end may be infinite.
///
/// Serialized as a two-element array, e.g. `[0, 12]` or `[65, "inf"]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Bound, Bound)", into = "(Bound, Bound)")]
pub struct ValueRange {
    pub low: f64,
    pub high: f64,
}

impl From<(Bound, Bound)> for ValueRange {
    fn from((low, high): (Bound, Bound)) -> Self {
        Self {
            low: low.0,
            high: high.0,
        }
    }
}

impl From<ValueRange> for (Bound, Bound) {
    fn from(range: ValueRange) -> Self {
        (Bound(range.low), Bound(range.high))
    }
}

impl From<(f64, f64)> for ValueRange {
    fn from((low, high): (f64, f64)) -> Self {
        Self::new(low, high)
    }
}

impl ValueRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// `(-inf, high)`
    pub const fn below(high: f64) -> Self {
        Self::new(f64::NEG_INFINITY, high)
    }

    /// `(low, +inf)`
    pub const fn above(low: f64) -> Self {
        Self::new(low, f64::INFINITY)
    }

    /// `(-inf, +inf)`
    pub const fn unbounded() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn is_unbounded_below(&self) -> bool {
        self.low == f64::NEG_INFINITY
    }

    pub fn is_unbounded_above(&self) -> bool {
        self.high == f64::INFINITY
    }

    /// Render as a grouping entry: "lower than h", "more than l", "l-h",
    /// or "any value" when both ends are open.
    pub fn render_group(&self) -> String {
        match (self.is_unbounded_below(), self.is_unbounded_above()) {
            (true, true) => "any value".to_string(),
            (true, false) => format!("lower than {}", format_number(self.high)),
            (false, true) => format!("more than {}", format_number(self.low)),
            (false, false) => format!(
                "{}-{}",
                format_number(self.low),
                format_number(self.high)
            ),
        }
    }

    /// Render as the full domain of a feature.
    pub fn render_domain(&self) -> String {
        let low = if self.is_unbounded_below() {
            "-infinity".to_string()
        } else {
            format_number(self.low)
        };
        let high = if self.is_unbounded_above() {
            "+infinity".to_string()
        } else {
            format_number(self.high)
        };
        format!("from {low} to {high}")
    }

    /// Reject bounds no reader could interpret.
    pub fn validate(&self) -> Result<(), String> {
        if self.low.is_nan() || self.high.is_nan() {
            return Err(format!("range {} has a NaN bound", self));
        }
        if self.low == f64::INFINITY {
            return Err("range low bound is +infinity".to_string());
        }
        if self.high == f64::NEG_INFINITY {
            return Err("range high bound is -infinity".to_string());
        }
        if self.low > self.high {
            return Err(format!(
                "range low {} exceeds high {}",
                format_number(self.low),
                format_number(self.high)
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_group())
    }
}

/// Shortest decimal form: `12`, `18.5`, `-30`.
fn format_number(v: f64) -> String {
    if v == 0.0 {
        // Avoid "-0"
        return "0".to_string();
    }
    format!("{v}")
}

// =============================================================================
// Tasks
// =============================================================================

/// One feature, its full domain and a proposed partition into groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingTask {
    pub feature_name: String,
    pub domain_range: ValueRange,
    pub groups: Vec<ValueRange>,
}

impl GroupingTask {
    pub fn new(
        feature_name: impl Into<String>,
        groups: impl IntoIterator<Item = ValueRange>,
        domain_range: ValueRange,
    ) -> Self {
        Self {
            feature_name: feature_name.into(),
            domain_range,
            groups: groups.into_iter().collect(),
        }
    }

    /// Groups joined as they appear in the prompt, e.g. "0-12, 13-19, more than 65".
    pub fn grouping_string(&self) -> String {
        self.groups
            .iter()
            .map(ValueRange::render_group)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Structural checks only; contiguity and overlap are left to the caller.
    pub fn validate(&self) -> Result<(), String> {
        if self.feature_name.trim().is_empty() {
            return Err("feature name is empty".to_string());
        }
        if self.groups.is_empty() {
            return Err(format!("feature {:?} has no groups", self.feature_name));
        }
        self.domain_range
            .validate()
            .map_err(|e| format!("feature {:?} domain: {e}", self.feature_name))?;
        for (idx, group) in self.groups.iter().enumerate() {
            group
                .validate()
                .map_err(|e| format!("feature {:?} group {}: {e}", self.feature_name, idx + 1))?;
        }
        Ok(())
    }
}

// =============================================================================
// Grades
// =============================================================================

/// Ordinal usage grade, 1 (never used) to 4 (very common).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Grade(u8);

impl Grade {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 4;

    /// Grade definitions in ascending order, as stated to the model.
    pub const DEFINITIONS: [(u8, &'static str); 4] = [
        (1, "Not used at all"),
        (2, "Very few references"),
        (3, "Rare but used"),
        (4, "Very commonly used"),
    ];

    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Grade {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Grade::new(value).ok_or_else(|| format!("grade {value} outside 1-4"))
    }
}

impl From<Grade> for u8 {
    fn from(grade: Grade) -> Self {
        grade.0
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Parsed outcome for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingResult {
    pub grade: Grade,
    pub explanation: String,
    /// Free text: a number, a range or a qualitative phrase.
    pub reference_count: String,
    pub reference_links: String,
}

/// A task paired with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedTask {
    pub task: GroupingTask,
    pub result: GradingResult,
}
