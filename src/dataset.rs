//! Questionnaire responses loaded from CSV.
//!
//! Layout: a leading index column (ignored), a respondent id column, then one
//! column per question holding an integer grade. Blank cells are missing.

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::stats::{
    category_counts, column_means, compare_ranking, fleiss_kappa, krippendorff_alpha_ordinal,
    RankingComparison, StatsError,
};

/// Grade categories respondents choose from.
pub const CATEGORIES: [i64; 4] = [1, 2, 3, 4];

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("expected an index column, an id column and at least one question, found {0} columns")]
    TooFewColumns(usize),
    #[error("row {row}, column {column:?}: {value:?} is not an integer grade")]
    InvalidGrade {
        row: usize,
        column: String,
        value: String,
    },
    #[error("no respondent rows")]
    Empty,
    #[error(transparent)]
    Stats(#[from] StatsError),
}

impl DatasetError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Csv(_) => "csv_error",
            Self::TooFewColumns(_) => "too_few_columns",
            Self::InvalidGrade { .. } => "invalid_grade",
            Self::Empty => "empty",
            Self::Stats(e) => e.code(),
        }
    }
}

/// Respondents × questions grade matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTable {
    pub ids: Vec<String>,
    pub questions: Vec<String>,
    /// One row per respondent, one entry per question.
    pub ratings: Vec<Vec<Option<i64>>>,
}

pub fn load_responses(path: impl AsRef<Path>) -> Result<ResponseTable, DatasetError> {
    let file = std::fs::File::open(path.as_ref())?;
    from_reader(file)
}

pub fn from_reader<R: Read>(reader: R) -> Result<ResponseTable, DatasetError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    if headers.len() < 3 {
        return Err(DatasetError::TooFewColumns(headers.len()));
    }
    let questions: Vec<String> = headers.iter().skip(2).map(str::to_string).collect();

    let mut ids = Vec::new();
    let mut ratings = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        ids.push(record.get(1).unwrap_or_default().to_string());

        let mut grades = Vec::with_capacity(questions.len());
        for (col, cell) in record.iter().skip(2).enumerate() {
            let grade = parse_cell(cell).ok_or_else(|| DatasetError::InvalidGrade {
                row: row + 1,
                column: questions[col].clone(),
                value: cell.to_string(),
            })?;
            grades.push(grade);
        }
        ratings.push(grades);
    }

    if ratings.is_empty() {
        return Err(DatasetError::Empty);
    }
    debug!(
        respondents = ratings.len(),
        questions = questions.len(),
        "loaded responses"
    );

    let table = ResponseTable {
        ids,
        questions,
        ratings,
    };
    if table.has_missing() {
        warn!("missing ratings detected; agreement statistics skip them");
    }
    Ok(table)
}

/// `""` is missing; `"3"` and `"3.0"` are grade 3; anything else is invalid.
fn parse_cell(cell: &str) -> Option<Option<i64>> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Some(None);
    }
    if let Ok(v) = cell.parse::<i64>() {
        return Some(Some(v));
    }
    let v = cell.parse::<f64>().ok()?;
    (v.fract() == 0.0 && v.is_finite()).then_some(Some(v as i64))
}

impl ResponseTable {
    pub fn has_missing(&self) -> bool {
        self.ratings.iter().flatten().any(Option::is_none)
    }

    /// Mean grade per question.
    pub fn quiz_vector(&self) -> Result<Vec<f64>, StatsError> {
        column_means(&self.ratings)
    }

    /// Raters × units matrix for Krippendorff's alpha.
    pub fn reliability_data(&self) -> &[Vec<Option<i64>>] {
        &self.ratings
    }

    /// Questions × categories counts for Fleiss' kappa.
    pub fn category_table(&self) -> Vec<Vec<u32>> {
        category_counts(&self.ratings, &CATEGORIES)
    }

    /// Kappa, alpha and the quiz vector, plus one comparison per named ranking.
    pub fn agreement(&self, rankings: &[(String, Vec<f64>)]) -> Result<AgreementReport, DatasetError> {
        let fleiss_kappa = match fleiss_kappa(&self.category_table()) {
            Ok(k) => Some(k),
            Err(err) => {
                warn!(error = %err, "fleiss kappa undefined for this table");
                None
            }
        };
        let krippendorff_alpha = krippendorff_alpha_ordinal(self.reliability_data())?;
        let quiz_vector = self.quiz_vector()?;

        let rankings = rankings
            .iter()
            .map(|(name, ranking)| compare_ranking(name.clone(), ranking, &quiz_vector))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AgreementReport {
            respondents: self.ratings.len(),
            questions: self.questions.len(),
            fleiss_kappa,
            krippendorff_alpha,
            quiz_vector,
            rankings,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgreementReport {
    pub respondents: usize,
    pub questions: usize,
    /// `None` when respondents skipped questions (unequal rater counts).
    pub fleiss_kappa: Option<f64>,
    pub krippendorff_alpha: f64,
    pub quiz_vector: Vec<f64>,
    pub rankings: Vec<RankingComparison>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
,ID,Q1,Q2,Q3
0,r1,4,2,1
1,r2,4,3,1.0
2,r3,3,,2
";

    #[test]
    fn loads_ids_questions_and_grades() {
        let table = from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.ids, vec!["r1", "r2", "r3"]);
        assert_eq!(table.questions, vec!["Q1", "Q2", "Q3"]);
        assert_eq!(table.ratings[1], vec![Some(4), Some(3), Some(1)]);
        assert_eq!(table.ratings[2], vec![Some(3), None, Some(2)]);
        assert!(table.has_missing());
    }

    #[test]
    fn quiz_vector_averages_present_values() {
        let table = from_reader(SAMPLE.as_bytes()).unwrap();
        let quiz = table.quiz_vector().unwrap();
        assert!((quiz[0] - 11.0 / 3.0).abs() < 1e-12);
        assert!((quiz[1] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn agreement_report_skips_kappa_when_ratings_missing() {
        let table = from_reader(SAMPLE.as_bytes()).unwrap();
        let report = table
            .agreement(&[("gpt".to_string(), vec![4.0, 2.0, 1.0])])
            .unwrap();
        assert_eq!(report.respondents, 3);
        assert!(report.fleiss_kappa.is_none());
        assert!(report.krippendorff_alpha <= 1.0);
        assert_eq!(report.rankings.len(), 1);
        assert_eq!(report.rankings[0].name, "gpt");
    }

    #[test]
    fn complete_table_has_kappa() {
        let csv = ",ID,Q1,Q2\n0,a,1,4\n1,b,1,4\n2,c,2,4\n";
        let report = from_reader(csv.as_bytes()).unwrap().agreement(&[]).unwrap();
        assert!(report.fleiss_kappa.is_some());
    }

    #[test]
    fn rejects_non_integer_grade() {
        let csv = ",ID,Q1\n0,a,2.5\n";
        match from_reader(csv.as_bytes()) {
            Err(DatasetError::InvalidGrade { row, column, .. }) => {
                assert_eq!(row, 1);
                assert_eq!(column, "Q1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_too_few_columns() {
        assert!(matches!(
            from_reader(",ID\n0,a\n".as_bytes()),
            Err(DatasetError::TooFewColumns(2))
        ));
    }
}
