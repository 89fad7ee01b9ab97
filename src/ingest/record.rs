//! Typed response records
//!
//! One [`RawRecord`] per source row. Column positions follow
//! [`SOURCE_COLUMNS`]; the meaning of the correctness column depends on the
//! subject and is captured by [`AnswerValue`].

use std::fmt;
use std::str::FromStr;

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use super::error::{IngestError, IngestResult};
use crate::database::schema::SOURCE_COLUMNS;

/// Subject names whose rows carry a reading level instead of a correctness flag
pub const READING_SUBJECTS: [&str; 2] = ["leitura", "reading"];

/// True for the reading-proficiency subject
pub fn is_reading_subject(subject: &str) -> bool {
    let subject = subject.trim();
    READING_SUBJECTS
        .iter()
        .any(|s| subject.eq_ignore_ascii_case(s))
}

/// Reading proficiency levels, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProficiencyLevel {
    NaoLeitor,
    Silabas,
    Palavras,
    Frases,
    NaoFluente,
    Fluente,
}

impl ProficiencyLevel {
    pub const ALL: [ProficiencyLevel; 6] = [
        ProficiencyLevel::NaoLeitor,
        ProficiencyLevel::Silabas,
        ProficiencyLevel::Palavras,
        ProficiencyLevel::Frases,
        ProficiencyLevel::NaoFluente,
        ProficiencyLevel::Fluente,
    ];

    /// Token used in source files and in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            ProficiencyLevel::NaoLeitor => "nao_leitor",
            ProficiencyLevel::Silabas => "silabas",
            ProficiencyLevel::Palavras => "palavras",
            ProficiencyLevel::Frases => "frases",
            ProficiencyLevel::NaoFluente => "nao_fluente",
            ProficiencyLevel::Fluente => "fluente",
        }
    }

    /// 1 for the lowest level up to 6 for the highest
    pub fn rank(&self) -> u8 {
        match self {
            ProficiencyLevel::NaoLeitor => 1,
            ProficiencyLevel::Silabas => 2,
            ProficiencyLevel::Palavras => 3,
            ProficiencyLevel::Frases => 4,
            ProficiencyLevel::NaoFluente => 5,
            ProficiencyLevel::Fluente => 6,
        }
    }

    /// Display label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            ProficiencyLevel::NaoLeitor => "Não Leitor",
            ProficiencyLevel::Silabas => "Leitor de Sílabas",
            ProficiencyLevel::Palavras => "Leitor de Palavras",
            ProficiencyLevel::Frases => "Leitor de Frases",
            ProficiencyLevel::NaoFluente => "Não Fluente",
            ProficiencyLevel::Fluente => "Leitor Fluente",
        }
    }

    /// SQL `CASE` mapping a token column to its rank
    pub fn rank_case_sql(column: &str) -> String {
        let arms: Vec<String> = Self::ALL
            .iter()
            .map(|l| format!("WHEN '{}' THEN {}", l.as_str(), l.rank()))
            .collect();
        format!("CASE {} {} END", column, arms.join(" "))
    }
}

impl fmt::Display for ProficiencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProficiencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Self::ALL
            .into_iter()
            .find(|l| token.eq_ignore_ascii_case(l.as_str()))
            .ok_or_else(|| format!("unknown reading level {:?}", s))
    }
}

/// What a response row says about the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerValue {
    Correctness(bool),
    ProficiencyLevel(ProficiencyLevel),
}

impl AnswerValue {
    /// Value of the `correct` column; reading rows store NULL
    pub fn correct_flag(&self) -> Option<i32> {
        match self {
            AnswerValue::Correctness(true) => Some(1),
            AnswerValue::Correctness(false) => Some(0),
            AnswerValue::ProficiencyLevel(_) => None,
        }
    }
}

/// One student-question response
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub geography_code: Option<String>,
    pub geography_name: Option<String>,
    pub institution_code: String,
    pub institution_name: Option<String>,
    pub grade_number: Option<i32>,
    pub grade_name: Option<String>,
    pub period_code: Option<String>,
    pub period_name: Option<String>,
    pub student_id: i64,
    pub student_name: Option<String>,
    pub student_national_id: Option<String>,
    pub assessment_name: Option<String>,
    pub assessment_year: Option<i32>,
    pub subject_name: String,
    pub test_name: Option<String>,
    pub question_order: Option<i32>,
    pub raw_answer: Option<String>,
    pub answer: AnswerValue,
    pub descriptor_code: Option<String>,
    pub descriptor_text: Option<String>,
}

/// Check that a header row matches the source layout exactly
pub fn validate_header(file: &str, header: &StringRecord) -> IngestResult<()> {
    if header.len() != SOURCE_COLUMNS.len() {
        return Err(IngestError::mismatch(
            file,
            format!(
                "expected {} columns, found {}",
                SOURCE_COLUMNS.len(),
                header.len()
            ),
        ));
    }

    for (position, (found, expected)) in header.iter().zip(SOURCE_COLUMNS).enumerate() {
        let found = found.strip_prefix('\u{feff}').unwrap_or(found);
        if found != expected {
            return Err(IngestError::mismatch(
                file,
                format!(
                    "column {} is {:?}, expected {:?}",
                    position + 1,
                    found,
                    expected
                ),
            ));
        }
    }

    Ok(())
}

fn text(record: &StringRecord, i: usize) -> Option<String> {
    record
        .get(i)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(record: &StringRecord, i: usize) -> Result<String, String> {
    text(record, i).ok_or_else(|| format!("{} is empty", SOURCE_COLUMNS[i]))
}

fn integer<T: FromStr>(record: &StringRecord, i: usize) -> Result<Option<T>, String> {
    match text(record, i) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| format!("{} is not an integer: {:?}", SOURCE_COLUMNS[i], s)),
    }
}

impl RawRecord {
    /// Build a record from a data row
    ///
    /// The error string names the offending column; the loader adds the file
    /// and line.
    pub fn from_row(row: &StringRecord) -> Result<Self, String> {
        if row.len() != SOURCE_COLUMNS.len() {
            return Err(format!(
                "expected {} fields, found {}",
                SOURCE_COLUMNS.len(),
                row.len()
            ));
        }

        let subject_name = required(row, 13)?;
        let flag = text(row, 17);
        let raw_answer = text(row, 16);

        let answer = if is_reading_subject(&subject_name) {
            match flag.as_deref() {
                None | Some("0") => {}
                Some(other) => {
                    return Err(format!(
                        "ATR_CERTO must be empty or 0 for reading rows, got {:?}",
                        other
                    ));
                }
            }
            let token = raw_answer
                .as_deref()
                .ok_or_else(|| "ATR_RESPOSTA is empty on a reading row".to_string())?;
            AnswerValue::ProficiencyLevel(token.parse()?)
        } else {
            match flag.as_deref() {
                Some("1") => AnswerValue::Correctness(true),
                Some("0") => AnswerValue::Correctness(false),
                other => {
                    return Err(format!("ATR_CERTO must be 0 or 1, got {:?}", other));
                }
            }
        };

        let student_id = required(row, 8)?
            .parse()
            .map_err(|_| format!("ALU_ID is not an integer: {:?}", row.get(8).unwrap_or("")))?;

        // Reading rows keep the canonical token so the rebuild can rank it
        let raw_answer = match answer {
            AnswerValue::ProficiencyLevel(level) => Some(level.as_str().to_string()),
            AnswerValue::Correctness(_) => raw_answer,
        };

        Ok(Self {
            geography_code: text(row, 0),
            geography_name: text(row, 1),
            institution_code: required(row, 2)?,
            institution_name: text(row, 3),
            grade_number: integer(row, 4)?,
            grade_name: text(row, 5),
            period_code: text(row, 6),
            period_name: text(row, 7),
            student_id,
            student_name: text(row, 9),
            student_national_id: text(row, 10),
            assessment_name: text(row, 11),
            assessment_year: integer(row, 12)?,
            subject_name,
            test_name: text(row, 14),
            question_order: integer(row, 15)?,
            raw_answer,
            answer,
            descriptor_code: text(row, 18),
            descriptor_text: text(row, 19),
        })
    }
}
