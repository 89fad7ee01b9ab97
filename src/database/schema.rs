//! Warehouse schema definitions
//!
//! The raw table mirrors the 20-column source extract one-to-one, plus the
//! name of the file each row was loaded from. Every other
//! table is derived from it by the star schema rebuild and can be dropped and
//! recreated at any time.

/// Raw response table
pub const RAW_TABLE: &str = "raw";
/// Student dimension
pub const DIM_STUDENT: &str = "dim_student";
/// School dimension
pub const DIM_SCHOOL: &str = "dim_school";
/// Descriptor dimension
pub const DIM_DESCRIPTOR: &str = "dim_descriptor";
/// Aggregated response fact
pub const FACT_RESPONSE_SUMMARY: &str = "fact_response_summary";
/// Reading proficiency fact
pub const FACT_READING_PROFICIENCY: &str = "fact_reading_proficiency";

/// Header names of the source extract, in the required order
pub const SOURCE_COLUMNS: [&str; 20] = [
    "MUN_UF",
    "MUN_NOME",
    "ESC_INEP",
    "ESC_NOME",
    "SER_NUMBER",
    "SER_NOME",
    "TUR_PERIODO",
    "TUR_NOME",
    "ALU_ID",
    "ALU_NOME",
    "ALU_CPF",
    "AVA_NOME",
    "AVA_ANO",
    "DIS_NOME",
    "TES_NOME",
    "TEG_ORDEM",
    "ATR_RESPOSTA",
    "ATR_CERTO",
    "MTI_CODIGO",
    "MTI_DESCRITOR",
];

/// Raw table column names, positionally matching `SOURCE_COLUMNS`
pub const RAW_COLUMNS: [&str; 20] = [
    "geography_code",
    "geography_name",
    "institution_code",
    "institution_name",
    "grade_number",
    "grade_name",
    "period_code",
    "period_name",
    "student_id",
    "student_name",
    "student_national_id",
    "assessment_name",
    "assessment_year",
    "subject_name",
    "test_name",
    "question_order",
    "raw_answer",
    "correct",
    "descriptor_code",
    "descriptor_text",
];

/// Lineage column appended after the source columns; names the file a row came from
pub const SOURCE_FILE_COLUMN: &str = "source_file";

/// Grain of `fact_response_summary`
pub const FACT_GRAIN: [&str; 13] = [
    "geography_code",
    "geography_name",
    "institution_code",
    "grade_number",
    "grade_name",
    "period_code",
    "period_name",
    "student_id",
    "assessment_name",
    "assessment_year",
    "subject_name",
    "test_name",
    "descriptor_code",
];

/// Grain of `fact_reading_proficiency` (the level column is appended)
pub const READING_GRAIN: [&str; 11] = [
    "geography_code",
    "geography_name",
    "institution_code",
    "grade_number",
    "grade_name",
    "period_code",
    "period_name",
    "student_id",
    "assessment_name",
    "assessment_year",
    "test_name",
];

/// Schema helper
pub struct WarehouseSchema;

impl WarehouseSchema {
    /// DDL for the raw table
    pub fn create_raw_sql() -> &'static str {
        r#"
CREATE TABLE IF NOT EXISTS raw (
    geography_code      VARCHAR,
    geography_name      VARCHAR,
    institution_code    VARCHAR NOT NULL,
    institution_name    VARCHAR,
    grade_number        INTEGER,
    grade_name          VARCHAR,
    period_code         VARCHAR,
    period_name         VARCHAR,
    student_id          BIGINT NOT NULL,
    student_name        VARCHAR,
    student_national_id VARCHAR,
    assessment_name     VARCHAR,
    assessment_year     INTEGER,
    subject_name        VARCHAR NOT NULL,
    test_name           VARCHAR,
    question_order      INTEGER,
    raw_answer          VARCHAR,
    correct             INTEGER CHECK (correct IS NULL OR correct IN (0, 1)),
    descriptor_code     VARCHAR,
    descriptor_text     VARCHAR,
    source_file         VARCHAR NOT NULL
);
"#
    }

    /// DDL for the three dimensions
    ///
    /// Key uniqueness is enforced by the rebuild and checked afterwards.
    pub fn create_dimensions_sql() -> &'static str {
        r#"
CREATE TABLE dim_student (
    student_id          BIGINT NOT NULL,
    student_name        VARCHAR,
    student_national_id VARCHAR
);

CREATE TABLE dim_school (
    institution_code VARCHAR NOT NULL,
    institution_name VARCHAR
);

CREATE TABLE dim_descriptor (
    descriptor_code  VARCHAR NOT NULL,
    descriptor_text  VARCHAR,
    occurrence_count BIGINT NOT NULL
);
"#
    }

    /// DDL for the response summary fact
    pub fn create_fact_sql() -> &'static str {
        r#"
CREATE TABLE fact_response_summary (
    geography_code   VARCHAR,
    geography_name   VARCHAR,
    institution_code VARCHAR NOT NULL,
    grade_number     INTEGER,
    grade_name       VARCHAR,
    period_code      VARCHAR,
    period_name      VARCHAR,
    student_id       BIGINT NOT NULL,
    assessment_name  VARCHAR,
    assessment_year  INTEGER,
    subject_name     VARCHAR NOT NULL,
    test_name        VARCHAR,
    descriptor_code  VARCHAR,
    correct_count    BIGINT NOT NULL,
    incorrect_count  BIGINT NOT NULL
);
"#
    }

    /// DDL for the reading proficiency fact
    pub fn create_reading_fact_sql() -> &'static str {
        r#"
CREATE TABLE fact_reading_proficiency (
    geography_code    VARCHAR,
    geography_name    VARCHAR,
    institution_code  VARCHAR NOT NULL,
    grade_number      INTEGER,
    grade_name        VARCHAR,
    period_code       VARCHAR,
    period_name       VARCHAR,
    student_id        BIGINT NOT NULL,
    assessment_name   VARCHAR,
    assessment_year   INTEGER,
    test_name         VARCHAR,
    proficiency_level VARCHAR NOT NULL,
    level_rank        INTEGER NOT NULL,
    response_count    BIGINT NOT NULL
);
"#
    }

    /// Drop every derived table; missing tables are not an error
    pub fn drop_derived_sql() -> &'static str {
        r#"
DROP TABLE IF EXISTS fact_reading_proficiency;
DROP TABLE IF EXISTS fact_response_summary;
DROP TABLE IF EXISTS dim_descriptor;
DROP TABLE IF EXISTS dim_school;
DROP TABLE IF EXISTS dim_student;
"#
    }

    /// Drop the raw table together with everything derived from it
    pub fn drop_all_sql() -> String {
        format!("{}DROP TABLE IF EXISTS raw;\n", Self::drop_derived_sql())
    }

    /// Every table the warehouse manages, raw first
    pub fn managed_tables() -> [&'static str; 6] {
        [
            RAW_TABLE,
            DIM_STUDENT,
            DIM_SCHOOL,
            DIM_DESCRIPTOR,
            FACT_RESPONSE_SUMMARY,
            FACT_READING_PROFICIENCY,
        ]
    }

    /// Comma-separated fact grain for SELECT and GROUP BY lists
    pub fn fact_grain_list() -> String {
        FACT_GRAIN.join(", ")
    }

    /// Comma-separated reading grain for SELECT and GROUP BY lists
    pub fn reading_grain_list() -> String {
        READING_GRAIN.join(", ")
    }
}
