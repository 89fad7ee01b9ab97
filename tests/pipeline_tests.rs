//! End-to-end tests for the materialization pipeline
//!
//! Each test works on a file-backed store, a source directory and a manifest
//! inside its own temporary directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assessment_warehouse::database::duckdb::{StoreLocation, StoreOptions};
use assessment_warehouse::database::schema::SOURCE_COLUMNS;
use assessment_warehouse::ingest::ManifestStore;
use assessment_warehouse::{
    BrokerConfig, ConnectionBroker, LoadMode, MaterializationPipeline, PipelineError,
    PipelineOptions, PipelineState, RawLoader, StarSchemaBuilder,
};
use serde_json::Value;
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// One response row in source column order
fn response(school: &str, student: i64, name: &str, subject: &str, answer: &str, correct: &str) -> String {
    format!(
        "32,Vitória,{school},Escola {school},5,5º Ano,M,Manhã,{student},{name},,Avaliação,2024,{subject},Prova,1,{answer},{correct},D01,Localizar informação\n"
    )
}

fn extract(rows: &[String]) -> String {
    let mut content = SOURCE_COLUMNS.join(",");
    content.push('\n');
    for row in rows {
        content.push_str(row);
    }
    content
}

struct Warehouse {
    dir: TempDir,
    broker: Arc<ConnectionBroker>,
}

impl Warehouse {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        let broker = ConnectionBroker::open(
            StoreLocation::File(dir.path().join("warehouse.duckdb")),
            &StoreOptions::default(),
            BrokerConfig::default(),
        )
        .unwrap();
        Self {
            dir,
            broker: Arc::new(broker),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.path().join("state").join("manifest.json")
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.data_dir().join(name), content).unwrap();
    }

    fn pipeline(&self, partition_size: usize) -> MaterializationPipeline {
        let options = PipelineOptions {
            source_dir: self.data_dir(),
            pattern: "*.csv".to_string(),
            manifest_path: self.manifest_path(),
            loader: RawLoader::new(b',', 2),
            builder: StarSchemaBuilder::new(partition_size),
        };
        MaterializationPipeline::new(Arc::clone(&self.broker), options)
    }

    async fn rows(&self, sql: &str) -> Vec<Value> {
        let reader = self.broker.acquire_reader().await.unwrap();
        reader.query(sql).unwrap().rows
    }

    async fn fact_dump(&self) -> Vec<Value> {
        self.rows("SELECT * FROM fact_response_summary ORDER BY ALL").await
    }

    async fn scalar(&self, sql: &str) -> i64 {
        let rows = self.rows(sql).await;
        rows[0]["n"].as_i64().unwrap()
    }
}

fn file_a() -> String {
    extract(&[
        response("E1", 1, "Ana", "Matemática", "A", "1"),
        response("E1", 1, "Ana", "Matemática", "B", "0"),
        response("E1", 2, "Bia", "Matemática", "A", "1"),
    ])
}

fn file_b() -> String {
    extract(&[
        response("E2", 3, "Caio", "Português", "C", "0"),
        response("E2", 3, "Caio", "Português", "D", "1"),
        response("E2", 4, "Duda", "Leitura", "frases", ""),
    ])
}

fn file_c() -> String {
    extract(&[
        response("E3", 5, "Eva", "Matemática", "A", "1"),
        response("E1", 1, "Ana", "Português", "C", "1"),
    ])
}

#[test]
fn test_full_load_builds_expected_facts() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());

        let mut pipeline = wh.pipeline(0);
        let report = pipeline.run(LoadMode::Full).await.unwrap();

        assert_eq!(report.files_loaded, vec!["a.csv"]);
        assert_eq!(report.rows_loaded, 3);
        assert!(!report.skipped);
        let rebuild = report.rebuild.unwrap();
        assert_eq!(rebuild.fact_rows, 2);
        assert_eq!(rebuild.student_count, 2);
        assert_eq!(rebuild.school_count, 1);

        let facts = wh
            .rows("SELECT student_id, correct_count, incorrect_count FROM fact_response_summary ORDER BY student_id")
            .await;
        assert_eq!(facts[0]["student_id"], 1);
        assert_eq!(facts[0]["correct_count"], 1);
        assert_eq!(facts[0]["incorrect_count"], 1);
        assert_eq!(facts[1]["student_id"], 2);
        assert_eq!(facts[1]["correct_count"], 1);
        assert_eq!(facts[1]["incorrect_count"], 0);

        assert_eq!(
            pipeline.transitions(),
            &[
                PipelineState::LoadingRaw,
                PipelineState::RebuildingSchema,
                PipelineState::UpdatingManifest,
                PipelineState::Idle,
            ]
        );
    });
}

#[test]
fn test_full_load_is_idempotent() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());
        wh.write("b.csv", &file_b());

        let mut pipeline = wh.pipeline(0);
        pipeline.run(LoadMode::Full).await.unwrap();
        let first = wh.fact_dump().await;
        let raw_first = wh.scalar("SELECT COUNT(*) AS n FROM raw").await;

        pipeline.run(LoadMode::Full).await.unwrap();
        assert_eq!(wh.fact_dump().await, first);
        assert_eq!(wh.scalar("SELECT COUNT(*) AS n FROM raw").await, raw_first);
    });
}

#[test]
fn test_incremental_load_matches_full_load() {
    let rt = runtime();
    rt.block_on(async {
        let incremental = Warehouse::new();
        incremental.write("a.csv", &file_a());
        incremental.write("b.csv", &file_b());
        let mut pipeline = incremental.pipeline(0);
        pipeline.run(LoadMode::Incremental).await.unwrap();

        incremental.write("c.csv", &file_c());
        let report = pipeline.run(LoadMode::Incremental).await.unwrap();
        assert_eq!(report.changed_files, vec!["c.csv"]);
        assert_eq!(report.files_loaded, vec!["c.csv"]);
        assert_eq!(report.unchanged_files, vec!["a.csv", "b.csv"]);
        assert_eq!(report.rows_loaded, 2);

        let full = Warehouse::new();
        full.write("a.csv", &file_a());
        full.write("b.csv", &file_b());
        full.write("c.csv", &file_c());
        full.pipeline(0).run(LoadMode::Full).await.unwrap();

        assert_eq!(incremental.fact_dump().await, full.fact_dump().await);
    });
}

#[test]
fn test_incremental_without_changes_is_a_no_op() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());

        let mut pipeline = wh.pipeline(0);
        pipeline.run(LoadMode::Full).await.unwrap();
        let before = wh.fact_dump().await;

        let report = pipeline.run(LoadMode::Incremental).await.unwrap();
        assert!(report.skipped);
        assert!(report.rebuild.is_none());
        assert!(report.files_loaded.is_empty());
        assert_eq!(report.unchanged_files, vec!["a.csv"]);
        assert_eq!(
            pipeline.transitions(),
            &[PipelineState::DetectingChanges, PipelineState::Idle]
        );
        assert_eq!(wh.fact_dump().await, before);
    });
}

#[test]
fn test_single_byte_change_is_reloaded() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        let original = file_a();
        wh.write("a.csv", &original);

        let mut pipeline = wh.pipeline(0);
        pipeline.run(LoadMode::Incremental).await.unwrap();
        let manifest = ManifestStore::new(wh.manifest_path()).load().unwrap();
        let old_hash = manifest.entry("a.csv").unwrap().hash;

        // Flip Bia's answer from correct to incorrect; the size stays the same
        let edited = original.replacen("Bia,,Avaliação,2024,Matemática,Prova,1,A,1", "Bia,,Avaliação,2024,Matemática,Prova,1,A,0", 1);
        assert_ne!(edited, original);
        assert_eq!(edited.len(), original.len());
        wh.write("a.csv", &edited);

        let report = pipeline.run(LoadMode::Incremental).await.unwrap();
        assert_eq!(report.changed_files, vec!["a.csv"]);
        assert_eq!(wh.scalar("SELECT COUNT(*) AS n FROM raw").await, 3);
        assert_eq!(
            wh.scalar("SELECT CAST(SUM(correct_count) AS BIGINT) AS n FROM fact_response_summary").await,
            1
        );

        let manifest = ManifestStore::new(wh.manifest_path()).load().unwrap();
        assert_ne!(manifest.entry("a.csv").unwrap().hash, old_hash);
    });
}

#[test]
fn test_fact_sums_match_raw_correctness() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());
        wh.write("b.csv", &file_b());
        wh.write("c.csv", &file_c());
        wh.pipeline(0).run(LoadMode::Full).await.unwrap();

        let fact_correct = wh
            .scalar("SELECT CAST(SUM(correct_count) AS BIGINT) AS n FROM fact_response_summary")
            .await;
        let raw_correct = wh
            .scalar("SELECT CAST(SUM(correct) AS BIGINT) AS n FROM raw WHERE correct IS NOT NULL")
            .await;
        assert_eq!(fact_correct, raw_correct);

        let fact_total = wh
            .scalar("SELECT CAST(SUM(correct_count + incorrect_count) AS BIGINT) AS n FROM fact_response_summary")
            .await;
        let raw_total = wh
            .scalar("SELECT COUNT(*) AS n FROM raw WHERE correct IS NOT NULL")
            .await;
        assert_eq!(fact_total, raw_total);

        assert_eq!(
            wh.scalar("SELECT CAST(SUM(response_count) AS BIGINT) AS n FROM fact_reading_proficiency").await,
            1
        );
    });
}

#[test]
fn test_dimension_keys_stay_unique_with_conflicting_names() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write(
            "a.csv",
            &extract(&[
                response("E1", 7, "Carlos", "Matemática", "A", "1"),
                response("E1", 7, "Carla", "Matemática", "B", "0"),
            ]),
        );
        wh.write(
            "b.csv",
            &extract(&[response("E1", 7, "Carlos", "Português", "C", "1")]),
        );
        wh.pipeline(0).run(LoadMode::Full).await.unwrap();

        assert_eq!(
            wh.scalar("SELECT COUNT(*) - COUNT(DISTINCT student_id) AS n FROM dim_student").await,
            0
        );
        assert_eq!(
            wh.scalar("SELECT COUNT(*) - COUNT(DISTINCT institution_code) AS n FROM dim_school").await,
            0
        );
        let names = wh.rows("SELECT student_name FROM dim_student").await;
        assert_eq!(names.len(), 1);
        assert_eq!(names[0]["student_name"], "Carlos");
    });
}

#[test]
fn test_partitioned_rebuild_matches_single_pass() {
    let rt = runtime();
    rt.block_on(async {
        let single = Warehouse::new();
        let split = Warehouse::new();
        for wh in [&single, &split] {
            wh.write("a.csv", &file_a());
            wh.write("b.csv", &file_b());
            wh.write("c.csv", &file_c());
        }

        single.pipeline(0).run(LoadMode::Full).await.unwrap();
        let report = split.pipeline(1).run(LoadMode::Full).await.unwrap();
        assert_eq!(report.rebuild.unwrap().partitions, 3);

        assert_eq!(split.fact_dump().await, single.fact_dump().await);
    });
}

#[test]
fn test_mismatched_file_is_skipped_and_not_recorded() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());
        wh.write("broken.csv", "MUN_UF,ESC_INEP\n32,E9\n");

        let mut pipeline = wh.pipeline(0);
        let report = pipeline.run(LoadMode::Incremental).await.unwrap();
        assert_eq!(report.files_loaded, vec!["a.csv"]);
        assert_eq!(report.failed_files.len(), 1);
        assert_eq!(report.failed_files[0].name, "broken.csv");
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let manifest = ManifestStore::new(wh.manifest_path()).load().unwrap();
        assert!(manifest.entry("a.csv").is_some());
        assert!(manifest.entry("broken.csv").is_none());

        // The unrecorded file is retried on the next run
        let report = pipeline.run(LoadMode::Incremental).await.unwrap();
        assert_eq!(report.changed_files, vec!["broken.csv"]);
        assert!(report.files_loaded.is_empty());
    });
}

#[test]
fn test_corrupt_manifest_fails_the_run() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());
        let manifest_path = wh.manifest_path();
        std::fs::create_dir_all(manifest_path.parent().unwrap()).unwrap();
        std::fs::write(&manifest_path, "{ not json").unwrap();

        let mut pipeline = wh.pipeline(0);
        let err = pipeline.run(LoadMode::Incremental).await.unwrap_err();
        assert!(matches!(err, PipelineError::Manifest(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(std::fs::read_to_string(&manifest_path).unwrap(), "{ not json");
    });
}

#[test]
fn test_full_load_records_every_file() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        wh.write("a.csv", &file_a());
        wh.write("b.csv", &file_b());
        wh.write("notes.txt", "ignored");

        wh.pipeline(0).run(LoadMode::Full).await.unwrap();

        let manifest = ManifestStore::new(wh.manifest_path()).load().unwrap();
        assert!(manifest.last_full_load.is_some());
        assert_eq!(manifest.len(), 2);
        let entry = manifest.entry("b.csv").unwrap();
        assert_eq!(entry.file_size, file_b().len() as u64);
    });
}

#[test]
fn test_missing_source_directory_is_an_error() {
    let rt = runtime();
    rt.block_on(async {
        let wh = Warehouse::new();
        std::fs::remove_dir_all(wh.data_dir()).unwrap();

        let mut pipeline = wh.pipeline(0);
        let err = pipeline.run(LoadMode::Full).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceDirectory(_)));
        assert!(!Path::new(&wh.manifest_path()).exists());
    });
}
