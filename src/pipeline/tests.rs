use super::*;
use crate::config::Config;
use crate::embeddings::{DeviceBinding, DeviceMode, Embedder};
use crate::index::Metric;
use serde_json::{Map, Value, json};
use serial_test::serial;
use tempfile::TempDir;

struct LengthEmbedder;

impl Embedder for LengthEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, t.split_whitespace().count() as f32, 1.0])
            .collect())
    }
}

struct LengthFactory {
    available: bool,
}

impl EmbedderFactory for LengthFactory {
    fn model_name(&self) -> &str {
        "length"
    }

    fn accelerator_count(&self) -> usize {
        0
    }

    fn probe(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(LibrarianError::DependencyUnavailable("embedding service down".into()).into())
        }
    }

    fn create(&self, _binding: DeviceBinding) -> Result<Box<dyn Embedder>> {
        Ok(Box::new(LengthEmbedder))
    }
}

fn orchestrator(root: &Path, available: bool) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        Arc::new(Catalog::new(root.join("dbs"))),
        Arc::new(LengthFactory { available }),
    )
}

fn test_options() -> BuildOptions {
    BuildOptions {
        tokenizer: crate::chunking::HEURISTIC_TOKENIZER.to_string(),
        min_tokens: 5,
        device: DeviceMode::Cpu,
        ..BuildOptions::default()
    }
}

fn overrides(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("overrides should be an object"),
    }
}

fn write_sources(dir: &Path) {
    fs::create_dir_all(dir).expect("should create source dir");
    fs::write(
        dir.join("alpha.txt"),
        "First paragraph of alpha with doi 10.1000/alpha.\n\nSecond paragraph here.",
    )
    .expect("should write source");
    fs::write(dir.join("beta.md"), "Beta only has one paragraph of text.").expect("should write");
}

#[test]
fn options_default_from_config() {
    let mut config = Config::default();
    config.chunking.min_tokens = 321;
    config.embedding.device = DeviceMode::Cpu;
    config.index.metric = Metric::Cosine;
    config.ollama.batch_size = 16;

    let options = BuildOptions::from_config(&config);
    assert_eq!(options.min_tokens, 321);
    assert_eq!(options.device, DeviceMode::Cpu);
    assert_eq!(options.metric, Metric::Cosine);
    assert_eq!(options.batch_size, 16);
    assert_eq!(options.extraction_command, crate::ingest::extract::DEFAULT_PDF_COMMAND);
    assert!(!options.recursive);
    assert!(!options.overwrite);
}

#[test]
fn options_resolve_applies_nested_overrides() {
    let config = Config::default();
    let options = BuildOptions::resolve(
        &config,
        overrides(json!({
            "recursive": true,
            "organize": "skip",
            "metric": "cosine",
            "overlap": 0,
            "paths": { "chunks_file": "work/chunks.jsonl" }
        })),
    )
    .expect("options should resolve");

    assert!(options.recursive);
    assert_eq!(options.organize, crate::ingest::OrganizeMode::Skip);
    assert_eq!(options.metric, Metric::Cosine);
    assert_eq!(options.overlap, 0);
    assert_eq!(options.min_tokens, config.chunking.min_tokens);
    assert_eq!(
        options.paths.chunks_file.as_deref(),
        Some(Path::new("work/chunks.jsonl"))
    );
}

#[test]
fn options_resolve_rejects_bad_input() {
    let config = Config::default();
    for bad in [
        json!({ "unknown_option": 1 }),
        json!({ "metric": "manhattan" }),
        json!({ "chunk_workers": 0 }),
        json!({ "extraction_command": "pdftotext" }),
        json!({ "paths": { "nope": "x" } }),
    ] {
        let error = BuildOptions::resolve(&config, overrides(bad.clone()))
            .expect_err("options should be rejected");
        assert_eq!(
            LibrarianError::classify(&error),
            ErrorKind::Validation,
            "{} should be a validation error",
            bad
        );
    }
}

#[test]
fn assignments_parse_typed_values() {
    assert_eq!(
        parse_assignment("min_tokens=300").expect("should parse"),
        ("min_tokens".to_string(), json!(300))
    );
    assert_eq!(
        parse_assignment("normalize = true").expect("should parse"),
        ("normalize".to_string(), json!(true))
    );
    assert_eq!(
        parse_assignment("device=cpu").expect("should parse"),
        ("device".to_string(), json!("cpu"))
    );
    assert_eq!(
        parse_assignment("extraction_command=pdftotext -layout {input} {output}")
            .expect("should parse")
            .1,
        json!("pdftotext -layout {input} {output}")
    );
    assert!(parse_assignment("no-equals").is_err());
    assert!(parse_assignment("=1").is_err());
    assert!(parse_assignment("paths..x=1").is_err());
}

#[test]
fn dotted_assignments_nest() {
    let mut map = Map::new();
    options::insert_dotted(&mut map, "paths.txt_dir", json!("text"));
    options::insert_dotted(&mut map, "paths.chunks_file", json!("c.jsonl"));
    options::insert_dotted(&mut map, "batch_size", json!(8));

    assert_eq!(
        Value::Object(map),
        json!({ "paths": { "txt_dir": "text", "chunks_file": "c.jsonl" }, "batch_size": 8 })
    );
}

#[test]
fn overrides_load_from_toml_and_json() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let toml_path = temp_dir.path().join("options.toml");
    fs::write(&toml_path, "min_tokens = 250\n[paths]\ntxt_dir = \"text\"\n")
        .expect("should write options");
    let json_path = temp_dir.path().join("options.json");
    fs::write(&json_path, r#"{"device": "cpu"}"#).expect("should write options");

    let from_toml = options::load_overrides(&toml_path).expect("toml should load");
    let resolved =
        BuildOptions::resolve(&Config::default(), from_toml).expect("options should resolve");
    assert_eq!(resolved.min_tokens, 250);
    assert_eq!(resolved.paths.txt_dir.as_deref(), Some(Path::new("text")));

    let from_json = options::load_overrides(&json_path).expect("json should load");
    assert_eq!(from_json.get("device"), Some(&json!("cpu")));

    let error = options::load_overrides(&temp_dir.path().join("missing.toml"))
        .expect_err("missing file should fail");
    assert_eq!(LibrarianError::classify(&error), ErrorKind::InputNotFound);
}

#[test]
fn stage_paths_stay_inside_database() {
    let layout = DatabaseLayout::new("/data/papers");
    let resolved = StagePaths {
        chunks_file: Some(PathBuf::from("work/chunks.jsonl")),
        ..StagePaths::default()
    }
    .resolve(&layout)
    .expect("relative path should resolve");
    assert_eq!(
        resolved.chunks_file,
        PathBuf::from("/data/papers/work/chunks.jsonl")
    );
    assert_eq!(resolved.txt_dir, layout.txt_dir());

    for bad in ["/tmp/chunks.jsonl", "../chunks.jsonl", ""] {
        let paths = StagePaths {
            chunks_file: Some(PathBuf::from(bad)),
            ..StagePaths::default()
        };
        assert!(paths.resolve(&layout).is_err(), "{} should be rejected", bad);
    }
}

#[test]
fn build_log_records_in_order() {
    let log = BuildLog::new();
    let clone = log.clone();
    log.record("first");
    clone.record(String::from("second"));
    assert_eq!(log.entries(), vec!["first".to_string(), "second".to_string()]);
}

#[test]
#[serial]
fn build_lock_is_exclusive_and_released_on_drop() {
    let temp_dir = TempDir::new().expect("should create TempDir");

    let lock = BuildLock::acquire(temp_dir.path()).expect("first lock should succeed");
    assert!(BuildLock::is_held());
    assert!(lock.path().ends_with(LOCK_FILE));

    let error = BuildLock::acquire(temp_dir.path()).expect_err("second lock should fail");
    assert_eq!(
        LibrarianError::classify(&error),
        ErrorKind::ConcurrentBuildRejected
    );

    drop(lock);
    assert!(!BuildLock::is_held());
    let again = BuildLock::acquire(temp_dir.path()).expect("lock should be free again");
    drop(again);
}

#[test]
#[serial]
fn build_lock_respects_other_holders_of_the_file() {
    use fs2::FileExt;

    let temp_dir = TempDir::new().expect("should create TempDir");
    let holder = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(temp_dir.path().join(LOCK_FILE))
        .expect("should open lock file");
    holder.try_lock_exclusive().expect("should lock file");

    let error = BuildLock::acquire(temp_dir.path()).expect_err("lock should be contended");
    assert_eq!(
        LibrarianError::classify(&error),
        ErrorKind::ConcurrentBuildRejected
    );
    assert!(!BuildLock::is_held());

    FileExt::unlock(&holder).expect("should unlock file");
    drop(BuildLock::acquire(temp_dir.path()).expect("lock should succeed"));
}

#[test]
#[serial]
fn lock_status_reports_without_claiming() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let missing = temp_dir.path().join("databases");
    assert_eq!(
        BuildLock::status(&missing).expect("status should succeed"),
        LockStatus::Free
    );
    assert!(!missing.exists());

    let lock = BuildLock::acquire(temp_dir.path()).expect("lock should succeed");
    let written = fs::read_to_string(lock.path()).expect("lock file should be readable");

    let status = BuildLock::status(temp_dir.path()).expect("status should succeed");
    let LockStatus::Held { holder } = status else {
        panic!("expected the lock to be held, got {:?}", status);
    };
    let holder = holder.expect("holder line should be reported");
    assert!(holder.starts_with(&std::process::id().to_string()));
    assert_eq!(
        fs::read_to_string(lock.path()).expect("lock file should be readable"),
        written
    );

    // Checking leaves the holder in place
    assert!(BuildLock::is_held());
    let error = BuildLock::acquire(temp_dir.path()).expect_err("lock should still be held");
    assert_eq!(
        LibrarianError::classify(&error),
        ErrorKind::ConcurrentBuildRejected
    );

    drop(lock);
    assert_eq!(
        BuildLock::status(temp_dir.path()).expect("status should succeed"),
        LockStatus::Free
    );
    drop(BuildLock::acquire(temp_dir.path()).expect("lock should be free"));
}

#[test]
#[serial]
fn build_waits_out_a_momentary_status_check() {
    use fs2::FileExt;

    let temp_dir = TempDir::new().expect("should create TempDir");
    drop(BuildLock::acquire(temp_dir.path()).expect("should create lock file"));

    let reader = fs::File::open(temp_dir.path().join(LOCK_FILE)).expect("should open lock file");
    FileExt::try_lock_shared(&reader).expect("should take shared lock");
    let release = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        FileExt::unlock(&reader).expect("should unlock file");
    });

    let lock = BuildLock::acquire(temp_dir.path()).expect("build should wait for the check");
    release.join().expect("release thread should not panic");
    drop(lock);
}

#[tokio::test]
#[serial]
async fn build_produces_queryable_database() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("library");
    write_sources(&source);
    let orchestrator = orchestrator(temp_dir.path(), true);

    let report = orchestrator
        .build("papers", &source, &test_options())
        .await;

    assert!(report.success, "build should succeed: {:?}", report.error);
    let database = report.database.expect("report should name the database");
    assert_eq!(database.name, "papers");
    assert!(report.logs.iter().any(|l| l.contains("Chunked 2 files")));
    assert!(
        report
            .logs
            .iter()
            .any(|l| l.starts_with("Read 2 DOI mappings (1 with a DOI) from")
                && l.ends_with("metadata.csv"))
    );

    let layout = DatabaseLayout::new(&database.path);
    assert!(layout.metadata_csv().is_file());
    assert!(layout.documents_dir().join("alpha.txt").is_file());
    assert!(layout.txt_dir().join("beta.txt").is_file());
    assert!(source.join("alpha.txt").is_file());

    let catalog = orchestrator.catalog();
    assert_eq!(catalog.list().expect("list should succeed"), vec!["papers"]);
    let loaded = catalog.load("papers").expect("database should load");
    assert_eq!(loaded.index.len(), loaded.metadata.len());
    assert!(
        loaded
            .metadata
            .rows
            .iter()
            .any(|r| r.source_file == "alpha.txt" && r.doi == "10.1000/alpha.")
    );
}

#[tokio::test]
#[serial]
async fn build_rejects_bad_requests() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("library");
    write_sources(&source);
    let orchestrator = orchestrator(temp_dir.path(), true);
    let options = test_options();

    let report = orchestrator.build("../escape", &source, &options).await;
    assert!(!report.success);
    assert_eq!(report.error.map(|e| e.kind), Some(ErrorKind::Validation));

    let report = orchestrator
        .build("papers", &temp_dir.path().join("missing"), &options)
        .await;
    assert_eq!(report.error.map(|e| e.kind), Some(ErrorKind::InputNotFound));

    let empty = temp_dir.path().join("empty");
    fs::create_dir_all(&empty).expect("should create dir");
    let report = orchestrator.build("papers", &empty, &options).await;
    assert_eq!(report.error.map(|e| e.kind), Some(ErrorKind::Validation));
    assert!(!orchestrator.catalog().root().join("papers").exists());

    let existing = orchestrator.catalog().root().join("taken");
    fs::create_dir_all(&existing).expect("should create dir");
    fs::write(existing.join("keep.txt"), "x").expect("should write file");
    let report = orchestrator.build("taken", &source, &options).await;
    assert_eq!(report.error.map(|e| e.kind), Some(ErrorKind::Validation));
    assert!(existing.join("keep.txt").exists());
}

#[tokio::test]
#[serial]
async fn unavailable_embedding_service_fails_before_creating_database() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("library");
    write_sources(&source);
    let orchestrator = orchestrator(temp_dir.path(), false);

    let report = orchestrator
        .build("papers", &source, &test_options())
        .await;

    assert_eq!(
        report.error.map(|e| e.kind),
        Some(ErrorKind::DependencyUnavailable)
    );
    assert!(!orchestrator.catalog().root().join("papers").exists());
}

#[tokio::test]
#[serial]
async fn move_removes_originals_only_after_success() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("library");
    write_sources(&source);
    let orchestrator = orchestrator(temp_dir.path(), true);
    let options = BuildOptions {
        organize: crate::ingest::OrganizeMode::Move,
        ..test_options()
    };

    let report = orchestrator.build("moved", &source, &options).await;
    assert!(report.success, "build should succeed: {:?}", report.error);
    assert!(!source.join("alpha.txt").exists());
    assert!(
        orchestrator
            .catalog()
            .root()
            .join("moved/documents/alpha.txt")
            .is_file()
    );
}
