use lognexus::core::audit::MemoryAuditSink;
use lognexus::core::catalog::Catalog;
use lognexus::core::config::NexusConfig;
use lognexus::core::error::NexusError;
use lognexus::core::model::FieldType;
use lognexus::ingest::chunk;
use lognexus::ingest::infer::NumericWidening;
use lognexus::ingest::job::{IngestRequest, IngestSummary, Ingestor};
use std::io::Cursor;
use tempfile::TempDir;

fn setup(chunk_size: usize) -> (TempDir, NexusConfig, Catalog) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = NexusConfig::with_data_dir(tmp.path());
    config.chunk_size = chunk_size;
    let catalog = Catalog::open(&config.data_dir()).expect("open catalog");
    (tmp, config, catalog)
}

fn ingest(
    catalog: &Catalog,
    config: &NexusConfig,
    dataset: &str,
    input: &str,
) -> Result<IngestSummary, NexusError> {
    let audit = MemoryAuditSink::new();
    Ingestor::new(catalog, config, &audit).ingest(
        Cursor::new(input.as_bytes().to_vec()),
        IngestRequest::new("input.jsonl").dataset(dataset),
    )
}

#[test]
fn widening_scenario_int_string_float() {
    let (_tmp, config, catalog) = setup(100);
    let summary = ingest(&catalog, &config, "a", "{\"a\":1}\n{\"a\":\"x\"}\n{\"a\":2.5}\n")
        .expect("ingest");

    assert_eq!(summary.rows_ingested, 3);
    assert_eq!(summary.rows_malformed, 0);
    let entry = catalog.lookup("a").unwrap().expect("entry");
    assert_eq!(entry.schema.get("a"), Some(FieldType::String));
    assert!(!summary.warnings.is_empty());
    assert_eq!(summary.warnings[0].field, "a");
    assert_eq!(summary.warnings[0].line, 2);

    // Values written before the widening read back in canonical text form.
    let rows = chunk::decode_chunk(
        &catalog.data_dir().chunk_path("a", 0),
        &entry.schema,
    )
    .unwrap();
    let values: Vec<String> = rows
        .iter()
        .map(|r| r.values[0].canonical_text().unwrap())
        .collect();
    assert_eq!(values, vec!["1", "x", "2.5"]);
}

#[test]
fn ingested_plus_malformed_equals_input_lines() {
    let (_tmp, config, catalog) = setup(2);
    let input = "{\"a\":1}\nnot json\n{\"a\":2}\n{broken\n{\"b\":true}\n[1,2]\n";
    let summary = ingest(&catalog, &config, "mixed", input).expect("ingest");

    let total_lines = input.lines().count() as u64;
    assert_eq!(summary.rows_ingested + summary.rows_malformed, total_lines);
    assert_eq!(summary.rows_malformed, 2);
    assert_eq!(summary.rows_ingested, 4);

    let entry = catalog.lookup("mixed").unwrap().unwrap();
    assert_eq!(entry.row_count, 4);
    // Non-object values are wrapped under `value`.
    assert_eq!(entry.schema.get("value"), Some(FieldType::Nested));
}

#[test]
fn chunk_size_plus_one_rows_makes_two_chunks() {
    let (_tmp, config, catalog) = setup(3);
    let input: String = (0..4).map(|i| format!("{{\"n\":{i}}}\n")).collect();
    let summary = ingest(&catalog, &config, "four", &input).expect("ingest");

    assert_eq!(summary.chunks_written, 2);
    let entry = catalog.lookup("four").unwrap().unwrap();
    assert_eq!(entry.chunks.len(), 2);
    assert_eq!(entry.chunks[0].row_count, 3);
    assert_eq!(entry.chunks[1].row_count, 1);

    let files: Vec<_> = std::fs::read_dir(catalog.data_dir().dataset_dir("four"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(files.len(), 2, "{files:?}");

    let last = chunk::decode_chunk(&catalog.data_dir().chunk_path("four", 1), &entry.schema)
        .unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].line, 4);
}

#[test]
fn identical_input_is_deterministic() {
    let (_tmp, config, catalog) = setup(2);
    let input = "{\"a\":1,\"b\":{\"c\":\"x\"}}\n{\"a\":1.5,\"d\":[1]}\n\n{\"b\":{\"c\":7}}\n";
    let first = ingest(&catalog, &config, "run1", input).expect("first");
    let second = ingest(&catalog, &config, "run2", input).expect("second");

    assert_eq!(first.rows_ingested, second.rows_ingested);
    assert_eq!(first.rows_malformed, second.rows_malformed);
    assert_eq!(first.warnings, second.warnings);
    let s1 = catalog.lookup("run1").unwrap().unwrap().schema;
    let s2 = catalog.lookup("run2").unwrap().unwrap().schema;
    assert_eq!(s1, s2);
    assert_eq!(s1.get("b.c"), Some(FieldType::String));
    assert_eq!(s1.get("a"), Some(FieldType::Float));
}

#[test]
fn schema_only_widens_across_ingests() {
    let (_tmp, config, catalog) = setup(10);
    let batches = [
        "{\"a\":1,\"b\":true}\n",
        "{\"a\":2.0}\n{\"c\":null}\n",
        "{\"b\":\"yes\",\"d\":{\"e\":1}}\n",
        "{\"a\":\"text\"}\n",
    ];
    let mut previous = None;
    for batch in batches {
        ingest(&catalog, &config, "evolving", batch).expect("ingest");
        let entry = catalog.lookup("evolving").unwrap().unwrap();
        if let Some(prev) = previous {
            assert!(entry.schema.is_widening_of(&prev), "{:?} -> {:?}", prev, entry.schema);
        }
        previous = Some(entry.schema);
    }
    let entry = catalog.lookup("evolving").unwrap().unwrap();
    assert_eq!(entry.row_count, 5);
    let seqs: Vec<u64> = entry.chunks.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[test]
fn leading_malformed_lines_abort_before_writing() {
    let (_tmp, mut config, catalog) = setup(10);
    config.leading_malformed_limit = 3;
    let err = ingest(&catalog, &config, "junk", "nope\n\nstill nope\n{{{\n{\"a\":1}\n")
        .unwrap_err();

    match &err {
        NexusError::JobAborted {
            rows_ingested,
            rows_malformed,
            cause,
            ..
        } => {
            assert_eq!(*rows_ingested, 0);
            assert_eq!(*rows_malformed, 3);
            assert!(matches!(**cause, NexusError::MalformedInput { malformed: 3 }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), "malformed_input");
    assert!(catalog.lookup("junk").unwrap().is_none());
}

#[test]
fn malformed_lines_after_good_ones_do_not_abort() {
    let (_tmp, mut config, catalog) = setup(10);
    config.leading_malformed_limit = 2;
    let summary = ingest(&catalog, &config, "late", "{\"a\":1}\nx\ny\nz\n").expect("ingest");
    assert_eq!(summary.rows_ingested, 1);
    assert_eq!(summary.rows_malformed, 3);
}

#[test]
fn string_numeric_widening_policy_is_honoured() {
    let (_tmp, mut config, catalog) = setup(10);
    config.numeric_widening = NumericWidening::String;
    ingest(&catalog, &config, "strict", "{\"n\":1}\n{\"n\":1.5}\n").expect("ingest");
    let entry = catalog.lookup("strict").unwrap().unwrap();
    assert_eq!(entry.schema.get("n"), Some(FieldType::String));
}

#[test]
fn default_view_is_registered_and_derived_id_used() {
    let (_tmp, config, catalog) = setup(10);
    let audit = MemoryAuditSink::new();
    let summary = Ingestor::new(&catalog, &config, &audit)
        .ingest(
            Cursor::new(b"{\"status\":200}\n".to_vec()),
            IngestRequest::new("/var/log/access.jsonl"),
        )
        .expect("ingest");

    assert!(summary.dataset_id.starts_with("access-"), "{}", summary.dataset_id);
    assert_eq!(summary.view, "logs");
    let entry = catalog.resolve_view("logs").unwrap().expect("view");
    assert_eq!(entry.dataset_id, summary.dataset_id);

    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].module, "log");
    assert_eq!(events[0].action, "ingest");
    assert!(events[0].success);
    assert_eq!(events[0].notes["rows_ingested"], 1);
}

#[test]
fn invalid_dataset_id_is_rejected_up_front() {
    let (_tmp, config, catalog) = setup(10);
    let err = ingest(&catalog, &config, "../escape", "{\"a\":1}\n").unwrap_err();
    assert!(matches!(err, NexusError::ValidationError(_)), "{err}");
}
