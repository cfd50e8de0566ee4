use super::*;
use std::sync::Arc;
use tempfile::TempDir;

fn touch(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("should create parent dir");
    }
    fs::write(path, contents).expect("should write file");
}

fn names(paths: &[PathBuf], root: &Path) -> Vec<String> {
    paths
        .iter()
        .map(|p| {
            p.strip_prefix(root)
                .expect("path should be under root")
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}

struct FailingExtractor;

impl TextExtractor for FailingExtractor {
    fn name(&self) -> &str {
        "failing"
    }

    fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn extract(&self, _input: &Path, output: &Path) -> Result<()> {
        fs::write(output, "partial").expect("should write partial output");
        anyhow::bail!("corrupt document")
    }
}

#[test]
fn cleanup_modes() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let root = temp_dir.path();
    touch(&root.join("._a.pdf"), "x");
    touch(&root.join(".DS_Store"), "x");
    touch(&root.join("nested/._b.pdf"), "x");
    touch(&root.join("nested/.DS_Store"), "x");
    touch(&root.join("keep.pdf"), "x");

    assert_eq!(
        cleanup_metadata_files(root, CleanupMode::Off).expect("cleanup should succeed"),
        0
    );
    assert!(root.join("._a.pdf").exists());

    assert_eq!(
        cleanup_metadata_files(root, CleanupMode::Shallow).expect("cleanup should succeed"),
        2
    );
    assert!(!root.join("._a.pdf").exists());
    assert!(root.join("nested/._b.pdf").exists());

    assert_eq!(
        cleanup_metadata_files(root, CleanupMode::Recursive).expect("cleanup should succeed"),
        2
    );
    assert!(!root.join("nested/.DS_Store").exists());
    assert!(root.join("keep.pdf").exists());
}

#[test]
fn discovery_filters_and_sorts() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let root = temp_dir.path();
    touch(&root.join("b.pdf"), "x");
    touch(&root.join("a.txt"), "x");
    touch(&root.join("c.MD"), "x");
    touch(&root.join("image.png"), "x");
    touch(&root.join("._a.pdf"), "x");
    touch(&root.join("sub/d.pdf"), "x");

    let shallow = discover_sources(root, false).expect("discovery should succeed");
    assert_eq!(names(&shallow, root), vec!["a.txt", "b.pdf", "c.MD"]);

    let recursive = discover_sources(root, true).expect("discovery should succeed");
    assert_eq!(
        names(&recursive, root),
        vec!["a.txt", "b.pdf", "c.MD", "sub/d.pdf"]
    );

    let single = discover_sources(&root.join("b.pdf"), false).expect("discovery should succeed");
    assert_eq!(single, vec![root.join("b.pdf")]);
    assert!(
        discover_sources(&root.join("image.png"), false)
            .expect("discovery should succeed")
            .is_empty()
    );
}

#[test]
fn source_kind_by_extension() {
    assert_eq!(SourceKind::of(Path::new("x.PDF")), Some(SourceKind::Pdf));
    assert_eq!(SourceKind::of(Path::new("x.md")), Some(SourceKind::PlainText));
    assert_eq!(SourceKind::of(Path::new("x.docx")), None);
    assert_eq!(SourceKind::of(Path::new("noext")), None);
}

#[test]
fn organize_copies_moves_or_skips() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("src");
    touch(&source.join("a.txt"), "alpha");
    touch(&source.join("sub/b.pdf"), "beta");
    let sources = discover_sources(&source, true).expect("discovery should succeed");

    let copied_dir = temp_dir.path().join("copied");
    let copied = organize_sources(&sources, &source, &copied_dir, OrganizeMode::Copy)
        .expect("organize should succeed");
    assert_eq!(names(&copied, &copied_dir), vec!["a.txt", "sub/b.pdf"]);
    assert!(source.join("a.txt").exists());

    let skipped = organize_sources(&sources, &source, &copied_dir, OrganizeMode::Skip)
        .expect("organize should succeed");
    assert_eq!(skipped, sources);

    let moved_dir = temp_dir.path().join("moved");
    let moved = organize_sources(&sources, &source, &moved_dir, OrganizeMode::Move)
        .expect("organize should succeed");
    assert_eq!(moved.len(), 2);
    assert!(!source.join("a.txt").exists());
    assert_eq!(
        fs::read_to_string(moved_dir.join("sub/b.pdf")).expect("moved file should exist"),
        "beta"
    );
}

#[test]
fn organize_single_file_source() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let file = temp_dir.path().join("paper.pdf");
    touch(&file, "x");
    let target = temp_dir.path().join("documents");

    let placed = organize_sources(&[file.clone()], &file, &target, OrganizeMode::Copy)
        .expect("organize should succeed");
    assert_eq!(placed, vec![target.join("paper.pdf")]);
}

#[test]
fn command_extractor_templates() {
    assert!(CommandExtractor::new("").is_err());
    assert!(CommandExtractor::new("pdftotext").is_err());

    let extractor = CommandExtractor::new(extract::DEFAULT_PDF_COMMAND)
        .expect("default command should parse");
    assert_eq!(extractor.program(), "pdftotext");
}

#[test]
fn missing_extraction_program_is_unavailable() {
    let extractor = CommandExtractor::new("librarian-no-such-program {input} {output}")
        .expect("command should parse");
    let error = extractor.probe().expect_err("probe should fail");
    assert_eq!(
        crate::LibrarianError::classify(&error),
        crate::ErrorKind::DependencyUnavailable
    );
}

#[cfg(unix)]
#[test]
fn command_extractor_runs_program() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let input = temp_dir.path().join("in.pdf");
    let output = temp_dir.path().join("out.txt");
    touch(&input, "converted text");

    let extractor = CommandExtractor::new("cp {input} {output}").expect("command should parse");
    extractor
        .extract(&input, &output)
        .expect("extraction should succeed");
    assert_eq!(
        fs::read_to_string(&output).expect("output should exist"),
        "converted text"
    );

    let stdout = CommandExtractor::new("cat {input}").expect("command should parse");
    let piped = temp_dir.path().join("piped.txt");
    stdout
        .extract(&input, &piped)
        .expect("extraction should succeed");
    assert_eq!(
        fs::read_to_string(&piped).expect("output should exist"),
        "converted text"
    );
}

#[tokio::test]
async fn extraction_passes_text_through_and_skips_failures() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("src");
    touch(&source.join("notes.md"), "# Notes");
    touch(&source.join("paper.txt"), "body");
    touch(&source.join("broken.pdf"), "%PDF");
    touch(&source.join("sub/paper.pdf"), "%PDF");
    let sources = discover_sources(&source, true).expect("discovery should succeed");
    let txt_dir = temp_dir.path().join("txt");

    let summary = extract_all(&sources, &txt_dir, Arc::new(FailingExtractor), true, 2)
        .await
        .expect("extraction should succeed");

    assert_eq!(summary.converted, 2);
    assert_eq!(summary.failed.len(), 2);
    assert_eq!(
        fs::read_to_string(txt_dir.join("notes.txt")).expect("notes should exist"),
        "# Notes"
    );
    assert!(txt_dir.join("paper.txt").exists());
    assert!(!txt_dir.join("broken.txt").exists());
}

#[tokio::test]
async fn extraction_keeps_existing_text_without_overwrite() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let source = temp_dir.path().join("a.txt");
    touch(&source, "new");
    let txt_dir = temp_dir.path().join("txt");
    touch(&txt_dir.join("a.txt"), "old");

    let summary = extract_all(
        &[source.clone()],
        &txt_dir,
        Arc::new(FailingExtractor),
        false,
        1,
    )
    .await
    .expect("extraction should succeed");
    assert_eq!(summary.kept, 1);
    assert_eq!(summary.produced(), 1);
    assert_eq!(
        fs::read_to_string(txt_dir.join("a.txt")).expect("text should exist"),
        "old"
    );

    let summary = extract_all(&[source], &txt_dir, Arc::new(FailingExtractor), true, 1)
        .await
        .expect("extraction should succeed");
    assert_eq!(summary.converted, 1);
    assert_eq!(
        fs::read_to_string(txt_dir.join("a.txt")).expect("text should exist"),
        "new"
    );
}

#[test]
fn doi_detection() {
    assert_eq!(
        extract_doi("See https://doi.org/10.1038/s41586-020-2649-2 for details"),
        "10.1038/s41586-020-2649-2"
    );
    assert_eq!(extract_doi("DOI: 10.1000/ABC.123 and 10.2000/xyz"), "10.1000/ABC.123");
    assert_eq!(extract_doi("<a href=\"10.5555/quoted\">"), "10.5555/quoted");
    assert_eq!(extract_doi("version 10.1 of the paper"), crate::records::DOI_NOT_FOUND);
}

#[test]
fn metadata_csv_round_trip() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let txt_dir = temp_dir.path().join("txt");
    touch(&txt_dir.join("a.txt"), "doi 10.1000/alpha here");
    touch(&txt_dir.join("b.txt"), "no identifier");
    let csv_path = temp_dir.path().join("metadata.csv");

    let rows = write_metadata_csv(&txt_dir, &csv_path, true).expect("csv should be written");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].relative_path.as_deref(), Some("a.txt"));

    let contents = fs::read_to_string(&csv_path).expect("csv should exist");
    assert!(contents.starts_with("filename,doi,relative_path"));

    let map = read_doi_map(&csv_path).expect("csv should parse");
    assert_eq!(map.get("a.txt").map(String::as_str), Some("10.1000/alpha"));
    assert_eq!(map.get("b.txt").map(String::as_str), Some("not found"));

    let plain = temp_dir.path().join("plain.csv");
    write_metadata_csv(&txt_dir, &plain, false).expect("csv should be written");
    assert_eq!(read_doi_map(&plain).expect("csv should parse").len(), 2);
}

#[test]
fn missing_metadata_csv_is_input_not_found() {
    let temp_dir = TempDir::new().expect("should create TempDir");
    let error = read_doi_map(&temp_dir.path().join("metadata.csv")).expect_err("should fail");
    assert_eq!(
        crate::LibrarianError::classify(&error),
        crate::ErrorKind::InputNotFound
    );
}
