use std::{
  collections::BTreeSet,
  fs,
  sync::Arc,
  time::Duration,
};

use parking_lot::Mutex;

use callvault_core::CancelToken;
use callvault_store::{
  AttachmentMetadata, ImportOptions, ManifestEntry, Repository, hash_bytes, import_paths,
};
use callvault_validate::{
  CancelReason, Error, Phase, Report, Status, ValidateOptions, ValidationCache, Validator,
  ViolationType,
};

const CALLS: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<calls count="3">
  <call number="+15555550100" duration="42" date="1420070400000" type="1" />
  <call number="+15555550101" duration="5" date="1420070500000" type="2" />
  <call number="+15555550102" duration="0" date="1451606400000" type="3" />
</calls>
"#;

// "hello world"
const SMS: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<smses count="2">
  <sms address="+15555550100" date="1420070400000" type="1" body="hi" />
  <mms address="+15555550100" date="1420070600000" msg_box="1">
    <parts>
      <part seq="0" ct="text/plain" name="hello.txt" data="aGVsbG8gd29ybGQ=" />
    </parts>
    <addrs><addr address="+15555550100" type="137" /></addrs>
  </mms>
</smses>
"#;

const TAMPERED_PARTITION: &str = "calls/calls-2015.xml";

fn imported_repo() -> (tempfile::TempDir, Repository) {
  let dir = tempfile::tempdir().unwrap();
  let repo = Repository::init(dir.path().join("repo"), "tests").unwrap();
  let inbox = dir.path().join("inbox");
  fs::create_dir_all(&inbox).unwrap();
  fs::write(inbox.join("calls.xml"), CALLS).unwrap();
  fs::write(inbox.join("sms.xml"), SMS).unwrap();
  import_paths(&repo, &[inbox], &ImportOptions::default(), &CancelToken::new()).unwrap();
  (dir, repo)
}

async fn validate(repo: &Repository, options: ValidateOptions) -> Result<Report, Error> {
  Validator::new(repo.clone()).with_options(options).validate().await
}

fn sequential() -> ValidateOptions { ValidateOptions::default() }

fn parallel() -> ValidateOptions {
  ValidateOptions {
    parallel: true,
    ..Default::default()
  }
}

/// Same-length edit, so only the hash can tell.
fn tamper(repo: &Repository) {
  let path = repo.path(TAMPERED_PARTITION);
  let body = fs::read_to_string(&path).unwrap();
  assert!(body.contains(r#"duration="42""#));
  fs::write(&path, body.replace(r#"duration="42""#, r#"duration="43""#)).unwrap();
}

fn store_orphan(repo: &Repository) -> usize {
  let data = b"nobody points at me";
  let hash = hash_bytes(data);
  repo
    .attachments()
    .unwrap()
    .store(&hash, data, &AttachmentMetadata {
      hash:          hash.clone(),
      original_name: "stray.bin".to_string(),
      mime_type:     "application/octet-stream".to_string(),
      size:          data.len() as u64,
    })
    .unwrap();
  data.len()
}

fn findings(report: &Report) -> BTreeSet<(ViolationType, String, String)> {
  report
    .violations
    .iter()
    .map(|v| (v.kind, v.file.clone(), v.message.clone()))
    .collect()
}

#[tokio::test]
async fn freshly_imported_repository_is_valid() {
  let (_dir, repo) = imported_repo();
  for options in [sequential(), parallel()] {
    let report = validate(&repo, options).await.unwrap();
    assert_eq!(report.status, Status::Valid, "{:#?}", report.violations);
    assert!(report.violations.is_empty(), "{:#?}", report.violations);
  }
}

#[tokio::test]
async fn tampered_file_yields_exactly_one_checksum_mismatch() {
  let (_dir, repo) = imported_repo();
  tamper(&repo);
  let manifest_before = fs::read(repo.path("files.toml")).unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Invalid);
  let mismatches: Vec<_> = report.of_type(ViolationType::ChecksumMismatch).collect();
  assert_eq!(mismatches.len(), 1, "{:#?}", report.violations);
  assert_eq!(mismatches[0].file, TAMPERED_PARTITION);
  assert_eq!(report.violations.len(), 1);

  assert_eq!(fs::read(repo.path("files.toml")).unwrap(), manifest_before);

  // A second pass still sees it: nothing was "fixed".
  let again = validate(&repo, sequential()).await.unwrap();
  assert_eq!(again.of_type(ViolationType::ChecksumMismatch).count(), 1);
}

#[tokio::test]
async fn phantom_manifest_entry_is_a_missing_file() {
  let (_dir, repo) = imported_repo();
  let original = repo.read_manifest().unwrap();
  let mut manifest = original.clone();
  manifest.files.push(ManifestEntry {
    name:     "calls/calls-1999.xml".to_string(),
    size:     10,
    checksum: "ab".repeat(32),
  });
  repo.write_manifest_document(&manifest).unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Invalid);
  assert_eq!(report.errors().count(), 1, "{:#?}", report.violations);
  let missing: Vec<_> = report.of_type(ViolationType::MissingFile).collect();
  assert_eq!(missing.len(), 1);
  assert_eq!(missing[0].file, "calls/calls-1999.xml");

  repo.write_manifest_document(&original).unwrap();
  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Valid, "{:#?}", report.violations);
}

#[tokio::test]
async fn orphaned_attachment_is_only_a_warning() {
  let (_dir, repo) = imported_repo();
  let size = store_orphan(&repo);
  let mut summary = repo.read_summary().unwrap();
  summary.counts.attachments += 1;
  summary.sizes.attachments_bytes += size as u64;
  repo.write_summary(&summary).unwrap();
  repo.write_manifest().unwrap();

  let report = validate(&repo, parallel()).await.unwrap();
  assert_eq!(report.status, Status::Valid, "{:#?}", report.violations);
  assert_eq!(report.warnings().count(), 1);
  assert_eq!(report.of_type(ViolationType::OrphanedAttachment).count(), 1);
}

#[tokio::test]
async fn missing_blob_is_a_missing_attachment() {
  let (_dir, repo) = imported_repo();
  let stored = repo.attachments().unwrap().list().unwrap();
  assert_eq!(stored.len(), 1);
  let a = &stored[0];
  let blob = a.blob.as_deref().unwrap();
  fs::remove_file(repo.path(&format!("attachments/{}/{}/{blob}", a.prefix, a.hash))).unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Invalid);
  assert_eq!(report.of_type(ViolationType::MissingAttachment).count(), 1);
  assert!(report.of_type(ViolationType::CountMismatch).count() >= 1);
}

fn blob_path(repo: &Repository, hash: &str) -> String {
  let stored = repo.attachments().unwrap().list().unwrap();
  let a = stored.iter().find(|a| a.hash == hash).unwrap();
  let blob = a.blob.as_deref().unwrap();
  format!("attachments/{}/{}/{blob}", a.prefix, a.hash)
}

#[tokio::test]
async fn tampered_attachment_yields_exactly_one_checksum_mismatch() {
  let (_dir, repo) = imported_repo();
  let blob = blob_path(&repo, &hash_bytes(b"hello world"));
  fs::write(repo.path(&blob), b"hello WORLD").unwrap();

  for options in [sequential(), parallel()] {
    let report = validate(&repo, options).await.unwrap();
    assert_eq!(report.status, Status::Invalid);
    let mismatches: Vec<_> = report.of_type(ViolationType::ChecksumMismatch).collect();
    assert_eq!(mismatches.len(), 1, "{:#?}", report.violations);
    assert_eq!(mismatches[0].file, blob);
  }
}

#[tokio::test]
async fn unlisted_attachment_is_still_rehashed() {
  let (_dir, repo) = imported_repo();
  store_orphan(&repo);
  let blob = blob_path(&repo, &hash_bytes(b"nobody points at me"));
  fs::write(repo.path(&blob), b"somebody points at me").unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Invalid);
  let mismatches: Vec<_> = report
    .of_type(ViolationType::ChecksumMismatch)
    .filter(|v| v.file == blob)
    .collect();
  assert_eq!(mismatches.len(), 1, "{:#?}", report.violations);
}

#[tokio::test]
async fn wrong_count_attribute_is_a_count_mismatch() {
  let (_dir, repo) = imported_repo();
  let path = repo.path(TAMPERED_PARTITION);
  let body = fs::read_to_string(&path).unwrap();
  fs::write(&path, body.replace(r#"<calls count="2">"#, r#"<calls count="7">"#)).unwrap();
  repo.write_manifest().unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  let counts: Vec<_> = report.of_type(ViolationType::CountMismatch).collect();
  assert_eq!(counts.len(), 1, "{:#?}", report.violations);
  assert_eq!(counts[0].expected.as_deref(), Some("7"));
  assert_eq!(counts[0].actual.as_deref(), Some("2"));
}

#[tokio::test]
async fn unsupported_version_aborts() {
  let (_dir, repo) = imported_repo();
  let marker = repo.path(".callvault.toml");
  let body = fs::read_to_string(&marker).unwrap();
  fs::write(&marker, body.replace(
    r#"repository_structure_version = "1""#,
    r#"repository_structure_version = "99""#,
  ))
  .unwrap();

  for options in [sequential(), parallel()] {
    match validate(&repo, options).await {
      Err(Error::UnsupportedVersion { found, supported }) => {
        assert_eq!(found, "99");
        assert_eq!(supported, vec!["1".to_string()]);
      }
      other => panic!("expected UnsupportedVersion, got {other:?}"),
    }
  }
}

#[tokio::test]
async fn non_string_version_is_invalid_format() {
  let (_dir, repo) = imported_repo();
  let marker = repo.path(".callvault.toml");
  let body = fs::read_to_string(&marker).unwrap();
  fs::write(&marker, body.replace(
    r#"repository_structure_version = "1""#,
    "repository_structure_version = 1",
  ))
  .unwrap();

  let report = validate(&repo, sequential()).await.unwrap();
  assert_eq!(report.status, Status::Invalid);
  let bad: Vec<_> = report.of_type(ViolationType::InvalidFormat).collect();
  assert_eq!(bad.len(), 1, "{:#?}", report.violations);
  assert_eq!(bad[0].file, ".callvault.toml");
  assert_eq!(bad[0].actual.as_deref(), Some("integer"));
}

#[tokio::test]
async fn parallel_and_sequential_find_the_same_problems() {
  let (_dir, repo) = imported_repo();
  tamper(&repo);
  store_orphan(&repo);

  let seq = validate(&repo, sequential()).await.unwrap();
  for max_concurrency in [1, 2, 8] {
    let par = validate(&repo, ValidateOptions {
      parallel: true,
      max_concurrency,
      ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(findings(&par), findings(&seq));
    assert_eq!(par.status, seq.status);
  }
  assert!(seq.of_type(ViolationType::ExtraFile).count() >= 1);
  assert_eq!(seq.of_type(ViolationType::OrphanedAttachment).count(), 1);
}

#[tokio::test]
async fn early_termination_returns_partial_report() {
  let (_dir, repo) = imported_repo();
  tamper(&repo);

  let validator = Validator::new(repo.clone()).with_options(ValidateOptions {
    early_termination: true,
    ..Default::default()
  });
  match validator.validate().await {
    Err(Error::EarlyTermination { trigger, partial }) => {
      assert_eq!(trigger.kind, ViolationType::ChecksumMismatch);
      assert!(partial.violations.contains(&*trigger));
      assert_eq!(partial.status, Status::Invalid);
    }
    other => panic!("expected EarlyTermination, got {other:?}"),
  }
  let metrics = validator.metrics();
  assert!(metrics.phase_durations.contains_key(&Phase::Checksum));
  assert!(!metrics.phase_durations.contains_key(&Phase::Content));

  let parallel = validate(&repo, ValidateOptions {
    parallel: true,
    early_termination: true,
    ..Default::default()
  })
  .await;
  match parallel {
    Err(Error::EarlyTermination { trigger, partial }) => {
      assert_eq!(trigger.kind, ViolationType::ChecksumMismatch);
      assert!(partial.violations.contains(&*trigger));
    }
    other => panic!("expected EarlyTermination, got {other:?}"),
  }
}

#[tokio::test]
async fn cancelled_token_stops_the_run() {
  let (_dir, repo) = imported_repo();
  let options = ValidateOptions::default();
  options.cancel.cancel();
  match validate(&repo, options).await {
    Err(Error::Cancelled { reason, .. }) => assert_eq!(reason, CancelReason::Requested),
    other => panic!("expected Cancelled, got {other:?}"),
  }
}

#[tokio::test]
async fn timeout_behaves_like_cancellation() {
  let (_dir, repo) = imported_repo();
  let options = ValidateOptions {
    timeout: Some(Duration::from_millis(20)),
    progress: Some(Arc::new(|_: &str, _: f64| std::thread::sleep(Duration::from_millis(100)))),
    ..Default::default()
  };
  match validate(&repo, options).await {
    Err(Error::Cancelled { reason, partial }) => {
      assert_eq!(reason, CancelReason::Timeout);
      assert!(partial.violations.is_empty());
    }
    other => panic!("expected Cancelled, got {other:?}"),
  }
}

#[tokio::test]
async fn slow_progress_callback_does_not_delay_timeout() {
  let (_dir, repo) = imported_repo();
  for parallel in [false, true] {
    let options = ValidateOptions {
      parallel,
      timeout: Some(Duration::from_millis(20)),
      progress: Some(Arc::new(|_: &str, _: f64| std::thread::sleep(Duration::from_millis(800)))),
      ..Default::default()
    };
    let started = std::time::Instant::now();
    let outcome = validate(&repo, options).await;
    assert!(started.elapsed() < Duration::from_millis(600), "took {:?}", started.elapsed());
    assert!(
      matches!(outcome, Err(Error::Cancelled { reason: CancelReason::Timeout, .. })),
      "{outcome:?}"
    );
  }
}

#[tokio::test]
async fn progress_reports_each_phase_in_order() {
  let (_dir, repo) = imported_repo();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  let options = ValidateOptions {
    progress: Some(Arc::new(move |phase: &str, fraction: f64| {
      sink.lock().push((phase.to_string(), fraction));
    })),
    ..Default::default()
  };
  validate(&repo, options).await.unwrap();

  let seen = seen.lock();
  let phases: Vec<_> = seen.iter().map(|(p, _)| p.as_str()).collect();
  assert_eq!(phases, ["structure", "manifest", "checksum", "content", "consistency"]);
  assert!((seen[4].1 - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cache_skips_rehashing_unchanged_files() {
  let (_dir, repo) = imported_repo();
  let cache = Arc::new(ValidationCache::new());
  let validator = Validator::new(repo.clone()).with_cache(Arc::clone(&cache));

  validator.validate().await.unwrap();
  let first = validator.metrics();
  assert!(first.cache_misses > 0);

  let report = validator.validate().await.unwrap();
  assert_eq!(report.status, Status::Valid);
  let second = validator.metrics();
  assert_eq!(second.cache_misses, 0);
  assert!(second.cache_hits >= first.cache_misses);

  cache.clear();
  validator.validate().await.unwrap();
  assert!(validator.metrics().cache_misses > 0);
}
