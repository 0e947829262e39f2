use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tajrobe_core::{Company, RemoteReview, SequentialStorageIds};
use tajrobe_source::{ReviewSource, SourceError};
use tajrobe_sync::{NoopReporter, ProgressReporter, RunState, SyncConfig, SyncPipeline};
use tempfile::tempdir;

#[derive(Clone)]
enum Reply {
    Review(u64),
    Missing,
    Broken,
}

/// In-memory source: `replies` maps review id to what the API would answer.
struct ScriptedSource {
    latest: Option<u64>,
    replies: HashMap<u64, Reply>,
    requested: Mutex<Vec<u64>>,
}

impl ScriptedSource {
    fn new(latest: u64, replies: impl IntoIterator<Item = (u64, Reply)>) -> Self {
        Self {
            latest: Some(latest),
            replies: replies.into_iter().collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        Self {
            latest: None,
            replies: HashMap::new(),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn requested(&self) -> Vec<u64> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewSource for ScriptedSource {
    async fn latest_review_id(&self) -> Result<u64, SourceError> {
        self.latest.ok_or_else(|| SourceError::EmptyListing {
            url: "test://review".to_string(),
        })
    }

    async fn fetch_review(&self, review_id: u64) -> Result<Option<RemoteReview>, SourceError> {
        self.requested.lock().unwrap().push(review_id);
        match self.replies.get(&review_id).cloned().unwrap_or(Reply::Missing) {
            Reply::Review(company_id) => {
                let mut review = RemoteReview::new(review_id, company_id);
                review.title = Some(format!("تجربه {review_id}"));
                review.rate = Some(4.0);
                Ok(Some(review))
            }
            Reply::Missing => Ok(None),
            Reply::Broken => Err(SourceError::NotFound {
                url: format!("test://review/{review_id}"),
            }),
        }
    }
}

/// Replaces the committed `data.json` with a non-empty directory right before
/// `trigger` is fetched, so the next persist cannot rename over it.
struct DirectoryInTheWay {
    inner: ScriptedSource,
    data_dir: PathBuf,
    trigger: u64,
    committed: Mutex<Option<Vec<u8>>>,
}

impl DirectoryInTheWay {
    fn block_dataset(&self) {
        let dataset = self.data_dir.join("data.json");
        let bytes = std::fs::read(&dataset).unwrap();
        std::fs::rename(&dataset, self.data_dir.join("data.json.committed")).unwrap();
        std::fs::create_dir(&dataset).unwrap();
        std::fs::write(dataset.join("keep"), b"x").unwrap();
        *self.committed.lock().unwrap() = Some(bytes);
    }
}

#[async_trait]
impl ReviewSource for DirectoryInTheWay {
    async fn latest_review_id(&self) -> Result<u64, SourceError> {
        self.inner.latest_review_id().await
    }

    async fn fetch_review(&self, review_id: u64) -> Result<Option<RemoteReview>, SourceError> {
        if review_id == self.trigger {
            self.block_dataset();
        }
        self.inner.fetch_review(review_id).await
    }
}

#[derive(Default)]
struct StateLog(Mutex<Vec<RunState>>);

impl ProgressReporter for StateLog {
    fn state_changed(&self, state: RunState) {
        self.0.lock().unwrap().push(state);
    }
}

const SEED: &str = r#"[
  {
    "id": 1,
    "slug": "digikala",
    "name": "دیجی‌کالا",
    "site": "https://digikala.com",
    "reviews": [
      {"id": 3, "company_id": 1, "title": "old", "rate": 3},
      {"id": 4, "company_id": 1, "title": "old", "rate": 2}
    ]
  },
  {
    "id": 2,
    "slug": "snapp",
    "name": "اسنپ",
    "reviews": [
      {"id": 5, "company_id": 2, "title": "old", "rate": 5}
    ]
  }
]"#;

fn seed(dir: &Path) {
    std::fs::write(dir.join("data.json"), SEED).unwrap();
}

fn config(dir: &Path, batch_size: usize) -> SyncConfig {
    SyncConfig {
        data_dir: dir.to_path_buf(),
        batch_size,
        batch_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn pipeline(dir: &Path, batch_size: usize, source: Arc<dyn ReviewSource>) -> SyncPipeline {
    SyncPipeline::new(config(dir, batch_size), source)
        .with_reporter(Arc::new(NoopReporter))
        .with_storage_ids(Arc::new(SequentialStorageIds::default()))
}

fn read_dataset(dir: &Path) -> Vec<Company> {
    serde_json::from_slice(&std::fs::read(dir.join("data.json")).unwrap()).unwrap()
}

fn review_ids(dataset: &[Company], company_id: u64) -> Vec<u64> {
    dataset
        .iter()
        .find(|c| c.id() == company_id)
        .map(|c| c.reviews.iter().map(|r| r.id).collect())
        .unwrap_or_default()
}

fn backups(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir.join("backups")) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn fetches_only_missing_ids_and_merges_by_company() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    let source = Arc::new(ScriptedSource::new(
        10,
        [
            (1, Reply::Review(1)),
            (2, Reply::Review(2)),
            (6, Reply::Review(1)),
            (7, Reply::Missing),
            (8, Reply::Review(99)),
            (9, Reply::Broken),
            (10, Reply::Review(2)),
        ],
    ));

    let summary = pipeline(dir.path(), 3, source.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(source.requested(), vec![1, 2, 6, 7, 8, 9, 10]);
    assert_eq!(summary.candidates, 7);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.merged, 4);
    assert_eq!(summary.absent, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.orphaned, 1);

    let dataset = read_dataset(dir.path());
    assert_eq!(review_ids(&dataset, 1), vec![3, 4, 1, 6]);
    assert_eq!(review_ids(&dataset, 2), vec![5, 2, 10]);
    assert_eq!(dataset[0].profile.extra["site"], "https://digikala.com");

    let imported = &dataset[0].reviews[2];
    assert_eq!(imported.status.as_deref(), Some("PUBLISH"));
    assert!(imported.meta.is_some());
    assert!(imported.storage_id.is_some());

    let progress: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("progress.json")).unwrap()).unwrap();
    assert_eq!(progress["lastProcessedBatch"], 2);
    assert_eq!(progress["totalBatches"], 3);
    assert_eq!(progress["processedReviews"], 7);
    assert_eq!(progress["totalReviews"], 7);
}

#[tokio::test]
async fn exactly_one_byte_identical_backup_per_run() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    let source = Arc::new(ScriptedSource::new(6, [(1, Reply::Review(1))]));

    let summary = pipeline(dir.path(), 50, source).run_once().await.expect("run");

    let backups = backups(dir.path());
    assert_eq!(backups.len(), 1);
    assert_eq!(summary.backup_path.as_deref(), Some(backups[0].as_path()));
    assert_eq!(std::fs::read(&backups[0]).unwrap(), SEED.as_bytes().to_vec());
    let name = backups[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("data-backup-") && name.ends_with(".json"));
    assert!(!name.contains(':'));
}

#[tokio::test]
async fn second_run_without_new_data_leaves_dataset_and_progress_alone() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    let replies = [
        (1, Reply::Review(1)),
        (2, Reply::Review(2)),
        (6, Reply::Review(2)),
    ];

    let first = Arc::new(ScriptedSource::new(6, replies.clone()));
    pipeline(dir.path(), 2, first).run_once().await.expect("first run");
    let after_first = std::fs::read(dir.path().join("data.json")).unwrap();
    let progress_after_first = std::fs::read(dir.path().join("progress.json")).unwrap();
    assert_eq!(backups(dir.path()).len(), 1);

    let second = Arc::new(ScriptedSource::new(6, replies));
    let summary = pipeline(dir.path(), 2, second.clone())
        .run_once()
        .await
        .expect("second run");

    assert!(summary.up_to_date);
    assert!(second.requested().is_empty());
    assert_eq!(std::fs::read(dir.path().join("data.json")).unwrap(), after_first);
    assert_eq!(std::fs::read(dir.path().join("progress.json")).unwrap(), progress_after_first);

    // Every run over an existing dataset takes its own safety copy.
    let backup = summary.backup_path.expect("up-to-date run is backed up");
    assert_eq!(std::fs::read(backup).unwrap(), after_first);
}

#[tokio::test]
async fn up_to_date_run_still_takes_one_backup() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    let source = Arc::new(ScriptedSource::new(5, []));

    let summary = pipeline(dir.path(), 50, source.clone()).run_once().await.expect("run");

    assert!(summary.up_to_date);
    assert!(source.requested().is_empty());
    let backups = backups(dir.path());
    assert_eq!(backups.len(), 1);
    assert_eq!(std::fs::read(&backups[0]).unwrap(), SEED.as_bytes().to_vec());
    assert_eq!(std::fs::read_to_string(dir.path().join("data.json")).unwrap(), SEED);
    assert!(!dir.path().join("progress.json").exists());
}

#[tokio::test]
async fn known_reviews_are_never_added_twice() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    // The source still serves 3, 4 and 5; they must not be requested or re-added.
    let source = Arc::new(ScriptedSource::new(
        5,
        (1..=5).map(|id| (id, Reply::Review(if id == 5 { 2 } else { 1 }))),
    ));

    pipeline(dir.path(), 10, source.clone()).run_once().await.expect("run");

    assert_eq!(source.requested(), vec![1, 2]);
    let dataset = read_dataset(dir.path());
    let all: Vec<u64> = dataset.iter().flat_map(|c| c.reviews.iter().map(|r| r.id)).collect();
    for id in 1..=5 {
        assert_eq!(all.iter().filter(|x| **x == id).count(), 1, "review {id}");
    }
}

#[tokio::test]
async fn one_missing_id_does_not_block_its_batch() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("data.json"), r#"[{"id": 7, "name": "Tapsi", "reviews": []}]"#).unwrap();
    let source = Arc::new(ScriptedSource::new(
        5,
        [
            (1, Reply::Review(7)),
            (2, Reply::Review(7)),
            (3, Reply::Missing),
            (4, Reply::Review(7)),
            (5, Reply::Review(7)),
        ],
    ));

    let summary = pipeline(dir.path(), 5, source).run_once().await.expect("run");

    assert_eq!(summary.batches, 1);
    assert_eq!(summary.merged, 4);
    assert_eq!(summary.absent, 1);
    assert_eq!(review_ids(&read_dataset(dir.path()), 7), vec![1, 2, 4, 5]);
}

#[tokio::test]
async fn unresolvable_cursor_aborts_before_touching_the_dataset() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());

    let err = pipeline(dir.path(), 50, Arc::new(ScriptedSource::unreachable()))
        .run_once()
        .await
        .expect_err("cursor failure is fatal");

    assert!(format!("{err:#}").contains("latest remote review id"));
    assert_eq!(std::fs::read_to_string(dir.path().join("data.json")).unwrap(), SEED);
    assert_eq!(backups(dir.path()).len(), 1);
    assert!(!dir.path().join("progress.json").exists());
}

#[tokio::test]
async fn malformed_dataset_aborts_before_fetching() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("data.json"), r#"{"not": "a list"}"#).unwrap();
    let source = Arc::new(ScriptedSource::new(3, [(1, Reply::Review(1))]));

    let result = pipeline(dir.path(), 50, source.clone()).run_once().await;

    assert!(result.is_err());
    assert!(source.requested().is_empty());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("data.json")).unwrap(),
        r#"{"not": "a list"}"#
    );
    assert!(backups(dir.path()).is_empty());
}

#[tokio::test]
async fn fresh_start_drops_orphans_and_only_checkpoints() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(ScriptedSource::new(2, [(1, Reply::Review(1)), (2, Reply::Review(2))]));

    let summary = pipeline(dir.path(), 50, source).run_once().await.expect("run");

    assert_eq!(summary.known_reviews, 0);
    assert_eq!(summary.orphaned, 2);
    assert_eq!(summary.merged, 0);
    assert!(summary.backup_path.is_none());
    assert!(!dir.path().join("data.json").exists());
    assert!(dir.path().join("progress.json").exists());
}

#[tokio::test]
async fn failed_persist_ends_the_run_and_keeps_the_last_committed_batch() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());
    let source = Arc::new(DirectoryInTheWay {
        inner: ScriptedSource::new(
            8,
            [
                (1, Reply::Review(1)),
                (2, Reply::Review(2)),
                (6, Reply::Review(1)),
                (7, Reply::Review(2)),
            ],
        ),
        data_dir: dir.path().to_path_buf(),
        trigger: 6,
        committed: Mutex::new(None),
    });
    let states = Arc::new(StateLog::default());

    let err = pipeline(dir.path(), 2, source.clone())
        .with_reporter(states.clone())
        .run_once()
        .await
        .expect_err("rename onto a directory must fail");

    assert!(format!("{err:#}").contains("persisting dataset after batch 2"));
    assert_eq!(
        *states.0.lock().unwrap(),
        vec![
            RunState::Loading,
            RunState::Indexing,
            RunState::ResolvingCursor,
            RunState::BatchLoop,
            RunState::Failed
        ]
    );
    assert_eq!(source.inner.requested(), vec![1, 2, 6, 7]);

    // The file that was on disk when the failing batch started is untouched.
    let committed = std::fs::read(dir.path().join("data.json.committed")).unwrap();
    assert_eq!(Some(committed.clone()), *source.committed.lock().unwrap());
    let dataset: Vec<Company> = serde_json::from_slice(&committed).unwrap();
    assert_eq!(review_ids(&dataset, 1), vec![3, 4, 1]);
    assert_eq!(review_ids(&dataset, 2), vec![5, 2]);

    let leftovers: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    let progress: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("progress.json")).unwrap()).unwrap();
    assert_eq!(progress["lastProcessedBatch"], 0);
    assert_eq!(progress["processedReviews"], 2);
}
