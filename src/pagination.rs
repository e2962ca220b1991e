//! Cursor paginator: populates a stage's [`WorkQueue`] from the store.
//!
//! New relative to the teacher (its models are pre-loaded, not paginated
//! from a persistence layer), written in the same "plain loop, propagate
//! fatal errors by closing the channel" idiom the capability worker loops
//! use for their own shutdown handling.

use crate::progress::ProgressTracker;
use crate::queue::{Job, WorkQueue};
use crate::stage::Stage;
use crate::store::Store;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds a [`Job`] for one pending id, or `None` if the row/file is
/// unusable (missing file, malformed input) — in which case the id is
/// skipped rather than enqueued.
pub fn default_build_job(record: &crate::store::ImageRecord) -> Option<Job> {
    if !record.path.as_os_str().is_empty() {
        Some(Job {
            image_id: record.id,
            image_path: record.path.clone(),
            auxiliary_input: if record.prompt.is_empty() {
                None
            } else {
                Some(record.prompt.clone())
            },
        })
    } else {
        None
    }
}

/// Drives `fetch_pending` in a loop, stopping once a batch comes back empty
/// or short of `batch_size` (§4.3). `last_id` starts at 0 and becomes the
/// maximum id seen in the previous batch.
pub async fn populate_queue(
    store: Arc<dyn Store>,
    stage: Stage,
    queue: Arc<WorkQueue>,
    progress: Arc<ProgressTracker>,
    batch_size: usize,
) {
    let mut last_id: u64 = 0;
    let mut seen = std::collections::HashSet::new();

    loop {
        let batch = match store.fetch_pending(stage, batch_size, last_id).await {
            Ok(ids) => ids,
            Err(e) => {
                queue.close_with_error(format!("fetch_pending failed: {}", e));
                return;
            }
        };

        if batch.is_empty() {
            break;
        }

        let short = batch.len() < batch_size;
        let Some(&max_id) = batch.iter().max() else {
            break;
        };

        for id in batch {
            debug_assert!(seen.insert(id), "cursor paginator yielded duplicate id {id}");

            let record = match store.get_image(id).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    progress.record_skip();
                    continue;
                }
                Err(e) => {
                    queue.close_with_error(format!("get_image failed: {}", e));
                    return;
                }
            };

            match default_build_job(&record) {
                Some(job) => {
                    if queue.push(job).is_err() {
                        // Queue was closed concurrently (e.g. stage stop).
                        return;
                    }
                }
                None => progress.record_skip(),
            }
        }

        last_id = max_id;
        if short {
            break;
        }
    }

    queue.complete();
}

/// Resolves a [`PathBuf`] auxiliary text input into the sentence-encoder
/// text used by the embedding stage's text encoder (§4.8).
pub fn embedding_text_input(prompt: &str, negative_prompt: &str) -> String {
    if negative_prompt.is_empty() {
        prompt.to_string()
    } else {
        format!("{} [SEP] {}", prompt, negative_prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_job_skips_empty_path() {
        let record = crate::store::ImageRecord {
            id: 1,
            path: PathBuf::new(),
            prompt: "a".into(),
            negative_prompt: String::new(),
        };
        assert!(default_build_job(&record).is_none());
    }

    #[test]
    fn build_job_carries_prompt_as_aux() {
        let record = crate::store::ImageRecord {
            id: 1,
            path: PathBuf::from("/tmp/a.png"),
            prompt: "a cat".into(),
            negative_prompt: String::new(),
        };
        let job = default_build_job(&record).unwrap();
        assert_eq!(job.auxiliary_input.as_deref(), Some("a cat"));
    }

    #[test]
    fn embedding_text_input_appends_negative_with_sep() {
        assert_eq!(embedding_text_input("a cat", ""), "a cat");
        assert_eq!(
            embedding_text_input("a cat", "blurry"),
            "a cat [SEP] blurry"
        );
    }
}
