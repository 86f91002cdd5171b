//! Per-record bounded concurrency.
//!
//! Epistemic foundation:
//! - K_i: Records are independent; turns within one record are sequential
//! - K_i: At most `concurrency` records hold a permit at any time
//! - I^B: A task may panic → its record is padded, never dropped

use crate::models::{ConversationRecord, EvalError, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

/// Drives one record from its current state to the terminal state.
#[async_trait]
pub trait RecordDriver: Send + Sync {
    async fn drive(&self, record: ConversationRecord) -> ConversationRecord;
}

/// Shared count of finished records.
///
/// Observational only: it never influences ordering or results.
pub struct CompletionCounter {
    count: Mutex<usize>,
    progress: Option<ProgressBar>,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            progress: None,
        }
    }

    /// Counter mirrored to a progress bar of `total` records.
    pub fn with_progress(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        Self {
            count: Mutex::new(0),
            progress: Some(pb),
        }
    }

    /// Serialized read-and-increment.
    pub async fn increment(&self) -> usize {
        let mut count = self.count.lock().await;
        *count += 1;
        info!("{} records done", *count);
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
        *count
    }

    pub async fn count(&self) -> usize {
        *self.count.lock().await
    }

    pub fn finish(&self, message: &str) {
        if let Some(pb) = &self.progress {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one task per record behind a fixed-size admission limiter.
pub struct BoundedRunner {
    semaphore: Arc<Semaphore>,
    counter: Arc<CompletionCounter>,
}

impl BoundedRunner {
    pub fn new(concurrency: usize, counter: Arc<CompletionCounter>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            counter,
        }
    }

    /// Drive every record to completion. Output order is unspecified.
    pub async fn run<D>(&self, driver: Arc<D>, records: Vec<ConversationRecord>) -> Vec<ConversationRecord>
    where
        D: RecordDriver + ?Sized + 'static,
    {
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let fallback = record.clone();
            let driver = Arc::clone(&driver);
            let semaphore = Arc::clone(&self.semaphore);
            let counter = Arc::clone(&self.counter);

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| EvalError::Internal("Semaphore closed".to_string()))?;
                let record = driver.drive(record).await;
                counter.increment().await;
                Result::Ok(record)
            });
            handles.push((fallback, handle));
        }

        let mut done = Vec::with_capacity(handles.len());
        for (mut fallback, handle) in handles {
            let failure = match handle.await {
                Ok(Ok(record)) => {
                    done.push(record);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("Task panicked: {e}"),
            };

            warn!(index = %fallback.index, error = %failure, "Record task failed");
            fallback.pad_failed(&failure);
            self.counter.increment().await;
            done.push(fallback);
        }

        done
    }
}
