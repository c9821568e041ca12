//! Mutators apply queued mutations to storage
//!
//! Every mutation of a namespace goes through exactly one mutator, which is
//! the namespace's only writer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::log::apply_mutation;
use crate::records;
use crate::storage::{StagedWriter, StorageWriter};
use crate::types::Mutation;
use crate::{Result, VdsError};

#[async_trait]
pub trait Mutator: Send + Sync {
    /// Hand `mutation` over for application to `namespace`.
    ///
    /// Returning `Ok` does not imply the mutation is visible yet.
    async fn queue_mutation(&self, namespace: &[u8], mutation: Mutation) -> Result<()>;

    /// Wait until every mutation queued before this call has been applied.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> VdsError {
    VdsError::Storage(format!("mutation task failed: {e}"))
}

/// Applies each mutation in its own transaction before returning
pub struct InstantMutator<S> {
    storage: Arc<S>,
}

impl<S> InstantMutator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: StorageWriter + 'static> Mutator for InstantMutator<S> {
    async fn queue_mutation(&self, namespace: &[u8], mutation: Mutation) -> Result<()> {
        let storage = self.storage.clone();
        let namespace = namespace.to_vec();
        tokio::task::spawn_blocking(move || apply_one(&*storage, &namespace, &mutation))
        .await
        .map_err(join_error)?
    }
}

#[derive(Debug, Clone)]
pub struct BatchMutatorConfig {
    /// Most mutations applied in one transaction
    pub batch_size: usize,
    /// Longest wait for the next mutation before a partial batch is applied
    pub timeout: Duration,
    /// Capacity of the queue in front of the consumer
    pub buffer_size: usize,
}

impl Default for BatchMutatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            timeout: Duration::from_millis(10),
            buffer_size: 10_000,
        }
    }
}

enum Request {
    Mutate { namespace: Vec<u8>, mutation: Mutation },
    Flush(oneshot::Sender<()>),
}

/// Queues mutations and applies them in batches from a background task.
///
/// A batch covers a single namespace. It is computed against a write overlay
/// under a read-only transaction and then committed in one update together
/// with the new namespace size. When a batch fails its mutations are retried
/// one at a time, and only those that fail alone are logged and discarded.
pub struct BatchMutator {
    tx: mpsc::Sender<Request>,
}

impl BatchMutator {
    /// Start the consumer task. Must be called from within a tokio runtime.
    pub fn spawn<S: StorageWriter + 'static>(storage: Arc<S>, config: BatchMutatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        tokio::spawn(consume(storage, config, rx));
        Self { tx }
    }
}

#[async_trait]
impl Mutator for BatchMutator {
    async fn queue_mutation(&self, namespace: &[u8], mutation: Mutation) -> Result<()> {
        self.tx
            .send(Request::Mutate {
                namespace: namespace.to_vec(),
                mutation,
            })
            .await
            .map_err(|_| VdsError::Storage("batch mutator has stopped".to_string()))
    }

    async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Request::Flush(done_tx))
            .await
            .map_err(|_| VdsError::Storage("batch mutator has stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| VdsError::Storage("batch mutator has stopped".to_string()))
    }
}

async fn consume<S: StorageWriter + 'static>(
    storage: Arc<S>,
    config: BatchMutatorConfig,
    mut rx: mpsc::Receiver<Request>,
) {
    info!(batch_size = config.batch_size, timeout_ms = config.timeout.as_millis() as u64, "batch mutator: started");
    let mut seed: Option<(Vec<u8>, Mutation)> = None;

    loop {
        let (namespace, first) = match seed.take() {
            Some(s) => s,
            None => match rx.recv().await {
                None => break,
                Some(Request::Flush(done)) => {
                    let _ = done.send(());
                    continue;
                }
                Some(Request::Mutate { namespace, mutation }) => (namespace, mutation),
            },
        };

        let mut batch = vec![first];
        let mut flush = None;
        while batch.len() < config.batch_size {
            match tokio::time::timeout(config.timeout, rx.recv()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Request::Flush(done))) => {
                    flush = Some(done);
                    break;
                }
                Ok(Some(Request::Mutate { namespace: ns, mutation })) => {
                    if ns != namespace {
                        seed = Some((ns, mutation));
                        break;
                    }
                    batch.push(mutation);
                }
            }
        }

        let count = batch.len();
        let st = storage.clone();
        let ns = namespace.clone();
        match tokio::task::spawn_blocking(move || apply_batch_or_each(&*st, &ns, &batch)).await {
            Ok(size) => debug!(namespace = %hex::encode(&namespace), count, size, "batch mutator: applied batch"),
            Err(e) => error!(namespace = %hex::encode(&namespace), count, "batch mutator: batch task failed: {e}"),
        }

        if let Some(done) = flush {
            let _ = done.send(());
        }
    }
    info!("batch mutator: stopped");
}

/// Apply `batch` in one transaction, falling back to one transaction per
/// mutation when that fails. Only the mutations that fail on their own are lost.
fn apply_batch_or_each<S: StorageWriter>(storage: &S, namespace: &[u8], batch: &[Mutation]) -> u64 {
    match apply_batch(storage, namespace, batch) {
        Ok(size) => size,
        Err(e) => {
            warn!(namespace = %hex::encode(namespace), count = batch.len(), "batch mutator: batch failed, applying one by one: {e}");
            for mutation in batch {
                if let Err(e) = apply_one(storage, namespace, mutation) {
                    error!(namespace = %hex::encode(namespace), "batch mutator: mutation dropped: {e}");
                }
            }
            storage
                .execute_read_only(namespace, |kr| records::read_object_size(kr))
                .unwrap_or_default()
        }
    }
}

/// Apply a single mutation in its own transaction.
fn apply_one<S: StorageWriter>(storage: &S, namespace: &[u8], mutation: &Mutation) -> Result<()> {
    storage.execute_update(namespace, |kw| {
        let start = records::read_object_size(&*kw)?;
        let next = apply_mutation(kw, start, mutation)?;
        if next != start {
            records::write_object_size(kw, next)?;
        }
        Ok(())
    })
}

/// Apply `batch` to `namespace`, returning the namespace size afterwards.
fn apply_batch<S: StorageWriter>(storage: &S, namespace: &[u8], batch: &[Mutation]) -> Result<u64> {
    let (start, next, writes) = storage.execute_read_only(namespace, |kr| {
        let start = records::read_object_size(kr)?;
        let mut staged = StagedWriter::new(kr);
        let mut size = start;
        for mutation in batch {
            size = apply_mutation(&mut staged, size, mutation)?;
        }
        Ok((start, size, staged.into_writes()))
    })?;

    if next > start {
        storage.execute_update(namespace, |kw| {
            for (bucket, key, value) in writes {
                kw.set(&bucket, &key, value)?;
            }
            records::write_object_size(kw, next)
        })?;
    }
    Ok(next)
}
