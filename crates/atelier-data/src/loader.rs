//! Prefetching batch loader.
//!
//! `num_workers` blocking workers pull batch index lists from a shared
//! dispenser, assemble and collate the samples, and push the result into a
//! bounded channel holding at most `prefetch` batches. Dropping the loader
//! closes the channel and the workers stop after their current batch.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use atelier_core::{DataConfig, Result, SampleErrorPolicy, TrainConfig};

use crate::assembly::{AttributeSample, SampleAssembler, SampleTensors};
use crate::batch::{BatchTensorSet, Collate};
use crate::pose::{PairAssembler, PairSample};

/// Random-access source of per-sample tensors
pub trait SampleSource: Send + Sync + 'static {
    type Item: Collate + Send + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id reported when loading `index` fails
    fn sample_id(&self, index: usize) -> String;

    fn load(&self, index: usize, rng: &mut StdRng) -> Result<Self::Item>;
}

impl SampleSource for SampleAssembler {
    type Item = SampleTensors;

    fn len(&self) -> usize {
        self.index().len()
    }

    fn sample_id(&self, index: usize) -> String {
        self.index()
            .ids()
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("#{index}"))
    }

    fn load(&self, index: usize, rng: &mut StdRng) -> Result<SampleTensors> {
        let id = self.sample_id(index);
        self.assemble(&id, rng)
    }
}

/// Attribute-encoder view over a [`SampleAssembler`]
#[derive(Debug, Clone)]
pub struct AttributeSource {
    assembler: SampleAssembler,
    with_landmarks: bool,
}

impl AttributeSource {
    pub fn new(assembler: SampleAssembler, with_landmarks: bool) -> Self {
        Self {
            assembler,
            with_landmarks,
        }
    }
}

impl SampleSource for AttributeSource {
    type Item = AttributeSample;

    fn len(&self) -> usize {
        self.assembler.index().len()
    }

    fn sample_id(&self, index: usize) -> String {
        self.assembler.sample_id(index)
    }

    fn load(&self, index: usize, rng: &mut StdRng) -> Result<AttributeSample> {
        let id = self.assembler.sample_id(index);
        self.assembler
            .assemble_attribute(&id, self.with_landmarks, rng)
    }
}

impl SampleSource for PairAssembler {
    type Item = PairSample;

    fn len(&self) -> usize {
        self.index().len()
    }

    fn sample_id(&self, index: usize) -> String {
        self.pair_id(index)
    }

    fn load(&self, index: usize, _rng: &mut StdRng) -> Result<PairSample> {
        self.assemble(index)
    }
}

/// Loader settings for one epoch
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub prefetch: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub policy: SampleErrorPolicy,
}

impl LoaderConfig {
    pub fn new(train: &TrainConfig, data: &DataConfig, shuffle: bool, seed: u64) -> Self {
        Self {
            batch_size: train.batch_size.max(1),
            num_workers: train.num_workers.max(1),
            prefetch: train.prefetch.max(1),
            shuffle,
            seed,
            policy: data.sample_error_policy,
        }
    }
}

type Dispenser = Arc<Mutex<std::iter::Enumerate<std::vec::IntoIter<Vec<usize>>>>>;

/// Handle to the workers of one epoch
pub struct DataLoader {
    rx: mpsc::Receiver<Result<BatchTensorSet>>,
    workers: Vec<JoinHandle<()>>,
    num_batches: usize,
}

impl DataLoader {
    /// Start the workers for `epoch`. Must be called from within a tokio runtime.
    pub fn spawn<S: SampleSource>(source: Arc<S>, cfg: LoaderConfig, epoch: u64) -> Self {
        let mut order: Vec<usize> = (0..source.len()).collect();
        if cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(cfg.seed ^ epoch.rotate_left(32));
            order.shuffle(&mut rng);
        }
        let batches: Vec<Vec<usize>> = order
            .chunks(cfg.batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();
        let num_batches = batches.len();
        let dispenser: Dispenser = Arc::new(Mutex::new(batches.into_iter().enumerate()));

        let (tx, rx) = mpsc::channel(cfg.prefetch.max(1));
        let workers = (0..cfg.num_workers.max(1))
            .map(|worker| {
                let source = Arc::clone(&source);
                let dispenser = Arc::clone(&dispenser);
                let tx = tx.clone();
                let cfg = cfg.clone();
                tokio::task::spawn_blocking(move || {
                    worker_loop(worker, source.as_ref(), &dispenser, &tx, &cfg, epoch)
                })
            })
            .collect();

        debug!(epoch, num_batches, "data loader started");
        Self {
            rx,
            workers,
            num_batches,
        }
    }

    /// Number of batches the epoch is split into (skipped batches included)
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Next assembled batch, `None` once every worker has finished
    pub async fn next_batch(&mut self) -> Option<Result<BatchTensorSet>> {
        self.rx.recv().await
    }

    /// Wait for all workers to exit
    pub async fn join(mut self) {
        self.rx.close();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "loader worker panicked");
            }
        }
    }
}

fn worker_loop<S: SampleSource>(
    worker: usize,
    source: &S,
    dispenser: &Dispenser,
    tx: &mpsc::Sender<Result<BatchTensorSet>>,
    cfg: &LoaderConfig,
    epoch: u64,
) {
    loop {
        let next = dispenser.lock().next();
        let Some((batch_index, indices)) = next else {
            break;
        };
        let mut rng = StdRng::seed_from_u64(
            cfg.seed
                .wrapping_add(epoch.rotate_left(32))
                .wrapping_add(batch_index as u64),
        );

        let mut items = Vec::with_capacity(indices.len());
        let mut failure = None;
        for index in indices {
            match source.load(index, &mut rng) {
                Ok(item) => items.push(item),
                Err(e) => {
                    let e = e.for_sample(source.sample_id(index));
                    match cfg.policy {
                        SampleErrorPolicy::FailFast => {
                            failure = Some(e);
                            break;
                        }
                        SampleErrorPolicy::SkipAndLog => {
                            warn!(worker, error = %e, "skipping unreadable sample");
                        }
                    }
                }
            }
        }

        let result = match failure {
            Some(e) => Err(e),
            None if items.is_empty() => {
                warn!(worker, batch_index, "every sample of the batch was skipped");
                continue;
            }
            None => BatchTensorSet::collate(items),
        };
        let failed = result.is_err();
        if tx.blocking_send(result).is_err() {
            debug!(worker, "loader dropped, worker exiting");
            break;
        }
        if failed {
            break;
        }
    }
}
