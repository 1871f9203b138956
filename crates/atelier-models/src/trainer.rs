//! Epoch loop driving a [`PipelineModel`] over prefetched batches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use atelier_core::{Error, Result, RunConfig};
use atelier_data::{DataLoader, LoaderConfig, SampleSource};

use crate::checkpoint::{CheckpointStore, LATEST};
use crate::model::PipelineModel;

/// Error used as the plateau metric of the learning-rate schedule
pub const PLATEAU_METRIC: &str = "loss_total";

/// Running mean of named errors, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct ErrorMeter {
    entries: Vec<(String, f64, usize)>,
}

impl ErrorMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, errors: &[(String, f32)]) {
        for (name, value) in errors {
            match self.entries.iter_mut().find(|(n, _, _)| n == name) {
                Some((_, sum, count)) => {
                    *sum += f64::from(*value);
                    *count += 1;
                }
                None => self.entries.push((name.clone(), f64::from(*value), 1)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, sum, count)| sum / *count as f64)
    }

    pub fn means(&self) -> Vec<(String, f32)> {
        self.entries
            .iter()
            .map(|(name, sum, count)| (name.clone(), (sum / *count as f64) as f32))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Outcome of one training epoch
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub iterations: usize,
    /// Mean training errors over the epoch
    pub train_errors: Vec<(String, f32)>,
    /// Mean evaluation errors, on epochs with an evaluation pass
    pub test_errors: Option<Vec<(String, f32)>>,
    /// Generator learning rate after the scheduler step
    pub learning_rate: f64,
    pub elapsed: Duration,
}

fn every(freq: usize, n: usize) -> bool {
    freq > 0 && n % freq == 0
}

/// Run `model.test` over every batch of `source` and average the errors
pub async fn evaluate<M, S>(model: &mut M, cfg: &RunConfig, source: Arc<S>) -> Result<Vec<(String, f32)>>
where
    M: PipelineModel,
    S: SampleSource,
{
    let mut loader = DataLoader::spawn(source, LoaderConfig::new(&cfg.train, &cfg.data, false, cfg.seed), 0);
    let mut meter = ErrorMeter::new();
    let outcome = async {
        while let Some(batch) = loader.next_batch().await {
            let batch = batch?;
            model.set_input(&batch)?;
            model.test()?;
            meter.add(&model.current_errors());
        }
        Ok::<(), Error>(())
    }
    .await;
    loader.join().await;
    outcome.map(|()| meter.means())
}

async fn train_epoch<M, S>(
    model: &mut M,
    cfg: &RunConfig,
    source: Arc<S>,
    epoch: usize,
    meter: &mut ErrorMeter,
) -> Result<usize>
where
    M: PipelineModel,
    S: SampleSource,
{
    let loader_cfg = LoaderConfig::new(&cfg.train, &cfg.data, true, cfg.seed);
    let mut loader = DataLoader::spawn(source, loader_cfg, epoch as u64);
    let num_batches = loader.num_batches();
    let mut iterations = 0;
    let outcome = async {
        while let Some(batch) = loader.next_batch().await {
            let batch = batch?;
            model.set_input(&batch)?;
            model.optimize_step()?;
            let errors = model.current_errors();
            meter.add(&errors);
            iterations += 1;
            if every(cfg.train.display_freq, iterations) {
                debug!(epoch, iteration = iterations, num_batches, errors = ?errors, "training");
            }
        }
        Ok::<(), Error>(())
    }
    .await;
    loader.join().await;
    outcome.map(|()| iterations)
}

/// Train for epochs `epoch_count ..= niter + niter_decay`.
///
/// The run options are written to the checkpoint directory first; with
/// `continue_train` the model resumes from the `which_epoch` checkpoint.
/// Checkpoints are saved under the epoch number and as `latest` every
/// `save_epoch_freq` epochs, and `test_source` is evaluated every
/// `test_epoch_freq` epochs.
pub async fn train<M, S>(
    model: &mut M,
    cfg: &RunConfig,
    train_source: Arc<S>,
    test_source: Option<Arc<S>>,
) -> Result<Vec<EpochSummary>>
where
    M: PipelineModel,
    S: SampleSource,
{
    let store = CheckpointStore::for_run(cfg);
    store.save_options(cfg)?;
    if cfg.train.continue_train {
        model.load_checkpoint(&cfg.train.which_epoch)?;
        info!(label = %cfg.train.which_epoch, "resumed training");
    }

    let last_epoch = cfg.train.niter + cfg.train.niter_decay;
    info!(
        model = model.name(),
        samples = train_source.len(),
        first_epoch = cfg.train.epoch_count,
        last_epoch,
        "training started"
    );

    let mut summaries = Vec::new();
    for epoch in cfg.train.epoch_count..=last_epoch {
        let started = Instant::now();
        let mut meter = ErrorMeter::new();
        let iterations = train_epoch(model, cfg, Arc::clone(&train_source), epoch, &mut meter).await?;
        if iterations == 0 {
            warn!(epoch, "epoch produced no batches");
        }

        if every(cfg.train.save_epoch_freq, epoch) {
            model.save_checkpoint(&epoch.to_string())?;
            model.save_checkpoint(LATEST)?;
        }

        let test_errors = match &test_source {
            Some(source) if every(cfg.train.test_epoch_freq, epoch) => {
                let errors = evaluate(model, cfg, Arc::clone(source)).await?;
                info!(epoch, errors = ?errors, "evaluation");
                Some(errors)
            }
            _ => None,
        };

        let learning_rate = model.update_learning_rate(meter.get(PLATEAU_METRIC))?;
        let summary = EpochSummary {
            epoch,
            iterations,
            train_errors: meter.means(),
            test_errors,
            learning_rate,
            elapsed: started.elapsed(),
        };
        info!(
            epoch,
            iterations,
            learning_rate,
            elapsed_s = summary.elapsed.as_secs_f64(),
            errors = ?summary.train_errors,
            "epoch finished"
        );
        summaries.push(summary);
    }
    Ok(summaries)
}
