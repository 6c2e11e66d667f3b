//! Issues workflow tasks according to an arrival distribution and collects their results.
//!
//! Every task owns exactly one slot of a [`ResultSlots`] collection, addressed by its index, so
//! results come out in submission order no matter in which order tasks complete.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use indicatif::ProgressBar;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand_distr::{Distribution as _, Exp};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Config, Distribution, MAX_CONCURRENCY, WorkflowType};
use crate::error::{Error, Result};
use crate::model::TaskResult;
use crate::observability::RunLog;
use crate::workflow::Orchestrator;

/// A fixed-size collection of task results where every slot is written exactly once.
#[derive(Clone, Debug)]
pub struct ResultSlots {
    slots: Arc<[OnceLock<TaskResult>]>,
}

impl ResultSlots {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Stores the result of task `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn write(&self, index: usize, result: TaskResult) -> Result<()> {
        self.slots[index]
            .set(result)
            .map_err(|_| Error::SlotWrittenTwice { index })
    }

    /// Returns all results in index order, failing if any slot is still empty.
    pub fn into_results(self) -> Result<Vec<TaskResult>> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| slot.get().cloned().ok_or(Error::SlotMissing { index }))
            .collect()
    }
}

/// Exponentially distributed inter-arrival delays of a Poisson process.
#[derive(Debug)]
pub struct PoissonArrivals {
    rng: SmallRng,
    exp: Exp<f64>,
}

impl PoissonArrivals {
    /// Creates arrivals with `rate` expected tasks per second.
    pub fn new(rate: f64, seed: u64) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::InvalidRate(rate));
        }
        let exp = Exp::new(rate).map_err(|_| Error::InvalidRate(rate))?;

        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            exp,
        })
    }

    /// Draws the delay until the next arrival.
    pub fn next_delay(&mut self) -> Duration {
        Duration::from_secs_f64(self.exp.sample(&mut self.rng))
    }
}

/// The number and arrival pattern of tasks in one run.
#[derive(Clone, Debug)]
pub struct ArrivalPlan {
    pub tasks: usize,
    /// Maximum number of tasks in flight. Only enforced for [`Distribution::Poisson`].
    pub concurrency: usize,
    pub distribution: Distribution,
    /// Expected arrivals per second for [`Distribution::Poisson`].
    pub rate: f64,
    pub seed: u64,
}

impl ArrivalPlan {
    /// The plan of the timed experiment described by `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            tasks: config.tasks,
            concurrency: config.concurrency_limit(),
            distribution: config.distribution,
            rate: config.rate,
            seed: config.seed.unwrap_or_else(rand::random),
        }
    }

    /// The warm-up plan: all warm-up tasks at once.
    pub fn warmup(config: &Config) -> Self {
        Self {
            tasks: config.warmup_tasks,
            concurrency: config.concurrency_limit(),
            distribution: Distribution::Burst,
            rate: config.rate,
            seed: 0,
        }
    }
}

/// Drives workflow tasks through the [`Orchestrator`].
#[derive(Debug)]
pub struct Scheduler {
    orchestrator: Orchestrator,
    source: Arc<str>,
    workflow: Arc<WorkflowType>,
    progress: ProgressBar,
    run_log: RunLog,
}

#[derive(Serialize)]
struct TaskRecord<'a> {
    index: usize,
    result: &'a TaskResult,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: &Config) -> Self {
        Self {
            orchestrator,
            source: config.source.as_str().into(),
            workflow: Arc::new(config.workflow_type.clone()),
            progress: ProgressBar::hidden(),
            run_log: RunLog::sink(),
        }
    }

    /// Reports every completed task on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Writes a record of every completed task to `run_log`.
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = run_log;
        self
    }

    /// Issues all tasks of `plan` and waits for them to complete.
    ///
    /// The first fatal error of any task aborts the run. Tasks still in flight are cancelled and
    /// no results are returned.
    pub async fn run(&self, plan: &ArrivalPlan) -> Result<Vec<TaskResult>> {
        let slots = ResultSlots::new(plan.tasks);

        match plan.distribution {
            Distribution::Poisson => self.run_poisson(plan, &slots).await?,
            Distribution::Burst => {
                let mut tasks = JoinSet::new();
                for index in 0..plan.tasks {
                    tasks.spawn(self.task(index, &slots));
                }
                drain(&mut tasks).await?;
            }
            Distribution::Sequential => {
                for index in 0..plan.tasks {
                    self.task(index, &slots).await?;
                }
            }
        }

        slots.into_results()
    }

    async fn run_poisson(&self, plan: &ArrivalPlan, slots: &ResultSlots) -> Result<()> {
        let concurrency = plan.concurrency.clamp(1, MAX_CONCURRENCY);
        let mut arrivals = PoissonArrivals::new(plan.rate, plan.seed)?;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        for index in 0..plan.tasks {
            let delay = arrivals.next_delay();

            let permit = semaphore.clone().acquire_owned().await?;
            while let Some(joined) = tasks.try_join_next() {
                joined??;
            }

            let task = self.task(index, slots);
            tasks.spawn(async move {
                let result = task.await;
                drop(permit);
                result
            });

            // Keep watching for failures while waiting for the next arrival.
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    Some(joined) = tasks.join_next() => joined??,
                }
            }
        }

        // by acquiring *all* the permits, we wait for all outstanding tasks to finish
        let _permits = semaphore.acquire_many(concurrency as u32).await?;
        drain(&mut tasks).await
    }

    fn task(
        &self,
        index: usize,
        slots: &ResultSlots,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let orchestrator = self.orchestrator.clone();
        let source = Arc::clone(&self.source);
        let workflow = Arc::clone(&self.workflow);
        let progress = self.progress.clone();
        let run_log = self.run_log.clone();
        let slots = slots.clone();

        async move {
            let result = orchestrator.run_task(index, &source, &workflow).await?;

            let record = TaskRecord {
                index,
                result: &result,
            };
            run_log.record("task completed", &record)?;

            slots.write(index, result)?;
            progress.inc(1);
            Ok(())
        }
    }
}

async fn drain(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}
