use std::any::Any;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::chain::{ChainPhase, ChainStats, McmcChain};
use crate::checkpoint::{self, CheckpointRecord, SamplerState};
use crate::convergence::{ConvergenceMonitor, ConvergenceStats};
use crate::covariance::{learn_covariance, CovarianceMatrix, ProposalCovariance, WeightedMoments};
use crate::error::{McmcError, Result};
use crate::output::{chain_path, checkpoint_path, header, ChainWriter};
use crate::parameters::ParameterSpace;
use crate::posterior::Posterior;
use crate::proposal::{ProposalSchedule, Proposer};
use crate::settings::{McmcSettings, OutputSettings};

/// Read-only state shared by all chains of a run.
#[derive(Debug)]
pub struct RunContext {
    posterior: Arc<Posterior>,
    settings: McmcSettings,
    schedule: ProposalSchedule,
    proposer: Proposer,
    initial_proposal: Arc<ProposalCovariance>,
}

impl RunContext {
    pub fn new(posterior: Arc<Posterior>, settings: McmcSettings) -> Result<Self> {
        settings.validate()?;
        let space = posterior.space();
        let schedule = ProposalSchedule::new(space.blocks(), &settings.oversampling)?;
        let proposer = Proposer::new(settings.proposal)?;

        let matrix = match &settings.initial_covariance {
            Some(rows) => {
                let matrix = CovarianceMatrix::from_rows(rows)?;
                if matrix.dim() != space.dim() {
                    return Err(McmcError::Configuration(format!(
                        "initial covariance is {0}x{0} but there are {1} sampled parameters",
                        matrix.dim(),
                        space.dim()
                    )));
                }
                matrix
            }
            None => space.initial_covariance(),
        };
        let initial_proposal = Arc::new(ProposalCovariance::new(matrix, space.blocks())?);

        Ok(Self {
            posterior,
            settings,
            schedule,
            proposer,
            initial_proposal,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        self.posterior.space()
    }

    pub fn posterior(&self) -> &Posterior {
        &self.posterior
    }

    pub fn settings(&self) -> &McmcSettings {
        &self.settings
    }

    pub fn schedule(&self) -> &ProposalSchedule {
        &self.schedule
    }

    pub fn proposer(&self) -> &Proposer {
        &self.proposer
    }

    /// Whether covariances are learned from all chains together.
    pub fn pooled_learning(&self) -> bool {
        self.settings.learning.pooled && self.settings.num_chains > 1
    }

    pub fn initial_proposal(&self) -> Arc<ProposalCovariance> {
        self.initial_proposal.clone()
    }
}

/// Cooperative stop signal, honored at the next synchronization point.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    Interrupted,
    StepLimit,
    SampleLimit,
    TimeLimit,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub termination: Termination,
    pub master_seed: u64,
    pub rounds: u64,
    pub resumed: bool,
    /// Result of the last convergence test of this run, if any.
    pub convergence: Option<ConvergenceStats>,
    pub chains: Vec<ChainStats>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run `func` for chain `chain`, turning a panic into an error.
fn guarded<T>(chain: u64, func: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(func)).unwrap_or_else(|payload| {
        Err(McmcError::WorkerFailed {
            chain,
            message: panic_message(&*payload),
        })
    })
}

/// Drives a fixed set of chains in synchronized rounds.
///
/// Each round every chain takes `steps_per_round` Metropolis steps on the
/// worker pool. Once all of them are done, new samples are written out,
/// convergence is tested, the shared proposal may be re-learned and a
/// checkpoint is written. Termination is only decided between rounds.
pub struct Sampler {
    ctx: RunContext,
    state: SamplerState,
    pool: ThreadPool,
    writers: Vec<ChainWriter>,
    stop: StopHandle,
    started: Instant,
    elapsed_before: Duration,
    last_stats: Option<ConvergenceStats>,
    resumed: bool,
    finished: Option<Termination>,
}

impl Sampler {
    /// Set up a run, resuming from the checkpoint in the output directory
    /// if there is one.
    pub fn new(posterior: impl Into<Arc<Posterior>>, settings: McmcSettings) -> Result<Self> {
        let ctx = RunContext::new(posterior.into(), settings)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(ctx.settings().num_threads())
            .thread_name(|i| format!("speedy-mh-worker-{}", i))
            .build()
            .map_err(|err| {
                McmcError::Configuration(format!("could not start thread pool: {err}"))
            })?;

        let previous = match &ctx.settings().output {
            Some(output) => prepare_output(output, ctx.settings())?,
            None => None,
        };
        let resumed = previous.is_some();
        let state = match previous {
            Some(record) => {
                let mut state = checkpoint::restore(record, &ctx)?;
                for chain in &mut state.chains {
                    chain.resume(&ctx);
                }
                log::info!(
                    "Resuming {} chains from round {} (seed {})",
                    state.chains.len(),
                    state.round,
                    state.master_seed
                );
                state
            }
            None => fresh_state(&ctx, &pool)?,
        };

        let writers = match &ctx.settings().output {
            Some(output) => open_writers(&ctx, output, &state.chains, resumed)?,
            None => Vec::new(),
        };

        Ok(Self {
            elapsed_before: state.elapsed,
            ctx,
            state,
            pool,
            writers,
            stop: StopHandle::default(),
            started: Instant::now(),
            last_stats: None,
            resumed,
            finished: None,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn chains(&self) -> &[McmcChain] {
        &self.state.chains
    }

    pub fn master_seed(&self) -> u64 {
        self.state.master_seed
    }

    /// Completed synchronization rounds, including those before a resume.
    pub fn round(&self) -> u64 {
        self.state.round
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn convergence(&self) -> Option<&ConvergenceStats> {
        self.last_stats.as_ref()
    }

    pub fn monitor(&self) -> &ConvergenceMonitor {
        &self.state.monitor
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Sampling time, including the time before a resume.
    pub fn elapsed(&self) -> Duration {
        self.elapsed_before + self.started.elapsed()
    }

    /// Snapshot of the current state.
    pub fn checkpoint(&self) -> CheckpointRecord {
        let mut record = checkpoint::save(&self.state, &self.ctx);
        record.elapsed = self.elapsed().as_secs_f64();
        record
    }

    /// Sample until the chains converge or a limit is reached.
    pub fn run(&mut self) -> Result<RunSummary> {
        if let Some(termination) = self.finished {
            return Ok(self.summary(termination));
        }
        log::info!(
            "Sampling {} parameters with {} chains",
            self.ctx.space().dim(),
            self.state.chains.len()
        );
        loop {
            if let Some(termination) = self.termination() {
                return self.finish(termination);
            }
            self.run_round()?;
        }
    }

    /// Advance every chain to the next synchronization point and process
    /// it.
    ///
    /// Synchronization points fall on multiples of `steps_per_round` steps.
    /// When a step limit ends the run in between, only the new samples are
    /// written, so a resumed run meets the same synchronization points as an
    /// uninterrupted one.
    pub fn run_round(&mut self) -> Result<()> {
        let steps = self.round_steps();
        let ctx = &self.ctx;
        let chains = &mut self.state.chains;
        let results: Vec<Result<()>> = self.pool.install(|| {
            chains
                .par_iter_mut()
                .map(|chain| {
                    let id = chain.id();
                    guarded(id, || chain.advance(ctx, steps))
                })
                .collect()
        });
        results.into_iter().collect::<Result<()>>()?;

        if self.steps_done() % self.ctx.settings().steps_per_round != 0 {
            return self.write_committed();
        }

        let burn_in = self.ctx.settings().convergence.burn_in;
        for chain in &mut self.state.chains {
            chain.close_round(burn_in);
        }
        self.state.round += 1;
        let round = self.state.round;
        self.write_committed()?;

        self.last_stats = self.state.monitor.check(round, &self.state.chains);
        match &self.last_stats {
            Some(stats) => {
                log::debug!("Round {round}: max R-1 = {:.4}", stats.max_rminus1);
                if self.state.monitor.is_converged(stats) {
                    log::info!(
                        "Chains converged after {round} rounds (max R-1 = {:.4})",
                        stats.max_rminus1
                    );
                    self.state.converged = true;
                }
            }
            None => log::debug!("Round {round}: not enough samples to test convergence"),
        }

        self.learn_pooled();

        if round % self.ctx.settings().checkpoint_every == 0 {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    /// Steps every chain has taken. Chains move in lockstep.
    fn steps_done(&self) -> u64 {
        self.state
            .chains
            .iter()
            .map(|chain| chain.stats().steps)
            .max()
            .unwrap_or(0)
    }

    /// Steps to the next synchronization point, or to the step limit if
    /// that comes first.
    fn round_steps(&self) -> u64 {
        let settings = self.ctx.settings();
        let done = self.steps_done();
        let steps = settings.steps_per_round - done % settings.steps_per_round;
        match settings.max_steps {
            Some(max) => steps.min(max.saturating_sub(done)),
            None => steps,
        }
    }

    fn termination(&self) -> Option<Termination> {
        let settings = self.ctx.settings();
        let chains = &self.state.chains;
        if self.state.converged {
            return Some(Termination::Converged);
        }
        if self.stop.is_stopped() {
            return Some(Termination::Interrupted);
        }
        if let Some(max) = settings.max_steps {
            if chains.iter().all(|chain| chain.stats().steps >= max) {
                return Some(Termination::StepLimit);
            }
        }
        if let Some(max) = settings.max_samples {
            if chains.iter().all(|chain| chain.stats().accepted >= max) {
                return Some(Termination::SampleLimit);
            }
        }
        if let Some(max) = settings.max_seconds {
            if self.elapsed().as_secs_f64() >= max {
                return Some(Termination::TimeLimit);
            }
        }
        None
    }

    /// Learn one covariance from all chains and hand it to each of them.
    fn learn_pooled(&mut self) {
        let ctx = &self.ctx;
        let settings = ctx.settings();
        if !settings.learning.enabled || !ctx.pooled_learning() {
            return;
        }
        let dim = ctx.space().dim();
        let chains = &mut self.state.chains;
        if chains
            .iter()
            .any(|chain| chain.accepted_since_learn() < settings.learn_every(dim))
        {
            return;
        }
        if let Some(rminus1) = self.state.monitor.last_rminus1() {
            if !(rminus1 < settings.learning.max_rminus1) {
                log::debug!("Chains too far apart to share a proposal (R-1 = {rminus1:.2})");
                return;
            }
        }

        let mut pooled = WeightedMoments::new(dim);
        for chain in chains.iter() {
            pooled.merge(&chain.moments(settings.convergence.burn_in));
        }
        let Some(matrix) = learn_covariance(&pooled, settings.min_learn_samples(dim)) else {
            log::debug!(
                "Not enough samples for a shared proposal ({:.1} effective)",
                pooled.effective_samples()
            );
            return;
        };
        match ProposalCovariance::new(matrix, ctx.space().blocks()) {
            Ok(proposal) => {
                let proposal = Arc::new(proposal);
                for chain in chains.iter_mut() {
                    chain.set_proposal(proposal.clone());
                    chain.mark_learned();
                }
                log::debug!(
                    "Updated the shared proposal from {:.1} effective samples",
                    pooled.effective_samples()
                );
            }
            Err(err) => log::warn!("Keeping the shared proposal: {err}"),
        }
    }

    /// Hand the committed entries to the chain files. Without output they
    /// are dropped.
    fn write_committed(&mut self) -> Result<()> {
        for (i, chain) in self.state.chains.iter_mut().enumerate() {
            let entries = chain.take_unwritten();
            if let Some(writer) = self.writers.get_mut(i) {
                for entry in &entries {
                    writer.write_entry(entry)?;
                }
                writer.flush()?;
            }
        }
        Ok(())
    }

    fn save_checkpoint(&self) -> Result<()> {
        let Some(output) = &self.ctx.settings().output else {
            return Ok(());
        };
        let path = checkpoint_path(output);
        self.checkpoint().store(&path)?;
        log::debug!("Wrote checkpoint {:?} at round {}", path, self.state.round);
        Ok(())
    }

    fn finish(&mut self, termination: Termination) -> Result<RunSummary> {
        let phase = match termination {
            Termination::Converged => ChainPhase::Converged,
            _ => ChainPhase::TerminatedByLimit,
        };
        for chain in &mut self.state.chains {
            chain.set_phase(phase);
        }
        self.write_committed()?;
        self.save_checkpoint()?;

        // The pending points are only written after the checkpoint, a resume
        // drops them again.
        for (chain, writer) in self.state.chains.iter().zip(&mut self.writers) {
            if chain.current().weight > 0 {
                writer.write_entry(chain.current())?;
            }
            writer.flush()?;
        }

        self.finished = Some(termination);
        log::info!(
            "Sampling stopped after {} rounds: {:?}",
            self.state.round,
            termination
        );
        Ok(self.summary(termination))
    }

    fn summary(&self, termination: Termination) -> RunSummary {
        RunSummary {
            termination,
            master_seed: self.state.master_seed,
            rounds: self.state.round,
            resumed: self.resumed,
            convergence: self.last_stats.clone(),
            chains: self.state.chains.iter().map(|chain| *chain.stats()).collect(),
        }
    }
}

/// Look for earlier output. Returns the checkpoint to resume from.
fn prepare_output(
    output: &OutputSettings,
    settings: &McmcSettings,
) -> Result<Option<CheckpointRecord>> {
    let checkpoint = checkpoint_path(output);
    let chain_files: Vec<PathBuf> = (0..settings.num_chains as u64)
        .map(|chain| chain_path(output, chain))
        .filter(|path| path.exists())
        .collect();

    if settings.force {
        for path in chain_files
            .iter()
            .chain(checkpoint.exists().then_some(&checkpoint))
        {
            log::info!("Removing {:?}", path);
            fs::remove_file(path)?;
        }
        return Ok(None);
    }
    if checkpoint.exists() {
        return CheckpointRecord::load(&checkpoint).map(Some);
    }
    match chain_files.into_iter().next() {
        Some(path) => Err(McmcError::ExistingOutput(path)),
        None => Ok(None),
    }
}

fn fresh_state(ctx: &RunContext, pool: &ThreadPool) -> Result<SamplerState> {
    let settings = ctx.settings();
    let master_seed = settings.seed.unwrap_or_else(|| rand::rng().random());
    log::info!(
        "Starting {} chains with seed {master_seed}",
        settings.num_chains
    );

    let chains = pool.install(|| {
        (0..settings.num_chains as u64)
            .into_par_iter()
            .map(|id| {
                guarded(id, || {
                    let mut rng = ChaCha8Rng::seed_from_u64(master_seed);
                    rng.set_stream(id);
                    McmcChain::initialize(id, rng, ctx.initial_proposal(), ctx)
                })
            })
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(SamplerState {
        master_seed,
        round: 0,
        elapsed: Duration::ZERO,
        converged: false,
        chains,
        monitor: ConvergenceMonitor::new(settings.convergence),
    })
}

fn open_writers(
    ctx: &RunContext,
    output: &OutputSettings,
    chains: &[McmcChain],
    resumed: bool,
) -> Result<Vec<ChainWriter>> {
    let header = header(ctx.posterior());
    chains
        .iter()
        .map(|chain| {
            let path = chain_path(output, chain.id());
            let writer = if resumed {
                ChainWriter::resume(&path, &header, output.precision, chain.written())?
            } else {
                ChainWriter::create(&path, &header, output.precision)?
            };
            Ok(writer)
        })
        .collect()
}
