use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::covariance::{learn_covariance, CovarianceMatrix, ProposalCovariance, WeightedMoments};
use crate::error::{McmcError, Result};
use crate::posterior::Point;
use crate::sampler::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPhase {
    Initializing,
    Sampling,
    /// A covariance update is due. With pooled learning the chain keeps
    /// sampling in this phase until the shared update at the next
    /// synchronization point.
    Learning,
    Converged,
    TerminatedByLimit,
}

/// An accepted point and the number of steps the chain stayed there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub point: Point,
    pub weight: u64,
    /// Step at which the point was accepted, 0 for the starting point.
    pub step: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
    /// Rejected without evaluating the posterior.
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub steps: u64,
    pub accepted: u64,
    /// All rejections, including the out-of-bounds ones.
    pub rejected: u64,
    pub out_of_bounds: u64,
    pub consecutive_rejections: u64,
}

impl ChainStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            return 0.;
        }
        self.accepted as f64 / self.steps as f64
    }
}

/// Metropolis acceptance probability `min(1, exp(candidate - current))`.
///
/// Non-finite candidates are never accepted.
pub fn acceptance_probability(current_log_posterior: f64, candidate_log_posterior: f64) -> f64 {
    if !candidate_log_posterior.is_finite() {
        return 0.;
    }
    let delta = candidate_log_posterior - current_log_posterior;
    if delta.is_nan() {
        0.
    } else if delta >= 0. {
        1.
    } else {
        delta.exp()
    }
}

/// Complete state of an rng stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    seed: [u8; 32],
    stream: u64,
    word_pos_hi: u64,
    word_pos_lo: u64,
}

impl RngState {
    pub(crate) fn capture(rng: &ChaCha8Rng) -> Self {
        let word_pos = rng.get_word_pos();
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos_hi: (word_pos >> 64) as u64,
            word_pos_lo: word_pos as u64,
        }
    }

    pub(crate) fn restore(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(((self.word_pos_hi as u128) << 64) | self.word_pos_lo as u128);
        rng
    }
}

/// Serializable state of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub id: u64,
    pub phase: ChainPhase,
    pub rng: RngState,
    pub covariance: CovarianceMatrix,
    /// Committed entries that were not written out yet.
    pub pending: Vec<ChainEntry>,
    pub current: ChainEntry,
    /// Moments of the committed entries, one per completed round.
    pub history: Vec<WeightedMoments>,
    /// Moments of the entries committed in the running round.
    pub open: WeightedMoments,
    /// Weight of the rounds dropped as burn-in.
    pub discarded: u64,
    pub stats: ChainStats,
    pub accepted_at_last_learn: u64,
    pub learn_count: u64,
    /// Number of entries already written to the chain output.
    pub written: usize,
}

/// One Metropolis chain.
///
/// The chain owns its rng stream. It only reads the shared [`RunContext`]
/// and its proposal covariance, which is replaced as a whole when a new
/// one is learned.
///
/// Committed entries are kept only until they are written out. For the
/// statistics the chain keeps weighted moments per synchronization round,
/// so the burn-in cut is applied in whole rounds, and rounds that fall
/// entirely into the burn-in are dropped for good.
#[derive(Debug)]
pub struct McmcChain {
    id: u64,
    phase: ChainPhase,
    rng: ChaCha8Rng,
    proposal: Arc<ProposalCovariance>,
    pending: Vec<ChainEntry>,
    current: ChainEntry,
    history: Vec<WeightedMoments>,
    open: WeightedMoments,
    discarded: u64,
    stats: ChainStats,
    accepted_at_last_learn: u64,
    learn_count: u64,
    written: usize,
}

impl McmcChain {
    /// Draw a starting point with finite posterior.
    pub fn initialize(
        id: u64,
        mut rng: ChaCha8Rng,
        proposal: Arc<ProposalCovariance>,
        ctx: &RunContext,
    ) -> Result<Self> {
        let space = ctx.space();
        let attempts = ctx.settings().max_init_attempts;
        let mut values = vec![0f64; space.dim()];
        for attempt in 1..=attempts {
            space.sample_reference(&mut rng, &mut values);
            let point = ctx.posterior().evaluate(&values)?;
            if !point.is_finite() {
                continue;
            }
            log::debug!("Chain {id} found a starting point after {attempt} attempts");
            return Ok(Self {
                id,
                phase: ChainPhase::Sampling,
                rng,
                proposal,
                pending: Vec::new(),
                current: ChainEntry {
                    point,
                    weight: 0,
                    step: 0,
                },
                history: Vec::new(),
                open: WeightedMoments::new(space.dim()),
                discarded: 0,
                stats: ChainStats::default(),
                accepted_at_last_learn: 0,
                learn_count: 0,
                written: 0,
            });
        }
        Err(McmcError::Startup { chain: id, attempts })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn stats(&self) -> &ChainStats {
        &self.stats
    }

    pub fn learn_count(&self) -> u64 {
        self.learn_count
    }

    pub fn proposal(&self) -> &Arc<ProposalCovariance> {
        &self.proposal
    }

    /// Committed entries not yet handed to the output, excluding the
    /// current point.
    pub fn pending(&self) -> &[ChainEntry] {
        &self.pending
    }

    pub fn current(&self) -> &ChainEntry {
        &self.current
    }

    /// Sum of all weights. Equals the number of steps taken.
    pub fn total_weight(&self) -> u64 {
        let kept: f64 = self.history.iter().map(WeightedMoments::total_weight).sum();
        self.discarded + kept as u64 + self.open.total_weight() as u64 + self.current.weight
    }

    /// Number of leading rounds that lie entirely within the first
    /// `burn_in` fraction of the total weight.
    fn burn_in_rounds(&self, burn_in: f64) -> (usize, u64) {
        let cut = (burn_in * self.total_weight() as f64).floor() as u64;
        let mut skipped = self.discarded;
        let mut rounds = 0;
        for round in &self.history {
            let weight = round.total_weight() as u64;
            if skipped + weight > cut {
                break;
            }
            skipped += weight;
            rounds += 1;
        }
        (rounds, skipped)
    }

    /// Moments of the samples after the burn-in, one per round. The last
    /// piece holds the running round and the current point.
    pub fn post_burn_in(&self, burn_in: f64) -> Vec<WeightedMoments> {
        let (skip, _) = self.burn_in_rounds(burn_in);
        let mut pieces = self.history[skip..].to_vec();
        let mut last = self.open.clone();
        last.add(&self.current.point.values, self.current.weight as f64);
        if last.total_weight() > 0. {
            pieces.push(last);
        }
        pieces
    }

    pub fn moments(&self, burn_in: f64) -> WeightedMoments {
        let mut moments = WeightedMoments::new(self.current.point.values.len());
        for piece in self.post_burn_in(burn_in) {
            moments.merge(&piece);
        }
        moments
    }

    /// Close the running round at a synchronization point and forget the
    /// rounds that can no longer leave the burn-in.
    pub(crate) fn close_round(&mut self, burn_in: f64) {
        let dim = self.current.point.values.len();
        let round = std::mem::replace(&mut self.open, WeightedMoments::new(dim));
        if round.total_weight() > 0. {
            self.history.push(round);
        }
        let (rounds, skipped) = self.burn_in_rounds(burn_in);
        self.history.drain(..rounds);
        self.discarded = skipped;
    }

    /// Run `steps` Metropolis steps.
    pub fn advance(&mut self, ctx: &RunContext, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step(ctx)?;
        }
        Ok(())
    }

    pub fn step(&mut self, ctx: &RunContext) -> Result<StepOutcome> {
        let block = ctx.schedule().block_for_step(self.stats.steps);
        let candidate = ctx.proposer().propose(
            &mut self.rng,
            &self.proposal,
            ctx.space().blocks(),
            block,
            &self.current.point.values,
        );
        self.consider(ctx, candidate)
    }

    pub(crate) fn consider(&mut self, ctx: &RunContext, candidate: Vec<f64>) -> Result<StepOutcome> {
        self.stats.steps += 1;

        if !ctx.space().in_bounds(&candidate) {
            self.stats.out_of_bounds += 1;
            self.reject(ctx)?;
            return Ok(StepOutcome::OutOfBounds);
        }

        let point = ctx.posterior().evaluate(&candidate)?;
        let prob = acceptance_probability(self.current.point.log_posterior, point.log_posterior);
        let draw: f64 = self.rng.random();
        if draw < prob {
            self.accept(ctx, point);
            Ok(StepOutcome::Accepted)
        } else {
            if !point.is_finite() {
                log::debug!("Chain {} rejected a point with non-finite posterior", self.id);
            }
            self.reject(ctx)?;
            Ok(StepOutcome::Rejected)
        }
    }

    fn accept(&mut self, ctx: &RunContext, point: Point) {
        let entry = ChainEntry {
            point,
            weight: 1,
            step: self.stats.steps,
        };
        let previous = std::mem::replace(&mut self.current, entry);
        if previous.weight > 0 {
            self.open.add(&previous.point.values, previous.weight as f64);
            self.pending.push(previous);
        }
        self.stats.accepted += 1;
        self.stats.consecutive_rejections = 0;
        self.maybe_learn(ctx);
    }

    fn reject(&mut self, ctx: &RunContext) -> Result<()> {
        self.stats.rejected += 1;
        self.stats.consecutive_rejections += 1;
        self.current.weight += 1;
        if let Some(max) = ctx.settings().max_consecutive_rejections {
            if self.stats.consecutive_rejections >= max {
                return Err(McmcError::ChainStuck {
                    chain: self.id,
                    rejections: self.stats.consecutive_rejections,
                });
            }
        }
        Ok(())
    }

    /// Covariance update after an acceptance. With pooled learning the
    /// chain only signals that an update is due.
    fn maybe_learn(&mut self, ctx: &RunContext) {
        let settings = ctx.settings();
        if !settings.learning.enabled {
            return;
        }
        let dim = ctx.space().dim();
        if self.accepted_since_learn() < settings.learn_every(dim) {
            return;
        }
        self.phase = ChainPhase::Learning;
        if ctx.pooled_learning() {
            return;
        }

        self.mark_learned();
        let moments = self.moments(settings.convergence.burn_in);
        if let Some(matrix) = learn_covariance(&moments, settings.min_learn_samples(dim)) {
            match ProposalCovariance::new(matrix, ctx.space().blocks()) {
                Ok(proposal) => {
                    log::debug!(
                        "Chain {} updated its proposal from {:.1} effective samples",
                        self.id,
                        moments.effective_samples()
                    );
                    self.set_proposal(Arc::new(proposal));
                }
                Err(err) => log::warn!("Chain {} kept its proposal: {err}", self.id),
            }
        }
    }

    /// Replace the proposal covariance. Only called between steps.
    pub(crate) fn set_proposal(&mut self, proposal: Arc<ProposalCovariance>) {
        self.proposal = proposal;
        self.learn_count += 1;
    }

    /// Number of committed entries handed out by [`Self::take_unwritten`].
    pub fn written(&self) -> usize {
        self.written
    }

    /// Entries committed since the last call.
    pub(crate) fn take_unwritten(&mut self) -> Vec<ChainEntry> {
        self.written += self.pending.len();
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn set_phase(&mut self, phase: ChainPhase) {
        self.phase = phase;
    }

    /// Put a restored chain back to work.
    pub(crate) fn resume(&mut self, ctx: &RunContext) {
        let settings = ctx.settings();
        let due = settings.learning.enabled
            && ctx.pooled_learning()
            && self.accepted_since_learn() >= settings.learn_every(ctx.space().dim());
        self.phase = if due {
            ChainPhase::Learning
        } else {
            ChainPhase::Sampling
        };
    }

    /// Acceptances since the proposal was last learned.
    pub(crate) fn accepted_since_learn(&self) -> u64 {
        self.stats.accepted - self.accepted_at_last_learn
    }

    pub(crate) fn mark_learned(&mut self) {
        self.accepted_at_last_learn = self.stats.accepted;
        if self.phase == ChainPhase::Learning {
            self.phase = ChainPhase::Sampling;
        }
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            id: self.id,
            phase: self.phase,
            rng: RngState::capture(&self.rng),
            covariance: self.proposal.matrix().clone(),
            pending: self.pending.clone(),
            current: self.current.clone(),
            history: self.history.clone(),
            open: self.open.clone(),
            discarded: self.discarded,
            stats: self.stats,
            accepted_at_last_learn: self.accepted_at_last_learn,
            learn_count: self.learn_count,
            written: self.written,
        }
    }

    pub fn from_snapshot(snapshot: ChainSnapshot, ctx: &RunContext) -> Result<Self> {
        let dim = ctx.space().dim();
        let format_error = |msg: String| McmcError::CheckpointFormat(msg);
        let id = snapshot.id;

        let dims_ok = snapshot
            .pending
            .iter()
            .chain(std::iter::once(&snapshot.current))
            .all(|entry| entry.point.values.len() == dim)
            && snapshot
                .history
                .iter()
                .chain(std::iter::once(&snapshot.open))
                .all(|moments| moments.dim() == dim);
        if !dims_ok || snapshot.covariance.dim() != dim {
            return Err(format_error(format!(
                "chain {id} does not match the {dim} sampled parameters"
            )));
        }
        let kept: f64 = snapshot
            .history
            .iter()
            .chain(std::iter::once(&snapshot.open))
            .map(WeightedMoments::total_weight)
            .sum();
        let total = snapshot.discarded + kept as u64 + snapshot.current.weight;
        if total != snapshot.stats.steps {
            return Err(format_error(format!(
                "chain {id} weights do not add up to its step count"
            )));
        }

        let proposal = ProposalCovariance::new(snapshot.covariance, ctx.space().blocks())
            .map_err(|err| format_error(format!("chain {id}: {err}")))?;

        Ok(Self {
            id,
            phase: snapshot.phase,
            rng: snapshot.rng.restore(),
            proposal: Arc::new(proposal),
            pending: snapshot.pending,
            current: snapshot.current,
            history: snapshot.history,
            open: snapshot.open,
            discarded: snapshot.discarded,
            stats: snapshot.stats,
            accepted_at_last_learn: snapshot.accepted_at_last_learn,
            learn_count: snapshot.learn_count,
            written: snapshot.written,
        })
    }
}
