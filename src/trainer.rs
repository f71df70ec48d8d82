// ============================================================================
// TRAINING SESSION
// One `Session` owns everything a run mutates: parameters, solver cache,
// vocabulary, corpus, RNG and counters. Entry points take it explicitly.
// ============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::bail;
use crate::checkpoint::Checkpoint;
use crate::config::{Config, Mode};
use crate::cost::{cost_of_sentence, Cost};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::model::{LstmLayout, Model};
use crate::optim::{RmsProp, SolverStats};
use crate::sample::{predict, sample_sentence, SampleConfig};
use crate::vocab::Vocabulary;

/// Result of one training tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickReport {
    pub tick: usize,
    pub cost: Cost,
    pub stats: SolverStats,
    pub elapsed: Duration,
}

/// Periodic progress summary.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub tick: usize,
    pub epoch: f64,
    /// Median perplexity over the ticks since the previous report.
    pub median_perplexity: Option<f64>,
    pub stats: SolverStats,
    pub tick_time: Duration,
    pub samples: Vec<String>,
}

pub struct Session<E: Element> {
    config: Config,
    model: Model<E>,
    layout: LstmLayout,
    letter_size: usize,
    vocab: Vocabulary,
    solver: RmsProp<E>,
    sentences: Vec<String>,
    rng: ChaCha8Rng,
    tick: usize,
    perplexities: Vec<f64>,
}

/// Non-empty lines of `text`, one sentence each.
pub fn sentences_from_text(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Median of `values`; the mean of the middle pair for even lengths.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let half = v.len() / 2;
    Some(if v.len() % 2 == 1 { v[half] } else { (v[half - 1] + v[half]) / 2.0 })
}

fn seeded(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

impl<E: Element> Session<E> {
    /// Fresh model over the vocabulary of `sentences`.
    pub fn new(config: Config, sentences: Vec<String>) -> Result<Self> {
        if sentences.is_empty() {
            return Err(Error::EmptyCorpus);
        }
        let vocab = Vocabulary::from_sentences(&sentences, config.count_threshold)?;
        let mut rng = seeded(config.seed);
        let model = Model::new_char_lstm(vocab.size(), config.letter_size, &config.hidden_sizes, &mut rng)?;
        let layout = LstmLayout::resolve(&model, &config.hidden_sizes)?;
        info!(
            precision = E::NAME,
            hidden = ?config.hidden_sizes,
            letter_size = config.letter_size,
            vocab = vocab.size(),
            params = model.scalar_count(),
            sentences = sentences.len(),
            "initialised model"
        );
        Ok(Session {
            letter_size: config.letter_size,
            solver: RmsProp::new(config.decay, config.smooth_eps),
            config,
            model,
            layout,
            vocab,
            sentences,
            rng,
            tick: 0,
            perplexities: Vec::new(),
        })
    }

    /// Continues from a checkpoint. Architecture and vocabulary come from
    /// the checkpoint; `config` supplies the rest. `sentences` may be empty
    /// for sampling only.
    pub fn resume(config: Config, cp: Checkpoint<E>, sentences: Vec<String>) -> Result<Self> {
        let layout = cp.layout()?;
        if config.hidden_sizes != cp.hidden_sizes {
            warn!(configured = ?config.hidden_sizes, stored = ?cp.hidden_sizes, "using hidden sizes from checkpoint");
        }
        let mut solver = cp.solver;
        solver.decay = config.decay;
        solver.eps = config.smooth_eps;
        Ok(Session {
            rng: seeded(config.seed),
            config,
            model: cp.model,
            layout,
            letter_size: cp.letter_size,
            vocab: cp.vocab,
            solver,
            sentences,
            tick: cp.tick,
            perplexities: Vec::new(),
        })
    }

    /// Resumes from `config.load_path` when that checkpoint exists, otherwise
    /// starts fresh. Sample mode requires an existing checkpoint.
    pub fn open(config: Config, sentences: Vec<String>) -> Result<Self> {
        if !config.load_path.is_empty() && Path::new(&config.load_path).exists() {
            let cp = Checkpoint::load(&config.load_path)?;
            return Session::resume(config, cp, sentences);
        }
        if config.mode == Mode::Sample {
            bail!("sample mode needs a checkpoint, none found at `{}`", config.load_path);
        }
        if !config.load_path.is_empty() {
            warn!(path = %config.load_path, "checkpoint not found, starting fresh");
        }
        Session::new(config, sentences)
    }

    pub fn model(&self) -> &Model<E> {
        &self.model
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn layout(&self) -> &LstmLayout {
        &self.layout
    }

    pub fn ticks(&self) -> usize {
        self.tick
    }

    pub fn epoch(&self) -> f64 {
        self.tick as f64 / self.sentences.len().max(1) as f64
    }

    /// One training step on a random sentence: forward, backward, solver.
    ///
    /// A sentence whose cost is not finite is logged and its gradient
    /// discarded, leaving the parameters untouched.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.sentences.is_empty() {
            return Err(Error::EmptyCorpus);
        }
        let t0 = Instant::now();
        let ix = self.rng.gen_range(0..self.sentences.len());

        let cost = {
            let mut g = self.model.graph(true);
            let cost = cost_of_sentence(&mut g, &self.layout, &self.vocab, &self.sentences[ix])?;
            g.backward();
            cost
        };

        let stats = if cost.cost.is_finite() && cost.perplexity.is_finite() {
            self.perplexities.push(cost.perplexity);
            self.solver.step(&mut self.model, self.config.learning_rate, self.config.regc, self.config.clipval)
        } else {
            warn!(tick = self.tick + 1, sentence = ix, cost = cost.cost, "skipping update for degenerate sentence");
            self.model.zero_grad();
            SolverStats::default()
        };

        self.tick += 1;
        debug!(tick = self.tick, perplexity = cost.perplexity, cost = cost.cost, clipped = stats.ratio_clipped, "tick");
        Ok(TickReport { tick: self.tick, cost, stats, elapsed: t0.elapsed() })
    }

    /// Summarises the ticks since the previous report and draws samples.
    pub fn report(&mut self, last: &TickReport) -> Result<Report> {
        let median_perplexity = median(&self.perplexities);
        self.perplexities.clear();
        let cfg = self.config.sampling();
        let samples = (0..self.config.samples).map(|_| self.sample(&cfg)).collect::<Result<Vec<_>>>()?;
        let report = Report {
            tick: self.tick,
            epoch: self.epoch(),
            median_perplexity,
            stats: last.stats,
            tick_time: last.elapsed,
            samples,
        };
        info!(
            tick = report.tick,
            epoch = report.epoch,
            median_perplexity = ?report.median_perplexity,
            clipped = report.stats.ratio_clipped,
            tick_ms = report.tick_time.as_secs_f64() * 1e3,
            "progress"
        );
        Ok(report)
    }

    /// Ticks until the configured budget is spent or `cancel` is set.
    ///
    /// Cancellation and saves only happen between ticks, so every
    /// checkpoint holds a fully applied step. A final checkpoint is written
    /// when a save path is configured. Returns the number of ticks run.
    pub fn run(&mut self, cancel: &AtomicBool, mut on_report: impl FnMut(&Report)) -> Result<usize> {
        let budget = self.config.ticks;
        let mut done = 0;
        while budget == 0 || done < budget {
            if cancel.load(Ordering::Relaxed) {
                info!(tick = self.tick, "training cancelled");
                break;
            }
            let last = self.tick()?;
            done += 1;

            if self.config.report_every > 0 && self.tick % self.config.report_every == 0 {
                let report = self.report(&last)?;
                on_report(&report);
            }
            if self.config.save_every > 0 && self.tick % self.config.save_every == 0 && !self.config.save_path.is_empty() {
                self.save(&self.config.save_path)?;
            }
        }
        if !self.config.save_path.is_empty() {
            self.save(&self.config.save_path)?;
        }
        Ok(done)
    }

    pub fn checkpoint(&self) -> Checkpoint<E> {
        Checkpoint::new(
            self.model.clone(),
            self.layout.hidden_sizes.clone(),
            self.letter_size,
            self.vocab.clone(),
            self.solver.clone(),
            self.tick,
        )
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.checkpoint().save(path)
    }

    pub fn sample(&mut self, cfg: &SampleConfig) -> Result<String> {
        sample_sentence(&mut self.model, &self.layout, &self.vocab, cfg, &mut self.rng)
    }

    /// Continuation of `prime`.
    pub fn predict(&mut self, prime: &str, cfg: &SampleConfig) -> Result<String> {
        predict(&mut self.model, &self.layout, &self.vocab, prime, cfg, &mut self.rng)
    }
}
