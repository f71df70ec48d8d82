use rand::Rng;
use tracing::warn;

use crate::element::Element;
use crate::error::Result;
use crate::graph::{Graph, Recorder, Tid};
use crate::kernels::{argmax, sample_from_distribution, softmax_scaled};
use crate::lstm::{forward_index, CellState};
use crate::model::{LstmLayout, Model};
use crate::vocab::{Vocabulary, BOUNDARY};

/// How letters are picked during generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleConfig {
    /// Letters generated at most; 0 yields the empty string.
    pub max_length: usize,
    /// Softmax temperature, only used when `sample` is set.
    pub temperature: f64,
    /// Draw from the distribution instead of taking the argmax.
    pub sample: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        SampleConfig { max_length: 500, temperature: 1.0, sample: true }
    }
}

/// Generates one sentence starting from START, stopping at END or after
/// `cfg.max_length` letters.
pub fn sample_sentence<E: Element>(
    model: &mut Model<E>,
    layout: &LstmLayout,
    vocab: &Vocabulary,
    cfg: &SampleConfig,
    rng: &mut impl Rng,
) -> Result<String> {
    generate(model, layout, vocab, &[], cfg, rng)
}

/// Feeds `prime` after START, then keeps generating. Only the continuation
/// is returned. Letters of `prime` outside the vocabulary are skipped.
pub fn predict<E: Element>(
    model: &mut Model<E>,
    layout: &LstmLayout,
    vocab: &Vocabulary,
    prime: &str,
    cfg: &SampleConfig,
    rng: &mut impl Rng,
) -> Result<String> {
    let encoded = vocab.encode(prime);
    if encoded.skipped > 0 {
        warn!(skipped = encoded.skipped, "prime has characters outside the vocabulary");
    }
    generate(model, layout, vocab, &encoded.indices, cfg, rng)
}

fn generate<E: Element>(
    model: &mut Model<E>,
    layout: &LstmLayout,
    vocab: &Vocabulary,
    prime: &[usize],
    cfg: &SampleConfig,
    rng: &mut impl Rng,
) -> Result<String> {
    if cfg.max_length == 0 {
        return Ok(String::new());
    }
    let mut g = model.graph(false);
    let mut state = CellState::zeros(layout);
    let mut source = BOUNDARY;
    let mut letters = Vec::new();

    for &letter in prime {
        advance(&mut g, layout, &mut state, source)?;
        source = letter;
    }

    loop {
        let logits = advance(&mut g, layout, &mut state, source)?;
        let next = pick(g.value(logits), cfg, rng);
        if next == BOUNDARY {
            break;
        }
        letters.push(next);
        if letters.len() >= cfg.max_length {
            break;
        }
        source = next;
    }
    Ok(vocab.decode(&letters))
}

/// One timestep from `state`. Steps share nothing but `state`, so the arena
/// is dropped first.
fn advance<E: Element>(g: &mut Graph<'_, E>, layout: &LstmLayout, state: &mut CellState<E>, source: usize) -> Result<Tid> {
    g.reset();
    let prev = state.attach(g);
    let mem = forward_index(g, layout, source, Some(&prev))?;
    *state = CellState::capture(&*g, &mem);
    Ok(mem.output)
}

fn pick<E: Element>(logits: &[E], cfg: &SampleConfig, rng: &mut impl Rng) -> usize {
    if cfg.sample && cfg.temperature > 0.0 {
        sample_from_distribution(&softmax_scaled(logits, cfg.temperature), rng)
    } else {
        argmax(logits)
    }
}
