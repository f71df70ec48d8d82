use tracing::warn;

use crate::element::Element;
use crate::error::Result;
use crate::graph::{Graph, Recorder, Tid};
use crate::kernels::softmax;
use crate::lstm::{forward_index, CellMemory};
use crate::model::LstmLayout;
use crate::vocab::{Vocabulary, BOUNDARY};

/// Probabilities are floored here before taking a logarithm.
pub const PROB_FLOOR: f64 = 1e-12;

/// Loss of one sentence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cost {
    /// `2^(sum(-log2 p) / (n - 1))` over `n` letters.
    pub perplexity: f64,
    /// Summed natural-log cross entropy.
    pub cost: f64,
}

/// Runs `sentence` through the LSTM on a recording graph and seeds the
/// gradient of every step's logits. The caller runs `g.backward()`.
///
/// Characters outside `vocab` are skipped.
pub fn cost_of_sentence<E: Element>(g: &mut Graph<'_, E>, layout: &LstmLayout, vocab: &Vocabulary, sentence: &str) -> Result<Cost> {
    let encoded = vocab.encode(sentence);
    if encoded.skipped > 0 {
        warn!(skipped = encoded.skipped, "sentence has characters outside the vocabulary");
    }
    cost_of_indices(g, layout, &encoded.indices)
}

/// [`cost_of_sentence`] over letters already mapped to indices.
///
/// Steps run from START to the last letter: the source of step `i` is
/// letter `i - 1` (START at `i == 0`) and its target is letter `i` (END
/// after the last letter). Each step's logits gradient is overwritten with
/// `softmax(logits) - onehot(target)`, which is the gradient of the
/// cross entropy through the softmax. Softmax itself is not on the tape.
pub fn cost_of_indices<E: Element>(g: &mut Graph<'_, E>, layout: &LstmLayout, letters: &[usize]) -> Result<Cost> {
    let n = letters.len();
    let mut log2ppl = 0.0f64;
    let mut cost = 0.0f64;
    let mut prev: Option<CellMemory> = None;

    for i in 0..=n {
        let source = if i == 0 { BOUNDARY } else { letters[i - 1] };
        let target = if i == n { BOUNDARY } else { letters[i] };

        let mem = forward_index(g, layout, source, prev.as_ref())?;
        let p = seed_cross_entropy(g, mem.output, target);
        log2ppl -= p.log2();
        cost -= p.ln();
        prev = Some(mem);
    }

    let perplexity = (log2ppl / n.saturating_sub(1).max(1) as f64).exp2();
    Ok(Cost { perplexity, cost })
}

/// Overwrites the gradient of `logits` with `softmax(logits) - onehot(target)`
/// and returns the floored probability of `target`.
///
/// A NaN probability is returned as NaN, so the cost of a diverged step is
/// never finite.
pub fn seed_cross_entropy<E: Element>(g: &mut Graph<'_, E>, logits: Tid, target: usize) -> f64 {
    let mut probs = softmax(g.value(logits));
    let raw = probs[target].widen();
    let p = if raw.is_nan() { raw } else { raw.max(PROB_FLOOR) };
    probs[target] -= E::one();
    g.set_grad(logits, &probs);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup() -> (Model<f64>, LstmLayout, Vocabulary) {
        let vocab = Vocabulary::from_sentences(&["abc"], 1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let m = Model::new_char_lstm(vocab.size(), 3, &[4], &mut rng).unwrap();
        let layout = LstmLayout::resolve(&m, &[4]).unwrap();
        (m, layout, vocab)
    }

    #[test]
    fn untrained_model_is_near_uniform() {
        let (mut m, layout, vocab) = setup();
        let mut g = m.graph(true);
        let c = cost_of_sentence(&mut g, &layout, &vocab, "abc").unwrap();
        // 4 outputs, 4 steps, tiny weights: cost ~ 4 ln 4, ppl ~ 4^(4/2)
        assert_relative_eq!(c.cost, 4.0 * 4f64.ln(), max_relative = 0.05);
        assert_relative_eq!(c.perplexity, 16.0, max_relative = 0.1);
    }

    #[test]
    fn logits_gradient_is_probs_minus_onehot() {
        let mut g = Graph::<f64>::detached(true);
        let logits = g.constant(Tensor::column(&[1.0, 2.0, 3.0]));
        let p = seed_cross_entropy(&mut g, logits, 1);
        let probs = softmax(&[1.0f64, 2.0, 3.0]);
        assert_relative_eq!(p, probs[1]);
        assert_relative_eq!(g.grad(logits)[0], probs[0]);
        assert_relative_eq!(g.grad(logits)[1], probs[1] - 1.0);
        assert_relative_eq!(g.grad(logits)[2], probs[2]);

        // seeding twice overwrites
        seed_cross_entropy(&mut g, logits, 1);
        assert_relative_eq!(g.grad(logits)[1], probs[1] - 1.0);
    }

    #[test]
    fn vanishing_probability_is_floored() {
        let mut g = Graph::<f64>::detached(true);
        let logits = g.constant(Tensor::column(&[0.0, 2000.0]));
        let p = seed_cross_entropy(&mut g, logits, 0);
        assert_eq!(p, PROB_FLOOR);
        assert!((-p.ln()).is_finite());
    }

    #[test]
    fn nan_logit_gives_a_non_finite_cost() {
        let mut g = Graph::<f64>::detached(true);
        let logits = g.constant(Tensor::column(&[0.5, f64::NAN, -0.5]));
        assert!(seed_cross_entropy(&mut g, logits, 0).is_nan());

        let (mut m, layout, vocab) = setup();
        m.get_mut("bd").unwrap().w[1] = f64::NAN;
        let c = cost_of_sentence(&mut m.graph(true), &layout, &vocab, "ab").unwrap();
        assert!(!c.cost.is_finite());
        assert!(!c.perplexity.is_finite());
    }

    #[test]
    fn backward_reaches_every_parameter() {
        let (mut m, layout, vocab) = setup();
        {
            let mut g = m.graph(true);
            cost_of_sentence(&mut g, &layout, &vocab, "abcab").unwrap();
            g.backward();
        }
        for (name, t) in m.iter() {
            assert!(t.dw.iter().any(|&v| v != 0.0), "{name} got no gradient");
        }
    }

    #[test]
    fn empty_sentence_predicts_end_from_start() {
        let (mut m, layout, vocab) = setup();
        let mut g = m.graph(true);
        let c = cost_of_sentence(&mut g, &layout, &vocab, "").unwrap();
        assert!(c.cost.is_finite() && c.cost > 0.0);
        assert!(c.perplexity.is_finite());
    }

    #[test]
    fn unknown_letters_do_not_change_the_cost() {
        let (mut m, layout, vocab) = setup();
        let clean = cost_of_sentence(&mut m.graph(true), &layout, &vocab, "ab").unwrap();
        let noisy = cost_of_sentence(&mut m.graph(true), &layout, &vocab, "aZb?").unwrap();
        assert_eq!(clean, noisy);
    }
}
