use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::model::Model;
use crate::tensor::Tensor;

pub const DEFAULT_DECAY: f64 = 0.999;
pub const DEFAULT_EPS: f64 = 1e-8;

/// Outcome of one solver step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolverStats {
    /// Fraction of gradient entries that were clipped.
    pub ratio_clipped: f64,
    pub clipped: usize,
    pub total: usize,
}

// ============================================================================
// RMSPROP - per-element running mean of squared gradients, with clipping
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "E: Element")]
pub struct RmsProp<E: Element> {
    pub decay: f64,
    pub eps: f64,
    /// Step cache, one tensor per parameter key.
    cache: BTreeMap<String, Tensor<E>>,
}

impl<E: Element> Default for RmsProp<E> {
    fn default() -> Self {
        RmsProp::new(DEFAULT_DECAY, DEFAULT_EPS)
    }
}

impl<E: Element> RmsProp<E> {
    pub fn new(decay: f64, eps: f64) -> Self {
        RmsProp { decay, eps, cache: BTreeMap::new() }
    }

    pub fn cache(&self, key: &str) -> Option<&Tensor<E>> {
        self.cache.get(key)
    }

    /// Updates every parameter of `model` from its gradient, then zeroes
    /// the gradient:
    ///
    /// ```text
    /// c  = decay * c + (1 - decay) * g^2
    /// g' = clamp(g, -clip, clip)
    /// w += -lr * g' / sqrt(c + eps) - regc * w
    /// ```
    ///
    /// Cache entries are created (or reshaped) up front; the update itself
    /// runs in parallel across keys.
    pub fn step(&mut self, model: &mut Model<E>, lr: f64, regc: f64, clip: f64) -> SolverStats {
        self.cache.retain(|k, _| model.contains(k));
        for (k, p) in model.iter() {
            let fresh = match self.cache.get(k) {
                Some(c) => c.shape() != p.shape(),
                None => true,
            };
            if fresh {
                self.cache.insert(k.clone(), Tensor::zeros(p.rows, p.cols));
            }
        }
        debug_assert!(self.cache.keys().eq(model.keys()));

        let k = Coefficients {
            decay: E::narrow(self.decay),
            keep: E::narrow(1.0 - self.decay),
            eps: E::narrow(self.eps),
            lr: E::narrow(lr),
            regc: E::narrow(regc),
            clip: E::narrow(clip),
        };
        let pairs: Vec<(&mut Tensor<E>, &mut Tensor<E>)> =
            model.iter_mut().map(|(_, p)| p).zip(self.cache.values_mut()).collect();

        let (clipped, total) = pairs
            .into_par_iter()
            .map(|(p, c)| {
                let n = p.len();
                (update(p, c, &k), n)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        SolverStats {
            ratio_clipped: if total == 0 { 0.0 } else { clipped as f64 / total as f64 },
            clipped,
            total,
        }
    }
}

struct Coefficients<E> {
    decay: E,
    keep: E,
    eps: E,
    lr: E,
    regc: E,
    clip: E,
}

/// Updates one tensor in place and returns how many entries were clipped.
fn update<E: Element>(p: &mut Tensor<E>, cache: &mut Tensor<E>, k: &Coefficients<E>) -> usize {
    let mut clipped = 0;
    let Tensor { w, dw, .. } = p;
    for ((w, g), c) in w.iter_mut().zip(dw.iter_mut()).zip(cache.w.iter_mut()) {
        let grad = *g;
        *c = k.decay * *c + k.keep * grad * grad;
        let step = if grad > k.clip {
            clipped += 1;
            k.clip
        } else if grad < -k.clip {
            clipped += 1;
            -k.clip
        } else {
            grad
        };
        *w += -k.lr * step / (*c + k.eps).sqrt() - k.regc * *w;
        *g = E::zero();
    }
    clipped
}
