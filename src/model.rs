use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::{Error, Result};
use crate::graph::{Graph, Tid};
use crate::tensor::Tensor;

/// Half-width of the uniform range used for fresh weights.
pub const INIT_SCALE: f64 = 0.08;

/// Name of the letter embedding matrix.
pub const EMBEDDING: &str = "Wil";

// ============================================================================
// MODEL - named parameter store
// ============================================================================

/// Mapping from parameter name to tensor.
///
/// Keys iterate in sorted order, and that order is also the slot order when
/// the model is bound to a [`Graph`], so a key's slot is stable for as long
/// as the key set is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent, bound = "E: Element")]
pub struct Model<E: Element> {
    params: BTreeMap<String, Tensor<E>>,
}

impl<E: Element> Model<E> {
    pub fn new() -> Self {
        Model { params: BTreeMap::new() }
    }

    /// Fresh LSTM: `input_size` wide inputs, one layer per entry of
    /// `hidden_sizes`, `output_size` logits. Weights are uniform in
    /// `[-0.08, 0.08)`, biases start at zero.
    pub fn new_lstm(
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let mut model = Model::new();
        for (name, rows, cols) in lstm_shapes(input_size, hidden_sizes, output_size)? {
            let t = if is_bias(&name) { Tensor::zeros(rows, cols) } else { Tensor::uniform(rows, cols, INIT_SCALE, rng) };
            model.insert(name, t);
        }
        Ok(model)
    }

    /// LSTM plus a letter embedding: `vocab_size` letters (index 0 is the
    /// START/END marker) embedded in `letter_size` columns.
    pub fn new_char_lstm(
        vocab_size: usize,
        letter_size: usize,
        hidden_sizes: &[usize],
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let mut model = Model::new();
        model.insert(EMBEDDING, Tensor::uniform(vocab_size, letter_size, INIT_SCALE, rng));
        for (name, t) in Model::new_lstm(letter_size, hidden_sizes, vocab_size, rng)?.params {
            model.insert(name, t);
        }
        Ok(model)
    }

    pub fn insert(&mut self, name: impl Into<String>, t: Tensor<E>) {
        self.params.insert(name.into(), t);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<E>> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor<E>> {
        self.params.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor<E>)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Tensor<E>)> {
        self.params.iter_mut()
    }

    /// Total number of scalar parameters.
    pub fn scalar_count(&self) -> usize {
        self.params.values().map(Tensor::len).sum()
    }

    /// Arena slot `name` occupies in graphs built by [`Model::graph`].
    pub fn slot(&self, name: &str) -> Result<Tid> {
        self.params
            .keys()
            .position(|k| k == name)
            .map(Tid)
            .ok_or_else(|| Error::MissingParameter { name: name.to_string() })
    }

    /// Binds every parameter into a fresh graph.
    pub fn graph(&mut self, recording: bool) -> Graph<'_, E> {
        Graph::new(self.params.values_mut().collect(), recording)
    }

    pub fn zero_grad(&mut self) {
        self.params.values_mut().for_each(Tensor::zero_grad);
    }

    /// Errors unless `name` exists with shape `[rows x cols]`.
    pub fn expect_shape(&self, name: &str, rows: usize, cols: usize) -> Result<()> {
        let t = self.get(name).ok_or_else(|| Error::MissingParameter { name: name.to_string() })?;
        if t.shape() != (rows, cols) {
            return Err(Error::ArchitectureMismatch {
                name: name.to_string(),
                rows,
                cols,
                got_rows: t.rows,
                got_cols: t.cols,
            });
        }
        Ok(())
    }
}

fn is_bias(name: &str) -> bool {
    name.starts_with('b')
}

/// Every LSTM parameter with its shape, for a given architecture.
pub fn lstm_shapes(
    input_size: usize,
    hidden_sizes: &[usize],
    output_size: usize,
) -> Result<Vec<(String, usize, usize)>> {
    check_hidden_sizes(hidden_sizes)?;
    let mut shapes = Vec::with_capacity(hidden_sizes.len() * 12 + 2);
    for (d, &hidden) in hidden_sizes.iter().enumerate() {
        let prev = if d == 0 { input_size } else { hidden_sizes[d - 1] };
        for gate in GATES {
            shapes.push((format!("W{gate}x{d}"), hidden, prev));
            shapes.push((format!("W{gate}h{d}"), hidden, hidden));
            shapes.push((format!("b{gate}{d}"), hidden, 1));
        }
    }
    let last = hidden_sizes[hidden_sizes.len() - 1];
    shapes.push(("Whd".to_string(), output_size, last));
    shapes.push(("bd".to_string(), output_size, 1));
    Ok(shapes)
}

pub(crate) fn check_hidden_sizes(hidden_sizes: &[usize]) -> Result<()> {
    if hidden_sizes.is_empty() {
        return Err(Error::EmptyHiddenLayers);
    }
    if let Some(depth) = hidden_sizes.iter().position(|&h| h == 0) {
        return Err(Error::ZeroSizedLayer { depth });
    }
    Ok(())
}

// ============================================================================
// LAYOUT - parameter names resolved to graph slots
// ============================================================================

/// Gate letters in the order gates are built and spliced.
pub const GATES: [char; 4] = ['i', 'f', 'o', 'c'];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSlots {
    pub wx: Tid,
    pub wh: Tid,
    pub b: Tid,
}

/// Slots of one depth's gates, in [`GATES`] order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerSlots {
    pub input: GateSlots,
    pub forget: GateSlots,
    pub output: GateSlots,
    pub cell: GateSlots,
}

/// An LSTM architecture checked against a [`Model`] and resolved to slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LstmLayout {
    pub input_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub output_size: usize,
    pub layers: Vec<LayerSlots>,
    pub whd: Tid,
    pub bd: Tid,
    /// Letter embedding, when the model carries one.
    pub embedding: Option<Tid>,
}

impl LstmLayout {
    /// Resolves every LSTM parameter of `model`, checking names and shapes.
    pub fn resolve<E: Element>(model: &Model<E>, hidden_sizes: &[usize]) -> Result<Self> {
        check_hidden_sizes(hidden_sizes)?;
        let wix0 = model.get("Wix0").ok_or_else(|| Error::MissingParameter { name: "Wix0".into() })?;
        let whd = model.get("Whd").ok_or_else(|| Error::MissingParameter { name: "Whd".into() })?;
        let (input_size, output_size) = (wix0.cols, whd.rows);

        for (name, rows, cols) in lstm_shapes(input_size, hidden_sizes, output_size)? {
            model.expect_shape(&name, rows, cols)?;
        }

        let embedding = if model.contains(EMBEDDING) {
            model.expect_shape(EMBEDDING, output_size, input_size)?;
            Some(model.slot(EMBEDDING)?)
        } else {
            None
        };

        let gate = |g: char, d: usize| -> Result<GateSlots> {
            Ok(GateSlots {
                wx: model.slot(&format!("W{g}x{d}"))?,
                wh: model.slot(&format!("W{g}h{d}"))?,
                b: model.slot(&format!("b{g}{d}"))?,
            })
        };
        let layers = (0..hidden_sizes.len())
            .map(|d| {
                Ok(LayerSlots {
                    input: gate('i', d)?,
                    forget: gate('f', d)?,
                    output: gate('o', d)?,
                    cell: gate('c', d)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LstmLayout {
            input_size,
            hidden_sizes: hidden_sizes.to_vec(),
            output_size,
            layers,
            whd: model.slot("Whd")?,
            bd: model.slot("bd")?,
            embedding,
        })
    }

    pub fn depth(&self) -> usize {
        self.hidden_sizes.len()
    }

    /// Slot of the letter embedding.
    pub fn embedding(&self) -> Result<Tid> {
        self.embedding.ok_or_else(|| Error::MissingParameter { name: EMBEDDING.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn lstm_keys_follow_gate_and_depth() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let m = Model::<f64>::new_lstm(4, &[3, 2], 6, &mut rng).unwrap();
        assert_eq!(m.len(), 2 * 12 + 2);
        for key in ["Wix0", "Wih0", "bi0", "Wfx1", "Wfh1", "bf1", "Wox0", "bo1", "Wcx1", "Wch0", "bc0", "Whd", "bd"] {
            assert!(m.contains(key), "missing {key}");
        }
        assert_eq!(m.get("Wix0").unwrap().shape(), (3, 4));
        assert_eq!(m.get("Wix1").unwrap().shape(), (2, 3));
        assert_eq!(m.get("Wih1").unwrap().shape(), (2, 2));
        assert_eq!(m.get("Whd").unwrap().shape(), (6, 2));
        assert_eq!(m.get("bd").unwrap().shape(), (6, 1));
    }

    #[test]
    fn biases_start_at_zero_weights_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let m = Model::<f32>::new_lstm(5, &[4], 5, &mut rng).unwrap();
        for (name, t) in m.iter() {
            if name.starts_with('b') {
                assert!(t.w.iter().all(|&v| v == 0.0), "{name} not zero");
            } else {
                assert!(t.w.iter().all(|v| v.abs() <= 0.08), "{name} out of range");
            }
        }
    }

    #[test]
    fn same_seed_same_model() {
        let a = Model::<f64>::new_char_lstm(5, 3, &[4], &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        let b = Model::<f64>::new_char_lstm(5, 3, &[4], &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_hidden_layers_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let err = Model::<f64>::new_lstm(3, &[], 3, &mut rng).unwrap_err();
        assert!(matches!(err, Error::EmptyHiddenLayers));
        let err = Model::<f64>::new_lstm(3, &[2, 0], 3, &mut rng).unwrap_err();
        assert!(matches!(err, Error::ZeroSizedLayer { depth: 1 }));
    }

    #[test]
    fn slots_follow_key_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut m = Model::<f64>::new_char_lstm(4, 2, &[3], &mut rng).unwrap();
        let slot = m.slot("Whd").unwrap();
        let expected = m.get("Whd").unwrap().w.clone();
        let g = m.graph(false);
        use crate::graph::Recorder;
        assert_eq!(g.value(slot), expected.as_slice());
    }

    #[test]
    fn layout_rejects_wrong_architecture() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let m = Model::<f64>::new_char_lstm(4, 2, &[3, 3], &mut rng).unwrap();
        assert!(LstmLayout::resolve(&m, &[3, 3]).is_ok());
        let err = LstmLayout::resolve(&m, &[3, 5]).unwrap_err();
        assert!(matches!(err, Error::ArchitectureMismatch { .. }));
        let err = LstmLayout::resolve(&m, &[3, 3, 3]).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { .. }));
    }

    #[test]
    fn layout_finds_embedding() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let m = Model::<f64>::new_char_lstm(7, 2, &[3], &mut rng).unwrap();
        let layout = LstmLayout::resolve(&m, &[3]).unwrap();
        assert_eq!(layout.input_size, 2);
        assert_eq!(layout.output_size, 7);
        assert_eq!(layout.embedding, Some(m.slot(EMBEDDING).unwrap()));
    }
}
