// LSTM forward step over a recording graph.
//
// Per depth d, with x the layer input and (h, c) the previous state:
//
//   i = sigmoid(Wix.x + Wih.h + bi)      f = sigmoid(Wfx.x + Wfh.h + bf)
//   o = sigmoid(Wox.x + Woh.h + bo)      g = tanh(Wcx.x + Wch.h + bc)
//   c' = f*c + i*g                       h' = o*tanh(c')
//
// and after the last depth the decoder `Whd.h + bd` gives the logits.
//
// The four gates only read shared state, so on wide layers they are built on
// forked branches under `rayon::join` and spliced back in gate order. The
// spliced graph is slot-for-slot the graph the sequential path builds.

use crate::element::Element;
use crate::error::Result;
use crate::graph::{Graph, Recorder, Segment, Tid};
use crate::model::{GateSlots, LayerSlots, LstmLayout};
use crate::tensor::Tensor;

/// Multiply-adds per gate (`hidden * (input + hidden)`) from which the
/// gates of a layer are built in parallel.
pub const PARALLEL_GATE_THRESHOLD: usize = 16 * 1024;

/// How the four gates of a layer are scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateSchedule {
    /// Parallel when the layer reaches [`PARALLEL_GATE_THRESHOLD`].
    Auto,
    Sequential,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Activation {
    Sigmoid,
    Tanh,
}

/// Recurrent state of one timestep, as slots of the graph that built it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellMemory {
    pub hidden: Vec<Tid>,
    pub cell: Vec<Tid>,
    /// Decoder logits for this timestep.
    pub output: Tid,
}

/// Owned copy of a [`CellMemory`], independent of any graph.
///
/// Lets generation drop the arena between steps and carry only the state.
#[derive(Clone, Debug, PartialEq)]
pub struct CellState<E: Element> {
    pub hidden: Vec<Tensor<E>>,
    pub cell: Vec<Tensor<E>>,
    pub output: Tensor<E>,
}

impl<E: Element> CellState<E> {
    /// All-zero state for a fresh sequence.
    pub fn zeros(layout: &LstmLayout) -> Self {
        CellState {
            hidden: layout.hidden_sizes.iter().map(|&h| Tensor::zeros(h, 1)).collect(),
            cell: layout.hidden_sizes.iter().map(|&h| Tensor::zeros(h, 1)).collect(),
            output: Tensor::zeros(layout.output_size, 1),
        }
    }

    /// Copies the values behind `mem` out of the graph.
    pub fn capture<R: Recorder<E>>(g: &R, mem: &CellMemory) -> Self {
        CellState {
            hidden: mem.hidden.iter().map(|&id| g.tensor(id).detached()).collect(),
            cell: mem.cell.iter().map(|&id| g.tensor(id).detached()).collect(),
            output: g.tensor(mem.output).detached(),
        }
    }

    /// Pushes the state into `g` as constants.
    pub fn attach(&self, g: &mut Graph<'_, E>) -> CellMemory {
        CellMemory {
            hidden: self.hidden.iter().map(|t| g.constant(t.clone())).collect(),
            cell: self.cell.iter().map(|t| g.constant(t.clone())).collect(),
            output: g.constant(self.output.clone()),
        }
    }
}

/// One timestep on input column `x`. `prev == None` starts from zeros.
pub fn forward<E: Element>(g: &mut Graph<'_, E>, layout: &LstmLayout, x: Tid, prev: Option<&CellMemory>) -> CellMemory {
    forward_with(g, layout, x, prev, GateSchedule::Auto)
}

/// One timestep whose input is row `letter` of the letter embedding.
pub fn forward_index<E: Element>(
    g: &mut Graph<'_, E>,
    layout: &LstmLayout,
    letter: usize,
    prev: Option<&CellMemory>,
) -> Result<CellMemory> {
    let wil = layout.embedding()?;
    let x = g.row_pluck(wil, letter);
    Ok(forward(g, layout, x, prev))
}

pub fn forward_with<E: Element>(
    g: &mut Graph<'_, E>,
    layout: &LstmLayout,
    x: Tid,
    prev: Option<&CellMemory>,
    schedule: GateSchedule,
) -> CellMemory {
    assert_eq!(
        g.tensor(x).shape(),
        (layout.input_size, 1),
        "lstm input shape {:?}, expected [{}x1]",
        g.tensor(x).shape(),
        layout.input_size
    );
    let fresh;
    let prev = match prev {
        Some(p) => p,
        None => {
            fresh = CellState::<E>::zeros(layout).attach(g);
            &fresh
        }
    };
    assert_eq!(prev.hidden.len(), layout.depth(), "lstm state depth");

    let mut hidden = Vec::with_capacity(layout.depth());
    let mut cell = Vec::with_capacity(layout.depth());
    let mut input = x;
    for (d, slots) in layout.layers.iter().enumerate() {
        let (h_prev, c_prev) = (prev.hidden[d], prev.cell[d]);
        let in_size = if d == 0 { layout.input_size } else { layout.hidden_sizes[d - 1] };
        let work = layout.hidden_sizes[d] * (in_size + layout.hidden_sizes[d]);
        let parallel = match schedule {
            GateSchedule::Auto => work >= PARALLEL_GATE_THRESHOLD,
            GateSchedule::Sequential => false,
            GateSchedule::Parallel => true,
        };

        let [i, f, o, c] = if parallel {
            parallel_gates(g, slots, input, h_prev)
        } else {
            [
                gate(g, &slots.input, input, h_prev, Activation::Sigmoid),
                gate(g, &slots.forget, input, h_prev, Activation::Sigmoid),
                gate(g, &slots.output, input, h_prev, Activation::Sigmoid),
                gate(g, &slots.cell, input, h_prev, Activation::Tanh),
            ]
        };

        let retain = g.eltmul(f, c_prev);
        let write = g.eltmul(i, c);
        let c_new = g.add(retain, write);
        let squashed = g.tanh(c_new);
        let h_new = g.eltmul(o, squashed);

        hidden.push(h_new);
        cell.push(c_new);
        input = h_new;
    }

    let decoded = g.matmul(layout.whd, input);
    let output = g.add(decoded, layout.bd);
    CellMemory { hidden, cell, output }
}

fn gate<E: Element, R: Recorder<E>>(r: &mut R, s: &GateSlots, x: Tid, h: Tid, act: Activation) -> Tid {
    let wx = r.matmul(s.wx, x);
    let wh = r.matmul(s.wh, h);
    let sum = r.add(wx, wh);
    let pre = r.add(sum, s.b);
    match act {
        Activation::Sigmoid => r.sigmoid(pre),
        Activation::Tanh => r.tanh(pre),
    }
}

fn branch_gate<E: Element>(view: &Graph<'_, E>, s: &GateSlots, x: Tid, h: Tid, act: Activation) -> Segment<E> {
    let mut br = view.fork();
    let out = gate(&mut br, s, x, h, act);
    br.finish(out)
}

fn parallel_gates<E: Element>(g: &mut Graph<'_, E>, slots: &LayerSlots, x: Tid, h: Tid) -> [Tid; 4] {
    let ((si, sf), (so, sc)) = {
        let view = &*g;
        rayon::join(
            || {
                rayon::join(
                    || branch_gate(view, &slots.input, x, h, Activation::Sigmoid),
                    || branch_gate(view, &slots.forget, x, h, Activation::Sigmoid),
                )
            },
            || {
                rayon::join(
                    || branch_gate(view, &slots.output, x, h, Activation::Sigmoid),
                    || branch_gate(view, &slots.cell, x, h, Activation::Tanh),
                )
            },
        )
    };
    [g.splice(si), g.splice(sf), g.splice(so), g.splice(sc)]
}
