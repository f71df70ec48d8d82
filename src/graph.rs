// Graph - per-tick tensor arena plus a tape of backward records
//
// Every operator pushes its output tensor into the arena and, while the
// graph is recording, appends one tagged `Op` naming the arena slots of its
// inputs and output. `backward()` walks the tape in reverse and accumulates
// each output's gradient into its inputs' gradient buffers.
//
// ARENA LAYOUT:
//
//   [0, params)        borrowed model parameters (live across ticks)
//   [params, len)      tick-local tensors, dropped by `reset()`
//
// Records hold indices, never references, so a record can only ever point
// at a tensor that lives as long as the arena itself.
//
// BRANCHES: `fork()` hands out a read-only view that records into its own
// buffers. Several branches can be built concurrently and then `splice()`d
// back in a fixed order, which renumbers their tick-local slots.

use crate::element::Element;
use crate::kernels::{gemm, gemm_grad_left, gemm_grad_right, vec_add, vec_mul, vec_sigmoid, vec_tanh, widen};
use crate::tensor::Tensor;

/// Handle to a tensor slot in a [`Graph`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tid(pub(crate) usize);

/// One backward record: which gradient rule to apply, to which slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    MatMul { a: Tid, b: Tid, out: Tid },
    Add { a: Tid, b: Tid, out: Tid },
    EltMul { a: Tid, b: Tid, out: Tid },
    RowPluck { m: Tid, row: usize, out: Tid },
    Tanh { m: Tid, out: Tid },
    Sigmoid { m: Tid, out: Tid },
}

impl Op {
    fn remap(self, f: impl Fn(Tid) -> Tid) -> Op {
        match self {
            Op::MatMul { a, b, out } => Op::MatMul { a: f(a), b: f(b), out: f(out) },
            Op::Add { a, b, out } => Op::Add { a: f(a), b: f(b), out: f(out) },
            Op::EltMul { a, b, out } => Op::EltMul { a: f(a), b: f(b), out: f(out) },
            Op::RowPluck { m, row, out } => Op::RowPluck { m: f(m), row, out: f(out) },
            Op::Tanh { m, out } => Op::Tanh { m: f(m), out: f(out) },
            Op::Sigmoid { m, out } => Op::Sigmoid { m: f(m), out: f(out) },
        }
    }
}

// ============================================================================
// RECORDER - the operator set, shared by graphs and branches
// ============================================================================

/// Something that can hold tensors and record backward ops.
///
/// The operators are provided methods so [`Graph`] and [`Branch`] build
/// identical records. Shape preconditions are asserted: a violation means the
/// graph was wired wrong and is not recoverable.
pub trait Recorder<E: Element> {
    fn tensor(&self, id: Tid) -> &Tensor<E>;

    /// Pushes a tensor into the arena and returns its slot.
    fn push(&mut self, t: Tensor<E>) -> Tid;

    /// Appends `op` to the tape; a no-op when not recording.
    fn record(&mut self, op: Op);

    fn is_recording(&self) -> bool;

    fn value(&self, id: Tid) -> &[E] {
        &self.tensor(id).w
    }

    /// `a @ b`.
    fn matmul(&mut self, a: Tid, b: Tid) -> Tid {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        assert_eq!(
            ta.cols, tb.rows,
            "matmul shape [{}x{}] @ [{}x{}]",
            ta.rows, ta.cols, tb.rows, tb.cols
        );
        let (m, k, n) = (ta.rows, ta.cols, tb.cols);
        let w = gemm(m, k, n, &widen(&ta.w), &widen(&tb.w));
        let out = Tensor { rows: m, cols: n, w: w.into_iter().map(E::narrow).collect(), dw: vec![E::zero(); m * n] };
        let id = self.push(out);
        self.record(Op::MatMul { a, b, out: id });
        id
    }

    fn add(&mut self, a: Tid, b: Tid) -> Tid {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        assert_eq!(ta.shape(), tb.shape(), "add shape {:?} + {:?}", ta.shape(), tb.shape());
        let out = Tensor { rows: ta.rows, cols: ta.cols, w: vec_add(&ta.w, &tb.w), dw: vec![E::zero(); ta.len()] };
        let id = self.push(out);
        self.record(Op::Add { a, b, out: id });
        id
    }

    /// Elementwise product.
    fn eltmul(&mut self, a: Tid, b: Tid) -> Tid {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        assert_eq!(ta.shape(), tb.shape(), "eltmul shape {:?} * {:?}", ta.shape(), tb.shape());
        let out = Tensor { rows: ta.rows, cols: ta.cols, w: vec_mul(&ta.w, &tb.w), dw: vec![E::zero(); ta.len()] };
        let id = self.push(out);
        self.record(Op::EltMul { a, b, out: id });
        id
    }

    /// Row `row` of `m` as a column vector.
    fn row_pluck(&mut self, m: Tid, row: usize) -> Tid {
        let tm = self.tensor(m);
        assert!(row < tm.rows, "row_pluck row {} out of range for {} rows", row, tm.rows);
        let off = row * tm.cols;
        let out = Tensor::column(&tm.w[off..off + tm.cols]);
        let id = self.push(out);
        self.record(Op::RowPluck { m, row, out: id });
        id
    }

    fn tanh(&mut self, m: Tid) -> Tid {
        let tm = self.tensor(m);
        let out = Tensor { rows: tm.rows, cols: tm.cols, w: vec_tanh(&tm.w), dw: vec![E::zero(); tm.len()] };
        let id = self.push(out);
        self.record(Op::Tanh { m, out: id });
        id
    }

    fn sigmoid(&mut self, m: Tid) -> Tid {
        let tm = self.tensor(m);
        let out = Tensor { rows: tm.rows, cols: tm.cols, w: vec_sigmoid(&tm.w), dw: vec![E::zero(); tm.len()] };
        let id = self.push(out);
        self.record(Op::Sigmoid { m, out: id });
        id
    }
}

// ============================================================================
// GRAPH
// ============================================================================

pub struct Graph<'p, E: Element> {
    params: Vec<&'p mut Tensor<E>>,
    nodes: Vec<Tensor<E>>,
    tape: Vec<Op>,
    recording: bool,
}

impl<'p, E: Element> Graph<'p, E> {
    /// A graph whose first slots are `params`, in order.
    pub fn new(params: Vec<&'p mut Tensor<E>>, recording: bool) -> Self {
        Graph { params, nodes: Vec::with_capacity(1024), tape: Vec::with_capacity(1024), recording }
    }

    /// A graph with no bound parameters.
    pub fn detached(recording: bool) -> Self {
        Self::new(Vec::new(), recording)
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Slot of the `i`-th bound parameter.
    pub fn param(&self, i: usize) -> Tid {
        assert!(i < self.params.len(), "parameter slot {} out of range", i);
        Tid(i)
    }

    /// Total slots in the arena.
    pub fn len(&self) -> usize {
        self.params.len() + self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tape_len(&self) -> usize {
        self.tape.len()
    }

    /// Inserts a tick-local input tensor.
    pub fn constant(&mut self, t: Tensor<E>) -> Tid {
        self.push(t)
    }

    pub fn tensor_mut(&mut self, id: Tid) -> &mut Tensor<E> {
        let p = self.params.len();
        if id.0 < p {
            &mut *self.params[id.0]
        } else {
            &mut self.nodes[id.0 - p]
        }
    }

    pub fn grad(&self, id: Tid) -> &[E] {
        &self.tensor(id).dw
    }

    /// Overwrites the gradient of `id`.
    ///
    /// Used to seed the softmax + cross-entropy gradient at the logits,
    /// which bypasses the tape.
    pub fn set_grad(&mut self, id: Tid, grad: &[E]) {
        let t = self.tensor_mut(id);
        assert_eq!(t.dw.len(), grad.len(), "set_grad length {} for tensor of {}", grad.len(), t.dw.len());
        t.dw.copy_from_slice(grad);
    }

    /// Drops tick-local tensors and the tape; bound parameters stay.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.tape.clear();
    }

    pub fn zero_grad(&mut self) {
        for p in self.params.iter_mut() {
            p.zero_grad();
        }
        for n in self.nodes.iter_mut() {
            n.zero_grad();
        }
    }

    /// Read-only view that records into its own buffers.
    pub fn fork(&self) -> Branch<'_, 'p, E> {
        Branch { parent: self, base: self.len(), nodes: Vec::new(), tape: Vec::new() }
    }

    /// Appends a finished branch, renumbering its local slots. Returns the
    /// new slot of the branch output.
    pub fn splice(&mut self, seg: Segment<E>) -> Tid {
        let here = self.len();
        assert!(here >= seg.base, "segment forked from a longer graph ({} > {})", seg.base, here);
        let base = seg.base;
        let shift = |id: Tid| if id.0 >= base { Tid(id.0 - base + here) } else { id };
        self.nodes.extend(seg.nodes);
        if self.recording {
            self.tape.extend(seg.tape.into_iter().map(|op| op.remap(&shift)));
        }
        shift(seg.out)
    }

    /// Runs the tape in reverse recording order, then clears it.
    pub fn backward(&mut self) {
        let tape = std::mem::take(&mut self.tape);
        for op in tape.iter().rev() {
            self.apply(*op);
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::MatMul { a, b, out } => {
                let dout = widen(&self.tensor(out).dw);
                if dout.iter().all(|&g| g == 0.0) {
                    return;
                }
                let (ta, tb) = (self.tensor(a), self.tensor(b));
                let (m, k, n) = (ta.rows, ta.cols, tb.cols);
                let (aw, bw) = (widen(&ta.w), widen(&tb.w));
                let da = gemm_grad_left(m, k, n, &dout, &bw);
                let db = gemm_grad_right(m, k, n, &aw, &dout);
                self.accumulate(a, &da);
                self.accumulate(b, &db);
            }

            Op::Add { a, b, out } => {
                let g = self.tensor(out).dw.clone();
                add_into(&mut self.tensor_mut(a).dw, &g);
                add_into(&mut self.tensor_mut(b).dw, &g);
            }

            Op::EltMul { a, b, out } => {
                let g = self.tensor(out).dw.clone();
                let aw = self.tensor(a).w.clone();
                let bw = self.tensor(b).w.clone();
                for (j, dw) in self.tensor_mut(a).dw.iter_mut().enumerate() {
                    *dw += bw[j] * g[j];
                }
                for (j, dw) in self.tensor_mut(b).dw.iter_mut().enumerate() {
                    *dw += aw[j] * g[j];
                }
            }

            Op::RowPluck { m, row, out } => {
                let g = self.tensor(out).dw.clone();
                let tm = self.tensor_mut(m);
                let off = row * tm.cols;
                add_into(&mut tm.dw[off..off + g.len()], &g);
            }

            Op::Tanh { m, out } => {
                let to = self.tensor(out);
                // d tanh = 1 - out^2
                let g: Vec<E> = to.w.iter().zip(to.dw.iter()).map(|(&o, &d)| (E::one() - o * o) * d).collect();
                add_into(&mut self.tensor_mut(m).dw, &g);
            }

            Op::Sigmoid { m, out } => {
                let to = self.tensor(out);
                let g: Vec<E> = to.w.iter().zip(to.dw.iter()).map(|(&o, &d)| o * (E::one() - o) * d).collect();
                add_into(&mut self.tensor_mut(m).dw, &g);
            }
        }
    }

    fn accumulate(&mut self, id: Tid, grad: &[f64]) {
        let t = self.tensor_mut(id);
        for (dw, &g) in t.dw.iter_mut().zip(grad.iter()) {
            *dw += E::narrow(g);
        }
    }
}

#[inline]
fn add_into<E: Element>(dst: &mut [E], src: &[E]) {
    crate::kernels::vec_add_inplace(dst, src);
}

impl<'p, E: Element> Recorder<E> for Graph<'p, E> {
    fn tensor(&self, id: Tid) -> &Tensor<E> {
        let p = self.params.len();
        if id.0 < p {
            &*self.params[id.0]
        } else {
            &self.nodes[id.0 - p]
        }
    }

    fn push(&mut self, t: Tensor<E>) -> Tid {
        let id = Tid(self.len());
        self.nodes.push(t);
        id
    }

    fn record(&mut self, op: Op) {
        if self.recording {
            self.tape.push(op);
        }
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

// ============================================================================
// BRANCHES
// ============================================================================

/// A recorder layered over a frozen [`Graph`].
pub struct Branch<'g, 'p, E: Element> {
    parent: &'g Graph<'p, E>,
    base: usize,
    nodes: Vec<Tensor<E>>,
    tape: Vec<Op>,
}

/// Owned result of a [`Branch`], ready to [`Graph::splice`].
pub struct Segment<E: Element> {
    base: usize,
    nodes: Vec<Tensor<E>>,
    tape: Vec<Op>,
    out: Tid,
}

impl<'g, 'p, E: Element> Branch<'g, 'p, E> {
    pub fn finish(self, out: Tid) -> Segment<E> {
        Segment { base: self.base, nodes: self.nodes, tape: self.tape, out }
    }
}

impl<'g, 'p, E: Element> Recorder<E> for Branch<'g, 'p, E> {
    fn tensor(&self, id: Tid) -> &Tensor<E> {
        if id.0 < self.base {
            self.parent.tensor(id)
        } else {
            &self.nodes[id.0 - self.base]
        }
    }

    fn push(&mut self, t: Tensor<E>) -> Tid {
        let id = Tid(self.base + self.nodes.len());
        self.nodes.push(t);
        id
    }

    fn record(&mut self, op: Op) {
        if self.parent.recording {
            self.tape.push(op);
        }
    }

    fn is_recording(&self) -> bool {
        self.parent.recording
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn t(rows: usize, cols: usize, w: &[f64]) -> Tensor<f64> {
        Tensor::from_vec(rows, cols, w.to_vec()).unwrap()
    }

    #[test]
    fn matmul_forward_and_backward() {
        let mut a = t(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let mut x = t(2, 1, &[5.0, 6.0]);
        let mut g = Graph::new(vec![&mut a, &mut x], true);
        let (ia, ix) = (g.param(0), g.param(1));
        let y = g.matmul(ia, ix);
        assert_eq!(g.value(y), &[17.0, 39.0]);
        assert_eq!(g.tape_len(), 1);

        g.set_grad(y, &[1.0, 1.0]);
        g.backward();
        assert_eq!(g.tape_len(), 0);
        assert_eq!(g.grad(ia), &[5.0, 6.0, 5.0, 6.0]);
        assert_eq!(g.grad(ix), &[4.0, 6.0]);
    }

    #[test]
    fn gradients_accumulate_across_uses() {
        let mut x = t(1, 1, &[3.0]);
        let mut g = Graph::new(vec![&mut x], true);
        let ix = g.param(0);
        let y = g.eltmul(ix, ix);
        let z = g.add(y, ix);
        g.set_grad(z, &[1.0]);
        g.backward();
        // d(x^2 + x)/dx = 2x + 1
        assert_abs_diff_eq!(g.grad(ix)[0], 7.0);
    }

    #[test]
    fn non_recording_graph_keeps_no_tape() {
        let mut m = t(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut g = Graph::new(vec![&mut m], false);
        let row = g.row_pluck(g.param(0), 1);
        let s = g.sigmoid(row);
        let _ = g.tanh(s);
        assert_eq!(g.value(row), &[3.0, 4.0]);
        assert_eq!(g.tensor(row).shape(), (2, 1));
        assert_eq!(g.tape_len(), 0);
    }

    #[test]
    fn row_pluck_scatters_into_its_row() {
        let mut m = t(3, 2, &[0.0; 6]);
        let mut g = Graph::new(vec![&mut m], true);
        let row = g.row_pluck(g.param(0), 2);
        g.set_grad(row, &[1.5, -2.0]);
        g.backward();
        assert_eq!(g.grad(g.param(0)), &[0.0, 0.0, 0.0, 0.0, 1.5, -2.0]);
    }

    #[test]
    #[should_panic(expected = "matmul shape")]
    fn matmul_shape_mismatch_panics() {
        let mut a = t(2, 3, &[0.0; 6]);
        let mut b = t(2, 1, &[0.0; 2]);
        let mut g = Graph::new(vec![&mut a, &mut b], true);
        g.matmul(g.param(0), g.param(1));
    }

    #[test]
    #[should_panic(expected = "row_pluck")]
    fn row_pluck_out_of_range_panics() {
        let mut m = t(2, 2, &[0.0; 4]);
        let mut g = Graph::new(vec![&mut m], true);
        g.row_pluck(g.param(0), 2);
    }

    #[test]
    fn reset_keeps_parameters() {
        let mut w = t(1, 2, &[1.0, 2.0]);
        let mut g = Graph::new(vec![&mut w], true);
        let c = g.constant(t(2, 1, &[1.0, 1.0]));
        g.matmul(g.param(0), c);
        assert_eq!(g.len(), 3);
        g.reset();
        assert_eq!(g.len(), 1);
        assert_eq!(g.tape_len(), 0);
        assert_eq!(g.value(g.param(0)), &[1.0, 2.0]);
    }

    #[test]
    fn spliced_branches_match_sequential_recording() {
        let mut w1 = t(2, 2, &[0.5, -1.0, 2.0, 0.25]);
        let mut w2 = t(2, 2, &[1.0, 0.0, -0.5, 1.5]);
        let mut x = t(2, 1, &[1.0, 2.0]);

        // sequential
        let (seq_vals, seq_grads) = {
            let (mut a, mut b, mut c) = (w1.clone(), w2.clone(), x.clone());
            let mut g = Graph::new(vec![&mut a, &mut b, &mut c], true);
            let (p1, p2, px) = (g.param(0), g.param(1), g.param(2));
            let h1 = g.matmul(p1, px);
            let s1 = g.sigmoid(h1);
            let h2 = g.matmul(p2, px);
            let s2 = g.tanh(h2);
            let out = g.eltmul(s1, s2);
            g.set_grad(out, &[1.0, -1.0]);
            let vals = g.value(out).to_vec();
            g.backward();
            (vals, [g.grad(p1).to_vec(), g.grad(p2).to_vec(), g.grad(px).to_vec()])
        };

        let mut g = Graph::new(vec![&mut w1, &mut w2, &mut x], true);
        let (p1, p2, px) = (g.param(0), g.param(1), g.param(2));
        let (sa, sb) = {
            let view = &g;
            rayon::join(
                || {
                    let mut br = view.fork();
                    let h = br.matmul(p1, px);
                    let s = br.sigmoid(h);
                    br.finish(s)
                },
                || {
                    let mut br = view.fork();
                    let h = br.matmul(p2, px);
                    let s = br.tanh(h);
                    br.finish(s)
                },
            )
        };
        let s1 = g.splice(sa);
        let s2 = g.splice(sb);
        let out = g.eltmul(s1, s2);
        assert_eq!(g.tape_len(), 5);
        assert_eq!(g.value(out), seq_vals.as_slice());
        g.set_grad(out, &[1.0, -1.0]);
        g.backward();
        assert_eq!(g.grad(p1), seq_grads[0].as_slice());
        assert_eq!(g.grad(p2), seq_grads[1].as_slice());
        assert_eq!(g.grad(px), seq_grads[2].as_slice());
    }
}
