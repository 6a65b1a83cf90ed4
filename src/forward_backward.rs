//! Forward-backward over the joint (topic, label) lattice.
//!
//! All accumulation is in log space. For each topic the kernel fills the
//! node potentials R, the transition potentials M with the BOS/EOS vectors
//! pi and tau, and the messages alpha and beta; the per-topic partition
//! values combine with the topic potentials gamma into the joint partition.
//! Scores at or below [`LOG_ZERO`] are treated as impossible and skipped.

use crate::data::TriSequence;
use crate::math::{self, LOG_ZERO};
use crate::model::{Model, TopicView, MISSING};

/// Reusable per-sequence buffers, one set per worker thread.
#[derive(Default)]
pub struct Scratch {
    pub(crate) gamma: Vec<f64>,
    pub(crate) log_z: Vec<f64>,
    pub(crate) r: Vec<Vec<Vec<f64>>>,
    pub(crate) m: Vec<Vec<Vec<f64>>>,
    pub(crate) pi: Vec<Vec<f64>>,
    pub(crate) tau: Vec<Vec<f64>>,
    pub(crate) alpha: Vec<Vec<Vec<f64>>>,
    pub(crate) beta: Vec<Vec<Vec<f64>>>,
}

impl Scratch {
    /// Creates an empty scratch set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn reset_outer<T: Default>(v: &mut Vec<T>, n: usize) {
    if v.len() < n {
        v.resize_with(n, T::default);
    }
}

fn reset_matrix(mat: &mut Vec<Vec<f64>>, rows: usize, cols: usize, value: f64) {
    if mat.len() < rows {
        mat.resize(rows, vec![]);
    }
    for row in &mut mat[..rows] {
        row.clear();
        row.resize(cols, value);
    }
}

/// Fills the topic potentials: `gamma[z]` is the score of the record-level
/// features under topic `z`.
pub(crate) fn fill_gamma(model: &Model, params: &[f64], seq: &TriSequence, gamma: &mut Vec<f64>) {
    gamma.clear();
    gamma.resize(model.n_topics(), 0.0);
    let topic_store = model.topic_store();
    for &(fid, fval) in &seq.topic.features {
        for &(z, slot) in topic_store.obs_params(fid) {
            gamma[usize::try_from(z).unwrap()] += params[usize::try_from(slot).unwrap()] * fval;
        }
    }
}

/// Fills R, M, pi, and tau for one topic from the store indexes.
pub(crate) fn fill_factors(
    view: &TopicView,
    params: &[f64],
    seq: &TriSequence,
    r: &mut Vec<Vec<f64>>,
    m: &mut Vec<Vec<f64>>,
    pi: &mut Vec<f64>,
    tau: &mut Vec<f64>,
) {
    let n = view.states.len();
    reset_matrix(r, seq.len(), n, 0.0);
    for (t, event) in seq.seq.iter().enumerate() {
        for &(gfid, fval) in &event.features {
            let lfid = view.fid_map[usize::try_from(gfid).unwrap()];
            if lfid == MISSING {
                continue;
            }
            for &(y, slot) in view.store.obs_params(lfid) {
                let j = view.state_pos[usize::try_from(y).unwrap()];
                if j == MISSING {
                    continue;
                }
                r[t][usize::try_from(j).unwrap()] +=
                    params[view.offset + usize::try_from(slot).unwrap()] * fval;
            }
        }
    }
    reset_matrix(m, n, n, 0.0);
    pi.clear();
    pi.resize(n, 0.0);
    tau.clear();
    tau.resize(n, 0.0);
    for tr in view.store.transitions(None) {
        if let Some(y) = tr.to {
            let j = view.state_pos[usize::try_from(y).unwrap()];
            if j != MISSING {
                pi[usize::try_from(j).unwrap()] +=
                    params[view.offset + usize::try_from(tr.slot).unwrap()];
            }
        }
    }
    for (j1, &y1) in view.states.iter().enumerate() {
        for tr in view.store.transitions(Some(y1)) {
            match tr.to {
                Some(y2) => {
                    let j2 = view.state_pos[usize::try_from(y2).unwrap()];
                    if j2 != MISSING {
                        m[j1][usize::try_from(j2).unwrap()] +=
                            params[view.offset + usize::try_from(tr.slot).unwrap()];
                    }
                }
                None => {
                    tau[j1] += params[view.offset + usize::try_from(tr.slot).unwrap()];
                }
            }
        }
    }
}

/// Runs the full forward-backward pass for one sequence and returns the
/// joint log-partition `Z*`. The per-topic messages stay in `scratch` for
/// [`accumulate_expected`] and the marginal helpers.
pub fn compute_lattice(
    model: &Model,
    params: &[f64],
    seq: &TriSequence,
    scratch: &mut Scratch,
) -> f64 {
    let n_topics = model.n_topics();
    let t_len = seq.len();

    fill_gamma(model, params, seq, &mut scratch.gamma);
    scratch.log_z.clear();
    scratch.log_z.resize(n_topics, f64::NEG_INFINITY);
    reset_outer(&mut scratch.r, n_topics);
    reset_outer(&mut scratch.m, n_topics);
    reset_outer(&mut scratch.pi, n_topics);
    reset_outer(&mut scratch.tau, n_topics);
    reset_outer(&mut scratch.alpha, n_topics);
    reset_outer(&mut scratch.beta, n_topics);

    for z in 0..n_topics {
        let view = model.topic_view(u32::try_from(z).unwrap());
        let n = view.states.len();
        fill_factors(
            &view,
            params,
            seq,
            &mut scratch.r[z],
            &mut scratch.m[z],
            &mut scratch.pi[z],
            &mut scratch.tau[z],
        );
        let r = &scratch.r[z];
        let m = &scratch.m[z];
        let pi = &scratch.pi[z];
        let tau = &scratch.tau[z];

        let alpha = &mut scratch.alpha[z];
        reset_matrix(alpha, t_len, n, f64::NEG_INFINITY);
        for j in 0..n {
            alpha[0][j] = r[0][j] + pi[j];
        }
        for t in 1..t_len {
            for j in 0..n {
                let mut total = f64::NEG_INFINITY;
                for j2 in 0..n {
                    let prev = alpha[t - 1][j2];
                    if prev <= LOG_ZERO {
                        continue;
                    }
                    total = math::logsumexp(total, prev + m[j2][j]);
                }
                alpha[t][j] = r[t][j] + total;
            }
        }

        let beta = &mut scratch.beta[z];
        reset_matrix(beta, t_len, n, f64::NEG_INFINITY);
        for j in 0..n {
            beta[t_len - 1][j] = tau[j];
        }
        for t in (0..t_len - 1).rev() {
            for j in 0..n {
                let mut total = f64::NEG_INFINITY;
                for j2 in 0..n {
                    let next = beta[t + 1][j2];
                    if next <= LOG_ZERO {
                        continue;
                    }
                    total = math::logsumexp(total, m[j][j2] + r[t + 1][j2] + next);
                }
                beta[t][j] = total;
            }
        }

        let mut z_total = f64::NEG_INFINITY;
        for j in 0..n {
            z_total = math::logsumexp(z_total, scratch.alpha[z][t_len - 1][j] + tau[j]);
        }
        scratch.log_z[z] = z_total;
    }

    let mut z_star = f64::NEG_INFINITY;
    for z in 0..n_topics {
        z_star = math::logsumexp(z_star, scratch.gamma[z] + scratch.log_z[z]);
    }
    z_star
}

/// Log score of the gold topic and gold path of a sequence:
/// `gamma[z] + sum R + sum M` along the annotation.
///
/// Returns `None` when the gold topic is unseen or a gold label is not a
/// state of the gold topic, which can only happen on held-out data.
pub fn gold_score(model: &Model, params: &[f64], seq: &TriSequence) -> Option<f64> {
    let z = seq.topic.label;
    if usize::try_from(z).ok()? >= model.n_topics() {
        return None;
    }
    let topic_store = model.topic_store();
    let mut score = 0.0;
    for &(fid, fval) in &seq.topic.features {
        if let Some(slot) = topic_store.obs_slot(z, fid) {
            score += params[usize::try_from(slot).unwrap()] * fval;
        }
    }
    let view = model.topic_view(z);
    let edge = view.store.edge_fid();
    let mut prev = None;
    for event in &seq.seq {
        let local = model.local_of(z, event.label)?;
        for &(gfid, fval) in &event.features {
            let lfid = view.fid_map[usize::try_from(gfid).unwrap()];
            if lfid == MISSING {
                continue;
            }
            if let Some(slot) = view.store.obs_slot(local, lfid) {
                score += params[view.offset + usize::try_from(slot).unwrap()] * fval;
            }
        }
        if let Some(slot) = view.store.trans_slot(prev, Some(local), edge) {
            score += params[view.offset + usize::try_from(slot).unwrap()];
        }
        prev = Some(local);
    }
    if let Some(slot) = view.store.trans_slot(prev, None, edge) {
        score += params[view.offset + usize::try_from(slot).unwrap()];
    }
    Some(score)
}

/// Adds the expected feature counts of one sequence to `grad`, using the
/// messages left in `scratch` by [`compute_lattice`].
pub fn accumulate_expected(
    model: &Model,
    seq: &TriSequence,
    scratch: &Scratch,
    log_z_star: f64,
    grad: &mut [f64],
) {
    let t_len = seq.len();
    let topic_store = model.topic_store();
    for &(fid, fval) in &seq.topic.features {
        for &(z, slot) in topic_store.obs_params(fid) {
            let z = usize::try_from(z).unwrap();
            let lp = scratch.gamma[z] + scratch.log_z[z] - log_z_star;
            if lp > LOG_ZERO {
                grad[usize::try_from(slot).unwrap()] += lp.exp() * fval;
            }
        }
    }

    for z in 0..model.n_topics() {
        let view = model.topic_view(u32::try_from(z).unwrap());
        let n = view.states.len();
        let g = scratch.gamma[z];
        let alpha = &scratch.alpha[z];
        let beta = &scratch.beta[z];
        let r = &scratch.r[z];
        let m = &scratch.m[z];
        let tau = &scratch.tau[z];
        let mut mu = vec![0.0; n];

        for (t, event) in seq.seq.iter().enumerate() {
            for (j, mu) in mu.iter_mut().enumerate() {
                let lp = g + alpha[t][j] + beta[t][j] - log_z_star;
                *mu = if lp > LOG_ZERO { lp.exp() } else { 0.0 };
            }
            for &(gfid, fval) in &event.features {
                let lfid = view.fid_map[usize::try_from(gfid).unwrap()];
                if lfid == MISSING {
                    continue;
                }
                for &(y, slot) in view.store.obs_params(lfid) {
                    let j = view.state_pos[usize::try_from(y).unwrap()];
                    if j == MISSING {
                        continue;
                    }
                    grad[view.offset + usize::try_from(slot).unwrap()] +=
                        mu[usize::try_from(j).unwrap()] * fval;
                }
            }
            if t == 0 {
                for tr in view.store.transitions(None) {
                    if let Some(y) = tr.to {
                        let j = view.state_pos[usize::try_from(y).unwrap()];
                        if j != MISSING {
                            grad[view.offset + usize::try_from(tr.slot).unwrap()] +=
                                mu[usize::try_from(j).unwrap()];
                        }
                    }
                }
            } else {
                for (j1, &y1) in view.states.iter().enumerate() {
                    let a = alpha[t - 1][j1];
                    if a <= LOG_ZERO {
                        continue;
                    }
                    for tr in view.store.transitions(Some(y1)) {
                        if let Some(y2) = tr.to {
                            let j2 = view.state_pos[usize::try_from(y2).unwrap()];
                            if j2 == MISSING {
                                continue;
                            }
                            let j2 = usize::try_from(j2).unwrap();
                            let lp = g + a + m[j1][j2] + r[t][j2] + beta[t][j2] - log_z_star;
                            if lp > LOG_ZERO {
                                grad[view.offset + usize::try_from(tr.slot).unwrap()] += lp.exp();
                            }
                        }
                    }
                }
            }
        }
        for (j, &y1) in view.states.iter().enumerate() {
            let lp = g + alpha[t_len - 1][j] + tau[j] - log_z_star;
            if lp <= LOG_ZERO {
                continue;
            }
            let p = lp.exp();
            for tr in view.store.transitions(Some(y1)) {
                if tr.to.is_none() {
                    grad[view.offset + usize::try_from(tr.slot).unwrap()] += p;
                }
            }
        }
    }
}

/// Posterior `P(z | x)` for every topic.
#[must_use]
pub fn topic_posteriors(scratch: &Scratch, n_topics: usize, log_z_star: f64) -> Vec<f64> {
    (0..n_topics)
        .map(|z| {
            let lp = scratch.gamma[z] + scratch.log_z[z] - log_z_star;
            if lp > LOG_ZERO {
                lp.exp()
            } else {
                0.0
            }
        })
        .collect()
}

/// Per-position state marginals `P(j, t | x, z)` conditional on topic `z`,
/// indexed `[t][j]` over the topic's state list.
#[must_use]
pub fn conditional_marginals(scratch: &Scratch, z: usize, t_len: usize) -> Vec<Vec<f64>> {
    let n = scratch.alpha[z][0].len();
    (0..t_len)
        .map(|t| {
            (0..n)
                .map(|j| {
                    let lp =
                        scratch.alpha[z][t][j] + scratch.beta[z][t][j] - scratch.log_z[z];
                    if lp > LOG_ZERO {
                        lp.exp()
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::read_records;
    use crate::model::ModelKind;

    fn chain_model() -> (Model, Vec<TriSequence>) {
        let records = read_records("A fa\nB fb\n".as_bytes()).unwrap();
        let mut model = Model::new(ModelKind::Crf);
        let dataset = model.read_train_records(&records).unwrap();
        model.finalize().unwrap();
        (model, dataset)
    }

    // Slot layout of the chain corpus, in binding order:
    //   0: obs(A, fa)   1: trans(BOS, A)   2: obs(B, fb)
    //   3: trans(A, B)  4: trans(B, EOS)
    //
    // With params [1, 2, 3, 4, 5] the path scores are
    //   A-A: 1+2 = 3        A-B: 1+2+4+3+5 = 15
    //   B-A: 0              B-B: 3+5 = 8
    #[test]
    fn test_chain_partition() {
        let (model, dataset) = chain_model();
        assert_eq!(5, model.n_params());
        let params = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut scratch = Scratch::new();
        let z_star = compute_lattice(&model, &params, &dataset[0], &mut scratch);

        let expected = [3.0f64, 15.0, 0.0, 8.0]
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &s| math::logsumexp(acc, s));
        assert!((expected - z_star).abs() < 1e-12);
    }

    #[test]
    fn test_gold_score_is_gold_path() {
        let (model, dataset) = chain_model();
        let params = [1.0, 2.0, 3.0, 4.0, 5.0];
        let score = gold_score(&model, &params, &dataset[0]).unwrap();
        assert!((15.0 - score).abs() < 1e-12);
    }

    #[test]
    fn test_partition_consistency() {
        // logsumexp_y alpha[T-1, y] + tau[y] == logsumexp_y beta[0, y] + R[0, y] + pi[y]
        let (model, dataset) = chain_model();
        let params = [0.3, -1.2, 0.7, 2.1, -0.4];
        let mut scratch = Scratch::new();
        compute_lattice(&model, &params, &dataset[0], &mut scratch);

        let t_last = dataset[0].len() - 1;
        let n = scratch.alpha[0][0].len();
        let mut fwd = f64::NEG_INFINITY;
        let mut bwd = f64::NEG_INFINITY;
        for j in 0..n {
            fwd = math::logsumexp(fwd, scratch.alpha[0][t_last][j] + scratch.tau[0][j]);
            bwd = math::logsumexp(
                bwd,
                scratch.beta[0][0][j] + scratch.r[0][0][j] + scratch.pi[0][j],
            );
        }
        assert!(((fwd - bwd) / fwd.abs().max(1.0)).abs() < 1e-8);
        assert!((fwd - scratch.log_z[0]).abs() < 1e-8);
    }

    const TRI_CORPUS: &str = "\
T1 w=go\n\
a1 word=denver\n\
a2 word=to\n\
a1 word=boston\n\
\n\
T2 w=book\n\
b1 word=york\n\
b2 word=new\n";

    fn tri_model(kind: ModelKind) -> (Model, Vec<TriSequence>) {
        let records = read_records(TRI_CORPUS.as_bytes()).unwrap();
        let mut model = Model::new(kind);
        let dataset = model.read_train_records(&records).unwrap();
        model.finalize().unwrap();
        (model, dataset)
    }

    #[test]
    fn test_marginals_sum_to_one() {
        for kind in [ModelKind::TriShared, ModelKind::TriPartitioned { tied_k: 0.0 }] {
            let (model, dataset) = tri_model(kind);
            let params: Vec<f64> = (0..model.n_params())
                .map(|i| ((i * 7919) % 13) as f64 * 0.31 - 1.7)
                .collect();
            let mut scratch = Scratch::new();
            for seq in &dataset {
                let z_star = compute_lattice(&model, &params, seq, &mut scratch);
                assert!(z_star.is_finite());
                for t in 0..seq.len() {
                    let mut total = 0.0;
                    for z in 0..model.n_topics() {
                        let n = model.topic_view(u32::try_from(z).unwrap()).states.len();
                        for j in 0..n {
                            let lp = scratch.gamma[z] + scratch.alpha[z][t][j]
                                + scratch.beta[z][t][j]
                                - z_star;
                            if lp > LOG_ZERO {
                                total += lp.exp();
                            }
                        }
                    }
                    assert!((1.0 - total).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_topic_posteriors_sum_to_one() {
        let (model, dataset) = tri_model(ModelKind::TriShared);
        let params: Vec<f64> = (0..model.n_params())
            .map(|i| ((i * 31) % 7) as f64 * 0.5 - 1.0)
            .collect();
        let mut scratch = Scratch::new();
        let z_star = compute_lattice(&model, &params, &dataset[0], &mut scratch);
        let posteriors = topic_posteriors(&scratch, model.n_topics(), z_star);
        let total: f64 = posteriors.iter().sum();
        assert!((1.0 - total).abs() < 1e-9);
    }

    #[test]
    fn test_conditional_marginals_sum_to_one() {
        let (model, dataset) = tri_model(ModelKind::TriPartitioned { tied_k: 0.0 });
        let params: Vec<f64> = (0..model.n_params())
            .map(|i| ((i * 13) % 11) as f64 * 0.25 - 1.2)
            .collect();
        let mut scratch = Scratch::new();
        compute_lattice(&model, &params, &dataset[0], &mut scratch);
        for z in 0..model.n_topics() {
            let marginals = conditional_marginals(&scratch, z, dataset[0].len());
            for row in marginals {
                let total: f64 = row.iter().sum();
                assert!((1.0 - total).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_expected_counts_match_brute_force_chain() {
        // Enumerate the four paths of the two-position chain and compare
        // against the kernel's expected counts.
        let (model, dataset) = chain_model();
        let params = [0.8, -0.3, 1.1, 0.6, -0.9];
        let mut scratch = Scratch::new();
        let z_star = compute_lattice(&model, &params, &dataset[0], &mut scratch);
        let mut grad = vec![0.0; model.n_params()];
        accumulate_expected(&model, &dataset[0], &scratch, z_star, &mut grad);

        // Path scores with slot activations. States: A=0, B=1.
        // slots: 0 obs(A,fa)@t0, 2 obs(B,fb)@t1, 1 pi(A), 3 m(A,B), 4 tau(B)
        let score = |y0: usize, y1: usize| -> (f64, Vec<usize>) {
            let mut s = 0.0;
            let mut active = vec![];
            if y0 == 0 {
                s += params[0];
                active.push(0);
                s += params[1];
                active.push(1);
            }
            if y1 == 1 {
                s += params[2];
                active.push(2);
                s += params[4];
                active.push(4);
            }
            if y0 == 0 && y1 == 1 {
                s += params[3];
                active.push(3);
            }
            (s, active)
        };
        let mut z = f64::NEG_INFINITY;
        for y0 in 0..2 {
            for y1 in 0..2 {
                z = math::logsumexp(z, score(y0, y1).0);
            }
        }
        let mut expected = vec![0.0; 5];
        for y0 in 0..2 {
            for y1 in 0..2 {
                let (s, active) = score(y0, y1);
                let p = (s - z).exp();
                for slot in active {
                    expected[slot] += p;
                }
            }
        }
        for (slot, (e, g)) in expected.iter().zip(&grad).enumerate() {
            assert!((e - g).abs() < 1e-10, "slot {slot}: {e} vs {g}");
        }
    }
}
