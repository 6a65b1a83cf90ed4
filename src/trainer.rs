//! Training driver: the dataset loss with its worker pool, the
//! pseudo-likelihood warm-start objective, and the trainer builder.
//!
//! During an evaluation the parameter vector is read-only; each worker owns
//! private scratch buffers and a private gradient vector, and the buffers
//! are summed into the shared gradient once all sequences drain.

use std::sync::Mutex;
use std::thread;

use argmin::core::{CostFunction, Gradient};

use crate::data::TriSequence;
use crate::errors::{Result, TricrfError};
use crate::forward_backward::{self, fill_factors, fill_gamma, Scratch};
use crate::math::{self, LOG_ZERO};
use crate::model::{Model, MISSING};
use crate::optimizers::lbfgs;

/// L1- or L2- regularization settings.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Regularization {
    /// Orthant-wise L1 penalization inside the optimizer.
    L1,

    /// Gaussian prior added to the objective and gradient.
    L2,
}

/// Negative log-likelihood of a dataset and its gradient, evaluated with a
/// pool of worker threads.
pub struct DatasetLoss<'a> {
    model: &'a Model,
    sequences: &'a [TriSequence],
    counts: Vec<f64>,
    n_threads: usize,
    l2_lambda: Option<f64>,
    penalty_mask: Option<Vec<bool>>,
}

impl<'a> DatasetLoss<'a> {
    /// Creates the loss. `l2_lambda` is the penalty coefficient `1/sigma^2`;
    /// `penalty_mask` flags slots excluded from regularization.
    #[must_use]
    pub fn new(
        model: &'a Model,
        sequences: &'a [TriSequence],
        n_threads: usize,
        l2_lambda: Option<f64>,
        penalty_mask: Option<Vec<bool>>,
    ) -> Self {
        Self {
            model,
            sequences,
            counts: model.flat_counts(),
            n_threads,
            l2_lambda,
            penalty_mask,
        }
    }

    #[inline(always)]
    fn penalized(&self, slot: usize) -> bool {
        self.penalty_mask.as_ref().map_or(true, |mask| !mask[slot])
    }

    pub(crate) fn evaluate_cost(&self, param: &[f64]) -> Result<f64> {
        let (s, r) = crossbeam_channel::unbounded();
        for seq in self.sequences {
            s.send(seq).unwrap();
        }
        let mut loss_total = thread::scope(|scope| {
            let mut threads = vec![];
            for _ in 0..self.n_threads {
                let t = scope.spawn(|| {
                    let mut scratch = Scratch::new();
                    let mut loss_total = 0.0;
                    while let Ok(seq) = r.try_recv() {
                        let z_star =
                            forward_backward::compute_lattice(self.model, param, seq, &mut scratch);
                        if let Some(gold) = forward_backward::gold_score(self.model, param, seq) {
                            loss_total += z_star - gold;
                        }
                    }
                    loss_total
                });
                threads.push(t);
            }
            let mut loss_total = 0.0;
            for t in threads {
                loss_total += t.join().unwrap();
            }
            loss_total
        });

        if let Some(lambda) = self.l2_lambda {
            let mut norm2 = 0.0;
            for (slot, &p) in param.iter().enumerate() {
                if self.penalized(slot) {
                    norm2 += p * p;
                }
            }
            loss_total += lambda * norm2 * 0.5;
        }

        if !loss_total.is_finite() {
            return Err(TricrfError::numeric_breakdown("objective is not finite"));
        }
        Ok(loss_total)
    }

    pub(crate) fn evaluate_gradient(&self, param: &[f64]) -> Result<Vec<f64>> {
        let (s, r) = crossbeam_channel::unbounded();
        for seq in self.sequences {
            s.send(seq).unwrap();
        }
        let gradients = Mutex::new(vec![0.0; param.len()]);
        thread::scope(|scope| {
            for _ in 0..self.n_threads {
                scope.spawn(|| {
                    let mut scratch = Scratch::new();
                    let mut local_gradients = vec![0.0; param.len()];
                    while let Ok(seq) = r.try_recv() {
                        let z_star =
                            forward_backward::compute_lattice(self.model, param, seq, &mut scratch);
                        forward_backward::accumulate_expected(
                            self.model,
                            seq,
                            &scratch,
                            z_star,
                            &mut local_gradients,
                        );
                    }
                    #[allow(clippy::significant_drop_in_scrutinee)]
                    for (y, x) in gradients.lock().unwrap().iter_mut().zip(local_gradients) {
                        *y += x;
                    }
                });
            }
        });
        let mut gradients = gradients.into_inner().unwrap();

        for (g, c) in gradients.iter_mut().zip(&self.counts) {
            *g -= c;
        }
        if let Some(lambda) = self.l2_lambda {
            for (slot, (g, &p)) in gradients.iter_mut().zip(param).enumerate() {
                if self.penalized(slot) {
                    *g += lambda * p;
                }
            }
        }

        if gradients.iter().any(|g| !g.is_finite()) {
            return Err(TricrfError::numeric_breakdown("gradient is not finite"));
        }
        Ok(gradients)
    }
}

impl CostFunction for DatasetLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.evaluate_cost(param).map_err(argmin::core::Error::new)
    }
}

impl Gradient for DatasetLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.evaluate_gradient(param).map_err(argmin::core::Error::new)
    }
}

/// Pseudo-likelihood objective: each position is conditioned on the gold
/// left neighbor and the gold topic, which keeps the gradient linear in the
/// state count. Used to warm-start the triangular models.
pub struct PseudoLikelihoodLoss<'a> {
    model: &'a Model,
    sequences: &'a [TriSequence],
    l2_lambda: Option<f64>,
}

impl<'a> PseudoLikelihoodLoss<'a> {
    /// Creates the warm-start loss.
    #[must_use]
    pub fn new(model: &'a Model, sequences: &'a [TriSequence], l2_lambda: Option<f64>) -> Self {
        Self {
            model,
            sequences,
            l2_lambda,
        }
    }

    fn evaluate(&self, param: &[f64], mut grad: Option<&mut [f64]>) -> Result<f64> {
        let mut loss = 0.0;
        let mut gamma = vec![];
        let mut r = vec![];
        let mut m = vec![];
        let mut pi = vec![];
        let mut tau = vec![];
        let topic_store = self.model.topic_store();
        for seq in self.sequences {
            let z = seq.topic.label;
            fill_gamma(self.model, param, seq, &mut gamma);
            let mut log_z_topic = f64::NEG_INFINITY;
            for &g in &gamma {
                log_z_topic = math::logsumexp(log_z_topic, g);
            }
            loss += log_z_topic - gamma[usize::try_from(z).unwrap()];
            if let Some(grad) = grad.as_deref_mut() {
                for &(fid, fval) in &seq.topic.features {
                    for &(y, slot) in topic_store.obs_params(fid) {
                        let lp = gamma[usize::try_from(y).unwrap()] - log_z_topic;
                        if lp > LOG_ZERO {
                            grad[usize::try_from(slot).unwrap()] += lp.exp() * fval;
                        }
                    }
                    if let Some(slot) = topic_store.obs_slot(z, fid) {
                        grad[usize::try_from(slot).unwrap()] -= fval;
                    }
                }
            }

            let view = self.model.topic_view(z);
            let n = view.states.len();
            fill_factors(&view, param, seq, &mut r, &mut m, &mut pi, &mut tau);
            let edge = view.store.edge_fid();
            let mut prev: Option<(u32, usize)> = None;
            let mut probs = vec![0.0; n];
            for (t, event) in seq.seq.iter().enumerate() {
                let local = self.model.local_of(z, event.label).unwrap();
                let gold_j =
                    usize::try_from(view.state_pos[usize::try_from(local).unwrap()]).unwrap();
                let mut log_z_t = f64::NEG_INFINITY;
                for j in 0..n {
                    let score = r[t][j] + prev.map_or(pi[j], |(_, pj)| m[pj][j]);
                    log_z_t = math::logsumexp(log_z_t, score);
                }
                let gold_score = r[t][gold_j] + prev.map_or(pi[gold_j], |(_, pj)| m[pj][gold_j]);
                loss += log_z_t - gold_score;

                if let Some(grad) = grad.as_deref_mut() {
                    for (j, p) in probs.iter_mut().enumerate() {
                        let lp = r[t][j] + prev.map_or(pi[j], |(_, pj)| m[pj][j]) - log_z_t;
                        *p = if lp > LOG_ZERO { lp.exp() } else { 0.0 };
                    }
                    for &(gfid, fval) in &event.features {
                        let lfid = view.fid_map[usize::try_from(gfid).unwrap()];
                        if lfid == MISSING {
                            continue;
                        }
                        for &(y, slot) in view.store.obs_params(lfid) {
                            let j = view.state_pos[usize::try_from(y).unwrap()];
                            if j != MISSING {
                                grad[view.offset + usize::try_from(slot).unwrap()] +=
                                    probs[usize::try_from(j).unwrap()] * fval;
                            }
                        }
                        if let Some(slot) = view.store.obs_slot(local, lfid) {
                            grad[view.offset + usize::try_from(slot).unwrap()] -= fval;
                        }
                    }
                    let from = prev.map(|(y, _)| y);
                    for tr in view.store.transitions(from) {
                        if let Some(y) = tr.to {
                            let j = view.state_pos[usize::try_from(y).unwrap()];
                            if j != MISSING {
                                grad[view.offset + usize::try_from(tr.slot).unwrap()] +=
                                    probs[usize::try_from(j).unwrap()];
                            }
                        }
                    }
                    if let Some(slot) = view.store.trans_slot(from, Some(local), edge) {
                        grad[view.offset + usize::try_from(slot).unwrap()] -= 1.0;
                    }
                }
                prev = Some((local, gold_j));
            }
        }

        if let Some(lambda) = self.l2_lambda {
            let mut norm2 = 0.0;
            for &p in param {
                norm2 += p * p;
            }
            loss += lambda * norm2 * 0.5;
            if let Some(grad) = grad.as_deref_mut() {
                for (g, &p) in grad.iter_mut().zip(param) {
                    *g += lambda * p;
                }
            }
        }
        if !loss.is_finite() {
            return Err(TricrfError::numeric_breakdown("objective is not finite"));
        }
        Ok(loss)
    }
}

impl CostFunction for PseudoLikelihoodLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.evaluate(param, None).map_err(argmin::core::Error::new)
    }
}

impl Gradient for PseudoLikelihoodLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let mut grad = vec![0.0; param.len()];
        self.evaluate(param, Some(&mut grad))
            .map_err(argmin::core::Error::new)?;
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(argmin::core::Error::new(TricrfError::numeric_breakdown(
                "gradient is not finite",
            )));
        }
        Ok(grad)
    }
}

/// Mean per-sequence log-likelihood of a dataset under the current weights,
/// used for held-out reporting. Sequences whose gold annotation cannot be
/// scored are skipped.
pub fn mean_log_likelihood(
    model: &Model,
    sequences: &[TriSequence],
    n_threads: usize,
) -> Result<f64> {
    if sequences.is_empty() {
        return Ok(0.0);
    }
    let loss = DatasetLoss::new(model, sequences, n_threads, None, None);
    let total = loss.evaluate_cost(&model.flat_weights())?;
    Ok(-total / sequences.len() as f64)
}

/// Trainer for all model kinds.
pub struct Trainer {
    max_iter: u64,
    init_iter: u64,
    warm_start: bool,
    n_threads: usize,
    regularization: Regularization,
    sigma: f64,
    c: f64,
    lbfgs_memory: usize,
    regularize_bias: bool,
}

impl Trainer {
    /// Creates a trainer with the baseline settings: 100 iterations, one
    /// thread, L2 prior with variance 400 (`sigma = 20`), no warm start.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_iter: 100,
            init_iter: 30,
            warm_start: false,
            n_threads: 1,
            regularization: Regularization::L2,
            sigma: 20.0,
            c: 1.0,
            lbfgs_memory: lbfgs::LBFGS_MEMORY,
            regularize_bias: true,
        }
    }

    /// Sets the maximum number of iterations.
    ///
    /// # Errors
    ///
    /// `max_iter` must be >= 1.
    pub const fn max_iter(mut self, max_iter: u64) -> Result<Self> {
        if max_iter == 0 {
            return Err(TricrfError::invalid_argument("max_iter must be >= 1"));
        }
        self.max_iter = max_iter;
        Ok(self)
    }

    /// Sets the number of worker threads.
    ///
    /// # Errors
    ///
    /// `n_threads` must be >= 1.
    pub const fn n_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(TricrfError::invalid_argument("n_threads must be >= 1"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    /// Selects the Gaussian prior with standard deviation `sigma`; the
    /// penalty coefficient is `1/sigma^2`.
    ///
    /// # Errors
    ///
    /// `sigma` must be > 0.
    pub fn l2(mut self, sigma: f64) -> Result<Self> {
        if sigma <= 0.0 {
            return Err(TricrfError::invalid_argument("sigma must be > 0"));
        }
        self.regularization = Regularization::L2;
        self.sigma = sigma;
        Ok(self)
    }

    /// Selects orthant-wise L1 penalization with coefficient `c`.
    ///
    /// # Errors
    ///
    /// `c` must be >= 0.
    pub fn l1(mut self, c: f64) -> Result<Self> {
        if c < 0.0 {
            return Err(TricrfError::invalid_argument("c must be >= 0"));
        }
        self.regularization = Regularization::L1;
        self.c = c;
        Ok(self)
    }

    /// Enables pseudo-likelihood warm start for `init_iter` iterations.
    ///
    /// # Errors
    ///
    /// `init_iter` must be >= 1.
    pub const fn warm_start(mut self, init_iter: u64) -> Result<Self> {
        if init_iter == 0 {
            return Err(TricrfError::invalid_argument("init_iter must be >= 1"));
        }
        self.warm_start = true;
        self.init_iter = init_iter;
        Ok(self)
    }

    /// Overrides the L-BFGS history length.
    ///
    /// # Errors
    ///
    /// `memory` must be >= 1.
    pub const fn lbfgs_memory(mut self, memory: usize) -> Result<Self> {
        if memory == 0 {
            return Err(TricrfError::invalid_argument("memory must be >= 1"));
        }
        self.lbfgs_memory = memory;
        Ok(self)
    }

    /// Controls whether BOS transition slots are regularized; they are by
    /// default.
    #[must_use]
    pub const fn regularize_bias(mut self, regularize_bias: bool) -> Self {
        self.regularize_bias = regularize_bias;
        self
    }

    fn penalty_mask(&self, model: &Model) -> Option<Vec<bool>> {
        if self.regularize_bias {
            return None;
        }
        let mut mask = vec![false; model.n_params()];
        for slot in model.bias_slots() {
            mask[slot] = true;
        }
        Some(mask)
    }

    /// Estimates the weights of `model` on `dataset` and installs them.
    ///
    /// # Errors
    ///
    /// Propagates `NumericBreakdown` from the objective and
    /// `OptimizerFailed` from the line search.
    pub fn train(&self, model: &mut Model, dataset: &[TriSequence]) -> Result<()> {
        if dataset.is_empty() {
            return Err(TricrfError::invalid_argument("training set is empty"));
        }
        let l2_lambda = match self.regularization {
            Regularization::L2 => Some(1.0 / (self.sigma * self.sigma)),
            Regularization::L1 => None,
        };
        let mut weights = model.flat_weights();
        if self.warm_start {
            let loss = PseudoLikelihoodLoss::new(model, dataset, l2_lambda);
            weights = lbfgs::optimize(
                loss,
                weights,
                self.regularization,
                self.c,
                self.init_iter,
                self.lbfgs_memory,
            )?;
        }
        let loss = DatasetLoss::new(
            model,
            dataset,
            self.n_threads,
            l2_lambda,
            self.penalty_mask(model),
        );
        let weights = lbfgs::optimize(
            loss,
            weights,
            self.regularization,
            self.c,
            self.max_iter,
            self.lbfgs_memory,
        )?;
        model.install_weights(&weights);
        Ok(())
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::read_records;
    use crate::model::ModelKind;

    const TRI_CORPUS: &str = "\
T1 w=go\n\
a1 word=denver\n\
a2 word=to\n\
a1 word=boston\n\
\n\
T2 w=book\n\
b1 word=york\n\
b2 word=new\n\
\n\
T1 w=fly\n\
a2 word=to\n\
a1 word=denver\n";

    fn tri_model(kind: ModelKind) -> (Model, Vec<TriSequence>) {
        let records = read_records(TRI_CORPUS.as_bytes()).unwrap();
        let mut model = Model::new(kind);
        let dataset = model.read_train_records(&records).unwrap();
        model.finalize().unwrap();
        (model, dataset)
    }

    fn pseudo_random_params(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 2654435761) % 97) as f64 / 97.0 - 0.5).collect()
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        for kind in [
            ModelKind::Crf,
            ModelKind::TriShared,
            ModelKind::TriPartitioned { tied_k: 0.0 },
        ] {
            let (model, dataset) = tri_model(kind);
            let loss = DatasetLoss::new(&model, &dataset, 1, Some(0.25), None);
            let params = pseudo_random_params(model.n_params());
            let grad = loss.evaluate_gradient(&params).unwrap();

            let eps = 1e-5;
            for i in 0..params.len() {
                let mut plus = params.clone();
                plus[i] += eps;
                let mut minus = params.clone();
                minus[i] -= eps;
                let numeric = (loss.evaluate_cost(&plus).unwrap()
                    - loss.evaluate_cost(&minus).unwrap())
                    / (2.0 * eps);
                assert!(
                    (grad[i] - numeric).abs() <= 1e-4,
                    "slot {i}: analytic {} vs numeric {numeric}",
                    grad[i]
                );
            }
        }
    }

    #[test]
    fn test_pl_gradient_matches_finite_differences() {
        let (model, dataset) = tri_model(ModelKind::TriPartitioned { tied_k: 0.0 });
        let loss = PseudoLikelihoodLoss::new(&model, &dataset, Some(0.25));
        let params = pseudo_random_params(model.n_params());
        let mut grad = vec![0.0; params.len()];
        loss.evaluate(&params, Some(&mut grad)).unwrap();

        let eps = 1e-5;
        for i in 0..params.len() {
            let mut plus = params.clone();
            plus[i] += eps;
            let mut minus = params.clone();
            minus[i] -= eps;
            let numeric = (loss.evaluate(&plus, None).unwrap()
                - loss.evaluate(&minus, None).unwrap())
                / (2.0 * eps);
            assert!(
                (grad[i] - numeric).abs() <= 1e-4,
                "slot {i}: analytic {} vs numeric {numeric}",
                grad[i]
            );
        }
    }

    #[test]
    fn test_multithreaded_gradient_matches_single_thread() {
        let (model, dataset) = tri_model(ModelKind::TriShared);
        let params = pseudo_random_params(model.n_params());
        let single = DatasetLoss::new(&model, &dataset, 1, Some(0.1), None);
        let pooled = DatasetLoss::new(&model, &dataset, 4, Some(0.1), None);
        let g1 = single.evaluate_gradient(&params).unwrap();
        let g4 = pooled.evaluate_gradient(&params).unwrap();
        for (a, b) in g1.iter().zip(&g4) {
            assert!((a - b).abs() < 1e-12);
        }
        let c1 = single.evaluate_cost(&params).unwrap();
        let c4 = pooled.evaluate_cost(&params).unwrap();
        assert!((c1 - c4).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_cost_is_uniform_nll() {
        // With zero weights every path has equal probability, so the loss of
        // a sequence is log of the number of (topic, path) outcomes.
        let (model, dataset) = tri_model(ModelKind::TriShared);
        let loss = DatasetLoss::new(&model, &dataset, 1, None, None);
        let cost = loss.evaluate_cost(&vec![0.0; model.n_params()]).unwrap();
        // Topic T1 has 2 states, topic T2 has 2 states. A length-T record
        // has 2^T paths per topic.
        let expected: f64 = dataset
            .iter()
            .map(|seq| (2.0f64.powi(seq.len() as i32) * 2.0).ln())
            .sum();
        assert!((expected - cost).abs() < 1e-9);
    }

    #[test]
    fn test_training_reduces_loss_and_fits() {
        let (mut model, dataset) = tri_model(ModelKind::TriShared);
        let before = mean_log_likelihood(&model, &dataset, 1).unwrap();
        let trainer = Trainer::new().max_iter(50).unwrap().l2(5.0).unwrap();
        trainer.train(&mut model, &dataset).unwrap();
        let after = mean_log_likelihood(&model, &dataset, 1).unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_warm_start_runs() {
        let (mut model, dataset) = tri_model(ModelKind::TriPartitioned { tied_k: 0.0 });
        let before = mean_log_likelihood(&model, &dataset, 1).unwrap();
        let trainer = Trainer::new()
            .max_iter(20)
            .unwrap()
            .l2(5.0)
            .unwrap()
            .warm_start(5)
            .unwrap();
        trainer.train(&mut model, &dataset).unwrap();
        let after = mean_log_likelihood(&model, &dataset, 1).unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_empty_training_set_is_rejected() {
        let (mut model, _) = tri_model(ModelKind::TriShared);
        let trainer = Trainer::new();
        assert!(matches!(
            trainer.train(&mut model, &[]),
            Err(TricrfError::InvalidArgument(_))
        ));
    }
}
