//! Max-product decoding over the joint (topic, label) lattice.
//!
//! For every topic the decoder runs the Viterbi recursion over the topic's
//! state list and keeps the reconstructed path of the best-scoring topic.
//! Ties break toward the lowest topic id, then the lowest state index.

use crate::data::TriSequence;
use crate::forward_backward::{
    compute_lattice, conditional_marginals, fill_factors, fill_gamma, topic_posteriors, Scratch,
};
use crate::model::Model;

/// The decode result for one sequence.
#[derive(Clone, Debug)]
pub struct Decoded {
    /// Winning topic id.
    pub topic: u32,
    /// Joint score of the winning topic and path.
    pub score: f64,
    /// Best label path as global inner label ids.
    pub path: Vec<u32>,
    /// Posterior quantities, present when confidence output is requested.
    pub confidence: Option<DecodeConfidence>,
}

/// Posterior quantities attached to a decode when confidence is requested.
#[derive(Clone, Debug)]
pub struct DecodeConfidence {
    /// `P(z* | x)` of the winning topic.
    pub topic_posterior: f64,
    /// `P(y_t | x, z*)` of the chosen label at each position.
    pub marginals: Vec<f64>,
}

/// A reusable decoder over a frozen model.
pub struct Decoder<'a> {
    model: &'a Model,
    params: Vec<f64>,
    confidence: bool,
    gamma: Vec<f64>,
    r: Vec<Vec<f64>>,
    m: Vec<Vec<f64>>,
    pi: Vec<f64>,
    tau: Vec<f64>,
    scratch: Scratch,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder; `confidence` enables posterior output.
    #[must_use]
    pub fn new(model: &'a Model, confidence: bool) -> Self {
        Self {
            model,
            params: model.flat_weights(),
            confidence,
            gamma: vec![],
            r: vec![],
            m: vec![],
            pi: vec![],
            tau: vec![],
            scratch: Scratch::new(),
        }
    }

    /// Decodes one sequence.
    pub fn decode(&mut self, seq: &TriSequence) -> Decoded {
        let t_len = seq.len();
        fill_gamma(self.model, &self.params, seq, &mut self.gamma);

        let mut best_score = f64::NEG_INFINITY;
        let mut best_topic = 0u32;
        let mut best_path: Vec<usize> = vec![];
        for z in 0..self.model.n_topics() {
            let z = u32::try_from(z).unwrap();
            let view = self.model.topic_view(z);
            let n = view.states.len();
            fill_factors(
                &view,
                &self.params,
                seq,
                &mut self.r,
                &mut self.m,
                &mut self.pi,
                &mut self.tau,
            );

            let mut delta = vec![vec![f64::NEG_INFINITY; n]; t_len];
            let mut back = vec![vec![0usize; n]; t_len];
            for j in 0..n {
                delta[0][j] = self.r[0][j] + self.pi[j];
            }
            for t in 1..t_len {
                for j in 0..n {
                    let mut arg = 0;
                    let mut max = f64::NEG_INFINITY;
                    for j2 in 0..n {
                        let score = delta[t - 1][j2] + self.m[j2][j];
                        if score > max {
                            max = score;
                            arg = j2;
                        }
                    }
                    delta[t][j] = self.r[t][j] + max;
                    back[t][j] = arg;
                }
            }
            let mut last = 0;
            let mut max = f64::NEG_INFINITY;
            for j in 0..n {
                let score = delta[t_len - 1][j] + self.tau[j];
                if score > max {
                    max = score;
                    last = j;
                }
            }
            let score = self.gamma[usize::try_from(z).unwrap()] + max;
            if score > best_score {
                best_score = score;
                best_topic = z;
                let mut path = vec![0usize; t_len];
                let mut j = last;
                for t in (0..t_len).rev() {
                    path[t] = j;
                    j = back[t][j];
                }
                best_path = path;
            }
        }

        let view = self.model.topic_view(best_topic);
        let path: Vec<u32> = best_path
            .iter()
            .map(|&j| self.model.global_of(best_topic, view.states[j]))
            .collect();

        let confidence = self.confidence.then(|| {
            let z_star = compute_lattice(self.model, &self.params, seq, &mut self.scratch);
            let posteriors = topic_posteriors(&self.scratch, self.model.n_topics(), z_star);
            let marginals =
                conditional_marginals(&self.scratch, usize::try_from(best_topic).unwrap(), t_len);
            DecodeConfidence {
                topic_posterior: posteriors[usize::try_from(best_topic).unwrap()],
                marginals: best_path
                    .iter()
                    .enumerate()
                    .map(|(t, &j)| marginals[t][j])
                    .collect(),
            }
        });

        Decoded {
            topic: best_topic,
            score: best_score,
            path,
            confidence,
        }
    }
}
