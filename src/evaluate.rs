//! Applying a model to labeled data: prediction output and accuracy
//! tallies.
//!
//! Chunk metrics follow the B/I segmentation convention; both the
//! `NAME-B`/`NAME-I` suffix form and the `B-NAME`/`I-NAME` prefix form are
//! recognized.

use std::io::Write;

use hashbrown::HashSet;

use crate::data::TriSequence;
use crate::errors::Result;
use crate::model::Model;
use crate::viterbi::Decoder;

/// Accumulated match counts of one evaluation run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Evaluation {
    /// Number of positions.
    pub token_total: usize,
    /// Positions whose predicted label equals the gold label.
    pub token_correct: usize,
    /// Number of records.
    pub seq_total: usize,
    /// Records whose full label path matches.
    pub seq_correct: usize,
    /// Records counted for topic accuracy (triangular kinds only).
    pub topic_total: usize,
    /// Records whose predicted topic matches the gold topic.
    pub topic_correct: usize,
    /// Gold chunks.
    pub chunk_gold: usize,
    /// Predicted chunks.
    pub chunk_pred: usize,
    /// Chunks matching in span and kind.
    pub chunk_match: usize,
}

impl Evaluation {
    /// Per-token accuracy.
    #[must_use]
    pub fn token_accuracy(&self) -> f64 {
        ratio(self.token_correct, self.token_total)
    }

    /// Whole-path accuracy.
    #[must_use]
    pub fn sequence_accuracy(&self) -> f64 {
        ratio(self.seq_correct, self.seq_total)
    }

    /// Topic accuracy; 0 for flat kinds.
    #[must_use]
    pub fn topic_accuracy(&self) -> f64 {
        ratio(self.topic_correct, self.topic_total)
    }

    /// Chunk precision.
    #[must_use]
    pub fn precision(&self) -> f64 {
        ratio(self.chunk_match, self.chunk_pred)
    }

    /// Chunk recall.
    #[must_use]
    pub fn recall(&self) -> f64 {
        ratio(self.chunk_match, self.chunk_gold)
    }

    /// Chunk F1.
    #[must_use]
    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

enum Boundary<'a> {
    Begin(&'a str),
    Inside(&'a str),
    Outside,
}

fn boundary(label: &str) -> Boundary {
    if let Some(kind) = label.strip_suffix("-B") {
        return Boundary::Begin(kind);
    }
    if let Some(kind) = label.strip_suffix("-I") {
        return Boundary::Inside(kind);
    }
    if let Some(kind) = label.strip_prefix("B-") {
        return Boundary::Begin(kind);
    }
    if let Some(kind) = label.strip_prefix("I-") {
        return Boundary::Inside(kind);
    }
    Boundary::Outside
}

/// Extracts `(start, end, kind)` chunks with exclusive ends. An inside tag
/// without a matching open chunk starts a new one.
fn extract_chunks<'a>(labels: &[&'a str]) -> Vec<(usize, usize, &'a str)> {
    let mut chunks = vec![];
    let mut open: Option<(usize, &'a str)> = None;
    for (i, &label) in labels.iter().enumerate() {
        match boundary(label) {
            Boundary::Begin(kind) => {
                if let Some((start, k)) = open.take() {
                    chunks.push((start, i, k));
                }
                open = Some((i, kind));
            }
            Boundary::Inside(kind) => match open {
                Some((_, k)) if k == kind => {}
                _ => {
                    if let Some((start, k)) = open.take() {
                        chunks.push((start, i, k));
                    }
                    open = Some((i, kind));
                }
            },
            Boundary::Outside => {
                if let Some((start, k)) = open.take() {
                    chunks.push((start, i, k));
                }
            }
        }
    }
    if let Some((start, k)) = open {
        chunks.push((start, labels.len(), k));
    }
    chunks
}

/// Decodes every sequence, optionally writing predictions to `output`, and
/// returns the accumulated counts.
///
/// The output carries one line per position with the predicted label, and
/// for triangular kinds a leading line per record with the predicted topic;
/// confidence mode appends the posterior to each line. Records are
/// separated by blank lines.
pub fn evaluate(
    model: &Model,
    sequences: &[TriSequence],
    confidence: bool,
    mut output: Option<&mut dyn Write>,
) -> Result<Evaluation> {
    let mut decoder = Decoder::new(model, confidence);
    let mut eval = Evaluation::default();
    for seq in sequences {
        let decoded = decoder.decode(seq);

        eval.seq_total += 1;
        let mut all_match = true;
        for (event, &pred) in seq.seq.iter().zip(&decoded.path) {
            eval.token_total += 1;
            if event.label == pred {
                eval.token_correct += 1;
            } else {
                all_match = false;
            }
        }
        if all_match {
            eval.seq_correct += 1;
        }
        if model.kind().is_triangular() {
            eval.topic_total += 1;
            if seq.topic.label == decoded.topic {
                eval.topic_correct += 1;
            }
        }

        let gold_labels: Vec<&str> = seq.seq.iter().map(|e| model.label_str(e.label)).collect();
        let pred_labels: Vec<&str> = decoded.path.iter().map(|&g| model.label_str(g)).collect();
        let gold_chunks = extract_chunks(&gold_labels);
        let pred_chunks = extract_chunks(&pred_labels);
        eval.chunk_gold += gold_chunks.len();
        eval.chunk_pred += pred_chunks.len();
        let gold_set: HashSet<_> = gold_chunks.iter().collect();
        eval.chunk_match += pred_chunks.iter().filter(|c| gold_set.contains(c)).count();

        if let Some(out) = output.as_deref_mut() {
            if model.kind().is_triangular() {
                match &decoded.confidence {
                    Some(c) => writeln!(
                        out,
                        "{}\t{:.6}",
                        model.topic_str(decoded.topic),
                        c.topic_posterior
                    )?,
                    None => writeln!(out, "{}", model.topic_str(decoded.topic))?,
                }
            }
            for (t, label) in pred_labels.iter().enumerate() {
                match &decoded.confidence {
                    Some(c) => writeln!(out, "{}\t{:.6}", label, c.marginals[t])?,
                    None => writeln!(out, "{label}")?,
                }
            }
            writeln!(out)?;
        }
    }
    Ok(eval)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::read_records;
    use crate::model::ModelKind;
    use crate::trainer::Trainer;

    #[test]
    fn test_chunks_suffix_convention() {
        let labels = ["CITY-B", "CITY-I", "NONE", "DATE-B"];
        let chunks = extract_chunks(&labels);
        assert_eq!(vec![(0, 2, "CITY"), (3, 4, "DATE")], chunks);
    }

    #[test]
    fn test_chunks_prefix_convention() {
        let labels = ["B-X", "I-X", "O", "I-Y"];
        let chunks = extract_chunks(&labels);
        assert_eq!(vec![(0, 2, "X"), (3, 4, "Y")], chunks);
    }

    #[test]
    fn test_chunks_kind_change_splits() {
        let labels = ["X-B", "Y-I", "Y-I"];
        let chunks = extract_chunks(&labels);
        assert_eq!(vec![(0, 1, "X"), (1, 3, "Y")], chunks);
    }

    #[test]
    fn test_evaluation_counts_on_trained_chain() {
        let corpus = "X-B f=a\nX-I f=b\nO f=c\n";
        let records = read_records(corpus.as_bytes()).unwrap();
        let mut model = Model::new(ModelKind::Crf);
        let dataset = model.read_train_records(&records).unwrap();
        model.finalize().unwrap();
        let trainer = Trainer::new().max_iter(30).unwrap().l2(5.0).unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        let mut buffer = vec![];
        let eval = evaluate(&model, &dataset, false, Some(&mut buffer as &mut dyn Write)).unwrap();
        assert_eq!(3, eval.token_total);
        assert_eq!(3, eval.token_correct);
        assert_eq!(1, eval.seq_correct);
        assert_eq!(1, eval.chunk_match);
        assert!((1.0 - eval.f1()).abs() < f64::EPSILON);
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!("X-B\nX-I\nO\n\n", text);
    }

    #[test]
    fn test_confidence_output_appends_posteriors() {
        let corpus = "T1 w=fly\na1 x=p\n\nT2 w=book\nb1 x=q\n";
        let records = read_records(corpus.as_bytes()).unwrap();
        let mut model = Model::new(ModelKind::TriShared);
        let dataset = model.read_train_records(&records).unwrap();
        model.finalize().unwrap();
        let trainer = Trainer::new().max_iter(20).unwrap().l2(5.0).unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        let mut buffer = vec![];
        let eval = evaluate(&model, &dataset, true, Some(&mut buffer as &mut dyn Write)).unwrap();
        assert_eq!(2, eval.topic_total);
        let text = String::from_utf8(buffer).unwrap();
        for record in text.trim_end().split("\n\n") {
            for line in record.lines() {
                let mut fields = line.split('\t');
                assert!(fields.next().is_some());
                let p: f64 = fields.next().unwrap().parse().unwrap();
                assert!((0.0..=1.0).contains(&p));
            }
        }
    }
}
