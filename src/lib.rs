//! # tricrf
//!
//! Triangular-chain Conditional Random Fields implemented in pure Rust.
//!
//! Each record carries a topic label for the whole sequence and a
//! fine-grained label per position whose legal values depend on the topic.
//! The same log-space forward-backward engine drives four factor graphs:
//! a maximum-entropy classifier, a linear-chain CRF, and the triangular
//! chain with either shared or topic-partitioned sequence parameters.
//!
//! ## Examples
//!
//! ```
//! # fn main() -> Result<(), tricrf::TricrfError> {
//! use tricrf::data::read_records;
//! use tricrf::viterbi::Decoder;
//! use tricrf::{Model, ModelKind, Trainer};
//!
//! // A one-record corpus with a single chunk.
//! let corpus = "X-B f=a\nX-I f=b\nO f=c\n";
//! let records = read_records(corpus.as_bytes())?;
//!
//! let mut model = Model::new(ModelKind::Crf);
//! let dataset = model.read_train_records(&records)?;
//! model.finalize()?;
//!
//! let trainer = Trainer::new().max_iter(30)?.l2(5.0)?;
//! trainer.train(&mut model, &dataset)?;
//!
//! // Decoding the training record recovers the annotation.
//! let (test, _) = model.read_test_records(&records)?;
//! let mut decoder = Decoder::new(&model, false);
//! let decoded = decoder.decode(&test[0]);
//! let labels: Vec<&str> = decoded.path.iter().map(|&y| model.label_str(y)).collect();
//! assert_eq!(vec!["X-B", "X-I", "O"], labels);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod data;
pub mod errors;
pub mod evaluate;
pub mod forward_backward;
pub mod math;
pub mod model;
pub mod optimizers;
pub mod param;
pub mod trainer;
pub mod viterbi;

pub use errors::{Result, TricrfError};
pub use model::{Model, ModelKind};
pub use trainer::{Regularization, Trainer};
