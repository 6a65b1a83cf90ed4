//! Core data structures and the line-oriented corpus reader.
//!
//! Records are separated by blank lines. Inside a record, each
//! whitespace-separated line carries a label token followed by feature
//! tokens. A feature token whose suffix after the last `:` parses as a
//! number is split into a (name, value) pair; everything else is an opaque
//! binary feature.

use std::io::BufRead;

use crate::errors::Result;

/// Label id used at test time for gold labels absent from the dictionaries.
pub const UNSEEN_LABEL: u32 = u32::MAX;

/// A single observation: a gold label, an event weight, and the active
/// features as (feature id, value) pairs.
#[derive(Clone, Debug, Default)]
pub struct Event {
    /// Gold label id.
    pub label: u32,
    /// Event weight, usually 1.0.
    pub weight: f64,
    /// Active features; zero-valued features are absent.
    pub features: Vec<(u32, f64)>,
}

impl Event {
    /// Creates an event with unit weight.
    #[must_use]
    pub fn new(label: u32, features: Vec<(u32, f64)>) -> Self {
        Self {
            label,
            weight: 1.0,
            features,
        }
    }
}

/// An ordered, nonempty list of events.
pub type Sequence = Vec<Event>;

/// A sequence together with a record-level topic event.
///
/// The topic event carries the topic label and the sequence-level features
/// that inform the topic choice. Inner labels are interpreted within the
/// topic.
#[derive(Clone, Debug, Default)]
pub struct TriSequence {
    /// Record-level topic event.
    pub topic: Event,
    /// Per-position events.
    pub seq: Sequence,
}

impl TriSequence {
    /// Returns the number of positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// Returns `true` if the sequence has no positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// A raw input line: the label token, the feature tokens, and the 1-based
/// line number it was read from.
#[derive(Clone, Debug)]
pub struct RawLine {
    /// Leading label token.
    pub label: String,
    /// Feature tokens as (name, value) pairs.
    pub features: Vec<(String, f64)>,
    /// 1-based line number, for diagnostics.
    pub number: usize,
}

/// A blank-line-delimited block of raw lines.
pub type RawRecord = Vec<RawLine>;

/// Splits a feature token into its name and value.
///
/// The token is split at its last `:` when the suffix parses as a finite
/// number; otherwise the whole token is a binary feature with value 1.0.
/// Tokens containing `=` keep their literal form.
#[must_use]
pub fn split_feature(token: &str) -> (&str, f64) {
    if let Some(pos) = token.rfind(':') {
        let (name, suffix) = (&token[..pos], &token[pos + 1..]);
        if !name.is_empty() {
            if let Ok(value) = suffix.parse::<f64>() {
                if value.is_finite() {
                    return (name, value);
                }
            }
        }
    }
    (token, 1.0)
}

/// Reads all records from `reader`.
///
/// Lines that are empty after trimming separate records. Each remaining line
/// is tokenized on whitespace; token 0 is the label, the rest are features.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<RawRecord>> {
    let mut records = vec![];
    let mut current: RawRecord = vec![];
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(core::mem::take(&mut current));
            }
            continue;
        }
        let mut tokens = line.split_whitespace();
        let label = tokens.next().unwrap_or_default().to_string();
        let features = tokens
            .map(|tok| {
                let (name, value) = split_feature(tok);
                (name.to_string(), value)
            })
            .collect();
        current.push(RawLine {
            label,
            features,
            number: i + 1,
        });
    }
    if !current.is_empty() {
        records.push(current);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_feature_binary() {
        assert_eq!(("word=denver", 1.0), split_feature("word=denver"));
    }

    #[test]
    fn test_split_feature_weighted() {
        let (name, value) = split_feature("tfidf:0.25");
        assert_eq!("tfidf", name);
        assert!((0.25 - value).abs() < f64::EPSILON);
    }

    #[test]
    fn test_split_feature_last_colon_wins() {
        let (name, value) = split_feature("time=3:45:2.0");
        assert_eq!("time=3:45", name);
        assert!((2.0 - value).abs() < f64::EPSILON);
    }

    #[test]
    fn test_split_feature_unparsable_suffix() {
        assert_eq!(("time=3:45pm", 1.0), split_feature("time=3:45pm"));
    }

    #[test]
    fn test_split_feature_leading_colon() {
        assert_eq!((":1", 1.0), split_feature(":1"));
    }

    #[test]
    fn test_read_records_blank_line_delimited() {
        let text = "FLIGHT w=i w=go\nNONE word=i\nFROMLOC.CITY-B word=denver\n\n\
                    HOTEL w=book\nNONE word=book\n";
        let records = read_records(text.as_bytes()).unwrap();
        assert_eq!(2, records.len());
        assert_eq!(3, records[0].len());
        assert_eq!(2, records[1].len());
        assert_eq!("FLIGHT", records[0][0].label);
        assert_eq!(2, records[0][0].features.len());
        assert_eq!("HOTEL", records[1][0].label);
        assert_eq!(5, records[1][0].number);
    }

    #[test]
    fn test_read_records_trailing_record_without_blank() {
        let records = read_records("A f1\n\nB f2".as_bytes()).unwrap();
        assert_eq!(2, records.len());
        assert_eq!("B", records[1][0].label);
    }

    #[test]
    fn test_read_records_collapses_repeated_blanks() {
        let records = read_records("A f1\n\n\n\nB f2\n\n".as_bytes()).unwrap();
        assert_eq!(2, records.len());
    }
}
