//! Line-oriented `key = value` configuration files.
//!
//! `#` starts a comment, values may span multiple tokens, and the
//! recognized keys mirror the command-line flags. Key checking is the
//! caller's job via [`Config::validate`], since only the driver knows the
//! flag set.

use std::io::BufRead;

use hashbrown::HashMap;

use crate::errors::{Result, TricrfError};

/// A parsed configuration file.
#[derive(Debug, Default)]
pub struct Config {
    entries: HashMap<String, (String, usize)>,
}

impl Config {
    /// Parses `reader`.
    ///
    /// # Errors
    ///
    /// Lines without `=` or with an empty key are a `Parse` error carrying
    /// the line number.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = HashMap::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => &line[..],
            };
            if line.trim().is_empty() {
                continue;
            }
            let number = i + 1;
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| TricrfError::parse(number, "expected `key = value`"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(TricrfError::parse(number, "empty key"));
            }
            entries.insert(key.to_string(), (value.trim().to_string(), number));
        }
        Ok(Self { entries })
    }

    /// Returns the value of `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|(value, _)| value.as_str())
    }

    /// Returns the line number `key` was read from, if present.
    #[must_use]
    pub fn line(&self, key: &str) -> Option<usize> {
        self.entries.get(key).map(|&(_, number)| number)
    }

    /// Rejects entries outside the `allowed` key set.
    ///
    /// # Errors
    ///
    /// An unknown key is a `Parse` error carrying its line number.
    pub fn validate(&self, allowed: &[&str]) -> Result<()> {
        let mut unknown: Option<(&str, usize)> = None;
        for (key, &(_, number)) in &self.entries {
            if !allowed.contains(&key.as_str()) {
                match unknown {
                    Some((_, seen)) if seen <= number => {}
                    _ => unknown = Some((key, number)),
                }
            }
        }
        match unknown {
            Some((key, number)) => Err(TricrfError::parse(number, format!("unknown key `{key}`"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let text = "# training setup\nmode = both\nmodel-type = TriCRF1\niter = 50\n\ntrain = data/atis train.txt\n";
        let config = Config::parse(text.as_bytes()).unwrap();
        assert_eq!(Some("both"), config.get("mode"));
        assert_eq!(Some("TriCRF1"), config.get("model-type"));
        assert_eq!(Some("50"), config.get("iter"));
        // Multi-token values keep their inner whitespace.
        assert_eq!(Some("data/atis train.txt"), config.get("train"));
        assert_eq!(None, config.get("missing"));
    }

    #[test]
    fn test_trailing_comment_stripped() {
        let config = Config::parse("l2 = 20 # prior sigma\n".as_bytes()).unwrap();
        assert_eq!(Some("20"), config.get("l2"));
    }

    #[test]
    fn test_missing_equals_is_parse_error() {
        let err = Config::parse("mode both\n".as_bytes()).unwrap_err();
        assert!(matches!(err, TricrfError::Parse(_)));
        assert_eq!(2, err.exit_code());
    }

    #[test]
    fn test_validate_rejects_unknown_keys() {
        let config = Config::parse("mode = both\nbogus = 1\n".as_bytes()).unwrap();
        assert!(config.validate(&["mode"]).is_err());
        assert!(config.validate(&["mode", "bogus"]).is_ok());
    }
}
