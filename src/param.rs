//! Parameter store: string dictionaries, parameter slot tables, empirical
//! counts, and the inverted indexes consumed by the inference kernels.
//!
//! Every logical parameter occupies one slot of a dense weight vector.
//! Observation parameters couple a label with an active feature; transition
//! parameters couple two consecutive labels with a feature (the edge
//! sentinel for plain chains). Slots are assigned in insertion order and
//! never move, except for the optional tied-potential compaction performed
//! by [`ParamStore::end_update`].

use bincode::{
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use hashbrown::HashMap;

/// Feature name of the always-active edge sentinel.
pub const EDGE_FEATURE: &str = "<edge>";

/// An append-only, order-preserving string interner.
#[derive(Clone, Debug, Default)]
pub struct Dictionary {
    map: HashMap<String, u32>,
    entries: Vec<String>,
}

impl Dictionary {
    /// Returns the id for `key`, inserting it if absent.
    ///
    /// # Panics
    ///
    /// The number of entries must be less than 2^32.
    pub fn intern(&mut self, key: &str) -> u32 {
        if let Some(&id) = self.map.get(key) {
            return id;
        }
        let id = u32::try_from(self.entries.len()).unwrap();
        self.map.insert(key.to_string(), id);
        self.entries.push(key.to_string());
        id
    }

    /// Returns the id for `key` without inserting.
    #[inline(always)]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u32> {
        self.map.get(key).copied()
    }

    /// Returns the string for `id`.
    #[inline(always)]
    #[must_use]
    pub fn resolve(&self, id: u32) -> &str {
        &self.entries[usize::try_from(id).unwrap()]
    }

    /// Returns the number of entries.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the dictionary has no entries.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Encode for Dictionary {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.entries, encoder)
    }
}

impl Decode for Dictionary {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let entries: Vec<String> = Decode::decode(decoder)?;
        let mut map = HashMap::with_capacity(entries.len());
        for (i, key) in entries.iter().enumerate() {
            let id = u32::try_from(i)
                .map_err(|_| DecodeError::Other("dictionary too large"))?;
            if map.insert(key.clone(), id).is_some() {
                return Err(DecodeError::OtherString(format!(
                    "duplicate dictionary entry: {key}"
                )));
            }
        }
        Ok(Self { map, entries })
    }
}

/// A transition parameter as listed in the state index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransParam {
    /// Destination label, `None` for EOS.
    pub to: Option<u32>,
    /// Conditioning feature.
    pub fid: u32,
    /// Weight slot.
    pub slot: u32,
}

#[inline(always)]
fn row_of(from: Option<u32>) -> u32 {
    from.map_or(0, |y| y + 1)
}

#[inline(always)]
fn key_of(to: Option<u32>) -> u32 {
    to.map_or(0, |y| y + 1)
}

/// Owns the dictionaries, the weight and empirical-count vectors, and the
/// feature-to-parameter indexes for one factor family.
#[derive(Debug, Default)]
pub struct ParamStore {
    features: Dictionary,
    labels: Dictionary,
    label_freq: Vec<u64>,

    obs_slots: HashMap<(u32, u32), u32>,
    trans_slots: HashMap<(u32, u32, u32), u32>,

    weights: Vec<f64>,
    counts: Vec<f64>,

    obs_index: Vec<Vec<(u32, u32)>>,
    state_index: Vec<Vec<TransParam>>,

    default_label: u32,
    frozen: bool,
}

impl ParamStore {
    /// Creates an empty store. The edge sentinel is interned first, so its
    /// feature id is always 0.
    #[must_use]
    pub fn new() -> Self {
        let mut store = Self::default();
        store.features.intern(EDGE_FEATURE);
        store
    }

    /// Returns the feature id of the edge sentinel.
    #[inline(always)]
    #[must_use]
    pub fn edge_fid(&self) -> u32 {
        0
    }

    /// Returns the number of parameter slots.
    #[inline(always)]
    #[must_use]
    pub fn n_params(&self) -> usize {
        self.counts.len()
    }

    /// Returns the number of labels.
    #[inline(always)]
    #[must_use]
    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    /// Returns the number of features, the edge sentinel included.
    #[inline(always)]
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    /// Interns a label string.
    pub fn intern_label(&mut self, key: &str) -> u32 {
        debug_assert!(!self.frozen, "dictionaries are frozen");
        let id = self.labels.intern(key);
        if usize::try_from(id).unwrap() == self.label_freq.len() {
            self.label_freq.push(0);
        }
        id
    }

    /// Interns a feature string.
    pub fn intern_feature(&mut self, key: &str) -> u32 {
        debug_assert!(!self.frozen, "dictionaries are frozen");
        self.features.intern(key)
    }

    /// Looks up a label without inserting.
    #[inline(always)]
    #[must_use]
    pub fn label_id(&self, key: &str) -> Option<u32> {
        self.labels.get(key)
    }

    /// Looks up a feature without inserting.
    #[inline(always)]
    #[must_use]
    pub fn feature_id(&self, key: &str) -> Option<u32> {
        self.features.get(key)
    }

    /// Returns the string form of a label id.
    #[inline(always)]
    #[must_use]
    pub fn label_str(&self, id: u32) -> &str {
        self.labels.resolve(id)
    }

    /// Records one gold occurrence of label `y` for the default-label
    /// statistics.
    #[inline(always)]
    pub fn count_label(&mut self, y: u32) {
        self.label_freq[usize::try_from(y).unwrap()] += 1;
    }

    /// Returns the most frequent training-time label, the test-time
    /// fallback for labels outside the dictionary.
    #[inline(always)]
    #[must_use]
    pub fn default_label(&self) -> u32 {
        self.default_label
    }

    /// Returns the existing slot of the observation parameter `(y, fid)` or
    /// allocates the next one, then accumulates `fval` into its empirical
    /// count.
    pub fn bind_obs(&mut self, y: u32, fid: u32, fval: f64) -> u32 {
        debug_assert!(!self.frozen, "parameter layout is frozen");
        let counts = &mut self.counts;
        let slot = *self.obs_slots.entry((y, fid)).or_insert_with(|| {
            let slot = u32::try_from(counts.len()).unwrap();
            counts.push(0.0);
            slot
        });
        self.counts[usize::try_from(slot).unwrap()] += fval;
        slot
    }

    /// Returns the existing slot of the transition parameter
    /// `(from, to, fid)` or allocates the next one, then accumulates `fval`
    /// into its empirical count. `None` stands for BOS on the left and EOS
    /// on the right.
    pub fn bind_trans(&mut self, from: Option<u32>, to: Option<u32>, fid: u32, fval: f64) -> u32 {
        debug_assert!(!self.frozen, "parameter layout is frozen");
        let key = (row_of(from), key_of(to), fid);
        let counts = &mut self.counts;
        let slot = *self.trans_slots.entry(key).or_insert_with(|| {
            let slot = u32::try_from(counts.len()).unwrap();
            counts.push(0.0);
            slot
        });
        self.counts[usize::try_from(slot).unwrap()] += fval;
        slot
    }

    /// Looks up the slot of an observation parameter.
    #[inline(always)]
    #[must_use]
    pub fn obs_slot(&self, y: u32, fid: u32) -> Option<u32> {
        self.obs_slots.get(&(y, fid)).copied()
    }

    /// Looks up the slot of a transition parameter.
    #[inline(always)]
    #[must_use]
    pub fn trans_slot(&self, from: Option<u32>, to: Option<u32>, fid: u32) -> Option<u32> {
        self.trans_slots.get(&(row_of(from), key_of(to), fid)).copied()
    }

    /// Freezes the store: ties low-count transitions when `tied_k > 0`,
    /// allocates and zeroes the weight vector, builds the feature index and
    /// the state index, and fixes the default label.
    pub fn end_update(&mut self, tied_k: f64) {
        if tied_k > 0.0 {
            self.tie_transitions(tied_k);
        }
        self.weights = vec![0.0; self.counts.len()];
        self.build_indexes();
        self.default_label = self
            .label_freq
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.cmp(b).then(j.cmp(i)))
            .map_or(0, |(i, _)| u32::try_from(i).unwrap());
        self.frozen = true;
    }

    /// Merges every interior transition whose empirical count is below `k`
    /// into a single shared remainder slot, renumbering the survivors.
    /// BOS and EOS transitions always keep private slots.
    fn tie_transitions(&mut self, k: f64) {
        let mut remainder = vec![false; self.counts.len()];
        let mut n_remainder = 0usize;
        for (&(row, to_key, _), &slot) in &self.trans_slots {
            if row != 0 && to_key != 0 && self.counts[usize::try_from(slot).unwrap()] < k {
                remainder[usize::try_from(slot).unwrap()] = true;
                n_remainder += 1;
            }
        }
        if n_remainder == 0 {
            return;
        }
        let mut new_of = vec![0u32; self.counts.len()];
        let mut new_counts = Vec::with_capacity(self.counts.len() - n_remainder + 1);
        let mut tied_count = 0.0;
        for (slot, &rem) in remainder.iter().enumerate() {
            if rem {
                tied_count += self.counts[slot];
            } else {
                new_of[slot] = u32::try_from(new_counts.len()).unwrap();
                new_counts.push(self.counts[slot]);
            }
        }
        let tied_slot = u32::try_from(new_counts.len()).unwrap();
        new_counts.push(tied_count);
        for slot in self.obs_slots.values_mut() {
            *slot = new_of[usize::try_from(*slot).unwrap()];
        }
        for slot in self.trans_slots.values_mut() {
            let old = usize::try_from(*slot).unwrap();
            *slot = if remainder[old] { tied_slot } else { new_of[old] };
        }
        self.counts = new_counts;
    }

    fn build_indexes(&mut self) {
        self.obs_index = vec![vec![]; self.features.len()];
        for (&(y, fid), &slot) in &self.obs_slots {
            self.obs_index[usize::try_from(fid).unwrap()].push((y, slot));
        }
        for row in &mut self.obs_index {
            row.sort_unstable_by_key(|&(y, _)| y);
        }
        self.state_index = vec![vec![]; self.labels.len() + 1];
        for (&(row, to_key, fid), &slot) in &self.trans_slots {
            let to = to_key.checked_sub(1);
            self.state_index[usize::try_from(row).unwrap()].push(TransParam { to, fid, slot });
        }
        for row in &mut self.state_index {
            row.sort_unstable_by_key(|t| (key_of(t.to), t.fid));
        }
    }

    /// Observation parameters `(y, slot)` bound to feature `fid`, sorted by
    /// label.
    #[inline(always)]
    #[must_use]
    pub fn obs_params(&self, fid: u32) -> &[(u32, u32)] {
        &self.obs_index[usize::try_from(fid).unwrap()]
    }

    /// Transitions out of `from` (`None` for BOS), sorted by destination.
    #[inline(always)]
    #[must_use]
    pub fn transitions(&self, from: Option<u32>) -> &[TransParam] {
        &self.state_index[usize::try_from(row_of(from)).unwrap()]
    }

    /// Returns `true` if any transition parameter exists.
    #[inline(always)]
    #[must_use]
    pub fn has_transitions(&self) -> bool {
        !self.trans_slots.is_empty()
    }

    /// The frozen weight vector.
    #[inline(always)]
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Overwrites the weight vector, e.g. with the optimizer result.
    ///
    /// # Panics
    ///
    /// `weights` must have exactly `n_params` elements.
    pub fn set_weights(&mut self, weights: &[f64]) {
        assert_eq!(self.counts.len(), weights.len());
        self.weights.clear();
        self.weights.extend_from_slice(weights);
    }

    /// The empirical count vector, fixed once the training corpus is read.
    #[inline(always)]
    #[must_use]
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }
}

impl Encode for ParamStore {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let mut obs: Vec<(u32, u32, u32)> = self
            .obs_slots
            .iter()
            .map(|(&(y, fid), &slot)| (y, fid, slot))
            .collect();
        obs.sort_unstable();
        let mut trans: Vec<(u32, u32, u32, u32)> = self
            .trans_slots
            .iter()
            .map(|(&(row, to_key, fid), &slot)| (row, to_key, fid, slot))
            .collect();
        trans.sort_unstable();
        Encode::encode(&self.features, encoder)?;
        Encode::encode(&self.labels, encoder)?;
        Encode::encode(&self.weights, encoder)?;
        Encode::encode(&obs, encoder)?;
        Encode::encode(&trans, encoder)?;
        Encode::encode(&self.default_label, encoder)?;
        Ok(())
    }
}

impl Decode for ParamStore {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let features: Dictionary = Decode::decode(decoder)?;
        let labels: Dictionary = Decode::decode(decoder)?;
        let weights: Vec<f64> = Decode::decode(decoder)?;
        let obs: Vec<(u32, u32, u32)> = Decode::decode(decoder)?;
        let trans: Vec<(u32, u32, u32, u32)> = Decode::decode(decoder)?;
        let default_label: u32 = Decode::decode(decoder)?;

        let n_params = weights.len();
        let n_labels = u32::try_from(labels.len())
            .map_err(|_| DecodeError::Other("label table too large"))?;
        let n_features = u32::try_from(features.len())
            .map_err(|_| DecodeError::Other("feature table too large"))?;
        let mut obs_slots = HashMap::with_capacity(obs.len());
        for (y, fid, slot) in obs {
            if y >= n_labels || fid >= n_features || usize::try_from(slot).unwrap() >= n_params {
                return Err(DecodeError::Other("observation table out of range"));
            }
            if obs_slots.insert((y, fid), slot).is_some() {
                return Err(DecodeError::Other("duplicate observation parameter"));
            }
        }
        let mut trans_slots = HashMap::with_capacity(trans.len());
        for (row, to_key, fid, slot) in trans {
            if row > n_labels
                || to_key > n_labels
                || fid >= n_features
                || usize::try_from(slot).unwrap() >= n_params
            {
                return Err(DecodeError::Other("transition table out of range"));
            }
            if trans_slots.insert((row, to_key, fid), slot).is_some() {
                return Err(DecodeError::Other("duplicate transition parameter"));
            }
        }
        if !labels.is_empty() && default_label >= n_labels {
            return Err(DecodeError::Other("default label out of range"));
        }

        let mut store = Self {
            features,
            labels,
            label_freq: vec![],
            obs_slots,
            trans_slots,
            counts: vec![0.0; n_params],
            weights,
            obs_index: vec![],
            state_index: vec![],
            default_label,
            frozen: true,
        };
        store.build_indexes();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> ParamStore {
        let mut store = ParamStore::new();
        let a = store.intern_label("A");
        let b = store.intern_label("B");
        let f1 = store.intern_feature("f1");
        let f2 = store.intern_feature("f2");
        store.count_label(a);
        store.count_label(a);
        store.count_label(b);
        store.bind_obs(a, f1, 1.0);
        store.bind_obs(a, f1, 1.0);
        store.bind_obs(b, f2, 0.5);
        store.bind_trans(None, Some(a), store.edge_fid(), 1.0);
        store.bind_trans(Some(a), Some(b), store.edge_fid(), 1.0);
        store.bind_trans(Some(b), None, store.edge_fid(), 1.0);
        store
    }

    #[test]
    fn test_slot_assignment_is_stable() {
        let mut store = ParamStore::new();
        let a = store.intern_label("A");
        let f1 = store.intern_feature("f1");
        let f2 = store.intern_feature("f2");
        let s0 = store.bind_obs(a, f1, 1.0);
        let s1 = store.bind_obs(a, f2, 1.0);
        let s0_again = store.bind_obs(a, f1, 1.0);
        assert_eq!(0, s0);
        assert_eq!(1, s1);
        assert_eq!(s0, s0_again);
        assert_eq!(2, store.n_params());
    }

    #[test]
    fn test_counts_accumulate_feature_values() {
        let mut store = sample_store();
        store.end_update(0.0);
        let a = store.label_id("A").unwrap();
        let f1 = store.feature_id("f1").unwrap();
        let slot = store.obs_slot(a, f1).unwrap();
        assert!((2.0 - store.counts()[slot as usize]).abs() < f64::EPSILON);
        let b = store.label_id("B").unwrap();
        let f2 = store.feature_id("f2").unwrap();
        let slot = store.obs_slot(b, f2).unwrap();
        assert!((0.5 - store.counts()[slot as usize]).abs() < f64::EPSILON);
    }

    #[test]
    fn test_end_update_builds_sorted_indexes() {
        let mut store = sample_store();
        store.end_update(0.0);
        let a = store.label_id("A").unwrap();
        let b = store.label_id("B").unwrap();
        let f1 = store.feature_id("f1").unwrap();
        assert_eq!(
            vec![(a, store.obs_slot(a, f1).unwrap())],
            store.obs_params(f1).to_vec()
        );
        let bos = store.transitions(None);
        assert_eq!(1, bos.len());
        assert_eq!(Some(a), bos[0].to);
        let from_b = store.transitions(Some(b));
        assert_eq!(1, from_b.len());
        assert_eq!(None, from_b[0].to);
        assert_eq!(store.n_params(), store.weights().len());
        assert!(store.weights().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_default_label_is_most_frequent() {
        let mut store = sample_store();
        store.end_update(0.0);
        assert_eq!(store.label_id("A").unwrap(), store.default_label());
    }

    #[test]
    fn test_default_label_tie_breaks_low_id() {
        let mut store = ParamStore::new();
        let a = store.intern_label("A");
        let b = store.intern_label("B");
        store.count_label(b);
        store.count_label(a);
        store.end_update(0.0);
        assert_eq!(a, store.default_label());
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let mut first = sample_store();
        let mut second = sample_store();
        first.end_update(0.0);
        second.end_update(0.0);
        assert_eq!(first.counts(), second.counts());
        for from in [None, Some(0), Some(1)] {
            assert_eq!(first.transitions(from), second.transitions(from));
        }
        for fid in 0..u32::try_from(first.n_features()).unwrap() {
            assert_eq!(first.obs_params(fid), second.obs_params(fid));
        }
    }

    #[test]
    fn test_tied_potential_merges_rare_transitions() {
        let mut store = ParamStore::new();
        let a = store.intern_label("A");
        let b = store.intern_label("B");
        let edge = store.edge_fid();
        for _ in 0..5 {
            store.bind_trans(Some(a), Some(a), edge, 1.0);
        }
        store.bind_trans(Some(a), Some(b), edge, 1.0);
        store.bind_trans(Some(b), Some(a), edge, 1.0);
        store.bind_trans(None, Some(a), edge, 1.0);
        store.end_update(2.0);

        // a->b and b->a fall below the threshold and share one slot.
        let ab = store.trans_slot(Some(a), Some(b), edge).unwrap();
        let ba = store.trans_slot(Some(b), Some(a), edge).unwrap();
        assert_eq!(ab, ba);
        let aa = store.trans_slot(Some(a), Some(a), edge).unwrap();
        assert_ne!(aa, ab);
        // BOS transitions are never tied.
        let bos = store.trans_slot(None, Some(a), edge).unwrap();
        assert_ne!(bos, ab);
        // The shared slot accumulates both counts.
        assert!((2.0 - store.counts()[ab as usize]).abs() < f64::EPSILON);
        assert_eq!(4, store.n_params());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut store = sample_store();
        store.end_update(0.0);
        let mut weights: Vec<f64> = (0..store.n_params()).map(|i| i as f64 * 0.5).collect();
        weights[0] = -1.25;
        store.set_weights(&weights);

        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&store, config).unwrap();
        let (decoded, _): (ParamStore, usize) =
            bincode::decode_from_slice(&bytes, config).unwrap();

        assert_eq!(store.n_params(), decoded.n_params());
        assert_eq!(store.n_labels(), decoded.n_labels());
        assert_eq!(store.n_features(), decoded.n_features());
        assert_eq!(store.default_label(), decoded.default_label());
        assert_eq!(store.weights(), decoded.weights());
        for from in [None, Some(0), Some(1)] {
            assert_eq!(store.transitions(from), decoded.transitions(from));
        }
        for fid in 0..u32::try_from(store.n_features()).unwrap() {
            assert_eq!(store.obs_params(fid), decoded.obs_params(fid));
        }
    }
}
