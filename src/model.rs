//! Model variants and the assembled model.
//!
//! A model couples a topic-level parameter store with one or more
//! inner-factor stores. Flat kinds use a singleton topic; the partitioned
//! triangular kind keeps one inner store per topic, whose label and feature
//! ids are local and mapped to the global dictionaries through side tables.
//! Events carry global ids everywhere; the per-store remap tables built here
//! are what the inference kernels consume.

use std::io::{Read, Write};

use bincode::{Decode, Encode};
use hashbrown::HashSet;

use crate::data::{Event, RawLine, RawRecord, TriSequence, UNSEEN_LABEL};
use crate::errors::{Result, TricrfError};
use crate::param::{Dictionary, ParamStore};

/// Magic number.
const MODEL_MAGIC: &[u8; 4] = b"TCRF";

/// On-disk format version.
const MODEL_VERSION: u32 = 1;

/// Sentinel for absent entries in the remap tables.
pub const MISSING: u32 = u32::MAX;

/// Topic label used by the flat kinds.
const NO_TOPIC: &str = "<none>";

/// The factor-graph variant realized by a [`Model`].
#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq)]
pub enum ModelKind {
    /// Independent per-position classification: singleton topic, no
    /// transition factors.
    MaxEnt,

    /// Linear-chain CRF: singleton topic, edge-sentinel transitions.
    Crf,

    /// Triangular chain with one inner store shared across topics; topics
    /// differ in their legal label subsets and topic-level factors.
    TriShared,

    /// Triangular chain with one inner store per topic.
    TriPartitioned {
        /// Transitions observed fewer than `tied_k` times share one weight;
        /// 0 disables tying.
        tied_k: f64,
    },
}

impl ModelKind {
    /// Returns `true` for the kinds with a real topic variable.
    #[must_use]
    pub fn is_triangular(self) -> bool {
        matches!(self, Self::TriShared | Self::TriPartitioned { .. })
    }

    /// Returns `true` for the kinds with transition factors.
    #[must_use]
    pub fn has_transitions(self) -> bool {
        !matches!(self, Self::MaxEnt)
    }
}

/// Tally of dictionary misses during a lookup-only read.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupStats {
    /// Gold topics absent from the topic dictionary.
    pub unknown_topics: usize,
    /// Gold inner labels replaced by the default label.
    pub unknown_labels: usize,
    /// Features silently dropped.
    pub unknown_features: usize,
}

/// Borrowed view of one topic's factors, consumed by the inference kernels.
#[derive(Clone, Copy)]
pub struct TopicView<'a> {
    /// Topic id.
    pub z: u32,
    /// Inner-factor store backing this topic.
    pub store: &'a ParamStore,
    /// Legal inner states under this topic, as store-local label ids in
    /// ascending order.
    pub states: &'a [u32],
    /// Store-local label id to index into `states`, or [`MISSING`].
    pub state_pos: &'a [u32],
    /// Global feature id to store-local feature id, or [`MISSING`].
    pub fid_map: &'a [u32],
    /// Offset of this store's slots in the flattened parameter vector.
    pub offset: usize,
}

/// A trained or in-training model: dictionaries, stores, and mappings.
#[derive(Debug)]
pub struct Model {
    kind: ModelKind,
    labels: Dictionary,
    features: Dictionary,
    default_label: u32,
    topic_store: ParamStore,
    inner_stores: Vec<ParamStore>,
    state_sets: Vec<Vec<u32>>,

    // Derived tables, rebuilt by `finalize` and `read`.
    state_pos: Vec<Vec<u32>>,
    local_to_global: Vec<Vec<u32>>,
    global_to_local: Vec<Vec<u32>>,
    fid_maps: Vec<Vec<u32>>,
    inner_offsets: Vec<usize>,
    n_params: usize,

    // Training-only bookkeeping.
    label_freq: Vec<u64>,
    observed: Vec<HashSet<u32>>,
}

impl Model {
    /// Creates an empty model of the given kind.
    #[must_use]
    pub fn new(kind: ModelKind) -> Self {
        let mut model = Self {
            kind,
            labels: Dictionary::default(),
            features: Dictionary::default(),
            default_label: 0,
            topic_store: ParamStore::new(),
            inner_stores: vec![],
            state_sets: vec![],
            state_pos: vec![],
            local_to_global: vec![],
            global_to_local: vec![],
            fid_maps: vec![],
            inner_offsets: vec![],
            n_params: 0,
            label_freq: vec![],
            observed: vec![],
        };
        if kind.is_triangular() {
            if matches!(kind, ModelKind::TriShared) {
                model.inner_stores.push(ParamStore::new());
            }
        } else {
            model.topic_store.intern_label(NO_TOPIC);
            model.inner_stores.push(ParamStore::new());
            model.observed.push(HashSet::new());
        }
        model
    }

    /// Returns the model kind.
    #[must_use]
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Returns the number of topics; 1 for the flat kinds.
    #[must_use]
    pub fn n_topics(&self) -> usize {
        self.topic_store.n_labels()
    }

    /// Returns the total number of parameter slots across all stores.
    #[must_use]
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Returns the topic-level store.
    #[must_use]
    pub fn topic_store(&self) -> &ParamStore {
        &self.topic_store
    }

    /// Returns the global default inner label.
    #[must_use]
    pub fn default_label(&self) -> u32 {
        self.default_label
    }

    /// Returns the string form of a global inner label id.
    #[must_use]
    pub fn label_str(&self, gid: u32) -> &str {
        self.labels.resolve(gid)
    }

    /// Returns the string form of a topic id.
    #[must_use]
    pub fn topic_str(&self, z: u32) -> &str {
        self.topic_store.label_str(z)
    }

    fn store_index(&self, z: u32) -> usize {
        match self.kind {
            ModelKind::TriPartitioned { .. } => usize::try_from(z).unwrap(),
            _ => 0,
        }
    }

    /// Returns the kernel view of topic `z`.
    #[must_use]
    pub fn topic_view(&self, z: u32) -> TopicView {
        let si = self.store_index(z);
        TopicView {
            z,
            store: &self.inner_stores[si],
            states: &self.state_sets[usize::try_from(z).unwrap()],
            state_pos: &self.state_pos[usize::try_from(z).unwrap()],
            fid_map: &self.fid_maps[si],
            offset: self.inner_offsets[si],
        }
    }

    /// Maps a store-local label id under topic `z` to its global id.
    #[must_use]
    pub fn global_of(&self, z: u32, local: u32) -> u32 {
        self.local_to_global[self.store_index(z)][usize::try_from(local).unwrap()]
    }

    /// Maps a global inner label id to its local id under topic `z`.
    #[must_use]
    pub fn local_of(&self, z: u32, gid: u32) -> Option<u32> {
        let lid = self.global_to_local[self.store_index(z)][usize::try_from(gid).unwrap()];
        (lid != MISSING).then_some(lid)
    }

    /// Flat indices of the transition slots out of BOS across all inner
    /// stores, the slots optionally excluded from regularization.
    #[must_use]
    pub fn bias_slots(&self) -> Vec<usize> {
        let mut slots = vec![];
        for (store, &offset) in self.inner_stores.iter().zip(&self.inner_offsets) {
            for t in store.transitions(None) {
                slots.push(offset + usize::try_from(t.slot).unwrap());
            }
        }
        slots
    }

    /// Concatenates the weight vectors of all stores in offset order.
    #[must_use]
    pub fn flat_weights(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.n_params);
        flat.extend_from_slice(self.topic_store.weights());
        for store in &self.inner_stores {
            flat.extend_from_slice(store.weights());
        }
        flat
    }

    /// Concatenates the empirical-count vectors of all stores in offset
    /// order.
    #[must_use]
    pub fn flat_counts(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.n_params);
        flat.extend_from_slice(self.topic_store.counts());
        for store in &self.inner_stores {
            flat.extend_from_slice(store.counts());
        }
        flat
    }

    /// Distributes a flattened weight vector back into the stores.
    ///
    /// # Panics
    ///
    /// `flat` must have exactly `n_params` elements.
    pub fn install_weights(&mut self, flat: &[f64]) {
        assert_eq!(self.n_params, flat.len());
        let (head, mut rest) = flat.split_at(self.topic_store.n_params());
        self.topic_store.set_weights(head);
        for store in &mut self.inner_stores {
            let (head, tail) = rest.split_at(store.n_params());
            store.set_weights(head);
            rest = tail;
        }
    }

    fn ensure_topic(&mut self, z: u32) {
        let n = usize::try_from(z).unwrap() + 1;
        if self.observed.len() < n {
            self.observed.resize_with(n, HashSet::new);
        }
        if matches!(self.kind, ModelKind::TriPartitioned { .. }) {
            while self.inner_stores.len() < n {
                self.inner_stores.push(ParamStore::new());
            }
        }
    }

    fn bind_train_topic(&mut self, line: &RawLine) -> Event {
        let z = self.topic_store.intern_label(&line.label);
        self.topic_store.count_label(z);
        self.ensure_topic(z);
        let mut features = Vec::with_capacity(line.features.len());
        for (name, fval) in &line.features {
            let fid = self.topic_store.intern_feature(name);
            self.topic_store.bind_obs(z, fid, *fval);
            features.push((fid, *fval));
        }
        Event::new(z, features)
    }

    fn bind_train_position(&mut self, z: u32, line: &RawLine, prev: Option<u32>) -> (Event, u32) {
        let gid = self.labels.intern(&line.label);
        if usize::try_from(gid).unwrap() == self.label_freq.len() {
            self.label_freq.push(0);
        }
        self.label_freq[usize::try_from(gid).unwrap()] += 1;

        let mut features = Vec::with_capacity(line.features.len());
        for (name, fval) in &line.features {
            features.push((self.features.intern(name), *fval));
        }

        let si = self.store_index(z);
        let store = &mut self.inner_stores[si];
        let local = store.intern_label(&line.label);
        store.count_label(local);
        self.observed[usize::try_from(z).unwrap()].insert(local);
        for (name, fval) in &line.features {
            let lfid = store.intern_feature(name);
            store.bind_obs(local, lfid, *fval);
        }
        if self.kind.has_transitions() {
            let edge = store.edge_fid();
            store.bind_trans(prev, Some(local), edge, 1.0);
        }
        (Event::new(gid, features), local)
    }

    /// Converts raw training records into sequences, growing the
    /// dictionaries and accumulating the empirical counts.
    pub fn read_train_records(&mut self, records: &[RawRecord]) -> Result<Vec<TriSequence>> {
        let mut dataset = vec![];
        for record in records {
            if matches!(self.kind, ModelKind::MaxEnt) {
                for line in record {
                    let (event, _) = self.bind_train_position(0, line, None);
                    dataset.push(TriSequence {
                        topic: Event::new(0, vec![]),
                        seq: vec![event],
                    });
                }
                continue;
            }
            let (topic, positions) = if self.kind.is_triangular() {
                let (first, rest) = record.split_first().unwrap();
                if rest.is_empty() {
                    return Err(TricrfError::parse(
                        first.number,
                        "triangular record has no label lines after the topic line",
                    ));
                }
                (self.bind_train_topic(first), rest)
            } else {
                (Event::new(0, vec![]), &record[..])
            };
            let z = topic.label;
            let mut seq = Vec::with_capacity(positions.len());
            let mut prev = None;
            for line in positions {
                let (event, local) = self.bind_train_position(z, line, prev);
                prev = Some(local);
                seq.push(event);
            }
            let si = self.store_index(z);
            let store = &mut self.inner_stores[si];
            let edge = store.edge_fid();
            store.bind_trans(prev, None, edge, 1.0);
            dataset.push(TriSequence { topic, seq });
        }
        Ok(dataset)
    }

    /// Freezes all stores, fixes the per-topic state sets and the default
    /// label, and rebuilds the derived tables.
    pub fn finalize(&mut self) -> Result<()> {
        let tied_k = match self.kind {
            ModelKind::TriPartitioned { tied_k } => tied_k,
            _ => 0.0,
        };
        self.topic_store.end_update(0.0);
        for store in &mut self.inner_stores {
            store.end_update(tied_k);
        }
        self.state_sets = self
            .observed
            .iter()
            .map(|set| {
                let mut states: Vec<u32> = set.iter().copied().collect();
                states.sort_unstable();
                states
            })
            .collect();
        self.default_label = self
            .label_freq
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.cmp(b).then(j.cmp(i)))
            .map_or(0, |(i, _)| u32::try_from(i).unwrap());
        self.rebuild_tables()
    }

    fn lookup_test_topic(&self, line: &RawLine, stats: &mut LookupStats) -> Event {
        let z = self.topic_store.label_id(&line.label).unwrap_or_else(|| {
            stats.unknown_topics += 1;
            UNSEEN_LABEL
        });
        let mut features = Vec::with_capacity(line.features.len());
        for (name, fval) in &line.features {
            if let Some(fid) = self.topic_store.feature_id(name) {
                features.push((fid, *fval));
            } else {
                stats.unknown_features += 1;
            }
        }
        Event::new(z, features)
    }

    fn lookup_test_position(&self, line: &RawLine, stats: &mut LookupStats) -> Event {
        let gid = self.labels.get(&line.label).unwrap_or_else(|| {
            stats.unknown_labels += 1;
            self.default_label
        });
        let mut features = Vec::with_capacity(line.features.len());
        for (name, fval) in &line.features {
            if let Some(fid) = self.features.get(name) {
                features.push((fid, *fval));
            } else {
                stats.unknown_features += 1;
            }
        }
        Event::new(gid, features)
    }

    /// Converts raw records against the frozen dictionaries. Unknown
    /// features are dropped; unknown gold labels fall back to the default
    /// label; unknown gold topics are marked [`UNSEEN_LABEL`].
    pub fn read_test_records(
        &self,
        records: &[RawRecord],
    ) -> Result<(Vec<TriSequence>, LookupStats)> {
        let mut stats = LookupStats::default();
        let mut dataset = vec![];
        for record in records {
            if matches!(self.kind, ModelKind::MaxEnt) {
                for line in record {
                    let event = self.lookup_test_position(line, &mut stats);
                    dataset.push(TriSequence {
                        topic: Event::new(0, vec![]),
                        seq: vec![event],
                    });
                }
                continue;
            }
            let (topic, positions) = if self.kind.is_triangular() {
                let (first, rest) = record.split_first().unwrap();
                if rest.is_empty() {
                    return Err(TricrfError::parse(
                        first.number,
                        "triangular record has no label lines after the topic line",
                    ));
                }
                (self.lookup_test_topic(first, &mut stats), rest)
            } else {
                (Event::new(0, vec![]), &record[..])
            };
            let seq = positions
                .iter()
                .map(|line| self.lookup_test_position(line, &mut stats))
                .collect();
            dataset.push(TriSequence { topic, seq });
        }
        Ok((dataset, stats))
    }

    fn rebuild_tables(&mut self) -> Result<()> {
        let n_stores = self.inner_stores.len();
        self.local_to_global = Vec::with_capacity(n_stores);
        self.global_to_local = Vec::with_capacity(n_stores);
        self.fid_maps = Vec::with_capacity(n_stores);
        for store in &self.inner_stores {
            let mut l2g = Vec::with_capacity(store.n_labels());
            let mut g2l = vec![MISSING; self.labels.len()];
            for lid in 0..u32::try_from(store.n_labels()).unwrap() {
                let gid = self.labels.get(store.label_str(lid)).ok_or_else(|| {
                    TricrfError::corrupt_model("inner label missing from the global table")
                })?;
                l2g.push(gid);
                g2l[usize::try_from(gid).unwrap()] = lid;
            }
            let mut fid_map = vec![MISSING; self.features.len()];
            for gfid in 0..u32::try_from(self.features.len()).unwrap() {
                if let Some(lfid) = store.feature_id(self.features.resolve(gfid)) {
                    fid_map[usize::try_from(gfid).unwrap()] = lfid;
                }
            }
            self.local_to_global.push(l2g);
            self.global_to_local.push(g2l);
            self.fid_maps.push(fid_map);
        }

        if self.state_sets.len() != self.n_topics() {
            return Err(TricrfError::corrupt_model("state set count mismatch"));
        }
        self.state_pos = Vec::with_capacity(self.state_sets.len());
        for (z, states) in self.state_sets.iter().enumerate() {
            let store = &self.inner_stores[match self.kind {
                ModelKind::TriPartitioned { .. } => z,
                _ => 0,
            }];
            let mut pos = vec![MISSING; store.n_labels()];
            for (j, &lid) in states.iter().enumerate() {
                if usize::try_from(lid).unwrap() >= store.n_labels() {
                    return Err(TricrfError::corrupt_model("state set out of range"));
                }
                pos[usize::try_from(lid).unwrap()] = u32::try_from(j).unwrap();
            }
            self.state_pos.push(pos);
        }

        self.inner_offsets.clear();
        let mut offset = self.topic_store.n_params();
        for store in &self.inner_stores {
            self.inner_offsets.push(offset);
            offset += store.n_params();
        }
        self.n_params = offset;
        Ok(())
    }

    /// Writes the model: magic, version, kind, dictionaries, stores.
    pub fn write<W: Write>(&self, mut wtr: W) -> Result<()> {
        wtr.write_all(MODEL_MAGIC)?;
        let config = bincode::config::standard();
        bincode::encode_into_std_write(MODEL_VERSION, &mut wtr, config)?;
        bincode::encode_into_std_write(self.kind, &mut wtr, config)?;
        bincode::encode_into_std_write(&self.labels, &mut wtr, config)?;
        bincode::encode_into_std_write(&self.features, &mut wtr, config)?;
        bincode::encode_into_std_write(self.default_label, &mut wtr, config)?;
        bincode::encode_into_std_write(&self.topic_store, &mut wtr, config)?;
        bincode::encode_into_std_write(&self.inner_stores, &mut wtr, config)?;
        bincode::encode_into_std_write(&self.state_sets, &mut wtr, config)?;
        Ok(())
    }

    /// Reads a model back, verifying the header and rebuilding the derived
    /// tables deterministically.
    pub fn read<R: Read>(mut rdr: R) -> Result<Self> {
        let mut magic = [0; MODEL_MAGIC.len()];
        rdr.read_exact(&mut magic).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TricrfError::corrupt_model("truncated model file")
            } else {
                TricrfError::Io(e)
            }
        })?;
        if &magic != MODEL_MAGIC {
            return Err(TricrfError::corrupt_model("unrecognized magic number"));
        }
        let config = bincode::config::standard();
        let version: u32 = bincode::decode_from_std_read(&mut rdr, config)?;
        if version != MODEL_VERSION {
            return Err(TricrfError::corrupt_model(format!(
                "unsupported model version {version}"
            )));
        }
        let kind: ModelKind = bincode::decode_from_std_read(&mut rdr, config)?;
        let labels: Dictionary = bincode::decode_from_std_read(&mut rdr, config)?;
        let features: Dictionary = bincode::decode_from_std_read(&mut rdr, config)?;
        let default_label: u32 = bincode::decode_from_std_read(&mut rdr, config)?;
        let topic_store: ParamStore = bincode::decode_from_std_read(&mut rdr, config)?;
        let inner_stores: Vec<ParamStore> = bincode::decode_from_std_read(&mut rdr, config)?;
        let state_sets: Vec<Vec<u32>> = bincode::decode_from_std_read(&mut rdr, config)?;

        let expected_stores = match kind {
            ModelKind::TriPartitioned { .. } => topic_store.n_labels(),
            _ => 1,
        };
        if inner_stores.len() != expected_stores {
            return Err(TricrfError::corrupt_model("inner store count mismatch"));
        }
        if !labels.is_empty() && usize::try_from(default_label).unwrap() >= labels.len() {
            return Err(TricrfError::corrupt_model("default label out of range"));
        }

        let mut model = Self {
            kind,
            labels,
            features,
            default_label,
            topic_store,
            inner_stores,
            state_sets,
            state_pos: vec![],
            local_to_global: vec![],
            global_to_local: vec![],
            fid_maps: vec![],
            inner_offsets: vec![],
            n_params: 0,
            label_freq: vec![],
            observed: vec![],
        };
        model.rebuild_tables()?;
        Ok(model)
    }
}
