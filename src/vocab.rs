use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

use crate::desc::check_dims;
use crate::*;

/// How leaf weights are computed at build time and combined in `transform`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightingType {
    /// Term frequency times inverse document frequency.
    #[default]
    TfIdf,
    /// Term frequency, every word weighs 1.
    Tf,
    /// Inverse document frequency, counted once per image.
    Idf,
    /// Presence of a word, every word weighs 1.
    Binary,
}

impl WeightingType {
    /// Whether leaf weights come from training document frequencies.
    fn uses_idf(&self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Idf)
    }

    /// Whether repeated occurrences of a word add up.
    fn counts_occurrences(&self) -> bool {
        matches!(self, WeightingType::TfIdf | WeightingType::Tf)
    }
}

/// Parameters of a vocabulary build.
///
/// ```
/// use abow::{ScoringType, VocabularyParams};
///
/// let params = VocabularyParams::new(9, 3).with_scoring(ScoringType::L2Norm);
/// assert!(params.validate().is_ok());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VocabularyParams {
    /// Branching factor.
    pub k: usize,
    /// Max number of levels below the root.
    pub depth: usize,
    pub weighting: WeightingType,
    pub scoring: ScoringType,
    /// Cap on k-means relocation rounds per split.
    pub max_iterations: usize,
    /// Seed for k-means++ initialization. Equal seeds give equal trees.
    pub seed: u64,
}

impl Default for VocabularyParams {
    fn default() -> Self {
        Self {
            k: 10,
            depth: 5,
            weighting: WeightingType::TfIdf,
            scoring: ScoringType::L1Norm,
            max_iterations: 100,
            seed: 0,
        }
    }
}

impl VocabularyParams {
    pub fn new(k: usize, depth: usize) -> Self {
        Self {
            k,
            depth,
            ..Default::default()
        }
    }

    pub fn with_weighting(mut self, weighting: WeightingType) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringType) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> BowResult<()> {
        if self.k < 2 {
            return Err(BowErr::config(format!("branching factor must be >= 2, got {}", self.k)));
        }
        if self.depth < 1 {
            return Err(BowErr::config("depth must be >= 1"));
        }
        if self.max_iterations < 1 {
            return Err(BowErr::config("max_iterations must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A node of the vocabulary tree. Leaves (no children) are the words.
pub(crate) struct Node<D> {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: SmallVec<[NodeId; 10]>,
    pub(crate) descriptor: D,
    /// Nonzero only for leaves.
    pub(crate) weight: WordValue,
    pub(crate) word: Option<WordId>,
    /// Number of training descriptors that fell in this node.
    pub(crate) cluster_size: usize,
}

impl<D> Node<D> {
    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(PartialEq, Clone)]
/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Built from training images.
/// 2. Saved to a file & loaded from a file.
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get a [`FeatureVector`] from nodes to features).
///
/// Immutable once built, so it can be shared between threads freely.
pub struct Vocabulary<D> {
    pub(crate) nodes: Vec<Node<D>>,
    /// Leaf node of each word.
    pub(crate) words: Vec<NodeId>,
    pub(crate) k: usize,
    pub(crate) depth: usize,
    pub(crate) weighting: WeightingType,
    pub(crate) scoring: ScoringType,
    pub(crate) desc_bits: usize,
}

/// Vocabulary API
impl<D: Descriptor> Vocabulary<D> {
    /// Build a vocabulary from training images, each given as its set of descriptors.
    ///
    /// Descriptors of all images are pooled for clustering; image boundaries
    /// only matter for the document frequencies behind IDF weights.
    pub fn build<S>(training: &[S], params: VocabularyParams) -> BowResult<Self>
    where
        S: AsRef<[D]> + Sync,
    {
        Builder::new(params, None).run(training)
    }

    /// Same as [`Vocabulary::build`], but gives up with [`BowErr::Cancelled`]
    /// once `cancel` is set.
    pub fn build_cancellable<S>(
        training: &[S],
        params: VocabularyParams,
        cancel: &AtomicBool,
    ) -> BowResult<Self>
    where
        S: AsRef<[D]> + Sync,
    {
        Builder::new(params, Some(cancel)).run(training)
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary, normalized as the scoring type requires.
    pub fn transform(&self, features: &[D]) -> BowResult<BowVector> {
        self.transform_generic(features, None).map(|(bow, _)| bow)
    }

    /// Transform a set of descriptors into its bag of words representation
    /// with respect to the Vocabulary.
    ///
    /// Also provides the direct index: for each node at `level` (the root
    /// being level 0), the indices of the features that went through it.
    /// Features reaching a leaf above `level` are recorded at that leaf.
    pub fn transform_with_direct_idx(
        &self,
        features: &[D],
        level: u32,
    ) -> BowResult<(BowVector, FeatureVector)> {
        self.check_level(level)?;
        self.transform_generic(features, Some(level))
    }

    /// Word and weight of a single descriptor.
    pub fn quantize(&self, feature: &D) -> BowResult<(WordId, WordValue)> {
        check_dims(std::slice::from_ref(feature), self.desc_bits)?;
        let (leaf, _) = self.descend(feature, None);
        let node = &self.nodes[leaf as usize];
        node.word.map(|w| (w, node.weight)).ok_or(BowErr::NotBuilt)
    }

    /// Similarity of two bag-of-words vectors under this vocabulary's scoring type.
    pub fn score(&self, a: &BowVector, b: &BowVector) -> WordValue {
        self.scoring.score(a, b)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn weighting(&self) -> WeightingType {
        self.weighting
    }

    pub fn scoring(&self) -> ScoringType {
        self.scoring
    }

    /// Length in bits of the descriptors this vocabulary accepts.
    pub fn descriptor_bits(&self) -> usize {
        self.desc_bits
    }

    pub fn word_weight(&self, word: WordId) -> Option<WordValue> {
        self.words.get(word as usize).map(|&n| self.nodes[n as usize].weight)
    }

    /// Cluster center of a word.
    pub fn word_descriptor(&self, word: WordId) -> Option<&D> {
        self.words
            .get(word as usize)
            .map(|&n| &self.nodes[n as usize].descriptor)
    }

    /// Ancestor of a word's leaf `levels_up` levels above it, stopping at the root.
    pub fn parent_node(&self, word: WordId, levels_up: u32) -> Option<NodeId> {
        let mut id = *self.words.get(word as usize)?;
        for _ in 0..levels_up {
            match self.nodes[id as usize].parent {
                Some(p) => id = p,
                None => break,
            }
        }
        Some(id)
    }

    /// All words below `node`, in ascending order.
    pub fn words_from_node(&self, node: NodeId) -> Vec<WordId> {
        let mut words = Vec::new();
        if node as usize >= self.nodes.len() {
            return words;
        }
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let n = &self.nodes[id as usize];
            match n.word {
                Some(w) => words.push(w),
                None => stack.extend(n.children.iter().rev()),
            }
        }
        words
    }

    /// Summary of the tree shape and training cluster sizes.
    pub fn stats(&self) -> VocabStats {
        let sizes: Vec<usize> = self
            .words
            .iter()
            .map(|&n| self.nodes[n as usize].cluster_size)
            .collect();
        let total = sizes.iter().sum::<usize>();
        VocabStats {
            words: self.words.len(),
            nodes: self.nodes.len(),
            depth: self.depth,
            k: self.k,
            training_features: total,
            min_word_cluster: sizes.iter().copied().min().unwrap_or(0),
            max_word_cluster: sizes.iter().copied().max().unwrap_or(0),
            mean_word_cluster: total.checked_div(sizes.len()).unwrap_or(0),
        }
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl<D: Descriptor> Vocabulary<D> {
    fn transform_generic(
        &self,
        features: &[D],
        di_level: Option<u32>,
    ) -> BowResult<(BowVector, FeatureVector)> {
        check_dims(features, self.desc_bits)?;
        let mut bow = BowVector::new();
        let mut direct_idx = FeatureVector::new();
        let accumulate = self.weighting.counts_occurrences();

        for (i, feature) in features.iter().enumerate() {
            let (leaf, di_node) = self.descend(feature, di_level);
            let node = &self.nodes[leaf as usize];
            if let Some(word) = node.word {
                if accumulate {
                    bow.add_weight(word, node.weight);
                } else {
                    bow.add_if_absent(word, node.weight);
                }
            }
            if let Some(n) = di_node {
                direct_idx.add_feature(n, i);
            }
        }

        if let Some(norm) = self.scoring.norm() {
            bow.normalize(norm);
        }
        Ok((bow, direct_idx))
    }

    /// Walk from the root to a leaf, picking the nearest child at every step
    /// (ties go to the first child). Returns the leaf and the node passed at
    /// `di_level`, if requested.
    fn descend(&self, feature: &D, di_level: Option<u32>) -> (NodeId, Option<NodeId>) {
        let mut id: NodeId = 0;
        let mut level = 0;
        let mut di_node = None;
        loop {
            if di_level == Some(level) {
                di_node = Some(id);
            }
            let node = &self.nodes[id as usize];
            if node.is_leaf() {
                if di_level.is_some() && di_node.is_none() {
                    di_node = Some(id);
                }
                return (id, di_node);
            }
            let mut best = (u32::MAX, node.children[0]);
            for &child in node.children.iter() {
                let d = feature.distance(&self.nodes[child as usize].descriptor);
                if d < best.0 {
                    best = (d, child);
                }
            }
            id = best.1;
            level += 1;
        }
    }

    pub(crate) fn check_level(&self, level: u32) -> BowResult<()> {
        if level as usize > self.depth {
            return Err(BowErr::config(format!(
                "direct index level {} is below the tree depth {}",
                level, self.depth
            )));
        }
        Ok(())
    }

    /// Enumerate leaves left to right, giving them dense word ids.
    pub(crate) fn assign_words(&mut self) {
        self.words.clear();
        let mut stack: Vec<NodeId> = vec![0];
        while let Some(id) = stack.pop() {
            let node = &mut self.nodes[id as usize];
            if node.is_leaf() {
                node.word = Some(self.words.len() as WordId);
                self.words.push(id);
            } else {
                node.word = None;
                stack.extend(node.children.iter().rev());
            }
        }
    }

    /// Set leaf weights from the training images.
    fn assign_weights<S>(&mut self, training: &[S])
    where
        S: AsRef<[D]> + Sync,
    {
        if !self.weighting.uses_idf() {
            for &n in self.words.iter() {
                self.nodes[n as usize].weight = 1.;
            }
            return;
        }

        let n_images = training.len() as WordValue;
        let voc: &Self = self;
        let image_words: Vec<Vec<WordId>> = training
            .par_iter()
            .map(|image| {
                let mut words: Vec<WordId> = image
                    .as_ref()
                    .iter()
                    .filter_map(|f| voc.nodes[voc.descend(f, None).0 as usize].word)
                    .collect();
                words.sort_unstable();
                words.dedup();
                words
            })
            .collect();

        let mut doc_freq = vec![0usize; self.words.len()];
        for w in image_words.iter().flatten() {
            doc_freq[*w as usize] += 1;
        }
        for (&n, &df) in self.words.iter().zip(doc_freq.iter()) {
            // words no training image reaches are pruned from scoring
            self.nodes[n as usize].weight = if df == 0 {
                0.
            } else {
                (n_images / df as WordValue).ln()
            };
        }
    }
}

/// Recursive hierarchical k-means over the pooled training descriptors.
struct Builder<'c, D> {
    params: VocabularyParams,
    rng: StdRng,
    nodes: Vec<Node<D>>,
    cancel: Option<&'c AtomicBool>,
}

impl<'c, D: Descriptor> Builder<'c, D> {
    fn new(params: VocabularyParams, cancel: Option<&'c AtomicBool>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(params.seed),
            params,
            nodes: Vec::new(),
            cancel,
        }
    }

    fn run<S>(mut self, training: &[S]) -> BowResult<Vocabulary<D>>
    where
        S: AsRef<[D]> + Sync,
    {
        self.params.validate()?;

        let pool: Vec<&D> = training.iter().flat_map(|i| i.as_ref().iter()).collect();
        let desc_bits = match pool.first() {
            Some(d) => d.bit_len(),
            None => return Err(BowErr::config("training corpus has no descriptors")),
        };
        if let Some(d) = pool.iter().find(|d| d.bit_len() != desc_bits) {
            return Err(BowErr::DimensionMismatch {
                expected: desc_bits,
                found: d.bit_len(),
            });
        }
        debug!(
            images = training.len(),
            features = pool.len(),
            k = self.params.k,
            depth = self.params.depth,
            "building vocabulary"
        );

        // Start with root of tree
        let root = D::mean(&pool)?.ok_or_else(|| BowErr::config("empty training corpus"))?;
        self.nodes.push(Node {
            parent: None,
            children: SmallVec::new(),
            descriptor: root,
            weight: 0.,
            word: None,
            cluster_size: pool.len(),
        });

        // Build with recursive k-means clustering of features
        let depth = self.params.depth;
        self.grow(0, pool, depth)?;

        let mut voc = Vocabulary {
            nodes: self.nodes,
            words: Vec::new(),
            k: self.params.k,
            depth: self.params.depth,
            weighting: self.params.weighting,
            scoring: self.params.scoring,
            desc_bits,
        };
        voc.assign_words();
        voc.assign_weights(training);
        debug!(
            words = voc.num_words(),
            nodes = voc.num_nodes(),
            "vocabulary built"
        );
        Ok(voc)
    }

    /// Split `subset` below `parent`. The parent stays a leaf when the
    /// subset cannot be split any further.
    fn grow(&mut self, parent: NodeId, subset: Vec<&D>, remaining: usize) -> BowResult<()> {
        if remaining == 0 || subset.len() <= 1 {
            return Ok(());
        }
        trace!(
            features = subset.len(),
            parent,
            level = self.params.depth - remaining,
            "kmeans step"
        );

        let groups = self.cluster(&subset)?;
        if groups.len() < 2 {
            return Ok(());
        }

        let first_child = self.nodes.len() as NodeId;
        for group in groups.iter() {
            let descriptor = D::mean(group)?.unwrap_or_else(|| group[0].clone());
            let id = self.nodes.len() as NodeId;
            self.nodes.push(Node {
                parent: Some(parent),
                children: SmallVec::new(),
                descriptor,
                weight: 0.,
                word: None,
                cluster_size: group.len(),
            });
            self.nodes[parent as usize].children.push(id);
        }

        // Recurse
        for (i, group) in groups.into_iter().enumerate() {
            self.grow(first_child + i as NodeId, group, remaining - 1)?;
        }
        Ok(())
    }

    /// Partition `features` into at most k nonempty groups.
    fn cluster<'a>(&mut self, features: &[&'a D]) -> BowResult<Vec<Vec<&'a D>>> {
        if features.len() <= self.params.k {
            // Only one distinct feature per cluster
            let mut groups: Vec<Vec<&D>> = Vec::new();
            for &f in features {
                match groups.iter_mut().find(|g| g[0] == f) {
                    Some(g) => g.push(f),
                    None => groups.push(vec![f]),
                }
            }
            return Ok(groups);
        }

        // Proceed with kmeans clustering
        let mut centroids = self.initialize_clusters(features);
        let mut assignments: Vec<usize> = Vec::new();
        let mut groups: Vec<Vec<&D>> = Vec::new();

        for _ in 0..self.params.max_iterations {
            self.check_cancel()?;
            let new_assignments: Vec<usize> = features
                .par_iter()
                .map(|f| nearest(&centroids, *f))
                .collect();

            if new_assignments == assignments {
                break; // converged
            }
            assignments = new_assignments;

            groups = vec![Vec::new(); centroids.len()];
            for (&f, &a) in features.iter().zip(assignments.iter()) {
                groups[a].push(f);
            }

            // update clusters, empty ones keep their centroid
            for (c, g) in centroids.iter_mut().zip(groups.iter()) {
                if let Some(m) = D::mean(g)? {
                    *c = m;
                }
            }
        }

        groups.retain(|g| !g.is_empty());
        Ok(groups)
    }

    /// k-means++ initialization: every new centroid is drawn with probability
    /// proportional to its squared distance to the nearest chosen one.
    fn initialize_clusters(&mut self, features: &[&D]) -> Vec<D> {
        let mut centroids: Vec<D> = Vec::with_capacity(self.params.k);
        let first = features[self.rng.gen_range(0..features.len())];
        centroids.push(first.clone());

        let mut min_dist: Vec<f64> = features
            .par_iter()
            .map(|f| sq(f.distance(first)))
            .collect();

        while centroids.len() < self.params.k {
            let total: f64 = min_dist.iter().sum();
            if total <= 0. {
                // every feature coincides with a centroid
                break;
            }
            let threshold = self.rng.gen::<f64>() * total;
            let mut pick = min_dist.iter().rposition(|&d| d > 0.).unwrap_or(0);
            let mut cumulative = 0.;
            for (i, &d) in min_dist.iter().enumerate() {
                cumulative += d;
                if d > 0. && cumulative >= threshold {
                    pick = i;
                    break;
                }
            }

            let c = features[pick].clone();
            min_dist
                .par_iter_mut()
                .zip(features.par_iter())
                .for_each(|(m, f)| *m = m.min(sq(f.distance(&c))));
            centroids.push(c);
        }
        centroids
    }

    fn check_cancel(&self) -> BowResult<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(BowErr::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Index of the nearest centroid, ties going to the lowest index.
#[inline]
fn nearest<D: Descriptor>(centroids: &[D], f: &D) -> usize {
    let mut best: (usize, u32) = (0, u32::MAX);
    for (j, c) in centroids.iter().enumerate() {
        let d = f.distance(c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best.0
}

#[inline]
fn sq(d: u32) -> f64 {
    let d = d as f64;
    d * d
}

/// Shape of a vocabulary and sizes of its word clusters in the training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabStats {
    pub words: usize,
    pub nodes: usize,
    pub depth: usize,
    pub k: usize,
    pub training_features: usize,
    pub min_word_cluster: usize,
    pub max_word_cluster: usize,
    pub mean_word_cluster: usize,
}

impl<D: Descriptor> fmt::Debug for Vocabulary<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &stats.words)
            .field("Other Nodes", &(stats.nodes - stats.words))
            .field("Levels", &stats.depth)
            .field("Branching Factor", &stats.k)
            .field("Weighting", &self.weighting)
            .field("Scoring", &self.scoring)
            .field("Total Training Features", &stats.training_features)
            .field("Min Word Cluster Size", &stats.min_word_cluster)
            .field("Max Word Cluster Size", &stats.max_word_cluster)
            .field("Mean Word Cluster Size", &stats.mean_word_cluster)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type D4 = [u8; 4];

    /// Images made of noisy copies of a few well separated prototypes.
    fn corpus(n_images: usize, per_image: usize, seed: u64) -> Vec<Vec<D4>> {
        let protos: [D4; 4] = [
            [0x00, 0x00, 0x00, 0x00],
            [0xff, 0xff, 0x00, 0x00],
            [0x00, 0x00, 0xff, 0xff],
            [0xff, 0xff, 0xff, 0xff],
        ];
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n_images)
            .map(|i| {
                (0..per_image)
                    .map(|j| {
                        let mut d = protos[(i + j) % protos.len()];
                        let bit = rng.gen_range(0..32);
                        d[bit / 8] ^= 0x80 >> (bit % 8);
                        d
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn rejects_bad_params() {
        let training = corpus(2, 4, 1);
        for params in [
            VocabularyParams::new(1, 3),
            VocabularyParams::new(4, 0),
            VocabularyParams::new(4, 3).with_max_iterations(0),
        ] {
            assert!(matches!(
                Vocabulary::build(&training, params),
                Err(BowErr::Configuration(_))
            ));
        }
        let empty: Vec<Vec<D4>> = vec![vec![], vec![]];
        assert!(matches!(
            Vocabulary::build(&empty, VocabularyParams::new(2, 2)),
            Err(BowErr::Configuration(_))
        ));
    }

    #[test]
    fn rejects_mixed_lengths() {
        let training = vec![vec![vec![0u8; 4], vec![0u8; 8]]];
        assert!(matches!(
            Vocabulary::build(&training, VocabularyParams::new(2, 2)),
            Err(BowErr::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn tree_invariants() {
        let training = corpus(6, 20, 7);
        let voc = Vocabulary::build(&training, VocabularyParams::new(3, 3)).unwrap();
        assert!(voc.num_words() >= 1 && voc.num_words() <= 27);

        let mut leaves = 0;
        for (id, node) in voc.nodes.iter().enumerate() {
            for &c in node.children.iter() {
                assert_eq!(voc.nodes[c as usize].parent, Some(id as NodeId));
            }
            assert!(node.children.len() <= 3);
            if node.is_leaf() {
                leaves += 1;
                assert!(node.weight >= 0.);
                assert!(node.word.is_some());
            } else {
                assert_eq!(node.weight, 0.);
                assert!(node.word.is_none());
            }
        }
        assert_eq!(leaves, voc.num_words());
        assert_eq!(voc.nodes[0].parent, None);
    }

    #[test]
    fn words_are_numbered_left_to_right() {
        let training = corpus(4, 16, 3);
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 3)).unwrap();
        let all = voc.words_from_node(0);
        let expected: Vec<WordId> = (0..voc.num_words() as WordId).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn same_seed_same_tree() {
        let training = corpus(4, 12, 5);
        let params = VocabularyParams::new(3, 2).with_seed(42);
        let a = Vocabulary::build(&training, params.clone()).unwrap();
        let b = Vocabulary::build(&training, params).unwrap();
        assert!(a == b);
    }

    #[test]
    fn idf_weights_follow_document_frequency() {
        let a: D4 = [0x00; 4];
        let b: D4 = [0xff; 4];
        let training = vec![vec![a], vec![a], vec![b]];
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 1)).unwrap();
        assert_eq!(voc.num_words(), 2);
        let (wa, weight_a) = voc.quantize(&a).unwrap();
        let (wb, weight_b) = voc.quantize(&b).unwrap();
        assert_ne!(wa, wb);
        assert!((weight_a - (3f64 / 2.).ln()).abs() < 1e-12);
        assert!((weight_b - 3f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn presence_weighting_counts_each_word_once() {
        let a: D4 = [0x00; 4];
        let b: D4 = [0xff; 4];
        let training = vec![vec![a], vec![a], vec![b]];
        for (weighting, expected_a, expected_b) in [
            (WeightingType::Idf, (3f64 / 2.).ln(), 3f64.ln()),
            (WeightingType::Binary, 1., 1.),
            (WeightingType::Tf, 3., 1.),
        ] {
            // dot product scoring leaves the vector unnormalized
            let params = VocabularyParams::new(2, 1)
                .with_weighting(weighting)
                .with_scoring(ScoringType::DotProduct);
            let voc = Vocabulary::build(&training, params).unwrap();
            let (wa, weight_a) = voc.quantize(&a).unwrap();
            let (wb, weight_b) = voc.quantize(&b).unwrap();
            if weighting == WeightingType::Idf {
                assert!((weight_a - expected_a).abs() < 1e-12);
                assert!((weight_b - expected_b).abs() < 1e-12);
            }

            let v = voc.transform(&[a, a, b, a]).unwrap();
            assert_eq!(v.len(), 2);
            assert!((v.get(wa).unwrap() - expected_a).abs() < 1e-12, "{:?}", weighting);
            assert!((v.get(wb).unwrap() - expected_b).abs() < 1e-12, "{:?}", weighting);
        }
    }

    #[test]
    fn words_in_every_image_are_pruned() {
        let a: D4 = [0x00; 4];
        let b: D4 = [0xff; 4];
        let training = vec![vec![a, b], vec![a]];
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 1)).unwrap();
        assert_eq!(voc.quantize(&a).unwrap().1, 0.);
        // a query made only of pruned words is empty
        assert!(voc.transform(&[a, a]).unwrap().is_empty());
    }

    #[test]
    fn uniform_weighting() {
        let training = corpus(3, 8, 9);
        let params = VocabularyParams::new(2, 2).with_weighting(WeightingType::Binary);
        let voc = Vocabulary::build(&training, params).unwrap();
        for w in 0..voc.num_words() as WordId {
            assert_eq!(voc.word_weight(w), Some(1.));
        }
    }

    #[test]
    fn identical_features_make_a_single_word() {
        let training = vec![vec![[0x5au8; 4]; 10]];
        let voc = Vocabulary::build(&training, VocabularyParams::new(3, 3)).unwrap();
        assert_eq!(voc.num_words(), 1);
        assert_eq!(voc.num_nodes(), 1);
    }

    #[test]
    fn transform_self_score_is_one() {
        let training = corpus(5, 20, 11);
        let voc = Vocabulary::build(&training, VocabularyParams::new(3, 2)).unwrap();
        for image in training.iter() {
            let v = voc.transform(image).unwrap();
            if !v.is_empty() {
                assert!((voc.score(&v, &v) - 1.).abs() < 1e-6);
                let sum: WordValue = v.iter().map(|(_, w)| w).sum();
                assert!((sum - 1.).abs() < 1e-9);
            }
        }
        assert!(voc.transform(&[]).unwrap().is_empty());
    }

    #[test]
    fn transform_checks_dimensions() {
        let training = vec![vec![vec![0u8; 4], vec![0xffu8; 4]]];
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 1)).unwrap();
        assert!(matches!(
            voc.transform(&[vec![0u8; 2]]),
            Err(BowErr::DimensionMismatch {
                expected: 32,
                found: 16
            })
        ));
    }

    #[test]
    fn direct_index_groups_features_by_node() {
        let training = corpus(4, 16, 13);
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 3)).unwrap();
        let (bow, fv) = voc.transform_with_direct_idx(&training[0], 1).unwrap();
        assert_eq!(bow, voc.transform(&training[0]).unwrap());

        let mut seen: Vec<usize> = fv.iter().flat_map(|(_, f)| f.iter().copied()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..training[0].len()).collect::<Vec<_>>());
        for (node, _) in fv.iter() {
            assert_eq!(voc.nodes[node as usize].parent, Some(0));
        }

        assert!(matches!(
            voc.transform_with_direct_idx(&training[0], 4),
            Err(BowErr::Configuration(_))
        ));
    }

    #[test]
    fn parent_node_climbs_to_root() {
        let training = corpus(4, 16, 17);
        let voc = Vocabulary::build(&training, VocabularyParams::new(2, 3)).unwrap();
        for w in 0..voc.num_words() as WordId {
            assert_eq!(voc.parent_node(w, 0), Some(voc.words[w as usize]));
            assert_eq!(voc.parent_node(w, 10), Some(0));
            let p = voc.parent_node(w, 1).unwrap();
            assert!(voc.words_from_node(p).contains(&w));
        }
        assert_eq!(voc.parent_node(voc.num_words() as WordId, 1), None);
    }

    #[test]
    fn cancelled_build() {
        let training = corpus(4, 40, 19);
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            Vocabulary::build_cancellable(&training, VocabularyParams::new(3, 3), &cancel),
            Err(BowErr::Cancelled)
        ));
    }

    #[test]
    fn stats_count_training_features() {
        let training = corpus(3, 10, 23);
        let voc = Vocabulary::build(&training, VocabularyParams::new(3, 2)).unwrap();
        let stats = voc.stats();
        assert_eq!(stats.training_features, 30);
        assert_eq!(stats.words, voc.num_words());
        assert!(stats.min_word_cluster <= stats.max_word_cluster);
        assert!(format!("{:?}", voc).contains("Word/Leaf Nodes"));
    }
}
