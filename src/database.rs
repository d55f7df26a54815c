use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::*;

/// An image stored in a [`Database`].
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseEntry {
    pub(crate) id: ImageId,
    pub(crate) bow: BowVector,
    pub(crate) features: Option<FeatureVector>,
    pub(crate) external_ref: Option<String>,
}

impl DatabaseEntry {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn bow_vector(&self) -> &BowVector {
        &self.bow
    }

    /// Direct index of the image, present when the database keeps one.
    pub fn feature_vector(&self) -> Option<&FeatureVector> {
        self.features.as_ref()
    }

    /// Caller supplied reference, e.g. a file name or frame id.
    pub fn external_ref(&self) -> Option<&str> {
        self.external_ref.as_deref()
    }
}

/// One ranked match of a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub id: ImageId,
    pub score: WordValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Maximum number of results. 0 returns every candidate.
    pub max_results: usize,
    /// Only consider images with an id up to this one.
    pub max_id: Option<ImageId>,
}

impl QueryOptions {
    pub fn top(max_results: usize) -> Self {
        Self {
            max_results,
            max_id: None,
        }
    }

    pub fn with_max_id(mut self, max_id: ImageId) -> Self {
        self.max_id = Some(max_id);
        self
    }
}

/// Posting of an inverted file: an image and the weight of the word in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Posting {
    pub(crate) image: ImageId,
    pub(crate) weight: WordValue,
}

/// Image database with an inverted file over the words of a vocabulary.
///
/// `add` and `erase` take `&mut self` and `query` takes `&self`, so a single
/// writer excludes readers. [`SharedDatabase`] packages that behind a lock.
pub struct Database<D> {
    voc: Option<Arc<Vocabulary<D>>>,
    pub(crate) entries: BTreeMap<ImageId, DatabaseEntry>,
    /// Postings of every word, in ascending image id order.
    inverted: Vec<Vec<Posting>>,
    pub(crate) direct_index: Option<u32>,
    pub(crate) next_id: ImageId,
}

impl<D: Descriptor> Database<D> {
    /// Create an empty database on `voc`.
    ///
    /// When `direct_index` is `Some(level)`, every added image also keeps the
    /// features grouped by the tree node they passed at `level`.
    pub fn new(voc: impl Into<Arc<Vocabulary<D>>>, direct_index: Option<u32>) -> BowResult<Self> {
        let mut db = Self::without_vocabulary(direct_index);
        db.set_vocabulary(voc)?;
        Ok(db)
    }

    /// Create a database with no vocabulary yet. Adding and querying fail
    /// with [`BowErr::NotBuilt`] until [`Database::set_vocabulary`] is called.
    pub fn without_vocabulary(direct_index: Option<u32>) -> Self {
        Self {
            voc: None,
            entries: BTreeMap::new(),
            inverted: Vec::new(),
            direct_index,
            next_id: 0,
        }
    }

    /// Replace the vocabulary. Stored entries are dropped since their word
    /// ids belong to the old vocabulary.
    pub fn set_vocabulary(&mut self, voc: impl Into<Arc<Vocabulary<D>>>) -> BowResult<()> {
        let voc = voc.into();
        if let Some(level) = self.direct_index {
            voc.check_level(level)?;
        }
        self.inverted = vec![Vec::new(); voc.num_words()];
        self.entries.clear();
        self.voc = Some(voc);
        Ok(())
    }

    pub fn vocabulary(&self) -> Option<&Arc<Vocabulary<D>>> {
        self.voc.as_ref()
    }

    /// Level of the direct index, if one is kept.
    pub fn direct_index_level(&self) -> Option<u32> {
        self.direct_index
    }

    /// Vectorize `features` and store them as a new image.
    pub fn add(&mut self, features: &[D]) -> BowResult<ImageId> {
        self.add_with_ref(features, None)
    }

    /// Same as [`Database::add`], attaching a caller reference to the entry.
    pub fn add_with_ref(
        &mut self,
        features: &[D],
        external_ref: Option<String>,
    ) -> BowResult<ImageId> {
        let voc = self.voc()?;
        let (bow, fv) = match self.direct_index {
            Some(level) => {
                let (bow, fv) = voc.transform_with_direct_idx(features, level)?;
                (bow, Some(fv))
            }
            None => (voc.transform(features)?, None),
        };
        self.add_bow(bow, fv, external_ref)
    }

    /// Store an already computed bag-of-words vector as a new image.
    pub fn add_bow(
        &mut self,
        bow: BowVector,
        features: Option<FeatureVector>,
        external_ref: Option<String>,
    ) -> BowResult<ImageId> {
        let id = self.next_id;
        self.insert(DatabaseEntry {
            id,
            bow,
            features: if self.direct_index.is_some() { features } else { None },
            external_ref,
        })?;
        debug!(id, "image added");
        Ok(id)
    }

    /// Rank stored images by similarity to `features`. `max_results` of 0
    /// returns every image sharing at least one word with the query.
    pub fn query(&self, features: &[D], max_results: usize) -> BowResult<Vec<QueryResult>> {
        self.query_with(features, QueryOptions::top(max_results))
    }

    pub fn query_with(&self, features: &[D], opts: QueryOptions) -> BowResult<Vec<QueryResult>> {
        let bow = self.voc()?.transform(features)?;
        self.query_bow(&bow, opts)
    }

    /// Rank stored images by similarity to an already computed vector.
    ///
    /// Results are sorted by descending score, ties by ascending image id.
    pub fn query_bow(&self, bow: &BowVector, opts: QueryOptions) -> BowResult<Vec<QueryResult>> {
        let scorer = self.voc()?.scoring().scorer(bow);
        let max_id = opts.max_id.unwrap_or(ImageId::MAX);

        // only images sharing a word with the query can score above 0
        let mut acc: HashMap<ImageId, WordValue> = HashMap::new();
        for (word, qv) in bow.iter() {
            let postings = match self.inverted.get(word as usize) {
                Some(p) => p,
                None => continue,
            };
            for p in postings.iter().take_while(|p| p.image <= max_id) {
                *acc.entry(p.image).or_insert(0.) += scorer.contribution(qv, p.weight);
            }
        }
        trace!(words = bow.len(), candidates = acc.len(), "query");

        let mut results: Vec<QueryResult> = acc
            .into_iter()
            .map(|(id, sum)| QueryResult {
                id,
                score: scorer.finish(sum),
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        if opts.max_results > 0 {
            results.truncate(opts.max_results);
        }
        Ok(results)
    }

    /// Remove an image and its postings. Its id is never handed out again.
    pub fn erase(&mut self, id: ImageId) -> BowResult<()> {
        let entry = self.entries.remove(&id).ok_or(BowErr::NotFound(id))?;
        for (word, _) in entry.bow.iter() {
            if let Some(postings) = self.inverted.get_mut(word as usize) {
                postings.retain(|p| p.image != id);
            }
        }
        debug!(id, "image erased");
        Ok(())
    }

    /// Remove every image. Ids keep increasing from where they were.
    pub fn clear(&mut self) {
        self.entries.clear();
        for postings in self.inverted.iter_mut() {
            postings.clear();
        }
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: ImageId) -> Option<&DatabaseEntry> {
        self.entries.get(&id)
    }

    /// Ids of the stored images, ascending.
    pub fn ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.entries.keys().copied()
    }

    /// Id the next added image will get.
    pub fn next_id(&self) -> ImageId {
        self.next_id
    }

    fn voc(&self) -> BowResult<&Vocabulary<D>> {
        self.voc.as_deref().ok_or(BowErr::NotBuilt)
    }

    /// Append an entry and its postings. The entry id must be above every
    /// stored id so that posting lists stay sorted.
    /// Weights must be finite and positive, and word and node ids must
    /// exist in the vocabulary.
    pub(crate) fn insert(&mut self, entry: DatabaseEntry) -> BowResult<()> {
        let voc = self.voc()?;
        let (num_words, num_nodes) = (voc.num_words(), voc.num_nodes());
        if entry.id < self.next_id {
            return Err(BowErr::config(format!("image id {} was already used", entry.id)));
        }
        let next_id = entry
            .id
            .checked_add(1)
            .ok_or_else(|| BowErr::config("image ids are exhausted"))?;
        if let Some((word, _)) = entry.bow.iter().find(|&(w, _)| w as usize >= num_words) {
            return Err(BowErr::config(format!(
                "word {} is outside the vocabulary ({} words)",
                word, num_words
            )));
        }
        let bad_weight = entry.bow.iter().find(|&(_, v)| !(v.is_finite() && v > 0.));
        if let Some((word, weight)) = bad_weight {
            return Err(BowErr::config(format!("word {} has weight {}", word, weight)));
        }
        if let Some(fv) = entry.features.as_ref() {
            if let Some((node, _)) = fv.iter().find(|&(n, _)| n as usize >= num_nodes) {
                return Err(BowErr::config(format!(
                    "node {} is outside the vocabulary ({} nodes)",
                    node, num_nodes
                )));
            }
        }

        for (word, weight) in entry.bow.iter() {
            self.inverted[word as usize].push(Posting {
                image: entry.id,
                weight,
            });
        }
        self.next_id = next_id;
        self.entries.insert(entry.id, entry);
        Ok(())
    }
}

impl<D: Descriptor> fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("Entries", &self.entries.len())
            .field("Next Id", &self.next_id)
            .field("Direct Index Level", &self.direct_index)
            .field("Vocabulary", &self.voc)
            .finish()
    }
}

/// Cloneable handle to a [`Database`] shared between threads.
///
/// Writers (`add`, `erase`) hold the lock exclusively; queries share it and
/// always see a consistent database.
pub struct SharedDatabase<D>(Arc<RwLock<Database<D>>>);

impl<D> Clone for SharedDatabase<D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D: Descriptor> SharedDatabase<D> {
    pub fn new(db: Database<D>) -> Self {
        Self(Arc::new(RwLock::new(db)))
    }

    pub fn add(&self, features: &[D]) -> BowResult<ImageId> {
        self.0.write().add(features)
    }

    pub fn add_with_ref(&self, features: &[D], external_ref: Option<String>) -> BowResult<ImageId> {
        self.0.write().add_with_ref(features, external_ref)
    }

    pub fn query(&self, features: &[D], max_results: usize) -> BowResult<Vec<QueryResult>> {
        self.0.read().query(features, max_results)
    }

    pub fn query_with(&self, features: &[D], opts: QueryOptions) -> BowResult<Vec<QueryResult>> {
        self.0.read().query_with(features, opts)
    }

    pub fn erase(&self, id: ImageId) -> BowResult<()> {
        self.0.write().erase(id)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Shared access to the underlying database.
    pub fn read(&self) -> RwLockReadGuard<'_, Database<D>> {
        self.0.read()
    }

    /// Exclusive access to the underlying database.
    pub fn write(&self) -> RwLockWriteGuard<'_, Database<D>> {
        self.0.write()
    }
}
