use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::database::DatabaseEntry;
use crate::vocab::{Node, VocabularyParams};
use crate::*;

const FORMAT_TAG: &str = "abow";
const VERSION: u32 = 1;

/// Encoding of a saved vocabulary or database. Loading detects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Compact bincode encoding.
    #[cfg(feature = "bincode")]
    Binary,
    /// Human readable JSON.
    Json,
}

impl Default for Format {
    #[cfg(feature = "bincode")]
    fn default() -> Self {
        Format::Binary
    }

    #[cfg(not(feature = "bincode"))]
    fn default() -> Self {
        Format::Json
    }
}

/// Leading fields of every document, read before the rest is decoded.
#[derive(Serialize, Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Document {
    format: String,
    version: u32,
    vocabulary: VocabularySection,
    database: Option<DatabaseSection>,
}

#[derive(Serialize, Deserialize)]
struct VocabularySection {
    k: usize,
    depth: usize,
    weighting: WeightingType,
    scoring: ScoringType,
    descriptor_bits: usize,
    nodes: Vec<NodeRecord>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    word: Option<WordId>,
    descriptor: Vec<u8>,
    weight: WordValue,
    cluster_size: usize,
}

#[derive(Serialize, Deserialize)]
struct DatabaseSection {
    direct_index: Option<u32>,
    next_image_id: ImageId,
    entries: Vec<EntryRecord>,
}

#[derive(Serialize, Deserialize)]
struct EntryRecord {
    id: ImageId,
    bow: BowVector,
    features: Option<FeatureVector>,
    external_ref: Option<String>,
}

impl Document {
    fn new(vocabulary: VocabularySection, database: Option<DatabaseSection>) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            version: VERSION,
            vocabulary,
            database,
        }
    }

    fn encode(&self, format: Format) -> BowResult<Vec<u8>> {
        Ok(match format {
            #[cfg(feature = "bincode")]
            Format::Binary => bincode::serialize(self)?,
            Format::Json => serde_json::to_vec(self)?,
        })
    }

    fn decode(bytes: &[u8]) -> BowResult<Self> {
        let json = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .map_or(false, |&b| b == b'{');

        let header: Header = if json {
            serde_json::from_slice(bytes)?
        } else {
            Self::decode_binary(bytes)?
        };
        if header.format != FORMAT_TAG {
            return Err(BowErr::malformed(format!("unknown format tag {:?}", header.format)));
        }
        if header.version != VERSION {
            return Err(BowErr::malformed(format!(
                "unsupported version {}, expected {}",
                header.version, VERSION
            )));
        }

        if json {
            Ok(serde_json::from_slice(bytes)?)
        } else {
            Self::decode_binary(bytes)
        }
    }

    #[cfg(feature = "bincode")]
    fn decode_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> BowResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }

    #[cfg(not(feature = "bincode"))]
    fn decode_binary<T: serde::de::DeserializeOwned>(_bytes: &[u8]) -> BowResult<T> {
        Err(BowErr::malformed("binary documents need the bincode feature"))
    }
}

fn write_file<P: AsRef<Path>>(path: P, bytes: &[u8]) -> BowResult<()> {
    let mut file = std::fs::File::create(path)?;
    std::io::Write::write_all(&mut file, bytes)?;
    Ok(())
}

fn read_file<P: AsRef<Path>>(path: P) -> BowResult<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer: Vec<u8> = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut buffer)?;
    Ok(buffer)
}

/// Persistence
impl<D: Descriptor> Vocabulary<D> {
    /// Save vocabulary to a file in the default format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        self.save_as(path, Format::default())
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P, format: Format) -> BowResult<()> {
        write_file(path, &self.to_bytes(format)?)
    }

    /// Load a vocabulary from a file written by [`Vocabulary::save`] or
    /// [`Database::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        Self::from_bytes(&read_file(path)?)
    }

    pub fn to_bytes(&self, format: Format) -> BowResult<Vec<u8>> {
        Document::new(self.to_section(), None).encode(format)
    }

    /// Decode a vocabulary document. Anything that does not describe a valid
    /// tree of `D` descriptors, including a descriptor size other than
    /// `D`'s, fails with [`BowErr::Serialization`].
    pub fn from_bytes(bytes: &[u8]) -> BowResult<Self> {
        Self::from_section(Document::decode(bytes)?.vocabulary)
    }

    fn to_section(&self) -> VocabularySection {
        VocabularySection {
            k: self.k,
            depth: self.depth,
            weighting: self.weighting,
            scoring: self.scoring,
            descriptor_bits: self.desc_bits,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeRecord {
                    parent: n.parent,
                    children: n.children.to_vec(),
                    word: n.word,
                    descriptor: n.descriptor.to_tokens(),
                    weight: n.weight,
                    cluster_size: n.cluster_size,
                })
                .collect(),
        }
    }

    /// Rebuild a vocabulary, checking the node table is a well formed tree
    /// numbered as a fresh build would number it.
    fn from_section(section: VocabularySection) -> BowResult<Self> {
        VocabularyParams {
            k: section.k,
            depth: section.depth,
            ..Default::default()
        }
        .validate()
        .map_err(|e| BowErr::malformed(e.to_string()))?;

        let n_nodes = section.nodes.len();
        if n_nodes == 0 {
            return Err(BowErr::malformed("vocabulary has no nodes"));
        }

        let mut nodes = Vec::with_capacity(n_nodes);
        for (i, record) in section.nodes.into_iter().enumerate() {
            let descriptor = D::from_tokens(&record.descriptor)
                .map_err(|e| BowErr::malformed(format!("node {}: {}", i, e)))?;
            if descriptor.bit_len() != section.descriptor_bits {
                return Err(BowErr::malformed(format!(
                    "node {} has a {} bit descriptor, expected {}",
                    i,
                    descriptor.bit_len(),
                    section.descriptor_bits
                )));
            }
            if (i == 0) != record.parent.is_none() {
                return Err(BowErr::malformed(format!("node {} has a bad parent", i)));
            }
            let leaf = record.children.is_empty();
            if !record.weight.is_finite() || record.weight < 0. || (!leaf && record.weight != 0.) {
                return Err(BowErr::malformed(format!("node {} has a bad weight", i)));
            }
            nodes.push(Node {
                parent: record.parent,
                children: SmallVec::from_vec(record.children),
                descriptor,
                weight: record.weight,
                word: record.word,
                cluster_size: record.cluster_size,
            });
        }

        // every node is reached exactly once from the root, through links
        // that agree in both directions
        let mut seen = vec![false; n_nodes];
        let mut stack: Vec<NodeId> = vec![0];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id as usize], true) {
                return Err(BowErr::malformed(format!("node {} is reached twice", id)));
            }
            for &c in nodes[id as usize].children.iter() {
                if c as usize >= n_nodes || nodes[c as usize].parent != Some(id) {
                    return Err(BowErr::malformed(format!("bad link {} -> {}", id, c)));
                }
                stack.push(c);
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(BowErr::malformed("node table has unreachable nodes"));
        }

        let recorded: Vec<Option<WordId>> = nodes.iter().map(|n| n.word).collect();
        let mut voc = Vocabulary {
            nodes,
            words: Vec::new(),
            k: section.k,
            depth: section.depth,
            weighting: section.weighting,
            scoring: section.scoring,
            desc_bits: section.descriptor_bits,
        };
        voc.assign_words();
        if voc.nodes.iter().zip(recorded).any(|(n, w)| n.word != w) {
            return Err(BowErr::malformed("word ids do not match the tree"));
        }
        debug!(words = voc.num_words(), nodes = voc.num_nodes(), "vocabulary loaded");
        Ok(voc)
    }
}

/// Persistence. The document embeds the vocabulary.
impl<D: Descriptor> Database<D> {
    /// Save database to a file in the default format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        self.save_as(path, Format::default())
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P, format: Format) -> BowResult<()> {
        write_file(path, &self.to_bytes(format)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        Self::from_bytes(&read_file(path)?)
    }

    pub fn to_bytes(&self, format: Format) -> BowResult<Vec<u8>> {
        let voc = self.vocabulary().ok_or(BowErr::NotBuilt)?;
        let section = DatabaseSection {
            direct_index: self.direct_index,
            next_image_id: self.next_id,
            entries: self
                .entries
                .values()
                .map(|e| EntryRecord {
                    id: e.id,
                    bow: e.bow.clone(),
                    features: e.features.clone(),
                    external_ref: e.external_ref.clone(),
                })
                .collect(),
        };
        Document::new(voc.to_section(), Some(section)).encode(format)
    }

    pub fn from_bytes(bytes: &[u8]) -> BowResult<Self> {
        let doc = Document::decode(bytes)?;
        let section = doc
            .database
            .ok_or_else(|| BowErr::malformed("document has no database section"))?;
        let voc: Arc<Vocabulary<D>> = Arc::new(Vocabulary::from_section(doc.vocabulary)?);

        let mut db = Database::new(voc, section.direct_index)
            .map_err(|e| BowErr::malformed(e.to_string()))?;
        for record in section.entries {
            db.insert(DatabaseEntry {
                id: record.id,
                bow: record.bow,
                features: record.features.filter(|_| section.direct_index.is_some()),
                external_ref: record.external_ref,
            })
            .map_err(|e| BowErr::malformed(e.to_string()))?;
        }
        if section.next_image_id < db.next_id {
            return Err(BowErr::malformed("next image id is below a stored id"));
        }
        db.next_id = section.next_image_id;
        debug!(entries = db.len(), "database loaded");
        Ok(db)
    }
}
