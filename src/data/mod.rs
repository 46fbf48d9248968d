//! Training Data
//!
//! Turns raw files into fixed-width bit vectors and assembles labelled
//! datasets from them.
//!
//! ## Pipeline
//!
//! ```text
//! files ─► bytes ─► bits (MSB first) ─► word_length chunks
//!       ─► deduplicate ─► sample ─► embed synthetic positives
//!       ─► Dataset (U8 features, U8 labels) ─► shuffle ─► train / test split
//! ```
//!
//! Synthetic positives are negatives with a run of 64-bit words copied in
//! from a real positive at the same position, which teaches the classifier
//! to flag fragments that only partly contain executable content.

pub mod cache;

pub use cache::DatasetCache;

use std::collections::HashSet;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Result, SymbolicError};

/// Width of the words swapped in by [`embed_positive_patterns`]
pub const EMBED_WORD_BITS: usize = 64;

// =============================================================================
// Feature vectors
// =============================================================================

/// Fixed-length bit sample, immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureVector(Box<[bool]>);

impl FeatureVector {
    pub fn new(bits: Vec<bool>) -> Self {
        Self(bits.into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bits(&self) -> &[bool] {
        &self.0
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().filter(|&&b| b).count()
    }

    /// Bits as 0/1 bytes
    pub fn to_u8(&self) -> Vec<u8> {
        self.0.iter().map(|&b| b as u8).collect()
    }

    /// Copy of `self` with bits `[start, end)` taken from `donor`
    pub fn splice(&self, donor: &FeatureVector, start: usize, end: usize) -> Result<Self> {
        if donor.len() != self.len() || start > end || end > self.len() {
            return Err(SymbolicError::Data(format!(
                "cannot splice bits {}..{} between vectors of length {} and {}",
                start,
                end,
                self.len(),
                donor.len()
            )));
        }
        let mut bits = self.0.to_vec();
        bits[start..end].copy_from_slice(&donor.0[start..end]);
        Ok(Self::new(bits))
    }
}

impl From<Vec<bool>> for FeatureVector {
    fn from(bits: Vec<bool>) -> Self {
        Self::new(bits)
    }
}

/// Expand bytes MSB-first and cut them into `word_length`-bit vectors
///
/// A trailing chunk shorter than `word_length` is dropped.
pub fn bits_from_bytes(bytes: &[u8], word_length: usize) -> Vec<FeatureVector> {
    if word_length == 0 {
        return Vec::new();
    }
    let bits: Vec<bool> = bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |i| (byte >> i) & 1 == 1))
        .collect();
    bits.chunks_exact(word_length)
        .map(|chunk| FeatureVector::new(chunk.to_vec()))
        .collect()
}

/// Bit vectors of one file
pub fn load_file(path: impl AsRef<Path>, word_length: usize) -> Result<Vec<FeatureVector>> {
    let bytes = std::fs::read(path.as_ref()).map_err(SymbolicError::Io)?;
    Ok(bits_from_bytes(&bytes, word_length))
}

/// Bit vectors of every regular file in `dir`, in file-name order
pub fn load_directory(dir: impl AsRef<Path>, word_length: usize) -> Result<Vec<FeatureVector>> {
    let dir = dir.as_ref();
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(SymbolicError::Io)? {
        let path = entry.map_err(SymbolicError::Io)?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut samples = Vec::new();
    for path in &paths {
        samples.extend(load_file(path, word_length)?);
    }
    debug!(
        "Loaded {} samples from {} files in {}",
        samples.len(),
        paths.len(),
        dir.display()
    );
    Ok(samples)
}

/// Drop repeated samples, keeping the first occurrence
pub fn deduplicate(samples: Vec<FeatureVector>) -> Vec<FeatureVector> {
    let mut seen = HashSet::with_capacity(samples.len());
    samples
        .into_iter()
        .filter(|sample| seen.insert(sample.clone()))
        .collect()
}

/// Pick `count` samples at random without replacement
///
/// Asking for more samples than exist returns all of them in random order.
pub fn sample(samples: Vec<FeatureVector>, count: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    if count > samples.len() {
        warn!(
            "Requested {} samples but only {} are available",
            count,
            samples.len()
        );
    }
    let mut samples = samples;
    samples.shuffle(rng);
    samples.truncate(count);
    samples
}

/// Build `count` synthetic positives from runs of positive words inside negatives
///
/// Each synthetic sample copies a random negative, picks a run of
/// `1..=words - 1` 64-bit words at a random aligned position and overwrites
/// it with the same words of a random positive.
pub fn embed_positive_patterns(
    positives: &[FeatureVector],
    negatives: &[FeatureVector],
    count: usize,
    rng: &mut StdRng,
) -> Result<Vec<FeatureVector>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let (Some(first_pos), Some(_)) = (positives.first(), negatives.first()) else {
        return Err(SymbolicError::Data(
            "embedding needs at least one positive and one negative sample".into(),
        ));
    };
    let word_length = first_pos.len();
    if word_length % EMBED_WORD_BITS != 0 || word_length / EMBED_WORD_BITS < 2 {
        return Err(SymbolicError::Config(format!(
            "word length {} must be a multiple of {} bits with at least 2 words",
            word_length, EMBED_WORD_BITS
        )));
    }
    let words = word_length / EMBED_WORD_BITS;

    let mut synthetic = Vec::with_capacity(count);
    for _ in 0..count {
        let length = rng.gen_range(1..words);
        let position = rng.gen_range(0..=words - length);
        let base = &negatives[rng.gen_range(0..negatives.len())];
        let donor = &positives[rng.gen_range(0..positives.len())];
        synthetic.push(base.splice(
            donor,
            EMBED_WORD_BITS * position,
            EMBED_WORD_BITS * (position + length),
        )?);
    }
    Ok(synthetic)
}

// =============================================================================
// Data configuration and loading
// =============================================================================

/// Where the samples live and how many to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory holding one sub-directory per file type
    pub data_path: String,
    /// Sub-directory of the positive class
    pub positive_dir: String,
    /// Sub-directories of the negative class
    pub negative_dirs: Vec<String>,
    /// Negatives to keep; half as many real positives and as many synthetic
    /// positives are added. `None` keeps everything and embeds nothing.
    pub data_points: Option<usize>,
    pub word_length: usize,
    pub test_fraction: f64,
    pub seed: u64,
    /// Directory for cached train/test splits
    pub cache_dir: Option<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: "data".into(),
            positive_dir: "bin".into(),
            negative_dirs: ["csv", "jpeg", "docx", "pdf", "rtf", "sql", "txt", "xlsx", "pptx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            data_points: Some(400_000),
            word_length: 512,
            test_fraction: 0.2,
            seed: 0,
            cache_dir: None,
        }
    }
}

impl DataConfig {
    /// Identifier of the dataset this config produces, used as cache key
    pub fn dataset_id(&self) -> String {
        match self.data_points {
            Some(points) => format!("{}-points-{}-seed-{}", self.positive_dir, points, self.seed),
            None => format!("{}-all-seed-{}", self.positive_dir, self.seed),
        }
    }
}

/// Load, clean, augment and shuffle the samples described by `config`
pub fn load_dataset(config: &DataConfig, rng: &mut StdRng, device: &Device) -> Result<Dataset> {
    let root = Path::new(&config.data_path);

    let positives = load_directory(root.join(&config.positive_dir), config.word_length)?;
    let mut negatives = Vec::new();
    for dir in &config.negative_dirs {
        negatives.extend(load_directory(root.join(dir), config.word_length)?);
    }

    let raw = positives.len();
    let mut positives = deduplicate(positives);
    debug!("Removed {} duplicate positive samples", raw - positives.len());
    let raw = negatives.len();
    let mut negatives = deduplicate(negatives);
    debug!("Removed {} duplicate negative samples", raw - negatives.len());

    if let Some(points) = config.data_points {
        positives = sample(positives, points / 2, rng);
        negatives = sample(negatives, points, rng);
        let synthetic = embed_positive_patterns(&positives, &negatives, points / 2, rng)?;
        positives.extend(synthetic);
    }

    info!(
        "Loaded {} positive and {} negative samples of {} bits",
        positives.len(),
        negatives.len(),
        config.word_length
    );
    Dataset::from_samples(&positives, &negatives, device)?.shuffle(rng)
}

// =============================================================================
// Dataset
// =============================================================================

/// One mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, word_length)` U8
    pub features: Tensor,
    /// `(batch, 1)` U8
    pub labels: Tensor,
}

/// Labelled feature matrix with 0/1 values stored as U8
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Tensor,
    labels: Tensor,
}

/// Cast a 0/1 tensor to U8, rejecting any other value
fn binary_u8(tensor: &Tensor, what: &str) -> Result<Tensor> {
    if tensor.elem_count() > 0 {
        let stray = tensor
            .ne(0.0)
            .and_then(|nonzero| nonzero.mul(&tensor.ne(1.0)?))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.max(0))
            .and_then(|t| t.to_scalar::<u8>())
            .map_err(|e| SymbolicError::Tensor(format!("{} value check failed: {}", what, e)))?;
        if stray > 0 {
            return Err(SymbolicError::Data(format!(
                "{} hold values other than 0 and 1",
                what
            )));
        }
    }
    tensor
        .to_dtype(DType::U8)
        .map_err(|e| SymbolicError::Tensor(format!("{} cast failed: {}", what, e)))
}

impl Dataset {
    /// Wrap tensors, checking shapes and casting to U8
    ///
    /// Every value must be exactly 0 or 1, whatever the input dtype.
    pub fn new(features: Tensor, labels: Tensor) -> Result<Self> {
        let (rows, _) = features
            .dims2()
            .map_err(|e| SymbolicError::Data(format!("features must be 2-D: {}", e)))?;
        let (label_rows, label_cols) = labels
            .dims2()
            .map_err(|e| SymbolicError::Data(format!("labels must be 2-D: {}", e)))?;
        if label_cols != 1 || label_rows != rows {
            return Err(SymbolicError::Data(format!(
                "labels have shape ({}, {}), expected ({}, 1)",
                label_rows, label_cols, rows
            )));
        }
        Ok(Self {
            features: binary_u8(&features, "features")?,
            labels: binary_u8(&labels, "labels")?,
        })
    }

    /// Positives first (label 1), then negatives (label 0)
    pub fn from_samples(
        positives: &[FeatureVector],
        negatives: &[FeatureVector],
        device: &Device,
    ) -> Result<Self> {
        let rows = positives.len() + negatives.len();
        let width = positives
            .first()
            .or_else(|| negatives.first())
            .map(FeatureVector::len)
            .ok_or_else(|| SymbolicError::Data("no samples".into()))?;

        let mut data = Vec::with_capacity(rows * width);
        for sample in positives.iter().chain(negatives.iter()) {
            if sample.len() != width {
                return Err(SymbolicError::Data(format!(
                    "sample has {} bits, expected {}",
                    sample.len(),
                    width
                )));
            }
            data.extend(sample.to_u8());
        }
        let mut labels = vec![1u8; positives.len()];
        labels.resize(rows, 0);

        let features = Tensor::from_vec(data, (rows, width), device)
            .map_err(|e| SymbolicError::Tensor(format!("feature tensor failed: {}", e)))?;
        let labels = Tensor::from_vec(labels, (rows, 1), device)
            .map_err(|e| SymbolicError::Tensor(format!("label tensor failed: {}", e)))?;
        Self::new(features, labels)
    }

    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn word_length(&self) -> usize {
        self.features.dims()[1]
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    pub fn device(&self) -> &Device {
        self.features.device()
    }

    /// Number of samples labelled 1
    pub fn positives(&self) -> Result<usize> {
        let count = self
            .labels
            .to_dtype(DType::U32)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_scalar::<u32>())
            .map_err(|e| SymbolicError::Tensor(format!("positive count failed: {}", e)))?;
        Ok(count as usize)
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[u32]) -> Result<Self> {
        let index = Tensor::from_slice(indices, indices.len(), self.device())
            .map_err(|e| SymbolicError::Tensor(format!("index tensor failed: {}", e)))?;
        let features = self
            .features
            .index_select(&index, 0)
            .map_err(|e| SymbolicError::Tensor(format!("feature select failed: {}", e)))?;
        let labels = self
            .labels
            .index_select(&index, 0)
            .map_err(|e| SymbolicError::Tensor(format!("label select failed: {}", e)))?;
        Ok(Self { features, labels })
    }

    /// Rows in a random order
    pub fn shuffle(&self, rng: &mut StdRng) -> Result<Self> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.shuffle(rng);
        self.select(&order)
    }

    /// Split into `(train, test)` with `ceil(len · test_fraction)` test rows
    /// taken from the end
    pub fn split(&self, test_fraction: f64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&test_fraction) {
            return Err(SymbolicError::Config(format!(
                "test fraction {} must be in [0, 1)",
                test_fraction
            )));
        }
        let test = (self.len() as f64 * test_fraction).ceil() as usize;
        let train = self.len() - test;
        let part = |start: usize, len: usize| -> Result<Self> {
            Ok(Self {
                features: self.features.narrow(0, start, len)?,
                labels: self.labels.narrow(0, start, len)?,
            })
        };
        Ok((part(0, train)?, part(train, test)?))
    }

    /// Cut into batches of `batch_size` (the last may be smaller), shuffling
    /// the row order first when an RNG is given
    pub fn batches(&self, batch_size: usize, rng: Option<&mut StdRng>) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(SymbolicError::Config("batch size must be non-zero".into()));
        }
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size)
            .map(|chunk| {
                let rows = self.select(chunk)?;
                Ok(Batch {
                    features: rows.features,
                    labels: rows.labels,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn vector(bits: &[u8]) -> FeatureVector {
        FeatureVector::new(bits.iter().map(|&b| b == 1).collect())
    }

    fn words(value: bool, len: usize) -> FeatureVector {
        FeatureVector::new(vec![value; len])
    }

    #[test]
    fn test_bits_msb_first() {
        let samples = bits_from_bytes(&[0b1000_0001, 0xF0], 8);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], vector(&[1, 0, 0, 0, 0, 0, 0, 1]));
        assert_eq!(samples[1], vector(&[1, 1, 1, 1, 0, 0, 0, 0]));
    }

    #[test]
    fn test_incomplete_tail_dropped() {
        let samples = bits_from_bytes(&[0xFF; 5], 16);
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.len() == 16 && s.count_ones() == 16));
        assert!(bits_from_bytes(&[0xFF], 16).is_empty());
    }

    #[test]
    fn test_deduplicate_keeps_first() {
        let a = vector(&[1, 0]);
        let b = vector(&[0, 1]);
        let out = deduplicate(vec![a.clone(), b.clone(), a.clone(), b.clone()]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn test_sample_count() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<FeatureVector> = (0..10u8).map(|i| vector(&[i % 2, i / 2 % 2])).collect();
        assert_eq!(sample(samples.clone(), 4, &mut rng).len(), 4);
        assert_eq!(sample(samples, 40, &mut rng).len(), 10);
    }

    #[test]
    fn test_embedding_copies_aligned_words() {
        let mut rng = StdRng::seed_from_u64(3);
        let positives = vec![words(true, 256)];
        let negatives = vec![words(false, 256)];
        let synthetic = embed_positive_patterns(&positives, &negatives, 50, &mut rng).unwrap();
        assert_eq!(synthetic.len(), 50);

        for sample in &synthetic {
            let ones = sample.count_ones();
            // between one and words - 1 whole words
            assert!(ones >= 64 && ones <= 192 && ones % 64 == 0);
            let first = sample.bits().iter().position(|&b| b).unwrap();
            assert_eq!(first % 64, 0);
            assert!(sample.bits()[first..first + ones].iter().all(|&b| b));
        }
    }

    #[test]
    fn test_embedding_rejects_bad_word_length() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = embed_positive_patterns(&[words(true, 64)], &[words(false, 64)], 1, &mut rng);
        assert!(matches!(err, Err(SymbolicError::Config(_))));
        assert!(embed_positive_patterns(&[], &[words(false, 128)], 1, &mut rng).is_err());
    }

    #[test]
    fn test_dataset_from_samples() {
        let dataset = Dataset::from_samples(
            &[vector(&[1, 1, 0]), vector(&[1, 0, 0])],
            &[vector(&[0, 0, 1])],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.word_length(), 3);
        assert_eq!(dataset.positives().unwrap(), 2);
        assert_eq!(
            dataset.labels().to_vec2::<u8>().unwrap(),
            vec![vec![1], vec![1], vec![0]]
        );

        let mismatched =
            Dataset::from_samples(&[vector(&[1, 1])], &[vector(&[0, 0, 1])], &Device::Cpu);
        assert!(mismatched.is_err());
    }

    #[test]
    fn test_dataset_rejects_non_binary_values() {
        let labels = Tensor::new(&[[1u8], [0]], &Device::Cpu).unwrap();
        let fractional = Tensor::new(&[[0.0f32, 0.7], [1.0, 1.0]], &Device::Cpu).unwrap();
        let err = Dataset::new(fractional, labels.clone()).unwrap_err();
        assert!(matches!(err, SymbolicError::Data(_)));

        let features = Tensor::new(&[[0u8, 1], [1, 1]], &Device::Cpu).unwrap();
        let bad_labels = Tensor::new(&[[2u8], [0]], &Device::Cpu).unwrap();
        let err = Dataset::new(features.clone(), bad_labels).unwrap_err();
        assert!(matches!(err, SymbolicError::Data(_)));

        let floats = Tensor::new(&[[0.0f32, 1.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let dataset = Dataset::new(floats, labels).unwrap();
        assert_eq!(dataset.features().dtype(), DType::U8);
        assert_eq!(dataset.features().to_vec2::<u8>().unwrap(), vec![vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn test_shuffle_keeps_pairs() {
        let positives: Vec<FeatureVector> = (0..5).map(|_| vector(&[1, 1])).collect();
        let negatives: Vec<FeatureVector> = (0..5).map(|_| vector(&[0, 0])).collect();
        let dataset = Dataset::from_samples(&positives, &negatives, &Device::Cpu).unwrap();
        let shuffled = dataset.shuffle(&mut StdRng::seed_from_u64(1)).unwrap();

        let features = shuffled.features().to_vec2::<u8>().unwrap();
        let labels = shuffled.labels().to_vec2::<u8>().unwrap();
        for (row, label) in features.iter().zip(labels.iter()) {
            assert_eq!(row[0], label[0]);
        }
        assert_eq!(shuffled.positives().unwrap(), 5);
    }

    #[test]
    fn test_split_sizes() {
        let negatives: Vec<FeatureVector> = (0..11).map(|_| vector(&[0, 1])).collect();
        let dataset = Dataset::from_samples(&[], &negatives, &Device::Cpu).unwrap();
        let (train, test) = dataset.split(0.2).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 8);
        assert!(dataset.split(1.0).is_err());
    }

    #[test]
    fn test_batches_cover_every_row() {
        let negatives: Vec<FeatureVector> = (0..7).map(|_| vector(&[0, 1, 0])).collect();
        let dataset = Dataset::from_samples(&[], &negatives, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let batches = dataset.batches(3, Some(&mut rng)).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.features.dims()[0]).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches[0].labels.dims(), &[3, 1]);
        assert!(dataset.batches(0, None).is_err());
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), [0xAAu8; 3]).unwrap();
        std::fs::write(dir.path().join("b.bin"), [0x00u8; 2]).unwrap();
        let samples = load_directory(dir.path(), 8).unwrap();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], vector(&[1, 0, 1, 0, 1, 0, 1, 0]));
        assert_eq!(samples[4].count_ones(), 0);
    }
}
