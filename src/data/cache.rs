//! Dataset cache
//!
//! Loading and augmenting raw files is slow, so finished train/test splits
//! are stored as safetensors files holding two U8 tensors, `features` and
//! `labels`. Files are named `{id}_train.safetensors` and
//! `{id}_test.safetensors`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::{debug, info};

use super::Dataset;
use crate::{Result, SymbolicError};

const FEATURES: &str = "features";
const LABELS: &str = "labels";

/// Directory of cached dataset splits
#[derive(Debug, Clone)]
pub struct DatasetCache {
    root: PathBuf,
}

impl DatasetCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &str, part: &str) -> PathBuf {
        self.root.join(format!("{}_{}.safetensors", id, part))
    }

    /// Whether both halves of split `id` are present
    pub fn contains(&self, id: &str) -> bool {
        self.path(id, "train").is_file() && self.path(id, "test").is_file()
    }

    pub fn save_split(&self, id: &str, train: &Dataset, test: &Dataset) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(SymbolicError::Io)?;
        save_dataset(train, self.path(id, "train"))?;
        save_dataset(test, self.path(id, "test"))?;
        info!(
            "Cached split {} ({} train, {} test) in {}",
            id,
            train.len(),
            test.len(),
            self.root.display()
        );
        Ok(())
    }

    pub fn load_split(&self, id: &str, device: &Device) -> Result<(Dataset, Dataset)> {
        let train = load_dataset(self.path(id, "train"), device)?;
        let test = load_dataset(self.path(id, "test"), device)?;
        if train.word_length() != test.word_length() {
            return Err(SymbolicError::Data(format!(
                "cached split {} mixes word lengths {} and {}",
                id,
                train.word_length(),
                test.word_length()
            )));
        }
        info!(
            "Loaded cached split {} ({} train, {} test)",
            id,
            train.len(),
            test.len()
        );
        Ok((train, test))
    }
}

fn to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<u8>())
        .map_err(|e| SymbolicError::Tensor(format!("read dataset tensor failed: {}", e)))
}

/// Write one dataset as a safetensors file
pub fn save_dataset(dataset: &Dataset, path: impl AsRef<Path>) -> Result<()> {
    let features = to_bytes(dataset.features())?;
    let labels = to_bytes(dataset.labels())?;

    let mut views: HashMap<String, TensorView> = HashMap::new();
    for (name, tensor, data) in [
        (FEATURES, dataset.features(), &features),
        (LABELS, dataset.labels(), &labels),
    ] {
        let view = TensorView::new(
            safetensors::tensor::Dtype::U8,
            tensor.dims().to_vec(),
            data.as_slice(),
        )
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;
        views.insert(name.to_string(), view);
    }

    safetensors::serialize_to_file(views, &None, path.as_ref())
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;
    debug!("Wrote {} samples to {}", dataset.len(), path.as_ref().display());
    Ok(())
}

/// Read a dataset written by [`save_dataset`]
pub fn load_dataset(path: impl AsRef<Path>, device: &Device) -> Result<Dataset> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(SymbolicError::Io)?;
    let tensors =
        SafeTensors::deserialize(&data).map_err(|e| SymbolicError::Serialization(e.to_string()))?;

    let read = |name: &str| -> Result<Tensor> {
        let view = tensors
            .tensor(name)
            .map_err(|e| SymbolicError::Serialization(format!("{}: {}", name, e)))?;
        if view.dtype() != safetensors::tensor::Dtype::U8 {
            return Err(SymbolicError::Serialization(format!(
                "{} in {} has dtype {:?}, expected U8",
                name,
                path.display(),
                view.dtype()
            )));
        }
        if view.data().iter().any(|&b| b > 1) {
            return Err(SymbolicError::Data(format!(
                "{} in {} holds values other than 0 and 1",
                name,
                path.display()
            )));
        }
        Tensor::from_raw_buffer(view.data(), DType::U8, view.shape(), device)
            .map_err(|e| SymbolicError::Tensor(format!("restore {} failed: {}", name, e)))
    };

    Dataset::new(read(FEATURES)?, read(LABELS)?)
}
