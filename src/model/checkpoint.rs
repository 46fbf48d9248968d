//! Model checkpoints
//!
//! Save and load trained parameters using safetensors format.
//!
//! A checkpoint is a directory holding:
//!
//! - `model.safetensors`: every trainable tensor, named `input.threshold` and
//!   `layers.{i}.{slot}` (e.g. `layers.0.unary_threshold`)
//! - `metadata.json`: the [`ModelConfig`], its content hash and a timestamp
//!
//! Loading re-assembles the model from the stored config, checks the hash and
//! copies every stored tensor into the matching variable.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use chrono::{DateTime, Utc};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::{ModelConfig, ParamSlot, SymbolicModel};
use crate::{Result, SymbolicError};

const TENSORS_FILE: &str = "model.safetensors";
const METADATA_FILE: &str = "metadata.json";
const INPUT_THRESHOLD: &str = "input.threshold";

/// Sidecar describing a saved model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub config: ModelConfig,
    /// SHA-256 of the JSON-serialized config
    pub config_hash: String,
    pub saved_at: DateTime<Utc>,
    pub num_parameters: usize,
    pub tensor_names: Vec<String>,
}

/// Content hash of a model config
pub fn config_hash(config: &ModelConfig) -> Result<String> {
    let json = serde_json::to_string(config)
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Trainable variables of a model under their checkpoint names
pub fn named_vars(model: &SymbolicModel) -> Vec<(String, Var)> {
    let mut named = vec![(
        INPUT_THRESHOLD.to_string(),
        model.input_sparsity().threshold.clone(),
    )];
    for (i, layer) in model.layers().iter().enumerate() {
        for slot in ParamSlot::ALL {
            if let Some(var) = layer.params().var(slot) {
                named.push((format!("layers.{}.{}", i, slot.name()), var.clone()));
            }
        }
    }
    named
}

/// Write `model` to the checkpoint directory `dir`
pub fn save_checkpoint(model: &SymbolicModel, dir: impl AsRef<Path>) -> Result<CheckpointMetadata> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(SymbolicError::Io)?;

    let named = named_vars(model);
    let mut data_store: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(named.len());
    for (name, var) in &named {
        let tensor = var.as_tensor();
        let data: Vec<f32> = tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1())
            .map_err(|e| SymbolicError::Tensor(format!("read {} failed: {}", name, e)))?;
        data_store.push((name.clone(), tensor.dims().to_vec(), data));
    }

    let mut views: HashMap<String, TensorView> = HashMap::new();
    for (name, shape, data) in &data_store {
        let view = TensorView::new(
            safetensors::tensor::Dtype::F32,
            shape.clone(),
            bytemuck::cast_slice(data),
        )
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;
        views.insert(name.clone(), view);
    }

    let hash = config_hash(model.config())?;
    let header: HashMap<String, String> = [("config_hash".to_string(), hash.clone())].into();
    safetensors::serialize_to_file(views, &Some(header), &dir.join(TENSORS_FILE))
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;

    let metadata = CheckpointMetadata {
        config: model.config().clone(),
        config_hash: hash,
        saved_at: Utc::now(),
        num_parameters: model.num_parameters(),
        tensor_names: named.into_iter().map(|(name, _)| name).collect(),
    };
    let json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| SymbolicError::Serialization(e.to_string()))?;
    std::fs::write(dir.join(METADATA_FILE), json).map_err(SymbolicError::Io)?;

    info!(
        "Saved checkpoint to {} ({} tensors, {} parameters)",
        dir.display(),
        metadata.tensor_names.len(),
        metadata.num_parameters
    );
    Ok(metadata)
}

/// Read only the metadata sidecar of a checkpoint
pub fn load_metadata(dir: impl AsRef<Path>) -> Result<CheckpointMetadata> {
    let content = std::fs::read_to_string(dir.as_ref().join(METADATA_FILE))
        .map_err(SymbolicError::Io)?;
    serde_json::from_str(&content).map_err(|e| SymbolicError::Serialization(e.to_string()))
}

/// Re-assemble a model from the checkpoint directory `dir`
pub fn load_checkpoint(dir: impl AsRef<Path>, device: &Device) -> Result<SymbolicModel> {
    let dir = dir.as_ref();
    let metadata = load_metadata(dir)?;
    let expected = config_hash(&metadata.config)?;
    if expected != metadata.config_hash {
        return Err(SymbolicError::Serialization(format!(
            "config hash mismatch in {}: stored {}, computed {}",
            dir.display(),
            metadata.config_hash,
            expected
        )));
    }

    let model = SymbolicModel::new(metadata.config, device)?;

    let data = std::fs::read(dir.join(TENSORS_FILE)).map_err(SymbolicError::Io)?;
    let tensors =
        SafeTensors::deserialize(&data).map_err(|e| SymbolicError::Serialization(e.to_string()))?;

    for (name, var) in named_vars(&model) {
        let view = tensors
            .tensor(&name)
            .map_err(|e| SymbolicError::Serialization(format!("{}: {}", name, e)))?;
        if view.dtype() != safetensors::tensor::Dtype::F32 {
            return Err(SymbolicError::Serialization(format!(
                "{} has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        if view.shape() != var.as_tensor().dims() {
            return Err(SymbolicError::Serialization(format!(
                "{} has shape {:?}, model expects {:?}",
                name,
                view.shape(),
                var.as_tensor().dims()
            )));
        }
        let tensor = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), device)
            .map_err(|e| SymbolicError::Tensor(format!("restore {} failed: {}", name, e)))?;
        var.set(&tensor)
            .map_err(|e| SymbolicError::Tensor(format!("assign {} failed: {}", name, e)))?;
    }

    info!("Loaded checkpoint from {}", dir.display());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BinaryOp, HiddenLayerSpec, OperatorMenu, UnaryOp};

    fn model() -> SymbolicModel {
        let config = ModelConfig::new(3, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Cos], vec![BinaryOp::Divide]),
            2,
            1,
        ));
        SymbolicModel::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_checkpoint_names() {
        let names: Vec<String> = named_vars(&model()).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names[0], "input.threshold");
        assert!(names.contains(&"layers.0.binary_threshold".to_string()));
        assert!(names.contains(&"layers.1.bias_threshold".to_string()));
        assert!(!names.contains(&"layers.1.unary_threshold".to_string()));
        assert_eq!(names.len(), 1 + 6 + 4);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let original = model();
        original
            .input_sparsity()
            .threshold
            .set(&Tensor::new(&[0.1f32, 0.9, 0.4], &Device::Cpu).unwrap())
            .unwrap();

        let metadata = save_checkpoint(&original, dir.path()).unwrap();
        assert_eq!(metadata.tensor_names.len(), 11);
        assert_eq!(metadata.config_hash.len(), 64);

        let restored = load_checkpoint(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(restored.config(), original.config());
        for (a, b) in original.trainable_vars().iter().zip(restored.trainable_vars().iter()) {
            let a = a.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = b.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_tampered_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&model(), dir.path()).unwrap();

        let mut metadata = load_metadata(dir.path()).unwrap();
        metadata.config.input_dim = 4;
        std::fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        let err = load_checkpoint(dir.path(), &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("config hash mismatch"));
    }
}
