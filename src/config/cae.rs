use std::path::PathBuf;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::prelude::Backend;

use crate::error::ModelError;
use crate::model::{MaskedImageModel, MaskedImageModelConfig};
use crate::ops::ParamSnapshot;

/// 384-wide encoder over 16x16 patches of 224px images, 8k token vocabulary.
pub fn cae_small_config() -> MaskedImageModelConfig {
    MaskedImageModelConfig::new(384, 12, 12, 384, 12)
}

/// 768-wide encoder over 16x16 patches of 224px images, 8k token vocabulary.
pub fn cae_base_config() -> MaskedImageModelConfig {
    MaskedImageModelConfig::new(768, 12, 12, 768, 12)
}

/// 1024-wide encoder over 16x16 patches of 224px images, 8k token vocabulary.
pub fn cae_large_config() -> MaskedImageModelConfig {
    MaskedImageModelConfig::new(1024, 24, 16, 1024, 16)
}

/// Builds the model from `config` and restores its weights from a checkpoint.
pub fn load_pretrained<B: Backend>(
    config: MaskedImageModelConfig,
    path: impl Into<PathBuf>,
    device: &B::Device,
) -> Result<MaskedImageModel<B>, ModelError> {
    let model = config.init::<B>(device)?;
    model.load_checkpoint(path, device)
}

#[cfg(test)]
fn tiny_config() -> MaskedImageModelConfig {
    MaskedImageModelConfig::new(16, 1, 2, 8, 2)
        .with_image_size(32)
        .with_patch_size(8)
        .with_vocab_size(10)
        .with_regressor_depth(1)
        .with_decoder_depth(1)
}

#[test]
fn test_presets_match_published_dimensions() {
    let small = cae_small_config();
    assert_eq!(small.embed_dim, 384);
    assert_eq!(small.depth, 12);
    assert_eq!(small.num_heads, 12);
    assert_eq!(small.vocab_size, 8192);
    assert_eq!(small.image_size, 224);
    assert_eq!(small.patch_size, 16);

    let base = cae_base_config();
    assert_eq!(base.embed_dim, 768);
    assert_eq!(base.depth, 12);
    assert_eq!(base.decoder_embed_dim, 768);

    let large = cae_large_config();
    assert_eq!(large.embed_dim, 1024);
    assert_eq!(large.depth, 24);
    assert_eq!(large.num_heads, 16);
}

#[test]
fn test_checkpoint_roundtrip_restores_parameters() {
    let device = NdArrayDevice::Cpu;

    let saved = tiny_config().init::<NdArray>(&device).unwrap();
    let path = std::env::temp_dir().join("imagemodel-checkpoint-roundtrip");
    saved.save_checkpoint(path.clone()).unwrap();

    let loaded = tiny_config()
        .init::<NdArray>(&device)
        .unwrap()
        .load_checkpoint(path.clone(), &device)
        .unwrap();

    let saved_params = ParamSnapshot::take(&saved);
    let loaded_params = ParamSnapshot::take(&loaded);
    for ((_, saved), (_, loaded)) in saved_params.tensors.into_iter().zip(loaded_params.tensors) {
        saved.to_data().assert_eq(&loaded.to_data(), true);
    }

    std::fs::remove_file(path.with_extension("mpk")).ok();
}

#[test]
fn test_load_pretrained_surfaces_missing_checkpoint() {
    let device = NdArrayDevice::Cpu;

    let missing = std::env::temp_dir().join("imagemodel-missing-checkpoint");
    let result = load_pretrained::<NdArray>(tiny_config(), missing, &device);

    assert!(matches!(result, Err(ModelError::Checkpoint(_))));
}
