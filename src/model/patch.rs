use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::Initializer;
use burn::prelude::{Backend, Tensor};

use crate::error::ModelError;
use crate::util::sample_image_batch;

#[derive(Config)]
pub struct PatchEmbeddingConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_channels: usize,
    pub embed_dim: usize,
    pub init_std: f32,
}

impl PatchEmbeddingConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> Result<PatchEmbedding<B>, ModelError> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(ModelError::PatchGrid {
                image: self.image_size,
                patch: self.patch_size,
            });
        }

        let grid = self.image_size / self.patch_size;

        Ok(PatchEmbedding {
            proj: Conv2dConfig::new(
                [self.in_channels, self.embed_dim],
                [self.patch_size, self.patch_size],
            )
            .with_stride([self.patch_size, self.patch_size])
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: self.init_std as f64,
            })
            .init(device),
            image_size: self.image_size,
            grid_h: grid,
            grid_w: grid,
            embed_dim: self.embed_dim,
        })
    }
}

/// Splits an image into non-overlapping patches and projects each one to the
/// embedding width. The projection is a convolution whose kernel and stride
/// both equal the patch size, so patches never overlap.
#[derive(Module, Debug)]
pub struct PatchEmbedding<B: Backend> {
    proj: Conv2d<B>,
    image_size: usize,
    grid_h: usize,
    grid_w: usize,
    embed_dim: usize,
}

impl<B: Backend> PatchEmbedding<B> {
    /// Token sequence `[batch, grid_h * grid_w, embed_dim]` in row-major
    /// patch order.
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 3>, ModelError> {
        let [_, _, height, width] = images.dims();
        if height != self.image_size || width != self.image_size {
            return Err(ModelError::ImageSize {
                expected: self.image_size,
                found_h: height,
                found_w: width,
            });
        }

        let patches = self.proj.forward(images);
        let patches = patches.flatten::<3>(2, 3);
        let patches = patches.swap_dims(1, 2);

        Ok(patches)
    }

    pub fn grid(&self) -> [usize; 2] {
        [self.grid_h, self.grid_w]
    }

    pub fn num_patches(&self) -> usize {
        self.grid_h * self.grid_w
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}

#[test]
fn test_patch_embedding_shapes() {
    let device = NdArrayDevice::Cpu;

    let patcher = PatchEmbeddingConfig {
        image_size: 32,
        patch_size: 8,
        in_channels: 3,
        embed_dim: 24,
        init_std: 0.02,
    }
    .init::<NdArray>(&device)
    .unwrap();

    let tokens = patcher.forward(sample_image_batch(2, 3, 32, &device)).unwrap();

    assert_eq!(tokens.dims(), [2, 16, 24]);
    assert_eq!(patcher.grid(), [4, 4]);
    assert_eq!(patcher.num_patches(), 16);
}

#[test]
fn test_patch_embedding_rejects_wrong_image_size() {
    let device = NdArrayDevice::Cpu;

    let patcher = PatchEmbeddingConfig {
        image_size: 32,
        patch_size: 8,
        in_channels: 3,
        embed_dim: 24,
        init_std: 0.02,
    }
    .init::<NdArray>(&device)
    .unwrap();

    let result = patcher.forward(sample_image_batch(1, 3, 16, &device));

    assert!(matches!(
        result,
        Err(ModelError::ImageSize {
            expected: 32,
            found_h: 16,
            found_w: 16,
        })
    ));
}

#[test]
fn test_patch_embedding_rejects_uneven_grid() {
    let device = NdArrayDevice::Cpu;

    let result = PatchEmbeddingConfig {
        image_size: 30,
        patch_size: 8,
        in_channels: 3,
        embed_dim: 24,
        init_std: 0.02,
    }
    .init::<NdArray>(&device);

    assert!(matches!(
        result,
        Err(ModelError::PatchGrid {
            image: 30,
            patch: 8,
        })
    ));
}
