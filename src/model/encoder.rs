use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use itertools::Itertools;

use crate::error::ModelError;
use crate::mask::{sample_patch_mask, PatchMask};
use crate::model::block::{stochastic_depth_rates, TransformerBlock, TransformerBlockConfig};
use crate::model::patch::{PatchEmbedding, PatchEmbeddingConfig};
use crate::model::posenc::{build_2d_sincos_embedding, SINCOS_TEMPERATURE};
use crate::ops;

#[derive(Config)]
pub struct MaskedEncoderConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_channels: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f32,
    pub qkv_bias: bool,
    pub qk_scale: Option<f32>,
    pub attn_head_dim: Option<usize>,
    pub drop: f32,
    pub attn_drop: f32,
    pub drop_path: f32,
    pub layer_scale_init: f32,
    pub init_std: f32,
    pub norm_eps: f32,
    pub skip_rescale: bool,
}

impl MaskedEncoderConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> Result<MaskedEncoder<B>, ModelError> {
        if self.embed_dim % 4 != 0 {
            return Err(ModelError::PositionEmbedDim {
                dim: self.embed_dim,
            });
        }

        let patch_embed = PatchEmbeddingConfig {
            image_size: self.image_size,
            patch_size: self.patch_size,
            in_channels: self.in_channels,
            embed_dim: self.embed_dim,
            init_std: self.init_std,
        }
        .init(device)?;

        let blocks = stochastic_depth_rates(self.drop_path, self.depth)
            .into_iter()
            .enumerate()
            .map(|(index, drop_path)| {
                let block = TransformerBlockConfig {
                    embed_dim: self.embed_dim,
                    num_heads: self.num_heads,
                    mlp_ratio: self.mlp_ratio,
                    qkv_bias: self.qkv_bias,
                    qk_scale: self.qk_scale,
                    attn_head_dim: self.attn_head_dim,
                    drop: self.drop,
                    attn_drop: self.attn_drop,
                    drop_path,
                    layer_scale_init: self.layer_scale_init,
                    init_std: self.init_std,
                    norm_eps: self.norm_eps,
                }
                .init(device);

                if self.skip_rescale {
                    block
                } else {
                    block.rescaled(index + 1)
                }
            })
            .collect_vec();

        Ok(MaskedEncoder {
            patch_embed,
            cls_token: Param::from_tensor(ops::trunc_normal(
                [1, 1, self.embed_dim],
                self.init_std,
                device,
            )),
            pos_drop: DropoutConfig::new(self.drop as f64).init(),
            blocks,
            norm: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
        })
    }
}

/// Vision transformer that only ever attends over the visible patches. A
/// class token is prepended, so the output carries `num_visible + 1` tokens.
#[derive(Module, Debug)]
pub struct MaskedEncoder<B: Backend> {
    patch_embed: PatchEmbedding<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_drop: Dropout,
    blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
}

impl<B: Backend> MaskedEncoder<B> {
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        mask: &PatchMask<B>,
    ) -> Result<Tensor<B, 3>, ModelError> {
        let patches = self.patch_embed.forward(images)?;
        let [batch_size, num_patches, embed_dim] = patches.dims();

        if mask.num_patches() != num_patches {
            return Err(ModelError::MaskLength {
                expected: num_patches,
                found: mask.num_patches(),
            });
        }

        let visible = mask.select_visible(patches);
        let cls_tokens = self.cls_token.val().expand([batch_size as i32, -1, -1]);
        let tokens = Tensor::cat(vec![cls_tokens, visible], 1);

        // the class token occupies the zeroed leading slot of the table
        let pos_embed = build_2d_sincos_embedding::<B>(
            embed_dim,
            self.patch_embed.grid(),
            SINCOS_TEMPERATURE,
            true,
            &tokens.device(),
        )?;
        let pos_embed = pos_embed.expand([batch_size, num_patches + 1, embed_dim]);
        let pos_cls = pos_embed.clone().slice([0..batch_size, 0..1]);
        let pos_visible =
            mask.select_visible(pos_embed.slice([0..batch_size, 1..num_patches + 1]));
        let pos_embed = Tensor::cat(vec![pos_cls, pos_visible], 1);

        let tokens = tokens + pos_embed;
        let mut tokens = self.pos_drop.forward(tokens);

        for block in &self.blocks {
            tokens = block.forward(tokens);
        }

        let tokens = self.norm.forward(tokens);

        Ok(tokens)
    }

    pub fn embed_dim(&self) -> usize {
        self.patch_embed.embed_dim()
    }

    pub fn grid(&self) -> [usize; 2] {
        self.patch_embed.grid()
    }

    pub fn num_patches(&self) -> usize {
        self.patch_embed.num_patches()
    }
}

#[cfg(test)]
fn test_encoder_config() -> MaskedEncoderConfig {
    MaskedEncoderConfig {
        image_size: 32,
        patch_size: 8,
        in_channels: 3,
        embed_dim: 16,
        depth: 2,
        num_heads: 4,
        mlp_ratio: 4.0,
        qkv_bias: true,
        qk_scale: None,
        attn_head_dim: None,
        drop: 0.0,
        attn_drop: 0.0,
        drop_path: 0.0,
        layer_scale_init: 0.0,
        init_std: 0.02,
        norm_eps: 1e-6,
        skip_rescale: false,
    }
}

#[test]
fn test_encoder_keeps_cls_and_visible_tokens() {
    let device = NdArrayDevice::Cpu;

    let encoder = test_encoder_config().init::<NdArray>(&device).unwrap();
    assert_eq!(encoder.num_patches(), 16);

    let images = crate::util::sample_image_batch::<NdArray>(2, 3, 32, &device);
    let mask = PatchMask::new(sample_patch_mask(2, 16, 6, &device), 16).unwrap();

    let tokens = encoder.forward(images, &mask).unwrap();

    assert_eq!(tokens.dims(), [2, 11, 16]);
}

#[test]
fn test_encoder_rejects_mask_of_wrong_length() {
    let device = NdArrayDevice::Cpu;

    let encoder = test_encoder_config().init::<NdArray>(&device).unwrap();

    let images = crate::util::sample_image_batch::<NdArray>(2, 3, 32, &device);
    let mask = PatchMask::new(sample_patch_mask(2, 9, 4, &device), 9).unwrap();

    assert!(matches!(
        encoder.forward(images, &mask),
        Err(ModelError::MaskLength {
            expected: 16,
            found: 9
        })
    ));
}

#[test]
fn test_encoder_config_rejects_unsplittable_embed_dim() {
    let device = NdArrayDevice::Cpu;

    let mut config = test_encoder_config();
    config.embed_dim = 10;

    assert!(matches!(
        config.init::<NdArray>(&device),
        Err(ModelError::PositionEmbedDim { dim: 10 })
    ));
}
