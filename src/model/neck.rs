use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use itertools::Itertools;

use crate::model::block::{
    stochastic_depth_rates, RegressorBlock, RegressorBlockConfig, TransformerBlock,
    TransformerBlockConfig,
};

#[derive(Config)]
pub struct PretextNeckConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub vocab_size: usize,
    pub regressor_depth: usize,
    pub decoder_depth: usize,
    pub mlp_ratio: f32,
    pub qkv_bias: bool,
    pub qk_scale: Option<f32>,
    pub drop: f32,
    pub attn_drop: f32,
    pub drop_path: f32,
    pub layer_scale_init: f32,
    pub init_std: f32,
    pub norm_eps: f32,
    pub skip_rescale: bool,
}

impl PretextNeckConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> PretextNeck<B> {
        let regressor_blocks = stochastic_depth_rates(self.drop_path, self.regressor_depth)
            .into_iter()
            .enumerate()
            .map(|(index, drop_path)| {
                let block = RegressorBlockConfig {
                    embed_dim: self.embed_dim,
                    num_heads: self.num_heads,
                    mlp_ratio: self.mlp_ratio,
                    qkv_bias: self.qkv_bias,
                    qk_scale: self.qk_scale,
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

        let decoder_blocks = stochastic_depth_rates(self.drop_path, self.decoder_depth)
            .into_iter()
            .enumerate()
            .map(|(index, drop_path)| {
                let block = TransformerBlockConfig {
                    embed_dim: self.embed_dim,
                    num_heads: self.num_heads,
                    mlp_ratio: self.mlp_ratio,
                    qkv_bias: self.qkv_bias,
                    qk_scale: self.qk_scale,
                    attn_head_dim: None,
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

        PretextNeck {
            regressor_blocks,
            decoder_blocks,
            norm: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            norm2: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            head: LinearConfig::new(self.embed_dim, self.vocab_size)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std as f64,
                })
                .init(device),
        }
    }
}

/// Latent regressor and decoder operating on the masked patch queries.
#[derive(Module, Debug)]
pub struct PretextNeck<B: Backend> {
    regressor_blocks: Vec<RegressorBlock<B>>,
    decoder_blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
    norm2: LayerNorm<B>,
    head: Linear<B>,
}

impl<B: Backend> PretextNeck<B> {
    /// Returns the token logits together with the regressed latents that the
    /// alignment loss is computed on. Every regressor block cross-attends
    /// from the masked queries into the visible tokens concatenated with the
    /// current masked tokens.
    pub fn forward(
        &self,
        masked: Tensor<B, 3>,
        visible: Tensor<B, 3>,
        pos_masked: Tensor<B, 3>,
        pos_visible: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let kv_pos = Tensor::cat(vec![pos_visible, pos_masked.clone()], 1);

        let mut masked = masked;
        for block in &self.regressor_blocks {
            let keyvalues = Tensor::cat(vec![visible.clone(), masked.clone()], 1);
            masked = block.forward(masked, keyvalues, pos_masked.clone(), kv_pos.clone());
        }
        let latent_pred = self.norm.forward(masked);

        // the decoder re-adds the position embedding, mirroring the encoder
        let mut decoded = latent_pred.clone() + pos_masked;
        for block in &self.decoder_blocks {
            decoded = block.forward(decoded);
        }
        let decoded = self.norm2.forward(decoded);

        let logits = self.head.forward(decoded);

        (logits, latent_pred)
    }
}

#[test]
fn test_neck_output_shapes() {
    let device = NdArrayDevice::Cpu;

    let neck = PretextNeckConfig {
        embed_dim: 16,
        num_heads: 2,
        vocab_size: 12,
        regressor_depth: 2,
        decoder_depth: 2,
        mlp_ratio: 4.0,
        qkv_bias: true,
        qk_scale: None,
        drop: 0.0,
        attn_drop: 0.0,
        drop_path: 0.0,
        layer_scale_init: 0.0,
        init_std: 0.02,
        norm_eps: 1e-6,
        skip_rescale: false,
    }
    .init::<NdArray>(&device);

    let masked = Tensor::random([2, 5, 16], Distribution::Normal(0.0, 1.0), &device);
    let visible = Tensor::random([2, 9, 16], Distribution::Normal(0.0, 1.0), &device);
    let pos_masked = Tensor::random([2, 5, 16], Distribution::Normal(0.0, 1.0), &device);
    let pos_visible = Tensor::random([2, 9, 16], Distribution::Normal(0.0, 1.0), &device);

    let (logits, latent_pred) = neck.forward(masked, visible, pos_masked, pos_visible);

    assert_eq!(logits.dims(), [2, 5, 12]);
    assert_eq!(latent_pred.dims(), [2, 5, 16]);
}
