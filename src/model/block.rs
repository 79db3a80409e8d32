use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{
    Dropout, DropoutConfig, Gelu, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
};
use burn::prelude::{Backend, Tensor};
use burn::tensor::Distribution;
use itertools::Itertools;

use crate::model::attention::{Attention, AttentionConfig, CrossAttention, CrossAttentionConfig};

/// Per-block droppath rates ramping linearly from zero to `rate` over the
/// stack depth.
pub(crate) fn stochastic_depth_rates(rate: f32, depth: usize) -> Vec<f32> {
    (0..depth)
        .map(|i| {
            if depth <= 1 {
                0.0
            } else {
                rate * i as f32 / (depth - 1) as f32
            }
        })
        .collect_vec()
}

/// Per-sample stochastic depth. During autodiff-enabled execution each
/// sample's residual branch is dropped whole with probability `prob` and the
/// survivors are rescaled; outside of training the branch passes through
/// untouched.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward<B: Backend>(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return input;
        }

        let [batch, _, _] = input.dims();
        let keep = 1.0 - self.prob;
        let gate = Tensor::random([batch, 1, 1], Distribution::Bernoulli(keep), &input.device());

        input * gate * (1.0 / keep)
    }
}

/// Per-channel multiplier on a residual branch. `frozen_unit` produces the
/// always-present variant whose gamma stays at one and takes no gradient.
#[derive(Module, Debug)]
pub struct LayerScale<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
}

impl<B: Backend> LayerScale<B> {
    pub fn learned(dim: usize, init_value: f32, device: &B::Device) -> Self {
        LayerScale {
            gamma: Param::from_tensor(Tensor::ones([dim], device) * init_value),
        }
    }

    pub fn frozen_unit(dim: usize, device: &B::Device) -> Self {
        let scale = LayerScale {
            gamma: Param::from_tensor(Tensor::ones([dim], device)),
        };
        scale.no_grad()
    }

    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        hidden * self.gamma.val().unsqueeze_dims::<3>(&[0, 1])
    }
}

#[derive(Config)]
pub struct MlpConfig {
    pub in_features: usize,
    pub hidden_features: usize,
    pub drop: f32,
    pub init_std: f32,
}

impl MlpConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> Mlp<B> {
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std as f64,
        };

        Mlp {
            fc1: LinearConfig::new(self.in_features, self.hidden_features)
                .with_initializer(initializer.clone())
                .init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(self.hidden_features, self.in_features)
                .with_initializer(initializer)
                .init(device),
            drop: DropoutConfig::new(self.drop as f64).init(),
        }
    }
}

/// Two-layer feed-forward with gelu; dropout is applied after the second
/// projection only.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    fc1: Linear<B>,
    act: Gelu,
    fc2: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.fc1.forward(hidden);
        let hidden = self.act.forward(hidden);
        let hidden = self.fc2.forward(hidden);
        let hidden = self.drop.forward(hidden);
        hidden
    }

    fn rescale_output(mut self, factor: f32) -> Self {
        self.fc2.weight = self.fc2.weight.map(|weight| weight / factor);
        self
    }
}

#[derive(Config)]
pub struct TransformerBlockConfig {
    pub embed_dim: usize,
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
}

impl TransformerBlockConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> TransformerBlock<B> {
        let hidden_features = (self.embed_dim as f32 * self.mlp_ratio) as usize;
        let layer_scale = self.layer_scale_init > 0.0;

        TransformerBlock {
            norm1: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            attn: AttentionConfig {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
                qkv_bias: self.qkv_bias,
                qk_scale: self.qk_scale,
                attn_head_dim: self.attn_head_dim,
                attn_drop: self.attn_drop,
                proj_drop: self.drop,
                init_std: self.init_std,
            }
            .init(device),
            drop_path: DropPath::new(self.drop_path as f64),
            norm2: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            mlp: MlpConfig {
                in_features: self.embed_dim,
                hidden_features,
                drop: self.drop,
                init_std: self.init_std,
            }
            .init(device),
            scale_attn: layer_scale
                .then(|| LayerScale::learned(self.embed_dim, self.layer_scale_init, device)),
            scale_mlp: layer_scale
                .then(|| LayerScale::learned(self.embed_dim, self.layer_scale_init, device)),
        }
    }
}

/// Pre-norm residual block: self-attention then mlp, each branch optionally
/// gated by a learned layer scale and a droppath.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    drop_path: DropPath,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    scale_attn: Option<LayerScale<B>>,
    scale_mlp: Option<LayerScale<B>>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let attended = self.attn.forward(self.norm1.forward(hidden.clone()));
        let attended = match &self.scale_attn {
            Some(scale) => scale.forward(attended),
            None => attended,
        };
        let hidden = hidden + self.drop_path.forward(attended);

        let expanded = self.mlp.forward(self.norm2.forward(hidden.clone()));
        let expanded = match &self.scale_mlp {
            Some(scale) => scale.forward(expanded),
            None => expanded,
        };
        let hidden = hidden + self.drop_path.forward(expanded);

        hidden
    }

    /// Depth-aware init: divides the attention output projection and the
    /// second mlp weight by `sqrt(2 * layer_index)`, with `layer_index`
    /// starting at one.
    pub fn rescaled(mut self, layer_index: usize) -> Self {
        let factor = (2.0 * layer_index as f32).sqrt();
        self.attn = self.attn.rescale_proj(factor);
        self.mlp = self.mlp.rescale_output(factor);
        self
    }
}

#[derive(Config)]
pub struct RegressorBlockConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub mlp_ratio: f32,
    pub qkv_bias: bool,
    pub qk_scale: Option<f32>,
    pub drop: f32,
    pub attn_drop: f32,
    pub drop_path: f32,
    pub layer_scale_init: f32,
    pub init_std: f32,
    pub norm_eps: f32,
}

impl RegressorBlockConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> RegressorBlock<B> {
        let hidden_features = (self.embed_dim as f32 * self.mlp_ratio) as usize;

        let (scale_attn, scale_mlp) = if self.layer_scale_init > 0.0 {
            (
                LayerScale::learned(self.embed_dim, self.layer_scale_init, device),
                LayerScale::learned(self.embed_dim, self.layer_scale_init, device),
            )
        } else {
            (
                LayerScale::frozen_unit(self.embed_dim, device),
                LayerScale::frozen_unit(self.embed_dim, device),
            )
        };

        RegressorBlock {
            norm1_q: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            norm1_k: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            norm1_v: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            cross_attn: CrossAttentionConfig {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
                qkv_bias: self.qkv_bias,
                qk_scale: self.qk_scale,
                attn_head_dim: None,
                attn_drop: self.attn_drop,
                proj_drop: self.drop,
                init_std: self.init_std,
            }
            .init(device),
            norm2: LayerNormConfig::new(self.embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
            mlp: MlpConfig {
                in_features: self.embed_dim,
                hidden_features,
                drop: self.drop,
                init_std: self.init_std,
            }
            .init(device),
            drop_path: DropPath::new(self.drop_path as f64),
            scale_attn,
            scale_mlp,
        }
    }
}

/// Cross-attention residual block for the latent regressor. Queries and keys
/// receive their position embeddings before normalization, values do not;
/// after the attention residual the tokens are renormalized before the mlp
/// residual is applied on top. The layer scale is always materialized here:
/// learned when enabled, otherwise a frozen unit gamma.
#[derive(Module, Debug)]
pub struct RegressorBlock<B: Backend> {
    norm1_q: LayerNorm<B>,
    norm1_k: LayerNorm<B>,
    norm1_v: LayerNorm<B>,
    cross_attn: CrossAttention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    drop_path: DropPath,
    scale_attn: LayerScale<B>,
    scale_mlp: LayerScale<B>,
}

impl<B: Backend> RegressorBlock<B> {
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keyvalues: Tensor<B, 3>,
        pos_q: Tensor<B, 3>,
        pos_k: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let attended = self.cross_attn.forward(
            self.norm1_q.forward(queries.clone() + pos_q),
            self.norm1_k.forward(keyvalues.clone() + pos_k),
            self.norm1_v.forward(keyvalues),
        );
        let hidden = queries + self.drop_path.forward(self.scale_attn.forward(attended));

        let hidden = self.norm2.forward(hidden);
        let expanded = self.scale_mlp.forward(self.mlp.forward(hidden.clone()));
        let hidden = hidden + self.drop_path.forward(expanded);

        hidden
    }

    pub fn rescaled(mut self, layer_index: usize) -> Self {
        let factor = (2.0 * layer_index as f32).sqrt();
        self.cross_attn = self.cross_attn.rescale_proj(factor);
        self.mlp = self.mlp.rescale_output(factor);
        self
    }
}

#[test]
fn test_stochastic_depth_rates_ramp() {
    let rates = stochastic_depth_rates(0.3, 4);

    assert_eq!(rates.len(), 4);
    assert_eq!(rates[0], 0.0);
    assert!((rates[3] - 0.3).abs() < 1e-6);
    assert!(rates.windows(2).all(|pair| pair[0] <= pair[1]));

    assert_eq!(stochastic_depth_rates(0.3, 1), vec![0.0]);
}

#[test]
fn test_droppath_passes_through_without_autodiff() {
    let device = NdArrayDevice::Cpu;

    let drop_path = DropPath::new(0.9);
    let hidden =
        Tensor::<NdArray, 3>::random([2, 4, 8], Distribution::Normal(0.0, 1.0), &device);

    drop_path
        .forward(hidden.clone())
        .to_data()
        .assert_eq(&hidden.to_data(), true);
}

#[test]
fn test_droppath_gates_whole_samples_under_autodiff() {
    let device = NdArrayDevice::Cpu;

    let drop_path = DropPath::new(0.5);
    let hidden = Tensor::<Autodiff<NdArray>, 3>::ones([4, 2, 3], &device);

    let gated = drop_path.forward(hidden);
    let values = gated.to_data().to_vec::<f32>().unwrap();

    // every sample is either dropped entirely or rescaled by 1 / keep
    for sample in values.chunks(6) {
        let all_zero = sample.iter().all(|value| value.abs() < 1e-6);
        let all_scaled = sample.iter().all(|value| (value - 2.0).abs() < 1e-5);
        assert!(all_zero || all_scaled);
    }
}

#[test]
fn test_layer_scale_frozen_unit_is_identity() {
    let device = NdArrayDevice::Cpu;

    let scale = LayerScale::<NdArray>::frozen_unit(8, &device);
    let hidden = Tensor::random([2, 3, 8], Distribution::Normal(0.0, 1.0), &device);

    scale
        .forward(hidden.clone())
        .to_data()
        .assert_approx_eq(&hidden.to_data(), 6);
}

#[test]
fn test_layer_scale_learned_scales_channels() {
    let device = NdArrayDevice::Cpu;

    let scale = LayerScale::<NdArray>::learned(4, 0.1, &device);
    let scaled = scale.forward(Tensor::ones([1, 2, 4], &device));

    for value in scaled.to_data().to_vec::<f32>().unwrap() {
        assert!((value - 0.1).abs() < 1e-6);
    }
}

#[test]
fn test_transformer_block_preserves_shape() {
    let device = NdArrayDevice::Cpu;

    let block = TransformerBlockConfig {
        embed_dim: 16,
        num_heads: 4,
        mlp_ratio: 4.0,
        qkv_bias: true,
        qk_scale: None,
        attn_head_dim: None,
        drop: 0.0,
        attn_drop: 0.0,
        drop_path: 0.0,
        layer_scale_init: 0.1,
        init_std: 0.02,
        norm_eps: 1e-6,
    }
    .init::<NdArray>(&device)
    .rescaled(3);

    let hidden = Tensor::random([2, 5, 16], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(block.forward(hidden).dims(), [2, 5, 16]);
}

#[test]
fn test_regressor_block_output_tracks_queries() {
    let device = NdArrayDevice::Cpu;

    let block = RegressorBlockConfig {
        embed_dim: 16,
        num_heads: 2,
        mlp_ratio: 4.0,
        qkv_bias: true,
        qk_scale: None,
        drop: 0.0,
        attn_drop: 0.0,
        drop_path: 0.0,
        layer_scale_init: 0.0,
        init_std: 0.02,
        norm_eps: 1e-6,
    }
    .init::<NdArray>(&device)
    .rescaled(1);

    let queries = Tensor::random([2, 3, 16], Distribution::Normal(0.0, 1.0), &device);
    let keyvalues = Tensor::random([2, 7, 16], Distribution::Normal(0.0, 1.0), &device);
    let pos_q = Tensor::random([2, 3, 16], Distribution::Normal(0.0, 1.0), &device);
    let pos_k = Tensor::random([2, 7, 16], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(
        block.forward(queries, keyvalues, pos_q, pos_k).dims(),
        [2, 3, 16]
    );
}
