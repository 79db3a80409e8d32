use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;

/// Scaled dot-product attention weights for head-split inputs
/// `[batch, heads, seq, head_dim]`. The query must already carry its scale
/// factor; every returned row is softmax-normalized over the keys.
pub(crate) fn attention_probs<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let scores = query.matmul(key.swap_dims(2, 3));
    softmax(scores, 3)
}

#[derive(Config)]
pub struct AttentionConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub qkv_bias: bool,
    pub qk_scale: Option<f32>,
    pub attn_head_dim: Option<usize>,
    pub attn_drop: f32,
    pub proj_drop: f32,
    pub init_std: f32,
}

impl AttentionConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> Attention<B> {
        let head_dim = self.attn_head_dim.unwrap_or(self.embed_dim / self.num_heads);
        let all_head_dim = head_dim * self.num_heads;
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std as f64,
        };

        Attention {
            qkv: LinearConfig::new(self.embed_dim, all_head_dim * 3)
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device),
            q_bias: self
                .qkv_bias
                .then(|| Param::from_tensor(Tensor::zeros([all_head_dim], device))),
            v_bias: self
                .qkv_bias
                .then(|| Param::from_tensor(Tensor::zeros([all_head_dim], device))),
            proj: LinearConfig::new(all_head_dim, self.embed_dim)
                .with_initializer(initializer)
                .init(device),
            attn_drop: DropoutConfig::new(self.attn_drop as f64).init(),
            proj_drop: DropoutConfig::new(self.proj_drop as f64).init(),
            num_heads: self.num_heads,
            head_dim,
            scale: self
                .qk_scale
                .unwrap_or_else(|| f32::powf(head_dim as f32, -0.5)),
        }
    }
}

/// Multi-head self-attention with a fused query/key/value projection. The
/// fused projection carries no built-in bias; when `qkv_bias` is set, learned
/// bias vectors are added to the query and value streams while the key stream
/// stays bias-free.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    qkv: Linear<B>,
    q_bias: Option<Param<Tensor<B, 1>>>,
    v_bias: Option<Param<Tensor<B, 1>>>,
    proj: Linear<B>,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f32,
}

impl<B: Backend> Attention<B> {
    fn split_heads(&self, tensor: Tensor<B, 3>, batch: usize) -> Tensor<B, 4> {
        tensor
            .reshape([batch as i32, -1, self.num_heads as i32, self.head_dim as i32])
            .swap_dims(1, 2)
    }

    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq, _] = hidden.dims();

        let qkv = self.qkv.forward(hidden);
        let mut streams = qkv.chunk(3, 2).into_iter();
        let query = streams.next().unwrap();
        let key = streams.next().unwrap();
        let value = streams.next().unwrap();

        let query = match &self.q_bias {
            Some(bias) => query + bias.val().unsqueeze_dims::<3>(&[0, 1]),
            None => query,
        };
        let value = match &self.v_bias {
            Some(bias) => value + bias.val().unsqueeze_dims::<3>(&[0, 1]),
            None => value,
        };

        let query = self.split_heads(query * self.scale, batch);
        let key = self.split_heads(key, batch);
        let value = self.split_heads(value, batch);

        let probs = attention_probs(query, key);
        let probs = self.attn_drop.forward(probs);

        let context = probs.matmul(value);
        let context = context.swap_dims(1, 2).reshape([batch as i32, seq as i32, -1]);

        let output = self.proj.forward(context);
        let output = self.proj_drop.forward(output);

        output
    }

    pub(crate) fn rescale_proj(mut self, factor: f32) -> Self {
        self.proj.weight = self.proj.weight.map(|weight| weight / factor);
        self
    }
}

#[derive(Config)]
pub struct CrossAttentionConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub qkv_bias: bool,
    pub qk_scale: Option<f32>,
    pub attn_head_dim: Option<usize>,
    pub attn_drop: f32,
    pub proj_drop: f32,
    pub init_std: f32,
}

impl CrossAttentionConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> CrossAttention<B> {
        let head_dim = self.attn_head_dim.unwrap_or(self.embed_dim / self.num_heads);
        let all_head_dim = head_dim * self.num_heads;
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std as f64,
        };

        CrossAttention {
            query: LinearConfig::new(self.embed_dim, all_head_dim)
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device),
            key: LinearConfig::new(self.embed_dim, all_head_dim)
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device),
            value: LinearConfig::new(self.embed_dim, all_head_dim)
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device),
            q_bias: self
                .qkv_bias
                .then(|| Param::from_tensor(Tensor::zeros([all_head_dim], device))),
            v_bias: self
                .qkv_bias
                .then(|| Param::from_tensor(Tensor::zeros([all_head_dim], device))),
            proj: LinearConfig::new(all_head_dim, self.embed_dim)
                .with_initializer(initializer)
                .init(device),
            attn_drop: DropoutConfig::new(self.attn_drop as f64).init(),
            proj_drop: DropoutConfig::new(self.proj_drop as f64).init(),
            num_heads: self.num_heads,
            head_dim,
            scale: self
                .qk_scale
                .unwrap_or_else(|| f32::powf(head_dim as f32, -0.5)),
        }
    }
}

/// Multi-head attention across two token sets: queries come from one
/// sequence, keys and values from another. Projections are kept separate so
/// the two sequences can differ in length; the bias layout matches
/// [`Attention`], with the key stream always bias-free.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    q_bias: Option<Param<Tensor<B, 1>>>,
    v_bias: Option<Param<Tensor<B, 1>>>,
    proj: Linear<B>,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f32,
}

impl<B: Backend> CrossAttention<B> {
    fn split_heads(&self, tensor: Tensor<B, 3>, batch: usize) -> Tensor<B, 4> {
        tensor
            .reshape([batch as i32, -1, self.num_heads as i32, self.head_dim as i32])
            .swap_dims(1, 2)
    }

    /// Output length always matches the query sequence.
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [batch, num_queries, _] = queries.dims();

        let query = self.query.forward(queries);
        let key = self.key.forward(keys);
        let value = self.value.forward(values);

        let query = match &self.q_bias {
            Some(bias) => query + bias.val().unsqueeze_dims::<3>(&[0, 1]),
            None => query,
        };
        let value = match &self.v_bias {
            Some(bias) => value + bias.val().unsqueeze_dims::<3>(&[0, 1]),
            None => value,
        };

        let query = self.split_heads(query * self.scale, batch);
        let key = self.split_heads(key, batch);
        let value = self.split_heads(value, batch);

        let probs = attention_probs(query, key);
        let probs = self.attn_drop.forward(probs);

        let context = probs.matmul(value);
        let context = context
            .swap_dims(1, 2)
            .reshape([batch as i32, num_queries as i32, -1]);

        let output = self.proj.forward(context);
        let output = self.proj_drop.forward(output);

        output
    }

    pub(crate) fn rescale_proj(mut self, factor: f32) -> Self {
        self.proj.weight = self.proj.weight.map(|weight| weight / factor);
        self
    }
}

#[test]
fn test_attention_rows_are_stochastic() {
    let device = NdArrayDevice::Cpu;

    let query =
        Tensor::<NdArray, 4>::random([2, 3, 5, 8], Distribution::Normal(0.0, 1.0), &device);
    let key = Tensor::random([2, 3, 7, 8], Distribution::Normal(0.0, 1.0), &device);

    let probs = attention_probs(query, key);
    assert_eq!(probs.dims(), [2, 3, 5, 7]);

    let row_sums = probs.sum_dim(3).to_data().to_vec::<f32>().unwrap();
    for sum in row_sums {
        assert!((sum - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_attention_preserves_shape() {
    let device = NdArrayDevice::Cpu;

    let attention = AttentionConfig {
        embed_dim: 16,
        num_heads: 4,
        qkv_bias: true,
        qk_scale: None,
        attn_head_dim: None,
        attn_drop: 0.0,
        proj_drop: 0.0,
        init_std: 0.02,
    }
    .init::<NdArray>(&device);

    let hidden = Tensor::random([2, 6, 16], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(attention.forward(hidden).dims(), [2, 6, 16]);
}

#[test]
fn test_attention_head_dim_override_keeps_output_width() {
    let device = NdArrayDevice::Cpu;

    let attention = AttentionConfig {
        embed_dim: 12,
        num_heads: 3,
        qkv_bias: false,
        qk_scale: Some(0.5),
        attn_head_dim: Some(8),
        attn_drop: 0.0,
        proj_drop: 0.0,
        init_std: 0.02,
    }
    .init::<NdArray>(&device);

    let hidden = Tensor::random([1, 5, 12], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(attention.forward(hidden).dims(), [1, 5, 12]);
}

#[test]
fn test_cross_attention_output_matches_query_length() {
    let device = NdArrayDevice::Cpu;

    let cross = CrossAttentionConfig {
        embed_dim: 16,
        num_heads: 2,
        qkv_bias: true,
        qk_scale: None,
        attn_head_dim: None,
        attn_drop: 0.0,
        proj_drop: 0.0,
        init_std: 0.02,
    }
    .init::<NdArray>(&device);

    let queries = Tensor::random([2, 4, 16], Distribution::Normal(0.0, 1.0), &device);
    let keys = Tensor::random([2, 9, 16], Distribution::Normal(0.0, 1.0), &device);
    let values = Tensor::random([2, 9, 16], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(cross.forward(queries, keys, values).dims(), [2, 4, 16]);
}
