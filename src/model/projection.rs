use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Distribution, ElementConversion, Tensor};

/// Projects encoder tokens into the decoder width and renormalizes them.
/// Only instantiated when the two widths differ.
#[derive(Module, Debug)]
pub struct EncoderToDecoder<B: Backend> {
    linear: Linear<B>,
    norm: LayerNorm<B>,
}

#[derive(Config)]
pub struct EncoderToDecoderConfig {
    pub embed_dim: usize,
    pub decoder_embed_dim: usize,
    pub init_std: f32,
    pub norm_eps: f32,
}

impl EncoderToDecoderConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> EncoderToDecoder<B> {
        EncoderToDecoder {
            linear: LinearConfig::new(self.embed_dim, self.decoder_embed_dim)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std as f64,
                })
                .init(device),
            norm: LayerNormConfig::new(self.decoder_embed_dim)
                .with_epsilon(self.norm_eps as f64)
                .init(device),
        }
    }
}

impl<B: Backend> EncoderToDecoder<B> {
    pub fn forward(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        let tokens = self.linear.forward(tokens);
        let tokens = self.norm.forward(tokens);
        tokens
    }
}

#[test]
fn test_projection_moves_tokens_into_decoder_width() {
    let device = NdArrayDevice::Cpu;

    let projection = EncoderToDecoderConfig {
        embed_dim: 24,
        decoder_embed_dim: 16,
        init_std: 0.02,
        norm_eps: 1e-6,
    }
    .init::<NdArray>(&device);

    let tokens = Tensor::random([2, 5, 24], Distribution::Normal(0.0, 1.0), &device);
    let projected = projection.forward(tokens);

    assert_eq!(projected.dims(), [2, 5, 16]);

    // a freshly initialized layer norm centers every token
    let worst_mean: f32 = projected.mean_dim(2).abs().max().into_scalar().elem();
    assert!(worst_mean < 1e-4);
}
