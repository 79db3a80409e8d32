use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};

pub(crate) fn sample_image_batch<B: Backend>(
    batch_size: usize,
    channels: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::random(
        [batch_size, channels, image_size, image_size],
        Distribution::Uniform(0.0, 1.0),
        device,
    )
}
