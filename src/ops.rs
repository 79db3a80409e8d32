use std::collections::VecDeque;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::nn::LinearConfig;
use burn::prelude::{Backend, Tensor};
use burn::tensor::Distribution;

/// Normal sample clipped to one standard deviation, used to seed the learned
/// class and mask tokens.
pub fn trunc_normal<B: Backend, const D: usize>(
    shape: [usize; D],
    std: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::random(shape, Distribution::Normal(0.0, std as f64), device).clamp(-std, std)
}

/// Flattened copy of every float parameter of a module, in traversal order.
pub struct ParamSnapshot<B: Backend> {
    pub tensors: VecDeque<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> ParamSnapshot<B> {
    pub fn take<M: Module<B>>(module: &M) -> Self {
        let mut snapshot = ParamSnapshot {
            tensors: VecDeque::new(),
        };
        module.visit(&mut snapshot);
        snapshot
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamSnapshot<B> {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims().to_vec();
        let flat = tensor.clone().detach().flatten::<1>(0, D - 1);
        self.tensors.push_back((dims, flat));
    }
}

struct EmaUpdate<B: Backend> {
    momentum: f32,
    source: VecDeque<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> ModuleMapper<B> for EmaUpdate<B> {
    fn map_float<const D: usize>(&mut self, _id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some((dims, source)) = self.source.pop_front() else {
            panic!("ema target has more parameters than its source module")
        };
        assert_eq!(
            dims,
            tensor.dims().to_vec(),
            "ema source and target parameter shapes diverged"
        );

        let source = source.reshape(tensor.dims());
        tensor.detach() * self.momentum + source * (1.0 - self.momentum)
    }
}

/// Blends every parameter of `target` towards the matching parameter of
/// `source`: `target * momentum + source * (1 - momentum)`. Both modules must
/// be the same type so the derived traversals line up; a shape mismatch or a
/// leftover parameter on either side panics.
pub fn ema_update<B: Backend, M: Module<B>>(target: M, source: &M, momentum: f32) -> M {
    let snapshot = ParamSnapshot::take(source);
    let mut update = EmaUpdate {
        momentum,
        source: snapshot.tensors,
    };
    let target = target.map(&mut update);
    assert!(
        update.source.is_empty(),
        "ema source has more parameters than its target module"
    );
    target
}

#[test]
fn test_trunc_normal_stays_within_one_std() {
    let device = NdArrayDevice::Cpu;

    let sampled = trunc_normal::<NdArray, 2>([64, 64], 0.02, &device);
    let max = sampled.abs().max().to_data().to_vec::<f32>().unwrap()[0];

    assert!(max <= 0.02 + 1e-7);
}

#[test]
fn test_ema_update_blends_parameters() {
    let device = NdArrayDevice::Cpu;

    let source = LinearConfig::new(4, 3).init::<NdArray>(&device);
    let target = LinearConfig::new(4, 3).init::<NdArray>(&device);

    let target_before = ParamSnapshot::take(&target);
    let source_before = ParamSnapshot::take(&source);

    let target = ema_update(target, &source, 0.75);

    let target_after = ParamSnapshot::take(&target);
    assert_eq!(target_after.tensors.len(), target_before.tensors.len());

    for (((_, old), (_, new)), (_, src)) in target_before
        .tensors
        .iter()
        .zip(target_after.tensors.iter())
        .zip(source_before.tensors.iter())
    {
        let expected = old.clone() * 0.75 + src.clone() * 0.25;
        new.to_data().assert_approx_eq(&expected.to_data(), 5);
    }
}

#[test]
#[should_panic]
fn test_ema_update_rejects_mismatched_shapes() {
    let device = NdArrayDevice::Cpu;

    let source = LinearConfig::new(4, 3).init::<NdArray>(&device);
    let target = LinearConfig::new(4, 5).init::<NdArray>(&device);

    ema_update(target, &source, 0.5);
}
