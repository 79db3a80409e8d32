use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::prelude::{Backend, Int};
use burn::tensor::{Bool, ElementConversion, Tensor, TensorData};
use itertools::Itertools;

use crate::error::ModelError;

/// Validated per-sample patch mask. Construction guarantees that every row
/// masks the same number of patches and that both partitions are non-empty.
#[derive(Clone, Debug)]
pub struct PatchMask<B: Backend> {
    mask: Tensor<B, 2, Bool>,
    masked_indices: Tensor<B, 2, Int>,
    visible_indices: Tensor<B, 2, Int>,
    num_masked: usize,
    num_visible: usize,
}

impl<B: Backend> PatchMask<B> {
    pub fn new(mask: Tensor<B, 2, Bool>, expected_patches: usize) -> Result<Self, ModelError> {
        let [batch_size, num_patches] = mask.dims();

        if num_patches != expected_patches {
            return Err(ModelError::MaskLength {
                expected: expected_patches,
                found: num_patches,
            });
        }

        let counts = mask
            .clone()
            .int()
            .sum_dim(1)
            .to_data()
            .to_vec::<B::IntElem>()
            .unwrap()
            .into_iter()
            .map(|count| count.elem::<i64>() as usize)
            .collect_vec();

        if !counts.iter().all_equal() {
            return Err(ModelError::RaggedMask { counts });
        }

        let num_masked = counts.first().copied().unwrap_or(0);
        if num_masked == 0 || num_masked == num_patches {
            return Err(ModelError::DegenerateMask {
                masked: num_masked,
                total: num_patches,
            });
        }
        let num_visible = num_patches - num_masked;

        let masked_indices = mask.clone().nonzero()[1]
            .clone()
            .reshape([batch_size, num_masked]);
        let visible_indices = mask.clone().bool_not().nonzero()[1]
            .clone()
            .reshape([batch_size, num_visible]);

        Ok(PatchMask {
            mask,
            masked_indices,
            visible_indices,
            num_masked,
            num_visible,
        })
    }

    /// Same partition with the roles flipped: masked patches become visible
    /// and vice versa.
    pub fn complement(&self) -> Self {
        PatchMask {
            mask: self.mask.clone().bool_not(),
            masked_indices: self.visible_indices.clone(),
            visible_indices: self.masked_indices.clone(),
            num_masked: self.num_visible,
            num_visible: self.num_masked,
        }
    }

    pub fn select_visible(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        gather_tokens(tokens, self.visible_indices.clone())
    }

    pub fn select_masked(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        gather_tokens(tokens, self.masked_indices.clone())
    }

    pub fn mask(&self) -> Tensor<B, 2, Bool> {
        self.mask.clone()
    }

    pub fn masked_indices(&self) -> Tensor<B, 2, Int> {
        self.masked_indices.clone()
    }

    pub fn visible_indices(&self) -> Tensor<B, 2, Int> {
        self.visible_indices.clone()
    }

    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn num_patches(&self) -> usize {
        self.num_masked + self.num_visible
    }

    pub fn num_masked(&self) -> usize {
        self.num_masked
    }

    pub fn num_visible(&self) -> usize {
        self.num_visible
    }
}

fn gather_tokens<B: Backend>(tokens: Tensor<B, 3>, indices: Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let [batch_size, _, embed_dim] = tokens.dims();
    let [_, count] = indices.dims();

    let indices = indices
        .unsqueeze_dim::<3>(2)
        .expand([batch_size, count, embed_dim]);

    tokens.gather(1, indices)
}

/// Draws `num_masked` patches uniformly without replacement, independently
/// for every sample in the batch.
pub fn sample_patch_mask<B: Backend>(
    batch_size: usize,
    num_patches: usize,
    num_masked: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    assert!(
        num_masked > 0 && num_masked < num_patches,
        "mask must leave at least one visible and one masked patch"
    );

    let mut rng = rand::thread_rng();
    let mut rows = vec![0i32; batch_size * num_patches];
    for row in rows.chunks_mut(num_patches) {
        for index in rand::seq::index::sample(&mut rng, num_patches, num_masked) {
            row[index] = 1;
        }
    }

    let data = TensorData::new(rows, [batch_size, num_patches]);
    Tensor::<B, 2, Int>::from_data(data, device).bool()
}

#[test]
fn test_patch_mask_splits_indices() {
    let device = NdArrayDevice::Cpu;

    let mask = Tensor::<NdArray, 2, Int>::from_ints([[0, 1, 1, 0], [1, 0, 0, 1]], &device).bool();
    let mask = PatchMask::new(mask, 4).unwrap();

    assert_eq!(mask.num_masked(), 2);
    assert_eq!(mask.num_visible(), 2);
    assert_eq!(mask.batch_size(), 2);

    let masked = mask.masked_indices().to_data().to_vec::<i64>().unwrap();
    let visible = mask.visible_indices().to_data().to_vec::<i64>().unwrap();

    assert_eq!(masked, vec![1, 2, 0, 3]);
    assert_eq!(visible, vec![0, 3, 1, 2]);
}

#[test]
fn test_patch_mask_gathers_rows() {
    let device = NdArrayDevice::Cpu;

    let mask = Tensor::<NdArray, 2, Int>::from_ints([[0, 1, 1, 0], [1, 0, 0, 1]], &device).bool();
    let mask = PatchMask::new(mask, 4).unwrap();

    let values = (0..24).map(|value| value as f32).collect_vec();
    let tokens = Tensor::<NdArray, 3>::from_data(TensorData::new(values, [2, 4, 3]), &device);

    let masked = mask.select_masked(tokens).to_data().to_vec::<f32>().unwrap();

    assert_eq!(
        masked,
        vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 12.0, 13.0, 14.0, 21.0, 22.0, 23.0]
    );
}

#[test]
fn test_patch_mask_complement_swaps_partitions() {
    let device = NdArrayDevice::Cpu;

    let mask = Tensor::<NdArray, 2, Int>::from_ints([[0, 1, 1, 1], [1, 1, 0, 1]], &device).bool();
    let mask = PatchMask::new(mask, 4).unwrap();
    let complement = mask.complement();

    assert_eq!(complement.num_masked(), 1);
    assert_eq!(complement.num_visible(), 3);
    complement
        .masked_indices()
        .to_data()
        .assert_eq(&mask.visible_indices().to_data(), true);
    complement
        .visible_indices()
        .to_data()
        .assert_eq(&mask.masked_indices().to_data(), true);
    complement
        .mask()
        .to_data()
        .assert_eq(&mask.mask().bool_not().to_data(), true);
}

#[test]
fn test_patch_mask_partition_is_disjoint_and_exhaustive() {
    let device = NdArrayDevice::Cpu;

    let mask = sample_patch_mask::<NdArray>(4, 12, 7, &device);
    let mask = PatchMask::new(mask, 12).unwrap();

    let masked = mask.masked_indices().to_data().to_vec::<i64>().unwrap();
    let visible = mask.visible_indices().to_data().to_vec::<i64>().unwrap();

    for (masked_row, visible_row) in masked.chunks(7).zip(visible.chunks(5)) {
        let mut all = masked_row.to_vec();
        all.extend_from_slice(visible_row);
        all.sort_unstable();
        assert_eq!(all, (0..12).collect_vec());
    }
}

#[test]
fn test_patch_mask_rejects_ragged_rows() {
    let device = NdArrayDevice::Cpu;

    let mask = Tensor::<NdArray, 2, Int>::from_ints([[1, 1, 0], [1, 0, 0]], &device).bool();

    assert!(matches!(
        PatchMask::new(mask, 3),
        Err(ModelError::RaggedMask { .. })
    ));
}

#[test]
fn test_patch_mask_rejects_degenerate_rows() {
    let device = NdArrayDevice::Cpu;

    let full = Tensor::<NdArray, 2, Int>::from_ints([[1, 1, 1]], &device).bool();
    let empty = Tensor::<NdArray, 2, Int>::from_ints([[0, 0, 0]], &device).bool();

    assert!(matches!(
        PatchMask::new(full, 3),
        Err(ModelError::DegenerateMask { masked: 3, total: 3 })
    ));
    assert!(matches!(
        PatchMask::new(empty, 3),
        Err(ModelError::DegenerateMask { masked: 0, total: 3 })
    ));
}

#[test]
fn test_patch_mask_rejects_wrong_length() {
    let device = NdArrayDevice::Cpu;

    let mask = Tensor::<NdArray, 2, Int>::from_ints([[1, 0, 0, 1]], &device).bool();

    assert!(matches!(
        PatchMask::new(mask, 5),
        Err(ModelError::MaskLength {
            expected: 5,
            found: 4
        })
    ));
}

#[test]
fn test_sample_patch_mask_is_uniform_per_row() {
    let device = NdArrayDevice::Cpu;

    let mask = sample_patch_mask::<NdArray>(3, 10, 4, &device);
    let mask = PatchMask::new(mask, 10).unwrap();

    assert_eq!(mask.num_masked(), 4);
    assert_eq!(mask.num_visible(), 6);
}
