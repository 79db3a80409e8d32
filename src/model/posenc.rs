use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::prelude::{Backend, Tensor};
use burn::tensor::TensorData;
use itertools::Itertools;

use crate::error::ModelError;

pub const SINCOS_TEMPERATURE: f32 = 10_000.0;

/// Fixed 2d sin-cos position table for a patch grid, shaped
/// `[1, rows, embed_dim]` where `rows` is `grid_h * grid_w` plus one leading
/// zero row when `with_cls_slot` is set. The flattened grid index `k` maps to
/// cell `(k / grid_w, k % grid_w)`; each row lays out `[sin(col), cos(col),
/// sin(row), cos(row)]` blocks of `embed_dim / 4` frequency channels. The
/// table is rebuilt on demand and never trained.
pub fn build_2d_sincos_embedding<B: Backend>(
    embed_dim: usize,
    grid: [usize; 2],
    temperature: f32,
    with_cls_slot: bool,
    device: &B::Device,
) -> Result<Tensor<B, 3>, ModelError> {
    if embed_dim % 4 != 0 {
        return Err(ModelError::PositionEmbedDim { dim: embed_dim });
    }

    let pos_dim = embed_dim / 4;
    let omega = (0..pos_dim)
        .map(|i| 1.0 / temperature.powf(i as f32 / pos_dim as f32))
        .collect_vec();

    let [grid_h, grid_w] = grid;
    let rows = grid_h * grid_w + usize::from(with_cls_slot);

    let mut table = Vec::with_capacity(rows * embed_dim);
    if with_cls_slot {
        table.extend(vec![0.0f32; embed_dim]);
    }
    for row in 0..grid_h {
        for col in 0..grid_w {
            for &freq in &omega {
                table.push((col as f32 * freq).sin());
            }
            for &freq in &omega {
                table.push((col as f32 * freq).cos());
            }
            for &freq in &omega {
                table.push((row as f32 * freq).sin());
            }
            for &freq in &omega {
                table.push((row as f32 * freq).cos());
            }
        }
    }

    let table = Tensor::<B, 2>::from_data(TensorData::new(table, [rows, embed_dim]), device);

    Ok(table.unsqueeze_dim::<3>(0))
}

#[test]
fn test_sincos_embedding_matches_closed_form() {
    let device = NdArrayDevice::Cpu;

    let table =
        build_2d_sincos_embedding::<NdArray>(8, [3, 5], SINCOS_TEMPERATURE, false, &device)
            .unwrap();
    assert_eq!(table.dims(), [1, 15, 8]);

    let values = table.to_data().to_vec::<f32>().unwrap();

    // flattened index 7 sits at row 1, col 2 of the 3x5 grid
    let k = 7;
    let (row, col) = (k / 5, k % 5);
    let pos_dim = 2;
    for i in 0..pos_dim {
        let freq = 1.0 / SINCOS_TEMPERATURE.powf(i as f32 / pos_dim as f32);
        let base = k * 8;
        assert!((values[base + i] - (col as f32 * freq).sin()).abs() < 1e-6);
        assert!((values[base + pos_dim + i] - (col as f32 * freq).cos()).abs() < 1e-6);
        assert!((values[base + 2 * pos_dim + i] - (row as f32 * freq).sin()).abs() < 1e-6);
        assert!((values[base + 3 * pos_dim + i] - (row as f32 * freq).cos()).abs() < 1e-6);
    }
}

#[test]
fn test_sincos_embedding_is_deterministic() {
    let device = NdArrayDevice::Cpu;

    let first =
        build_2d_sincos_embedding::<NdArray>(16, [4, 4], SINCOS_TEMPERATURE, true, &device)
            .unwrap();
    let second =
        build_2d_sincos_embedding::<NdArray>(16, [4, 4], SINCOS_TEMPERATURE, true, &device)
            .unwrap();

    first.to_data().assert_eq(&second.to_data(), true);
}

#[test]
fn test_sincos_embedding_cls_slot_is_zero() {
    let device = NdArrayDevice::Cpu;

    let table =
        build_2d_sincos_embedding::<NdArray>(12, [2, 2], SINCOS_TEMPERATURE, true, &device)
            .unwrap();
    assert_eq!(table.dims(), [1, 5, 12]);

    let cls = table.slice([0..1, 0..1]).to_data().to_vec::<f32>().unwrap();
    assert!(cls.iter().all(|value| *value == 0.0));
}

#[test]
fn test_sincos_embedding_rejects_unsplittable_dims() {
    let device = NdArrayDevice::Cpu;

    let result =
        build_2d_sincos_embedding::<NdArray>(10, [2, 2], SINCOS_TEMPERATURE, false, &device);

    assert!(matches!(
        result,
        Err(ModelError::PositionEmbedDim { dim: 10 })
    ));
}
