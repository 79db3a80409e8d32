use burn::record::RecorderError;
use thiserror::Error;

/// Failures surfaced by model construction, the masking-aware forward pass
/// and checkpoint io. Structural invariants that can only break through a
/// programming error (such as a teacher/student parameter walk diverging)
/// panic instead.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("embed dim {dim} must be divisible by 4 for the 2d sin-cos position embedding")]
    PositionEmbedDim { dim: usize },

    #[error("patch size {patch} does not evenly divide image size {image}")]
    PatchGrid { image: usize, patch: usize },

    #[error("vocabulary size must be non-zero")]
    EmptyVocabulary,

    #[error("input image is {found_h}x{found_w} but the model expects {expected}x{expected}")]
    ImageSize {
        expected: usize,
        found_h: usize,
        found_w: usize,
    },

    #[error("mask covers {found} patches per sample but the model has {expected}")]
    MaskLength { expected: usize, found: usize },

    #[error("per-sample masked counts differ across the batch: {counts:?}")]
    RaggedMask { counts: Vec<usize> },

    #[error("mask must hide at least one patch and leave at least one visible, got {masked} of {total} masked")]
    DegenerateMask { masked: usize, total: usize },

    #[error("failed to record model state: {0}")]
    Checkpoint(#[from] RecorderError),
}
