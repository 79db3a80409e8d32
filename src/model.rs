use std::marker::PhantomData;
use std::path::PathBuf;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::prelude::{Backend, Int};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::{Bool, Tensor, TensorData};
use tracing::{debug, info};

use crate::error::ModelError;
use crate::mask::{sample_patch_mask, PatchMask};
use crate::model::encoder::{MaskedEncoder, MaskedEncoderConfig};
use crate::model::neck::{PretextNeck, PretextNeckConfig};
use crate::model::posenc::{build_2d_sincos_embedding, SINCOS_TEMPERATURE};
use crate::model::projection::{EncoderToDecoder, EncoderToDecoderConfig};
use crate::ops;
use crate::ops::ParamSnapshot;

pub mod attention;
pub mod block;
pub mod encoder;
pub mod neck;
pub mod patch;
pub mod posenc;
pub mod projection;

#[derive(Config)]
pub struct MaskedImageModelConfig {
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub decoder_embed_dim: usize,
    pub decoder_num_heads: usize,
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 16)]
    pub patch_size: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 8192)]
    pub vocab_size: usize,
    #[config(default = 4)]
    pub regressor_depth: usize,
    #[config(default = 4)]
    pub decoder_depth: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f32,
    #[config(default = true)]
    pub qkv_bias: bool,
    #[config(default = "None")]
    pub qk_scale: Option<f32>,
    #[config(default = "None")]
    pub attn_head_dim: Option<usize>,
    #[config(default = 0.0)]
    pub drop: f32,
    #[config(default = 0.0)]
    pub attn_drop: f32,
    #[config(default = 0.0)]
    pub drop_path: f32,
    #[config(default = 0.0)]
    pub layer_scale_init: f32,
    #[config(default = 0.0)]
    pub decoder_layer_scale_init: f32,
    #[config(default = 0.02)]
    pub init_std: f32,
    #[config(default = 1e-6)]
    pub norm_eps: f32,
    #[config(default = false)]
    pub skip_rescale: bool,
    #[config(default = 0.0)]
    pub base_momentum: f32,
}

impl MaskedImageModelConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> Result<MaskedImageModel<B>, ModelError> {
        if self.vocab_size == 0 {
            return Err(ModelError::EmptyVocabulary);
        }
        if self.decoder_embed_dim % 4 != 0 {
            return Err(ModelError::PositionEmbedDim {
                dim: self.decoder_embed_dim,
            });
        }

        let student = MaskedEncoderConfig {
            image_size: self.image_size,
            patch_size: self.patch_size,
            in_channels: self.in_channels,
            embed_dim: self.embed_dim,
            depth: self.depth,
            num_heads: self.num_heads,
            mlp_ratio: self.mlp_ratio,
            qkv_bias: self.qkv_bias,
            qk_scale: self.qk_scale,
            attn_head_dim: self.attn_head_dim,
            drop: self.drop,
            attn_drop: self.attn_drop,
            drop_path: self.drop_path,
            layer_scale_init: self.layer_scale_init,
            init_std: self.init_std,
            norm_eps: self.norm_eps,
            skip_rescale: self.skip_rescale,
        }
        .init(device)?;
        let teacher = student.clone().no_grad();

        let neck = PretextNeckConfig {
            embed_dim: self.decoder_embed_dim,
            num_heads: self.decoder_num_heads,
            vocab_size: self.vocab_size,
            regressor_depth: self.regressor_depth,
            decoder_depth: self.decoder_depth,
            mlp_ratio: self.mlp_ratio,
            qkv_bias: self.qkv_bias,
            qk_scale: self.qk_scale,
            drop: self.drop,
            attn_drop: self.attn_drop,
            drop_path: self.drop_path,
            layer_scale_init: self.decoder_layer_scale_init,
            init_std: self.init_std,
            norm_eps: self.norm_eps,
            skip_rescale: self.skip_rescale,
        }
        .init(device);

        let projection = (self.embed_dim != self.decoder_embed_dim).then(|| {
            EncoderToDecoderConfig {
                embed_dim: self.embed_dim,
                decoder_embed_dim: self.decoder_embed_dim,
                init_std: self.init_std,
                norm_eps: self.norm_eps,
            }
            .init(device)
        });

        let num_patches = student.num_patches();

        debug!(
            num_patches,
            embed_dim = self.embed_dim,
            decoder_embed_dim = self.decoder_embed_dim,
            vocab_size = self.vocab_size,
            "initialized masked image model"
        );

        Ok(MaskedImageModel {
            student,
            teacher,
            neck,
            projection,
            mask_token: Param::from_tensor(ops::trunc_normal(
                [1, 1, self.decoder_embed_dim],
                self.init_std,
                device,
            )),
            num_patches,
            decoder_embed_dim: self.decoder_embed_dim,
            base_momentum: self.base_momentum,
        })
    }
}

/// Context autoencoder for masked image modeling. The teacher is a momentum
/// copy of the student encoder and never takes gradient.
#[derive(Module, Debug)]
pub struct MaskedImageModel<B: Backend> {
    pub student: MaskedEncoder<B>,
    pub teacher: MaskedEncoder<B>,
    neck: PretextNeck<B>,
    projection: Option<EncoderToDecoder<B>>,
    mask_token: Param<Tensor<B, 3>>,
    num_patches: usize,
    decoder_embed_dim: usize,
    base_momentum: f32,
}

pub struct MaskedImageOutput<B: Backend> {
    /// Token logits for the masked patches, flattened to one row per patch.
    pub logits: Tensor<B, 2>,
    /// Regressed latents for the masked patches.
    pub latent_pred: Tensor<B, 3>,
    /// Momentum-teacher latents for the same patches, detached.
    pub latent_target: Tensor<B, 3>,
}

impl<B: Backend> MaskedImageModel<B> {
    /// Runs the full pretraining pipeline on one batch. Takes `&mut self`
    /// because the teacher weights are blended towards the student as part of
    /// the pass.
    pub fn forward(
        &mut self,
        images: Tensor<B, 4>,
        mask: Tensor<B, 2, Bool>,
    ) -> Result<MaskedImageOutput<B>, ModelError> {
        let mask = PatchMask::new(mask, self.num_patches)?;
        let batch_size = images.dims()[0];

        // visible tokens : batch x (num_visible + 1) x embed
        let visible_tokens = self.student.forward(images.clone(), &mask)?;
        let visible_tokens = self.project(visible_tokens);

        // the teacher encodes the complement, so its visible set is exactly
        // the set of masked patches
        let latent_target = self.teacher.forward(images, &mask.complement())?;
        let [_, teacher_len, _] = latent_target.dims();
        let latent_target = latent_target.slice([0..batch_size, 1..teacher_len]);
        let latent_target = self.project(latent_target).detach();

        self.momentum_update(self.base_momentum);

        // drop the class token before the regressor
        let [_, student_len, _] = visible_tokens.dims();
        let visible_tokens = visible_tokens.slice([0..batch_size, 1..student_len]);

        let pos_embed = build_2d_sincos_embedding::<B>(
            self.decoder_embed_dim,
            self.student.grid(),
            SINCOS_TEMPERATURE,
            true,
            &visible_tokens.device(),
        )?;
        let pos_embed = pos_embed
            .expand([batch_size, self.num_patches + 1, self.decoder_embed_dim])
            .slice([0..batch_size, 1..self.num_patches + 1]);
        let pos_masked = mask.select_masked(pos_embed.clone());
        let pos_visible = mask.select_visible(pos_embed);

        let queries =
            self.mask_token
                .val()
                .expand([batch_size as i32, mask.num_masked() as i32, -1]);

        let (logits, latent_pred) =
            self.neck
                .forward(queries, visible_tokens, pos_masked, pos_visible);
        let logits = logits.flatten::<2>(0, 1);

        Ok(MaskedImageOutput {
            logits,
            latent_pred,
            latent_target,
        })
    }

    fn project(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.projection {
            Some(projection) => projection.forward(tokens),
            None => tokens,
        }
    }

    /// Blends the teacher towards the student. Runs once per forward pass
    /// with the configured base momentum; exposed for schedules that ramp the
    /// momentum externally.
    pub fn momentum_update(&mut self, momentum: f32) {
        self.teacher = ops::ema_update(self.teacher.clone(), &self.student, momentum);
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn save_checkpoint(&self, path: impl Into<PathBuf>) -> Result<(), ModelError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::default();
        self.clone().save_file(path, &recorder)?;
        Ok(())
    }

    pub fn load_checkpoint(
        self,
        path: impl Into<PathBuf>,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        let path = path.into();
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::default();
        let model = self.load_file(path.clone(), &recorder, device)?;
        info!(path = %path.display(), "loaded model checkpoint");
        Ok(model)
    }
}

#[cfg(test)]
fn test_model_config() -> MaskedImageModelConfig {
    MaskedImageModelConfig::new(16, 1, 2, 8, 2)
        .with_image_size(32)
        .with_patch_size(8)
        .with_vocab_size(10)
        .with_regressor_depth(1)
        .with_decoder_depth(1)
        .with_base_momentum(0.5)
}

#[test]
fn test_model_forward_shapes() {
    let device = NdArrayDevice::Cpu;

    // full 224px geometry with narrow layers to keep the test fast
    let mut model = MaskedImageModelConfig::new(16, 1, 2, 8, 2)
        .with_vocab_size(10)
        .with_regressor_depth(1)
        .with_decoder_depth(1)
        .init::<NdArray>(&device)
        .unwrap();
    assert_eq!(model.num_patches(), 196);

    let images = crate::util::sample_image_batch::<NdArray>(2, 3, 224, &device);
    let mask = sample_patch_mask::<NdArray>(2, 196, 100, &device);

    let output = model.forward(images, mask).unwrap();

    assert_eq!(output.logits.dims(), [200, 10]);
    assert_eq!(output.latent_pred.dims(), [2, 100, 8]);
    assert_eq!(output.latent_target.dims(), [2, 100, 8]);
}

#[test]
fn test_model_teacher_starts_as_student_copy() {
    let device = NdArrayDevice::Cpu;

    let model = test_model_config().init::<NdArray>(&device).unwrap();

    let student = ParamSnapshot::take(&model.student);
    let teacher = ParamSnapshot::take(&model.teacher);

    assert_eq!(student.tensors.len(), teacher.tensors.len());
    for ((_, student), (_, teacher)) in student.tensors.into_iter().zip(teacher.tensors) {
        student.to_data().assert_eq(&teacher.to_data(), true);
    }
}

#[test]
fn test_model_momentum_update_blends_teacher() {
    struct Doubler;

    impl<B: Backend> ModuleMapper<B> for Doubler {
        fn map_float<const D: usize>(
            &mut self,
            _id: &ParamId,
            tensor: Tensor<B, D>,
        ) -> Tensor<B, D> {
            tensor * 2.0
        }
    }

    let device = NdArrayDevice::Cpu;

    let mut model = test_model_config().init::<NdArray>(&device).unwrap();

    // teacher starts as an exact copy, so doubling the student makes the
    // blended teacher land at 1.5x its previous weights
    let before = ParamSnapshot::take(&model.teacher);
    model.student = model.student.map(&mut Doubler);
    model.momentum_update(0.5);
    let after = ParamSnapshot::take(&model.teacher);

    for ((_, before), (_, after)) in before.tensors.into_iter().zip(after.tensors) {
        (before * 1.5)
            .to_data()
            .assert_approx_eq(&after.to_data(), 5);
    }
}

#[test]
fn test_model_teacher_stays_outside_the_graph() {
    struct RequiresGrad<B: Backend> {
        any: bool,
        marker: PhantomData<B>,
    }

    impl<B: Backend> ModuleVisitor<B> for RequiresGrad<B> {
        fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
            self.any |= tensor.is_require_grad();
        }
    }

    type Grad = Autodiff<NdArray>;

    let device = NdArrayDevice::Cpu;

    let mut model = test_model_config().init::<Grad>(&device).unwrap();

    let images = crate::util::sample_image_batch::<Grad>(2, 3, 32, &device);
    let mask = sample_patch_mask::<Grad>(2, 16, 5, &device);

    let output = model.forward(images, mask).unwrap();

    assert!(output.logits.is_require_grad());
    assert!(!output.latent_target.is_require_grad());

    let mut teacher_params = RequiresGrad::<Grad> {
        any: false,
        marker: PhantomData,
    };
    model.teacher.visit(&mut teacher_params);
    assert!(!teacher_params.any);

    let mut student_params = RequiresGrad::<Grad> {
        any: false,
        marker: PhantomData,
    };
    model.student.visit(&mut student_params);
    assert!(student_params.any);
}

#[test]
fn test_model_rejects_ragged_mask() {
    let device = NdArrayDevice::Cpu;

    let mut model = test_model_config().init::<NdArray>(&device).unwrap();
    let images = crate::util::sample_image_batch::<NdArray>(2, 3, 32, &device);

    let mut rows = vec![0i32; 2 * 16];
    rows[..4].fill(1);
    rows[16..19].fill(1);
    let mask = Tensor::<NdArray, 2, Int>::from_data(TensorData::new(rows, [2, 16]), &device).bool();

    assert!(matches!(
        model.forward(images, mask),
        Err(ModelError::RaggedMask { .. })
    ));
}

#[test]
fn test_model_config_rejects_empty_vocabulary() {
    let device = NdArrayDevice::Cpu;

    let config = test_model_config().with_vocab_size(0);

    assert!(matches!(
        config.init::<NdArray>(&device),
        Err(ModelError::EmptyVocabulary)
    ));
}
