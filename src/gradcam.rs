//! Grad-CAM explanations rendered as a heatmap over the uploaded scan.

use std::path::Path;
use std::sync::Mutex;

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis};
use tract_onnx::prelude::*;
use tracing::info;

use crate::error::{Error, Result};
use crate::image_utils::{prepare, ImageSize, ResizeMode};
use crate::labels::OctLabel;

pub const DEFAULT_ALPHA: f32 = 0.5;

/// A differentiable view of the classifier.
pub trait GradientSource: Send + Sync {
    /// Resolution of the batches this source accepts.
    fn input_size(&self) -> ImageSize;

    /// Returns the `(H, W, C)` activations of the explained convolutional layer
    /// and the gradients of `class_index`'s score with respect to them.
    fn activations_and_gradients(
        &self,
        batch: &Array4<f32>,
        class_index: usize,
    ) -> Result<(Array3<f32>, Array3<f32>)>;
}

/// Grad-CAM export of the classifier in ONNX form.
///
/// The graph takes the image batch and a `(1, 4)` one-hot class selector and
/// returns the convolutional activations followed by their gradients, both
/// shaped `(1, H, W, C)`.
pub struct OnnxGradientModel {
    plan: Mutex<TypedRunnableModel<TypedModel>>,
    input_size: ImageSize,
}

impl OnnxGradientModel {
    pub fn load(path: impl AsRef<Path>, input_size: ImageSize) -> Result<Self> {
        let path = path.as_ref();
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    f32::fact([1, input_size.height as usize, input_size.width as usize, 3])
                        .into(),
                )
            })
            .and_then(|m| m.with_input_fact(1, f32::fact([1, OctLabel::COUNT]).into()))
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| {
                Error::Backend(format!("Grad-CAM model loading error for {}: {}", path.display(), e))
            })?;

        info!(
            path = %path.display(),
            height = input_size.height,
            width = input_size.width,
            "Loaded Grad-CAM model"
        );
        Ok(Self {
            plan: Mutex::new(plan),
            input_size,
        })
    }
}

impl GradientSource for OnnxGradientModel {
    fn input_size(&self) -> ImageSize {
        self.input_size
    }

    fn activations_and_gradients(
        &self,
        batch: &Array4<f32>,
        class_index: usize,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let mut one_hot = Array2::<f32>::zeros((1, OctLabel::COUNT));
        *one_hot
            .get_mut((0, class_index))
            .ok_or_else(|| Error::Backend(format!("class index {} out of range", class_index)))? = 1.0;

        let plan = self
            .plan
            .lock()
            .map_err(|_| Error::Server("Grad-CAM model poisoned".to_string()))?;
        let outputs = plan
            .run(tvec!(
                Tensor::from(batch.clone()).into(),
                Tensor::from(one_hot).into()
            ))
            .map_err(|e| Error::Backend(format!("Grad-CAM inference error: {}", e)))?;

        if outputs.len() < 2 {
            return Err(Error::Backend(format!(
                "Grad-CAM model returned {} outputs, expected 2",
                outputs.len()
            )));
        }

        Ok((unbatch(&outputs[0])?, unbatch(&outputs[1])?))
    }
}

fn unbatch(tensor: &Tensor) -> Result<Array3<f32>> {
    let view = tensor
        .to_array_view::<f32>()
        .map_err(|e| Error::Backend(format!("unexpected Grad-CAM output: {}", e)))?;
    view.into_dimensionality::<ndarray::Ix4>()
        .map(|v| v.index_axis(Axis(0), 0).to_owned())
        .map_err(|e| Error::Backend(format!("Grad-CAM output is not 4-D: {}", e)))
}

/// Class activation map in `[0, 1]`, shaped like the activations' spatial grid.
///
/// Only gradients where both the activation and the gradient are positive
/// contribute to the channel weights. A constant map becomes all zeros.
pub fn heatmap(activations: ArrayView3<f32>, gradients: ArrayView3<f32>) -> Result<Array2<f32>> {
    if activations.shape() != gradients.shape() {
        return Err(Error::Backend(format!(
            "activation shape {:?} does not match gradient shape {:?}",
            activations.shape(),
            gradients.shape()
        )));
    }
    let (h, w, channels) = activations.dim();
    if h == 0 || w == 0 || channels == 0 {
        return Err(Error::Backend("empty activation map".to_string()));
    }

    let mut guided = gradients.to_owned();
    ndarray::Zip::from(&mut guided)
        .and(&activations)
        .for_each(|g, &a| {
            if !(a > 0.0 && *g > 0.0) {
                *g = 0.0;
            }
        });

    let weights = guided.sum_axis(Axis(0)).sum_axis(Axis(0)) / (h * w) as f32;

    let mut cam = Array2::<f32>::zeros((h, w));
    for (c, &weight) in weights.iter().enumerate() {
        cam.scaled_add(weight, &activations.index_axis(Axis(2), c));
    }
    cam.mapv_inplace(|v| v.max(0.0));

    Ok(min_max_normalize(cam))
}

fn min_max_normalize(mut map: Array2<f32>) -> Array2<f32> {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        map.fill(0.0);
    } else {
        map.mapv_inplace(|v| (v - min) / range);
    }
    map
}

fn jet(v: f32) -> Rgb<u8> {
    let v = v.clamp(0.0, 1.0);
    let channel = |offset: f32| {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Maps a `[0, 1]` heatmap through the jet colormap, in RGB order.
pub fn colorize(map: &Array2<f32>) -> RgbImage {
    let (h, w) = map.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| jet(map[[y as usize, x as usize]]))
}

/// Blends `heat` over `base`: `base * (1 - alpha) + heat * alpha`. Both must share dimensions.
pub fn overlay(base: &RgbImage, heat: &RgbImage, alpha: f32) -> Result<RgbImage> {
    if base.dimensions() != heat.dimensions() {
        return Err(Error::Server(format!(
            "overlay size mismatch: {:?} vs {:?}",
            base.dimensions(),
            heat.dimensions()
        )));
    }
    let alpha = alpha.clamp(0.0, 1.0);
    Ok(RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y);
        let h = heat.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| {
            (b[c] as f32 * (1.0 - alpha) + h[c] as f32 * alpha)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    }))
}

/// Full Grad-CAM path: gradients, heatmap, colormap, resize to the original and blend.
///
/// The batch is prepared at the source's own resolution, which need not match
/// the classifier that produced `label`.
pub fn explain(
    source: &dyn GradientSource,
    original: &DynamicImage,
    mode: ResizeMode,
    label: OctLabel,
    alpha: f32,
) -> Result<RgbImage> {
    let batch = prepare(original, source.input_size(), mode);
    let (activations, gradients) = source.activations_and_gradients(&batch, label.index())?;
    let cam = heatmap(activations.view(), gradients.view())?;

    let base = original.to_rgb8();
    let heat = image::imageops::resize(
        &colorize(&cam),
        base.width(),
        base.height(),
        FilterType::Triangle,
    );
    overlay(&base, &heat, alpha)
}
