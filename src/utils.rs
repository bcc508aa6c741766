use crate::error::{HsslError, Result as HsslResult};
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{Rgb, RgbImage};
use std::path::Path;

/// Named scalar diagnostics of one iteration, in report order.
pub type Diagnostics = Vec<(String, f64)>;

/// Convert the first image of a BCHW tensor in [0, 1] to an 8-bit RGB image.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> Result<RgbImage> {
    let [_, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .slice_dim(0, 0..1)
        .clamp(0.0, 1.0)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;

    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let pixel = [0, 1, 2].map(|c| (values[c * hw + idx] * 255.0) as u8);
            img.put_pixel(x as u32, y as u32, Rgb(pixel));
        }
    }

    Ok(img)
}

/// Save an image, creating its parent directory. The format follows the
/// file extension.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    img.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Keep the single-element diagnostics as `f64`; anything else is dropped.
pub fn collect_scalars(values: Vec<(&'static str, TensorData)>) -> Diagnostics {
    values
        .into_iter()
        .filter(|(_, data)| data.num_elements() == 1)
        .filter_map(|(name, data)| {
            let value = data.convert::<f64>().to_vec::<f64>().ok()?;
            Some((name.to_string(), value[0]))
        })
        .collect()
}

/// Regroup a sequence of diagnostics by name.
///
/// Every entry must carry the same names as the first one.
pub fn zip_diagnostics(entries: &[Diagnostics]) -> HsslResult<Vec<(String, Vec<f64>)>> {
    let Some(first) = entries.first() else {
        return Ok(Vec::new());
    };
    let mut expected: Vec<String> = first.iter().map(|(name, _)| name.clone()).collect();
    let mut zipped: Vec<(String, Vec<f64>)> = expected
        .iter()
        .map(|name| (name.clone(), Vec::with_capacity(entries.len())))
        .collect();
    expected.sort();

    for entry in entries {
        let mut found: Vec<String> = entry.iter().map(|(name, _)| name.clone()).collect();
        found.sort();
        if found != expected {
            return Err(HsslError::InconsistentKeys { expected, found });
        }
        for (name, values) in zipped.iter_mut() {
            if let Some((_, value)) = entry.iter().find(|(key, _)| key == name) {
                values.push(*value);
            }
        }
    }

    Ok(zipped)
}

/// Per-name mean over a window of diagnostics.
pub fn mean_diagnostics(entries: &[Diagnostics]) -> HsslResult<Diagnostics> {
    Ok(zip_diagnostics(entries)?
        .into_iter()
        .map(|(name, values)| {
            let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
            (name, mean)
        })
        .collect())
}

/// `name = 1.23e4  //  other = -5.00e-1`
pub fn format_diagnostics(values: &[(String, f64)]) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name} = {value:.2e}"))
        .collect::<Vec<_>>()
        .join("  //  ")
}
