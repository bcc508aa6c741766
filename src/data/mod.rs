pub mod slide;
pub mod table;

pub use slide::{GridPatches, Patch, PatchDataset, PatchKind, PatchSampler, RandomPatches, Slide};
pub use table::{read_data, read_table, CountTable, ReadOptions};

use crate::error::{HsslError, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array2, Array3};
use std::path::Path;
use tracing::info;

/// Tensor-bearing values that can be moved between devices.
pub trait Placeable<B: Backend> {
    fn to_device(self, device: &B::Device) -> Self;
}

/// Read an RGB image as (H, W, 3).
pub fn load_image(path: impl AsRef<Path>) -> Result<Array3<u8>> {
    let path = path.as_ref();
    let img = image::open(path)
        .map_err(|source| HsslError::Image {
            path: path.display().to_string(),
            source,
        })?
        .to_rgb8();
    rgb_to_array(img)
}

/// Read a segmentation map as (H, W) label ids.
pub fn load_label(path: impl AsRef<Path>) -> Result<Array2<u32>> {
    let path = path.as_ref();
    let img = image::open(path)
        .map_err(|source| HsslError::Image {
            path: path.display().to_string(),
            source,
        })?
        .to_luma16();
    let (width, height) = img.dimensions();
    let values = img.into_raw().into_iter().map(u32::from).collect();
    Array2::from_shape_vec((height as usize, width as usize), values).map_err(|_| {
        HsslError::DimensionMismatch {
            what: "label pixels",
            expected: vec![height as usize, width as usize],
            found: vec![],
        }
    })
}

fn rgb_to_array(img: RgbImage) -> Result<Array3<u8>> {
    let (width, height) = img.dimensions();
    Array3::from_shape_vec((height as usize, width as usize, 3), img.into_raw()).map_err(|_| {
        HsslError::DimensionMismatch {
            what: "image pixels",
            expected: vec![height as usize, width as usize, 3],
            found: vec![],
        }
    })
}

fn zoomed(size: usize, factor: f64) -> usize {
    ((size as f64 * factor).round() as usize).max(1)
}

/// Rescale an image by `factor` with cubic interpolation.
pub fn zoom_image(image: &Array3<u8>, factor: f64) -> Result<Array3<u8>> {
    let (height, width, _) = image.dim();
    let raw: Vec<u8> = image.iter().copied().collect();
    let img = RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
        HsslError::DimensionMismatch {
            what: "image pixels",
            expected: vec![height, width, 3],
            found: vec![image.len()],
        }
    })?;
    let resized = imageops::resize(
        &img,
        zoomed(width, factor) as u32,
        zoomed(height, factor) as u32,
        FilterType::CatmullRom,
    );
    rgb_to_array(resized)
}

/// Rescale a label map by `factor` with nearest-neighbour sampling, so no
/// new label ids are introduced. Corners map onto corners.
pub fn zoom_label(label: &Array2<u32>, factor: f64) -> Array2<u32> {
    let (height, width) = label.dim();
    let (out_h, out_w) = (zoomed(height, factor), zoomed(width, factor));
    let source = |out: usize, out_size: usize, in_size: usize| {
        if out_size <= 1 {
            0
        } else {
            let pos = out as f64 * (in_size - 1) as f64 / (out_size - 1) as f64;
            (pos.round() as usize).min(in_size - 1)
        }
    };
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        label[[source(y, out_h, height), source(x, out_w, width)]]
    })
}

/// Load `image.tif`, `label.tif` and `data.gz` from `data_dir`, zoom the
/// image and label by `zoom` and keep the `num_genes` most expressed
/// unambiguous genes.
pub fn load_slide(data_dir: impl AsRef<Path>, zoom: f64, num_genes: usize) -> Result<Slide> {
    let data_dir = data_dir.as_ref();
    let image = load_image(data_dir.join("image.tif"))?;
    let label = load_label(data_dir.join("label.tif"))?;
    let data = read_data(
        &[data_dir.join("data.gz")],
        &ReadOptions {
            filter_ambiguous: true,
            num_genes: Some(num_genes),
            genes: None,
        },
    )?;

    let (image, label) = if (zoom - 1.0).abs() > f64::EPSILON {
        (zoom_image(&image, zoom)?, zoom_label(&label, zoom))
    } else {
        (image, label)
    };
    info!(
        "loaded slide {}x{} with {} segments, genes: {}",
        label.nrows(),
        label.ncols(),
        data.index.len(),
        data.genes.join(", ")
    );
    Slide::new(image, label, data.values)
}

/// A whole slide laid out for the training objective.
#[derive(Clone, Debug)]
pub struct SlideTensors<B: Backend> {
    /// [1, 3, H, W] in [0, 1].
    pub image: Tensor<B, 4>,
    /// [1, H * W, N + 1] one-hot label membership, column 0 = background.
    pub membership: Tensor<B, 3>,
    /// [1, G, N] observed counts.
    pub counts: Tensor<B, 3>,
}

impl<B: Backend> SlideTensors<B> {
    pub fn from_slide(slide: &Slide, device: &B::Device) -> Self {
        let (height, width) = (slide.height(), slide.width());
        let segments = slide.num_segments();
        let genes = slide.num_genes();

        let image: Vec<f32> = slide
            .image()
            .view()
            .permuted_axes([2, 0, 1])
            .iter()
            .map(|&v| v as f32 / 255.0)
            .collect();

        let mut membership = vec![0.0f32; height * width * (segments + 1)];
        for (pixel, &id) in slide.label().iter().enumerate() {
            membership[pixel * (segments + 1) + id as usize] = 1.0;
        }

        let counts: Vec<f32> = slide.counts().t().iter().copied().collect();

        Self {
            image: Tensor::from_data(TensorData::new(image, [1, 3, height, width]), device),
            membership: Tensor::from_data(
                TensorData::new(membership, [1, height * width, segments + 1]),
                device,
            ),
            counts: Tensor::from_data(TensorData::new(counts, [1, genes, segments]), device),
        }
    }

    pub fn image_shape(&self) -> [usize; 2] {
        let [_, _, height, width] = self.image.dims();
        [height, width]
    }
}

impl<B: Backend> Placeable<B> for SlideTensors<B> {
    fn to_device(self, device: &B::Device) -> Self {
        Self {
            image: self.image.to_device(device),
            membership: self.membership.to_device(device),
            counts: self.counts.to_device(device),
        }
    }
}

/// Stacked patches.
#[derive(Clone, Debug)]
pub struct PatchBatch<B: Backend> {
    /// [n, 3, h, w] in [-1, 1].
    pub images: Tensor<B, 4>,
    /// [n, h, w]; non-background ids are offset so segments are unique
    /// across the batch and index rows of `counts` plus one.
    pub labels: Tensor<B, 3, Int>,
    /// [sum k, G]
    pub counts: Tensor<B, 2>,
}

impl<B: Backend> Placeable<B> for PatchBatch<B> {
    fn to_device(self, device: &B::Device) -> Self {
        Self {
            images: self.images.to_device(device),
            labels: self.labels.to_device(device),
            counts: self.counts.to_device(device),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PatchBatcher;

impl<B: Backend> Batcher<B, Patch, PatchBatch<B>> for PatchBatcher {
    fn batch(&self, items: Vec<Patch>, device: &B::Device) -> PatchBatch<B> {
        let n = items.len();
        let (_, height, width) = items.first().map(|p| p.image.dim()).unwrap_or((3, 0, 0));
        let genes = items.first().map(|p| p.counts.ncols()).unwrap_or(0);

        let mut images = Vec::with_capacity(n * 3 * height * width);
        let mut labels = Vec::with_capacity(n * height * width);
        let mut counts = Vec::new();
        let mut offset = 0i64;
        for patch in &items {
            images.extend(patch.image.iter().copied());
            labels.extend(
                patch
                    .label
                    .iter()
                    .map(|&id| if id == 0 { 0 } else { id + offset }),
            );
            counts.extend(patch.counts.iter().copied());
            offset += patch.num_segments() as i64;
        }

        PatchBatch {
            images: Tensor::from_data(TensorData::new(images, [n, 3, height, width]), device),
            labels: Tensor::from_data(TensorData::new(labels, [n, height, width]), device),
            counts: Tensor::from_data(TensorData::new(counts, [offset as usize, genes]), device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;
    use image::{ImageBuffer, Luma};
    use ndarray::{arr2, s};
    use std::io::Write;
    use std::sync::Arc;

    type TestBackend = NdArray<f32>;

    #[test]
    fn zoom_label_is_nearest() {
        let label = arr2(&[[1, 1, 2, 2], [1, 1, 2, 2], [3, 3, 4, 4], [3, 3, 4, 4]]);
        let zoomed = zoom_label(&label, 0.5);
        assert_eq!(zoomed, arr2(&[[1, 2], [3, 4]]));
        let same = zoom_label(&label, 1.0);
        assert_eq!(same, label);
    }

    #[test]
    fn zoom_image_scales_size() {
        let image = Array3::from_elem((10, 20, 3), 100u8);
        let zoomed = zoom_image(&image, 0.5).unwrap();
        assert_eq!(zoomed.dim(), (5, 10, 3));
        assert!(zoomed.iter().all(|&v| v == 100));
    }

    #[test]
    fn zoom_image_is_cubic() {
        let mut image = Array3::from_elem((1, 4, 3), 100u8);
        image.slice_mut(s![.., 2.., ..]).fill(200);
        let zoomed = zoom_image(&image, 4.0).unwrap();
        assert_eq!(zoomed.dim(), (4, 16, 3));
        // Cubic kernels ring around the edge; linear ones stay within [100, 200].
        assert!(zoomed.iter().any(|&v| v < 100));
        assert!(zoomed.iter().any(|&v| v > 200));
    }

    #[test]
    fn slide_tensors_layout() {
        let device = Default::default();
        let mut image = Array3::zeros((2, 3, 3));
        image[[1, 2, 0]] = 255;
        let label = arr2(&[[0, 1, 1], [2, 0, 2]]);
        let counts = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let slide = Slide::new(image, label, counts).unwrap();
        let tensors = SlideTensors::<TestBackend>::from_slide(&slide, &device);

        assert_eq!(tensors.image.dims(), [1, 3, 2, 3]);
        assert_eq!(tensors.membership.dims(), [1, 6, 3]);
        assert_eq!(tensors.counts.dims(), [1, 2, 2]);
        assert_eq!(tensors.image_shape(), [2, 3]);

        let image: Vec<f32> = tensors.image.into_data().to_vec().unwrap();
        assert_eq!(image[5], 1.0);
        let membership: Vec<f32> = tensors.membership.into_data().to_vec().unwrap();
        assert_eq!(&membership[3..6], &[0.0, 1.0, 0.0]);
        assert_eq!(&membership[9..12], &[0.0, 0.0, 1.0]);
        let counts: Vec<f32> = tensors.counts.into_data().to_vec().unwrap();
        assert_eq!(counts, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn placing_on_device_keeps_values() {
        let device = Default::default();
        let label = arr2(&[[0, 1], [1, 0]]);
        let slide = Slide::new(Array3::from_elem((2, 2, 3), 51), label, arr2(&[[2.0]])).unwrap();
        let tensors = SlideTensors::<TestBackend>::from_slide(&slide, &device);
        let placed = tensors.clone().to_device(&device);

        assert_eq!(placed.image_shape(), [2, 2]);
        let before: Vec<f32> = tensors.membership.into_data().to_vec().unwrap();
        let after: Vec<f32> = placed.membership.into_data().to_vec().unwrap();
        assert_eq!(before, after);

        let dataset = PatchDataset::new(Arc::new(slide), [2, 2], GridPatches).unwrap();
        let patches: Vec<Patch> = (0..dataset.len()).filter_map(|idx| dataset.get(idx)).collect();
        let batch: PatchBatch<TestBackend> = PatchBatcher.batch(patches, &device);
        let placed = batch.clone().to_device(&device);
        assert_eq!(placed.images.dims(), batch.images.dims());
        let counts: Vec<f32> = placed.counts.into_data().to_vec().unwrap();
        let expected: Vec<f32> = batch.counts.into_data().to_vec().unwrap();
        assert_eq!(counts, expected);
    }

    #[test]
    fn batcher_offsets_segment_ids() {
        let device = Default::default();
        let mut label = Array2::zeros((8, 8));
        label.slice_mut(s![1..3, 1..3]).fill(1);
        label.slice_mut(s![5..7, 5..7]).fill(2);
        let counts = arr2(&[[1.0], [2.0]]);
        let slide = Slide::new(Array3::zeros((8, 8, 3)), label, counts).unwrap();
        let dataset = PatchDataset::new(Arc::new(slide), [4, 4], GridPatches).unwrap();
        let patches = vec![dataset.get(0).unwrap(), dataset.get(3).unwrap()];

        let batch: PatchBatch<TestBackend> = PatchBatcher.batch(patches, &device);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.labels.dims(), [2, 4, 4]);
        assert_eq!(batch.counts.dims(), [2, 1]);

        let labels: Vec<i64> = batch.labels.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels[5], 1);
        assert_eq!(labels[16 + 5], 2);
        let counts: Vec<f32> = batch.counts.into_data().to_vec().unwrap();
        assert_eq!(counts, vec![1.0, 2.0]);
    }

    #[test]
    fn load_slide_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(20, 10, image::Rgb([10, 20, 30]))
            .save(dir.path().join("image.tif"))
            .unwrap();
        let mut label: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::new(20, 10);
        label.put_pixel(5, 5, Luma([1]));
        label.put_pixel(15, 5, Luma([2]));
        label.save(dir.path().join("label.tif")).unwrap();

        let file = std::fs::File::create(dir.path().join("data.gz")).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder
            .write_all(b"n A B ambiguous_C D\n1 1 0 5 9\n2 1 0 5 9\n")
            .unwrap();
        encoder.finish().unwrap();

        let slide = load_slide(dir.path(), 1.0, 1).unwrap();
        assert_eq!((slide.height(), slide.width()), (10, 20));
        assert_eq!(slide.num_segments(), 2);
        assert_eq!(slide.num_genes(), 1);
        assert_eq!(slide.counts().column(0).to_vec(), vec![9.0, 9.0]);
        assert_eq!(slide.image()[[0, 0, 2]], 30);
        assert_eq!(slide.label()[[5, 15]], 2);
    }
}
