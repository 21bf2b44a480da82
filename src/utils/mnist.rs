use crate::utils::downloader::download_file_as_bytes;
use crate::utils::network::IMAGE_SIZE;
use crate::utils::nn_trait::DataSet;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use rayon::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

// CVDF mirror of http://yann.lecun.com/exdb/mnist/
const URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

pub const MEAN: f32 = 0.1307;
pub const STD: f32 = 0.3081;

#[derive(Debug, thiserror::Error)]
pub enum IdxError {
    #[error("bad magic number {found}, expected {expected}")]
    BadMagic { expected: u32, found: u32 },
    #[error("file holds {found} bytes of data, header announces {expected}")]
    Truncated { expected: usize, found: usize },
    #[error("images are {rows}x{cols}, expected 28x28")]
    BadGeometry { rows: usize, cols: usize },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("label {0} is not a digit")]
    BadLabel(u8),
}

pub fn normalize(pixel: u8) -> f32 {
    (pixel as f32 / 255.0 - MEAN) / STD
}

/// The MNIST training split, held in memory already normalized.
pub struct MnistData {
    image: Vec<f32>,
    gt: Vec<u8>,
    len: usize,
}

impl MnistData {
    /// Loads the training split from `root/MNIST/raw`, downloading the
    /// files first when they are missing.
    pub fn train(root: impl AsRef<Path>) -> Result<Self> {
        let raw_dir = Self::download(root.as_ref())?;
        let image_path = raw_dir.join(TRAIN_IMAGES);
        let label_path = raw_dir.join(TRAIN_LABELS);
        let images = fs::read(&image_path)
            .with_context(|| format!("failed to read {}", image_path.display()))?;
        let labels = fs::read(&label_path)
            .with_context(|| format!("failed to read {}", label_path.display()))?;
        let images = parse_images(&images)
            .with_context(|| format!("malformed image file {}", image_path.display()))?;
        let labels = parse_labels(&labels)
            .with_context(|| format!("malformed label file {}", label_path.display()))?;
        let data = Self::from_raw(images, labels)?;
        info!(samples = data.len(), "loaded MNIST training split");
        Ok(data)
    }

    /// Builds a dataset from raw `u8` pixels (`28*28` per image) and labels.
    pub fn from_raw(images: Vec<u8>, labels: Vec<u8>) -> Result<Self, IdxError> {
        let dim = IMAGE_SIZE * IMAGE_SIZE;
        if images.len() != labels.len() * dim {
            return Err(IdxError::CountMismatch {
                images: images.len() / dim,
                labels: labels.len(),
            });
        }
        if let Some(&bad) = labels.iter().find(|&&l| l > 9) {
            return Err(IdxError::BadLabel(bad));
        }
        let image = images.par_iter().map(|&p| normalize(p)).collect();
        Ok(Self {
            image,
            len: labels.len(),
            gt: labels,
        })
    }

    fn download(root: &Path) -> Result<PathBuf> {
        let raw_dir = root.join("MNIST").join("raw");
        fs::create_dir_all(&raw_dir)
            .with_context(|| format!("failed to create {}", raw_dir.display()))?;
        for name in [TRAIN_IMAGES, TRAIN_LABELS] {
            Self::download_file(name, &raw_dir)?;
        }
        Ok(raw_dir)
    }

    fn download_file(name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = dest_dir.join(name);
        if !file_name.exists() {
            info!(file = name, "downloading MNIST");
            let bytes = download_file_as_bytes(&format!("{URL}{name}.gz"), name)?;
            let mut output_file = File::create(&file_name)
                .with_context(|| format!("failed to create {}", file_name.display()))?;
            let mut gz_buffer = GzDecoder::new(&bytes[..]);
            if let Err(err) = std::io::copy(&mut gz_buffer, &mut output_file) {
                drop(output_file);
                let _ = fs::remove_file(&file_name);
                return Err(err).with_context(|| format!("failed to decompress {name}"));
            }
        }
        Ok(file_name)
    }
}

impl DataSet for MnistData {
    fn dim(&self) -> usize {
        IMAGE_SIZE * IMAGE_SIZE
    }

    fn len(&self) -> usize {
        self.len
    }

    fn fetch_item(&self, idx: usize) -> (&[f32], u8) {
        if idx >= self.len {
            panic!("fetch item with incorrect idx");
        }
        let dim = self.dim();
        (&self.image[idx * dim..(idx + 1) * dim], self.gt[idx])
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn check_header(bytes: &[u8], magic: u32, header_len: usize) -> Result<(), IdxError> {
    let found = read_u32(bytes, 0).ok_or(IdxError::Truncated {
        expected: header_len,
        found: bytes.len(),
    })?;
    if found != magic {
        return Err(IdxError::BadMagic {
            expected: magic,
            found,
        });
    }
    if bytes.len() < header_len {
        return Err(IdxError::Truncated {
            expected: header_len,
            found: bytes.len(),
        });
    }
    Ok(())
}

/// Parses an IDX3 image file (16-byte header) into flat pixels.
pub fn parse_images(bytes: &[u8]) -> Result<Vec<u8>, IdxError> {
    check_header(bytes, IMAGES_MAGIC, 16)?;
    let count = read_u32(bytes, 4).unwrap_or(0) as usize;
    let rows = read_u32(bytes, 8).unwrap_or(0) as usize;
    let cols = read_u32(bytes, 12).unwrap_or(0) as usize;
    if rows != IMAGE_SIZE || cols != IMAGE_SIZE {
        return Err(IdxError::BadGeometry { rows, cols });
    }
    let expected = count * rows * cols;
    let data = &bytes[16..];
    if data.len() < expected {
        return Err(IdxError::Truncated {
            expected,
            found: data.len(),
        });
    }
    Ok(data[..expected].to_vec())
}

/// Parses an IDX1 label file (8-byte header).
pub fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>, IdxError> {
    check_header(bytes, LABELS_MAGIC, 8)?;
    let count = read_u32(bytes, 4).unwrap_or(0) as usize;
    let data = &bytes[8..];
    if data.len() < count {
        return Err(IdxError::Truncated {
            expected: count,
            found: data.len(),
        });
    }
    Ok(data[..count].to_vec())
}

/// Loads a picture of a digit the way the drawing page feeds it to the
/// model: resized to 28x28, gray as the mean of the RGB channels,
/// normalized like the training data.
pub fn load_digit_image(path: impl AsRef<Path>) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let img = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let img = image::imageops::resize(
        &img,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::Triangle,
    );
    Ok(img
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            let gray = (r as u16 + g as u16 + b as u16) / 3;
            normalize(gray as u8)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&28u32.to_be_bytes());
        bytes.extend_from_slice(&28u32.to_be_bytes());
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn parses_idx_files() {
        let pixels = vec![255u8; 2 * 784];
        let images = parse_images(&idx_images(2, &pixels)).unwrap();
        assert_eq!(images.len(), 2 * 784);

        let mut labels = Vec::new();
        labels.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        labels.extend_from_slice(&2u32.to_be_bytes());
        labels.extend_from_slice(&[7, 3]);
        assert_eq!(parse_labels(&labels).unwrap(), vec![7, 3]);

        let data = MnistData::from_raw(images, vec![7, 3]).unwrap();
        let (img, label) = data.fetch_item(1);
        assert_eq!(label, 3);
        assert!((img[0] - (1.0 - MEAN) / STD).abs() < 1e-6);
    }

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        let mut bytes = idx_images(1, &[0u8; 784]);
        bytes[3] = 0x01;
        assert!(matches!(
            parse_images(&bytes),
            Err(IdxError::BadMagic { found: 2049, .. })
        ));

        let bytes = idx_images(2, &[0u8; 784]);
        assert!(matches!(parse_images(&bytes), Err(IdxError::Truncated { .. })));
        assert!(matches!(parse_labels(&[0, 0]), Err(IdxError::Truncated { .. })));
    }

    #[test]
    fn rejects_mismatched_counts() {
        assert!(matches!(
            MnistData::from_raw(vec![0; 784], vec![1, 2]),
            Err(IdxError::CountMismatch { .. })
        ));
        assert!(matches!(
            MnistData::from_raw(vec![0; 784], vec![12]),
            Err(IdxError::BadLabel(12))
        ));
    }

    #[test]
    fn digit_image_is_resized_and_normalized() {
        let path = std::env::temp_dir().join(format!("digitnet-{}-digit.png", std::process::id()));
        let img = image::RgbImage::from_pixel(56, 56, image::Rgb([255, 255, 255]));
        img.save(&path).unwrap();
        let pixels = load_digit_image(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(pixels.len(), 784);
        assert!(pixels.iter().all(|&p| (p - normalize(255)).abs() < 1e-6));
    }

    #[test]
    fn normalization_constants() {
        assert!((normalize(0) + MEAN / STD).abs() < 1e-6);
        assert!((normalize(255) - (1.0 - MEAN) / STD).abs() < 1e-6);
    }
}
