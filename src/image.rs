//! Owned RGBA images and the small amount of pixel math the tracker needs.

use std::{fmt, path::Path};

use image::{ImageBuffer, Rgba, RgbaImage};
use ndarray::Array3;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("jpg" | "jpeg") => Ok(Self::Jpeg),
            Some("png") => Ok(Self::Png),
            _ => Err(Error::Data(format!(
                "invalid image path '{}' (must have one of the supported extensions)",
                path.display()
            ))),
        }
    }
}

/// An 8-bit sRGB image with alpha channel.
#[derive(Clone)]
pub struct Image {
    buf: RgbaImage,
}

impl Image {
    /// Creates an empty image of a specified size.
    ///
    /// The image will start out black and fully opaque.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buf: ImageBuffer::from_pixel(width, height, Rgba([0, 0, 0, 255])),
        }
    }

    /// Loads an image from the filesystem.
    ///
    /// The path must have a supported file extension (`jpeg`, `jpg` or `png`).
    pub fn load<A: AsRef<Path>>(path: A) -> Result<Self> {
        Self::load_impl(path.as_ref())
    }

    fn load_impl(path: &Path) -> Result<Self> {
        let format = match ImageFormat::from_path(path)? {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
        };
        let data = std::fs::read(path)?;
        let buf = image::load_from_memory_with_format(&data, format)?.to_rgba8();
        Ok(Self { buf })
    }

    /// Saves an image to the file system.
    ///
    /// The path must have a supported file extension (`jpeg`, `jpg` or `png`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        ImageFormat::from_path(path)?;
        Ok(self.buf.save(path)?)
    }

    /// Returns the width of this image, in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    /// Returns the height of this image, in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    /// Gets the RGBA value at the given pixel coordinates.
    ///
    /// # Panics
    ///
    /// This will panic if `(x, y)` is outside the bounds of this image.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        self.buf[(x, y)].0
    }

    /// Sets the RGBA value at the given pixel coordinates.
    ///
    /// # Panics
    ///
    /// This will panic if `(x, y)` is outside the bounds of this image.
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        self.buf[(x, y)] = Rgba(rgba);
    }

    /// Copies the RGB channels into an `(height, width, 3)` float array.
    ///
    /// Values keep the 0..=255 range. The photometric loss operates on this representation.
    pub fn to_f32_rgb(&self) -> Array3<f32> {
        let (w, h) = (self.width() as usize, self.height() as usize);
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            self.buf[(x as u32, y as u32)].0[c] as f32
        })
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} Image", self.width(), self.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_roundtrip() {
        let mut image = Image::new(4, 2);
        assert_eq!(image.get(0, 0), [0, 0, 0, 255]);
        image.set(3, 1, [1, 2, 3, 255]);
        assert_eq!(image.get(3, 1), [1, 2, 3, 255]);
    }

    #[test]
    fn f32_conversion() {
        let mut image = Image::new(2, 1);
        image.set(1, 0, [10, 20, 30, 255]);
        let arr = image.to_f32_rgb();
        assert_eq!(arr.dim(), (1, 2, 3));
        assert_eq!(arr[[0, 1, 0]], 10.0);
        assert_eq!(arr[[0, 1, 2]], 30.0);
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(Image::new(1, 1).save("frame.bmp").is_err());
    }
}
