// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Raster format conversion for magic conversion views (`photo.png` read as
//! `photo.jpg`).

use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::domain::views::{ConversionError, FormatConverter};

#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFormatConverter;

impl ImageFormatConverter {
    pub fn new() -> Self {
        Self
    }

    fn format(ext: &str) -> Result<ImageFormat, ConversionError> {
        ImageFormat::from_extension(ext)
            .ok_or_else(|| ConversionError::UnsupportedFormat(ext.to_string()))
    }
}

impl FormatConverter for ImageFormatConverter {
    fn convert(&self, bytes: &[u8], from_ext: &str, to_ext: &str) -> Result<Vec<u8>, ConversionError> {
        let from = Self::format(from_ext)?;
        let to = Self::format(to_ext)?;

        let decoded = image::load_from_memory_with_format(bytes, from)
            .map_err(|e| ConversionError::Decode(e.to_string()))?;

        // JPEG has no alpha channel
        let decoded = match to {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(decoded.to_rgb8()),
            _ => decoded,
        };

        let mut out = Cursor::new(Vec::new());
        decoded
            .write_to(&mut out, to)
            .map_err(|e| ConversionError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }
}
