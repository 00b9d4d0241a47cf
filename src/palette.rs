// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The color palette.  A palette is read out of an ordinary image: the
//! pixels are taken in row-major order and the image's shape is
//! forgotten, so a 1x512 strip and a 16x32 block both make a
//! 512-color palette.

use std::path::Path;

use image::Rgba;

use crate::error::{RenderError, Result};

/// An ordered, read-only sequence of at least two colors.
#[derive(Clone, Debug, PartialEq)]
pub struct Palette {
    colors: Vec<Rgba<u8>>,
}

impl Palette {
    /// Wrap a list of colors.  The shaping curve maps onto the range
    /// `[0, N-1]`, which needs at least two entries to mean anything.
    pub fn from_colors(colors: Vec<Rgba<u8>>) -> Result<Palette> {
        if colors.len() < 2 {
            return Err(RenderError::InvalidConfig(format!(
                "a palette needs at least 2 colors, got {}",
                colors.len()
            )));
        }
        Ok(Palette { colors })
    }

    /// Decode an image file into a palette.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Palette> {
        let path = path.as_ref();
        let failed = |reason: String| RenderError::PaletteLoad {
            path: path.display().to_string(),
            reason,
        };

        let decoded = image::open(path).map_err(|e| failed(e.to_string()))?;
        let colors: Vec<Rgba<u8>> = decoded.to_rgba8().pixels().cloned().collect();
        if colors.len() < 2 {
            return Err(failed(format!(
                "a palette needs at least 2 colors, the image has {}",
                colors.len()
            )));
        }
        Ok(Palette { colors })
    }

    /// The number of colors.
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    /// Palettes always have at least two colors.
    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// The color at `index`, if there is one.
    pub fn get(&self, index: usize) -> Option<Rgba<u8>> {
        self.colors.get(index).cloned()
    }

    /// All of the colors, in order.
    pub fn colors(&self) -> &[Rgba<u8>] {
        &self.colors
    }

    /// The palette as device words.  Each color is packed little-endian
    /// into a `u32`, so a buffer of these words has exactly the byte
    /// layout of an RGBA8 row.
    pub fn to_words(&self) -> Vec<u32> {
        self.colors.iter().map(|c| u32::from_le_bytes(c.0)).collect()
    }
}
