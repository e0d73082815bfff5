use std::collections::TryReserveError;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Pixel layouts a decoded picture can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling
    Yuv420p,
}

/// Metadata stamped on a picture when it is published
#[derive(Debug, Clone)]
pub struct PictureMetadata {
    /// Strictly increasing publish counter, starting at 1
    pub sequence: u64,
    /// Frame ring slot the picture was written into
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// When the picture finished decoding
    pub decoded_at: Instant,
}

/// One decoded picture stored in a frame ring slot.
///
/// Plane storage is allocated once when the slot is created and reused for
/// every picture written into the slot; it only grows when the stream changes
/// resolution.
#[derive(Debug, Clone)]
pub struct Picture {
    pub meta: PictureMetadata,
    planes: [Vec<u8>; 3],
    strides: [usize; 3],
}

impl Picture {
    fn empty() -> Self {
        Self {
            meta: PictureMetadata {
                sequence: 0,
                slot: 0,
                width: 0,
                height: 0,
                format: PixelFormat::Yuv420p,
                decoded_at: Instant::now(),
            },
            planes: [Vec::new(), Vec::new(), Vec::new()],
            strides: [0; 3],
        }
    }

    /// Allocate zeroed planes for a `width` x `height` picture.
    pub fn try_allocate(width: u32, height: u32) -> Result<Self, TryReserveError> {
        let mut picture = Self::empty();
        picture.try_resize(width, height)?;
        Ok(picture)
    }

    /// Same as [`Picture::try_allocate`], aborting on allocation failure.
    pub fn allocate(width: u32, height: u32) -> Self {
        let mut picture = Self::empty();
        picture.resize(width, height);
        picture
    }

    /// Reshape the picture for new dimensions. No-op when they are unchanged.
    pub fn try_resize(&mut self, width: u32, height: u32) -> Result<(), TryReserveError> {
        if self.meta.width == width && self.meta.height == height && !self.planes[0].is_empty() {
            return Ok(());
        }

        let dims = plane_dimensions(width, height);
        for (index, (plane_width, plane_height)) in dims.into_iter().enumerate() {
            let len = plane_width * plane_height;
            let plane = &mut self.planes[index];
            if plane.capacity() < len {
                plane.try_reserve_exact(len - plane.len())?;
            }
            plane.resize(len, 0);
            self.strides[index] = plane_width;
        }

        self.meta.width = width;
        self.meta.height = height;
        Ok(())
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.meta.width == width && self.meta.height == height && !self.planes[0].is_empty() {
            return;
        }
        for (index, (plane_width, plane_height)) in
            plane_dimensions(width, height).into_iter().enumerate()
        {
            self.planes[index].resize(plane_width * plane_height, 0);
            self.strides[index] = plane_width;
        }
        self.meta.width = width;
        self.meta.height = height;
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn slot(&self) -> usize {
        self.meta.slot
    }

    /// Plane `index` (0 = Y, 1 = U, 2 = V)
    pub fn plane(&self, index: usize) -> &[u8] {
        &self.planes[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.planes[index]
    }

    /// Row length in bytes of plane `index`
    pub fn stride(&self, index: usize) -> usize {
        self.strides[index]
    }

    /// Copy one plane from an engine buffer whose rows are `src_stride` apart.
    pub fn copy_plane_from(&mut self, index: usize, src: &[u8], src_stride: usize) {
        let stride = self.strides[index];
        let dst = &mut self.planes[index];
        if stride == 0 {
            return;
        }
        for (row, dst_row) in dst.chunks_exact_mut(stride).enumerate() {
            let start = row * src_stride;
            let Some(src_row) = src.get(start..start + stride) else {
                break;
            };
            dst_row.copy_from_slice(src_row);
        }
    }

    /// Split an interleaved UV plane (NV12 layout) into the U and V planes.
    pub fn copy_interleaved_chroma_from(&mut self, src: &[u8], src_stride: usize) {
        let stride = self.strides[1];
        if stride == 0 {
            return;
        }
        let [_, cb, cr] = &mut self.planes;
        for (row, (u_row, v_row)) in cb
            .chunks_exact_mut(stride)
            .zip(cr.chunks_exact_mut(stride))
            .enumerate()
        {
            let start = row * src_stride;
            let Some(src_row) = src.get(start..start + stride * 2) else {
                break;
            };
            for (x, pair) in src_row.chunks_exact(2).enumerate() {
                u_row[x] = pair[0];
                v_row[x] = pair[1];
            }
        }
    }

    /// Fill the picture from a packed RGB24 (or 8-bit gray) buffer using
    /// BT.601 limited-range coefficients.
    pub fn fill_from_packed(&mut self, src: &[u8], components: usize) {
        let width = self.meta.width as usize;
        let height = self.meta.height as usize;
        let chroma_stride = self.strides[1];
        if src.len() < width * height * components {
            return;
        }

        let sample = |x: usize, y: usize| -> (i32, i32, i32) {
            let offset = (y * width + x) * components;
            match components {
                1 => {
                    let v = src[offset] as i32;
                    (v, v, v)
                }
                _ => (
                    src[offset] as i32,
                    src[offset + 1] as i32,
                    src[offset + 2] as i32,
                ),
            }
        };

        let [luma, cb, cr] = &mut self.planes;
        for y in 0..height {
            for x in 0..width {
                let (r, g, b) = sample(x, y);
                luma[y * width + x] = clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
            }
        }

        for cy in 0..height.div_ceil(2) {
            for cx in 0..width.div_ceil(2) {
                // Average the (up to) four source pixels under this chroma sample
                let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                for y in (cy * 2)..(cy * 2 + 2).min(height) {
                    for x in (cx * 2)..(cx * 2 + 2).min(width) {
                        let (pr, pg, pb) = sample(x, y);
                        r += pr;
                        g += pg;
                        b += pb;
                        n += 1;
                    }
                }
                let (r, g, b) = (r / n, g / n, b / n);
                cb[cy * chroma_stride + cx] =
                    clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
                cr[cy * chroma_stride + cx] =
                    clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
            }
        }
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Per-plane (width, height) for a 4:2:0 picture
fn plane_dimensions(width: u32, height: u32) -> [(usize, usize); 3] {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    [(w, h), (cw, ch), (cw, ch)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let picture = Picture::allocate(5, 3);
        assert_eq!(picture.plane(0).len(), 15);
        assert_eq!(picture.stride(1), 3);
        assert_eq!(picture.plane(1).len(), 6);
        assert_eq!(picture.plane(2).len(), 6);
    }

    #[test]
    fn resize_reuses_storage_for_same_dimensions() {
        let mut picture = Picture::allocate(16, 16);
        let ptr = picture.plane(0).as_ptr();
        picture.resize(16, 16);
        assert_eq!(picture.plane(0).as_ptr(), ptr);
    }

    #[test]
    fn interleaved_chroma_is_split() {
        let mut picture = Picture::allocate(4, 2);
        picture.copy_interleaved_chroma_from(&[10, 20, 11, 21, 0, 0], 6);
        assert_eq!(picture.plane(1), &[10, 11]);
        assert_eq!(picture.plane(2), &[20, 21]);
    }

    #[test]
    fn white_and_black_convert_to_limited_range() {
        let mut picture = Picture::allocate(2, 2);
        picture.fill_from_packed(&[255; 12], 3);
        assert!(picture.plane(0).iter().all(|&y| y == 235));
        assert_eq!(picture.plane(1), &[128]);
        assert_eq!(picture.plane(2), &[128]);

        picture.fill_from_packed(&[0; 4], 1);
        assert!(picture.plane(0).iter().all(|&y| y == 16));
    }

    #[test]
    fn copy_plane_skips_source_padding() {
        let mut picture = Picture::allocate(2, 2);
        // Two rows of four bytes, only the first two are picture data
        picture.copy_plane_from(0, &[1, 2, 9, 9, 3, 4, 9, 9], 4);
        assert_eq!(picture.plane(0), &[1, 2, 3, 4]);
    }
}
