use std::sync::{Arc, Mutex, MutexGuard};

use emblem_base::BYTES_PER_PIXEL;

/// A rectangle in surface pixel coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// A rectangle in normalized texture coordinates, `[0, 1]` on both axes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UvRect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

/// Where atlas pixels end up. The atlas only ever calls through this trait, so the
/// backing store can be a plain byte buffer, a staging texture, whatever the host
/// renders from.
pub trait SurfaceWriter: Send {
    /// Zero out a region of the surface.
    fn clear_region(
        &mut self,
        region: PixelRect,
    );

    /// Copy tightly packed RGBA8 pixels into a region. `pixels` must be exactly
    /// `region.byte_len()` bytes.
    fn blit(
        &mut self,
        region: PixelRect,
        pixels: &[u8],
    );
}

/// CPU-side surface backed by a `Vec<u8>`, RGBA8 row-major.
pub struct SoftwareSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl SoftwareSurface {
    pub fn new(
        width: u32,
        height: u32,
    ) -> Self {
        SoftwareSurface {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(
        &self,
        x: u32,
        y: u32,
    ) -> [u8; 4] {
        assert!(x < self.width && y < self.height);
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        [
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
            self.pixels[offset + 3],
        ]
    }

    fn row_range(
        &self,
        region: PixelRect,
        row: usize,
    ) -> std::ops::Range<usize> {
        let start = ((region.y as usize + row) * self.width as usize + region.x as usize)
            * BYTES_PER_PIXEL;
        start..start + region.width as usize * BYTES_PER_PIXEL
    }
}

impl SurfaceWriter for SoftwareSurface {
    fn clear_region(
        &mut self,
        region: PixelRect,
    ) {
        assert!(region.x + region.width <= self.width);
        assert!(region.y + region.height <= self.height);
        for row in 0..region.height as usize {
            let range = self.row_range(region, row);
            self.pixels[range].fill(0);
        }
    }

    fn blit(
        &mut self,
        region: PixelRect,
        pixels: &[u8],
    ) {
        assert!(region.x + region.width <= self.width);
        assert!(region.y + region.height <= self.height);
        assert_eq!(pixels.len(), region.byte_len());
        let row_bytes = region.width as usize * BYTES_PER_PIXEL;
        for row in 0..region.height as usize {
            let range = self.row_range(region, row);
            self.pixels[range].copy_from_slice(&pixels[row * row_bytes..(row + 1) * row_bytes]);
        }
    }
}

/// Clonable handle to a [`SoftwareSurface`] so the host can keep reading the pixels
/// the atlas writes into. Used by tests and the demo.
#[derive(Clone)]
pub struct SharedSurface {
    inner: Arc<Mutex<SoftwareSurface>>,
}

impl SharedSurface {
    pub fn new(surface: SoftwareSurface) -> Self {
        SharedSurface {
            inner: Arc::new(Mutex::new(surface)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SoftwareSurface> {
        self.inner.lock().unwrap()
    }
}

impl SurfaceWriter for SharedSurface {
    fn clear_region(
        &mut self,
        region: PixelRect,
    ) {
        self.inner.lock().unwrap().clear_region(region);
    }

    fn blit(
        &mut self,
        region: PixelRect,
        pixels: &[u8],
    ) {
        self.inner.lock().unwrap().blit(region, pixels);
    }
}
