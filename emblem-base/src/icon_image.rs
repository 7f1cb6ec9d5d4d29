use std::fmt;
use std::time::Duration;

/// RGBA8, tightly packed.
pub const BYTES_PER_PIXEL: usize = 4;

/// One frame of a decoded icon. Static images have a single frame with a zero delay.
pub struct IconFrame {
    /// RGBA8, `width * height * BYTES_PER_PIXEL` bytes
    pub pixels: Vec<u8>,
    /// How long the frame stays visible before the next one
    pub delay: Duration,
}

impl IconFrame {
    pub fn new(
        pixels: Vec<u8>,
        delay: Duration,
    ) -> Self {
        IconFrame { pixels, delay }
    }
}

/// A decoded icon: one or more equally sized RGBA8 frames. Codec-agnostic, whatever
/// decoded it hands the frames over in this form.
pub struct IconImage {
    width: u32,
    height: u32,
    frames: Vec<IconFrame>,
}

impl IconImage {
    pub fn new(
        width: u32,
        height: u32,
        frames: Vec<IconFrame>,
    ) -> Self {
        assert!(!frames.is_empty(), "an icon image needs at least one frame");
        let expected_len = width as usize * height as usize * BYTES_PER_PIXEL;
        for frame in &frames {
            assert_eq!(frame.pixels.len(), expected_len);
        }

        IconImage {
            width,
            height,
            frames,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frames(&self) -> &[IconFrame] {
        &self.frames
    }

    pub fn frame(
        &self,
        index: usize,
    ) -> &IconFrame {
        &self.frames[index]
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }

    /// Strip the frames out, typically so a disposal action can return the pixel
    /// buffers to a [`crate::FramePool`]. The image is unusable afterwards.
    pub fn take_frames(&mut self) -> Vec<IconFrame> {
        std::mem::take(&mut self.frames)
    }
}

impl fmt::Debug for IconImage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("IconImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_count", &self.frames.len())
            .finish()
    }
}
