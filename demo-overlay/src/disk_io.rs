use emblem::base::{AssetKey, FramePool, IconFrame, IconImage, LoadedAsset, ResourceLifecycle};
use emblem::cache::{AssetError, AssetIo, AssetResult, CancelToken};
use image::codecs::gif::GifDecoder;
use image::AnimationDecoder;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

/// Loads icons from disk relative to a root directory and decodes them with the
/// `image` crate. GIFs keep their frames and per-frame delays; everything else
/// decodes to a single frame.
pub struct DiskIconIo {
    root_path: PathBuf,
    frame_pool: FramePool,
}

impl DiskIconIo {
    pub fn new(
        root_path: PathBuf,
        frame_pool: FramePool,
    ) -> Self {
        DiskIconIo {
            root_path,
            frame_pool,
        }
    }
}

impl AssetIo<IconImage> for DiskIconIo {
    fn fetch(
        &self,
        key: &AssetKey,
        cancel: &CancelToken,
    ) -> AssetResult<Box<dyn Read + Send>> {
        if cancel.is_cancelled() {
            return Err(AssetError::LoadCancelled);
        }
        let path = self.root_path.join(key.as_str());
        log::debug!("fetch {}", path.display());
        let file = std::fs::File::open(path)?;
        Ok(Box::new(file))
    }

    fn decode(
        &self,
        key: &AssetKey,
        mut stream: Box<dyn Read + Send>,
    ) -> AssetResult<LoadedAsset<IconImage>> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;

        let image = if key.as_str().ends_with(".gif") {
            decode_gif(&bytes)?
        } else {
            decode_static(&bytes)?
        };
        log::debug!("decoded {}: {:?}", key, image);

        // Hand the frame buffers back to the shared pool when the cache lets go of
        // the asset
        let pool = self.frame_pool.clone();
        let lifecycle = ResourceLifecycle::new(
            |image: &IconImage| image.frame_count() > 0,
            move |image: &mut IconImage| {
                for frame in image.take_frames() {
                    pool.put(frame.pixels);
                }
            },
        );
        Ok(LoadedAsset::with_lifecycle(image, lifecycle))
    }
}

fn decode_gif(bytes: &[u8]) -> AssetResult<IconImage> {
    let decoder =
        GifDecoder::new(Cursor::new(bytes)).map_err(|e| AssetError::DecodeError(e.to_string()))?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(|e| AssetError::DecodeError(e.to_string()))?;
    if frames.is_empty() {
        return Err(AssetError::DecodeError("gif contains no frames".to_string()));
    }

    let (width, height) = frames[0].buffer().dimensions();
    let icon_frames = frames
        .into_iter()
        .map(|frame| {
            let delay = frame_delay(frame.delay());
            IconFrame::new(frame.into_buffer().into_raw(), delay)
        })
        .collect();
    Ok(IconImage::new(width, height, icon_frames))
}

fn decode_static(bytes: &[u8]) -> AssetResult<IconImage> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| AssetError::DecodeError(e.to_string()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    Ok(IconImage::new(
        width,
        height,
        vec![IconFrame::new(decoded.into_raw(), Duration::ZERO)],
    ))
}

// Browsers treat missing or near-zero GIF delays as slow, not instant
fn frame_delay(delay: image::Delay) -> Duration {
    let (numer, denom) = delay.numer_denom_ms();
    let duration = Duration::from_secs_f64(numer as f64 / denom.max(1) as f64 / 1000.0);
    if duration < Duration::from_millis(20) {
        Duration::from_millis(100)
    } else {
        duration
    }
}
