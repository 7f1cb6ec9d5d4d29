mod disk_io;

use disk_io::DiskIconIo;
use emblem::atlas::{AtlasConfig, IconAtlas, SharedSurface, SoftwareSurface};
use emblem::base::{AssetKey, FramePool};
use emblem::cache::{AssetCache, CacheConfig};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub fn demo_data_path() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/data"))
}

/// What to show and how to carve the surface. Written out as JSON next to the
/// sample icons on first run, edit it and rerun.
#[derive(Serialize, Deserialize, Debug)]
struct OverlayManifest {
    surface_width: u32,
    surface_height: u32,
    cell_width: u32,
    cell_height: u32,
    margin: u32,
    max_concurrency: usize,
    icons: Vec<String>,
}

impl Default for OverlayManifest {
    fn default() -> Self {
        OverlayManifest {
            // Four cells for seven icons, so the demo constantly evicts and
            // resurrects the way a busy overlay would
            surface_width: 128,
            surface_height: 128,
            cell_width: 64,
            cell_height: 64,
            margin: 2,
            max_concurrency: 4,
            icons: vec![
                "icons/badge_0.png".to_string(),
                "icons/badge_1.png".to_string(),
                "icons/badge_2.png".to_string(),
                "icons/badge_3.png".to_string(),
                "icons/badge_4.png".to_string(),
                "icons/badge_5.png".to_string(),
                "icons/spinner.gif".to_string(),
            ],
        }
    }
}

fn load_or_create_manifest(data_path: &Path) -> Result<OverlayManifest, Box<dyn Error>> {
    let manifest_path = data_path.join("overlay.json");
    if manifest_path.exists() {
        let json = std::fs::read_to_string(&manifest_path)?;
        Ok(serde_json::from_str(&json)?)
    } else {
        let manifest = OverlayManifest::default();
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(manifest)
    }
}

const BADGE_COLORS: [[u8; 3]; 6] = [
    [235, 87, 87],
    [242, 153, 74],
    [242, 201, 76],
    [111, 207, 151],
    [86, 204, 242],
    [187, 107, 217],
];

// Synthesizes a handful of badge PNGs and an animated spinner GIF on first run so
// the demo works out of the box. Drop your own files into data/icons/ and list them
// in overlay.json to use those instead.
fn write_sample_icons(data_path: &Path) -> Result<(), Box<dyn Error>> {
    let icons_dir = data_path.join("icons");
    if icons_dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&icons_dir)?;
    log::info!("Writing sample icons to {}", icons_dir.display());

    let size = 48u32;
    let center = (size - 1) as f32 / 2.0;
    for (badge_index, color) in BADGE_COLORS.iter().enumerate() {
        let mut pixels = vec![0u8; (size * size) as usize * 4];
        for y in 0..size {
            for x in 0..size {
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                let distance = (dx * dx + dy * dy).sqrt();
                if distance <= 22.0 {
                    let shade = 1.0 - (distance / 22.0) * 0.35;
                    let offset = ((y * size + x) * 4) as usize;
                    pixels[offset] = (color[0] as f32 * shade) as u8;
                    pixels[offset + 1] = (color[1] as f32 * shade) as u8;
                    pixels[offset + 2] = (color[2] as f32 * shade) as u8;
                    pixels[offset + 3] = 255;
                }
            }
        }
        image::save_buffer(
            icons_dir.join(format!("badge_{}.png", badge_index)),
            &pixels,
            size,
            size,
            image::ColorType::Rgba8,
        )?;
    }

    // An animated spinner so frame playback has something to chew on
    let size = 32u32;
    let mut frames = Vec::new();
    for step in 0..8u32 {
        let angle = step as f32 * std::f32::consts::PI / 4.0;
        let dot_x = 15.5 + angle.cos() * 10.0;
        let dot_y = 15.5 + angle.sin() * 10.0;
        let mut frame = image::RgbaImage::new(size, size);
        for y in 0..size {
            for x in 0..size {
                let dx = x as f32 - dot_x;
                let dy = y as f32 - dot_y;
                if dx * dx + dy * dy <= 12.0 {
                    frame.put_pixel(x, y, image::Rgba([255, 214, 90, 255]));
                }
            }
        }
        frames.push(image::Frame::from_parts(
            frame,
            0,
            0,
            image::Delay::from_numer_denom_ms(120, 1),
        ));
    }
    let file = std::fs::File::create(icons_dir.join("spinner.gif"))?;
    let mut encoder = image::codecs::gif::GifEncoder::new(file);
    encoder.encode_frames(frames)?;

    Ok(())
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    profiling::register_thread!("Main Thread");

    let data_path = demo_data_path();
    std::fs::create_dir_all(&data_path).unwrap();
    write_sample_icons(&data_path).unwrap();
    let manifest = load_or_create_manifest(&data_path).unwrap();
    println!("overlay manifest: {:?}", manifest);

    let frame_pool = FramePool::default();
    let io = Arc::new(DiskIconIo::new(data_path.clone(), frame_pool.clone()));
    let cache = AssetCache::new(
        io,
        CacheConfig {
            max_concurrency: manifest.max_concurrency,
            ..Default::default()
        },
    );
    let surface = SharedSurface::new(SoftwareSurface::new(
        manifest.surface_width,
        manifest.surface_height,
    ));
    let mut atlas = IconAtlas::new(
        AtlasConfig {
            surface_width: manifest.surface_width,
            surface_height: manifest.surface_height,
            cell_width: manifest.cell_width,
            cell_height: manifest.cell_height,
            margin: manifest.margin,
        },
        cache,
        Box::new(surface.clone()),
        frame_pool.clone(),
    );

    // Warm the cache for everything in the manifest before any icon is visible
    for url in &manifest.icons {
        atlas.cache().prefetch(&AssetKey::new(url.as_str()));
    }

    // The overlay counts as visible from here on; without this, animated icons
    // would hold their current frame
    let _subscription = atlas.subscribe();

    let visible_count = 3.min(manifest.icons.len());
    let mut last_tick = Instant::now();
    for frame_index in 0..400usize {
        std::thread::sleep(std::time::Duration::from_millis(15));
        let dt = last_tick.elapsed();
        last_tick = Instant::now();

        // Slide a window over the manifest so slots keep getting evicted and
        // rebound the way a busy overlay would
        let first_visible = (frame_index / 50) % manifest.icons.len();
        for offset in 0..visible_count {
            let url = &manifest.icons[(first_visible + offset) % manifest.icons.len()];
            atlas.get_icon(&AssetKey::new(url.as_str()));
        }

        if frame_index == 200 {
            log::info!("raising fetch concurrency to 8");
            atlas.cache().set_max_concurrency(8);
        }

        atlas.tick(dt);

        if atlas.take_needs_redraw() {
            log::trace!("surface changed on frame {}", frame_index);
        }

        if frame_index % 50 == 0 {
            println!(
                "frame {:3}: {:?}, {} pending blits, {} pooled buffers",
                frame_index,
                atlas.cache().stats(),
                atlas.pending_loads(),
                frame_pool.pooled_count()
            );
        }
    }

    let atlas_png = data_path.join("atlas.png");
    {
        let surface = surface.lock();
        image::save_buffer(
            &atlas_png,
            surface.pixels(),
            surface.width(),
            surface.height(),
            image::ColorType::Rgba8,
        )
        .unwrap();
    }
    println!("wrote atlas composition to {}", atlas_png.display());
}
