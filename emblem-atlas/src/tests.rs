use crate::{AtlasConfig, IconAtlas, SharedSurface, SoftwareSurface, UvRect};
use crossbeam_channel::{Receiver, Sender};
use emblem_base::{AssetKey, FramePool, IconFrame, IconImage, LoadedAsset, BYTES_PER_PIXEL};
use emblem_cache::{AssetCache, AssetError, AssetIo, AssetResult, CacheConfig, CancelToken};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RED: [u8; 4] = [255, 40, 40, 255];
const GREEN: [u8; 4] = [40, 255, 40, 255];
const BLUE: [u8; 4] = [40, 40, 255, 255];
const CLEARED: [u8; 4] = [0, 0, 0, 0];

#[derive(Clone)]
enum FrameFill {
    Solid([u8; 4]),
    Pixels(Vec<u8>),
}

// Recipe for the icon a key decodes into
#[derive(Clone)]
struct IconSpec {
    width: u32,
    height: u32,
    frames: Vec<(FrameFill, Duration)>,
}

fn solid_icon(
    width: u32,
    height: u32,
    color: [u8; 4],
) -> IconSpec {
    IconSpec {
        width,
        height,
        frames: vec![(FrameFill::Solid(color), Duration::ZERO)],
    }
}

fn solid_pixels(
    width: u32,
    height: u32,
    color: [u8; 4],
) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
    for _ in 0..width as usize * height as usize {
        pixels.extend_from_slice(&color);
    }
    pixels
}

fn bordered_pixels(
    width: u32,
    height: u32,
    border: [u8; 4],
    center: [u8; 4],
    center_width: u32,
    center_height: u32,
) -> Vec<u8> {
    let x0 = (width - center_width) / 2;
    let y0 = (height - center_height) / 2;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
    for y in 0..height {
        for x in 0..width {
            let inside = x >= x0 && x < x0 + center_width && y >= y0 && y < y0 + center_height;
            pixels.extend_from_slice(if inside { &center } else { &border });
        }
    }
    pixels
}

// AssetIo that synthesizes icons from registered recipes. Each fetch can be made to
// block on a gate until the test hands it a permit, and configured keys fail instead
// of decoding. Counts every fetch per key.
struct StubIconIo {
    icons: Mutex<HashMap<String, IconSpec>>,
    fail_keys: Mutex<HashSet<String>>,
    fetch_counts: Mutex<HashMap<String, usize>>,
    gate_rx: Option<Receiver<()>>,
}

impl StubIconIo {
    fn new() -> Arc<StubIconIo> {
        Arc::new(StubIconIo {
            icons: Default::default(),
            fail_keys: Default::default(),
            fetch_counts: Default::default(),
            gate_rx: None,
        })
    }

    // Every fetch blocks until the test sends a permit or drops the sender
    fn gated() -> (Sender<()>, Arc<StubIconIo>) {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(0);
        let io = Arc::new(StubIconIo {
            icons: Default::default(),
            fail_keys: Default::default(),
            fetch_counts: Default::default(),
            gate_rx: Some(gate_rx),
        });
        (gate_tx, io)
    }

    fn register(
        &self,
        key: &str,
        spec: IconSpec,
    ) {
        self.icons.lock().unwrap().insert(key.to_string(), spec);
    }

    fn fail_key(
        &self,
        key: &str,
    ) {
        self.fail_keys.lock().unwrap().insert(key.to_string());
    }

    fn fetches_for(
        &self,
        key: &str,
    ) -> usize {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl AssetIo<IconImage> for StubIconIo {
    fn fetch(
        &self,
        key: &AssetKey,
        _cancel: &CancelToken,
    ) -> AssetResult<Box<dyn Read + Send>> {
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(key.as_str().to_string())
            .or_insert(0) += 1;

        if let Some(gate) = &self.gate_rx {
            // proceed when the test hands out a permit, drops the gate, or (backstop
            // against a hung test) after a long timeout
            let _ = gate.recv_timeout(Duration::from_secs(10));
        }

        if self.fail_keys.lock().unwrap().contains(key.as_str()) {
            return Err(AssetError::DecodeError(format!(
                "forced failure for {}",
                key
            )));
        }
        Ok(Box::new(std::io::empty()))
    }

    fn decode(
        &self,
        key: &AssetKey,
        _stream: Box<dyn Read + Send>,
    ) -> AssetResult<LoadedAsset<IconImage>> {
        let spec = self
            .icons
            .lock()
            .unwrap()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| AssetError::DecodeError(format!("no icon registered for {}", key)))?;

        let frames = spec
            .frames
            .iter()
            .map(|(fill, delay)| {
                let pixels = match fill {
                    FrameFill::Solid(color) => solid_pixels(spec.width, spec.height, *color),
                    FrameFill::Pixels(pixels) => pixels.clone(),
                };
                IconFrame::new(pixels, *delay)
            })
            .collect();

        Ok(LoadedAsset::new(IconImage::new(
            spec.width,
            spec.height,
            frames,
        )))
    }
}

// Cells of 16x16 with a 2px margin, so icon pixels land in a 12x12 inner rect
fn grid_config(
    columns: u32,
    rows: u32,
) -> AtlasConfig {
    AtlasConfig {
        surface_width: columns * 16,
        surface_height: rows * 16,
        cell_width: 16,
        cell_height: 16,
        margin: 2,
    }
}

// Grace is long so evicted icons stay cached for the whole test; expiry itself is
// covered by the cache's own tests
fn test_atlas(
    config: AtlasConfig,
    io: Arc<StubIconIo>,
) -> (IconAtlas, SharedSurface) {
    let surface = SharedSurface::new(SoftwareSurface::new(
        config.surface_width,
        config.surface_height,
    ));
    let cache = AssetCache::new(
        io,
        CacheConfig {
            max_concurrency: 4,
            grace_period: Duration::from_secs(30),
            worker_threads: 2,
        },
    );
    let atlas = IconAtlas::new(config, cache, Box::new(surface.clone()), FramePool::default());
    (atlas, surface)
}

fn key(url: &str) -> AssetKey {
    AssetKey::new(url)
}

fn center_pixel(
    surface: &SharedSurface,
    uv: UvRect,
) -> [u8; 4] {
    let surface = surface.lock();
    let x = ((uv.min_x + uv.max_x) * 0.5 * surface.width() as f32) as u32;
    let y = ((uv.min_y + uv.max_y) * 0.5 * surface.height() as f32) as u32;
    surface.pixel(x, y)
}

// Tick the atlas until the condition holds, failing the test if it never does
fn pump_until<F: FnMut(&mut IconAtlas) -> bool>(
    atlas: &mut IconAtlas,
    mut condition: F,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        atlas.tick(Duration::ZERO);
        if condition(atlas) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for atlas state");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn uv_rects_are_distinct_and_inside_the_unit_square() {
    let (gate_tx, io) = StubIconIo::gated();
    let (mut atlas, _surface) = test_atlas(grid_config(4, 2), io);
    assert_eq!(atlas.config().capacity(), 8);

    let mut uvs = Vec::new();
    for i in 0..8 {
        uvs.push(atlas.get_icon(&key(&format!("icon://{}", i))));
    }

    for uv in &uvs {
        assert!(uv.min_x >= 0.0 && uv.max_x <= 1.0);
        assert!(uv.min_y >= 0.0 && uv.max_y <= 1.0);
        assert!(uv.min_x < uv.max_x);
        assert!(uv.min_y < uv.max_y);
        // the inner rect is 12px of a 64x32 surface
        assert!(((uv.max_x - uv.min_x) * 64.0 - 12.0).abs() < 1e-4);
        assert!(((uv.max_y - uv.min_y) * 32.0 - 12.0).abs() < 1e-4);
    }
    for a in 0..uvs.len() {
        for b in a + 1..uvs.len() {
            assert_ne!(uvs[a], uvs[b]);
        }
    }

    drop(gate_tx);
}

#[test]
fn lru_eviction_reuses_the_oldest_slot() {
    let io = StubIconIo::new();
    for i in 0..17 {
        io.register(
            &format!("icon://{}", i),
            solid_icon(12, 12, [10 + i as u8, 100, 200 - i as u8, 255]),
        );
    }
    let (mut atlas, surface) = test_atlas(grid_config(4, 4), io.clone());
    assert_eq!(atlas.config().capacity(), 16);

    let mut uvs = Vec::new();
    for i in 0..16 {
        uvs.push(atlas.get_icon(&key(&format!("icon://{}", i))));
    }
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);

    // The 17th url takes the least recently used slot, which is the first one bound
    let uv_evicted = atlas.get_icon(&key("icon://16"));
    assert_eq!(uv_evicted, uvs[0]);
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(center_pixel(&surface, uv_evicted), [10 + 16, 100, 200 - 16, 255]);

    // icon 0 is no longer bound; requesting it again binds the next LRU slot. The
    // asset is still cached (inside the grace window), so no new fetch happens and
    // the pixels land during the same call.
    assert_eq!(io.fetches_for("icon://0"), 1);
    let uv_again = atlas.get_icon(&key("icon://0"));
    assert_eq!(uv_again, uvs[1]);
    assert_eq!(io.fetches_for("icon://0"), 1);
    assert_eq!(center_pixel(&surface, uv_again), [10, 100, 200, 255]);
}

#[test]
fn churn_never_leaks_or_doubles_up_slots() {
    let io = StubIconIo::new();
    for i in 0..12 {
        io.register(&format!("icon://{}", i), solid_icon(12, 12, GREEN));
    }
    let (mut atlas, _surface) = test_atlas(grid_config(2, 2), io);

    let mut uv_by_url = Vec::new();
    for i in 0..12 {
        uv_by_url.push(atlas.get_icon(&key(&format!("icon://{}", i))));
    }

    // Every binding used one of the four grid cells
    let cells: Vec<UvRect> = uv_by_url[0..4].to_vec();
    for uv in &uv_by_url {
        assert!(cells.contains(uv));
    }

    // The last four urls hold the four cells, one each
    for a in 8..12 {
        for b in a + 1..12 {
            assert_ne!(uv_by_url[a], uv_by_url[b]);
        }
    }
    for cell in &cells {
        let holders = uv_by_url[8..12].iter().filter(|uv| *uv == cell).count();
        assert_eq!(holders, 1);
    }

    // A bound url resolves to the same cell again, no rebinding
    assert_eq!(atlas.get_icon(&key("icon://11")), uv_by_url[11]);
}

#[test]
fn stale_completion_never_blits_into_a_reassigned_slot() {
    let (gate_tx, io) = StubIconIo::gated();
    io.register("icon://a", solid_icon(12, 12, RED));
    io.register("icon://b", solid_icon(12, 12, GREEN));
    io.register("icon://c", solid_icon(12, 12, BLUE));

    let config = grid_config(2, 1);
    let surface = SharedSurface::new(SoftwareSurface::new(
        config.surface_width,
        config.surface_height,
    ));
    // One load at a time so the completion order is deterministic
    let cache = AssetCache::new(
        io.clone(),
        CacheConfig {
            max_concurrency: 1,
            grace_period: Duration::from_secs(30),
            worker_threads: 2,
        },
    );
    let mut atlas = IconAtlas::new(config, cache, Box::new(surface.clone()), FramePool::default());

    let uv_a = atlas.get_icon(&key("icon://a"));
    let uv_b = atlas.get_icon(&key("icon://b"));
    // Grid of two is full; icon a is the least recently used, so c takes its slot
    // while a's fetch is still stuck in flight
    let uv_c = atlas.get_icon(&key("icon://c"));
    assert_eq!(uv_c, uv_a);
    assert_ne!(uv_b, uv_a);

    // Let a's fetch finish. Its completion targets a slot that has been reassigned
    // to c, so nothing may reach the surface.
    gate_tx.send(()).unwrap();
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 2);
    assert_eq!(center_pixel(&surface, uv_c), CLEARED);

    gate_tx.send(()).unwrap();
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 1);
    assert_eq!(center_pixel(&surface, uv_b), GREEN);

    gate_tx.send(()).unwrap();
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(center_pixel(&surface, uv_c), BLUE);

    assert_eq!(io.fetches_for("icon://a"), 1);
}

#[test]
fn animated_icons_cycle_with_exact_frame_boundaries() {
    let io = StubIconIo::new();
    io.register(
        "icon://anim",
        IconSpec {
            width: 12,
            height: 12,
            frames: vec![
                (FrameFill::Solid(RED), Duration::from_millis(200)),
                (FrameFill::Solid(BLUE), Duration::from_millis(300)),
            ],
        },
    );
    let (mut atlas, surface) = test_atlas(grid_config(2, 1), io);

    let uv = atlas.get_icon(&key("icon://anim"));
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(center_pixel(&surface, uv), RED);

    let _subscription = atlas.subscribe();
    let _ = atlas.take_needs_redraw();

    // Frame 0 runs for [0, 0.2)
    atlas.tick(Duration::from_millis(190));
    assert_eq!(center_pixel(&surface, uv), RED);
    assert!(!atlas.take_needs_redraw());

    // Frame 1 starts exactly at 0.2
    atlas.tick(Duration::from_millis(10));
    assert_eq!(center_pixel(&surface, uv), BLUE);
    assert!(atlas.take_needs_redraw());

    // Frame 1 runs through 0.5
    atlas.tick(Duration::from_millis(299));
    assert_eq!(center_pixel(&surface, uv), BLUE);

    // Wraps back to frame 0 at 0.5
    atlas.tick(Duration::from_millis(1));
    assert_eq!(center_pixel(&surface, uv), RED);

    // A tick covering one full cycle lands on the same frame
    atlas.tick(Duration::from_millis(500));
    assert_eq!(center_pixel(&surface, uv), RED);
}

#[test]
fn animation_is_skipped_with_no_subscribers() {
    let io = StubIconIo::new();
    io.register(
        "icon://anim",
        IconSpec {
            width: 12,
            height: 12,
            frames: vec![
                (FrameFill::Solid(RED), Duration::from_millis(200)),
                (FrameFill::Solid(BLUE), Duration::from_millis(300)),
            ],
        },
    );
    let (mut atlas, surface) = test_atlas(grid_config(2, 1), io);

    let uv = atlas.get_icon(&key("icon://anim"));
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(center_pixel(&surface, uv), RED);

    // Nobody subscribed: time does not advance the animation
    atlas.tick(Duration::from_millis(250));
    assert_eq!(center_pixel(&surface, uv), RED);

    let subscription = atlas.subscribe();
    atlas.tick(Duration::from_millis(250));
    assert_eq!(center_pixel(&surface, uv), BLUE);

    drop(subscription);
    atlas.tick(Duration::from_millis(300));
    assert_eq!(center_pixel(&surface, uv), BLUE);
}

#[test]
fn failed_icon_frees_its_slot_for_retry() {
    let io = StubIconIo::new();
    io.register("icon://good", solid_icon(12, 12, GREEN));
    io.fail_key("icon://bad");
    let (mut atlas, surface) = test_atlas(grid_config(2, 2), io.clone());

    let uv_bad = atlas.get_icon(&key("icon://bad"));
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(io.fetches_for("icon://bad"), 1);
    assert_eq!(center_pixel(&surface, uv_bad), CLEARED);

    // The failed slot went back to the head of the allocation line
    let uv_good = atlas.get_icon(&key("icon://good"));
    assert_eq!(uv_good, uv_bad);
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(center_pixel(&surface, uv_good), GREEN);

    // And the failed url is unbound, so asking again starts a fresh fetch
    let uv_retry = atlas.get_icon(&key("icon://bad"));
    assert_ne!(uv_retry, uv_good);
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert_eq!(io.fetches_for("icon://bad"), 2);
}

#[test]
fn icons_blit_centered_and_cropped() {
    let io = StubIconIo::new();
    io.register("icon://small", solid_icon(4, 4, GREEN));
    io.register(
        "icon://big",
        IconSpec {
            width: 20,
            height: 20,
            frames: vec![(
                FrameFill::Pixels(bordered_pixels(20, 20, BLUE, RED, 12, 12)),
                Duration::ZERO,
            )],
        },
    );
    // Single cell: the cell rect is (0,0)..(16,16), inner rect (2,2)..(14,14)
    let (mut atlas, surface) = test_atlas(grid_config(1, 1), io);

    let _uv = atlas.get_icon(&key("icon://small"));
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    {
        let surface = surface.lock();
        // 4x4 icon centered in the 12x12 inner rect: pixels span (6,6)..(10,10)
        assert_eq!(surface.pixel(6, 6), GREEN);
        assert_eq!(surface.pixel(9, 9), GREEN);
        assert_eq!(surface.pixel(5, 6), CLEARED);
        assert_eq!(surface.pixel(10, 10), CLEARED);
        assert_eq!(surface.pixel(2, 2), CLEARED);
    }

    // 20x20 icon center-cropped to the 12x12 inner rect: only the red center
    // survives, the blue border is cropped away
    let _uv = atlas.get_icon(&key("icon://big"));
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    {
        let surface = surface.lock();
        assert_eq!(surface.pixel(2, 2), RED);
        assert_eq!(surface.pixel(8, 8), RED);
        assert_eq!(surface.pixel(13, 13), RED);
        // margin stays cleared
        assert_eq!(surface.pixel(1, 1), CLEARED);
        assert_eq!(surface.pixel(14, 14), CLEARED);
    }
}

#[test]
fn redraw_flag_is_one_shot() {
    let io = StubIconIo::new();
    io.register("icon://a", solid_icon(12, 12, RED));
    let (mut atlas, _surface) = test_atlas(grid_config(2, 1), io);

    assert!(!atlas.take_needs_redraw());

    // Binding clears the cell, which is already a visible change
    let _uv = atlas.get_icon(&key("icon://a"));
    assert!(atlas.take_needs_redraw());
    assert!(!atlas.take_needs_redraw());

    // The blit marks it again once the load lands
    pump_until(&mut atlas, |atlas| atlas.pending_loads() == 0);
    assert!(atlas.take_needs_redraw());
    assert!(!atlas.take_needs_redraw());

    // Idle ticks leave it unset
    atlas.tick(Duration::from_millis(16));
    assert!(!atlas.take_needs_redraw());
}
