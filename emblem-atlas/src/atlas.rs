use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emblem_base::hashing::HashMap;
use emblem_base::{AssetKey, FramePool, IconImage, ResourceHandle, BYTES_PER_PIXEL};
use emblem_cache::{AssetCache, AssetResult, LoadTicket};

use crate::slots::SlotLru;
use crate::surface::{PixelRect, SurfaceWriter, UvRect};

/// Grid geometry for an [`IconAtlas`]. The surface is carved into fixed-size cells,
/// row-major. Cells keep a small cleared margin so filtered sampling does not bleed
/// into the neighbor cell.
#[derive(Copy, Clone, Debug)]
pub struct AtlasConfig {
    pub surface_width: u32,
    pub surface_height: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    pub margin: u32,
}

impl AtlasConfig {
    pub fn columns(&self) -> u32 {
        self.surface_width / self.cell_width
    }

    pub fn rows(&self) -> u32 {
        self.surface_height / self.cell_height
    }

    pub fn capacity(&self) -> u32 {
        self.columns() * self.rows()
    }
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            surface_width: 512,
            surface_height: 512,
            cell_width: 64,
            cell_height: 64,
            margin: 2,
        }
    }
}

struct Slot {
    // Full cell including the margin
    cell_rect: PixelRect,
    // Cell minus the margin, where icon pixels go. uv_rect maps this.
    inner_rect: PixelRect,
    uv_rect: UvRect,
    bound: Option<AssetKey>,
    // Bumped on every rebind so completions for an earlier occupant can be told apart
    generation: u32,
    handle: Option<ResourceHandle<IconImage>>,
}

struct PendingIcon {
    key: AssetKey,
    slot_index: u32,
    generation: u32,
    ticket: LoadTicket<IconImage>,
}

#[derive(Copy, Clone)]
struct AnimatedSlot {
    current_frame: usize,
    time_remaining: Duration,
}

/// RAII registration of an active consumer. While at least one subscription is
/// alive, [`IconAtlas::tick`] advances animated icons; with none, animation work is
/// skipped entirely.
pub struct AtlasSubscription {
    subscriber_count: Arc<AtomicUsize>,
}

impl Drop for AtlasSubscription {
    fn drop(&mut self) {
        self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Maps icon URLs onto cells of one fixed-size surface. Lookup is synchronous:
/// [`IconAtlas::get_icon`] always hands back a UV rectangle immediately, evicting the
/// least recently used cell when the grid is full, and fills the pixels in later from
/// the cache on [`IconAtlas::tick`]. All surface and slot mutation happens on
/// whichever thread ticks the atlas.
pub struct IconAtlas {
    config: AtlasConfig,
    cache: AssetCache<IconImage>,
    surface: Box<dyn SurfaceWriter>,
    slots: Vec<Slot>,
    lru: SlotLru,
    by_key: HashMap<AssetKey, u32>,
    pending: Vec<PendingIcon>,
    animated: HashMap<u32, AnimatedSlot>,
    subscriber_count: Arc<AtomicUsize>,
    needs_redraw: bool,
    frame_pool: FramePool,
}

impl IconAtlas {
    pub fn new(
        config: AtlasConfig,
        cache: AssetCache<IconImage>,
        surface: Box<dyn SurfaceWriter>,
        frame_pool: FramePool,
    ) -> Self {
        let capacity = config.capacity();
        assert!(capacity > 0, "surface does not fit a single cell");
        assert!(config.cell_width > 2 * config.margin);
        assert!(config.cell_height > 2 * config.margin);

        log::debug!(
            "Icon atlas: {}x{} cells of {}x{}px, capacity {}",
            config.columns(),
            config.rows(),
            config.cell_width,
            config.cell_height,
            capacity
        );

        let mut slots = Vec::with_capacity(capacity as usize);
        for slot_index in 0..capacity {
            let column = slot_index % config.columns();
            let row = slot_index / config.columns();
            let cell_rect = PixelRect {
                x: column * config.cell_width,
                y: row * config.cell_height,
                width: config.cell_width,
                height: config.cell_height,
            };
            let inner_rect = PixelRect {
                x: cell_rect.x + config.margin,
                y: cell_rect.y + config.margin,
                width: config.cell_width - 2 * config.margin,
                height: config.cell_height - 2 * config.margin,
            };
            let uv_rect = UvRect {
                min_x: inner_rect.x as f32 / config.surface_width as f32,
                min_y: inner_rect.y as f32 / config.surface_height as f32,
                max_x: (inner_rect.x + inner_rect.width) as f32 / config.surface_width as f32,
                max_y: (inner_rect.y + inner_rect.height) as f32 / config.surface_height as f32,
            };
            slots.push(Slot {
                cell_rect,
                inner_rect,
                uv_rect,
                bound: None,
                generation: 0,
                handle: None,
            });
        }

        IconAtlas {
            config,
            cache,
            surface,
            slots,
            lru: SlotLru::new(capacity),
            by_key: Default::default(),
            pending: Vec::default(),
            animated: Default::default(),
            subscriber_count: Arc::new(AtomicUsize::new(0)),
            needs_redraw: false,
            frame_pool,
        }
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// The cache this atlas loads icons through, e.g. for prefetching.
    pub fn cache(&self) -> &AssetCache<IconImage> {
        &self.cache
    }

    /// Loads that have been issued but whose pixels have not landed yet.
    pub fn pending_loads(&self) -> usize {
        self.pending.len()
    }

    /// Resolve a URL to the UV rectangle of its cell. Never blocks and never fails:
    /// a miss binds a cell immediately (evicting the least recently used one on a
    /// full grid) and issues the load in the background. The cell stays cleared
    /// until the load lands.
    pub fn get_icon(
        &mut self,
        key: &AssetKey,
    ) -> UvRect {
        if let Some(&slot_index) = self.by_key.get(key) {
            self.lru.move_to_front(slot_index);
            return self.slots[slot_index as usize].uv_rect;
        }

        let slot_index = self.lru.back();
        self.release_slot(slot_index);

        log::trace!("Binding icon {} to slot {}", key, slot_index);
        let generation = {
            let slot = &mut self.slots[slot_index as usize];
            slot.bound = Some(key.clone());
            slot.generation = slot.generation.wrapping_add(1);
            slot.generation
        };
        self.by_key.insert(key.clone(), slot_index);
        self.surface
            .clear_region(self.slots[slot_index as usize].cell_rect);
        self.lru.move_to_front(slot_index);

        let mut ticket = self.cache.request(key);
        if let Some(result) = ticket.try_take() {
            // Still cached from an earlier binding, land it right away instead of
            // leaving the cell blank for a tick
            self.finish_pending(key.clone(), slot_index, generation, result);
        } else {
            self.pending.push(PendingIcon {
                key: key.clone(),
                slot_index,
                generation,
                ticket,
            });
        }

        self.needs_redraw = true;
        self.slots[slot_index as usize].uv_rect
    }

    /// Drive the atlas forward: pump the cache, land finished loads on the surface,
    /// and advance animated icons by `dt`.
    #[profiling::function]
    pub fn tick(
        &mut self,
        dt: Duration,
    ) {
        self.cache.update();
        self.poll_pending();
        self.advance_animations(dt);
    }

    pub fn subscribe(&self) -> AtlasSubscription {
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        AtlasSubscription {
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    /// True if the surface changed since the last call. One-shot.
    pub fn take_needs_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    fn poll_pending(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].ticket.try_take() {
                Some(result) => {
                    let pending = self.pending.swap_remove(i);
                    self.finish_pending(pending.key, pending.slot_index, pending.generation, result);
                }
                None => i += 1,
            }
        }
    }

    fn finish_pending(
        &mut self,
        key: AssetKey,
        slot_index: u32,
        generation: u32,
        result: AssetResult<ResourceHandle<IconImage>>,
    ) {
        let slot = &self.slots[slot_index as usize];
        let still_current = slot.generation == generation && slot.bound.as_ref() == Some(&key);

        match result {
            Ok(handle) => {
                if !still_current {
                    // The slot moved on while the load was in flight. Dropping the
                    // handle here releases our reference; the pixels never touch
                    // the surface.
                    log::trace!("Discarding finished load of {}, slot {} was reassigned", key, slot_index);
                    return;
                }

                let (frame_count, first_delay) = match handle.read() {
                    Ok(image) => (image.frame_count(), image.frame(0).delay),
                    Err(_) => {
                        log::warn!("Icon {} was disposed before it reached the surface", key);
                        self.free_slot(slot_index);
                        return;
                    }
                };

                self.blit_frame(slot_index, &handle, 0);
                self.slots[slot_index as usize].handle = Some(handle);
                if frame_count > 1 {
                    self.animated.insert(
                        slot_index,
                        AnimatedSlot {
                            current_frame: 0,
                            time_remaining: first_delay,
                        },
                    );
                }
            }
            Err(error) => {
                log::warn!("Failed to load icon {}: {}", key, error);
                if still_current {
                    // Unbind so the caller's next get_icon retries from scratch.
                    // The cell keeps showing as cleared.
                    self.free_slot(slot_index);
                }
            }
        }
    }

    fn advance_animations(
        &mut self,
        dt: Duration,
    ) {
        if self.animated.is_empty() {
            return;
        }
        // Nobody is looking, skip the work
        if self.subscriber_count.load(Ordering::Relaxed) == 0 {
            return;
        }

        let slot_indices: Vec<u32> = self.animated.keys().copied().collect();
        for slot_index in slot_indices {
            let handle = match &self.slots[slot_index as usize].handle {
                Some(handle) => handle.clone(),
                None => unreachable!("animated slot without a handle"),
            };
            let delays: Vec<Duration> = match handle.read() {
                Ok(image) => image.frames().iter().map(|frame| frame.delay).collect(),
                Err(_) => continue,
            };
            let cycle: Duration = delays.iter().sum();
            if cycle.is_zero() {
                // A cycle of zero-delay frames would never settle
                continue;
            }

            let mut state = self.animated[&slot_index];
            let mut remaining = dt;
            let mut advanced = false;
            while remaining >= state.time_remaining {
                remaining -= state.time_remaining;
                state.current_frame = (state.current_frame + 1) % delays.len();
                state.time_remaining = delays[state.current_frame];
                advanced = true;
            }
            state.time_remaining -= remaining;
            self.animated.insert(slot_index, state);

            if advanced {
                let cell_rect = self.slots[slot_index as usize].cell_rect;
                self.surface.clear_region(cell_rect);
                self.blit_frame(slot_index, &handle, state.current_frame);
            }
        }
    }

    /// Copy one frame into the slot's inner rect, centered. Oversized frames are
    /// center-cropped to the inner rect.
    fn blit_frame(
        &mut self,
        slot_index: u32,
        handle: &ResourceHandle<IconImage>,
        frame_index: usize,
    ) {
        profiling::scope!("blit_icon_frame");

        let image = match handle.read() {
            Ok(image) => image,
            Err(_) => return,
        };
        let inner = self.slots[slot_index as usize].inner_rect;
        let frame = image.frame(frame_index);

        let copy_width = image.width().min(inner.width);
        let copy_height = image.height().min(inner.height);
        let src_x = (image.width() - copy_width) / 2;
        let src_y = (image.height() - copy_height) / 2;
        let dst_x = inner.x + (inner.width - copy_width) / 2;
        let dst_y = inner.y + (inner.height - copy_height) / 2;

        let row_bytes = copy_width as usize * BYTES_PER_PIXEL;
        let src_stride = image.width() as usize * BYTES_PER_PIXEL;
        let mut scratch = self.frame_pool.take(copy_height as usize * row_bytes);
        for row in 0..copy_height as usize {
            let src_start =
                (src_y as usize + row) * src_stride + src_x as usize * BYTES_PER_PIXEL;
            let dst_start = row * row_bytes;
            scratch[dst_start..dst_start + row_bytes]
                .copy_from_slice(&frame.pixels[src_start..src_start + row_bytes]);
        }

        let target = PixelRect {
            x: dst_x,
            y: dst_y,
            width: copy_width,
            height: copy_height,
        };
        self.surface.blit(target, &scratch);
        self.frame_pool.put(scratch);
        self.needs_redraw = true;
    }

    /// Drop a slot's binding, handle, and animation state. The caller decides what
    /// happens to its place in the recency list.
    fn release_slot(
        &mut self,
        slot_index: u32,
    ) {
        let slot = &mut self.slots[slot_index as usize];
        slot.handle = None;
        if let Some(key) = slot.bound.take() {
            log::trace!("Releasing slot {} bound to {}", slot_index, key);
            self.by_key.remove(&key);
        }
        self.animated.remove(&slot_index);
    }

    fn free_slot(
        &mut self,
        slot_index: u32,
    ) {
        self.release_slot(slot_index);
        self.lru.move_to_back(slot_index);
    }
}
