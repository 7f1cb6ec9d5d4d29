//! Fixed-grid icon atlas over a single shared surface.
//!
//! URLs map to grid cells. Lookup is synchronous and never fails: a full grid
//! evicts the least recently used cell. Pixels arrive asynchronously through an
//! [`emblem_cache::AssetCache`] and are copied in on [`IconAtlas::tick`], which also
//! advances animated icons.

mod atlas;
mod slots;
mod surface;

pub use atlas::AtlasConfig;
pub use atlas::AtlasSubscription;
pub use atlas::IconAtlas;

pub use surface::PixelRect;
pub use surface::SharedSurface;
pub use surface::SoftwareSurface;
pub use surface::SurfaceWriter;
pub use surface::UvRect;

#[cfg(test)]
mod tests;
