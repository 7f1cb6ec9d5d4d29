#[cfg(feature = "emblem-base")]
pub use emblem_base as base;

#[cfg(feature = "emblem-cache")]
pub use emblem_cache as cache;

#[cfg(feature = "emblem-atlas")]
pub use emblem_atlas as atlas;
