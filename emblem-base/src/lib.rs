pub mod hashing;

mod key;
pub use key::AssetKey;

pub mod resource;
pub use resource::LoadedAsset;
pub use resource::ResourceDisposedError;
pub use resource::ResourceHandle;
pub use resource::ResourceLifecycle;
pub use resource::ResourceState;
pub use resource::SharedResource;

mod frame_pool;
pub use frame_pool::FramePool;

mod icon_image;
pub use icon_image::IconFrame;
pub use icon_image::IconImage;
pub use icon_image::BYTES_PER_PIXEL;
