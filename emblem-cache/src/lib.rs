mod error;
pub use error::AssetError;
pub use error::AssetResult;

mod fetch_io;
pub use fetch_io::AssetIo;
pub use fetch_io::CancelToken;

mod ticket;
pub use ticket::LoadTicket;

mod cache;
pub use cache::AssetCache;
pub use cache::CacheConfig;
pub use cache::CacheStats;
pub use cache::LoadId;
