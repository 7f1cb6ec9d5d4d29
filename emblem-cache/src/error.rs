use std::sync::Arc;

/// Why a load failed. Values stay `Clone` because one failure fans out to every
/// waiter attached to the key.
#[derive(Debug, Clone)]
pub enum AssetError {
    /// I/O failure while fetching the bytes for a key
    FetchError(Arc<std::io::Error>),
    /// The bytes arrived but could not be decoded into an asset
    DecodeError(String),
    /// Every waiter detached before the fetch completed
    LoadCancelled,
}

impl std::error::Error for AssetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            AssetError::FetchError(ref e) => Some(&**e),
            AssetError::DecodeError(_) => None,
            AssetError::LoadCancelled => None,
        }
    }
}

impl core::fmt::Display for AssetError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            AssetError::FetchError(ref e) => e.fmt(fmt),
            AssetError::DecodeError(ref e) => write!(fmt, "decode failed: {}", e),
            AssetError::LoadCancelled => "load cancelled".fmt(fmt),
        }
    }
}

impl From<std::io::Error> for AssetError {
    fn from(error: std::io::Error) -> Self {
        AssetError::FetchError(Arc::new(error))
    }
}

pub type AssetResult<T> = Result<T, AssetError>;
