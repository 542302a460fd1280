pub mod cifar10;
#[cfg(feature = "download")]
pub(crate) mod download;
pub mod errors;
pub mod pickle;
pub mod split;

pub use cifar10::{Batch, Cifar10};
#[cfg(feature = "download")]
pub use download::DownloadError;
pub use errors::LoadError;
pub use split::{DatasetSplit, SplitNotFoundError};
