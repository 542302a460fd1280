use std::{io::Read, path::Path};

use curl::easy::Easy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("curl error: {0}")]
    CurlError(#[from] curl::Error),
    #[error("md5 of the downloaded archive does not match {expected}")]
    Md5Mismatch { expected: &'static str },
}

/// Downloads `url` into memory, checks it against `md5` and returns the
/// gunzipped bytes.
pub(crate) fn download_to<P: AsRef<Path>>(
    root: P,
    url: &str,
    md5: &'static str,
) -> Result<Vec<u8>, DownloadError> {
    let root = root.as_ref();
    std::fs::create_dir_all(root)?;

    let mut compressed = Vec::new();
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.progress(true)?;
    easy.follow_location(true)?;

    tracing::info!("Downloading {url}");
    {
        let mut dl = easy.transfer();
        let pb = indicatif::ProgressBar::new(1);
        dl.progress_function(move |total_dl, cur_dl, _, _| {
            pb.set_length(total_dl as u64);
            pb.set_position(cur_dl as u64);
            true
        })?;
        dl.write_function(|data| {
            compressed.extend_from_slice(data);
            Ok(data.len())
        })?;
        dl.perform()?;
    }

    tracing::info!("Verifying hash is {md5}");
    let digest = md5::compute(&compressed);
    if format!("{:?}", digest) != md5 {
        return Err(DownloadError::Md5Mismatch { expected: md5 });
    }

    tracing::info!("Deflating {} bytes", compressed.len());
    let mut uncompressed = Vec::new();
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    decoder.read_to_end(&mut uncompressed)?;
    Ok(uncompressed)
}

/// Unpacks a tar archive held in memory under `root`.
pub(crate) fn unpack_to<P: AsRef<Path>>(root: P, archive: &[u8]) -> Result<(), DownloadError> {
    let root = root.as_ref();
    tracing::info!("Unpacking {} bytes into {}", archive.len(), root.display());
    let mut archive = tar::Archive::new(archive);
    archive.unpack(root)?;
    Ok(())
}
