use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::remote::{self, Archive, ByteRange, TransportError};
use crate::retry::{self, RetryConfig};

/// `.part` sibling the retrieval streams into before the final rename.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Retrieve `url` into `dest`, either whole (`ranges == None`) or as the
/// concatenation of the given byte ranges in order.
///
/// Each attempt starts from an empty `.part` file so a retried attempt never
/// appends to a truncated earlier one; the `.part` file is renamed onto
/// `dest` only once every range has arrived.
pub async fn retrieve_to_file(
    archive: &dyn Archive,
    url: &str,
    ranges: Option<&[ByteRange]>,
    dest: &Path,
    retry_config: &RetryConfig,
) -> Result<u64, TransportError> {
    let part = part_path(dest);

    let result = retry::retry_with_backoff(retry_config, remote::retry_classifier, || async {
        let _ = fs::remove_file(&part).await;
        attempt_retrieve(archive, url, ranges, &part).await
    })
    .await;

    match result {
        Ok(bytes) => {
            fs::rename(&part, dest).await?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            Err(e)
        }
    }
}

async fn attempt_retrieve(
    archive: &dyn Archive,
    url: &str,
    ranges: Option<&[ByteRange]>,
    part: &Path,
) -> Result<u64, TransportError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await?;

    let mut written = 0u64;
    match ranges {
        None => written += archive.copy_to(url, None, &mut file).await?,
        Some(ranges) => {
            for range in ranges {
                written += archive.copy_to(url, Some(*range), &mut file).await?;
            }
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
