// SPDX-License-Identifier: Apache-2.0

//! Retrying downloader for image archives.
//!
//! `file://` URLs are copied locally; anything else goes over HTTP(S). The
//! destination name is derived from the URL so repeated requests for the
//! same URL land on the same file, and a partial file left by a failed
//! attempt is resumed with a `Range` request instead of restarted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::config::DownloaderConfig;
use crate::error::{Error, Result};

/// Attempts per download before giving up.
const MAX_ATTEMPTS: u32 = 3;

/// Connect and total timeout per request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Downloader {
    dir: PathBuf,
    client: reqwest::Client,
    slots: Arc<Semaphore>,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl Downloader {
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.download_dir).map_err(|err| {
            Error::runtime(format!(
                "create download dir {}: {err}",
                config.download_dir.display()
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            dir: config.download_dir.clone(),
            client,
            slots: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
        })
    }

    /// Downloads `url` into the download directory and returns the local
    /// path. The same URL always maps to the same destination file.
    pub async fn download(&self, url: &str) -> Result<PathBuf> {
        let _slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let parsed =
            Url::parse(url).map_err(|err| Error::InvalidArgument(format!("url {url}: {err}")))?;
        let dest = self.dir.join(file_name_for(&parsed)?);

        let mut delay = self.retry_delay;
        let mut last_error = Error::runtime("download failed");

        for attempt in 1..=MAX_ATTEMPTS {
            debug!(url, attempt, dest = %dest.display(), "downloading");

            match self.fetch(&parsed, &dest).await {
                Ok(()) => return Ok(dest),
                Err(err) => {
                    warn!(url, attempt, %err, "download attempt failed");
                    last_error = err;
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_retry_delay);
            }
        }

        Err(last_error)
    }

    async fn fetch(&self, url: &Url, dest: &PathBuf) -> Result<()> {
        if url.scheme() == "file" {
            return self.copy_local(url, dest).await;
        }

        let offset = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            debug!(offset, "resuming partial download");
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let mut response = request.send().await?.error_for_status()?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dest)
            .await?;

        // A 200 to a ranged request means the server restarted from zero.
        if offset > 0 && response.status() == StatusCode::OK {
            file.set_len(0).await?;
        }

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }

        file.flush().await?;

        Ok(())
    }

    async fn copy_local(&self, url: &Url, dest: &PathBuf) -> Result<()> {
        let src = url
            .to_file_path()
            .map_err(|_| Error::InvalidArgument(format!("bad file url: {url}")))?;

        if !src.exists() {
            return Err(Error::NotFound(format!("{}", src.display())));
        }

        tokio::fs::copy(&src, dest).await?;

        Ok(())
    }
}

/// Last path segment of the URL; for `file://` URLs with an empty path the
/// host is used instead.
fn file_name_for(url: &Url) -> Result<String> {
    let path = url.path();

    let name = match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ if url.scheme() == "file" => url
            .host_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidArgument(format!("no file name in {url}")))?,
        _ => return Err(Error::InvalidArgument(format!("no file name in {url}"))),
    };

    Ok(name)
}
