// SPDX-License-Identifier: Apache-2.0

//! JSON configuration file.
//!
//! Field names mirror the deployed configuration format exactly; durations
//! are human strings ("3s", "1m30s") parsed with humantime.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub working_dir: PathBuf,
    pub image_store_dir: PathBuf,
    #[serde(rename = "CACert")]
    pub ca_cert: PathBuf,
    pub cert_storage: String,
    #[serde(rename = "VChan")]
    pub vchan: VChanConfig,
    #[serde(rename = "IAMConfig")]
    pub iam: IamConfig,
    #[serde(rename = "CMConfig")]
    pub cm: CmConfig,
    pub downloader: DownloaderConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VChanConfig {
    pub domain: u32,
    #[serde(rename = "XSRXPath")]
    pub rx_path: PathBuf,
    #[serde(rename = "XSTXPath")]
    pub tx_path: PathBuf,
    #[serde(rename = "IAMCertStorage")]
    pub iam_cert_storage: String,
    #[serde(rename = "SMCertStorage")]
    pub sm_cert_storage: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IamConfig {
    #[serde(rename = "IAMPublicServerURL")]
    pub public_server_url: String,
    #[serde(rename = "IAMProtectedServerURL")]
    pub protected_server_url: String,
    pub cert_storage: String,
    pub open_port: u32,
    pub secure_port: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CmConfig {
    #[serde(rename = "CMServerURL")]
    pub server_url: String,
    pub open_port: u32,
    pub secure_port: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownloaderConfig {
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    #[serde(with = "human_duration")]
    pub retry_delay: Duration,
    #[serde(with = "human_duration")]
    pub max_retry_delay: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::new(),
            max_concurrent_downloads: 4,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads and parses the JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| Error::NotFound(format!("config {}: {err}", path.display())))?;

        let config = serde_json::from_reader(BufReader::new(file))?;

        Ok(config)
    }
}

mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(Duration::default());
        }

        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
