// SPDX-License-Identifier: Apache-2.0

//! Certificate provider backed by the IAM public service.
//!
//! `GetCert` resolves a named cert storage to cert/key locations; the TLS
//! and mTLS client configurations derived from it feed both the inner gRPC
//! channels and the outer secure-channel overlay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::iamanager::iam_public_service_client::IamPublicServiceClient;
use crate::proto::iamanager::GetCertRequest;

/// Deadline for the certificate lookup call.
const GET_CERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub cert_url: String,
    pub key_url: String,
}

#[async_trait]
pub trait CertProvider: Send + Sync {
    /// Cert/key locations for a named storage.
    async fn certificate(&self, cert_storage: &str) -> Result<CertInfo>;

    /// Client mTLS configuration built from a named storage plus the CA.
    async fn mtls_client_config(&self, cert_storage: &str) -> Result<ClientTlsConfig>;

    /// Server-authenticating TLS configuration, when a CA is configured.
    fn tls_client_config(&self) -> Result<Option<ClientTlsConfig>>;
}

pub struct IamCertSource {
    public_url: String,
    ca_cert: PathBuf,
    insecure: bool,
}

impl IamCertSource {
    /// `insecure` corresponds to provisioning mode: the certificate lookup
    /// itself runs over an unauthenticated channel.
    pub fn new(config: &Config, insecure: bool) -> Self {
        Self {
            public_url: config.iam.public_server_url.clone(),
            ca_cert: config.ca_cert.clone(),
            insecure,
        }
    }

    fn endpoint(&self) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(service_uri(&self.public_url))
            .map_err(|err| Error::InvalidArgument(format!("iam public url: {err}")))?
            .timeout(GET_CERT_TIMEOUT)
            .connect_timeout(GET_CERT_TIMEOUT);

        if self.insecure {
            return Ok(endpoint);
        }

        let ca = read_pem(&self.ca_cert)?;

        endpoint
            .tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)))
            .map_err(Error::from)
    }
}

#[async_trait]
impl CertProvider for IamCertSource {
    async fn certificate(&self, cert_storage: &str) -> Result<CertInfo> {
        debug!(cert_storage, "requesting certificate");

        let channel = self.endpoint()?.connect().await?;
        let mut client = IamPublicServiceClient::new(channel);

        let response = client
            .get_cert(GetCertRequest {
                r#type: cert_storage.to_owned(),
                ..Default::default()
            })
            .await?
            .into_inner();

        debug!(
            cert_url = %response.cert_url,
            key_url = %response.key_url,
            "certificate received"
        );

        Ok(CertInfo {
            cert_url: response.cert_url,
            key_url: response.key_url,
        })
    }

    async fn mtls_client_config(&self, cert_storage: &str) -> Result<ClientTlsConfig> {
        debug!(cert_storage, "building mtls client config");

        let info = self.certificate(cert_storage).await?;

        let cert = read_pem(&location_to_path(&info.cert_url)?)?;
        let key = read_pem(&location_to_path(&info.key_url)?)?;
        let ca = read_pem(&self.ca_cert)?;

        Ok(ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key)))
    }

    fn tls_client_config(&self) -> Result<Option<ClientTlsConfig>> {
        if self.ca_cert.as_os_str().is_empty() {
            return Ok(None);
        }

        let ca = read_pem(&self.ca_cert)?;

        Ok(Some(
            ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca)),
        ))
    }
}

/// Resolves a credential location to a filesystem path. `file://` URLs and
/// bare paths are supported; other schemes (hardware tokens) are rejected.
pub(crate) fn location_to_path(raw: &str) -> Result<PathBuf> {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| Error::InvalidArgument(format!("bad file url: {raw}"))),
        Ok(url) => Err(Error::runtime(format!(
            "unsupported credential scheme: {}",
            url.scheme()
        ))),
        Err(_) => Ok(PathBuf::from(raw)),
    }
}

/// Grpc endpoints in the configuration are host:port; normalize to a URI.
pub(crate) fn service_uri(url: &str) -> String {
    if url.contains("://") {
        url.to_owned()
    } else {
        format!("http://{url}")
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| Error::NotFound(format!("{}: {err}", path.display())))
}
