//! HTTP transport for fetching packages

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;

use crate::error::{Error, FetchError, Result};

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Fetches raw bytes for a URI
///
/// The resolvers only ever talk to the network through this trait. Timeouts
/// and TLS configuration belong to the implementation.
pub trait Transport: Send + Sync {
    fn fetch(&self, uri: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// HTTPS transport backed by a blocking `reqwest` client
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

/// Builder for [`HttpTransport`]
pub struct HttpTransportBuilder {
    timeout: Duration,
    certificates: Vec<PathBuf>,
    user_agent: String,
}

impl HttpTransport {
    /// Create a new HTTP transport with default settings
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            certificates: Vec::new(),
            user_agent: format!("rpkl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpTransportBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Trust the PEM certificates in the given file in addition to the system roots
    pub fn add_certificates(mut self, pem_file: impl Into<PathBuf>) -> Self {
        self.certificates.push(pem_file.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<HttpTransport> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent);

        for path in &self.certificates {
            let pem = fs::read(path).map_err(|e| {
                Error::io(format!("Failed to read certificate file {}", path.display()), e)
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::InvalidArgument(format!(
                    "Invalid PEM certificate in {}: {}",
                    path.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| Error::io("Failed to create HTTP client", e))?;

        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, uri: &str) -> std::result::Result<Vec<u8>, FetchError> {
        if !uri.starts_with("https://") {
            return Err(FetchError::UnsupportedScheme(uri.to_string()));
        }

        tracing::debug!("GET {}", uri);
        let response = self.client.get(uri).send().map_err(|e| FetchError::Io {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(uri.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Io {
                uri: uri.to_string(),
                message: format!("Failed to read response body: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_https_before_calling_out() {
        let transport = HttpTransport::new().unwrap();
        assert_eq!(
            transport.fetch("http://localhost:1/pkg@1.0.0"),
            Err(FetchError::UnsupportedScheme(
                "http://localhost:1/pkg@1.0.0".to_string()
            ))
        );
        assert!(matches!(
            transport.fetch("ftp://wait/a/minute"),
            Err(FetchError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_missing_certificate_file() {
        let result = HttpTransport::builder()
            .add_certificates("/definitely/not/here.pem")
            .build();
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
