//! API credentials for the Carbon Black Cloud REST API.
//!
//! A `Credentials` value carries everything the transport needs: the API
//! host, the `X-Auth-Token` value, the organization key that appears in
//! every resource path, and TLS/proxy options. Credentials can be built in
//! code, read from `CBC_*` environment variables, or read from a TOML file
//! holding one table per profile:
//!
//! ```toml
//! [default]
//! url = "https://defense.conferdeploy.net"
//! token = "ABCDEFGHIJ/KLMNOPQRST"
//! org_key = "ABCD1234"
//! ssl_verify = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ApiError, Result};

/// Default overall request timeout for API calls.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings and auth material for one Carbon Black Cloud tenant.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Base URL of the API host, e.g. `https://defense.conferdeploy.net`.
    #[serde(default)]
    pub url: String,
    /// API token in `<secret>/<id>` form, sent as `X-Auth-Token`.
    #[serde(default)]
    pub token: String,
    /// Organization key substituted into resource paths.
    #[serde(default)]
    pub org_key: String,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Extra PEM root certificate to trust.
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
    /// Explicit HTTPS proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Bypass any proxy configured in the environment.
    #[serde(default)]
    pub ignore_system_proxy: bool,
    /// Integration name appended to the user agent.
    #[serde(default)]
    pub integration_name: Option<String>,
    /// Overall timeout per HTTP request.
    #[serde(default = "default_timeout", with = "millis")]
    pub request_timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl std::fmt::Debug for Credentials {
    // Keeps the token out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("org_key", &self.org_key)
            .field("ssl_verify", &self.ssl_verify)
            .field("ssl_cert_file", &self.ssl_cert_file)
            .field("proxy", &self.proxy)
            .field("ignore_system_proxy", &self.ignore_system_proxy)
            .field("integration_name", &self.integration_name)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Credentials {
    /// Creates credentials with the three mandatory values and default options.
    pub fn new(url: &str, token: &str, org_key: &str) -> Self {
        Credentials {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org_key: org_key.to_string(),
            ssl_verify: true,
            ssl_cert_file: None,
            proxy: None,
            ignore_system_proxy: false,
            integration_name: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads credentials from the process environment.
    ///
    /// Environment variables:
    /// - `CBC_URL`, `CBC_TOKEN`, `CBC_ORG_KEY` (required)
    /// - `CBC_SSL_VERIFY` (default `true`)
    /// - `CBC_SSL_CERT_FILE`, `CBC_PROXY`, `CBC_INTEGRATION`
    /// - `CBC_IGNORE_SYSTEM_PROXY` (default `false`)
    /// - `CBC_TIMEOUT_MS` (default 300000)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Credentials::from_env`], but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default)
        };

        let mut creds = Credentials::new(
            &lookup("CBC_URL").unwrap_or_default(),
            &lookup("CBC_TOKEN").unwrap_or_default(),
            &lookup("CBC_ORG_KEY").unwrap_or_default(),
        );
        creds.ssl_verify = flag("CBC_SSL_VERIFY", true);
        creds.ignore_system_proxy = flag("CBC_IGNORE_SYSTEM_PROXY", false);
        creds.ssl_cert_file = lookup("CBC_SSL_CERT_FILE").map(PathBuf::from);
        creds.proxy = lookup("CBC_PROXY");
        creds.integration_name = lookup("CBC_INTEGRATION");
        if let Some(ms) = lookup("CBC_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| ApiError::credential(format!("invalid CBC_TIMEOUT_MS: {e}")))?;
            creds.request_timeout = Duration::from_millis(ms);
        }

        creds.validate()?;
        Ok(creds)
    }

    /// Reads the named profile from a TOML credentials file.
    pub fn from_file(path: &Path, profile: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ApiError::Credential {
            message: format!("cannot read {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        Self::from_toml_str(&content, profile)
    }

    /// Parses the named profile out of TOML text.
    pub fn from_toml_str(content: &str, profile: &str) -> Result<Self> {
        let mut profiles: toml::Table =
            toml::from_str(content).map_err(|e| ApiError::Credential {
                message: "credentials file is not valid TOML".to_string(),
                source: Some(Box::new(e)),
            })?;

        let section = profiles
            .remove(profile)
            .ok_or_else(|| ApiError::credential(format!("profile {profile:?} not found")))?;

        let mut creds: Credentials = section.try_into().map_err(|e| ApiError::Credential {
            message: format!("profile {profile:?} is malformed"),
            source: Some(Box::new(e)),
        })?;
        creds.url = creds.url.trim_end_matches('/').to_string();

        creds.validate()?;
        Ok(creds)
    }

    /// Fails with a credential error naming every missing mandatory value.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("url", &self.url),
            ("token", &self.token),
            ("org_key", &self.org_key),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ApiError::credential(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables or disables TLS certificate verification.
    pub fn with_ssl_verify(mut self, verify: bool) -> Self {
        self.ssl_verify = verify;
        self
    }

    /// Sets the integration name reported in the user agent.
    pub fn with_integration_name(mut self, name: impl Into<String>) -> Self {
        self.integration_name = Some(name.into());
        self
    }

    /// Sets an explicit proxy URL.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn from_lookup_reads_all_values() {
        let creds = Credentials::from_lookup(lookup_from(&[
            ("CBC_URL", "https://example.net/"),
            ("CBC_TOKEN", "SECRET/ID"),
            ("CBC_ORG_KEY", "ORG1"),
            ("CBC_SSL_VERIFY", "false"),
            ("CBC_TIMEOUT_MS", "5000"),
            ("CBC_INTEGRATION", "soar"),
        ]))
        .unwrap();
        assert_eq!(creds.url, "https://example.net");
        assert_eq!(creds.token, "SECRET/ID");
        assert_eq!(creds.org_key, "ORG1");
        assert!(!creds.ssl_verify);
        assert_eq!(creds.request_timeout, Duration::from_millis(5000));
        assert_eq!(creds.integration_name.as_deref(), Some("soar"));
    }

    #[test]
    fn from_lookup_names_missing_values() {
        let err = Credentials::from_lookup(lookup_from(&[("CBC_URL", "https://x")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("token"), "got: {err}");
        assert!(err.contains("org_key"), "got: {err}");
        assert!(!err.contains("url,"), "got: {err}");
    }

    #[test]
    fn from_lookup_rejects_bad_timeout() {
        let result = Credentials::from_lookup(lookup_from(&[
            ("CBC_URL", "https://x"),
            ("CBC_TOKEN", "t"),
            ("CBC_ORG_KEY", "o"),
            ("CBC_TIMEOUT_MS", "soon"),
        ]));
        assert!(matches!(result, Err(ApiError::Credential { .. })));
    }

    #[test]
    fn toml_profile_is_selected() {
        let text = r#"
            [default]
            url = "https://one.example"
            token = "A/B"
            org_key = "ORG1"

            [prod]
            url = "https://two.example/"
            token = "C/D"
            org_key = "ORG2"
            ssl_verify = false
            request_timeout = 1500
        "#;
        let creds = Credentials::from_toml_str(text, "prod").unwrap();
        assert_eq!(creds.url, "https://two.example");
        assert_eq!(creds.org_key, "ORG2");
        assert!(!creds.ssl_verify);
        assert_eq!(creds.request_timeout, Duration::from_millis(1500));

        let default = Credentials::from_toml_str(text, "default").unwrap();
        assert!(default.ssl_verify);
        assert_eq!(default.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn toml_missing_profile_is_credential_error() {
        let err = Credentials::from_toml_str("[default]\nurl = \"x\"", "other").unwrap_err();
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn debug_output_redacts_token() {
        let creds = Credentials::new("https://x", "TOPSECRET/ID", "ORG");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("TOPSECRET"));
        assert!(dbg.contains("<redacted>"));
    }
}
