//! Provider configuration: credentials, region, endpoints and retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::catalog;
use crate::error::{SdkError, SdkResult};

pub const DEFAULT_CLOUD: &str = "myhuaweicloud.com";
pub const EUROPE_CLOUD: &str = "myhuaweicloud.eu";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
const EUROPE_REGION_PREFIX: &str = "eu-west-1";
const SHARED_CONFIG_DIR: &str = ".hcloud";
const SHARED_CONFIG_FILE: &str = "config.json";

/// How requests are authorized, in priority order
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Token(String),
    AkSk {
        access_key: String,
        secret_key: String,
        security_token: Option<String>,
    },
    Password {
        user_name: Option<String>,
        user_id: Option<String>,
        password: String,
    },
}

impl AuthMode {
    pub fn is_aksk(&self) -> bool {
        matches!(self, AuthMode::AkSk { .. })
    }
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Token(_) => f.write_str("Token([REDACTED])"),
            AuthMode::AkSk { access_key, .. } => f
                .debug_struct("AkSk")
                .field("access_key", access_key)
                .field("secret_key", &"[REDACTED]")
                .finish(),
            AuthMode::Password {
                user_name, user_id, ..
            } => f
                .debug_struct("Password")
                .field("user_name", user_name)
                .field("user_id", user_id)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub security_token: Option<String>,
    pub token: Option<String>,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub password: Option<String>,
    pub domain_id: Option<String>,
    pub domain_name: Option<String>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub cloud: Option<String>,
    /// IAM endpoint, e.g. `https://iam.cn-north-4.myhuaweicloud.com/v3`
    pub identity_endpoint: Option<String>,
    /// Custom endpoints keyed by catalog name
    pub endpoints: HashMap<String, String>,
    pub insecure: bool,
    pub max_retries: u32,
    /// Base delay for throttling backoff, doubled on every retry
    pub retry_backoff: Duration,
    /// Per-request timeout; timed out requests are retried like throttled ones
    pub request_timeout: Option<Duration>,
    pub enterprise_project_id: Option<String>,
    /// Use region-scoped endpoints even for global services
    pub region_client: bool,
    pub shared_config_file: Option<PathBuf>,
    pub profile: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: String::new(),
            access_key: None,
            secret_key: None,
            security_token: None,
            token: None,
            user_name: None,
            user_id: None,
            password: None,
            domain_id: None,
            domain_name: None,
            project_id: None,
            project_name: None,
            cloud: None,
            identity_endpoint: None,
            endpoints: HashMap::new(),
            insecure: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_secs(60),
            request_timeout: None,
            enterprise_project_id: None,
            region_client: false,
            shared_config_file: None,
            profile: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &redacted(&self.secret_key))
            .field("security_token", &redacted(&self.security_token))
            .field("token", &redacted(&self.token))
            .field("user_name", &self.user_name)
            .field("user_id", &self.user_id)
            .field("password", &redacted(&self.password))
            .field("domain_id", &self.domain_id)
            .field("domain_name", &self.domain_name)
            .field("project_id", &self.project_id)
            .field("cloud", &self.cloud)
            .field("endpoints", &self.endpoints)
            .field("max_retries", &self.max_retries)
            .field("enterprise_project_id", &self.enterprise_project_id)
            .finish_non_exhaustive()
    }
}

/// First non-empty value among `keys`
fn first_env(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| lookup(k))
        .find(|v| !v.trim().is_empty())
}

impl Config {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn with_aksk(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_password(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_domain_id(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }

    pub fn with_endpoint(mut self, key: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(key.into(), url.into());
        self
    }

    pub fn with_identity_endpoint(mut self, url: impl Into<String>) -> Self {
        self.identity_endpoint = Some(url.into());
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build a configuration from `HW_*` (and legacy `OS_*`) environment variables
    pub fn from_env() -> SdkResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SdkResult<Self> {
        let get = |keys: &[&str]| first_env(&lookup, keys);

        let max_retries = match get(&["HW_MAX_RETRIES"]) {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                SdkError::Config(format!("max_retries should be a positive value, got '{}'", raw))
            })?,
            None => DEFAULT_MAX_RETRIES,
        };
        let insecure = get(&["HW_INSECURE"])
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);

        Ok(Self {
            region: get(&["HW_REGION_NAME", "OS_REGION_NAME"]).unwrap_or_default(),
            access_key: get(&["HW_ACCESS_KEY", "OS_ACCESS_KEY"]),
            secret_key: get(&["HW_SECRET_KEY", "OS_SECRET_KEY"]),
            security_token: get(&["HW_SECURITY_TOKEN", "OS_SECURITY_TOKEN"]),
            token: get(&["HW_AUTH_TOKEN", "OS_AUTH_TOKEN"]),
            user_name: get(&["HW_USER_NAME", "OS_USERNAME"]),
            user_id: get(&["HW_USER_ID", "OS_USER_ID"]),
            password: get(&["HW_USER_PASSWORD", "OS_PASSWORD"]),
            domain_id: get(&["HW_DOMAIN_ID", "OS_DOMAIN_ID"]),
            domain_name: get(&["HW_DOMAIN_NAME", "OS_DOMAIN_NAME"]),
            project_id: get(&["HW_PROJECT_ID", "OS_PROJECT_ID"]),
            project_name: get(&["HW_PROJECT_NAME", "OS_PROJECT_NAME"]),
            cloud: get(&["HW_CLOUD"]),
            identity_endpoint: get(&["HW_AUTH_URL", "OS_AUTH_URL"]),
            insecure,
            max_retries,
            enterprise_project_id: get(&["HW_ENTERPRISE_PROJECT_ID"]),
            shared_config_file: get(&["HW_SHARED_CONFIG_FILE"]).map(PathBuf::from),
            profile: get(&["HW_PROFILE"]),
            ..Self::default()
        })
    }

    /// Cloud domain suffix, e.g. `myhuaweicloud.com`
    pub fn cloud_domain(&self) -> &str {
        match self.cloud.as_deref().map(str::trim) {
            Some(cloud) if !cloud.is_empty() => cloud,
            _ if self.is_europe() => EUROPE_CLOUD,
            _ => DEFAULT_CLOUD,
        }
    }

    fn is_europe(&self) -> bool {
        self.region.starts_with(EUROPE_REGION_PREFIX)
    }

    /// Global services are reached through regional endpoints
    pub fn uses_region_endpoints(&self) -> bool {
        self.region_client || self.is_europe()
    }

    pub fn identity_endpoint(&self) -> String {
        match &self.identity_endpoint {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://iam.{}.{}/v3", self.region, self.cloud_domain()),
        }
    }

    /// Project name used when the project ID has to be looked up
    pub fn project_name_for(&self, region: &str) -> String {
        match &self.project_name {
            Some(name) if region == self.region => name.clone(),
            _ => region.to_string(),
        }
    }

    /// Normalize custom endpoints and copy each one to its derived catalog keys
    pub fn normalize_endpoints(&mut self) -> SdkResult<()> {
        let mut normalized = HashMap::new();
        for (key, raw) in &self.endpoints {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(SdkError::Config(format!(
                    "the value of customer endpoint {} must be specified",
                    key
                )));
            }
            let mut url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
                trimmed.to_string()
            } else {
                format!("https://{}", trimmed)
            };
            if !url.ends_with('/') {
                url.push('/');
            }
            normalized.insert(key.clone(), url);
        }

        let explicit: Vec<(String, String)> =
            normalized.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (key, url) in explicit {
            for derived in catalog::derived_catalog_keys(&key) {
                normalized.entry(derived.to_string()).or_insert_with(|| url.clone());
            }
        }

        self.endpoints = normalized;
        Ok(())
    }

    /// Load the shared config file when one is configured
    pub fn load_shared_config(&mut self) -> SdkResult<()> {
        if self.shared_config_file.is_none() && self.profile.is_none() {
            return Ok(());
        }

        let path = match &self.shared_config_file {
            Some(path) => path.clone(),
            None => default_shared_config_path()?,
        };
        let shared = SharedConfig::from_file(&path)?;
        let profile_name = self
            .profile
            .clone()
            .unwrap_or_else(|| shared.current.clone());
        let profile = shared
            .profiles
            .iter()
            .find(|p| p.name == profile_name)
            .ok_or_else(|| SdkError::SharedConfig {
                path: path.display().to_string(),
                message: format!("the profile {} does not exist", profile_name),
            })?;

        let keys = if profile.mode.eq_ignore_ascii_case("SSO") {
            profile
                .sso_auth
                .as_ref()
                .map(|sso| &sso.sts_token)
                .ok_or_else(|| SdkError::SharedConfig {
                    path: path.display().to_string(),
                    message: format!("profile {} uses SSO mode without an STS token", profile_name),
                })?
        } else {
            &profile.keys
        };

        log::debug!("loading profile {} from {}", profile_name, path.display());
        set_if_empty(&mut self.access_key, &keys.access_key_id);
        set_if_empty(&mut self.secret_key, &keys.secret_access_key);
        set_if_empty(&mut self.security_token, &keys.security_token);
        if self.region.is_empty() {
            self.region = profile.region.clone();
        }
        set_if_empty(&mut self.project_id, &profile.project_id);
        set_if_empty(&mut self.domain_id, &profile.domain_id);
        Ok(())
    }

    /// Load shared config, normalize endpoints and pick the auth mode
    pub fn load_and_validate(&mut self) -> SdkResult<AuthMode> {
        self.load_shared_config()?;

        if self.region.trim().is_empty() {
            return Err(SdkError::Config("region must be specified".to_string()));
        }
        self.normalize_endpoints()?;

        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        if let Some(token) = non_empty(&self.token) {
            return Ok(AuthMode::Token(token));
        }
        if let (Some(access_key), Some(secret_key)) =
            (non_empty(&self.access_key), non_empty(&self.secret_key))
        {
            return Ok(AuthMode::AkSk {
                access_key,
                secret_key,
                security_token: non_empty(&self.security_token),
            });
        }
        if let Some(password) = non_empty(&self.password) {
            let user_name = non_empty(&self.user_name);
            let user_id = non_empty(&self.user_id);
            if user_name.is_none() && user_id.is_none() {
                return Err(SdkError::Config(
                    "\"password\": one of `user_name, user_id` must be specified".to_string(),
                ));
            }
            return Ok(AuthMode::Password {
                user_name,
                user_id,
                password,
            });
        }

        Err(SdkError::MissingCredentials)
    }
}

fn set_if_empty(target: &mut Option<String>, value: &str) {
    if target.as_deref().is_none_or(str::is_empty) && !value.is_empty() {
        *target = Some(value.to_string());
    }
}

fn default_shared_config_path() -> SdkResult<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .ok_or_else(|| SdkError::Config("cannot determine the home directory".to_string()))?;
    Ok(PathBuf::from(home)
        .join(SHARED_CONFIG_DIR)
        .join(SHARED_CONFIG_FILE))
}

/// Layout of `~/.hcloud/config.json` written by KooCLI
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedConfig {
    #[serde(default)]
    current: String,
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileKeys {
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    secret_access_key: String,
    #[serde(default)]
    security_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SsoAuth {
    sts_token: ProfileKeys,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    name: String,
    #[serde(default)]
    mode: String,
    #[serde(flatten)]
    keys: ProfileKeys,
    #[serde(default)]
    region: String,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    domain_id: String,
    #[serde(default)]
    sso_auth: Option<SsoAuth>,
}

impl SharedConfig {
    fn from_file(path: &Path) -> SdkResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SdkError::SharedConfig {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| SdkError::SharedConfig {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}
