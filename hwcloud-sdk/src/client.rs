//! Provider-level and service-level HTTP clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::catalog::{self, ServiceCatalog};
use crate::config::{AuthMode, Config};
use crate::error::{SdkError, SdkResult, parse_error_body};
use crate::signer::{HEADER_SECURITY_TOKEN, Signer};

const USER_AGENT: &str = concat!("hwcloud-provider/", env!("CARGO_PKG_VERSION"));
const HEADER_AUTH_TOKEN: &str = "x-auth-token";
const HEADER_PROJECT_ID: &str = "x-project-id";
const HEADER_DOMAIN_ID: &str = "x-domain-id";
/// Throttling backoff never exceeds this many base intervals
const MAX_BACKOFF_FACTOR: u32 = 30;

/// How a single request is authorized
#[derive(Clone)]
pub(crate) enum Credential {
    Token(String),
    AkSk {
        signer: Signer,
        security_token: Option<String>,
    },
}

/// Authenticated entry point shared by every service client.
///
/// Cheap to clone; the project ID cache and password token are shared.
#[derive(Clone)]
pub struct ProviderClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) auth: AuthMode,
    pub(crate) http: reqwest::Client,
    /// region -> project ID
    pub(crate) projects: Mutex<HashMap<String, String>>,
    pub(crate) domain_id: Mutex<Option<String>>,
    /// Token issued for password auth
    pub(crate) token: Mutex<Option<String>>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("region", &self.inner.config.region)
            .field("auth", &self.inner.auth)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    /// Validate `config` and build the HTTP client. No request is sent.
    pub fn new(mut config: Config) -> SdkResult<Self> {
        let auth = config.load_and_validate()?;

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(config.insecure)
            .connect_timeout(Duration::from_secs(30));
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        let mut projects = HashMap::new();
        if let Some(project_id) = config.project_id.clone().filter(|p| !p.is_empty()) {
            projects.insert(config.region.clone(), project_id);
        }
        let domain_id = config.domain_id.clone().filter(|d| !d.is_empty());

        log::debug!("provider client ready for region {} ({:?})", config.region, auth);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                auth,
                http,
                projects: Mutex::new(projects),
                domain_id: Mutex::new(domain_id),
                token: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn region(&self) -> &str {
        &self.inner.config.region
    }

    /// Endpoint for `service` in `region`, honoring custom endpoints
    pub fn endpoint_for(&self, service: &str, region: &str) -> SdkResult<String> {
        let config = &self.inner.config;
        if let Some(url) = config.endpoints.get(service) {
            return Ok(url.clone());
        }
        if matches!(service, "iam" | "identity") {
            return Ok(self.identity_base());
        }
        let entry = lookup(service)?;
        Ok(entry.default_endpoint(region, config.cloud_domain(), config.uses_region_endpoints()))
    }

    /// Base URL of IAM, without the `v3/` suffix
    pub(crate) fn identity_base(&self) -> String {
        let config = &self.inner.config;
        if let Some(url) = config.endpoints.get("iam") {
            return url.clone();
        }
        let endpoint = config.identity_endpoint();
        let base = endpoint.strip_suffix("/v3").unwrap_or(&endpoint);
        format!("{}/", base.trim_end_matches('/'))
    }

    /// Client for `service` (a catalog key such as `vpc` or `elb`) in `region`
    pub async fn service_client(&self, service: &str, region: &str) -> SdkResult<ServiceClient> {
        let entry = lookup(service)?;
        let config = &self.inner.config;

        if region != config.region && !self.inner.auth.is_aksk() {
            return Err(SdkError::Config(format!(
                "resource-level region {} must be authorized by AK/SK (provider region is {})",
                region, config.region
            )));
        }

        let endpoint = self.endpoint_for(service, region)?;
        let project_id = if entry.without_project_id {
            String::new()
        } else {
            self.project_id(region).await?
        };
        let domain_id = if entry.admin {
            match self.domain_id().await {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("get domain id failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(ServiceClient {
            http: self.inner.http.clone(),
            credential: self.credential(region).await?,
            resource_base: entry.resource_base_url(&endpoint, &project_id),
            endpoint,
            project_id,
            domain_id,
            region: region.to_string(),
            catalog: *entry,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Client for IAM calls made while resolving other clients; never looks up
    /// a project itself.
    pub(crate) fn identity_client(&self, credential: Option<Credential>) -> SdkResult<ServiceClient> {
        let entry = lookup("identity")?;
        let endpoint = self.identity_base();
        Ok(ServiceClient {
            http: self.inner.http.clone(),
            credential,
            resource_base: entry.resource_base_url(&endpoint, ""),
            endpoint,
            project_id: String::new(),
            domain_id: None,
            region: self.inner.config.region.clone(),
            catalog: *entry,
            max_retries: self.inner.config.max_retries,
            retry_backoff: self.inner.config.retry_backoff,
        })
    }

    pub(crate) async fn credential(&self, region: &str) -> SdkResult<Option<Credential>> {
        match &self.inner.auth {
            AuthMode::Token(token) => Ok(Some(Credential::Token(token.clone()))),
            AuthMode::AkSk {
                access_key,
                secret_key,
                security_token,
            } => Ok(Some(Credential::AkSk {
                signer: Signer::new(access_key.clone(), secret_key.clone()),
                security_token: security_token.clone(),
            })),
            AuthMode::Password { .. } => {
                let token = self.password_token(region).await?;
                Ok(Some(Credential::Token(token)))
            }
        }
    }
}

fn lookup(service: &str) -> SdkResult<&'static ServiceCatalog> {
    catalog::lookup(service)
        .ok_or_else(|| SdkError::Config(format!("service {} is not in the catalog", service)))
}

/// Options for a single request
#[derive(Debug, Clone, Default)]
pub struct RequestOpts {
    pub json_body: Option<Value>,
    /// Accepted status codes; defaults depend on the method
    pub ok_codes: Option<Vec<u16>>,
    pub more_headers: Vec<(String, String)>,
}

impl RequestOpts {
    pub fn json(body: Value) -> Self {
        Self {
            json_body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_ok_codes(mut self, codes: &[u16]) -> Self {
        self.ok_codes = Some(codes.to_vec());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.more_headers.push((name.into(), value.into()));
        self
    }
}

fn default_ok_codes(method: &Method) -> &'static [u16] {
    match *method {
        Method::GET | Method::HEAD => &[200],
        Method::POST | Method::PUT => &[200, 201, 202, 204],
        Method::PATCH | Method::DELETE => &[200, 202, 204],
        _ => &[200],
    }
}

/// Raw response of a successful request
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    /// Parsed JSON body; `Null` when the body is empty
    pub fn json(&self, url: &str) -> SdkResult<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|source| SdkError::Json {
            url: url.to_string(),
            source,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Client bound to one service endpoint, region and project
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    credential: Option<Credential>,
    endpoint: String,
    resource_base: String,
    project_id: String,
    domain_id: Option<String>,
    region: String,
    catalog: ServiceCatalog,
    max_retries: u32,
    retry_backoff: Duration,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn resource_base(&self) -> &str {
        &self.resource_base
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// `endpoint + template` with `{project_id}` filled in
    pub fn url(&self, template: &str) -> String {
        self.build_path(template, &[])
    }

    /// `endpoint + template` with `{project_id}` and each `{name}` in `params` filled in
    pub fn build_path(&self, template: &str, params: &[(&str, &str)]) -> String {
        let mut path = template
            .trim_start_matches('/')
            .replace("{project_id}", &self.project_id);
        for (name, value) in params {
            path = path.replace(&format!("{{{}}}", name), &urlencoding::encode(value));
        }
        format!("{}{}", self.endpoint, path)
    }

    pub async fn get(&self, url: &str) -> SdkResult<Value> {
        self.request(Method::GET, url, RequestOpts::default()).await
    }

    pub async fn post(&self, url: &str, body: Value) -> SdkResult<Value> {
        self.request(Method::POST, url, RequestOpts::json(body)).await
    }

    pub async fn put(&self, url: &str, body: Value) -> SdkResult<Value> {
        self.request(Method::PUT, url, RequestOpts::json(body)).await
    }

    pub async fn delete(&self, url: &str) -> SdkResult<Value> {
        self.request(Method::DELETE, url, RequestOpts::default()).await
    }

    /// Send a request and parse the JSON body
    pub async fn request(&self, method: Method, url: &str, opts: RequestOpts) -> SdkResult<Value> {
        self.request_raw(method, url, opts).await?.json(url)
    }

    /// Send a request with retries; non-accepted statuses become errors
    pub async fn request_raw(
        &self,
        method: Method,
        url: &str,
        opts: RequestOpts,
    ) -> SdkResult<Response> {
        let parsed = Url::parse(url).map_err(|e| SdkError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let body = match &opts.json_body {
            Some(value) => serde_json::to_vec(value).map_err(|source| SdkError::Json {
                url: url.to_string(),
                source,
            })?,
            None => Vec::new(),
        };

        let mut retries = 0;
        let response = loop {
            match self.send_once(&method, &parsed, &opts, &body).await {
                Ok(resp) if resp.status == 429 && retries < self.max_retries => {
                    let wait = self.backoff(retries);
                    log::warn!(
                        "received 429 Too Many Requests from {} {}, retrying in {:?}",
                        method,
                        url,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    retries += 1;
                }
                Err(SdkError::Network(e))
                    if (e.is_connect() || e.is_timeout()) && retries < self.max_retries =>
                {
                    let wait = self.backoff(retries);
                    log::warn!("{} {} failed ({}), retrying in {:?}", method, url, e, wait);
                    tokio::time::sleep(wait).await;
                    retries += 1;
                }
                other => break other?,
            }
        };

        let expected: Vec<u16> = opts
            .ok_codes
            .clone()
            .unwrap_or_else(|| default_ok_codes(&method).to_vec());
        if expected.contains(&response.status) {
            return Ok(response);
        }

        let body = String::from_utf8_lossy(&response.body).into_owned();
        let (error_code, error_msg) = parse_error_body(&body);
        Err(SdkError::UnexpectedStatus {
            status: response.status,
            method: method.to_string(),
            url: url.to_string(),
            expected,
            error_code,
            error_msg,
            body,
        })
    }

    fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor.min(MAX_BACKOFF_FACTOR))
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        opts: &RequestOpts,
        body: &[u8],
    ) -> SdkResult<Response> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if opts.json_body.is_some() {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json;charset=UTF-8"),
            );
        }
        for (name, value) in &opts.more_headers {
            insert_header(&mut headers, name, value)?;
        }

        match &self.credential {
            Some(Credential::Token(token)) => insert_header(&mut headers, HEADER_AUTH_TOKEN, token)?,
            Some(Credential::AkSk {
                signer,
                security_token,
            }) => {
                if !self.catalog.without_project_id && !self.project_id.is_empty() {
                    insert_header(&mut headers, HEADER_PROJECT_ID, &self.project_id)?;
                }
                if self.catalog.admin
                    && let Some(domain_id) = &self.domain_id
                {
                    insert_header(&mut headers, HEADER_DOMAIN_ID, domain_id)?;
                }
                if let Some(token) = security_token {
                    insert_header(&mut headers, HEADER_SECURITY_TOKEN, token)?;
                }
                signer.sign(method, url, &mut headers, body, chrono::Utc::now())?;
            }
            None => {}
        }

        log::debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body.to_vec());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        log::debug!("{} {} -> {}", method, url, status);

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> SdkResult<()> {
    let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|e| SdkError::Config(format!("invalid header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| SdkError::Config(format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

/// Append `params` to `url`, skipping empty values
pub fn with_query(url: &str, params: &[(&str, String)]) -> String {
    let query: Vec<String> = params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    if query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query.join("&"))
}
