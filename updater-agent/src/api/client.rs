use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use tracing::debug;
use updater_core::{
    ApiAuth, ApiConfig, EndpointConfig, EntityProperties, LatestTagResponse,
    LogUploadConfig, ParamConf, Vars,
};

use super::{ApiError, VersioningService};
use crate::encoding::encode_batch;

/// HTTP client of the versioning API.
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("updater-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn endpoint_url(
        &self,
        endpoint: &EndpointConfig,
        vars: Option<&Vars>,
    ) -> Result<String, ApiError> {
        let base = format!(
            "{}{}",
            self.config.base_url.evaluate(vars)?,
            endpoint.endpoint.evaluate(vars)?
        );
        construct_url_with_params(&base, endpoint.params.as_ref(), vars)
    }

    /// Sends the request and returns the body of a 2xx response.
    ///
    /// The top-level auth header goes first, then the endpoint's own.
    async fn send(
        &self,
        method: Method,
        url: &str,
        endpoint_auth: Option<&ApiAuth>,
        vars: Option<&Vars>,
        body: Option<Vec<u8>>,
    ) -> Result<String, ApiError> {
        let mut request = self.http.request(method, url);
        for auth in [self.config.auth.as_ref(), endpoint_auth].into_iter().flatten() {
            request = request.header(auth.header_key.as_str(), auth.header_value.evaluate(vars)?);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn log_upload(&self) -> Result<&LogUploadConfig, ApiError> {
        self.config
            .log_upload
            .as_ref()
            .ok_or(ApiError::NotConfigured("log upload"))
    }
}

#[async_trait]
impl VersioningService for ApiClient {
    async fn get_latest_applicable_tag(
        &self,
        entity: &EntityProperties,
    ) -> Result<LatestTagResponse, ApiError> {
        let vars: Vars = BTreeMap::from([
            ("entity".to_string(), entity.id.clone()),
            ("image".to_string(), entity.image_name.clone()),
        ]);
        let endpoint = &self.config.latest_tag;
        let url = self.endpoint_url(endpoint, Some(&vars))?;
        debug!(entity = %entity.id, %url, "requesting latest applicable tag");
        let body = self
            .send(Method::GET, &url, endpoint.auth.as_ref(), Some(&vars), None)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_metadata(&self) -> Result<BTreeMap<String, String>, ApiError> {
        let endpoint = self
            .config
            .metadata
            .as_ref()
            .ok_or(ApiError::NotConfigured("metadata"))?;
        let url = self.endpoint_url(endpoint, None)?;
        debug!(%url, "requesting metadata");
        let body = self
            .send(Method::GET, &url, endpoint.auth.as_ref(), None, None)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_presigned_log_upload_url(&self, size: usize) -> Result<String, ApiError> {
        let endpoint = &self.log_upload()?.presigned_upload_url;
        let vars: Vars = BTreeMap::from([("size".to_string(), size.to_string())]);
        let url = self.endpoint_url(endpoint, Some(&vars))?;
        let body = self
            .send(Method::GET, &url, endpoint.auth.as_ref(), Some(&vars), None)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn upload_logs(&self, lines: &[String]) -> Result<(), ApiError> {
        let upload = self.log_upload()?;
        let method = Method::from_bytes(upload.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ApiError::InvalidMethod(upload.method.clone()))?;
        let batch = encode_batch(lines, &upload.encoding, upload.compression)?;
        let presigned = self.get_presigned_log_upload_url(batch.len()).await?;
        let url = construct_url_with_params(&presigned, upload.params.as_ref(), None)?;
        self.send(method, &url, upload.auth.as_ref(), None, Some(batch))
            .await?;
        Ok(())
    }
}

/// Appends `params` to the query of `base`.
///
/// Parameter values are evaluated with `vars`. Existing and new pairs are
/// sorted by key and form-encoded.
pub fn construct_url_with_params(
    base: &str,
    params: Option<&ParamConf>,
    vars: Option<&Vars>,
) -> Result<String, ApiError> {
    let mut url = Url::parse(base).map_err(|e| ApiError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    let Some(params) = params else {
        return Ok(url.to_string());
    };
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    for (key, value) in &params.query_params {
        pairs.push((key.clone(), value.evaluate(vars)?));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }
    Ok(url.to_string())
}
