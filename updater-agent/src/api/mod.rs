mod client;

pub use client::{ApiClient, construct_url_with_params};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use updater_core::{EntityProperties, LatestTagResponse, TemplateError};

use crate::encoding::EncodeError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("{0} endpoint is not configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status code is not in the expected range ({status}), response body: {body:?}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Remote service publishing the tags the agent should run.
#[async_trait]
pub trait VersioningService: Send + Sync {
    async fn get_latest_applicable_tag(
        &self,
        entity: &EntityProperties,
    ) -> Result<LatestTagResponse, ApiError>;

    async fn get_metadata(&self) -> Result<BTreeMap<String, String>, ApiError>;

    async fn get_presigned_log_upload_url(&self, size: usize) -> Result<String, ApiError>;

    async fn upload_logs(&self, lines: &[String]) -> Result<(), ApiError>;
}
