//! Stand-in versioning API for local runs.

use axum::{Json, Router, routing::get};
use updater_core::LatestTagResponse;

pub fn fixed_response() -> LatestTagResponse {
    LatestTagResponse {
        tag: "v0.1.47".into(),
        image: "edgedelta".into(),
        url: "gcr.io/edgedelta/agent:v0.1.47".into(),
    }
}

async fn latest_tag() -> Json<LatestTagResponse> {
    Json(fixed_response())
}

pub fn router() -> Router {
    Router::new().route("/", get(latest_tag))
}
