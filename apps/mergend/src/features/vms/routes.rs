use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use mergen_types::CreateVmRequest;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::features::vms::service::ServiceError;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/v1/vms", post(create).get(list))
        .route("/v1/vms/:id/start", post(start))
        .route("/v1/vms/:id/stop", post(stop))
        .route("/v1/vms/:id", get(get_vm).delete(delete_vm))
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServiceError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::Conflict => (StatusCode::CONFLICT, "conflict"),
            ServiceError::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable")
            }
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            error!(status = %status, error = %self, "http request failed");
        } else {
            warn!(status = %status, error = %self, "http request failed");
        }
        let body = Json(serde_json::json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn create(
    Extension(st): Extension<AppState>,
    Json(req): Json<CreateVmRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = st.service.create(req).await?;
    info!(vm_id = %id, "http create vm success");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"id": id, "status": "created"})),
    ))
}

async fn start(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    st.service.start(&id).await?;
    info!(vm_id = %id, "http start vm success");
    Ok(Json(serde_json::json!({"id": id, "status": "started"})))
}

async fn stop(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    st.service.stop(&id).await?;
    info!(vm_id = %id, "http stop vm success");
    Ok(Json(serde_json::json!({"id": id, "status": "stopped"})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    #[serde(default)]
    retain_data: bool,
}

async fn delete_vm(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ServiceError> {
    st.service.delete(&id, params.retain_data).await?;
    info!(vm_id = %id, retain_data = params.retain_data, "http delete vm success");
    Ok(Json(serde_json::json!({"id": id, "status": "deleted"})))
}

async fn get_vm(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let summary = st.service.get(&id).await?;
    Ok(Json(summary))
}

async fn list(Extension(st): Extension<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let items = st.service.list().await?;
    Ok(Json(serde_json::json!({"items": items})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::vms::service::testutil::{minimal_request, test_env};
    use std::sync::Arc;

    fn state(env: crate::features::vms::service::testutil::TestEnv) -> AppState {
        AppState {
            service: Arc::new(env.service),
        }
    }

    #[tokio::test]
    async fn create_returns_201_with_the_new_id() {
        let base = tempfile::tempdir().unwrap();
        let env = test_env(base.path());
        let req = minimal_request(&env);
        let st = state(env);

        let response = create(Extension(st), Json(req))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "created");
        assert!(body["id"].as_str().is_some());
    }

    #[tokio::test]
    async fn error_taxonomy_maps_to_the_documented_envelope() {
        let cases = [
            (
                ServiceError::InvalidRequest("bad".into()),
                StatusCode::BAD_REQUEST,
                "bad_request",
            ),
            (ServiceError::NotFound, StatusCode::NOT_FOUND, "not_found"),
            (ServiceError::Conflict, StatusCode::CONFLICT, "conflict"),
            (
                ServiceError::Unavailable("no systemd".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "dependency_unavailable",
            ),
            (
                ServiceError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];

        for (err, expected_status, expected_code) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), expected_status);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["error"], expected_code);
            assert!(body["message"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn start_on_unknown_vm_maps_to_404() {
        let base = tempfile::tempdir().unwrap();
        let st = state(test_env(base.path()));

        let err = start(Extension(st), Path("missing".to_string()))
            .await
            .err()
            .expect("start should fail");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_honors_retain_data_query() {
        let base = tempfile::tempdir().unwrap();
        let env = test_env(base.path());
        let req = minimal_request(&env);
        let data_root = base.path().join("var/lib/mergen");
        let st = state(env);

        let id = st.service.create(req).await.unwrap();
        delete_vm(
            Extension(st),
            Path(id.clone()),
            Query(DeleteParams { retain_data: true }),
        )
        .await
        .unwrap();
        assert!(data_root.join(&id).exists());
    }
}
