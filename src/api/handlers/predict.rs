//! Prediction endpoint
//!
//! Forwards the request body to the inference service on behalf of an
//! authenticated key. Quota was already charged by the auth middleware.

use actix_web::{http::header::CONTENT_TYPE, web, HttpRequest, HttpResponse};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::api::middleware::ApiKeyExt;
use crate::inference::InferenceError;
use crate::keys::KeyError;
use crate::AppState;

#[derive(Serialize, ToSchema)]
pub struct PredictResponse {
    pub owner_name: String,
    /// Result returned by the inference service, passed through unchanged
    #[schema(value_type = Object)]
    pub result: serde_json::Value,
}

/// POST /api/v1/predict - Run a prediction
#[utoipa::path(
    post,
    path = "/api/v1/predict",
    tag = "predict",
    request_body(content = Vec<u8>, description = "Payload forwarded to the inference service", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Prediction result", body = PredictResponse),
        (status = 401, description = "No API key"),
        (status = 403, description = "Invalid, revoked or expired API key"),
        (status = 429, description = "Daily quota exceeded"),
        (status = 502, description = "Inference service failed"),
        (status = 503, description = "Inference service not configured")
    ),
    security(("api_key" = []))
)]
pub async fn predict(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, KeyError> {
    let auth = req.require_api_key()?;

    let Some(client) = state.inference.as_ref() else {
        return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "error": "inference_unavailable",
            "message": "Inference service is not configured"
        })));
    };

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    match client.infer(body.to_vec(), &content_type).await {
        Ok(result) => {
            info!(key_id = %auth.record.id, owner = %auth.record.owner_name, "Prediction served");
            Ok(HttpResponse::Ok().json(PredictResponse {
                owner_name: auth.record.owner_name,
                result,
            }))
        }
        Err(e) => {
            warn!(key_id = %auth.record.id, error = %e, "Prediction failed");
            let message = match e {
                InferenceError::Upstream { status, .. } => {
                    format!("Inference service returned {}", status)
                }
                _ => "Inference service unreachable".to_string(),
            };
            Ok(HttpResponse::BadGateway().json(serde_json::json!({
                "error": "inference_failed",
                "message": message
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{app, app_state, call_json};
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn test_predict_requires_key() {
        let app = test::init_service(app(app_state())).await;
        let (status, body) = call_json!(&app, test::TestRequest::post().uri("/api/v1/predict")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_credential");
    }

    #[actix_web::test]
    async fn test_predict_without_inference_service() {
        let app = test::init_service(app(app_state())).await;
        let (status, body) = call_json!(
            &app,
            test::TestRequest::post()
                .uri("/api/v1/predict")
                .insert_header(("X-API-Key", "master-secret"))
                .set_payload("image-bytes")
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "inference_unavailable");
    }
}
