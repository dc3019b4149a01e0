use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub ocr_endpoint: String,
    pub ocr_model: String,
    pub ocr_policy: &'static str,
}
