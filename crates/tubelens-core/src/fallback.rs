//! Non-streaming fallback
//!
//! Used when the server has no streaming route. Issues one request and maps
//! the JSON reply onto the same `AnalysisResult` the stream produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::events::AnalysisResult;
use crate::request::AnalysisRequest;
use crate::transport::AnalysisTransport;

const GENERIC_FAILURE: &str = "Analysis request failed";
const MISSING_ANALYSIS: &str = "Analysis response contained no analysis text";

/// Reply of the non-streaming endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub success: bool,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FallbackResponse {
    /// Map onto the streaming result shape, or the user-visible error
    pub fn into_result(self) -> Result<AnalysisResult, String> {
        if !self.success {
            return Err(self
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string()));
        }
        match self.analysis {
            Some(text) => Ok(AnalysisResult {
                text,
                metadata: self.metadata,
            }),
            None => Err(MISSING_ANALYSIS.to_string()),
        }
    }
}

/// Run the fallback request once and return the result or error message
pub async fn fetch_result(
    transport: &dyn AnalysisTransport,
    request: &AnalysisRequest,
) -> Result<AnalysisResult, String> {
    let response = transport.fetch_fallback(request).await.map_err(|e| {
        warn!("Fallback request failed: {}", e);
        e.to_string()
    })?;

    let result = response.into_result();
    match &result {
        Ok(r) => info!("Fallback analysis received: {} chars", r.text.len()),
        Err(e) => warn!("Fallback analysis failed: {}", e),
    }
    result
}
