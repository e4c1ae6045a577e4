//! Client for the remote validation service.

use crate::dataset::Dataset;
use crate::error::{ErrorBody, ServiceError};
use crate::report::Finding;
use crate::schema::SchemaDescriptor;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Validation service client.
#[derive(Clone)]
pub struct ValidatorClient {
    client: Client,
    endpoint: String,
}

impl ValidatorClient {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Submit the spreadsheet rows for validation against a template.
    pub async fn validate(&self, dataset: &Dataset, template_iri: &str) -> Result<ValidationResponse, ServiceError> {
        let request = ValidationRequest {
            spreadsheet_data: dataset.to_json_rows(),
            cedar_template_iri: template_iri.to_string(),
        };
        debug!(
            "Sending {} rows to validation service (template={})",
            request.spreadsheet_data.len(),
            template_iri
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Validation service error ({}): {}", status, text);
            return Err(service_error(status, &text));
        }

        let response: ValidationResponse = response.json().await.map_err(|e| {
            ServiceError(ErrorBody {
                message: "The validation service returned an unreadable response.".to_string(),
                cause: e.to_string(),
                status_info: status.to_string(),
                fix_suggestion: None,
            })
        })?;

        info!(
            "Validation response: {} rows, {} findings, {} described columns",
            response.data.len(),
            response.reporting.len(),
            response.schema.column_description.len()
        );
        Ok(response)
    }
}

/// Build the structured error from a non-2xx body, falling back to the raw text.
fn service_error(status: reqwest::StatusCode, text: &str) -> ServiceError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(mut body) => {
            if body.status_info == "N/A" {
                body.status_info = status.to_string();
            }
            ServiceError(body)
        }
        Err(_) => ServiceError(ErrorBody {
            message: "The validation service rejected the spreadsheet.".to_string(),
            cause: text.to_string(),
            status_info: status.to_string(),
            fix_suggestion: None,
        }),
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationRequest {
    spreadsheet_data: Vec<serde_json::Value>,
    cedar_template_iri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResponse {
    pub schema: SchemaDescriptor,
    pub data: Dataset,
    #[serde(default)]
    pub reporting: Vec<Finding>,
}
