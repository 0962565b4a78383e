use rmcp::{
    ServerHandler,
    tool,
    model::{CallToolResult, Implementation, ProtocolVersion, ServerCapabilities},
    handler::server::wrapper::Parameters,
    ErrorData as McpError,
};
use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use chrono::NaiveDate;

use crate::backfill::scheduler::StartBackfillRequest;
use crate::backfill::{BackfillJob, BackfillType};
use crate::care_request::{CareRequest, GeoLocation, Patient, PatientName};
use crate::errors::PartnerError;
use crate::service::PartnerService;
use crate::store::Origin;

pub struct PartnerServer {
    service: Arc<PartnerService>,
    start_time: Instant,
}

impl PartnerServer {
    pub fn new(service: Arc<PartnerService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// Parameter structs

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct StartBackfillParams {
    /// Station channel item id of the partner (required)
    pub partner_channel_item_id: i64,
    /// Backfill type: "pophealth" (required)
    pub backfill_type: Option<String>,
    /// First day of the window, YYYY-MM-DD (required)
    pub start_date: Option<String>,
    /// Day the window ends, exclusive, YYYY-MM-DD (required)
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetBackfillParams {
    /// Backfill id returned by start_backfill (required)
    pub id: i64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct UpdateCareRequestPartnersParams {
    /// Origin to recompute: source, location, pop_health, insurance, provider_network
    pub origin: String,
    /// Station care request id (required)
    pub care_request_id: i64,
    /// Channel item the request arrived through (source)
    pub channel_item_id: Option<i64>,
    /// Latitude in micro-degrees (location)
    pub latitude_e6: Option<i32>,
    /// Longitude in micro-degrees (location)
    pub longitude_e6: Option<i32>,
    /// Patient given name (pop_health)
    pub patient_given_name: Option<String>,
    /// Patient family name (pop_health)
    pub patient_family_name: Option<String>,
    /// Patient date of birth, YYYY-MM-DD (pop_health)
    pub patient_date_of_birth: Option<String>,
    /// Patient SSN (pop_health, optional)
    pub patient_ssn: Option<String>,
    /// Upstream patient id (pop_health, optional)
    pub patient_id: Option<String>,
    /// Insurance package ids (insurance)
    #[serde(default)]
    pub insurance_package_ids: Vec<i64>,
    /// Provider network channel item ids (provider_network)
    #[serde(default)]
    pub provider_network_channel_item_ids: Vec<i64>,
}

impl UpdateCareRequestPartnersParams {
    fn into_care_request(self) -> Result<CareRequest, CallToolResult> {
        let date_of_birth = self
            .patient_date_of_birth
            .as_deref()
            .map(|s| parse_date(s, "patient_date_of_birth"))
            .transpose()?;

        let has_patient = self.patient_given_name.is_some()
            || self.patient_family_name.is_some()
            || date_of_birth.is_some();
        let patient = has_patient.then(|| Patient {
            external_id: self.patient_id,
            name: Some(PatientName {
                given_name: self.patient_given_name.unwrap_or_default(),
                family_name: self.patient_family_name.unwrap_or_default(),
            }),
            date_of_birth,
            ssn: self.patient_ssn,
        });

        let location = match (self.latitude_e6, self.longitude_e6) {
            (Some(latitude_e6), Some(longitude_e6)) => Some(GeoLocation { latitude_e6, longitude_e6 }),
            _ => None,
        };

        Ok(CareRequest {
            id: self.care_request_id,
            created_at: None,
            patient,
            location,
            channel_item_id: self.channel_item_id,
            insurance_package_ids: self.insurance_package_ids,
            provider_network_channel_item_ids: self.provider_network_channel_item_ids,
        })
    }
}

fn error_code(err: &PartnerError) -> &'static str {
    match err {
        PartnerError::InvalidInput { .. } => "invalid_input",
        PartnerError::NotFound { .. } => "not_found",
        PartnerError::Conflict(_) => "conflict",
        PartnerError::FailedPrecondition(_) => "failed_precondition",
        PartnerError::Config(_) | PartnerError::Internal(_) | PartnerError::Storage(_) => "internal",
    }
}

// Helper: convert PartnerError to CallToolResult with isError: true
fn partner_error_to_result(err: PartnerError) -> CallToolResult {
    let code = error_code(&err);
    match err {
        PartnerError::InvalidInput { message, field } => {
            let mut obj = json!({
                "isError": true,
                "code": code,
                "error": message,
            });
            if let Some(f) = field {
                obj["field"] = json!(f);
            }
            CallToolResult::structured_error(obj)
        }
        PartnerError::Conflict(msg) => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "code": code,
                "error": msg,
                "hint": "Use get_backfill to follow the running backfill"
            }))
        }
        other => {
            if other.is_internal() {
                tracing::error!(error = %other, "Tool call failed");
            }
            CallToolResult::structured_error(json!({
                "isError": true,
                "code": code,
                "error": other.to_string()
            }))
        }
    }
}

// Helper: parse a YYYY-MM-DD date
fn parse_date(s: &str, field: &str) -> Result<NaiveDate, CallToolResult> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        CallToolResult::structured_error(json!({
            "isError": true,
            "code": "invalid_input",
            "error": format!("Invalid date format for '{}': expected YYYY-MM-DD (e.g. 2024-01-31)", field),
            "field": field
        }))
    })
}

fn backfill_json(job: &BackfillJob) -> serde_json::Value {
    json!({
        "id": job.id,
        "partner_id": job.partner_id,
        "backfill_type": job.backfill_type.slug(),
        "start_date": job.start_date.to_rfc3339(),
        "end_date": job.end_date.to_rfc3339(),
        "last_processed_cursor": job.last_processed_cursor.map(|dt| dt.to_rfc3339()),
        "number_of_matches": job.number_of_matches,
        "error_description": job.error_description,
        "completed_at": job.completed_at.map(|dt| dt.to_rfc3339()),
        "state": format!("{:?}", job.state()),
    })
}

// Tool implementations
#[rmcp::tool_router]
impl PartnerServer {
    #[tool(description = "Start a backfill that recomputes a partner's associations for care requests created in [start_date, end_date). Returns as soon as the job is recorded; the backfill runs in the background.")]
    async fn start_backfill(
        &self,
        Parameters(params): Parameters<StartBackfillParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "start_backfill",
            partner_channel_item_id = params.partner_channel_item_id,
            backfill_type = ?params.backfill_type,
            "Tool called"
        );

        let backfill_type = match params.backfill_type.as_deref() {
            None | Some("") => None,
            Some(s) => match s.parse::<BackfillType>() {
                Ok(t) => Some(t),
                Err(e) => {
                    return Ok(CallToolResult::structured_error(json!({
                        "isError": true,
                        "code": "invalid_input",
                        "error": e,
                        "field": "backfill_type"
                    })))
                }
            },
        };
        let start_date = match params.start_date.as_deref().map(|s| parse_date(s, "start_date")).transpose() {
            Ok(d) => d,
            Err(result) => return Ok(result),
        };
        let end_date = match params.end_date.as_deref().map(|s| parse_date(s, "end_date")).transpose() {
            Ok(d) => d,
            Err(result) => return Ok(result),
        };

        let request = StartBackfillRequest {
            partner_channel_item_id: params.partner_channel_item_id,
            backfill_type,
            start_date,
            end_date,
        };
        match self.service.start_backfill(request).await {
            Ok(job) => {
                let mut body = backfill_json(&job);
                body["hint"] = json!("Use get_backfill with this id to follow progress");
                Ok(CallToolResult::structured(body))
            }
            Err(e) => Ok(partner_error_to_result(e)),
        }
    }

    #[tool(description = "Run every unfinished backfill concurrently and wait for them. Returns the first runner error if any runner fails.")]
    async fn process_pending_backfills(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "process_pending_backfills", "Tool called");

        match self.service.process_pending_backfills().await {
            Ok(summary) => Ok(CallToolResult::structured(json!({
                "launched": summary.launched,
                "finished": summary.finished,
                "skipped": summary.skipped,
            }))),
            Err(e) => Ok(partner_error_to_result(e)),
        }
    }

    #[tool(description = "Recompute and persist a care request's partners for one origin. Returns the reconciled partner ids for that origin.")]
    async fn update_care_request_partners(
        &self,
        Parameters(params): Parameters<UpdateCareRequestPartnersParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "update_care_request_partners",
            care_request_id = params.care_request_id,
            origin = %params.origin,
            "Tool called"
        );

        let origin = match params.origin.parse::<Origin>() {
            Ok(origin) => origin,
            Err(e) => {
                return Ok(CallToolResult::structured_error(json!({
                    "isError": true,
                    "code": "invalid_input",
                    "error": e,
                    "field": "origin"
                })))
            }
        };
        let care_request = match params.into_care_request() {
            Ok(care_request) => care_request,
            Err(result) => return Ok(result),
        };

        match self.service.update_care_request_partners(&care_request, origin).await {
            Ok(outcome) => Ok(CallToolResult::structured(json!({
                "care_request_id": care_request.id,
                "origin": origin.slug(),
                "partner_ids": outcome.partner_ids(),
                "created": outcome.created,
                "deleted": outcome.deleted,
            }))),
            Err(e) => Ok(partner_error_to_result(e)),
        }
    }

    #[tool(description = "Get a backfill's persisted state: cursor, match total, completion and error.")]
    async fn get_backfill(
        &self,
        Parameters(params): Parameters<GetBackfillParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "get_backfill", id = params.id, "Tool called");

        match self.service.get_backfill(params.id).await {
            Ok(job) => Ok(CallToolResult::structured(backfill_json(&job))),
            Err(e) => Ok(partner_error_to_result(e)),
        }
    }

    #[tool(description = "Check server health and status")]
    async fn health_check(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "health_check", "Tool called");

        let response = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.uptime_seconds(),
            "queued_backfills": self.service.queued_backfills(),
        });

        Ok(CallToolResult::structured(response))
    }
}

// ServerHandler implementation
#[rmcp::tool_handler(router = Self::tool_router())]
impl ServerHandler for PartnerServer {
    fn get_info(&self) -> rmcp::model::InitializeResult {
        rmcp::model::InitializeResult {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "partnerlink".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some("Care request partner matching and association backfills".to_string()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Partner association server. Tools: update_care_request_partners, start_backfill, get_backfill, process_pending_backfills, health_check.".to_string()
            ),
        }
    }
}
