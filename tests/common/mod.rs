#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use partnerlink::clients::{
    BackfillStatusReport, BackfillStatusReporter, CareRequestSource, CareRequestWindow, MatchedPatient,
    PatientQuery, PatientSearch,
};
use partnerlink::care_request::{CareRequest, Patient, PatientName};
use partnerlink::config::Config;
use partnerlink::errors::PartnerError;
use partnerlink::service::{Collaborators, PartnerService};
use partnerlink::store::memory::InMemoryPartnerStore;
use partnerlink::store::Partner;

/// Care request listing over a fixed set of requests, honoring the window
/// semantics of the real service.
#[derive(Default)]
pub struct ScriptedCareRequests {
    requests: Mutex<Vec<CareRequest>>,
    windows: Mutex<Vec<CareRequestWindow>>,
    fail_calls: Mutex<HashSet<usize>>,
    panic_calls: Mutex<HashSet<usize>>,
}

impl ScriptedCareRequests {
    pub fn new(requests: Vec<CareRequest>) -> Self {
        ScriptedCareRequests {
            requests: Mutex::new(requests),
            ..Default::default()
        }
    }

    /// Make the nth listing call (0-based) fail.
    pub fn fail_call(&self, n: usize) {
        self.fail_calls.lock().unwrap().insert(n);
    }

    /// Make the nth listing call (0-based) panic.
    pub fn panic_call(&self, n: usize) {
        self.panic_calls.lock().unwrap().insert(n);
    }

    pub fn windows(&self) -> Vec<CareRequestWindow> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl CareRequestSource for ScriptedCareRequests {
    async fn list_care_requests(&self, window: &CareRequestWindow) -> Result<Vec<CareRequest>, PartnerError> {
        let call = {
            let mut windows = self.windows.lock().unwrap();
            windows.push(window.clone());
            windows.len() - 1
        };
        if self.panic_calls.lock().unwrap().remove(&call) {
            panic!("care request listing crashed");
        }
        if self.fail_calls.lock().unwrap().remove(&call) {
            return Err(PartnerError::Internal("episode service returned status 503: unavailable".to_string()));
        }

        let mut matching: Vec<CareRequest> = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|cr| match cr.created_at {
                Some(t) => t >= window.created_from && t < window.created_before,
                None => false,
            })
            .cloned()
            .collect();
        matching.sort_by_key(|cr| (cr.created_at, cr.id));
        matching.truncate(window.max_results as usize);
        if !window.include_patient {
            for cr in &mut matching {
                cr.patient = None;
            }
        }
        Ok(matching)
    }
}

/// Patient search keyed by family name. Each name maps to the channel items
/// holding a record for that patient.
#[derive(Default)]
pub struct ScriptedPatientSearch {
    records: Mutex<HashMap<String, Vec<i64>>>,
    failing_names: Mutex<HashSet<String>>,
    queries: Mutex<Vec<PatientQuery>>,
}

impl ScriptedPatientSearch {
    pub fn with_record(self, family_name: &str, channel_item_ids: &[i64]) -> Self {
        self.records
            .lock()
            .unwrap()
            .insert(family_name.to_string(), channel_item_ids.to_vec());
        self
    }

    pub fn fail_for(&self, family_name: &str) {
        self.failing_names.lock().unwrap().insert(family_name.to_string());
    }

    pub fn queries(&self) -> Vec<PatientQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PatientSearch for ScriptedPatientSearch {
    async fn search_patients(&self, query: &PatientQuery) -> Result<Vec<MatchedPatient>, PartnerError> {
        self.queries.lock().unwrap().push(query.clone());
        if self.failing_names.lock().unwrap().contains(&query.last_name) {
            return Err(PartnerError::Internal("population health service returned status 500: boom".to_string()));
        }
        let records = self.records.lock().unwrap();
        let channel_item_ids = records.get(&query.last_name).cloned().unwrap_or_default();
        Ok(channel_item_ids
            .into_iter()
            .filter(|id| query.channel_item_ids.is_empty() || query.channel_item_ids.contains(id))
            .map(|channel_item_id| MatchedPatient { id: None, channel_item_id })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<BackfillStatusReport>>,
    fail: Mutex<bool>,
}

impl RecordingReporter {
    pub fn failing() -> Self {
        RecordingReporter {
            fail: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn reports(&self) -> Vec<BackfillStatusReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackfillStatusReporter for RecordingReporter {
    async fn report(&self, report: &BackfillStatusReport) -> Result<(), PartnerError> {
        self.reports.lock().unwrap().push(report.clone());
        if *self.fail.lock().unwrap() {
            return Err(PartnerError::Internal("population health service returned status 502".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryPartnerStore>,
    pub care_requests: Arc<ScriptedCareRequests>,
    pub patient_search: Arc<ScriptedPatientSearch>,
    pub reporter: Arc<RecordingReporter>,
    pub service: PartnerService,
}

pub fn config(batch_size: u32) -> Config {
    let mut config = Config::default();
    config.backfill.batch_size = batch_size;
    config.backfill.sweep_on_startup = false;
    config.services.patient_cache_ttl_secs = 0;
    config
}

pub fn harness(
    batch_size: u32,
    care_requests: ScriptedCareRequests,
    patient_search: ScriptedPatientSearch,
    reporter: RecordingReporter,
) -> Harness {
    let store = Arc::new(InMemoryPartnerStore::new());
    let care_requests = Arc::new(care_requests);
    let patient_search = Arc::new(patient_search);
    let reporter = Arc::new(reporter);
    let service = PartnerService::new(
        store.clone(),
        Collaborators {
            care_requests: care_requests.clone(),
            patient_search: patient_search.clone(),
            reporter: reporter.clone(),
        },
        &config(batch_size),
    );
    Harness {
        store,
        care_requests,
        patient_search,
        reporter,
        service,
    }
}

pub fn partner(channel_item_id: i64) -> Partner {
    Partner {
        id: 0,
        channel_item_id,
        name: format!("Partner {}", channel_item_id),
        latitude_e6: None,
        longitude_e6: None,
        insurance_package_ids: Vec::new(),
        deactivated_at: None,
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, day, hour, 0, 0).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// A care request with complete patient demographics.
pub fn care_request(id: i64, created_at: DateTime<Utc>, family_name: &str) -> CareRequest {
    CareRequest {
        id,
        created_at: Some(created_at),
        patient: Some(Patient {
            external_id: None,
            name: Some(PatientName {
                given_name: "Pat".to_string(),
                family_name: family_name.to_string(),
            }),
            date_of_birth: Some(date(1980, 5, 17)),
            ssn: None,
        }),
        ..Default::default()
    }
}

/// Poll until `check` holds, failing the test after two seconds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
