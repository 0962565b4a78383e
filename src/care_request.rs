/// Care request snapshot as seen by partner matching.
///
/// Care requests are owned by the episode service; this crate only reads the
/// attributes that feed the origin matchers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CareRequest {
    /// External (station) care request id
    pub id: i64,
    /// Creation time; required for backfill cursoring
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient: Option<Patient>,
    #[serde(default)]
    pub location: Option<GeoLocation>,
    /// Channel item the request arrived through (source origin)
    #[serde(default)]
    pub channel_item_id: Option<i64>,
    #[serde(default)]
    pub insurance_package_ids: Vec<i64>,
    #[serde(default)]
    pub provider_network_channel_item_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Patient id in the upstream patient system, when known
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub name: Option<PatientName>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub ssn: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientName {
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
}

/// Coordinates in micro-degrees (degrees * 1e6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude_e6: i32,
    pub longitude_e6: i32,
}

/// Demographics required to run a population health patient search.
#[derive(Debug, Clone, PartialEq)]
pub struct Demographics<'a> {
    pub given_name: &'a str,
    pub family_name: &'a str,
    pub date_of_birth: NaiveDate,
    pub ssn: Option<&'a str>,
    pub external_id: Option<&'a str>,
}

impl CareRequest {
    /// Borrow the patient demographics if they are complete enough to search on.
    pub fn demographics(&self) -> Option<Demographics<'_>> {
        let patient = self.patient.as_ref()?;
        let name = patient.name.as_ref()?;
        let date_of_birth = patient.date_of_birth?;
        if name.given_name.trim().is_empty() || name.family_name.trim().is_empty() {
            return None;
        }
        Some(Demographics {
            given_name: &name.given_name,
            family_name: &name.family_name,
            date_of_birth,
            ssn: patient.ssn.as_deref(),
            external_id: patient.external_id.as_deref(),
        })
    }

    /// Check the attributes a backfill batch needs before matching this request.
    ///
    /// Returns the reason the request must be skipped.
    pub fn validate_for_backfill(&self) -> Result<(), &'static str> {
        if self.created_at.is_none() {
            return Err("care request created_at is missing");
        }
        let patient = self.patient.as_ref().ok_or("care request patient is missing")?;
        let name = patient
            .name
            .as_ref()
            .ok_or("care request patient name is missing")?;
        if patient.date_of_birth.is_none() {
            return Err("care request patient date_of_birth is missing");
        }
        if name.given_name.trim().is_empty() || name.family_name.trim().is_empty() {
            return Err("care request patient given name or family name is empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_request() -> CareRequest {
        CareRequest {
            id: 7,
            created_at: Some(Utc::now()),
            patient: Some(Patient {
                external_id: Some("p-1".to_string()),
                name: Some(PatientName {
                    given_name: "Ada".to_string(),
                    family_name: "Lovelace".to_string(),
                }),
                date_of_birth: NaiveDate::from_ymd_opt(1815, 12, 10),
                ssn: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_request_is_valid() {
        let request = complete_request();
        assert!(request.validate_for_backfill().is_ok());
        let demographics = request.demographics().expect("demographics");
        assert_eq!(demographics.family_name, "Lovelace");
        assert_eq!(demographics.external_id, Some("p-1"));
    }

    #[test]
    fn test_missing_date_of_birth_is_invalid() {
        let mut request = complete_request();
        request.patient.as_mut().unwrap().date_of_birth = None;
        assert_eq!(
            request.validate_for_backfill(),
            Err("care request patient date_of_birth is missing")
        );
        assert!(request.demographics().is_none());
    }

    #[test]
    fn test_blank_name_is_invalid() {
        let mut request = complete_request();
        request.patient.as_mut().unwrap().name.as_mut().unwrap().given_name = "  ".to_string();
        assert!(request.validate_for_backfill().is_err());
    }

    #[test]
    fn test_missing_created_at_is_invalid() {
        let mut request = complete_request();
        request.created_at = None;
        assert_eq!(
            request.validate_for_backfill(),
            Err("care request created_at is missing")
        );
        // demographics alone do not need a creation time
        assert!(request.demographics().is_some());
    }
}
