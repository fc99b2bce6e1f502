use chrono::{NaiveDate, NaiveDateTime, SubsecRound, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};

use crate::schema::{diagnosis, future_checkup, identity_doctor, identity_patient, medication};

// Relational mirror of a patient identity held in the document store
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = identity_patient)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PatientIdentity {
    pub id: i32,
    pub ref_doc_id: String,
    pub name: String,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = identity_patient)]
pub struct NewPatientIdentity {
    pub ref_doc_id: String,
    pub name: String,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub phone: Option<String>,
}

// Relational mirror of a doctor identity held in the document store
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = identity_doctor)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DoctorIdentity {
    pub id: i32,
    pub ref_doc_id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = identity_doctor)]
pub struct NewDoctorIdentity {
    pub ref_doc_id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = diagnosis)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Diagnosis {
    pub id: i32,
    pub patient_id: i32,
    pub doctor_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub diagnosis_date: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = diagnosis)]
pub struct NewDiagnosis {
    pub patient_id: i32,
    pub doctor_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub diagnosis_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = medication)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Medication {
    pub id: i32,
    pub diagnosis_id: i32,
    pub name: String,
    pub dosage: String,
    pub duration: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = medication)]
pub struct NewMedication {
    pub diagnosis_id: i32,
    pub name: String,
    pub dosage: String,
    pub duration: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = future_checkup)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FutureCheckup {
    pub id: i32,
    pub diagnosis_id: i32,
    pub checkup_date: NaiveDate,
    pub purpose: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = future_checkup)]
pub struct NewFutureCheckup {
    pub diagnosis_id: i32,
    pub checkup_date: NaiveDate,
    pub purpose: String,
    pub notes: Option<String>,
}

/// Patient profile fields handed over by the caller on diagnosis creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "optional_date")]
    pub dob: Option<NaiveDate>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl PatientProfile {
    pub fn to_identity(&self, ref_doc_id: &str) -> NewPatientIdentity {
        NewPatientIdentity {
            ref_doc_id: ref_doc_id.to_string(),
            name: self.name.trim().to_string(),
            gender: non_blank(self.gender.as_deref()),
            dob: self.dob,
            phone: non_blank(self.phone.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MedicationInput {
    #[serde(rename = "medication_name", alias = "name")]
    pub name: String,
    pub dosage: String,
    pub duration: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MedicationInput {
    pub fn to_medication(&self, diagnosis_id: i32) -> NewMedication {
        NewMedication {
            diagnosis_id,
            name: self.name.clone(),
            dosage: self.dosage.clone(),
            duration: self.duration.clone(),
            notes: non_blank(self.notes.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckupInput {
    #[serde(alias = "date")]
    pub checkup_date: NaiveDate,
    pub purpose: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CheckupInput {
    pub fn to_checkup(&self, diagnosis_id: i32) -> NewFutureCheckup {
        NewFutureCheckup {
            diagnosis_id,
            checkup_date: self.checkup_date,
            purpose: self.purpose.clone(),
            notes: non_blank(self.notes.as_deref()),
        }
    }
}

/// Create-diagnosis request, using the field names of the clinic frontend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateDiagnosis {
    #[serde(rename = "_id", default)]
    pub patient_doc_id: String,
    #[serde(rename = "userData", default)]
    pub patient: PatientProfile,
    #[serde(rename = "diagnosis_title", default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub diagnosis_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub medications: Vec<MedicationInput>,
    #[serde(default)]
    pub future_checkups: Vec<CheckupInput>,
}

impl CreateDiagnosis {
    pub fn to_diagnosis(&self, patient_id: i32, doctor_id: i32) -> NewDiagnosis {
        NewDiagnosis {
            patient_id,
            doctor_id,
            title: self.title.trim().to_string(),
            description: non_blank(self.description.as_deref()),
            diagnosis_date: self
                .diagnosis_date
                .unwrap_or_else(|| Utc::now().naive_utc().trunc_subsecs(0)),
        }
    }
}

/// What a doctor cascade removed from the relational store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeReport {
    pub diagnoses: usize,
    pub medications: usize,
    pub checkups: usize,
    pub mirror_removed: bool,
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, ISO-8601 with or without a
/// trailing `Z`. Blank strings read as absent.
pub fn parse_diagnosis_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_end_matches('Z');
    if raw.is_empty() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => parse_diagnosis_date(value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid diagnosis_date: {value}"))),
    }
}

/// Blank reads as absent; anything else must be a date or a full timestamp.
fn optional_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_diagnosis_date(value).map(|dt| dt.date()))
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_request_reads_frontend_field_names() {
        let req: CreateDiagnosis = serde_json::from_value(json!({
            "_id": "u1",
            "userData": { "name": "Alice", "gender": null, "dob": "1990-04-02", "phone": "" },
            "diagnosis_title": "Flu",
            "description": "",
            "medications": [
                { "medication_name": "Paracetamol", "dosage": "500mg", "duration": "5 days", "notes": "" }
            ],
            "future_checkups": [
                { "checkup_date": "2025-07-01", "purpose": "Follow-up", "notes": "" }
            ]
        }))
        .unwrap();

        assert_eq!(req.patient_doc_id, "u1");
        assert_eq!(req.patient.name, "Alice");
        assert_eq!(req.patient.dob, NaiveDate::from_ymd_opt(1990, 4, 2));
        assert_eq!(req.medications[0].name, "Paracetamol");
        assert!(req.diagnosis_date.is_none());

        let identity = req.patient.to_identity("u1");
        assert_eq!(identity.phone, None);
        let med = req.medications[0].to_medication(3);
        assert_eq!(med.diagnosis_id, 3);
        assert_eq!(med.notes, None);
    }

    #[test]
    fn missing_fields_deserialize_to_blanks_for_validation() {
        let req: CreateDiagnosis = serde_json::from_value(json!({})).unwrap();
        assert!(req.patient_doc_id.is_empty());
        assert!(req.title.is_empty());
        assert!(req.patient.name.is_empty());
    }

    #[test]
    fn diagnosis_date_accepts_common_shapes() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(parse_diagnosis_date("2025-03-09 14:30:00"), Some(expected));
        assert_eq!(parse_diagnosis_date("2025-03-09T14:30:00Z"), Some(expected));
        assert_eq!(
            parse_diagnosis_date("2025-03-09"),
            NaiveDate::from_ymd_opt(2025, 3, 9).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_diagnosis_date("  "), None);
        assert_eq!(parse_diagnosis_date("yesterday"), None);
    }

    #[test]
    fn default_diagnosis_date_is_whole_seconds() {
        let req = CreateDiagnosis {
            title: " Flu ".into(),
            ..Default::default()
        };
        let header = req.to_diagnosis(1, 2);
        assert_eq!(header.title, "Flu");
        assert_eq!(header.diagnosis_date.and_utc().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn patient_dob_must_be_a_date_when_present() {
        let profile = |dob: &str| {
            serde_json::from_value::<PatientProfile>(json!({ "name": "Alice", "dob": dob }))
        };
        assert_eq!(profile("").unwrap().dob, None);
        assert_eq!(
            profile("1990-04-02T00:00:00.000Z").unwrap().dob,
            NaiveDate::from_ymd_opt(1990, 4, 2)
        );
        assert!(profile("02/04/1990").is_err());
        assert!(profile("1990-02-30").is_err());
    }

    #[test]
    fn checkup_without_purpose_is_rejected() {
        let result: Result<CheckupInput, _> =
            serde_json::from_value(json!({ "checkup_date": "2025-07-01" }));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_diagnosis_date_is_rejected() {
        let result: Result<CreateDiagnosis, _> = serde_json::from_value(json!({
            "diagnosis_date": "not a date"
        }));
        assert!(result.is_err());
    }
}
