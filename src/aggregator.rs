//! Enriched diagnosis reads.
//!
//! The relational store answers the primary query. Medications, checkups and
//! profile fields from the document store are then fetched concurrently, one
//! batched request per source, and joined by key. A failure of any branch
//! fails the whole read; nothing is silently left out.

use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveDateTime};
use futures::try_join;
use serde::Serialize;
use tracing::{debug, warn};

use crate::access::Stores;
use crate::documents::{Collection, ProfileDocument, ProfileField};
use crate::error::CoreError;
use crate::identity::IdentityResolver;
use crate::models::{DoctorIdentity, FutureCheckup, Medication, PatientIdentity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MedicationView {
    pub name: String,
    pub dosage: String,
    pub duration: String,
    pub notes: Option<String>,
}

impl From<Medication> for MedicationView {
    fn from(row: Medication) -> Self {
        Self {
            name: row.name,
            dosage: row.dosage,
            duration: row.duration,
            notes: row.notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckupView {
    pub date: NaiveDate,
    pub purpose: String,
    pub notes: Option<String>,
}

impl From<FutureCheckup> for CheckupView {
    fn from(row: FutureCheckup) -> Self {
        Self {
            date: row.checkup_date,
            purpose: row.purpose,
            notes: row.notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientView {
    pub id: i32,
    pub doc_id: String,
    pub name: String,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
    pub phone: Option<String>,
    pub image: Option<String>,
}

impl PatientView {
    fn new(row: PatientIdentity, image: Option<String>) -> Self {
        Self {
            id: row.id,
            doc_id: row.ref_doc_id,
            name: row.name,
            gender: row.gender,
            dob: row.dob,
            phone: row.phone,
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorView {
    pub id: i32,
    pub doc_id: String,
    pub name: String,
    pub email: Option<String>,
    pub image: Option<String>,
    pub specialty: Option<String>,
}

impl DoctorView {
    fn new(row: DoctorIdentity, doc: Option<&ProfileDocument>) -> Self {
        Self {
            id: row.id,
            doc_id: row.ref_doc_id,
            name: row.name,
            email: row.email,
            image: doc.and_then(|d| d.image.clone()),
            specialty: doc.and_then(|d| d.specialty.clone()),
        }
    }
}

/// One diagnosis as seen by the doctor who wrote it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorDiagnosis {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDateTime,
    pub patient: PatientView,
    pub medications: Vec<MedicationView>,
    pub future_checkups: Vec<CheckupView>,
}

/// One diagnosis in the admin-wide listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedDiagnosis {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDateTime,
    pub patient: PatientView,
    pub doctor: DoctorView,
    pub medications: Vec<MedicationView>,
    pub future_checkups: Vec<CheckupView>,
}

/// Children of a batch of diagnoses, grouped by diagnosis id.
#[derive(Default)]
struct Children {
    medications: HashMap<i32, Vec<MedicationView>>,
    checkups: HashMap<i32, Vec<CheckupView>>,
}

impl Children {
    fn group(medications: Vec<Medication>, checkups: Vec<FutureCheckup>) -> Self {
        let mut children = Children::default();
        for row in medications {
            children
                .medications
                .entry(row.diagnosis_id)
                .or_default()
                .push(row.into());
        }
        for row in checkups {
            children
                .checkups
                .entry(row.diagnosis_id)
                .or_default()
                .push(row.into());
        }
        children
    }

    fn take(&mut self, diagnosis_id: i32) -> (Vec<MedicationView>, Vec<CheckupView>) {
        (
            self.medications.remove(&diagnosis_id).unwrap_or_default(),
            self.checkups.remove(&diagnosis_id).unwrap_or_default(),
        )
    }
}

fn distinct<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    ids.collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn by_id(docs: Vec<ProfileDocument>) -> HashMap<String, ProfileDocument> {
    docs.into_iter().map(|doc| (doc.id.clone(), doc)).collect()
}

#[derive(Clone)]
pub struct DiagnosisAggregator {
    stores: Stores,
}

impl DiagnosisAggregator {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Diagnoses written by one doctor, newest first.
    pub async fn list_for_doctor(
        &self,
        doctor_doc_id: &str,
    ) -> Result<Vec<DoctorDiagnosis>, CoreError> {
        let stores = self.stores.for_request();
        let doctor_id = IdentityResolver::new(stores.clone())
            .lookup_doctor(doctor_doc_id)
            .await?
            .ok_or_else(|| CoreError::not_found("doctor", doctor_doc_id))?;

        let rows = stores
            .relational(move |store| store.diagnoses_for_doctor(doctor_id))
            .await?;
        if rows.is_empty() {
            debug!(doctor_doc_id, "doctor has no diagnoses");
            return Ok(Vec::new());
        }

        let diagnosis_ids: Vec<i32> = rows.iter().map(|(d, _)| d.id).collect();
        let patient_doc_ids = distinct(rows.iter().map(|(_, p)| p.ref_doc_id.as_str()));

        let (mut children, patient_docs) = try_join!(
            children(&stores, diagnosis_ids),
            profiles(&stores, Collection::Users, patient_doc_ids, &[ProfileField::Image]),
        )?;

        Ok(rows
            .into_iter()
            .map(|(diagnosis, patient)| {
                let image = patient_docs
                    .get(&patient.ref_doc_id)
                    .and_then(|doc| doc.image.clone());
                let (medications, future_checkups) = children.take(diagnosis.id);
                DoctorDiagnosis {
                    id: diagnosis.id,
                    title: diagnosis.title,
                    description: diagnosis.description,
                    date: diagnosis.diagnosis_date,
                    patient: PatientView::new(patient, image),
                    medications,
                    future_checkups,
                }
            })
            .collect())
    }

    /// Every diagnosis across all doctors, newest first.
    pub async fn list_all(&self) -> Result<Vec<EnrichedDiagnosis>, CoreError> {
        let stores = self.stores.for_request();
        let rows = stores.relational(|store| store.all_diagnoses()).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let diagnosis_ids: Vec<i32> = rows.iter().map(|(d, _, _)| d.id).collect();
        let patient_doc_ids = distinct(rows.iter().map(|(_, p, _)| p.ref_doc_id.as_str()));
        let doctor_doc_ids = distinct(rows.iter().map(|(_, _, d)| d.ref_doc_id.as_str()));

        let (mut children, patient_docs, doctor_docs) = try_join!(
            children(&stores, diagnosis_ids),
            profiles(&stores, Collection::Users, patient_doc_ids, &[ProfileField::Image]),
            profiles(
                &stores,
                Collection::Doctors,
                doctor_doc_ids,
                &[ProfileField::Image, ProfileField::Specialty],
            ),
        )?;

        Ok(rows
            .into_iter()
            .map(|(diagnosis, patient, doctor)| {
                let patient_image = patient_docs
                    .get(&patient.ref_doc_id)
                    .and_then(|doc| doc.image.clone());
                let doctor_doc = doctor_docs.get(&doctor.ref_doc_id);
                let (medications, future_checkups) = children.take(diagnosis.id);
                EnrichedDiagnosis {
                    id: diagnosis.id,
                    title: diagnosis.title,
                    description: diagnosis.description,
                    date: diagnosis.diagnosis_date,
                    patient: PatientView::new(patient, patient_image),
                    doctor: DoctorView::new(doctor, doctor_doc),
                    medications,
                    future_checkups,
                }
            })
            .collect())
    }
}

/// Medications and checkups for a non-empty id set, fetched concurrently.
async fn children(stores: &Stores, diagnosis_ids: Vec<i32>) -> Result<Children, CoreError> {
    let checkup_ids = diagnosis_ids.clone();
    let (medications, checkups) = try_join!(
        stores.relational(move |store| store.medications_for(&diagnosis_ids)),
        stores.relational(move |store| store.checkups_for(&checkup_ids)),
    )?;
    Ok(Children::group(medications, checkups))
}

async fn profiles(
    stores: &Stores,
    collection: Collection,
    ids: Vec<String>,
    projection: &[ProfileField],
) -> Result<HashMap<String, ProfileDocument>, CoreError> {
    let docs = stores
        .document(stores.documents().find_by_ids(collection, &ids, projection))
        .await?;
    if docs.len() < ids.len() {
        warn!(
            collection = collection.as_str(),
            requested = ids.len(),
            found = docs.len(),
            "some profiles are missing from the document store"
        );
    }
    Ok(by_id(docs))
}
