use serde::Serialize;
use tracing::info;

use crate::access::Stores;
use crate::error::CoreError;
use crate::identity::IdentityResolver;
use crate::models::{CreateDiagnosis, MedicationInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDiagnosis {
    pub diagnosis_id: i32,
    /// Surrogate key of the patient mirror.
    #[serde(rename = "userId")]
    pub patient_id: i32,
}

/// Writes diagnosis headers together with their medication and checkup rows.
#[derive(Clone)]
pub struct DiagnosisWriter {
    stores: Stores,
}

impl DiagnosisWriter {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn create(
        &self,
        doctor_doc_id: &str,
        request: CreateDiagnosis,
    ) -> Result<CreatedDiagnosis, CoreError> {
        validate(&request)?;

        let stores = self.stores.for_request();
        let identities = IdentityResolver::new(stores.clone());
        let patient_id = identities
            .resolve_patient(request.patient_doc_id.trim(), &request.patient)
            .await?;
        let doctor_id = identities.resolve_doctor(doctor_doc_id).await?;

        let header = request.to_diagnosis(patient_id, doctor_id);
        let medication_count = request.medications.len();
        let checkup_count = request.future_checkups.len();
        let CreateDiagnosis {
            medications,
            future_checkups,
            ..
        } = request;

        let diagnosis_id = stores
            .relational_write(move |store, budget| {
                store.insert_diagnosis(&header, &medications, &future_checkups, budget)
            })
            .await?;

        info!(
            diagnosis_id,
            patient_id,
            doctor_id,
            medications = medication_count,
            checkups = checkup_count,
            "diagnosis created"
        );
        Ok(CreatedDiagnosis {
            diagnosis_id,
            patient_id,
        })
    }

    /// Replace the whole medication set of a diagnosis.
    pub async fn update(
        &self,
        diagnosis_id: i32,
        medications: Vec<MedicationInput>,
    ) -> Result<(), CoreError> {
        let count = medications.len();
        let found = self
            .stores
            .for_request()
            .relational_write(move |store, budget| {
                store.replace_medications(diagnosis_id, &medications, budget)
            })
            .await?;
        if !found {
            return Err(CoreError::not_found("diagnosis", diagnosis_id));
        }
        info!(diagnosis_id, medications = count, "diagnosis medications replaced");
        Ok(())
    }

    pub async fn delete(&self, diagnosis_id: i32) -> Result<(), CoreError> {
        let found = self
            .stores
            .for_request()
            .relational_write(move |store, budget| store.delete_diagnosis(diagnosis_id, budget))
            .await?;
        if !found {
            return Err(CoreError::not_found("diagnosis", diagnosis_id));
        }
        info!(diagnosis_id, "diagnosis deleted");
        Ok(())
    }
}

fn validate(request: &CreateDiagnosis) -> Result<(), CoreError> {
    let mut missing = Vec::new();
    if request.patient_doc_id.trim().is_empty() {
        missing.push("patient id");
    }
    if request.title.trim().is_empty() {
        missing.push("diagnosis title");
    }
    if request.patient.name.trim().is_empty() {
        missing.push("patient name");
    }
    if request
        .future_checkups
        .iter()
        .any(|c| c.purpose.trim().is_empty())
    {
        missing.push("checkup purpose");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;
    use crate::documents::{Collection, MemoryDocumentStore, ProfileDocument};
    use crate::models::{CheckupInput, PatientProfile};
    use crate::store::MemoryStore;

    fn doctors() -> Arc<MemoryDocumentStore> {
        let documents = Arc::new(MemoryDocumentStore::new());
        documents.insert(
            Collection::Doctors,
            ProfileDocument {
                id: "d1".into(),
                name: Some("Dr. Okafor".into()),
                email: Some("okafor@clinic.test".into()),
                ..Default::default()
            },
        );
        documents
    }

    fn writer_over(relational: Arc<MemoryStore>) -> DiagnosisWriter {
        DiagnosisWriter::new(Stores::new(relational, doctors()))
    }

    fn medication(name: &str) -> MedicationInput {
        MedicationInput {
            name: name.into(),
            dosage: "500mg".into(),
            duration: "5 days".into(),
            notes: None,
        }
    }

    fn flu_for_alice() -> CreateDiagnosis {
        CreateDiagnosis {
            patient_doc_id: "u1".into(),
            patient: PatientProfile {
                name: "Alice".into(),
                ..Default::default()
            },
            title: "Flu".into(),
            medications: vec![medication("Paracetamol")],
            future_checkups: vec![CheckupInput {
                checkup_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                purpose: "Follow-up".into(),
                notes: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_mirrors_both_identities_and_writes_children() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());

        let created = writer.create("d1", flu_for_alice()).await.unwrap();

        assert_eq!(relational.patients().len(), 1);
        assert_eq!(relational.patients()[0].ref_doc_id, "u1");
        assert_eq!(relational.doctors().len(), 1);
        assert_eq!(relational.doctors()[0].ref_doc_id, "d1");

        let diagnoses = relational.diagnoses();
        assert_eq!(diagnoses.len(), 1);
        assert_eq!(diagnoses[0].id, created.diagnosis_id);
        assert_eq!(diagnoses[0].patient_id, created.patient_id);
        assert_eq!(relational.medications().len(), 1);
        assert_eq!(relational.checkups().len(), 1);
    }

    #[tokio::test]
    async fn missing_required_fields_fail_before_store_access() {
        let relational = Arc::new(MemoryStore::new());
        let documents = doctors();
        let writer = DiagnosisWriter::new(Stores::new(relational.clone(), documents.clone()));

        let request = CreateDiagnosis {
            patient_doc_id: "u1".into(),
            title: "   ".into(),
            ..Default::default()
        };
        let err = writer.create("d1", request).await.unwrap_err();
        match err {
            CoreError::Validation(msg) => {
                assert!(msg.contains("diagnosis title"));
                assert!(msg.contains("patient name"));
                assert!(!msg.contains("patient id"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(relational.patients().is_empty());
        assert_eq!(documents.find_by_id_calls(), 0);
    }

    #[tokio::test]
    async fn blank_checkup_purpose_is_rejected() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());
        let mut request = flu_for_alice();
        request.future_checkups[0].purpose = " ".into();

        let err = writer.create("d1", request).await.unwrap_err();
        assert!(matches!(&err, CoreError::Validation(msg) if msg.contains("checkup purpose")));
        assert!(relational.diagnoses().is_empty());
    }

    #[tokio::test]
    async fn write_past_the_deadline_is_rolled_back() {
        let relational =
            Arc::new(MemoryStore::new().with_write_latency(Duration::from_millis(200)));
        let writer = DiagnosisWriter::new(
            Stores::new(relational.clone(), doctors()).with_deadline(Duration::from_millis(50)),
        );

        let err = writer.create("d1", flu_for_alice()).await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable { .. }));

        // nothing lands late either
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(relational.diagnoses().is_empty());
        assert!(relational.medications().is_empty());
        assert!(relational.checkups().is_empty());
    }

    #[tokio::test]
    async fn unknown_doctor_propagates_not_found() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());
        let err = writer.create("nobody", flu_for_alice()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "doctor", .. }));
        assert!(relational.diagnoses().is_empty());
    }

    #[tokio::test]
    async fn failed_child_insert_rolls_back_the_whole_diagnosis() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());

        let mut request = flu_for_alice();
        request.medications.push(medication("Ibuprofen"));
        relational.fail_nth_medication_insert(2);

        let err = writer.create("d1", request).await.unwrap_err();
        assert!(matches!(err, CoreError::Store { .. }));
        assert!(relational.diagnoses().is_empty());
        assert!(relational.medications().is_empty());
        assert!(relational.checkups().is_empty());
    }

    #[tokio::test]
    async fn store_without_transactions_reports_partial_failure() {
        let relational = Arc::new(MemoryStore::without_transactions());
        let writer = writer_over(relational.clone());

        let mut request = flu_for_alice();
        request.medications.push(medication("Ibuprofen"));
        relational.fail_nth_medication_insert(2);

        let err = writer.create("d1", request).await.unwrap_err();
        let CoreError::PartialFailure { diagnosis_id, .. } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(relational.diagnoses()[0].id, diagnosis_id);
        assert_eq!(relational.medications().len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_medications_only() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());
        let created = writer.create("d1", flu_for_alice()).await.unwrap();

        writer
            .update(
                created.diagnosis_id,
                vec![medication("Oseltamivir"), medication("Zinc")],
            )
            .await
            .unwrap();

        let names: Vec<String> = relational.medications().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["Oseltamivir", "Zinc"]);
        assert_eq!(relational.checkups().len(), 1);
        assert_eq!(relational.diagnoses()[0].title, "Flu");
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_medications() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());
        let created = writer.create("d1", flu_for_alice()).await.unwrap();

        relational.fail_nth_medication_insert(1);
        let err = writer
            .update(created.diagnosis_id, vec![medication("Oseltamivir")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Store { .. }));
        assert_eq!(relational.medications()[0].name, "Paracetamol");
    }

    #[tokio::test]
    async fn update_and_delete_of_missing_diagnosis_are_not_found() {
        let writer = writer_over(Arc::new(MemoryStore::new()));
        let err = writer.update(99, vec![medication("Zinc")]).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "diagnosis", .. }));
        let err = writer.delete(99).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "diagnosis", .. }));
    }

    #[tokio::test]
    async fn delete_removes_header_and_children() {
        let relational = Arc::new(MemoryStore::new());
        let writer = writer_over(relational.clone());
        let keep = writer.create("d1", flu_for_alice()).await.unwrap();
        let removed = writer.create("d1", flu_for_alice()).await.unwrap();

        writer.delete(removed.diagnosis_id).await.unwrap();

        let diagnoses = relational.diagnoses();
        assert_eq!(diagnoses.len(), 1);
        assert_eq!(diagnoses[0].id, keep.diagnosis_id);
        assert!(relational
            .medications()
            .iter()
            .all(|m| m.diagnosis_id == keep.diagnosis_id));
        assert_eq!(relational.checkups().len(), 1);
        // identities are untouched
        assert_eq!(relational.patients().len(), 1);
    }
}
