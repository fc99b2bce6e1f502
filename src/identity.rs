//! Get-or-create mirroring of document-store identities into relational
//! surrogate rows.
//!
//! Creation is a conflict-ignoring insert on the unique `ref_doc_id` column.
//! A writer that loses the race re-reads the winner's row once instead of
//! failing; mirrored profile fields are never refreshed after creation.

use tracing::{debug, warn};

use crate::access::Stores;
use crate::documents::Collection;
use crate::error::CoreError;
use crate::models::{NewDoctorIdentity, PatientProfile};

#[derive(Clone)]
pub struct IdentityResolver {
    stores: Stores,
}

/// Outcome of a conflict-ignoring insert.
enum Inserted {
    Created(i32),
    LostRace,
}

impl IdentityResolver {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn resolve_patient(
        &self,
        doc_id: &str,
        profile: &PatientProfile,
    ) -> Result<i32, CoreError> {
        if let Some(id) = self.lookup_patient(doc_id).await? {
            debug!(doc_id, id, "patient mirror hit");
            return Ok(id);
        }

        let new = profile.to_identity(doc_id);
        let inserted = self
            .stores
            .relational(move |store| store.insert_patient(&new))
            .await;
        match classify(inserted)? {
            Inserted::Created(id) => {
                debug!(doc_id, id, "patient mirror created");
                Ok(id)
            }
            Inserted::LostRace => {
                warn!(doc_id, "patient mirror created concurrently, re-reading");
                self.lookup_patient(doc_id)
                    .await?
                    .ok_or_else(|| lost_twice("patient", doc_id))
            }
        }
    }

    pub async fn resolve_doctor(&self, doc_id: &str) -> Result<i32, CoreError> {
        if let Some(id) = self.lookup_doctor(doc_id).await? {
            debug!(doc_id, id, "doctor mirror hit");
            return Ok(id);
        }

        let profile = self
            .stores
            .document(self.stores.documents().find_by_id(Collection::Doctors, doc_id))
            .await?
            .ok_or_else(|| CoreError::not_found("doctor", doc_id))?;

        let new = NewDoctorIdentity {
            ref_doc_id: doc_id.to_string(),
            // profiles without a name mirror as blank
            name: profile.name.unwrap_or_default(),
            email: profile.email,
        };
        let inserted = self
            .stores
            .relational(move |store| store.insert_doctor(&new))
            .await;
        match classify(inserted)? {
            Inserted::Created(id) => {
                debug!(doc_id, id, "doctor mirror created");
                Ok(id)
            }
            Inserted::LostRace => {
                warn!(doc_id, "doctor mirror created concurrently, re-reading");
                self.lookup_doctor(doc_id)
                    .await?
                    .ok_or_else(|| lost_twice("doctor", doc_id))
            }
        }
    }

    /// Lookup only; never creates a mirror.
    pub async fn lookup_doctor(&self, doc_id: &str) -> Result<Option<i32>, CoreError> {
        let key = doc_id.to_string();
        self.stores
            .relational(move |store| store.find_doctor(&key))
            .await
    }

    async fn lookup_patient(&self, doc_id: &str) -> Result<Option<i32>, CoreError> {
        let key = doc_id.to_string();
        self.stores
            .relational(move |store| store.find_patient(&key))
            .await
    }
}

// A uniqueness violation and an empty conflict-ignoring insert both mean
// another writer got there first.
fn classify(result: Result<Option<i32>, CoreError>) -> Result<Inserted, CoreError> {
    match result {
        Ok(Some(id)) => Ok(Inserted::Created(id)),
        Ok(None) | Err(CoreError::Conflict(_)) => Ok(Inserted::LostRace),
        Err(other) => Err(other),
    }
}

fn lost_twice(entity: &str, doc_id: &str) -> CoreError {
    CoreError::Conflict(format!(
        "{entity} mirror for {doc_id} conflicted but could not be re-read"
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::documents::{MemoryDocumentStore, ProfileDocument};
    use crate::store::MemoryStore;

    fn setup() -> (IdentityResolver, Arc<MemoryStore>, Arc<MemoryDocumentStore>) {
        let relational = Arc::new(MemoryStore::new());
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
        let stores = Stores::new(relational.clone(), documents.clone());
        (IdentityResolver::new(stores), relational, documents)
    }

    fn alice() -> PatientProfile {
        PatientProfile {
            name: "Alice".into(),
            gender: Some("female".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn patient_resolution_is_idempotent() {
        let (resolver, relational, _) = setup();
        let first = resolver.resolve_patient("u1", &alice()).await.unwrap();
        let second = resolver.resolve_patient("u1", &alice()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(relational.patients().len(), 1);
        assert_eq!(relational.patients()[0].gender.as_deref(), Some("female"));
    }

    #[tokio::test]
    async fn existing_patient_profile_is_not_refreshed() {
        let (resolver, relational, _) = setup();
        let id = resolver.resolve_patient("u1", &alice()).await.unwrap();
        let renamed = PatientProfile {
            name: "Alice Renamed".into(),
            phone: Some("555-0100".into()),
            ..Default::default()
        };
        assert_eq!(resolver.resolve_patient("u1", &renamed).await.unwrap(), id);
        let patients = relational.patients();
        let row = &patients[0];
        assert_eq!(row.name, "Alice");
        assert_eq!(row.phone, None);
    }

    #[tokio::test]
    async fn doctor_mirror_copies_name_and_email_from_document_store() {
        let (resolver, relational, documents) = setup();
        let id = resolver.resolve_doctor("d1").await.unwrap();
        assert_eq!(resolver.resolve_doctor("d1").await.unwrap(), id);

        let doctors = relational.doctors();
        assert_eq!(doctors.len(), 1);
        assert_eq!(doctors[0].name, "Dr. Okafor");
        assert_eq!(doctors[0].email.as_deref(), Some("okafor@clinic.test"));
        // second call is served by the mirror
        assert_eq!(documents.find_by_id_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_doctor_is_not_found_and_not_mirrored() {
        let (resolver, relational, _) = setup();
        let err = resolver.resolve_doctor("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "doctor", .. }));
        assert!(relational.doctors().is_empty());
    }

    #[tokio::test]
    async fn lookup_doctor_never_creates() {
        let (resolver, relational, _) = setup();
        assert_eq!(resolver.lookup_doctor("d1").await.unwrap(), None);
        assert!(relational.doctors().is_empty());
    }

    #[tokio::test]
    async fn losing_writer_rereads_the_winner() {
        let (resolver, relational, _) = setup();
        let winner = resolver.resolve_patient("u1", &alice()).await.unwrap();

        // the next lookup misses as if the row were committed just after it
        relational.stale_next_lookups(1);
        let loser = resolver.resolve_patient("u1", &alice()).await.unwrap();

        assert_eq!(winner, loser);
        assert_eq!(relational.patients().len(), 1);
    }

    #[tokio::test]
    async fn doctor_losing_writer_rereads_the_winner() {
        let (resolver, relational, _) = setup();
        let winner = resolver.resolve_doctor("d1").await.unwrap();
        relational.stale_next_lookups(1);
        assert_eq!(resolver.resolve_doctor("d1").await.unwrap(), winner);
        assert_eq!(relational.doctors().len(), 1);
    }

    #[tokio::test]
    async fn conflict_surfaces_when_reread_also_misses() {
        let (resolver, relational, _) = setup();
        resolver.resolve_patient("u1", &alice()).await.unwrap();
        relational.stale_next_lookups(2);
        let err = resolver.resolve_patient("u1", &alice()).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_creates_one_row() {
        let (resolver, relational, _) = setup();
        let profile = alice();
        let calls = (0..8).map(|_| resolver.resolve_patient("u1", &profile));
        let ids = futures::future::try_join_all(calls).await.unwrap();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(relational.patients().len(), 1);

        let doctor_ids =
            futures::future::try_join_all((0..8).map(|_| resolver.resolve_doctor("d1")))
                .await
                .unwrap();
        assert!(doctor_ids.iter().all(|id| *id == doctor_ids[0]));
        assert_eq!(relational.doctors().len(), 1);
    }
}
