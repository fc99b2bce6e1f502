use tracing::{info, warn};

use crate::access::Stores;
use crate::documents::Collection;
use crate::error::CoreError;
use crate::identity::IdentityResolver;
use crate::models::CascadeReport;

/// Removes a doctor from the document store and every relational row that
/// hangs off their mirror.
///
/// Patient mirrors are left alone even when the deleted doctor was the only
/// one who ever wrote about them.
#[derive(Clone)]
pub struct CascadeDeleter {
    stores: Stores,
}

impl CascadeDeleter {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn delete_doctor(&self, doctor_doc_id: &str) -> Result<CascadeReport, CoreError> {
        let stores = self.stores.for_request();
        let removed = stores
            .document(stores.documents().delete_by_id(Collection::Doctors, doctor_doc_id))
            .await?;
        if !removed {
            return Err(CoreError::not_found("doctor", doctor_doc_id));
        }

        let identities = IdentityResolver::new(stores.clone());
        let Some(doctor_id) = identities.lookup_doctor(doctor_doc_id).await? else {
            info!(doctor_doc_id, "doctor deleted, no relational footprint");
            return Ok(CascadeReport::default());
        };

        let report = stores
            .relational_write(move |store, budget| {
                store.delete_doctor_footprint(doctor_id, budget)
            })
            .await
            .inspect_err(|e| {
                warn!(
                    doctor_doc_id,
                    doctor_id,
                    error = %e,
                    "doctor profile deleted but relational cleanup failed"
                );
            })?;

        info!(
            doctor_doc_id,
            doctor_id,
            diagnoses = report.diagnoses,
            medications = report.medications,
            checkups = report.checkups,
            "doctor deleted with relational footprint"
        );
        Ok(report)
    }
}
