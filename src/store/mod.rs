//! Relational store access. Diesel is blocking, so callers run these
//! methods on the blocking pool (see [`crate::access::Stores`]).
//!
//! Every method that touches more than one table runs as a single
//! transaction: either all of its statements are visible afterwards or none
//! of them are. Those methods also take a `budget`, the time they may still
//! use; a transaction that would outlive it is rolled back, never committed
//! late.

#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore, build_pool, run_migrations};

use std::time::Duration;

use crate::error::StoreResult;
use crate::models::{
    CascadeReport, CheckupInput, Diagnosis, DoctorIdentity, FutureCheckup, Medication,
    MedicationInput, NewDiagnosis, NewDoctorIdentity, NewPatientIdentity, PatientIdentity,
};

pub type DoctorDiagnosisRow = (Diagnosis, PatientIdentity);
pub type DiagnosisRow = (Diagnosis, PatientIdentity, DoctorIdentity);

pub trait RelationalStore: Send + Sync {
    fn find_patient(&self, ref_doc_id: &str) -> StoreResult<Option<i32>>;

    /// Conflict-ignoring insert. `Ok(None)` means a row with the same
    /// `ref_doc_id` already exists and nothing was written.
    fn insert_patient(&self, new: &NewPatientIdentity) -> StoreResult<Option<i32>>;

    fn find_doctor(&self, ref_doc_id: &str) -> StoreResult<Option<i32>>;

    /// Same contract as [`RelationalStore::insert_patient`].
    fn insert_doctor(&self, new: &NewDoctorIdentity) -> StoreResult<Option<i32>>;

    /// Header plus all children, in one transaction. Returns the header id.
    fn insert_diagnosis(
        &self,
        header: &NewDiagnosis,
        medications: &[MedicationInput],
        checkups: &[CheckupInput],
        budget: Duration,
    ) -> StoreResult<i32>;

    /// Returns `false` if the diagnosis does not exist.
    fn replace_medications(
        &self,
        diagnosis_id: i32,
        medications: &[MedicationInput],
        budget: Duration,
    ) -> StoreResult<bool>;

    /// Returns `false` if the diagnosis does not exist.
    fn delete_diagnosis(&self, diagnosis_id: i32, budget: Duration) -> StoreResult<bool>;

    /// Ordered by diagnosis date descending, then id descending.
    fn diagnoses_for_doctor(&self, doctor_id: i32) -> StoreResult<Vec<DoctorDiagnosisRow>>;

    /// Ordered by diagnosis date descending, then id descending.
    fn all_diagnoses(&self) -> StoreResult<Vec<DiagnosisRow>>;

    /// Membership query; callers never pass an empty id set.
    fn medications_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<Medication>>;

    /// Membership query; callers never pass an empty id set.
    fn checkups_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<FutureCheckup>>;

    /// Children, then diagnoses, then the mirror row, in one transaction.
    /// The mirror row is locked first so no diagnosis can be added to it
    /// while the cascade runs.
    fn delete_doctor_footprint(
        &self,
        doctor_id: i32,
        budget: Duration,
    ) -> StoreResult<CascadeReport>;
}
