use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{DiagnosisRow, DoctorDiagnosisRow, RelationalStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CascadeReport, CheckupInput, Diagnosis, DoctorIdentity, FutureCheckup, Medication,
    MedicationInput, NewDiagnosis, NewDoctorIdentity, NewPatientIdentity, PatientIdentity,
};

#[derive(Debug, Clone, Copy, Default)]
struct Sequences {
    patient: i32,
    doctor: i32,
    diagnosis: i32,
    medication: i32,
    checkup: i32,
}

fn next(seq: &mut i32) -> i32 {
    *seq += 1;
    *seq
}

#[derive(Debug, Clone, Default)]
struct Tables {
    patients: Vec<PatientIdentity>,
    doctors: Vec<DoctorIdentity>,
    diagnoses: Vec<Diagnosis>,
    medications: Vec<Medication>,
    checkups: Vec<FutureCheckup>,
    seq: Sequences,
}

#[derive(Debug, Default)]
struct Faults {
    /// Countdown to the medication row insert that will be rejected.
    fail_medication_insert: Option<usize>,
    /// Lookups that report a miss even when the row exists.
    stale_lookups: usize,
}

/// In-process relational store with the same contract as [`super::PgStore`].
///
/// Writes run against a copy of the tables that replaces the live copy only
/// when every statement succeeded. Built `without_transactions`, statements
/// apply one by one and a child failure leaves the header behind.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    transactional: bool,
    latency: Option<Duration>,
    write_latency: Option<Duration>,
    membership_queries: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(Faults::default()),
            transactional: true,
            latency: None,
            write_latency: None,
            membership_queries: AtomicUsize::new(0),
        }
    }

    pub fn without_transactions() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    /// Every call sleeps this long before touching the tables.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Budgeted writes take this long between their last statement and commit.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Reject the `n`-th medication row inserted from now on (1-based).
    pub fn fail_nth_medication_insert(&self, n: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_medication_insert = Some(n.max(1));
        }
    }

    /// Make the next `n` identity lookups miss, as a reader that lost a race would.
    pub fn stale_next_lookups(&self, n: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.stale_lookups = n;
        }
    }

    /// Number of `IN (...)` queries issued so far.
    pub fn membership_queries(&self) -> usize {
        self.membership_queries.load(Ordering::SeqCst)
    }

    pub fn patients(&self) -> Vec<PatientIdentity> {
        self.snapshot().patients
    }

    pub fn doctors(&self) -> Vec<DoctorIdentity> {
        self.snapshot().doctors
    }

    pub fn diagnoses(&self) -> Vec<Diagnosis> {
        self.snapshot().diagnoses
    }

    pub fn medications(&self) -> Vec<Medication> {
        self.snapshot().medications
    }

    pub fn checkups(&self) -> Vec<FutureCheckup> {
        self.snapshot().checkups
    }

    fn snapshot(&self) -> Tables {
        self.tables.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.pause();
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory tables poisoned".into()))
    }

    fn faults(&self) -> StoreResult<MutexGuard<'_, Faults>> {
        self.faults
            .lock()
            .map_err(|_| StoreError::Unavailable("memory faults poisoned".into()))
    }

    fn stale_lookup(&self) -> StoreResult<bool> {
        let mut faults = self.faults()?;
        if faults.stale_lookups > 0 {
            faults.stale_lookups -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Run `op` as one unit of work. In transactional mode the live tables are
    /// replaced only when `op` succeeds.
    fn write<T>(&self, op: impl FnOnce(&mut Tables, &mut Faults) -> StoreResult<T>) -> StoreResult<T> {
        let mut faults = self.faults()?;
        let mut live = self.tables()?;
        if !self.transactional {
            return op(&mut *live, &mut *faults);
        }
        let mut draft = live.clone();
        let out = op(&mut draft, &mut *faults)?;
        *live = draft;
        Ok(out)
    }

    /// Like [`Self::write`], but the draft is dropped instead of committed
    /// once `budget` has run out.
    fn write_within<T>(
        &self,
        budget: Duration,
        op: impl FnOnce(&mut Tables, &mut Faults) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let started = Instant::now();
        let mut faults = self.faults()?;
        let mut live = self.tables()?;
        if !self.transactional {
            return op(&mut *live, &mut *faults);
        }
        let mut draft = live.clone();
        let out = op(&mut draft, &mut *faults)?;
        if let Some(latency) = self.write_latency {
            std::thread::sleep(latency);
        }
        if started.elapsed() >= budget {
            return Err(StoreError::Unavailable(
                "transaction ran out of time and was rolled back".into(),
            ));
        }
        *live = draft;
        Ok(out)
    }
}

impl Tables {
    fn has_diagnosis(&self, diagnosis_id: i32) -> bool {
        self.diagnoses.iter().any(|d| d.id == diagnosis_id)
    }

    fn insert_medication(
        &mut self,
        faults: &mut Faults,
        diagnosis_id: i32,
        input: &MedicationInput,
    ) -> StoreResult<()> {
        if let Some(remaining) = faults.fail_medication_insert {
            if remaining <= 1 {
                faults.fail_medication_insert = None;
                return Err(StoreError::Rejected(format!(
                    "medication insert for diagnosis {diagnosis_id} rejected"
                )));
            }
            faults.fail_medication_insert = Some(remaining - 1);
        }
        if !self.has_diagnosis(diagnosis_id) {
            return Err(StoreError::Rejected(format!(
                "medication references missing diagnosis {diagnosis_id}"
            )));
        }
        let row = input.to_medication(diagnosis_id);
        let id = next(&mut self.seq.medication);
        self.medications.push(Medication {
            id,
            diagnosis_id: row.diagnosis_id,
            name: row.name,
            dosage: row.dosage,
            duration: row.duration,
            notes: row.notes,
        });
        Ok(())
    }

    fn insert_checkup(&mut self, diagnosis_id: i32, input: &CheckupInput) -> StoreResult<()> {
        if !self.has_diagnosis(diagnosis_id) {
            return Err(StoreError::Rejected(format!(
                "checkup references missing diagnosis {diagnosis_id}"
            )));
        }
        let row = input.to_checkup(diagnosis_id);
        let id = next(&mut self.seq.checkup);
        self.checkups.push(FutureCheckup {
            id,
            diagnosis_id: row.diagnosis_id,
            checkup_date: row.checkup_date,
            purpose: row.purpose,
            notes: row.notes,
        });
        Ok(())
    }

    fn patient(&self, id: i32) -> StoreResult<PatientIdentity> {
        self.patients
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("dangling patient reference {id}")))
    }

    fn doctor(&self, id: i32) -> StoreResult<DoctorIdentity> {
        self.doctors
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("dangling doctor reference {id}")))
    }

    fn sorted_diagnoses(&self) -> Vec<Diagnosis> {
        let mut rows = self.diagnoses.clone();
        rows.sort_by(|a, b| {
            b.diagnosis_date
                .cmp(&a.diagnosis_date)
                .then_with(|| b.id.cmp(&a.id))
        });
        rows
    }
}

impl RelationalStore for MemoryStore {
    fn find_patient(&self, ref_doc_id: &str) -> StoreResult<Option<i32>> {
        if self.stale_lookup()? {
            return Ok(None);
        }
        let tables = self.tables()?;
        Ok(tables
            .patients
            .iter()
            .find(|p| p.ref_doc_id == ref_doc_id)
            .map(|p| p.id))
    }

    fn insert_patient(&self, new: &NewPatientIdentity) -> StoreResult<Option<i32>> {
        self.write(|tables, _| {
            if tables.patients.iter().any(|p| p.ref_doc_id == new.ref_doc_id) {
                return Ok(None);
            }
            let id = next(&mut tables.seq.patient);
            tables.patients.push(PatientIdentity {
                id,
                ref_doc_id: new.ref_doc_id.clone(),
                name: new.name.clone(),
                gender: new.gender.clone(),
                dob: new.dob,
                phone: new.phone.clone(),
            });
            Ok(Some(id))
        })
    }

    fn find_doctor(&self, ref_doc_id: &str) -> StoreResult<Option<i32>> {
        if self.stale_lookup()? {
            return Ok(None);
        }
        let tables = self.tables()?;
        Ok(tables
            .doctors
            .iter()
            .find(|d| d.ref_doc_id == ref_doc_id)
            .map(|d| d.id))
    }

    fn insert_doctor(&self, new: &NewDoctorIdentity) -> StoreResult<Option<i32>> {
        self.write(|tables, _| {
            if tables.doctors.iter().any(|d| d.ref_doc_id == new.ref_doc_id) {
                return Ok(None);
            }
            let id = next(&mut tables.seq.doctor);
            tables.doctors.push(DoctorIdentity {
                id,
                ref_doc_id: new.ref_doc_id.clone(),
                name: new.name.clone(),
                email: new.email.clone(),
            });
            Ok(Some(id))
        })
    }

    fn insert_diagnosis(
        &self,
        header: &NewDiagnosis,
        medications: &[MedicationInput],
        checkups: &[CheckupInput],
        budget: Duration,
    ) -> StoreResult<i32> {
        let transactional = self.transactional;
        self.write_within(budget, |tables, faults| {
            tables.patient(header.patient_id)?;
            tables.doctor(header.doctor_id)?;
            let diagnosis_id = next(&mut tables.seq.diagnosis);
            tables.diagnoses.push(Diagnosis {
                id: diagnosis_id,
                patient_id: header.patient_id,
                doctor_id: header.doctor_id,
                title: header.title.clone(),
                description: header.description.clone(),
                diagnosis_date: header.diagnosis_date,
            });

            let children = medications
                .iter()
                .try_for_each(|m| tables.insert_medication(faults, diagnosis_id, m))
                .and_then(|_| {
                    checkups
                        .iter()
                        .try_for_each(|c| tables.insert_checkup(diagnosis_id, c))
                });

            match children {
                Ok(()) => Ok(diagnosis_id),
                Err(err) if !transactional => Err(StoreError::Partial {
                    diagnosis_id,
                    reason: err.to_string(),
                }),
                Err(err) => Err(err),
            }
        })
    }

    fn replace_medications(
        &self,
        diagnosis_id: i32,
        medications: &[MedicationInput],
        budget: Duration,
    ) -> StoreResult<bool> {
        self.write_within(budget, |tables, faults| {
            if !tables.has_diagnosis(diagnosis_id) {
                return Ok(false);
            }
            tables.medications.retain(|m| m.diagnosis_id != diagnosis_id);
            for input in medications {
                tables.insert_medication(faults, diagnosis_id, input)?;
            }
            Ok(true)
        })
    }

    fn delete_diagnosis(&self, diagnosis_id: i32, budget: Duration) -> StoreResult<bool> {
        self.write_within(budget, |tables, _| {
            if !tables.has_diagnosis(diagnosis_id) {
                return Ok(false);
            }
            tables.medications.retain(|m| m.diagnosis_id != diagnosis_id);
            tables.checkups.retain(|c| c.diagnosis_id != diagnosis_id);
            tables.diagnoses.retain(|d| d.id != diagnosis_id);
            Ok(true)
        })
    }

    fn diagnoses_for_doctor(&self, doctor_id: i32) -> StoreResult<Vec<DoctorDiagnosisRow>> {
        let tables = self.tables()?;
        tables
            .sorted_diagnoses()
            .into_iter()
            .filter(|d| d.doctor_id == doctor_id)
            .map(|d| {
                let patient = tables.patient(d.patient_id)?;
                Ok::<_, StoreError>((d, patient))
            })
            .collect()
    }

    fn all_diagnoses(&self) -> StoreResult<Vec<DiagnosisRow>> {
        let tables = self.tables()?;
        tables
            .sorted_diagnoses()
            .into_iter()
            .map(|d| {
                let patient = tables.patient(d.patient_id)?;
                let doctor = tables.doctor(d.doctor_id)?;
                Ok::<_, StoreError>((d, patient, doctor))
            })
            .collect()
    }

    fn medications_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<Medication>> {
        self.membership_queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables()?;
        Ok(tables
            .medications
            .iter()
            .filter(|m| diagnosis_ids.contains(&m.diagnosis_id))
            .cloned()
            .collect())
    }

    fn checkups_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<FutureCheckup>> {
        self.membership_queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables()?;
        Ok(tables
            .checkups
            .iter()
            .filter(|c| diagnosis_ids.contains(&c.diagnosis_id))
            .cloned()
            .collect())
    }

    fn delete_doctor_footprint(
        &self,
        doctor_id: i32,
        budget: Duration,
    ) -> StoreResult<CascadeReport> {
        self.write_within(budget, |tables, _| {
            let owned: Vec<i32> = tables
                .diagnoses
                .iter()
                .filter(|d| d.doctor_id == doctor_id)
                .map(|d| d.id)
                .collect();

            let mut report = CascadeReport::default();
            let before = tables.medications.len();
            tables.medications.retain(|m| !owned.contains(&m.diagnosis_id));
            report.medications = before - tables.medications.len();

            let before = tables.checkups.len();
            tables.checkups.retain(|c| !owned.contains(&c.diagnosis_id));
            report.checkups = before - tables.checkups.len();

            let before = tables.diagnoses.len();
            tables.diagnoses.retain(|d| d.doctor_id != doctor_id);
            report.diagnoses = before - tables.diagnoses.len();

            let before = tables.doctors.len();
            tables.doctors.retain(|d| d.id != doctor_id);
            report.mirror_removed = tables.doctors.len() < before;
            Ok(report)
        })
    }
}
