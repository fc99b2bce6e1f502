use std::time::{Duration, Instant};

use diesel::PgConnection;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};

use super::{DiagnosisRow, DoctorDiagnosisRow, RelationalStore};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CascadeReport, CheckupInput, Diagnosis, DoctorIdentity, FutureCheckup, Medication,
    MedicationInput, NewDiagnosis, NewDoctorIdentity, NewFutureCheckup, NewMedication,
    NewPatientIdentity, PatientIdentity,
};
use crate::schema::{diagnosis, future_checkup, identity_doctor, identity_patient, medication};

// Database connection pool type
pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

const MIGRATION_UP: &str =
    include_str!("../../migrations/2025-06-01-000000_create_diagnosis_records/up.sql");

pub fn build_pool(config: &Config) -> StoreResult<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    r2d2::Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.request_timeout)
        .build(manager)
        .map_err(StoreError::Pool)
}

/// Apply the schema. The DDL is idempotent, so this is safe on every start.
pub fn run_migrations(pool: &DbPool) -> StoreResult<()> {
    let mut conn = pool.get()?;
    conn.batch_execute(MIGRATION_UP)?;
    tracing::info!("relational schema is up to date");
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> StoreResult<PooledConn> {
        Ok(self.pool.get()?)
    }

    fn conn_within(&self, deadline: &TxDeadline) -> StoreResult<PooledConn> {
        Ok(self.pool.get_timeout(deadline.remaining()?)?)
    }
}

type PooledConn = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// End of the time a transaction may use.
struct TxDeadline(Instant);

impl TxDeadline {
    fn start(budget: Duration) -> Self {
        TxDeadline(Instant::now() + budget)
    }

    fn remaining(&self) -> StoreResult<Duration> {
        let left = self.0.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(StoreError::Unavailable(
                "transaction ran out of time and was rolled back".into(),
            ));
        }
        Ok(left)
    }

    /// Bound the next statement by what is left, so Postgres cancels it
    /// instead of letting the transaction run on.
    fn arm(&self, conn: &mut PgConnection) -> StoreResult<()> {
        let ms = self.remaining()?.as_millis().max(1);
        conn.batch_execute(&format!("SET LOCAL statement_timeout = {ms}"))?;
        Ok(())
    }
}

fn insert_children(
    conn: &mut PgConnection,
    deadline: &TxDeadline,
    diagnosis_id: i32,
    medications: &[MedicationInput],
    checkups: &[CheckupInput],
) -> StoreResult<()> {
    if !medications.is_empty() {
        let rows: Vec<NewMedication> = medications
            .iter()
            .map(|m| m.to_medication(diagnosis_id))
            .collect();
        deadline.arm(conn)?;
        diesel::insert_into(medication::table)
            .values(&rows)
            .execute(conn)?;
    }
    if !checkups.is_empty() {
        let rows: Vec<NewFutureCheckup> = checkups
            .iter()
            .map(|c| c.to_checkup(diagnosis_id))
            .collect();
        deadline.arm(conn)?;
        diesel::insert_into(future_checkup::table)
            .values(&rows)
            .execute(conn)?;
    }
    Ok(())
}

fn diagnosis_exists(
    conn: &mut PgConnection,
    deadline: &TxDeadline,
    diagnosis_id: i32,
) -> StoreResult<bool> {
    deadline.arm(conn)?;
    let found = diagnosis::table
        .find(diagnosis_id)
        .select(diagnosis::id)
        .first::<i32>(conn)
        .optional()?;
    Ok(found.is_some())
}

impl RelationalStore for PgStore {
    fn find_patient(&self, ref_doc_id: &str) -> StoreResult<Option<i32>> {
        let mut conn = self.conn()?;
        Ok(identity_patient::table
            .filter(identity_patient::ref_doc_id.eq(ref_doc_id))
            .select(identity_patient::id)
            .first::<i32>(&mut conn)
            .optional()?)
    }

    fn insert_patient(&self, new: &NewPatientIdentity) -> StoreResult<Option<i32>> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(identity_patient::table)
            .values(new)
            .on_conflict(identity_patient::ref_doc_id)
            .do_nothing()
            .returning(identity_patient::id)
            .get_result::<i32>(&mut conn)
            .optional()?)
    }

    fn find_doctor(&self, ref_doc_id: &str) -> StoreResult<Option<i32>> {
        let mut conn = self.conn()?;
        Ok(identity_doctor::table
            .filter(identity_doctor::ref_doc_id.eq(ref_doc_id))
            .select(identity_doctor::id)
            .first::<i32>(&mut conn)
            .optional()?)
    }

    fn insert_doctor(&self, new: &NewDoctorIdentity) -> StoreResult<Option<i32>> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(identity_doctor::table)
            .values(new)
            .on_conflict(identity_doctor::ref_doc_id)
            .do_nothing()
            .returning(identity_doctor::id)
            .get_result::<i32>(&mut conn)
            .optional()?)
    }

    fn insert_diagnosis(
        &self,
        header: &NewDiagnosis,
        medications: &[MedicationInput],
        checkups: &[CheckupInput],
        budget: Duration,
    ) -> StoreResult<i32> {
        let deadline = TxDeadline::start(budget);
        let mut conn = self.conn_within(&deadline)?;
        conn.transaction::<i32, StoreError, _>(|conn| {
            deadline.arm(conn)?;
            let diagnosis_id = diesel::insert_into(diagnosis::table)
                .values(header)
                .returning(diagnosis::id)
                .get_result::<i32>(conn)?;
            insert_children(conn, &deadline, diagnosis_id, medications, checkups)?;
            deadline.remaining()?;
            Ok(diagnosis_id)
        })
    }

    fn replace_medications(
        &self,
        diagnosis_id: i32,
        medications: &[MedicationInput],
        budget: Duration,
    ) -> StoreResult<bool> {
        let deadline = TxDeadline::start(budget);
        let mut conn = self.conn_within(&deadline)?;
        conn.transaction::<bool, StoreError, _>(|conn| {
            if !diagnosis_exists(conn, &deadline, diagnosis_id)? {
                return Ok(false);
            }
            deadline.arm(conn)?;
            diesel::delete(medication::table.filter(medication::diagnosis_id.eq(diagnosis_id)))
                .execute(conn)?;
            insert_children(conn, &deadline, diagnosis_id, medications, &[])?;
            deadline.remaining()?;
            Ok(true)
        })
    }

    fn delete_diagnosis(&self, diagnosis_id: i32, budget: Duration) -> StoreResult<bool> {
        let deadline = TxDeadline::start(budget);
        let mut conn = self.conn_within(&deadline)?;
        conn.transaction::<bool, StoreError, _>(|conn| {
            if !diagnosis_exists(conn, &deadline, diagnosis_id)? {
                return Ok(false);
            }
            deadline.arm(conn)?;
            diesel::delete(medication::table.filter(medication::diagnosis_id.eq(diagnosis_id)))
                .execute(conn)?;
            deadline.arm(conn)?;
            diesel::delete(
                future_checkup::table.filter(future_checkup::diagnosis_id.eq(diagnosis_id)),
            )
            .execute(conn)?;
            deadline.arm(conn)?;
            diesel::delete(diagnosis::table.find(diagnosis_id)).execute(conn)?;
            deadline.remaining()?;
            Ok(true)
        })
    }

    fn diagnoses_for_doctor(&self, doctor_id: i32) -> StoreResult<Vec<DoctorDiagnosisRow>> {
        let mut conn = self.conn()?;
        Ok(diagnosis::table
            .inner_join(identity_patient::table)
            .filter(diagnosis::doctor_id.eq(doctor_id))
            .order((diagnosis::diagnosis_date.desc(), diagnosis::id.desc()))
            .select((Diagnosis::as_select(), PatientIdentity::as_select()))
            .load::<DoctorDiagnosisRow>(&mut conn)?)
    }

    fn all_diagnoses(&self) -> StoreResult<Vec<DiagnosisRow>> {
        let mut conn = self.conn()?;
        Ok(diagnosis::table
            .inner_join(identity_patient::table)
            .inner_join(identity_doctor::table)
            .order((diagnosis::diagnosis_date.desc(), diagnosis::id.desc()))
            .select((
                Diagnosis::as_select(),
                PatientIdentity::as_select(),
                DoctorIdentity::as_select(),
            ))
            .load::<DiagnosisRow>(&mut conn)?)
    }

    fn medications_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<Medication>> {
        let mut conn = self.conn()?;
        Ok(medication::table
            .filter(medication::diagnosis_id.eq_any(diagnosis_ids))
            .order(medication::id.asc())
            .select(Medication::as_select())
            .load(&mut conn)?)
    }

    fn checkups_for(&self, diagnosis_ids: &[i32]) -> StoreResult<Vec<FutureCheckup>> {
        let mut conn = self.conn()?;
        Ok(future_checkup::table
            .filter(future_checkup::diagnosis_id.eq_any(diagnosis_ids))
            .order(future_checkup::id.asc())
            .select(FutureCheckup::as_select())
            .load(&mut conn)?)
    }

    fn delete_doctor_footprint(
        &self,
        doctor_id: i32,
        budget: Duration,
    ) -> StoreResult<CascadeReport> {
        let deadline = TxDeadline::start(budget);
        let mut conn = self.conn_within(&deadline)?;
        conn.transaction::<CascadeReport, StoreError, _>(|conn| {
            // Inserts referencing the mirror wait on this lock, so the id set
            // read below cannot grow before the deletes run.
            deadline.arm(conn)?;
            let locked = identity_doctor::table
                .find(doctor_id)
                .select(identity_doctor::id)
                .for_update()
                .first::<i32>(conn)
                .optional()?;
            if locked.is_none() {
                return Ok(CascadeReport::default());
            }

            deadline.arm(conn)?;
            let diagnosis_ids: Vec<i32> = diagnosis::table
                .filter(diagnosis::doctor_id.eq(doctor_id))
                .select(diagnosis::id)
                .load(conn)?;

            let mut report = CascadeReport::default();
            if !diagnosis_ids.is_empty() {
                deadline.arm(conn)?;
                report.medications = diesel::delete(
                    medication::table.filter(medication::diagnosis_id.eq_any(&diagnosis_ids)),
                )
                .execute(conn)?;
                deadline.arm(conn)?;
                report.checkups = diesel::delete(
                    future_checkup::table
                        .filter(future_checkup::diagnosis_id.eq_any(&diagnosis_ids)),
                )
                .execute(conn)?;
                deadline.arm(conn)?;
                report.diagnoses =
                    diesel::delete(diagnosis::table.filter(diagnosis::id.eq_any(&diagnosis_ids)))
                        .execute(conn)?;
            }
            deadline.arm(conn)?;
            report.mirror_removed =
                diesel::delete(identity_doctor::table.find(doctor_id)).execute(conn)? > 0;
            deadline.remaining()?;
            Ok(report)
        })
    }
}
