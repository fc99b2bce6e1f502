use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{FromRequest, HttpRequest, HttpResponse, ResponseError, web};
use futures::future::{Ready, ready};
use serde::Deserialize;
use serde_json::json;

use crate::access::Stores;
use crate::aggregator::DiagnosisAggregator;
use crate::cascade::CascadeDeleter;
use crate::error::CoreError;
use crate::models::{CreateDiagnosis, MedicationInput};
use crate::writer::DiagnosisWriter;

pub const DOCTOR_HEADER: &str = "x-doctor-id";

/// Everything the routes need, shared through `web::Data`.
pub struct Services {
    pub writer: DiagnosisWriter,
    pub aggregator: DiagnosisAggregator,
    pub cascade: CascadeDeleter,
}

impl Services {
    pub fn new(stores: Stores) -> Self {
        Self {
            writer: DiagnosisWriter::new(stores.clone()),
            aggregator: DiagnosisAggregator::new(stores.clone()),
            cascade: CascadeDeleter::new(stores),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Not Authorized")]
pub struct NotAuthorized;

impl ResponseError for NotAuthorized {
    fn status_code(&self) -> StatusCode {
        StatusCode::FORBIDDEN
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::Forbidden().json(json!({ "success": false, "message": self.to_string() }))
    }
}

/// Document-store id of the doctor making the request, taken from the
/// header set by the authentication layer in front of this service.
#[derive(Debug, Clone)]
pub struct ActingDoctor(pub String);

impl FromRequest for ActingDoctor {
    type Error = NotAuthorized;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let doctor = req
            .headers()
            .get(DOCTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| ActingDoctor(value.to_string()));
        ready(doctor.ok_or(NotAuthorized))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateDiagnosis {
    #[serde(default)]
    pub medications: Vec<MedicationInput>,
}

pub async fn create_diagnosis(
    services: web::Data<Services>,
    doctor: ActingDoctor,
    body: web::Json<CreateDiagnosis>,
) -> Result<HttpResponse, CoreError> {
    let created = services.writer.create(&doctor.0, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "message": "Diagnosis created successfully",
        "diagnosisId": created.diagnosis_id,
        "userId": created.patient_id,
    })))
}

pub async fn get_diagnoses(
    services: web::Data<Services>,
    doctor: ActingDoctor,
) -> Result<HttpResponse, CoreError> {
    let diagnoses = services.aggregator.list_for_doctor(&doctor.0).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "diagnoses": diagnoses })))
}

pub async fn update_diagnosis(
    services: web::Data<Services>,
    _doctor: ActingDoctor,
    diagnosis_id: web::Path<i32>,
    body: web::Json<UpdateDiagnosis>,
) -> Result<HttpResponse, CoreError> {
    let diagnosis_id = diagnosis_id.into_inner();
    services
        .writer
        .update(diagnosis_id, body.into_inner().medications)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Diagnosis updated successfully",
        "diagnosisId": diagnosis_id,
    })))
}

pub async fn delete_diagnosis(
    services: web::Data<Services>,
    _doctor: ActingDoctor,
    diagnosis_id: web::Path<i32>,
) -> Result<HttpResponse, CoreError> {
    services.writer.delete(diagnosis_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Diagnosis deleted successfully",
    })))
}

pub async fn all_diagnoses(services: web::Data<Services>) -> Result<HttpResponse, CoreError> {
    let diagnoses = services.aggregator.list_all().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "count": diagnoses.len(),
        "diagnoses": diagnoses,
    })))
}

pub async fn delete_doctor(
    services: web::Data<Services>,
    doctor_id: web::Path<String>,
) -> Result<HttpResponse, CoreError> {
    let report = services.cascade.delete_doctor(&doctor_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Doctor successfully deleted from both databases",
        "removed": report,
    })))
}

pub async fn hello() -> HttpResponse {
    HttpResponse::Ok().body("Hello, MediLink!")
}

/// Malformed bodies and path segments answer with the same envelope as
/// validation failures raised by the core.
fn rejected(err: impl std::fmt::Display) -> actix_web::Error {
    CoreError::Validation(err.to_string()).into()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| rejected(err)))
        .app_data(web::PathConfig::default().error_handler(|err, _| rejected(err)));
    cfg.service(
        web::scope("/api/diagnosis")
            .route("/add", web::post().to(create_diagnosis))
            .route("/get-diagnosis", web::get().to(get_diagnoses))
            .route("/update-diagnosis/{id}", web::put().to(update_diagnosis))
            .route("/delete-diagnosis/{id}", web::delete().to(delete_diagnosis)),
    )
    .service(
        web::scope("/api/admin")
            .route("/get-diagnosis", web::get().to(all_diagnoses))
            .route("/delete-doctor/{doctor_id}", web::delete().to(delete_doctor)),
    )
    .route("/", web::get().to(hello));
}
