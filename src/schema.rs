// Kept in step with migrations/2025-06-01-000000_create_diagnosis_records/up.sql.

diesel::table! {
    diagnosis (id) {
        id -> Int4,
        patient_id -> Int4,
        doctor_id -> Int4,
        title -> Text,
        description -> Nullable<Text>,
        diagnosis_date -> Timestamp,
    }
}

diesel::table! {
    future_checkup (id) {
        id -> Int4,
        diagnosis_id -> Int4,
        checkup_date -> Date,
        purpose -> Text,
        notes -> Nullable<Text>,
    }
}

diesel::table! {
    identity_doctor (id) {
        id -> Int4,
        ref_doc_id -> Text,
        name -> Text,
        email -> Nullable<Text>,
    }
}

diesel::table! {
    identity_patient (id) {
        id -> Int4,
        ref_doc_id -> Text,
        name -> Text,
        gender -> Nullable<Text>,
        dob -> Nullable<Date>,
        phone -> Nullable<Text>,
    }
}

diesel::table! {
    medication (id) {
        id -> Int4,
        diagnosis_id -> Int4,
        name -> Text,
        dosage -> Text,
        duration -> Text,
        notes -> Nullable<Text>,
    }
}

diesel::joinable!(diagnosis -> identity_doctor (doctor_id));
diesel::joinable!(diagnosis -> identity_patient (patient_id));
diesel::joinable!(future_checkup -> diagnosis (diagnosis_id));
diesel::joinable!(medication -> diagnosis (diagnosis_id));

diesel::allow_tables_to_appear_in_same_query!(
    diagnosis,
    future_checkup,
    identity_doctor,
    identity_patient,
    medication,
);
