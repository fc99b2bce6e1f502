//! Document-store access: the authoritative home of patient and doctor
//! profiles. The core only reads profiles, except for the doctor delete that
//! starts a cascade.

mod http;
#[cfg(any(test, feature = "testing"))]
mod memory;

pub use http::HttpDocumentStore;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryDocumentStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Patient identities.
    Users,
    Doctors,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Doctors => "doctors",
        }
    }
}

/// Profile fields that can be requested in a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileField {
    Name,
    Email,
    Image,
    Specialty,
}

impl ProfileField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileField::Name => "name",
            ProfileField::Email => "email",
            ProfileField::Image => "image",
            ProfileField::Specialty => "specialty",
        }
    }
}

/// A profile as stored in the document store. Fields outside a requested
/// projection come back as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
}

impl ProfileDocument {
    /// Keep only `_id` and the projected fields.
    pub fn project(self, projection: &[ProfileField]) -> Self {
        let keep = |field: ProfileField| projection.contains(&field);
        ProfileDocument {
            name: self.name.filter(|_| keep(ProfileField::Name)),
            email: self.email.filter(|_| keep(ProfileField::Email)),
            image: self.image.filter(|_| keep(ProfileField::Image)),
            specialty: self.specialty.filter(|_| keep(ProfileField::Specialty)),
            id: self.id,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_id(&self, collection: Collection, id: &str)
        -> StoreResult<Option<ProfileDocument>>;

    async fn find_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
        projection: &[ProfileField],
    ) -> StoreResult<Vec<ProfileDocument>>;

    /// Returns `false` when nothing with that id existed.
    async fn delete_by_id(&self, collection: Collection, id: &str) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_drops_unrequested_fields() {
        let doc = ProfileDocument {
            id: "d1".into(),
            name: Some("Dr. Reyes".into()),
            email: Some("reyes@clinic.test".into()),
            image: Some("https://img/d1.png".into()),
            specialty: Some("Cardiology".into()),
        };
        let projected = doc.project(&[ProfileField::Image, ProfileField::Specialty]);
        assert_eq!(projected.id, "d1");
        assert_eq!(projected.name, None);
        assert_eq!(projected.email, None);
        assert_eq!(projected.image.as_deref(), Some("https://img/d1.png"));
        assert_eq!(projected.specialty.as_deref(), Some("Cardiology"));
    }

    #[test]
    fn document_reads_mongo_style_id() {
        let doc: ProfileDocument =
            serde_json::from_str(r#"{"_id":"u1","name":"Alice","slots_booked":{}}"#).unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.name.as_deref(), Some("Alice"));
        assert_eq!(doc.image, None);
    }
}
