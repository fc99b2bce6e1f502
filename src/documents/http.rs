use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;

use super::{Collection, DocumentStore, ProfileDocument, ProfileField};
use crate::error::{StoreError, StoreResult};

/// Document store reached through the REST gateway in front of the profile
/// database.
#[derive(Clone)]
pub struct HttpDocumentStore {
    client: Client,
    base: Url,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base = Url::parse(base_url)
            .map_err(|e| StoreError::Rejected(format!("invalid document store url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Rejected(format!(
                "document store url {base_url} cannot carry a path"
            )));
        }
        Ok(Self { client, base })
    }

    /// `{base}/{collection}/{tail}`, with `tail` encoded as exactly one path
    /// segment. Ids that cannot name a single segment (`""`, `.`, `..`) are
    /// rejected.
    fn url(&self, collection: Collection, tail: &str) -> StoreResult<Url> {
        if !addressable(tail) {
            return Err(StoreError::Rejected(format!(
                "document id {tail:?} cannot be addressed"
            )));
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Rejected("document store url cannot carry a path".into()))?
            .pop_if_empty()
            .push(collection.as_str())
            .push(tail);
        Ok(url)
    }
}

fn addressable(id: &str) -> bool {
    !matches!(id, "" | "." | "..")
}

fn check_status(status: StatusCode, what: &str) -> StoreResult<()> {
    if status.is_server_error() {
        return Err(StoreError::Unavailable(format!("{what} returned {status}")));
    }
    if !status.is_success() {
        return Err(StoreError::Rejected(format!("{what} returned {status}")));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StoreResult<Option<ProfileDocument>> {
        if !addressable(id) {
            return Ok(None);
        }
        let response = self.client.get(self.url(collection, id)?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status(), "find_by_id")?;
        Ok(Some(response.json::<ProfileDocument>().await?))
    }

    async fn find_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
        projection: &[ProfileField],
    ) -> StoreResult<Vec<ProfileDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(self.url(collection, "find")?)
            .json(&json!({ "ids": ids, "projection": projection }))
            .send()
            .await?;
        check_status(response.status(), "find_by_ids")?;
        let docs = response.json::<Vec<ProfileDocument>>().await?;
        // the gateway may return more than asked for
        Ok(docs.into_iter().map(|doc| doc.project(projection)).collect())
    }

    async fn delete_by_id(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        if !addressable(id) {
            return Ok(false);
        }
        let response = self.client.delete(self.url(collection, id)?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response.status(), "delete_by_id")?;
        Ok(true)
    }
}
