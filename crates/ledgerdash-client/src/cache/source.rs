//! Where cached entities come from.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{ApiClient, ApiRequest, RequestOptions};
use crate::error::ApiResult;

/// A record held by an entity cache.
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
}

/// Page position and size as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            total: 0,
            has_more: false,
        }
    }
}

/// Filter values sent as query parameters.
pub type Filters = BTreeMap<String, String>;

/// Parameters of one list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    pub filters: Filters,
}

/// One page of entities.
#[derive(Debug, Clone)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub pagination: Option<Pagination>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PagePayload<E> {
    Bare(Vec<E>),
    Paged {
        items: Vec<E>,
        #[serde(default)]
        pagination: Option<Pagination>,
    },
}

impl<'de, E: Deserialize<'de>> Deserialize<'de> for Page<E> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match PagePayload::<E>::deserialize(deserializer)? {
            PagePayload::Bare(items) => Page {
                items,
                pagination: None,
            },
            PagePayload::Paged { items, pagination } => Page { items, pagination },
        })
    }
}

/// Remote operations backing an entity cache.
#[async_trait]
pub trait EntitySource<E: Entity>: Send + Sync {
    async fn list(&self, query: &ListQuery, options: &RequestOptions) -> ApiResult<Page<E>>;
    async fn create(&self, draft: &E) -> ApiResult<E>;
    async fn update(&self, id: &E::Id, patch: &Map<String, Value>) -> ApiResult<E>;
    async fn delete(&self, id: &E::Id) -> ApiResult<()>;
}

/// REST collection: `GET|POST <path>`, `PATCH|DELETE <path>/<id>`.
pub struct RestSource<E> {
    client: ApiClient,
    path: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E> RestSource<E> {
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            _entity: PhantomData,
        }
    }

    fn item_path(&self, id: &impl Display) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), id)
    }
}

impl<E> Debug for RestSource<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSource").field("path", &self.path).finish()
    }
}

#[async_trait]
impl<E: Entity> EntitySource<E> for RestSource<E> {
    async fn list(&self, query: &ListQuery, options: &RequestOptions) -> ApiResult<Page<E>> {
        let mut request = ApiRequest::get(&self.path)
            .with_query("page", query.page)
            .with_query("limit", query.limit);
        for (key, value) in &query.filters {
            request = request.with_query(key.clone(), value);
        }
        self.client.send(request, options.clone()).await
    }

    async fn create(&self, draft: &E) -> ApiResult<E> {
        self.client.post(&self.path, draft).await
    }

    async fn update(&self, id: &E::Id, patch: &Map<String, Value>) -> ApiResult<E> {
        self.client.patch(&self.item_path(id), patch).await
    }

    async fn delete(&self, id: &E::Id) -> ApiResult<()> {
        let _: Value = self.client.delete(&self.item_path(id)).await?;
        Ok(())
    }
}
