use chrono::{DateTime, Utc};
use persistkit::prelude::dx::*;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDetails {
    pub created_by: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostComment {
    pub review: String,
}

/// Sample entity. Ids are handed out by the cluster counter before the
/// first save, so newness is tracked separately from the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub details: PostDetails,
    #[serde(default)]
    pub comments: Vec<PostComment>,
    #[serde(skip)]
    transient: bool,
}

impl Post {
    pub fn new(title: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            details: PostDetails {
                created_by: created_by.into(),
                created_on: Utc::now(),
            },
            comments: Vec::new(),
            transient: true,
        }
    }

    pub fn add_comment(&mut self, review: impl Into<String>) {
        self.comments.push(PostComment {
            review: review.into(),
        });
    }
}

impl Persistable for Post {
    type Id = i64;

    fn meta() -> EntityMeta {
        EntityMeta::new("Post")
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn is_new(&self) -> bool {
        self.transient || self.id.is_none()
    }
}

/// Post data access with a title search on top of the generic operations
#[derive(Clone)]
pub struct PostDao {
    inner: GenericDao<Post>,
}

impl PostDao {
    pub fn new(context: Arc<PersistenceContext>) -> Self {
        Self {
            inner: GenericDao::new(context),
        }
    }

    /// Case-insensitive substring match on the title, oldest first
    pub async fn find_by_title(&self, title: &str) -> Result<Vec<Post>> {
        let query = Query::filter(Predicate::ilike("title", param(1))).order_by("details.created_on");
        let pattern = Value::from(contains_pattern(&title.to_lowercase()));
        self.inner
            .find_by_query(true, QueryRange::all(), &query, &[pattern])
            .await
    }
}

impl Deref for PostDao {
    type Target = GenericDao<Post>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
