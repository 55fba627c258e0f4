#![allow(dead_code)]

use persistkit::prelude::dx::*;
use persistkit::EngineStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Option<i64>,
    pub slug: String,
    pub title: String,
    pub views: i64,
    #[serde(skip)]
    pub transient: bool,
}

impl Post {
    pub fn new(slug: &str, title: &str) -> Self {
        Self {
            id: None,
            slug: slug.to_string(),
            title: title.to_string(),
            views: 0,
            transient: true,
        }
    }

    /// A new post whose id was assigned up front
    pub fn with_id(id: i64, slug: &str, title: &str) -> Self {
        let mut post = Self::new(slug, title);
        post.id = Some(id);
        post
    }

    pub fn views(mut self, views: i64) -> Self {
        self.views = views;
        self
    }
}

impl Persistable for Post {
    type Id = i64;

    fn meta() -> EntityMeta {
        EntityMeta::new("Post").unique(&["slug"])
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

pub fn unit() -> PersistenceUnit {
    PersistenceUnit::new("testUnit")
        .entity("Post")
        .acquire_timeout(Duration::from_secs(5))
}

pub async fn context_with(unit: PersistenceUnit) -> Arc<PersistenceContext> {
    let context = Arc::new(PersistenceContext::new());
    let initialized = context.initialize(unit, &InMemoryProvider).await.unwrap();
    assert!(initialized);
    context
}

pub async fn post_dao() -> GenericDao<Post> {
    GenericDao::new(context_with(unit()).await)
}

pub fn engine_stats(dao: &GenericDao<Post>) -> EngineStats {
    dao.context().factory().unwrap().stats()
}
