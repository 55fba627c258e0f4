/// Concurrent access tests
///
/// Many tasks sharing one DAO, one pool and one id supplier.
/// Run with: cargo test --test concurrent_access_tests
mod common;

use common::{Post, context_with, unit};
use persistkit::prelude::dx::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Env {
    dao: GenericDao<Post>,
    ids: DistributedIdSupplier<Post>,
}

async fn env(max_units: usize) -> (Arc<Env>, Arc<persistkit::InMemoryClusterNode>) {
    let dao = GenericDao::new(context_with(unit().max_units(max_units)).await);
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();
    let ids = DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap();
    (Arc::new(Env { dao, ids }), node)
}

async fn simple_crud(env: &Env, run: usize) -> Result<()> {
    let mut post = Post::new(&format!("crud-{}", run), "insertTest");
    post.set_id(env.ids.next().await?);
    let saved = env.dao.save_or_update(post).await?;

    let mut changed = saved;
    changed.title = "updateTest".to_string();
    let updated = env.dao.update(changed).await?;

    let id = updated.id.unwrap_or_default();
    let found = env
        .dao
        .find_by_id(&id)
        .await?
        .ok_or_else(|| PersistError::EntityNotFound {
            entity: "Post".to_string(),
            id: id.to_string(),
        })?;
    assert_eq!(found.title, "updateTest");

    let query = Query::filter(Predicate::ilike("title", param(1)));
    let matches = env
        .dao
        .find_by_query(true, QueryRange::all(), &query, &[Value::from(contains_pattern("test"))])
        .await?;
    assert!(matches.iter().any(|p| p.id == Some(id)));

    env.dao.delete(&found).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_crud_cycles() {
    let (env, _node) = env(10).await;

    let mut handles = vec![];
    for run in 0..50 {
        let env = Arc::clone(&env);
        handles.push(tokio::spawn(async move { simple_crud(&env, run).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(env.dao.count_all(false).await.unwrap(), 0);
    assert_eq!(env.ids.current().await.unwrap(), 50);

    let pool = env.dao.context().pool_stats().await.unwrap();
    assert!(pool.total_units <= 10);
    assert_eq!(pool.active_units, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_with_supplied_ids() {
    let (env, _node) = env(4).await;

    let mut handles = vec![];
    for task in 0..4 {
        let env = Arc::clone(&env);
        handles.push(tokio::spawn(async move {
            let mut posts = Vec::new();
            for i in 0..25 {
                let mut post = Post::new(&format!("batch-{}-{}", task, i), "Batch");
                post.set_id(env.ids.next().await.unwrap());
                posts.push(post);
            }
            env.dao.save_or_update_in_batch(posts, 10).await.unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        for post in handle.await.unwrap() {
            assert!(ids.insert(post.id.unwrap()));
        }
    }

    assert_eq!(ids.len(), 100);
    assert_eq!(env.dao.count_all(false).await.unwrap(), 100);
    assert_eq!(env.dao.max_id_as_long().await.unwrap(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_unit_pool_serializes_writers() {
    let dao = GenericDao::<Post>::new(
        context_with(unit().max_units(1).acquire_timeout(Duration::from_secs(10))).await,
    );

    let mut handles = vec![];
    for i in 0..20 {
        let dao = dao.clone();
        handles.push(tokio::spawn(async move {
            dao.save_or_update(Post::new(&format!("serial-{}", i), "Serial"))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().id.unwrap());
    }
    assert_eq!(ids, (1..=20).collect::<HashSet<i64>>());

    let pool = dao.context().pool_stats().await.unwrap();
    assert_eq!(pool.total_units, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_uncommitted_rows() {
    let dao = GenericDao::<Post>::new(context_with(unit()).await);
    dao.save_or_update(Post::new("visible", "Visible")).await.unwrap();

    let mut uow = dao.context().unit_of_work().await.unwrap();
    uow.begin().await.unwrap();
    dao.save_or_update_in(&mut uow, Post::new("hidden", "Hidden"))
        .await
        .unwrap();
    uow.flush().await.unwrap();

    let reader = dao.clone();
    let seen = tokio::spawn(async move { reader.count_all(false).await.unwrap() })
        .await
        .unwrap();
    assert_eq!(seen, 1);

    uow.commit().await.unwrap();
    uow.release().await.unwrap();
    assert_eq!(dao.count_all(false).await.unwrap(), 2);
}
