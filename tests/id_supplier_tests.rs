/// Distributed id supplier tests
///
/// Seeding from the store, sharing a counter between grid members,
/// concurrent uniqueness and attachment failures.
/// Run with: cargo test --test id_supplier_tests
mod common;

use common::{Post, post_dao};
use persistkit::prelude::advanced::ClusterRuntime;
use persistkit::prelude::dx::*;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_first_id_on_empty_store_is_one() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();

    let ids = DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap();
    assert_eq!(ids.counter_name(), "PostIDSupplier");
    assert_eq!(ids.current().await.unwrap(), 0);
    assert_eq!(ids.next().await.unwrap(), 1);
    assert_eq!(ids.next_id().await.unwrap(), 2);
}

#[tokio::test]
async fn test_seed_comes_from_stored_maximum() {
    let dao = post_dao().await;
    dao.save_or_update(Post::with_id(41, "forty-one", "Seed"))
        .await
        .unwrap();
    dao.save_or_update(Post::with_id(12, "twelve", "Seed"))
        .await
        .unwrap();

    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();
    let ids = DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap();

    assert_eq!(ids.next().await.unwrap(), 42);

    let mut post = Post::new("next", "Next");
    post.set_id(ids.next().await.unwrap());
    let saved = dao.save_or_update(post).await.unwrap();
    assert_eq!(saved.id, Some(43));
}

#[tokio::test]
async fn test_existing_counter_keeps_its_value() {
    let seeded = post_dao().await;
    seeded
        .save_or_update(Post::with_id(100, "hundred", "Seed"))
        .await
        .unwrap();
    let empty = post_dao().await;

    let grid = InMemoryGrid::new();
    let first_node = grid.join("node-1").unwrap();
    let second_node = grid.join("node-2").unwrap();

    let first = DistributedIdSupplier::<Post>::new(&*first_node, &seeded).await.unwrap();
    assert_eq!(first.next().await.unwrap(), 101);

    // the second member sees an empty store but joins the running counter
    let second = DistributedIdSupplier::<Post>::new(&*second_node, &empty).await.unwrap();
    assert_eq!(second.next().await.unwrap(), 102);
    assert_eq!(first.next().await.unwrap(), 103);
}

#[tokio::test]
async fn test_concurrent_ids_are_unique_and_increasing() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();
    let ids = Arc::new(DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap());

    let tasks = 8;
    let per_task = 50;
    let mut handles = vec![];

    for _ in 0..tasks {
        let ids = Arc::clone(&ids);
        handles.push(tokio::spawn(async move {
            let mut issued = Vec::with_capacity(per_task);
            for _ in 0..per_task {
                issued.push(ids.next().await.unwrap());
            }
            issued
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        let issued = handle.await.unwrap();
        assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
        for id in issued {
            assert!(all.insert(id), "id {} issued twice", id);
        }
    }

    let total = (tasks * per_task) as i64;
    assert_eq!(all.len() as i64, total);
    assert_eq!(all.iter().max().copied(), Some(total));
    assert_eq!(ids.current().await.unwrap(), total);
}

#[tokio::test]
async fn test_suppliers_on_many_nodes_never_collide() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();

    let mut suppliers = Vec::new();
    let mut nodes = Vec::new();
    for n in 0..4 {
        let node = grid.join(format!("node-{}", n)).unwrap();
        suppliers.push(Arc::new(DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap()));
        nodes.push(node);
    }

    let mut handles = vec![];
    for supplier in &suppliers {
        let supplier = Arc::clone(supplier);
        handles.push(tokio::spawn(async move {
            let mut issued = Vec::new();
            for _ in 0..25 {
                issued.push(supplier.next().await.unwrap());
            }
            issued
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(all.insert(id));
        }
    }
    assert_eq!(all.len(), 100);
    assert_eq!(grid.members().unwrap().len(), 4);
}

#[tokio::test]
async fn test_custom_and_blank_suffix() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();

    let ids = DistributedIdSupplier::<Post>::with_suffix(&*node, &dao, "Seq").await.unwrap();
    assert_eq!(ids.counter_name(), "PostSeq");
    assert!(grid.has_counter("PostSeq").unwrap());

    let err = DistributedIdSupplier::<Post>::with_suffix(&*node, &dao, "  ")
        .await
        .err()
        .unwrap();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_attachment_failure_is_reported() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();
    node.leave().await.unwrap();

    let err = DistributedIdSupplier::<Post>::new(&*node, &dao)
        .await
        .err()
        .unwrap();
    match err {
        PersistError::CounterAttachment { name, .. } => assert_eq!(name, "PostIDSupplier"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_close_detaches_counter() {
    let dao = post_dao().await;
    let grid = InMemoryGrid::new();
    let node = grid.join("node-1").unwrap();

    let ids = DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap();
    assert_eq!(ids.next().await.unwrap(), 1);

    ids.close().unwrap();
    ids.close().unwrap();
    assert!(ids.next().await.is_err());
    assert!(!grid.has_counter("PostIDSupplier").unwrap());

    let dropped = DistributedIdSupplier::<Post>::new(&*node, &dao).await.unwrap();
    assert!(grid.has_counter("PostIDSupplier").unwrap());
    drop(dropped);
    assert!(!grid.has_counter("PostIDSupplier").unwrap());
}
