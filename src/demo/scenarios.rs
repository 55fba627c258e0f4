use super::post::{Post, PostDao};
use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use persistkit::prelude::advanced::ClusterRuntime;
use persistkit::prelude::dx::*;
use persistkit::InMemoryClusterNode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Everything one demo run needs: a context, the post DAO and an id
/// supplier attached through a grid member.
pub struct Env {
    pub context: Arc<PersistenceContext>,
    pub posts: PostDao,
    pub ids: DistributedIdSupplier<Post>,
    node: Arc<InMemoryClusterNode>,
    runs: AtomicU64,
}

impl Env {
    pub async fn start(unit: PersistenceUnit, grid: &InMemoryGrid, node_id: &str) -> Result<Arc<Self>> {
        let context = Arc::new(PersistenceContext::new());
        context
            .initialize(unit, &InMemoryProvider)
            .await
            .context("failed to initialize persistence context")?;

        let posts = PostDao::new(Arc::clone(&context));
        let node = grid.join(node_id)?;
        let ids = DistributedIdSupplier::new(&*node, &*posts)
            .await
            .context("failed to attach post id supplier")?;

        Ok(Arc::new(Self {
            context,
            posts,
            ids,
            node,
            runs: AtomicU64::new(0),
        }))
    }

    fn next_run(&self) -> u64 {
        self.runs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Create, update, read, search and delete a single post
    pub async fn simple_crud(&self) -> Result<()> {
        let run = self.next_run();

        debug!(run, ">>> CREATING");
        let mut post = Post::new("insertTest", "Thiago");
        post.set_id(self.ids.next().await?);
        let saved = self.posts.save_or_update(post).await?;
        debug!(run, post = ?saved, ">>> CREATED");

        debug!(run, ">>> UPDATING");
        let mut changed = saved;
        changed.title = "updateTest".to_string();
        changed.add_comment("Nice post!");
        let updated = self.posts.update(changed).await?;
        debug!(run, post = ?updated, ">>> UPDATED");

        debug!(run, ">>> READING");
        let id = updated
            .id
            .ok_or_else(|| anyhow!("updated post lost its id"))?;
        let found = self
            .posts
            .find_by_id(&id)
            .await?
            .ok_or_else(|| anyhow!("post {} not found after update", id))?;
        debug!(run, post = ?found, ">>> READ");

        debug!(run, ">>> SEARCHING");
        let matches = self.posts.find_by_title("test").await?;
        debug!(run, found = matches.len(), ">>> FOUND");

        debug!(run, ">>> DELETING");
        self.posts.delete(&found).await?;
        debug!(run, id, ">>> DELETED");

        info!(run, id, "simple CRUD finished");
        Ok(())
    }

    /// Insert `count` posts in batches, then rewrite every one of them
    pub async fn batch_crud(&self, count: usize, batch_size: usize) -> Result<Vec<Post>> {
        let run = self.next_run();

        debug!(run, count, batch_size, ">>> BATCH CREATING");
        let mut posts = Vec::with_capacity(count);
        for i in 0..count {
            let mut post = Post::new(format!("insertTest{}", i), format!("Thiago{}", i));
            post.set_id(self.ids.next().await?);
            posts.push(post);
        }
        let saved = self.posts.save_or_update_in_batch(posts, batch_size).await?;
        info!(run, saved = saved.len(), ">>> BATCH CREATED");

        debug!(run, ">>> BATCH UPDATING");
        let changed = saved
            .into_iter()
            .map(|mut post| {
                let id = post.id.unwrap_or_default();
                post.title = format!("updateTest{}", id);
                for j in 1..=4 {
                    post.add_comment(format!("Nice post!{}{}", id, j));
                }
                post
            })
            .collect();
        let updated = self.posts.update_in_batch(changed, batch_size).await?;
        info!(run, updated = updated.len(), ">>> BATCH UPDATED");

        Ok(updated)
    }

    /// Run `tasks` simple CRUD cycles at once on the runtime's workers
    pub async fn concurrent_crud(self: &Arc<Self>, tasks: usize) -> Result<()> {
        let handles = (0..tasks).map(|_| {
            let env = Arc::clone(self);
            tokio::spawn(async move { env.simple_crud().await })
        });

        let mut failures = 0usize;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    error!(error = %err, "CRUD task failed");
                }
                Err(err) => {
                    failures += 1;
                    error!(error = %err, "CRUD task panicked or was cancelled");
                }
            }
        }

        if failures > 0 {
            return Err(anyhow!("{} of {} CRUD tasks failed", failures, tasks));
        }
        info!(tasks, "all concurrent CRUD tasks finished");
        Ok(())
    }

    pub async fn report(&self) -> Result<()> {
        let stored = self.posts.count_all(false).await?;
        let max_id = self.posts.max_id_as_long().await?;
        let issued = self.ids.current().await?;
        info!(stored, max_id, issued, node = self.node.node_id(), "store summary");
        info!("{}", self.context.pool_stats().await?);
        info!("{}", self.context.factory()?.stats());
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.ids.close()?;
        self.context.close().await?;
        self.node.leave().await?;
        Ok(())
    }
}
