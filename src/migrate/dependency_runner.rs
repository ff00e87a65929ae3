//! C1c — Dependency Task Runner.
//!
//! A generic cooperative task DAG keyed by an opaque identifier type `K`.
//! The runner owns no threads — it submits eligible tasks to the shared
//! [`WorkerPool`], mirroring `server/manager.rs`'s semaphore-bounded
//! fan-out but generalized from "run everything" to "run a node once all
//! its declared dependencies have signalled completion, success or
//! failure".

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::migrate::error::{MigrateError, MigrateResult};
use crate::migrate::worker_pool::WorkerPool;

type BoxFuture = Pin<Box<dyn Future<Output = MigrateResult<()>> + Send>>;
type TaskFn<K> = Box<dyn FnOnce(Arc<DependencyRunner<K>>) -> BoxFuture + Send>;

struct TaskNode<K: std::hash::Hash + Eq + Clone + Send + Sync + 'static> {
    deps: Vec<K>,
    func: Option<TaskFn<K>>,
    started: bool,
    waiters: Vec<oneshot::Sender<MigrateResult<()>>>,
    result: Option<MigrateResultClone>,
}

/// `MigrateError` is not `Clone`; completed results are stored as a
/// string so repeated `Wait` calls on an already-finished task can all
/// observe it.
type MigrateResultClone = Result<(), String>;

/// Generic dependency DAG runner keyed by `K`.
///
/// `AddTask`/`Run`/`Wait` from spec.md §4.3 map to
/// [`Self::add_task`]/[`Self::run`]/[`Self::wait`]. The runner must not
/// deadlock when a registered task names a dependency that was filtered
/// out of the run entirely — callers are expected to only declare
/// dependencies that will also be migrated (the entity filters in
/// `orchestrator` guarantee this), so every declared dependency is
/// eventually registered and run.
pub struct DependencyRunner<K: std::hash::Hash + Eq + Clone + Send + Sync + 'static> {
    nodes: Mutex<HashMap<K, TaskNode<K>>>,
    pool: Arc<WorkerPool>,
}

impl<K: std::hash::Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static> DependencyRunner<K> {
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            pool,
        })
    }

    /// Register a task with its dependency list. Ignored if `id` is
    /// already registered.
    pub async fn add_task<F, Fut>(self: &Arc<Self>, id: K, deps: Vec<K>, func: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = MigrateResult<()>> + Send + 'static,
    {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&id) {
            return;
        }
        let boxed: TaskFn<K> = Box::new(move |runner| Box::pin(func(runner)));
        nodes.insert(
            id,
            TaskNode {
                deps,
                func: Some(boxed),
                started: false,
                waiters: Vec::new(),
                result: None,
            },
        );
    }

    /// Mark `id` eligible to start. It actually starts once every entry
    /// in its `deps` has signalled completion (via `Wait`-internal
    /// bookkeeping, success or failure alike).
    pub async fn run(self: &Arc<Self>, id: K) -> MigrateResult<()> {
        let deps = {
            let nodes = self.nodes.lock().await;
            nodes
                .get(&id)
                .ok_or_else(|| MigrateError::UnknownDependency(format!("{id:?}")))?
                .deps
                .clone()
        };

        for dep in &deps {
            // `Box::pin` to keep recursion's future size finite.
            Box::pin(self.wait(dep.clone())).await?;
        }

        self.start(id.clone()).await;
        self.wait(id).await
    }

    async fn start(self: &Arc<Self>, id: K) {
        let func = {
            let mut nodes = self.nodes.lock().await;
            let Some(node) = nodes.get_mut(&id) else {
                return;
            };
            if node.started {
                return;
            }
            node.started = true;
            node.func.take()
        };
        let Some(func) = func else { return };

        let runner = self.clone();
        let id_for_completion = id.clone();
        let runner_for_pool = runner.clone();
        self.pool
            .spawn(async move {
                let outcome = func(runner_for_pool).await;
                runner.complete(id_for_completion, outcome).await;
                Ok(())
            })
            .await;
    }

    async fn complete(self: &Arc<Self>, id: K, outcome: MigrateResult<()>) {
        let mut nodes = self.nodes.lock().await;
        let Some(node) = nodes.get_mut(&id) else {
            return;
        };
        let stored = outcome.as_ref().map(|_| ()).map_err(|e| e.to_string());
        node.result = Some(stored.clone());
        for waiter in node.waiters.drain(..) {
            let resend = match &stored {
                Ok(()) => Ok(()),
                Err(e) => Err(MigrateError::Other(e.clone())),
            };
            let _ = waiter.send(resend);
        }
    }

    /// Block until `id` has completed (success or failure); return its
    /// result.
    pub async fn wait(self: &Arc<Self>, id: K) -> MigrateResult<()> {
        let rx = {
            let mut nodes = self.nodes.lock().await;
            let Some(node) = nodes.get_mut(&id) else {
                return Err(MigrateError::UnknownDependency(format!("{id:?}")));
            };
            if let Some(result) = &node.result {
                return match result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(MigrateError::Other(e.clone())),
                };
            }
            let (tx, rx) = oneshot::channel();
            node.waiters.push(tx);
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(MigrateError::Other("task dropped before completion".into())))
    }

    /// Distinct ids currently known to the runner, used by the
    /// orchestrator to seed `run` calls across the whole container graph
    /// once topological filtering has picked the retained set.
    pub async fn known_ids(&self) -> HashSet<K> {
        self.nodes.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn dependency_runs_before_dependent() {
        let pool = WorkerPool::new(4);
        let runner = DependencyRunner::<&'static str>::new(pool);

        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        runner
            .add_task("a", vec![], move |_r| async move {
                order_a.lock().await.push("a");
                Ok(())
            })
            .await;

        let order_b = order.clone();
        runner
            .add_task("b", vec!["a"], move |_r| async move {
                order_b.lock().await.push("b");
                Ok(())
            })
            .await;

        // The orchestrator calls `run` on every node concurrently — the
        // dependent must still wait behind its dependency regardless of
        // spawn order.
        let (res_b, res_a) = tokio::join!(runner.run("b"), runner.run("a"));
        res_a.unwrap();
        res_b.unwrap();

        let order = order.lock().await;
        assert_eq!(order.as_slice(), &["a", "b"]);
    }

    #[tokio::test]
    async fn concurrent_independent_tasks_all_complete() {
        let pool = WorkerPool::new(4);
        let runner = DependencyRunner::<u32>::new(pool);
        let counter = Arc::new(AtomicU32::new(0));

        for i in 0..5u32 {
            let counter = counter.clone();
            runner
                .add_task(i, vec![], move |_r| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }

        for i in 0..5u32 {
            runner.run(i).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failure_does_not_block_independent_siblings() {
        let pool = WorkerPool::new(4);
        let runner = DependencyRunner::<&'static str>::new(pool);

        runner
            .add_task("fails", vec![], |_r| async move {
                Err(MigrateError::Other("boom".into()))
            })
            .await;
        runner.add_task("ok", vec![], |_r| async move { Ok(()) }).await;

        assert!(runner.run("fails").await.is_err());
        assert!(runner.run("ok").await.is_ok());
    }
}
