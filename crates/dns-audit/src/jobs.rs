use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] jobs mutex poisoned, cannot recover from this - aborting";

/// Capacity of the queue feeding the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Capacity of the queue feeding the collector.
pub const DEFAULT_COLLECTOR_CAPACITY: usize = 10;

/// A two-stage pipeline: a pool of workers consuming submitted tasks,
/// and a single collector consuming the tasks the workers complete.
///
/// Workers may `submit` more tasks while they run, so the full set of
/// tasks does not need to be known up front.  The run is over when
/// every submitted task has been completed, or as soon as a worker or
/// the collector fails.
///
/// Invoking `clone` on a `Jobs` gives a new instance which refers to
/// the same pipeline.
pub struct Jobs<T, E> {
    inner: Arc<Inner<T, E>>,
}

struct Inner<T, E> {
    queue_tx: mpsc::Sender<T>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<T>>,

    /// Taken when the run is over, closing the collector queue.
    collector_tx: std::sync::Mutex<Option<mpsc::Sender<T>>>,
    /// Taken when the collector is spawned.
    collector_rx: std::sync::Mutex<Option<mpsc::Receiver<T>>>,
    collector: std::sync::Mutex<Option<JoinHandle<()>>>,

    /// Tasks submitted but not yet completed.
    ///
    /// INVARIANT: incremented before the tasks are queued, decremented
    /// after they have been handed to the collector.
    pending: watch::Sender<usize>,
    /// Tasks handed to the collector but not yet received by it.
    collecting: Arc<AtomicUsize>,

    cancelled: watch::Sender<bool>,
    failed: watch::Sender<bool>,
    /// The first error reported.  Later ones are dropped.
    error: std::sync::Mutex<Option<E>>,
}

impl<T, E> Clone for Jobs<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Jobs<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for Jobs<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobs")
            .field("pending", &self.pending())
            .field("collecting", &self.collecting())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T, E> Jobs<T, E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, DEFAULT_COLLECTOR_CAPACITY)
    }

    /// # Panics
    ///
    /// If either capacity is 0.
    pub fn with_capacity(queue_capacity: usize, collector_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let (collector_tx, collector_rx) = mpsc::channel(collector_capacity);

        Self {
            inner: Arc::new(Inner {
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                collector_tx: std::sync::Mutex::new(Some(collector_tx)),
                collector_rx: std::sync::Mutex::new(Some(collector_rx)),
                collector: std::sync::Mutex::new(None),
                pending: watch::channel(0).0,
                collecting: Arc::new(AtomicUsize::new(0)),
                cancelled: watch::channel(false).0,
                failed: watch::channel(false).0,
                error: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Tasks submitted but not yet completed.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Tasks waiting in the collector queue.
    pub fn collecting(&self) -> usize {
        self.inner.collecting.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Tell every worker to stop.  Only the first call has any effect.
    pub fn cancel(&self) {
        let first = self.inner.cancelled.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if first {
            tracing::debug!(pending = %self.pending(), "cancelled");
        }
    }

    /// Record a run-ending error and cancel the workers.  Only the
    /// first error is kept.
    pub fn fail(&self, error: E) {
        {
            let mut slot = self.inner.error.lock().expect(MUTEX_POISON_MESSAGE);
            if slot.is_some() {
                tracing::debug!("dropping error, the run has already failed");
                return;
            }
            *slot = Some(error);
        }
        self.inner.failed.send_replace(true);
        self.cancel();
    }

    fn take_error(&self) -> Option<E> {
        self.inner.error.lock().expect(MUTEX_POISON_MESSAGE).take()
    }

    /// Wait for the run to finish.
    ///
    /// If every submitted task gets completed, this cancels the
    /// workers, closes the collector queue, and waits for the collector
    /// to drain it.  If a worker or the collector fails first, this
    /// cancels everything and returns that error straight away.
    ///
    /// Call this after the initial tasks have been submitted: with
    /// nothing pending, the run is already over.
    ///
    /// # Errors
    ///
    /// The first error returned by a worker or by the collector.
    ///
    /// # Panics
    ///
    /// If the collector panicked.
    pub async fn wait(&self) -> Result<(), E> {
        let mut failed = self.inner.failed.subscribe();
        let mut pending = self.inner.pending.subscribe();

        tokio::select! {
            biased;
            () = until(&mut failed, |failed| *failed) => {
                self.cancel();
                return self.take_error().map_or(Ok(()), Err);
            }
            () = until(&mut pending, |pending| *pending == 0) => (),
        }

        self.cancel();
        self.inner
            .collector_tx
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .take();

        let collector = self.inner.collector.lock().expect(MUTEX_POISON_MESSAGE).take();
        if let Some(handle) = collector {
            tracing::debug!(collecting = %self.collecting(), "waiting for collector");
            tokio::select! {
                biased;
                () = until(&mut failed, |failed| *failed) => (),
                joined = handle => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            std::panic::resume_unwind(err.into_panic());
                        }
                    }
                }
            }
        }

        self.take_error().map_or(Ok(()), Err)
    }
}

impl<T: Send + 'static, E: Send + 'static> Jobs<T, E> {
    /// Queue tasks for the workers.
    ///
    /// The tasks count as pending from the moment this returns, even
    /// though they are queued in the background, so a worker can
    /// submit follow-up tasks before completing its own without the
    /// run ending in between.
    pub fn submit(&self, tasks: impl IntoIterator<Item = T>) {
        let tasks = tasks.into_iter().collect::<Vec<_>>();
        if tasks.is_empty() {
            return;
        }

        self.inner.pending.send_modify(|pending| *pending += tasks.len());

        let sender = self.inner.queue_tx.clone();
        let mut cancelled = self.inner.cancelled.subscribe();
        tokio::spawn(async move {
            for task in tasks {
                tokio::select! {
                    biased;
                    () = until(&mut cancelled, |cancelled| *cancelled) => return,
                    sent = sender.send(task) => if sent.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Start a worker, which runs `work` on each task it takes from
    /// the queue until the run is cancelled.
    ///
    /// `work` must call `complete` exactly once for its task, whether
    /// it succeeds or not.  An `Err` from `work` ends the run.  A
    /// worker which is cancelled mid-task just stops.
    pub fn spawn_worker<F, Fut>(&self, work: F) -> JoinHandle<()>
    where
        F: Fn(Jobs<T, E>, T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let jobs = self.clone();
        tokio::spawn(async move {
            let mut cancelled = jobs.inner.cancelled.subscribe();
            loop {
                let next = tokio::select! {
                    biased;
                    () = until(&mut cancelled, |cancelled| *cancelled) => None,
                    task = jobs.next_task() => task,
                };
                let Some(task) = next else {
                    return;
                };

                let result = tokio::select! {
                    biased;
                    () = until(&mut cancelled, |cancelled| *cancelled) => return,
                    result = work(jobs.clone(), task) => result,
                };
                if let Err(error) = result {
                    jobs.fail(error);
                    return;
                }
            }
        })
    }

    async fn next_task(&self) -> Option<T> {
        self.inner.queue_rx.lock().await.recv().await
    }

    /// Hand a finished task to the collector and mark it as no longer
    /// pending.
    pub async fn complete(&self, task: T) {
        self.save(task).await;
        self.inner.pending.send_modify(|pending| {
            debug_assert!(*pending > 0, "task completed more than once");
            *pending = pending.saturating_sub(1);
        });
    }

    /// Hand something to the collector without it going through a
    /// worker.  It must be saved while the run is still going: once
    /// the collector queue has been closed it is dropped.
    pub async fn save(&self, task: T) {
        let sender = self
            .inner
            .collector_tx
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .clone();

        let Some(sender) = sender else {
            tracing::warn!("collector queue closed, dropping task");
            return;
        };

        self.inner.collecting.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).await.is_err() {
            self.inner.collecting.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("collector has gone away, dropping task");
        }
    }

    /// Start the collector, which gets every completed task.  The
    /// collector is not cancelled: it runs until its queue is closed
    /// and drained.  An `Err` from it ends the run.
    ///
    /// # Panics
    ///
    /// If a collector has already been spawned.
    pub fn spawn_collector<F, Fut>(&self, collect: F)
    where
        F: FnOnce(Collected<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let Some(receiver) = self
            .inner
            .collector_rx
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .take()
        else {
            panic!("[INTERNAL ERROR] only one collector can be spawned");
        };

        let collected = Collected {
            receiver,
            collecting: Arc::clone(&self.inner.collecting),
        };
        let jobs = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(error) = collect(collected).await {
                jobs.fail(error);
            }
        });

        *self.inner.collector.lock().expect(MUTEX_POISON_MESSAGE) = Some(handle);
    }
}

/// The collector's end of the collector queue.
#[derive(Debug)]
pub struct Collected<T> {
    receiver: mpsc::Receiver<T>,
    collecting: Arc<AtomicUsize>,
}

impl<T> Collected<T> {
    /// The next completed task, or `None` once the run is over and
    /// everything has been received.
    pub async fn recv(&mut self) -> Option<T> {
        let task = self.receiver.recv().await?;
        self.collecting.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }
}

/// Resolve once the watched value satisfies `done`, or its sender is
/// gone.
async fn until<V>(receiver: &mut watch::Receiver<V>, done: impl Fn(&V) -> bool) {
    loop {
        let finished = done(&receiver.borrow_and_update());
        if finished || receiver.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    type Seen = Arc<Mutex<Vec<u32>>>;

    fn collect_into(jobs: &Jobs<u32, String>, seen: &Seen) {
        let seen = Arc::clone(seen);
        jobs.spawn_collector(move |mut collected| async move {
            while let Some(task) = collected.recv().await {
                seen.lock().unwrap().push(task);
            }
            Ok(())
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_task_is_processed_and_collected() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        collect_into(&jobs, &seen);

        for _ in 0..4 {
            jobs.spawn_worker(|jobs, task| async move {
                tokio::task::yield_now().await;
                jobs.complete(task * 2).await;
                Ok(())
            });
        }

        jobs.submit(0..100);
        assert_eq!(Ok(()), jobs.wait().await);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!((0..100).map(|n| n * 2).collect::<Vec<_>>(), seen);
        assert_eq!(0, jobs.pending());
        assert_eq!(0, jobs.collecting());
        assert!(jobs.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_can_submit_more_tasks() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        collect_into(&jobs, &seen);

        for _ in 0..3 {
            jobs.spawn_worker(|jobs, depth| async move {
                if depth < 4 {
                    jobs.submit([depth + 1, depth + 1]);
                }
                tokio::task::yield_now().await;
                jobs.complete(depth).await;
                Ok(())
            });
        }

        jobs.submit([0]);
        assert_eq!(Ok(()), jobs.wait().await);

        let seen = seen.lock().unwrap();
        assert_eq!(31, seen.len());
        for depth in 0..=4 {
            assert_eq!(1 << depth, seen.iter().filter(|d| **d == depth).count());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_error_is_returned_and_others_stop_quietly() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        collect_into(&jobs, &seen);

        for _ in 0..4 {
            jobs.spawn_worker(|jobs, task| async move {
                if task == 3 {
                    return Err(format!("task {task} failed"));
                }
                if task > 3 {
                    // never finishes unless cancelled
                    std::future::pending::<()>().await;
                }
                jobs.complete(task).await;
                Ok(())
            });
        }

        jobs.submit(0..10);
        let result = tokio::time::timeout(Duration::from_secs(5), jobs.wait())
            .await
            .expect("wait should not hang");

        assert_eq!(Err("task 3 failed".to_string()), result);
        assert!(jobs.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_the_first_error_is_kept() {
        let jobs = Jobs::<u32, String>::new();
        jobs.fail("first".to_string());
        jobs.fail("second".to_string());

        assert_eq!(Err("first".to_string()), jobs.wait().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn collector_error_ends_the_run() {
        let jobs = Jobs::<u32, String>::new();
        jobs.spawn_collector(|mut collected| async move {
            match collected.recv().await {
                Some(task) => Err(format!("could not report task {task}")),
                None => Ok(()),
            }
        });
        for _ in 0..2 {
            jobs.spawn_worker(|jobs, task| async move {
                jobs.complete(task).await;
                Ok(())
            });
        }

        jobs.submit(0..50);
        let result = tokio::time::timeout(Duration::from_secs(5), jobs.wait())
            .await
            .expect("wait should not hang");

        assert!(result.unwrap_err().starts_with("could not report task"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saved_items_reach_the_collector() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        collect_into(&jobs, &seen);

        jobs.spawn_worker(|jobs, task| async move {
            jobs.save(task + 1000).await;
            jobs.complete(task).await;
            Ok(())
        });

        jobs.submit([1, 2]);
        assert_eq!(Ok(()), jobs.wait().await);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(vec![1, 2, 1001, 1002], seen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn collector_is_drained_before_wait_returns() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        {
            let seen = Arc::clone(&seen);
            jobs.spawn_collector(move |mut collected| async move {
                while let Some(task) = collected.recv().await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    seen.lock().unwrap().push(task);
                }
                Ok(())
            });
        }
        jobs.spawn_worker(|jobs, task| async move {
            jobs.complete(task).await;
            Ok(())
        });

        jobs.submit(0..20);
        assert_eq!(Ok(()), jobs.wait().await);
        assert_eq!(20, seen.lock().unwrap().len());
    }

    #[tokio::test]
    async fn wait_with_nothing_submitted_finishes() {
        let jobs = Jobs::<u32, String>::new();
        let seen = Seen::default();
        collect_into(&jobs, &seen);

        assert_eq!(Ok(()), jobs.wait().await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "only one collector")]
    async fn second_collector_panics() {
        let jobs = Jobs::<u32, String>::new();
        jobs.spawn_collector(|_| async { Ok(()) });
        jobs.spawn_collector(|_| async { Ok(()) });
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "task completed more than once")]
    async fn completing_an_unsubmitted_task_panics() {
        let jobs = Jobs::<u32, String>::new();
        jobs.complete(1).await;
    }
}
