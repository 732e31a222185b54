use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::CacheService;
use crate::config::Config;
use crate::database::{EmbeddingStatus, SharedRepository};
use crate::embedding::{SharedEmbedder, embed_with_cache};
use crate::metrics::SharedMetrics;

/// 向量生成任务队列
///
/// 任务就是状态为 `pending` 的消息。每条消息先原子地认领为 `processing`，
/// 认领失败说明已被其他 worker 处理，直接跳过；处理结果写回
/// `completed` + 向量或 `failed` + 错误信息，单条失败不会中断整轮处理。
/// 认领超过租约仍未完成的消息会在下一轮开始前放回 `pending`。
pub struct EmbeddingJobQueue {
    repository: SharedRepository,
    embedder: SharedEmbedder,
    cache: CacheService,
    metrics: SharedMetrics,
    poll_interval: Duration,
    batch_size: usize,
    claim_lease: Duration,
    stop_tx: watch::Sender<bool>,
    wake: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingJobQueue {
    pub fn new(
        repository: SharedRepository,
        embedder: SharedEmbedder,
        cache: CacheService,
        metrics: SharedMetrics,
        config: &Config,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            repository,
            embedder,
            cache,
            metrics,
            poll_interval: config.embedding_poll_interval(),
            batch_size: config.embedding_batch_size.max(1),
            claim_lease: config.embedding_claim_lease(),
            stop_tx,
            wake: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// 启动后台处理循环，已在运行时不做任何事
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("embedding_queue_already_running");
            return;
        }

        self.stop_tx.send_replace(false);
        let queue = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { queue.run().await }));
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            claim_lease_secs = self.claim_lease.as_secs(),
            "embedding_queue_started"
        );
    }

    /// 通知循环退出并等待当前任务处理完
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "embedding_queue_task_failed");
            }
            tracing::info!("embedding_queue_stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// 提前唤醒处理循环
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// 处理调用时所有待处理的消息，返回处理条数
    pub async fn drain_once(&self) -> usize {
        self.drain(None, None).await
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.requeue_stale().await;
            let processed = self.drain(Some(self.batch_size), Some(&stop_rx)).await;
            if processed > 0 {
                tracing::debug!(processed, "embedding_queue_pass_finished");
                // 批次满了说明可能还有积压，不等待直接进入下一轮
                if processed >= self.batch_size {
                    continue;
                }
            }

            tokio::select! {
                _ = stop_rx.changed() => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn requeue_stale(&self) {
        match self.repository.requeue_stale(self.claim_lease).await {
            Ok(0) => {}
            Ok(requeued) => tracing::warn!(requeued, "embedding_jobs_requeued_after_lease"),
            Err(e) => tracing::error!(error = %e, "embedding_queue_requeue_failed"),
        }
    }

    async fn drain(&self, limit: Option<usize>, stop: Option<&watch::Receiver<bool>>) -> usize {
        let ids = match self.repository.pending_ids(limit).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "embedding_queue_list_failed");
                return 0;
            }
        };

        let mut processed = 0;
        for id in ids {
            if stop.is_some_and(|rx| *rx.borrow()) {
                break;
            }
            if self.process(id).await {
                processed += 1;
            }
        }
        processed
    }

    /// 处理单条消息，返回是否认领成功
    async fn process(&self, id: Uuid) -> bool {
        match self
            .repository
            .transition_status(id, EmbeddingStatus::Pending, EmbeddingStatus::Processing)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %id, "embedding_job_claimed_elsewhere");
                return false;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "embedding_job_claim_failed");
                return false;
            }
        }

        let record = match self.repository.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(job_id = %id, "embedding_job_missing_record");
                self.metrics.record_embedding_job("failed", None);
                return true;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "embedding_job_load_failed");
                self.mark_failed(id, &e.to_string(), None).await;
                return true;
            }
        };

        let started = Instant::now();
        match embed_with_cache(self.embedder.as_ref(), &self.cache, &record.content).await {
            Ok(embedding) => {
                let dimensions = embedding.len();
                if let Err(e) = self.repository.complete(id, embedding).await {
                    tracing::error!(job_id = %id, error = %e, "embedding_job_persist_failed");
                    self.mark_failed(id, &e.to_string(), Some(started.elapsed())).await;
                    return true;
                }
                self.metrics
                    .record_embedding_job("completed", Some(started.elapsed()));
                self.cache
                    .invalidate_search(&record.tenant_id, Some(&record.conversation_id))
                    .await;
                tracing::info!(
                    job_id = %id,
                    tenant_id = record.tenant_id.as_str(),
                    dimensions,
                    "embedding_job_completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %id,
                    tenant_id = record.tenant_id.as_str(),
                    error = %e,
                    "embedding_job_failed"
                );
                self.mark_failed(id, &e.to_string(), Some(started.elapsed())).await;
            }
        }
        true
    }

    async fn mark_failed(&self, id: Uuid, error: &str, elapsed: Option<Duration>) {
        if let Err(e) = self.repository.fail(id, error).await {
            tracing::error!(job_id = %id, error = %e, "embedding_job_mark_failed_failed");
        }
        self.metrics.record_embedding_job("failed", elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::database::{MemoryMessageRepository, MessageRecord, NewMessage};
    use std::sync::Mutex as StdMutex;
    use crate::embedding::{EmbeddingError, EmbeddingProvider, HashEmbedding};
    use crate::metrics::NoopMetrics;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn generate(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Provider("model offline".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// 统计调用次数
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn generate(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.6, 0.8])
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// 第一次生成向量时写入一条新消息，模拟处理期间的新请求
    struct InterleavingEmbedder {
        repository: SharedRepository,
        created: StdMutex<Option<Uuid>>,
    }

    #[async_trait]
    impl EmbeddingProvider for InterleavingEmbedder {
        async fn generate(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let first = self.created.lock().unwrap().is_none();
            if first {
                let record = self
                    .repository
                    .create(NewMessage::pending("tenant-a", "conv-1", "user", "arrived late"))
                    .await
                    .map_err(|e| EmbeddingError::Provider(e.to_string()))?;
                *self.created.lock().unwrap() = Some(record.id);
            }
            Ok(vec![1.0, 0.0])
        }

        fn name(&self) -> &'static str {
            "interleaving"
        }
    }

    /// 生成向量时停住，直到测试放行
    struct GatedEmbedder {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbedder {
        async fn generate(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![0.0, 1.0])
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    async fn wait_for_terminal(repository: &SharedRepository, id: Uuid) -> EmbeddingStatus {
        let mut status = EmbeddingStatus::Pending;
        for _ in 0..50 {
            status = repository.get(id).await.unwrap().unwrap().embedding_status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        status
    }

    fn build_queue(repository: SharedRepository, embedder: SharedEmbedder) -> EmbeddingJobQueue {
        let config = Config::default();
        EmbeddingJobQueue::new(
            repository,
            embedder,
            CacheService::new(Arc::new(crate::cache::MemoryCache::new(100)), &config),
            Arc::new(NoopMetrics),
            &config,
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    fn queue_with(repository: SharedRepository, embedder: SharedEmbedder) -> Arc<EmbeddingJobQueue> {
        Arc::new(build_queue(repository, embedder))
    }

    async fn seed(repository: &SharedRepository, content: &str) -> MessageRecord {
        repository
            .create(NewMessage::pending("tenant-a", "conv-1", "user", content))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn drain_once_processes_every_pending_message() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        for i in 0..3 {
            seed(&repository, &format!("message number {}", i)).await;
        }
        let queue = queue_with(repository.clone(), Arc::new(HashEmbedding::new(16)));

        assert_eq!(queue.drain_once().await, 3);
        assert!(repository.pending_ids(None).await.unwrap().is_empty());
        assert_eq!(queue.drain_once().await, 0);
    }

    #[tokio::test]
    async fn generation_failure_marks_failed() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let record = seed(&repository, "hello").await;
        let queue = queue_with(repository.clone(), Arc::new(FailingEmbedder));

        assert_eq!(queue.drain_once().await, 1);
        let stored = repository.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding_status, EmbeddingStatus::Failed);
        assert!(stored.embedding.is_none());
        assert!(stored.embedding_error.unwrap().contains("model offline"));
    }

    #[tokio::test]
    async fn claimed_messages_are_skipped() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let record = seed(&repository, "hello").await;
        let queue = queue_with(repository.clone(), Arc::new(HashEmbedding::new(16)));

        // 模拟另一个 worker 已经认领
        assert!(queue.process(record.id).await);
        assert!(!queue.process(record.id).await);
    }

    #[tokio::test]
    async fn repeated_content_hits_embedding_cache() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        seed(&repository, "same text").await;
        seed(&repository, "same text").await;
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let queue = queue_with(repository.clone(), embedder.clone());

        assert_eq!(queue.drain_once().await, 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_loop_picks_up_notified_work() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let queue = queue_with(repository.clone(), Arc::new(HashEmbedding::new(16)));

        queue.start().await;
        queue.start().await;
        assert!(queue.is_running().await);

        let record = seed(&repository, "processed in background").await;
        queue.notify();

        assert_eq!(wait_for_terminal(&repository, record.id).await, EmbeddingStatus::Completed);

        queue.stop().await;
        assert!(!queue.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let queue = queue_with(repository, Arc::new(HashEmbedding::new(16)));
        queue.stop().await;
        assert!(!queue.is_running().await);

        queue.start().await;
        queue.stop().await;
        queue.start().await;
        assert!(queue.is_running().await);
        queue.stop().await;
    }

    #[tokio::test]
    async fn drain_once_ignores_messages_created_mid_pass() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let original = seed(&repository, "already queued").await;
        let embedder = Arc::new(InterleavingEmbedder {
            repository: repository.clone(),
            created: StdMutex::new(None),
        });
        let queue = queue_with(repository.clone(), embedder.clone());

        assert_eq!(queue.drain_once().await, 1);
        assert_eq!(
            repository.get(original.id).await.unwrap().unwrap().embedding_status,
            EmbeddingStatus::Completed
        );
        let late = embedder.created.lock().unwrap().expect("message created during pass");
        assert_eq!(
            repository.get(late).await.unwrap().unwrap().embedding_status,
            EmbeddingStatus::Pending
        );
        assert_eq!(repository.pending_ids(None).await.unwrap(), vec![late]);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_job() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let record = seed(&repository, "slow job").await;
        let embedder = Arc::new(GatedEmbedder {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let queue = queue_with(repository.clone(), embedder.clone());

        queue.start().await;
        embedder.entered.notified().await;

        let stopping = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        embedder.release.notify_one();
        stopping.await.unwrap();
        assert!(!queue.is_running().await);
        assert_eq!(
            repository.get(record.id).await.unwrap().unwrap().embedding_status,
            EmbeddingStatus::Completed
        );
    }

    #[tokio::test]
    async fn abandoned_claims_are_retried_after_lease() {
        let repository: SharedRepository = Arc::new(MemoryMessageRepository::new());
        let record = seed(&repository, "worker crashed here").await;
        // 另一个 worker 认领后退出，消息停在 processing
        assert!(repository
            .transition_status(record.id, EmbeddingStatus::Pending, EmbeddingStatus::Processing)
            .await
            .unwrap());

        let queue = Arc::new(
            build_queue(repository.clone(), Arc::new(HashEmbedding::new(16)))
                .with_claim_lease(Duration::from_millis(10)),
        );
        assert_eq!(queue.drain_once().await, 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.start().await;
        assert_eq!(wait_for_terminal(&repository, record.id).await, EmbeddingStatus::Completed);
        queue.stop().await;
    }
}
