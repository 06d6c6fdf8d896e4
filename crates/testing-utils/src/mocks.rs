//! 仓储和外部服务的内存实现
//!
//! 不需要数据库和网络即可测试调度与修复流程。

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::entities::{Batch, BatchPhase, BatchStatus, LogLevel, ProcessLog, Task, TaskStatus};
use tablefix_domain::ports::provider::{Completion, CompletionProvider, ProviderError, ProviderKind};
use tablefix_domain::ports::storage::DocumentStore;
use tablefix_domain::repositories::{AuditTotals, BatchRepository, ProcessLogRepository, TaskRepository};
use tablefix_domain::value_objects::{BatchCounterDelta, BatchProgress, NewTask, TaskUpdate, TokenUsage};
use tokio::sync::Semaphore;

/// BatchRepository的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockBatchRepository {
    batches: Arc<Mutex<HashMap<String, Batch>>>,
}

impl MockBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Batch> {
        self.batches.lock().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().values().cloned().collect()
    }

    /// 同步地取消非终态批次，供测试在其他调用中途插入取消
    pub fn cancel_now(&self, id: &str) -> bool {
        let mut batches = self.batches.lock().unwrap();
        match batches.get_mut(id) {
            Some(batch) if !batch.status.is_terminal() => {
                let phase = batch.phase;
                set_status(batch, BatchStatus::Cancelled, phase);
                batch.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    fn with_batch<T>(&self, id: &str, f: impl FnOnce(&mut Batch) -> T) -> TableFixResult<T> {
        let mut batches = self.batches.lock().unwrap();
        let batch = batches
            .get_mut(id)
            .ok_or_else(|| TableFixError::BatchNotFound { id: id.to_string() })?;
        let result = f(batch);
        batch.updated_at = Utc::now();
        Ok(result)
    }
}

fn set_status(batch: &mut Batch, status: BatchStatus, phase: BatchPhase) {
    batch.status = status;
    batch.phase = phase;
    if status.is_terminal() && batch.completed_at.is_none() {
        batch.completed_at = Some(Utc::now());
    }
}

#[async_trait]
impl BatchRepository for MockBatchRepository {
    async fn create(&self, batch: &Batch) -> TableFixResult<Batch> {
        self.batches
            .lock()
            .unwrap()
            .insert(batch.id.clone(), batch.clone());
        Ok(batch.clone())
    }

    async fn find_by_id(&self, id: &str) -> TableFixResult<Option<Batch>> {
        Ok(self.get(id))
    }

    async fn find_all(&self) -> TableFixResult<Vec<Batch>> {
        let mut all: Vec<Batch> = self.batches.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn find_by_status(&self, statuses: &[BatchStatus]) -> TableFixResult<Vec<Batch>> {
        let mut found: Vec<Batch> = self
            .batches
            .lock()
            .unwrap()
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn update_status(
        &self,
        id: &str,
        status: BatchStatus,
        phase: BatchPhase,
    ) -> TableFixResult<()> {
        self.with_batch(id, |batch| set_status(batch, status, phase))
    }

    async fn try_transition(
        &self,
        id: &str,
        from: (BatchStatus, BatchPhase),
        to: (BatchStatus, BatchPhase),
    ) -> TableFixResult<bool> {
        let mut batches = self.batches.lock().unwrap();
        match batches.get_mut(id) {
            Some(batch) if (batch.status, batch.phase) == from => {
                set_status(batch, to.0, to.1);
                batch.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cancelled(&self, id: &str) -> TableFixResult<bool> {
        Ok(self.cancel_now(id))
    }

    async fn mark_failed(&self, id: &str, error: &str) -> TableFixResult<()> {
        self.with_batch(id, |batch| {
            let phase = batch.phase;
            set_status(batch, BatchStatus::Failed, phase);
            batch.error_message = Some(error.to_string());
        })
    }

    async fn set_audit_totals(&self, id: &str, totals: AuditTotals) -> TableFixResult<()> {
        self.with_batch(id, |batch| {
            batch.total_questions = totals.questions;
            batch.total_tables = totals.tables;
            batch.total_issues = totals.issues;
            batch.total_tasks = totals.tasks;
        })
    }

    async fn increment_counters(&self, id: &str, delta: BatchCounterDelta) -> TableFixResult<()> {
        self.with_batch(id, |batch| {
            batch.completed_tasks += delta.completed;
            batch.failed_tasks += delta.failed;
            batch.total_tokens += delta.tokens;
            batch.total_cost += delta.cost;
        })
    }

    async fn set_output(&self, id: &str, output_path: Option<&str>) -> TableFixResult<()> {
        self.with_batch(id, |batch| batch.output_path = output_path.map(str::to_string))
    }
}

/// TaskRepository的内存实现，更新时执行与SQLite实现相同的校验
#[derive(Debug, Clone)]
pub struct MockTaskRepository {
    tasks: Arc<Mutex<HashMap<i64, Task>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let max_id = tasks.iter().map(|t| t.id).max().unwrap_or(0);
        Self {
            tasks: Arc::new(Mutex::new(tasks.into_iter().map(|t| (t.id, t)).collect())),
            next_id: Arc::new(Mutex::new(max_id + 1)),
        }
    }

    pub fn get(&self, id: i64) -> Option<Task> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut all: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }
}

impl Default for MockTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create_many(&self, tasks: &[NewTask]) -> TableFixResult<Vec<Task>> {
        let now = Utc::now();
        let mut stored = self.tasks.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task = task.clone().into_task(*next_id, now);
            *next_id += 1;
            stored.insert(task.id, task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> TableFixResult<Option<Task>> {
        Ok(self.get(id))
    }

    async fn update(&self, id: i64, update: &TaskUpdate) -> TableFixResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&id).ok_or(TableFixError::TaskNotFound { id })?;
        update.validate(task.status)?;
        update.apply_to(task, Utc::now());
        Ok(task.clone())
    }

    async fn find_by_batch(
        &self,
        batch_id: &str,
        statuses: Option<&[TaskStatus]>,
    ) -> TableFixResult<Vec<Task>> {
        let mut found: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.batch_id == batch_id)
            .filter(|t| statuses.map_or(true, |s| s.contains(&t.status)))
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.question_index, t.table_index, t.id));
        Ok(found)
    }

    async fn progress(&self, batch_id: &str) -> TableFixResult<BatchProgress> {
        let mut progress = BatchProgress::default();
        for task in self.tasks.lock().unwrap().values() {
            if task.batch_id == batch_id {
                progress.add(task.status, 1);
            }
        }
        Ok(progress)
    }
}

/// ProcessLogRepository的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockProcessLogRepository {
    logs: Arc<Mutex<Vec<ProcessLog>>>,
}

impl MockProcessLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, batch_id: &str) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.batch_id == batch_id)
            .map(|l| l.message.clone())
            .collect()
    }
}

#[async_trait]
impl ProcessLogRepository for MockProcessLogRepository {
    async fn append(
        &self,
        batch_id: &str,
        task_id: Option<i64>,
        level: LogLevel,
        message: &str,
    ) -> TableFixResult<ProcessLog> {
        let mut logs = self.logs.lock().unwrap();
        let log = ProcessLog {
            id: logs.len() as i64 + 1,
            batch_id: batch_id.to_string(),
            task_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        logs.push(log.clone());
        Ok(log)
    }

    async fn find_by_batch(
        &self,
        batch_id: &str,
        level: Option<LogLevel>,
    ) -> TableFixResult<Vec<ProcessLog>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.batch_id == batch_id && level.map_or(true, |lv| l.level == lv))
            .cloned()
            .collect())
    }
}

type ReadHook = Arc<dyn Fn(&str) + Send + Sync>;

/// 内存文件存储，可模拟写入失败，也可以在读取时执行钩子
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    files: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<Mutex<bool>>,
    read_hook: Arc<Mutex<Option<ReadHook>>>,
}

impl std::fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentStore")
            .field("paths", &self.paths())
            .field("fail_writes", &*self.fail_writes.lock().unwrap())
            .finish()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
        self
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    /// 每次读取前调用 `hook(path)`
    pub fn on_read(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.read_hook.lock().unwrap() = Some(Arc::new(hook));
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, path: &str) -> TableFixResult<String> {
        let hook = self.read_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(path);
        }
        self.get(path)
            .ok_or_else(|| TableFixError::Storage(format!("文件不存在: {path}")))
    }

    async fn write(&self, path: &str, contents: &str) -> TableFixResult<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(TableFixError::Storage(format!("磁盘已满: {path}")));
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }
}

type Responder = Box<dyn Fn(&str) -> Result<Completion, ProviderError> + Send + Sync>;

/// 脚本化的模型服务
///
/// 先按顺序返回预设的结果，脚本用完后交给 `otherwise` 处理函数。
/// 设置闸门后每次调用需要先获得一个许可，测试可以借此控制调用的完成时机。
pub struct ScriptedProvider {
    name: String,
    kind: ProviderKind,
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    otherwise: Option<Responder>,
    prompts: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            script: Mutex::new(VecDeque::new()),
            otherwise: None,
            prompts: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn primary() -> Self {
        Self::new("primary-mock", ProviderKind::Primary)
    }

    pub fn pool() -> Self {
        Self::new("pool-mock", ProviderKind::Pool)
    }

    pub fn then_ok(self, text: &str, usage: TokenUsage) -> Self {
        self.script.lock().unwrap().push_back(Ok(Completion {
            text: text.to_string(),
            usage,
        }));
        self
    }

    pub fn then_err(self, error: ProviderError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn otherwise(
        mut self,
        responder: impl Fn(&str) -> Result<Completion, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.otherwise = Some(Box::new(responder));
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            permit.forget();
        }

        self.prompts.lock().unwrap().push(prompt.to_string());
        let scripted = self.script.lock().unwrap().pop_front();
        match (scripted, &self.otherwise) {
            (Some(result), _) => result,
            (None, Some(responder)) => responder(prompt),
            (None, None) => Err(ProviderError::Transport(format!(
                "{}: 没有预设的响应",
                self.name
            ))),
        }
    }
}
