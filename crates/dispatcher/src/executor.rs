use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use edge_scheduler_core::SchedulerResult;

use crate::context::TaskContext;

/// 任务执行器
///
/// 执行器返回后，若任务仍处于执行阶段，工作池会将其置为成功；
/// 返回错误或发生panic时置为失败。执行器自行设置的终止阶段会被保留。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: Arc<TaskContext>) -> SchedulerResult<()>;
}

type ExecutorBuilder = Arc<dyn Fn() -> Box<dyn TaskExecutor> + Send + Sync>;

/// 执行器工厂，每次提交任务时创建新的执行器实例
#[derive(Clone)]
pub struct ExecutorFactory {
    id: String,
    builder: ExecutorBuilder,
}

impl ExecutorFactory {
    pub fn new<F>(id: impl Into<String>, builder: F) -> Self
    where
        F: Fn() -> Box<dyn TaskExecutor> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            builder: Arc::new(builder),
        }
    }

    /// 以异步闭包构造执行器工厂
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<TaskContext>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        Self::new(id, move || Box::new(FnExecutor(f.clone())))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn create(&self) -> Box<dyn TaskExecutor> {
        (self.builder)()
    }
}

impl std::fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorFactory").field("id", &self.id).finish()
    }
}

pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Arc<TaskContext>) -> Fut + Send + Sync,
    Fut: Future<Output = SchedulerResult<()>> + Send,
{
    async fn execute(&self, ctx: Arc<TaskContext>) -> SchedulerResult<()> {
        (self.0)(ctx).await
    }
}
