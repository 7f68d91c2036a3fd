//! # 任务动作
//!
//! 每个阶段的状态转换都是一个 [`Action`]：校验 → 执行 → 提交，任一步失败时调用 `on_fail`。
//! [`select_one_of`] 按一次求值的谓词在正常动作与取消动作之间二选一。
//!
//! 动作只在 `commit` 中修改任务池。执行失败时任务仍留在原队列，
//! 由调用方按错误分类决定重试还是置为 ERROR。

use async_trait::async_trait;

use evalflow_domain::{ErrorKind, SchedulerError, SchedulerResult};

#[async_trait]
pub trait Action: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn validate(&self, _input: &Self::Input) -> SchedulerResult<()> {
        Ok(())
    }

    async fn execute(&self, input: &Self::Input) -> SchedulerResult<Self::Output>;

    async fn commit(&self, input: &Self::Input, output: Self::Output) -> SchedulerResult<()>;

    async fn on_fail(&self, _input: &Self::Input, _error: &SchedulerError) {}
}

/// 依次执行校验、执行、提交
pub async fn run_action<A: Action + ?Sized>(action: &A, input: &A::Input) -> SchedulerResult<()> {
    let result = async {
        action.validate(input).await?;
        let output = action.execute(input).await?;
        action.commit(input, output).await
    }
    .await;

    if let Err(e) = &result {
        action.on_fail(input, e).await;
    }
    result
}

/// 实际执行的分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Happy,
    Cancel,
}

/// 谓词为真执行 `happy`，否则执行 `cancel`，谓词只求值一次
pub async fn select_one_of<H, C>(
    item: &H::Input,
    predicate: bool,
    happy: &H,
    cancel: &C,
) -> (Branch, SchedulerResult<()>)
where
    H: Action + ?Sized,
    C: Action<Input = H::Input> + ?Sized,
{
    if predicate {
        (Branch::Happy, run_action(happy, item).await)
    } else {
        (Branch::Cancel, run_action(cancel, item).await)
    }
}

/// 动作失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 留在原队列，下一次 tick 重试
    Retry,
    /// 置为 ERROR 并释放设备
    Fail,
    /// 只记录日志
    Ignore,
}

pub fn failure_policy(error: &SchedulerError) -> FailurePolicy {
    if error.is_retryable() {
        return FailurePolicy::Retry;
    }
    match error.kind() {
        ErrorKind::Validation => FailurePolicy::Fail,
        _ => FailurePolicy::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        executed: AtomicUsize,
        committed: AtomicUsize,
        failed: AtomicUsize,
        fail_with: Option<SchedulerError>,
    }

    #[async_trait]
    impl Action for Probe {
        type Input = i64;
        type Output = i64;

        fn name(&self) -> &'static str {
            "probe"
        }

        async fn execute(&self, input: &i64) -> SchedulerResult<i64> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(*input * 2),
            }
        }

        async fn commit(&self, _input: &i64, _output: i64) -> SchedulerResult<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_fail(&self, _input: &i64, _error: &SchedulerError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_exactly_one_branch_runs() {
        let happy = Probe::default();
        let cancel = Probe::default();

        let (branch, result) = select_one_of(&5, false, &happy, &cancel).await;
        assert_eq!(branch, Branch::Cancel);
        assert!(result.is_ok());
        assert_eq!(happy.executed.load(Ordering::SeqCst), 0);
        assert_eq!(cancel.committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_execute_skips_commit() {
        let happy = Probe {
            fail_with: Some(SchedulerError::executor("container runtime down")),
            ..Probe::default()
        };
        let cancel = Probe::default();

        let (branch, result) = select_one_of(&5, true, &happy, &cancel).await;
        assert_eq!(branch, Branch::Happy);
        let err = result.unwrap_err();
        assert_eq!(failure_policy(&err), FailurePolicy::Retry);
        assert_eq!(happy.committed.load(Ordering::SeqCst), 0);
        assert_eq!(happy.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_policy_by_kind() {
        let exhausted = SchedulerError::InsufficientResource {
            class: "GPU".to_string(),
            requested: 2,
            available: 1,
        };
        assert_eq!(failure_policy(&exhausted), FailurePolicy::Retry);
        assert_eq!(
            failure_policy(&SchedulerError::invalid_resource("too many GPUs")),
            FailurePolicy::Fail
        );
        assert_eq!(
            failure_policy(&SchedulerError::Internal("bug".to_string())),
            FailurePolicy::Ignore
        );
    }
}
