//! 资源协调模块
//!
//! 该模块实现 Project 的协调逻辑：添加 finalizer、应用子对象、构建并比较资源清单、
//! 清理陈旧对象以及删除时的最终清理。协调器只修改传入的 Project 副本，
//! 持久化由控制器完成。
//!
//! 新清单只在上一份清单中的陈旧对象全部尝试删除之后才会提交。若在删除过程中
//! 中断，下一次协调会根据未变化的旧清单重新计算出相同的陈旧对象集合。

use std::time::Duration;

use kube::ResourceExt;
use projector_common::{ObjectHandle, ResourceInventory};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::children::{AppliedChild, ChildStage, Children};
use crate::conditions;
use crate::crd::{NamespacedObjectReference, Phase, Project, ProjectStatus, PROJECT_FINALIZER};
use crate::error::{DeletionErrors, Error, Result};
use crate::store::ObjectStore;

/// 协调结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 立即重新协调
    Requeue,
    /// 在给定间隔后重新协调
    RequeueAfter(Duration),
    /// 等待对象变化
    Done,
}

/// 本次协调对新清单的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// 子对象刚刚创建，等待下一次协调再提交清单
    Settling,
    /// 计算差异、清理并提交清单
    Committing,
}

impl SettleState {
    /// 尚未提交过清单且本次新建了子对象时进入等待
    pub fn decide(project: &Project, applied: &[AppliedChild]) -> Self {
        if project.inventory().is_none() && applied.iter().any(|c| c.created) {
            SettleState::Settling
        } else {
            SettleState::Committing
        }
    }
}

/// Project 协调器
pub struct Reconciler<S, C> {
    store: S,
    children: C,
}

impl<S: ObjectStore, C: Children> Reconciler<S, C> {
    pub fn new(store: S, children: C) -> Self {
        Self { store, children }
    }

    /// 协调一次 Project，在截止时间之前完成所有存储调用
    #[instrument(skip_all, fields(project = %project.name_any(), namespace = %project.namespace().unwrap_or_default()))]
    pub async fn reconcile(&self, project: &mut Project, deadline: Instant) -> Result<Outcome> {
        let phase = project.phase();
        debug!("开始协调 Project, 阶段: {:?}", phase);

        match phase {
            Phase::Initializing => {
                add_finalizer(project);
                info!("已添加 finalizer，等待重新协调");
                Ok(Outcome::Requeue)
            }
            Phase::Reconciling => {
                let result = self.reconcile_children(project, deadline).await;
                mark_failed(project, &result);
                result
            }
            Phase::Deleting => {
                let result = self.finalize(project, deadline).await;
                mark_failed(project, &result);
                result
            }
        }
    }

    /// 正常协调：应用子对象，等待或提交清单
    async fn reconcile_children(&self, project: &mut Project, deadline: Instant) -> Result<Outcome> {
        let generation = project.metadata.generation;
        let requeue_after = project.requeue_after()?;

        conditions::set(
            &mut status_mut(project).conditions,
            conditions::RECONCILING_CONDITION,
            true,
            conditions::PROGRESSING_REASON,
            "reconciliation in progress",
            generation,
        );

        // 在构建新清单之前保留旧清单的快照
        let old = project.inventory().cloned().unwrap_or_default();

        let applied = self.apply_children(project, deadline).await?;

        if SettleState::decide(project, &applied) == SettleState::Settling {
            let created = applied.iter().filter(|c| c.created).count();
            info!("新建了 {} 个子对象，等待其就绪后再提交清单", created);
            conditions::set(
                &mut status_mut(project).conditions,
                conditions::RECONCILING_CONDITION,
                true,
                conditions::WAITING_ON_RESOURCES_REASON,
                format!("waiting for {created} new objects"),
                generation,
            );
            return Ok(Outcome::Requeue);
        }

        let handles: Vec<ObjectHandle> = applied.iter().map(|c| c.handle.clone()).collect();
        let mut new = ResourceInventory::new();
        new.add(&handles)?;

        let stale = old.diff(&new)?;
        debug!("旧清单 {} 项，新清单 {} 项，陈旧 {} 项", old.len(), new.len(), stale.len());

        let failures = if project.spec.prune {
            self.delete_all(&stale, deadline).await?
        } else {
            if !stale.is_empty() {
                info!("清理已关闭，保留 {} 个陈旧对象", stale.len());
            }
            DeletionErrors::new()
        };

        // 删除失败的对象保留在清单中，下次协调继续重试
        new.add(&failures.handles())?;

        let repository_ref = applied
            .iter()
            .find(|c| c.handle.kind == "Repository")
            .map(|c| NamespacedObjectReference {
                name: c.handle.name.clone(),
                namespace: c.handle.namespace.clone(),
            });

        let status = status_mut(project);
        status.inventory = Some(new);
        if repository_ref.is_some() {
            status.repository_ref = repository_ref;
        }

        if !failures.is_empty() {
            warn!("{} 个陈旧对象删除失败", failures.len());
            return Err(Error::Deletion(failures));
        }

        status.observed_generation = generation.unwrap_or_default();
        conditions::remove(&mut status.conditions, conditions::RECONCILING_CONDITION);
        conditions::set(
            &mut status.conditions,
            conditions::READY_CONDITION,
            true,
            conditions::SUCCEEDED_REASON,
            "Reconciliation success",
            generation,
        );

        if requeue_after.is_zero() {
            info!("协调完成，等待对象变化");
            return Ok(Outcome::Done);
        }
        info!("协调完成，{:?} 后重新协调", requeue_after);
        Ok(Outcome::RequeueAfter(requeue_after))
    }

    /// 按顺序执行所有子对象阶段，任一阶段失败即中止
    async fn apply_children(&self, project: &Project, deadline: Instant) -> Result<Vec<AppliedChild>> {
        let mut applied = Vec::new();
        for (i, stage) in ChildStage::ALL.iter().copied().enumerate() {
            let pending = ChildStage::ALL.len() - i;
            if Instant::now() >= deadline {
                return Err(deadline_exceeded(pending, DeletionErrors::new()));
            }

            match timeout_at(deadline, self.children.apply(stage, project)).await {
                Err(_) => return Err(deadline_exceeded(pending, DeletionErrors::new())),
                Ok(Err(source)) => {
                    warn!("{} 协调失败: {}", stage, source);
                    return Err(Error::ChildReconcile { stage, source });
                }
                Ok(Ok(children)) => {
                    debug!("{} 阶段应用了 {} 个对象", stage, children.len());
                    applied.extend(children);
                }
            }
        }
        Ok(applied)
    }

    /// 删除 Project 时清理全部子对象
    async fn finalize(&self, project: &mut Project, deadline: Instant) -> Result<Outcome> {
        if !has_finalizer(project) {
            return Ok(Outcome::Done);
        }

        if project.spec.prune {
            if let Some(inventory) = project.inventory() {
                let handles = inventory.list()?;
                info!("删除 Project 的 {} 个子对象", handles.len());

                let failures = self.delete_all(&handles, deadline).await?;
                if !failures.is_empty() {
                    return Err(Error::Deletion(failures));
                }
            }
        } else {
            info!("清理已关闭，保留子对象");
        }

        remove_finalizer(project);
        info!("已移除 finalizer");
        Ok(Outcome::Done)
    }

    /// 逐个删除对象；对象不存在视为成功，其余失败累积后继续删除
    async fn delete_all(&self, handles: &[ObjectHandle], deadline: Instant) -> Result<DeletionErrors> {
        let mut failures = DeletionErrors::new();

        for (i, handle) in handles.iter().enumerate() {
            let pending = handles.len() - i;
            if Instant::now() >= deadline {
                return Err(deadline_exceeded(pending, failures));
            }

            match timeout_at(deadline, self.store.delete(handle)).await {
                Err(_) => return Err(deadline_exceeded(pending, failures)),
                Ok(Ok(())) => info!("已删除 {}", handle),
                Ok(Err(e)) if e.is_not_found() => debug!("对象已不存在: {}", handle),
                Ok(Err(e)) => {
                    warn!("删除 {} 失败: {}", handle, e);
                    failures.push(handle.clone(), e);
                }
            }
        }

        Ok(failures)
    }
}

fn deadline_exceeded(pending: usize, failures: DeletionErrors) -> Error {
    warn!("超出协调截止时间，尚有 {} 个操作未执行", pending);
    Error::Deadline { pending, failures }
}

/// 协调失败时把 Ready 条件置为 False
fn mark_failed(project: &mut Project, result: &Result<Outcome>) {
    if let Err(e) = result {
        let generation = project.metadata.generation;
        conditions::set(
            &mut status_mut(project).conditions,
            conditions::READY_CONDITION,
            false,
            e.reason(),
            e.to_string(),
            generation,
        );
    }
}

fn status_mut(project: &mut Project) -> &mut ProjectStatus {
    project.status.get_or_insert_with(ProjectStatus::default)
}

fn has_finalizer(project: &Project) -> bool {
    project.finalizers().iter().any(|f| f == PROJECT_FINALIZER)
}

fn add_finalizer(project: &mut Project) {
    if !has_finalizer(project) {
        project.finalizers_mut().push(PROJECT_FINALIZER.to_string());
    }
}

fn remove_finalizer(project: &mut Project) {
    project.finalizers_mut().retain(|f| f != PROJECT_FINALIZER);
}
