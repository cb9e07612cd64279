//! 内置顾问

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::{Adviser, AdviserResponse, AdviserType, AdvisingEvent};
use crate::core::{OrchestrationError, Result};
use crate::execution::Status;

/// 内置顾问的参数在查询前已由 `check_parameters` 校验
fn parsed<T>(event: &AdvisingEvent) -> Option<T>
where
    T: DeserializeOwned + Default,
{
    event.parameters::<T>().ok()
}

fn decode<T: DeserializeOwned>(parameters: &Value) -> serde_json::Result<()> {
    serde_json::from_value::<T>(parameters.clone()).map(|_| ())
}

/// 校验内置顾问的参数；自定义顾问的参数由其自身负责
pub fn check_parameters(adviser_type: &AdviserType, parameters: &Value) -> Result<()> {
    if parameters.is_null() {
        return Ok(());
    }
    let checked = match adviser_type {
        AdviserType::OnSuccess => decode::<OnSuccessParameters>(parameters),
        AdviserType::OnFail => decode::<OnFailParameters>(parameters),
        AdviserType::OnAbort => decode::<OnAbortParameters>(parameters),
        AdviserType::Retry => decode::<RetryParameters>(parameters),
        AdviserType::Ignore => decode::<IgnoreParameters>(parameters),
        AdviserType::NextStep => decode::<NextStepParameters>(parameters),
        AdviserType::Custom(_) => Ok(()),
    };
    checked.map_err(|e| OrchestrationError::InvalidAdviserParameters {
        adviser: adviser_type.to_string(),
        reason: e.to_string(),
    })
}

fn next_step(next_node_id: Option<String>, event: &AdvisingEvent) -> Result<AdviserResponse> {
    next_node_id
        .map(|next_node_id| AdviserResponse::NextStep { next_node_id })
        .ok_or_else(|| OrchestrationError::NoAdviserFound(event.node_execution_id.clone()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OnSuccessParameters {
    next_node_id: Option<String>,
}

/// 成功（或跳过）后进入下一节点
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.to_status.is_positive()
            && parsed::<OnSuccessParameters>(event).is_some_and(|p| p.next_node_id.is_some())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: OnSuccessParameters = event.parameters()?;
        next_step(params.next_node_id, event)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OnFailParameters {
    next_node_id: Option<String>,
    statuses: Vec<Status>,
}

impl Default for OnFailParameters {
    fn default() -> Self {
        Self {
            next_node_id: None,
            statuses: vec![Status::Failed, Status::Expired],
        }
    }
}

/// 失败后转到补救节点
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        parsed::<OnFailParameters>(event)
            .is_some_and(|p| p.next_node_id.is_some() && p.statuses.contains(&event.to_status))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: OnFailParameters = event.parameters()?;
        next_step(params.next_node_id, event)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OnAbortParameters {
    statuses: Vec<Status>,
    /// true 时通过 ABORT 中断结束计划，false 时以节点状态直接结束
    abort: bool,
}

impl Default for OnAbortParameters {
    fn default() -> Self {
        Self {
            statuses: vec![Status::Aborted],
            abort: false,
        }
    }
}

/// 命中给定状态时结束整个计划
pub struct OnAbortAdviser;

impl Adviser for OnAbortAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        parsed::<OnAbortParameters>(event).is_some_and(|p| p.statuses.contains(&event.to_status))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: OnAbortParameters = event.parameters()?;
        Ok(AdviserResponse::EndPlan {
            is_abort: params.abort,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RetryParameters {
    retry_count: usize,
    /// 第 i 次重试前的等待；不足时沿用最后一个
    wait_intervals_ms: Vec<u64>,
    statuses: Vec<Status>,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            retry_count: 0,
            wait_intervals_ms: Vec::new(),
            statuses: vec![Status::Failed, Status::Expired],
        }
    }
}

/// 失败重试，次数用尽后交给下一个顾问
pub struct RetryAdviser {
    default_wait_ms: u64,
}

impl RetryAdviser {
    pub fn new(default_wait_ms: u64) -> Self {
        Self { default_wait_ms }
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        parsed::<RetryParameters>(event).is_some_and(|p| {
            p.statuses.contains(&event.to_status) && event.retry_ids.len() < p.retry_count
        })
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: RetryParameters = event.parameters()?;
        let attempt = event.retry_ids.len();
        let wait_interval_ms = params
            .wait_intervals_ms
            .get(attempt)
            .or(params.wait_intervals_ms.last())
            .copied()
            .unwrap_or(self.default_wait_ms);
        Ok(AdviserResponse::Retry { wait_interval_ms })
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct IgnoreParameters {
    next_node_id: Option<String>,
    statuses: Vec<Status>,
}

impl Default for IgnoreParameters {
    fn default() -> Self {
        Self {
            next_node_id: None,
            statuses: vec![Status::Failed],
        }
    }
}

/// 忽略失败，继续下一节点或以成功结束分支
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        parsed::<IgnoreParameters>(event).is_some_and(|p| p.statuses.contains(&event.to_status))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: IgnoreParameters = event.parameters()?;
        Ok(match params.next_node_id {
            Some(next_node_id) => AdviserResponse::NextStep { next_node_id },
            None => AdviserResponse::MarkStatus {
                status: Status::Succeeded,
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NextStepParameters {
    next_node_id: Option<String>,
}

/// 不论结果都进入下一节点
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.to_status.is_terminal()
            && event.to_status != Status::Discarded
            && parsed::<NextStepParameters>(event).is_some_and(|p| p.next_node_id.is_some())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let params: NextStepParameters = event.parameters()?;
        next_step(params.next_node_id, event)
    }
}
