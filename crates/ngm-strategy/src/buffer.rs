//! Buffer executor: keep idle pool capacity between `low` and `high`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use ngm_state::{NodeGroupAction, NodeGroupMgrStrategy};

use crate::error::StrategyResult;
use crate::executor::*;
use crate::time_mode;

/// Occupancy-threshold policy, optionally replaced by time windows for
/// scale-down.
pub struct BufferExecutor {
    ctx: ExecutorContext,
}

impl BufferExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StrategyExecutor for BufferExecutor {
    async fn is_able_to_scale_down(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<ScaleDownCheck> {
        require_elastic_groups(strategy)?;

        if let Some(mode) = &strategy.strategy.time_mode {
            let window = time_mode::evaluate(mode, now)?;
            if !window.should_scale_in() {
                return Ok(ScaleDownCheck::none());
            }
            let num = self.ctx.elastic_surplus(strategy)?;
            debug!(strategy = %strategy.name, num, "time window closed");
            return Ok(ScaleDownCheck::release(num));
        }

        let pool = self.ctx.pool_of(strategy).await?;
        let occupancy = Occupancy::of(&pool);
        if occupancy.total == 0 {
            return Ok(ScaleDownCheck::none());
        }

        let low = strategy.strategy.buffer.low;
        if occupancy.idle_ratio() >= low {
            return Ok(ScaleDownCheck::none());
        }
        let num = occupancy.reserved(low).saturating_sub(occupancy.idle);
        debug!(
            strategy = %strategy.name,
            idle = occupancy.idle,
            total = occupancy.total,
            low,
            num,
            "idle capacity below low threshold"
        );
        Ok(ScaleDownCheck::release(num))
    }

    async fn is_able_to_scale_up(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<ScaleUpCheck> {
        require_elastic_groups(strategy)?;

        if let Some(mode) = &strategy.strategy.time_mode {
            if !time_mode::evaluate(mode, now)?.in_scale_out {
                return Ok(ScaleUpCheck::none());
            }
            if self.ctx.check_if_task_executing(strategy, now)? {
                debug!(strategy = %strategy.name, "scale-up held back by drain task");
                return Ok(ScaleUpCheck::none());
            }
        }

        let pool = self.ctx.pool_of(strategy).await?;
        let check = surplus_above_high(strategy, Occupancy::of(&pool), &pool, now);
        if check.able {
            debug!(strategy = %strategy.name, num = check.num, total = check.total, "idle capacity above high threshold");
        }
        Ok(check)
    }

    async fn handle_node_metadata(&self, _now: DateTime<Utc>) -> StrategyResult<()> {
        Ok(())
    }

    async fn create_node_update_action(
        &self,
        _strategy: &NodeGroupMgrStrategy,
        _action: &NodeGroupAction,
        _now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::testutil::*;
    use chrono::{Duration, TimeZone};
    use ngm_state::{CreateOptions, StrategyType, TimeMode, TimePeriod};

    fn buffer_strategy() -> NodeGroupMgrStrategy {
        let mut s = strategy("s", StrategyType::Buffer);
        s.strategy.buffer.low = 10;
        s.strategy.buffer.high = 15;
        s.strategy.max_idle_delay = 10;
        s.strategy.min_scale_up_size = 5;
        s
    }

    #[tokio::test]
    async fn scales_up_surplus_above_high() {
        let h = Harness::new().await;
        let now = at(100_000);
        h.put_pool(40, 60, now - Duration::hours(1)).await;
        let exec = BufferExecutor::new(h.ctx.clone());

        let check = exec.is_able_to_scale_up(&buffer_strategy(), now).await.unwrap();
        assert_eq!((check.num, check.able, check.total), (25, true, 100));
    }

    #[tokio::test]
    async fn scale_up_waits_for_stable_pool() {
        let h = Harness::new().await;
        let now = at(100_000);
        h.put_pool(40, 60, now - Duration::minutes(3)).await;
        let exec = BufferExecutor::new(h.ctx.clone());

        let check = exec.is_able_to_scale_up(&buffer_strategy(), now).await.unwrap();
        assert!(!check.able);
    }

    #[tokio::test]
    async fn scale_up_respects_min_size() {
        let h = Harness::new().await;
        let now = at(100_000);
        // idle 18 of 100, reserved(high) 15, surplus 3 < 5
        h.put_pool(18, 82, now - Duration::hours(1)).await;
        let exec = BufferExecutor::new(h.ctx.clone());

        let check = exec.is_able_to_scale_up(&buffer_strategy(), now).await.unwrap();
        assert!(!check.able);
    }

    #[tokio::test]
    async fn scales_down_below_low() {
        let h = Harness::new().await;
        let now = at(100_000);
        // idle 4 of 100, reserved(low) 10
        h.put_pool(4, 96, now).await;
        let exec = BufferExecutor::new(h.ctx.clone());

        let check = exec.is_able_to_scale_down(&buffer_strategy(), now).await.unwrap();
        assert_eq!(check, ScaleDownCheck { num: 6, able: true });
    }

    #[tokio::test]
    async fn between_thresholds_is_stable() {
        let h = Harness::new().await;
        let now = at(100_000);
        h.put_pool(12, 88, now - Duration::hours(1)).await;
        let exec = BufferExecutor::new(h.ctx.clone());
        let s = buffer_strategy();

        assert!(!exec.is_able_to_scale_down(&s, now).await.unwrap().able);
        assert!(!exec.is_able_to_scale_up(&s, now).await.unwrap().able);
    }

    #[tokio::test]
    async fn empty_pool_makes_no_decision() {
        let h = Harness::new().await;
        let now = at(100_000);
        h.put_pool(0, 0, now - Duration::hours(1)).await;
        let exec = BufferExecutor::new(h.ctx.clone());
        let s = buffer_strategy();

        assert_eq!(exec.is_able_to_scale_down(&s, now).await.unwrap(), ScaleDownCheck::none());
        assert_eq!(exec.is_able_to_scale_up(&s, now).await.unwrap(), ScaleUpCheck::none());
    }

    #[tokio::test]
    async fn missing_elastic_groups_is_an_error() {
        let h = Harness::new().await;
        let exec = BufferExecutor::new(h.ctx.clone());
        let mut s = buffer_strategy();
        s.elastic_node_groups.clear();

        assert!(matches!(
            exec.is_able_to_scale_down(&s, at(0)).await,
            Err(StrategyError::NoElasticNodeGroups(_))
        ));
    }

    fn with_fixed_window(mut s: NodeGroupMgrStrategy) -> NodeGroupMgrStrategy {
        s.strategy.time_mode = Some(TimeMode {
            time_periods: vec![TimePeriod::Fixed {
                scale_out_time: Utc.with_ymd_and_hms(2026, 3, 4, 8, 0, 0).unwrap(),
                scale_in_time: Utc.with_ymd_and_hms(2026, 3, 4, 20, 0, 0).unwrap(),
            }],
        });
        s
    }

    #[tokio::test]
    async fn time_mode_releases_elastic_surplus_after_window() {
        let h = Harness::new().await;
        h.put_group("ng-a", 5, 1).await;
        h.put_group("ng-b", 3, 2).await;
        let exec = BufferExecutor::new(h.ctx.clone());
        let s = with_fixed_window(buffer_strategy());

        let night = Utc.with_ymd_and_hms(2026, 3, 4, 22, 0, 0).unwrap();
        let check = exec.is_able_to_scale_down(&s, night).await.unwrap();
        assert_eq!(check, ScaleDownCheck { num: 5, able: true });

        let noon = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        assert!(!exec.is_able_to_scale_down(&s, noon).await.unwrap().able);
    }

    #[tokio::test]
    async fn time_mode_blocks_scale_up_outside_window_or_while_draining() {
        let h = Harness::new().await;
        let noon = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        h.put_pool(40, 60, noon - Duration::hours(1)).await;
        let exec = BufferExecutor::new(h.ctx.clone());
        let s = with_fixed_window(buffer_strategy());

        assert!(exec.is_able_to_scale_up(&s, noon).await.unwrap().able);

        let night = Utc.with_ymd_and_hms(2026, 3, 4, 22, 0, 0).unwrap();
        assert!(!exec.is_able_to_scale_up(&s, night).await.unwrap().able);

        let t = task("t", "s", noon + Duration::minutes(2));
        h.ctx.storage.create_task(&t, &CreateOptions::default()).unwrap();
        assert!(!exec.is_able_to_scale_up(&s, noon).await.unwrap().able);
    }
}
