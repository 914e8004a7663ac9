//! Canary: run a small copy of the new version beside the stable one, send
//! it a slice of traffic, and promote it only if its metrics hold up.

use conductor_core::{CanaryMetrics, CanaryThresholds, TrafficWeight};
use conductor_health::CanaryVerdict;

use crate::context::{RolloutContext, RolloutPhase, RolloutReport};
use crate::error::{RolloutError, RolloutResult};
use crate::slots::Slot;
use crate::strategy::canary_replicas;

pub(crate) async fn run(ctx: &mut RolloutContext) -> RolloutResult<RolloutReport> {
    let replicas = ctx.request().replicas;
    let live = ctx.call(ctx.names().live(ctx.scheduler())).await?;
    let stable = live.map(|(slot, _)| ctx.names().environment(slot));
    let canary = ctx
        .names()
        .environment(live.map_or(Slot::Blue, |(slot, _)| slot.other()));

    ctx.clear_stale(&canary).await?;
    ctx.provision(&canary, canary_replicas(replicas)).await?;

    let outcome = match observe(ctx, &canary, stable.as_deref()).await {
        Ok(verdict) if verdict.promote => {
            ctx.record_verdict(verdict);
            promote(ctx, &canary, replicas).await
        }
        Ok(verdict) => Err(RolloutError::CanaryRejected {
            reason: rejection_reason(ctx.thresholds(), verdict.metrics.as_ref()),
            metrics: verdict.metrics,
        }),
        Err(e) => Err(e),
    };

    if let Err(e) = outcome {
        abort(ctx, &canary, stable.as_deref()).await;
        return Err(e);
    }

    ctx.enter(RolloutPhase::Cutover {
        environment: canary.clone(),
    })
    .await;
    if let Err(e) = ctx.route_all(&canary).await {
        abort(ctx, &canary, stable.as_deref()).await;
        return Err(e.into());
    }

    if let Some(stable) = stable {
        ctx.retire(&stable).await;
    }
    Ok(ctx.finish(canary))
}

/// Wait for the canary, split traffic, and sample its metrics.
async fn observe(
    ctx: &mut RolloutContext,
    canary: &str,
    stable: Option<&str>,
) -> RolloutResult<CanaryVerdict> {
    ctx.await_ready(canary).await?;

    let percent = match stable {
        Some(_) => ctx.settings().canary_traffic_percent.min(100),
        None => 100,
    };
    let mut weights = vec![TrafficWeight::new(canary, percent)];
    if let Some(stable) = stable {
        weights.insert(0, TrafficWeight::new(stable, 100 - percent));
    }
    ctx.enter(RolloutPhase::CanaryObserving {
        environment: canary.to_string(),
        percent,
    })
    .await;
    ctx.call(ctx.scheduler().route_traffic(ctx.names().route(), &weights))
        .await?;

    let verdict = ctx
        .canary()
        .evaluate(canary, ctx.thresholds(), ctx.cancel_token())
        .await?;
    Ok(verdict)
}

async fn promote(ctx: &mut RolloutContext, canary: &str, replicas: u32) -> RolloutResult<()> {
    ctx.enter(RolloutPhase::CanaryPromoting {
        environment: canary.to_string(),
        replicas,
    })
    .await;
    ctx.call(ctx.scheduler().scale(canary, replicas)).await?;
    ctx.await_ready(canary).await?;
    ctx.cancel_token().check()?;
    Ok(())
}

/// Give the stable environment its traffic back and drop the canary.
async fn abort(ctx: &RolloutContext, canary: &str, stable: Option<&str>) {
    if let Some(stable) = stable {
        if let Err(e) = ctx.route_all(stable).await {
            ctx.logger()
                .warn(format!("could not restore traffic to {stable}: {e}"))
                .await;
        }
    }
    ctx.discard(canary).await;
}

fn rejection_reason(thresholds: &CanaryThresholds, metrics: Option<&CanaryMetrics>) -> String {
    let Some(m) = metrics else {
        return "no metrics sample succeeded".to_string();
    };
    let mut reasons = Vec::new();
    if m.error_rate > thresholds.max_error_rate {
        reasons.push(format!(
            "error rate {:.2}% > {:.2}%",
            m.error_rate, thresholds.max_error_rate
        ));
    }
    if m.average_response_time_ms > thresholds.max_response_time_ms as f64 {
        reasons.push(format!(
            "response time {:.0}ms > {}ms",
            m.average_response_time_ms, thresholds.max_response_time_ms
        ));
    }
    if m.request_count < thresholds.min_request_count {
        reasons.push(format!(
            "{} requests < {}",
            m.request_count, thresholds.min_request_count
        ));
    }
    reasons.join(", ")
}
