//! Blue-green: bring the new version up beside the live one at full size,
//! gate it on readiness and health, then move all traffic at once.

use crate::context::{RolloutContext, RolloutPhase, RolloutReport};
use crate::error::RolloutResult;
use crate::slots::Slot;

pub(crate) async fn run(ctx: &mut RolloutContext) -> RolloutResult<RolloutReport> {
    let replicas = ctx.request().replicas;
    let live = ctx.call(ctx.names().live(ctx.scheduler())).await?;
    let outgoing = live.map(|(slot, _)| ctx.names().environment(slot));
    let staged = ctx
        .names()
        .environment(live.map_or(Slot::Blue, |(slot, _)| slot.other()));

    ctx.clear_stale(&staged).await?;
    ctx.provision(&staged, replicas).await?;

    if let Err(e) = gate(ctx, &staged).await {
        ctx.discard(&staged).await;
        return Err(e);
    }

    ctx.enter(RolloutPhase::Cutover {
        environment: staged.clone(),
    })
    .await;
    if let Err(e) = ctx.route_all(&staged).await {
        ctx.discard(&staged).await;
        return Err(e.into());
    }

    if let Some(outgoing) = outgoing {
        ctx.enter(RolloutPhase::Draining {
            environment: outgoing.clone(),
        })
        .await;
        let grace = ctx.settings().blue_green_grace;
        if ctx.cancel_token().sleep(grace).await.is_err() {
            ctx.logger()
                .info("cancelled during drain, deleting old environment now")
                .await;
        }
        ctx.retire(&outgoing).await;
    }

    Ok(ctx.finish(staged))
}

/// Readiness, then health. Cancellation is honored up to here.
async fn gate(ctx: &mut RolloutContext, staged: &str) -> RolloutResult<()> {
    ctx.await_ready(staged).await?;

    ctx.enter(RolloutPhase::HealthGate {
        environment: staged.to_string(),
    })
    .await;
    let attempts = ctx
        .health()
        .wait_healthy(staged, &ctx.request().health_check, ctx.cancel_token())
        .await?;
    ctx.logger()
        .info(format!("{staged} healthy after {attempts} probe(s)"))
        .await;

    ctx.cancel_token().check()?;
    Ok(())
}
