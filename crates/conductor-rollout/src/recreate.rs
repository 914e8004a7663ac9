//! Recreate: tear the live environment down, then start the new version in
//! its place. Causes downtime between the two.

use crate::context::{RolloutContext, RolloutPhase, RolloutReport};
use crate::error::RolloutResult;
use crate::slots::Slot;

pub(crate) async fn run(ctx: &mut RolloutContext) -> RolloutResult<RolloutReport> {
    let replicas = ctx.request().replicas;
    let live = ctx.call(ctx.names().live(ctx.scheduler())).await?;
    let environment = ctx
        .names()
        .environment(live.map_or(Slot::Blue, |(slot, _)| slot));

    if live.is_some() {
        ctx.enter(RolloutPhase::Retiring {
            environment: environment.clone(),
        })
        .await;
        ctx.call(ctx.scheduler().delete_environment(&environment))
            .await?;
        ctx.await_termination(&environment).await?;
    }

    ctx.provision(&environment, replicas).await?;
    if let Err(e) = ctx.await_ready(&environment).await {
        ctx.discard(&environment).await;
        return Err(e);
    }

    if live.is_none() {
        ctx.enter(RolloutPhase::Cutover {
            environment: environment.clone(),
        })
        .await;
        if let Err(e) = ctx.call(ctx.route_all(&environment)).await {
            ctx.discard(&environment).await;
            return Err(e);
        }
    }

    Ok(ctx.finish(environment))
}
