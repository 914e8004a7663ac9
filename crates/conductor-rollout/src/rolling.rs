//! Rolling update: push the new version into the live environment in place
//! and wait for the scheduler to finish replacing instances.

use crate::context::{RolloutContext, RolloutPhase, RolloutReport};
use crate::error::RolloutResult;
use crate::slots::Slot;

pub(crate) async fn run(ctx: &mut RolloutContext) -> RolloutResult<RolloutReport> {
    let replicas = ctx.request().replicas;
    let live = ctx.call(ctx.names().live(ctx.scheduler())).await?;

    let (environment, created) = match live {
        Some((slot, _)) => {
            let environment = ctx.names().environment(slot);
            ctx.enter(RolloutPhase::Updating {
                environment: environment.clone(),
            })
            .await;
            let spec = ctx.environment_spec(&environment, replicas);
            ctx.call(ctx.scheduler().update_environment(&spec)).await?;
            (environment, false)
        }
        None => {
            // First rollout of this service here: nothing to update yet.
            let environment = ctx.names().environment(Slot::Blue);
            ctx.provision(&environment, replicas).await?;
            (environment, true)
        }
    };

    if let Err(e) = await_rollout(ctx, &environment, created).await {
        if created {
            ctx.discard(&environment).await;
        }
        return Err(e);
    }
    Ok(ctx.finish(environment))
}

async fn await_rollout(ctx: &mut RolloutContext, environment: &str, route: bool) -> RolloutResult<()> {
    ctx.enter(RolloutPhase::AwaitingRollout {
        environment: environment.to_string(),
    })
    .await;
    let timeout = ctx.settings().rollout_timeout;
    ctx.bounded(
        "wait_for_rollout",
        environment,
        timeout,
        ctx.scheduler().wait_for_rollout(environment, timeout),
    )
    .await?;

    if route {
        ctx.enter(RolloutPhase::Cutover {
            environment: environment.to_string(),
        })
        .await;
        ctx.call(ctx.route_all(environment)).await?;
    }
    Ok(())
}
