/// Background task implementations
use crate::{context::AppContext, error::BdrsResult};

/// Pick up directory changes made outside this instance
pub async fn poll_directory(ctx: &AppContext) -> BdrsResult<bool> {
    ctx.engine.poll_directory_version().await
}

/// Replay invalidations that failed after a committed write
pub fn reconcile(ctx: &AppContext) -> BdrsResult<usize> {
    ctx.engine.reconcile()
}

/// Health check - verify the store is reachable
pub async fn health_check(ctx: &AppContext) -> BdrsResult<()> {
    ctx.engine.ping().await
}
