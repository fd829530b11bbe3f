use super::{LoadContext, RunParser};
use crate::error::Result;
use tracing::debug;

/// Final sweep: settles deferred claims and whatever pointers are left
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconcile;

impl RunParser for Reconcile {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        let (data, storage) = (ctx.data, ctx.storage);

        ctx.mapper
            .filter_pointers(|destination| !storage.is_within_run(data, destination));

        let conflicts = ctx.mapper.claim_deferred(storage, data)?;
        let remainder = ctx.mapper.claim_remainder(storage, data)?;
        debug!(
            "{} deferred conflicts, {} destinations claimed in the sweep",
            conflicts.len(),
            remainder
        );
        ctx.conflicts.extend(conflicts);
        Ok(())
    }
}
