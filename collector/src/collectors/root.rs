//! Collection that needs the superuser.

use super::{accounting, run_commands, Context};
use crate::error::Result;
use crate::workers::{RecordEmitter, RootTasks};
use async_trait::async_trait;
use config::Platform;
use tracing::info;

/// Privileged collection: process accounting and the catalog's
/// `root_commands`, emitted as `cmd_root/` records.
#[derive(Debug, Clone)]
pub struct PrivilegedCollection {
    ctx: Context,
}

impl PrivilegedCollection {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RootTasks for PrivilegedCollection {
    async fn collect(&self, emit: &mut dyn RecordEmitter) -> Result<()> {
        let ctx = &self.ctx;

        if ctx.platform == Platform::Linux {
            if ctx.options.no_acct {
                info!("Skipping process accounting");
            } else {
                let runner = ctx.runner.clone().with_timeout(ctx.options.timeouts.accounting);
                accounting::collect(&runner, ctx.options.is_skipped("sa"), &ctx.user, emit).await?;
            }
        }

        info!(commands = ctx.catalog.root_commands.len(), "Running privileged commands");
        run_commands(ctx, &ctx.catalog.root_commands, "cmd_root", emit).await
    }
}
