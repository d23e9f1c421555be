use anyhow::Result;
use chrono::Duration;
use kindred_core::LockMaintenance;

use super::Session;
use crate::cli::LockCommands;
use crate::output::{self, emit};

pub async fn execute(session: &Session, cmd: LockCommands) -> Result<()> {
    let locks = &session.backend.locks;
    match cmd {
        LockCommands::Stale { older_than_secs } => {
            let stale = locks
                .stale_locks(older_than_secs.map(|secs| Duration::seconds(i64::from(secs)))).await?;
            emit(session.format, &stale, |s| output::entities(s).to_string())
        }
        LockCommands::Release { entity, reason } => {
            let entity = session.entity(&entity).await?;
            let released = locks
                .force_release(entity.uuid, session.actor.as_str(), &reason)
                .await?;
            emit(session.format, &released, |r| {
                let mut ops = Vec::with_capacity(2);
                ops.extend(r.owner.clone());
                ops.push(r.operation.clone());
                format!(
                    "{}\n{}",
                    output::entities(std::slice::from_ref(&r.entity)),
                    output::operations(&ops)
                )
            })
        }
    }
}
