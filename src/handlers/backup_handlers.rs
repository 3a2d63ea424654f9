//! Base backups: the database's own backup tool streamed through the write
//! path into `backups/<timestamp>.tar.gz`.

use super::{AppState, Outcome, upload};
use crate::{
    errors::{AppResult, settle},
    models::{
        catalog::backup_file_name,
        metric::{Metric, OpCode},
        object::ObjectKind,
    },
    services::{basebackup::BaseBackupCommand, catalog_service::closest_before},
};
use chrono::Utc;
use tracing::{info, warn};

pub async fn backup(state: &AppState, scheduled: bool) -> AppResult<Outcome> {
    let config = &state.config;
    info!(
        host = %config.database.host,
        dbname = %config.database.name,
        scheduled,
        "starting backup"
    );
    let start = Utc::now();

    if scheduled {
        let prefix = state.layout.prefix(ObjectKind::Backups);
        if let Some(newest) = closest_before(state.store.as_ref(), &prefix, start).await? {
            let cutoff = start.checked_sub_signed(config.backup_interval);
            if cutoff.is_none_or(|cutoff| newest.timestamp > cutoff) {
                info!(newest = %newest.key, "backup not due yet, skipping");
                return Ok(Outcome::Skipped {
                    reason: format!("latest backup `{}` is recent enough", newest.key),
                });
            }
        }
        info!("backup is due, continuing");
    }

    let command = BaseBackupCommand {
        program: config.basebackup_program.clone(),
        max_rate: config.basebackup_max_rate.clone(),
        database: config.database.clone(),
    };
    let name = backup_file_name(start);
    let key = state.layout.backup_key(&name);

    let (stdout, process) = command.spawn()?;
    let uploaded = upload(state, &key, stdout).await;
    let committed = uploaded.is_ok();
    let exited = process.wait().await.map_err(Into::into);

    let mut bytes = 0;
    let upload_failed = matches!(&uploaded, Err(err) if !err.is_broken_pipe());
    let uploaded = uploaded.map(|n| bytes = n);
    // The tool dies of SIGPIPE once the upload stops reading its output.
    let outcome = if upload_failed {
        settle([uploaded, exited])
    } else {
        settle([exited, uploaded])
    };
    if let Err(err) = outcome {
        if committed {
            // The tool failed after its output was stored; that object is
            // incomplete.
            match state.store.delete(&key).await {
                Ok(()) => info!(key = %key, "removed incomplete backup"),
                Err(cleanup) => warn!(key = %key, "failed to remove incomplete backup: {}", cleanup),
            }
        }
        return Err(err);
    }

    state
        .ledger
        .record(Metric::finished(OpCode::Backup, name.clone(), start, bytes))
        .await;
    info!(key = %key, bytes, "finished backup");
    Ok(Outcome::Completed {
        subject: name,
        bytes,
    })
}
