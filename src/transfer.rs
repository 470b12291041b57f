use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::TransferOutcome;
use crate::remote::{shell_quote, RemoteSession};

/// Local entries to copy and where they land on the remote host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadPlan {
    pub remote_root: String,
    pub directories: Vec<(PathBuf, String)>,
    pub files: Vec<(PathBuf, String)>,
}

/// Dotfiles and the named dependency directories are never uploaded.
pub fn is_excluded(name: &str, excluded_dirs: &[String]) -> bool {
    name.starts_with('.') || excluded_dirs.iter().any(|d| d == name)
}

/// Walk `local_root` in file-name order, pruning excluded entries.
pub fn plan_upload(local_root: &Path, remote_root: &str, excluded_dirs: &[String]) -> Result<UploadPlan> {
    let mut plan = UploadPlan {
        remote_root: remote_root.to_string(),
        ..UploadPlan::default()
    };

    let walker = WalkDir::new(local_root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(&e.file_name().to_string_lossy(), excluded_dirs));

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(local_root)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let remote = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .fold(remote_root.trim_end_matches('/').to_string(), |acc, part| {
                format!("{}/{}", acc, part)
            });

        if entry.file_type().is_dir() {
            plan.directories.push((entry.path().to_path_buf(), remote));
        } else if entry.file_type().is_file() {
            plan.files.push((entry.path().to_path_buf(), remote));
        } else {
            tracing::debug!("Skipping special file {:?}", entry.path());
        }
    }

    Ok(plan)
}

/// `mkdir -p` for the remote root and every planned directory.
pub fn skeleton_command(plan: &UploadPlan) -> String {
    std::iter::once(plan.remote_root.as_str())
        .chain(plan.directories.iter().map(|(_, remote)| remote.as_str()))
        .map(shell_quote)
        .fold("mkdir -p".to_string(), |acc, dir| format!("{} {}", acc, dir))
}

/// Copy every planned file with at most `concurrency` transfers in flight.
///
/// Individual failures do not stop the other transfers; they end up in
/// [`TransferOutcome::failed`]. Both lists follow the plan order.
pub async fn upload_tree<S>(session: Arc<S>, plan: UploadPlan, concurrency: usize) -> Result<TransferOutcome>
where
    S: RemoteSession + 'static,
{
    let skeleton = session.exec(&skeleton_command(&plan), None).await?;
    if !skeleton.success() || !skeleton.stderr.trim().is_empty() {
        tracing::error!(
            "Failed to create remote directories under {}: {}",
            plan.remote_root,
            skeleton.stderr.trim()
        );
        let failed = plan
            .directories
            .into_iter()
            .chain(plan.files)
            .map(|(local, _)| local)
            .collect();
        return Ok(TransferOutcome {
            succeeded: Vec::new(),
            failed,
        });
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut pending: BTreeMap<usize, PathBuf> = BTreeMap::new();
    let mut tasks = JoinSet::new();

    for (index, (local, remote)) in plan.files.into_iter().enumerate() {
        pending.insert(index, local.clone());
        let session = Arc::clone(&session);
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => session.put_file(&local, &remote).await,
                Err(e) => Err(Error::Io(std::io::Error::other(e))),
            };
            (index, result)
        });
    }

    let mut succeeded = BTreeMap::new();
    let mut failed = BTreeMap::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                let Some(local) = pending.remove(&index) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        tracing::debug!("Transferred {:?}", local);
                        succeeded.insert(index, local);
                    }
                    Err(e) => {
                        tracing::warn!("Transfer of {:?} failed: {}", local, e);
                        failed.insert(index, local);
                    }
                }
            }
            Err(e) => tracing::error!("Transfer task did not finish: {}", e),
        }
    }

    // Tasks that panicked never reported back.
    failed.extend(pending);

    Ok(TransferOutcome {
        succeeded: succeeded.into_values().collect(),
        failed: failed.into_values().collect(),
    })
}
