// ABOUTME: Up command implementation.
// ABOUTME: Runs the engine until Ctrl-C, rebuilding on file edits and typed manifest names.

use super::Project;
use kiln::buildcontrol::UpdateMode;
use kiln::engine::{FileWatcher, read_triggers};
use kiln::error::Result;
use kiln::output::{Output, OutputMode};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::warn;

pub async fn up(project: Project, update_mode: Option<UpdateMode>, mode: OutputMode) -> Result<()> {
    let output = Output::new(mode);
    output.progress(&format!(
        "Starting {} manifest(s) from {} (Ctrl-C to stop)",
        project.manifests.len(),
        project.config_path.display()
    ));

    let watcher = FileWatcher::notify()?.with_config(project.config_path.clone(), project.loader());
    let engine = project.engine(update_mode, mode);
    engine.watch_files(watcher);
    let shutdown = engine.shutdown_handle();

    output.progress("Type a manifest name and press Enter to rebuild it");
    let (lines_tx, lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });
    tokio::spawn(read_triggers(engine.store().clone(), shutdown.subscribe(), lines));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
        shutdown.send_replace(true);
    });

    engine.up().await?;
    output.progress("Stopped");
    Ok(())
}
