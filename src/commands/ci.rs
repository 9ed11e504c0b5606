// ABOUTME: CI command implementation.
// ABOUTME: Runs every initial build once and reports the overall result.

use super::Project;
use kiln::buildcontrol::UpdateMode;
use kiln::error::Result;
use kiln::output::{Output, OutputMode};

pub async fn ci(project: Project, update_mode: Option<UpdateMode>, mode: OutputMode) -> Result<()> {
    let mut output = Output::new(mode);
    output.start_timer();
    output.progress(&format!(
        "Building {} manifest(s) from {}",
        project.manifests.len(),
        project.config_path.display()
    ));

    let engine = project.engine(update_mode, mode);
    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.send_replace(true);
        }
    });

    engine.run_initial_builds().await?;
    output.success("All builds succeeded");
    Ok(())
}
