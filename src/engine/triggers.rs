// ABOUTME: Turns manifest names typed by the user into ManualTrigger actions.
// ABOUTME: Lines arrive on a channel so a blocking stdin reader never holds up shutdown.

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::store::{Action, Store};
use crate::types::ManifestName;

/// Trigger the manifest named on each line until `lines` closes or
/// `shutdown` fires. Blank lines are skipped.
pub async fn read_triggers(
    store: Store,
    mut shutdown: watch::Receiver<bool>,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            line = lines.recv() => match line {
                Some(line) => line,
                None => return,
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match ManifestName::new(line) {
            Ok(manifest) => {
                info!(manifest = %manifest, "trigger requested");
                store.dispatch(Action::trigger(manifest));
            }
            Err(err) => warn!(input = line, error = %err, "not a manifest name"),
        }
    }
}
