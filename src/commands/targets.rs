// ABOUTME: Targets command implementation.
// ABOUTME: Prints each manifest with its targets in the order they build.

use super::Project;
use kiln::error::{Error, Result};
use kiln::model::{ModelError, TargetSpec, topological_sort};
use kiln::output::OutputMode;
use kiln::types::ManifestName;
use serde::Serialize;

#[derive(Serialize)]
struct ManifestListing<'a> {
    name: &'a ManifestName,
    trigger_mode: kiln::model::TriggerMode,
    resource_deps: &'a [ManifestName],
    targets: Vec<String>,
}

pub fn targets(project: Project, mode: OutputMode) -> Result<()> {
    for manifest in &project.manifests {
        let ordered = topological_sort(&manifest.target_specs()).map_err(ModelError::from)?;
        let targets: Vec<String> = ordered.iter().map(describe).collect();

        if mode == OutputMode::Json {
            let listing = ManifestListing {
                name: &manifest.name,
                trigger_mode: manifest.trigger_mode,
                resource_deps: &manifest.resource_deps,
                targets,
            };
            println!("{}", serde_json::to_string(&listing).map_err(Error::from)?);
            continue;
        }

        println!("{}", manifest.name);
        if !manifest.resource_deps.is_empty() {
            let deps: Vec<&str> = manifest.resource_deps.iter().map(|d| d.as_str()).collect();
            println!("  after: {}", deps.join(", "));
        }
        for target in targets {
            println!("  {target}");
        }
    }
    Ok(())
}

fn describe(spec: &TargetSpec) -> String {
    match spec {
        TargetSpec::Image(image) => format!("{} ({})", spec.id(), image.image_ref),
        _ => spec.id().to_string(),
    }
}
