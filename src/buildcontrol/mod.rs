// ABOUTME: Deciding what to build next and running it through the strategy chain.
// ABOUTME: Strategies share the target queue and the live-update extractor.

mod composite;
mod context;
mod controller;
mod docker_compose;
mod error;
pub mod extractors;
mod image;
mod live_update;
mod local;
mod next_target;
mod target_queue;

pub use composite::{
    BuildAndDeployer, Collaborators, CompositeBuildAndDeployer, UpdateMode, build_order,
    updater_choice,
};
pub use context::BuildContext;
pub use controller::BuildController;
pub use docker_compose::DockerComposeBuildAndDeployer;
pub use error::{BuildError, BuildErrorKind, RedirectCause, RedirectLevel};
pub use extractors::{LiveUpdateStateTree, extract_image_targets_for_live_updates};
pub use image::ImageBuildAndDeployer;
pub use live_update::{LiveUpdateBuildAndDeployer, UpdaterChoice};
pub use local::LocalTargetBuildAndDeployer;
pub use next_target::{Hold, HoldSet, next_target_to_build};
pub use target_queue::{BuildHandler, TargetQueue};
