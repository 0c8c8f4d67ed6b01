//! Locations and commands of the docker-compose stack under test.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Resolves stack paths relative to a repository root.
#[derive(Debug, Clone)]
pub struct StackLayout {
    root: PathBuf,
}

impl StackLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the root.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Compose directory of an environment, e.g. `docker/docker-dev`.
    pub fn compose_dir(&self, environment: &str) -> PathBuf {
        self.path("docker").join(environment)
    }

    pub fn launch_script(&self) -> PathBuf {
        self.path("docker/launch.sh")
    }

    /// `docker-compose down` in the environment's compose directory.
    pub fn compose_down(&self, environment: &str) -> Command {
        let mut cmd = Command::new("docker-compose");
        cmd.arg("down").current_dir(self.compose_dir(environment));
        cmd
    }

    /// `docker/launch.sh <environment>`.
    pub fn launch(&self, environment: &str) -> Command {
        let mut cmd = Command::new(self.launch_script());
        cmd.arg(environment).current_dir(&self.root);
        cmd
    }
}
