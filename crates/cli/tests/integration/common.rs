//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Read fixture content.
pub fn fixture_content(name: &str) -> String {
  std::fs::read_to_string(fixture_path(name)).unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", name, e))
}

/// Isolated project directory.
///
/// Each test gets its own temporary directory holding the build scripts,
/// sources and the default `out` directory.
pub struct TestEnv {
  pub temp: TempDir,
  pub build_file: PathBuf,
}

impl TestEnv {
  /// Create from a fixture file copied to `build.lua`.
  pub fn from_fixture(name: &str) -> Self {
    let env = Self::empty();
    std::fs::write(&env.build_file, fixture_content(name)).unwrap();
    env
  }

  /// Create an empty project.
  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    let build_file = temp.path().join("build.lua");
    Self { temp, build_file }
  }

  /// Copy a fixture to a path relative to the project root.
  pub fn copy_fixture(&self, name: &str, relative_path: &str) {
    self.write_file(relative_path, fixture_content(name));
  }

  /// Write a file relative to the project root.
  pub fn write_file(&self, relative_path: &str, content: impl AsRef<[u8]>) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Default output directory.
  pub fn out_path(&self) -> PathBuf {
    self.temp.path().join("out")
  }

  /// Get a pre-configured Command for the imgforge binary.
  ///
  /// Clears `IMGFORGE_JOBS`, `IMGFORGE_CC` and `RUST_LOG` and points
  /// `--file` at the project's build script.
  pub fn imgforge_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("imgforge");
    cmd.env_remove("IMGFORGE_JOBS");
    cmd.env_remove("IMGFORGE_CC");
    cmd.env_remove("RUST_LOG");
    cmd.arg("--file").arg(&self.build_file);
    cmd
  }
}
