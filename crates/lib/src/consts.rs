//! Crate-wide constants.

/// Application name used for environment variables and output messages.
pub const APP_NAME: &str = "imgforge";

/// Default build script looked up in the project root.
pub const DEFAULT_BUILD_FILE: &str = "build.lua";

/// Length of the truncated SHA-256 prefix used for cache keys.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Overrides the worker pool size.
pub const ENV_JOBS: &str = "IMGFORGE_JOBS";

/// Selects the external compiler driver and enables the command toolchain.
pub const ENV_CC: &str = "IMGFORGE_CC";
