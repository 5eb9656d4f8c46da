//! Build command integration tests over a multi-package project.

use predicates::prelude::*;
use serial_test::serial;

use super::common::TestEnv;

/// The kim-1 project: a root script, an application package and a port.
fn kim1_project() -> TestEnv {
  let env = TestEnv::from_fixture("kim1.lua");
  env.copy_fixture("apps.lua", "apps/build.lua");
  env.copy_fixture("kim1_arch.lua", "src/arch/kim-1/build.lua");
  env.write_file("apps/dump.S", b"dump program");
  env.write_file("src/arch/kim-1/bios.S", vec![0x4C; 600]);
  env
}

#[test]
#[serial]
fn default_build_writes_only_top_level() {
  let env = kim1_project();

  env
    .imgforge_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("+distro"));

  assert!(env.out_path().join("distro").is_file());
  assert!(!env.out_path().join("src").exists());
}

#[test]
#[serial]
fn nested_targets_land_under_their_package() {
  let env = kim1_project();

  env
    .imgforge_cmd()
    .arg("build")
    .arg("src/arch/kim-1+imd")
    .arg("src/arch/kim-1+diskimage")
    .assert()
    .success();

  let package_dir = env.out_path().join("src").join("arch").join("kim-1");
  let imd = std::fs::read(package_dir.join("imd")).unwrap();
  assert!(imd.starts_with(b"IMD "));

  // k-1013: 77 tracks of 26 sectors of 256 bytes
  let image = std::fs::read(package_dir.join("diskimage")).unwrap();
  assert_eq!(image.len(), 77 * 26 * 256);
  assert_eq!(&image[..600], &[0x4C; 600][..]);
}

#[test]
#[serial]
fn json_summary_counts_evaluations() {
  let env = kim1_project();

  let output = env
    .imgforge_cmd()
    .args(["--output", "json", "build"])
    .env("IMGFORGE_JOBS", "1")
    .output()
    .unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["success"], true);
  assert_eq!(json["evaluated"], 5);
  assert_eq!(json["cached"], 0);

  let names: Vec<&str> = json["targets"]
    .as_array()
    .unwrap()
    .iter()
    .map(|t| t["target"].as_str().unwrap())
    .collect();
  assert_eq!(
    names,
    vec![
      "apps+dump",
      "src/arch/kim-1+bios",
      "src/arch/kim-1+diskimage",
      "src/arch/kim-1+imd",
      "+distro"
    ]
  );
}

#[test]
#[serial]
fn oversized_boot_image_fails_the_disk_and_skips_dependents() {
  let env = kim1_project();
  env.write_file("src/arch/kim-1/bios.S", vec![0x4C; 26 * 256 + 1]);

  env
    .imgforge_cmd()
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("src/arch/kim-1+diskimage"))
    .stderr(predicate::str::contains("6657"))
    .stderr(predicate::str::contains("+distro skipped"));

  assert!(!env.out_path().join("distro").exists());
}

#[test]
#[serial]
fn unwritable_artifact_fails_only_its_target() {
  let env = kim1_project();
  // A directory in the way of out/distro
  env.write_file("out/distro/stale.txt", b"left over");

  env
    .imgforge_cmd()
    .args(["build", "+distro", "src/arch/kim-1+imd"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("+distro: cannot write"))
    .stdout(predicate::str::contains("src/arch/kim-1+imd"))
    .stdout(predicate::str::contains("Targets"));

  let imd = std::fs::read(env.out_path().join("src/arch/kim-1/imd")).unwrap();
  assert!(imd.starts_with(b"IMD "));
  assert!(env.out_path().join("distro").is_dir());
}

#[test]
#[serial]
fn unwritable_artifact_is_reported_in_json() {
  let env = kim1_project();
  env.write_file("out/distro/stale.txt", b"left over");

  let output = env
    .imgforge_cmd()
    .args(["--output", "json", "build"])
    .output()
    .unwrap();
  assert!(!output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["success"], false);
  let targets = json["targets"].as_array().unwrap();
  let distro = targets.iter().find(|t| t["target"] == "+distro").unwrap();
  assert_eq!(distro["status"], "write_failed");
  assert!(distro["error"].as_str().unwrap().contains("cannot write"));
  assert!(targets.iter().filter(|t| t["target"] != "+distro").all(|t| t["status"] == "built"));
}

#[test]
#[serial]
fn colliding_outputs_are_rejected_before_building() {
  let env = kim1_project();
  env.write_file(
    "build.lua",
    format!("{}\nzip {{ name = \"apps\" }}\n", std::fs::read_to_string(&env.build_file).unwrap()),
  );

  env
    .imgforge_cmd()
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("collides with apps+dump"));

  assert!(!env.out_path().exists());
}

#[test]
#[serial]
fn missing_compiler_is_a_toolchain_failure() {
  let env = kim1_project();

  env
    .imgforge_cmd()
    .args(["build", "--cc", "/nonexistent/bin/clang"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("toolchain"));
}

#[test]
#[serial]
fn verbose_flag_enables_debug_logs() {
  let env = kim1_project();

  env
    .imgforge_cmd()
    .args(["-v", "build"])
    .assert()
    .success()
    .stderr(predicate::str::contains("DEBUG"));
}

#[test]
#[serial]
fn rust_log_overrides_verbose() {
  let env = kim1_project();

  env
    .imgforge_cmd()
    .args(["-v", "build"])
    .env("RUST_LOG", "error")
    .assert()
    .success()
    .stderr(predicate::str::contains("INFO").not())
    .stderr(predicate::str::contains("DEBUG").not());
}
