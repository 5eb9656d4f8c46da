use std::sync::Arc;

use imgforge_lib::image::cpmfs::{CpmImage, CpmName};
use imgforge_lib::image::d64::{D64, RegionState};
use imgforge_lib::image::{DiskDef, imd};
use imgforge_lib::rule::archive::read_zip;

use super::common::{CountingToolchain, Project};

const FILE_TXT: &[u8] = b"HELLO CP/M";

fn ibm_3740() -> DiskDef {
  DiskDef::lookup("ibm-3740").unwrap()
}

#[tokio::test]
async fn ibm_3740_image_holds_boot_and_system_file() {
  let project = Project::new(
    r#"
    mkcpmfs {
      name = "diskimage",
      format = "ibm-3740",
      bootimage = "./boot.bin",
      items = { { "0:FILE.TXT@sr", "./file.txt" } },
    }
    "#,
  );
  project.write("boot.bin", vec![0xA9; 300]);
  project.write("file.txt", FILE_TXT);

  let report = project.engine().build_all().await;
  assert!(report.is_success(), "{:?}", report.failed);

  let image = report.artifact_str("+diskimage").unwrap();
  assert_eq!(image.len(), 256_256);
  assert_eq!(&image.bytes()[..300], &[0xA9; 300][..]);

  // First directory entry: right after the two reserved tracks
  let entry = &image.bytes()[6656..6656 + 32];
  assert_eq!(entry[0], 0);
  assert_eq!(&entry[1..9], b"FILE    ");
  assert_eq!(entry[9], b'T' | 0x80);
  assert_eq!(entry[10], b'X' | 0x80);
  assert_eq!(entry[11], b'T');
  assert_eq!(entry[15], 1);
  assert_eq!(entry[16], 2);
  assert_eq!(image.bytes()[6656 + 32], 0xE5);

  let cpm = CpmImage::open(ibm_3740(), image.bytes().to_vec()).unwrap();
  let name = CpmName::parse("0:FILE.TXT", Some("sr")).unwrap();
  let data = cpm.read_file(&name).unwrap().unwrap();
  assert_eq!(&data[..FILE_TXT.len()], FILE_TXT);

  let entries = cpm.entries().unwrap();
  assert_eq!(entries.len(), 1);
  assert!(entries[0].name.system);
  assert!(entries[0].name.read_only);
}

#[tokio::test]
async fn image_full_leaves_no_artifact() {
  let project = Project::new(
    r#"
    mkcpmfs { name = "disk", format = "c1541", items = { { "0:BIG.DAT", "./big.dat" } } }
    zip { name = "bundle", items = { { "disk.img", ".+disk" } } }
    "#,
  );
  project.write("big.dat", vec![0x55; 100 * 1024]);

  let engine = project.engine();
  let report = engine.build_all().await;

  assert!(!report.is_success());
  assert_eq!(report.failed.len(), 1);
  let failure = &report.failed[0];
  assert_eq!(failure.target.to_string(), "+disk");
  assert_eq!(failure.kind.label(), "image_full");
  assert!(failure.to_string().contains("blocks"), "{}", failure);

  assert!(report.artifact_str("+disk").is_none());
  assert_eq!(report.skipped.len(), 1);
  assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn boot_image_too_large_reports_sizes() {
  let project = Project::new(
    r#"mkcpmfs { name = "disk", format = "ibm-3740", bootimage = "./boot.bin", items = {} }"#,
  );
  project.write("boot.bin", vec![0; 7000]);

  let report = project.engine().build_all().await;
  let failure = &report.failed[0];
  assert_eq!(failure.kind.label(), "boot_image_too_large");
  let message = failure.to_string();
  assert!(message.contains("7000"), "{}", message);
  assert!(message.contains("6656"), "{}", message);
}

#[tokio::test]
async fn shared_dependency_is_evaluated_once() {
  let project = Project::new(
    r#"
    llvmrawprogram { name = "bios", srcs = { "./bios.S" } }
    zip { name = "distro-a", items = { { "bios.bin", ".+bios" } } }
    zip { name = "distro-b", items = { { "bios.bin", ".+bios" }, { "readme.txt", "./readme.txt" } } }
    "#,
  );
  project.write("bios.S", b"\x4c\x00\x02");
  project.write("readme.txt", b"read me");

  let toolchain = Arc::new(CountingToolchain::default());
  let engine = project.engine_with(toolchain.clone());
  let roots = [
    engine.graph().lookup("+distro-a").unwrap(),
    engine.graph().lookup("+distro-b").unwrap(),
  ];
  let report = engine.build(&roots).await;

  assert!(report.is_success(), "{:?}", report.failed);
  assert_eq!(report.built.len(), 3);
  assert_eq!(report.evaluated, 3);
  assert_eq!(toolchain.assembled(), 1);
  assert_eq!(toolchain.linked(), 1);
}

#[tokio::test]
async fn identical_targets_share_one_evaluation() {
  let project = Project::new(
    r#"
    llvmrawprogram { name = "bios-a", srcs = { "./bios.S" } }
    llvmrawprogram { name = "bios-b", srcs = { "./bios.S" } }
    "#,
  );
  project.write("bios.S", b"\xea\xea\x60");

  let toolchain = Arc::new(CountingToolchain::default());
  let engine = project.engine_with(toolchain.clone());
  let report = engine.build_all().await;

  assert!(report.is_success(), "{:?}", report.failed);
  assert_eq!(report.built.len(), 2);
  assert_eq!(report.evaluated, 1);
  assert_eq!(report.cached, 1);
  assert_eq!(toolchain.linked(), 1);
  assert_eq!(report.artifact_str("+bios-a"), report.artifact_str("+bios-b"));
}

const PIPELINE: &str = r#"
llvmclibrary { name = "libbios", srcs = { "./vectors.S" } }
llvmrawprogram { name = "bios", srcs = { "./bios.S" }, deps = { ".+libbios" } }
mkcpmfs {
  name = "diskimage",
  format = "ibm-3740",
  bootimage = ".+bios",
  items = union(
    items { { "0:CCP.SYS@sr", "./ccp.sys" }, { "0:DUMP.COM", "./dump.com" } },
    items { { "0:DUMP.COM", "./dump2.com" } }
  ),
}
mkimd { name = "imd", src = ".+diskimage" }
zip {
  name = "distro",
  items = {
    { "bios.bin", ".+bios" },
    { "diskimage.img", ".+diskimage" },
    { "diskimage.imd", ".+imd" },
  },
}
"#;

fn pipeline_project() -> Project {
  let project = Project::new(PIPELINE);
  project.write("vectors.S", b"\x00\x02\x00\x02");
  project.write("bios.S", vec![0x20; 700]);
  project.write("ccp.sys", vec![0xC0; 2000]);
  project.write("dump.com", b"old dump");
  project.write("dump2.com", b"new dump");
  project
}

#[tokio::test]
async fn pipeline_is_deterministic() {
  let project = pipeline_project();
  let first = project.engine().build_all().await;
  let second = project.engine().build_all().await;

  assert!(first.is_success(), "{:?}", first.failed);
  assert_eq!(first.built.len(), 5);
  for (name, artifact) in &first.built {
    assert_eq!(
      Some(artifact.bytes()),
      second.artifact(name).map(|a| a.bytes()),
      "{} differs between runs",
      name
    );
  }
}

#[tokio::test]
async fn pipeline_layers_images_and_archive() {
  let project = pipeline_project();
  let report = project.engine().build_all().await;
  assert!(report.is_success(), "{:?}", report.failed);

  let bios = report.artifact_str("+bios").unwrap();
  assert_eq!(bios.len(), 700 + 4);

  // The overlay replaced DUMP.COM in place
  let disk = report.artifact_str("+diskimage").unwrap();
  let cpm = CpmImage::open(ibm_3740(), disk.bytes().to_vec()).unwrap();
  let names: Vec<String> = cpm.entries().unwrap().iter().map(|e| e.name.to_string()).collect();
  assert_eq!(names, vec!["0:CCP.SYS", "0:DUMP.COM"]);
  let dump = cpm
    .read_file(&CpmName::parse("0:DUMP.COM", None).unwrap())
    .unwrap()
    .unwrap();
  assert_eq!(&dump[..8], b"new dump");

  let imd_bytes = report.artifact_str("+imd").unwrap();
  assert!(imd_bytes.bytes().starts_with(imd::HEADER.as_bytes()));
  let (comment, geometry, data) = imd::decode(imd_bytes.bytes()).unwrap();
  assert_eq!(comment, "+diskimage");
  assert_eq!(geometry, ibm_3740().geometry());
  assert_eq!(data, disk.bytes());

  let entries = read_zip(report.artifact_str("+distro").unwrap().bytes()).unwrap();
  let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
  assert_eq!(names, vec!["bios.bin", "diskimage.img", "diskimage.imd"]);
  assert_eq!(entries[1].1, disk.bytes());
}

#[tokio::test]
async fn cpm_region_is_layered_onto_d64_template() {
  let project = Project::new(
    r#"
    mkcbmfs { name = "cbm", title = "cp/m-65", items = { { "readme", "./readme.txt" } } }
    mkcpmfs { name = "base", format = "c1541", template = ".+cbm", items = { { "0:DUMP.COM", "./dump.com" } } }
    mkcpmfs { name = "full", format = "c1541", template = ".+base", items = { { "0:LS.COM", "./ls.com" } } }
    "#,
  );
  project.write("readme.txt", b"commodore side");
  project.write("dump.com", b"dump");
  project.write("ls.com", b"ls");

  let report = project.engine().build_all().await;
  assert!(report.is_success(), "{:?}", report.failed);

  let disk = D64::open(report.artifact_str("+full").unwrap().bytes().to_vec()).unwrap();
  assert_eq!(disk.region_state(), RegionState::Reserved);
  assert_eq!(disk.read_file("readme").unwrap().unwrap(), b"commodore side");

  let cpm = CpmImage::open(DiskDef::lookup("c1541").unwrap(), disk.extract_region()).unwrap();
  for (file, contents) in [("0:DUMP.COM", &b"dump"[..]), ("0:LS.COM", &b"ls"[..])] {
    let data = cpm.read_file(&CpmName::parse(file, None).unwrap()).unwrap().unwrap();
    assert_eq!(&data[..contents.len()], contents);
  }
}

#[tokio::test]
async fn link_script_overflow_is_a_link_error() {
  let project = Project::new(
    r#"llvmrawprogram { name = "bios", srcs = { "./bios.S" }, linkscript = "./link.ld" }"#,
  );
  project.write("bios.S", vec![0xEA; 32]);
  project.write("link.ld", "MEMORY {\n  ram (rwx) : ORIGIN = 0x0200, LENGTH = 16\n}\n");

  let report = project.engine().build_all().await;
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].kind.label(), "link");
  assert!(report.failed[0].to_string().starts_with("+bios: "));
}

#[tokio::test]
async fn multilink_appends_relocation_tables() {
  let project = Project::new(
    r#"multilink { name = "dump", core = "./core.bin", zp = "./zp.bin", mem = "./mem.bin" }"#,
  );
  // header: zero-page size, TPA pages, relocation offset (LE)
  let core = [0x02, 0x01, 0x08, 0x00, 0xA5, 0x00, 0xAD, 0x00];
  let zp = [0x02, 0x01, 0x08, 0x00, 0xA5, 0x01, 0xAD, 0x00];
  let mem = [0x02, 0x01, 0x08, 0x00, 0xA5, 0x00, 0xAD, 0x01];
  project.write("core.bin", core);
  project.write("zp.bin", zp);
  project.write("mem.bin", mem);

  let report = project.engine().build_all().await;
  assert!(report.is_success(), "{:?}", report.failed);
  let out = report.artifact_str("+dump").unwrap().bytes();
  // memory-relocated bytes are stored two less
  assert_eq!(&out[..7], &core[..7]);
  assert_eq!(out[7], 0xFE);
  // zero-page table: delta 5; memory table: delta 7
  assert_eq!(&out[8..], &[0x5F, 0x7F]);
}

#[tokio::test]
async fn attribute_targets_build_through_colon_references() {
  let project = Project::new(
    r#"
    include("src/lib")
    zip { name = "distro", items = { { "objects.zip", "src/lib:objects" } } }
    "#,
  );
  project.write(
    "src/lib/build.lua",
    r#"
    zip { name = ":objects", items = { { "a.o", "./a.o" } } }
    rule("zip", "bundle", { items = { { "objects.zip", ".:objects" } } })
    "#,
  );
  project.write("src/lib/a.o", b"object");

  let report = project.engine().build_all().await;
  assert!(report.is_success(), "{:?}", report.failed);

  let objects = report.artifact_str("src/lib:objects").unwrap();
  assert_eq!(read_zip(objects.bytes()).unwrap(), vec![("a.o".to_string(), b"object".to_vec())]);
  let distro = read_zip(report.artifact_str("+distro").unwrap().bytes()).unwrap();
  assert_eq!(distro[0].1, objects.bytes());
  let bundle = read_zip(report.artifact_str("src/lib+bundle").unwrap().bytes()).unwrap();
  assert_eq!(bundle[0].1, objects.bytes());
}
