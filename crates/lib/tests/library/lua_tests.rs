use imgforge_lib::eval::{ScriptError, evaluate_build_file, load_graph};
use imgforge_lib::graph::GraphError;

use super::common::Project;

fn order(project: &Project, root: &str) -> Vec<String> {
  let registry = evaluate_build_file(&project.build_file()).unwrap();
  registry
    .build_order(root)
    .unwrap()
    .iter()
    .map(ToString::to_string)
    .collect()
}

#[test]
fn included_packages_resolve_relative_references() {
  let project = Project::new(
    r#"
    include("apps")
    include("src/arch/kim-1")
    zip { name = "distro", items = { { "kim-1.img", "src/arch/kim-1+diskimage" } } }
    "#,
  );
  project.write("apps/build.lua", r#"llvmrawprogram { name = "dump", srcs = { "./dump.S" } }"#);
  project.write(
    "src/arch/kim-1/build.lua",
    r#"
    llvmrawprogram { name = "bios", srcs = { "./bios.S" } }
    mkcpmfs {
      name = "diskimage",
      format = "k-1013",
      bootimage = ".+bios",
      items = { { "0:DUMP.COM", "apps+dump" } },
    }
    "#,
  );

  assert_eq!(
    order(&project, "+distro"),
    vec![
      "apps+dump",
      "src/arch/kim-1+bios",
      "src/arch/kim-1+diskimage",
      "+distro"
    ]
  );
}

#[test]
fn bare_paths_prefer_declared_targets() {
  let project = Project::new(
    r#"
    include("third_party/lib")
    zip { name = "bundle", items = { { "lib.a", "third_party/lib" }, { "notes", "docs/notes.txt" } } }
    "#,
  );
  project.write("third_party/lib/build.lua", r#"llvmclibrary { name = "lib", srcs = { "./a.S" } }"#);

  let graph = load_graph(&project.build_file()).unwrap();
  let bundle = graph.lookup("+bundle").unwrap();
  let deps: Vec<String> = graph
    .dependencies(bundle)
    .into_iter()
    .map(|id| graph.name(id).to_string())
    .collect();
  assert_eq!(deps, vec!["third_party/lib+lib"]);
}

#[test]
fn unknown_reference_names_the_referrer() {
  let project = Project::new(r#"mkimd { name = "imd", src = "src/arch+missing" }"#);
  let err = load_graph(&project.build_file()).unwrap_err();
  let ScriptError::Graph(GraphError::UnknownTarget { reference, from }) = err else {
    panic!("expected an unknown target, got {err:?}");
  };
  assert_eq!(reference, "src/arch+missing");
  assert_eq!(from, "+imd");
}

#[test]
fn cycles_are_rejected_before_evaluation() {
  let project = Project::new(
    r#"
    zip { name = "a", items = { { "b.zip", ".+b" } } }
    zip { name = "b", items = { { "c.zip", ".+c" } } }
    zip { name = "c", items = { { "a.zip", ".+a" } } }
    "#,
  );
  let err = load_graph(&project.build_file()).unwrap_err();
  let ScriptError::Graph(GraphError::CyclicDependency { chain }) = err else {
    panic!("expected a cycle, got {err:?}");
  };
  for member in ["+a", "+b", "+c"] {
    assert!(chain.contains(&member.to_string()), "{chain:?}");
  }
  assert_eq!(chain.first(), chain.last());
}

#[test]
fn missing_bootimage_is_a_declaration_error() {
  let project = Project::new(r#"mkcpmfs { name = "disk", format = "sdcard", items = {} }"#);
  let err = load_graph(&project.build_file()).unwrap_err();
  assert!(
    matches!(err, ScriptError::Graph(GraphError::InvalidRule { ref message, .. }) if message.contains("bootimage")),
    "{err:?}"
  );
}

#[test]
fn profiles_compose_with_union() {
  let project = Project::new(
    r#"
    local common = items { { "0:CCP.SYS@sr", "./ccp.sys" }, { "0:DUMP.COM", "./dump.com" } }
    local kim = common | items { { "0:DUMP.COM", "./kim/dump.com" }, { "0:KIMTEST.COM", "./kim/test.com" } }
    zip { name = "kim", items = kim }
    return nil
    "#,
  );
  let registry = evaluate_build_file(&project.build_file()).unwrap();
  let target = registry.resolve_str("+kim").unwrap();
  let imgforge_lib::target::RuleDecl::Zip { items } = &target.rule else {
    panic!("expected a zip declaration");
  };
  let keys: Vec<String> = items.iter().map(|i| i.key.to_string()).collect();
  assert_eq!(keys, vec!["0:CCP.SYS@sr", "0:DUMP.COM", "0:KIMTEST.COM"]);
  let dump = items.get("0:DUMP.COM").unwrap();
  assert_eq!(dump.source.to_string(), "kim/dump.com");
}

#[test]
fn lua_errors_carry_the_file_name() {
  let project = Project::new("this is not lua");
  let err = evaluate_build_file(&project.build_file()).unwrap_err();
  assert!(matches!(err, ScriptError::Lua(_)));
  assert!(err.to_string().contains("build.lua"), "{err}");
}

#[test]
fn attribute_declarations_use_the_colon_separator() {
  let project = Project::new(
    r#"
    rule("zip", ":objects", {})
    zip { name = "bundle", items = { { "o.zip", ".:objects" } } }
    "#,
  );
  assert_eq!(order(&project, "+bundle"), vec![":objects", "+bundle"]);

  let registry = evaluate_build_file(&project.build_file()).unwrap();
  assert!(registry.resolve_str("+objects").is_err());
}

#[test]
fn targets_cannot_shadow_package_directories() {
  let project = Project::new(
    r#"
    include("kim")
    zip { name = "kim" }
    "#,
  );
  project.write("kim/build.lua", r#"zip { name = "disk" }"#);

  let err = load_graph(&project.build_file()).unwrap_err();
  let ScriptError::Graph(GraphError::OutputCollision { target, other, path }) = err else {
    panic!("expected an output collision, got {err:?}");
  };
  assert_eq!((target.as_str(), other.as_str(), path.as_str()), ("+kim", "kim+disk", "kim"));
}
