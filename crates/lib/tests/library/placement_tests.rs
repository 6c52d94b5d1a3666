use minicons_lib::{EngineConfig, EngineError, Install, ResolveError, Root, Source, build};

use super::common::{Concat, Tally, TestProject, target_path};

#[tokio::test]
async fn install_places_abstract_output_directly() {
  let project = TestProject::new();
  project.write("lib.c", "lib;");
  let tally = Tally::default();

  let mut env = project.env();
  let lib = env
    .add_builder(|decl| {
      decl.depends_files("lib.c")?;
      Ok(Concat::new("link", "libfoo.so", "lib", &tally))
    })
    .unwrap();
  let install = Install::new(&mut env, "dist", lib).unwrap();

  let report = build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(report.executed.len(), 2);
  assert_eq!(target_path(&mut env, lib), project.root.join("dist/libfoo.so"));
  assert_eq!(project.read("dist/libfoo.so"), "lib;");
  assert!(!project.build_path("lib/libfoo.so").exists());

  let mut env = project.env();
  let lib = env
    .add_builder(|decl| {
      decl.depends_files("lib.c")?;
      Ok(Concat::new("link", "libfoo.so", "lib", &tally))
    })
    .unwrap();
  let install = Install::new(&mut env, "dist", lib).unwrap();
  let report = build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();

  assert!(report.executed.is_empty());
  assert_eq!(tally.runs(), 1);
  assert_eq!(project.read("dist/libfoo.so"), "lib;");
}

#[tokio::test]
async fn building_the_library_first_still_installs() {
  let project = TestProject::new();
  project.write("lib.c", "lib;");
  let tally = Tally::default();

  let mut env = project.env();
  let lib = env
    .add_builder(|decl| {
      decl.depends_files("lib.c")?;
      Ok(Concat::new("link", "libfoo.so", "lib", &tally))
    })
    .unwrap();
  let install = Install::new(&mut env, "dist", lib).unwrap();

  let report = build(&mut env, &[Root::Builder(lib)], &EngineConfig::default())
    .await
    .unwrap();
  assert_eq!(report.executed, vec![lib]);
  assert_eq!(target_path(&mut env, lib), project.root.join("dist/libfoo.so"));

  let report = build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(project.read("dist/libfoo.so"), "lib;");
  assert!(!project.build_path("lib/libfoo.so").exists());
  assert_eq!(tally.runs(), 1);
}

#[tokio::test]
async fn install_copies_concrete_files() {
  let project = TestProject::new();
  project.write("README.md", "hello");

  let mut env = project.env();
  let install = Install::new(&mut env, "dist", "README.md").unwrap();
  build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();
  assert_eq!(project.read("dist/README.md"), "hello");
  assert_eq!(project.read("README.md"), "hello");

  project.write("README.md", "hello again");
  let mut env = project.env();
  let install = Install::new(&mut env, "dist", "README.md").unwrap();
  let report = build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();

  assert_eq!(report.executed, vec![install]);
  assert_eq!(project.read("dist/README.md"), "hello again");
}

#[tokio::test]
async fn install_copies_directories() {
  let project = TestProject::new();
  project.write("assets/a.txt", "a");
  project.write("assets/nested/b.txt", "b");

  let mut env = project.env();
  let install = Install::new(&mut env, "dist", Source::dir("assets")).unwrap();
  let report = build(&mut env, &[Root::Builder(install)], &EngineConfig::default())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(project.read("dist/assets/a.txt"), "a");
  assert_eq!(project.read("dist/assets/nested/b.txt"), "b");
}

#[tokio::test]
async fn conflicting_installs_are_rejected_before_building() {
  let project = TestProject::new();
  project.write("lib.c", "lib;");
  let tally = Tally::default();

  let mut env = project.env();
  let lib = env
    .add_builder(|decl| {
      decl.depends_files("lib.c")?;
      Ok(Concat::new("link", "libfoo.so", "lib", &tally))
    })
    .unwrap();
  let first = Install::new(&mut env, "dist", lib).unwrap();
  let second = Install::new(&mut env, "pkg", lib).unwrap();

  let err = build(&mut env, &[Root::Builder(first), Root::Builder(second)], &EngineConfig::default())
    .await
    .unwrap_err();

  assert!(matches!(err, EngineError::Resolve(ResolveError::AmbiguousPlacement { .. })));
  assert_eq!(tally.runs(), 0);
}
