use std::fs;

use minicons_lib::{
  BuilderState, ConfigError, EngineConfig, EngineError, Environment, FingerprintMode, Root, SignatureStore, Source,
  build, build_default, build_with_cancel,
};
use tokio_util::sync::CancellationToken;

use super::common::{Concat, Tally, Scatter, TestProject, target_path};

fn config() -> EngineConfig {
  EngineConfig::default().with_parallelism(2)
}

/// `a.c -> compile_a`, `b.c -> compile_b`, both linked into `app`.
struct TwoObjects {
  compile_a: minicons_lib::BuilderId,
  compile_b: minicons_lib::BuilderId,
  link: minicons_lib::BuilderId,
}

fn two_objects(env: &mut Environment, tally: &Tally) -> TwoObjects {
  let compile_a = env
    .add_builder(|decl| {
      decl.depends_files("a.c")?;
      Ok(Concat::new("compile a", "a.o", "objs", tally))
    })
    .unwrap();
  let compile_b = env
    .add_builder(|decl| {
      decl.depends_files("b.c")?;
      Ok(Concat::new("compile b", "b.o", "objs", tally))
    })
    .unwrap();
  let link = env
    .add_builder(|decl| {
      decl.depends_files(vec![compile_a, compile_b])?;
      Ok(Concat::new("link", "app", "bin", tally))
    })
    .unwrap();

  TwoObjects {
    compile_a,
    compile_b,
    link,
  }
}

#[tokio::test]
async fn second_build_executes_nothing() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("b.c", "b;");
  let tally = Tally::default();

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);

  let report = build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();
  assert!(report.is_success());
  assert_eq!(report.executed.len(), 3);
  assert_eq!(project.read("build/bin/app"), "a;b;");

  // A fresh environment over the same tree, as a new invocation would have
  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  let report = build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();

  assert!(report.executed.is_empty());
  assert_eq!(report.up_to_date.len(), 3);
  assert_eq!(tally.runs(), 3);
}

#[tokio::test]
async fn source_change_rebuilds_only_downstream() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("b.c", "b;");
  let tally = Tally::default();

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();

  project.write("a.c", "a2;");

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  let report = build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();

  assert_eq!(report.executed, vec![graph.compile_a, graph.link]);
  assert_eq!(report.up_to_date, vec![graph.compile_b]);
  assert_eq!(project.read("build/bin/app"), "a2;b;");
}

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
  let project = TestProject::new();
  project.write("c.c", "c;");
  let tally = Tally::default();

  let mut env = project.env();
  let a = env.register(Concat::new("a", "a.out", "", &tally));
  let b = env.register(Concat::new("b", "b.out", "", &tally));
  env.depends_files(a, b).unwrap();
  env.depends_files(b, a).unwrap();
  let c = env
    .add_builder(|decl| {
      decl.depends_files("c.c")?;
      Ok(Concat::new("c", "c.out", "", &tally))
    })
    .unwrap();

  let err = build(&mut env, &[Root::Builder(c), Root::Builder(a)], &config())
    .await
    .unwrap_err();

  match err {
    EngineError::Config(ConfigError::CyclicDependency { cycle }) => assert_eq!(cycle, vec!["a", "b", "a"]),
    other => panic!("expected a cycle, got {other:?}"),
  }
  assert_eq!(tally.runs(), 0);
  assert!(!project.build_path("c.out").exists());
}

#[tokio::test]
async fn derived_entry_lands_under_its_category() {
  let project = TestProject::new();
  project.write("pkg/mod.c", "mod;");
  let tally = Tally::default();

  let mut env = project.env();
  let source = env.intern_path("pkg/mod.c").unwrap();
  let derived = env.derive(source, Some("so"), "native").unwrap();
  let relative = env.entry(derived).unwrap().relative_path().unwrap().to_path_buf();

  let id = env
    .add_builder(|decl| {
      decl.depends_files(source)?;
      Ok(Concat::new("compile", relative.to_str().unwrap(), "native", &tally))
    })
    .unwrap();

  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  assert!(report.is_success());
  assert_eq!(target_path(&mut env, id), project.build_path("native/pkg/mod.so"));
  assert_eq!(project.read("build/native/pkg/mod.so"), "mod;");
}

#[tokio::test]
async fn failure_is_isolated_to_dependents() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("d.c", "d;");
  let broken = Tally::default();
  broken.set_failing(true);
  let healthy = Tally::default();

  let mut env = project.env();
  let a = env
    .add_builder(|decl| {
      decl.depends_files("a.c")?;
      Ok(Concat::new("a", "a.out", "", &broken))
    })
    .unwrap();
  let b = env
    .add_builder(|decl| {
      decl.depends_files(a)?;
      Ok(Concat::new("b", "b.out", "", &healthy))
    })
    .unwrap();
  let c = env
    .add_builder(|decl| {
      decl.depends_files(b)?;
      Ok(Concat::new("c", "c.out", "", &healthy))
    })
    .unwrap();
  let d = env
    .add_builder(|decl| {
      decl.depends_files("d.c")?;
      Ok(Concat::new("d", "d.out", "", &healthy))
    })
    .unwrap();

  let report = build(&mut env, &[Root::Builder(c), Root::Builder(d)], &config())
    .await
    .unwrap();

  assert!(!report.is_success());
  assert_eq!(report.failure(a).map(|f| f.name.as_str()), Some("a"));
  assert_eq!(report.skipped(b).map(|s| s.root_cause), Some(a));
  assert_eq!(report.skipped(c).map(|s| s.root_cause_name.as_str()), Some("a"));
  assert_eq!(report.state(c), BuilderState::Failed);
  assert_eq!(report.executed, vec![d]);
  assert_eq!(healthy.runs(), 1);
  assert_eq!(project.read("build/d.out"), "d;");
}

#[tokio::test]
async fn failed_rebuild_leaves_no_stale_output() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  let tally = Tally::default();

  let register = |env: &mut Environment| {
    env
      .add_builder(|decl| {
        decl.depends_files("a.c")?;
        Ok(Concat::new("compile", "a.o", "objs", &tally))
      })
      .unwrap()
  };

  let mut env = project.env();
  let id = register(&mut env);
  build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();
  let output = project.build_path("objs/a.o");
  assert!(output.exists());

  project.write("a.c", "a broken;");
  tally.set_failing(true);
  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  assert!(report.failure(id).is_some());
  assert!(!output.exists());

  // The failed attempt invalidated the signature, so the builder runs again.
  tally.set_failing(false);
  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  assert_eq!(report.executed, vec![id]);
  assert_eq!(fs::read_to_string(&output).unwrap(), "a broken;");
}

#[tokio::test]
async fn directory_source_changes_are_detected() {
  let project = TestProject::new();
  project.write("assets/one.txt", "1");
  let tally = Tally::default();

  let register = |env: &mut Environment| {
    env
      .add_builder(|decl| {
        decl.depends_files(Source::dir("assets"))?;
        Ok(Concat::new("bundle", "bundle.txt", "", &tally))
      })
      .unwrap()
  };

  let mut env = project.env();
  let id = register(&mut env);
  build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  project.write("assets/two.txt", "2");
  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  assert_eq!(report.executed, vec![id]);
  assert_eq!(project.read("build/bundle.txt"), "12");
}

#[tokio::test]
async fn directory_target_is_rebuilt_when_tampered() {
  let project = TestProject::new();
  project.write("x.h", "x");
  project.write("y.h", "y");
  let tally = Tally::default();

  let register = |env: &mut Environment| {
    env
      .add_builder(|decl| {
        decl.depends_files(vec!["x.h", "y.h"])?;
        Ok(Scatter::new("headers", "include", &tally))
      })
      .unwrap()
  };

  let mut env = project.env();
  let id = register(&mut env);
  build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();
  assert_eq!(project.read("build/gen/include/x.h"), "x");

  project.write("build/gen/include/stray.h", "stray");
  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();

  assert_eq!(report.executed, vec![id]);
  assert!(!project.build_path("gen/include/stray.h").exists());
  assert_eq!(tally.runs(), 2);
}

#[tokio::test]
async fn side_outputs_are_built_but_not_consumed() {
  let project = TestProject::new();
  project.write("mod.c", "mod;");
  let tally = Tally::default();

  let mut env = project.env();
  let compile = env
    .add_builder(|decl| {
      decl.depends_files("mod.c")?;
      Ok(Concat::new("compile", "mod.o", "objs", &tally).with_side("mod.d"))
    })
    .unwrap();
  let link = env
    .add_builder(|decl| {
      decl.depends_files(compile)?;
      Ok(Concat::new("link", "mod.so", "lib", &tally))
    })
    .unwrap();
  let side = env.side_targets(compile).unwrap();
  let deps = env
    .add_builder(|decl| {
      decl.depends_files(side.clone())?;
      Ok(Concat::new("deps", "deps.txt", "", &tally))
    })
    .unwrap();

  let report = build(&mut env, &[Root::Builder(link), Root::Builder(deps)], &config())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(project.read("build/lib/mod.so"), "mod;");
  assert_eq!(project.read("build/objs/mod.d"), "side output of compile");
  assert_eq!(project.read("build/deps.txt"), "side output of compile");
  assert_eq!(env.sources_of(link).unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_build_dispatches_nothing() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("b.c", "b;");
  let tally = Tally::default();

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);

  let cancel = CancellationToken::new();
  cancel.cancel();
  let report = build_with_cancel(&mut env, &[Root::Builder(graph.link)], &config(), cancel)
    .await
    .unwrap();

  assert_eq!(tally.runs(), 0);
  assert_eq!(report.cancelled.len(), 3);
  assert!(!report.is_success());

  // Nothing was recorded, so a later build does all the work.
  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  let report = build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();
  assert_eq!(report.executed.len(), 3);
}

#[tokio::test]
async fn depends_file_accepts_one_entry() {
  let project = TestProject::new();
  project.write("one.c", "one;");
  let tally = Tally::default();

  let mut env = project.env();
  let id = env
    .add_builder(|decl| {
      let source = decl.depends_file("one.c")?;
      assert!(!decl.entry(source)?.is_abstract());
      Ok(Concat::new("single", "one.o", "objs", &tally))
    })
    .unwrap();

  let err = env
    .add_builder(|decl| {
      decl.depends_file(Source::from(vec!["one.c", "two.c"]))?;
      Ok(Concat::new("double", "two.o", "objs", &tally))
    })
    .unwrap_err();
  assert!(matches!(err, ConfigError::ExpectedSingleFile { count: 2 }));

  let report = build(&mut env, &[Root::Builder(id)], &config()).await.unwrap();
  assert!(report.is_success());
}

#[tokio::test]
async fn default_aliases_select_roots() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("b.c", "b;");
  let tally = Tally::default();

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  env.alias("objects", [graph.compile_a, graph.compile_b]);
  env.set_default(["objects"]);

  let report = build_default(&mut env, &config()).await.unwrap();

  assert_eq!(report.total(), 2);
  assert!(project.build_path("objs/a.o").exists());
  assert!(!project.build_path("bin/app").exists());

  let err = build(&mut env, &[Root::from("missing")], &config()).await.unwrap_err();
  assert!(matches!(err, EngineError::Config(ConfigError::UnknownAlias(_))));
}

#[tokio::test]
async fn signatures_of_unbuilt_builders_are_pruned() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  project.write("b.c", "b;");
  let tally = Tally::default();

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  build(&mut env, &[Root::Builder(graph.link)], &config()).await.unwrap();
  assert_eq!(SignatureStore::load(env.signature_path()).unwrap().len(), 3);

  let mut env = project.env();
  let graph = two_objects(&mut env, &tally);
  let report = build(&mut env, &[Root::Builder(graph.compile_a)], &config()).await.unwrap();
  assert_eq!(report.up_to_date, vec![graph.compile_a]);

  let store = SignatureStore::load(env.signature_path()).unwrap();
  assert_eq!(store.len(), 1);
  assert!(store.keys().all(|key| key.starts_with("compile a@")));
}

#[tokio::test]
async fn metadata_fingerprints_detect_edits() {
  let project = TestProject::new();
  project.write("a.c", "a;");
  let tally = Tally::default();
  let config = config().with_fingerprint(FingerprintMode::Metadata);

  let register = |env: &mut Environment| {
    env
      .add_builder(|decl| {
        decl.depends_files("a.c")?;
        Ok(Concat::new("compile", "a.o", "objs", &tally))
      })
      .unwrap()
  };

  let mut env = project.env();
  let id = register(&mut env);
  build(&mut env, &[Root::Builder(id)], &config).await.unwrap();

  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config).await.unwrap();
  assert_eq!(report.up_to_date, vec![id]);

  project.write("a.c", "a longer body;");
  let mut env = project.env();
  let id = register(&mut env);
  let report = build(&mut env, &[Root::Builder(id)], &config).await.unwrap();
  assert_eq!(report.executed, vec![id]);
}
