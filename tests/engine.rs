//! End-to-end scenarios against the public engine API.
//!
//! The unix tests drive a real build through a fake shell toolchain that
//! understands just enough of the compiler surface (`-o`, `ar rcs`,
//! `-fmodule-output=`) to produce outputs, which exercises scheduling,
//! caching and artifact handling without needing clang on the test machine.

use ccforge::{BuildEngine, BuildTarget, EngineConfig, TargetKind};
use std::{fs, path::PathBuf};
use tempfile::TempDir;

fn write_file(dir: &TempDir, rel: &str, content: &str) -> PathBuf {
    let path = dir.path().join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

fn dry_run_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        output_dir: dir.path().join("build"),
        cache_dir: dir.path().join("cache"),
        dry_run: true,
        max_jobs: 2,
        ..Default::default()
    }
}

#[test]
fn dry_run_multi_target_project() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_file(&dir, "src/base.c", "int base(void) { return 1; }\n");
    let math = write_file(&dir, "src/math.cppm", "export module math;\nexport int id(int x);\n");
    let main = write_file(&dir, "src/main.cpp", "import math;\nint main() { return 0; }\n");

    let mut engine = BuildEngine::new(dry_run_config(&dir)).unwrap();
    engine
        .add_target(BuildTarget::new("libbase", TargetKind::StaticLibrary).with_sources([&base]));
    engine.add_target(
        BuildTarget::new("app", TargetKind::Executable)
            .with_sources([&math, &main])
            .with_dependency("libbase"),
    );

    let result = engine.build(&["app"]).unwrap();
    assert!(result.success, "{:?}", result.error_messages);
    // libbase: compile + archive; app: module + compile + link
    assert_eq!(result.targets_built, 5);
    assert_eq!(result.targets_failed, 0);
    assert_eq!(result.artifacts.len(), 2);
    assert!(result.error_messages.is_empty());
}

#[cfg(unix)]
mod with_fake_toolchain {
    use super::*;
    use ccforge::artifacts::ArtifactKind;
    use std::os::unix::fs::PermissionsExt;

    /// A shell script standing in for compiler, linker and archiver: it
    /// understands `-o <out>`, `ar`-style `rcs <out> <objs..>` and
    /// `-fmodule-output=<bmi>`, and fails for sources named `fail.*`.
    fn install_toolchain(dir: &TempDir) -> PathBuf {
        let script = dir.path().join("toolchain.sh");
        fs::write(
            &script,
            r#"#!/bin/sh
out=""
prev=""
if [ "$1" = "rcs" ]; then
    out="$2"
    shift 2
    : > "$out"
    for f in "$@"; do cat "$f" >> "$out"; done
    exit 0
fi
for a in "$@"; do
    case "$a" in
        */fail.c|*/fail.cpp) echo "error: compilation failed" >&2; exit 1 ;;
        -fmodule-output=*) echo bmi > "${a#-fmodule-output=}" ;;
    esac
    if [ "$prev" = "-o" ]; then out="$a"; fi
    prev="$a"
done
[ -n "$out" ] && echo built > "$out"
"#,
        )
        .unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();
        script
    }

    fn toolchain_config(dir: &TempDir) -> EngineConfig {
        let tool = install_toolchain(dir).display().to_string();
        EngineConfig {
            output_dir: dir.path().join("build"),
            cache_dir: dir.path().join("cache"),
            max_jobs: 4,
            cc: tool.clone(),
            cxx: tool.clone(),
            linker: tool.clone(),
            archiver: tool,
            ..Default::default()
        }
    }

    fn module_project(dir: &TempDir) -> (PathBuf, PathBuf) {
        let math =
            write_file(dir, "src/math.cppm", "export module math;\nexport int id(int x);\n");
        let main = write_file(dir, "src/main.cpp", "import math;\nint main() { return 0; }\n");
        (math, main)
    }

    #[test]
    fn full_build_then_cache_hits() {
        let dir = tempfile::tempdir().unwrap();
        let (math, main) = module_project(&dir);
        let config = toolchain_config(&dir);

        let mut engine = BuildEngine::new(config.clone()).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );

        // cold build: module + compile + link all execute
        let first = engine.build(&["app"]).unwrap();
        assert!(first.success, "{:?}", first.error_messages);
        assert_eq!(first.targets_built, 3);
        assert_eq!(first.targets_cached, 0);
        let app = dir.path().join("build/debug/bin/app");
        assert!(app.exists());
        assert!(dir.path().join("build/debug/obj/math.pcm").exists());
        assert!(dir.path().join("cache/manifest.bin").exists());

        // warm build in the same session: both compiles served from cache,
        // only the link re-runs
        let second = engine.build(&["app"]).unwrap();
        assert!(second.success);
        assert_eq!(second.targets_cached, 2);
        assert_eq!(second.targets_built, 1);

        // a fresh engine reloads the manifest and sees the same hits
        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        let third = engine.build(&["app"]).unwrap();
        assert!(third.success);
        assert_eq!(third.targets_cached, 2);
        assert_eq!(third.targets_built, 1);
        assert!(engine.cache().hit_rate() > 0.0);
    }

    #[test]
    fn touching_a_source_rebuilds_only_its_node() {
        let dir = tempfile::tempdir().unwrap();
        let (math, main) = module_project(&dir);
        let config = toolchain_config(&dir);

        let mut engine = BuildEngine::new(config.clone()).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        engine.build(&["app"]).unwrap();

        fs::write(&main, "import math;\nint main() { return 1; }\n").unwrap();
        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success);
        // the module is still cached; main.cpp and the link run again
        assert_eq!(result.targets_cached, 1);
        assert_eq!(result.targets_built, 2);
    }

    #[test]
    fn changed_interface_dirties_its_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let (math, main) = module_project(&dir);
        let config = toolchain_config(&dir);

        let mut engine = BuildEngine::new(config.clone()).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        engine.build(&["app"]).unwrap();

        // the interface changes, so the importer must recompile as well even
        // though main.cpp itself is untouched
        fs::write(&math, "export module math;\nexport int id(int x);\nexport int two();\n")
            .unwrap();
        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success);
        assert_eq!(result.targets_cached, 0);
        assert_eq!(result.targets_built, 3);
    }

    #[test]
    fn force_rebuild_ignores_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (math, main) = module_project(&dir);
        let mut config = toolchain_config(&dir);

        let mut engine = BuildEngine::new(config.clone()).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        engine.build(&["app"]).unwrap();

        config.force_rebuild = true;
        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success);
        assert_eq!(result.targets_cached, 0);
        assert_eq!(result.targets_built, 3);
    }

    #[test]
    fn failing_compile_aggregates_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(&dir, "src/good.c", "int good(void) { return 0; }\n");
        let bad = write_file(&dir, "src/fail.c", "int broken(\n");
        let mut config = toolchain_config(&dir);
        config.keep_going = true;

        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&good, &bad]),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(!result.success);
        assert_eq!(result.targets_failed, 1);
        // the good compile still ran under keep_going; the link never became
        // ready
        assert_eq!(result.targets_built, 1);
        assert_eq!(result.error_messages.len(), 1);
        assert!(
            result.error_messages[0].contains("compilation failed"),
            "{:?}",
            result.error_messages
        );
        assert!(result.artifacts.is_empty());
    }

    #[test]
    fn install_step_copies_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(&dir, "src/main.c", "int main(void) { return 0; }\n");
        let install_dir = dir.path().join("installed");

        let mut engine = BuildEngine::new(toolchain_config(&dir)).unwrap();
        let mut target = BuildTarget::new("app", TargetKind::Executable).with_sources([&src]);
        target.install_dir = Some(install_dir.clone());
        engine.add_target(target);

        let result = engine.build(&["app"]).unwrap();
        assert!(result.success, "{:?}", result.error_messages);
        assert!(install_dir.join("app").exists());
    }

    #[test]
    fn dependency_library_is_built_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(&dir, "src/base.c", "int base(void) { return 1; }\n");
        let main = write_file(&dir, "src/main.c", "int main(void) { return 0; }\n");

        let mut engine = BuildEngine::new(toolchain_config(&dir)).unwrap();
        engine.add_target(
            BuildTarget::new("libbase", TargetKind::StaticLibrary).with_sources([&base]),
        );
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable)
                .with_sources([&main])
                .with_dependency("libbase"),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success, "{:?}", result.error_messages);

        let registry = engine.registry();
        let lib = registry.get_by_name("libbase").unwrap();
        assert_eq!(lib.kind, ArtifactKind::StaticLibrary);
        assert!(lib.output_path.exists());
        assert!(registry.is_valid(lib.id));
        let app = registry.get_by_name("app").unwrap();
        assert!(registry.is_valid(app.id));
        assert!(app.dependencies.contains(&lib.id));
    }

    #[test]
    fn clean_then_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(&dir, "src/main.c", "int main(void) { return 0; }\n");

        let mut engine = BuildEngine::new(toolchain_config(&dir)).unwrap();
        engine.add_target(BuildTarget::new("app", TargetKind::Executable).with_sources([&src]));
        engine.build(&["app"]).unwrap();
        assert!(dir.path().join("build/debug/bin/app").exists());

        engine.clean().unwrap();
        assert!(!dir.path().join("build").exists());

        // everything is dirty again after a clean
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success, "{:?}", result.error_messages);
        assert_eq!(result.targets_cached, 0);
        assert!(dir.path().join("build/debug/bin/app").exists());
    }

    #[test]
    fn sequential_executor_via_single_job() {
        let dir = tempfile::tempdir().unwrap();
        let (math, main) = module_project(&dir);
        let mut config = toolchain_config(&dir);
        config.max_jobs = 1;

        let mut engine = BuildEngine::new(config).unwrap();
        engine.add_target(
            BuildTarget::new("app", TargetKind::Executable).with_sources([&math, &main]),
        );
        let result = engine.build(&["app"]).unwrap();
        assert!(result.success, "{:?}", result.error_messages);
        assert_eq!(result.targets_built, 3);
    }
}
