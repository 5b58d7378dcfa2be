use std::fs::read_to_string;
use std::fs::write;
use std::path::Path;

use qss::failure::FAILURE_REPORT_NAME;
use qss::parse::Frame;
use qss::pipeline::Pipeline;

use tempfile::tempdir;
use tempfile::TempDir;
use test_log::test;

use super::common::put;
use super::common::FakeBackend;


const CRASH_LOG: &str = "\
[   12.345] app[1234]: segfault at 0
Backtrace:
  #0 0x1ffff9de0d58 (/usr/bin/app+0x1fdb8)
  #1 0x1ffff9de1000 (/usr/lib64/libfoo.so+0x0001FDB8) (build-id:aa0d6e0011223344)
  #2 0x1ffff9de2000 in __libc_start_main
--- next crash ---
#0 0x10 (/usr/bin/app+0x2000)
[debug] unrelated output
#1 0x20 (/usr/bin/app+0x1fdb8)
end of log";


/// Create a root file system with `/usr/bin/app` and a debug binary
/// next to it. `/usr/lib64/libfoo.so` is missing.
fn rootfs() -> TempDir {
    let dir = tempdir().unwrap();
    let _path = put(dir.path(), "/usr/bin/app", b"stripped");
    let _path = put(dir.path(), "/usr/bin/app.debug", b"debug info");
    dir
}

fn backend() -> FakeBackend {
    FakeBackend::new([
        ("0x1fdb8", "do_work", "foo.c:42"),
        ("0x2000", "handler", "foo.c:7"),
    ])
}

/// Remove all frame lines from `text`.
fn non_frame_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n')
        .filter(|line| Frame::parse_line(line.trim_end_matches(['\r', '\n']), 0).is_none())
        .map(|line| line.trim_end_matches(['\r', '\n']))
        .collect()
}


/// Check the rendering of resolved and unresolvable frames.
#[test]
fn rendering_scenarios() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = dir.path().join("crash.log");
    let output = dir.path().join("stacks.txt");
    let () = write(
        &log,
        "#0 0x1ffff9de0d58 (/usr/bin/app+0x1fdb8)\n\
         #0 0x1ffff9de0d58 (/usr/lib64/libfoo.so+0x1fdb8) (build-id:aa0d6e0011223344)\n",
    )
    .unwrap();

    let mut pipeline = Pipeline::builder()
        .set_rootfs(rootfs.path())
        .set_backend(Box::new(backend()))
        .set_output(&output)
        .build()
        .unwrap();
    let report = pipeline.run(&[&log]).unwrap();

    assert_eq!(
        read_to_string(&output).unwrap(),
        "\
#0 0x1ffff9de0d58 in do_work at foo.c:42

#0 0x1ffff9de0d58 in ?? at ??:0 (/usr/lib64/libfoo.so+0x1fdb8) (build-id:aa0d6e0011223344)
"
    );
    assert!(report
        .failures
        .iter()
        .all(|failure| failure.object_path == "/usr/lib64/libfoo.so"));
}

/// Check that merging touches nothing but frame lines.
#[test]
fn merge_non_destructiveness() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    let _path = put(&input, "/crash.log", CRASH_LOG.as_bytes());
    let crlf = CRASH_LOG.replace('\n', "\r\n");
    let _path = put(&input, "/windows/crash.log", crlf.as_bytes());

    let backend = backend();
    let mut pipeline = Pipeline::builder()
        .set_rootfs(rootfs.path())
        .set_backend(Box::new(backend.clone()))
        .set_merge_output(&output)
        .build()
        .unwrap();
    let report = pipeline.run(&[&input]).unwrap();
    assert_eq!(report.outputs.len(), 2);
    // One invocation for `app.debug`, none for the missing library.
    assert_eq!(backend.calls(), 1);
    assert_eq!(report.binaries, 2);
    assert_eq!(backend.targets(), [rootfs.path().join("usr/bin/app.debug")]);

    let merged = read_to_string(output.join("crash.log")).unwrap();
    assert_eq!(non_frame_lines(&merged), non_frame_lines(CRASH_LOG));
    assert_eq!(
        merged,
        "\
[   12.345] app[1234]: segfault at 0
Backtrace:
  #0 0x1ffff9de0d58 in do_work at foo.c:42
  #1 0x1ffff9de1000 in ?? at ??:0 (/usr/lib64/libfoo.so+0x0001FDB8) (build-id:aa0d6e0011223344)
  #2 0x1ffff9de2000 in __libc_start_main
--- next crash ---
#0 0x10 in handler at foo.c:7
#1 0x20 in do_work at foo.c:42
[debug] unrelated output
end of log"
    );

    let merged = read_to_string(output.join("windows/crash.log")).unwrap();
    assert_eq!(non_frame_lines(&merged), non_frame_lines(&crlf));
    assert_eq!(merged.matches("\r\n").count(), crlf.matches("\r\n").count());
    assert!(!merged.replace("\r\n", "").contains('\n'));

    // The missing library shows up in the failure report, once per log
    // line and stage.
    let report = read_to_string(output.join(FAILURE_REPORT_NAME)).unwrap();
    let mut lines = report.lines();
    assert_eq!(
        lines.next(),
        Some("orig_elf\toffset\tbuild_id\ttarget_elf\treason")
    );
    let rows = lines.collect::<Vec<_>>();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|row| row.starts_with("/usr/lib64/libfoo.so\t0x1fdb8\taa0d6e0011223344\t")));
}

/// Check that a failing backend degrades to unknown frames and gets
/// reported.
#[test]
fn unknown_fallback() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = put(dir.path(), "/crash.log", b"#0 0x10 (/usr/bin/app+0x2000)\n");
    let output = dir.path().join("out");

    let mut pipeline = Pipeline::builder()
        .set_rootfs(rootfs.path())
        .set_backend(Box::new(FakeBackend::failing()))
        .set_merge_output(&output)
        .build()
        .unwrap();
    let report = pipeline.run(&[log]).unwrap();

    assert_eq!(
        read_to_string(output.join("crash.log")).unwrap(),
        "#0 0x10 in ?? at ??:0 (/usr/bin/app+0x2000)\n"
    );
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].reason.contains("addr2line crashed"));
    assert_eq!(
        report.failures[0].resolved_target.as_deref(),
        Some(rootfs.path().join("usr/bin/app.debug").as_path())
    );
}

/// Check that a debug binary is found through the build ID from the
/// log.
#[test]
fn build_id_lookup() {
    let dir = tempdir().unwrap();
    let rootfs = dir.path().join("rootfs");
    let _path = put(&rootfs, "/usr/lib64/libfoo.so", b"stripped");
    let debug = put(
        &rootfs,
        "/usr/lib/debug/.build-id/aa/0d6e0011223344.debug",
        b"debug info",
    );
    let log = put(
        dir.path(),
        "/crash.log",
        b"#1 0x1ffff9de0d58 (/usr/lib64/libfoo.so+0x1fdb8) (build-id:aa0d6e0011223344)\n",
    );
    let output = dir.path().join("stacks.txt");

    let backend = backend();
    let mut pipeline = Pipeline::builder()
        .set_rootfs(&rootfs)
        .set_backend(Box::new(backend.clone()))
        .set_output(&output)
        .build()
        .unwrap();
    let report = pipeline.run(&[log]).unwrap();

    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x1ffff9de0d58 in do_work at foo.c:42\n"
    );
    assert_eq!(backend.targets(), [debug]);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.failure_report, None);
}

#[cfg(feature = "sqlite")]
fn run_cached(rootfs: &Path, cache: &Path, log: &Path, output: &Path, inline: bool) -> FakeBackend {
    let backend = backend();
    let mut pipeline = Pipeline::builder()
        .set_rootfs(rootfs)
        .set_backend(Box::new(backend.clone()))
        .set_cache_db(Some(cache))
        .enable_inline(inline)
        .set_output(output)
        .build()
        .unwrap();
    let _report = pipeline.run(&[log]).unwrap();
    backend
}

/// Check that results get reused across runs.
#[cfg(feature = "sqlite")]
#[test]
fn cache_reuse() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = put(dir.path(), "/crash.log", CRASH_LOG.as_bytes());
    let cache = dir.path().join("cache.db");
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");

    let backend = run_cached(rootfs.path(), &cache, &log, &first, false);
    assert_eq!(backend.calls(), 1);
    let backend = run_cached(rootfs.path(), &cache, &log, &second, false);
    assert_eq!(backend.calls(), 0);

    assert_eq!(
        read_to_string(&first).unwrap(),
        read_to_string(&second).unwrap()
    );
}

/// Check that cached results are not shared between batched and
/// inline mode.
#[cfg(feature = "sqlite")]
#[test]
fn mode_tagging() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = put(dir.path(), "/crash.log", b"#0 0x10 (/usr/bin/app+0x2000)\n");
    let cache = dir.path().join("cache.db");
    let output = dir.path().join("stacks.txt");

    let backend = run_cached(rootfs.path(), &cache, &log, &output, false);
    assert_eq!(backend.calls(), 1);
    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x10 in handler at foo.c:7\n"
    );

    let backend = run_cached(rootfs.path(), &cache, &log, &output, true);
    assert_eq!(backend.calls(), 1);
    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x10 in handler at foo.c:7\n#1 0x10 in caller at caller.c:99\n"
    );

    let backend = run_cached(rootfs.path(), &cache, &log, &output, true);
    assert_eq!(backend.calls(), 0);
    let backend = run_cached(rootfs.path(), &cache, &log, &output, false);
    assert_eq!(backend.calls(), 0);
    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x10 in handler at foo.c:7\n"
    );
}

/// Check that backend failures are not persisted and get retried by
/// the next run.
#[cfg(feature = "sqlite")]
#[test]
fn failure_retry() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = put(dir.path(), "/crash.log", b"#0 0x10 (/usr/bin/app+0x2000)\n");
    let cache = dir.path().join("cache.db");
    let output = dir.path().join("stacks.txt");

    let failing = FakeBackend::failing();
    let mut pipeline = Pipeline::builder()
        .set_rootfs(rootfs.path())
        .set_backend(Box::new(failing.clone()))
        .set_cache_db(Some(&cache))
        .set_output(&output)
        .build()
        .unwrap();
    let report = pipeline.run(&[&log]).unwrap();
    assert_eq!(failing.calls(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x10 in ?? at ??:0 (/usr/bin/app+0x2000)\n"
    );

    let backend = run_cached(rootfs.path(), &cache, &log, &output, false);
    assert_eq!(backend.calls(), 1);
    assert_eq!(
        read_to_string(&output).unwrap(),
        "#0 0x10 in handler at foo.c:7\n"
    );
}

/// Check that addresses without symbol information are reported again
/// when answered from the cache.
#[cfg(feature = "sqlite")]
#[test]
fn cached_unknown_reporting() {
    let rootfs = rootfs();
    let dir = tempdir().unwrap();
    let log = put(dir.path(), "/crash.log", b"#0 0x30 (/usr/bin/app+0x3000)\n");
    let cache = dir.path().join("cache.db");
    let output = dir.path().join("out");

    let run = || {
        let backend = backend();
        let mut pipeline = Pipeline::builder()
            .set_rootfs(rootfs.path())
            .set_backend(Box::new(backend.clone()))
            .set_cache_db(Some(&cache))
            .set_merge_output(&output)
            .build()
            .unwrap();
        let report = pipeline.run(&[&log]).unwrap();
        (backend, report)
    };

    let (backend, report) = run();
    assert_eq!(backend.calls(), 1);
    assert_eq!(report.failures.len(), 1);

    let (backend, report) = run();
    assert_eq!(backend.calls(), 0);
    assert_eq!(report.binaries, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].offset.as_deref(), Some("0x3000"));
    assert!(
        report.failures[0].reason.contains("cached"),
        "{}",
        report.failures[0].reason
    );
    assert_eq!(
        report.failure_report,
        Some(output.join(FAILURE_REPORT_NAME))
    );
    assert_eq!(
        read_to_string(output.join("crash.log")).unwrap(),
        "#0 0x30 in ?? at ??:0 (/usr/bin/app+0x3000)\n"
    );
}
