#![allow(clippy::let_and_return, clippy::let_unit_value)]

mod args;

use std::io::stderr;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use qss::parse::parse_file;
use qss::pipeline::collect_inputs;
use qss::pipeline::Pipeline;
use qss::resolve::Outcome;
use qss::resolve::Resolver;
use qss::resolve::Rootfs;
use qss::summary::summarize;
use qss::summary::write_json;

use clap::Parser as _;

use tracing::subscriber::set_global_default as set_global_subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::FmtSubscriber;


/// Make sure that `rootfs` is usable as a root file system.
fn check_rootfs(rootfs: &Path) -> Result<()> {
    if !rootfs.is_dir() {
        bail!("root file system {} is not a directory", rootfs.display())
    }
    Ok(())
}


/// The handler for the 'symbolize' command.
fn symbolize(symbolize: args::Symbolize) -> Result<()> {
    let args::Symbolize {
        inputs,
        rootfs,
        lookup,
        flavor,
        addr2line,
        cross_prefix,
        workers_symbols,
        workers_rewrite,
        inline,
        no_demangle,
        cache_db,
        extension,
        merge_output,
        output,
        failure_report,
    } = symbolize;

    let () = check_rootfs(&rootfs)?;

    let mut builder = Pipeline::builder()
        .set_rootfs(rootfs)
        .enable_recursive_search(lookup.recursive_debug_search)
        .set_flavor(flavor.into())
        .set_executable(addr2line)
        .set_cross_prefix(cross_prefix)
        .set_workers_symbols(workers_symbols)
        .set_workers_rewrite(workers_rewrite)
        .enable_inline(inline)
        .enable_demangling(!no_demangle)
        .set_cache_db(cache_db)
        .set_extension(extension)
        .set_failure_report(failure_report);
    if !lookup.debug_roots.is_empty() {
        builder = builder.set_debug_roots(lookup.debug_roots);
    }
    builder = match (merge_output, output) {
        (Some(dir), _) => builder.set_merge_output(dir),
        (None, Some(path)) => builder.set_output(path),
        (None, None) => bail!("no output destination provided"),
    };

    let mut pipeline = builder.build().context("failed to set up symbolization")?;
    let report = pipeline
        .run(&inputs)
        .context("failed to symbolize crash logs")?;

    println!(
        "processed {} log(s) with {} frame(s), {} symbolized in {} binary(ies), {} failure(s) in {:.2?}",
        report.inputs.len(),
        report.frames,
        report.symbolized,
        report.binaries,
        report.failures.len(),
        report.elapsed,
    );
    for output in &report.outputs {
        println!("wrote {}", output.display());
    }
    if let Some(path) = &report.failure_report {
        println!("failures reported in {}", path.display());
    }
    Ok(())
}

/// The handler for the 'summary' command.
fn summary(summary: args::Summary) -> Result<()> {
    let args::Summary {
        inputs,
        rootfs,
        check_mismatch,
        extension,
        output_json,
    } = summary;

    let rootfs = if let Some(rootfs) = rootfs {
        let () = check_rootfs(&rootfs)?;
        Some(Rootfs::new(rootfs))
    } else {
        None
    };

    let files =
        collect_inputs(&inputs, extension.as_deref()).context("failed to collect crash logs")?;

    let mut traces = Vec::new();
    for file in &files {
        let file = &file.path;
        let log = parse_file(file).with_context(|| format!("failed to parse {}", file.display()))?;
        let () = traces.extend(log.traces);
    }

    let summaries = summarize(&traces, rootfs.as_ref(), check_mismatch);
    for entry in &summaries {
        println!("{}", entry.to_line());
    }

    if let Some(path) = output_json {
        let () = write_json(&path, &summaries)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }
    Ok(())
}

/// The handler for the 'resolve' command.
fn resolve(resolve: args::Resolve) -> Result<()> {
    let args::Resolve {
        rootfs,
        object_path,
        build_id,
        lookup,
    } = resolve;

    let () = check_rootfs(&rootfs)?;

    let mut builder = Resolver::builder()
        .set_rootfs(rootfs)
        .enable_recursive_search(lookup.recursive_debug_search);
    if !lookup.debug_roots.is_empty() {
        builder = builder.set_debug_roots(lookup.debug_roots);
    }
    let mut resolver = builder.build().context("failed to set up resolver")?;
    let target = resolver.resolve(&object_path, build_id.as_deref());

    println!("object:   {object_path}");
    println!("binary:   {}", target.real_binary_path.display());
    println!("target:   {}", target.backend_target().display());
    println!(
        "kind:     {} (priority {})",
        target.resolution_kind, target.resolution_priority
    );
    println!(
        "build ID: {}",
        target.build_id.as_deref().unwrap_or("<unknown>")
    );
    println!("attempts:");
    for attempt in &target.attempts {
        let marker = match attempt.outcome {
            Outcome::Found { .. } => '+',
            Outcome::NotFound => '-',
            Outcome::Skipped(..) => ' ',
        };
        println!("  {marker} {attempt}");
    }
    Ok(())
}


fn main() -> Result<()> {
    let args = args::Args::parse();
    let level = match args.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_timer(SystemTime)
        .with_writer(stderr)
        .finish();

    let () =
        set_global_subscriber(subscriber).with_context(|| "failed to set tracing subscriber")?;

    match args.command {
        args::Command::Symbolize(symbolize) => self::symbolize(symbolize),
        args::Command::Summary(summary) => self::summary(summary),
        args::Command::Resolve(resolve) => self::resolve(resolve),
    }
}
