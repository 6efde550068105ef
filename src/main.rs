#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![forbid(unsafe_code)]

use std::process::ExitCode;

mod cli;
mod convert;
mod params_file;
mod progress;
mod rcs;

use progress::ProgressPrint;

pub(crate) type FHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub(crate) type FHashSet<T> = rustc_hash::FxHashSet<T>;

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let start = std::time::Instant::now();

    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return Err(RunError::Usage);
        }
    };

    if args.help_passes {
        println!("conversion passes:");
        for (index, pass) in convert::PASSES.iter().enumerate() {
            println!("{:>3}. {:<20} {}", index + 1, pass.name, pass.description);
        }
        return Ok(());
    }

    let progress_print = progress::init(start, !args.no_progress);

    let stderr_log_level = args
        .stderr_log_level
        .unwrap_or(cli::LogLevel::Warn)
        .to_log_level_filter();
    let file_log_level = args.file_log_level.map(cli::LogLevel::to_log_level_filter);

    if let Err(e) = init_logger(
        Some(stderr_log_level),
        args.log_file.as_deref(),
        file_log_level,
        progress_print.clone(),
    ) {
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let (Some(src), Some(out), Some(conv_params)) =
        (args.src, args.out, args.conv_params)
    else {
        eprintln!("--src, --out and --conv-params are required");
        return Err(RunError::Usage);
    };

    let params_raw = match std::fs::read_to_string(&conv_params) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to read {conv_params:?}: {e}");
            return Err(RunError::Generic);
        }
    };
    let params: params_file::ConvParams = match toml::from_str(&params_raw) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to parse {conv_params:?}: {e}");
            return Err(RunError::Generic);
        }
    };

    let options = build_options(&src, &params, args.sort_buffer_size)?;

    let (first_pass, last_pass) = match args.passes {
        None => (1, convert::PASSES.len()),
        Some(ref raw) => {
            cli::parse_pass_range(raw, convert::PASSES.len()).ok_or_else(|| {
                tracing::error!("invalid pass range {raw:?} (see --help-passes)");
                RunError::Usage
            })?
        }
    };

    let mut r = convert::convert(
        &progress_print,
        &options,
        &out,
        first_pass,
        last_pass,
        args.skip_cleanup,
    );

    if r.is_ok() && args.check_contents && last_pass == convert::PASSES.len() {
        r = convert::verify_plan_contents(&progress_print, &options, &out);
    }

    progress_print.finish();

    r.map_err(|convert::ConvertError| RunError::Generic)
}

fn build_options(
    src: &std::path::Path,
    params: &params_file::ConvParams,
    sort_buffer_mib: usize,
) -> Result<convert::Options, RunError> {
    let mut encodings = Vec::new();
    for name in params.encodings.iter() {
        let encoding = convert::Encoding::parse(name).ok_or_else(|| {
            tracing::error!("unsupported encoding {name:?}");
            RunError::Generic
        })?;
        encodings.push(encoding);
    }

    let symbol_default =
        convert::SymbolDefault::parse(&params.symbol_default).ok_or_else(|| {
            tracing::error!(
                "invalid symbol-default {:?} (expected heuristic, strict, branch or tag)",
                params.symbol_default,
            );
            RunError::Generic
        })?;

    if params.projects.is_empty() {
        tracing::error!("at least one project is required");
        return Err(RunError::Generic);
    }

    Ok(convert::Options {
        src_path: src.to_path_buf(),
        projects: params.projects.clone(),
        cross_project_commits: params.cross_project_commits,
        cross_branch_commits: params.cross_branch_commits,
        trunk_only: params.trunk_only,
        commit_threshold: params.commit_threshold_seconds,
        encodings,
        forced_branches: compile_rules(&params.forced_branches)?,
        forced_tags: compile_rules(&params.forced_tags)?,
        excluded_symbols: compile_rules(&params.excluded_symbols)?,
        symbol_default,
        keep_cvsignore: params.keep_cvsignore,
        sort_run_bytes: sort_buffer_mib.saturating_mul(1024 * 1024).max(64 * 1024),
    })
}

/// Symbol rules match whole names, as in CVS practice.
fn compile_rules(patterns: &[String]) -> Result<Vec<regex::Regex>, RunError> {
    patterns
        .iter()
        .map(|pattern| {
            regex::Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                tracing::error!("invalid symbol pattern {pattern:?}: {e}");
                RunError::Generic
            })
        })
        .collect()
}

fn init_logger(
    stderr_level: Option<tracing::Level>,
    file_path: Option<&std::path::Path>,
    file_level: Option<tracing::Level>,
    progress_print: ProgressPrint,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_sub = if let Some(stderr_level) = stderr_level {
        let filter = tracing_subscriber::filter::LevelFilter::from_level(stderr_level);
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(MakeLogPrinter::new(progress_print))
                .with_filter(filter),
        )
    } else {
        None
    };

    let file_sub = if let Some(file_path) = file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        let filter = tracing_subscriber::filter::LevelFilter::from_level(
            file_level.unwrap_or(tracing::Level::DEBUG),
        );
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}

struct MakeLogPrinter {
    progress_print: ProgressPrint,
}

impl MakeLogPrinter {
    fn new(progress_print: ProgressPrint) -> Self {
        Self { progress_print }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogPrinter {
    type Writer = LogPrinter<'a>;

    fn make_writer(&'a self) -> LogPrinter<'a> {
        LogPrinter {
            progress_print: &self.progress_print,
            buf: Vec::new(),
        }
    }
}

struct LogPrinter<'a> {
    progress_print: &'a ProgressPrint,
    buf: Vec<u8>,
}

impl Drop for LogPrinter<'_> {
    fn drop(&mut self) {
        self.progress_print.print_raw_line(&self.buf);
    }
}

impl std::io::Write for LogPrinter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.buf.extend(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
