use std::path::PathBuf;

#[derive(clap::Parser)]
pub(crate) struct Cli {
    #[arg(
        long = "stderr-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum stderr log level (warn by default)"
    )]
    pub(crate) stderr_log_level: Option<LogLevel>,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        help = "File to write logs (besides stderr)"
    )]
    pub(crate) log_file: Option<PathBuf>,
    #[arg(
        long = "file-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum file log level (debug by default)"
    )]
    pub(crate) file_log_level: Option<LogLevel>,
    #[arg(long = "no-progress", help = "Do not print progress")]
    pub(crate) no_progress: bool,
    #[arg(
        long = "src",
        short = 's',
        value_name = "PATH",
        help = "Source CVS repository (a tree of RCS files)"
    )]
    pub(crate) src: Option<PathBuf>,
    #[arg(
        long = "out",
        short = 'o',
        value_name = "PATH",
        help = "Directory for conversion outputs and intermediate files"
    )]
    pub(crate) out: Option<PathBuf>,
    #[arg(
        long = "conv-params",
        short = 'P',
        value_name = "FILE",
        help = "Conversion parameters"
    )]
    pub(crate) conv_params: Option<PathBuf>,
    #[arg(
        long = "passes",
        short = 'p',
        value_name = "[START]:[END]",
        help = "Run only the given pass range (resuming from intermediate files)"
    )]
    pub(crate) passes: Option<String>,
    #[arg(long = "help-passes", help = "List the conversion passes and exit")]
    pub(crate) help_passes: bool,
    #[arg(
        long = "skip-cleanup",
        help = "Keep intermediate files after the last pass"
    )]
    pub(crate) skip_cleanup: bool,
    #[arg(
        long = "check-contents",
        help = "After converting, reconstruct every live revision in the plan"
    )]
    pub(crate) check_contents: bool,
    #[arg(
        long = "sort-buffer-size",
        value_name = "SIZE",
        help = "size (in MiB) of in-memory external sort runs",
        default_value_t = 64
    )]
    pub(crate) sort_buffer_size: usize,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub(crate) fn to_log_level_filter(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

/// `"3"` runs one pass, `"3:"`, `":5"` and `"3:5"` run ranges; both ends
/// are inclusive and 1-based.
pub(crate) fn parse_pass_range(raw: &str, pass_count: usize) -> Option<(usize, usize)> {
    let parse_end = |raw: &str, default: usize| -> Option<usize> {
        if raw.is_empty() {
            Some(default)
        } else {
            raw.parse().ok().filter(|&n| n >= 1 && n <= pass_count)
        }
    };

    let (first, last) = match raw.split_once(':') {
        None => {
            let single = parse_end(raw, 0)?;
            (single, single)
        }
        Some((first, last)) => (parse_end(first, 1)?, parse_end(last, pass_count)?),
    };

    (first >= 1 && first <= last).then_some((first, last))
}

#[cfg(test)]
mod tests {
    use super::parse_pass_range;

    #[test]
    fn pass_ranges() {
        assert_eq!(parse_pass_range("3", 12), Some((3, 3)));
        assert_eq!(parse_pass_range("3:5", 12), Some((3, 5)));
        assert_eq!(parse_pass_range(":5", 12), Some((1, 5)));
        assert_eq!(parse_pass_range("3:", 12), Some((3, 12)));
        assert_eq!(parse_pass_range(":", 12), Some((1, 12)));
        assert_eq!(parse_pass_range("0", 12), None);
        assert_eq!(parse_pass_range("13:", 12), None);
        assert_eq!(parse_pass_range("5:3", 12), None);
        assert_eq!(parse_pass_range("x", 12), None);
    }
}
