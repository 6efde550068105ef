use std::path::PathBuf;

/// Resolved conversion options, built in `main` from the CLI and the TOML
/// parameters file.
pub(crate) struct Options {
    pub(crate) src_path: PathBuf,
    /// Project roots, as subdirectories of `src_path`; an empty string means
    /// the repository root itself is the single project.
    pub(crate) projects: Vec<String>,
    pub(crate) cross_project_commits: bool,
    pub(crate) cross_branch_commits: bool,
    pub(crate) trunk_only: bool,
    /// Seconds within which two same-metadata commits are presumed to be
    /// parts of one logical changeset.
    pub(crate) commit_threshold: i64,
    pub(crate) encodings: Vec<Encoding>,
    pub(crate) forced_branches: Vec<regex::Regex>,
    pub(crate) forced_tags: Vec<regex::Regex>,
    pub(crate) excluded_symbols: Vec<regex::Regex>,
    pub(crate) symbol_default: SymbolDefault,
    pub(crate) keep_cvsignore: bool,
    pub(crate) sort_run_bytes: usize,
}

/// Candidate encodings for metadata cleaning. CVS archives predate
/// repository-wide encoding declarations; in practice their metadata is
/// UTF-8, ASCII or some latin-1 variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "ascii" | "us-ascii" => Some(Self::Ascii),
            "latin1" | "latin-1" | "iso-8859-1" => Some(Self::Latin1),
            _ => None,
        }
    }

    pub(crate) fn decode(self, raw: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(raw).ok().map(str::to_owned),
            Self::Ascii => raw
                .is_ascii()
                .then(|| std::str::from_utf8(raw).unwrap().to_owned()),
            Self::Latin1 => Some(raw.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// How a symbol with both tag and branch uses and no forced rule is
/// classified.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SymbolDefault {
    /// Branch if it has branch commits or more branch uses, tag otherwise.
    Heuristic,
    /// Refuse to guess: ambiguous symbols fail the collate pass.
    Strict,
    Branch,
    Tag,
}

impl SymbolDefault {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "heuristic" => Some(Self::Heuristic),
            "strict" => Some(Self::Strict),
            "branch" => Some(Self::Branch),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Encoding, SymbolDefault};

    #[test]
    fn encoding_names() {
        assert_eq!(Encoding::parse("UTF-8"), Some(Encoding::Utf8));
        assert_eq!(Encoding::parse("iso-8859-1"), Some(Encoding::Latin1));
        assert_eq!(Encoding::parse("shift-jis"), None);
    }

    #[test]
    fn decoding() {
        assert_eq!(Encoding::Utf8.decode(b"ok").as_deref(), Some("ok"));
        assert_eq!(Encoding::Utf8.decode(b"\xff"), None);
        assert_eq!(Encoding::Ascii.decode(b"\xff"), None);
        assert_eq!(Encoding::Latin1.decode(b"\xe9").as_deref(), Some("é"));
    }

    #[test]
    fn symbol_default_names() {
        assert_eq!(
            SymbolDefault::parse("heuristic"),
            Some(SymbolDefault::Heuristic),
        );
        assert_eq!(SymbolDefault::parse("bogus"), None);
    }
}
