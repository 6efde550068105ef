use super::model::{SymbolKind, SymbolStats};
use super::options::{Options, SymbolDefault};
use super::stores::{self, SymbolRecord};
use super::{collect, ConvertError, PassContext};
use crate::FHashMap;

pub(super) const PASS: &str = "collate-symbols";

// Decides, project-wide, whether each symbol converts as a branch, a tag,
// or not at all. Forced rules win over the usage-count heuristics, and a
// symbol may only be excluded if everything that ever sprouted from it is
// excluded too.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 3: collate symbols");
    ctx.progress.set_progress("collating symbols".into());

    let stats = stores::read_symbol_stats(ctx.artifacts, collect::PASS).map_err(|e| {
        tracing::error!("failed to read symbol statistics: {e}");
        ConvertError
    })?;

    let mut symbols = Vec::with_capacity(stats.len());
    for record in stats.iter() {
        let kind = classify(ctx.options, record)?;
        symbols.push(SymbolRecord {
            id: record.symbol,
            project: record.project,
            name: record.name.clone(),
            kind,
        });
    }

    check_blockers(&stats, &symbols)?;

    let (mut branches, mut tags, mut excluded) = (0usize, 0usize, 0usize);
    for symbol in symbols.iter() {
        match symbol.kind {
            SymbolKind::Branch => branches += 1,
            SymbolKind::Tag => tags += 1,
            SymbolKind::Excluded => excluded += 1,
        }
    }
    tracing::info!("symbols: {branches} branches, {tags} tags, {excluded} excluded");

    stores::write_symbols(ctx.artifacts, PASS, &symbols)
        .and_then(|()| ctx.artifacts.commit(&[super::artifacts::names::SYMBOLS]))
        .map_err(|e| {
            tracing::error!("failed to write symbol database: {e}");
            ConvertError
        })
}

fn classify(options: &Options, stats: &SymbolStats) -> Result<SymbolKind, ConvertError> {
    let name = String::from_utf8_lossy(&stats.name);

    // Forced rules win, most destructive first.
    let forced = if options.excluded_symbols.iter().any(|re| re.is_match(&name)) {
        Some(SymbolKind::Excluded)
    } else if options.forced_branches.iter().any(|re| re.is_match(&name)) {
        Some(SymbolKind::Branch)
    } else if options.forced_tags.iter().any(|re| re.is_match(&name)) {
        Some(SymbolKind::Tag)
    } else {
        None
    };

    let kind = match forced {
        Some(kind) => kind,
        None => match (stats.branch_uses, stats.tag_uses) {
            (0, _) => SymbolKind::Tag,
            (_, 0) => SymbolKind::Branch,
            (branch_uses, tag_uses) => match options.symbol_default {
                SymbolDefault::Branch => SymbolKind::Branch,
                SymbolDefault::Tag => SymbolKind::Tag,
                SymbolDefault::Heuristic => {
                    if stats.branch_commit_files > 0 || branch_uses >= tag_uses {
                        SymbolKind::Branch
                    } else {
                        SymbolKind::Tag
                    }
                }
                SymbolDefault::Strict => {
                    tracing::error!(
                        "symbol \"{name}\" is used as both branch ({branch_uses}) and \
                         tag ({tag_uses}); classify it with a forced rule",
                    );
                    return Err(ConvertError);
                }
            },
        },
    };

    if kind == SymbolKind::Tag && stats.branch_commit_files > 0 {
        tracing::error!(
            "symbol \"{name}\" cannot convert as a tag: it has commits on its \
             branch in {} file(s)",
            stats.branch_commit_files,
        );
        return Err(ConvertError);
    }

    Ok(kind)
}

/// A symbol may be excluded only if every one of its blockers is excluded.
fn check_blockers(stats: &[SymbolStats], symbols: &[SymbolRecord]) -> Result<(), ConvertError> {
    let kind_of: FHashMap<_, _> = symbols
        .iter()
        .map(|symbol| (symbol.id, symbol.kind))
        .collect();

    let mut violations = 0usize;
    for record in stats.iter() {
        if kind_of[&record.symbol] != SymbolKind::Excluded {
            continue;
        }
        let live_blockers: Vec<&SymbolRecord> = symbols
            .iter()
            .filter(|symbol| {
                record.blockers.contains(&symbol.id) && symbol.kind != SymbolKind::Excluded
            })
            .collect();
        if !live_blockers.is_empty() {
            let names: Vec<String> = live_blockers
                .iter()
                .map(|blocker| String::from_utf8_lossy(&blocker.name).into_owned())
                .collect();
            tracing::error!(
                "symbol \"{}\" cannot be excluded: {} sprouted from it",
                String::from_utf8_lossy(&record.name),
                names.join(", "),
            );
            violations += 1;
        }
    }

    if violations != 0 {
        Err(ConvertError)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{check_blockers, classify};
    use crate::convert::model::{ProjectId, SymbolId, SymbolKind, SymbolStats};
    use crate::convert::options::{Options, SymbolDefault};

    fn options() -> Options {
        Options {
            src_path: std::path::PathBuf::new(),
            projects: vec![String::new()],
            cross_project_commits: false,
            cross_branch_commits: false,
            trunk_only: false,
            commit_threshold: 300,
            encodings: vec![],
            forced_branches: vec![],
            forced_tags: vec![],
            excluded_symbols: vec![],
            symbol_default: SymbolDefault::Heuristic,
            keep_cvsignore: false,
            sort_run_bytes: 1 << 20,
        }
    }

    fn stats(id: u32, name: &str, branch_uses: u32, tag_uses: u32) -> SymbolStats {
        SymbolStats {
            symbol: SymbolId(id),
            project: ProjectId(0),
            name: name.as_bytes().to_vec(),
            tag_uses,
            branch_uses,
            branch_commit_files: 0,
            blockers: vec![],
            possible_parents: vec![],
        }
    }

    #[test]
    fn usage_counts_decide() {
        let options = options();
        assert_eq!(
            classify(&options, &stats(0, "b", 3, 0)).unwrap(),
            SymbolKind::Branch,
        );
        assert_eq!(
            classify(&options, &stats(1, "t", 0, 3)).unwrap(),
            SymbolKind::Tag,
        );
        // Ambiguous, heuristic default: more tag uses and no branch commits.
        assert_eq!(
            classify(&options, &stats(2, "mixed", 1, 5)).unwrap(),
            SymbolKind::Tag,
        );
    }

    #[test]
    fn forced_rules_override() {
        let mut options = options();
        options.forced_tags = vec![regex::Regex::new("^(?:b)$").unwrap()];
        assert_eq!(
            classify(&options, &stats(0, "b", 3, 0)).unwrap(),
            SymbolKind::Tag,
        );
    }

    #[test]
    fn strict_refuses_ambiguity() {
        let mut options = options();
        options.symbol_default = SymbolDefault::Strict;
        assert!(classify(&options, &stats(0, "mixed", 1, 1)).is_err());
    }

    #[test]
    fn excluded_with_live_blocker_fails() {
        let mut blocked = stats(0, "T", 2, 0);
        blocked.blockers = vec![SymbolId(1)];
        let blocker = stats(1, "B", 1, 0);

        let symbols = vec![
            crate::convert::stores::SymbolRecord {
                id: SymbolId(0),
                project: ProjectId(0),
                name: b"T".to_vec(),
                kind: SymbolKind::Excluded,
            },
            crate::convert::stores::SymbolRecord {
                id: SymbolId(1),
                project: ProjectId(0),
                name: b"B".to_vec(),
                kind: SymbolKind::Branch,
            },
        ];

        let all_stats = vec![blocked, blocker];
        assert!(check_blockers(&all_stats, &symbols).is_err());
    }
}
