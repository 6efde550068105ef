use crate::progress::ProgressPrint;

mod artifacts;
mod bin_ser_de;
mod break_cycles;
mod clean_metadata;
mod collate_symbols;
mod collect;
mod extsort;
mod filter_symbols;
mod final_sort;
mod graph;
mod init_changesets;
mod model;
mod options;
mod output;
mod rev_topo_sort;
mod sort_items;
mod stores;
mod verify;

pub(crate) use options::{Encoding, Options, SymbolDefault};
pub(crate) use verify::verify_plan_contents;

#[derive(Debug)]
pub(crate) struct ConvertError;

pub(crate) struct PassContext<'a> {
    pub(crate) options: &'a Options,
    pub(crate) artifacts: &'a artifacts::Artifacts,
    pub(crate) progress: &'a ProgressPrint,
}

pub(crate) struct PassDef {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    run: fn(&PassContext<'_>) -> Result<(), ConvertError>,
}

/// The fixed pass order. Each pass reads files produced by earlier passes
/// and atomically renames its own outputs into place, so an interrupted
/// conversion resumes at the boundary of the last completed pass.
pub(crate) const PASSES: &[PassDef] = &[
    PassDef {
        name: collect::PASS,
        description: "parse RCS files into items, symbol statistics and metadata",
        run: collect::run,
    },
    PassDef {
        name: clean_metadata::PASS,
        description: "re-encode author and log metadata to UTF-8",
        run: clean_metadata::run,
    },
    PassDef {
        name: collate_symbols::PASS,
        description: "classify symbols as branches, tags or excluded",
        run: collate_symbols::run,
    },
    PassDef {
        name: filter_symbols::PASS,
        description: "apply symbol classification and flatten items into streams",
        run: filter_symbols::run,
    },
    PassDef {
        name: sort_items::PASS_REVISIONS,
        description: "sort the revision stream by metadata and time",
        run: sort_items::run_sort_revisions,
    },
    PassDef {
        name: sort_items::PASS_SYMBOLS,
        description: "sort the symbol stream by symbol",
        run: sort_items::run_sort_symbols,
    },
    PassDef {
        name: init_changesets::PASS,
        description: "form draft changesets free of internal dependencies",
        run: init_changesets::run,
    },
    PassDef {
        name: break_cycles::PASS_REVISION,
        description: "break cycles among revision changesets",
        run: break_cycles::run_revision,
    },
    PassDef {
        name: rev_topo_sort::PASS,
        description: "fix the commit order of revision changesets",
        run: rev_topo_sort::run,
    },
    PassDef {
        name: break_cycles::PASS_SYMBOL,
        description: "break cycles among symbol changesets",
        run: break_cycles::run_symbol,
    },
    PassDef {
        name: break_cycles::PASS_ALL,
        description: "break remaining cycles by splitting symbol changesets",
        run: break_cycles::run_all,
    },
    PassDef {
        name: final_sort::PASS,
        description: "emit the final commit order with monotonic timestamps",
        run: final_sort::run,
    },
];

pub(crate) fn convert(
    progress: &ProgressPrint,
    options: &Options,
    out_path: &std::path::Path,
    first_pass: usize,
    last_pass: usize,
    skip_cleanup: bool,
) -> Result<(), ConvertError> {
    debug_assert!(first_pass >= 1 && first_pass <= last_pass && last_pass <= PASSES.len());

    let artifacts = artifacts::Artifacts::new(out_path).map_err(|e| {
        tracing::error!("failed to create output directory {out_path:?}: {e}");
        ConvertError
    })?;

    let completed = artifacts.read_state();
    if first_pass > completed + 1 {
        tracing::error!(
            "cannot start at pass {first_pass} (\"{}\"): only {completed} pass(es) have \
             completed in {out_path:?}",
            PASSES[first_pass - 1].name,
        );
        return Err(ConvertError);
    }

    for (index, pass) in PASSES.iter().enumerate().take(last_pass).skip(first_pass - 1) {
        let started = std::time::Instant::now();
        (pass.run)(&PassContext {
            options,
            artifacts: &artifacts,
            progress,
        })?;
        tracing::info!(
            "pass {} (\"{}\") finished in {:.1?}",
            index + 1,
            pass.name,
            started.elapsed(),
        );

        artifacts.write_state(index + 1).map_err(|e| {
            tracing::error!("failed to record pass completion: {e}");
            ConvertError
        })?;
    }

    if last_pass == PASSES.len() && !skip_cleanup {
        progress.set_progress("removing intermediate files".into());
        artifacts.cleanup();
    }

    Ok(())
}
