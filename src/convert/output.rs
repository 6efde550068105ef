use std::io::Write as _;

use super::artifacts::names;
use super::model::{Changeset, ChangesetId, ChangesetKind, FileId, Item, ItemId, SymbolId};
use super::stores::{self, ItemStore};
use super::{collate_symbols, collect, ConvertError, PassContext};
use crate::FHashMap;

// The three sink-facing outputs, written by the final sort pass:
//
//   commit-order               CHANGESET_ID TIMESTAMP per line
//   commit-plan                per-commit member listing with copy sources
//   symbol-openings-closings   SYMBOL_ID SVN_REVNUM {O|C} CVS_SYMBOL_ID,
//                              sorted by symbol then revnum, all hex
//
// The sink uses the openings/closings log to pick optimal copy sources when
// filling symbol directories.

pub(super) fn write_outputs(
    ctx: &PassContext<'_>,
    pass: &str,
    commits: &[(ChangesetId, i64)],
    changesets: &[Changeset],
    store: &mut ItemStore,
    map: &FHashMap<ItemId, ChangesetId>,
) -> Result<(), ConvertError> {
    let paths = stores::read_paths(ctx.artifacts, collect::PASS).map_err(|e| {
        tracing::error!("failed to read path table: {e}");
        ConvertError
    })?;
    let path_names: FHashMap<FileId, String> = paths
        .iter()
        .map(|path| {
            (
                path.id,
                String::from_utf8_lossy(&path.path).into_owned(),
            )
        })
        .collect();

    let symbols = stores::read_symbols(ctx.artifacts, collate_symbols::PASS).map_err(|e| {
        tracing::error!("failed to read symbol database: {e}");
        ConvertError
    })?;
    let symbol_names: FHashMap<SymbolId, String> = symbols
        .iter()
        .map(|symbol| {
            (
                symbol.id,
                String::from_utf8_lossy(&symbol.name).into_owned(),
            )
        })
        .collect();

    let by_id: FHashMap<ChangesetId, &Changeset> = changesets
        .iter()
        .map(|changeset| (changeset.id, changeset))
        .collect();

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write conversion outputs: {e}");
        ConvertError
    };

    let mut order_out = ctx.artifacts.create(names::COMMIT_ORDER, pass).map_err(io_fail)?;
    for &(id, timestamp) in commits {
        writeln!(order_out, "{id} {timestamp}").map_err(io_fail)?;
    }
    order_out.flush().map_err(io_fail)?;

    write_plan(
        ctx,
        pass,
        commits,
        &by_id,
        store,
        &path_names,
        &symbol_names,
    )?;
    write_openings_closings(ctx, pass, commits, store, map)?;

    Ok(())
}

fn write_plan(
    ctx: &PassContext<'_>,
    pass: &str,
    commits: &[(ChangesetId, i64)],
    by_id: &FHashMap<ChangesetId, &Changeset>,
    store: &mut ItemStore,
    path_names: &FHashMap<FileId, String>,
    symbol_names: &FHashMap<SymbolId, String>,
) -> Result<(), ConvertError> {
    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write commit plan: {e}");
        ConvertError
    };
    let store_fail = |e: stores::StoreError| {
        tracing::error!("failed to read item store: {e}");
        ConvertError
    };

    let mut plan = ctx.artifacts.create(names::COMMIT_PLAN, pass).map_err(io_fail)?;
    writeln!(
        plan,
        "keep-cvsignore {}",
        if ctx.options.keep_cvsignore { "1" } else { "0" },
    )
    .map_err(io_fail)?;

    for (index, &(id, timestamp)) in commits.iter().enumerate() {
        if index % 256 == 0 {
            ctx.progress.set_progress(format!(
                "writing commit plan - {index} / {}",
                commits.len(),
            ));
        }

        let changeset = by_id[&id];
        match changeset.kind {
            ChangesetKind::Revision { metadata } => {
                writeln!(plan, "commit {id} {timestamp} rev {metadata}").map_err(io_fail)?;
            }
            ChangesetKind::Branch { symbol } => {
                writeln!(
                    plan,
                    "commit {id} {timestamp} branch {}",
                    symbol_names[&symbol],
                )
                .map_err(io_fail)?;
            }
            ChangesetKind::Tag { symbol } => {
                writeln!(
                    plan,
                    "commit {id} {timestamp} tag {}",
                    symbol_names[&symbol],
                )
                .map_err(io_fail)?;
            }
        }

        let mut member_ids = changeset.items.clone();
        member_ids.sort_unstable();
        for item_id in member_ids {
            let item = store.get(item_id).map_err(store_fail)?;
            match item {
                Item::Revision(rev) => {
                    writeln!(
                        plan,
                        " rev {} {} {}",
                        path_names[&rev.file],
                        rev.number,
                        if rev.dead { "dead" } else { "live" },
                    )
                    .map_err(io_fail)?;
                }
                Item::Branch(branch) => {
                    let source =
                        describe_source(branch.source, store, path_names, symbol_names)
                            .map_err(store_fail)?;
                    writeln!(
                        plan,
                        " branch {} {} {source}",
                        symbol_names[&branch.symbol],
                        path_names[&branch.file],
                    )
                    .map_err(io_fail)?;
                }
                Item::Tag(tag) => {
                    let source = describe_source(tag.source, store, path_names, symbol_names)
                        .map_err(store_fail)?;
                    writeln!(
                        plan,
                        " tag {} {} {source}",
                        symbol_names[&tag.symbol],
                        path_names[&tag.file],
                    )
                    .map_err(io_fail)?;
                }
            }
        }
    }

    plan.flush().map_err(io_fail)
}

fn describe_source(
    source: Option<ItemId>,
    store: &mut ItemStore,
    path_names: &FHashMap<FileId, String>,
    symbol_names: &FHashMap<SymbolId, String>,
) -> Result<String, stores::StoreError> {
    let Some(source) = source else {
        return Ok("fresh".to_owned());
    };
    Ok(match store.get(source)? {
        Item::Revision(rev) => {
            format!("from {}:{}", path_names[&rev.file], rev.number)
        }
        Item::Branch(branch) => format!("from-branch {}", symbol_names[&branch.symbol]),
        Item::Tag(_) => "fresh".to_owned(),
    })
}

fn write_openings_closings(
    ctx: &PassContext<'_>,
    pass: &str,
    commits: &[(ChangesetId, i64)],
    store: &mut ItemStore,
    map: &FHashMap<ItemId, ChangesetId>,
) -> Result<(), ConvertError> {
    ctx.progress
        .set_progress("writing symbol openings and closings".into());

    // 1-based SVN revision numbers in commit order.
    let revnum: FHashMap<ChangesetId, u32> = commits
        .iter()
        .enumerate()
        .map(|(index, &(id, _))| (id, u32::try_from(index).unwrap() + 1))
        .collect();

    let mut symbol_of: FHashMap<ItemId, SymbolId> = FHashMap::default();
    let mut sources: Vec<(ItemId, ItemId)> = Vec::new();
    let mut closings: Vec<(ItemId, ItemId)> = Vec::new();
    store
        .for_each(|item| match item {
            Item::Branch(ref branch) => {
                symbol_of.insert(branch.id, branch.symbol);
                if let Some(source) = branch.source {
                    sources.push((branch.id, source));
                }
            }
            Item::Tag(ref tag) => {
                symbol_of.insert(tag.id, tag.symbol);
                if let Some(source) = tag.source {
                    sources.push((tag.id, source));
                }
            }
            Item::Revision(ref rev) => {
                for &symbol_item in rev.closes.iter() {
                    closings.push((rev.id, symbol_item));
                }
            }
        })
        .map_err(|e| {
            tracing::error!("failed to stream item store: {e}");
            ConvertError
        })?;

    // (symbol, svn revnum, is_closing, per-file symbol item)
    let mut entries: Vec<(SymbolId, u32, bool, ItemId)> = Vec::new();
    for (symbol_item, source) in sources {
        let Some(&source_changeset) = map.get(&source) else {
            continue;
        };
        if let Some(&revnum) = revnum.get(&source_changeset) {
            entries.push((symbol_of[&symbol_item], revnum, false, symbol_item));
        }
    }
    for (revision, symbol_item) in closings {
        let Some(symbol) = symbol_of.get(&symbol_item).copied() else {
            continue;
        };
        if let Some(&revnum) = map.get(&revision).and_then(|changeset| revnum.get(changeset)) {
            entries.push((symbol, revnum, true, symbol_item));
        }
    }
    entries.sort_unstable();

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write openings/closings: {e}");
        ConvertError
    };
    let mut out = ctx
        .artifacts
        .create(names::OPENINGS_CLOSINGS, pass)
        .map_err(io_fail)?;
    for (symbol, revnum, is_closing, symbol_item) in entries {
        writeln!(
            out,
            "{symbol} {revnum:x} {} {symbol_item}",
            if is_closing { "C" } else { "O" },
        )
        .map_err(io_fail)?;
    }
    out.flush().map_err(io_fail)
}
