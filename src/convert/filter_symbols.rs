use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};

use super::artifacts::names;
use super::model::{CvsBranch, CvsTag, Item, ItemId, Lod, SymbolId, SymbolKind};
use super::stores;
use super::{bin_ser_de, collate_symbols, collect, ConvertError, PassContext};
use crate::FHashMap;

pub(super) const PASS: &str = "filter-symbols";

// The last point at which all items of one file are in memory together.
// Applies the symbol classification (dropping excluded symbols and the
// revisions on excluded branches, converting mis-kinded symbol items),
// elects each symbol's preferred parent and re-points sprout edges at it,
// computes which revisions open and close each symbol's copy source, and
// flattens everything into two sortable line streams.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 4: filter symbols");

    let symbols =
        stores::read_symbols(ctx.artifacts, collate_symbols::PASS).map_err(|e| {
            tracing::error!("failed to read symbol database: {e}");
            ConvertError
        })?;
    let kinds: FHashMap<SymbolId, SymbolKind> = symbols
        .iter()
        .map(|symbol| (symbol.id, symbol.kind))
        .collect();

    let stats = stores::read_symbol_stats(ctx.artifacts, collect::PASS).map_err(|e| {
        tracing::error!("failed to read symbol statistics: {e}");
        ConvertError
    })?;
    let preferred = elect_preferred_parents(&stats, &kinds);

    let mut bundles = ctx
        .artifacts
        .open(names::ITEM_BUNDLES, collect::PASS)
        .map_err(|e| {
            tracing::error!("failed to open item bundles: {e}");
            ConvertError
        })?;

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write filtered streams: {e}");
        ConvertError
    };
    let mut rev_stream = ctx.artifacts.create(names::REV_STREAM, PASS).map_err(io_fail)?;
    let mut symbol_stream = ctx
        .artifacts
        .create(names::SYMBOL_STREAM, PASS)
        .map_err(io_fail)?;

    let mut file_count = 0usize;
    loop {
        let mut len_bytes = [0u8; 4];
        match bundles.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::error!("failed to read item bundle: {e}");
                return Err(ConvertError);
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0; len];
        bundles.read_exact(&mut payload).map_err(|e| {
            tracing::error!("failed to read item bundle: {e}");
            ConvertError
        })?;

        let mut items = parse_bundle(&payload).ok_or_else(|| {
            tracing::error!("corrupt item bundle");
            ConvertError
        })?;

        file_count += 1;
        ctx.progress
            .set_progress(format!("filtering symbols - file {file_count}"));

        filter_file(&mut items, &kinds, &preferred);

        for item in items.values() {
            let payload_hex = bin_ser_de::to_hex(&item.serialize());
            match item {
                Item::Revision(rev) => {
                    writeln!(
                        rev_stream,
                        "{:08x} {:016x} {payload_hex}",
                        rev.metadata.0,
                        biased_timestamp(rev.timestamp),
                    )
                    .map_err(io_fail)?;
                }
                Item::Branch(branch) => {
                    writeln!(symbol_stream, "{:08x} {payload_hex}", branch.symbol.0)
                        .map_err(io_fail)?;
                }
                Item::Tag(tag) => {
                    writeln!(symbol_stream, "{:08x} {payload_hex}", tag.symbol.0)
                        .map_err(io_fail)?;
                }
            }
        }
    }

    rev_stream.flush().map_err(io_fail)?;
    symbol_stream.flush().map_err(io_fail)?;
    ctx.artifacts
        .commit(&[names::REV_STREAM, names::SYMBOL_STREAM])
        .map_err(io_fail)?;

    tracing::info!("filtered {file_count} files");
    Ok(())
}

/// Timestamps sort lexicographically once biased into unsigned range.
pub(super) fn biased_timestamp(timestamp: i64) -> u64 {
    (timestamp as i128 + (1i128 << 63)) as u64
}

pub(super) fn unbias_timestamp(biased: u64) -> i64 {
    (biased as i128 - (1i128 << 63)) as i64
}

fn parse_bundle(mut payload: &[u8]) -> Option<BTreeMap<ItemId, Item>> {
    let count = bin_ser_de::deserialize_u32_from(&mut payload).ok()?;
    let mut items = BTreeMap::new();
    for _ in 0..count {
        let item = Item::deserialize_from(&mut payload).ok()?;
        items.insert(item.id(), item);
    }
    payload.is_empty().then_some(items)
}

/// Project-wide election: the line of development that explains the most
/// per-file sprout locations wins. Ties prefer trunk, then the lowest
/// symbol id. Excluded and tag symbols cannot be parents.
fn elect_preferred_parents(
    stats: &[crate::convert::model::SymbolStats],
    kinds: &FHashMap<SymbolId, SymbolKind>,
) -> FHashMap<SymbolId, Lod> {
    let mut preferred = FHashMap::default();
    for record in stats.iter() {
        if kinds[&record.symbol] == SymbolKind::Excluded {
            continue;
        }

        let best = record
            .possible_parents
            .iter()
            .filter(|(lod, _)| match lod {
                Lod::Trunk => true,
                Lod::Branch(symbol) => kinds[symbol] == SymbolKind::Branch,
            })
            .max_by_key(|(lod, count)| {
                let tie_break = match lod {
                    Lod::Trunk => (1u8, std::cmp::Reverse(SymbolId(0))),
                    Lod::Branch(symbol) => (0, std::cmp::Reverse(*symbol)),
                };
                (*count, tie_break)
            });

        if let Some((lod, _)) = best {
            preferred.insert(record.symbol, *lod);
        }
    }
    preferred
}

fn filter_file(
    items: &mut BTreeMap<ItemId, Item>,
    kinds: &FHashMap<SymbolId, SymbolKind>,
    preferred: &FHashMap<SymbolId, Lod>,
) {
    drop_excluded(items, kinds);
    reinterpret_kinds(items, kinds);
    adjust_sprouts(items, preferred);
    compute_openings_closings(items);
}

/// Items of excluded symbols disappear, along with every revision on an
/// excluded branch. Dangling references are repaired afterwards.
fn drop_excluded(items: &mut BTreeMap<ItemId, Item>, kinds: &FHashMap<SymbolId, SymbolKind>) {
    let excluded = |symbol: SymbolId| kinds[&symbol] == SymbolKind::Excluded;

    let doomed: Vec<ItemId> = items
        .values()
        .filter_map(|item| match item {
            Item::Revision(rev) => match rev.lod {
                Lod::Branch(symbol) if excluded(symbol) => Some(rev.id),
                _ => None,
            },
            Item::Branch(branch) => excluded(branch.symbol).then_some(branch.id),
            Item::Tag(tag) => excluded(tag.symbol).then_some(tag.id),
        })
        .collect();

    if doomed.is_empty() {
        return;
    }
    for id in doomed {
        items.remove(&id);
    }

    let live: std::collections::BTreeSet<ItemId> = items.keys().copied().collect();
    for item in items.values_mut() {
        match item {
            Item::Revision(rev) => {
                rev.prev = rev.prev.filter(|id| live.contains(id));
                rev.next = rev.next.filter(|id| live.contains(id));
                rev.branches.retain(|id| live.contains(id));
                rev.tags.retain(|id| live.contains(id));
            }
            Item::Branch(branch) => {
                branch.source = branch.source.filter(|id| live.contains(id));
                branch.first_commit = branch.first_commit.filter(|id| live.contains(id));
            }
            Item::Tag(tag) => {
                tag.source = tag.source.filter(|id| live.contains(id));
            }
        }
    }
}

/// Converts symbol items whose per-file role disagrees with the global
/// classification, keeping their item ids.
fn reinterpret_kinds(items: &mut BTreeMap<ItemId, Item>, kinds: &FHashMap<SymbolId, SymbolKind>) {
    let ids: Vec<ItemId> = items.keys().copied().collect();
    for id in ids {
        let converted = match items.get(&id) {
            Some(Item::Branch(branch)) if kinds[&branch.symbol] == SymbolKind::Tag => {
                // The collate pass guarantees a tag-classified symbol has no
                // branch commits anywhere.
                debug_assert!(branch.first_commit.is_none());
                Some((
                    branch.source,
                    Item::Tag(CvsTag {
                        id: branch.id,
                        file: branch.file,
                        symbol: branch.symbol,
                        source: branch.source,
                    }),
                    true,
                ))
            }
            Some(Item::Tag(tag)) if kinds[&tag.symbol] == SymbolKind::Branch => Some((
                tag.source,
                Item::Branch(CvsBranch {
                    id: tag.id,
                    file: tag.file,
                    symbol: tag.symbol,
                    source: tag.source,
                    first_commit: None,
                }),
                false,
            )),
            _ => None,
        };

        let Some((source, new_item, was_branch)) = converted else {
            continue;
        };
        items.insert(id, new_item);
        if let Some(source) = source {
            if let Some(Item::Revision(rev)) = items.get_mut(&source) {
                if was_branch {
                    rev.branches.retain(|b| *b != id);
                    rev.tags.push(id);
                } else {
                    rev.tags.retain(|t| *t != id);
                    rev.branches.push(id);
                }
            }
        }
    }
}

/// Re-points each symbol's sprout at the project-wide preferred parent
/// where this file allows it: if the preferred parent branch also sprouts
/// from the same revision, the symbol is copied from that branch instead.
fn adjust_sprouts(items: &mut BTreeMap<ItemId, Item>, preferred: &FHashMap<SymbolId, Lod>) {
    let ids: Vec<ItemId> = items.keys().copied().collect();
    for id in ids {
        let (symbol, source) = match items.get(&id) {
            Some(Item::Branch(branch)) => (branch.symbol, branch.source),
            Some(Item::Tag(tag)) => (tag.symbol, tag.source),
            _ => continue,
        };
        let Some(source) = source else {
            continue;
        };
        let Some(&Lod::Branch(preferred_symbol)) = preferred.get(&symbol) else {
            // Trunk preferred or no election: trunk sources stay put, and a
            // symbol sprouting from a branch revision has no trunk
            // alternative within this file.
            continue;
        };

        let Some(Item::Revision(source_rev)) = items.get(&source) else {
            continue;
        };
        if source_rev.lod == Lod::Branch(preferred_symbol) {
            continue;
        }

        // Sprout adjustment: copy from the preferred parent's branch item
        // at the same base revision, when it exists here.
        let Some(parent_branch) = source_rev.branches.iter().copied().find(|&b| {
            matches!(
                items.get(&b),
                Some(Item::Branch(branch)) if branch.symbol == preferred_symbol
            )
        }) else {
            continue;
        };

        if let Some(Item::Revision(rev)) = items.get_mut(&source) {
            rev.branches.retain(|b| *b != id);
            rev.tags.retain(|t| *t != id);
        }
        match items.get_mut(&id) {
            Some(Item::Branch(branch)) => branch.source = Some(parent_branch),
            Some(Item::Tag(tag)) => tag.source = Some(parent_branch),
            _ => unreachable!(),
        }
    }
}

/// A revision opens every symbol copied from it and closes every symbol
/// whose copied state it overwrites.
fn compute_openings_closings(items: &mut BTreeMap<ItemId, Item>) {
    let mut opens: Vec<(ItemId, ItemId)> = Vec::new();
    let mut closes: Vec<(ItemId, ItemId)> = Vec::new();

    for item in items.values() {
        let (id, source) = match item {
            Item::Branch(branch) => (branch.id, branch.source),
            Item::Tag(tag) => (tag.id, tag.source),
            Item::Revision(_) => continue,
        };
        let Some(source) = source else {
            continue;
        };
        match items.get(&source) {
            Some(Item::Revision(rev)) => {
                if rev.dead {
                    continue;
                }
                opens.push((source, id));
                if let Some(next) = rev.next {
                    closes.push((next, id));
                }
            }
            Some(Item::Branch(branch)) => {
                // Copied from the branch creation itself; the state lasts
                // until the first commit on that branch.
                if let Some(first_commit) = branch.first_commit {
                    closes.push((first_commit, id));
                }
            }
            _ => {}
        }
    }

    for (revision, symbol_item) in opens {
        if let Some(Item::Revision(rev)) = items.get_mut(&revision) {
            rev.opens.push(symbol_item);
        }
    }
    for (revision, symbol_item) in closes {
        if let Some(Item::Revision(rev)) = items.get_mut(&revision) {
            rev.closes.push(symbol_item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::model::{CvsRevision, FileId, MetadataId, SymbolStats};
    use crate::rcs::number::RevNum;
    use smallvec::SmallVec;

    fn revision(id: u32, number: &str, lod: Lod) -> Item {
        Item::Revision(CvsRevision {
            id: ItemId(id),
            file: FileId(0),
            lod,
            number: RevNum::parse(number.as_bytes()).unwrap(),
            timestamp: 1000 + i64::from(id),
            dead: false,
            metadata: MetadataId(0),
            prev: None,
            next: None,
            branches: SmallVec::new(),
            tags: SmallVec::new(),
            opens: vec![],
            closes: vec![],
        })
    }

    fn link(items: &mut BTreeMap<ItemId, Item>, older: u32, newer: u32) {
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(older)) {
            rev.next = Some(ItemId(newer));
        }
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(newer)) {
            rev.prev = Some(ItemId(older));
        }
    }

    #[test]
    fn biased_timestamps_sort() {
        assert!(biased_timestamp(-5) < biased_timestamp(0));
        assert!(biased_timestamp(0) < biased_timestamp(5));
        assert_eq!(unbias_timestamp(biased_timestamp(-12345)), -12345);
    }

    #[test]
    fn excluded_branch_takes_its_revisions() {
        let mut items = BTreeMap::new();
        items.insert(ItemId(0), revision(0, "1.1", Lod::Trunk));
        items.insert(
            ItemId(1),
            Item::Branch(CvsBranch {
                id: ItemId(1),
                file: FileId(0),
                symbol: SymbolId(0),
                source: Some(ItemId(0)),
                first_commit: Some(ItemId(2)),
            }),
        );
        items.insert(ItemId(2), revision(2, "1.1.2.1", Lod::Branch(SymbolId(0))));
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(0)) {
            rev.branches.push(ItemId(1));
        }
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(2)) {
            rev.prev = Some(ItemId(1));
        }

        let mut kinds = FHashMap::default();
        kinds.insert(SymbolId(0), SymbolKind::Excluded);
        drop_excluded(&mut items, &kinds);

        assert_eq!(items.len(), 1);
        let Some(Item::Revision(rev)) = items.get(&ItemId(0)) else {
            panic!("trunk revision should survive");
        };
        assert!(rev.branches.is_empty());
    }

    #[test]
    fn tag_to_branch_conversion_keeps_id() {
        let mut items = BTreeMap::new();
        items.insert(ItemId(0), revision(0, "1.1", Lod::Trunk));
        items.insert(
            ItemId(1),
            Item::Tag(CvsTag {
                id: ItemId(1),
                file: FileId(0),
                symbol: SymbolId(0),
                source: Some(ItemId(0)),
            }),
        );
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(0)) {
            rev.tags.push(ItemId(1));
        }

        let mut kinds = FHashMap::default();
        kinds.insert(SymbolId(0), SymbolKind::Branch);
        reinterpret_kinds(&mut items, &kinds);

        assert!(matches!(items.get(&ItemId(1)), Some(Item::Branch(_))));
        let Some(Item::Revision(rev)) = items.get(&ItemId(0)) else {
            unreachable!();
        };
        assert_eq!(rev.branches.as_slice(), &[ItemId(1)]);
        assert!(rev.tags.is_empty());
    }

    #[test]
    fn preferred_parent_election_tie_breaks_to_trunk() {
        let stats = vec![SymbolStats {
            symbol: SymbolId(0),
            project: crate::convert::model::ProjectId(0),
            name: b"T".to_vec(),
            tag_uses: 2,
            branch_uses: 0,
            branch_commit_files: 0,
            blockers: vec![],
            possible_parents: vec![(Lod::Branch(SymbolId(1)), 2), (Lod::Trunk, 2)],
        }];
        let mut kinds = FHashMap::default();
        kinds.insert(SymbolId(0), SymbolKind::Tag);
        kinds.insert(SymbolId(1), SymbolKind::Branch);

        let preferred = elect_preferred_parents(&stats, &kinds);
        assert_eq!(preferred[&SymbolId(0)], Lod::Trunk);
    }

    #[test]
    fn sprout_adjustment_repoints_at_preferred_branch() {
        let mut items = BTreeMap::new();
        items.insert(ItemId(0), revision(0, "1.2", Lod::Trunk));
        // Branch B and tag T both sprout from 1.2; T prefers B.
        items.insert(
            ItemId(1),
            Item::Branch(CvsBranch {
                id: ItemId(1),
                file: FileId(0),
                symbol: SymbolId(0),
                source: Some(ItemId(0)),
                first_commit: None,
            }),
        );
        items.insert(
            ItemId(2),
            Item::Tag(CvsTag {
                id: ItemId(2),
                file: FileId(0),
                symbol: SymbolId(1),
                source: Some(ItemId(0)),
            }),
        );
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(0)) {
            rev.branches.push(ItemId(1));
            rev.tags.push(ItemId(2));
        }

        let mut preferred = FHashMap::default();
        preferred.insert(SymbolId(1), Lod::Branch(SymbolId(0)));
        adjust_sprouts(&mut items, &preferred);

        let Some(Item::Tag(tag)) = items.get(&ItemId(2)) else {
            unreachable!();
        };
        assert_eq!(tag.source, Some(ItemId(1)));
        let Some(Item::Revision(rev)) = items.get(&ItemId(0)) else {
            unreachable!();
        };
        assert!(rev.tags.is_empty());
    }

    #[test]
    fn openings_and_closings() {
        let mut items = BTreeMap::new();
        items.insert(ItemId(0), revision(0, "1.1", Lod::Trunk));
        items.insert(ItemId(1), revision(1, "1.2", Lod::Trunk));
        link(&mut items, 0, 1);
        items.insert(
            ItemId(2),
            Item::Tag(CvsTag {
                id: ItemId(2),
                file: FileId(0),
                symbol: SymbolId(0),
                source: Some(ItemId(0)),
            }),
        );
        if let Some(Item::Revision(rev)) = items.get_mut(&ItemId(0)) {
            rev.tags.push(ItemId(2));
        }

        compute_openings_closings(&mut items);

        let Some(Item::Revision(rev_1_1)) = items.get(&ItemId(0)) else {
            unreachable!();
        };
        assert_eq!(rev_1_1.opens, vec![ItemId(2)]);
        let Some(Item::Revision(rev_1_2)) = items.get(&ItemId(1)) else {
            unreachable!();
        };
        assert_eq!(rev_1_2.closes, vec![ItemId(2)]);
    }
}
