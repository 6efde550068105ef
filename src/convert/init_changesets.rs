use std::io::BufRead as _;

use super::artifacts::names;
use super::model::{
    Changeset, ChangesetId, ChangesetKind, Item, ItemId, MetadataId, SymbolId, SymbolKind,
};
use super::stores::{self, ItemStoreWriter};
use super::{bin_ser_de, collate_symbols, filter_symbols, sort_items, ConvertError, PassContext};
use crate::FHashMap;

pub(super) const PASS: &str = "init-changesets";

// First-draft changesets. Revisions grouped by identical metadata within the
// commit threshold form revision changesets; a draft that still contains an
// intra-changeset dependency (two revisions of one file committed in quick
// succession) is split until none remain. Symbol items group into one
// changeset per symbol. Items are rewritten grouped by changeset so later
// passes read them with good locality.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 7: initialize changesets");

    let symbols = stores::read_symbols(ctx.artifacts, collate_symbols::PASS).map_err(|e| {
        tracing::error!("failed to read symbol database: {e}");
        ConvertError
    })?;
    let kinds: FHashMap<SymbolId, SymbolKind> = symbols
        .iter()
        .map(|symbol| (symbol.id, symbol.kind))
        .collect();

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write changeset outputs: {e}");
        ConvertError
    };

    let mut out = Output {
        changesets: Vec::new(),
        item_map: FHashMap::default(),
        items: ItemStoreWriter::new(ctx.artifacts, PASS).map_err(io_fail)?,
    };

    read_revision_groups(ctx, &mut out)?;
    let revision_changesets = out.changesets.len();
    read_symbol_groups(ctx, &kinds, &mut out)?;

    tracing::info!(
        "{} revision changesets, {} symbol changesets",
        revision_changesets,
        out.changesets.len() - revision_changesets,
    );

    out.items.finish(ctx.artifacts, PASS).map_err(io_fail)?;
    stores::write_changesets(ctx.artifacts, names::CHANGESETS_INIT, PASS, &out.changesets)
        .map_err(io_fail)?;
    stores::write_item_map(ctx.artifacts, names::ITEM_MAP_INIT, PASS, &out.item_map)
        .map_err(io_fail)?;
    ctx.artifacts
        .commit(&[
            names::ITEMS,
            names::ITEM_INDEX,
            names::CHANGESETS_INIT,
            names::ITEM_MAP_INIT,
        ])
        .map_err(io_fail)
}

struct Output {
    changesets: Vec<Changeset>,
    item_map: FHashMap<ItemId, ChangesetId>,
    items: ItemStoreWriter,
}

impl Output {
    fn push_changeset(
        &mut self,
        kind: ChangesetKind,
        items: Vec<Item>,
    ) -> Result<(), std::io::Error> {
        let id = ChangesetId(u32::try_from(self.changesets.len()).unwrap());
        let mut item_ids = Vec::with_capacity(items.len());
        for item in items.iter() {
            item_ids.push(item.id());
            self.item_map.insert(item.id(), id);
            self.items.put(item)?;
        }
        self.changesets.push(Changeset {
            id,
            kind,
            items: item_ids,
            order: None,
        });
        Ok(())
    }
}

fn read_revision_groups(ctx: &PassContext<'_>, out: &mut Output) -> Result<(), ConvertError> {
    let mut reader = ctx
        .artifacts
        .open(names::REV_STREAM_SORTED, sort_items::PASS_REVISIONS)
        .map_err(|e| {
            tracing::error!("failed to open sorted revision stream: {e}");
            ConvertError
        })?;

    let threshold = ctx.options.commit_threshold;
    let mut group: Vec<Item> = Vec::new();
    let mut group_key: Option<(MetadataId, i64)> = None;

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).map_err(|e| {
            tracing::error!("failed to read sorted revision stream: {e}");
            ConvertError
        })?;

        let parsed = if n == 0 {
            None
        } else {
            let (metadata, timestamp, item) =
                parse_revision_line(&line).ok_or_else(|| {
                    tracing::error!("corrupt sorted revision stream line");
                    ConvertError
                })?;
            Some((metadata, timestamp, item))
        };

        let flush = match (&group_key, &parsed) {
            (Some((metadata, last_ts)), Some((next_metadata, next_ts, _))) => {
                *metadata != *next_metadata || next_ts - last_ts > threshold
            }
            (Some(_), None) => true,
            (None, _) => false,
        };

        if flush {
            let metadata = group_key.unwrap().0;
            flush_revision_group(out, metadata, std::mem::take(&mut group)).map_err(|e| {
                tracing::error!("failed to write changeset: {e}");
                ConvertError
            })?;
            group_key = None;
        }

        match parsed {
            None => break,
            Some((metadata, timestamp, item)) => {
                group_key = Some((metadata, timestamp));
                group.push(item);
                if group.len() % 1024 == 0 {
                    ctx.progress.set_progress(format!(
                        "initializing changesets - {} so far",
                        out.changesets.len(),
                    ));
                }
            }
        }
    }

    Ok(())
}

fn flush_revision_group(
    out: &mut Output,
    metadata: MetadataId,
    group: Vec<Item>,
) -> Result<(), std::io::Error> {
    for part in split_internal_dependencies(group) {
        out.push_changeset(ChangesetKind::Revision { metadata }, part)?;
    }
    Ok(())
}

fn read_symbol_groups(
    ctx: &PassContext<'_>,
    kinds: &FHashMap<SymbolId, SymbolKind>,
    out: &mut Output,
) -> Result<(), ConvertError> {
    let mut reader = ctx
        .artifacts
        .open(names::SYMBOL_STREAM_SORTED, sort_items::PASS_SYMBOLS)
        .map_err(|e| {
            tracing::error!("failed to open sorted symbol stream: {e}");
            ConvertError
        })?;

    let mut group: Vec<Item> = Vec::new();
    let mut group_symbol: Option<SymbolId> = None;

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).map_err(|e| {
            tracing::error!("failed to read sorted symbol stream: {e}");
            ConvertError
        })?;

        let parsed = if n == 0 {
            None
        } else {
            Some(parse_symbol_line(&line).ok_or_else(|| {
                tracing::error!("corrupt sorted symbol stream line");
                ConvertError
            })?)
        };

        if let Some(symbol) = group_symbol {
            if parsed.as_ref().map(|(s, _)| *s) != Some(symbol) {
                flush_symbol_group(out, kinds, symbol, std::mem::take(&mut group))?;
                group_symbol = None;
            }
        }

        match parsed {
            None => break,
            Some((symbol, item)) => {
                group_symbol = Some(symbol);
                group.push(item);
            }
        }
    }

    Ok(())
}

fn flush_symbol_group(
    out: &mut Output,
    kinds: &FHashMap<SymbolId, SymbolKind>,
    symbol: SymbolId,
    group: Vec<Item>,
) -> Result<(), ConvertError> {
    let kind = match kinds.get(&symbol) {
        Some(SymbolKind::Branch) => ChangesetKind::Branch { symbol },
        Some(SymbolKind::Tag) => ChangesetKind::Tag { symbol },
        _ => {
            tracing::error!("symbol {symbol} in stream is not classified as branch or tag");
            return Err(ConvertError);
        }
    };
    out.push_changeset(kind, group).map_err(|e| {
        tracing::error!("failed to write changeset: {e}");
        ConvertError
    })
}

fn parse_revision_line(line: &[u8]) -> Option<(MetadataId, i64, Item)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut fields = line.split(|&c| c == b' ');
    let metadata = u32::from_str_radix(std::str::from_utf8(fields.next()?).ok()?, 16).ok()?;
    let biased = u64::from_str_radix(std::str::from_utf8(fields.next()?).ok()?, 16).ok()?;
    let payload = bin_ser_de::from_hex(fields.next()?).ok()?;
    if fields.next().is_some() {
        return None;
    }
    let item = Item::deserialize(&payload).ok()?;
    Some((
        MetadataId(metadata),
        filter_symbols::unbias_timestamp(biased),
        item,
    ))
}

fn parse_symbol_line(line: &[u8]) -> Option<(SymbolId, Item)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut fields = line.split(|&c| c == b' ');
    let symbol = u32::from_str_radix(std::str::from_utf8(fields.next()?).ok()?, 16).ok()?;
    let payload = bin_ser_de::from_hex(fields.next()?).ok()?;
    if fields.next().is_some() {
        return None;
    }
    let item = Item::deserialize(&payload).ok()?;
    Some((SymbolId(symbol), item))
}

/// Splits a draft changeset until no member depends on another member.
///
/// Members are first put in dependency-respecting timestamp order, so every
/// internal edge points forward; the index breaking the most edges is split
/// at, recursively.
fn split_internal_dependencies(group: Vec<Item>) -> Vec<Vec<Item>> {
    let ordered = order_members(group);

    let mut parts = Vec::new();
    split_ordered(ordered, &mut parts);
    parts
}

fn order_members(group: Vec<Item>) -> Vec<Item> {
    let in_group: FHashMap<ItemId, usize> = group
        .iter()
        .enumerate()
        .map(|(index, item)| (item.id(), index))
        .collect();

    // Kahn over the member dependency forest, smallest (timestamp, id)
    // first. Dependency chains within one file stay in dependency order
    // even when their CVS timestamps are shuffled.
    let mut in_degree = vec![0usize; group.len()];
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); group.len()];
    for (index, item) in group.iter().enumerate() {
        for pred in item.preds() {
            if let Some(&pred_index) = in_group.get(&pred) {
                in_degree[index] += 1;
                succs[pred_index].push(index);
            }
        }
    }

    let key = |item: &Item| {
        let rev = item.as_revision().expect("revision changesets hold revisions");
        (rev.timestamp, rev.id)
    };

    let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<((i64, ItemId), usize)>> =
        in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(index, _)| std::cmp::Reverse((key(&group[index]), index)))
            .collect();

    let mut order = Vec::with_capacity(group.len());
    while let Some(std::cmp::Reverse((_, index))) = ready.pop() {
        order.push(index);
        for &succ in succs[index].iter() {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(std::cmp::Reverse((key(&group[succ]), succ)));
            }
        }
    }
    debug_assert_eq!(order.len(), group.len(), "cyclic intra-file dependencies");

    let mut indexed: Vec<Option<Item>> = group.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|index| indexed[index].take().unwrap())
        .collect()
}

fn split_ordered(members: Vec<Item>, parts: &mut Vec<Vec<Item>>) {
    let positions: FHashMap<ItemId, usize> = members
        .iter()
        .enumerate()
        .map(|(index, item)| (item.id(), index))
        .collect();

    // Internal edges as (pred_index, dependent_index) pairs.
    let mut edges = Vec::new();
    for (index, item) in members.iter().enumerate() {
        for pred in item.preds() {
            if let Some(&pred_index) = positions.get(&pred) {
                debug_assert!(pred_index < index);
                edges.push((pred_index, index));
            }
        }
    }

    if edges.is_empty() {
        parts.push(members);
        return;
    }

    let best_split = (1..members.len())
        .max_by_key(|&split| {
            let broken = edges
                .iter()
                .filter(|&&(pred, dependent)| pred < split && split <= dependent)
                .count();
            // Earliest index among equally good splits.
            (broken, std::cmp::Reverse(split))
        })
        .unwrap();

    let mut first = members;
    let second = first.split_off(best_split);
    split_ordered(first, parts);
    split_ordered(second, parts);
}

#[cfg(test)]
mod tests {
    use super::{parse_revision_line, split_internal_dependencies};
    use crate::convert::filter_symbols::biased_timestamp;
    use crate::convert::model::{
        CvsRevision, FileId, Item, ItemId, Lod, MetadataId,
    };
    use crate::rcs::number::RevNum;
    use smallvec::SmallVec;

    fn revision(id: u32, file: u32, number: &str, timestamp: i64, prev: Option<u32>) -> Item {
        Item::Revision(CvsRevision {
            id: ItemId(id),
            file: FileId(file),
            lod: Lod::Trunk,
            number: RevNum::parse(number.as_bytes()).unwrap(),
            timestamp,
            dead: false,
            metadata: MetadataId(0),
            prev: prev.map(ItemId),
            next: None,
            branches: SmallVec::new(),
            tags: SmallVec::new(),
            opens: vec![],
            closes: vec![],
        })
    }

    #[test]
    fn no_internal_dependency_stays_whole() {
        let group = vec![
            revision(0, 0, "1.1", 100, None),
            revision(1, 1, "1.1", 105, None),
        ];
        let parts = split_internal_dependencies(group);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 2);
    }

    #[test]
    fn successive_revisions_of_one_file_split_apart() {
        let group = vec![
            revision(0, 0, "1.1", 100, None),
            revision(1, 0, "1.2", 120, Some(0)),
            revision(2, 1, "1.1", 110, None),
        ];
        let parts = split_internal_dependencies(group);
        assert_eq!(parts.len(), 2);
        // 1.1 must land in an earlier part than 1.2.
        let part_of = |id: u32| {
            parts
                .iter()
                .position(|part| part.iter().any(|item| item.id() == ItemId(id)))
                .unwrap()
        };
        assert!(part_of(0) < part_of(1));
    }

    #[test]
    fn inverted_timestamps_still_split_in_dependency_order() {
        // 1.2 has an *earlier* CVS timestamp than its predecessor 1.1.
        let group = vec![
            revision(0, 0, "1.1", 1000, None),
            revision(1, 0, "1.2", 999, Some(0)),
        ];
        let parts = split_internal_dependencies(group);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0][0].id(), ItemId(0));
        assert_eq!(parts[1][0].id(), ItemId(1));
    }

    #[test]
    fn revision_line_round_trip() {
        let item = revision(7, 3, "1.4", -50, Some(6));
        let line = format!(
            "{:08x} {:016x} {}\n",
            0,
            biased_timestamp(-50),
            crate::convert::bin_ser_de::to_hex(&item.serialize()),
        );
        let (metadata, timestamp, parsed) = parse_revision_line(line.as_bytes()).unwrap();
        assert_eq!(metadata, MetadataId(0));
        assert_eq!(timestamp, -50);
        assert_eq!(parsed, item);
    }
}
