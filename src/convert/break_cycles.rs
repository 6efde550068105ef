use smallvec::SmallVec;

use super::artifacts::names;
use super::graph::Graph;
use super::model::{Changeset, ChangesetId, ItemId};
use super::stores::{self, ItemStore};
use super::{init_changesets, rev_topo_sort, ConvertError, PassContext};
use crate::{FHashMap, FHashSet};

pub(super) const PASS_REVISION: &str = "break-rev-cycles";
pub(super) const PASS_SYMBOL: &str = "break-symbol-cycles";
pub(super) const PASS_ALL: &str = "break-all-cycles";

// Stall-and-split cycle breaking. Each pass repeatedly runs a topological
// sort over its target subgraph; when the sort stalls it extracts one
// induced cycle, scores every dependency-respecting way of splitting a
// changeset on that cycle by how many cycle paths the split severs, applies
// the best one and tries again. A cycle no split can reduce is a programmer
// error or an archive pathology and fails the pass.

/// Compact per-item facts every cycle pass needs: owning changeset, the
/// items it depends on, and (for revisions) the CVS timestamp.
pub(super) struct ItemInfo {
    pub(super) changeset: ChangesetId,
    pub(super) preds: SmallVec<[ItemId; 1]>,
    pub(super) timestamp: Option<i64>,
}

pub(super) fn load_item_infos(
    store: &mut ItemStore,
    map: &FHashMap<ItemId, ChangesetId>,
) -> Result<FHashMap<ItemId, ItemInfo>, ConvertError> {
    let mut infos = FHashMap::default();
    let mut missing = false;
    store
        .for_each(|item| {
            let Some(&changeset) = map.get(&item.id()) else {
                missing = true;
                return;
            };
            infos.insert(
                item.id(),
                ItemInfo {
                    changeset,
                    preds: item.preds(),
                    timestamp: item.as_revision().map(|rev| rev.timestamp),
                },
            );
        })
        .map_err(|e| {
            tracing::error!("failed to stream item store: {e}");
            ConvertError
        })?;
    if missing {
        tracing::error!("item store and item-changeset map disagree");
        return Err(ConvertError);
    }
    Ok(infos)
}

pub(super) fn run_revision(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 8: break revision changeset cycles");

    let mut changesets = stores::read_changesets(
        ctx.artifacts,
        names::CHANGESETS_INIT,
        init_changesets::PASS,
    )
    .map_err(|e| {
        tracing::error!("failed to read changesets: {e}");
        ConvertError
    })?;
    let mut map =
        stores::read_item_map(ctx.artifacts, names::ITEM_MAP_INIT, init_changesets::PASS)
            .map_err(|e| {
                tracing::error!("failed to read item-changeset map: {e}");
                ConvertError
            })?;
    let mut store = ItemStore::open(ctx.artifacts, init_changesets::PASS).map_err(|e| {
        tracing::error!("failed to open item store: {e}");
        ConvertError
    })?;
    if !stores::check_partition(&changesets, &map) {
        tracing::error!("changeset membership disagrees with the item-changeset map");
        return Err(ConvertError);
    }
    let mut infos = load_item_infos(&mut store, &map)?;

    let mut splits = 0usize;
    loop {
        ctx.progress.set_progress(format!(
            "breaking revision cycles - {splits} split(s) so far",
        ));

        let graph = revision_graph(&changesets, &infos);
        match graph.sort(|node| node) {
            Ok(_) => break,
            Err(cycle) => {
                split_on_cycle(&cycle, &mut changesets, &mut map, &mut infos)?;
                splits += 1;
            }
        }
    }
    tracing::info!("revision cycles broken with {splits} split(s)");

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write outputs: {e}");
        ConvertError
    };
    stores::write_changesets(
        ctx.artifacts,
        names::CHANGESETS_REV_BROKEN,
        PASS_REVISION,
        &changesets,
    )
    .map_err(io_fail)?;
    stores::write_item_map(ctx.artifacts, names::ITEM_MAP_REV_BROKEN, PASS_REVISION, &map)
        .map_err(io_fail)?;
    ctx.artifacts
        .commit(&[names::CHANGESETS_REV_BROKEN, names::ITEM_MAP_REV_BROKEN])
        .map_err(io_fail)
}

pub(super) fn run_symbol(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 10: break symbol changeset cycles");

    let mut changesets = stores::read_changesets(
        ctx.artifacts,
        names::CHANGESETS_ORDERED,
        rev_topo_sort::PASS,
    )
    .map_err(|e| {
        tracing::error!("failed to read changesets: {e}");
        ConvertError
    })?;
    let mut map = stores::read_item_map(
        ctx.artifacts,
        names::ITEM_MAP_REV_BROKEN,
        PASS_REVISION,
    )
    .map_err(|e| {
        tracing::error!("failed to read item-changeset map: {e}");
        ConvertError
    })?;
    let mut store = ItemStore::open(ctx.artifacts, init_changesets::PASS).map_err(|e| {
        tracing::error!("failed to open item store: {e}");
        ConvertError
    })?;
    if !stores::check_partition(&changesets, &map) {
        tracing::error!("changeset membership disagrees with the item-changeset map");
        return Err(ConvertError);
    }
    let mut infos = load_item_infos(&mut store, &map)?;

    let mut splits = 0usize;
    loop {
        ctx.progress.set_progress(format!(
            "breaking symbol cycles - {splits} split(s) so far",
        ));

        let graph = symbol_graph(&changesets, &infos);
        match graph.sort(|node| node) {
            Ok(_) => break,
            Err(cycle) => {
                split_on_cycle(&cycle, &mut changesets, &mut map, &mut infos)?;
                splits += 1;
            }
        }
    }
    tracing::info!("symbol cycles broken with {splits} split(s)");

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write outputs: {e}");
        ConvertError
    };
    stores::write_changesets(
        ctx.artifacts,
        names::CHANGESETS_SYM_BROKEN,
        PASS_SYMBOL,
        &changesets,
    )
    .map_err(io_fail)?;
    stores::write_item_map(ctx.artifacts, names::ITEM_MAP_SYM_BROKEN, PASS_SYMBOL, &map)
        .map_err(io_fail)?;
    ctx.artifacts
        .commit(&[names::CHANGESETS_SYM_BROKEN, names::ITEM_MAP_SYM_BROKEN])
        .map_err(io_fail)
}

pub(super) fn run_all(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 11: break remaining cycles");

    let mut changesets = stores::read_changesets(
        ctx.artifacts,
        names::CHANGESETS_SYM_BROKEN,
        PASS_SYMBOL,
    )
    .map_err(|e| {
        tracing::error!("failed to read changesets: {e}");
        ConvertError
    })?;
    let mut map = stores::read_item_map(
        ctx.artifacts,
        names::ITEM_MAP_SYM_BROKEN,
        PASS_SYMBOL,
    )
    .map_err(|e| {
        tracing::error!("failed to read item-changeset map: {e}");
        ConvertError
    })?;
    let mut store = ItemStore::open(ctx.artifacts, init_changesets::PASS).map_err(|e| {
        tracing::error!("failed to open item store: {e}");
        ConvertError
    })?;
    if !stores::check_partition(&changesets, &map) {
        tracing::error!("changeset membership disagrees with the item-changeset map");
        return Err(ConvertError);
    }
    let mut infos = load_item_infos(&mut store, &map)?;

    let mut splits = 0usize;
    loop {
        ctx.progress.set_progress(format!(
            "breaking remaining cycles - {splits} split(s) so far",
        ));

        let graph = full_graph(&changesets, &infos);
        match graph.sort(|node| node) {
            Ok(_) => break,
            Err(cycle) => {
                // The revision order is frozen and nothing can depend on a
                // tag, so only branch changesets are splittable here.
                split_on_cycle(&cycle, &mut changesets, &mut map, &mut infos)?;
                splits += 1;
            }
        }
    }
    tracing::info!("remaining cycles broken with {splits} split(s)");

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write outputs: {e}");
        ConvertError
    };
    stores::write_changesets(ctx.artifacts, names::CHANGESETS_FINAL, PASS_ALL, &changesets)
        .map_err(io_fail)?;
    stores::write_item_map(ctx.artifacts, names::ITEM_MAP_FINAL, PASS_ALL, &map)
        .map_err(io_fail)?;
    ctx.artifacts
        .commit(&[names::CHANGESETS_FINAL, names::ITEM_MAP_FINAL])
        .map_err(io_fail)
}

// ---------------------------------------------------------------------------
// Graph builders.

fn changeset_index(changesets: &[Changeset]) -> FHashMap<ChangesetId, usize> {
    changesets
        .iter()
        .enumerate()
        .map(|(index, changeset)| (changeset.id, index))
        .collect()
}

/// The subgraph induced by revision changesets. A dependency running
/// through a symbol item (branch commit -> branch creation -> base
/// revision) still orders the two revision changesets, so such chains are
/// followed down to their underlying revision.
pub(super) fn revision_graph(
    changesets: &[Changeset],
    infos: &FHashMap<ItemId, ItemInfo>,
) -> Graph {
    let index = changeset_index(changesets);
    let mut graph = Graph::new();
    for changeset in changesets.iter().filter(|changeset| changeset.is_revision()) {
        graph.add_node(changeset.id);
        for &item in changeset.items.iter() {
            for &pred in infos[&item].preds.iter() {
                // Symbol items have at most one predecessor, so the chain
                // down to a revision (or nothing) is a simple walk.
                let mut pred = Some(pred);
                while let Some(p) = pred {
                    let Some(pred_info) = infos.get(&p) else {
                        break;
                    };
                    if changesets[index[&pred_info.changeset]].is_revision() {
                        if pred_info.changeset != changeset.id {
                            graph.add_edge(pred_info.changeset, changeset.id);
                        }
                        break;
                    }
                    pred = pred_info.preds.first().copied();
                }
            }
        }
    }
    graph
}

/// Only the edges running between symbol changesets (a symbol sprouting
/// from another symbol's branch creation).
fn symbol_graph(changesets: &[Changeset], infos: &FHashMap<ItemId, ItemInfo>) -> Graph {
    let index = changeset_index(changesets);
    let mut graph = Graph::new();
    for changeset in changesets.iter().filter(|changeset| !changeset.is_revision()) {
        graph.add_node(changeset.id);
        for &item in changeset.items.iter() {
            for &pred in infos[&item].preds.iter() {
                let Some(pred_info) = infos.get(&pred) else {
                    continue;
                };
                if pred_info.changeset != changeset.id
                    && !changesets[index[&pred_info.changeset]].is_revision()
                {
                    graph.add_edge(pred_info.changeset, changeset.id);
                }
            }
        }
    }
    graph
}

/// The whole graph: the frozen revision chain plus every edge touching a
/// symbol changeset.
pub(super) fn full_graph(
    changesets: &[Changeset],
    infos: &FHashMap<ItemId, ItemInfo>,
) -> Graph {
    let index = changeset_index(changesets);
    let mut graph = Graph::new();

    // Frozen chain: each ordered changeset depends only on its predecessor.
    let mut ordered: Vec<&Changeset> = changesets
        .iter()
        .filter(|changeset| changeset.order.is_some())
        .collect();
    ordered.sort_by_key(|changeset| changeset.order);
    for changeset in ordered.iter() {
        graph.add_node(changeset.id);
    }
    for pair in ordered.windows(2) {
        graph.add_edge(pair[0].id, pair[1].id);
    }

    for changeset in changesets.iter().filter(|changeset| !changeset.is_revision()) {
        graph.add_node(changeset.id);
        for &item in changeset.items.iter() {
            // Sources of the symbol changeset's items.
            for &pred in infos[&item].preds.iter() {
                if let Some(pred_info) = infos.get(&pred) {
                    if pred_info.changeset != changeset.id {
                        graph.add_edge(pred_info.changeset, changeset.id);
                    }
                }
            }
        }
    }
    // Dependents of symbol items (branch commits, nested symbols).
    for info in infos.values() {
        for &pred in info.preds.iter() {
            let Some(pred_info) = infos.get(&pred) else {
                continue;
            };
            if pred_info.changeset == info.changeset {
                continue;
            }
            if !changesets[index[&pred_info.changeset]].is_revision() {
                graph.add_edge(pred_info.changeset, info.changeset);
            }
        }
    }

    graph
}

// ---------------------------------------------------------------------------
// Splitting.

/// Picks and applies the best split among all changesets on the cycle.
fn split_on_cycle(
    cycle: &[ChangesetId],
    changesets: &mut Vec<Changeset>,
    map: &mut FHashMap<ItemId, ChangesetId>,
    infos: &mut FHashMap<ItemId, ItemInfo>,
) -> Result<(), ConvertError> {
    let index = changeset_index(changesets);

    let mut best: Option<(i64, ChangesetId, usize, Vec<ItemId>)> = None;

    for (position, &candidate) in cycle.iter().enumerate() {
        let changeset = &changesets[index[&candidate]];
        if changeset.items.len() < 2 {
            continue;
        }
        // The revision order is frozen once assigned; tags cannot sit on a
        // cycle, so after the revision pass only branch changesets split.
        if changeset.order.is_some() || changeset.is_tag() {
            continue;
        }

        let cycle_pred = cycle[(position + cycle.len() - 1) % cycle.len()];
        let cycle_succ = cycle[(position + 1) % cycle.len()];

        // Items the outgoing cycle edge leaves from: everything the next
        // changeset on the cycle depends on.
        let emitters: FHashSet<ItemId> = changesets[index[&cycle_succ]]
            .items
            .iter()
            .flat_map(|item| infos[item].preds.iter().copied())
            .collect();
        let receiver = |item: &ItemId| {
            infos[item]
                .preds
                .iter()
                .any(|pred| infos.get(pred).is_some_and(|p| p.changeset == cycle_pred))
        };

        let ordered = order_for_split(changeset, &emitters, &receiver, infos);

        // Which members receive the incoming cycle edge, which emit the
        // outgoing one.
        let receives: Vec<bool> = ordered.iter().map(receiver).collect();
        let emits: Vec<bool> = ordered.iter().map(|item| emitters.contains(item)).collect();

        for split in 1..ordered.len() {
            let half_recv = |range: std::ops::Range<usize>| range.clone().any(|i| receives[i]);
            let half_emit = |range: std::ops::Range<usize>| range.clone().any(|i| emits[i]);

            let first_ok = !(half_recv(0..split) && half_emit(0..split));
            let second_ok =
                !(half_recv(split..ordered.len()) && half_emit(split..ordered.len()));
            let severed = first_ok && second_ok;
            if !severed {
                continue;
            }

            // Prefer balanced splits; orphaning a single item costs.
            let balance = split.min(ordered.len() - split) as i64;
            let score = 1000 + balance;
            let better = match best {
                None => true,
                Some((best_score, best_id, _, _)) => {
                    (score, std::cmp::Reverse(candidate)) > (best_score, std::cmp::Reverse(best_id))
                }
            };
            if better {
                best = Some((score, candidate, split, ordered.clone()));
            }
        }
    }

    let Some((_, target, split, ordered)) = best else {
        let ids: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        tracing::error!(
            "cycle of changesets [{}] cannot be reduced by any split",
            ids.join(", "),
        );
        return Err(ConvertError);
    };

    apply_split(target, &ordered, split, changesets, map, infos);
    Ok(())
}

/// Puts a changeset's items in the order candidate splits respect:
/// revision changesets by (timestamp, id); symbol changesets with items
/// emitting the outgoing cycle edge first and items receiving the incoming
/// one last.
fn order_for_split(
    changeset: &Changeset,
    emitters: &FHashSet<ItemId>,
    receiver: &dyn Fn(&ItemId) -> bool,
    infos: &FHashMap<ItemId, ItemInfo>,
) -> Vec<ItemId> {
    let mut ordered = changeset.items.clone();
    if changeset.is_revision() {
        ordered.sort_by_key(|item| (infos[item].timestamp, *item));
    } else {
        ordered.sort_by_key(|&item| (receiver(&item), !emitters.contains(&item), item));
    }
    ordered
}

fn apply_split(
    target: ChangesetId,
    ordered: &[ItemId],
    split: usize,
    changesets: &mut Vec<Changeset>,
    map: &mut FHashMap<ItemId, ChangesetId>,
    infos: &mut FHashMap<ItemId, ItemInfo>,
) {
    let new_id = ChangesetId(
        changesets
            .iter()
            .map(|changeset| changeset.id.0)
            .max()
            .unwrap()
            + 1,
    );

    let (first, second) = ordered.split_at(split);
    tracing::debug!(
        "splitting changeset {target} into {target} ({} items) and {new_id} ({} items)",
        first.len(),
        second.len(),
    );

    let position = changesets
        .iter()
        .position(|changeset| changeset.id == target)
        .unwrap();
    changesets[position].items = first.to_vec();

    let mut second_half = changesets[position].clone();
    second_half.id = new_id;
    second_half.items = second.to_vec();
    changesets.push(second_half);

    for &item in second {
        map.insert(item, new_id);
        infos.get_mut(&item).unwrap().changeset = new_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::model::{ChangesetKind, MetadataId, SymbolId};

    fn info(changeset: u32, preds: &[u32], timestamp: Option<i64>) -> ItemInfo {
        ItemInfo {
            changeset: ChangesetId(changeset),
            preds: preds.iter().map(|&p| ItemId(p)).collect(),
            timestamp,
        }
    }

    fn revision_changeset(id: u32, items: &[u32]) -> Changeset {
        Changeset {
            id: ChangesetId(id),
            kind: ChangesetKind::Revision {
                metadata: MetadataId(0),
            },
            items: items.iter().map(|&i| ItemId(i)).collect(),
            order: None,
        }
    }

    /// The interleaved-commit shape: two files, two metadata groups that
    /// depend on each other both ways.
    fn interleaved() -> (Vec<Changeset>, FHashMap<ItemId, ItemInfo>) {
        // F1: item 0 (1.1, t=0, meta L1) -> item 1 (1.2, t=10, meta L2)
        // F2: item 2 (1.1, t=5, meta L2) -> item 3 (1.2, t=15, meta L1)
        let changesets = vec![
            revision_changeset(0, &[0, 3]), // "L1"
            revision_changeset(1, &[1, 2]), // "L2"
        ];
        let mut infos = FHashMap::default();
        infos.insert(ItemId(0), info(0, &[], Some(0)));
        infos.insert(ItemId(1), info(1, &[0], Some(10)));
        infos.insert(ItemId(2), info(1, &[], Some(5)));
        infos.insert(ItemId(3), info(0, &[2], Some(15)));
        (changesets, infos)
    }

    #[test]
    fn interleaved_commits_form_a_cycle_and_split() {
        let (mut changesets, mut infos) = interleaved();
        let mut map: FHashMap<ItemId, ChangesetId> = infos
            .iter()
            .map(|(&item, info)| (item, info.changeset))
            .collect();

        let graph = revision_graph(&changesets, &infos);
        let cycle = graph.sort(|node| node).unwrap_err();
        assert_eq!(cycle.len(), 2);

        split_on_cycle(&cycle, &mut changesets, &mut map, &mut infos).unwrap();
        assert_eq!(changesets.len(), 3);

        // After one split the graph must be sortable.
        let graph = revision_graph(&changesets, &infos);
        let order = graph.sort(|node| node).unwrap();
        assert_eq!(order.len(), 3);

        // Dependency order of each file is preserved.
        let position_of = |item: u32| {
            let changeset = infos[&ItemId(item)].changeset;
            order.iter().position(|&c| c == changeset).unwrap()
        };
        assert!(position_of(0) < position_of(1));
        assert!(position_of(2) < position_of(3));
    }

    #[test]
    fn unbreakable_cycle_is_an_error() {
        // Two single-item changesets depending on each other: nothing to
        // split.
        let changesets = vec![revision_changeset(0, &[0]), revision_changeset(1, &[1])];
        let mut infos = FHashMap::default();
        infos.insert(ItemId(0), info(0, &[1], Some(0)));
        infos.insert(ItemId(1), info(1, &[0], Some(1)));
        let mut map: FHashMap<ItemId, ChangesetId> = infos
            .iter()
            .map(|(&item, info)| (item, info.changeset))
            .collect();

        let graph = revision_graph(&changesets, &infos);
        let cycle = graph.sort(|node| node).unwrap_err();
        let mut changesets = changesets;
        assert!(
            split_on_cycle(&cycle, &mut changesets, &mut map, &mut infos).is_err()
        );
    }
}
