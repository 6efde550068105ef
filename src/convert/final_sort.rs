use super::artifacts::names;
use super::break_cycles::{self, ItemInfo};
use super::model::{Changeset, ChangesetId, ItemId};
use super::stores::{self, ItemStore};
use super::{init_changesets, output, rev_topo_sort, ConvertError, PassContext};
use crate::FHashMap;

pub(super) const PASS: &str = "sort-changesets";

// The final topological sort over the whole (now acyclic) graph. Symbol
// changesets are preferred among ready nodes so copies happen as soon as
// their sources exist. Commit timestamps start from the changesets' nominal
// times and are forced strictly monotonic; timestamps from the future are
// treated as bogus.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 12: final topological sort");
    ctx.progress.set_progress("ordering all changesets".into());

    let changesets = stores::read_changesets(
        ctx.artifacts,
        names::CHANGESETS_FINAL,
        break_cycles::PASS_ALL,
    )
    .map_err(|e| {
        tracing::error!("failed to read changesets: {e}");
        ConvertError
    })?;
    let map = stores::read_item_map(ctx.artifacts, names::ITEM_MAP_FINAL, break_cycles::PASS_ALL)
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
    let infos = break_cycles::load_item_infos(&mut store, &map)?;

    let by_id: FHashMap<ChangesetId, &Changeset> = changesets
        .iter()
        .map(|changeset| (changeset.id, changeset))
        .collect();

    let graph = break_cycles::full_graph(&changesets, &infos);
    let order = graph
        .sort(|node| {
            let changeset = by_id[&node];
            match changeset.order {
                // Symbol changesets first among ready nodes.
                None => (0u8, node.0),
                Some(position) => (1, position),
            }
        })
        .map_err(|cycle| {
            let ids: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            tracing::error!("full changeset graph is still cyclic: [{}]", ids.join(", "));
            ConvertError
        })?;

    let commits = assign_timestamps(
        &order,
        &by_id,
        &infos,
        &rev_topo_sort::nominal_timestamps(&changesets, &infos),
        chrono::Utc::now().timestamp(),
    );

    tracing::info!("final order fixed: {} commits", commits.len());

    output::write_outputs(ctx, PASS, &commits, &changesets, &mut store, &map)?;

    ctx.artifacts
        .commit(&[
            names::COMMIT_ORDER,
            names::COMMIT_PLAN,
            names::OPENINGS_CLOSINGS,
        ])
        .map_err(|e| {
            tracing::error!("failed to finalize outputs: {e}");
            ConvertError
        })
}

/// Timestamps in commit order: a changeset's nominal time (its members' CVS
/// times, or for symbols the commit times of its sources), pushed forward
/// to stay strictly monotonic, with future times clamped.
fn assign_timestamps(
    order: &[ChangesetId],
    by_id: &FHashMap<ChangesetId, &Changeset>,
    infos: &FHashMap<ItemId, ItemInfo>,
    nominal_revisions: &FHashMap<ChangesetId, i64>,
    now: i64,
) -> Vec<(ChangesetId, i64)> {
    let mut assigned: FHashMap<ChangesetId, i64> = FHashMap::default();
    let mut commits = Vec::with_capacity(order.len());
    // Clamping keeps every assigned time non-negative even when the first
    // changeset has no usable nominal time.
    let mut prev = -1i64;

    for &id in order {
        let changeset = by_id[&id];
        let nominal = if changeset.is_revision() {
            nominal_revisions.get(&id).copied().unwrap_or(i64::MIN)
        } else {
            changeset
                .items
                .iter()
                .flat_map(|item| infos[item].preds.iter())
                .filter_map(|pred| {
                    infos
                        .get(pred)
                        .and_then(|info| assigned.get(&info.changeset).copied())
                })
                .max()
                .unwrap_or(i64::MIN)
        };

        let timestamp = if nominal <= prev || nominal > now {
            prev + 1
        } else {
            nominal
        };

        assigned.insert(id, timestamp);
        commits.push((id, timestamp));
        prev = timestamp;
    }

    commits
}

#[cfg(test)]
mod tests {
    use super::assign_timestamps;
    use crate::convert::break_cycles::ItemInfo;
    use crate::convert::model::{
        Changeset, ChangesetId, ChangesetKind, ItemId, MetadataId, SymbolId,
    };
    use crate::FHashMap;
    use smallvec::SmallVec;

    fn revision_changeset(id: u32, items: &[u32], order: u32) -> Changeset {
        Changeset {
            id: ChangesetId(id),
            kind: ChangesetKind::Revision {
                metadata: MetadataId(0),
            },
            items: items.iter().map(|&i| ItemId(i)).collect(),
            order: Some(order),
        }
    }

    #[test]
    fn monotonization_pushes_forward() {
        // Two commits with CVS timestamps 1000 then 999.
        let changesets = vec![
            revision_changeset(0, &[0], 0),
            revision_changeset(1, &[1], 1),
        ];
        let by_id: FHashMap<_, _> = changesets.iter().map(|c| (c.id, c)).collect();
        let mut infos = FHashMap::default();
        infos.insert(
            ItemId(0),
            ItemInfo {
                changeset: ChangesetId(0),
                preds: SmallVec::new(),
                timestamp: Some(1000),
            },
        );
        infos.insert(
            ItemId(1),
            ItemInfo {
                changeset: ChangesetId(1),
                preds: [ItemId(0)].into_iter().collect(),
                timestamp: Some(999),
            },
        );
        let mut nominal = FHashMap::default();
        nominal.insert(ChangesetId(0), 1000);
        nominal.insert(ChangesetId(1), 999);

        let order = vec![ChangesetId(0), ChangesetId(1)];
        let commits = assign_timestamps(&order, &by_id, &infos, &nominal, 1_000_000);
        assert_eq!(commits, vec![(ChangesetId(0), 1000), (ChangesetId(1), 1001)]);
    }

    #[test]
    fn future_timestamps_are_clamped() {
        let changesets = vec![
            revision_changeset(0, &[0], 0),
            revision_changeset(1, &[1], 1),
        ];
        let by_id: FHashMap<_, _> = changesets.iter().map(|c| (c.id, c)).collect();
        let mut infos = FHashMap::default();
        for (item, (changeset, timestamp)) in [(0u32, (0u32, 1000i64)), (1, (1, 99_999))] {
            infos.insert(
                ItemId(item),
                ItemInfo {
                    changeset: ChangesetId(changeset),
                    preds: SmallVec::new(),
                    timestamp: Some(timestamp),
                },
            );
        }
        let mut nominal = FHashMap::default();
        nominal.insert(ChangesetId(0), 1000);
        nominal.insert(ChangesetId(1), 99_999);

        let order = vec![ChangesetId(0), ChangesetId(1)];
        // "now" is 2000, so 99_999 is from the future.
        let commits = assign_timestamps(&order, &by_id, &infos, &nominal, 2000);
        assert_eq!(commits, vec![(ChangesetId(0), 1000), (ChangesetId(1), 1001)]);
    }

    #[test]
    fn symbol_nominal_time_follows_its_sources() {
        let changesets = vec![revision_changeset(0, &[0], 0), Changeset {
            id: ChangesetId(1),
            kind: ChangesetKind::Tag {
                symbol: SymbolId(0),
            },
            items: vec![ItemId(1)],
            order: None,
        }];
        let by_id: FHashMap<_, _> = changesets.iter().map(|c| (c.id, c)).collect();
        let mut infos = FHashMap::default();
        infos.insert(
            ItemId(0),
            ItemInfo {
                changeset: ChangesetId(0),
                preds: SmallVec::new(),
                timestamp: Some(5000),
            },
        );
        infos.insert(
            ItemId(1),
            ItemInfo {
                changeset: ChangesetId(1),
                preds: [ItemId(0)].into_iter().collect(),
                timestamp: None,
            },
        );
        let mut nominal = FHashMap::default();
        nominal.insert(ChangesetId(0), 5000);

        let order = vec![ChangesetId(0), ChangesetId(1)];
        let commits = assign_timestamps(&order, &by_id, &infos, &nominal, 1_000_000);
        // The tag's nominal time equals its source commit's time, which is
        // not strictly greater, so it lands one second later.
        assert_eq!(commits, vec![(ChangesetId(0), 5000), (ChangesetId(1), 5001)]);
    }
}
