use super::artifacts::names;
use super::break_cycles::{self, ItemInfo};
use super::model::{Changeset, ChangesetId, ItemId};
use super::stores::{self, ItemStore};
use super::{init_changesets, ConvertError, PassContext};
use crate::FHashMap;

pub(super) const PASS: &str = "sort-rev-changesets";

// Fixes the commit order of revision changesets once and for all. The
// acyclic revision graph is sorted topologically with the changeset
// timestamp as the tie-break, and the chosen order is baked in: from here
// on a revision changeset depends only on its neighbors in the chain, so no
// later pass can perturb the order.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 9: topological sort of revision changesets");
    ctx.progress
        .set_progress("ordering revision changesets".into());

    let mut changesets = stores::read_changesets(
        ctx.artifacts,
        names::CHANGESETS_REV_BROKEN,
        break_cycles::PASS_REVISION,
    )
    .map_err(|e| {
        tracing::error!("failed to read changesets: {e}");
        ConvertError
    })?;
    let map = stores::read_item_map(
        ctx.artifacts,
        names::ITEM_MAP_REV_BROKEN,
        break_cycles::PASS_REVISION,
    )
    .map_err(|e| {
        tracing::error!("failed to read item-changeset map: {e}");
        ConvertError
    })?;
    let mut store = ItemStore::open(ctx.artifacts, init_changesets::PASS).map_err(|e| {
        tracing::error!("failed to open item store: {e}");
        ConvertError
    })?;
    let infos = break_cycles::load_item_infos(&mut store, &map)?;

    let nominal = nominal_timestamps(&changesets, &infos);
    let graph = break_cycles::revision_graph(&changesets, &infos);
    let order = graph
        .sort(|node| (nominal.get(&node).copied(), node))
        .map_err(|cycle| {
            let ids: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            tracing::error!(
                "revision changeset graph is still cyclic: [{}]",
                ids.join(", "),
            );
            ConvertError
        })?;

    let positions: FHashMap<ChangesetId, u32> = order
        .iter()
        .enumerate()
        .map(|(position, &id)| (id, u32::try_from(position).unwrap()))
        .collect();
    for changeset in changesets.iter_mut() {
        if changeset.is_revision() {
            changeset.order = Some(positions[&changeset.id]);
        }
    }

    tracing::info!("fixed the order of {} revision changesets", order.len());

    stores::write_changesets(ctx.artifacts, names::CHANGESETS_ORDERED, PASS, &changesets)
        .and_then(|()| ctx.artifacts.commit(&[names::CHANGESETS_ORDERED]))
        .map_err(|e| {
            tracing::error!("failed to write ordered changesets: {e}");
            ConvertError
        })
}

/// A revision changeset's nominal timestamp is the latest CVS timestamp
/// among its members.
pub(super) fn nominal_timestamps(
    changesets: &[Changeset],
    infos: &FHashMap<ItemId, ItemInfo>,
) -> FHashMap<ChangesetId, i64> {
    let mut nominal = FHashMap::default();
    for changeset in changesets.iter().filter(|changeset| changeset.is_revision()) {
        let timestamp = changeset
            .items
            .iter()
            .filter_map(|item| infos[item].timestamp)
            .max()
            .unwrap_or(0);
        nominal.insert(changeset.id, timestamp);
    }
    nominal
}
