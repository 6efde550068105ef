use smallvec::SmallVec;

use super::bin_ser_de::{self, DeserializeError};
use crate::rcs::number::RevNum;

// Integer identities allocated during the collect pass and stable across
// every later pass and intermediate file.

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub(crate) struct $name(pub(crate) u32);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:x}", self.0)
            }
        }
    };
}

id_type!(ProjectId);
id_type!(FileId);
id_type!(SymbolId);
id_type!(MetadataId);
id_type!(ItemId);
id_type!(ChangesetId);

/// Trunk or a named branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Lod {
    Trunk,
    Branch(SymbolId),
}

impl Lod {
    fn serialize_into(self, out: &mut Vec<u8>) {
        match self {
            Self::Trunk => out.push(0),
            Self::Branch(symbol) => {
                out.push(1);
                bin_ser_de::serialize_u32_into(symbol.0, out);
            }
        }
    }

    fn deserialize_from(src: &mut &[u8]) -> Result<Self, DeserializeError> {
        match bin_ser_de::deserialize_byte_from(src)? {
            0 => Ok(Self::Trunk),
            1 => Ok(Self::Branch(SymbolId(bin_ser_de::deserialize_u32_from(
                src,
            )?))),
            _ => Err(DeserializeError),
        }
    }
}

/// One revision of one file on one line of development.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CvsRevision {
    pub(crate) id: ItemId,
    pub(crate) file: FileId,
    pub(crate) lod: Lod,
    pub(crate) number: RevNum,
    pub(crate) timestamp: i64,
    pub(crate) dead: bool,
    pub(crate) metadata: MetadataId,
    /// The predecessor revision, or the branch-creation item for the first
    /// commit on a branch.
    pub(crate) prev: Option<ItemId>,
    pub(crate) next: Option<ItemId>,
    /// Branch-creation items sprouting from this revision.
    pub(crate) branches: SmallVec<[ItemId; 2]>,
    /// Tag items placed on this revision.
    pub(crate) tags: SmallVec<[ItemId; 2]>,
    /// Symbol items whose copy source this revision establishes / overwrites.
    /// Filled in by the filter pass.
    pub(crate) opens: Vec<ItemId>,
    pub(crate) closes: Vec<ItemId>,
}

/// The act of opening a branch in one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CvsBranch {
    pub(crate) id: ItemId,
    pub(crate) file: FileId,
    pub(crate) symbol: SymbolId,
    /// The base the branch is copied from: a revision, or another branch
    /// item after sprout adjustment. `None` for a detached branch.
    pub(crate) source: Option<ItemId>,
    /// First commit on the branch in this file, if any.
    pub(crate) first_commit: Option<ItemId>,
}

/// The act of placing a tag in one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CvsTag {
    pub(crate) id: ItemId,
    pub(crate) file: FileId,
    pub(crate) symbol: SymbolId,
    pub(crate) source: Option<ItemId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Item {
    Revision(CvsRevision),
    Branch(CvsBranch),
    Tag(CvsTag),
}

impl Item {
    pub(crate) fn id(&self) -> ItemId {
        match self {
            Self::Revision(rev) => rev.id,
            Self::Branch(branch) => branch.id,
            Self::Tag(tag) => tag.id,
        }
    }

    /// Items this item causally depends on.
    pub(crate) fn preds(&self) -> SmallVec<[ItemId; 1]> {
        match self {
            Self::Revision(rev) => rev.prev.into_iter().collect(),
            Self::Branch(branch) => branch.source.into_iter().collect(),
            Self::Tag(tag) => tag.source.into_iter().collect(),
        }
    }

    pub(crate) fn as_revision(&self) -> Option<&CvsRevision> {
        match self {
            Self::Revision(rev) => Some(rev),
            _ => None,
        }
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Revision(rev) => {
                out.push(0);
                bin_ser_de::serialize_u32_into(rev.id.0, out);
                bin_ser_de::serialize_u32_into(rev.file.0, out);
                rev.lod.serialize_into(out);
                bin_ser_de::serialize_u32_seq_into(rev.number.components(), out);
                bin_ser_de::serialize_i64_into(rev.timestamp, out);
                bin_ser_de::serialize_bool_into(rev.dead, out);
                bin_ser_de::serialize_u32_into(rev.metadata.0, out);
                bin_ser_de::serialize_opt_u32_into(rev.prev.map(|id| id.0), out);
                bin_ser_de::serialize_opt_u32_into(rev.next.map(|id| id.0), out);
                serialize_ids_into(&rev.branches, out);
                serialize_ids_into(&rev.tags, out);
                serialize_ids_into(&rev.opens, out);
                serialize_ids_into(&rev.closes, out);
            }
            Self::Branch(branch) => {
                out.push(1);
                bin_ser_de::serialize_u32_into(branch.id.0, out);
                bin_ser_de::serialize_u32_into(branch.file.0, out);
                bin_ser_de::serialize_u32_into(branch.symbol.0, out);
                bin_ser_de::serialize_opt_u32_into(branch.source.map(|id| id.0), out);
                bin_ser_de::serialize_opt_u32_into(branch.first_commit.map(|id| id.0), out);
            }
            Self::Tag(tag) => {
                out.push(2);
                bin_ser_de::serialize_u32_into(tag.id.0, out);
                bin_ser_de::serialize_u32_into(tag.file.0, out);
                bin_ser_de::serialize_u32_into(tag.symbol.0, out);
                bin_ser_de::serialize_opt_u32_into(tag.source.map(|id| id.0), out);
            }
        }
    }

    pub(crate) fn deserialize(mut src: &[u8]) -> Result<Self, DeserializeError> {
        let item = Self::deserialize_from(&mut src)?;
        if !src.is_empty() {
            return Err(DeserializeError);
        }
        Ok(item)
    }

    pub(crate) fn deserialize_from(src: &mut &[u8]) -> Result<Self, DeserializeError> {
        match bin_ser_de::deserialize_byte_from(src)? {
            0 => {
                let id = ItemId(bin_ser_de::deserialize_u32_from(src)?);
                let file = FileId(bin_ser_de::deserialize_u32_from(src)?);
                let lod = Lod::deserialize_from(src)?;
                let number = RevNum::from_components(bin_ser_de::deserialize_u32_seq_from(src)?);
                let timestamp = bin_ser_de::deserialize_i64_from(src)?;
                let dead = bin_ser_de::deserialize_bool_from(src)?;
                let metadata = MetadataId(bin_ser_de::deserialize_u32_from(src)?);
                let prev = bin_ser_de::deserialize_opt_u32_from(src)?.map(ItemId);
                let next = bin_ser_de::deserialize_opt_u32_from(src)?.map(ItemId);
                let branches = deserialize_ids_from(src)?;
                let tags = deserialize_ids_from(src)?;
                let opens = deserialize_ids_from(src)?;
                let closes = deserialize_ids_from(src)?;
                Ok(Self::Revision(CvsRevision {
                    id,
                    file,
                    lod,
                    number,
                    timestamp,
                    dead,
                    metadata,
                    prev,
                    next,
                    branches: branches.into_iter().collect(),
                    tags: tags.into_iter().collect(),
                    opens,
                    closes,
                }))
            }
            1 => Ok(Self::Branch(CvsBranch {
                id: ItemId(bin_ser_de::deserialize_u32_from(src)?),
                file: FileId(bin_ser_de::deserialize_u32_from(src)?),
                symbol: SymbolId(bin_ser_de::deserialize_u32_from(src)?),
                source: bin_ser_de::deserialize_opt_u32_from(src)?.map(ItemId),
                first_commit: bin_ser_de::deserialize_opt_u32_from(src)?.map(ItemId),
            })),
            2 => Ok(Self::Tag(CvsTag {
                id: ItemId(bin_ser_de::deserialize_u32_from(src)?),
                file: FileId(bin_ser_de::deserialize_u32_from(src)?),
                symbol: SymbolId(bin_ser_de::deserialize_u32_from(src)?),
                source: bin_ser_de::deserialize_opt_u32_from(src)?.map(ItemId),
            })),
            _ => Err(DeserializeError),
        }
    }
}

fn serialize_ids_into(ids: &[ItemId], out: &mut Vec<u8>) {
    bin_ser_de::serialize_u32_into(u32::try_from(ids.len()).unwrap(), out);
    for id in ids {
        bin_ser_de::serialize_u32_into(id.0, out);
    }
}

fn deserialize_ids_from(src: &mut &[u8]) -> Result<Vec<ItemId>, DeserializeError> {
    Ok(bin_ser_de::deserialize_u32_seq_from(src)?
        .into_iter()
        .map(ItemId)
        .collect())
}

/// Global classification of a symbol, decided by the collate pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SymbolKind {
    Branch,
    Tag,
    Excluded,
}

/// Per-symbol usage record accumulated during collect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SymbolStats {
    pub(crate) symbol: SymbolId,
    pub(crate) project: ProjectId,
    pub(crate) name: Vec<u8>,
    pub(crate) tag_uses: u32,
    pub(crate) branch_uses: u32,
    pub(crate) branch_commit_files: u32,
    /// Symbols that sprout from this one somewhere; this symbol cannot be
    /// excluded unless all of them are.
    pub(crate) blockers: Vec<SymbolId>,
    /// Histogram over lines of development this symbol could have sprouted
    /// from, across all files of the project.
    pub(crate) possible_parents: Vec<(Lod, u32)>,
}

impl SymbolStats {
    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) {
        bin_ser_de::serialize_u32_into(self.symbol.0, out);
        bin_ser_de::serialize_u32_into(self.project.0, out);
        bin_ser_de::serialize_byte_slice_into(&self.name, out);
        bin_ser_de::serialize_u32_into(self.tag_uses, out);
        bin_ser_de::serialize_u32_into(self.branch_uses, out);
        bin_ser_de::serialize_u32_into(self.branch_commit_files, out);
        bin_ser_de::serialize_u32_seq_into(
            &self.blockers.iter().map(|s| s.0).collect::<Vec<_>>(),
            out,
        );
        bin_ser_de::serialize_u32_into(u32::try_from(self.possible_parents.len()).unwrap(), out);
        for (lod, count) in self.possible_parents.iter() {
            lod.serialize_into(out);
            bin_ser_de::serialize_u32_into(*count, out);
        }
    }

    pub(crate) fn deserialize_from(src: &mut &[u8]) -> Result<Self, DeserializeError> {
        let symbol = SymbolId(bin_ser_de::deserialize_u32_from(src)?);
        let project = ProjectId(bin_ser_de::deserialize_u32_from(src)?);
        let name = bin_ser_de::deserialize_byte_slice_from(src)?;
        let tag_uses = bin_ser_de::deserialize_u32_from(src)?;
        let branch_uses = bin_ser_de::deserialize_u32_from(src)?;
        let branch_commit_files = bin_ser_de::deserialize_u32_from(src)?;
        let blockers = bin_ser_de::deserialize_u32_seq_from(src)?
            .into_iter()
            .map(SymbolId)
            .collect();
        let parents_len = bin_ser_de::deserialize_u32_from(src)? as usize;
        let mut possible_parents = Vec::with_capacity(parents_len);
        for _ in 0..parents_len {
            let lod = Lod::deserialize_from(src)?;
            let count = bin_ser_de::deserialize_u32_from(src)?;
            possible_parents.push((lod, count));
        }
        Ok(Self {
            symbol,
            project,
            name,
            tag_uses,
            branch_uses,
            branch_commit_files,
            blockers,
            possible_parents,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChangesetKind {
    Revision { metadata: MetadataId },
    Branch { symbol: SymbolId },
    Tag { symbol: SymbolId },
}

/// A set of items intended to commit together. Revision changesets get a
/// fixed chain position (`order`) once the revision topological sort has
/// run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Changeset {
    pub(crate) id: ChangesetId,
    pub(crate) kind: ChangesetKind,
    pub(crate) items: Vec<ItemId>,
    pub(crate) order: Option<u32>,
}

impl Changeset {
    pub(crate) fn is_revision(&self) -> bool {
        matches!(self.kind, ChangesetKind::Revision { .. })
    }

    pub(crate) fn is_tag(&self) -> bool {
        matches!(self.kind, ChangesetKind::Tag { .. })
    }

    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) {
        bin_ser_de::serialize_u32_into(self.id.0, out);
        match self.kind {
            ChangesetKind::Revision { metadata } => {
                out.push(0);
                bin_ser_de::serialize_u32_into(metadata.0, out);
            }
            ChangesetKind::Branch { symbol } => {
                out.push(1);
                bin_ser_de::serialize_u32_into(symbol.0, out);
            }
            ChangesetKind::Tag { symbol } => {
                out.push(2);
                bin_ser_de::serialize_u32_into(symbol.0, out);
            }
        }
        serialize_ids_into(&self.items, out);
        bin_ser_de::serialize_opt_u32_into(self.order, out);
    }

    pub(crate) fn deserialize_from(src: &mut &[u8]) -> Result<Self, DeserializeError> {
        let id = ChangesetId(bin_ser_de::deserialize_u32_from(src)?);
        let kind_tag = bin_ser_de::deserialize_byte_from(src)?;
        let kind_id = bin_ser_de::deserialize_u32_from(src)?;
        let kind = match kind_tag {
            0 => ChangesetKind::Revision {
                metadata: MetadataId(kind_id),
            },
            1 => ChangesetKind::Branch {
                symbol: SymbolId(kind_id),
            },
            2 => ChangesetKind::Tag {
                symbol: SymbolId(kind_id),
            },
            _ => return Err(DeserializeError),
        };
        let items = deserialize_ids_from(src)?;
        let order = bin_ser_de::deserialize_opt_u32_from(src)?;
        Ok(Self {
            id,
            kind,
            items,
            order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> RevNum {
        RevNum::parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn item_round_trip() {
        let items = [
            Item::Revision(CvsRevision {
                id: ItemId(3),
                file: FileId(1),
                lod: Lod::Branch(SymbolId(9)),
                number: num("1.2.4.1"),
                timestamp: 1045512000,
                dead: false,
                metadata: MetadataId(5),
                prev: Some(ItemId(2)),
                next: None,
                branches: [ItemId(7)].into_iter().collect(),
                tags: SmallVec::new(),
                opens: vec![ItemId(7), ItemId(8)],
                closes: vec![],
            }),
            Item::Branch(CvsBranch {
                id: ItemId(7),
                file: FileId(1),
                symbol: SymbolId(9),
                source: Some(ItemId(2)),
                first_commit: Some(ItemId(3)),
            }),
            Item::Tag(CvsTag {
                id: ItemId(8),
                file: FileId(1),
                symbol: SymbolId(10),
                source: None,
            }),
        ];

        for item in items {
            let serialized = item.serialize();
            assert_eq!(Item::deserialize(&serialized).unwrap(), item);
        }
    }

    #[test]
    fn item_preds() {
        let branch = Item::Branch(CvsBranch {
            id: ItemId(7),
            file: FileId(1),
            symbol: SymbolId(9),
            source: Some(ItemId(2)),
            first_commit: None,
        });
        assert_eq!(branch.preds().as_slice(), &[ItemId(2)]);
    }

    #[test]
    fn changeset_round_trip() {
        let changeset = Changeset {
            id: ChangesetId(11),
            kind: ChangesetKind::Branch {
                symbol: SymbolId(9),
            },
            items: vec![ItemId(7), ItemId(12)],
            order: Some(4),
        };
        let mut out = Vec::new();
        changeset.serialize_into(&mut out);
        let mut src = out.as_slice();
        assert_eq!(Changeset::deserialize_from(&mut src).unwrap(), changeset);
        assert!(src.is_empty());
    }

    #[test]
    fn stats_round_trip() {
        let stats = SymbolStats {
            symbol: SymbolId(4),
            project: ProjectId(0),
            name: b"RELEASE_1".to_vec(),
            tag_uses: 10,
            branch_uses: 2,
            branch_commit_files: 1,
            blockers: vec![SymbolId(5)],
            possible_parents: vec![(Lod::Trunk, 11), (Lod::Branch(SymbolId(2)), 1)],
        };
        let mut out = Vec::new();
        stats.serialize_into(&mut out);
        let mut src = out.as_slice();
        assert_eq!(SymbolStats::deserialize_from(&mut src).unwrap(), stats);
        assert!(src.is_empty());
    }
}
