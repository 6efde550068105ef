use std::io::{Read as _, Seek as _, Write as _};

use super::artifacts::{names, Artifacts, OpenError};
use super::bin_ser_de::{self, DeserializeError};
use super::model::{
    Changeset, ChangesetId, FileId, Item, ItemId, ProjectId, SymbolId, SymbolKind, SymbolStats,
};
use crate::FHashMap;

#[derive(Debug)]
pub(super) enum StoreError {
    Open(OpenError),
    Io(std::io::Error),
    Corrupt { name: &'static str },
}

impl From<OpenError> for StoreError {
    fn from(e: OpenError) -> Self {
        Self::Open(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Open(ref e) => e.fmt(f),
            Self::Io(ref e) => e.fmt(f),
            Self::Corrupt { name } => write!(f, "corrupt intermediate file \"{name}\""),
        }
    }
}

impl StoreError {
    fn corrupt(name: &'static str) -> impl FnOnce(DeserializeError) -> Self {
        move |DeserializeError| Self::Corrupt { name }
    }
}

// ---------------------------------------------------------------------------
// Metadata (author + log), interned by digest during collect.

pub(super) struct MetadataRecord {
    pub(super) digest: [u8; 20],
    pub(super) author: Vec<u8>,
    pub(super) log: Vec<u8>,
}

pub(super) fn write_metadata(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
    records: &[MetadataRecord],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(name, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(records.len()).unwrap(), &mut buf);
    for record in records {
        buf.extend(record.digest);
        bin_ser_de::serialize_byte_slice_into(&record.author, &mut buf);
        bin_ser_de::serialize_byte_slice_into(&record.log, &mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

/// Records are indexed by [`MetadataId`] in interning order.
pub(super) fn read_metadata(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
) -> Result<Vec<MetadataRecord>, StoreError> {
    let data = artifacts.read(name, pass)?;
    let mut src = data.as_slice();
    let corrupt = || StoreError::Corrupt { name: "metadata" };

    let count = bin_ser_de::deserialize_u32_from(&mut src).map_err(|_| corrupt())?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let digest =
            bin_ser_de::deserialize_byte_array_from(&mut src).map_err(|_| corrupt())?;
        let author = bin_ser_de::deserialize_byte_slice_from(&mut src).map_err(|_| corrupt())?;
        let log = bin_ser_de::deserialize_byte_slice_from(&mut src).map_err(|_| corrupt())?;
        records.push(MetadataRecord {
            digest,
            author,
            log,
        });
    }
    if !src.is_empty() {
        return Err(corrupt());
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Projects and paths.

pub(super) struct ProjectRecord {
    pub(super) id: ProjectId,
    pub(super) name: Vec<u8>,
}

pub(super) fn write_projects(
    artifacts: &Artifacts,
    pass: &str,
    projects: &[ProjectRecord],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(names::PROJECTS, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(projects.len()).unwrap(), &mut buf);
    for project in projects {
        bin_ser_de::serialize_u32_into(project.id.0, &mut buf);
        bin_ser_de::serialize_byte_slice_into(&project.name, &mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) struct PathRecord {
    pub(super) id: FileId,
    pub(super) project: ProjectId,
    /// Project-relative path, `/`-separated, without the `,v` suffix.
    pub(super) path: Vec<u8>,
}

pub(super) fn write_paths(
    artifacts: &Artifacts,
    pass: &str,
    paths: &[PathRecord],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(names::PATHS, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(paths.len()).unwrap(), &mut buf);
    for path in paths {
        bin_ser_de::serialize_u32_into(path.id.0, &mut buf);
        bin_ser_de::serialize_u32_into(path.project.0, &mut buf);
        bin_ser_de::serialize_byte_slice_into(&path.path, &mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) fn read_paths(
    artifacts: &Artifacts,
    pass: &str,
) -> Result<Vec<PathRecord>, StoreError> {
    let data = artifacts.read(names::PATHS, pass)?;
    let mut src = data.as_slice();
    let count =
        bin_ser_de::deserialize_u32_from(&mut src).map_err(StoreError::corrupt("paths"))?;
    let mut paths = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = FileId(
            bin_ser_de::deserialize_u32_from(&mut src).map_err(StoreError::corrupt("paths"))?,
        );
        let project = ProjectId(
            bin_ser_de::deserialize_u32_from(&mut src).map_err(StoreError::corrupt("paths"))?,
        );
        let path = bin_ser_de::deserialize_byte_slice_from(&mut src)
            .map_err(StoreError::corrupt("paths"))?;
        paths.push(PathRecord { id, project, path });
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Symbol statistics (collect -> collate) and the typed symbol database
// (collate -> everything later), both keyed by the ids fixed in collect.

pub(super) fn write_symbol_stats(
    artifacts: &Artifacts,
    pass: &str,
    stats: &[SymbolStats],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(names::SYMBOL_STATS, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(stats.len()).unwrap(), &mut buf);
    for record in stats {
        record.serialize_into(&mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) fn read_symbol_stats(
    artifacts: &Artifacts,
    pass: &str,
) -> Result<Vec<SymbolStats>, StoreError> {
    let data = artifacts.read(names::SYMBOL_STATS, pass)?;
    let mut src = data.as_slice();
    let count = bin_ser_de::deserialize_u32_from(&mut src)
        .map_err(StoreError::corrupt("symbol-stats"))?;
    let mut stats = Vec::with_capacity(count as usize);
    for _ in 0..count {
        stats.push(
            SymbolStats::deserialize_from(&mut src)
                .map_err(StoreError::corrupt("symbol-stats"))?,
        );
    }
    Ok(stats)
}

pub(super) struct SymbolRecord {
    pub(super) id: SymbolId,
    pub(super) project: ProjectId,
    pub(super) name: Vec<u8>,
    pub(super) kind: SymbolKind,
}

pub(super) fn write_symbols(
    artifacts: &Artifacts,
    pass: &str,
    symbols: &[SymbolRecord],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(names::SYMBOLS, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(symbols.len()).unwrap(), &mut buf);
    for symbol in symbols {
        bin_ser_de::serialize_u32_into(symbol.id.0, &mut buf);
        bin_ser_de::serialize_u32_into(symbol.project.0, &mut buf);
        bin_ser_de::serialize_byte_slice_into(&symbol.name, &mut buf);
        buf.push(match symbol.kind {
            SymbolKind::Branch => 0,
            SymbolKind::Tag => 1,
            SymbolKind::Excluded => 2,
        });
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) fn read_symbols(
    artifacts: &Artifacts,
    pass: &str,
) -> Result<Vec<SymbolRecord>, StoreError> {
    let data = artifacts.read(names::SYMBOLS, pass)?;
    let mut src = data.as_slice();
    let corrupt = StoreError::corrupt("symbols");

    let count = bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?;
    let mut symbols = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let corrupt = StoreError::corrupt("symbols");
        let id = SymbolId(bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?);
        let corrupt = StoreError::corrupt("symbols");
        let project = ProjectId(bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?);
        let corrupt = StoreError::corrupt("symbols");
        let name = bin_ser_de::deserialize_byte_slice_from(&mut src).map_err(corrupt)?;
        let corrupt = StoreError::corrupt("symbols");
        let kind = match bin_ser_de::deserialize_byte_from(&mut src).map_err(corrupt)? {
            0 => SymbolKind::Branch,
            1 => SymbolKind::Tag,
            2 => SymbolKind::Excluded,
            _ => return Err(StoreError::Corrupt { name: "symbols" }),
        };
        symbols.push(SymbolRecord {
            id,
            project,
            name,
            kind,
        });
    }
    Ok(symbols)
}

// ---------------------------------------------------------------------------
// The item store: authoritative record of items after init-changesets, laid
// out sequentially grouped by changeset, with a separate offset index for
// random access by item id.

pub(super) struct ItemStoreWriter {
    data: std::io::BufWriter<std::fs::File>,
    index: Vec<(u32, u64, u32)>,
    offset: u64,
}

impl ItemStoreWriter {
    pub(super) fn new(artifacts: &Artifacts, pass: &str) -> Result<Self, std::io::Error> {
        Ok(Self {
            data: artifacts.create(names::ITEMS, pass)?,
            index: Vec::new(),
            offset: 0,
        })
    }

    pub(super) fn put(&mut self, item: &Item) -> Result<(), std::io::Error> {
        let payload = item.serialize();
        let len = u32::try_from(payload.len()).unwrap();
        self.data.write_all(&len.to_le_bytes())?;
        self.data.write_all(&payload)?;
        self.index.push((item.id().0, self.offset + 4, len));
        self.offset += 4 + u64::from(len);
        Ok(())
    }

    pub(super) fn finish(mut self, artifacts: &Artifacts, pass: &str) -> Result<(), std::io::Error> {
        self.data.flush()?;

        let mut index_writer = artifacts.create(names::ITEM_INDEX, pass)?;
        let mut buf = Vec::new();
        bin_ser_de::serialize_u32_into(u32::try_from(self.index.len()).unwrap(), &mut buf);
        for &(id, offset, len) in self.index.iter() {
            bin_ser_de::serialize_u32_into(id, &mut buf);
            bin_ser_de::serialize_u64_into(offset, &mut buf);
            bin_ser_de::serialize_u32_into(len, &mut buf);
        }
        index_writer.write_all(&buf)?;
        index_writer.flush()
    }
}

pub(super) struct ItemStore {
    data: std::io::BufReader<std::fs::File>,
    /// Byte position of the first record, right after the magic header.
    base: u64,
    index: FHashMap<ItemId, (u64, u32)>,
}

impl ItemStore {
    pub(super) fn open(artifacts: &Artifacts, pass: &str) -> Result<Self, StoreError> {
        let index_data = artifacts.read(names::ITEM_INDEX, pass)?;
        let mut src = index_data.as_slice();
        let count = bin_ser_de::deserialize_u32_from(&mut src)
            .map_err(StoreError::corrupt("items.idx"))?;
        let mut index = FHashMap::default();
        for _ in 0..count {
            let corrupt = StoreError::corrupt("items.idx");
            let id = bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?;
            let corrupt = StoreError::corrupt("items.idx");
            let offset = bin_ser_de::deserialize_u64_from(&mut src).map_err(corrupt)?;
            let corrupt = StoreError::corrupt("items.idx");
            let len = bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?;
            index.insert(ItemId(id), (offset, len));
        }

        let mut data = artifacts.open(names::ITEMS, pass)?;
        let base = data.stream_position()?;

        Ok(Self { data, base, index })
    }

    pub(super) fn get(&mut self, id: ItemId) -> Result<Item, StoreError> {
        let &(offset, len) = self
            .index
            .get(&id)
            .ok_or(StoreError::Corrupt { name: "items.idx" })?;
        self.data.seek(std::io::SeekFrom::Start(self.base + offset))?;
        let mut payload = vec![0; len as usize];
        self.data.read_exact(&mut payload)?;
        Item::deserialize(&payload).map_err(StoreError::corrupt("items"))
    }

    /// Streams every item in storage order (grouped by changeset).
    pub(super) fn for_each(
        &mut self,
        mut f: impl FnMut(Item),
    ) -> Result<(), StoreError> {
        self.data.seek(std::io::SeekFrom::Start(self.base))?;
        for _ in 0..self.index.len() {
            let mut len_bytes = [0u8; 4];
            self.data.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes);
            let mut payload = vec![0; len as usize];
            self.data.read_exact(&mut payload)?;
            f(Item::deserialize(&payload).map_err(StoreError::corrupt("items"))?);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Changeset store and the item -> changeset map. Both are rewritten whole by
// every pass that repartitions items.

pub(super) fn write_changesets(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
    changesets: &[Changeset],
) -> Result<(), std::io::Error> {
    let mut writer = artifacts.create(name, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(changesets.len()).unwrap(), &mut buf);
    for changeset in changesets {
        changeset.serialize_into(&mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) fn read_changesets(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
) -> Result<Vec<Changeset>, StoreError> {
    let data = artifacts.read(name, pass)?;
    let mut src = data.as_slice();
    let count = bin_ser_de::deserialize_u32_from(&mut src)
        .map_err(StoreError::corrupt("changesets"))?;
    let mut changesets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        changesets.push(
            Changeset::deserialize_from(&mut src).map_err(StoreError::corrupt("changesets"))?,
        );
    }
    Ok(changesets)
}

pub(super) fn write_item_map(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
    map: &FHashMap<ItemId, ChangesetId>,
) -> Result<(), std::io::Error> {
    let mut entries: Vec<_> = map.iter().map(|(&item, &cs)| (item.0, cs.0)).collect();
    entries.sort_unstable();

    let mut writer = artifacts.create(name, pass)?;
    let mut buf = Vec::new();
    bin_ser_de::serialize_u32_into(u32::try_from(entries.len()).unwrap(), &mut buf);
    for (item, changeset) in entries {
        bin_ser_de::serialize_u32_into(item, &mut buf);
        bin_ser_de::serialize_u32_into(changeset, &mut buf);
    }
    writer.write_all(&buf)?;
    writer.flush()
}

pub(super) fn read_item_map(
    artifacts: &Artifacts,
    name: &str,
    pass: &str,
) -> Result<FHashMap<ItemId, ChangesetId>, StoreError> {
    let data = artifacts.read(name, pass)?;
    let mut src = data.as_slice();
    let count =
        bin_ser_de::deserialize_u32_from(&mut src).map_err(StoreError::corrupt("item-map"))?;
    let mut map = FHashMap::default();
    for _ in 0..count {
        let corrupt = StoreError::corrupt("item-map");
        let item = bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?;
        let corrupt = StoreError::corrupt("item-map");
        let changeset = bin_ser_de::deserialize_u32_from(&mut src).map_err(corrupt)?;
        map.insert(ItemId(item), ChangesetId(changeset));
    }
    Ok(map)
}

/// Consistency check between a changeset partition and the item map:
/// membership must agree both ways, with every item in exactly one changeset.
pub(super) fn check_partition(
    changesets: &[Changeset],
    map: &FHashMap<ItemId, ChangesetId>,
) -> bool {
    let mut seen = 0usize;
    for changeset in changesets {
        for &item in changeset.items.iter() {
            if map.get(&item) != Some(&changeset.id) {
                return false;
            }
            seen += 1;
        }
    }
    seen == map.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::model::{ChangesetKind, CvsTag, Lod, MetadataId};
    use crate::rcs::number::RevNum;
    use smallvec::SmallVec;

    fn make_revision(id: u32) -> Item {
        Item::Revision(crate::convert::model::CvsRevision {
            id: ItemId(id),
            file: FileId(0),
            lod: Lod::Trunk,
            number: RevNum::parse(b"1.1").unwrap(),
            timestamp: 1000,
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

    #[test]
    fn item_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path()).unwrap();

        let items = [
            make_revision(0),
            Item::Tag(CvsTag {
                id: ItemId(1),
                file: FileId(0),
                symbol: SymbolId(4),
                source: Some(ItemId(0)),
            }),
            make_revision(2),
        ];

        let mut writer = ItemStoreWriter::new(&artifacts, "init-changesets").unwrap();
        for item in items.iter() {
            writer.put(item).unwrap();
        }
        writer.finish(&artifacts, "init-changesets").unwrap();
        artifacts
            .commit(&[names::ITEMS, names::ITEM_INDEX])
            .unwrap();

        let mut store = ItemStore::open(&artifacts, "init-changesets").unwrap();
        assert_eq!(store.get(ItemId(1)).unwrap(), items[1]);
        assert_eq!(store.get(ItemId(0)).unwrap(), items[0]);

        let mut streamed = Vec::new();
        store.for_each(|item| streamed.push(item)).unwrap();
        assert_eq!(streamed, items);
    }

    #[test]
    fn partition_check() {
        let changesets = vec![Changeset {
            id: ChangesetId(0),
            kind: ChangesetKind::Tag {
                symbol: SymbolId(4),
            },
            items: vec![ItemId(1)],
            order: None,
        }];
        let mut map = FHashMap::default();
        map.insert(ItemId(1), ChangesetId(0));
        assert!(check_partition(&changesets, &map));

        map.insert(ItemId(2), ChangesetId(0));
        assert!(!check_partition(&changesets, &map));
    }
}
