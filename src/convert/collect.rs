use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use smallvec::SmallVec;

use super::artifacts::names;
use super::model::{
    CvsBranch, CvsRevision, CvsTag, FileId, Item, ItemId, Lod, MetadataId, ProjectId, SymbolId,
    SymbolStats,
};
use super::stores::{self, MetadataRecord, PathRecord, ProjectRecord};
use super::{bin_ser_de, ConvertError, PassContext};
use crate::rcs::number::RevNum;
use crate::rcs::parse::{self, ParseError};
use crate::FHashMap;

pub(super) const PASS: &str = "collect";

// The collect pass parses every RCS file, builds the per-file item graph
// (revisions, branch creations, tag placements and the dependency edges
// between them), applies the vendor-branch and added-on-branch
// normalizations, interns commit metadata by digest and accumulates
// per-symbol usage statistics. Everything later works from its outputs.

#[derive(Debug)]
enum FileError {
    Io(std::io::Error),
    Parse(ParseError),
    NoHead,
    MissingRevision { number: String },
    UnnamedBranch { number: String },
    AtticConflict,
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ParseError> for FileError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read file: {e}"),
            Self::Parse(ref e) => write!(f, "failed to parse RCS file: {e}"),
            Self::NoHead => write!(f, "RCS file has no head revision"),
            Self::MissingRevision { ref number } => {
                write!(f, "missing revision {number}")
            }
            Self::UnnamedBranch { ref number } => {
                write!(f, "branch {number} has no symbolic name")
            }
            Self::AtticConflict => {
                write!(f, "file exists both in and out of the Attic")
            }
        }
    }
}

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 1: collect RCS files");

    let mut pass = Pass {
        ctx,
        bundles: Vec::new(),
        projects: Vec::new(),
        paths: Vec::new(),
        metadata: Vec::new(),
        metadata_index: FHashMap::default(),
        symbol_ids: FHashMap::default(),
        symbol_stats: BTreeMap::new(),
        next_item_id: 0,
        files_collected: 0,
        files_skipped: 0,
    };

    let mut bundles_writer = ctx.artifacts.create(names::ITEM_BUNDLES, PASS).map_err(|e| {
        tracing::error!("failed to create item bundle file: {e}");
        ConvertError
    })?;

    let project_names = ctx.options.projects.clone();
    for (project_index, project_name) in project_names.iter().enumerate() {
        let project = ProjectId(u32::try_from(project_index).unwrap());
        pass.projects.push(ProjectRecord {
            id: project,
            name: project_name.as_bytes().to_vec(),
        });

        let project_root = if project_name.is_empty() {
            ctx.options.src_path.clone()
        } else {
            ctx.options.src_path.join(project_name)
        };

        let rcs_files = gather_rcs_files(&project_root).map_err(|e| {
            tracing::error!("failed to scan {project_root:?}: {e}");
            ConvertError
        })?;

        let mut seen_logical = FHashMap::default();
        for (logical_path, fs_path) in rcs_files {
            pass.ctx.progress.set_progress(format!(
                "collecting - {} ({} files done)",
                String::from_utf8_lossy(&logical_path),
                pass.files_collected,
            ));

            let result = if seen_logical.insert(logical_path.clone(), ()).is_some() {
                Err(FileError::AtticConflict)
            } else {
                pass.collect_file(project, &logical_path, &fs_path, &mut bundles_writer)
            };

            match result {
                Ok(()) => pass.files_collected += 1,
                Err(e) => {
                    tracing::error!(
                        "skipping \"{}\": {e}",
                        fs_path.display(),
                    );
                    pass.files_skipped += 1;
                }
            }
        }
    }

    if pass.files_collected == 0 {
        tracing::error!("no RCS files collected");
        return Err(ConvertError);
    }
    if pass.files_skipped != 0 {
        tracing::warn!(
            "skipped {} of {} files",
            pass.files_skipped,
            pass.files_collected + pass.files_skipped,
        );
    }

    bundles_writer.flush().map_err(|e| {
        tracing::error!("failed to write item bundles: {e}");
        ConvertError
    })?;

    let io_fail = |e: std::io::Error| {
        tracing::error!("failed to write collect outputs: {e}");
        ConvertError
    };

    stores::write_projects(ctx.artifacts, PASS, &pass.projects).map_err(io_fail)?;
    stores::write_paths(ctx.artifacts, PASS, &pass.paths).map_err(io_fail)?;
    stores::write_metadata(ctx.artifacts, names::METADATA, PASS, &pass.metadata)
        .map_err(io_fail)?;
    let stats: Vec<SymbolStats> = pass.symbol_stats.into_values().collect();
    stores::write_symbol_stats(ctx.artifacts, PASS, &stats).map_err(io_fail)?;

    ctx.artifacts
        .commit(&[
            names::ITEM_BUNDLES,
            names::PROJECTS,
            names::PATHS,
            names::METADATA,
            names::SYMBOL_STATS,
        ])
        .map_err(io_fail)?;

    tracing::info!(
        "collected {} files, {} symbols, {} metadata records",
        pass.files_collected,
        stats.len(),
        pass.metadata.len(),
    );

    Ok(())
}

/// Walks a project tree and returns `(logical_path, filesystem_path)` pairs
/// for every `,v` file, sorted by logical path. `Attic/` components are
/// elided from logical paths; `CVSROOT` is administrative and not converted.
fn gather_rcs_files(root: &Path) -> Result<Vec<(Vec<u8>, PathBuf)>, std::io::Error> {
    let mut files = Vec::new();
    let mut dir_queue = vec![(root.to_path_buf(), Vec::<u8>::new())];

    while let Some((dir, logical_dir)) = dir_queue.pop() {
        for entry in dir.read_dir()? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name();
            let raw_name = name.as_encoded_bytes();

            if file_type.is_dir() {
                if logical_dir.is_empty() && raw_name == b"CVSROOT" {
                    continue;
                }
                let sub_logical = if raw_name == b"Attic" {
                    logical_dir.clone()
                } else {
                    join_logical(&logical_dir, raw_name)
                };
                dir_queue.push((entry.path(), sub_logical));
            } else if let Some(stem) = raw_name.strip_suffix(b",v") {
                files.push((join_logical(&logical_dir, stem), entry.path()));
            }
        }
    }

    files.sort();
    Ok(files)
}

fn join_logical(dir: &[u8], name: &[u8]) -> Vec<u8> {
    if dir.is_empty() {
        name.to_vec()
    } else {
        let mut joined = Vec::with_capacity(dir.len() + 1 + name.len());
        joined.extend(dir);
        joined.push(b'/');
        joined.extend(name);
        joined
    }
}

struct Pass<'a, 'b> {
    ctx: &'a PassContext<'b>,
    bundles: Vec<u8>,
    projects: Vec<ProjectRecord>,
    paths: Vec<PathRecord>,
    metadata: Vec<MetadataRecord>,
    metadata_index: FHashMap<[u8; 20], MetadataId>,
    symbol_ids: FHashMap<(ProjectId, Vec<u8>), SymbolId>,
    symbol_stats: BTreeMap<SymbolId, SymbolStats>,
    next_item_id: u32,
    files_collected: usize,
    files_skipped: usize,
}

/// Everything the parser reports about one RCS file.
#[derive(Default)]
struct FileFacts {
    head: Option<RevNum>,
    default_branch: Option<RevNum>,
    symbols: Vec<(Vec<u8>, RevNum)>,
    revisions: Vec<RevFacts>,
    logs: HashMap<RevNum, Vec<u8>>,
}

struct RevFacts {
    number: RevNum,
    timestamp: i64,
    author: Vec<u8>,
    dead: bool,
    branches: Vec<RevNum>,
    next: Option<RevNum>,
}

impl parse::Sink for FileFacts {
    fn set_head_revision(&mut self, revision: RevNum) {
        self.head = Some(revision);
    }

    fn set_default_branch(&mut self, branch: RevNum) {
        self.default_branch = Some(branch);
    }

    fn define_symbol(&mut self, name: &[u8], number: RevNum) {
        self.symbols.push((name.to_vec(), number));
    }

    fn admin_completed(&mut self) {}

    fn define_revision(
        &mut self,
        number: RevNum,
        timestamp: i64,
        author: &[u8],
        dead: bool,
        branches: Vec<RevNum>,
        next: Option<RevNum>,
    ) {
        self.revisions.push(RevFacts {
            number,
            timestamp,
            author: author.to_vec(),
            dead,
            branches,
            next,
        });
    }

    fn tree_completed(&mut self) {}

    fn set_description(&mut self, _description: &[u8]) {}

    fn set_revision_info(&mut self, number: RevNum, log: &[u8], _text: &[u8]) {
        self.logs.insert(number, log.to_vec());
    }

    fn parse_completed(&mut self) {}
}

impl Pass<'_, '_> {
    fn alloc_item_id(&mut self) -> ItemId {
        let id = ItemId(self.next_item_id);
        self.next_item_id += 1;
        id
    }

    fn intern_symbol(&mut self, project: ProjectId, name: &[u8]) -> SymbolId {
        if let Some(&id) = self.symbol_ids.get(&(project, name.to_vec())) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.symbol_ids.len()).unwrap());
        self.symbol_ids.insert((project, name.to_vec()), id);
        self.symbol_stats.insert(
            id,
            SymbolStats {
                symbol: id,
                project,
                name: name.to_vec(),
                tag_uses: 0,
                branch_uses: 0,
                branch_commit_files: 0,
                blockers: Vec::new(),
                possible_parents: Vec::new(),
            },
        );
        id
    }

    fn intern_metadata(
        &mut self,
        project: ProjectId,
        branch_name: &[u8],
        author: &[u8],
        log: &[u8],
    ) -> MetadataId {
        let mut hasher = Sha256::new();
        hasher.update(author);
        hasher.update([0]);
        hasher.update(log);
        if !self.ctx.options.cross_project_commits {
            hasher.update([0]);
            hasher.update(project.0.to_le_bytes());
        }
        if !self.ctx.options.cross_branch_commits {
            hasher.update([0]);
            hasher.update(branch_name);
        }
        let digest: [u8; 20] = hasher.finalize()[..20].try_into().unwrap();

        if let Some(&id) = self.metadata_index.get(&digest) {
            return id;
        }
        let id = MetadataId(u32::try_from(self.metadata.len()).unwrap());
        self.metadata.push(MetadataRecord {
            digest,
            author: author.to_vec(),
            log: log.to_vec(),
        });
        self.metadata_index.insert(digest, id);
        id
    }

    fn collect_file(
        &mut self,
        project: ProjectId,
        logical_path: &[u8],
        fs_path: &Path,
        bundles_writer: &mut std::io::BufWriter<std::fs::File>,
    ) -> Result<(), FileError> {
        let raw = std::fs::read(fs_path)?;
        let mut facts = FileFacts::default();
        parse::parse(&raw, &mut facts)?;
        facts.head.as_ref().ok_or(FileError::NoHead)?;

        let file = FileId(u32::try_from(self.paths.len()).unwrap());

        let mut build = self.build_items(project, file, &facts)?;
        build.normalize(&facts, self.ctx.options.commit_threshold);
        if self.ctx.options.trunk_only {
            build.graft_trunk_only(facts.default_branch.as_ref());
        }
        build.scrub_dangling();

        self.paths.push(PathRecord {
            id: file,
            project,
            path: logical_path.to_vec(),
        });

        self.accumulate_stats(&build);

        // Serialize the bundle: a length-prefixed block of items so the
        // filter pass can stream file by file.
        self.bundles.clear();
        let mut payload = Vec::new();
        bin_ser_de::serialize_u32_into(u32::try_from(build.items.len()).unwrap(), &mut payload);
        for item in build.items.values() {
            item.serialize_into(&mut payload);
        }
        bin_ser_de::serialize_u32_into(u32::try_from(payload.len()).unwrap(), &mut self.bundles);
        self.bundles.extend(&payload);
        bundles_writer.write_all(&self.bundles)?;

        Ok(())
    }

    /// Builds the full per-file item graph, before normalization.
    fn build_items(
        &mut self,
        project: ProjectId,
        file: FileId,
        facts: &FileFacts,
    ) -> Result<FileBuild, FileError> {
        // Branch and tag definitions from the symbols table.
        let mut branch_defs: Vec<(SymbolId, RevNum)> = Vec::new();
        let mut tag_defs: Vec<(SymbolId, RevNum)> = Vec::new();
        let mut lod_by_branch: HashMap<RevNum, SymbolId> = HashMap::new();
        for (name, number) in facts.symbols.iter() {
            if let Some(branch_number) = number.as_branch_number() {
                let symbol = self.intern_symbol(project, name);
                lod_by_branch.entry(branch_number.clone()).or_insert(symbol);
                branch_defs.push((symbol, branch_number));
            } else {
                let symbol = self.intern_symbol(project, name);
                tag_defs.push((symbol, number.clone()));
            }
        }

        // Every branch containing revisions must carry a symbolic name.
        for rev in facts.revisions.iter() {
            for branch_head in rev.branches.iter() {
                let branch = branch_head.branch_of();
                if !lod_by_branch.contains_key(&branch) {
                    return Err(FileError::UnnamedBranch {
                        number: branch.to_string(),
                    });
                }
            }
        }

        let mut build = FileBuild {
            items: BTreeMap::new(),
            rev_ids: HashMap::new(),
        };

        // Revision items.
        for rev in facts.revisions.iter() {
            let lod = if rev.number.is_trunk_revision() {
                Lod::Trunk
            } else {
                Lod::Branch(*lod_by_branch.get(&rev.number.branch_of()).ok_or_else(
                    || FileError::UnnamedBranch {
                        number: rev.number.branch_of().to_string(),
                    },
                )?)
            };

            let id = self.alloc_item_id();
            build.rev_ids.insert(rev.number.clone(), id);
            let metadata = {
                let branch_name = match lod {
                    Lod::Trunk => Vec::new(),
                    Lod::Branch(symbol) => self.symbol_stats[&symbol].name.clone(),
                };
                let log = facts.logs.get(&rev.number).map_or(&[][..], Vec::as_slice);
                self.intern_metadata(project, &branch_name, &rev.author, log)
            };
            build.items.insert(
                id,
                Item::Revision(CvsRevision {
                    id,
                    file,
                    lod,
                    number: rev.number.clone(),
                    timestamp: rev.timestamp,
                    dead: rev.dead,
                    metadata,
                    prev: None,
                    next: None,
                    branches: SmallVec::new(),
                    tags: SmallVec::new(),
                    opens: Vec::new(),
                    closes: Vec::new(),
                }),
            );
        }

        // Predecessor / successor edges from the `next` links: trunk `next`
        // points at the older revision, branch `next` at the newer one.
        for rev in facts.revisions.iter() {
            let Some(ref next) = rev.next else {
                continue;
            };
            let this_id = build.rev_ids[&rev.number];
            let next_id = *build
                .rev_ids
                .get(next)
                .ok_or_else(|| FileError::MissingRevision {
                    number: next.to_string(),
                })?;

            let (older, newer) = if rev.number.is_trunk_revision() {
                (next_id, this_id)
            } else {
                (this_id, next_id)
            };
            build.revision_mut(newer).prev = Some(older);
            build.revision_mut(older).next = Some(newer);
        }

        // Branch creation items.
        for (symbol, branch_number) in branch_defs {
            let base_number = branch_number.branch_base();
            let source = *build.rev_ids.get(&base_number).ok_or_else(|| {
                FileError::MissingRevision {
                    number: base_number.to_string(),
                }
            })?;

            let mut first_commit_number = branch_number.components().to_vec();
            first_commit_number.push(1);
            let first_commit = build
                .rev_ids
                .get(&RevNum::from_components(first_commit_number))
                .copied();

            let id = self.alloc_item_id();
            build.items.insert(
                id,
                Item::Branch(CvsBranch {
                    id,
                    file,
                    symbol,
                    source: Some(source),
                    first_commit,
                }),
            );
            build.revision_mut(source).branches.push(id);
            if let Some(first_commit) = first_commit {
                // The first commit on a branch depends on the creation of
                // the branch, not directly on the base revision.
                let first = build.revision_mut(first_commit);
                if first.prev.is_none() {
                    first.prev = Some(id);
                }
            }
        }

        // Tag items.
        for (symbol, revision_number) in tag_defs {
            let source = *build.rev_ids.get(&revision_number).ok_or_else(|| {
                FileError::MissingRevision {
                    number: revision_number.to_string(),
                }
            })?;

            let id = self.alloc_item_id();
            build.items.insert(
                id,
                Item::Tag(CvsTag {
                    id,
                    file,
                    symbol,
                    source: Some(source),
                }),
            );
            build.revision_mut(source).tags.push(id);
        }

        Ok(build)
    }

    fn accumulate_stats(&mut self, build: &FileBuild) {
        for item in build.items.values() {
            match item {
                Item::Branch(branch) => {
                    let stats = self.symbol_stats.get_mut(&branch.symbol).unwrap();
                    stats.branch_uses += 1;
                    if branch.first_commit.is_some() {
                        stats.branch_commit_files += 1;
                    }
                }
                Item::Tag(tag) => {
                    self.symbol_stats.get_mut(&tag.symbol).unwrap().tag_uses += 1;
                }
                Item::Revision(_) => {}
            }
        }

        // Blockers and the possible-parents histogram both look at the
        // source revision of each symbol item.
        for item in build.items.values() {
            let (symbol, source) = match item {
                Item::Branch(branch) => (branch.symbol, branch.source),
                Item::Tag(tag) => (tag.symbol, tag.source),
                Item::Revision(_) => continue,
            };
            let Some(source) = source else {
                continue;
            };
            let Some(Item::Revision(source_rev)) = build.items.get(&source) else {
                continue;
            };

            if let Lod::Branch(host) = source_rev.lod {
                let stats = self.symbol_stats.get_mut(&host).unwrap();
                if !stats.blockers.contains(&symbol) {
                    stats.blockers.push(symbol);
                }
            }

            let mut parents: Vec<Lod> = vec![source_rev.lod];
            for &sibling in source_rev.branches.iter() {
                if let Some(Item::Branch(sibling_branch)) = build.items.get(&sibling) {
                    if sibling_branch.symbol != symbol {
                        parents.push(Lod::Branch(sibling_branch.symbol));
                    }
                }
            }

            let stats = self.symbol_stats.get_mut(&symbol).unwrap();
            for parent in parents {
                match stats.possible_parents.iter_mut().find(|(lod, _)| *lod == parent) {
                    Some((_, count)) => *count += 1,
                    None => stats.possible_parents.push((parent, 1)),
                }
            }
        }
    }
}

struct FileBuild {
    items: BTreeMap<ItemId, Item>,
    rev_ids: HashMap<RevNum, ItemId>,
}

impl FileBuild {
    fn revision_mut(&mut self, id: ItemId) -> &mut CvsRevision {
        match self.items.get_mut(&id) {
            Some(Item::Revision(rev)) => rev,
            _ => unreachable!("item {id} is not a revision"),
        }
    }

    fn revision(&self, id: ItemId) -> Option<&CvsRevision> {
        match self.items.get(&id) {
            Some(Item::Revision(rev)) => Some(rev),
            _ => None,
        }
    }

    fn rev_id(&self, number: &str) -> Option<ItemId> {
        self.rev_ids
            .get(&RevNum::parse(number.as_bytes()).unwrap())
            .copied()
    }

    fn normalize(&mut self, facts: &FileFacts, commit_threshold: i64) {
        self.normalize_vendor_branch(facts);
        self.normalize_added_on_branch();
        self.normalize_late_added_on_branch(commit_threshold);
    }

    /// If trunk came from a vendor import, the synthetic `1.1` written by
    /// `cvs import` is dropped and trunk revisions depend on the vendor
    /// chain instead.
    fn normalize_vendor_branch(&mut self, facts: &FileFacts) {
        let Some(rev_1_1) = self.rev_id("1.1") else {
            return;
        };
        let Some(vendor_first) = self.rev_id("1.1.1.1") else {
            return;
        };

        let one_one = self.revision(rev_1_1).unwrap();
        let vendor_ts = self.revision(vendor_first).unwrap().timestamp;
        let log = facts
            .logs
            .get(&RevNum::parse(b"1.1").unwrap())
            .map_or(&[][..], Vec::as_slice);
        let synthetic = !one_one.dead
            && (one_one.timestamp - vendor_ts).abs() <= 2
            && (log.is_empty() || log == b"Initial revision\n");
        if !synthetic {
            return;
        }

        // Last revision on the vendor branch.
        let mut vendor_last = vendor_first;
        while let Some(next) = self.revision(vendor_last).unwrap().next {
            vendor_last = next;
        }

        // Trunk now continues from the vendor chain.
        let trunk_next = self.revision(rev_1_1).unwrap().next;
        if let Some(rev_1_2) = trunk_next {
            self.revision_mut(rev_1_2).prev = Some(vendor_last);
            self.revision_mut(vendor_last).next = Some(rev_1_2);
        }

        // Symbols placed on 1.1 move to the first vendor revision; the
        // vendor branch itself loses its source and roots the file.
        let one_one = self.revision(rev_1_1).unwrap();
        let moved_branches: Vec<ItemId> = one_one.branches.to_vec();
        let moved_tags: Vec<ItemId> = one_one.tags.to_vec();
        for branch_id in moved_branches {
            let is_vendor = matches!(
                self.items.get(&branch_id),
                Some(Item::Branch(branch)) if branch.first_commit == Some(vendor_first)
            );
            if let Some(Item::Branch(branch)) = self.items.get_mut(&branch_id) {
                if is_vendor {
                    branch.source = None;
                } else {
                    branch.source = Some(vendor_first);
                }
            }
            if !is_vendor {
                self.revision_mut(vendor_first).branches.push(branch_id);
            }
        }
        for tag_id in moved_tags {
            if let Some(Item::Tag(tag)) = self.items.get_mut(&tag_id) {
                tag.source = Some(vendor_first);
            }
            self.revision_mut(vendor_first).tags.push(tag_id);
        }

        self.items.remove(&rev_1_1);
    }

    /// A file that first appeared on a branch has a dead `1.1` placeholder
    /// on trunk; the placeholder goes away and the branch is severed from
    /// trunk.
    fn normalize_added_on_branch(&mut self) {
        let Some(rev_1_1) = self.rev_id("1.1") else {
            return;
        };
        let one_one = match self.revision(rev_1_1) {
            Some(rev) if rev.dead && !rev.branches.is_empty() => rev,
            _ => return,
        };

        let branches: Vec<ItemId> = one_one.branches.to_vec();
        let tags: Vec<ItemId> = one_one.tags.to_vec();
        let trunk_next = one_one.next;

        for branch_id in branches {
            if let Some(Item::Branch(branch)) = self.items.get_mut(&branch_id) {
                branch.source = None;
            }
        }
        for tag_id in tags {
            // Tags on a dead placeholder never correspond to a real state.
            self.items.remove(&tag_id);
        }
        if let Some(rev_1_2) = trunk_next {
            self.revision_mut(rev_1_2).prev = None;
        }

        self.items.remove(&rev_1_1);
    }

    /// Modern CVS inserts a dead first-branch revision when a file is added
    /// on a branch at a point where its trunk state is dead. The placeholder
    /// is dropped and the branch detached.
    fn normalize_late_added_on_branch(&mut self, commit_threshold: i64) {
        let branch_ids: Vec<ItemId> = self
            .items
            .values()
            .filter_map(|item| match item {
                Item::Branch(branch) => Some(branch.id),
                _ => None,
            })
            .collect();

        for branch_id in branch_ids {
            let Some(Item::Branch(branch)) = self.items.get(&branch_id) else {
                continue;
            };
            let (Some(source), Some(first_commit)) = (branch.source, branch.first_commit) else {
                continue;
            };
            let Some(source_rev) = self.revision(source) else {
                continue;
            };
            let Some(first_rev) = self.revision(first_commit) else {
                continue;
            };
            if !source_rev.dead
                || !first_rev.dead
                || (first_rev.timestamp - source_rev.timestamp).abs() > commit_threshold
            {
                continue;
            }

            let second_commit = first_rev.next;
            if let Some(second_commit) = second_commit {
                self.revision_mut(second_commit).prev = Some(branch_id);
            }
            self.items.remove(&first_commit);

            let source_rev = self.revision_mut(source);
            source_rev.branches.retain(|b| *b != branch_id);

            if let Some(Item::Branch(branch)) = self.items.get_mut(&branch_id) {
                branch.source = None;
                branch.first_commit = second_commit;
            }
        }
    }

    /// Trunk-only conversion: default-branch revisions are grafted onto
    /// trunk, everything else off trunk disappears.
    fn graft_trunk_only(&mut self, default_branch: Option<&RevNum>) {
        let keep_branch = default_branch.and_then(|number| number.as_branch_number());

        // The first grafted revision depends on the creation item of the
        // default branch, which is about to be deleted along with every
        // other symbol item. Splice that edge through to the branch's own
        // source so the grafted chain stays attached to its trunk base
        // (`None` if an earlier normalization already detached the branch).
        if let Some(ref keep_branch) = keep_branch {
            let splices: Vec<(ItemId, Option<ItemId>)> = self
                .items
                .values()
                .filter_map(|item| match item {
                    Item::Branch(branch) => {
                        let first_commit = branch.first_commit?;
                        let grafted = self.revision(first_commit).is_some_and(|rev| {
                            rev.number.is_branch_revision()
                                && rev.number.branch_of() == *keep_branch
                        });
                        grafted.then_some((first_commit, branch.source))
                    }
                    _ => None,
                })
                .collect();
            for (first_commit, source) in splices {
                self.revision_mut(first_commit).prev = source;
            }
        }

        let ids: Vec<ItemId> = self.items.keys().copied().collect();
        for id in ids {
            let keep = match self.items.get(&id) {
                Some(Item::Revision(rev)) => {
                    let grafted = keep_branch.as_ref().is_some_and(|branch| {
                        rev.number.is_branch_revision() && rev.number.branch_of() == *branch
                    });
                    (rev.number.is_trunk_revision() || grafted).then_some(grafted)
                }
                Some(Item::Branch(_)) | Some(Item::Tag(_)) | None => None,
            };
            match keep {
                Some(grafted) => {
                    let rev = self.revision_mut(id);
                    if grafted {
                        rev.lod = Lod::Trunk;
                    }
                    rev.branches.clear();
                    rev.tags.clear();
                }
                None => {
                    self.items.remove(&id);
                }
            }
        }
    }

    /// Drops references to items deleted by the normalizations.
    fn scrub_dangling(&mut self) {
        let live: std::collections::BTreeSet<ItemId> = self.items.keys().copied().collect();
        for item in self.items.values_mut() {
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
}
