use std::io::{BufRead as _, Read, Write as _};
use std::path::{Path, PathBuf};

// Every intermediate file starts with a magic line naming the pass that
// produced it and a schema version. Passes write `<name>.tmp` files and the
// pipeline driver renames them into place once the pass has succeeded, so an
// interrupted run never leaves a half-written artifact under its final name.

pub(super) const SCHEMA_VERSION: u32 = 1;

pub(super) mod names {
    pub(in crate::convert) const PROJECTS: &str = "projects.dat";
    pub(in crate::convert) const PATHS: &str = "paths.dat";
    pub(in crate::convert) const ITEM_BUNDLES: &str = "item-bundles.dat";
    pub(in crate::convert) const SYMBOL_STATS: &str = "symbol-stats.dat";
    pub(in crate::convert) const METADATA: &str = "metadata.dat";
    pub(in crate::convert) const METADATA_CLEAN: &str = "metadata-clean.dat";
    pub(in crate::convert) const SYMBOLS: &str = "symbols.dat";
    pub(in crate::convert) const REV_STREAM: &str = "revs.txt";
    pub(in crate::convert) const SYMBOL_STREAM: &str = "symbols.txt";
    pub(in crate::convert) const REV_STREAM_SORTED: &str = "revs-sorted.txt";
    pub(in crate::convert) const SYMBOL_STREAM_SORTED: &str = "symbols-sorted.txt";
    pub(in crate::convert) const ITEMS: &str = "items.dat";
    pub(in crate::convert) const ITEM_INDEX: &str = "items.idx";
    pub(in crate::convert) const ITEM_MAP_INIT: &str = "item-map-init.dat";
    pub(in crate::convert) const ITEM_MAP_REV_BROKEN: &str = "item-map-revbroken.dat";
    pub(in crate::convert) const ITEM_MAP_SYM_BROKEN: &str = "item-map-symbroken.dat";
    pub(in crate::convert) const ITEM_MAP_FINAL: &str = "item-map-final.dat";
    pub(in crate::convert) const CHANGESETS_INIT: &str = "changesets-init.dat";
    pub(in crate::convert) const CHANGESETS_REV_BROKEN: &str = "changesets-revbroken.dat";
    pub(in crate::convert) const CHANGESETS_ORDERED: &str = "changesets-ordered.dat";
    pub(in crate::convert) const CHANGESETS_SYM_BROKEN: &str = "changesets-symbroken.dat";
    pub(in crate::convert) const CHANGESETS_FINAL: &str = "changesets-final.dat";
    pub(in crate::convert) const COMMIT_ORDER: &str = "commit-order.txt";
    pub(in crate::convert) const COMMIT_PLAN: &str = "commit-plan.txt";
    pub(in crate::convert) const OPENINGS_CLOSINGS: &str = "symbol-openings-closings.txt";

    pub(in crate::convert) const STATE: &str = "state";
}

#[derive(Debug)]
pub(super) enum OpenError {
    Io(std::io::Error),
    BadMagic { name: String },
}

impl From<std::io::Error> for OpenError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => e.fmt(f),
            Self::BadMagic { ref name } => {
                write!(f, "bad or missing magic header in \"{name}\"")
            }
        }
    }
}

pub(super) struct Artifacts {
    dir: PathBuf,
}

impl Artifacts {
    pub(super) fn new(dir: &Path) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn final_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.tmp"))
    }

    /// Creates `<name>.tmp` with the magic header written. The file becomes
    /// visible under its final name only after [`Artifacts::commit`].
    pub(super) fn create(
        &self,
        name: &str,
        pass: &str,
    ) -> Result<std::io::BufWriter<std::fs::File>, std::io::Error> {
        let file = std::fs::File::create(self.tmp_path(name))?;
        let mut writer = std::io::BufWriter::new(file);
        writeln!(writer, "cvs2svn:{pass}:{SCHEMA_VERSION}")?;
        Ok(writer)
    }

    /// Atomically renames the pass outputs into place.
    pub(super) fn commit(&self, names: &[&str]) -> Result<(), std::io::Error> {
        for name in names {
            std::fs::rename(self.tmp_path(name), self.final_path(name))?;
        }
        Ok(())
    }

    pub(super) fn open(
        &self,
        name: &str,
        pass: &str,
    ) -> Result<std::io::BufReader<std::fs::File>, OpenError> {
        let file = std::fs::File::open(self.final_path(name))?;
        let mut reader = std::io::BufReader::new(file);

        let mut magic = String::new();
        reader.read_line(&mut magic)?;
        if magic.trim_end() != format!("cvs2svn:{pass}:{SCHEMA_VERSION}") {
            return Err(OpenError::BadMagic {
                name: name.to_owned(),
            });
        }

        Ok(reader)
    }

    /// Reads a whole artifact (minus the magic line) into memory.
    pub(super) fn read(&self, name: &str, pass: &str) -> Result<Vec<u8>, OpenError> {
        let mut reader = self.open(name, pass)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Number of completed passes, recorded after each pass boundary.
    pub(super) fn read_state(&self) -> usize {
        std::fs::read_to_string(self.final_path(names::STATE))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    pub(super) fn write_state(&self, completed_passes: usize) -> Result<(), std::io::Error> {
        std::fs::write(self.tmp_path(names::STATE), format!("{completed_passes}\n"))?;
        std::fs::rename(
            self.tmp_path(names::STATE),
            self.final_path(names::STATE),
        )
    }

    /// Removes intermediate files, keeping the three final outputs.
    pub(super) fn cleanup(&self) {
        const KEEP: &[&str] = &[
            names::COMMIT_ORDER,
            names::COMMIT_PLAN,
            names::OPENINGS_CLOSINGS,
        ];

        let Ok(entries) = self.dir.read_dir() else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let keep = name
                .to_str()
                .is_some_and(|name| KEEP.contains(&name));
            if !keep {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Artifacts;

    #[test]
    fn tmp_then_commit_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path()).unwrap();

        {
            use std::io::Write as _;
            let mut writer = artifacts.create("test.dat", "collect").unwrap();
            writer.write_all(b"payload").unwrap();
            writer.flush().unwrap();
        }

        // not yet committed
        assert!(artifacts.open("test.dat", "collect").is_err());

        artifacts.commit(&["test.dat"]).unwrap();
        assert_eq!(artifacts.read("test.dat", "collect").unwrap(), b"payload");

        // wrong producing pass
        assert!(artifacts.open("test.dat", "filter-symbols").is_err());
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path()).unwrap();
        assert_eq!(artifacts.read_state(), 0);
        artifacts.write_state(5).unwrap();
        assert_eq!(artifacts.read_state(), 5);
    }
}
