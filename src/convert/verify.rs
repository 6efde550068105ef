use std::path::PathBuf;

use super::artifacts::{names, Artifacts};
use super::options::Options;
use super::{final_sort, ConvertError};
use crate::progress::ProgressPrint;
use crate::rcs::checkout::RcsText;
use crate::rcs::number::RevNum;
use crate::FHashMap;

// Optional post-conversion check (--check-contents): every live revision
// named in the commit plan must be reconstructible from its RCS file with
// the internal revision reader. The sink relies on exactly this to
// materialize file contents, so a conversion that passes here cannot fail
// content extraction later.

pub(crate) fn verify_plan_contents(
    progress: &ProgressPrint,
    options: &Options,
    out_path: &std::path::Path,
) -> Result<(), ConvertError> {
    tracing::info!("verifying revision contents");

    let artifacts = Artifacts::new(out_path).map_err(|e| {
        tracing::error!("failed to open output directory {out_path:?}: {e}");
        ConvertError
    })?;
    let plan = artifacts
        .read(names::COMMIT_PLAN, final_sort::PASS)
        .map_err(|e| {
            tracing::error!("failed to read commit plan: {e}");
            ConvertError
        })?;

    // `<logical path> -> revisions to reconstruct`
    let mut wanted: FHashMap<String, Vec<RevNum>> = FHashMap::default();
    for line in plan.split(|&c| c == b'\n') {
        let Some(member) = line.strip_prefix(b" rev ") else {
            continue;
        };
        let Ok(member) = std::str::from_utf8(member) else {
            continue;
        };
        let mut fields = member.split(' ');
        let (Some(path), Some(number), live) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if live != Some("live") {
            continue;
        }
        let Some(number) = RevNum::parse(number.as_bytes()) else {
            tracing::error!("bad revision number in commit plan: {member:?}");
            return Err(ConvertError);
        };
        wanted.entry(path.to_owned()).or_default().push(number);
    }

    let mut checked = 0usize;
    let mut paths: Vec<_> = wanted.into_iter().collect();
    paths.sort();
    for (index, (path, revisions)) in paths.iter().enumerate() {
        progress.set_progress(format!(
            "checking contents - {} / {} files",
            index + 1,
            paths.len(),
        ));

        let Some(fs_path) = locate_rcs_file(options, path) else {
            tracing::error!("cannot find the RCS file for \"{path}\"");
            return Err(ConvertError);
        };
        let raw = std::fs::read(&fs_path).map_err(|e| {
            tracing::error!("failed to read {fs_path:?}: {e}");
            ConvertError
        })?;
        let rcs = RcsText::parse(&raw).map_err(|e| {
            tracing::error!("failed to parse {fs_path:?}: {e}");
            ConvertError
        })?;

        for number in revisions {
            rcs.checkout(number).map_err(|e| {
                tracing::error!("cannot reconstruct {path}:{number}: {e}");
                ConvertError
            })?;
            checked += 1;
        }
    }

    tracing::info!("reconstructed {checked} revisions");
    Ok(())
}

/// A plan path is project-relative with `Attic/` elided; the file may live
/// under any configured project root, in or out of the Attic.
fn locate_rcs_file(options: &Options, logical_path: &str) -> Option<PathBuf> {
    for project in options.projects.iter() {
        let root = if project.is_empty() {
            options.src_path.clone()
        } else {
            options.src_path.join(project)
        };

        let plain = root.join(format!("{logical_path},v"));
        if plain.is_file() {
            return Some(plain);
        }

        let (dir, name) = match logical_path.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, logical_path),
        };
        let attic = match dir {
            Some(dir) => root.join(dir).join("Attic").join(format!("{name},v")),
            None => root.join("Attic").join(format!("{name},v")),
        };
        if attic.is_file() {
            return Some(attic);
        }
    }
    None
}
