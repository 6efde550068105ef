use std::collections::BTreeMap;
use std::path::Path;

use crate::defs;

pub(crate) fn run_test(test_path: &Path) -> Result<(), String> {
    let test_def_raw =
        std::fs::read(test_path).map_err(|e| format!("failed to read {test_path:?}: {e}"))?;
    let test_def: defs::Test = serde_yaml::from_slice(&test_def_raw)
        .map_err(|e| format!("failed to parse {test_path:?}: {e}"))?;

    let temp_dir = tempfile::tempdir().map_err(|e| format!("failed to create temp dir: {e}"))?;
    let repo_path = temp_dir.path().join("cvsrepo");
    for (rel_path, contents) in test_def.rcs_files.iter() {
        let file_path = repo_path.join(rel_path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {parent:?}: {e}"))?;
        }
        std::fs::write(&file_path, contents)
            .map_err(|e| format!("failed to write {file_path:?}: {e}"))?;
    }

    let conv_params_path = temp_dir.path().join("conv-params.toml");
    std::fs::write(&conv_params_path, test_def.conv_params.as_bytes())
        .map_err(|e| format!("failed to write {conv_params_path:?}: {e}"))?;

    let out_path = temp_dir.path().join("out");
    let log_path = temp_dir.path().join("conv.log");

    let status = run_convert(
        &repo_path,
        &out_path,
        &conv_params_path,
        &log_path,
        &["--check-contents"],
    )?;

    if test_def.failed {
        if status.success() {
            return Err("conversion succeeded but was expected to fail".into());
        }
    } else if !status.success() {
        let log = std::fs::read_to_string(&log_path).unwrap_or_default();
        return Err(format!("conversion failed with {status}\nlog:\n{log}"));
    }

    if !test_def.log_contains.is_empty() {
        let log = std::fs::read_to_string(&log_path)
            .map_err(|e| format!("failed to read {log_path:?}: {e}"))?;
        for expected in test_def.log_contains.iter() {
            if !log.contains(expected) {
                return Err(format!("log does not contain {expected:?}\nlog:\n{log}"));
            }
        }
    }

    if test_def.failed {
        return Ok(());
    }

    let commits = check_commit_order(&out_path, &test_def)?;
    check_plan(&out_path, &test_def, commits.len())?;
    check_openings_closings(&out_path)?;

    if test_def.two_stage {
        check_two_stage(temp_dir.path(), &repo_path, &conv_params_path, &out_path)?;
    }

    Ok(())
}

fn run_convert(
    repo_path: &Path,
    out_path: &Path,
    conv_params_path: &Path,
    log_path: &Path,
    extra_args: &[&str],
) -> Result<std::process::ExitStatus, String> {
    let cvs2svn_bin = Path::new(env!("CARGO_BIN_EXE_cvs2svn"));
    std::process::Command::new(cvs2svn_bin)
        .arg("--src")
        .arg(repo_path)
        .arg("--out")
        .arg(out_path)
        .arg("--conv-params")
        .arg(conv_params_path)
        .arg("--log-file")
        .arg(log_path)
        .arg("--file-log-level")
        .arg("debug")
        .arg("--no-progress")
        .arg("--stderr-log-level")
        .arg("error")
        .args(extra_args)
        .status()
        .map_err(|e| format!("failed to run cvs2svn: {e}"))
}

/// Reads an output file, dropping the magic header line.
fn read_output(out_path: &Path, name: &str) -> Result<String, String> {
    let path = out_path.join(name);
    let raw =
        std::fs::read_to_string(&path).map_err(|e| format!("failed to read {path:?}: {e}"))?;
    match raw.split_once('\n') {
        Some((magic, rest)) if magic.starts_with("cvs2svn:") => Ok(rest.to_owned()),
        _ => Err(format!("missing magic header in {path:?}")),
    }
}

fn check_commit_order(
    out_path: &Path,
    test_def: &defs::Test,
) -> Result<Vec<(String, i64)>, String> {
    let raw = read_output(out_path, "commit-order.txt")?;

    let mut commits = Vec::new();
    for line in raw.lines() {
        let (id, timestamp) = line
            .split_once(' ')
            .ok_or_else(|| format!("bad commit-order line {line:?}"))?;
        let timestamp: i64 = timestamp
            .parse()
            .map_err(|e| format!("bad timestamp in {line:?}: {e}"))?;
        commits.push((id.to_owned(), timestamp));
    }

    for pair in commits.windows(2) {
        if pair[1].1 <= pair[0].1 {
            return Err(format!(
                "commit timestamps are not strictly monotonic: {} then {}",
                pair[0].1, pair[1].1,
            ));
        }
    }

    if let Some(ref expected) = test_def.timestamps {
        let actual: Vec<i64> = commits.iter().map(|&(_, timestamp)| timestamp).collect();
        if actual != *expected {
            return Err(format!(
                "commit timestamps {actual:?} do not match expected {expected:?}",
            ));
        }
    }
    if let Some(min_commits) = test_def.min_commits {
        if commits.len() < min_commits {
            return Err(format!(
                "expected at least {min_commits} commits, got {}",
                commits.len(),
            ));
        }
    }
    if let Some(max_commits) = test_def.max_commits {
        if commits.len() > max_commits {
            return Err(format!(
                "expected at most {max_commits} commits, got {}",
                commits.len(),
            ));
        }
    }

    Ok(commits)
}

fn check_plan(
    out_path: &Path,
    test_def: &defs::Test,
    commit_count: usize,
) -> Result<(), String> {
    let plan = read_output(out_path, "commit-plan.txt")?;

    let plan_commits = plan
        .lines()
        .filter(|line| line.starts_with("commit "))
        .count();
    if plan_commits != commit_count {
        return Err(format!(
            "plan has {plan_commits} commits but commit-order has {commit_count}",
        ));
    }

    // Within one file and one line of development, revisions must appear in
    // dependency order.
    let mut last_on_branch: BTreeMap<(String, Vec<u32>), u32> = BTreeMap::new();
    for line in plan.lines() {
        let Some(member) = line.strip_prefix(" rev ") else {
            continue;
        };
        let mut fields = member.split(' ');
        let (Some(path), Some(number)) = (fields.next(), fields.next()) else {
            return Err(format!("bad plan member line {line:?}"));
        };
        let components: Vec<u32> = number
            .split('.')
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| format!("bad revision number in {line:?}: {e}"))?;
        let (last, branch) = components
            .split_last()
            .ok_or_else(|| format!("empty revision number in {line:?}"))?;

        let key = (path.to_owned(), branch.to_vec());
        if let Some(&previous) = last_on_branch.get(&key) {
            if *last <= previous {
                return Err(format!(
                    "revision {number} of {path} committed after {}.{previous}",
                    branch
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("."),
                ));
            }
        }
        last_on_branch.insert(key, *last);
    }

    let mut search_from = 0;
    for expected in test_def.plan_sequence.iter() {
        match plan[search_from..].find(expected) {
            Some(position) => search_from += position + expected.len(),
            None => {
                return Err(format!(
                    "plan does not contain {expected:?} (in sequence)\nplan:\n{plan}",
                ));
            }
        }
    }

    for unexpected in test_def.plan_absent.iter() {
        if plan.contains(unexpected) {
            return Err(format!("plan contains {unexpected:?}\nplan:\n{plan}"));
        }
    }

    for plan_count in test_def.plan_counts.iter() {
        let actual = plan.matches(&plan_count.contains).count();
        if actual != plan_count.count {
            return Err(format!(
                "plan contains {:?} {actual} time(s), expected {}\nplan:\n{plan}",
                plan_count.contains, plan_count.count,
            ));
        }
    }

    Ok(())
}

/// Every per-file symbol gets at most one opening and one closing, and a
/// closing must come strictly after its opening.
fn check_openings_closings(out_path: &Path) -> Result<(), String> {
    let raw = read_output(out_path, "symbol-openings-closings.txt")?;

    let mut openings: BTreeMap<String, u64> = BTreeMap::new();
    let mut closings: BTreeMap<String, u64> = BTreeMap::new();
    let mut last_key: Option<(u64, u64)> = None;

    for line in raw.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        let [symbol, revnum, kind, item] = fields.as_slice() else {
            return Err(format!("bad openings/closings line {line:?}"));
        };
        let symbol = u64::from_str_radix(symbol, 16)
            .map_err(|e| format!("bad symbol id in {line:?}: {e}"))?;
        let revnum = u64::from_str_radix(revnum, 16)
            .map_err(|e| format!("bad revnum in {line:?}: {e}"))?;

        let key = (symbol, revnum);
        if let Some(last_key) = last_key {
            if key < last_key {
                return Err(format!("openings/closings not sorted at {line:?}"));
            }
        }
        last_key = Some(key);

        let target = match *kind {
            "O" => &mut openings,
            "C" => &mut closings,
            _ => return Err(format!("bad type in {line:?}")),
        };
        if target.insert((*item).to_owned(), revnum).is_some() {
            return Err(format!("duplicate {kind} entry for item {item}"));
        }
    }

    for (item, close_revnum) in closings.iter() {
        let Some(open_revnum) = openings.get(item) else {
            return Err(format!("item {item} closes but never opens"));
        };
        if close_revnum <= open_revnum {
            return Err(format!(
                "item {item} closes at r{close_revnum} but opens at r{open_revnum}",
            ));
        }
    }

    Ok(())
}

/// Converting in two stages across the pass-7 boundary must give the same
/// outputs as a single run.
fn check_two_stage(
    temp_path: &Path,
    repo_path: &Path,
    conv_params_path: &Path,
    reference_out: &Path,
) -> Result<(), String> {
    let staged_out = temp_path.join("out-staged");
    let log_path = temp_path.join("conv-staged.log");

    let first = run_convert(
        repo_path,
        &staged_out,
        conv_params_path,
        &log_path,
        &["--passes", ":6"],
    )?;
    if !first.success() {
        return Err(format!("staged conversion (passes 1-6) failed with {first}"));
    }
    let second = run_convert(
        repo_path,
        &staged_out,
        conv_params_path,
        &log_path,
        &["--passes", "7:"],
    )?;
    if !second.success() {
        return Err(format!("staged conversion (passes 7-12) failed with {second}"));
    }

    for name in [
        "commit-order.txt",
        "commit-plan.txt",
        "symbol-openings-closings.txt",
    ] {
        let reference = std::fs::read(reference_out.join(name))
            .map_err(|e| format!("failed to read reference {name}: {e}"))?;
        let staged = std::fs::read(staged_out.join(name))
            .map_err(|e| format!("failed to read staged {name}: {e}"))?;
        if reference != staged {
            return Err(format!("staged conversion differs from full run in {name}"));
        }
    }

    Ok(())
}
