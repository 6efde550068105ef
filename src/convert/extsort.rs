use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{BufRead, Seek as _, SeekFrom, Write};

// External sort for the flattened item streams: lines are accumulated into
// bounded in-memory runs, each run is sorted and spilled to an anonymous
// temp file, and the runs are k-way merged. Peak memory stays around
// `max_run_bytes` regardless of stream length.

pub(super) fn sort_lines(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    max_run_bytes: usize,
) -> Result<(), std::io::Error> {
    let mut runs: Vec<std::io::BufReader<std::fs::File>> = Vec::new();

    let mut current_run: Vec<Vec<u8>> = Vec::new();
    let mut current_bytes = 0usize;

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = input.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        current_bytes += line.len();
        current_run.push(std::mem::take(&mut line));

        if current_bytes >= max_run_bytes {
            runs.push(spill_run(&mut current_run)?);
            current_bytes = 0;
        }
    }

    current_run.sort_unstable();

    if runs.is_empty() {
        // Everything fit in one run; no merge needed.
        for line in current_run.iter() {
            output.write_all(line)?;
            output.write_all(b"\n")?;
        }
        return Ok(());
    }

    if !current_run.is_empty() {
        runs.push(spill_run(&mut current_run)?);
    }

    merge_runs(runs, output)
}

fn spill_run(
    run: &mut Vec<Vec<u8>>,
) -> Result<std::io::BufReader<std::fs::File>, std::io::Error> {
    run.sort_unstable();

    let mut file = tempfile::tempfile()?;
    {
        let mut writer = std::io::BufWriter::new(&mut file);
        for line in run.iter() {
            writer.write_all(line)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    run.clear();

    file.seek(SeekFrom::Start(0))?;
    Ok(std::io::BufReader::new(file))
}

fn merge_runs(
    mut runs: Vec<std::io::BufReader<std::fs::File>>,
    output: &mut dyn Write,
) -> Result<(), std::io::Error> {
    let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::with_capacity(runs.len());
    for (run_index, run) in runs.iter_mut().enumerate() {
        if let Some(line) = read_run_line(run)? {
            heap.push(Reverse((line, run_index)));
        }
    }

    while let Some(Reverse((line, run_index))) = heap.pop() {
        output.write_all(&line)?;
        output.write_all(b"\n")?;
        if let Some(next) = read_run_line(&mut runs[run_index])? {
            heap.push(Reverse((next, run_index)));
        }
    }

    Ok(())
}

fn read_run_line(
    run: &mut std::io::BufReader<std::fs::File>,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    let mut line = Vec::new();
    if run.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::sort_lines;

    fn sort_with_run_size(lines: &[&str], max_run_bytes: usize) -> Vec<String> {
        let input = lines
            .iter()
            .map(|line| format!("{line}\n"))
            .collect::<String>();
        let mut output = Vec::new();
        sort_lines(&mut input.as_bytes(), &mut output, max_run_bytes).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn single_run() {
        let sorted = sort_with_run_size(&["b", "a", "c"], 1 << 20);
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn multiple_runs_merge_to_the_same_order() {
        let lines: Vec<String> = (0..200).map(|n| format!("{:04}", (n * 73) % 200)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

        let mut expected: Vec<String> = lines.clone();
        expected.sort();

        // A tiny run budget forces many spills.
        assert_eq!(sort_with_run_size(&refs, 16), expected);
        assert_eq!(sort_with_run_size(&refs, 1 << 20), expected);
    }

    #[test]
    fn empty_input() {
        assert!(sort_with_run_size(&[], 16).is_empty());
    }
}
