// RCS delta text: an ed-like script of "aN M" (append M lines after source
// line N) and "dN M" (delete M lines starting at source line N) commands,
// with line numbers counted in the source text and commands in ascending
// order.

#[derive(Debug)]
pub(crate) enum ApplyError {
    BrokenCommand { raw: Vec<u8> },
    TruncatedAppend,
    LineOutOfRange { line: usize },
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BrokenCommand { ref raw } => {
                write!(f, "broken delta command: \"{}\"", raw.escape_ascii())
            }
            Self::TruncatedAppend => write!(f, "delta ends inside an append block"),
            Self::LineOutOfRange { line } => {
                write!(f, "delta refers to nonexistent source line {line}")
            }
        }
    }
}

pub(crate) fn apply(delta: &[u8], source: &[u8]) -> Result<Vec<u8>, ApplyError> {
    let source_lines: Vec<&[u8]> = split_lines(source).collect();
    let mut out = Vec::with_capacity(source.len());

    // Next source line (0-based) that has not been emitted or skipped yet.
    let mut source_pos = 0usize;

    let mut rem = delta;
    while !rem.is_empty() {
        let line_end = rem
            .iter()
            .position(|&c| c == b'\n')
            .map_or(rem.len(), |i| i + 1);
        let command = &rem[..line_end];
        rem = &rem[line_end..];

        let (kind, args) = command
            .split_first()
            .filter(|(kind, _)| matches!(kind, b'a' | b'd'))
            .ok_or_else(|| ApplyError::BrokenCommand {
                raw: command.to_vec(),
            })?;
        let (line, count) = parse_args(args).ok_or_else(|| ApplyError::BrokenCommand {
            raw: command.to_vec(),
        })?;

        match kind {
            b'a' => {
                // Emit source through line `line` (1-based), then `count`
                // lines taken verbatim from the delta.
                if line < source_pos || line > source_lines.len() {
                    return Err(ApplyError::LineOutOfRange { line });
                }
                for source_line in &source_lines[source_pos..line] {
                    out.extend(*source_line);
                }
                source_pos = line;

                for _ in 0..count {
                    if rem.is_empty() {
                        return Err(ApplyError::TruncatedAppend);
                    }
                    let append_end = rem
                        .iter()
                        .position(|&c| c == b'\n')
                        .map_or(rem.len(), |i| i + 1);
                    out.extend(&rem[..append_end]);
                    rem = &rem[append_end..];
                }
            }
            b'd' => {
                // Emit source through line `line - 1`, then skip `count`.
                let first_deleted = line.checked_sub(1).ok_or(ApplyError::LineOutOfRange { line })?;
                if first_deleted < source_pos || first_deleted + count > source_lines.len() {
                    return Err(ApplyError::LineOutOfRange { line });
                }
                for source_line in &source_lines[source_pos..first_deleted] {
                    out.extend(*source_line);
                }
                source_pos = first_deleted + count;
            }
            _ => unreachable!(),
        }
    }

    for source_line in &source_lines[source_pos..] {
        out.extend(*source_line);
    }

    Ok(out)
}

fn parse_args(args: &[u8]) -> Option<(usize, usize)> {
    let args = args.strip_suffix(b"\n").unwrap_or(args);
    let mut parts = args.split(|&c| c == b' ');
    let line = std::str::from_utf8(parts.next()?).ok()?.parse().ok()?;
    let count = std::str::from_utf8(parts.next()?).ok()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((line, count))
}

fn split_lines(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rem = text;
    std::iter::from_fn(move || {
        if rem.is_empty() {
            return None;
        }
        let end = rem
            .iter()
            .position(|&c| c == b'\n')
            .map_or(rem.len(), |i| i + 1);
        let line = &rem[..end];
        rem = &rem[end..];
        Some(line)
    })
}

#[cfg(test)]
mod tests {
    use super::apply;

    #[test]
    fn delete_and_append() {
        let source = b"one\ntwo\nthree\n";
        let delta = b"d2 1\na3 2\nfour\nfive\n";
        assert_eq!(apply(delta, source).unwrap(), b"one\nthree\nfour\nfive\n");
    }

    #[test]
    fn replace_first_line() {
        let source = b"new\n";
        let delta = b"d1 1\na1 1\nold\n";
        assert_eq!(apply(delta, source).unwrap(), b"old\n");
    }

    #[test]
    fn empty_delta_is_identity() {
        let source = b"a\nb\n";
        assert_eq!(apply(b"", source).unwrap(), source);
    }

    #[test]
    fn append_to_empty_source() {
        assert_eq!(apply(b"a0 1\nonly\n", b"").unwrap(), b"only\n");
    }

    #[test]
    fn out_of_range_delete_is_an_error() {
        assert!(apply(b"d5 1\n", b"a\n").is_err());
    }

    #[test]
    fn truncated_append_is_an_error() {
        assert!(apply(b"a1 3\nx\n", b"a\n").is_err());
    }
}
