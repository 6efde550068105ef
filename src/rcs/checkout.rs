use std::collections::HashMap;

use super::number::RevNum;
use super::{delta, parse};

// Revision contents are stored as one full text at the head plus a chain of
// deltas: backward along trunk (`next` of 1.3 is 1.2) and forward along
// branches (`next` of 1.2.4.1 is 1.2.4.2). Reconstructing a revision walks
// from the head to it, applying each delta in turn.

#[derive(Debug)]
pub(crate) enum CheckoutError {
    Parse(parse::ParseError),
    Apply(delta::ApplyError),
    NoHead,
    UnknownRevision { number: String },
    MissingText { number: String },
    BrokenChain { number: String },
}

impl From<parse::ParseError> for CheckoutError {
    fn from(e: parse::ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<delta::ApplyError> for CheckoutError {
    fn from(e: delta::ApplyError) -> Self {
        Self::Apply(e)
    }
}

impl std::fmt::Display for CheckoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Parse(ref e) => write!(f, "failed to parse RCS file: {e}"),
            Self::Apply(ref e) => write!(f, "failed to apply delta: {e}"),
            Self::NoHead => write!(f, "RCS file has no head revision"),
            Self::UnknownRevision { ref number } => {
                write!(f, "unknown revision {number}")
            }
            Self::MissingText { ref number } => {
                write!(f, "no delta text for revision {number}")
            }
            Self::BrokenChain { ref number } => {
                write!(f, "no delta chain reaches revision {number}")
            }
        }
    }
}

struct TextRecord {
    next: Option<RevNum>,
    branches: Vec<RevNum>,
    text: Option<Vec<u8>>,
}

/// An RCS file parsed once, serving full-text checkouts of any revision.
pub(crate) struct RcsText {
    head: Option<RevNum>,
    records: HashMap<RevNum, TextRecord>,
}

impl RcsText {
    pub(crate) fn parse(src: &[u8]) -> Result<Self, CheckoutError> {
        let mut collector = Collector {
            head: None,
            records: HashMap::new(),
        };
        parse::parse(src, &mut collector)?;
        Ok(Self {
            head: collector.head,
            records: collector.records,
        })
    }

    /// Reconstructs the full text of `revision`.
    pub(crate) fn checkout(&self, revision: &RevNum) -> Result<Vec<u8>, CheckoutError> {
        let head = self.head.as_ref().ok_or(CheckoutError::NoHead)?;
        if !self.records.contains_key(revision) {
            return Err(CheckoutError::UnknownRevision {
                number: revision.to_string(),
            });
        }

        let mut text = self
            .text_of(head)?
            .to_vec();

        let mut current = head.clone();
        while current != *revision {
            let next = self.step_towards(&current, revision)?;
            text = delta::apply(self.text_of(&next)?, &text)?;
            current = next;
        }

        Ok(text)
    }

    fn text_of(&self, revision: &RevNum) -> Result<&[u8], CheckoutError> {
        self.records
            .get(revision)
            .ok_or_else(|| CheckoutError::UnknownRevision {
                number: revision.to_string(),
            })?
            .text
            .as_deref()
            .ok_or_else(|| CheckoutError::MissingText {
                number: revision.to_string(),
            })
    }

    /// The revision whose delta must be applied next on the way from
    /// `current` to `target`.
    fn step_towards(&self, current: &RevNum, target: &RevNum) -> Result<RevNum, CheckoutError> {
        let record =
            self.records
                .get(current)
                .ok_or_else(|| CheckoutError::UnknownRevision {
                    number: current.to_string(),
                })?;

        // Does the target sit on (or beyond) a branch sprouting here?
        for branch_head in record.branches.iter() {
            let branch = branch_head.branch_of();
            if target.components().starts_with(branch.components()) {
                return Ok(branch_head.clone());
            }
        }

        // Otherwise continue along the current line of development; on
        // trunk that moves towards older revisions, on a branch towards
        // newer ones. Either way the target must still be ahead of us.
        record
            .next
            .clone()
            .filter(|_| current.components().len() <= target.components().len())
            .ok_or_else(|| CheckoutError::BrokenChain {
                number: target.to_string(),
            })
    }
}

struct Collector {
    head: Option<RevNum>,
    records: HashMap<RevNum, TextRecord>,
}

impl parse::Sink for Collector {
    fn set_head_revision(&mut self, revision: RevNum) {
        self.head = Some(revision);
    }

    fn set_default_branch(&mut self, _branch: RevNum) {}

    fn define_symbol(&mut self, _name: &[u8], _number: RevNum) {}

    fn admin_completed(&mut self) {}

    fn define_revision(
        &mut self,
        number: RevNum,
        _timestamp: i64,
        _author: &[u8],
        _dead: bool,
        branches: Vec<RevNum>,
        next: Option<RevNum>,
    ) {
        self.records.insert(
            number,
            TextRecord {
                next,
                branches,
                text: None,
            },
        );
    }

    fn tree_completed(&mut self) {}

    fn set_description(&mut self, _description: &[u8]) {}

    fn set_revision_info(&mut self, number: RevNum, _log: &[u8], text: &[u8]) {
        if let Some(record) = self.records.get_mut(&number) {
            record.text = Some(text.to_vec());
        }
    }

    fn parse_completed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::RcsText;
    use crate::rcs::number::RevNum;

    const SAMPLE: &[u8] = b"head 1.3;
access;
symbols;
locks; strict;

1.3
date 2003.03.01.10.00.00; author a; state Exp;
branches;
next 1.2;

1.2
date 2003.02.01.10.00.00; author a; state Exp;
branches
\t1.2.2.1;
next 1.1;

1.1
date 2003.01.01.10.00.00; author a; state Exp;
branches;
next;

1.2.2.1
date 2003.04.01.10.00.00; author b; state Exp;
branches;
next;

desc
@@

1.3
log
@three@
text
@line one v3
line two
@

1.2
log
@two@
text
@d1 1
a1 1
line one v2
@

1.1
log
@one@
text
@d1 1
a1 1
line one v1
@

1.2.2.1
log
@branch@
text
@a2 1
line three on branch
@
";

    fn num(s: &str) -> RevNum {
        RevNum::parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn checkout_head() {
        let rcs = RcsText::parse(SAMPLE).unwrap();
        assert_eq!(rcs.checkout(&num("1.3")).unwrap(), b"line one v3\nline two\n");
    }

    #[test]
    fn checkout_trunk_backwards() {
        let rcs = RcsText::parse(SAMPLE).unwrap();
        assert_eq!(rcs.checkout(&num("1.2")).unwrap(), b"line one v2\nline two\n");
        assert_eq!(rcs.checkout(&num("1.1")).unwrap(), b"line one v1\nline two\n");
    }

    #[test]
    fn checkout_branch_forwards() {
        let rcs = RcsText::parse(SAMPLE).unwrap();
        assert_eq!(
            rcs.checkout(&num("1.2.2.1")).unwrap(),
            b"line one v2\nline two\nline three on branch\n",
        );
    }

    #[test]
    fn unknown_revision() {
        let rcs = RcsText::parse(SAMPLE).unwrap();
        assert!(rcs.checkout(&num("1.4")).is_err());
    }
}
