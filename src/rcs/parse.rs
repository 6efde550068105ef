use super::number::RevNum;

// RCS file format as described in rcsfile(5). The file is a sequence of
// whitespace-separated words, `;` and `:` separators, and `@`-delimited
// strings in which `@` is escaped by doubling.

#[derive(Debug)]
pub(crate) enum ParseError {
    UnexpectedEof,
    ExpectedWord,
    ExpectedString,
    ExpectedSeparator(u8),
    MissingAdminEntry { key: &'static str },
    InvalidNumber { raw: Vec<u8> },
    InvalidDate { raw: Vec<u8> },
    UnknownDelta { number: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UnexpectedEof => write!(f, "unexpected end of file"),
            Self::ExpectedWord => write!(f, "expected a word"),
            Self::ExpectedString => write!(f, "expected an @-delimited string"),
            Self::ExpectedSeparator(sep) => {
                write!(f, "expected \"{}\"", char::from(sep))
            }
            Self::MissingAdminEntry { key } => {
                write!(f, "missing admin entry: \"{key}\"")
            }
            Self::InvalidNumber { ref raw } => {
                write!(f, "invalid revision number: \"{}\"", raw.escape_ascii())
            }
            Self::InvalidDate { ref raw } => {
                write!(f, "invalid date: \"{}\"", raw.escape_ascii())
            }
            Self::UnknownDelta { ref number } => {
                write!(f, "delta text for unknown revision {number}")
            }
        }
    }
}

/// Callbacks driven by [`parse`], in file order: admin phase (head, default
/// branch, symbols), then one `define_revision` per delta summary, then one
/// `set_revision_info` per delta text.
pub(crate) trait Sink {
    fn set_head_revision(&mut self, revision: RevNum);
    fn set_default_branch(&mut self, branch: RevNum);
    fn define_symbol(&mut self, name: &[u8], number: RevNum);
    fn admin_completed(&mut self);
    fn define_revision(
        &mut self,
        number: RevNum,
        timestamp: i64,
        author: &[u8],
        dead: bool,
        branches: Vec<RevNum>,
        next: Option<RevNum>,
    );
    fn tree_completed(&mut self);
    fn set_description(&mut self, description: &[u8]);
    fn set_revision_info(&mut self, number: RevNum, log: &[u8], text: &[u8]);
    fn parse_completed(&mut self);
}

pub(crate) fn parse(src: &[u8], sink: &mut dyn Sink) -> Result<(), ParseError> {
    Parser { rem: src }.run(sink)
}

struct Parser<'a> {
    rem: &'a [u8],
}

impl<'a> Parser<'a> {
    fn run(&mut self, sink: &mut dyn Sink) -> Result<(), ParseError> {
        self.parse_admin(sink)?;
        sink.admin_completed();

        // Delta summaries run until the "desc" keyword.
        let mut known_revisions = Vec::new();
        loop {
            let word = self.word()?;
            if word == b"desc" {
                break;
            }
            let number = parse_num(word)?;
            known_revisions.push(number.clone());
            self.parse_delta(number, sink)?;
        }
        sink.tree_completed();

        let description = self.string()?;
        sink.set_description(&description);

        // Delta texts run until end of file.
        loop {
            self.skip_whitespace();
            if self.rem.is_empty() {
                break;
            }
            let number = parse_num(self.word()?)?;
            if !known_revisions.contains(&number) {
                return Err(ParseError::UnknownDelta {
                    number: number.to_string(),
                });
            }
            self.expect_word(b"log")?;
            let log = self.string()?;
            self.skip_new_phrases(b"text")?;
            self.expect_word(b"text")?;
            let text = self.string()?;
            sink.set_revision_info(number, &log, &text);
        }

        sink.parse_completed();
        Ok(())
    }

    fn parse_admin(&mut self, sink: &mut dyn Sink) -> Result<(), ParseError> {
        self.expect_word(b"head")?;
        if let Some(word) = self.word_or_separator(b';')? {
            sink.set_head_revision(parse_num(word)?);
            self.expect_separator(b';')?;
        }

        if self.peek_word()? == b"branch" {
            self.word()?;
            if let Some(word) = self.word_or_separator(b';')? {
                sink.set_default_branch(parse_num(word)?);
                self.expect_separator(b';')?;
            }
        }

        self.expect_word(b"access")?;
        while self.word_or_separator(b';')?.is_some() {}

        self.expect_word(b"symbols")?;
        while let Some(name) = self.word_or_separator(b';')? {
            let name = name.to_vec();
            self.expect_separator(b':')?;
            let number = parse_num(self.word()?)?;
            sink.define_symbol(&name, number);
        }

        self.expect_word(b"locks")?;
        loop {
            match self.word_or_separator(b';')? {
                Some(_) => {
                    self.expect_separator(b':')?;
                    self.word()?;
                }
                None => break,
            }
        }
        if self.peek_word()? == b"strict" {
            self.word()?;
            self.expect_separator(b';')?;
        }

        if self.peek_word()? == b"comment" {
            self.word()?;
            if !self.try_separator(b';') {
                self.string()?;
                self.expect_separator(b';')?;
            }
        }
        if self.peek_word()? == b"expand" {
            self.word()?;
            if !self.try_separator(b';') {
                self.string()?;
                self.expect_separator(b';')?;
            }
        }

        // Newphrases between admin and the first delta. A delta starts with
        // a revision number, so anything else introduces a newphrase.
        loop {
            let word = self.peek_word()?;
            if word == b"desc" || parse_num(word).is_ok() {
                break;
            }
            self.word()?;
            self.skip_phrase_tail()?;
        }

        Ok(())
    }

    fn parse_delta(&mut self, number: RevNum, sink: &mut dyn Sink) -> Result<(), ParseError> {
        self.expect_word(b"date")?;
        let raw_date = self.word()?.to_vec();
        let timestamp = parse_date(&raw_date).ok_or(ParseError::InvalidDate { raw: raw_date })?;
        self.expect_separator(b';')?;

        self.expect_word(b"author")?;
        let author = self.word()?.to_vec();
        self.expect_separator(b';')?;

        self.expect_word(b"state")?;
        let state = match self.word_or_separator(b';')? {
            Some(state) => {
                let state = state.to_vec();
                self.expect_separator(b';')?;
                state
            }
            None => Vec::new(),
        };

        self.expect_word(b"branches")?;
        let mut branches = Vec::new();
        while let Some(word) = self.word_or_separator(b';')? {
            branches.push(parse_num(word)?);
        }

        self.expect_word(b"next")?;
        let next = match self.word_or_separator(b';')? {
            Some(word) => {
                let next = parse_num(word)?;
                self.expect_separator(b';')?;
                Some(next)
            }
            None => None,
        };

        // Newphrases ("commitid" and friends) until the next delta or "desc".
        loop {
            let word = self.peek_word()?;
            if word == b"desc" || parse_num(word).is_ok() {
                break;
            }
            self.word()?;
            self.skip_phrase_tail()?;
        }

        sink.define_revision(number, timestamp, &author, state == b"dead", branches, next);
        Ok(())
    }

    fn skip_new_phrases(&mut self, until: &[u8]) -> Result<(), ParseError> {
        while self.peek_word()? != until {
            self.word()?;
            self.skip_phrase_tail()?;
        }
        Ok(())
    }

    fn skip_phrase_tail(&mut self) -> Result<(), ParseError> {
        loop {
            self.skip_whitespace();
            match self.rem.first() {
                None => return Err(ParseError::UnexpectedEof),
                Some(b';') => {
                    self.rem = &self.rem[1..];
                    return Ok(());
                }
                Some(b'@') => {
                    self.string()?;
                }
                Some(_) => {
                    self.word()?;
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some((&c, rest)) = self.rem.split_first() {
            if c.is_ascii_whitespace() {
                self.rem = rest;
            } else {
                break;
            }
        }
    }

    fn word(&mut self) -> Result<&'a [u8], ParseError> {
        self.skip_whitespace();
        let end = self
            .rem
            .iter()
            .position(|&c| c.is_ascii_whitespace() || matches!(c, b';' | b':' | b'@'))
            .unwrap_or(self.rem.len());
        if end == 0 {
            return Err(if self.rem.is_empty() {
                ParseError::UnexpectedEof
            } else {
                ParseError::ExpectedWord
            });
        }
        let word = &self.rem[..end];
        self.rem = &self.rem[end..];
        Ok(word)
    }

    fn peek_word(&mut self) -> Result<&'a [u8], ParseError> {
        let saved = self.rem;
        let word = self.word();
        self.rem = saved;
        word
    }

    fn expect_word(&mut self, expected: &[u8]) -> Result<(), ParseError> {
        let word = self.word()?;
        if word == expected {
            Ok(())
        } else {
            Err(ParseError::MissingAdminEntry {
                // Admin and delta keywords are the only ones we expect by name.
                key: match expected {
                    b"head" => "head",
                    b"access" => "access",
                    b"symbols" => "symbols",
                    b"locks" => "locks",
                    b"date" => "date",
                    b"author" => "author",
                    b"state" => "state",
                    b"branches" => "branches",
                    b"next" => "next",
                    b"log" => "log",
                    b"text" => "text",
                    _ => "desc",
                },
            })
        }
    }

    /// Either the next word, or `None` if the next token is `sep` (which is
    /// consumed).
    fn word_or_separator(&mut self, sep: u8) -> Result<Option<&'a [u8]>, ParseError> {
        self.skip_whitespace();
        match self.rem.first() {
            None => Err(ParseError::UnexpectedEof),
            Some(&c) if c == sep => {
                self.rem = &self.rem[1..];
                Ok(None)
            }
            Some(_) => self.word().map(Some),
        }
    }

    fn expect_separator(&mut self, sep: u8) -> Result<(), ParseError> {
        if self.try_separator(sep) {
            Ok(())
        } else if self.rem.is_empty() {
            Err(ParseError::UnexpectedEof)
        } else {
            Err(ParseError::ExpectedSeparator(sep))
        }
    }

    fn try_separator(&mut self, sep: u8) -> bool {
        self.skip_whitespace();
        if self.rem.first() == Some(&sep) {
            self.rem = &self.rem[1..];
            true
        } else {
            false
        }
    }

    fn string(&mut self) -> Result<Vec<u8>, ParseError> {
        self.skip_whitespace();
        if self.rem.first() != Some(&b'@') {
            return Err(if self.rem.is_empty() {
                ParseError::UnexpectedEof
            } else {
                ParseError::ExpectedString
            });
        }
        self.rem = &self.rem[1..];

        let mut out = Vec::new();
        loop {
            let at = self
                .rem
                .iter()
                .position(|&c| c == b'@')
                .ok_or(ParseError::UnexpectedEof)?;
            out.extend(&self.rem[..at]);
            self.rem = &self.rem[(at + 1)..];
            if self.rem.first() == Some(&b'@') {
                // doubled @, part of the string
                out.push(b'@');
                self.rem = &self.rem[1..];
            } else {
                break;
            }
        }
        Ok(out)
    }
}

fn parse_num(raw: &[u8]) -> Result<RevNum, ParseError> {
    RevNum::parse(raw).ok_or_else(|| ParseError::InvalidNumber { raw: raw.to_vec() })
}

/// `YYYY.MM.DD.hh.mm.ss` (or two-digit year + 1900) in UTC.
fn parse_date(raw: &[u8]) -> Option<i64> {
    let mut parts = [0u32; 6];
    let mut n = 0;
    for part in raw.split(|&c| c == b'.') {
        if n == 6 || part.is_empty() || !part.iter().all(u8::is_ascii_digit) {
            return None;
        }
        parts[n] = std::str::from_utf8(part).ok()?.parse().ok()?;
        n += 1;
    }
    if n != 6 {
        return None;
    }

    let year = if parts[0] < 100 { parts[0] + 1900 } else { parts[0] };
    let date = chrono::NaiveDate::from_ymd_opt(year as i32, parts[1], parts[2])?;
    let time = chrono::NaiveTime::from_hms_opt(parts[3], parts[4], parts[5])?;
    Some(chrono::NaiveDateTime::new(date, time).and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::{parse, Sink};
    use crate::rcs::number::RevNum;

    #[derive(Default)]
    struct Events {
        lines: Vec<String>,
    }

    impl Sink for Events {
        fn set_head_revision(&mut self, revision: RevNum) {
            self.lines.push(format!("head {revision}"));
        }

        fn set_default_branch(&mut self, branch: RevNum) {
            self.lines.push(format!("branch {branch}"));
        }

        fn define_symbol(&mut self, name: &[u8], number: RevNum) {
            self.lines
                .push(format!("symbol {} {number}", String::from_utf8_lossy(name)));
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
            self.lines.push(format!(
                "rev {number} t={timestamp} a={} dead={dead} b={:?} n={:?}",
                String::from_utf8_lossy(author),
                branches.iter().map(ToString::to_string).collect::<Vec<_>>(),
                next.map(|n| n.to_string()),
            ));
        }

        fn tree_completed(&mut self) {}

        fn set_description(&mut self, _description: &[u8]) {}

        fn set_revision_info(&mut self, number: RevNum, log: &[u8], text: &[u8]) {
            self.lines.push(format!(
                "info {number} log={:?} text-len={}",
                String::from_utf8_lossy(log),
                text.len(),
            ));
        }

        fn parse_completed(&mut self) {
            self.lines.push("done".into());
        }
    }

    const SAMPLE: &[u8] = b"head\t1.2;
access;
symbols
\tREL_1:1.1
\tbranch1:1.1.0.2;
locks; strict;
comment\t@# @;

1.2
date\t2003.02.18.20.00.00;\tauthor jrandom;\tstate Exp;
branches;
next\t1.1;

1.1
date\t2003.02.17.20.00.00;\tauthor jrandom;\tstate Exp;
branches
\t1.1.2.1;
next\t;

1.1.2.1
date\t2003.02.19.20.00.00;\tauthor fred;\tstate dead;
branches;
next\t;
commitid\tabcd1234;

desc
@@

1.2
log
@second@
text
@hello @@ world
@

1.1
log
@first@
text
@d1 1
a1 1
old
@

1.1.2.1
log
@on branch@
text
@a1 1
extra
@
";

    #[test]
    fn parse_sample_file() {
        let mut events = Events::default();
        parse(SAMPLE, &mut events).unwrap();

        assert_eq!(
            events.lines,
            vec![
                "head 1.2".to_owned(),
                "symbol REL_1 1.1".to_owned(),
                "symbol branch1 1.1.0.2".to_owned(),
                "rev 1.2 t=1045598400 a=jrandom dead=false b=[] n=Some(\"1.1\")".to_owned(),
                "rev 1.1 t=1045512000 a=jrandom dead=false b=[\"1.1.2.1\"] n=None".to_owned(),
                "rev 1.1.2.1 t=1045684800 a=fred dead=true b=[] n=None".to_owned(),
                "info 1.2 log=\"second\" text-len=14".to_owned(),
                "info 1.1 log=\"first\" text-len=14".to_owned(),
                "info 1.1.2.1 log=\"on branch\" text-len=11".to_owned(),
                "done".to_owned(),
            ],
        );
    }

    #[test]
    fn two_digit_years_are_nineteen_hundreds() {
        let src = b"head 1.1;
access;
symbols;
locks; strict;

1.1
date 99.12.31.23.59.59; author x; state Exp;
branches;
next;

desc
@@

1.1
log
@l@
text
@t@
";
        let mut events = Events::default();
        parse(src, &mut events).unwrap();
        assert!(events.lines[1].contains("t=946684799"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let src = b"head 1.1;
access;
symbols;
locks;

1.1
date 2001.01.01.00.00.00; author x; state Exp;
branches;
next;

desc
@never closed";
        let mut events = Events::default();
        assert!(parse(src, &mut events).is_err());
    }
}
