use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Single-line progress on stderr. Log output is routed through here so a
// log line never tears the progress line: the progress line is cleared,
// the log line printed, and the progress line drawn again.

const REDRAW_PERIOD: Duration = Duration::from_millis(100);

pub(crate) fn init(start: Instant, enabled: bool) -> ProgressPrint {
    ProgressPrint {
        inner: Arc::new(Mutex::new(Inner {
            start,
            enabled,
            current: None,
            last_drawn: None,
        })),
    }
}

#[derive(Clone)]
pub(crate) struct ProgressPrint {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    start: Instant,
    enabled: bool,
    current: Option<String>,
    last_drawn: Option<Instant>,
}

impl ProgressPrint {
    pub(crate) fn set_progress(&self, line: String) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return;
        }

        let unchanged = inner.current.as_deref() == Some(line.as_str());
        inner.current = Some(line);

        let due = match inner.last_drawn {
            None => true,
            Some(last) => !unchanged && last.elapsed() >= REDRAW_PERIOD,
        };
        if due {
            inner.draw();
        }
    }

    /// Prints a full line (log output) without tearing the progress line.
    pub(crate) fn print_raw_line(&self, line: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let mut stderr = std::io::stderr();

        if inner.last_drawn.is_some() {
            let _ = crossterm::queue!(
                stderr,
                crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
                crossterm::cursor::MoveToColumn(0),
            );
        }
        let _ = stderr.write_all(line);
        if !line.ends_with(b"\n") {
            let _ = stderr.write_all(b"\n");
        }
        let _ = stderr.flush();

        if inner.last_drawn.is_some() {
            inner.draw();
        }
    }

    /// Leaves the last progress line in place and moves to a fresh line.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_drawn.is_some() {
            inner.draw();
            let mut stderr = std::io::stderr();
            let _ = crossterm::queue!(
                stderr,
                crossterm::style::Print('\n'),
                crossterm::cursor::MoveToColumn(0),
            );
            let _ = stderr.flush();
            inner.last_drawn = None;
        }
        inner.current = None;
    }
}

impl Inner {
    fn draw(&mut self) {
        let Some(ref line) = self.current else {
            return;
        };

        let elapsed = self.start.elapsed().as_secs();
        let rendered = format!("[{:02}:{:02}:{:02}] {line}", elapsed / 3600, (elapsed / 60) % 60, elapsed % 60);

        let mut stderr = std::io::stderr();
        let _ = crossterm::queue!(
            stderr,
            crossterm::cursor::MoveToColumn(0),
            crossterm::style::Print(rendered),
            crossterm::terminal::Clear(crossterm::terminal::ClearType::UntilNewLine),
        );
        let _ = stderr.flush();
        self.last_drawn = Some(Instant::now());
    }
}
