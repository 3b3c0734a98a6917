use std::{collections::VecDeque, time::Instant};

// Short warnings meant for the person looking at the output, e.g. "cycle at 0x..." or "field table truncated".
// Not a developer log; those go to stderr (see util::Limiter).
pub struct Log {
    pub lines: VecDeque<String>,
}

const MAX_LINES: usize = 100;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new()}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// A very minimal profiling thing. Prints to stderr in destructor.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
    active: bool,
}

impl ProfileScope {
    pub fn new(name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: 0.0, active: true}
    }

    pub fn with_threshold(secs: f64, name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: secs, active: true}
    }

    pub fn cancel(&mut self) {
        self.active = false;
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let secs = self.start.elapsed().as_secs_f64();
        if self.threshold_secs <= 0.0 || secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}s", self.name, secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, log::*};

    #[test]
    fn log_keeps_last_lines() {
        let mut l = Log::new();
        for i in 0..MAX_LINES + 5 {
            log!(l, "line {}", i);
        }
        assert_eq!(l.lines.len(), MAX_LINES);
        assert_eq!(l.lines.front().unwrap(), "line 5");
        assert_eq!(l.lines.back().unwrap(), &format!("line {}", MAX_LINES + 4));
        l.clear();
        assert!(l.lines.is_empty());
    }
}
