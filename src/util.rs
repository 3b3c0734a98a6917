use std::fmt;

// A thing for limiting the number of warnings printed from each line of source code.
// Usage: if limiter.check(line!()) { eprintln!("warning: ...") }
pub struct Limiter {
    count_by_line: Vec<u16>,
}

impl Limiter {
    pub fn new() -> Self { Self {count_by_line: Vec::new()} }

    // Allow one per line.
    pub fn check(&mut self, line: u32) -> bool {
        self.check_n(line, 1)
    }

    // Allow n per line.
    pub fn check_n(&mut self, line: u32, n: u16) -> bool {
        let idx = line as usize;
        if idx >= self.count_by_line.len() {
            self.count_by_line.resize(idx + 1, 0);
        }
        if self.count_by_line[idx] < n {
            self.count_by_line[idx] += 1;
            true
        } else {
            false
        }
    }
}

// Prints byte sizes with a few digits of precision and B/KiB/MiB/GiB/TiB suffix, e.g. "42B", "12.4KiB".
pub struct PrettySize(pub usize);
impl fmt::Display for PrettySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x < 1<<10 {             write!(f, "{} B", x) }
        else if x < (1usize<<20) { write!(f, "{:.3} KiB", x as f64 / (1usize<<10) as f64) }
        else if x < (1usize<<30) { write!(f, "{:.3} MiB", x as f64 / (1usize<<20) as f64) }
        else if x < (1usize<<40) { write!(f, "{:.3} GiB", x as f64 / (1usize<<30) as f64) }
        else if x < (1usize<<50) { write!(f, "{:.3} TiB", x as f64 / (1usize<<40) as f64) }
        else if x < (1usize<<60) { write!(f, "{:.3} PiB", x as f64 / (1usize<<50) as f64) }
        else {                     write!(f, "{:.3} EiB", x as f64 / (1usize<<60) as f64) }
    }
}

// `align` must be a power of two.
pub fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

// Hex with 0x prefix, decimal otherwise.
pub fn parse_addr(s: &str) -> Option<usize> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => usize::from_str_radix(h, 16).ok(),
        None => s.parse::<usize>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use crate::util::*;

    #[test]
    fn limiter_per_line() {
        let mut l = Limiter::new();
        assert!(l.check(10));
        assert!(!l.check(10));
        assert!(l.check_n(20, 2));
        assert!(l.check_n(20, 2));
        assert!(!l.check_n(20, 2));
    }

    #[test]
    fn addr_parsing() {
        assert_eq!(parse_addr("0x1000"), Some(0x1000));
        assert_eq!(parse_addr("4096"), Some(4096));
        assert_eq!(parse_addr("0xzz"), None);
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(format!("{}", PrettySize(42)), "42 B");
    }
}
