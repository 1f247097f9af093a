//! Process and host gauges sampled at flush time.
//!
//! Every probe parses a procfs file and returns `None` on any failure; a
//! missing gauge is omitted from the metrics document rather than aborting
//! the flush.

use std::io::BufRead;
use std::path::Path;

/// One flush's worth of host and process gauges.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGauges {
    pub load1: Option<f64>,
    pub total_ram: Option<i64>,
    pub free_ram: Option<i64>,
    pub process_ram: Option<i64>,
    pub num_threads: Option<i64>,
}

impl SystemGauges {
    pub fn collect() -> SystemGauges {
        SystemGauges {
            load1: load1_from(Path::new("/proc/loadavg")),
            total_ram: meminfo_bytes(Path::new("/proc/meminfo"), "MemTotal"),
            free_ram: meminfo_bytes(Path::new("/proc/meminfo"), "MemFree"),
            process_ram: status_kb_bytes(Path::new("/proc/self/status"), "VmRSS"),
            num_threads: status_value(Path::new("/proc/self/status"), "Threads"),
        }
    }
}

fn first_matching_line(path: &Path, keyword: &str) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    std::io::BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .find(|line| line.starts_with(keyword))
}

/// One-minute load average, the first field of /proc/loadavg.
fn load1_from(path: &Path) -> Option<f64> {
    let line = first_matching_line(path, "")?;
    line.split_whitespace().next()?.parse().ok()
}

/// A /proc/meminfo entry ("MemTotal:  7657668 kB") converted to bytes.
fn meminfo_bytes(path: &Path, key: &str) -> Option<i64> {
    let line = first_matching_line(path, key)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        return None;
    }
    fields[1].parse::<i64>().ok().map(|kb| kb * 1024)
}

/// A /proc/self/status entry in kB ("VmRSS:  161396 kB") converted to bytes.
fn status_kb_bytes(path: &Path, key: &str) -> Option<i64> {
    let line = first_matching_line(path, key)?;
    line.split_whitespace()
        .nth(1)?
        .parse::<i64>()
        .ok()
        .map(|kb| kb * 1024)
}

/// A bare numeric /proc/self/status entry such as "Threads: 12".
fn status_value(path: &Path, key: &str) -> Option<i64> {
    let line = first_matching_line(path, key)?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_loadavg() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "loadavg", "0.52 0.58 0.59 1/469 12345\n");
        assert_eq!(load1_from(&path), Some(0.52));
    }

    #[test]
    fn parses_meminfo_to_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "meminfo",
            "MemTotal:        7657668 kB\nMemFree:          161396 kB\n",
        );
        assert_eq!(meminfo_bytes(&path, "MemTotal"), Some(7_657_668 * 1024));
        assert_eq!(meminfo_bytes(&path, "MemFree"), Some(161_396 * 1024));
        assert_eq!(meminfo_bytes(&path, "MemAvailable"), None);
    }

    #[test]
    fn parses_process_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "status", "VmRSS:\t   20480 kB\nThreads:\t9\n");
        assert_eq!(status_kb_bytes(&path, "VmRSS"), Some(20480 * 1024));
        assert_eq!(status_value(&path, "Threads"), Some(9));
    }

    #[test]
    fn missing_files_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert_eq!(load1_from(&path), None);
        assert_eq!(meminfo_bytes(&path, "MemTotal"), None);
    }

    #[test]
    fn collect_never_panics() {
        // Values depend on the host; the point is that every probe tolerates
        // whatever it finds.
        let _ = SystemGauges::collect();
    }
}
