//! cpuset list parsing (`0-3,7,9-10`).

use anyhow::{bail, Context, Result};

/// Parse a kernel cpuset list into the individual CPU numbers, in order.
pub fn parse(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    let list = list.trim();
    if list.is_empty() {
        return Ok(cpus);
    }
    for part in list.split(',') {
        match part.split_once('-') {
            None => {
                cpus.push(part.parse().with_context(|| format!("invalid CPU {:?}", part))?);
            }
            Some((start, end)) => {
                let start: u32 = start
                    .parse()
                    .with_context(|| format!("invalid CPU range start {:?}", start))?;
                let end: u32 = end
                    .parse()
                    .with_context(|| format!("invalid CPU range end {:?}", end))?;
                if end < start {
                    bail!("invalid CPU range {:?}", part);
                }
                cpus.extend(start..=end);
            }
        }
    }
    Ok(cpus)
}

/// Read this container's cpuset, trying the cgroup v2 interface first.
pub fn current() -> Result<Vec<u32>> {
    for path in [
        "/sys/fs/cgroup/cpuset.cpus.effective",
        "/sys/fs/cgroup/cpuset/cpuset.cpus",
    ] {
        if let Ok(content) = std::fs::read_to_string(path) {
            return parse(&content);
        }
    }
    bail!("no cpuset interface found");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singles_and_ranges() {
        assert_eq!(parse("0-3,7").unwrap(), vec![0, 1, 2, 3, 7]);
        assert_eq!(parse("5").unwrap(), vec![5]);
        assert_eq!(parse("0-0").unwrap(), vec![0]);
        assert_eq!(parse(" 2-4\n").unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn empty_list_is_empty() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_lists() {
        assert!(parse("a").is_err());
        assert!(parse("3-1").is_err());
        assert!(parse("1-").is_err());
    }
}
