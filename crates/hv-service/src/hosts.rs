//! Host range expansion
//!
//! A configured url such as `https://esx[1-3].lab/sdk` stands for one host
//! per number in the range.

use labvisor_core::{HypervisorError, Result};
use labvisor_shared_types::HypervisorServiceConfiguration;
use regex::Regex;

const RANGE_PATTERN: &str = r"\[(\d+)-(\d+)\]";

/// Expand the first `[a-b]` range in `spec`. Zero padding of `a` is kept.
pub fn expand_range(spec: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(RANGE_PATTERN)
        .map_err(|e| HypervisorError::configuration(format!("host range pattern: {}", e)))?;

    let captures = match pattern.captures(spec) {
        Some(captures) => captures,
        None => return Ok(vec![spec.to_string()]),
    };

    let (whole, first, last) = match (captures.get(0), captures.get(1), captures.get(2)) {
        (Some(whole), Some(first), Some(last)) => (whole, first.as_str(), last.as_str()),
        _ => return Ok(vec![spec.to_string()]),
    };

    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|e| HypervisorError::configuration(format!("host range '{}': {}", spec, e)))
    };
    let (start, end) = (parse(first)?, parse(last)?);
    if start > end {
        return Err(HypervisorError::configuration(format!(
            "host range '{}' is reversed",
            spec
        )));
    }

    let width = if first.starts_with('0') { first.len() } else { 0 };
    let prefix = &spec[..whole.start()];
    let suffix = &spec[whole.end()..];

    Ok((start..=end)
        .map(|n| format!("{}{:0width$}{}", prefix, n, suffix, width = width))
        .collect())
}

/// One configuration per host named by `config.url`.
pub fn expand_hosts(
    config: &HypervisorServiceConfiguration,
) -> Result<Vec<HypervisorServiceConfiguration>> {
    let urls = expand_range(&config.url)?;
    if urls.len() == 1 {
        return Ok(vec![config.clone()]);
    }

    Ok(urls
        .into_iter()
        .map(|url| HypervisorServiceConfiguration {
            url,
            host: String::new(),
            ..config.clone()
        })
        .collect())
}
