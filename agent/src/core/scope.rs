//! Command segmentation, host extraction and target scope matching.
//!
//! Commands are split on shell control operators without honoring quotes, so a
//! quoted `;` yields an extra segment. Results are only used to find binaries
//! and host-like arguments.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Result, anyhow};

/// Wrappers that run another binary; the wrapped binary is reported instead.
const WRAPPERS: &[&str] = &["env", "time", "nohup", "nice", "stdbuf", "exec"];

/// Suffixes that make a dotted word a file name rather than a hostname.
const FILE_SUFFIXES: &[&str] = &[
    "txt", "xml", "json", "csv", "log", "html", "htm", "gnmap", "nmap", "lst", "out", "md",
    "yaml", "yml", "toml", "conf", "cfg", "sh", "py", "php", "js", "gz", "zip", "tar", "pcap",
    "db", "sql", "pem", "key", "crt",
];

/// Flags through which a tool reads its targets from a file or stdin.
const INPUT_LIST_FLAGS: &[&str] = &[
    "-iL",
    "-iR",
    "-l",
    "-list",
    "--list",
    "-M",
    "--includefile",
    "-input-file",
    "--input-file",
];

/// Split a command line into pipeline/list segments on `|`, `;`, `&` and newlines.
pub fn split_segments(command: &str) -> Vec<&str> {
    command
        .split(['|', ';', '&', '\n'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Binary invoked by a segment, with leading `VAR=value` assignments and
/// wrapper commands skipped and any directory prefix removed.
pub fn segment_binary(segment: &str) -> Option<&str> {
    let mut words = segment.split_whitespace().map(trim_word);
    loop {
        let word = words.next()?;
        if word.is_empty() || is_assignment(word) || WRAPPERS.contains(&word) {
            continue;
        }
        let name = word.rsplit('/').next().unwrap_or(word);
        return (!name.is_empty()).then_some(name);
    }
}

/// Primary binary of a whole command (the first segment's binary).
pub fn primary_binary(command: &str) -> Option<&str> {
    split_segments(command).into_iter().find_map(segment_binary)
}

/// Host-like arguments of a segment (IPv4 addresses, CIDR blocks, URL hosts and
/// dotted hostnames), lowercased, in argument order.
pub fn host_arguments(segment: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut seen_binary = false;
    for raw in segment.split_whitespace() {
        let word = trim_word(raw);
        if !seen_binary {
            if segment_binary(word).is_some() && !is_assignment(word) && !WRAPPERS.contains(&word)
            {
                seen_binary = true;
            }
            continue;
        }
        let candidate = match word.strip_prefix('-') {
            Some(flag) => match flag.split_once('=') {
                Some((_, value)) => value,
                None => continue,
            },
            None => word,
        };
        if let Some(host) = host_of(candidate)
            && !hosts.contains(&host)
        {
            hosts.push(host);
        }
    }
    hosts
}

/// Host-like arguments across every segment of a command.
pub fn command_hosts(command: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for segment in split_segments(command) {
        for host in host_arguments(segment) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }
    hosts
}

/// A target argument handed to an attack tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Inclusive IPv4 span: a single address, a CIDR block or an nmap octet
    /// pattern such as `10.0.0.1-20`, `10.0.*.1` or `10.0.1,3.1`.
    V4 { first: u32, last: u32 },
    V6 { addr: Ipv6Addr, prefix: u8 },
    Host(String),
    /// Address-like text that does not parse. Never inside a scope.
    Unparsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArg {
    pub raw: String,
    pub target: Target,
}

/// One occurrence of an attack tool inside a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: String,
    pub targets: Vec<TargetArg>,
    /// Targets also arrive through stdin, a list file or a shell expansion.
    pub indirect: bool,
}

/// Every occurrence of a tool from `tools` in `command`.
///
/// Tools are found anywhere in a segment, so `sudo nmap`, `timeout 60 nmap`,
/// `xargs nmap` and `sh -c 'nmap ..'` are all seen. A tool's arguments run to
/// the next tool in the same segment.
pub fn tool_invocations(command: &str, tools: &BTreeSet<String>) -> Vec<ToolInvocation> {
    let mut found = Vec::new();
    for (segment, piped) in segments_with_input(command) {
        let words: Vec<&str> = segment.split_whitespace().collect();
        let positions: Vec<(usize, String)> = words
            .iter()
            .enumerate()
            .filter_map(|(pos, word)| tool_name(word, tools).map(|tool| (pos, tool)))
            .collect();
        for (n, (pos, tool)) in positions.iter().enumerate() {
            let end = positions.get(n + 1).map_or(words.len(), |(next, _)| *next);
            let mut invocation = ToolInvocation {
                tool: tool.clone(),
                targets: Vec::new(),
                indirect: words[..*pos].iter().any(|word| bare(word) == "xargs"),
            };
            for raw in &words[pos + 1..end] {
                if raw.contains(['$', '`']) || raw.starts_with('<') {
                    invocation.indirect = true;
                    continue;
                }
                let word = bare(raw);
                let candidate = if word.starts_with('-') {
                    let (name, value) = match word.split_once('=') {
                        Some((name, value)) => (name, Some(value)),
                        None => (word, None),
                    };
                    if INPUT_LIST_FLAGS.contains(&name) {
                        invocation.indirect = true;
                    }
                    match value {
                        Some(value) => value,
                        None => continue,
                    }
                } else {
                    word
                };
                if let Some(target) = target_of(candidate) {
                    invocation.targets.push(TargetArg {
                        raw: candidate.to_string(),
                        target,
                    });
                }
            }
            if piped && invocation.targets.is_empty() {
                invocation.indirect = true;
            }
            found.push(invocation);
        }
    }
    found
}

/// Segments paired with whether a `|` pipe feeds them.
fn segments_with_input(command: &str) -> Vec<(&str, bool)> {
    let bytes = command.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut piped = false;
    for (i, byte) in bytes.iter().enumerate() {
        if !matches!(byte, b'|' | b';' | b'&' | b'\n') {
            continue;
        }
        let segment = command[start..i].trim();
        if !segment.is_empty() {
            segments.push((segment, piped));
        }
        piped = *byte == b'|'
            && bytes.get(i + 1) != Some(&b'|')
            && (i == 0 || bytes[i - 1] != b'|');
        start = i + 1;
    }
    let segment = command[start..].trim();
    if !segment.is_empty() {
        segments.push((segment, piped));
    }
    segments
}

fn tool_name(word: &str, tools: &BTreeSet<String>) -> Option<String> {
    let word = bare(word);
    if word.starts_with('-') {
        return None;
    }
    let name = word.rsplit('/').next().unwrap_or(word).to_ascii_lowercase();
    tools.contains(&name).then_some(name)
}

/// A word with quoting, grouping and a leading `$(` removed.
fn bare(word: &str) -> &str {
    trim_word(trim_word(word).trim_start_matches('$'))
}

/// Target named by an attack-tool argument, or `None` when the argument is
/// not target-like (flag values such as port lists, file names, modes).
fn target_of(word: &str) -> Option<Target> {
    let word = word.trim_matches(|c: char| matches!(c, ',' | '\'' | '"'));
    if word.is_empty() {
        return None;
    }
    if let Some((_, rest)) = word.split_once("://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let host = match authority.strip_prefix('[') {
            Some(_) => authority,
            None => strip_port(authority),
        };
        if host.is_empty() {
            return Some(Target::Unparsed);
        }
        return Some(parse_target(host).unwrap_or_else(|| single_label(host)));
    }
    if is_address_like(word) {
        return Some(parse_target(word).unwrap_or(Target::Unparsed));
    }
    if word.contains('/') || word.starts_with('.') {
        return None;
    }
    let host = strip_port(word);
    is_hostname(host).then(|| Target::Host(host.to_ascii_lowercase()))
}

fn single_label(host: &str) -> Target {
    if host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Target::Host(host.to_ascii_lowercase())
    } else {
        Target::Unparsed
    }
}

/// Digits joined by `.`, `*`, `-`, `,`, `:`, `/` or brackets (hex digits too
/// once a `:` appears). A plain decimal like `0.5` is a value, not an address.
fn is_address_like(word: &str) -> bool {
    let v6 = word.contains(':');
    let charset = word.chars().all(|c| {
        c.is_ascii_digit()
            || matches!(c, '.' | '*' | '-' | ',' | ':' | '/' | '[' | ']')
            || (v6 && c.is_ascii_hexdigit())
    });
    if !charset || !word.contains(['.', ':', '*']) {
        return false;
    }
    let decimal =
        word.matches('.').count() == 1 && word.chars().all(|c| c.is_ascii_digit() || c == '.');
    !decimal
}

/// Parse an address, network, octet pattern or dotted hostname.
pub fn parse_target(text: &str) -> Option<Target> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[') {
        let addr = inner.split(']').next()?;
        return addr
            .parse::<Ipv6Addr>()
            .ok()
            .map(|addr| Target::V6 { addr, prefix: 128 });
    }
    if text.matches(':').count() >= 2 {
        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok().filter(|p| *p <= 128)?),
            None => (text, 128),
        };
        return addr
            .parse::<Ipv6Addr>()
            .ok()
            .map(|addr| Target::V6 { addr, prefix });
    }
    let text = strip_port(text);
    if let Some((addr, prefix)) = text.split_once('/') {
        let ip: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok().filter(|p| *p <= 32)?;
        let first = mask(u32::from(ip), prefix);
        return Some(Target::V4 {
            first,
            last: first | !netmask(prefix),
        });
    }
    if let Some(span) = octet_span(text) {
        return Some(span);
    }
    is_hostname(text).then(|| Target::Host(text.to_ascii_lowercase()))
}

fn octet_span(text: &str) -> Option<Target> {
    let octets: Vec<&str> = text.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    let mut first = 0u32;
    let mut last = 0u32;
    for octet in octets {
        let (lo, hi) = octet_bounds(octet)?;
        first = (first << 8) | lo;
        last = (last << 8) | hi;
    }
    Some(Target::V4 { first, last })
}

/// Lowest and highest value of one nmap octet (`7`, `*`, `1-20`, `-9`, `3,5`).
fn octet_bounds(octet: &str) -> Option<(u32, u32)> {
    let mut bounds: Option<(u32, u32)> = None;
    for item in octet.split(',') {
        let (lo, hi) = match item {
            "*" => (0, 255),
            _ => match item.split_once('-') {
                Some((lo, hi)) => (
                    if lo.is_empty() { 0 } else { octet_value(lo)? },
                    if hi.is_empty() { 255 } else { octet_value(hi)? },
                ),
                None => {
                    let value = octet_value(item)?;
                    (value, value)
                }
            },
        };
        if lo > hi {
            return None;
        }
        bounds = Some(match bounds {
            Some((a, b)) => (a.min(lo), b.max(hi)),
            None => (lo, hi),
        });
    }
    bounds
}

fn octet_value(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u32>().ok().filter(|value| *value <= 255)
}

fn host_of(word: &str) -> Option<String> {
    let word = word.trim_matches(|c: char| matches!(c, ',' | '\'' | '"'));
    if word.is_empty() {
        return None;
    }
    if let Some((_, rest)) = word.split_once("://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let host = strip_port(authority);
        return (!host.is_empty()).then(|| host.to_ascii_lowercase());
    }
    if let Some(ip) = ipv4_target(word) {
        return Some(ip);
    }
    if word.contains('/') || word.starts_with('.') {
        return None;
    }
    let host = strip_port(word);
    is_hostname(host).then(|| host.to_ascii_lowercase())
}

/// IPv4 address, CIDR block, or nmap-style last-octet range (`10.0.0.1-20`).
fn ipv4_target(word: &str) -> Option<String> {
    if let Some((addr, prefix)) = word.split_once('/') {
        let ip: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        return (prefix <= 32).then(|| format!("{ip}/{prefix}"));
    }
    let base = strip_port(word);
    if let Ok(ip) = base.parse::<Ipv4Addr>() {
        return Some(ip.to_string());
    }
    let (start, end) = base.rsplit_once('-')?;
    let ip: Ipv4Addr = start.parse().ok()?;
    end.parse::<u8>().ok()?;
    Some(ip.to_string())
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

fn is_hostname(word: &str) -> bool {
    if !word.contains('.') || word.ends_with('.') {
        return false;
    }
    if !word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return false;
    }
    let Some(tld) = word.rsplit('.').next() else {
        return false;
    };
    let tld = tld.to_ascii_lowercase();
    tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && !FILE_SUFFIXES.contains(&tld.as_str())
}

fn trim_word(word: &str) -> &str {
    word.trim_matches(|c: char| matches!(c, '(' | ')' | '{' | '}' | '"' | '\'' | '`'))
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with('-')
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScopeEntry {
    Ip(IpAddr),
    Cidr { network: u32, prefix: u8 },
    Host(String),
    /// `*.example.com`: any strict subdomain of the stored suffix.
    Wildcard(String),
}

/// Allow-list of hosts a known attack tool may target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetScope {
    entries: Vec<ScopeEntry>,
}

impl TargetScope {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(entries.len());
        for raw in entries {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            parsed.push(parse_entry(raw)?);
        }
        Ok(Self { entries: parsed })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every address `target` can name lies inside the scope.
    ///
    /// A span is checked against one entry at a time, so a range straddling
    /// two entries is outside.
    pub fn covers(&self, target: &Target) -> bool {
        match target {
            Target::V4 { first, last } => self.entries.iter().any(|entry| match entry {
                ScopeEntry::Ip(IpAddr::V4(ip)) => first == last && *first == u32::from(*ip),
                ScopeEntry::Cidr { network, prefix } => {
                    mask(*first, *prefix) == *network && mask(*last, *prefix) == *network
                }
                _ => false,
            }),
            Target::V6 { addr, prefix } => {
                *prefix == 128
                    && self
                        .entries
                        .iter()
                        .any(|entry| matches!(entry, ScopeEntry::Ip(IpAddr::V6(ip)) if ip == addr))
            }
            Target::Host(host) => self.entries.iter().any(|entry| match entry {
                ScopeEntry::Host(allowed) => allowed == host,
                ScopeEntry::Wildcard(suffix) => host
                    .strip_suffix(suffix.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
                _ => false,
            }),
            Target::Unparsed => false,
        }
    }

    /// Whether `host` (an address, network, pattern or hostname) lies inside the scope.
    pub fn contains(&self, host: &str) -> bool {
        let target = parse_target(host).unwrap_or_else(|| single_label(host.trim()));
        self.covers(&target)
    }
}

fn parse_entry(raw: &str) -> Result<ScopeEntry> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(ScopeEntry::Ip(ip));
    }
    if let Some((addr, prefix)) = raw.split_once('/') {
        let ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow!("invalid scope network '{raw}'"))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| anyhow!("invalid scope prefix '{raw}'"))?;
        return Ok(ScopeEntry::Cidr {
            network: mask(u32::from(ip), prefix),
            prefix,
        });
    }
    if let Some(suffix) = raw.strip_prefix("*.") {
        if suffix.is_empty() {
            return Err(anyhow!("invalid scope wildcard '{raw}'"));
        }
        return Ok(ScopeEntry::Wildcard(suffix.to_ascii_lowercase()));
    }
    Ok(ScopeEntry::Host(raw.to_ascii_lowercase()))
}

fn mask(addr: u32, prefix: u8) -> u32 {
    addr & netmask(prefix)
}

fn netmask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}
