//! C7: the probe/sensor/group configuration DSL.
//!
//! A line-oriented grammar of `KEYWORD NAME ... end KEYWORD` blocks (§4.6).
//! Errors accumulate per block rather than aborting on the first one,
//! mirroring the teacher's config-loading error reporting
//! (`vector::config::loading`, which also collects multiple build errors
//! before failing); `include "file"` pushes onto a depth-bounded stack and
//! resolves relative to the including file.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::group::{Group, GroupKind, IpSet, IpWildcard, InterfaceBitmap};
use crate::probe::{CollectionSource, InterfaceValueKind, LogFlags, Probe, ProbeType, Quirks, Transport};
use crate::registry::{GroupId, Registry};
use crate::sensor::{Decider, Filter, FilterSide, Polarity, Sensor};

const MAX_INCLUDE_DEPTH: usize = 8;

/// A `ConfigError` tagged with the file/line it was found at, per block.
#[derive(Debug)]
pub struct Diagnostic {
    pub file: String,
    pub line: usize,
    pub error: ConfigError,
}

/// Loads config text from a file path; the default implementation reads
/// from the filesystem, relative to the including file. Tests substitute
/// an in-memory implementation so the parser can be exercised without a
/// real filesystem.
pub trait FileLoader {
    fn load(&self, path: &Path) -> std::io::Result<String>;
}

pub struct FsLoader;

impl FileLoader for FsLoader {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// One whitespace/comma-separated token, with quoting support for values
/// like pathnames whose syntax would otherwise be ambiguous.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                    in_quotes = false;
                } else {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    in_quotes = true;
                }
            }
            c if in_quotes => current.push(c),
            ',' | ' ' | '\t' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

#[derive(Debug, Clone)]
struct RawBlock {
    kind: String,
    name: String,
    extra: Vec<String>,
    lines: Vec<(usize, Vec<String>)>,
    start_line: usize,
}

struct Lexer<'a> {
    loader: &'a dyn FileLoader,
    include_stack: Vec<PathBuf>,
    diagnostics: Vec<Diagnostic>,
    blocks: Vec<RawBlock>,
}

impl<'a> Lexer<'a> {
    fn new(loader: &'a dyn FileLoader) -> Self {
        Lexer {
            loader,
            include_stack: Vec::new(),
            diagnostics: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn error(&mut self, file: &str, line: usize, error: ConfigError) {
        self.diagnostics.push(Diagnostic {
            file: file.to_string(),
            line,
            error,
        });
    }

    /// Reads `path` (pushing it onto the include stack) and folds every
    /// block it contains (including transitively included files) into
    /// `self.blocks`.
    fn read_file(&mut self, path: &Path) {
        if self.include_stack.len() >= MAX_INCLUDE_DEPTH {
            self.error(
                &path.display().to_string(),
                0,
                ConfigError::IncludeDepthExceeded {
                    path: path.display().to_string(),
                },
            );
            return;
        }
        let text = match self.loader.load(path) {
            Ok(text) => text,
            Err(e) => {
                self.error(
                    &path.display().to_string(),
                    0,
                    ConfigError::Syntax {
                        file: path.display().to_string(),
                        line: 0,
                        message: format!("cannot read include file: {e}"),
                    },
                );
                return;
            }
        };
        self.include_stack.push(path.to_path_buf());
        self.read_text(&path.display().to_string(), path.parent(), &text);
        self.include_stack.pop();
    }

    fn read_text(&mut self, file_name: &str, base_dir: Option<&Path>, text: &str) {
        let mut lines = text.lines().enumerate().peekable();
        while let Some((idx, raw_line)) = lines.next() {
            let line_no = idx + 1;
            let stripped = strip_comment(raw_line).trim();
            if stripped.is_empty() {
                continue;
            }
            let tokens = tokenize(stripped);
            if tokens.is_empty() {
                continue;
            }

            if tokens[0] == "include" {
                if tokens.len() < 2 {
                    self.error(
                        file_name,
                        line_no,
                        ConfigError::MissingValue {
                            block: "include".into(),
                            field: "path".into(),
                        },
                    );
                    continue;
                }
                let included = Path::new(&tokens[1]);
                let resolved = if included.is_relative() {
                    base_dir.map(|d| d.join(included)).unwrap_or_else(|| included.to_path_buf())
                } else {
                    included.to_path_buf()
                };
                self.read_file(&resolved);
                continue;
            }

            if tokens[0] == "probe" || tokens[0] == "sensor" || tokens[0] == "group" {
                self.read_block(file_name, line_no, tokens, &mut lines);
                continue;
            }

            self.error(
                file_name,
                line_no,
                ConfigError::Syntax {
                    file: file_name.to_string(),
                    line: line_no,
                    message: format!("unexpected statement outside any block: '{stripped}'"),
                },
            );
        }
    }

    fn read_block(
        &mut self,
        file_name: &str,
        start_line: usize,
        header: Vec<String>,
        lines: &mut std::iter::Peekable<std::iter::Enumerate<std::str::Lines>>,
    ) {
        let kind = header[0].clone();
        let name = header.get(1).cloned().unwrap_or_default();
        let extra = header.get(2..).map(|s| s.to_vec()).unwrap_or_default();
        if name.is_empty() {
            self.error(
                file_name,
                start_line,
                ConfigError::MissingValue {
                    block: kind.clone(),
                    field: "name".into(),
                },
            );
        }

        let closer = format!("end {kind}");
        let mut body = Vec::new();
        let mut closed = false;

        while let Some(&(idx, raw_line)) = lines.peek() {
            let line_no = idx + 1;
            let stripped = strip_comment(raw_line).trim();
            if stripped.is_empty() {
                lines.next();
                continue;
            }
            if stripped == closer {
                lines.next();
                closed = true;
                break;
            }
            if let Some(other_kind) = stripped.strip_prefix("end ") {
                // Mismatched closer: close this block anyway with a
                // recorded error (§4.6 parser error policy), consuming
                // the closer so the outer block doesn't see it twice.
                self.error(
                    file_name,
                    line_no,
                    ConfigError::Syntax {
                        file: file_name.to_string(),
                        line: line_no,
                        message: format!(
                            "expected 'end {kind}', found 'end {other_kind}'; closing anyway"
                        ),
                    },
                );
                lines.next();
                closed = true;
                break;
            }
            let tokens = tokenize(stripped);
            if !tokens.is_empty() {
                body.push((line_no, tokens));
            }
            lines.next();
        }

        if !closed {
            self.error(
                file_name,
                start_line,
                ConfigError::UnclosedBlock {
                    kind: kind.clone(),
                    file: file_name.to_string(),
                    line: start_line,
                },
            );
        }

        self.blocks.push(RawBlock {
            kind,
            name,
            extra,
            lines: body,
            start_line,
        });
    }
}

/// Resolves a `listen-as-host`/`listen-on-port` pair to a concrete address
/// list, the way a hostname with both A and AAAA records expands (§3).
fn resolve_listen(host: &str, port: u16) -> Result<Vec<SocketAddr>, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map(|it| it.collect())
        .map_err(|e| ConfigError::Syntax {
            file: String::new(),
            line: 0,
            message: format!("cannot resolve '{host}:{port}': {e}"),
        })
}

struct Builder<'a> {
    diagnostics: &'a mut Vec<Diagnostic>,
    registry: Registry,
    group_refs: HashMap<String, GroupId>,
}

impl<'a> Builder<'a> {
    fn err(&mut self, file: &str, line: usize, error: ConfigError) {
        self.diagnostics.push(Diagnostic {
            file: file.to_string(),
            line,
            error,
        });
    }

    fn build_group(&mut self, block: &RawBlock, file_name: &str) {
        let mut kind: Option<GroupKind> = None;
        for (line_no, tokens) in &block.lines {
            match tokens[0].as_str() {
                "interfaces" => {
                    let mut bm = InterfaceBitmap::default();
                    for tok in &tokens[1..] {
                        if let Some(stripped) = tok.strip_prefix('@') {
                            if let Some(id) = self.group_refs.get(stripped) {
                                if let GroupKind::Interface(other) = self.registry.group(*id).kind() {
                                    bm = bm.union(other);
                                }
                            }
                            continue;
                        }
                        match tok.parse::<u32>() {
                            Ok(idx) => {
                                if let Err(e) = bm.insert(idx) {
                                    self.err(
                                        file_name,
                                        *line_no,
                                        ConfigError::Syntax {
                                            file: file_name.into(),
                                            line: *line_no,
                                            message: e.to_string(),
                                        },
                                    );
                                }
                            }
                            Err(_) => self.err(
                                file_name,
                                *line_no,
                                ConfigError::Syntax {
                                    file: file_name.into(),
                                    line: *line_no,
                                    message: format!("'{tok}' is not a valid interface index"),
                                },
                            ),
                        }
                    }
                    kind = Some(GroupKind::Interface(bm));
                }
                "ipblocks" => {
                    let mut list = Vec::new();
                    for tok in &tokens[1..] {
                        if let Some(stripped) = tok.strip_prefix('@') {
                            if let Some(id) = self.group_refs.get(stripped) {
                                if let GroupKind::Ipblock(other) = self.registry.group(*id).kind() {
                                    list.extend(other.iter().cloned());
                                }
                            }
                            continue;
                        }
                        let parts: Vec<&str> = tok.split('.').collect();
                        match crate::group::wildcard_from_parts(&parts) {
                            Some(w) => list.push(w),
                            None => self.err(
                                file_name,
                                *line_no,
                                ConfigError::Syntax {
                                    file: file_name.into(),
                                    line: *line_no,
                                    message: format!("'{tok}' is not a valid ipblock wildcard"),
                                },
                            ),
                        }
                    }
                    kind = Some(GroupKind::Ipblock(list));
                }
                "ipsets" => {
                    // The loaded-ipset-file format is out of scope (§1);
                    // file paths are accepted but produce an empty set.
                    kind = Some(GroupKind::IpSet(IpSet::from_blocks(Vec::new())));
                }
                other => self.err(
                    file_name,
                    *line_no,
                    ConfigError::UnknownKeyword {
                        block: "group".into(),
                        keyword: other.into(),
                    },
                ),
            }
        }

        let Some(kind) = kind else {
            self.err(
                file_name,
                block.start_line,
                ConfigError::MissingValue {
                    block: "group".into(),
                    field: "interfaces/ipblocks/ipsets".into(),
                },
            );
            return;
        };

        let name = if block.name.is_empty() { None } else { Some(block.name.clone()) };
        if let Some(n) = &name {
            if self.group_refs.contains_key(n) {
                self.err(
                    file_name,
                    block.start_line,
                    ConfigError::DuplicateName {
                        kind: "group".into(),
                        name: n.clone(),
                    },
                );
                return;
            }
        }
        let mut group = Group::new(name.clone(), kind);
        group.freeze();
        let id = self.registry.insert_group(group);
        if let Some(n) = name {
            self.group_refs.insert(n, id);
        }
    }

    fn build_probe(&mut self, block: &RawBlock, file_name: &str) {
        let probe_type = match block.extra.first().map(String::as_str) {
            Some("netflow-v5") => ProbeType::NetflowV5,
            Some("netflow-v9") => ProbeType::NetflowV9,
            Some("ipfix") => ProbeType::Ipfix,
            Some("sflow") => ProbeType::Sflow,
            Some("silk") => ProbeType::Silk,
            Some(other) => {
                self.err(
                    file_name,
                    block.start_line,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: block.start_line,
                        message: format!("unknown probe type '{other}'"),
                    },
                );
                return;
            }
            None => {
                self.err(
                    file_name,
                    block.start_line,
                    ConfigError::MissingValue {
                        block: "probe".into(),
                        field: "type".into(),
                    },
                );
                return;
            }
        };

        let mut transport = Transport::Unset;
        let mut host: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut unix_path: Option<PathBuf> = None;
        let mut file_path: Option<PathBuf> = None;
        let mut poll_dir: Option<PathBuf> = None;
        let mut accept_from_host: Vec<Vec<SocketAddr>> = Vec::new();
        let mut interface_values = InterfaceValueKind::Snmp;
        let mut log_flags = LogFlags::DEFAULT;
        let mut quirks = Quirks::NONE;

        for (line_no, tokens) in &block.lines {
            match tokens[0].as_str() {
                "protocol" => {
                    transport = match tokens.get(1).map(String::as_str) {
                        Some("udp") => Transport::Udp,
                        Some("tcp") => Transport::Tcp,
                        Some("sctp") => Transport::Sctp,
                        _ => {
                            self.err(
                                file_name,
                                *line_no,
                                ConfigError::Syntax {
                                    file: file_name.into(),
                                    line: *line_no,
                                    message: "unknown protocol value".into(),
                                },
                            );
                            Transport::Unset
                        }
                    };
                }
                "listen-as-host" => host = tokens.get(1).cloned(),
                "listen-on-port" => port = tokens.get(1).and_then(|t| t.parse().ok()),
                "listen-on-unix-socket" => unix_path = tokens.get(1).map(PathBuf::from),
                "read-from-file" => file_path = tokens.get(1).map(PathBuf::from),
                "poll-directory" => poll_dir = tokens.get(1).map(PathBuf::from),
                "accept-from-host" => {
                    let mut group = Vec::new();
                    for tok in &tokens[1..] {
                        match resolve_listen(tok, 0) {
                            Ok(addrs) => group.extend(addrs),
                            Err(e) => self.err(file_name, *line_no, e),
                        }
                    }
                    accept_from_host.push(group);
                }
                "log-flags" => {
                    for tok in &tokens[1..] {
                        match tok.as_str() {
                            "all" => log_flags = LogFlags::ALL,
                            "none" => log_flags = LogFlags::NONE,
                            "bad" => log_flags.insert(LogFlags::BAD),
                            "missing" => log_flags.insert(LogFlags::MISSING),
                            "sampling" => log_flags.insert(LogFlags::SAMPLING),
                            "record-timestamps" => log_flags.insert(LogFlags::RECORD_TIMESTAMPS),
                            "firewall-event" => log_flags.insert(LogFlags::FIREWALL_EVENT),
                            "show-templates" => log_flags.insert(LogFlags::SHOW_TEMPLATES),
                            "default" => log_flags.insert(LogFlags::DEFAULT),
                            other => self.err(
                                file_name,
                                *line_no,
                                ConfigError::UnknownKeyword {
                                    block: "probe".into(),
                                    keyword: other.into(),
                                },
                            ),
                        }
                    }
                }
                "quirks" => {
                    for tok in &tokens[1..] {
                        match tok.as_str() {
                            "none" => quirks = Quirks::NONE,
                            "firewall-event" => quirks.insert(Quirks::FIREWALL_EVENT),
                            "missing-ips" => quirks.insert(Quirks::MISSING_IPS),
                            "nf9-out-is-reverse" => quirks.insert(Quirks::NF9_OUT_IS_REVERSE),
                            "nf9-sysuptime-seconds" => quirks.insert(Quirks::NF9_SYSUPTIME_SECONDS),
                            "zero-packets" => quirks.insert(Quirks::ZERO_PACKETS),
                            other => self.err(
                                file_name,
                                *line_no,
                                ConfigError::UnknownKeyword {
                                    block: "probe".into(),
                                    keyword: other.into(),
                                },
                            ),
                        }
                    }
                }
                "interface-values" => {
                    interface_values = match tokens.get(1).map(String::as_str) {
                        Some("snmp") => InterfaceValueKind::Snmp,
                        Some("vlan") => InterfaceValueKind::Vlan,
                        _ => {
                            self.err(
                                file_name,
                                *line_no,
                                ConfigError::Syntax {
                                    file: file_name.into(),
                                    line: *line_no,
                                    message: "interface-values must be snmp or vlan".into(),
                                },
                            );
                            InterfaceValueKind::Snmp
                        }
                    };
                }
                other => self.err(
                    file_name,
                    *line_no,
                    ConfigError::UnknownKeyword {
                        block: "probe".into(),
                        keyword: other.into(),
                    },
                ),
            }
        }

        let sources_given = [
            host.is_some() || port.is_some(),
            unix_path.is_some(),
            file_path.is_some(),
            poll_dir.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count();

        let source = if let Some(path) = file_path {
            CollectionSource::ReadFromFile(path)
        } else if let Some(dir) = poll_dir {
            CollectionSource::PollDirectory(dir)
        } else if let Some(path) = unix_path {
            CollectionSource::ListenUnixPath(path)
        } else if let (Some(host), Some(port)) = (host, port) {
            match resolve_listen(&host, port) {
                Ok(addrs) => CollectionSource::ListenSockaddr(addrs),
                Err(e) => {
                    self.err(file_name, block.start_line, e);
                    return;
                }
            }
        } else {
            self.err(
                file_name,
                block.start_line,
                ConfigError::MissingValue {
                    block: "probe".into(),
                    field: "listen-as-host/listen-on-unix-socket/read-from-file/poll-directory".into(),
                },
            );
            return;
        };

        if sources_given > 1 {
            self.err(
                file_name,
                block.start_line,
                ConfigError::Syntax {
                    file: file_name.into(),
                    line: block.start_line,
                    message: "a probe may declare only one collection source".into(),
                },
            );
        }

        if self.registry.probe_by_name(&block.name).is_some() {
            self.err(
                file_name,
                block.start_line,
                ConfigError::DuplicateName {
                    kind: "probe".into(),
                    name: block.name.clone(),
                },
            );
            return;
        }

        let mut probe = Probe::new(block.name.clone(), probe_type, transport, source, interface_values);
        probe.accept_from_host = accept_from_host;
        probe.log_flags = log_flags.with_env_show_templates();
        probe.quirks = quirks;
        self.registry.insert_probe(probe);
    }

    fn build_sensor(&mut self, block: &RawBlock, file_name: &str) {
        let mut sensor = Sensor::new(block.name.clone());
        let mut probe_names: Vec<String> = Vec::new();

        for (line_no, tokens) in &block.lines {
            let keyword = tokens[0].as_str();
            if let Some(network) = keyword.strip_suffix("-interfaces") {
                self.add_decider(&mut sensor, network, &tokens[1..], GroupKindTag::Interface, file_name, *line_no);
            } else if let Some(network) = keyword.strip_suffix("-ipblocks") {
                self.add_decider(&mut sensor, network, &tokens[1..], GroupKindTag::Ipblock, file_name, *line_no);
            } else if let Some(network) = keyword.strip_suffix("-ipsets") {
                self.add_decider(&mut sensor, network, &tokens[1..], GroupKindTag::Ipset, file_name, *line_no);
            } else {
                match keyword {
                    "source-network" => {
                        if let Some(name) = tokens.get(1) {
                            let id = self.registry.networks.intern(name);
                            match id {
                                Ok(id) => sensor.fixed_source_network = Some(id),
                                Err(e) => self.err(file_name, *line_no, e),
                            }
                        }
                    }
                    "destination-network" => {
                        if let Some(name) = tokens.get(1) {
                            let id = self.registry.networks.intern(name);
                            match id {
                                Ok(id) => sensor.fixed_dest_network = Some(id),
                                Err(e) => self.err(file_name, *line_no, e),
                            }
                        }
                    }
                    "discard-when" | "discard-unless" => {
                        let polarity = if keyword == "discard-when" {
                            Polarity::DiscardWhen
                        } else {
                            Polarity::DiscardUnless
                        };
                        self.add_filter(&mut sensor, &tokens[1..], polarity, file_name, *line_no);
                    }
                    "isp-ip" => {
                        // Accepted for grammar completeness; has no effect
                        // on the classifier's decision, only on upstream
                        // ISP-labeling tooling outside this crate's scope.
                    }
                    "probes" => {
                        probe_names.extend(tokens[2..].iter().cloned());
                    }
                    other => self.err(
                        file_name,
                        *line_no,
                        ConfigError::UnknownKeyword {
                            block: "sensor".into(),
                            keyword: other.into(),
                        },
                    ),
                }
            }
        }

        if self.registry.sensor_by_name(&block.name).is_some() {
            self.err(
                file_name,
                block.start_line,
                ConfigError::DuplicateName {
                    kind: "sensor".into(),
                    name: block.name.clone(),
                },
            );
            return;
        }

        let sensor_id = self.registry.insert_sensor(sensor);
        for name in probe_names {
            match self.registry.probe_by_name(&name) {
                Some(probe_id) => {
                    self.registry.sensor_mut(sensor_id).probes.push(probe_id);
                    self.registry.probe_mut(probe_id).sensors.push(sensor_id);
                }
                None => self.err(
                    file_name,
                    block.start_line,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: block.start_line,
                        message: format!("sensor '{}' references unknown probe '{name}'", block.name),
                    },
                ),
            }
        }
    }

    fn add_decider(
        &mut self,
        sensor: &mut Sensor,
        network: &str,
        values: &[String],
        kind_tag: GroupKindTag,
        file_name: &str,
        line_no: usize,
    ) {
        let network_id = match self.registry.networks.intern(network) {
            Ok(id) => id,
            Err(e) => {
                self.err(file_name, line_no, e);
                return;
            }
        };

        if values.iter().any(|v| v == "remainder") {
            let decider = match kind_tag {
                GroupKindTag::Interface => Decider::RemainderInterface,
                GroupKindTag::Ipblock => Decider::RemainderIpblock,
                GroupKindTag::Ipset => Decider::RemainderIpset,
            };
            sensor.deciders.push((network_id, decider));
            return;
        }

        for tok in values {
            let Some(stripped) = tok.strip_prefix('@') else {
                self.err(
                    file_name,
                    line_no,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: line_no,
                        message: format!("expected a '@group' reference, found '{tok}'"),
                    },
                );
                continue;
            };
            match self.group_refs.get(stripped) {
                Some(&group_id) => {
                    let decider = match kind_tag {
                        GroupKindTag::Interface => Decider::Interface(group_id),
                        GroupKindTag::Ipblock => Decider::Ipblock(group_id),
                        GroupKindTag::Ipset => Decider::Ipset(group_id),
                    };
                    sensor.deciders.push((network_id, decider));
                }
                None => self.err(
                    file_name,
                    line_no,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: line_no,
                        message: format!("unknown group '@{stripped}'"),
                    },
                ),
            }
        }
    }

    fn add_filter(
        &mut self,
        sensor: &mut Sensor,
        tokens: &[String],
        polarity: Polarity,
        file_name: &str,
        line_no: usize,
    ) {
        let Some(side_tok) = tokens.first() else {
            self.err(
                file_name,
                line_no,
                ConfigError::MissingValue {
                    block: "sensor".into(),
                    field: "discard side".into(),
                },
            );
            return;
        };
        let side = match side_tok.as_str() {
            "source" => FilterSide::Source,
            "destination" => FilterSide::Destination,
            "any" => FilterSide::Any,
            other => {
                self.err(
                    file_name,
                    line_no,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: line_no,
                        message: format!("unknown filter side '{other}'"),
                    },
                );
                return;
            }
        };
        for tok in &tokens[1..] {
            let Some(stripped) = tok.strip_prefix('@') else { continue };
            match self.group_refs.get(stripped) {
                Some(&group_id) => sensor.filters.push(Filter {
                    group: group_id,
                    side,
                    polarity,
                }),
                None => self.err(
                    file_name,
                    line_no,
                    ConfigError::Syntax {
                        file: file_name.into(),
                        line: line_no,
                        message: format!("unknown group '@{stripped}'"),
                    },
                ),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupKindTag {
    Interface,
    Ipblock,
    Ipset,
}

/// Parses `entry_point` (and anything it transitively includes) into a
/// `Registry`, verifying every probe and sensor. Errors accumulate; the
/// registry is only returned once every block parsed and verified cleanly.
pub fn parse_config(
    entry_point: &Path,
    loader: &dyn FileLoader,
    resolve_sensor_id: impl Fn(&str) -> Option<u32>,
) -> Result<Registry, Vec<Diagnostic>> {
    let mut lexer = Lexer::new(loader);
    lexer.read_file(entry_point);
    let Lexer {
        mut diagnostics,
        blocks,
        ..
    } = lexer;

    let mut builder = Builder {
        diagnostics: &mut diagnostics,
        registry: Registry::new(),
        group_refs: HashMap::new(),
    };

    let file_name = entry_point.display().to_string();
    for block in blocks.iter().filter(|b| b.kind == "group") {
        builder.build_group(block, &file_name);
    }
    for block in blocks.iter().filter(|b| b.kind == "probe") {
        builder.build_probe(block, &file_name);
    }
    for block in blocks.iter().filter(|b| b.kind == "sensor") {
        builder.build_sensor(block, &file_name);
    }

    let mut registry = builder.registry;

    let probe_ids: Vec<_> = registry.probes().map(|(id, _)| id).collect();
    for id in probe_ids {
        if let Err(e) = registry.probe_mut(id).verify() {
            diagnostics.push(Diagnostic {
                file: file_name.clone(),
                line: 0,
                error: e,
            });
        }
    }

    // Sensor verification needs both `&Registry` (for group lookups) and
    // `&mut Sensor`; since the sensor lives inside the registry, clone the
    // sensor out, verify against the (otherwise untouched) registry, then
    // write it back.
    let sensor_ids: Vec<_> = registry.sensors().map(|(id, _)| id).collect();
    for id in sensor_ids {
        let mut sensor = registry.sensor(id).clone();
        if let Err(e) = sensor.verify(&registry, &resolve_sensor_id) {
            diagnostics.push(Diagnostic {
                file: file_name.clone(),
                line: 0,
                error: e,
            });
        }
        *registry.sensor_mut(id) = sensor;
    }

    if diagnostics.is_empty() {
        Ok(registry)
    } else {
        Err(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct MemLoader(RefCell<StdHashMap<PathBuf, String>>);

    impl FileLoader for MemLoader {
        fn load(&self, path: &Path) -> std::io::Result<String> {
            self.0
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "not found"))
        }
    }

    fn loader(files: &[(&str, &str)]) -> MemLoader {
        let mut map = StdHashMap::new();
        for (path, text) in files {
            map.insert(PathBuf::from(path), text.to_string());
        }
        MemLoader(RefCell::new(map))
    }

    #[test]
    fn parses_minimal_probe_and_sensor() {
        let config = r#"
            probe P0 netflow-v5
                protocol udp
                listen-as-host 127.0.0.1
                listen-on-port 9995
            end probe

            sensor S0
                source-network external
                destination-network internal
                probes netflow-v5 P0
            end sensor
        "#;
        let loader = loader(&[("main.conf", config)]);
        let registry = parse_config(Path::new("main.conf"), &loader, |name| {
            if name == "S0" { Some(1) } else { None }
        })
        .expect("config should parse cleanly");

        let probe_id = registry.probe_by_name("P0").unwrap();
        assert!(registry.probe(probe_id).is_verified());
        let sensor_id = registry.sensor_by_name("S0").unwrap();
        assert!(registry.sensor(sensor_id).is_verified());
        assert_eq!(registry.probe(probe_id).sensors, vec![sensor_id]);
    }

    #[test]
    fn unresolvable_sensor_id_is_an_error() {
        let config = r#"
            sensor S0
            end sensor
        "#;
        let loader = loader(&[("main.conf", config)]);
        let result = parse_config(Path::new("main.conf"), &loader, |_| None);
        assert!(result.is_err());
    }

    #[test]
    fn mismatched_closer_still_closes_block() {
        let config = r#"
            probe P0 netflow-v5
                protocol udp
                listen-as-host 127.0.0.1
                listen-on-port 9995
            end sensor
        "#;
        let loader = loader(&[("main.conf", config)]);
        let result = parse_config(Path::new("main.conf"), &loader, |_| Some(1));
        // The block still closes (with a recorded error), so the probe
        // itself should have parsed.
        match result {
            Err(diags) => assert!(diags.iter().any(|d| matches!(d.error, ConfigError::Syntax { .. }))),
            Ok(_) => panic!("expected a mismatched-closer diagnostic"),
        }
    }

    #[test]
    fn include_depth_is_bounded() {
        let mut files = Vec::new();
        for i in 0..10 {
            files.push((
                format!("f{i}.conf"),
                format!("include \"f{}.conf\"\n", i + 1),
            ));
        }
        let files_ref: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let loader = loader(&files_ref);
        let result = parse_config(Path::new("f0.conf"), &loader, |_| Some(1));
        match result {
            Err(diags) => assert!(diags
                .iter()
                .any(|d| matches!(d.error, ConfigError::IncludeDepthExceeded { .. }))),
            Ok(_) => panic!("expected include depth to be exceeded"),
        }
    }

    #[test]
    fn group_reference_resolves_interfaces() {
        let config = r#"
            group G0
                interfaces 1,2,3
            end group

            sensor S0
                external-interfaces @G0
                destination-network internal
            end sensor
        "#;
        let loader = loader(&[("main.conf", config)]);
        let registry = parse_config(Path::new("main.conf"), &loader, |_| Some(1)).unwrap();
        let sensor_id = registry.sensor_by_name("S0").unwrap();
        let sensor = registry.sensor(sensor_id);
        assert_eq!(sensor.deciders.len(), 1);
    }
}
