//! Parser for the line-oriented rc configuration language.
//!
//! An rc file is a sequence of top-level directives:
//!
//! ```text
//! on <cond> [&& <cond>]...     # trigger block header
//!     <command>...             # commands until the next directive
//!
//! service <name> <path> [arg]...
//!     <option>...              # options until the next directive
//!
//! import <path>                # recursive, ${prop} expanded at parse time
//! ```
//!
//! Conditions are either a bare event name or `property:<key>=<value>`
//! (`*` matches any non-empty value). Tokens split on whitespace; double
//! quotes keep internal spaces; `#` outside quotes starts a comment; a
//! trailing `\` continues the line.
//!
//! Command arguments are stored verbatim. `${key}` substitution inside
//! them happens when the command executes, not here; only `import` paths
//! are expanded at parse time.

use crate::error::{Error, Result};
use crate::properties::PropertyStore;
use crate::service::{IoClass, ServiceDefinition, SocketConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// One condition in a trigger block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerCondition {
    /// Matches a queued event by name
    Event(String),
    /// Matches when the property currently holds the expected value
    Property { key: String, value: String },
}

/// A parsed command line: verb plus verb-specific arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<String>,
    pub line: u32,
}

impl Command {
    pub fn verb(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

/// An `on` block: conditions (AND semantics) and its ordered commands.
#[derive(Debug, Clone)]
pub struct TriggerBlock {
    pub conditions: Vec<TriggerCondition>,
    pub commands: Vec<Command>,
    /// `file:line` of the header, for diagnostics
    pub source: String,
}

impl TriggerBlock {
    /// Whether any condition watches the given property key.
    pub fn watches_property(&self, key: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, TriggerCondition::Property { key: k, .. } if k == key))
    }

    /// Whether the block carries any event condition.
    pub fn has_event_condition(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, TriggerCondition::Event(_)))
    }
}

/// Split a raw line into tokens. Double-quoted tokens preserve internal
/// whitespace; an unquoted `#` terminates the line.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '#' if !in_quotes => break,
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Replace every `${key}` with the current property value, empty string
/// when unset. Unterminated references are kept verbatim.
pub fn expand_props(input: &str, props: &PropertyStore) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let key = &rest[start + 2..start + 2 + end];
                out.push_str(&props.get(key, ""));
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Which block the current line belongs to, by registry index. Indices
/// keep commands attached to their own block even when an `import` in the
/// middle of a block appends blocks from another file.
#[derive(Clone, Copy)]
enum Section {
    None,
    Trigger(usize),
    Service(usize),
}

/// Streaming parser for rc files. Accumulates trigger blocks and service
/// definitions across every parsed file and import.
pub struct Parser<'a> {
    props: &'a PropertyStore,
    import_stack: Vec<PathBuf>,
    seen_services: HashSet<String>,
    pub triggers: Vec<TriggerBlock>,
    pub services: Vec<ServiceDefinition>,
}

impl<'a> Parser<'a> {
    pub fn new(props: &'a PropertyStore) -> Self {
        Self {
            props,
            import_stack: Vec::new(),
            seen_services: HashSet::new(),
            triggers: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Parse every `*.rc` file in `dir`, in name order. Per-file errors are
    /// logged; other files still parse. Returns the number of files parsed.
    pub fn parse_dir(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "skipping config directory");
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("rc"))
            .collect();
        paths.sort();

        let mut parsed = 0;
        for path in paths {
            match self.parse_file(&path) {
                Ok(()) => parsed += 1,
                Err(e) => error!(file = %path.display(), error = %e, "failed to parse rc file"),
            }
        }
        parsed
    }

    /// Parse a single rc file.
    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.import_stack.contains(&canonical) {
            return Err(Error::CyclicImport(canonical));
        }

        let content = std::fs::read_to_string(path)?;
        info!(file = %path.display(), "parsing rc file");

        self.import_stack.push(canonical);
        let result = self.parse_str(&content, path);
        self.import_stack.pop();
        result
    }

    /// Parse rc source text. `origin` names the file in diagnostics.
    pub fn parse_str(&mut self, content: &str, origin: &Path) -> Result<()> {
        let mut section = Section::None;
        let mut pending = String::new();
        let mut lineno: u32 = 0;
        let mut header_line: u32 = 0;

        for raw in content.lines() {
            lineno += 1;

            // Backslash continuation joins physical lines.
            if let Some(stripped) = raw.strip_suffix('\\') {
                if pending.is_empty() {
                    header_line = lineno;
                }
                pending.push_str(stripped);
                pending.push(' ');
                continue;
            }
            let logical = if pending.is_empty() {
                header_line = lineno;
                raw.to_string()
            } else {
                pending.push_str(raw);
                std::mem::take(&mut pending)
            };

            let tokens = tokenize(&logical);
            if tokens.is_empty() {
                continue;
            }

            let directive = tokens[0].clone();
            match directive.as_str() {
                "on" => {
                    section = if self.begin_trigger_block(&tokens[1..], origin, header_line) {
                        Section::Trigger(self.triggers.len() - 1)
                    } else {
                        Section::None
                    };
                }
                "service" => {
                    section = if self.begin_service_block(&tokens[1..], origin, header_line)? {
                        Section::Service(self.services.len() - 1)
                    } else {
                        Section::None
                    };
                }
                "import" => {
                    self.handle_import(&tokens[1..], origin, header_line);
                }
                _ => match section {
                    Section::Trigger(index) => {
                        self.triggers[index].commands.push(Command {
                            args: tokens,
                            line: header_line,
                        });
                    }
                    Section::Service(index) => {
                        self.apply_service_option(index, &tokens, origin, header_line)
                    }
                    Section::None => {
                        warn!(
                            file = %origin.display(),
                            line = header_line,
                            command = %logical.trim(),
                            "command outside any block, ignoring"
                        );
                    }
                },
            }
        }

        Ok(())
    }

    fn begin_trigger_block(&mut self, tokens: &[String], origin: &Path, line: u32) -> bool {
        let mut conditions = Vec::new();
        for token in tokens {
            if token == "&&" {
                continue;
            }
            conditions.push(parse_condition(token));
        }

        if conditions.is_empty() {
            warn!(file = %origin.display(), line, "trigger block without conditions, ignoring");
            return false;
        }

        self.triggers.push(TriggerBlock {
            conditions,
            commands: Vec::new(),
            source: format!("{}:{}", origin.display(), line),
        });
        true
    }

    fn begin_service_block(&mut self, tokens: &[String], origin: &Path, line: u32) -> Result<bool> {
        if tokens.len() < 2 {
            warn!(file = %origin.display(), line, "service line needs a name and an exec path");
            return Ok(false);
        }

        let name = tokens[0].clone();
        if !self.seen_services.insert(name.clone()) {
            return Err(Error::DuplicateService {
                file: origin.to_path_buf(),
                name,
            });
        }

        let mut def = ServiceDefinition::new(&name, &tokens[1]);
        def.args = tokens[2..].to_vec();
        debug!(service = %name, exec = %def.exec.display(), "parsed service header");
        self.services.push(def);
        Ok(true)
    }

    fn apply_service_option(&mut self, index: usize, tokens: &[String], origin: &Path, line: u32) {
        let def = &mut self.services[index];

        let option = tokens[0].as_str();
        let args = &tokens[1..];

        match option {
            "user" if args.len() == 1 => def.user = Some(args[0].clone()),
            "group" if args.len() == 1 => def.group = Some(args[0].clone()),
            "supplementary_groups" if !args.is_empty() => {
                def.supplementary_groups = args.to_vec();
            }
            "class" if args.len() == 1 => def.class = args[0].clone(),
            "disabled" => def.disabled = true,
            "oneshot" => def.oneshot = true,
            "critical" => def.critical = true,
            "console" => def.console = true,
            "capabilities" => def.capabilities = Some(args.to_vec()),
            "seclabel" if args.len() == 1 => def.seclabel = Some(args[0].clone()),
            "priority" if args.len() == 1 => match args[0].parse::<i32>() {
                Ok(prio) => def.priority = Some(prio),
                Err(_) => {
                    warn!(file = %origin.display(), line, value = %args[0], "malformed priority, ignoring");
                }
            },
            "ioprio" if args.len() == 2 => {
                match (IoClass::parse(&args[0]), args[1].parse::<u8>()) {
                    (Some(class), Ok(level)) if level <= 7 => {
                        def.ioprio = Some((class, level));
                    }
                    _ => {
                        warn!(file = %origin.display(), line, "malformed ioprio, ignoring");
                    }
                }
            }
            "setenv" if args.len() == 2 => {
                def.env.push((args[0].clone(), args[1].clone()));
            }
            "workdir" if args.len() == 1 => {
                def.working_directory = Some(PathBuf::from(&args[0]));
            }
            "writepid" if args.len() == 1 => def.writepid = Some(PathBuf::from(&args[0])),
            "socket" if args.len() >= 3 => {
                def.sockets.push(SocketConfig {
                    name: args[0].clone(),
                    kind: args[1].clone(),
                    perm: parse_mode(&args[2], origin, line),
                    user: args.get(3).cloned(),
                    group: args.get(4).cloned(),
                });
            }
            _ => {
                warn!(
                    file = %origin.display(),
                    line,
                    option,
                    "unknown or malformed service option"
                );
            }
        }
    }

    fn handle_import(&mut self, tokens: &[String], origin: &Path, line: u32) {
        let Some(raw_path) = tokens.first() else {
            warn!(file = %origin.display(), line, "import without a path");
            return;
        };

        // Import paths expand against the store at parse time.
        let expanded = expand_props(raw_path, self.props);
        let path = PathBuf::from(&expanded);

        if !path.exists() {
            warn!(file = %origin.display(), line, import = %expanded, "import target missing, continuing");
            return;
        }

        match self.parse_file(&path) {
            Ok(()) => debug!(import = %expanded, "import complete"),
            Err(Error::CyclicImport(p)) => {
                error!(file = %origin.display(), line, import = %p.display(), "cyclic import rejected");
            }
            Err(e) => {
                error!(file = %origin.display(), line, import = %expanded, error = %e, "import failed");
            }
        }
    }
}

fn parse_condition(token: &str) -> TriggerCondition {
    if let Some(rest) = token.strip_prefix("property:") {
        if let Some((key, value)) = rest.split_once('=') {
            return TriggerCondition::Property {
                key: key.to_string(),
                value: value.to_string(),
            };
        }
    }
    TriggerCondition::Event(token.to_string())
}

/// Parse an octal mode, defaulting to `0755` on malformed input.
pub fn parse_mode(s: &str, origin: &Path, line: u32) -> u32 {
    match u32::from_str_radix(s, 8) {
        Ok(mode) => mode,
        Err(_) => {
            warn!(file = %origin.display(), line, value = s, "malformed mode, defaulting to 0755");
            0o755
        }
    }
}
