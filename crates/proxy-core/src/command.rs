//! Prefix-command registry.
//!
//! Input text is normalized (control bytes dropped, a leading BOM
//! stripped, leading whitespace trimmed) before the prefix check, so a
//! client that pads its input line with NULs still dispatches. The
//! registry is generic over the handler context; the gateway passes its
//! service bundle through.

use std::collections::HashMap;

pub type Handler<C> = Box<dyn FnMut(&mut C, &[&str]) -> anyhow::Result<()> + Send>;

pub struct CommandRegistry<C> {
    prefix: char,
    handlers: HashMap<String, Handler<C>>,
}

impl<C> CommandRegistry<C> {
    pub fn new(prefix: char) -> Self {
        Self {
            prefix,
            handlers: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    /// Registers `name`, replacing any previous handler under it.
    pub fn register(
        &mut self,
        name: &str,
        handler: impl FnMut(&mut C, &[&str]) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.handlers
            .insert(name.to_ascii_lowercase(), Box::new(handler));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Runs the handler matching `input`, if any. Returns `true` iff a
    /// handler ran (whether or not it failed), which tells the caller to
    /// drop the original text from the wire. Handler errors are logged
    /// and never propagate.
    pub fn execute(&mut self, input: &str, ctx: &mut C) -> bool {
        let Some((name, args)) = self.parse(input) else {
            return false;
        };
        let Some(handler) = self.handlers.get_mut(&name) else {
            return false;
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        if let Err(err) = handler(ctx, &arg_refs) {
            tracing::warn!("command.failed name={name} error={err:#}");
        }
        true
    }

    /// Splits normalized input into a command name and its arguments.
    /// The name is the leading `[a-z0-9_-]` run of the first token,
    /// lowercased; input that does not start with the prefix, or whose
    /// name run is empty, is not a command.
    pub fn parse(&self, input: &str) -> Option<(String, Vec<String>)> {
        let normalized = normalize(input);
        let rest = normalized.strip_prefix(self.prefix)?;
        let mut tokens = rest.split_whitespace();
        let first = tokens.next()?;
        let name: String = first
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }
        let args = tokens.map(String::from).collect();
        Some((name, args))
    }
}

/// Drops bytes in `[0x00, 0x1F]`, strips a leading U+FEFF, and trims
/// leading whitespace.
pub fn normalize(input: &str) -> String {
    let cleaned: String = input.chars().filter(|c| (*c as u32) > 0x1F).collect();
    let cleaned = cleaned.strip_prefix('\u{feff}').unwrap_or(&cleaned);
    cleaned.trim_start().to_string()
}
