//! Command specifications for toolchain invocations.
//!
//! A [`CommandSpec`] is an immutable description of a named action and how
//! it is formatted into a toolchain invocation. Specs live in a
//! [`CommandRegistry`] built at configuration time and read-only after.

use std::collections::HashMap;

/// How a command runs once formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// The formatted invocation line is forwarded to the persistent
    /// interactive terminal.
    Interactive,
    /// A one-shot subprocess is spawned and awaited; its output streams
    /// to the terminal sink.
    OneShot,
}

/// Immutable description of a named, invocable action.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Action name as exposed to callers (`run`, `build`, ...).
    pub name: String,
    /// Toolchain subcommand the action maps to.
    pub subcommand: String,
    pub kind: CommandKind,
    /// Prepend `--cc <compiler>` ahead of user-supplied arguments.
    pub inject_compiler: bool,
}

impl CommandSpec {
    pub fn new(name: &str, subcommand: &str, kind: CommandKind) -> Self {
        Self {
            name: name.to_string(),
            subcommand: subcommand.to_string(),
            kind,
            inject_compiler: false,
        }
    }

    /// Mark this spec as compiler-injecting.
    #[must_use]
    pub const fn with_compiler_injection(mut self) -> Self {
        self.inject_compiler = true;
        self
    }

    /// Format the full argument vector for this spec.
    ///
    /// Injected flags come first; user-supplied arguments keep their
    /// original order after them.
    pub fn format_args(&self, compiler: &str, args: &[String]) -> Vec<String> {
        let mut out = vec![self.subcommand.clone()];
        if self.inject_compiler {
            out.push("--cc".to_string());
            out.push(compiler.to_string());
        }
        out.extend(args.iter().cloned());
        out
    }
}

/// Registry of command specs, keyed by action name.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    specs: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Built-in actions mirroring the toolchain's terminal commands.
pub fn builtin_commands() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(
        CommandSpec::new("run", "run", CommandKind::OneShot).with_compiler_injection(),
    );
    registry.register(
        CommandSpec::new("build", "build", CommandKind::OneShot).with_compiler_injection(),
    );
    registry
}
