// Command registry for the external line-oriented shell. The shell
// itself lives in the host; the core only owns the name -> handler table
// and the dispatch split.

use log::debug;
use std::collections::BTreeMap;

pub type CommandFn<C> = Box<dyn FnMut(&mut C, &[&str]) -> String>;

pub struct CommandEntry<C> {
    pub category: String,
    pub help: String,
    handler: CommandFn<C>,
}

pub struct CommandRegistry<C> {
    commands: BTreeMap<String, CommandEntry<C>>,
}

impl<C> CommandRegistry<C> {
    pub fn new() -> Self {
        CommandRegistry { commands: BTreeMap::new() }
    }

    pub fn register_command(&mut self, name: &str, category: &str, help: &str, handler: CommandFn<C>) {
        if self.commands.contains_key(name) {
            debug!("command {} re-registered", name);
        }
        self.commands.insert(
            name.to_string(),
            CommandEntry { category: category.to_string(), help: help.to_string(), handler },
        );
    }

    /// Split a line into command and arguments and run the handler.
    /// Unknown commands report themselves rather than erroring the core.
    pub fn dispatch_command(&mut self, context: &mut C, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            return String::new();
        };
        let args: Vec<&str> = parts.collect();
        match self.commands.get_mut(name) {
            Some(entry) => (entry.handler)(context, &args),
            None => format!("unknown command: {}", name),
        }
    }

    /// One help line per command, grouped by category.
    pub fn help(&self) -> String {
        let mut out = String::new();
        let mut last_category = None;
        for (name, entry) in &self.commands {
            if last_category != Some(&entry.category) {
                out.push_str(&format!("[{}]\n", entry.category));
                last_category = Some(&entry.category);
            }
            out.push_str(&format!("  {:<12} {}\n", name, entry.help));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_to_handler() {
        let mut registry: CommandRegistry<u32> = CommandRegistry::new();
        registry.register_command(
            "add",
            "math",
            "add a value to the counter",
            Box::new(|counter, args| {
                *counter += args.first().and_then(|a| a.parse::<u32>().ok()).unwrap_or(0);
                format!("counter = {}", counter)
            }),
        );
        let mut counter = 0;
        assert_eq!(registry.dispatch_command(&mut counter, "add 5"), "counter = 5");
        assert_eq!(counter, 5);
        assert!(registry.dispatch_command(&mut counter, "nope").starts_with("unknown"));
        assert_eq!(registry.dispatch_command(&mut counter, "   "), "");
    }
}
