//! Trigger registry and action queue.
//!
//! Trigger blocks are registered in parse order and never mutated
//! afterwards. Events and property changes are matched against the
//! registry in registration order; every match appends one queue entry,
//! so a block can be queued more than once across its lifetime.
//!
//! The queue holds two kinds of work: a reference to a registered block
//! together with the event that activated it, and opaque builtin actions
//! carrying a diagnostic label. `execute_next` runs exactly one entry to
//! completion; there is no pre-emption between actions.

use crate::builtins;
use crate::init::InitContext;
use crate::properties::PropertyStore;
use crate::rc::{TriggerBlock, TriggerCondition};
use std::collections::VecDeque;
use tracing::{debug, error, info};

/// Outcome of one `execute_next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The queue was empty
    Idle,
    /// One entry ran to completion
    Dispatched,
}

/// A queued unit of work.
pub enum ActionEntry {
    /// A registered trigger block, by registry index, plus the event that
    /// activated it.
    Block { index: usize, event: String },
    /// A caller-supplied unit of work with a diagnostic name.
    Builtin {
        label: String,
        run: Box<dyn FnOnce(&InitContext) + Send>,
    },
}

/// The event-driven dispatcher.
#[derive(Default)]
pub struct ActionManager {
    triggers: Vec<TriggerBlock>,
    queue: VecDeque<ActionEntry>,
}

impl ActionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parsed block to the registry.
    pub fn register_block(&mut self, block: TriggerBlock) {
        debug!(source = %block.source, conditions = block.conditions.len(), "registered trigger block");
        self.triggers.push(block);
    }

    /// Append every parsed block, preserving parse order.
    pub fn register_all(&mut self, blocks: Vec<TriggerBlock>) {
        for block in blocks {
            self.register_block(block);
        }
    }

    /// Queue every block whose conditions all hold for this event.
    pub fn queue_event(&mut self, name: &str, props: &PropertyStore) {
        info!(event = name, "queueing event");
        for (index, block) in self.triggers.iter().enumerate() {
            if block_matches(block, Some(name), props) {
                debug!(source = %block.source, event = name, "block queued");
                self.queue.push_back(ActionEntry::Block {
                    index,
                    event: name.to_string(),
                });
            }
        }
    }

    /// Re-evaluate blocks watching `key` after a committed change. Blocks
    /// carrying an event condition only fire on their event.
    pub fn queue_property_change(&mut self, key: &str, value: &str, props: &PropertyStore) {
        for (index, block) in self.triggers.iter().enumerate() {
            if !block.watches_property(key) || block.has_event_condition() {
                continue;
            }
            if block_matches(block, None, props) {
                debug!(source = %block.source, key, value, "block queued on property change");
                self.queue.push_back(ActionEntry::Block {
                    index,
                    event: format!("property:{}={}", key, value),
                });
            }
        }
    }

    /// Enqueue an opaque work unit.
    pub fn queue_builtin<F>(&mut self, label: impl Into<String>, run: F)
    where
        F: FnOnce(&InitContext) + Send + 'static,
    {
        self.queue.push_back(ActionEntry::Builtin {
            label: label.into(),
            run: Box::new(run),
        });
    }

    /// Pop one entry and run it to completion. Returns [`Dispatch::Idle`]
    /// when the queue is empty.
    pub async fn execute_next(&mut self, ctx: &InitContext) -> Dispatch {
        let Some(entry) = self.queue.pop_front() else {
            return Dispatch::Idle;
        };

        match entry {
            ActionEntry::Block { index, event } => {
                let block = &self.triggers[index];
                info!(
                    source = %block.source,
                    event = %event,
                    commands = block.commands.len(),
                    "executing action"
                );
                for command in &block.commands {
                    // Command failures are logged and never unwind the loop.
                    if let Err(e) = builtins::run_command(ctx, command).await {
                        error!(
                            source = %block.source,
                            line = command.line,
                            verb = command.verb(),
                            error = %e,
                            "command failed"
                        );
                    }
                }
            }
            ActionEntry::Builtin { label, run } => {
                info!(builtin = %label, "executing builtin action");
                run(ctx);
            }
        }

        Dispatch::Dispatched
    }

    /// Number of queued entries.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of registered blocks.
    pub fn registered(&self) -> usize {
        self.triggers.len()
    }
}

/// Evaluate a block's conditions. `event` is the event being queued, or
/// `None` during a property-change evaluation.
fn block_matches(block: &TriggerBlock, event: Option<&str>, props: &PropertyStore) -> bool {
    block.conditions.iter().all(|cond| match cond {
        TriggerCondition::Event(name) => event == Some(name.as_str()),
        TriggerCondition::Property { key, value } => {
            let actual = props.get(key, "");
            if value == "*" {
                !actual.is_empty()
            } else {
                actual == *value
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rc::Parser;
    use std::path::Path;

    fn blocks(src: &str, props: &PropertyStore) -> Vec<TriggerBlock> {
        let mut parser = Parser::new(props);
        parser.parse_str(src, Path::new("test.rc")).unwrap();
        parser.triggers
    }

    #[test]
    fn event_matching_honors_registration_order() {
        let props = PropertyStore::new();
        let mut actions = ActionManager::new();
        actions.register_all(blocks(
            "on boot\n    setprop a 1\non boot\n    setprop b 2\non other\n    setprop c 3\n",
            &props,
        ));

        actions.queue_event("boot", &props);
        assert_eq!(actions.pending(), 2);

        actions.queue_event("other", &props);
        assert_eq!(actions.pending(), 3);

        actions.queue_event("unknown", &props);
        assert_eq!(actions.pending(), 3);
    }

    #[test]
    fn event_and_property_conditions_are_anded() {
        let props = PropertyStore::new();
        let mut actions = ActionManager::new();
        actions.register_all(blocks(
            "on boot && property:sys.ready=1\n    setprop done yes\n",
            &props,
        ));

        actions.queue_event("boot", &props);
        assert_eq!(actions.pending(), 0);

        props.set("sys.ready", "1").unwrap();
        actions.queue_event("boot", &props);
        assert_eq!(actions.pending(), 1);
    }

    #[test]
    fn wildcard_matches_any_nonempty_value() {
        let props = PropertyStore::new();
        let mut actions = ActionManager::new();
        actions.register_all(blocks(
            "on property:sys.user=*\n    setprop greeted yes\n",
            &props,
        ));

        actions.queue_property_change("sys.user", "", &props);
        assert_eq!(actions.pending(), 0);

        props.set("sys.user", "alice").unwrap();
        actions.queue_property_change("sys.user", "alice", &props);
        assert_eq!(actions.pending(), 1);
    }

    #[test]
    fn property_change_skips_blocks_with_event_conditions() {
        let props = PropertyStore::new();
        props.set("sys.flag", "on").unwrap();

        let mut actions = ActionManager::new();
        actions.register_all(blocks(
            "on boot && property:sys.flag=on\n    setprop a 1\n\
             on property:sys.flag=on\n    setprop b 2\n",
            &props,
        ));

        actions.queue_property_change("sys.flag", "on", &props);
        assert_eq!(actions.pending(), 1);
    }

    #[test]
    fn blocks_can_queue_multiple_times() {
        let props = PropertyStore::new();
        let mut actions = ActionManager::new();
        actions.register_all(blocks(
            "on property:sys.toggle=on\n    setprop seen yes\n",
            &props,
        ));

        props.set("sys.toggle", "on").unwrap();
        actions.queue_property_change("sys.toggle", "on", &props);
        props.set("sys.toggle", "off").unwrap();
        actions.queue_property_change("sys.toggle", "off", &props);
        props.set("sys.toggle", "on").unwrap();
        actions.queue_property_change("sys.toggle", "on", &props);

        assert_eq!(actions.pending(), 2);
    }
}
