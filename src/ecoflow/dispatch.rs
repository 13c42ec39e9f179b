use std::collections::HashMap;
use std::sync::Arc;

use super::envelope::{Command, DecodedRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Command { cmd_func: u32, cmd: Command },
    /// Fires only when no command handler matched.
    Unhandled,
    /// Fires for every record; does not count as handling it.
    All,
}

pub type Handler<C> = Arc<dyn Fn(&C, &DecodedRecord) + Send + Sync>;

/// Routes records to handlers registered per (function code, command).
/// Handlers run in registration order.
pub struct Dispatcher<C> {
    default_cmd_func: u32,
    handlers: HashMap<HandlerKey, Vec<Handler<C>>>,
}

impl<C> Dispatcher<C> {
    pub fn new(default_cmd_func: u32) -> Self {
        Self {
            default_cmd_func,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for each of `cmds`, under `cmd_func` or the
    /// dispatcher's default function code.
    pub fn on<F>(&mut self, cmds: &[Command], cmd_func: Option<u32>, handler: F)
    where
        F: Fn(&C, &DecodedRecord) + Send + Sync + 'static,
    {
        let handler: Handler<C> = Arc::new(handler);
        let cmd_func = cmd_func.unwrap_or(self.default_cmd_func);
        for cmd in cmds {
            self.push(
                HandlerKey::Command {
                    cmd_func,
                    cmd: cmd.clone(),
                },
                handler.clone(),
            );
        }
    }

    pub fn on_unhandled<F>(&mut self, handler: F)
    where
        F: Fn(&C, &DecodedRecord) + Send + Sync + 'static,
    {
        self.push(HandlerKey::Unhandled, Arc::new(handler));
    }

    pub fn on_all<F>(&mut self, handler: F)
    where
        F: Fn(&C, &DecodedRecord) + Send + Sync + 'static,
    {
        self.push(HandlerKey::All, Arc::new(handler));
    }

    fn push(&mut self, key: HandlerKey, handler: Handler<C>) {
        self.handlers.entry(key).or_default().push(handler);
    }

    /// Run every matching handler. Returns whether a command handler or the
    /// unhandled fallback accepted the record.
    pub fn dispatch(&self, ctx: &C, record: &DecodedRecord) -> bool {
        let key = HandlerKey::Command {
            cmd_func: record.cmd_func.unwrap_or(self.default_cmd_func),
            cmd: record.cmd.clone(),
        };
        let matched = self
            .handlers
            .get(&key)
            .or_else(|| self.handlers.get(&HandlerKey::Unhandled));
        if let Some(handlers) = matched {
            for handler in handlers {
                handler(ctx, record);
            }
        }
        if let Some(handlers) = self.handlers.get(&HandlerKey::All) {
            for handler in handlers {
                handler(ctx, record);
            }
        }
        matched.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ecoflow::envelope::RecordPayload;

    #[derive(Default)]
    struct Calls(Mutex<Vec<&'static str>>);

    impl Calls {
        fn push(&self, name: &'static str) {
            self.0.lock().unwrap().push(name);
        }

        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn record(cmd_func: Option<u32>, cmd: Command) -> DecodedRecord {
        DecodedRecord {
            cmd_func,
            cmd,
            payload: RecordPayload::Raw(vec![]),
            header: None,
        }
    }

    #[test]
    fn test_registration_order_and_default_func() {
        let mut dispatcher = Dispatcher::<Calls>::new(20);
        dispatcher.on(&[Command::Id(1), Command::Id(134)], None, |c, _| c.push("first"));
        dispatcher.on(&[Command::Id(1)], None, |c, _| c.push("second"));
        dispatcher.on(&[Command::Id(32)], Some(254), |c, _| c.push("report"));

        let calls = Calls::default();
        assert!(dispatcher.dispatch(&calls, &record(Some(20), Command::Id(1))));
        assert_eq!(calls.take(), vec!["first", "second"]);

        assert!(dispatcher.dispatch(&calls, &record(Some(20), Command::Id(134))));
        assert_eq!(calls.take(), vec!["first"]);

        assert!(dispatcher.dispatch(&calls, &record(Some(254), Command::Id(32))));
        assert_eq!(calls.take(), vec!["report"]);

        // command 32 under the default function is a different key
        assert!(!dispatcher.dispatch(&calls, &record(Some(20), Command::Id(32))));
        assert!(calls.take().is_empty());
    }

    #[test]
    fn test_json_record_uses_default_func() {
        let mut dispatcher = Dispatcher::<Calls>::new(0);
        dispatcher.on(
            &[Command::Id(0), Command::Named("params".into())],
            None,
            |c, _| c.push("quota"),
        );
        let calls = Calls::default();
        assert!(dispatcher.dispatch(&calls, &record(None, Command::Named("params".into()))));
        assert!(dispatcher.dispatch(&calls, &record(None, Command::Id(0))));
        assert_eq!(calls.take(), vec!["quota", "quota"]);
    }

    #[test]
    fn test_unhandled_and_match_all() {
        let mut dispatcher = Dispatcher::<Calls>::new(20);
        dispatcher.on(&[Command::Id(1)], None, |c, _| c.push("heartbeat"));
        dispatcher.on_all(|c, _| c.push("all"));

        let calls = Calls::default();
        assert!(!dispatcher.dispatch(&calls, &record(Some(20), Command::Id(7))));
        assert_eq!(calls.take(), vec!["all"]);

        dispatcher.on_unhandled(|c, _| c.push("unhandled"));
        assert!(dispatcher.dispatch(&calls, &record(Some(20), Command::Id(7))));
        assert_eq!(calls.take(), vec!["unhandled", "all"]);

        assert!(dispatcher.dispatch(&calls, &record(Some(20), Command::Id(1))));
        assert_eq!(calls.take(), vec!["heartbeat", "all"]);
    }
}
