// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of entity-change events to subscribers.
//!
//! Each subscriber gets its own worker thread and channel: events are
//! delivered to one subscriber in publish order, but no ordering holds
//! across subscribers.  Publishing never blocks the mutator and delivery
//! failures never propagate to it; they are logged and dropped.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use bootforge_common::Error;
use serde::Serialize;
use slog::{warn, Logger};

/// One entity mutation, as seen by subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    /// "create", "save", or "delete".
    pub action: String,
    pub prefix: String,
    pub key: String,
    pub object: serde_json::Value,
}

/// A sink for entity-change events.
pub trait Publisher: Send {
    fn deliver(&mut self, event: &Event) -> Result<(), Error>;

    /// Called once after the last event, when the subscriber is removed.
    fn close(&mut self) {}
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    worker: thread::JoinHandle<()>,
}

pub struct Publishers {
    log: Logger,
    subs: Mutex<HashMap<String, Subscriber>>,
}

impl Publishers {
    pub fn new(log: Logger) -> Publishers {
        Publishers { log, subs: Mutex::new(HashMap::new()) }
    }

    /// Registers `publisher` under `name`, replacing any previous
    /// registration with that name.
    pub fn add(&self, name: &str, mut publisher: Box<dyn Publisher>) {
        let (tx, rx) = mpsc::channel::<Event>();
        let log = self.log.clone();
        let thread_name = name.to_string();
        let worker = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if let Err(e) = publisher.deliver(&event) {
                    warn!(log, "event delivery failed";
                        "publisher" => &thread_name,
                        "prefix" => &event.prefix,
                        "key" => &event.key,
                        "error" => %e);
                }
            }
            publisher.close();
        });
        let old = {
            let mut subs = self.subs.lock().unwrap();
            subs.insert(name.to_string(), Subscriber { tx, worker })
        };
        if let Some(old) = old {
            drop(old.tx);
            let _ = old.worker.join();
        }
    }

    /// Removes the subscriber registered under `name`, draining its queue
    /// before returning.
    pub fn remove(&self, name: &str) {
        let sub = {
            let mut subs = self.subs.lock().unwrap();
            subs.remove(name)
        };
        if let Some(sub) = sub {
            drop(sub.tx);
            let _ = sub.worker.join();
        }
    }

    /// Hands `event` to every current subscriber.
    pub fn publish(&self, event: Event) {
        let subs = self.subs.lock().unwrap();
        for sub in subs.values() {
            // A send only fails if the worker already exited; the
            // subscriber is on its way out, so the event is dropped.
            let _ = sub.tx.send(event.clone());
        }
    }

    /// Drains and joins every subscriber.
    pub fn shutdown(&self) {
        let all: Vec<String> =
            { self.subs.lock().unwrap().keys().cloned().collect() };
        for name in all {
            self.remove(&name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex as StdMutex};

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
        closed: Sender<()>,
    }

    impl Publisher for Recorder {
        fn deliver(&mut self, event: &Event) -> Result<(), Error> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{} {}/{}", event.action, event.prefix, event.key));
            Ok(())
        }

        fn close(&mut self) {
            let _ = self.closed.send(());
        }
    }

    fn event(action: &str, key: &str) -> Event {
        Event {
            action: action.to_string(),
            prefix: "machines".to_string(),
            key: key.to_string(),
            object: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_per_subscriber_ordering_and_close() {
        let pubs = Publishers::new(test_log());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (closed_tx, closed_rx) = mpsc::channel();
        pubs.add(
            "ws",
            Box::new(Recorder { seen: Arc::clone(&seen), closed: closed_tx }),
        );

        pubs.publish(event("create", "m1"));
        pubs.publish(event("save", "m1"));
        pubs.publish(event("delete", "m1"));

        // remove() drains the queue and runs close() before returning.
        pubs.remove("ws");
        closed_rx.recv().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["create machines/m1", "save machines/m1", "delete machines/m1"]
        );
    }

    struct Failing;
    impl Publisher for Failing {
        fn deliver(&mut self, _event: &Event) -> Result<(), Error> {
            Err(Error::backend("subscriber on fire"))
        }
    }

    #[test]
    fn test_delivery_errors_do_not_propagate() {
        let pubs = Publishers::new(test_log());
        pubs.add("bad", Box::new(Failing));
        pubs.publish(event("create", "m1"));
        pubs.shutdown();
    }
}
