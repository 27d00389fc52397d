use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::Notify;

use crate::models::lab::Event;

/// One generation of events for a single lab operation.
///
/// Events are retained for the life of the operation so that any number of
/// readers, starting at any time, observe the identical sequence.
#[derive(Debug, Default)]
struct EventLog {
    state: Mutex<LogState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<Event>,
    closed: bool,
}

impl EventLog {
    fn put(&self, event: Event) {
        {
            let mut state = self.state.lock().expect("event log lock poisoned");
            if state.closed {
                return;
            }
            state.events.push(event);
        }
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.state.lock().expect("event log lock poisoned").closed = true;
        self.notify.notify_waiters();
    }

    /// Wait for the event at `index`, or `None` once the log is closed and
    /// drained.
    async fn get(&self, index: usize) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect("event log lock poisoned");
                if index < state.events.len() {
                    return Some(state.events[index].clone());
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Broadcast queue of progress events for a user's lab operations.
///
/// One writer (the user's monitor task), any number of readers. When a new
/// operation starts the queue is cleared: readers created before the clear
/// keep their reference to the old generation and read it to completion,
/// while new readers only see the new operation's events.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    current: Arc<Mutex<Arc<EventLog>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, event: Event) {
        self.log().put(event);
    }

    /// Close the current generation, ending all of its readers once they
    /// drain.
    pub fn close(&self) {
        self.log().close();
    }

    /// Start a new generation for a new operation.
    pub fn clear(&self) {
        let mut current = self.current.lock().expect("event queue lock poisoned");
        current.close();
        *current = Arc::new(EventLog::default());
    }

    /// Stream of events for the current generation.
    ///
    /// The stream ends after delivering a terminal event, or when the
    /// generation is closed and fully drained.
    pub fn stream(&self) -> impl Stream<Item = Event> + Send + 'static + use<> {
        let log = self.log();
        futures::stream::unfold((log, 0usize, false), |(log, index, done)| async move {
            if done {
                return None;
            }
            let event = log.get(index).await?;
            let done = event.done();
            Some((event, (log, index + 1, done)))
        })
    }

    fn log(&self) -> Arc<EventLog> {
        self.current.lock().expect("event queue lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use crate::models::lab::EventType;

    #[tokio::test]
    async fn test_all_readers_see_all_events() {
        let queue = EventQueue::new();
        queue.put(Event::info("one", 10));

        // A late reader still sees the full history.
        let early = queue.stream();
        queue.put(Event::info("two", 20));
        queue.put(Event::complete("done"));
        let late = queue.stream();

        let early: Vec<String> = early.map(|e| e.message).collect().await;
        let late: Vec<String> = late.map(|e| e.message).collect().await;
        assert_eq!(early, ["one", "two", "done"]);
        assert_eq!(late, early);
    }

    #[tokio::test]
    async fn test_stream_ends_after_one_terminal_event() {
        let queue = EventQueue::new();
        queue.put(Event::info("starting", 1));
        queue.put(Event::failed("spawn failed"));
        // Events pushed after a terminal event are not delivered.
        queue.put(Event::info("ignored", 99));
        queue.close();

        let events: Vec<Event> = queue.stream().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Failed);
    }

    #[tokio::test]
    async fn test_close_without_terminal_event_ends_stream() {
        let queue = EventQueue::new();
        queue.put(Event::info("deleting", 25));
        queue.put(Event::info("deleted", 100));
        queue.close();

        let events: Vec<Event> = queue.stream().collect().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_starts_new_generation() {
        let queue = EventQueue::new();
        queue.put(Event::info("old", 10));
        let old_reader = queue.stream();

        queue.clear();
        queue.put(Event::info("new", 10));
        queue.put(Event::complete("done"));

        // The old reader finishes the old generation; a new reader sees only
        // the new one.
        let old: Vec<String> = old_reader.map(|e| e.message).collect().await;
        assert_eq!(old, ["old"]);
        let new: Vec<String> = queue.stream().map(|e| e.message).collect().await;
        assert_eq!(new, ["new", "done"]);
    }

    #[tokio::test]
    async fn test_reader_blocks_until_event_arrives() {
        let queue = EventQueue::new();
        let mut stream = Box::pin(queue.stream());
        let writer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            writer.put(Event::complete("done"));
        });
        let event = stream.next().await.unwrap();
        assert_eq!(event.event_type, EventType::Complete);
        assert!(stream.next().await.is_none());
    }
}
