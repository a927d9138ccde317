//! `EventSource` backed by a real HTTP stream
//!
//! Each open source gets a thread running a current-thread tokio runtime
//! that reads the response body with reqwest and feeds parsed events into a
//! channel. The runner's event loop drains the channels between jobs.

use boa_engine::JsObject;
use boa_gc::{Finalize, Trace};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    time::Duration,
};

/// Something that happened on a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceEvent {
    Open,
    Message { event: String, data: String, id: Option<String> },
    Error(String),
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
    data: Vec<String>,
    event: Option<String>,
    last_id: Option<String>,
}

impl SseParser {
    /// Feed a chunk and return every event it completed
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<SourceEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SourceEvent::Message {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                        id: self.last_id.clone(),
                    });
                }
                self.data.clear();
                self.event = None;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "id" => self.last_id = Some(value.to_string()),
                _ => {}
            }
        }
        events
    }
}

/// Receiving end of one background stream
pub(crate) struct StreamHandle {
    receiver: Receiver<SourceEvent>,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect to `url` on a background thread
pub(crate) fn spawn(url: String) -> StreamHandle {
    let (sender, receiver) = mpsc::channel();
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = sender.send(SourceEvent::Error(e.to_string()));
                return;
            }
        };
        runtime.block_on(stream(url, sender, flag));
    });
    StreamHandle { receiver, closed }
}

async fn stream(url: String, sender: Sender<SourceEvent>, closed: Arc<AtomicBool>) {
    let client = reqwest::Client::new();
    let response = client.get(&url).header("Accept", "text/event-stream").send().await;
    let mut response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let _ = sender.send(SourceEvent::Error(format!("{url} responded with {}", response.status())));
            return;
        }
        Err(e) => {
            let _ = sender.send(SourceEvent::Error(e.to_string()));
            return;
        }
    };
    tracing::debug!(url = %url, "event stream open");
    if sender.send(SourceEvent::Open).is_err() {
        return;
    }

    let mut parser = SseParser::default();
    while !closed.load(Ordering::Relaxed) {
        // Wake up regularly so a closed source stops its thread
        let chunk = match tokio::time::timeout(Duration::from_millis(100), response.chunk()).await {
            Err(_) => continue,
            Ok(chunk) => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                    if sender.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                let _ = sender.send(SourceEvent::Error(format!("{url} closed the stream")));
                return;
            }
            Err(e) => {
                let _ = sender.send(SourceEvent::Error(e.to_string()));
                return;
            }
        }
    }
    tracing::debug!(url = %url, "event stream closed by client");
}

/// Open sources of one runner and their JS targets
#[derive(Default, Trace, Finalize)]
pub(crate) struct EventSourceTable {
    targets: BTreeMap<u32, JsObject>,
    #[unsafe_ignore_trace]
    streams: BTreeMap<u32, StreamHandle>,
    next_id: u32,
}

impl EventSourceTable {
    pub(crate) fn open(&mut self, url: String, target: JsObject) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        tracing::debug!(id, url = %url, "opening event source");
        self.targets.insert(id, target);
        self.streams.insert(id, spawn(url));
        id
    }

    pub(crate) fn close(&mut self, id: u32) {
        self.targets.remove(&id);
        if let Some(stream) = self.streams.remove(&id) {
            stream.close();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Take every queued event; sources whose stream ended are dropped
    pub(crate) fn drain(&mut self) -> Vec<(JsObject, SourceEvent)> {
        let mut out = Vec::new();
        let mut finished = Vec::new();
        for (id, stream) in &self.streams {
            let Some(target) = self.targets.get(id) else {
                continue;
            };
            loop {
                match stream.receiver.try_recv() {
                    Ok(event) => {
                        let ended = matches!(event, SourceEvent::Error(_));
                        out.push((target.clone(), event));
                        if ended {
                            finished.push(*id);
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        finished.push(*id);
                        break;
                    }
                }
            }
        }
        for id in finished {
            self.close(id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_splits_events() {
        let mut parser = SseParser::default();
        assert!(parser.feed("data: hel").is_empty());
        let events = parser.feed("lo\n\n: comment\nevent: update\nid: 7\ndata: a\ndata: b\n\n");
        assert_eq!(
            events,
            vec![
                SourceEvent::Message {
                    event: "message".to_string(),
                    data: "hello".to_string(),
                    id: None
                },
                SourceEvent::Message {
                    event: "update".to_string(),
                    data: "a\nb".to_string(),
                    id: Some("7".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_parser_handles_crlf_and_empty_blocks() {
        let mut parser = SseParser::default();
        let events = parser.feed("\r\nretry: 10\r\n\r\ndata:x\r\n\r\n");
        assert_eq!(
            events,
            vec![SourceEvent::Message {
                event: "message".to_string(),
                data: "x".to_string(),
                id: None
            }]
        );
    }
}
