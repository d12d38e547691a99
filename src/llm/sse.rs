//! Server-sent events decoding for streamed model responses.

use super::{EventStream, StreamEvent};
use crate::{Error, Result};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Bytes may be split anywhere, including inside a
/// multi-byte character; only complete lines are interpreted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(ev) = self.on_line(line) {
                out.push(ev);
            }
        }
        out
    }

    /// Flush a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if let Some(ev) = self.on_line(&line) {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn on_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            | Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            | None => (line, ""),
        };
        match field {
            | "event" => self.event = Some(value.to_string()),
            | "data" => self.data.push(value.to_string()),
            | _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let ev = SseEvent { event: self.event.take(), data: self.data.join("\n") };
        self.data.clear();
        Some(ev)
    }
}

/// Turn a streaming HTTP body into decoded SSE events.
pub fn sse_events(resp: reqwest::Response) -> BoxStream<'static, Result<SseEvent>> {
    let bytes = resp.bytes_stream().boxed();
    stream::unfold(
        (bytes, SseDecoder::default(), VecDeque::new(), false),
        |(mut bytes, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(ev) = pending.pop_front() {
                    return Some((Ok(ev), (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    | Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    | Some(Err(e)) => {
                        done = true;
                        return Some((Err(Error::from(e)), (bytes, decoder, pending, done)));
                    }
                    | None => {
                        done = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .boxed()
}

/// Provider-specific mapping from SSE events to stream events.
pub trait SseTranslator: Send + 'static {
    fn on_event(&mut self, event: SseEvent) -> Result<Vec<StreamEvent>>;

    /// Called once the body ends. Fails if the response was cut short.
    fn finish(&mut self) -> Result<Vec<StreamEvent>>;
}

struct TranslateState<T> {
    source: BoxStream<'static, Result<SseEvent>>,
    translator: T,
    pending: VecDeque<Result<StreamEvent>>,
    done: bool,
}

/// Drive `translator` over an SSE stream. The first error ends the stream.
pub fn translate<T: SseTranslator>(source: BoxStream<'static, Result<SseEvent>>, translator: T) -> EventStream {
    let state = TranslateState { source, translator, pending: VecDeque::new(), done: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.pending.clear();
                    st.done = true;
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.source.next().await {
                | Some(Ok(ev)) => match st.translator.on_event(ev) {
                    | Ok(events) => st.pending.extend(events.into_iter().map(Ok)),
                    | Err(e) => st.pending.push_back(Err(e)),
                },
                | Some(Err(e)) => st.pending.push_back(Err(e)),
                | None => {
                    st.done = true;
                    match st.translator.finish() {
                        | Ok(events) => st.pending.extend(events.into_iter().map(Ok)),
                        | Err(e) => st.pending.push_back(Err(e)),
                    }
                }
            }
        }
    })
    .boxed()
}
