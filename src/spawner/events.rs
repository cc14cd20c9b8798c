// ABOUTME: Decodes the worker's newline-delimited JSON event stream.
// ABOUTME: Buffers partial lines across reads and tallies usage from assistant turns.

use serde_json::Value;
use tracing::trace;

use crate::model::AntUsage;

/// One decoded event from a worker's standard output.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// One assistant turn.
    Assistant {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    },
    /// The final summary event.
    Result {
        text: String,
        total_cost: Option<f64>,
        turns: Option<u32>,
        is_error: bool,
    },
    /// Any other event type, by name.
    Other(String),
}

impl WorkerEvent {
    /// Decode one line. Returns `None` for anything that is not a JSON
    /// object with a `type` field.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let kind = value.get("type")?.as_str()?;
        let event = match kind {
            "assistant" => {
                let message = value.get("message").unwrap_or(&Value::Null);
                let usage = message.get("usage").unwrap_or(&Value::Null);
                WorkerEvent::Assistant {
                    text: text_blocks(message.get("content")),
                    input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                    cost: message
                        .get("cost_usd")
                        .or_else(|| value.get("cost_usd"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                }
            }
            "result" => WorkerEvent::Result {
                text: value
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                total_cost: value.get("total_cost_usd").and_then(Value::as_f64),
                turns: value
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32),
                is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            },
            other => WorkerEvent::Other(other.to_string()),
        };
        Some(event)
    }
}

fn text_blocks(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Splits a byte stream into lines, holding an incomplete tail until the
/// next chunk arrives.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns events for every line it completed.
    /// Unparsable lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<WorkerEvent> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<WorkerEvent> {
    let text = String::from_utf8_lossy(line);
    if text.trim().is_empty() {
        return None;
    }
    let event = WorkerEvent::parse(&text);
    if event.is_none() {
        trace!(line = %text, "Dropping undecodable worker line");
    }
    event
}

/// Usage and text accumulated over one run.
#[derive(Debug, Clone, Default)]
pub struct RunTally {
    pub usage: AntUsage,
    /// Assistant text in arrival order.
    pub messages: Vec<String>,
    pub result: Option<String>,
    pub is_error: bool,
}

impl RunTally {
    pub fn apply(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Assistant {
                text,
                input_tokens,
                output_tokens,
                cost,
            } => {
                self.usage.input_tokens += input_tokens;
                self.usage.output_tokens += output_tokens;
                self.usage.cost += cost;
                self.usage.turns += 1;
                if !text.is_empty() {
                    self.messages.push(text.clone());
                }
            }
            WorkerEvent::Result {
                text,
                total_cost,
                turns,
                is_error,
            } => {
                if let Some(total) = total_cost {
                    self.usage.cost = *total;
                }
                if let Some(turns) = turns {
                    self.usage.turns = *turns;
                }
                self.is_error = *is_error;
                if !text.is_empty() {
                    self.result = Some(text.clone());
                }
            }
            WorkerEvent::Other(_) => {}
        }
    }

    /// The final report: the result text, or the assistant messages joined.
    pub fn report(&self) -> String {
        match &self.result {
            Some(result) => result.clone(),
            None => self.messages.join("\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSISTANT: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"looking"},{"type":"tool_use","name":"Read"}],"usage":{"input_tokens":120,"output_tokens":30}}}"#;
    const RESULT: &str = r###"{"type":"result","subtype":"success","is_error":false,"result":"## Discoveries\n- x","total_cost_usd":0.25,"num_turns":4}"###;

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut decoder = EventDecoder::new();
        let (head, tail) = ASSISTANT.split_at(40);
        assert!(decoder.push(head.as_bytes()).is_empty());

        let events = decoder.push(format!("{}\n{}", tail, &RESULT[..10]).as_bytes());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Assistant { text, input_tokens: 120, .. } if text == "looking"));

        let events = decoder.push(format!("{}\n", &RESULT[10..]).as_bytes());
        assert!(matches!(&events[0], WorkerEvent::Result { total_cost: Some(c), .. } if *c == 0.25));
    }

    #[test]
    fn test_garbage_lines_are_dropped() {
        let mut decoder = EventDecoder::new();
        let events = decoder.push(b"not json\n{\"no_type\":1}\n\n{\"type\":\"system\"}\n");
        assert_eq!(events, vec![WorkerEvent::Other("system".into())]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = EventDecoder::new();
        assert!(decoder.push(RESULT.as_bytes()).is_empty());
        assert!(matches!(decoder.finish(), Some(WorkerEvent::Result { .. })));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_tally_accumulates_and_result_wins() {
        let mut tally = RunTally::default();
        let turn = WorkerEvent::parse(ASSISTANT).unwrap();
        tally.apply(&turn);
        tally.apply(&turn);
        assert_eq!(tally.usage.input_tokens, 240);
        assert_eq!(tally.usage.turns, 2);
        assert_eq!(tally.report(), "looking\n\nlooking");

        tally.apply(&WorkerEvent::parse(RESULT).unwrap());
        assert_eq!(tally.usage.cost, 0.25);
        assert_eq!(tally.usage.turns, 4);
        assert_eq!(tally.report(), "## Discoveries\n- x");
    }
}
