//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes are buffered until a full line is available, so a record (or a
//! multi-byte character) split across network chunks is completed by the
//! next chunk.

/// One dispatched server-sent event block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseRecord {
    /// Value of the `event:` line, if any
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

impl SseRecord {
    /// Name used when logging this record.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every record it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(record) = self.process_line(line) {
                records.push(record);
            }
        }
        records
    }

    /// Flush at end of stream: a final unterminated line and any record
    /// still missing its blank-line terminator.
    pub fn finish(&mut self) -> Option<SseRecord> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(record) = self.process_line(line) {
                return Some(record);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseRecord> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseRecord> {
        if self.event.is_none() && self.data.is_empty() {
            self.id = None;
            return None;
        }
        let record = SseRecord {
            event: self.event.take().filter(|name| !name.is_empty()),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_complete_records() {
        let mut decoder = SseDecoder::new();
        let records = decoder.push(
            b"event: message\ndata: {\"a\":1}\n\n: keep-alive\n\nevent: log\nid: 7\ndata: one\ndata: two\n\n",
        );
        assert_eq!(
            records,
            vec![
                SseRecord {
                    event: Some("message".to_string()),
                    data: "{\"a\":1}".to_string(),
                    id: None,
                },
                SseRecord {
                    event: Some("log".to_string()),
                    data: "one\ntwo".to_string(),
                    id: Some("7".to_string()),
                },
            ]
        );
    }

    #[test]
    fn test_record_split_at_every_byte() {
        let body = "event: final_response\r\ndata: {\"content\":\"Net sales: 120 €\"}\r\n\r\n";
        let mut decoder = SseDecoder::new();
        let mut records = Vec::new();
        for byte in body.as_bytes() {
            records.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), "final_response");
        assert_eq!(records[0].data, "{\"content\":\"Net sales: 120 €\"}");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_partial_record_waits_for_next_chunk() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: log\ndata: {\"disp").is_empty());
        let records = decoder.push(b"lay\":\"x\"}\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "{\"display\":\"x\"}");
    }

    #[test]
    fn test_finish_flushes_unterminated_record() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"message\"}").is_empty());
        let record = decoder.finish().unwrap();
        assert_eq!(record.event, None);
        assert_eq!(record.name(), "message");
        assert_eq!(record.data, "{\"type\":\"message\"}");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_blank_lines_and_comments_alone_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\n: ping\n\nid: 3\n\n").is_empty());
        let records = decoder.push(b"data:no-space\n\n");
        assert_eq!(records[0].data, "no-space");
        assert_eq!(records[0].id, None);
    }
}
