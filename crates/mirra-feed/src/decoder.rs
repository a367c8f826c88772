//! Byte-to-record transform for raw streaming change feeds.
//!
//! Upstream responses arrive split across network chunks at arbitrary
//! boundaries. The decoder works per newline-delimited unit: an
//! incomplete trailing fragment is buffered and prepended to the next
//! unit, so a record split across any number of chunks still decodes
//! exactly once.

use std::sync::LazyLock;

use regex::Regex;

use crate::feed::ChangeRecord;

/// Fixed extraction pattern for one change line.
static CHANGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""seq":(\d+),"id":"([^"]+)""#).unwrap());

/// Stateful newline-unit decoder with a buffered trailing fragment.
#[derive(Default)]
pub struct LineDecoder {
    legacy: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every record completed by it.
    ///
    /// Each newline-delimited unit is matched against the concatenation
    /// of the buffered fragment and the unit; a match emits a record and
    /// clears the fragment, a miss makes the unit the new fragment.
    pub fn push(&mut self, chunk: &str) -> Vec<ChangeRecord> {
        let mut records = Vec::new();
        for line in chunk.split('\n') {
            let candidate = format!("{}{}", self.legacy, line);
            if let Some(caps) = CHANGE_PATTERN.captures(&candidate) {
                records.push(ChangeRecord {
                    sequence: caps[1].to_string(),
                    fullname: caps[2].to_string(),
                });
                self.legacy.clear();
            } else {
                self.legacy = candidate;
            }
        }
        records
    }

    /// The currently buffered incomplete fragment, if any.
    pub fn pending(&self) -> &str {
        &self.legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"seq":362,"id":"@x/pkg","changes":[{"rev":"5-a"}]},"#;

    fn decode_in_chunks(line: &str, cuts: &[usize]) -> Vec<ChangeRecord> {
        let mut decoder = LineDecoder::new();
        let mut records = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            records.extend(decoder.push(&line[start..cut]));
            start = cut;
        }
        records.extend(decoder.push(&line[start..]));
        records.extend(decoder.push("\n"));
        records
    }

    #[test]
    fn test_whole_line_decodes_once() {
        let records = decode_in_chunks(LINE, &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, "362");
        assert_eq!(records[0].fullname, "@x/pkg");
    }

    #[test]
    fn test_two_chunk_split_decodes_once() {
        // Split inside the "id" value.
        let records = decode_in_chunks(LINE, &[15]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fullname, "@x/pkg");
    }

    #[test]
    fn test_five_chunk_split_decodes_once() {
        let records = decode_in_chunks(LINE, &[3, 9, 17, 30]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, "362");
        assert_eq!(records[0].fullname, "@x/pkg");
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let chunk = "{\"seq\":1,\"id\":\"a\"},\n{\"seq\":2,\"id\":\"b\"},\n";
        let mut decoder = LineDecoder::new();
        let records = decoder.push(chunk);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fullname, "a");
        assert_eq!(records[1].fullname, "b");
    }

    #[test]
    fn test_non_matching_noise_is_buffered_not_emitted() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push("{\"results\":[\n").is_empty());
        // The noise line stays pending until a real record flushes it.
        assert!(!decoder.pending().is_empty());
        let records = decoder.push("{\"seq\":7,\"id\":\"pkg\"},\n");
        assert_eq!(records.len(), 1);
        assert_eq!(decoder.pending(), "");
    }
}
