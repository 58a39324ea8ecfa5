//! Accumulates streamed LLM text into TTS-ready utterances.
//!
//! TTS engines produce much better prosody on whole clauses than on raw
//! token fragments, so the assembler buffers text chunks and emits one
//! `speak.frame` per completed clause. Sentence punctuation always splits;
//! clause punctuation splits once the buffer is long enough to be worth
//! speaking early.

use crate::config::SentenceAssemblerConfig;
use crate::error::Result;
use crate::frame::{Frame, FramePayload, SpeakText};
use crate::processor::{LifecycleEvent, Outputs, Processor, ProcessorSpec, port};

/// Find sentence-ending punctuation (`.`, `!`, `?`, `\n`) followed by a
/// space, newline, or end of text. Returns the byte index of the boundary
/// character.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Find a split point for streaming speech.
///
/// Sentence boundaries always win. Once the buffer reaches `min_clause_len`,
/// the *last* clause punctuation mark (`,` `;` `:` `—` `–`) followed by a
/// space also splits, so the longest available chunk is spoken rather than
/// splitting too early. Returns the last byte of the boundary character so
/// `text[..=pos]` and `text[pos + 1..]` both land on char boundaries.
fn find_clause_boundary(text: &str, min_clause_len: usize) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }

    if text.len() < min_clause_len {
        return None;
    }

    let mut last_clause: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last_clause = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last_clause
}

/// Turns streamed LLM text into per-clause `speak.frame`s.
pub struct SentenceAssembler {
    min_clause_len: usize,
    buffer: String,
}

impl SentenceAssembler {
    pub fn new(config: SentenceAssemblerConfig) -> Self {
        Self {
            min_clause_len: config.min_clause_len,
            buffer: String::new(),
        }
    }

    /// Drain completed clauses from the buffer into speak frames.
    fn drain_clauses(&mut self, outputs: &mut Outputs) {
        while let Some(pos) = find_clause_boundary(&self.buffer, self.min_clause_len) {
            let sentence = self.buffer[..=pos].trim().to_owned();
            if !sentence.is_empty() {
                outputs.emit(
                    port::OUT,
                    Frame::new(FramePayload::Speak(SpeakText::new(sentence))),
                );
            }
            self.buffer = self.buffer[pos + 1..].to_owned();
        }
    }

    /// Flush whatever remains in the buffer as a final utterance.
    fn flush(&mut self, outputs: &mut Outputs) {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if !remaining.is_empty() {
            outputs.emit(
                port::OUT,
                Frame::new(FramePayload::Speak(SpeakText::new(remaining))),
            );
        }
    }
}

impl Processor for SentenceAssembler {
    fn describe(&self) -> ProcessorSpec {
        ProcessorSpec {
            name: "sentence-assembler",
            ins: &[port::IN, port::SYS_IN],
            outs: &[port::OUT],
        }
    }

    fn transition(&mut self, _event: LifecycleEvent) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, _port: &str, frame: Frame) -> Result<Outputs> {
        match frame.payload {
            FramePayload::LlmFullResponseStart => {
                self.buffer.clear();
                Ok(Outputs::none())
            }
            FramePayload::LlmTextChunk(text) => {
                self.buffer.push_str(&text);
                let mut outputs = Outputs::none();
                self.drain_clauses(&mut outputs);
                Ok(outputs)
            }
            FramePayload::LlmFullResponseEnd => {
                let mut outputs = Outputs::none();
                self.flush(&mut outputs);
                Ok(outputs)
            }
            FramePayload::ControlInterruptStart => {
                // Barge-in: drop the partial sentence, let the frame flow on.
                self.buffer.clear();
                Ok(Outputs::single(port::OUT, frame))
            }
            _ => Ok(Outputs::single(port::OUT, frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speak_texts(outputs: Outputs) -> Vec<String> {
        outputs
            .into_vec()
            .into_iter()
            .filter_map(|(_, f)| match f.payload {
                FramePayload::Speak(s) => Some(s.text),
                _ => None,
            })
            .collect()
    }

    fn feed(a: &mut SentenceAssembler, payload: FramePayload) -> Vec<String> {
        speak_texts(a.transform(port::IN, Frame::new(payload)).unwrap())
    }

    #[test]
    fn sentence_boundary_always_splits() {
        assert_eq!(find_sentence_boundary("Hi. There"), Some(2));
        assert_eq!(find_sentence_boundary("Hi"), None);
        // Decimal points are not boundaries.
        assert_eq!(find_sentence_boundary("pi is 3.14 ok"), None);
    }

    #[test]
    fn clause_split_waits_for_minimum_length() {
        assert_eq!(find_clause_boundary("a, b", 20), None);
        let long = "well, that is quite a long clause";
        assert_eq!(find_clause_boundary(long, 20), Some(4));
    }

    #[test]
    fn streamed_text_becomes_sentences() {
        let mut a = SentenceAssembler::new(SentenceAssemblerConfig::default());
        feed(&mut a, FramePayload::LlmFullResponseStart);
        assert!(feed(&mut a, FramePayload::LlmTextChunk("Hello th".into())).is_empty());
        let spoken = feed(&mut a, FramePayload::LlmTextChunk("ere. How ar".into()));
        assert_eq!(spoken, vec!["Hello there."]);
        let spoken = feed(&mut a, FramePayload::LlmTextChunk("e you tod".into()));
        assert!(spoken.is_empty());
        let spoken = feed(&mut a, FramePayload::LlmFullResponseEnd);
        assert_eq!(spoken, vec!["How are you tod"]);
    }

    #[test]
    fn interrupt_discards_the_partial_sentence() {
        let mut a = SentenceAssembler::new(SentenceAssemblerConfig::default());
        feed(&mut a, FramePayload::LlmFullResponseStart);
        feed(&mut a, FramePayload::LlmTextChunk("Half a sent".into()));
        feed(&mut a, FramePayload::ControlInterruptStart);
        assert!(feed(&mut a, FramePayload::LlmFullResponseEnd).is_empty());
    }

    #[test]
    fn whitespace_only_remainder_is_not_spoken() {
        let mut a = SentenceAssembler::new(SentenceAssemblerConfig::default());
        feed(&mut a, FramePayload::LlmFullResponseStart);
        feed(&mut a, FramePayload::LlmTextChunk("Done. ".into()));
        assert!(feed(&mut a, FramePayload::LlmFullResponseEnd).is_empty());
    }
}
