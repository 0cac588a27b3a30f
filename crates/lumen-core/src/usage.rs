//! Reduction of streamed completion fragments into final text and usage stats.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Abort,
    #[serde(other)]
    Other,
}

impl FinishReason {
    /// `stop` and `length` end the stream; anything after them is not read.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::Length)
    }
}

/// Usage block reported by the engine. Later blocks replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
    #[serde(default)]
    pub prefill_tokens_per_s: Option<f64>,
    #[serde(default)]
    pub decode_tokens_per_s: Option<f64>,
    #[serde(default)]
    pub prefill_time_ms: Option<f64>,
    #[serde(default)]
    pub decode_time_ms: Option<f64>,
}

impl UsageMetadata {
    pub fn tokens(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: Some(prompt),
            completion_tokens: Some(completion),
            ..Default::default()
        }
    }
}

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub usage: Option<UsageMetadata>,
}

impl Fragment {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_finish(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_rate: Option<f64>,
}

impl UsageStats {
    /// Throughput line, only when the engine gave (or let us derive) a rate.
    pub fn rates_line(&self) -> Option<String> {
        match (self.prefill_rate, self.decode_rate) {
            (None, None) => None,
            (Some(p), None) => Some(format!("prefill: {:.1} tok/s", p)),
            (None, Some(d)) => Some(format!("decode: {:.1} tok/s", d)),
            (Some(p), Some(d)) => Some(format!("prefill: {:.1} tok/s, decode: {:.1} tok/s", p, d)),
        }
    }
}

impl std::fmt::Display for UsageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (prompt) + {} (completion) = {} (total)",
            self.prompt_tokens, self.completion_tokens, self.total_tokens
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub final_text: String,
    pub usage: Option<UsageStats>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Running reducer over a fragment stream.
#[derive(Debug, Clone, Default)]
pub struct UsageAggregator {
    text: String,
    metadata: Option<UsageMetadata>,
    finish_reason: Option<FinishReason>,
    consumed: usize,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns `Flow::Stop` once a terminal marker was seen;
    /// fragments pushed after that are ignored.
    pub fn push(&mut self, fragment: Fragment) -> Flow {
        if self.is_finished() {
            return Flow::Stop;
        }
        self.consumed += 1;

        if let Some(delta) = fragment.delta.filter(|d| !d.is_empty()) {
            self.text.push_str(&delta);
        }
        if let Some(usage) = fragment.usage {
            self.metadata = Some(usage);
        }
        if let Some(reason) = fragment.finish_reason {
            let terminal = reason.is_terminal();
            self.finish_reason = Some(reason);
            if terminal {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    pub fn partial_text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.as_ref().is_some_and(FinishReason::is_terminal)
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Produce final text and usage. `elapsed` is the decode wall time, used only
    /// to derive a decode rate when the engine reported none.
    pub fn finalize(self, elapsed: Option<Duration>) -> Aggregate {
        let usage = self.metadata.as_ref().and_then(|m| derive_stats(m, elapsed));
        Aggregate {
            final_text: self.text,
            usage,
            finish_reason: self.finish_reason,
        }
    }
}

fn derive_stats(meta: &UsageMetadata, elapsed: Option<Duration>) -> Option<UsageStats> {
    let total = match (meta.total_tokens, meta.prompt_tokens, meta.completion_tokens) {
        (Some(total), _, _) => total,
        (None, None, None) => return None,
        (None, p, c) => p.unwrap_or(0).saturating_add(c.unwrap_or(0)),
    };

    let prefill_rate = meta
        .prefill_tokens_per_s
        .or_else(|| rate(meta.prompt_tokens, meta.prefill_time_ms.map(ms_to_secs)));

    let decode_secs = meta
        .decode_time_ms
        .map(ms_to_secs)
        .or_else(|| elapsed.map(|d| d.as_secs_f64()));
    let decode_rate = meta
        .decode_tokens_per_s
        .or_else(|| rate(meta.completion_tokens, decode_secs));

    Some(UsageStats {
        prompt_tokens: meta.prompt_tokens.unwrap_or(0),
        completion_tokens: meta.completion_tokens.unwrap_or(0),
        total_tokens: total,
        prefill_rate,
        decode_rate,
    })
}

fn ms_to_secs(ms: f64) -> f64 {
    ms / 1000.0
}

fn rate(tokens: Option<u32>, secs: Option<f64>) -> Option<f64> {
    match (tokens, secs) {
        (Some(tokens), Some(secs)) if secs > 0.0 => Some(tokens as f64 / secs),
        _ => None,
    }
}

/// Reduce a finite fragment sequence. Reading stops at the first terminal fragment.
pub fn aggregate<I>(fragments: I) -> Aggregate
where
    I: IntoIterator<Item = Fragment>,
{
    let mut aggregator = UsageAggregator::new();
    for fragment in fragments {
        if aggregator.push(fragment) == Flow::Stop {
            break;
        }
    }
    aggregator.finalize(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_total_from_prompt_plus_completion() {
        let result = aggregate(vec![
            Fragment::text("Hi"),
            Fragment::text(" there").with_usage(UsageMetadata::tokens(5, 2)),
            Fragment::finish(FinishReason::Stop),
        ]);

        assert_eq!(result.final_text, "Hi there");
        assert_eq!(result.usage.as_ref().map(|u| u.total_tokens), Some(7));
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_nothing_read_after_stop() {
        let head = vec![Fragment::text("done"), Fragment::finish(FinishReason::Stop)];
        let tail = std::iter::from_fn(|| -> Option<Fragment> {
            panic!("fragment after stop was read")
        });

        let result = aggregate(head.into_iter().chain(tail));
        assert_eq!(result.final_text, "done");
    }

    #[test]
    fn test_extra_after_length_is_ignored() {
        let mut agg = UsageAggregator::new();
        assert_eq!(agg.push(Fragment::text("abc")), Flow::Continue);
        assert_eq!(agg.push(Fragment::finish(FinishReason::Length)), Flow::Stop);
        assert_eq!(agg.push(Fragment::text("EXTRA")), Flow::Stop);
        assert_eq!(agg.consumed(), 2);
        assert_eq!(agg.finalize(None).final_text, "abc");
    }

    #[test]
    fn test_non_terminal_finish_keeps_reading() {
        let result = aggregate(vec![
            Fragment::text("a").with_finish(FinishReason::Abort),
            Fragment::text("b"),
        ]);
        assert_eq!(result.final_text, "ab");
    }

    #[test]
    fn test_last_metadata_wins() {
        let result = aggregate(vec![
            Fragment::text("x").with_usage(UsageMetadata::tokens(1, 1)),
            Fragment::text("y").with_usage(UsageMetadata {
                prompt_tokens: Some(3),
                completion_tokens: Some(2),
                total_tokens: Some(5),
                ..Default::default()
            }),
        ]);
        let usage = result.usage.unwrap();
        assert_eq!(usage.to_string(), "3 (prompt) + 2 (completion) = 5 (total)");
    }

    #[test]
    fn test_no_metadata_means_no_usage() {
        let result = aggregate(vec![Fragment::text("hello"), Fragment::text("")]);
        assert_eq!(result.final_text, "hello");
        assert!(result.usage.is_none());
    }

    #[test]
    fn test_rates_verbatim_or_derived_never_fabricated() {
        let verbatim = UsageMetadata {
            completion_tokens: Some(10),
            decode_tokens_per_s: Some(42.0),
            ..Default::default()
        };
        let stats = derive_stats(&verbatim, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(stats.decode_rate, Some(42.0));
        assert_eq!(stats.prefill_rate, None);

        let derived = UsageMetadata::tokens(4, 10);
        let stats = derive_stats(&derived, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(stats.decode_rate, Some(5.0));

        let stats = derive_stats(&derived, None).unwrap();
        assert_eq!(stats.decode_rate, None);
        assert!(stats.rates_line().is_none());

        let no_completion = UsageMetadata {
            prompt_tokens: Some(4),
            ..Default::default()
        };
        let stats = derive_stats(&no_completion, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(stats.decode_rate, None);
        assert_eq!(stats.total_tokens, 4);
    }

    #[test]
    fn test_huge_counts_saturate_total() {
        let stats = derive_stats(&UsageMetadata::tokens(u32::MAX, 7), None).unwrap();
        assert_eq!(stats.total_tokens, u32::MAX);
    }

    #[test]
    fn test_finish_reason_wire_names() {
        let f: Fragment = serde_json::from_str(r#"{"finish_reason":"length"}"#).unwrap();
        assert_eq!(f.finish_reason, Some(FinishReason::Length));
        let f: Fragment = serde_json::from_str(r#"{"finish_reason":"tool_calls"}"#).unwrap();
        assert_eq!(f.finish_reason, Some(FinishReason::Other));
    }
}
