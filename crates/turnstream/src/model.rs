use std::fmt;

/// Stable identifier for a vendor adapter (for example `openai`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Model selection for a turn.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelRef {
    /// Adapter that owns the model.
    pub provider: ProviderId,
    /// Provider-specific model name (for example `gpt-5-nano`).
    pub model: String,
}

impl ModelRef {
    /// Creates a model reference.
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Generic turn behavior options.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TurnOptions {
    /// Bounded chunk buffer size used by the streaming channel.
    pub stream_buffer_capacity: usize,
    /// When true (default), chunk text accumulates into `TurnOutput::text`.
    pub accumulate_content: bool,
    /// Upper bound on tool round trips within one turn.
    pub max_tool_rounds: u32,
    /// When true (default), an unrecovered failure is also delivered
    /// in-band on the chunk channel before the final turn result.
    pub report_errors: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            stream_buffer_capacity: 128,
            accumulate_content: true,
            max_tool_rounds: 8,
            report_errors: true,
        }
    }
}

impl TurnOptions {
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn accumulate_content(mut self, accumulate: bool) -> Self {
        self.accumulate_content = accumulate;
        self
    }

    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn report_errors(mut self, report: bool) -> Self {
        self.report_errors = report;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_options_defaults() {
        let options = TurnOptions::default();
        assert_eq!(options.stream_buffer_capacity, 128);
        assert!(options.accumulate_content);
        assert_eq!(options.max_tool_rounds, 8);
    }

    #[test]
    fn provider_id_displays_raw_value() {
        assert_eq!(ProviderId::from("openai").to_string(), "openai");
    }
}
