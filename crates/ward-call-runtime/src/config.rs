use std::time::Duration;

pub const DEFAULT_RESPONSE_WINDOW_MS: u64 = 17_000;

/// Runtime knobs for call dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRuntimeConfig {
    /// How long recipients have to answer before pending attempts time out.
    pub response_window: Duration,
}

impl Default for CallRuntimeConfig {
    fn default() -> Self {
        Self {
            response_window: Duration::from_millis(DEFAULT_RESPONSE_WINDOW_MS),
        }
    }
}

impl CallRuntimeConfig {
    pub fn with_response_window_ms(response_window_ms: u64) -> Self {
        Self {
            response_window: Duration::from_millis(response_window_ms.max(1)),
        }
    }
}
