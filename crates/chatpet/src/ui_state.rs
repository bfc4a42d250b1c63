use serde::{Deserialize, Serialize};
use std::fmt;

/// What the chat view should render
///
/// Exactly one variant is active at a time. A coordinator starts in `Idle`
/// and never goes back to it; `Success` and `Error` stay until the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value")]
pub enum UiState {
    #[default]
    Idle,
    Loading,
    Success(String),
    Error(String),
}

impl UiState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Success or Error
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error(_))
    }
}

impl fmt::Display for UiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "thinking..."),
            Self::Success(text) => write!(f, "{}", text),
            Self::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(UiState::default(), UiState::Idle);
    }

    #[test]
    fn test_predicates() {
        assert!(!UiState::Idle.is_loading());
        assert!(!UiState::Idle.is_terminal());
        assert!(UiState::Loading.is_loading());
        assert!(!UiState::Loading.is_terminal());
        assert!(UiState::Success("hi".to_string()).is_terminal());
        assert!(UiState::Error("boom".to_string()).is_terminal());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_string(&UiState::Success("Hello!".to_string())).unwrap();
        assert_eq!(json, r#"{"state":"Success","value":"Hello!"}"#);

        let json = serde_json::to_string(&UiState::Loading).unwrap();
        assert_eq!(json, r#"{"state":"Loading"}"#);

        let state: UiState =
            serde_json::from_str(r#"{"state":"Error","value":"LLM returned no result."}"#)
                .unwrap();
        assert_eq!(state, UiState::Error("LLM returned no result.".to_string()));
    }
}
