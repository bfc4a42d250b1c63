use anyhow::{anyhow, Result};
use std::io::Write;
use tokio::sync::watch;

use crate::ui_state::UiState;

/// Wait until the coordinator publishes Success or Error
pub async fn next_terminal_state(states: &mut watch::Receiver<UiState>) -> Result<UiState> {
    let state = states
        .wait_for(|state| state.is_terminal())
        .await
        .map_err(|_| anyhow!("coordinator went away"))?;
    Ok(state.clone())
}

/// Render states of an admitted request as they are published, ending with its terminal state
pub async fn observe_request(
    states: &mut watch::Receiver<UiState>,
    out: &mut impl Write,
) -> Result<UiState> {
    let current = states.borrow_and_update().clone();
    render(&current, out)?;
    if current.is_terminal() {
        return Ok(current);
    }
    let state = next_terminal_state(states).await?;
    render(&state, out)?;
    Ok(state)
}

pub fn render(state: &UiState, out: &mut impl Write) -> std::io::Result<()> {
    match state {
        UiState::Idle => Ok(()),
        UiState::Loading => {
            writeln!(out, "pet> {}", state)?;
            out.flush()
        }
        UiState::Success(_) | UiState::Error(_) => {
            writeln!(out, "pet> {}", state)?;
            writeln!(out)?;
            out.flush()
        }
    }
}
