use crate::CellCoord;
#[cfg(feature = "debug")]
use serde_json::json;
#[cfg(feature = "debug")]
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "debug")]
static EVENTS: Mutex<Vec<serde_json::Value>> = Mutex::new(Vec::new());

#[allow(unused)]
pub(crate) fn debug_move(agent: u64, from: CellCoord, to: CellCoord) {
    #[cfg(feature = "debug")]
    EVENTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(json!({
            "type": "move",
            "agent": agent,
            "from": [from.row, from.col],
            "to": [to.row, to.col],
        }))
}

#[allow(unused)]
pub(crate) fn debug_reserve(agent: u64, cells: &[CellCoord]) {
    #[cfg(feature = "debug")]
    EVENTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(json!({
            "type": "reserve",
            "agent": agent,
            "cells": cells.iter().map(|c| [c.row, c.col]).collect::<Vec<_>>(),
        }))
}

/// Drains the recorded events as a JSON array.
#[cfg(feature = "debug")]
pub fn take_debug_events() -> serde_json::Value {
    json!(std::mem::take(
        &mut *EVENTS.lock().unwrap_or_else(PoisonError::into_inner)
    ))
}
