use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Last-written value of one operator-side control. Values are replaced
/// wholesale; a reader never sees a partially updated PID triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WidgetValue {
    Slider { values: Vec<f64> },
    Pid { p: f64, i: f64, d: f64 },
    Gesture { value: String },
}

/// Widget id -> last value. No history: a later write strictly
/// supersedes an earlier one for the same id, and there is no ordering
/// guarantee across different ids.
#[derive(Debug, Default)]
pub struct WidgetStore {
    values: RwLock<HashMap<String, WidgetValue>>,
}

impl WidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, widget_id: &str, value: WidgetValue) {
        self.values.write().insert(widget_id.to_string(), value);
    }

    pub fn get(&self, widget_id: &str) -> Option<WidgetValue> {
        self.values.read().get(widget_id).cloned()
    }
}
