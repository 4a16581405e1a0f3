//! Compilation options

use serde::{Deserialize, Serialize};

/// Compilation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Name of the program entry function
    pub entry_point: String,
    /// Run the IR optimizer after lowering
    pub optimize: bool,
    pub emit_unused_warnings: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            entry_point: "main".to_string(),
            optimize: true,
            emit_unused_warnings: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options: Options = serde_json::from_value(json!({ "entry_point": "start" })).unwrap();
        assert_eq!(options.entry_point, "start");
        assert!(options.optimize);
        assert!(options.emit_unused_warnings);
    }
}
