// src/runtime/parser.rs
//! Parser capability consumed by execution units
//!
//! Concrete format parsers (OBJ, PCD, images) live outside this crate and
//! plug in through the [`Parser`] trait. Configuration is applied key by key
//! through [`Parser::apply_setting`], a typed match owned by each parser.

use crate::runtime::protocol::UnitMessage;
use crate::utils::errors::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Hooks a parser reports through while parsing
pub trait ParseSink {
    /// Re-post an intermediate result (mesh, material, image) verbatim
    fn intermediate(&mut self, message: UnitMessage);

    /// Textual progress, only surfaced when unit debug logging is on
    fn progress(&mut self, text: &str);
}

/// A format parser runnable inside an execution unit
pub trait Parser: Send {
    /// Enable parser-side logging
    fn set_logging(&mut self, _enabled: bool, _debug: bool) {}

    /// Apply one configuration entry.
    ///
    /// Returns `Ok(false)` when the parser has no such setting; the runner
    /// ignores those keys.
    fn apply_setting(&mut self, _key: &str, _value: &Value) -> Result<bool> {
        Ok(false)
    }

    /// Parse `input`, streaming intermediate results into `sink`.
    ///
    /// The returned value becomes the `data` of the `complete` message.
    fn parse(
        &mut self,
        input: &[u8],
        options: Option<&Value>,
        sink: &mut dyn ParseSink,
    ) -> Result<Value>;
}

/// Decode a setting value into the type the parser expects
pub fn setting_value<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| EngineError::InvalidSetting {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
