//! Config loading: read the bespoke text format from disk, compile it into
//! the engine's runtime pieces.

mod parser;

pub use parser::{GlobalOptions, ParsedConfig};

use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;

use crate::catalog::KeyCatalog;
use crate::error::CoreError;

/// Parse `text` against a fresh `KeyCatalog`.
pub fn parse_str(text: &str) -> Result<(ParsedConfig, Rc<KeyCatalog>), CoreError> {
    let catalog = Rc::new(KeyCatalog::new());
    let parsed = parser::parse(text, &catalog)?;
    Ok((parsed, catalog))
}

/// Read and parse the config file at `path`.
pub fn load(path: &Path) -> anyhow::Result<(ParsedConfig, Rc<KeyCatalog>)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("couldn't read config file {}", path.display()))?;
    let (parsed, catalog) = parse_str(&text)
        .with_context(|| format!("couldn't parse config file {}", path.display()))?;
    Ok((parsed, catalog))
}

/// The default config path: `$XDG_CONFIG_HOME/keyremapd/config.txt`, falling
/// back to `~/.config/keyremapd/config.txt`.
pub fn default_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("keyremapd").join("config.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_channel_line_before_remap_key() {
        let err = parse_str("when_alone=KC_A\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse { line: 1, .. }));
    }

    #[test]
    fn rejects_incomplete_remapping() {
        let err = parse_str("remap_key=KC_CAPS\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse { .. }));
    }

    #[test]
    fn rejects_unknown_key_name() {
        let err = parse_str("remap_key=KC_NOPE\nwhen_alone=KC_ESC\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse { .. }));
    }

    #[test]
    fn parses_a_minimal_rule() {
        let cfg = "remap_key=KC_CAPS\nwhen_alone=KC_ESC\nwith_other=KC_LCTL\n";
        let (parsed, _cat) = parse_str(cfg).unwrap();
        assert_eq!(parsed.ruleset.len(), 1);
    }

    #[test]
    fn parses_layer_gate_and_channel() {
        let cfg = concat!(
            "remap_key=KC_CAPS\n",
            "when_alone=KC_ESC\n",
            "with_other=layer_nav\n",
            "remap_key=KC_H\n",
            "layer=layer_nav\n",
            "when_alone=KC_LEFT\n",
        );
        let (parsed, _cat) = parse_str(cfg).unwrap();
        assert_eq!(parsed.ruleset.len(), 2);
        assert_eq!(parsed.layers.name(crate::layer::LayerId(0)), "layer_nav");
    }

    #[test]
    fn global_options_parse_before_any_block() {
        let cfg = "tap_timeout=150\ndebug=1\nremap_key=KC_CAPS\nwhen_alone=KC_ESC\n";
        let (parsed, _cat) = parse_str(cfg).unwrap();
        assert_eq!(parsed.options.tap_timeout, 150);
        assert!(parsed.options.debug);
    }

    #[test]
    fn multiline_chord_appends_keys() {
        let cfg = concat!(
            "remap_key=KC_CAPS\n",
            "when_alone=KC_ESC\n",
            "with_other=KC_LCTL\n",
            "with_other=KC_LSFT\n",
        );
        let (parsed, _cat) = parse_str(cfg).unwrap();
        let r = parsed.ruleset.get(0);
        assert_eq!(r.with_other.as_keys().unwrap().down_order().count(), 2);
    }

    #[test]
    fn rejects_duplicate_rule_pair() {
        let cfg = concat!(
            "remap_key=KC_CAPS\nwhen_alone=KC_ESC\n",
            "remap_key=KC_CAPS\nwhen_alone=KC_TAB\n",
        );
        assert!(parse_str(cfg).is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = "# a comment\n\nremap_key=KC_CAPS\n# another\nwhen_alone=KC_ESC\n";
        let (parsed, _cat) = parse_str(cfg).unwrap();
        assert_eq!(parsed.ruleset.len(), 1);
    }

    #[test]
    fn rejects_oversized_line() {
        let long_value = "x".repeat(300);
        let cfg = format!("remap_key={long_value}\n");
        let err = parse_str(&cfg).unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse { line: 1, .. }));
    }
}
