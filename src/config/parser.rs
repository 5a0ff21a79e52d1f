//! The line-oriented config file format (§6): global options, then
//! `remap_key=` rule blocks. Hand-written — the format has no relationship
//! to any structured serialization the rest of the ecosystem uses.

use std::rc::Rc;

use crate::catalog::KeyCatalog;
use crate::engine::EngineConfig;
use crate::error::CoreError;
use crate::layer::LayerManager;
use crate::ruleset::{Channel, KeySequence, Remap, RuleSet};

const MAX_LINE_LEN: usize = 255;

/// Global options carried alongside the compiled rule set. `rehook_timeout`
/// is consumed only by the hook adapter; the rest shape `EngineConfig`.
#[derive(Debug, Clone, Copy)]
pub struct GlobalOptions {
    pub debug: bool,
    pub hold_delay: u32,
    pub tap_timeout: u32,
    pub doublepress_timeout: u32,
    pub rehook_timeout: u32,
    pub unlock_timeout: u32,
    pub scancode: bool,
    pub priority: bool,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            debug: false,
            hold_delay: 0,
            tap_timeout: 0,
            doublepress_timeout: 0,
            rehook_timeout: 1000,
            unlock_timeout: 60_000,
            scancode: false,
            priority: true,
        }
    }
}

impl GlobalOptions {
    pub fn to_engine_config(self) -> EngineConfig {
        EngineConfig {
            hold_delay: self.hold_delay,
            tap_timeout: self.tap_timeout,
            doublepress_timeout: self.doublepress_timeout,
            unlock_timeout: self.unlock_timeout,
            scancode_mode: self.scancode,
        }
    }
}

pub struct ParsedConfig {
    pub options: GlobalOptions,
    pub ruleset: RuleSet,
    pub layers: LayerManager,
}

/// A channel as it accumulates across one or more `when_x=` lines within a
/// block, before being frozen into a `Channel`.
#[derive(Default)]
struct PendingChannel {
    keys: Vec<String>,
    layer: Option<String>,
}

impl PendingChannel {
    fn push(&mut self, value: &str, line: usize) -> Result<(), CoreError> {
        if let Some(layer_name) = layer_value(value) {
            if !self.keys.is_empty() {
                return Err(err(line, "channel mixes a key and a layer value"));
            }
            if self.layer.is_some() && self.layer.as_deref() != Some(layer_name) {
                return Err(err(line, "channel already bound to a different layer"));
            }
            self.layer = Some(layer_name.to_string());
        } else {
            if self.layer.is_some() {
                return Err(err(line, "channel mixes a layer and a key value"));
            }
            self.keys.push(value.to_string());
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.layer.is_none()
    }

    fn freeze(
        &self,
        catalog: &KeyCatalog,
        layers: &mut LayerManager,
        line: usize,
    ) -> Result<Channel, CoreError> {
        if let Some(name) = &self.layer {
            return Ok(Channel::Layer(layers.intern(name)));
        }
        if self.keys.is_empty() {
            return Ok(Channel::Empty);
        }
        let mut descriptors = Vec::with_capacity(self.keys.len());
        for name in &self.keys {
            let d = catalog
                .find(name)
                .ok_or_else(|| err(line, &format!("unknown key name '{name}'")))?;
            descriptors.push(d);
        }
        Ok(Channel::Keys(KeySequence::new(descriptors).expect("non-empty by construction")))
    }
}

#[derive(Default)]
struct PendingRule {
    from: Option<String>,
    gate_layer: Option<String>,
    when_alone: PendingChannel,
    with_other: PendingChannel,
    when_doublepress: PendingChannel,
    when_tap_lock: PendingChannel,
    when_double_tap_lock: PendingChannel,
    opened_at_line: usize,
}

impl PendingRule {
    fn has_any_channel(&self) -> bool {
        !(self.when_alone.is_empty()
            && self.with_other.is_empty()
            && self.when_doublepress.is_empty()
            && self.when_tap_lock.is_empty()
            && self.when_double_tap_lock.is_empty())
    }
}

fn err(line: usize, message: &str) -> CoreError {
    CoreError::ConfigParse {
        line,
        message: message.to_string(),
    }
}

/// Values beginning with the literal prefix `layer` reference a layer
/// rather than a key (§6).
fn layer_value(value: &str) -> Option<&str> {
    if value.starts_with("layer") {
        Some(value)
    } else {
        None
    }
}

pub fn parse(text: &str, catalog: &KeyCatalog) -> Result<ParsedConfig, CoreError> {
    let mut options = GlobalOptions::default();
    let mut layers = LayerManager::new();
    let mut ruleset = RuleSet::new();
    let mut pending: Option<PendingRule> = None;
    let mut next_id: u16 = 1;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE_LEN {
            return Err(err(line_no, "line exceeds 255 bytes"));
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(v) = bool_option(line, "debug=") {
            options.debug = v.ok_or_else(|| err(line_no, "debug must be 0 or 1"))?;
            continue;
        }
        if let Some(n) = int_option(line, "hold_delay=") {
            options.hold_delay = n;
            continue;
        }
        if let Some(n) = int_option(line, "tap_timeout=") {
            options.tap_timeout = n;
            continue;
        }
        if let Some(n) = int_option(line, "doublepress_timeout=") {
            options.doublepress_timeout = n;
            continue;
        }
        if let Some(n) = int_option(line, "rehook_timeout=") {
            options.rehook_timeout = n;
            continue;
        }
        if let Some(n) = int_option(line, "unlock_timeout=") {
            options.unlock_timeout = n;
            continue;
        }
        if let Some(v) = bool_option(line, "scancode=") {
            options.scancode = v.ok_or_else(|| err(line_no, "scancode must be 0 or 1"))?;
            continue;
        }
        if let Some(v) = bool_option(line, "priority=") {
            options.priority = v.ok_or_else(|| err(line_no, "priority must be 0 or 1"))?;
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| err(line_no, &format!("couldn't understand '{line}'")))?;

        if key == "remap_key" {
            finalize(&mut pending, &mut ruleset, &mut layers, catalog, &mut next_id)?;
            pending = Some(PendingRule {
                from: Some(value.to_string()),
                opened_at_line: line_no,
                ..Default::default()
            });
            continue;
        }

        let rule = pending
            .as_mut()
            .ok_or_else(|| err(line_no, "channel line before any 'remap_key='"))?;

        match key {
            "layer" => rule.gate_layer = Some(value.to_string()),
            "when_alone" => rule.when_alone.push(value, line_no)?,
            "with_other" => rule.with_other.push(value, line_no)?,
            "when_doublepress" => rule.when_doublepress.push(value, line_no)?,
            "when_tap_lock" => rule.when_tap_lock.push(value, line_no)?,
            "when_double_tap_lock" => rule.when_double_tap_lock.push(value, line_no)?,
            _ => return Err(err(line_no, &format!("unknown option '{key}'"))),
        }
    }

    finalize(&mut pending, &mut ruleset, &mut layers, catalog, &mut next_id)?;

    Ok(ParsedConfig {
        options,
        ruleset,
        layers,
    })
}

fn finalize(
    pending: &mut Option<PendingRule>,
    ruleset: &mut RuleSet,
    layers: &mut LayerManager,
    catalog: &KeyCatalog,
    next_id: &mut u16,
) -> Result<(), CoreError> {
    let Some(rule) = pending.take() else {
        return Ok(());
    };
    let line = rule.opened_at_line;
    let from_name = rule.from.as_deref().unwrap_or_default();
    let from = catalog
        .find(from_name)
        .ok_or_else(|| err(line, &format!("invalid key name '{from_name}'")))?;

    if !rule.has_any_channel() {
        return Err(err(line, "incomplete remapping: no output channel"));
    }

    let gate_layer = rule.gate_layer.as_ref().map(|n| layers.intern(n));
    let when_alone = rule.when_alone.freeze(catalog, layers, line)?;
    let with_other = rule.with_other.freeze(catalog, layers, line)?;
    let when_doublepress = rule.when_doublepress.freeze(catalog, layers, line)?;
    let when_tap_lock = rule.when_tap_lock.freeze(catalog, layers, line)?;
    let when_double_tap_lock = rule.when_double_tap_lock.freeze(catalog, layers, line)?;

    if *next_id > 255 {
        return Err(err(line, "exceeded the maximum limit of 255 remappings"));
    }
    let id = *next_id as u8;
    *next_id += 1;

    let remap = Remap::new(
        id,
        from,
        gate_layer,
        when_alone,
        with_other,
        when_doublepress,
        when_tap_lock,
        when_double_tap_lock,
    );
    ruleset.add(remap).map_err(|m| err(line, &m))?;
    Ok(())
}

fn int_option(line: &str, prefix: &str) -> Option<u32> {
    line.strip_prefix(prefix).and_then(|v| v.parse().ok())
}

/// Returns `Some(None)` when the prefix matched but the value wasn't a
/// legal 0/1, so the caller can report a range error instead of silently
/// skipping the line.
fn bool_option(line: &str, prefix: &str) -> Option<Option<bool>> {
    line.strip_prefix(prefix).map(|v| match v {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    })
}

pub fn build_catalog() -> Rc<KeyCatalog> {
    Rc::new(KeyCatalog::new())
}
