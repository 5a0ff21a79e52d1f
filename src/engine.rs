//! The per-rule finite state machines plus the cross-rule coordinator.
//! Consumes normalized input events, produces ordered synthetic outputs and
//! a block/pass decision. Single-threaded, no suspension points: every
//! method here runs straight through on the hook-callback thread.

use std::rc::Rc;

use crate::catalog::{KeyCatalog, KeyDescriptor};
use crate::injection::{InjectionTagger, Provenance};
use crate::layer::LayerManager;
use crate::ruleset::{Channel, RemapState, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

/// A hook-normalized inbound event.
#[derive(Debug, Clone, Copy)]
pub struct InputEvent {
    pub scan_code: u16,
    pub virtual_code: u16,
    pub direction: Direction,
    pub time_ms: u32,
    pub is_injected: bool,
    pub extra_info: u32,
}

/// One event the engine wants written back to the OS input stream.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticEvent {
    pub descriptor: KeyDescriptor,
    pub direction: Direction,
    pub rule_id: u8,
}

pub struct HandleResult {
    pub block: bool,
    pub outputs: Vec<SyntheticEvent>,
}

/// Timeouts and global options that shape engine behavior (§6). `rehook_timeout`
/// lives with the hook adapter, not here: it governs OS hook re-registration,
/// not any FSM transition.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub hold_delay: u32,
    pub tap_timeout: u32,
    pub doublepress_timeout: u32,
    pub unlock_timeout: u32,
    pub scancode_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_delay: 0,
            tap_timeout: 200,
            doublepress_timeout: 0,
            unlock_timeout: 0,
            scancode_mode: false,
        }
    }
}

pub struct StateEngine {
    pub ruleset: RuleSet,
    pub layers: LayerManager,
    catalog: Rc<KeyCatalog>,
    config: EngineConfig,
    active: Vec<usize>,
    last_input_time: u32,
}

impl StateEngine {
    pub fn new(
        ruleset: RuleSet,
        layers: LayerManager,
        catalog: Rc<KeyCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ruleset,
            layers,
            catalog,
            config,
            active: Vec::new(),
            last_input_time: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Entry point (§4.4): run the idle-unlock sweep, then dispatch.
    pub fn handle(&mut self, event: InputEvent) -> HandleResult {
        let mut outputs = Vec::new();

        if self.config.unlock_timeout > 0
            && event.time_ms.wrapping_sub(self.last_input_time) > self.config.unlock_timeout
        {
            self.unlock_all(&mut outputs);
        }
        self.last_input_time = event.time_ms;

        match InjectionTagger::decode(event.is_injected, event.extra_info) {
            Provenance::ForeignInjected
            | Provenance::SelfPassthrough
            | Provenance::SelfInjected(_) => {
                return HandleResult {
                    block: false,
                    outputs,
                };
            }
            Provenance::Genuine => {}
        }

        if let Some(idx) = self.ruleset.lookup(event.virtual_code, &self.layers) {
            match event.direction {
                Direction::Down => self.handle_down(idx, event.time_ms, &mut outputs),
                Direction::Up => self.handle_up(idx, event.time_ms, &mut outputs),
            }
            HandleResult {
                block: true,
                outputs,
            }
        } else {
            let block = self.handle_other_input(event, &mut outputs);
            HandleResult { block, outputs }
        }
    }

    fn emit_down(&self, ch: &Channel, rule_id: u8, out: &mut Vec<SyntheticEvent>) {
        if let Some(seq) = ch.as_keys() {
            for k in seq.down_order() {
                out.push(SyntheticEvent {
                    descriptor: self.resolve(*k),
                    direction: Direction::Down,
                    rule_id,
                });
            }
        }
    }

    fn emit_up(&self, ch: &Channel, rule_id: u8, out: &mut Vec<SyntheticEvent>) {
        if let Some(seq) = ch.as_keys() {
            for k in seq.up_order() {
                out.push(SyntheticEvent {
                    descriptor: self.resolve(*k),
                    direction: Direction::Up,
                    rule_id,
                });
            }
        }
    }

    /// Apply `scancode_mode` (§6): when set, synthesized events carry only a
    /// scan code, with `virtual_code` zeroed.
    fn resolve(&self, d: KeyDescriptor) -> KeyDescriptor {
        if self.config.scancode_mode {
            KeyDescriptor {
                virtual_code: 0,
                ..d
            }
        } else {
            d
        }
    }

    fn activate_if_layer(&mut self, ch: &Channel) {
        if let Some(l) = ch.as_layer() {
            self.layers.set_active(l, true);
        }
    }

    /// Idempotent append: a rule already present keeps its current position
    /// (open question §9.3; matches the source's duplicate-scanning append).
    fn active_add(&mut self, idx: usize) {
        if !self.active.contains(&idx) {
            self.active.push(idx);
        }
    }

    fn active_remove(&mut self, idx: usize) {
        if let Some(pos) = self.active.iter().position(|&i| i == idx) {
            self.active.remove(pos);
        }
    }

    // ---- 4.4.1 Remapped key Down ----

    fn handle_down(&mut self, idx: usize, t: u32, out: &mut Vec<SyntheticEvent>) {
        let rid = self.ruleset.get(idx).id;
        let state = self.ruleset.get(idx).state;
        match state {
            RemapState::Idle => {
                if self.ruleset.get(idx).has_with_other() {
                    let with_other = self.ruleset.get(idx).with_other.clone();
                    self.activate_if_layer(&with_other);
                    let r = self.ruleset.get_mut(idx);
                    r.last_transition_time = t;
                    r.state = RemapState::HeldAlone;
                    self.active_add(idx);
                } else {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_down(&when_alone, rid, out);
                    self.activate_if_layer(&when_alone);
                    let r = self.ruleset.get_mut(idx);
                    r.last_transition_time = t;
                    r.state = RemapState::Tap;
                    self.active_add(idx);
                }
            }
            RemapState::HeldWithOther => {
                let with_other = self.ruleset.get(idx).with_other.clone();
                self.emit_down(&with_other, rid, out);
            }
            RemapState::Tap => {
                let when_alone = self.ruleset.get(idx).when_alone.clone();
                self.emit_down(&when_alone, rid, out);
            }
            RemapState::Tapped => {
                let r_time = self.ruleset.get(idx).last_transition_time;
                let dp_timeout = self.config.doublepress_timeout;
                if dp_timeout > 0 && t.wrapping_sub(r_time) < dp_timeout {
                    self.tapped_to_doubletap(idx, t, out);
                } else {
                    self.ruleset.get_mut(idx).state = RemapState::Idle;
                    self.handle_down(idx, t, out);
                }
            }
            RemapState::DoubleTap => {
                self.reemit_doublepress(idx, rid, out);
            }
        }
    }

    fn tapped_to_doubletap(&mut self, idx: usize, t: u32, out: &mut Vec<SyntheticEvent>) {
        let rid = self.ruleset.get(idx).id;

        let tap_lock_ch = self.ruleset.get(idx).when_tap_lock.clone();
        match &tap_lock_ch {
            Channel::Keys(_) => {
                let r = self.ruleset.get_mut(idx);
                r.tap_lock = !r.tap_lock;
                if !r.tap_lock {
                    self.emit_up(&tap_lock_ch, rid, out);
                }
            }
            Channel::Layer(l) => {
                self.layers.toggle_lock(*l);
            }
            Channel::Empty => {}
        }

        let dp_ch = self.ruleset.get(idx).when_doublepress.clone();
        self.activate_if_layer(&dp_ch);

        {
            let r = self.ruleset.get_mut(idx);
            r.last_transition_time = t;
            r.state = RemapState::DoubleTap;
        }
        self.active_add(idx);

        if dp_ch.is_empty() {
            let when_alone = self.ruleset.get(idx).when_alone.clone();
            self.emit_down(&when_alone, rid, out);
        } else {
            self.emit_down(&dp_ch, rid, out);
        }
    }

    fn reemit_doublepress(&self, idx: usize, rid: u8, out: &mut Vec<SyntheticEvent>) {
        let r = self.ruleset.get(idx);
        if r.when_doublepress.is_empty() {
            let when_alone = r.when_alone.clone();
            self.emit_down(&when_alone, rid, out);
        } else {
            let dp = r.when_doublepress.clone();
            self.emit_down(&dp, rid, out);
        }
    }

    // ---- 4.4.2 Remapped key Up ----

    fn handle_up(&mut self, idx: usize, t: u32, out: &mut Vec<SyntheticEvent>) {
        let rid = self.ruleset.get(idx).id;
        let state = self.ruleset.get(idx).state;
        match state {
            RemapState::HeldAlone => {
                let r_time = self.ruleset.get(idx).last_transition_time;
                let tt = self.config.tap_timeout;
                if tt == 0 || t.wrapping_sub(r_time) < tt {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_down(&when_alone, rid, out);
                    self.emit_up(&when_alone, rid, out);
                    self.toggle_tap_lock(idx, rid, out);
                    let r = self.ruleset.get_mut(idx);
                    r.last_transition_time = t;
                    r.state = RemapState::Tapped;
                } else {
                    self.ruleset.get_mut(idx).state = RemapState::Idle;
                }
                if let Some(l) = self.ruleset.get(idx).with_other.as_layer() {
                    self.layers.sync_active_to_lock(l);
                }
            }
            RemapState::HeldWithOther => {
                let with_other = self.ruleset.get(idx).with_other.clone();
                self.emit_up(&with_other, rid, out);
                if let Some(l) = with_other.as_layer() {
                    self.layers.sync_active_to_lock(l);
                }
                self.ruleset.get_mut(idx).state = RemapState::Idle;
            }
            RemapState::Tap => {
                let r_time = self.ruleset.get(idx).last_transition_time;
                let tt = self.config.tap_timeout;
                if tt == 0 || t.wrapping_sub(r_time) < tt {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_up(&when_alone, rid, out);
                    self.toggle_tap_lock(idx, rid, out);
                    let r = self.ruleset.get_mut(idx);
                    r.last_transition_time = t;
                    r.state = RemapState::Tapped;
                } else {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_up(&when_alone, rid, out);
                    self.ruleset.get_mut(idx).state = RemapState::Idle;
                }
                if let Some(l) = self.ruleset.get(idx).when_alone.as_layer() {
                    self.layers.sync_active_to_lock(l);
                }
            }
            RemapState::DoubleTap => {
                if self.ruleset.get(idx).when_doublepress.is_empty() {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_up(&when_alone, rid, out);
                } else {
                    let dp = self.ruleset.get(idx).when_doublepress.clone();
                    self.emit_up(&dp, rid, out);
                }

                let r_time = self.ruleset.get(idx).last_transition_time;
                let tt = self.config.tap_timeout;
                if tt == 0 || t.wrapping_sub(r_time) < tt {
                    let dtl_ch = self.ruleset.get(idx).when_double_tap_lock.clone();
                    match &dtl_ch {
                        Channel::Keys(_) => {
                            let r = self.ruleset.get_mut(idx);
                            r.double_tap_lock = !r.double_tap_lock;
                            if r.double_tap_lock {
                                self.emit_down(&dtl_ch, rid, out);
                            } else {
                                self.emit_up(&dtl_ch, rid, out);
                            }
                        }
                        Channel::Layer(l) => {
                            self.layers.toggle_lock(*l);
                        }
                        Channel::Empty => {}
                    }
                }

                if let Some(l) = self.ruleset.get(idx).when_doublepress.as_layer() {
                    self.layers.sync_active_to_lock(l);
                }
                self.ruleset.get_mut(idx).state = RemapState::Idle;
            }
            RemapState::Idle | RemapState::Tapped => {
                // An Up with no matching Down in progress; nothing to close.
            }
        }

        let r = self.ruleset.get(idx);
        if !r.tap_lock && !r.double_tap_lock {
            self.active_remove(idx);
        }
    }

    fn toggle_tap_lock(&mut self, idx: usize, rid: u8, out: &mut Vec<SyntheticEvent>) {
        let ch = self.ruleset.get(idx).when_tap_lock.clone();
        match &ch {
            Channel::Keys(_) => {
                let r = self.ruleset.get_mut(idx);
                r.tap_lock = !r.tap_lock;
                if r.tap_lock {
                    self.emit_down(&ch, rid, out);
                } else {
                    self.emit_up(&ch, rid, out);
                }
            }
            Channel::Layer(l) => {
                self.layers.toggle_lock(*l);
            }
            Channel::Empty => {}
        }
    }

    // ---- 4.4.3 Other input ----

    // Self-injected events never reach `handle` past the provenance check in
    // `handle()`, so there is no rule id to exclude here the way the id-based
    // `remap_id` filter in the original source needs to (it has to, because
    // it routes self-injected events through this same broadcast).
    fn handle_other_input(&mut self, event: InputEvent, out: &mut Vec<SyntheticEvent>) -> bool {
        if event.direction != Direction::Down || self.catalog.is_modifier_code(event.virtual_code)
        {
            return false;
        }

        let t = event.time_ms;
        for idx in self.active.clone() {
            let rid = self.ruleset.get(idx).id;
            let state = self.ruleset.get(idx).state;
            let r_time = self.ruleset.get(idx).last_transition_time;

            match state {
                RemapState::HeldAlone => {
                    let has_alone = !self.ruleset.get(idx).when_alone.is_empty();
                    if self.config.hold_delay > 0
                        && t.wrapping_sub(r_time) < self.config.hold_delay
                        && has_alone
                    {
                        let when_alone = self.ruleset.get(idx).when_alone.clone();
                        self.emit_down(&when_alone, rid, out);
                        self.ruleset.get_mut(idx).state = RemapState::Tap;
                    } else {
                        let with_other = self.ruleset.get(idx).with_other.clone();
                        self.emit_down(&with_other, rid, out);
                        self.ruleset.get_mut(idx).state = RemapState::HeldWithOther;
                    }
                }
                RemapState::HeldWithOther => {
                    let with_other = self.ruleset.get(idx).with_other.clone();
                    self.emit_down(&with_other, rid, out);
                }
                RemapState::Tap => {
                    if self.ruleset.get(idx).when_alone_is_modifier {
                        let when_alone = self.ruleset.get(idx).when_alone.clone();
                        self.emit_down(&when_alone, rid, out);
                    }
                }
                RemapState::DoubleTap => {
                    if self.ruleset.get(idx).when_doublepress_is_modifier {
                        let dp = self.ruleset.get(idx).when_doublepress.clone();
                        self.emit_down(&dp, rid, out);
                    }
                }
                RemapState::Idle => {
                    let r = self.ruleset.get(idx);
                    if r.tap_lock {
                        let ch = r.when_tap_lock.clone();
                        self.emit_down(&ch, rid, out);
                    }
                    if r.double_tap_lock {
                        let ch = r.when_double_tap_lock.clone();
                        self.emit_down(&ch, rid, out);
                    }
                }
                RemapState::Tapped => {}
            }

            self.ruleset.get_mut(idx).last_transition_time = 0;
        }

        false
    }

    // ---- 4.4.5 unlock_all ----

    /// Close every open channel and clear every lock, returning every rule
    /// to Idle and every layer to its ground state. Idempotent: a second
    /// call with nothing open produces no outputs.
    pub fn unlock_all(&mut self, out: &mut Vec<SyntheticEvent>) {
        self.layers.clear_all();

        for idx in self.active.clone() {
            let rid = self.ruleset.get(idx).id;
            let state = self.ruleset.get(idx).state;
            match state {
                RemapState::HeldWithOther => {
                    let with_other = self.ruleset.get(idx).with_other.clone();
                    self.emit_up(&with_other, rid, out);
                }
                RemapState::Tap => {
                    let when_alone = self.ruleset.get(idx).when_alone.clone();
                    self.emit_up(&when_alone, rid, out);
                }
                RemapState::DoubleTap => {
                    let r = self.ruleset.get(idx);
                    if r.when_doublepress.is_empty() {
                        let when_alone = r.when_alone.clone();
                        self.emit_up(&when_alone, rid, out);
                    } else {
                        let dp = r.when_doublepress.clone();
                        self.emit_up(&dp, rid, out);
                    }
                }
                RemapState::Idle | RemapState::HeldAlone | RemapState::Tapped => {}
            }

            let r = self.ruleset.get(idx);
            if r.double_tap_lock {
                let ch = r.when_double_tap_lock.clone();
                self.emit_up(&ch, rid, out);
            }
            if r.tap_lock {
                let ch = r.when_tap_lock.clone();
                self.emit_up(&ch, rid, out);
            }

            let r = self.ruleset.get_mut(idx);
            r.double_tap_lock = false;
            r.tap_lock = false;
            r.state = RemapState::Idle;
        }

        self.active.clear();
    }

    /// Number of rules currently in ActiveRemaps (§8 invariant checks).
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerManager;

    const SPACE: u16 = 0x20;
    const A: u16 = 0x41;
    const LSHIFT: u16 = 0x2A;
    const LCTRL: u16 = 0x1D;
    const X: u16 = 0x58;

    fn kd(code: u16, is_modifier: bool) -> KeyDescriptor {
        KeyDescriptor {
            name: "test",
            scan_code: code,
            virtual_code: code,
            is_modifier,
        }
    }

    fn chord(code: u16, is_modifier: bool) -> Channel {
        Channel::Keys(crate::ruleset::KeySequence::new([kd(code, is_modifier)]).unwrap())
    }

    fn down(code: u16, t: u32) -> InputEvent {
        InputEvent {
            scan_code: code,
            virtual_code: code,
            direction: Direction::Down,
            time_ms: t,
            is_injected: false,
            extra_info: 0,
        }
    }

    fn up(code: u16, t: u32) -> InputEvent {
        InputEvent {
            direction: Direction::Up,
            ..down(code, t)
        }
    }

    /// The literal §8 scenario rule: from=Space, when_alone=[A], with_other=[LShift].
    fn scenario_engine(config: EngineConfig) -> StateEngine {
        let mut ruleset = RuleSet::new();
        ruleset
            .add(crate::ruleset::Remap::new(
                1,
                kd(SPACE, false),
                None,
                chord(A, false),
                chord(LSHIFT, true),
                Channel::Empty,
                Channel::Empty,
                Channel::Empty,
            ))
            .unwrap();
        StateEngine::new(
            ruleset,
            LayerManager::new(),
            Rc::new(KeyCatalog::new()),
            config,
        )
    }

    fn scenario_config() -> EngineConfig {
        EngineConfig {
            hold_delay: 0,
            tap_timeout: 200,
            doublepress_timeout: 250,
            unlock_timeout: 0,
            scancode_mode: false,
        }
    }

    #[test]
    fn scenario_1_pure_tap() {
        let mut engine = scenario_engine(scenario_config());
        let r1 = engine.handle(down(SPACE, 100));
        assert!(r1.block && r1.outputs.is_empty());
        let r2 = engine.handle(up(SPACE, 150));
        assert!(r2.block);
        assert_eq!(r2.outputs.len(), 2);
        assert_eq!(r2.outputs[0].direction, Direction::Down);
        assert_eq!(r2.outputs[1].direction, Direction::Up);
    }

    #[test]
    fn scenario_2_hold_with_other() {
        let mut engine = scenario_engine(scenario_config());
        engine.handle(down(SPACE, 100));
        let r2 = engine.handle(down(A, 150));
        assert!(!r2.block);
        assert_eq!(r2.outputs.len(), 1);
        assert_eq!(r2.outputs[0].descriptor.virtual_code, LSHIFT);
        let r3 = engine.handle(up(A, 160));
        assert!(!r3.block && r3.outputs.is_empty());
        let r4 = engine.handle(up(SPACE, 200));
        assert!(r4.block);
        assert_eq!(r4.outputs[0].direction, Direction::Up);
    }

    #[test]
    fn scenario_3_double_press_falls_back_to_when_alone() {
        let mut engine = scenario_engine(scenario_config());
        engine.handle(down(SPACE, 100));
        let r2 = engine.handle(up(SPACE, 150));
        assert_eq!(r2.outputs.len(), 2);
        let r3 = engine.handle(down(SPACE, 200));
        assert_eq!(r3.outputs.len(), 1);
        assert_eq!(r3.outputs[0].descriptor.virtual_code, A);
        assert_eq!(r3.outputs[0].direction, Direction::Down);
    }

    #[test]
    fn scenario_4_hold_past_tap_timeout_emits_nothing() {
        let mut engine = scenario_engine(scenario_config());
        engine.handle(down(SPACE, 100));
        let r2 = engine.handle(up(SPACE, 400));
        assert!(r2.block && r2.outputs.is_empty());
    }

    #[test]
    fn scenario_5_foreign_modifier_reaffirm() {
        let mut ruleset = RuleSet::new();
        ruleset
            .add(crate::ruleset::Remap::new(
                1,
                kd(SPACE, false),
                None,
                chord(LCTRL, true),
                Channel::Empty,
                Channel::Empty,
                Channel::Empty,
                Channel::Empty,
            ))
            .unwrap();
        let mut engine = StateEngine::new(
            ruleset,
            LayerManager::new(),
            Rc::new(KeyCatalog::new()),
            EngineConfig {
                tap_timeout: 0,
                doublepress_timeout: 250,
                ..scenario_config()
            },
        );
        let r1 = engine.handle(down(SPACE, 100));
        assert_eq!(r1.outputs[0].descriptor.virtual_code, LCTRL);
        let r2 = engine.handle(down(X, 150));
        assert!(!r2.block);
        assert_eq!(r2.outputs[0].descriptor.virtual_code, LCTRL);
        assert_eq!(r2.outputs[0].direction, Direction::Down);
    }

    #[test]
    fn scenario_6_idle_unlock() {
        let mut engine = scenario_engine(EngineConfig {
            unlock_timeout: 1000,
            ..scenario_config()
        });
        let r1 = engine.handle(down(SPACE, 100));
        assert!(r1.block);
        assert_eq!(engine.active_count(), 1);
        let r2 = engine.handle(down(SPACE, 2000));
        assert!(r2.block && r2.outputs.is_empty());
        assert_eq!(engine.active_count(), 1);
    }
}
