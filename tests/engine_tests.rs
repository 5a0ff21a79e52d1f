//! Black-box invariant tests against the public core API: ActiveRemaps
//! membership, the injection-tag boundary, and `unlock_all` idempotence.
//! The six literal end-to-end scenarios live as inline unit tests next to
//! `StateEngine` itself; this file covers what needs more than one rule or
//! needs to drive `InputEvent`'s injection fields directly.

use std::rc::Rc;

use keyremapd::catalog::{KeyCatalog, KeyDescriptor};
use keyremapd::engine::{Direction, EngineConfig, InputEvent, StateEngine};
use keyremapd::injection::InjectionTagger;
use keyremapd::layer::LayerManager;
use keyremapd::ruleset::{Channel, KeySequence, Remap, RuleSet};

const SPACE: u16 = 0x20;
const A: u16 = 0x41;
const LSHIFT: u16 = 0x2A;

fn kd(code: u16, is_modifier: bool) -> KeyDescriptor {
    KeyDescriptor {
        name: "test",
        scan_code: code,
        virtual_code: code,
        is_modifier,
    }
}

fn chord(code: u16, is_modifier: bool) -> Channel {
    Channel::Keys(KeySequence::new([kd(code, is_modifier)]).unwrap())
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

fn build_engine(config: EngineConfig) -> StateEngine {
    let mut ruleset = RuleSet::new();
    ruleset
        .add(Remap::new(
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
fn active_remaps_tracks_held_and_locked_rules() {
    let mut engine = build_engine(scenario_config());
    assert_eq!(engine.active_count(), 0);

    engine.handle(down(SPACE, 100));
    assert_eq!(engine.active_count(), 1, "HeldAlone counts as active");

    engine.handle(up(SPACE, 150));
    assert_eq!(
        engine.active_count(),
        0,
        "a Tapped rule with no lock flags set is not in ActiveRemaps"
    );
}

#[test]
fn foreign_injected_event_causes_no_transition() {
    let mut engine = build_engine(scenario_config());

    let foreign = InputEvent {
        is_injected: true,
        extra_info: 0xDEAD_0000,
        ..down(SPACE, 100)
    };
    let result = engine.handle(foreign);
    assert!(!result.block);
    assert!(result.outputs.is_empty());
    assert_eq!(
        engine.active_count(),
        0,
        "a foreign-injected event must not move any rule out of Idle"
    );
}

#[test]
fn self_tagged_event_causes_no_transition() {
    let mut engine = build_engine(scenario_config());

    let self_tagged = InputEvent {
        is_injected: true,
        extra_info: InjectionTagger::encode(1),
        ..down(SPACE, 100)
    };
    let result = engine.handle(self_tagged);
    assert!(!result.block);
    assert!(result.outputs.is_empty());
    assert_eq!(engine.active_count(), 0);
}

#[test]
fn unlock_all_is_idempotent() {
    let mut engine = build_engine(scenario_config());
    engine.handle(down(SPACE, 100));
    assert_eq!(engine.active_count(), 1);

    let mut out1 = Vec::new();
    engine.unlock_all(&mut out1);
    assert!(out1.is_empty(), "HeldAlone unlocks with no emission");
    assert_eq!(engine.active_count(), 0);

    let mut out2 = Vec::new();
    engine.unlock_all(&mut out2);
    assert!(out2.is_empty(), "second call on already-idle state is a no-op");
    assert_eq!(engine.active_count(), 0);
}

#[test]
fn unlock_all_closes_held_with_other() {
    let mut engine = build_engine(scenario_config());
    engine.handle(down(SPACE, 100));
    engine.handle(down(A, 150)); // foreign input -> HeldWithOther, emits LShift Down

    let mut out = Vec::new();
    engine.unlock_all(&mut out);
    assert_eq!(out.len(), 1, "HeldWithOther unlocks by emitting with_other Up");
    assert_eq!(out[0].descriptor.virtual_code, LSHIFT);
    assert_eq!(out[0].direction, Direction::Up);
    assert_eq!(engine.active_count(), 0);
}
