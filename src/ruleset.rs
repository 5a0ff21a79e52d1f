//! The compiled, immutable-after-load table of remap rules and layers.

use smallvec::SmallVec;

use crate::catalog::KeyDescriptor;
use crate::layer::{LayerId, LayerManager};

/// An ordered, non-empty sequence of keys emitted as a chord: Downs in
/// order, Ups in reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySequence(SmallVec<[KeyDescriptor; 4]>);

impl KeySequence {
    pub fn new(keys: impl IntoIterator<Item = KeyDescriptor>) -> Option<Self> {
        let v: SmallVec<[KeyDescriptor; 4]> = keys.into_iter().collect();
        if v.is_empty() {
            None
        } else {
            Some(Self(v))
        }
    }

    /// Keys in Down-emission order.
    pub fn down_order(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.0.iter()
    }

    /// Keys in Up-emission order (reverse of Down).
    pub fn up_order(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.0.iter().rev()
    }

    pub fn is_all_modifier(&self) -> bool {
        self.0.iter().all(|k| k.is_modifier)
    }
}

/// One of a Remap's five output channels: empty, a key chord, or a layer
/// reference. A channel is never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Empty,
    Keys(KeySequence),
    Layer(LayerId),
}

impl Channel {
    pub fn is_empty(&self) -> bool {
        matches!(self, Channel::Empty)
    }

    pub fn as_keys(&self) -> Option<&KeySequence> {
        match self {
            Channel::Keys(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_layer(&self) -> Option<LayerId> {
        match self {
            Channel::Layer(l) => Some(*l),
            _ => None,
        }
    }
}

/// The per-rule finite state machine (§4.4). `Idle` and `Tapped` are the
/// only states a rule may rest in between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapState {
    Idle,
    HeldAlone,
    HeldWithOther,
    Tap,
    Tapped,
    DoubleTap,
}

impl Default for RemapState {
    fn default() -> Self {
        RemapState::Idle
    }
}

/// One configured rule. Structural fields (everything but the last four) are
/// frozen once `RuleSet::load` returns.
#[derive(Debug, Clone)]
pub struct Remap {
    pub id: u8,
    pub from: KeyDescriptor,
    pub gate_layer: Option<LayerId>,

    pub when_alone: Channel,
    pub with_other: Channel,
    pub when_doublepress: Channel,
    pub when_tap_lock: Channel,
    pub when_double_tap_lock: Channel,

    pub when_alone_is_modifier: bool,
    pub when_doublepress_is_modifier: bool,

    pub state: RemapState,
    pub last_transition_time: u32,
    pub tap_lock: bool,
    pub double_tap_lock: bool,
}

impl Remap {
    pub fn new(
        id: u8,
        from: KeyDescriptor,
        gate_layer: Option<LayerId>,
        when_alone: Channel,
        with_other: Channel,
        when_doublepress: Channel,
        when_tap_lock: Channel,
        when_double_tap_lock: Channel,
    ) -> Self {
        let when_alone_is_modifier = when_alone.as_keys().map_or(true, |k| k.is_all_modifier());
        let when_doublepress_is_modifier = when_doublepress
            .as_keys()
            .map_or(true, |k| k.is_all_modifier());
        Self {
            id,
            from,
            gate_layer,
            when_alone,
            with_other,
            when_doublepress,
            when_tap_lock,
            when_double_tap_lock,
            when_alone_is_modifier,
            when_doublepress_is_modifier,
            state: RemapState::Idle,
            last_transition_time: 0,
            tap_lock: false,
            double_tap_lock: false,
        }
    }

    pub fn has_with_other(&self) -> bool {
        !self.with_other.is_empty()
    }
}

/// 256-slot array indexed by `virtual_code & 0xFF`; each slot holds the
/// indices (into `remaps`) of rules keyed to that code, layer-gated rules
/// ordered before the unconditional one.
pub struct RuleSet {
    remaps: Vec<Remap>,
    slots: Vec<Vec<usize>>,
}

const SLOT_COUNT: usize = 256;

impl RuleSet {
    pub fn new() -> Self {
        Self {
            remaps: Vec::new(),
            slots: vec![Vec::new(); SLOT_COUNT],
        }
    }

    /// Load-time normalizations (§4.2), applied as each rule is added:
    /// - drop `with_other` if structurally equal to `when_alone`
    /// - drop `when_doublepress` if structurally equal to `when_alone`
    /// - drop `with_other` if it is a non-all-modifier key sequence
    /// - reject duplicate `(gate_layer, from)` pairs
    /// - reject more than 255 rules
    pub fn add(&mut self, mut remap: Remap) -> Result<(), String> {
        if self.remaps.len() >= 255 {
            return Err("maximum of 255 rules exceeded".to_string());
        }
        let slot = (remap.from.virtual_code & 0xFF) as usize;
        for &idx in &self.slots[slot] {
            let existing = &self.remaps[idx];
            if existing.gate_layer == remap.gate_layer {
                return Err(format!(
                    "duplicate rule for key {:?} under the same gate layer",
                    remap.from.name
                ));
            }
        }

        if remap.with_other == remap.when_alone {
            remap.with_other = Channel::Empty;
        }
        if remap.when_doublepress == remap.when_alone {
            remap.when_doublepress = Channel::Empty;
        }
        if let Channel::Keys(ref k) = remap.with_other {
            if !k.is_all_modifier() {
                remap.with_other = Channel::Empty;
            }
        }

        let idx = self.remaps.len();
        let gated = remap.gate_layer.is_some();
        self.remaps.push(remap);
        if gated {
            let insert_at = self.slots[slot]
                .iter()
                .position(|&i| self.remaps[i].gate_layer.is_none())
                .unwrap_or(self.slots[slot].len());
            self.slots[slot].insert(insert_at, idx);
        } else {
            self.slots[slot].push(idx);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.remaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaps.is_empty()
    }

    /// Return the index of the first rule in the matching slot whose gate is
    /// satisfied, if any.
    pub fn lookup(&self, virtual_code: u16, layers: &LayerManager) -> Option<usize> {
        let slot = (virtual_code & 0xFF) as usize;
        self.slots[slot]
            .iter()
            .find(|&&idx| match self.remaps[idx].gate_layer {
                None => true,
                Some(l) => layers.is_active(l),
            })
            .copied()
    }

    pub fn get(&self, idx: usize) -> &Remap {
        &self.remaps[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Remap {
        &mut self.remaps[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Remap> {
        self.remaps.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> {
        0..self.remaps.len()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kd(code: u16, is_modifier: bool) -> KeyDescriptor {
        KeyDescriptor {
            name: "test",
            scan_code: code,
            virtual_code: code,
            is_modifier,
        }
    }

    #[test]
    fn drops_with_other_equal_to_when_alone() {
        let mut rs = RuleSet::new();
        let seq = KeySequence::new([kd(30, false)]).unwrap();
        let r = Remap::new(
            1,
            kd(0x20, false),
            None,
            Channel::Keys(seq.clone()),
            Channel::Keys(seq),
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
        );
        rs.add(r).unwrap();
        assert!(rs.get(0).with_other.is_empty());
    }

    #[test]
    fn drops_non_modifier_with_other() {
        let mut rs = RuleSet::new();
        let alone = KeySequence::new([kd(30, false)]).unwrap();
        let other = KeySequence::new([kd(31, false)]).unwrap();
        let r = Remap::new(
            1,
            kd(0x20, false),
            None,
            Channel::Keys(alone),
            Channel::Keys(other),
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
        );
        rs.add(r).unwrap();
        assert!(rs.get(0).with_other.is_empty());
    }

    #[test]
    fn keeps_all_modifier_with_other() {
        let mut rs = RuleSet::new();
        let alone = KeySequence::new([kd(30, false)]).unwrap();
        let other = KeySequence::new([kd(42, true)]).unwrap();
        let r = Remap::new(
            1,
            kd(0x20, false),
            None,
            Channel::Keys(alone),
            Channel::Keys(other),
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
        );
        rs.add(r).unwrap();
        assert!(!rs.get(0).with_other.is_empty());
    }

    #[test]
    fn rejects_duplicate_ungated_rule() {
        let mut rs = RuleSet::new();
        let mk = || {
            Remap::new(
                1,
                kd(0x20, false),
                None,
                Channel::Keys(KeySequence::new([kd(30, false)]).unwrap()),
                Channel::Empty,
                Channel::Empty,
                Channel::Empty,
                Channel::Empty,
            )
        };
        rs.add(mk()).unwrap();
        assert!(rs.add(mk()).is_err());
    }

    #[test]
    fn lookup_prefers_gated_rule_when_active() {
        let mut lm = LayerManager::new();
        let nav = lm.intern("layer_nav");
        let mut rs = RuleSet::new();
        rs.add(Remap::new(
            1,
            kd(0x20, false),
            None,
            Channel::Keys(KeySequence::new([kd(30, false)]).unwrap()),
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
        ))
        .unwrap();
        rs.add(Remap::new(
            2,
            kd(0x20, false),
            Some(nav),
            Channel::Keys(KeySequence::new([kd(31, false)]).unwrap()),
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
            Channel::Empty,
        ))
        .unwrap();

        assert_eq!(rs.lookup(0x20, &lm), Some(0));
        lm.set_active(nav, true);
        assert_eq!(rs.lookup(0x20, &lm), Some(1));
    }
}
