//! Read-only name -> key descriptor lookup, populated once at startup.

use std::collections::HashMap;

/// One entry of the key table: a name, its evdev scan/key code, and whether
/// it is a modifier (Ctrl/Shift/Alt/GUI, in either hand).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDescriptor {
    pub name: &'static str,
    pub scan_code: u16,
    pub virtual_code: u16,
    pub is_modifier: bool,
}

impl KeyDescriptor {
    /// Reserved descriptor carrying no real key. Produced by the hook adapter
    /// for pointer button activity so it can drive the "other input" path
    /// without ever being eligible for injection.
    pub const MOUSE_PLACEHOLDER: KeyDescriptor = KeyDescriptor {
        name: "MOUSE_PLACEHOLDER",
        scan_code: 0,
        virtual_code: 0xFFFF,
        is_modifier: false,
    };
}

/// Macro for defining the built-in key table.
///
/// Syntax: `KC_NAME = evdev_code, modifier|plain`
macro_rules! define_keys {
    ( $( $variant:ident = $code:expr, $kind:ident, )* ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        #[allow(non_camel_case_types)]
        enum Builtin {
            $( $variant = $code, )*
        }

        impl Builtin {
            const fn is_modifier(self) -> bool {
                match self {
                    $( Self::$variant => define_keys!(@@mod $kind), )*
                }
            }

            const fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )*
                }
            }

            fn from_name(s: &str) -> Option<Self> {
                match s {
                    $( stringify!($variant) => Some(Self::$variant), )*
                    _ => None,
                }
            }

            const ALL: &'static [Builtin] = &[ $( Self::$variant, )* ];
        }
    };

    (@@mod modifier) => { true };
    (@@mod plain) => { false };
}

define_keys! {
    KC_A = 30, plain,
    KC_B = 48, plain,
    KC_C = 46, plain,
    KC_D = 32, plain,
    KC_E = 18, plain,
    KC_F = 33, plain,
    KC_G = 34, plain,
    KC_H = 35, plain,
    KC_I = 23, plain,
    KC_J = 36, plain,
    KC_K = 37, plain,
    KC_L = 38, plain,
    KC_M = 50, plain,
    KC_N = 49, plain,
    KC_O = 24, plain,
    KC_P = 25, plain,
    KC_Q = 16, plain,
    KC_R = 19, plain,
    KC_S = 31, plain,
    KC_T = 20, plain,
    KC_U = 22, plain,
    KC_V = 47, plain,
    KC_W = 17, plain,
    KC_X = 45, plain,
    KC_Y = 21, plain,
    KC_Z = 44, plain,

    KC_1 = 2, plain,
    KC_2 = 3, plain,
    KC_3 = 4, plain,
    KC_4 = 5, plain,
    KC_5 = 6, plain,
    KC_6 = 7, plain,
    KC_7 = 8, plain,
    KC_8 = 9, plain,
    KC_9 = 10, plain,
    KC_0 = 11, plain,

    KC_LCTL = 29, modifier,
    KC_LSFT = 42, modifier,
    KC_LALT = 56, modifier,
    KC_LGUI = 125, modifier,
    KC_RCTL = 97, modifier,
    KC_RSFT = 54, modifier,
    KC_RALT = 100, modifier,
    KC_RGUI = 126, modifier,

    KC_ESC = 1, plain,
    KC_CAPS = 58, plain,
    KC_TAB = 15, plain,
    KC_SPC = 57, plain,
    KC_ENT = 28, plain,
    KC_BSPC = 14, plain,
    KC_DEL = 111, plain,
    KC_GRV = 41, plain,
    KC_MINS = 12, plain,
    KC_EQL = 13, plain,
    KC_LBRC = 26, plain,
    KC_RBRC = 27, plain,
    KC_BSLS = 43, plain,
    KC_SCLN = 39, plain,
    KC_QUOT = 40, plain,
    KC_COMM = 51, plain,
    KC_DOT = 52, plain,
    KC_SLSH = 53, plain,

    KC_LEFT = 105, plain,
    KC_DOWN = 108, plain,
    KC_UP = 103, plain,
    KC_RGHT = 106, plain,

    KC_F1 = 59, plain,
    KC_F2 = 60, plain,
    KC_F3 = 61, plain,
    KC_F4 = 62, plain,
    KC_F5 = 63, plain,
    KC_F6 = 64, plain,
    KC_F7 = 65, plain,
    KC_F8 = 66, plain,
    KC_F9 = 67, plain,
    KC_F10 = 68, plain,
    KC_F11 = 69, plain,
    KC_F12 = 70, plain,

    KC_INS = 110, plain,
    KC_HOME = 102, plain,
    KC_PGUP = 104, plain,
    KC_END = 107, plain,
    KC_PGDN = 109, plain,

    KC_NUBS = 86, plain,
    KC_PSLS = 98, plain,
    KC_PAST = 55, plain,
    KC_PMNS = 74, plain,
    KC_PPLS = 78, plain,
    KC_PENT = 96, plain,

    KC_APP = 127, plain,
}

/// Names reserved for layer references rather than keys (§4.1: `find`
/// returns `None` for these so the config parser treats the value as a
/// layer, not a key lookup miss).
fn is_layer_name(name: &str) -> bool {
    name.starts_with("layer")
}

/// The populated-once-at-startup name -> descriptor table.
pub struct KeyCatalog {
    by_name: HashMap<&'static str, KeyDescriptor>,
    by_code: HashMap<u16, KeyDescriptor>,
}

impl KeyCatalog {
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        let mut by_code = HashMap::new();
        for &b in Builtin::ALL {
            let d = KeyDescriptor {
                name: b.name(),
                scan_code: b as u16,
                virtual_code: b as u16,
                is_modifier: b.is_modifier(),
            };
            by_name.insert(d.name, d);
            by_code.insert(d.virtual_code, d);
        }
        Self { by_name, by_code }
    }

    /// Look up a descriptor by its config-file name. Returns `None` both for
    /// unknown names and for names reserved as layer references.
    pub fn find(&self, name: &str) -> Option<KeyDescriptor> {
        if is_layer_name(name) {
            return None;
        }
        self.by_name.get(name).copied()
    }

    /// Look up a descriptor by evdev code, for classifying events that
    /// didn't originate from a config lookup (e.g. a foreign key's
    /// modifier-ness in §4.4.3).
    pub fn by_code(&self, code: u16) -> Option<KeyDescriptor> {
        self.by_code.get(&code).copied()
    }

    pub fn is_modifier_code(&self, code: u16) -> bool {
        self.by_code(code).map(|d| d.is_modifier).unwrap_or(false)
    }

    /// Every known key name, sorted, for `list-keys` (§10.3).
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for KeyCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_key() {
        let cat = KeyCatalog::new();
        let d = cat.find("KC_A").unwrap();
        assert_eq!(d.virtual_code, 30);
        assert!(!d.is_modifier);
    }

    #[test]
    fn modifier_flagged() {
        let cat = KeyCatalog::new();
        assert!(cat.find("KC_LSFT").unwrap().is_modifier);
    }

    #[test]
    fn layer_names_rejected() {
        let cat = KeyCatalog::new();
        assert!(cat.find("layer_nav").is_none());
    }

    #[test]
    fn unknown_name_is_none() {
        let cat = KeyCatalog::new();
        assert!(cat.find("KC_NONEXISTENT").is_none());
    }

    #[test]
    fn by_code_round_trips() {
        let cat = KeyCatalog::new();
        let d = cat.find("KC_SPC").unwrap();
        assert_eq!(cat.by_code(d.virtual_code), Some(d));
    }
}
