//! Per-layer {active, locked} flags, mutated only by the StateEngine.

/// Index into a `LayerManager`. Cheap to copy, stable for the process
/// lifetime once layers are frozen at config load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub usize);

struct LayerState {
    name: String,
    active: bool,
    locked: bool,
}

/// Owns every layer's runtime flags. `locked => active` is maintained as an
/// invariant of every mutating method here, not re-checked by callers.
pub struct LayerManager {
    layers: Vec<LayerState>,
}

impl LayerManager {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Register a layer by name at load time, returning its id. Repeated
    /// registration of the same name returns the existing id.
    pub fn intern(&mut self, name: &str) -> LayerId {
        if let Some(i) = self.layers.iter().position(|l| l.name == name) {
            return LayerId(i);
        }
        self.layers.push(LayerState {
            name: name.to_string(),
            active: false,
            locked: false,
        });
        LayerId(self.layers.len() - 1)
    }

    pub fn is_active(&self, id: LayerId) -> bool {
        self.layers[id.0].active
    }

    pub fn is_locked(&self, id: LayerId) -> bool {
        self.layers[id.0].locked
    }

    pub fn set_active(&mut self, id: LayerId, v: bool) {
        self.layers[id.0].active = v;
    }

    /// Mirror `locked` straight into `active` (used when a layer's activation
    /// is meant to track its own lock flag, e.g. `active := locked` on Up).
    pub fn sync_active_to_lock(&mut self, id: LayerId) {
        let locked = self.layers[id.0].locked;
        self.layers[id.0].active = locked;
    }

    /// Flip `locked` and unconditionally mirror the new value into `active`
    /// (used by the tap-lock/double-tap-lock channel transitions, which
    /// toggle a layer's lock on or off as a pair with `active`). Returns the
    /// new locked value.
    pub fn toggle_lock(&mut self, id: LayerId) -> bool {
        let new = !self.layers[id.0].locked;
        self.layers[id.0].locked = new;
        self.layers[id.0].active = new;
        new
    }

    /// Clear every layer's `active` and `locked` flags (used by
    /// `unlock_all`).
    pub fn clear_all(&mut self) {
        for l in &mut self.layers {
            l.active = false;
            l.locked = false;
        }
    }

    pub fn name(&self, id: LayerId) -> &str {
        &self.layers[id.0].name
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for LayerManager {
    fn default() -> Self {
        Self::new()
    }
}
