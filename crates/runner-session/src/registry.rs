//! Terminal window registry.
//!
//! Tracks the front-ends attached to one program session, their last known
//! dimensions and which of them is active. The registry performs no I/O:
//! every operation returns the winsize that must be transmitted, if any.
//!
//! Resize frames are withheld until every registered window has opened at
//! least once (the readiness barrier). Once satisfied the barrier stays
//! satisfied; windows registered later do not reset it.

use tracing::{debug, error, warn};

use runner_core::{Dimensions, Error, Result, Winsize};

/// One attached front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalWindow {
    /// Window name, unique within the registry
    pub name: String,
    /// Last known dimensions
    pub dimensions: Option<Dimensions>,
    /// Whether the window has opened at least once
    pub opened: bool,
}

/// Registry of terminal windows for one program session.
#[derive(Debug, Default)]
pub struct TerminalWindowRegistry {
    windows: Vec<TerminalWindow>,
    active: Option<String>,
    barrier_satisfied: bool,
}

impl TerminalWindowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a window. The first window becomes active.
    ///
    /// Registering an existing name only updates its dimensions.
    pub fn register(&mut self, name: &str, dimensions: Option<Dimensions>) {
        if let Some(window) = self.get_mut(name) {
            warn!("Terminal window '{}' is already registered", name);
            if dimensions.is_some() {
                window.dimensions = dimensions;
            }
            return;
        }

        debug!("Registering terminal window '{}'", name);
        self.windows.push(TerminalWindow {
            name: name.to_string(),
            dimensions,
            opened: false,
        });
        if self.active.is_none() {
            self.active = Some(name.to_string());
        }
    }

    /// Remove a window.
    ///
    /// A removed active window hands over to the first remaining window.
    /// Removal never un-satisfies the barrier, but removing the last
    /// unopened window satisfies it.
    pub fn unregister(&mut self, name: &str) -> Option<Winsize> {
        let Some(index) = self.index_of(name) else {
            warn!("Cannot unregister unknown terminal window '{}'", name);
            return None;
        };
        self.windows.remove(index);
        debug!("Unregistered terminal window '{}'", name);

        let was_active = self.active.as_deref() == Some(name);
        if was_active {
            self.active = self.windows.first().map(|window| window.name.clone());
        }

        if self.try_satisfy_barrier() {
            return self.active_winsize();
        }
        if was_active && self.barrier_satisfied {
            return self.active_winsize();
        }
        None
    }

    /// Mark a window opened, storing `dimensions` when given.
    ///
    /// `name` defaults to the active window.
    pub fn open(&mut self, dimensions: Option<Dimensions>, name: Option<&str>) -> Option<Winsize> {
        let Some(name) = self.resolve(name) else {
            warn!("Cannot open terminal window: no window registered");
            return None;
        };
        let Some(window) = self.get_mut(&name) else {
            warn!("Cannot open unregistered terminal window '{}'", name);
            return None;
        };

        if dimensions.is_some() {
            window.dimensions = dimensions;
        }
        if window.opened {
            warn!("Terminal window '{}' was already opened", name);
            return None;
        }
        window.opened = true;
        debug!("Opened terminal window '{}'", name);

        if !self.barrier_satisfied {
            if self.try_satisfy_barrier() {
                return self.active_winsize();
            }
            return None;
        }

        if self.is_active(&name) {
            return self.active_winsize();
        }
        None
    }

    /// Store new dimensions for a window.
    ///
    /// `name` defaults to the active window. A frame is produced only when
    /// the barrier is satisfied and the window is active.
    pub fn set_dimensions(
        &mut self,
        dimensions: Dimensions,
        name: Option<&str>,
    ) -> Result<Option<Winsize>> {
        let name = self
            .resolve(name)
            .ok_or_else(|| Error::UnregisteredTerminalWindow("<active>".to_string()))?;
        let window = self
            .get_mut(&name)
            .ok_or_else(|| Error::UnregisteredTerminalWindow(name.clone()))?;
        window.dimensions = Some(dimensions);

        if self.barrier_satisfied && self.is_active(&name) {
            return Ok(Some(Winsize::from(dimensions)));
        }
        Ok(None)
    }

    /// Make `name` the active window.
    pub fn set_active(&mut self, name: &str) -> Option<Winsize> {
        if self.index_of(name).is_none() {
            warn!("Cannot activate unregistered terminal window '{}'", name);
            return None;
        }
        debug!("Terminal window '{}' is now active", name);
        self.active = Some(name.to_string());

        if self.barrier_satisfied {
            return self.active_winsize();
        }
        None
    }

    /// Name of the active window.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Whether resize frames may be sent.
    pub fn is_barrier_satisfied(&self) -> bool {
        self.barrier_satisfied
    }

    /// Look up a window.
    pub fn window(&self, name: &str) -> Option<&TerminalWindow> {
        self.windows.iter().find(|window| window.name == name)
    }

    /// Windows in registration order.
    pub fn windows(&self) -> &[TerminalWindow] {
        &self.windows
    }

    /// Number of registered windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window is registered.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn resolve(&self, name: Option<&str>) -> Option<String> {
        name.map(str::to_string).or_else(|| self.active.clone())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.windows.iter().position(|window| window.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut TerminalWindow> {
        self.windows.iter_mut().find(|window| window.name == name)
    }

    fn is_active(&self, name: &str) -> bool {
        self.active.as_deref() == Some(name)
    }

    /// Returns true when this call satisfied the barrier.
    fn try_satisfy_barrier(&mut self) -> bool {
        if self.barrier_satisfied || self.windows.is_empty() {
            return false;
        }
        if self.windows.iter().all(|window| window.opened) {
            debug!("All {} terminal window(s) opened", self.windows.len());
            self.barrier_satisfied = true;
            return true;
        }
        false
    }

    fn active_winsize(&self) -> Option<Winsize> {
        let name = self.active.as_deref()?;
        match self.window(name).and_then(|window| window.dimensions) {
            Some(dimensions) => Some(Winsize::from(dimensions)),
            None => {
                error!("Active terminal window '{}' has no dimensions", name);
                None
            }
        }
    }
}
