//! # Subsystem Status Model
//!
//! Each serial-attached subsystem (the LIN controller, the modem) owns a
//! [`StatusMap`]: a fixed set of keys with a per-entry dirty marker. The
//! owning poll task writes values, the scheduler drains changed entries for
//! publication, and inbound commands mutate entries through the
//! [`CommandSink`] boundary.
//!
//! The key set is fixed at construction and never grows at runtime; a
//! command naming an unknown key is rejected without touching any state.

use core::cell::RefCell;
use core::fmt::Write as _;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use heapless::{String, Vec};

use crate::error::CommandError;

/// Capacity of a stringified status value.
pub const VALUE_LEN: usize = 24;

/// A status value: opaque to the bridge beyond being stringifiable.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusValue {
    Int(i32),
    Bool(bool),
    Text(String<VALUE_LEN>),
}

impl StatusValue {
    /// Builds a text value, rejecting payloads that exceed the fixed capacity.
    pub fn text(s: &str) -> Result<Self, CommandError> {
        let mut out = String::new();
        out.push_str(s).map_err(|_| CommandError::InvalidValue)?;
        Ok(StatusValue::Text(out))
    }

    /// Parses a command payload: integers become `Int`, everything else is
    /// kept as text if it fits.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        if let Ok(n) = payload.parse::<i32>() {
            return Ok(StatusValue::Int(n));
        }
        Self::text(payload)
    }

    /// Stringifies the value for publication.
    pub fn render(&self) -> String<VALUE_LEN> {
        let mut out = String::new();
        // Values are constructed within VALUE_LEN, so this cannot overflow.
        let _ = match self {
            StatusValue::Int(n) => write!(&mut out, "{n}"),
            StatusValue::Bool(b) => write!(&mut out, "{}", if *b { "1" } else { "0" }),
            StatusValue::Text(s) => out.push_str(s).map_err(|_| core::fmt::Error),
        };
        out
    }
}

#[derive(Debug)]
struct StatusEntry {
    key: &'static str,
    value: StatusValue,
    dirty: bool,
}

/// A drained status change, stringified at snapshot time.
#[derive(Debug, Clone)]
pub struct ChangedEntry {
    pub key: &'static str,
    pub value: String<VALUE_LEN>,
}

/// A fixed-key status map with per-entry dirty markers.
#[derive(Debug)]
pub struct StatusMap<const N: usize> {
    entries: Vec<StatusEntry, N>,
}

impl<const N: usize> StatusMap<N> {
    /// Creates a map over the given key set. Entries start clean with an
    /// empty text value; keys beyond the capacity are ignored.
    pub fn new(keys: &[&'static str]) -> Self {
        let mut entries = Vec::new();
        for key in keys {
            let _ = entries.push(StatusEntry {
                key,
                value: StatusValue::Text(String::new()),
                dirty: false,
            });
        }
        Self { entries }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Sets a value and marks the entry dirty.
    pub fn set(&mut self, key: &str, value: StatusValue) -> Result<(), CommandError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.key == key)
            .ok_or(CommandError::UnknownKey)?;
        entry.value = value;
        entry.dirty = true;
        Ok(())
    }

    /// Parses and sets a command payload. The key is checked before the
    /// payload is parsed, so an unknown key never mutates anything.
    pub fn set_from_str(&mut self, key: &str, payload: &str) -> Result<(), CommandError> {
        if !self.contains_key(key) {
            return Err(CommandError::UnknownKey);
        }
        let value = StatusValue::parse(payload)?;
        self.set(key, value)
    }

    /// Re-marks an entry dirty without changing its value, forcing it into
    /// the next publication pass.
    pub fn mark_dirty(&mut self, key: &str) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.dirty = true;
            true
        } else {
            false
        }
    }

    /// Takes a snapshot of all dirty entries, clearing their markers in the
    /// same pass. Calling this again before any new mutation yields nothing.
    pub fn take_changed(&mut self) -> Vec<ChangedEntry, N> {
        let mut out = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                let _ = out.push(ChangedEntry {
                    key: entry.key,
                    value: entry.value.render(),
                });
            }
        }
        out
    }
}

/// The boundary through which inbound commands reach a subsystem.
///
/// Called from the network task while the subsystem's poll task owns the
/// hardware, so implementations are expected to be interior-mutable.
/// `set_status` must fail with [`CommandError::UnknownKey`] instead of
/// creating entries.
pub trait CommandSink {
    fn has_key(&self, key: &str) -> bool;
    fn set_status(&self, key: &str, value: &str) -> Result<(), CommandError>;
}

/// A [`StatusMap`] shared between its producer task and the scheduler.
///
/// The map is mutated by exactly one producer task and drained by exactly
/// one consumer task on the same executor. The blocking mutex holds no
/// suspension point, so a snapshot in [`SharedStatusMap::with`] is atomic
/// with respect to cooperative scheduling.
pub struct SharedStatusMap<const N: usize> {
    inner: Mutex<NoopRawMutex, RefCell<StatusMap<N>>>,
}

impl<const N: usize> SharedStatusMap<N> {
    pub fn new(keys: &[&'static str]) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(StatusMap::new(keys))),
        }
    }

    /// Runs `f` with exclusive access to the map. `f` must not suspend.
    pub fn with<R>(&self, f: impl FnOnce(&mut StatusMap<N>) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn set(&self, key: &str, value: StatusValue) -> Result<(), CommandError> {
        self.with(|map| map.set(key, value))
    }

    pub fn mark_dirty(&self, key: &str) -> bool {
        self.with(|map| map.mark_dirty(key))
    }

    /// Atomic drain: snapshot and dirty-clear happen under one lock.
    pub fn take_changed(&self) -> Vec<ChangedEntry, N> {
        self.with(|map| map.take_changed())
    }
}

impl<const N: usize> CommandSink for SharedStatusMap<N> {
    fn has_key(&self, key: &str) -> bool {
        self.with(|map| map.contains_key(key))
    }

    fn set_status(&self, key: &str, value: &str) -> Result<(), CommandError> {
        self.with(|map| map.set_from_str(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_map() -> StatusMap<8> {
        StatusMap::new(&["target_temp_room", "heating_mode", "alive", "rssi"])
    }

    #[test]
    fn set_marks_entry_dirty_and_drain_clears_it() {
        let mut map = device_map();
        map.set("rssi", StatusValue::Int(-67)).unwrap();

        let changed = map.take_changed();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key, "rssi");
        assert_eq!(changed[0].value.as_str(), "-67");
    }

    #[test]
    fn drain_is_idempotent_until_next_mutation() {
        let mut map = device_map();
        map.set("heating_mode", StatusValue::text("eco").unwrap())
            .unwrap();

        assert_eq!(map.take_changed().len(), 1);
        assert!(map.take_changed().is_empty());

        map.mark_dirty("heating_mode");
        assert_eq!(map.take_changed().len(), 1);
    }

    #[test]
    fn unknown_key_is_rejected_without_mutation() {
        let mut map = device_map();
        assert_eq!(
            map.set_from_str("boost_mode", "1"),
            Err(CommandError::UnknownKey)
        );
        assert!(map.take_changed().is_empty());
    }

    #[test]
    fn command_payloads_parse_to_int_or_text() {
        let mut map = device_map();
        map.set_from_str("target_temp_room", "21").unwrap();
        assert_eq!(map.get("target_temp_room"), Some(&StatusValue::Int(21)));

        map.set_from_str("heating_mode", "boost").unwrap();
        let changed = map.take_changed();
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn oversized_payload_is_an_invalid_value() {
        let mut map = device_map();
        let raw = [b'x'; VALUE_LEN + 1];
        let long = core::str::from_utf8(&raw).unwrap();
        assert_eq!(
            map.set_from_str("heating_mode", long),
            Err(CommandError::InvalidValue)
        );
    }

    #[test]
    fn shared_map_routes_commands_through_the_sink() {
        let shared: SharedStatusMap<8> = SharedStatusMap::new(&["heating_mode"]);
        assert!(shared.has_key("heating_mode"));
        assert!(!shared.has_key("nonsense"));

        shared.set_status("heating_mode", "eco").unwrap();
        let changed = shared.take_changed();
        assert_eq!(changed[0].value.as_str(), "eco");
    }
}
