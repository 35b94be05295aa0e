//! The retained run of snapshots and deltas served to RTR clients.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::rtr::serial::Serial;

use super::delta::Delta;
use super::snapshot::VrpSet;


//------------ DeltaEntry --------------------------------------------------------

/// One retained delta, tagged with the serial number it brings the cache
/// to (i.e. the delta from `serial - 1` to `serial`).
#[derive(Clone, Debug)]
struct DeltaEntry {
    serial: Serial,
    delta: Arc<Delta>,
}


//------------ History -----------------------------------------------------------

/// The live, current VRP set plus a bounded-length run of deltas leading
/// up to it.
///
/// In the style of `PayloadHistory`: `current` is the full snapshot,
/// `deltas` holds the last `keep` update steps newest-first, evicting the
/// oldest on overflow. `session_id` is fixed for the process lifetime
/// a restart always gets a new one, forcing every client
/// to Cache Reset.
pub struct History {
    session_id: u16,
    serial: Serial,
    current: Arc<VrpSet>,
    deltas: VecDeque<DeltaEntry>,
    keep: usize,
    /// `buildtime` of the upstream document the current snapshot was
    /// installed from, copied through to the JSON export endpoint.
    buildtime: Option<String>,
}

impl History {
    pub fn new(session_id: u16, keep: usize) -> Self {
        History {
            session_id,
            serial: Serial(0),
            current: Arc::new(VrpSet::new()),
            deltas: VecDeque::new(),
            keep,
            buildtime: None,
        }
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn current(&self) -> Arc<VrpSet> {
        self.current.clone()
    }

    pub fn buildtime(&self) -> Option<&str> {
        self.buildtime.as_deref()
    }

    /// Installs a new complete VRP set, computing and retaining the delta
    /// from the previous one.
    ///
    /// `buildtime` is the upstream document's own `buildtime` and is
    /// recorded unconditionally, even when the VRP content is unchanged,
    /// since the upstream document can be rebuilt without its content
    /// changing.
    ///
    /// Returns `true` if the new set differs from the current one (a
    /// Serial Notify should be sent), `false` if it's unchanged.
    pub fn update(&mut self, new: VrpSet, buildtime: String) -> bool {
        self.buildtime = Some(buildtime);
        let delta = Delta::construct(&self.current, &new);
        if delta.is_empty() {
            return false;
        }
        self.serial = self.serial.add(1);
        self.deltas.push_front(DeltaEntry {
            serial: self.serial,
            delta: Arc::new(delta),
        });
        if self.deltas.len() > self.keep {
            self.deltas.pop_back();
        }
        self.current = Arc::new(new);
        true
    }

    /// The outcome of a Serial Query against this history: either a
    /// single compacted delta bringing the client from its serial to the
    /// current one, or a signal that a Cache Reset is required.
    pub fn diff_since(&self, client_serial: Serial) -> DiffResult {
        if client_serial == self.serial {
            return DiffResult::UpToDate;
        }
        let mut acc: Option<Delta> = None;
        let mut found_start = false;
        for entry in self.deltas.iter().rev() { // oldest retained first
            if entry.serial == client_serial.add(1) || found_start {
                found_start = true;
                acc = Some(match acc {
                    None => (*entry.delta).clone(),
                    Some(prev) => prev.merge(&entry.delta),
                });
            }
        }
        if found_start {
            DiffResult::Delta(acc.unwrap_or_default())
        } else {
            DiffResult::ResetRequired
        }
    }
}

/// Outcome of [`History::diff_since`].
pub enum DiffResult {
    /// The client is already current; nothing to send.
    UpToDate,
    /// The client can be brought up to date with this delta.
    Delta(Delta),
    /// The client's serial falls outside the retained window, or refers
    /// to a different session; a full Cache Reset is required.
    ResetRequired,
}

pub type SharedHistory = Arc<RwLock<History>>;

pub fn shared(session_id: u16, keep: usize) -> SharedHistory {
    Arc::new(RwLock::new(History::new(session_id, keep)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrp::Prefix;
    use std::str::FromStr;

    fn vrp(prefix: &str, asn: u32, max: u8) -> crate::vrp::Vrp {
        crate::vrp::Vrp::new(Prefix::from_str(prefix).unwrap(), asn, max).unwrap()
    }

    #[test]
    fn update_bumps_serial_only_on_change() {
        let mut history = History::new(1, 3);
        assert_eq!(history.serial(), Serial(0));
        let set: VrpSet = vec![vrp("10.0.0.0/24", 1, 24)].into_iter().collect();
        assert!(history.update(set.clone(), "2024-01-01T00:00:00Z".to_string()));
        assert_eq!(history.serial(), Serial(1));
        assert!(!history.update(set, "2024-01-01T01:00:00Z".to_string()));
        assert_eq!(history.serial(), Serial(1));
    }

    #[test]
    fn update_records_buildtime_even_when_vrp_content_is_unchanged() {
        let mut history = History::new(1, 3);
        let set: VrpSet = vec![vrp("10.0.0.0/24", 1, 24)].into_iter().collect();
        history.update(set.clone(), "2024-01-01T00:00:00Z".to_string());
        history.update(set, "2024-01-01T01:00:00Z".to_string());
        assert_eq!(history.buildtime(), Some("2024-01-01T01:00:00Z"));
    }

    #[test]
    fn diff_since_current_serial_is_up_to_date() {
        let mut history = History::new(1, 3);
        let set: VrpSet = vec![vrp("10.0.0.0/24", 1, 24)].into_iter().collect();
        history.update(set, "2024-01-01T00:00:00Z".to_string());
        match history.diff_since(history.serial()) {
            DiffResult::UpToDate => (),
            _ => panic!("expected UpToDate"),
        }
    }

    #[test]
    fn diff_since_one_behind_returns_single_delta() {
        let mut history = History::new(1, 3);
        let set1: VrpSet = vec![vrp("10.0.0.0/24", 1, 24)].into_iter().collect();
        history.update(set1, "2024-01-01T00:00:00Z".to_string());
        let client_serial = history.serial();
        let set2: VrpSet = vec![
            vrp("10.0.0.0/24", 1, 24), vrp("10.1.0.0/24", 1, 24),
        ].into_iter().collect();
        history.update(set2, "2024-01-01T01:00:00Z".to_string());
        match history.diff_since(client_serial) {
            DiffResult::Delta(delta) => assert_eq!(delta.len(), 1),
            _ => panic!("expected a delta"),
        }
    }

    #[test]
    fn diff_since_out_of_window_requires_reset() {
        let mut history = History::new(1, 2);
        for i in 0..5u32 {
            let set: VrpSet = vec![vrp(&format!("10.{}.0.0/24", i), 1, 24)]
                .into_iter().collect();
            history.update(set, "2024-01-01T00:00:00Z".to_string());
        }
        match history.diff_since(Serial(0)) {
            DiffResult::ResetRequired => (),
            _ => panic!("expected ResetRequired"),
        }
    }
}
