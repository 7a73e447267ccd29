//! One-way state hand-off between a simulation thread and the thread that
//! owns GPU objects.
//!
//! [`pair`] splits a state value into a [`SimHandle`], which any thread
//! may edit and publish, and a [`CoreState`], which lives next to the
//! native resource and applies whatever the last published snapshot was.
//! Nothing is shared mutably; snapshots are copied across a channel.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// The simulation-side half. Edits stay local until [`publish`].
///
/// [`publish`]: SimHandle::publish
#[derive(Debug)]
pub struct SimHandle<S> {
    state: S,
    dirty: bool,
    tx: Sender<S>,
}

/// The execution-side half.
#[derive(Debug)]
pub struct CoreState<S> {
    state: S,
    rx: Receiver<S>,
    applied: u64,
}

pub fn pair<S: Clone>(initial: S) -> (SimHandle<S>, CoreState<S>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        SimHandle {
            state: initial.clone(),
            dirty: false,
            tx,
        },
        CoreState {
            state: initial,
            rx,
            applied: 0,
        },
    )
}

impl<S: Clone> SimHandle<S> {
    pub fn get(&self) -> &S {
        &self.state
    }

    /// Edit the local copy and mark it for the next publish.
    pub fn update(&mut self, f: impl FnOnce(&mut S)) {
        f(&mut self.state);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Send a snapshot if anything changed since the last publish.
    ///
    /// Returns `false` if there was nothing to send or the core half is
    /// gone.
    pub fn publish(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        if self.tx.send(self.state.clone()).is_err() {
            tracing::warn!("Core state dropped; snapshot discarded");
            return false;
        }
        true
    }
}

impl<S> CoreState<S> {
    pub fn get(&self) -> &S {
        &self.state
    }

    /// Number of snapshots applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Drain pending snapshots and keep only the newest. Returns whether
    /// the state changed.
    pub fn sync(&mut self) -> bool {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => latest = Some(snapshot),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("Simulation handle dropped");
                    break;
                }
            }
        }
        match latest {
            Some(state) => {
                self.state = state;
                self.applied += 1;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edits_are_invisible_until_published() {
        let (mut sim, mut core) = pair(vec![0u8; 4]);
        sim.update(|s| s[0] = 9);
        assert!(sim.is_dirty());
        assert!(!core.sync());
        assert_eq!(core.get(), &vec![0, 0, 0, 0]);

        assert!(sim.publish());
        assert!(!sim.is_dirty());
        assert!(core.sync());
        assert_eq!(core.get(), &vec![9, 0, 0, 0]);
    }

    #[test]
    fn only_the_latest_snapshot_is_applied() {
        let (mut sim, mut core) = pair(0u32);
        for i in 1..=5 {
            sim.update(|s| *s = i);
            sim.publish();
        }
        assert!(core.sync());
        assert_eq!(*core.get(), 5);
        assert_eq!(core.applied(), 1);
    }

    #[test]
    fn clean_handle_sends_nothing() {
        let (mut sim, mut core) = pair(1u32);
        assert!(!sim.publish());
        assert!(!core.sync());
    }

    #[test]
    fn publish_across_threads() {
        let (mut sim, mut core) = pair(String::new());
        let worker = std::thread::spawn(move || {
            sim.update(|s| s.push_str("frame 1"));
            sim.publish();
        });
        worker.join().unwrap();
        assert!(core.sync());
        assert_eq!(core.get(), "frame 1");
    }

    #[test]
    fn dropped_core_discards_snapshots() {
        let (mut sim, core) = pair(0u8);
        drop(core);
        sim.update(|s| *s = 1);
        assert!(!sim.publish());
    }
}
