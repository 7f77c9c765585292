use super::{ProcessEntry, ProcessId};
use crate::error::ProfilerError;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How a mutation changed registry occupancy.
///
/// The sampler lifecycle is driven only by these transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// Size went from 0 to 1.
    Occupied,
    /// Size went from 1 to 0.
    Vacated,
    Unchanged,
}

/// The set of monitored processes, kept in registration order.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<Vec<ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProcessEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, pid: ProcessId) -> Result<Occupancy, ProfilerError> {
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.pid == pid) {
            return Err(ProfilerError::AlreadyRegistered(pid));
        }
        entries.push(ProcessEntry { pid });
        Ok(if entries.len() == 1 {
            Occupancy::Occupied
        } else {
            Occupancy::Unchanged
        })
    }

    pub fn remove(&self, pid: ProcessId) -> Result<Occupancy, ProfilerError> {
        Self::take(&mut self.lock(), pid).ok_or(ProfilerError::NotRegistered(pid))
    }

    /// Drops `pid` after the sensor lost track of it. Absent pids are ignored.
    ///
    /// `on_vacated` runs inside the critical section when this removed the
    /// last entry, so no insert can slip in between.
    pub fn lazy_evict(&self, pid: ProcessId, on_vacated: impl FnOnce()) -> Occupancy {
        let mut entries = self.lock();
        let occupancy = Self::take(&mut entries, pid).unwrap_or(Occupancy::Unchanged);
        if occupancy == Occupancy::Vacated {
            on_vacated();
        }
        occupancy
    }

    fn take(entries: &mut Vec<ProcessEntry>, pid: ProcessId) -> Option<Occupancy> {
        let pos = entries.iter().position(|entry| entry.pid == pid)?;
        entries.remove(pos);
        Some(if entries.is_empty() {
            Occupancy::Vacated
        } else {
            Occupancy::Unchanged
        })
    }

    pub fn snapshot(&self) -> Vec<ProcessId> {
        self.lock().iter().map(|entry| entry.pid).collect()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.lock().iter().any(|entry| entry.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every entry, returning what was registered.
    pub fn clear(&self) -> Vec<ProcessId> {
        self.lock().drain(..).map(|entry| entry.pid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn transitions_on_first_insert_and_last_remove() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.insert(ProcessId(1)).unwrap(), Occupancy::Occupied);
        assert_eq!(registry.insert(ProcessId(2)).unwrap(), Occupancy::Unchanged);
        assert_eq!(registry.remove(ProcessId(1)).unwrap(), Occupancy::Unchanged);
        assert_eq!(registry.remove(ProcessId(2)).unwrap(), Occupancy::Vacated);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_insert_leaves_registry_unchanged() {
        let registry = ProcessRegistry::new();
        registry.insert(ProcessId(7)).unwrap();
        assert!(matches!(
            registry.insert(ProcessId(7)),
            Err(ProfilerError::AlreadyRegistered(ProcessId(7)))
        ));
        assert_eq!(registry.snapshot(), vec![ProcessId(7)]);
    }

    #[test]
    fn remove_of_absent_pid_fails() {
        let registry = ProcessRegistry::new();
        assert!(matches!(
            registry.remove(ProcessId(3)),
            Err(ProfilerError::NotRegistered(ProcessId(3)))
        ));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn lazy_evict_is_silent() {
        let registry = ProcessRegistry::new();
        let mut vacated = 0;
        assert_eq!(registry.lazy_evict(ProcessId(9), || vacated += 1), Occupancy::Unchanged);
        registry.insert(ProcessId(9)).unwrap();
        registry.insert(ProcessId(10)).unwrap();
        assert_eq!(registry.lazy_evict(ProcessId(9), || vacated += 1), Occupancy::Unchanged);
        assert_eq!(registry.lazy_evict(ProcessId(10), || vacated += 1), Occupancy::Vacated);
        assert_eq!(vacated, 1);
        assert!(!registry.contains(ProcessId(9)));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let registry = ProcessRegistry::new();
        for pid in [30, 10, 20] {
            registry.insert(ProcessId(pid)).unwrap();
        }
        registry.remove(ProcessId(10)).unwrap();
        assert_eq!(registry.snapshot(), vec![ProcessId(30), ProcessId(20)]);
        assert_eq!(registry.clear(), vec![ProcessId(30), ProcessId(20)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_mutation_keeps_count_consistent() {
        let registry = Arc::new(ProcessRegistry::new());
        let workers: Vec<_> = (0..8u32)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut occupied = 0;
                    let mut vacated = 0;
                    for i in 0..200u32 {
                        let pid = ProcessId(t * 1000 + i);
                        if registry.insert(pid).unwrap() == Occupancy::Occupied {
                            occupied += 1;
                        }
                        if i % 2 == 0 && registry.remove(pid).unwrap() == Occupancy::Vacated {
                            vacated += 1;
                        }
                    }
                    (occupied, vacated)
                })
            })
            .collect();

        let (occupied, vacated) = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .fold((0, 0), |(o, v), (wo, wv)| (o + wo, v + wv));

        assert_eq!(registry.len(), 8 * 100);
        // the registry ends non-empty, so every vacate was followed by an occupy
        assert_eq!(occupied, vacated + 1);
    }
}
