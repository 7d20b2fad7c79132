use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
};

use dashmap::{DashMap, mapref::entry::Entry};
use rand::{RngExt, rng};

/// Draws ids until one is not taken.
///
/// Collisions are a correctness concern only, so any PRNG will do as `draw`.
pub fn allocate_session_id(mut draw: impl FnMut() -> u32, taken: impl Fn(u32) -> bool) -> u32 {
    loop {
        let id = draw();
        if !taken(id) {
            return id;
        }
    }
}

/// Session id -> per-session transport handle, owned by one tunnel instance.
///
/// Every operation is atomic with respect to the others and hands back clones, so no map
/// guard is ever held across socket I/O.
#[derive(Debug)]
pub struct SessionRegistry<T> {
    sessions: DashMap<u32, T>,
}

impl<T: Clone> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers `value` under a fresh random id that no live session uses.
    pub fn insert_new(&self, value: T) -> u32 {
        let mut rng = rng();
        loop {
            let id = allocate_session_id(|| rng.random(), |id| self.sessions.contains_key(&id));
            // Another task may have claimed the id between the check and the entry lock.
            if let Entry::Vacant(v) = self.sessions.entry(id) {
                v.insert(value);
                return id;
            }
        }
    }

    /// Registers `value` under an id chosen by the peer, replacing any previous holder.
    pub fn insert(&self, id: u32, value: T) -> Option<T> {
        self.sessions.insert(id, value)
    }

    pub fn get(&self, id: u32) -> Option<T> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn remove(&self, id: u32) -> Option<T> {
        self.sessions.remove(&id).map(|(_, v)| v)
    }

    /// Removes the entry only if `pred` holds for the current value.
    pub fn remove_if(&self, id: u32, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        self.sessions.remove_if(&id, |_, v| pred(v)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Empties the registry, returning what was in it.
    pub fn drain(&self) -> Vec<(u32, T)> {
        let ids: Vec<u32> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }
}

impl<T: Clone> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct AddrSessionsInner {
    by_addr: HashMap<SocketAddr, u32>,
    by_id: HashMap<u32, SocketAddr>,
}

/// Bidirectional external address <-> session id table of the UDP server.
///
/// Entries are never removed: server side UDP sessions live as long as the process.
#[derive(Debug, Default)]
pub struct AddrSessions {
    inner: Mutex<AddrSessionsInner>,
}

impl AddrSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AddrSessionsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the session id of `addr`, allocating one on first sight.
    /// The flag is `true` when the session was created by this call.
    pub fn id_for(&self, addr: SocketAddr) -> (u32, bool) {
        let mut st = self.lock();
        if let Some(id) = st.by_addr.get(&addr) {
            return (*id, false);
        }

        let mut rng = rng();
        let id = allocate_session_id(|| rng.random(), |id| st.by_id.contains_key(&id));
        st.by_id.insert(id, addr);
        st.by_addr.insert(addr, id);
        (id, true)
    }

    pub fn addr_of(&self, id: u32) -> Option<SocketAddr> {
        self.lock().by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    #[test]
    fn allocate_skips_taken_ids() {
        let taken: HashSet<u32> = [5, 6].into_iter().collect();
        let mut seq = [5u32, 6, 5, 9].into_iter();
        let mut draws = 0;
        let id = allocate_session_id(
            || {
                draws += 1;
                assert!(draws <= 4, "allocation did not terminate");
                seq.next().unwrap_or(0)
            },
            |id| taken.contains(&id),
        );
        assert_eq!(id, 9);
        assert_eq!(draws, 4);
    }

    #[test]
    fn insert_get_remove() {
        let reg = SessionRegistry::<&'static str>::new();
        let id = reg.insert_new("a");
        assert_eq!(reg.get(id), Some("a"));
        assert!(reg.get(id).is_some());
        assert_eq!(reg.remove(id), Some("a"));
        assert_eq!(reg.remove(id), None);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn remove_if_checks_current_value() {
        let reg = SessionRegistry::new();
        reg.insert(1, 10);
        assert_eq!(reg.remove_if(1, |v| *v == 11), None);
        assert_eq!(reg.remove_if(1, |v| *v == 10), Some(10));
    }

    #[test]
    fn drain_empties() {
        let reg = SessionRegistry::new();
        for i in 0..10 {
            reg.insert(i, i * 2);
        }
        let mut got = reg.drain();
        got.sort();
        assert_eq!(got.len(), 10);
        assert_eq!(got[3], (3, 6));
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_never_share_an_id() {
        let reg = Arc::new(SessionRegistry::<usize>::new());
        let mut tasks = tokio::task::JoinSet::new();
        for t in 0..8 {
            let reg = reg.clone();
            tasks.spawn(async move {
                let mut ids = Vec::new();
                for i in 0..500 {
                    ids.push(reg.insert_new(t * 1000 + i));
                }
                ids
            });
        }

        let mut all = HashSet::new();
        while let Some(ids) = tasks.join_next().await {
            for id in ids.unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 8 * 500);
        assert_eq!(reg.len(), 8 * 500);
    }

    #[test]
    fn addr_sessions_are_stable_and_bidirectional() {
        let s = AddrSessions::new();
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let (ida, created) = s.id_for(a);
        assert!(created);
        let (ida2, created) = s.id_for(a);
        assert!(!created);
        assert_eq!(ida, ida2);

        let (idb, _) = s.id_for(b);
        assert_ne!(ida, idb);
        assert_eq!(s.addr_of(ida), Some(a));
        assert_eq!(s.addr_of(idb), Some(b));
        assert_eq!(s.len(), 2);
    }
}
