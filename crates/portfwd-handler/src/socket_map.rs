//! Two-way socket id / fd table

use crate::HandlerError;
use portfwd_proto::{SocketFd, SocketId};
use std::collections::{BTreeMap, HashMap};

/// Bound forwards indexed by socket id and by local fd
///
/// Both indexes change together, so an fd maps to at most one socket id and
/// a socket id to at most one fd.
#[derive(Debug)]
pub struct SocketIdMap<V> {
    by_id: BTreeMap<SocketId, (SocketFd, V)>,
    by_fd: HashMap<SocketFd, SocketId>,
}

impl<V> Default for SocketIdMap<V> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_fd: HashMap::new(),
        }
    }
}

impl<V> SocketIdMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `socket_id` to `fd`. Never replaces an existing binding.
    pub fn insert(&mut self, socket_id: SocketId, fd: SocketFd, value: V) -> Result<(), HandlerError> {
        if self.by_id.contains_key(&socket_id) {
            return Err(HandlerError::SocketIdInUse(socket_id));
        }
        if self.by_fd.contains_key(&fd) {
            return Err(HandlerError::FdAlreadyBound(fd));
        }
        self.by_id.insert(socket_id, (fd, value));
        self.by_fd.insert(fd, socket_id);
        Ok(())
    }

    pub fn get(&self, socket_id: SocketId) -> Option<&V> {
        self.by_id.get(&socket_id).map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, socket_id: SocketId) -> Option<&mut V> {
        self.by_id.get_mut(&socket_id).map(|(_, value)| value)
    }

    pub fn fd_of(&self, socket_id: SocketId) -> Option<SocketFd> {
        self.by_id.get(&socket_id).map(|(fd, _)| *fd)
    }

    pub fn id_of(&self, fd: SocketFd) -> Option<SocketId> {
        self.by_fd.get(&fd).copied()
    }

    pub fn contains_id(&self, socket_id: SocketId) -> bool {
        self.by_id.contains_key(&socket_id)
    }

    pub fn contains_fd(&self, fd: SocketFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    pub fn remove_by_id(&mut self, socket_id: SocketId) -> Option<(SocketFd, V)> {
        let (fd, value) = self.by_id.remove(&socket_id)?;
        self.by_fd.remove(&fd);
        Some((fd, value))
    }

    pub fn remove_by_fd(&mut self, fd: SocketFd) -> Option<(SocketId, V)> {
        let socket_id = self.by_fd.remove(&fd)?;
        let (_, value) = self.by_id.remove(&socket_id)?;
        Some((socket_id, value))
    }

    /// Bindings in socket id order
    pub fn bindings(&self) -> Vec<(SocketId, SocketFd)> {
        self.by_id.iter().map(|(id, (fd, _))| (*id, *fd)).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketId, SocketFd, &mut V)> {
        self.by_id
            .iter_mut()
            .map(|(id, (fd, value))| (*id, *fd, value))
    }

    /// Remove every binding
    pub fn drain(&mut self) -> Vec<(SocketId, SocketFd, V)> {
        self.by_fd.clear();
        std::mem::take(&mut self.by_id)
            .into_iter()
            .map(|(id, (fd, value))| (id, fd, value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_both_ways() {
        let mut map = SocketIdMap::new();
        map.insert(456, 123, ()).unwrap();

        assert_eq!(map.fd_of(456), Some(123));
        assert_eq!(map.id_of(123), Some(456));
        assert!(map.contains_id(456));
        assert!(map.contains_fd(123));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insert_never_overwrites() {
        let mut map = SocketIdMap::new();
        map.insert(1, 10, "first").unwrap();

        assert!(matches!(
            map.insert(1, 11, "second"),
            Err(HandlerError::SocketIdInUse(1))
        ));
        assert!(matches!(
            map.insert(2, 10, "second"),
            Err(HandlerError::FdAlreadyBound(10))
        ));
        assert_eq!(map.get(1), Some(&"first"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.id_of(11), None);
    }

    #[test]
    fn test_remove_clears_both_sides() {
        let mut map = SocketIdMap::new();
        map.insert(1, 10, ()).unwrap();
        map.insert(2, 20, ()).unwrap();

        assert_eq!(map.remove_by_id(1), Some((10, ())));
        assert!(!map.contains_fd(10));
        assert_eq!(map.remove_by_fd(20), Some((2, ())));
        assert!(!map.contains_id(2));
        assert!(map.is_empty());

        assert_eq!(map.remove_by_id(1), None);
        assert_eq!(map.remove_by_fd(20), None);
    }

    #[test]
    fn test_drain() {
        let mut map = SocketIdMap::new();
        map.insert(2, 20, 'b').unwrap();
        map.insert(1, 10, 'a').unwrap();

        assert_eq!(map.drain(), vec![(1, 10, 'a'), (2, 20, 'b')]);
        assert!(map.is_empty());
        assert!(!map.contains_fd(10));
    }
}
