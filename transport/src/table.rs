//! A generational arena of connections with lookups by identity, address and relay.
//!
//! Slots are reused once freed, but every reuse bumps the slot's generation, so a stale
//! [ConnectionId] never resolves to the connection that replaced it.

use crate::{crypto::PublicKey, Error};
use std::{collections::HashMap, fmt, net::SocketAddr};

/// Handle to a connection held by an [crate::Endpoint].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Handle to a relayed path to a peer, assigned by the relay layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RelayId(pub u32);

struct Entry<T> {
    value: T,
    identity: PublicKey,
    ipv4: Option<SocketAddr>,
    ipv6: Option<SocketAddr>,
    relay: Option<RelayId>,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Connections and the indexes used to route inbound packets to them.
pub struct Table<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,

    identities: HashMap<PublicKey, ConnectionId>,
    addrs: HashMap<SocketAddr, ConnectionId>,
    relays: HashMap<RelayId, ConnectionId>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            identities: HashMap::new(),
            addrs: HashMap::new(),
            relays: HashMap::new(),
        }
    }
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a connection to the peer `identity`.
    ///
    /// There is at most one connection per identity.
    pub fn insert(&mut self, identity: PublicKey, value: T) -> Result<ConnectionId, Error> {
        self.insert_with(identity, |_| Ok(value))
    }

    /// Add a connection built from the identifier it will be stored under.
    ///
    /// Nothing is stored if `build` fails.
    pub fn insert_with(
        &mut self,
        identity: PublicKey,
        build: impl FnOnce(ConnectionId) -> Result<T, Error>,
    ) -> Result<ConnectionId, Error> {
        if self.identities.contains_key(&identity) {
            return Err(Error::AlreadyConnected);
        }
        let id = match self.free.last() {
            Some(&index) => ConnectionId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => ConnectionId {
                index: u32::try_from(self.slots.len()).map_err(|_| Error::TooManyConnections)?,
                generation: 0,
            },
        };
        let entry = Entry {
            value: build(id)?,
            identity,
            ipv4: None,
            ipv6: None,
            relay: None,
        };
        if (id.index as usize) < self.slots.len() {
            self.free.pop();
            self.slots[id.index as usize].entry = Some(entry);
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
        }
        self.identities.insert(identity, id);
        self.len += 1;
        Ok(id)
    }

    fn entry(&self, id: ConnectionId) -> Option<&Entry<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: ConnectionId) -> Option<&mut Entry<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// The connection behind `id`, unless it was removed.
    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.entry(id).map(|entry| &entry.value)
    }

    /// Remove a connection and every index pointing at it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        self.identities.remove(&entry.identity);
        for addr in [entry.ipv4, entry.ipv6].into_iter().flatten() {
            self.addrs.remove(&addr);
        }
        if let Some(relay) = entry.relay {
            self.relays.remove(&relay);
        }
        Some(entry.value)
    }

    /// The connection to the peer `identity`.
    pub fn by_identity(&self, identity: &PublicKey) -> Option<ConnectionId> {
        self.identities.get(identity).copied()
    }

    /// The connection whose peer sends from `addr`.
    pub fn by_addr(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.addrs.get(addr).copied()
    }

    /// The connection reached through `relay`.
    pub fn by_relay(&self, relay: RelayId) -> Option<ConnectionId> {
        self.relays.get(&relay).copied()
    }

    /// Route packets from `addr` to `id`.
    ///
    /// Replaces the previous address of the same family. An address claimed by another
    /// connection is moved to this one.
    pub fn set_addr(&mut self, id: ConnectionId, addr: SocketAddr) -> Result<(), Error> {
        if self.entry(id).is_none() {
            return Err(Error::UnknownConnection);
        }
        if let Some(other) = self.addrs.insert(addr, id) {
            if other != id {
                if let Some(entry) = self.entry_mut(other) {
                    for slot in [&mut entry.ipv4, &mut entry.ipv6] {
                        if *slot == Some(addr) {
                            *slot = None;
                        }
                    }
                }
            }
        }
        let entry = self.entry_mut(id).ok_or(Error::UnknownConnection)?;
        let slot = if addr.is_ipv4() {
            &mut entry.ipv4
        } else {
            &mut entry.ipv6
        };
        let previous = slot.replace(addr);
        if let Some(previous) = previous {
            if previous != addr {
                self.addrs.remove(&previous);
            }
        }
        Ok(())
    }

    /// Route packets from `relay` to `id`, replacing its previous relay.
    pub fn set_relay(&mut self, id: ConnectionId, relay: RelayId) -> Result<(), Error> {
        if self.entry(id).is_none() {
            return Err(Error::UnknownConnection);
        }
        if let Some(other) = self.relays.insert(relay, id) {
            if other != id {
                if let Some(entry) = self.entry_mut(other) {
                    entry.relay = None;
                }
            }
        }
        let entry = self.entry_mut(id).ok_or(Error::UnknownConnection)?;
        if let Some(previous) = entry.relay.replace(relay) {
            if previous != relay {
                self.relays.remove(&previous);
            }
        }
        Ok(())
    }

    /// Identifiers of every connection held.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| ConnectionId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn key(seed: u64) -> PublicKey {
        *KeyPair::from_seed(seed).public()
    }

    #[test]
    fn test_insert_remove() {
        let mut table = Table::new();
        let a = table.insert(key(0), "a").unwrap();
        let b = table.insert(key(1), "b").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.by_identity(&key(1)), Some(b));
        assert!(matches!(
            table.insert(key(0), "again"),
            Err(Error::AlreadyConnected)
        ));

        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.get(a), None);
        assert_eq!(table.by_identity(&key(0)), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.ids(), vec![b]);
    }

    #[test]
    fn test_stale_id() {
        let mut table = Table::new();
        let a = table.insert(key(0), "a").unwrap();
        table.remove(a).unwrap();

        // The slot is reused under a new generation
        let c = table.insert(key(2), "c").unwrap();
        assert_ne!(a, c);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(c), Some(&"c"));
        assert!(matches!(
            table.set_addr(a, "127.0.0.1:1".parse().unwrap()),
            Err(Error::UnknownConnection)
        ));
    }

    #[test]
    fn test_insert_with_failure() {
        let mut table: Table<&str> = Table::new();
        let a = table.insert(key(0), "a").unwrap();
        table.remove(a).unwrap();

        // A failed build leaves the free slot for the next insert
        assert!(matches!(
            table.insert_with(key(1), |_| Err(Error::PeerRejected)),
            Err(Error::PeerRejected)
        ));
        assert!(table.is_empty());
        let b = table.insert(key(1), "b").unwrap();
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn test_addrs() {
        let mut table = Table::new();
        let a = table.insert(key(0), "a").unwrap();
        let b = table.insert(key(1), "b").unwrap();
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v4_new: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();

        table.set_addr(a, v4).unwrap();
        table.set_addr(a, v6).unwrap();
        assert_eq!(table.by_addr(&v4), Some(a));
        assert_eq!(table.by_addr(&v6), Some(a));

        // Same family replaces
        table.set_addr(a, v4_new).unwrap();
        assert_eq!(table.by_addr(&v4), None);
        assert_eq!(table.by_addr(&v4_new), Some(a));
        assert_eq!(table.by_addr(&v6), Some(a));

        // Claimed by another connection
        table.set_addr(b, v6).unwrap();
        assert_eq!(table.by_addr(&v6), Some(b));

        // Removing a does not unindex what b took over
        table.remove(a).unwrap();
        assert_eq!(table.by_addr(&v4_new), None);
        assert_eq!(table.by_addr(&v6), Some(b));
    }

    #[test]
    fn test_relays() {
        let mut table = Table::new();
        let a = table.insert(key(0), "a").unwrap();
        let b = table.insert(key(1), "b").unwrap();

        table.set_relay(a, RelayId(7)).unwrap();
        assert_eq!(table.by_relay(RelayId(7)), Some(a));
        table.set_relay(a, RelayId(8)).unwrap();
        assert_eq!(table.by_relay(RelayId(7)), None);

        table.set_relay(b, RelayId(8)).unwrap();
        assert_eq!(table.by_relay(RelayId(8)), Some(b));
        table.remove(a).unwrap();
        assert_eq!(table.by_relay(RelayId(8)), Some(b));
        table.remove(b).unwrap();
        assert_eq!(table.by_relay(RelayId(8)), None);
    }
}
