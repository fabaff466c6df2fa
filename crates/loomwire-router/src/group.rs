//! Keyed groups of recipients and broadcast routing.
//!
//! A [`GroupRouter`] is a named table of members behind a mutex. A
//! broadcast copies the matching members out under the lock and delivers
//! after releasing it, so members may join or leave from inside a
//! delivery without deadlocking.
//!
//! [`MessageRouter`] layers scopes on top: a router that knows about
//! neighbouring groups (the rooms of a building, the buildings of a town)
//! overrides [`MessageRouter::related_groups`] and gets `Extended` and
//! `ExtendedOnly` delivery for free.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use loomwire_protocol::{Frame, Outbound, ProtocolError};

use crate::{Recipient, RouterError, Scope};

/// A named, keyed set of recipients.
pub struct GroupRouter<K, R: ?Sized = dyn Recipient> {
    name: String,
    members: Mutex<HashMap<K, Arc<R>>>,
}

impl<K, R: ?Sized> Debug for GroupRouter<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRouter")
            .field("name", &self.name)
            .field("members", &self.table().len())
            .finish()
    }
}

impl<K, R: ?Sized> GroupRouter<K, R> {
    fn table(&self) -> MutexGuard<'_, HashMap<K, Arc<R>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, R> GroupRouter<K, R>
where
    K: Eq + Hash + Clone + Debug,
    R: Recipient + ?Sized,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a member.
    ///
    /// # Errors
    /// [`RouterError::AlreadyPresent`] if `key` is taken; the existing
    /// member stays.
    pub fn add(&self, key: K, member: Arc<R>) -> Result<(), RouterError> {
        let mut table = self.table();
        if table.contains_key(&key) {
            return Err(self.already_present(&key));
        }
        tracing::debug!(group = %self.name, ?key, "member added");
        table.insert(key, member);
        Ok(())
    }

    /// Removes a member and returns it.
    ///
    /// # Errors
    /// [`RouterError::NotPresent`] if `key` is not a member.
    pub fn remove(&self, key: &K) -> Result<Arc<R>, RouterError> {
        let removed = self.table().remove(key);
        match removed {
            Some(member) => {
                tracing::debug!(group = %self.name, ?key, "member removed");
                Ok(member)
            }
            None => Err(self.not_present(key)),
        }
    }

    /// Empties the group. Returns how many members were removed.
    pub fn remove_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.table());
        drained.len()
    }

    pub fn get(&self, key: &K) -> Option<Arc<R>> {
        self.table().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.table().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.table().keys().cloned().collect()
    }

    /// Copies the current membership.
    pub fn snapshot(&self) -> Vec<(K, Arc<R>)> {
        self.table()
            .iter()
            .map(|(k, m)| (k.clone(), Arc::clone(m)))
            .collect()
    }

    /// Delivers `frame` to every member except `except`. Returns how many
    /// members accepted it.
    pub fn send_local(&self, frame: &Frame, except: Option<&K>) -> usize {
        let targets: Vec<Arc<R>> = self
            .table()
            .iter()
            .filter(|(k, _)| except != Some(*k))
            .map(|(_, m)| Arc::clone(m))
            .collect();

        let delivered = targets.iter().filter(|m| m.deliver(frame)).count();
        tracing::trace!(group = %self.name, id = %frame.id(), delivered, "group broadcast");
        delivered
    }

    /// Moves the member `key` from this group into `to`.
    ///
    /// Both tables are locked for the move, always in the same order, so
    /// the member is never missing from both or present in both.
    ///
    /// # Errors
    /// `NotPresent` if `key` is not here, `AlreadyPresent` if `to` already
    /// has it. Either way both groups are left as they were.
    pub fn transfer(&self, key: &K, to: &GroupRouter<K, R>) -> Result<(), RouterError> {
        if std::ptr::eq(self, to) {
            return if self.contains(key) {
                Err(to.already_present(key))
            } else {
                Err(self.not_present(key))
            };
        }

        let (mut from_table, mut to_table) = if (self as *const Self) < (to as *const Self) {
            let from_table = self.table();
            (from_table, to.table())
        } else {
            let to_table = to.table();
            (self.table(), to_table)
        };

        if !from_table.contains_key(key) {
            return Err(self.not_present(key));
        }
        if to_table.contains_key(key) {
            return Err(to.already_present(key));
        }
        if let Some(member) = from_table.remove(key) {
            to_table.insert(key.clone(), member);
        }
        tracing::debug!(from = %self.name, to = %to.name, ?key, "member transferred");
        Ok(())
    }

    fn already_present(&self, key: &K) -> RouterError {
        RouterError::AlreadyPresent {
            group: self.name.clone(),
            key: format!("{key:?}"),
        }
    }

    fn not_present(&self, key: &K) -> RouterError {
        RouterError::NotPresent {
            group: self.name.clone(),
            key: format!("{key:?}"),
        }
    }
}

/// Scoped broadcast over a group and its related groups.
pub trait MessageRouter<K>
where
    K: Eq + Hash + Clone + Debug,
{
    type Member: Recipient + ?Sized;

    /// The router's own group.
    fn group(&self) -> &GroupRouter<K, Self::Member>;

    /// Groups reached by the extended scopes. None by default.
    fn related_groups(&self) -> Vec<Arc<GroupRouter<K, Self::Member>>> {
        Vec::new()
    }

    /// Encodes `msg` once and delivers it per `scope`, skipping `except`
    /// in every group. Returns the number of deliveries.
    fn send<M: Outbound + ?Sized>(
        &self,
        msg: &M,
        except: Option<&K>,
        scope: Scope,
    ) -> Result<usize, ProtocolError> {
        let frame = Frame::encode(msg)?;
        Ok(self.send_frame(&frame, except, scope))
    }

    /// Like [`send`](Self::send) for an already encoded frame.
    fn send_frame(&self, frame: &Frame, except: Option<&K>, scope: Scope) -> usize {
        let mut delivered = 0;
        if scope.includes_local() {
            delivered += self.group().send_local(frame, except);
        }
        if scope.includes_related() {
            for group in self.related_groups() {
                delivered += group.send_local(frame, except);
            }
        }
        delivered
    }
}

impl<K, R> MessageRouter<K> for GroupRouter<K, R>
where
    K: Eq + Hash + Clone + Debug,
    R: Recipient + ?Sized,
{
    type Member = R;

    fn group(&self) -> &GroupRouter<K, R> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Recipient for Counter {
        fn deliver(&self, _frame: &Frame) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn ping() -> Frame {
        Frame::encode(&loomwire_protocol::SystemMessage::Ping { seq: 1 }).unwrap()
    }

    #[test]
    fn test_add_duplicate_keeps_first() {
        let g: GroupRouter<u32, Counter> = GroupRouter::new("hall");
        let first = Arc::new(Counter::default());
        g.add(1, first.clone()).unwrap();
        let err = g.add(1, Arc::new(Counter::default())).unwrap_err();
        assert!(matches!(err, RouterError::AlreadyPresent { .. }));
        assert_eq!(g.len(), 1);
        assert!(Arc::ptr_eq(&g.get(&1).unwrap(), &first));
    }

    #[test]
    fn test_remove_absent_fails() {
        let g: GroupRouter<u32, Counter> = GroupRouter::new("hall");
        assert!(matches!(g.remove(&9), Err(RouterError::NotPresent { .. })));
    }

    #[test]
    fn test_send_local_skips_except() {
        let g: GroupRouter<u32, Counter> = GroupRouter::new("hall");
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        g.add(1, a.clone()).unwrap();
        g.add(2, b.clone()).unwrap();

        assert_eq!(g.send_local(&ping(), Some(&1)), 1);
        assert_eq!(a.0.load(Ordering::SeqCst), 0);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transfer_conflict_restores_source() {
        let from: GroupRouter<u32, Counter> = GroupRouter::new("from");
        let to: GroupRouter<u32, Counter> = GroupRouter::new("to");
        from.add(1, Arc::new(Counter::default())).unwrap();
        to.add(1, Arc::new(Counter::default())).unwrap();

        let mine = from.get(&1).unwrap();
        let theirs = to.get(&1).unwrap();

        assert!(matches!(
            from.transfer(&1, &to),
            Err(RouterError::AlreadyPresent { .. })
        ));
        assert!(Arc::ptr_eq(&from.get(&1).unwrap(), &mine));
        assert!(Arc::ptr_eq(&to.get(&1).unwrap(), &theirs));
        assert_eq!(to.len(), 1);
    }

    #[test]
    fn test_transfer_into_same_group_fails() {
        let g: GroupRouter<u32, Counter> = GroupRouter::new("loop");
        g.add(1, Arc::new(Counter::default())).unwrap();

        assert!(matches!(g.transfer(&1, &g), Err(RouterError::AlreadyPresent { .. })));
        assert!(matches!(g.transfer(&2, &g), Err(RouterError::NotPresent { .. })));
        assert_eq!(g.len(), 1);
    }
}
