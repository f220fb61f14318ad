use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::manager::ManagerLink;

/// Tracks which [`ManagerLink`] is current and lets other subsystems (the
/// relay server, proxy ports) react when it goes away, without a global
/// singleton: one `Broadcaster` is built at startup and handed by `Arc` to
/// every constructor that needs it. No generic event-name/arbitrary-handler
/// machinery — this crate only ever has one thing worth broadcasting.
pub struct Broadcaster {
    manager: RwLock<Option<Arc<ManagerLink>>>,
    close_tx: broadcast::Sender<Arc<ManagerLink>>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        let (close_tx, _) = broadcast::channel(32);
        Arc::new(Broadcaster {
            manager: RwLock::new(None),
            close_tx,
        })
    }

    pub fn current_manager(&self) -> Option<Arc<ManagerLink>> {
        self.manager.read().unwrap().clone()
    }

    /// Install `link` as the current manager, returning whoever was current
    /// before (the caller is responsible for kicking them out).
    pub fn set_manager(&self, link: Arc<ManagerLink>) -> Option<Arc<ManagerLink>> {
        self.manager.write().unwrap().replace(link)
    }

    /// Clear the current manager, but only if it's still `link` — a link
    /// that's already been superseded shouldn't clear the new one out from
    /// under it.
    pub fn clear_manager_if(&self, link: &Arc<ManagerLink>) -> bool {
        let mut guard = self.manager.write().unwrap();
        if guard.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, link)) {
            *guard = None;
            true
        } else {
            false
        }
    }

    /// Announce that `link` just stopped being (or never finished becoming)
    /// the current manager. Relay links and proxy links subscribed via
    /// [`Broadcaster::subscribe_close`] drop everything tied to that epoch.
    pub fn fire_manager_close(&self, link: Arc<ManagerLink>) {
        let _ = self.close_tx.send(link);
    }

    pub fn subscribe_close(&self) -> broadcast::Receiver<Arc<ManagerLink>> {
        self.close_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::test_support::dummy_manager_link;

    #[test]
    fn set_manager_returns_the_previous_one() {
        let b = Broadcaster::new();
        let first = dummy_manager_link(1);
        let second = dummy_manager_link(2);
        assert!(b.set_manager(first.clone()).is_none());
        let previous = b.set_manager(second.clone());
        assert!(previous.is_some());
        assert!(Arc::ptr_eq(&previous.unwrap(), &first));
        assert!(Arc::ptr_eq(&b.current_manager().unwrap(), &second));
    }

    #[test]
    fn clear_manager_if_ignores_a_superseded_link() {
        let b = Broadcaster::new();
        let first = dummy_manager_link(1);
        let second = dummy_manager_link(2);
        b.set_manager(first.clone());
        b.set_manager(second.clone());
        assert!(!b.clear_manager_if(&first));
        assert!(b.current_manager().is_some());
        assert!(b.clear_manager_if(&second));
        assert!(b.current_manager().is_none());
    }
}
